//! Correlated request/reply over a link pair.
//!
//! Every management call opens its own transient receiver (bound to a fresh
//! reply-to address) and sender, exchanges exactly one message pair, and
//! closes both links again.

use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::transport::{LinkSpec, Receiver, Sender, Session, close_detached};
use crate::types::{Message, Value};

pub const STATUS_CODE: &str = "status-code";
pub const STATUS_DESCRIPTION: &str = "status-description";
pub const STATUS_OK: i32 = 200;

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Send `request` under a fresh message-id and wait for the reply that
/// carries it as correlation-id. The reply is accepted before returning.
pub(crate) async fn exchange(
    sender: &dyn Sender,
    receiver: &mut dyn Receiver,
    mut request: Message,
    cancel: &CancellationToken,
) -> Result<Message, Error> {
    let message_id = new_id();
    request.properties.message_id = Some(message_id.clone());

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        sent = sender.send(request) => sent?,
    }
    let delivery = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        received = receiver.receive() => received?,
    };

    let correlation_id = delivery.message().properties.correlation_id.clone();
    if correlation_id.as_deref() != Some(message_id.as_str()) {
        if let Err(e) = delivery.reject(None).await {
            tracing::warn!("failed to reject uncorrelated reply: {e}");
        }
        return Err(Error::CorrelationMismatch {
            expected: message_id,
            actual: correlation_id,
        });
    }
    Ok(delivery.accept().await?)
}

/// Extract `(status-code, status-description)` from a reply.
pub(crate) fn reply_status(reply: &Message) -> Result<(i32, String), Error> {
    let code = reply
        .application_properties
        .get(STATUS_CODE)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::MalformedResponse("reply has no integer status-code".into()))?;
    let code = i32::try_from(code)
        .map_err(|_| Error::MalformedResponse(format!("status-code {code} out of range")))?;
    let description = reply
        .application_properties
        .get(STATUS_DESCRIPTION)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok((code, description))
}

/// Perform one management request against `target` and return the reply.
///
/// Fails with [`Error::CorrelationMismatch`] if the reply does not answer
/// this request and [`Error::RemoteRejected`] if its status is not 200.
pub async fn call(
    session: &dyn Session,
    target: &str,
    mut request: Message,
    cancel: &CancellationToken,
) -> Result<Message, Error> {
    let reply_to = new_id();
    let mut receiver = session
        .open_receiver(LinkSpec::receiver(target).target(&reply_to))
        .await?;
    let sender = match session
        .open_sender(LinkSpec::sender(target).source(&reply_to))
        .await
    {
        Ok(sender) => sender,
        Err(e) => {
            close_detached("rpc receiver", receiver.close()).await;
            return Err(e.into());
        }
    };

    request.properties.reply_to = Some(reply_to);
    let result = exchange(sender.as_ref(), receiver.as_mut(), request, cancel).await;

    close_detached("rpc sender", sender.close()).await;
    close_detached("rpc receiver", receiver.close()).await;

    let reply = result?;
    let (code, description) = reply_status(&reply)?;
    if code != STATUS_OK {
        return Err(Error::RemoteRejected { code, description });
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{MockBroker, status_reply};
    use crate::transport::{ConnectOptions, Outcome, SecurityConfig, Transport};

    async fn entry_session(broker: &MockBroker) -> Arc<dyn crate::transport::Session> {
        let conn = broker
            .connect(&ConnectOptions::new(
                broker.entry_host(),
                5671,
                SecurityConfig::default(),
            ))
            .await
            .unwrap();
        conn.new_session().await.unwrap()
    }

    fn read_request() -> Message {
        Message::default()
            .application_property("operation", "READ")
            .application_property("type", "com.microsoft:eventhub")
            .application_property("name", "hub")
    }

    #[tokio::test]
    async fn call_succeeds_on_status_200() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management(|req| status_reply(req, 200, "OK"));
        let session = entry_session(&broker).await;

        let reply = call(session.as_ref(), "$management", read_request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply_status(&reply).unwrap(), (200, "OK".to_string()));

        // The reply was accepted and both transient links were closed.
        let settled = broker.settlements();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].outcome, Outcome::Accepted);
        assert_eq!(broker.closed_links().len(), 2);
    }

    #[tokio::test]
    async fn call_sets_reply_to_and_message_id() {
        let broker = MockBroker::new("hub", &["0"]);
        let session = entry_session(&broker).await;
        call(session.as_ref(), "$management", read_request(), &CancellationToken::new())
            .await
            .unwrap();

        let requests = broker.management_requests();
        assert_eq!(requests.len(), 1);
        let props = &requests[0].properties;
        assert!(props.message_id.is_some());
        assert!(props.reply_to.is_some());
        assert_ne!(props.message_id, props.reply_to);
    }

    #[tokio::test]
    async fn call_fails_with_remote_rejected() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management(|req| status_reply(req, 403, "forbidden"));
        let session = entry_session(&broker).await;

        let err = call(session.as_ref(), "$management", read_request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::RemoteRejected { code, description } => {
                assert_eq!(code, 403);
                assert_eq!(description, "forbidden");
            }
            other => panic!("expected RemoteRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_fails_on_correlation_mismatch_even_with_200() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management(|req| {
            let mut reply = status_reply(req, 200, "OK");
            reply.properties.correlation_id = Some("someone-else".into());
            reply
        });
        let session = entry_session(&broker).await;

        let err = call(session.as_ref(), "$management", read_request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::CorrelationMismatch { actual, .. } => {
                assert_eq!(actual.as_deref(), Some("someone-else"));
            }
            other => panic!("expected CorrelationMismatch, got {other:?}"),
        }
        assert_eq!(broker.closed_links().len(), 2);
    }

    #[tokio::test]
    async fn call_fails_without_status_code() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management(|req| {
            let mut reply = Message::default();
            reply.properties.correlation_id = req.properties.message_id.clone();
            reply
        });
        let session = entry_session(&broker).await;

        let err = call(session.as_ref(), "$management", read_request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)), "got: {err}");
    }

    #[tokio::test]
    async fn call_honours_cancellation() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management_silent();
        let session = entry_session(&broker).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = call(session.as_ref(), "$management", read_request(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "got: {err}");
    }

    #[test]
    fn reply_status_accepts_long_codes() {
        let reply = Message::default()
            .application_property(STATUS_CODE, Value::Long(404))
            .application_property(STATUS_DESCRIPTION, "missing");
        assert_eq!(reply_status(&reply).unwrap(), (404, "missing".to_string()));
    }
}
