//! Partition discovery over `$management`.

use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::rpc;
use crate::transport::Session;
use crate::types::{Body, Message};

pub const MANAGEMENT_ADDRESS: &str = "$management";
pub const EVENTHUB_ENTITY_TYPE: &str = "com.microsoft:eventhub";

const PARTITION_IDS: &str = "partition_ids";

/// Read the hub's runtime information and return its partition ids in
/// the order the broker lists them.
pub async fn list_partitions(
    session: &dyn Session,
    hub_name: &str,
    cancel: &CancellationToken,
) -> Result<Vec<String>, Error> {
    let request = Message::default()
        .application_property("operation", "READ")
        .application_property("type", EVENTHUB_ENTITY_TYPE)
        .application_property("name", hub_name);

    let reply = rpc::call(session, MANAGEMENT_ADDRESS, request, cancel).await?;
    let ids = partition_ids(&reply)?;
    tracing::info!(hub = hub_name, partitions = ?ids, "partitions discovered");
    Ok(ids)
}

fn partition_ids(reply: &Message) -> Result<Vec<String>, Error> {
    let Body::Value(value) = &reply.body else {
        return Err(Error::MalformedResponse(
            "management reply has no value body".into(),
        ));
    };
    let map = value.as_map().ok_or_else(|| {
        Error::MalformedResponse(format!("management reply is not a map: {value}"))
    })?;
    map.get(PARTITION_IDS)
        .and_then(|ids| ids.as_string_list())
        .ok_or_else(|| {
            Error::MalformedResponse(format!(
                "management reply has no string list {PARTITION_IDS:?}: {value}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::testing::{MockBroker, status_reply};
    use crate::transport::{ConnectOptions, SecurityConfig, Transport};
    use crate::types::Value;

    async fn discover(broker: &MockBroker) -> Result<Vec<String>, Error> {
        let conn = broker
            .connect(&ConnectOptions::new(
                broker.namespace_host(),
                5671,
                SecurityConfig::default(),
            ))
            .await
            .unwrap();
        let session = conn.new_session().await.unwrap();
        list_partitions(session.as_ref(), "hub", &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn lists_partitions_in_broker_order() {
        let broker = MockBroker::new("hub", &["3", "0", "1"]);
        assert_eq!(discover(&broker).await.unwrap(), vec!["3", "0", "1"]);

        let req = &broker.management_requests()[0];
        let prop = |k: &str| req.application_properties.get(k).and_then(Value::as_str);
        assert_eq!(prop("operation"), Some("READ"));
        assert_eq!(prop("type"), Some(EVENTHUB_ENTITY_TYPE));
        assert_eq!(prop("name"), Some("hub"));
    }

    #[tokio::test]
    async fn rejects_non_map_body() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management(|req| {
            let mut reply = status_reply(req, 200, "OK");
            reply.body = Body::Value(Value::from("nope"));
            reply
        });
        let err = discover(&broker).await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)), "got: {err}");
    }

    #[tokio::test]
    async fn rejects_non_string_ids() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management(|req| {
            let mut reply = status_reply(req, 200, "OK");
            let mut map = BTreeMap::new();
            map.insert(
                PARTITION_IDS.to_string(),
                Value::List(vec![Value::Int(0), Value::Int(1)]),
            );
            reply.body = Body::Value(Value::Map(map));
            reply
        });
        let err = discover(&broker).await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)), "got: {err}");
    }

    #[tokio::test]
    async fn propagates_rejection() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_management(|req| status_reply(req, 404, "no such hub"));
        let err = discover(&broker).await.unwrap_err();
        assert!(
            matches!(err, Error::RemoteRejected { code: 404, .. }),
            "got: {err}"
        );
    }
}
