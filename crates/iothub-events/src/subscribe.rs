//! Fan-in of per-partition receivers into a single handler.

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::partitions::list_partitions;
use crate::transport::{
    Connection, Delivery, LinkOption, LinkSpec, Receiver, Session, close_detached,
};

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

const ENQUEUED_TIME_ANNOTATION: &str = "amqp.annotation.x-opt-enqueuedtimeutc";

/// Options for [`subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Only receive messages enqueued after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Defaults to [`DEFAULT_CONSUMER_GROUP`].
    pub consumer_group: Option<String>,
    /// Passed through to every partition receiver.
    pub link_options: Vec<LinkOption>,
}

impl SubscribeOptions {
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn consumer_group(mut self, group: &str) -> Self {
        self.consumer_group = Some(group.to_string());
        self
    }

    pub fn link_option(mut self, option: LinkOption) -> Self {
        self.link_options.push(option);
        self
    }

    pub fn group(&self) -> &str {
        self.consumer_group
            .as_deref()
            .unwrap_or(DEFAULT_CONSUMER_GROUP)
    }

    fn link_spec(&self, address: &str) -> LinkSpec {
        let spec = LinkSpec::receiver(address).options(self.link_options.iter().cloned());
        match self.since {
            Some(since) => spec.options([LinkOption::SelectorFilter(enqueued_time_selector(since))]),
            None => spec,
        }
    }
}

/// Selector matching messages enqueued strictly after `since`.
pub fn enqueued_time_selector(since: DateTime<Utc>) -> String {
    format!(
        "{ENQUEUED_TIME_ANNOTATION} > '{}'",
        since.timestamp_millis()
    )
}

pub fn partition_address(hub_name: &str, consumer_group: &str, partition_id: &str) -> String {
    format!("/{hub_name}/ConsumerGroups/{consumer_group}/Partitions/{partition_id}")
}

/// Receive from every partition of `hub_name` and hand each delivery to
/// `handler`, one at a time.
///
/// The handler owns settlement of the delivery it is given. Deliveries from
/// one partition reach the handler in receipt order; partitions interleave
/// arbitrarily. Returns the first error from discovery, a receiver, or the
/// handler, or [`Error::Cancelled`] once `cancel` fires. Every receiver and
/// the subscription's session are closed before returning.
pub async fn subscribe<F, Fut>(
    connection: &dyn Connection,
    hub_name: &str,
    options: &SubscribeOptions,
    cancel: &CancellationToken,
    mut handler: F,
) -> Result<(), Error>
where
    F: FnMut(Delivery) -> Fut + Send,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    let session = connection.new_session().await?;
    let result = attach_and_fan_in(session.as_ref(), hub_name, options, cancel, &mut handler).await;
    close_detached("subscribe session", session.close()).await;
    result
}

async fn attach_and_fan_in<F, Fut>(
    session: &dyn Session,
    hub_name: &str,
    options: &SubscribeOptions,
    cancel: &CancellationToken,
    handler: &mut F,
) -> Result<(), Error>
where
    F: FnMut(Delivery) -> Fut + Send,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    let ids = list_partitions(session, hub_name, cancel).await?;
    if ids.is_empty() {
        return Err(Error::MalformedResponse(format!(
            "hub {hub_name:?} reported no partitions"
        )));
    }

    let mut receivers = Vec::with_capacity(ids.len());
    for id in &ids {
        let address = partition_address(hub_name, options.group(), id);
        receivers.push(session.open_receiver(options.link_spec(&address)).await?);
    }
    tracing::info!(
        hub = hub_name,
        group = options.group(),
        partitions = receivers.len(),
        "subscribed"
    );
    fan_in(receivers, cancel, handler).await
}

async fn fan_in<F, Fut>(
    receivers: Vec<Box<dyn Receiver>>,
    cancel: &CancellationToken,
    handler: &mut F,
) -> Result<(), Error>
where
    F: FnMut(Delivery) -> Fut + Send,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    let scope = cancel.child_token();
    let _guard = scope.clone().drop_guard();

    // Capacity 1: a receiver holds at most one message the handler has not
    // taken yet.
    let (delivery_tx, mut deliveries) = mpsc::channel::<Delivery>(1);
    let (error_tx, mut errors) = mpsc::channel::<Error>(1);

    let mut tasks = JoinSet::new();
    for receiver in receivers {
        tasks.spawn(receive_loop(
            receiver,
            delivery_tx.clone(),
            error_tx.clone(),
            scope.clone(),
        ));
    }
    drop(delivery_tx);
    drop(error_tx);

    let result = loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => break Err(Error::Cancelled),
            Some(err) = errors.recv() => break Err(err),
            Some(delivery) = deliveries.recv() => {
                if let Err(e) = handler(delivery).await {
                    break Err(e);
                }
            }
        }
    };

    scope.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!("partition receiver task failed: {e}");
        }
    }
    result
}

async fn receive_loop(
    mut receiver: Box<dyn Receiver>,
    deliveries: mpsc::Sender<Delivery>,
    errors: mpsc::Sender<Error>,
    scope: CancellationToken,
) {
    let address = receiver.address().to_string();
    tracing::debug!(%address, "partition receiver started");

    loop {
        let received = tokio::select! {
            _ = scope.cancelled() => break,
            received = receiver.receive() => received,
        };
        match received {
            Ok(delivery) => {
                tracing::trace!(%address, "message received");
                tokio::select! {
                    _ = scope.cancelled() => break,
                    sent = deliveries.send(delivery) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%address, "partition receive failed: {e}");
                tokio::select! {
                    _ = scope.cancelled() => {}
                    _ = errors.send(e.into()) => {}
                }
                break;
            }
        }
    }

    close_detached("partition receiver", receiver.close()).await;
    tracing::debug!(%address, "partition receiver stopped");
}
