//! The client facade: dial, redirect, subscribe.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::config::ClientConfig;
use crate::redirect::RedirectingDialer;
use crate::subscribe::{self, SubscribeOptions};
use crate::transport::{Delivery, SecurityConfig, Transport, close_detached};
use crate::types::{BoxError, Message};

/// Reads device events from an IoT hub.
///
/// Every call to [`subscribe`](Self::subscribe) or [`run`](Self::run)
/// opens its own connection and closes it before returning. There is no
/// reconnect logic; restarting after an error is up to the caller.
pub struct EventHubClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    security: SecurityConfig,
}

impl EventHubClient {
    /// Validate `config` and read its trust-root bundle. The bundle is not
    /// read again; later changes to the file need a new client.
    pub async fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let security = config.security_config().await?;
        Ok(Self {
            transport,
            config,
            security,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn dialer(&self) -> RedirectingDialer {
        RedirectingDialer::new(self.transport.clone(), self.config.credentials())
            .port(self.config.port)
            .security(self.security.clone())
            .renewal_policy(self.config.renewal_policy())
    }

    /// Subscribe to every partition and hand each delivery to `handler`,
    /// which is responsible for settling it.
    ///
    /// Blocks until the handler or a receiver fails, or `cancel` fires.
    pub async fn subscribe<F, Fut>(
        &self,
        options: &SubscribeOptions,
        cancel: &CancellationToken,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(Delivery) -> Fut + Send,
        Fut: Future<Output = Result<(), Error>> + Send,
    {
        let redirected = self.dialer().dial(cancel).await?;

        let mut options = options.clone();
        if options.consumer_group.is_none() {
            options.consumer_group = self.config.consumer_group.clone();
        }

        let result = subscribe::subscribe(
            redirected.connection.as_ref(),
            &redirected.hub_name,
            &options,
            cancel,
            handler,
        )
        .await;

        close_detached("event hub connection", redirected.connection.close()).await;
        match &result {
            Err(Error::Cancelled) => tracing::info!("subscription cancelled"),
            Err(e) => tracing::warn!("subscription ended: {e}"),
            Ok(()) => {}
        }
        result
    }

    /// Like [`subscribe`](Self::subscribe), but accepts each message once
    /// `on_event` returns `Ok`. An `on_event` error ends the run and leaves
    /// the message unsettled.
    ///
    /// Without an explicit [`since`](SubscribeOptions::since), only events
    /// enqueued after the call are read. Use `subscribe` to read from the
    /// start of retention.
    pub async fn run<F>(
        &self,
        options: &SubscribeOptions,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&Message) -> Result<(), BoxError> + Send,
    {
        let mut options = options.clone();
        if options.since.is_none() {
            options.since = Some(Utc::now());
        }
        self.subscribe(&options, cancel, |delivery: Delivery| {
            let handled = on_event(delivery.message()).map_err(Error::Handler);
            async move {
                handled?;
                delivery.accept().await?;
                Ok::<(), Error>(())
            }
        })
        .await
    }
}
