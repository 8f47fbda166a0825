//! Following the entry host's link redirect to the event-hosting namespace.
//!
//! The IoT hub entry host never serves `messages/events/` itself. Opening
//! a receiver there is rejected with `amqp:link:redirect`, whose info map
//! names the namespace host and the event hub path to use instead:
//!
//! ```text
//! condition = amqp:link:redirect, info = map[
//!     address:amqps://ns.servicebus.windows.net:5671/iothub-ehub-x/
//!     hostname:ns.servicebus.windows.net
//!     network-host:ns.servicebus.windows.net
//!     port:5671]
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::cbs::{self, RenewalPolicy};
use crate::sas::SharedAccessKey;
use crate::transport::{
    AMQPS_PORT, AmqpError, ConnectOptions, Connection, LinkSpec, SecurityConfig, Session,
    Transport, TransportError, close_detached, condition,
};

pub const EVENTS_ADDRESS: &str = "messages/events/";

pub const CLIENT_VERSION_PROPERTY: &str = "com.microsoft:client-version";
pub const CLIENT_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Redirect info
// ---------------------------------------------------------------------------

/// Where the broker told us to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    /// Full entity URL, e.g. `amqps://host:5671/<hub>/`.
    pub address: String,
    /// Name to verify the namespace certificate against.
    pub hostname: String,
    /// Host to dial.
    pub network_host: String,
    pub port: u16,
}

impl RedirectInfo {
    pub fn from_error(err: &AmqpError) -> Result<Self, Error> {
        let text = |key: &str| -> Result<String, Error> {
            err.info
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::MalformedResponse(format!("redirect info has no string {key:?}: {err}"))
                })
        };
        let address = text("address")?;
        let hostname = text("hostname")?;
        let network_host = match err.info.get("network-host") {
            Some(_) => text("network-host")?,
            None => hostname.clone(),
        };
        let port = match err.info.get("port") {
            None => AMQPS_PORT,
            Some(v) => v
                .as_i64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    Error::MalformedResponse(format!("redirect info has invalid port: {err}"))
                })?,
        };
        Ok(Self {
            address,
            hostname,
            network_host,
            port,
        })
    }

    /// The entity path of [`address`](Self::address): the event hub name
    /// that partition addresses are built on.
    pub fn entity_path(&self) -> Result<String, Error> {
        let url = url::Url::parse(&self.address).map_err(|e| {
            Error::MalformedResponse(format!("redirect address {:?}: {e}", self.address))
        })?;
        let path = url.path().trim_matches('/');
        if path.is_empty() {
            return Err(Error::MalformedResponse(format!(
                "redirect address {:?} has no entity path",
                self.address
            )));
        }
        Ok(path.to_string())
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Redirect(RedirectInfo),
    /// The entry host served the events address directly.
    Opened,
}

/// Try to open a receiver on [`EVENTS_ADDRESS`]. A redirect is a normal
/// outcome; any other link error is a dial failure.
pub async fn probe(session: &dyn Session) -> Result<ProbeOutcome, Error> {
    match session.open_receiver(LinkSpec::receiver(EVENTS_ADDRESS)).await {
        Ok(receiver) => {
            close_detached("probe receiver", receiver.close()).await;
            Ok(ProbeOutcome::Opened)
        }
        Err(TransportError::Remote(e)) if e.condition == condition::LINK_REDIRECT => {
            Ok(ProbeOutcome::Redirect(RedirectInfo::from_error(&e)?))
        }
        Err(e) => Err(Error::DialFailed(e)),
    }
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// A connection to the namespace that actually hosts the events.
pub struct Redirected {
    pub connection: Arc<dyn Connection>,
    pub info: RedirectInfo,
    pub hub_name: String,
}

impl std::fmt::Debug for Redirected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redirected")
            .field("info", &self.info)
            .field("hub_name", &self.hub_name)
            .finish_non_exhaustive()
    }
}

/// Dials the entry host, follows its redirect, and connects to the
/// namespace.
pub struct RedirectingDialer {
    transport: Arc<dyn Transport>,
    key: SharedAccessKey,
    port: u16,
    security: SecurityConfig,
    policy: RenewalPolicy,
}

impl RedirectingDialer {
    pub fn new(transport: Arc<dyn Transport>, key: SharedAccessKey) -> Self {
        Self {
            transport,
            key,
            port: AMQPS_PORT,
            security: SecurityConfig::default(),
            policy: RenewalPolicy::default(),
        }
    }

    /// Port of the entry host. The namespace port comes from the redirect.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// TLS settings for both hops. The namespace hop overrides
    /// `server_name` with the redirect hostname.
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    /// Token lifetime and renewal margin for the entry host renewer.
    pub fn renewal_policy(mut self, policy: RenewalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Authorize on the entry host, collect the redirect, and connect to
    /// the namespace it names. The entry connection is always closed
    /// before this returns.
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<Redirected, Error> {
        let entry_options = ConnectOptions::new(&self.key.host_name, self.port, self.security.clone())
            .property(CLIENT_VERSION_PROPERTY, CLIENT_VERSION);
        let entry = self
            .transport
            .connect(&entry_options)
            .await
            .map_err(Error::DialFailed)?;
        tracing::info!(host = %self.key.host_name, "connected to entry host");

        let probed = self.probe_entry(entry.as_ref(), cancel).await;
        close_detached("entry connection", entry.close()).await;
        let info = probed?;
        let hub_name = info.entity_path()?;
        tracing::info!(
            host = %info.hostname,
            hub = %hub_name,
            "redirected to event hub namespace"
        );

        let options = ConnectOptions::new(
            &info.network_host,
            info.port,
            self.security.with_server_name(&info.hostname),
        )
        .sasl_plain(&self.key.key_name, &self.key.key)
        .property(CLIENT_VERSION_PROPERTY, CLIENT_VERSION);
        let connection = self
            .transport
            .connect(&options)
            .await
            .map_err(Error::DialFailed)?;

        Ok(Redirected {
            connection,
            info,
            hub_name,
        })
    }

    async fn probe_entry(
        &self,
        entry: &dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<RedirectInfo, Error> {
        let session = entry.new_session().await?;
        let outcome = self.authorize_and_probe(session.as_ref(), cancel).await;
        close_detached("entry session", session.close()).await;

        match outcome? {
            ProbeOutcome::Redirect(info) => Ok(info),
            ProbeOutcome::Opened => Err(Error::UnexpectedSuccess),
        }
    }

    async fn authorize_and_probe(
        &self,
        session: &dyn Session,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, Error> {
        let renewal =
            cbs::put_token_continuously(session, self.key.clone(), self.policy, cancel).await?;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = probe(session) => outcome,
        };
        renewal.stop().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBroker, ProbeBehavior};
    use crate::types::Value;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    fn dialer(broker: &MockBroker) -> RedirectingDialer {
        let key = SharedAccessKey {
            host_name: broker.entry_host().to_string(),
            key_name: "service".into(),
            key: KEY.into(),
        };
        RedirectingDialer::new(Arc::new(broker.clone()), key)
    }

    #[test]
    fn parses_redirect_info() {
        let err = AmqpError::new(condition::LINK_REDIRECT)
            .with_info("address", "amqps://h:5671/grp/")
            .with_info("hostname", "h")
            .with_info("network-host", "h")
            .with_info("port", 5671);
        let info = RedirectInfo::from_error(&err).unwrap();
        assert_eq!(info.network_host, "h");
        assert_eq!(info.hostname, "h");
        assert_eq!(info.port, 5671);
        assert_eq!(info.entity_path().unwrap(), "grp");
    }

    #[test]
    fn redirect_info_accepts_long_port_and_missing_network_host() {
        let mut err = AmqpError::new(condition::LINK_REDIRECT)
            .with_info("address", "amqps://h:5671/grp/")
            .with_info("hostname", "h");
        err.info.insert("port".into(), Value::Long(5672));
        let info = RedirectInfo::from_error(&err).unwrap();
        assert_eq!(info.network_host, "h");
        assert_eq!(info.port, 5672);
    }

    #[test]
    fn redirect_info_requires_address() {
        let err = AmqpError::new(condition::LINK_REDIRECT).with_info("hostname", "h");
        assert!(matches!(
            RedirectInfo::from_error(&err),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn entity_path_requires_path() {
        let info = RedirectInfo {
            address: "amqps://h:5671/".into(),
            hostname: "h".into(),
            network_host: "h".into(),
            port: 5671,
        };
        assert!(info.entity_path().is_err());
    }

    #[tokio::test]
    async fn dial_follows_redirect() {
        let broker = MockBroker::new("hub", &["0"]);
        let redirected = dialer(&broker).dial(&CancellationToken::new()).await.unwrap();
        assert_eq!(redirected.hub_name, "hub");
        assert_eq!(redirected.info.hostname, broker.namespace_host());

        let connects = broker.connects();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[0].host, broker.entry_host());
        assert!(connects[0].sasl.is_none());

        let ns = &connects[1];
        assert_eq!(ns.host, broker.namespace_host());
        assert_eq!(
            ns.security.server_name.as_deref(),
            Some(broker.namespace_host())
        );
        let sasl = ns.sasl.as_ref().unwrap();
        assert_eq!(sasl.username, "service");
        assert_eq!(sasl.password, KEY);
        assert_eq!(
            ns.properties.get(CLIENT_VERSION_PROPERTY).map(String::as_str),
            Some(CLIENT_VERSION)
        );

        // Token put on the entry host, entry session and connection closed.
        assert_eq!(broker.token_puts().len(), 1);
        assert_eq!(broker.closed_sessions(), vec![broker.entry_host().to_string()]);
        assert_eq!(broker.closed_connections(), vec![broker.entry_host().to_string()]);
        assert!(format!("{redirected:?}").contains("hub_name: \"hub\""));
    }

    #[tokio::test]
    async fn dial_fails_when_probe_is_accepted() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_probe(ProbeBehavior::Accept);
        let err = dialer(&broker).dial(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedSuccess), "got: {err}");
        assert_eq!(broker.connects().len(), 1);
        assert_eq!(broker.closed_connections().len(), 1);
    }

    #[tokio::test]
    async fn dial_fails_on_other_link_errors() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_probe(ProbeBehavior::Fail(
            AmqpError::new(condition::UNAUTHORIZED_ACCESS).with_description("denied"),
        ));
        let err = dialer(&broker).dial(&CancellationToken::new()).await.unwrap_err();
        match err {
            Error::DialFailed(e) => {
                assert_eq!(e.condition(), Some(condition::UNAUTHORIZED_ACCESS));
            }
            other => panic!("expected DialFailed, got {other:?}"),
        }
        assert_eq!(broker.closed_connections().len(), 1);
    }

    #[tokio::test]
    async fn dial_fails_when_token_rejected() {
        let broker = MockBroker::new("hub", &["0"]);
        broker.set_cbs_status(401, "bad signature");
        let err = dialer(&broker).dial(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::TokenRejected { code: 401, .. }), "got: {err}");
        assert_eq!(broker.closed_sessions(), vec![broker.entry_host().to_string()]);
        assert_eq!(broker.closed_connections().len(), 1);
        assert!(broker.all_sessions_closed());
    }

    #[tokio::test]
    async fn dial_closes_entry_session_when_cancelled() {
        let broker = MockBroker::new("hub", &["0"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dialer(&broker).dial(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got: {err}");
        assert_eq!(broker.closed_sessions(), vec![broker.entry_host().to_string()]);
        assert!(broker.all_sessions_closed());
    }
}
