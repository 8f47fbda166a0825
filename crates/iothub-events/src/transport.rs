//! Session/link transport seam.
//!
//! The crate drives an AMQP-style protocol stack through these traits: a
//! [`Transport`] dials [`Connection`]s, a connection multiplexes
//! [`Session`]s, and sessions open directional [`Sender`]/[`Receiver`]
//! links. The secure byte stream underneath is the implementation's
//! business; this crate only supplies the server name to verify and the
//! trust-root bundle as opaque PEM bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{Message, Value};

/// Default port for AMQP over TLS.
pub const AMQPS_PORT: u16 = 5671;

/// Upper bound on link/session/connection teardown.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Well-known broker error conditions.
pub mod condition {
    pub const LINK_REDIRECT: &str = "amqp:link:redirect";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const RESOURCE_LOCKED: &str = "amqp:resource-locked";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An error reported by the remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpError {
    /// Symbolic condition, e.g. `amqp:link:redirect`.
    pub condition: String,
    /// Human-readable detail from the peer.
    pub description: Option<String>,
    /// Condition-specific fields; a redirect carries its target here.
    pub info: BTreeMap<String, Value>,
}

impl AmqpError {
    pub fn new(condition: &str) -> Self {
        Self {
            condition: condition.to_string(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_info(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.info.insert(key.to_string(), value.into());
        self
    }
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "condition = {}", self.condition)?;
        if let Some(d) = &self.description {
            write!(f, ", description = {d:?}")?;
        }
        if !self.info.is_empty() {
            write!(f, ", info = {}", Value::Map(self.info.clone()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("remote error: {0}")]
    Remote(AmqpError),

    #[error("{0} closed")]
    Closed(&'static str),

    #[error("io error: {0}")]
    Io(String),
}

impl TransportError {
    /// The broker-supplied condition, if the peer rejected the operation.
    pub fn condition(&self) -> Option<&str> {
        match self {
            TransportError::Remote(e) => Some(&e.condition),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Connection options
// ---------------------------------------------------------------------------

/// TLS settings handed to the transport untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityConfig {
    /// Name to verify the server certificate against; defaults to the dialed host.
    pub server_name: Option<String>,
    /// PEM-encoded trust roots; `None` means the platform store.
    pub trust_roots: Option<Arc<[u8]>>,
}

impl SecurityConfig {
    /// Clone with the verification name overridden.
    pub fn with_server_name(&self, name: &str) -> Self {
        Self {
            server_name: Some(name.to_string()),
            trust_roots: self.trust_roots.clone(),
        }
    }
}

/// SASL PLAIN credentials. The password is redacted from `Debug`.
#[derive(Clone, PartialEq)]
pub struct SaslPlain {
    /// Shared access key name.
    pub username: String,
    /// Shared access key.
    pub password: String,
}

impl fmt::Debug for SaslPlain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslPlain")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a [`Transport`] needs to open one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    /// Host to dial.
    pub host: String,
    pub port: u16,
    pub security: SecurityConfig,
    /// `None` means anonymous; authorization then happens over `$cbs`.
    pub sasl: Option<SaslPlain>,
    /// Connection properties sent in the open frame.
    pub properties: BTreeMap<String, String>,
}

impl ConnectOptions {
    pub fn new(host: &str, port: u16, security: SecurityConfig) -> Self {
        Self {
            host: host.to_string(),
            port,
            security,
            sasl: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn sasl_plain(mut self, username: &str, password: &str) -> Self {
        self.sasl = Some(SaslPlain {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Low-level link tuning passed through to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOption {
    /// Broker-side selector expression over message annotations.
    SelectorFilter(String),
    /// Initial receive credit.
    Credit(u32),
    Name(String),
    Property(String, Value),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkSpec {
    pub source: Option<String>,
    pub target: Option<String>,
    pub options: Vec<LinkOption>,
}

impl LinkSpec {
    pub fn sender(target: &str) -> Self {
        Self {
            target: Some(target.to_string()),
            ..Default::default()
        }
    }

    pub fn receiver(source: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            ..Default::default()
        }
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = LinkOption>) -> Self {
        self.options.extend(options);
        self
    }

    /// The selector filter, if one was requested.
    pub fn selector(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            LinkOption::SelectorFilter(s) => Some(s.as_str()),
            _ => None,
        })
    }
}

/// How a received message is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted,
    Rejected(Option<AmqpError>),
    Released,
}

/// Transport-side settlement of a single delivery.
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn settle(&self, outcome: Outcome) -> Result<(), TransportError>;
}

/// A received message together with the right to settle it.
///
/// Settling consumes the delivery, so each message is settled at most once
/// and only by whoever holds it.
pub struct Delivery {
    message: Message,
    settlement: Box<dyn Settlement>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(message: Message, settlement: Box<dyn Settlement>) -> Self {
        Self {
            message,
            settlement,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub async fn accept(self) -> Result<Message, TransportError> {
        self.settle(Outcome::Accepted).await
    }

    pub async fn reject(self, error: Option<AmqpError>) -> Result<Message, TransportError> {
        self.settle(Outcome::Rejected(error)).await
    }

    pub async fn release(self) -> Result<Message, TransportError> {
        self.settle(Outcome::Released).await
    }

    async fn settle(self, outcome: Outcome) -> Result<Message, TransportError> {
        self.settlement.settle(outcome).await?;
        Ok(self.message)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, options: &ConnectOptions)
    -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn new_session(&self) -> Result<Arc<dyn Session>, TransportError>;
    /// Close the connection and every session and link on it.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn open_sender(&self, spec: LinkSpec) -> Result<Box<dyn Sender>, TransportError>;
    async fn open_receiver(&self, spec: LinkSpec) -> Result<Box<dyn Receiver>, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Receiver: Send + Sync {
    /// Address the link is bound to.
    fn address(&self) -> &str;
    /// Wait for the next delivery. Must be cancel-safe: dropping the future
    /// before it completes loses no message.
    async fn receive(&mut self) -> Result<Delivery, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Run a close operation bounded by [`CLOSE_TIMEOUT`], logging failures.
///
/// Independent of any cancellation token, so teardown still completes
/// while the scope that triggered it is being cancelled.
pub(crate) async fn close_detached<F>(what: &str, close: F)
where
    F: Future<Output = Result<(), TransportError>>,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
        Ok(Ok(())) => tracing::debug!(what, "closed"),
        Ok(Err(e)) => tracing::warn!(what, "close failed: {e}"),
        Err(_) => tracing::warn!(what, "close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_spec_selector() {
        let spec = LinkSpec::receiver("/hub/ConsumerGroups/$Default/Partitions/0").options([
            LinkOption::Credit(10),
            LinkOption::SelectorFilter("x > 1".into()),
        ]);
        assert_eq!(spec.selector(), Some("x > 1"));
        assert_eq!(LinkSpec::sender("$cbs").selector(), None);
    }

    #[test]
    fn security_config_override_keeps_roots() {
        let roots: Arc<[u8]> = Arc::from(b"pem".as_slice());
        let base = SecurityConfig {
            server_name: None,
            trust_roots: Some(roots.clone()),
        };
        let cloned = base.with_server_name("ns.servicebus.windows.net");
        assert_eq!(
            cloned.server_name.as_deref(),
            Some("ns.servicebus.windows.net")
        );
        assert_eq!(cloned.trust_roots, Some(roots));
        assert!(base.server_name.is_none());
    }

    #[test]
    fn sasl_password_is_redacted() {
        let opts = ConnectOptions::new("h", AMQPS_PORT, SecurityConfig::default())
            .sasl_plain("service", "secret-key");
        let debug = format!("{opts:?}");
        assert!(debug.contains("service"));
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn amqp_error_display() {
        let err = AmqpError::new(condition::LINK_REDIRECT)
            .with_info("hostname", "h")
            .with_info("port", 5671);
        assert_eq!(
            err.to_string(),
            "condition = amqp:link:redirect, info = map[hostname:h port:5671]"
        );
    }
}
