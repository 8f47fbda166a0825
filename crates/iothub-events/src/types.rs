//! Public types for the iothub-events crate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::transport::TransportError;

/// A boxed error type for caller-supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A value carried in message bodies, annotations, and property maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    String(String),
    Binary(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of `Int` and `Long` values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(i64::from(*n)),
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Collect a list of strings; `None` if any element is not a string.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            Value::List(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Long(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
            Value::Binary(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("map[")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

/// Standard message properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// Set on every request; replies echo it as `correlation_id`.
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Destination address, e.g. `$cbs`.
    pub to: Option<String>,
    /// Address the peer should send its reply to.
    pub reply_to: Option<String>,
    /// Identity of the sending user, as raw bytes.
    pub user_id: Option<Vec<u8>>,
    pub absolute_expiry_time: Option<DateTime<Utc>>,
}

/// Message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Data(Vec<u8>),
    Value(Value),
}

/// A message envelope as carried over a link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub properties: Properties,
    /// Broker-set metadata (enqueued time, origin device, ...).
    pub annotations: BTreeMap<String, Value>,
    /// Free-form properties; also carries RPC operation and status fields.
    pub application_properties: BTreeMap<String, Value>,
    pub body: Body,
}

impl Message {
    pub fn with_value(value: impl Into<Value>) -> Self {
        Self {
            body: Body::Value(value.into()),
            ..Default::default()
        }
    }

    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Body::Data(data.into()),
            ..Default::default()
        }
    }

    /// Set an application property, builder style.
    pub fn application_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.application_properties
            .insert(key.to_string(), value.into());
        self
    }

    /// Raw body bytes: binary data as-is, string and binary values as bytes.
    pub fn data(&self) -> &[u8] {
        match &self.body {
            Body::Data(d) => d,
            Body::Value(Value::Binary(b)) => b,
            Body::Value(Value::String(s)) => s.as_bytes(),
            _ => &[],
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("signing key is not valid base64: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    #[error("invalid shared access signature: {0}")]
    InvalidToken(String),

    #[error("token rejected: code = {code}, description = {description:?}")]
    TokenRejected { code: i32, description: String },

    #[error("request rejected: code = {code}, description = {description:?}")]
    RemoteRejected { code: i32, description: String },

    #[error("correlation-id mismatch: expected {expected}, got {actual:?}")]
    CorrelationMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("expected a redirect when opening the events link, but it was accepted")]
    UnexpectedSuccess,

    #[error("dial failed: {0}")]
    DialFailed(TransportError),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("handler error: {0}")]
    Handler(BoxError),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap a caller error returned from an event handler.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Error::Handler(err.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
