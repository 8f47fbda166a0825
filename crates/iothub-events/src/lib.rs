//! IoT hub device-event reader over an AMQP-style session/link transport.
//!
//! Implements the client side of the IoT hub event stream: authorization
//! with shared access signatures, the redirect from the hub's entry host to
//! its event hub namespace, partition discovery, and a fan-in subscription
//! over every partition.
//!
//! # Features
//! - SAS token signing and continuous `$cbs` renewal before expiry
//! - Correlated request/reply calls on `$management`
//! - Link-redirect following with server-name override for TLS
//! - One receiver task per partition, merged into a single handler
//! - Cooperative cancellation with bounded link teardown
//!
//! The protocol stack itself sits behind the [`Transport`] trait family;
//! [`testing::MockBroker`] is an in-memory implementation.
//!
//! # Example
//! ```no_run
//! # async fn example(transport: std::sync::Arc<dyn iothub_events::Transport>) -> Result<(), iothub_events::Error> {
//! use iothub_events::{ClientConfig, Event, EventHubClient, SubscribeOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig::from_connection_string(
//!     "HostName=my-hub.azure-devices.net;SharedAccessKeyName=service;SharedAccessKey=c2VjcmV0",
//! )?;
//! let client = EventHubClient::new(transport, config).await?;
//! let options = SubscribeOptions::default().since(chrono::Utc::now());
//!
//! client
//!     .run(&options, &CancellationToken::new(), |msg| {
//!         let event = Event::from(msg);
//!         println!("{:?}: {} bytes", event.connection_device_id, event.payload.len());
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

mod cbs;
mod client;
mod config;
mod event;
mod partitions;
mod redirect;
mod rpc;
mod sas;
mod subscribe;
pub mod testing;
pub mod transport;
mod types;

pub use cbs::{
    CBS_ADDRESS, RenewalHandle, RenewalPolicy, SAS_TOKEN_TYPE, TokenRenewer,
    put_token_continuously,
};
pub use client::EventHubClient;
pub use config::{ClientConfig, RenewalConfig, load as load_config};
pub use event::{ConnectionAuthMethod, Event};
pub use partitions::{EVENTHUB_ENTITY_TYPE, MANAGEMENT_ADDRESS, list_partitions};
pub use redirect::{
    CLIENT_VERSION, CLIENT_VERSION_PROPERTY, EVENTS_ADDRESS, ProbeOutcome, RedirectInfo,
    Redirected, RedirectingDialer, probe,
};
pub use rpc::{STATUS_CODE, STATUS_DESCRIPTION, STATUS_OK, call};
pub use sas::{SharedAccessKey, SharedAccessSignature, sign};
pub use subscribe::{
    DEFAULT_CONSUMER_GROUP, SubscribeOptions, enqueued_time_selector, partition_address,
    subscribe,
};
pub use transport::{
    AMQPS_PORT, AmqpError, ConnectOptions, Connection, Delivery, LinkOption, LinkSpec, Outcome,
    Receiver, SaslPlain, SecurityConfig, Sender, Session, Settlement, Transport, TransportError,
};
pub use types::{Body, BoxError, Error, Message, Properties, Value};
