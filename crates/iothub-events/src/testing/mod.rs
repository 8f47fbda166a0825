//! Test utilities.
//!
//! - [`MockBroker`] - an in-memory broker implementing the transport traits,
//!   playing both the IoT hub entry host and the event hub namespace it
//!   redirects to.
//!
//! # Example
//!
//! ```rust,ignore
//! use iothub_events::testing::MockBroker;
//!
//! let broker = MockBroker::new("my-hub", &["0", "1"]);
//! broker.publish("0", Message::with_data(b"hello".to_vec()));
//! let client = EventHubClient::new(Arc::new(broker.clone()), config).await?;
//! ```

pub mod mock_broker;

pub use mock_broker::{MockBroker, ProbeBehavior, Responder, Settled, TokenPut, status_reply};
