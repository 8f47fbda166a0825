//! In-memory broker for tests.
//!
//! Connections to [`MockBroker::entry_host`] behave like an IoT hub front
//! door: `$cbs` accepts tokens and `messages/events/` answers with a link
//! redirect. Connections to [`MockBroker::namespace_host`] serve
//! `$management` and one queue per partition. Everything the client does
//! is recorded for assertions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cbs::CBS_ADDRESS;
use crate::partitions::MANAGEMENT_ADDRESS;
use crate::redirect::EVENTS_ADDRESS;
use crate::rpc::{STATUS_CODE, STATUS_DESCRIPTION};
use crate::transport::{
    AMQPS_PORT, AmqpError, ConnectOptions, Connection, Delivery, LinkSpec, Outcome, Receiver,
    Sender, Session, Settlement, Transport, TransportError, condition,
};
use crate::types::{Body, Message, Value};

/// Builds the reply to a control request; `None` never replies.
pub type Responder = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

type Inbound = Result<Message, TransportError>;

/// What the entry host does when asked for `messages/events/`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeBehavior {
    /// Reject with a link redirect to the namespace.
    Redirect,
    /// Open the link.
    Accept,
    /// Reject with the given error.
    Fail(AmqpError),
}

/// A token put on `$cbs`.
#[derive(Debug, Clone)]
pub struct TokenPut {
    pub at: Instant,
    pub audience: String,
    pub token: String,
}

/// A settled delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub address: String,
    pub message_id: Option<String>,
    pub outcome: Outcome,
}

/// Reply to `request` with the given status, correlated to its message-id.
pub fn status_reply(request: &Message, code: i32, description: &str) -> Message {
    let mut reply = Message::default()
        .application_property(STATUS_CODE, code)
        .application_property(STATUS_DESCRIPTION, description);
    reply.properties.correlation_id = request.properties.message_id.clone();
    reply
}

fn runtime_info(hub_name: String, partition_ids: Vec<String>) -> Responder {
    Arc::new(move |request: &Message| {
        let mut info = BTreeMap::new();
        info.insert("name".to_string(), Value::from(hub_name.as_str()));
        info.insert(
            "partition_count".to_string(),
            Value::Int(i32::try_from(partition_ids.len()).unwrap_or(i32::MAX)),
        );
        info.insert(
            "partition_ids".to_string(),
            Value::List(partition_ids.iter().map(|id| Value::from(id.as_str())).collect()),
        );
        let mut reply = status_reply(request, 200, "OK");
        reply.body = Body::Value(Value::Map(info));
        Some(reply)
    })
}

fn status_responder(code: i32, description: &str) -> Responder {
    let description = description.to_string();
    Arc::new(move |request: &Message| {
        Some(status_reply(request, code, &description))
    })
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct PartitionQueue {
    tx: mpsc::UnboundedSender<Inbound>,
    /// Taken by the receiver that attaches to the partition.
    rx: Option<mpsc::UnboundedReceiver<Inbound>>,
}

struct State {
    probe: ProbeBehavior,
    cbs: Responder,
    management: Responder,
    partitions: HashMap<String, PartitionQueue>,
    connects: Vec<ConnectOptions>,
    token_puts: Vec<TokenPut>,
    management_requests: Vec<Message>,
    settlements: Vec<Settled>,
    opened_receivers: Vec<LinkSpec>,
    closed_links: Vec<String>,
    closed_connections: Vec<String>,
    closed_sessions: Vec<String>,
    sessions: Vec<Arc<AtomicBool>>,
}

struct Inner {
    hub_name: String,
    entry_host: String,
    namespace_host: String,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn redirect_error(&self) -> AmqpError {
        AmqpError::new(condition::LINK_REDIRECT)
            .with_info(
                "address",
                format!(
                    "amqps://{}:{AMQPS_PORT}/{}/",
                    self.namespace_host, self.hub_name
                ),
            )
            .with_info("hostname", self.namespace_host.as_str())
            .with_info("network-host", self.namespace_host.as_str())
            .with_info("port", i32::from(AMQPS_PORT))
    }
}

/// Cloning shares the same broker.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    /// A broker for hub `hub_name` with the given partitions, redirecting
    /// and accepting tokens by default.
    pub fn new(hub_name: &str, partition_ids: &[&str]) -> Self {
        let partitions = partition_ids
            .iter()
            .map(|id| {
                let (tx, rx) = mpsc::unbounded_channel();
                (id.to_string(), PartitionQueue { tx, rx: Some(rx) })
            })
            .collect();
        let ids = partition_ids.iter().map(|id| id.to_string()).collect();
        Self {
            inner: Arc::new(Inner {
                hub_name: hub_name.to_string(),
                entry_host: format!("{hub_name}.azure-devices.net"),
                namespace_host: format!("{hub_name}-ns.servicebus.windows.net"),
                state: Mutex::new(State {
                    probe: ProbeBehavior::Redirect,
                    cbs: status_responder(200, "OK"),
                    management: runtime_info(hub_name.to_string(), ids),
                    partitions,
                    connects: Vec::new(),
                    token_puts: Vec::new(),
                    management_requests: Vec::new(),
                    settlements: Vec::new(),
                    opened_receivers: Vec::new(),
                    closed_links: Vec::new(),
                    closed_connections: Vec::new(),
                    closed_sessions: Vec::new(),
                    sessions: Vec::new(),
                }),
            }),
        }
    }

    pub fn hub_name(&self) -> &str {
        &self.inner.hub_name
    }

    pub fn entry_host(&self) -> &str {
        &self.inner.entry_host
    }

    pub fn namespace_host(&self) -> &str {
        &self.inner.namespace_host
    }

    /// The error the entry host returns for `messages/events/`.
    pub fn redirect_error(&self) -> AmqpError {
        self.inner.redirect_error()
    }

    pub fn set_probe(&self, probe: ProbeBehavior) {
        self.inner.state().probe = probe;
    }

    pub fn set_cbs_status(&self, code: i32, description: &str) {
        self.inner.state().cbs = status_responder(code, description);
    }

    pub fn set_cbs(&self, responder: impl Fn(&Message) -> Message + Send + Sync + 'static) {
        self.inner.state().cbs = Arc::new(move |request: &Message| Some(responder(request)));
    }

    pub fn set_management(&self, responder: impl Fn(&Message) -> Message + Send + Sync + 'static) {
        self.inner.state().management = Arc::new(move |request: &Message| Some(responder(request)));
    }

    /// Swallow management requests without replying.
    pub fn set_management_silent(&self) {
        self.inner.state().management = Arc::new(|_: &Message| None);
    }

    /// Enqueue a message on a partition.
    pub fn publish(&self, partition_id: &str, message: Message) {
        self.push(partition_id, Ok(message));
    }

    /// Make the partition's receiver fail with `error` once earlier
    /// messages are drained.
    pub fn fail_partition(&self, partition_id: &str, error: AmqpError) {
        self.push(partition_id, Err(TransportError::Remote(error)));
    }

    fn push(&self, partition_id: &str, item: Inbound) {
        let state = self.inner.state();
        match state.partitions.get(partition_id) {
            Some(queue) => {
                if queue.tx.send(item).is_err() {
                    tracing::warn!(partition_id, "partition receiver is gone");
                }
            }
            None => tracing::warn!(partition_id, "publish to unknown partition"),
        }
    }

    pub fn connects(&self) -> Vec<ConnectOptions> {
        self.inner.state().connects.clone()
    }

    pub fn token_puts(&self) -> Vec<TokenPut> {
        self.inner.state().token_puts.clone()
    }

    pub fn management_requests(&self) -> Vec<Message> {
        self.inner.state().management_requests.clone()
    }

    pub fn settlements(&self) -> Vec<Settled> {
        self.inner.state().settlements.clone()
    }

    pub fn opened_receivers(&self) -> Vec<LinkSpec> {
        self.inner.state().opened_receivers.clone()
    }

    /// Addresses of closed links, in close order.
    pub fn closed_links(&self) -> Vec<String> {
        self.inner.state().closed_links.clone()
    }

    /// Hosts of closed connections, in close order.
    pub fn closed_connections(&self) -> Vec<String> {
        self.inner.state().closed_connections.clone()
    }

    /// Hosts of sessions closed explicitly, in close order. Sessions torn
    /// down with their connection are not listed.
    pub fn closed_sessions(&self) -> Vec<String> {
        self.inner.state().closed_sessions.clone()
    }

    /// True when every session has been closed, directly or with its
    /// connection.
    pub fn all_sessions_closed(&self) -> bool {
        self.inner
            .state()
            .sessions
            .iter()
            .all(|closed| closed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.inner.state().connects.push(options.clone());
        let entry = options.host == self.inner.entry_host;
        if !entry && options.host != self.inner.namespace_host {
            return Err(TransportError::Io(format!(
                "no route to host {}",
                options.host
            )));
        }
        tracing::debug!(host = %options.host, "mock connection opened");
        Ok(Arc::new(MockConnection {
            inner: self.inner.clone(),
            host: options.host.clone(),
            entry,
            closed: Arc::new(AtomicBool::new(false)),
            sessions: Mutex::new(Vec::new()),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection and session
// ---------------------------------------------------------------------------

struct MockConnection {
    inner: Arc<Inner>,
    host: String,
    entry: bool,
    closed: Arc<AtomicBool>,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn new_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("connection"));
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.inner.state().sessions.push(closed.clone());
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(closed.clone());
        Ok(Arc::new(MockSession {
            inner: self.inner.clone(),
            host: self.host.clone(),
            entry: self.entry,
            closed,
            connection_closed: self.closed.clone(),
            replies: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.state().closed_connections.push(self.host.clone());
        }
        // Closing a connection ends its sessions.
        for session in self.sessions.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            session.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

type Replies = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Inbound>>>>;

struct MockSession {
    inner: Arc<Inner>,
    host: String,
    entry: bool,
    closed: Arc<AtomicBool>,
    connection_closed: Arc<AtomicBool>,
    /// Reply routes by the receiving link's target address.
    replies: Replies,
}

impl MockSession {
    fn link(&self, address: String) -> Result<LinkState, TransportError> {
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("connection"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("session"));
        }
        Ok(LinkState {
            inner: self.inner.clone(),
            address,
            closed: Arc::new(AtomicBool::new(false)),
            session_closed: self.closed.clone(),
            connection_closed: self.connection_closed.clone(),
        })
    }

    fn reply_route(&self, spec: &LinkSpec) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = spec.target.clone().unwrap_or_default();
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target, tx);
        rx
    }

    fn probe(&self) -> Result<mpsc::UnboundedReceiver<Inbound>, TransportError> {
        if !self.entry {
            return Err(not_found(EVENTS_ADDRESS));
        }
        match self.inner.state().probe.clone() {
            ProbeBehavior::Redirect => Err(TransportError::Remote(self.inner.redirect_error())),
            ProbeBehavior::Fail(e) => Err(TransportError::Remote(e)),
            ProbeBehavior::Accept => Ok(mpsc::unbounded_channel().1),
        }
    }

    fn attach_partition(
        &self,
        address: &str,
    ) -> Result<mpsc::UnboundedReceiver<Inbound>, TransportError> {
        let prefix = format!("/{}/ConsumerGroups/", self.inner.hub_name);
        let partition_id = address
            .strip_prefix(&prefix)
            .and_then(|rest| rest.split_once("/Partitions/"))
            .map(|(_group, id)| id)
            .filter(|_| !self.entry)
            .ok_or_else(|| not_found(address))?;
        let mut state = self.inner.state();
        let queue = state
            .partitions
            .get_mut(partition_id)
            .ok_or_else(|| not_found(address))?;
        queue.rx.take().ok_or_else(|| {
            TransportError::Remote(
                AmqpError::new(condition::RESOURCE_LOCKED)
                    .with_description("partition already has a receiver"),
            )
        })
    }
}

fn not_found(address: &str) -> TransportError {
    TransportError::Remote(
        AmqpError::new(condition::NOT_FOUND).with_description(&format!("no entity at {address}")),
    )
}

#[async_trait]
impl Session for MockSession {
    async fn open_sender(&self, spec: LinkSpec) -> Result<Box<dyn Sender>, TransportError> {
        let link = self.link(spec.target.clone().unwrap_or_default())?;
        Ok(Box::new(MockSender {
            link,
            replies: self.replies.clone(),
        }))
    }

    async fn open_receiver(&self, spec: LinkSpec) -> Result<Box<dyn Receiver>, TransportError> {
        let source = spec.source.clone().unwrap_or_default();
        let link = self.link(source.clone())?;
        self.inner.state().opened_receivers.push(spec.clone());

        let rx = match source.as_str() {
            EVENTS_ADDRESS => self.probe()?,
            CBS_ADDRESS | MANAGEMENT_ADDRESS => self.reply_route(&spec),
            address => self.attach_partition(address)?,
        };
        Ok(Box::new(MockReceiver { link, rx }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.state().closed_sessions.push(self.host.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

struct LinkState {
    inner: Arc<Inner>,
    address: String,
    closed: Arc<AtomicBool>,
    session_closed: Arc<AtomicBool>,
    connection_closed: Arc<AtomicBool>,
}

impl LinkState {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("connection"));
        }
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("session"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("link"));
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.state().closed_links.push(self.address.clone());
        }
    }
}

struct MockSender {
    link: LinkState,
    replies: Replies,
}

#[async_trait]
impl Sender for MockSender {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.link.check_open()?;
        let responder = {
            let mut state = self.link.inner.state();
            match self.link.address.as_str() {
                CBS_ADDRESS => {
                    state.token_puts.push(TokenPut {
                        at: Instant::now(),
                        audience: message
                            .application_properties
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        token: match &message.body {
                            Body::Value(Value::String(token)) => token.clone(),
                            _ => String::new(),
                        },
                    });
                    state.cbs.clone()
                }
                MANAGEMENT_ADDRESS => {
                    state.management_requests.push(message.clone());
                    state.management.clone()
                }
                address => return Err(not_found(address)),
            }
        };

        let Some(reply) = responder(&message) else {
            return Ok(());
        };
        let reply_to = message.properties.reply_to.clone().unwrap_or_default();
        let route = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reply_to)
            .cloned();
        match route {
            Some(tx) => {
                // A closed reply link just drops the reply.
                let _ = tx.send(Ok(reply));
                Ok(())
            }
            None => Err(not_found(&reply_to)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.close();
        Ok(())
    }
}

struct MockReceiver {
    link: LinkState,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl Receiver for MockReceiver {
    fn address(&self) -> &str {
        &self.link.address
    }

    async fn receive(&mut self) -> Result<Delivery, TransportError> {
        self.link.check_open()?;
        match self.rx.recv().await {
            Some(Ok(message)) => {
                let settlement = MockSettlement {
                    inner: self.link.inner.clone(),
                    address: self.link.address.clone(),
                    message_id: message.properties.message_id.clone(),
                };
                Ok(Delivery::new(message, Box::new(settlement)))
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Closed("link")),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.close();
        Ok(())
    }
}

struct MockSettlement {
    inner: Arc<Inner>,
    address: String,
    message_id: Option<String>,
}

#[async_trait]
impl Settlement for MockSettlement {
    async fn settle(&self, outcome: Outcome) -> Result<(), TransportError> {
        self.inner.state().settlements.push(Settled {
            address: self.address.clone(),
            message_id: self.message_id.clone(),
            outcome,
        });
        Ok(())
    }
}
