use crate::envelope::{topic_matches, Envelope, MessageType};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{ObserverList, SubscriptionId, TaskmeshError, TaskmeshResult};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which half of the protocol a bus instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusRole {
    /// Binds the broadcast and request listeners; publishes and answers requests.
    Coordinator,
    /// Connects to a coordinator; subscribes and sends requests.
    Satellite,
}

impl BusRole {
    /// Wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Satellite => "satellite",
        }
    }
}

/// Bus endpoints and limits.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Interface to bind (coordinator) or connect to (satellite).
    pub host: String,
    /// Broadcast port. 0 binds an ephemeral port (coordinator only).
    pub pub_port: u16,
    /// Request/response port. 0 binds an ephemeral port (coordinator only).
    pub rep_port: u16,
    /// Namespace prepended to every broadcast topic as `prefix/topic`.
    pub topic_prefix: String,
    /// How long `request` waits for a reply.
    pub request_timeout: Duration,
    /// Broadcast messages buffered per subscriber before it starts losing them.
    pub broadcast_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            pub_port: 5555,
            rep_port: 5556,
            topic_prefix: "taskmesh".into(),
            request_timeout: Duration::from_secs(30),
            broadcast_capacity: 1024,
        }
    }
}

/// Answers requests arriving on one topic.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> TaskmeshResult<Value>;
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskmeshResult<Value>> + Send,
{
    async fn handle(&self, payload: Value) -> TaskmeshResult<Value> {
        (self.0)(payload).await
    }
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn RequestHandler>>>>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct CoordinatorSide {
    broadcast: broadcast::Sender<Arc<str>>,
    handlers: HandlerMap,
    pub_addr: SocketAddr,
    rep_addr: SocketAddr,
}

struct SatelliteSide {
    subscribers: Arc<ObserverList<Envelope>>,
    writer: SharedWriter,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
}

enum Side {
    Coordinator(CoordinatorSide),
    Satellite(SatelliteSide),
}

/// Newline-delimited JSON message bus over TCP.
///
/// A coordinator fans published envelopes out to every connected satellite
/// and answers satellite requests by topic. Calling a primitive the role does
/// not own returns [`TaskmeshError::Bus`].
pub struct MessageBus {
    config: BusConfig,
    side: Side,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Start a bus in `role`.
    pub async fn start(role: BusRole, config: BusConfig) -> TaskmeshResult<Self> {
        match role {
            BusRole::Coordinator => Self::coordinator(config).await,
            BusRole::Satellite => Self::satellite(config).await,
        }
    }

    /// Bind both listeners and start accepting connections.
    pub async fn coordinator(config: BusConfig) -> TaskmeshResult<Self> {
        let pub_listener = TcpListener::bind((config.host.as_str(), config.pub_port)).await?;
        let rep_listener = TcpListener::bind((config.host.as_str(), config.rep_port)).await?;
        let pub_addr = pub_listener.local_addr()?;
        let rep_addr = rep_listener.local_addr()?;

        let (broadcast, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let handlers: HandlerMap = Arc::default();
        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(accept_subscribers(
                pub_listener,
                broadcast.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(accept_requesters(
                rep_listener,
                handlers.clone(),
                shutdown.clone(),
            )),
        ];

        info!(pub_addr = %pub_addr, rep_addr = %rep_addr, prefix = %config.topic_prefix, "Bus coordinator started");
        Ok(Self {
            config,
            side: Side::Coordinator(CoordinatorSide {
                broadcast,
                handlers,
                pub_addr,
                rep_addr,
            }),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Connect to a coordinator's broadcast and request ports.
    pub async fn satellite(config: BusConfig) -> TaskmeshResult<Self> {
        let sub_stream = TcpStream::connect((config.host.as_str(), config.pub_port)).await?;
        let req_stream = TcpStream::connect((config.host.as_str(), config.rep_port)).await?;
        let (req_reader, req_writer) = req_stream.into_split();

        let subscribers = Arc::new(ObserverList::new("bus"));
        let pending: PendingMap = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let prefix = format!("{}/", config.topic_prefix);
        let tasks = vec![
            tokio::spawn(read_broadcasts(
                sub_stream,
                prefix,
                subscribers.clone(),
                connected.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(read_replies(
                req_reader,
                pending.clone(),
                connected.clone(),
                shutdown.clone(),
            )),
        ];

        info!(host = %config.host, pub_port = config.pub_port, rep_port = config.rep_port, "Bus satellite connected");
        Ok(Self {
            config,
            side: Side::Satellite(SatelliteSide {
                subscribers,
                writer: Arc::new(tokio::sync::Mutex::new(req_writer)),
                pending,
                connected,
            }),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Whether this end binds or connects.
    pub fn role(&self) -> BusRole {
        match self.side {
            Side::Coordinator(_) => BusRole::Coordinator,
            Side::Satellite(_) => BusRole::Satellite,
        }
    }

    /// Settings this bus was built with.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Bound broadcast address (coordinator only).
    pub fn pub_addr(&self) -> Option<SocketAddr> {
        match &self.side {
            Side::Coordinator(c) => Some(c.pub_addr),
            Side::Satellite(_) => None,
        }
    }

    /// Bound request address (coordinator only).
    pub fn rep_addr(&self) -> Option<SocketAddr> {
        match &self.side {
            Side::Coordinator(c) => Some(c.rep_addr),
            Side::Satellite(_) => None,
        }
    }

    /// Whether the bus is still usable. A satellite turns false once the
    /// coordinator closes either connection.
    pub fn is_connected(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match &self.side {
            Side::Coordinator(_) => true,
            Side::Satellite(s) => s.connected.load(Ordering::SeqCst),
        }
    }

    /// Connected satellites for a coordinator, local callbacks for a satellite.
    pub fn subscriber_count(&self) -> usize {
        match &self.side {
            Side::Coordinator(c) => c.broadcast.receiver_count(),
            Side::Satellite(s) => s.subscribers.len(),
        }
    }

    fn coordinator_side(&self, op: &str) -> TaskmeshResult<&CoordinatorSide> {
        match &self.side {
            Side::Coordinator(c) => Ok(c),
            Side::Satellite(_) => Err(TaskmeshError::Bus(format!(
                "Cannot {op}: not a coordinator"
            ))),
        }
    }

    fn satellite_side(&self, op: &str) -> TaskmeshResult<&SatelliteSide> {
        match &self.side {
            Side::Satellite(s) => Ok(s),
            Side::Coordinator(_) => Err(TaskmeshError::Bus(format!(
                "Cannot {op}: not a satellite"
            ))),
        }
    }

    // --- Coordinator primitives ---

    /// Broadcast `payload` under `prefix/topic`. Returns how many satellites
    /// were connected to receive it.
    pub fn publish(&self, topic: &str, payload: Value) -> TaskmeshResult<usize> {
        let side = self.coordinator_side("publish")?;
        let envelope = Envelope::publish(
            format!("{}/{}", self.config.topic_prefix, topic),
            payload,
        );
        let line: Arc<str> = envelope.to_line()?.into();
        let delivered = side.broadcast.send(line).unwrap_or(0);
        debug!(topic = %envelope.topic, subscribers = delivered, "Bus message published");
        Ok(delivered)
    }

    /// Answer requests on `topic` with `handler`, replacing any previous one.
    pub fn register_handler(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> TaskmeshResult<()> {
        let side = self.coordinator_side("register handler")?;
        let topic = topic.into();
        debug!(topic = %topic, "Bus handler registered");
        side.handlers.write().insert(topic, handler);
        Ok(())
    }

    /// Register an async closure as the request handler for `topic`.
    pub fn register_handler_fn<F, Fut>(&self, topic: impl Into<String>, f: F) -> TaskmeshResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskmeshResult<Value>> + Send + 'static,
    {
        self.register_handler(topic, Arc::new(FnRequestHandler(f)))
    }

    /// Topics with a registered handler, sorted.
    pub fn handler_topics(&self) -> Vec<String> {
        match &self.side {
            Side::Coordinator(c) => {
                let mut topics: Vec<String> = c.handlers.read().keys().cloned().collect();
                topics.sort();
                topics
            }
            Side::Satellite(_) => Vec::new(),
        }
    }

    // --- Satellite primitives ---

    /// Invoke `callback` for every broadcast whose topic (prefix stripped)
    /// matches `pattern`. A trailing `*` matches by prefix.
    pub fn subscribe<F>(&self, pattern: impl Into<String>, callback: F) -> TaskmeshResult<SubscriptionId>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let side = self.satellite_side("subscribe")?;
        let pattern = pattern.into();
        debug!(pattern = %pattern, "Bus subscription added");
        Ok(side.subscribers.subscribe(move |env: &Envelope| {
            if topic_matches(&pattern, &env.topic) {
                callback(env);
            }
        }))
    }

    /// Drop a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match &self.side {
            Side::Satellite(s) => s.subscribers.unsubscribe(id),
            Side::Coordinator(_) => false,
        }
    }

    /// Send a request on `topic` and wait for its reply using the configured timeout.
    pub async fn request(&self, topic: &str, payload: Value) -> TaskmeshResult<Value> {
        self.request_with_timeout(topic, payload, self.config.request_timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for the reply echoing its id.
    /// An error envelope becomes [`TaskmeshError::Bus`] with its message.
    pub async fn request_with_timeout(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> TaskmeshResult<Value> {
        let reply = self
            .roundtrip(Envelope::request(topic, payload), timeout)
            .await?;
        if let Some(message) = reply.error_message() {
            return Err(TaskmeshError::Bus(message.to_string()));
        }
        Ok(reply.payload)
    }

    /// Liveness check answered by the coordinator itself.
    pub async fn ping(&self) -> TaskmeshResult<()> {
        let ping = Envelope::new(MessageType::Heartbeat, "ping", Value::Null);
        self.roundtrip(ping, self.config.request_timeout).await?;
        Ok(())
    }

    async fn roundtrip(&self, envelope: Envelope, timeout: Duration) -> TaskmeshResult<Envelope> {
        let side = self.satellite_side("request")?;
        if !self.is_connected() {
            return Err(TaskmeshError::Bus("Bus connection closed".into()));
        }

        let id = envelope.message_id.clone();
        let (tx, rx) = oneshot::channel();
        side.pending.lock().insert(id.clone(), tx);
        if let Err(e) = send_envelope(&side.writer, &envelope).await {
            side.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TaskmeshError::Bus(
                "Bus connection closed before reply".into(),
            )),
            Err(_) => {
                side.pending.lock().remove(&id);
                warn!(topic = %envelope.topic, request_id = %id, "Bus request timed out");
                Err(TaskmeshError::Timeout(format!(
                    "Request {id} on '{}' timed out",
                    envelope.topic
                )))
            }
        }
    }

    // --- Lifecycle ---

    /// Stop all background tasks and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(role = self.role().as_str(), "Bus stopped");
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn send_envelope(
    writer: &tokio::sync::Mutex<OwnedWriteHalf>,
    envelope: &Envelope,
) -> TaskmeshResult<()> {
    let line = envelope.to_line()?;
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

// --- Coordinator connection handling ---

async fn accept_subscribers(
    listener: TcpListener,
    broadcast: broadcast::Sender<Arc<str>>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Bus subscriber accept failed");
                    continue;
                }
            },
        };
        // Subscribe before spawning so publishes right after accept reach it.
        let rx = broadcast.subscribe();
        tokio::spawn(feed_subscriber(stream, peer, rx, shutdown.clone()));
    }
}

async fn feed_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Arc<str>>,
    shutdown: CancellationToken,
) {
    debug!(peer = %peer, "Bus subscriber connected");
    let (mut reader, mut writer) = stream.into_split();
    let mut discard = [0u8; 64];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut discard) => {
                // Satellites never send on this socket; EOF means they left.
                if matches!(read, Ok(0) | Err(_)) {
                    break;
                }
            }
            msg = rx.recv() => match msg {
                Ok(line) => {
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(peer = %peer, skipped, "Bus subscriber lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!(peer = %peer, "Bus subscriber disconnected");
}

async fn accept_requesters(listener: TcpListener, handlers: HandlerMap, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Bus requester accept failed");
                    continue;
                }
            },
        };
        tokio::spawn(serve_requester(
            stream,
            peer,
            handlers.clone(),
            shutdown.clone(),
        ));
    }
}

async fn serve_requester(
    stream: TcpStream,
    peer: SocketAddr,
    handlers: HandlerMap,
    shutdown: CancellationToken,
) {
    debug!(peer = %peer, "Bus requester connected");
    let (reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Bus requester read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match Envelope::from_line(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping malformed bus request");
                let reply = Envelope::new(MessageType::Error, "", json!({ "error": e.to_string() }));
                let _ = send_envelope(&writer, &reply).await;
                continue;
            }
        };

        // Requests on one connection are answered concurrently and matched by reply_to.
        let handlers = handlers.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let reply = respond(&handlers, request).await;
            if let Err(e) = send_envelope(&writer, &reply).await {
                debug!(error = %e, "Bus reply not delivered");
            }
        });
    }
    debug!(peer = %peer, "Bus requester disconnected");
}

async fn respond(handlers: &HandlerMap, request: Envelope) -> Envelope {
    match request.kind {
        MessageType::Heartbeat => {
            let mut reply = Envelope::response_to(&request, json!({ "alive": true }));
            reply.kind = MessageType::Heartbeat;
            reply
        }
        MessageType::Request => {
            let handler = handlers.read().get(&request.topic).cloned();
            let Some(handler) = handler else {
                return Envelope::error_to(
                    &request,
                    format!("No handler for topic: {}", request.topic),
                );
            };
            let payload = request.payload.clone();
            let outcome = tokio::spawn(async move { handler.handle(payload).await }).await;
            match outcome {
                Ok(Ok(value)) => Envelope::response_to(&request, value),
                Ok(Err(e)) => {
                    error!(topic = %request.topic, error = %e, "Bus request handler failed");
                    Envelope::error_to(&request, e.to_string())
                }
                Err(_) => {
                    error!(topic = %request.topic, "Bus request handler panicked");
                    Envelope::error_to(&request, "Request handler panicked")
                }
            }
        }
        other => Envelope::error_to(&request, format!("Unexpected message type: {other:?}")),
    }
}

// --- Satellite connection handling ---

async fn read_broadcasts(
    stream: TcpStream,
    prefix: String,
    subscribers: Arc<ObserverList<Envelope>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Bus broadcast connection closed by coordinator");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Bus broadcast read failed");
                break;
            }
        };
        let mut envelope = match Envelope::from_line(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed broadcast");
                continue;
            }
        };
        let Some(topic) = envelope.topic.strip_prefix(&prefix) else {
            debug!(topic = %envelope.topic, "Ignoring broadcast from another namespace");
            continue;
        };
        envelope.topic = topic.to_string();
        subscribers.notify(&envelope);
    }
    connected.store(false, Ordering::SeqCst);
}

async fn read_replies(
    reader: OwnedReadHalf,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Bus request connection closed by coordinator");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Bus reply read failed");
                break;
            }
        };
        let reply = match Envelope::from_line(&line) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed reply");
                continue;
            }
        };
        let waiter = reply
            .reply_to
            .as_ref()
            .and_then(|id| pending.lock().remove(id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(reply_to = ?reply.reply_to, "Reply with no waiting request"),
        }
    }
    connected.store(false, Ordering::SeqCst);
    // Dropping the senders fails every outstanding request immediately.
    pending.lock().clear();
}
