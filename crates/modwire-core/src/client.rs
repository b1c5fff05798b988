//! WebSocket client channel.
//!
//! A client connects to one server, waits for the CONNECT handshake frame and
//! then runs a receive loop that settles pending tasks, dispatches published
//! topics and answers pings. Lost transports are retried in the background
//! until the channel is closed.
//!
//! # Lifecycle
//!
//! ```text
//! Initiated → Connecting → Connected → Connecting (transport lost)
//!                                    → Closed (terminal)
//! ```

use crate::app::{AppInner, ModuleProxy};
use crate::channel::{
    is_disconnect, websocket_config, write_loop, ChannelConfig, Descriptor, ErrorHook, Protocol,
};
use crate::codec::{ClientFrame, EventKind, ServerFrame};
use crate::config::ClientDefaults;
use crate::remote::RemoteInstance;
use crate::task::{IdGenerator, TaskRegistry};
use crate::{BoxError, Result, RpcError};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, WebSocketStream};
use tracing::{debug, info, warn};

/// Handler bound to a published topic.
pub type TopicHandler = Arc<dyn Fn(Value) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Wrap a closure as a [`TopicHandler`].
pub fn topic_handler<F>(handler: F) -> TopicHandler
where
    F: Fn(Value) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Connection state of a client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initiated,
    Connecting,
    Connected,
    Closed,
}

struct Registration {
    app: Weak<AppInner>,
    instance: Arc<RemoteInstance>,
}

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    terminate: watch::Sender<bool>,
    writer: JoinHandle<()>,
}

pub(crate) struct ClientInner {
    config: ChannelConfig,
    id: String,
    server_id: Mutex<String>,
    state: Mutex<ClientState>,
    tasks: TaskRegistry,
    connection: Mutex<Option<Connection>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    pong: Notify,
    topics: Mutex<HashMap<String, Vec<TopicHandler>>>,
    registry: Mutex<HashMap<String, Registration>>,
    errors: ErrorHook,
}

/// Client side of an RPC channel. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("id", &self.inner.id)
            .field("server_id", &self.inner.server_id())
            .field("state", &self.inner.state())
            .finish()
    }
}

fn random_id(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

impl RpcClient {
    /// Create an unopened client for the given descriptor.
    pub fn new(descriptor: impl Into<Descriptor>) -> Result<Self> {
        let config = ChannelConfig::parse(descriptor)?;
        let id = if config.id.is_empty() {
            random_id(ClientDefaults::CLIENT_ID_LENGTH)
        } else {
            config.id.clone()
        };
        let server_id = config.server_id.clone().unwrap_or_else(|| config.dsn());
        let ids = IdGenerator::with_range(
            config.task_id_offset,
            config.task_id_max,
            config.task_id_wrap,
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                id,
                server_id: Mutex::new(server_id),
                state: Mutex::new(ClientState::Initiated),
                tasks: TaskRegistry::with_ids(ids),
                connection: Mutex::new(None),
                keepalive: Mutex::new(None),
                pong: Notify::new(),
                topics: Mutex::new(HashMap::new()),
                registry: Mutex::new(HashMap::new()),
                errors: ErrorHook::new(),
            }),
        })
    }

    /// Connect and complete the handshake.
    pub async fn open(&self) -> Result<()> {
        self.inner.open(false).await
    }

    /// Close the channel for good. Pending calls fail with `ChannelClosed`.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Make `module` callable through this channel.
    pub fn register(&self, module: &ModuleProxy) {
        self.inner.register(module)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Id announced by the server, or the DSN before the first handshake.
    pub fn server_id(&self) -> String {
        self.inner.server_id()
    }

    pub fn dsn(&self) -> String {
        self.inner.config.dsn()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ClientState::Connecting
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of calls waiting for a reply.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Bind `handler` to `topic`.
    pub fn subscribe(&self, topic: &str, handler: TopicHandler) -> &Self {
        self.inner
            .topics
            .lock()
            .expect("topics lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        self
    }

    /// Remove one handler of `topic`, or every handler when `handler` is `None`.
    pub fn unsubscribe(&self, topic: &str, handler: Option<&TopicHandler>) -> bool {
        let mut topics = self.inner.topics.lock().expect("topics lock poisoned");
        match handler {
            None => topics.remove(topic).is_some(),
            Some(handler) => {
                let Some(handlers) = topics.get_mut(topic) else {
                    return false;
                };
                let before = handlers.len();
                handlers.retain(|h| !Arc::ptr_eq(h, handler));
                let removed = handlers.len() != before;
                if handlers.is_empty() {
                    topics.remove(topic);
                }
                removed
            }
        }
    }

    /// Number of handlers bound to `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .expect("topics lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Replace the handler for errors raised outside a call chain.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(RpcError) + Send + Sync + 'static,
    {
        self.inner.errors.set(handler);
    }
}

impl ClientInner {
    pub(crate) fn server_id(&self) -> String {
        self.server_id
            .lock()
            .expect("server id lock poisoned")
            .clone()
    }

    fn state(&self) -> ClientState {
        *self.state.lock().expect("client state lock poisoned")
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    fn is_closed(&self) -> bool {
        self.state() == ClientState::Closed
    }

    fn connect_failure(&self, cause: impl fmt::Display) -> RpcError {
        debug!("Connecting to {} failed: {}", self.server_id(), cause);
        RpcError::Connection {
            message: format!("Cannot connect to {}", self.server_id()),
        }
    }

    async fn open(self: &Arc<Self>, reconnect: bool) -> Result<()> {
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            match *state {
                ClientState::Closed => {
                    return Err(RpcError::Usage {
                        message: format!(
                            "Cannot reconnect to {} after closing the channel",
                            self.server_id()
                        ),
                    })
                }
                ClientState::Initiated => {}
                _ if !reconnect => {
                    return Err(RpcError::Usage {
                        message: format!("Channel to {} is already open", self.server_id()),
                    })
                }
                _ => {}
            }
            *state = ClientState::Connecting;
        }

        let url = self.config.request_url(&self.id);
        let result = match tokio::time::timeout(self.config.timeout, self.connect(&url)).await {
            Ok(result) => result,
            Err(_) => Err(self.connect_failure("handshake timed out")),
        };

        if result.is_err() && !reconnect {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if *state == ClientState::Connecting {
                *state = ClientState::Closed;
            }
        }
        result
    }

    async fn connect(self: &Arc<Self>, url: &str) -> Result<()> {
        match self.config.protocol {
            Protocol::WsUnix => self.connect_unix(url).await,
            Protocol::Ws | Protocol::Wss => {
                let tcp = TcpStream::connect((self.config.hostname.as_str(), self.config.port))
                    .await
                    .map_err(|e| self.connect_failure(e))?;
                let connector = self.config.tls.client.clone().map(Connector::Rustls);
                let (ws, _) = tokio_tungstenite::client_async_tls_with_config(
                    url,
                    tcp,
                    Some(websocket_config()),
                    connector,
                )
                .await
                .map_err(|e| self.connect_failure(e))?;
                self.handshake(ws).await
            }
        }
    }

    #[cfg(unix)]
    async fn connect_unix(self: &Arc<Self>, url: &str) -> Result<()> {
        let stream = tokio::net::UnixStream::connect(&self.config.pathname)
            .await
            .map_err(|e| self.connect_failure(e))?;
        let (ws, _) =
            tokio_tungstenite::client_async_with_config(url, stream, Some(websocket_config()))
                .await
                .map_err(|e| self.connect_failure(e))?;
        self.handshake(ws).await
    }

    #[cfg(not(unix))]
    async fn connect_unix(self: &Arc<Self>, _url: &str) -> Result<()> {
        Err(RpcError::UnsupportedPlatform {
            message: "IPC on this platform is currently not supported".to_string(),
        })
    }

    async fn handshake<S>(self: &Arc<Self>, ws: WebSocketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        let announced = match stream.next().await {
            Some(Ok(message)) => match ServerFrame::decode(self.config.codec, &message) {
                Ok(Some(ServerFrame::Connect { server_id })) => Some(server_id),
                _ => None,
            },
            _ => None,
        };

        let Some(server_id) = announced else {
            // Half-open transport; the server never confirmed.
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            return Err(self.connect_failure("no CONNECT frame"));
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (terminate, terminate_rx) = watch::channel(false);
        let writer = tokio::spawn(write_loop(sink, outgoing_rx));
        *self.connection.lock().expect("connection lock poisoned") = Some(Connection {
            outgoing,
            terminate,
            writer,
        });

        let accepted = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if *state == ClientState::Closed {
                false
            } else {
                *state = ClientState::Connected;
                true
            }
        };
        if !accepted {
            self.drop_connection(CloseCode::Normal);
            return Err(RpcError::ChannelClosed {
                server_id: self.server_id(),
            });
        }

        self.adopt_server_id(&server_id);
        self.resume();
        tokio::spawn(read_loop(self.clone(), stream, terminate_rx));

        info!("Connected to {} as {}", server_id, self.id);
        Ok(())
    }

    /// Re-key this channel's instances under the id the server announced.
    fn adopt_server_id(&self, announced: &str) {
        let previous = {
            let mut server_id = self.server_id.lock().expect("server id lock poisoned");
            if *server_id == announced {
                return;
            }
            std::mem::replace(&mut *server_id, announced.to_string())
        };

        debug!("Server {} announced itself as {}", previous, announced);
        let registry = self.registry.lock().expect("client registry lock poisoned");
        for (module, registration) in registry.iter() {
            if let Some(app) = registration.app.upgrade() {
                app.remote_singletons()
                    .rename(module, &previous, announced, &registration.instance);
            }
        }
    }

    fn set_ready(&self, ready: bool) {
        let registry = self.registry.lock().expect("client registry lock poisoned");
        for registration in registry.values() {
            registration.instance.set_ready(ready);
        }
    }

    /// Take traffic again and start pinging.
    fn resume(self: &Arc<Self>) {
        self.set_ready(true);

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(self),
            self.config.ping_interval,
            self.config.ping_timeout,
        ));
        if let Some(previous) = self
            .keepalive
            .lock()
            .expect("keepalive lock poisoned")
            .replace(keepalive)
        {
            previous.abort();
        }
    }

    /// Redirect traffic to other instances and stop pinging.
    fn pause(&self) {
        self.set_ready(false);

        if let Some(keepalive) = self.keepalive.lock().expect("keepalive lock poisoned").take() {
            keepalive.abort();
        }
    }

    /// Send a close frame and stop the receive loop.
    fn drop_connection(&self, code: CloseCode) -> Option<JoinHandle<()>> {
        let connection = self
            .connection
            .lock()
            .expect("connection lock poisoned")
            .take()?;

        let _ = connection.outgoing.send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })));
        let _ = connection.terminate.send(true);
        Some(connection.writer)
    }

    fn transport_closed(self: &Arc<Self>) {
        let reconnect = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if *state == ClientState::Connected {
                *state = ClientState::Connecting;
                true
            } else {
                false
            }
        };

        self.connection
            .lock()
            .expect("connection lock poisoned")
            .take();

        if reconnect {
            warn!("Connection to {} lost, reconnecting", self.server_id());
            self.pause();
            spawn_reconnect(self.clone());
        }
    }

    async fn close(&self) {
        let was_closed = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            std::mem::replace(&mut *state, ClientState::Closed) == ClientState::Closed
        };
        if was_closed {
            return;
        }

        self.pause();
        if let Some(writer) = self.drop_connection(CloseCode::Normal) {
            // Give the close frame a moment to go out.
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        }

        let server_id = self.server_id();
        {
            let registry = self.registry.lock().expect("client registry lock poisoned");
            for (module, registration) in registry.iter() {
                if let Some(app) = registration.app.upgrade() {
                    app.remote_singletons()
                        .remove(module, &server_id, &registration.instance);
                }
            }
        }

        let rejected = self.tasks.reject_all(|| RpcError::ChannelClosed {
            server_id: server_id.clone(),
        });
        info!("Channel to {} closed ({} pending calls rejected)", server_id, rejected);
    }

    fn register(self: &Arc<Self>, module: &ModuleProxy) {
        let mut registry = self.registry.lock().expect("client registry lock poisoned");
        if registry.contains_key(module.name()) {
            return;
        }

        let app = module.app();
        let instance = Arc::new(RemoteInstance::new(
            module.name(),
            Arc::downgrade(app),
            Arc::downgrade(self),
            self.is_connected(),
        ));
        // The table keeps the first instance per server; this channel tracks its own.
        app.remote_singletons()
            .insert(module.name(), &self.server_id(), instance.clone());

        debug!("Registered {} on channel to {}", module.name(), self.server_id());
        registry.insert(
            module.name().to_string(),
            Registration {
                app: Arc::downgrade(app),
                instance,
            },
        );
    }

    /// Best-effort send; dropped unless connected.
    fn send(&self, frame: ClientFrame) {
        if !self.is_connected() {
            debug!("Channel to {} is not connected, dropping frame", self.server_id());
            return;
        }

        let message = match frame.encode(self.config.codec) {
            Ok(message) => message,
            Err(e) => {
                self.errors.emit(e);
                return;
            }
        };

        if let Some(connection) = self
            .connection
            .lock()
            .expect("connection lock poisoned")
            .as_ref()
        {
            let _ = connection.outgoing.send(message);
        }
    }

    pub(crate) fn send_step(
        &self,
        event: EventKind,
        task_id: u64,
        module: &str,
        method: &str,
        args: Vec<Value>,
    ) {
        self.send(ClientFrame::Call {
            event,
            task_id,
            module: module.to_string(),
            method: method.to_string(),
            args,
        });
    }

    /// Register a task, send the frame and wait for the reply.
    ///
    /// Generator steps pass their existing task id.
    pub(crate) async fn call(
        &self,
        event: EventKind,
        task_id: Option<u64>,
        module: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(u64, EventKind, Value)> {
        let task = match task_id {
            Some(id) => self
                .tasks
                .create_with_id(id, module, method, self.config.timeout),
            None => self.tasks.create(module, method, self.config.timeout)?,
        };
        let id = task.id();

        self.send_step(event, id, module, method, args);
        let (event, value) = task.wait().await?;
        Ok((id, event, value))
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Pong(_) => {
                self.pong.notify_waiters();
                return;
            }
            Message::Ping(_) | Message::Close(_) | Message::Frame(_) => return,
            Message::Text(_) | Message::Binary(_) => {}
        }

        let frame = match ServerFrame::decode(self.config.codec, &message) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!("Ignoring frame from {}: {}", self.server_id(), e);
                return;
            }
        };

        match frame {
            ServerFrame::Settle {
                event: EventKind::Throw,
                task_id,
                payload,
            } => {
                self.tasks.reject(task_id, RpcError::from_payload(&payload));
            }
            ServerFrame::Settle {
                event,
                task_id,
                payload,
            } => {
                self.tasks.resolve(task_id, event, payload);
            }
            ServerFrame::Publish { topic, data } => self.dispatch_topic(&topic, data),
            ServerFrame::Ping(stamp) => self.send(ClientFrame::Pong(stamp)),
            ServerFrame::Pong(_) => self.pong.notify_waiters(),
            ServerFrame::Connect { server_id } => {
                debug!("Unexpected CONNECT from {} after handshake", server_id);
            }
        }
    }

    /// Run every handler of `topic` on its own task.
    fn dispatch_topic(&self, topic: &str, data: Value) {
        let handlers = self
            .topics
            .lock()
            .expect("topics lock poisoned")
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            let data = data.clone();
            let topic = topic.to_string();
            let errors = self.errors.clone();

            tokio::spawn(async move {
                let message = match tokio::spawn(async move { handler(data) }).await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => e.to_string(),
                    Err(e) if e.is_panic() => "handler panicked".to_string(),
                    Err(e) => e.to_string(),
                };
                errors.emit(RpcError::Subscriber { topic, message });
            });
        }
    }
}

async fn read_loop<S>(
    inner: Arc<ClientInner>,
    mut stream: SplitStream<WebSocketStream<S>>,
    mut terminate: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = terminate.changed() => break,
            next = stream.next() => match next {
                Some(Ok(message)) => inner.handle_message(message),
                Some(Err(e)) => {
                    if !inner.is_closed() && !is_disconnect(&e) {
                        inner.errors.emit(e.into());
                    }
                    break;
                }
                None => break,
            }
        }
    }

    debug!("Receive loop for {} ended", inner.server_id());
    inner.transport_closed();
}

async fn keepalive_loop(client: Weak<ClientInner>, interval: Duration, ping_timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = client.upgrade() else {
            break;
        };
        if !inner.is_connected() {
            break;
        }

        let pong = inner.pong.notified();
        tokio::pin!(pong);
        pong.as_mut().enable();
        inner.send(ClientFrame::Ping(json!(chrono::Utc::now().timestamp_millis())));

        if tokio::time::timeout(ping_timeout, pong).await.is_err() {
            warn!(
                "No PONG from {} within {} ms, dropping the transport",
                inner.server_id(),
                ping_timeout.as_millis()
            );
            inner.drop_connection(CloseCode::Protocol);
            break;
        }
    }
}

fn spawn_reconnect(inner: Arc<ClientInner>) {
    tokio::spawn(async move {
        loop {
            if inner.is_closed() {
                break;
            }
            match inner.open(true).await {
                Ok(()) => {
                    info!("Reconnected to {}", inner.server_id());
                    break;
                }
                Err(e) => debug!("Reconnecting to {} failed: {}", inner.server_id(), e),
            }
            if inner.is_closed() {
                break;
            }
            tokio::time::sleep(inner.config.reconnect_backoff).await;
        }
    });
}
