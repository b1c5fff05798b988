//! WebSocket server channel.
//!
//! Listens on TCP (optionally TLS) or a Unix socket, authenticates the
//! upgrade request, and dispatches INVOKE and generator-step frames to the
//! local instances of registered modules.
//!
//! # Thread Safety
//!
//! Each connection runs its own receive loop and writer task; every call is
//! handled on a spawned task so slow methods never block the loop. Generator
//! sessions belong to their connection and are dropped with it.

use crate::app::{AppInner, ModuleProxy};
use crate::channel::{
    is_disconnect, websocket_config, write_loop, ChannelConfig, Descriptor, ErrorHook, Protocol,
};
use crate::codec::{ClientFrame, Codec, EventKind, ServerFrame};
use crate::config::ServerLimits;
use crate::generator::Generator;
use crate::module::Invocation;
use crate::{Result, RpcError};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

type Session = Arc<tokio::sync::Mutex<Box<dyn Generator>>>;
type Sessions = Arc<Mutex<HashMap<u64, Session>>>;

struct ClientEntry {
    id: String,
    outgoing: mpsc::UnboundedSender<Message>,
}

struct ListenerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Listener {
    Tcp(TcpListener, Option<TlsAcceptor>),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

enum Accepted {
    Tcp(TcpStream, SocketAddr, Option<TlsAcceptor>),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Listener::Tcp(listener, acceptor) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Accepted::Tcp(stream, peer, acceptor.clone()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted::Unix(stream))
            }
        }
    }
}

pub(crate) struct ServerInner {
    config: RwLock<ChannelConfig>,
    id: RwLock<String>,
    registry: Mutex<HashMap<String, ModuleProxy>>,
    clients: Mutex<HashMap<u64, ClientEntry>>,
    next_connection: AtomicU64,
    active_connections: AtomicUsize,
    listener: Mutex<Option<ListenerHandle>>,
    app: Mutex<Option<Weak<AppInner>>>,
    errors: ErrorHook,
}

/// Server side of an RPC channel. Cheap to clone.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("id", &self.inner.id())
            .field("dsn", &self.dsn())
            .field("clients", &self.clients().len())
            .finish()
    }
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

fn push(outgoing: &mpsc::UnboundedSender<Message>, codec: Codec, frame: ServerFrame) {
    match frame.encode(codec) {
        Ok(message) => {
            let _ = outgoing.send(message);
        }
        Err(e) => error!("Failed to encode {:?}: {}", frame, e),
    }
}

fn throw(task_id: u64, err: &RpcError) -> ServerFrame {
    ServerFrame::Settle {
        event: EventKind::Throw,
        task_id,
        payload: err.to_payload().to_value(),
    }
}

impl RpcServer {
    /// Create an unopened server for the given descriptor.
    pub fn new(descriptor: impl Into<Descriptor>) -> Result<Self> {
        let config = ChannelConfig::parse(descriptor)?;
        let id = if config.id.is_empty() {
            config.dsn()
        } else {
            config.id.clone()
        };

        Ok(Self {
            inner: Arc::new(ServerInner {
                config: RwLock::new(config),
                id: RwLock::new(id),
                registry: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                active_connections: AtomicUsize::new(0),
                listener: Mutex::new(None),
                app: Mutex::new(None),
                errors: ErrorHook::new(),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }

    pub(crate) fn attach(&self, app: &Arc<AppInner>) {
        *self.inner.app.lock().expect("server app lock poisoned") = Some(Arc::downgrade(app));
    }

    /// Bind the listener and start accepting in the background.
    pub async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Err(RpcError::Usage {
                message: format!("Server {} is already open", self.id()),
            });
        }

        let config = self.config();
        let listener = match config.protocol {
            Protocol::WsUnix => Self::bind_unix(&config.pathname).await?,
            Protocol::Ws | Protocol::Wss => {
                let acceptor = match config.protocol {
                    Protocol::Wss => Some(TlsAcceptor::from(config.tls.server.clone().ok_or_else(
                        || RpcError::Configuration {
                            message: "wss: requires a TLS server config".to_string(),
                        },
                    )?)),
                    _ => None,
                };
                let listener =
                    TcpListener::bind((config.hostname.as_str(), config.port)).await?;
                let port = listener.local_addr()?.port();
                self.inner.update_port(port);
                Listener::Tcp(listener, acceptor)
            }
        };

        info!("RPC server listening on {}", self.dsn());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            self.inner.clone(),
            listener,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        *self.inner.listener.lock().expect("listener lock poisoned") = Some(ListenerHandle {
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task,
        });
        Ok(())
    }

    #[cfg(unix)]
    async fn bind_unix(pathname: &str) -> Result<Listener> {
        let path = std::path::Path::new(pathname);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        // Most likely left behind by a server that didn't shut down cleanly.
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed stale socket {}", pathname),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Listener::Unix(tokio::net::UnixListener::bind(path)?))
    }

    #[cfg(not(unix))]
    async fn bind_unix(_pathname: &str) -> Result<Listener> {
        Err(RpcError::UnsupportedPlatform {
            message: "IPC on this platform is currently not supported".to_string(),
        })
    }

    /// Stop listening, drop every connection and its sessions.
    pub async fn close(&self) {
        let handle = self
            .inner
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take();

        if let Some(mut handle) = handle {
            if let Some(tx) = handle.shutdown_tx.take() {
                let _ = tx.send(());
            }
            let _ = handle.conn_shutdown_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(1), &mut handle.task)
                .await
                .is_err()
            {
                handle.task.abort();
            }
        }

        self.inner
            .clients
            .lock()
            .expect("server clients lock poisoned")
            .clear();

        let config = self.config();
        if config.protocol.is_unix() {
            match tokio::fs::remove_file(&config.pathname).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket {}: {}", config.pathname, e),
            }
        }

        let app = self
            .inner
            .app
            .lock()
            .expect("server app lock poisoned")
            .take()
            .and_then(|app| app.upgrade());
        if let Some(app) = app {
            app.detach_server(&self.inner);
        }

        info!("RPC server {} closed", self.id());
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .listener
            .lock()
            .expect("listener lock poisoned")
            .is_some()
    }

    /// Serve `module` on this channel. Registering twice is a no-op.
    pub fn register(&self, module: &ModuleProxy) {
        self.inner
            .registry
            .lock()
            .expect("server registry lock poisoned")
            .entry(module.name().to_string())
            .or_insert_with(|| module.clone());
    }

    /// Send `data` to subscribers of `topic`.
    ///
    /// With an empty `clients` list every connection receives it, otherwise
    /// only connections whose client id is listed. Returns whether anything
    /// was sent.
    pub fn publish(&self, topic: &str, data: Value, clients: &[&str]) -> bool {
        let codec = self.config().codec;
        let connections = self
            .inner
            .clients
            .lock()
            .expect("server clients lock poisoned");

        let mut sent = false;
        for entry in connections.values() {
            if clients.is_empty() || clients.contains(&entry.id.as_str()) {
                push(
                    &entry.outgoing,
                    codec,
                    ServerFrame::Publish {
                        topic: topic.to_string(),
                        data: data.clone(),
                    },
                );
                sent = true;
            }
        }
        sent
    }

    /// Ids of the connected clients.
    pub fn clients(&self) -> Vec<String> {
        self.inner
            .clients
            .lock()
            .expect("server clients lock poisoned")
            .values()
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn id(&self) -> String {
        self.inner.id()
    }

    pub fn dsn(&self) -> String {
        self.config().dsn()
    }

    /// Bound port; 0 for Unix sockets.
    pub fn port(&self) -> u16 {
        self.config().port
    }

    pub fn config(&self) -> ChannelConfig {
        self.inner
            .config
            .read()
            .expect("server config lock poisoned")
            .clone()
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(RpcError) + Send + Sync + 'static,
    {
        self.inner.errors.set(handler);
    }
}

impl ServerInner {
    pub(crate) fn id(&self) -> String {
        self.id.read().expect("server id lock poisoned").clone()
    }

    /// Record the bound port; a default id follows the DSN.
    fn update_port(&self, port: u16) {
        let mut config = self.config.write().expect("server config lock poisoned");
        let previous = config.dsn();
        config.port = port;

        let mut id = self.id.write().expect("server id lock poisoned");
        if *id == previous {
            *id = config.dsn();
        }
    }

    fn codec(&self) -> Codec {
        self.config.read().expect("server config lock poisoned").codec
    }

    /// Check the upgrade request; returns the client id on success.
    fn authenticate(&self, request: &Request) -> std::result::Result<String, StatusCode> {
        let config = self.config.read().expect("server config lock poisoned");

        if !config.protocol.is_unix() && request.uri().path() != config.pathname {
            return Err(StatusCode::NOT_FOUND);
        }

        let query = request.uri().query().unwrap_or_default();
        let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        let client_id = params.get("id").filter(|id| !id.is_empty());
        let secret = params.get("secret").map(String::as_str).unwrap_or_default();

        match client_id {
            Some(id) if config.secret.is_empty() || secret == config.secret => Ok(id.clone()),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    }

    async fn invoke(&self, module: &str, method: &str, args: Vec<Value>) -> Result<Invocation> {
        let proxy = self
            .registry
            .lock()
            .expect("server registry lock poisoned")
            .get(module)
            .cloned()
            .ok_or_else(|| RpcError::unavailable(module))?;

        let instance = proxy.app().local_instance(module)?;
        instance.invoke(method, args).await
    }
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: Listener,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("RPC server {} shutting down", inner.id());
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(accepted) => {
                        let current = inner.active_connections.load(Ordering::Relaxed);
                        if current >= ServerLimits::MAX_CONNECTIONS {
                            warn!(
                                "Rejecting connection: at max capacity ({})",
                                ServerLimits::MAX_CONNECTIONS
                            );
                            continue;
                        }

                        inner.active_connections.fetch_add(1, Ordering::Relaxed);
                        let inner = inner.clone();
                        let shutdown = conn_shutdown_rx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = accept_connection(&inner, accepted, shutdown).await {
                                debug!("Connection ended: {}", e);
                            }
                            inner.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("RPC accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn accept_connection(
    inner: &Arc<ServerInner>,
    accepted: Accepted,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match accepted {
        Accepted::Tcp(stream, peer, None) => {
            debug!("Connection from {}", peer);
            upgrade(inner, stream, shutdown).await
        }
        Accepted::Tcp(stream, peer, Some(acceptor)) => {
            debug!("TLS connection from {}", peer);
            let stream = acceptor.accept(stream).await?;
            upgrade(inner, stream, shutdown).await
        }
        #[cfg(unix)]
        Accepted::Unix(stream) => {
            debug!("Connection on Unix socket");
            upgrade(inner, stream, shutdown).await
        }
    }
}

async fn upgrade<S>(
    inner: &Arc<ServerInner>,
    stream: S,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client_id = None;
    let callback = |request: &Request, response: Response| {
        match inner.authenticate(request) {
            Ok(id) => {
                client_id = Some(id);
                Ok(response)
            }
            Err(status) => {
                debug!("Rejected upgrade to {} with {}", request.uri(), status);
                Err(reject(status))
            }
        }
    };

    let ws =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(websocket_config()))
            .await?;

    let Some(client_id) = client_id else {
        return Ok(());
    };
    serve_connection(inner.clone(), ws, client_id, shutdown).await;
    Ok(())
}

async fn serve_connection<S>(
    inner: Arc<ServerInner>,
    ws: WebSocketStream<S>,
    client_id: String,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = inner.codec();
    let (sink, mut stream) = ws.split();
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outgoing_rx));

    let conn_id = inner.next_connection.fetch_add(1, Ordering::Relaxed);
    inner
        .clients
        .lock()
        .expect("server clients lock poisoned")
        .insert(
            conn_id,
            ClientEntry {
                id: client_id.clone(),
                outgoing: outgoing.clone(),
            },
        );
    info!("Client {} connected", client_id);

    push(
        &outgoing,
        codec,
        ServerFrame::Connect {
            server_id: inner.id(),
        },
    );

    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = outgoing.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "".into(),
                })));
                break;
            }
            next = stream.next() => match next {
                Some(Ok(message)) => handle_message(&inner, &sessions, &outgoing, codec, message),
                Some(Err(e)) => {
                    if !is_disconnect(&e) {
                        inner.errors.emit(e.into());
                    }
                    break;
                }
                None => break,
            }
        }
    }

    inner
        .clients
        .lock()
        .expect("server clients lock poisoned")
        .remove(&conn_id);
    sessions.lock().expect("sessions lock poisoned").clear();
    let _ = outgoing.send(Message::Close(None));
    drop(outgoing);
    let _ = writer.await;
    info!("Client {} disconnected", client_id);
}

fn handle_message(
    inner: &Arc<ServerInner>,
    sessions: &Sessions,
    outgoing: &mpsc::UnboundedSender<Message>,
    codec: Codec,
    message: Message,
) {
    let frame = match ClientFrame::decode(codec, &message) {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            debug!("Ignoring frame: {}", e);
            return;
        }
    };

    match frame {
        ClientFrame::Call {
            event: EventKind::Invoke,
            task_id,
            module,
            method,
            args,
        } => {
            tokio::spawn(handle_invoke(
                inner.clone(),
                sessions.clone(),
                outgoing.clone(),
                codec,
                task_id,
                module,
                method,
                args,
            ));
        }
        ClientFrame::Call {
            event,
            task_id,
            module,
            method,
            args,
        } => {
            tokio::spawn(handle_step(
                sessions.clone(),
                outgoing.clone(),
                codec,
                event,
                task_id,
                module,
                method,
                args,
            ));
        }
        ClientFrame::Ping(stamp) => push(outgoing, codec, ServerFrame::Pong(stamp)),
        ClientFrame::Pong(_) => {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_invoke(
    inner: Arc<ServerInner>,
    sessions: Sessions,
    outgoing: mpsc::UnboundedSender<Message>,
    codec: Codec,
    task_id: u64,
    module: String,
    method: String,
    args: Vec<Value>,
) {
    let reply = match inner.invoke(&module, &method, args).await {
        Ok(Invocation::Value(value)) => ServerFrame::Settle {
            event: EventKind::Return,
            task_id,
            payload: value,
        },
        Ok(Invocation::Generator(generator)) => {
            sessions
                .lock()
                .expect("sessions lock poisoned")
                .insert(task_id, Arc::new(tokio::sync::Mutex::new(generator)));
            ServerFrame::Settle {
                event: EventKind::Invoke,
                task_id,
                payload: Value::Null,
            }
        }
        Err(e) => {
            debug!("{}.{}() failed: {}", module, method, e);
            throw(task_id, &e)
        }
    };
    push(&outgoing, codec, reply);
}

#[allow(clippy::too_many_arguments)]
async fn handle_step(
    sessions: Sessions,
    outgoing: mpsc::UnboundedSender<Message>,
    codec: Codec,
    event: EventKind,
    task_id: u64,
    module: String,
    method: String,
    args: Vec<Value>,
) {
    let session = sessions
        .lock()
        .expect("sessions lock poisoned")
        .get(&task_id)
        .cloned();

    let Some(session) = session else {
        let err = RpcError::raise("Error", format!("Failed to call {}.{}()", module, method));
        push(&outgoing, codec, throw(task_id, &err));
        return;
    };

    let outcome = {
        let mut generator = session.lock().await;
        match event {
            EventKind::Yield => generator.resume(args.into_iter().next()).await,
            EventKind::Throw => {
                let err = RpcError::from_payload(args.first().unwrap_or(&Value::Null));
                generator.throw(err).await
            }
            EventKind::Return => Ok(crate::generator::GeneratorState::Complete(
                args.into_iter().next().unwrap_or(Value::Null),
            )),
            other => Err(RpcError::Protocol {
                message: format!("unexpected {:?} step", other),
            }),
        }
    };

    let reply = match outcome {
        Ok(state) => {
            let (event, payload) = state.to_payload();
            if event == EventKind::Return {
                sessions
                    .lock()
                    .expect("sessions lock poisoned")
                    .remove(&task_id);
            }
            ServerFrame::Settle {
                event,
                task_id,
                payload,
            }
        }
        Err(e) => {
            sessions
                .lock()
                .expect("sessions lock poisoned")
                .remove(&task_id);
            throw(task_id, &e)
        }
    };
    push(&outgoing, codec, reply);
}
