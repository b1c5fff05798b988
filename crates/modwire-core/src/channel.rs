//! Connection descriptors shared by clients and servers.
//!
//! A channel is described by a bare port, a URL string or a structured
//! [`ChannelOptions`] set. All three resolve into a [`ChannelConfig`].

use crate::codec::Codec;
use crate::config::{ChannelDefaults, ClientDefaults, ServerLimits};
use crate::{Result, RpcError};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use url::Url;

/// Transport flavour of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ws,
    Wss,
    WsUnix,
}

impl Protocol {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim_end_matches(':') {
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            "ws+unix" => Ok(Protocol::WsUnix),
            other => Err(RpcError::Configuration {
                message: format!("unsupported protocol '{}:'", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws:",
            Protocol::Wss => "wss:",
            Protocol::WsUnix => "ws+unix:",
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Protocol::WsUnix)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS material, handed in ready-made.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Required by servers listening on `wss:`.
    pub server: Option<Arc<rustls::ServerConfig>>,
    /// Optional for clients; webpki roots are used when unset.
    pub client: Option<Arc<rustls::ClientConfig>>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

/// Structured channel options. Every field is optional.
///
/// When `url` is set it is parsed first and the other fields override it.
/// Durations are given in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelOptions {
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub pathname: Option<String>,
    pub id: Option<String>,
    pub secret: Option<String>,
    pub codec: Option<String>,
    pub timeout: Option<u64>,
    pub ping_timeout: Option<u64>,
    pub ping_interval: Option<u64>,
    pub server_id: Option<String>,
    pub reconnect_backoff: Option<u64>,
    pub task_id_offset: Option<u64>,
    pub task_id_max: Option<u64>,
    pub task_id_wrap: Option<bool>,
    #[serde(skip)]
    pub tls: TlsOptions,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = Some(pathname.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval.as_millis() as u64);
        self
    }

    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = Some(backoff.as_millis() as u64);
        self
    }

    /// Range of task ids; once `max` is used they restart at `offset`, or
    /// new calls fail when `wrap` is false.
    pub fn task_ids(mut self, offset: u64, max: u64, wrap: bool) -> Self {
        self.task_id_offset = Some(offset);
        self.task_id_max = Some(max);
        self.task_id_wrap = Some(wrap);
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }
}

/// Any of the accepted descriptor shapes.
#[derive(Debug, Clone)]
pub enum Descriptor {
    Port { port: u16, hostname: Option<String> },
    Url(String),
    Options(ChannelOptions),
}

impl From<u16> for Descriptor {
    fn from(port: u16) -> Self {
        Descriptor::Port {
            port,
            hostname: None,
        }
    }
}

impl From<(u16, &str)> for Descriptor {
    fn from((port, hostname): (u16, &str)) -> Self {
        Descriptor::Port {
            port,
            hostname: Some(hostname.to_string()),
        }
    }
}

impl From<&str> for Descriptor {
    fn from(url: &str) -> Self {
        Descriptor::Url(url.to_string())
    }
}

impl From<String> for Descriptor {
    fn from(url: String) -> Self {
        Descriptor::Url(url)
    }
}

impl From<&String> for Descriptor {
    fn from(url: &String) -> Self {
        Descriptor::Url(url.clone())
    }
}

impl From<ChannelOptions> for Descriptor {
    fn from(options: ChannelOptions) -> Self {
        Descriptor::Options(options)
    }
}

/// Resolved channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub pathname: String,
    pub id: String,
    pub secret: String,
    pub codec: Codec,
    pub tls: TlsOptions,
    pub timeout: Duration,
    pub ping_timeout: Duration,
    pub ping_interval: Duration,
    pub server_id: Option<String>,
    pub reconnect_backoff: Duration,
    pub task_id_offset: u64,
    pub task_id_max: u64,
    pub task_id_wrap: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Ws,
            hostname: ChannelDefaults::HOSTNAME.to_string(),
            port: ChannelDefaults::PORT,
            pathname: ChannelDefaults::PATHNAME.to_string(),
            id: String::new(),
            secret: String::new(),
            codec: Codec::Json,
            tls: TlsOptions::default(),
            timeout: ClientDefaults::CALL_TIMEOUT,
            ping_timeout: ClientDefaults::PING_TIMEOUT,
            ping_interval: ClientDefaults::PING_INTERVAL,
            server_id: None,
            reconnect_backoff: ClientDefaults::RECONNECT_BACKOFF,
            task_id_offset: ClientDefaults::TASK_ID_OFFSET,
            task_id_max: ClientDefaults::TASK_ID_MAX,
            task_id_wrap: ClientDefaults::TASK_ID_WRAP,
        }
    }
}

impl ChannelConfig {
    /// Resolve any descriptor shape into a configuration.
    pub fn parse(descriptor: impl Into<Descriptor>) -> Result<Self> {
        match descriptor.into() {
            Descriptor::Port { port, hostname } => {
                let mut config = Self {
                    port,
                    ..Self::default()
                };
                if let Some(hostname) = hostname.filter(|h| !h.is_empty()) {
                    config.hostname = hostname;
                }
                Ok(config)
            }
            Descriptor::Url(url) => Self::from_url(&url),
            Descriptor::Options(options) => Self::from_options(options),
        }
    }

    fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("ws:") || url.starts_with("wss:") {
            Self::from_tcp_url(url)
        } else {
            Self::from_unix_url(url)
        }
    }

    fn from_tcp_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;
        let protocol = Protocol::parse(url.scheme())?;
        let hostname = url.host_str().unwrap_or_default().to_string();
        if hostname.is_empty() {
            return Err(RpcError::Configuration {
                message: format!("'{}' has no hostname", raw),
            });
        }

        let mut config = Self {
            protocol,
            hostname,
            port: url.port_or_known_default().unwrap_or(ChannelDefaults::PORT),
            pathname: decode_path(url.path()),
            ..Self::default()
        };
        if config.pathname.is_empty() {
            config.pathname = ChannelDefaults::PATHNAME.to_string();
        }
        config.apply_query(&url)?;
        Ok(config)
    }

    fn from_unix_url(raw: &str) -> Result<Self> {
        let mut source = raw.to_string();
        let mut is_absolute = raw.starts_with('/');

        if is_windows_drive_path(raw) {
            source = format!("{}{}", Protocol::WsUnix.as_str(), raw);
            is_absolute = true;
        }

        let base = Url::parse(ChannelDefaults::UNIX_BASE_URL)?;
        let url = base.join(&source)?;
        let protocol = Protocol::parse(url.scheme())?;
        if !protocol.is_unix() {
            return Err(RpcError::Configuration {
                message: format!("unsupported protocol '{}:'", url.scheme()),
            });
        }

        let pathname = decode_path(url.path());
        let is_absolute = is_absolute || source.starts_with(Protocol::WsUnix.as_str());

        let mut config = Self {
            protocol,
            hostname: String::new(),
            port: 0,
            pathname: resolve_unix_path(&pathname, is_absolute)?,
            ..Self::default()
        };
        config.apply_query(&url)?;
        Ok(config)
    }

    fn apply_query(&mut self, url: &Url) -> Result<()> {
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "id" => self.id = value.into_owned(),
                "secret" => self.secret = value.into_owned(),
                "codec" => self.codec = Codec::parse(&value)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn from_options(options: ChannelOptions) -> Result<Self> {
        let mut config = match options.url.as_deref() {
            Some(url) => Self::from_url(url)?,
            None => Self::default(),
        };

        if let Some(protocol) = options.protocol.as_deref() {
            config.protocol = Protocol::parse(protocol)?;
        }
        if let Some(hostname) = options.hostname {
            config.hostname = hostname;
        }
        if let Some(port) = options.port {
            config.port = port;
        }
        if let Some(pathname) = options.pathname {
            config.pathname = pathname;
        }
        if let Some(id) = options.id {
            config.id = id;
        }
        if let Some(secret) = options.secret {
            config.secret = secret;
        }
        if let Some(codec) = options.codec.as_deref() {
            config.codec = Codec::parse(codec)?;
        }
        if let Some(ms) = options.timeout {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = options.ping_timeout {
            config.ping_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = options.ping_interval {
            config.ping_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = options.reconnect_backoff {
            config.reconnect_backoff = Duration::from_millis(ms);
        }
        if let Some(offset) = options.task_id_offset {
            config.task_id_offset = offset;
        }
        if let Some(max) = options.task_id_max {
            config.task_id_max = max;
        }
        if let Some(wrap) = options.task_id_wrap {
            config.task_id_wrap = wrap;
        }
        if config.task_id_max < config.task_id_offset {
            return Err(RpcError::Configuration {
                message: format!(
                    "task id range {}..={} is empty",
                    config.task_id_offset, config.task_id_max
                ),
            });
        }
        config.server_id = options.server_id.filter(|id| !id.is_empty());
        config.tls = options.tls;

        if config.protocol.is_unix() {
            let is_absolute = config.pathname.starts_with('/');
            config.pathname = resolve_unix_path(&config.pathname, is_absolute)?;
            config.hostname.clear();
            config.port = 0;
        } else if config.hostname.is_empty() {
            return Err(RpcError::Configuration {
                message: "a hostname is required for TCP channels".to_string(),
            });
        }

        Ok(config)
    }

    /// Data source name: `ws+unix:<path>` or `<protocol>//<host>:<port><path>`.
    pub fn dsn(&self) -> String {
        if self.protocol.is_unix() {
            format!("{}{}", self.protocol, self.pathname)
        } else {
            format!(
                "{}//{}:{}{}",
                self.protocol, self.hostname, self.port, self.pathname
            )
        }
    }

    /// URL of the client's upgrade request.
    pub(crate) fn request_url(&self, id: &str) -> String {
        let mut url = match self.protocol {
            Protocol::WsUnix => "ws://localhost/".to_string(),
            protocol => format!(
                "{}//{}:{}{}",
                protocol, self.hostname, self.port, self.pathname
            ),
        };

        url.push_str("?id=");
        url.push_str(&urlencoding::encode(id));
        if !self.secret.is_empty() {
            url.push_str("&secret=");
            url.push_str(&urlencoding::encode(&self.secret));
        }
        url
    }
}

/// WebSocket settings shared by both ends.
pub(crate) fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(ServerLimits::MAX_MESSAGE_SIZE);
    config
}

/// Whether a transport error just means the peer went away.
pub(crate) fn is_disconnect(err: &tungstenite::Error) -> bool {
    use std::io::ErrorKind;
    use tungstenite::error::ProtocolError;

    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// Drain queued messages into the socket. Stops after a close frame.
pub(crate) async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("Write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

fn is_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn decode_path(path: &str) -> String {
    urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

#[cfg(unix)]
fn resolve_unix_path(pathname: &str, is_absolute: bool) -> Result<String> {
    if is_absolute {
        if pathname.is_empty() || pathname == "/" {
            return Err(RpcError::Configuration {
                message: "IPC requires a pathname".to_string(),
            });
        }
        return Ok(pathname.to_string());
    }

    let relative = pathname.trim_start_matches('/');
    if relative.is_empty() {
        return Err(RpcError::Configuration {
            message: "IPC requires a pathname".to_string(),
        });
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(relative).to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn resolve_unix_path(_pathname: &str, _is_absolute: bool) -> Result<String> {
    Err(RpcError::UnsupportedPlatform {
        message: "IPC on this platform is currently not supported".to_string(),
    })
}

/// Handler for errors raised outside a direct call chain.
pub type ErrorHandler = Arc<dyn Fn(RpcError) + Send + Sync>;

/// Replaceable error sink of a channel.
#[derive(Clone)]
pub struct ErrorHook {
    handler: Arc<RwLock<ErrorHandler>>,
}

impl ErrorHook {
    pub fn new() -> Self {
        let handler: ErrorHandler = Arc::new(|err: RpcError| {
            tracing::error!("Unhandled channel error: {}", err);
        });
        Self {
            handler: Arc::new(RwLock::new(handler)),
        }
    }

    pub fn set<F>(&self, handler: F)
    where
        F: Fn(RpcError) + Send + Sync + 'static,
    {
        *self.handler.write().expect("error hook lock poisoned") = Arc::new(handler);
    }

    /// Deliver an error to the current handler on a separate task.
    pub fn emit(&self, err: RpcError) {
        let handler = self
            .handler
            .read()
            .expect("error hook lock poisoned")
            .clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { handler(err) });
            }
            Err(_) => handler(err),
        }
    }
}

impl Default for ErrorHook {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorHook")
    }
}
