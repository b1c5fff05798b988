//! Modwire - module-proxy RPC over WebSocket channels.
//!
//! Modules are named by dotted paths under a [`ModuleProxyApp`] root. A call
//! on a [`ModuleProxy`] is routed to one of the servers that registered the
//! module, or to the local singleton when nobody did. Methods may return a
//! plain value or a generator that the caller steps through remotely.
//!
//! # Example
//!
//! ```rust,ignore
//! use modwire::{ModuleProxyApp, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let app = ModuleProxyApp::new("App", false);
//!     let config = app.module("Services.Config");
//!
//!     let client = app.connect("ws://127.0.0.1:4000/").await?;
//!     client.register(&config);
//!
//!     let value = config.invoke("get", vec![json!("theme")]).await?.value()?;
//!     println!("theme = {}", value);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod generator;
pub mod module;
pub mod remote;
pub mod router;
pub mod server;
pub mod task;

// Re-export commonly used types
pub use app::{ModuleProxy, ModuleProxyApp};
pub use channel::{ChannelConfig, ChannelOptions, Descriptor, Protocol, TlsOptions};
pub use client::{topic_handler, ClientState, RpcClient, TopicHandler};
pub use codec::{ClientFrame, Codec, EventKind, ServerFrame};
pub use error::{ErrorPayload, RemoteError, RemoteErrorKind, Result, RpcError};
pub use generator::{
    Generator, GeneratorProxy, GeneratorState, GeneratorStatus, IterGenerator, KeyedGenerator,
};
pub use module::{CallResult, Invocation, ModuleInstance};
pub use remote::RemoteInstance;
pub use server::RpcServer;

/// Boxed error returned by topic handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
