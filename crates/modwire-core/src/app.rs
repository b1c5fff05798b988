//! Proxy root and module handles.
//!
//! A [`ModuleProxyApp`] owns every table the runtime needs: local factories
//! and singletons, the remote singleton table, and the server it serves on.
//! [`ModuleProxy`] handles are cheap names into that root.

use crate::channel::Descriptor;
use crate::client::RpcClient;
use crate::module::{CallResult, LocalRegistry, ModuleFactory, ModuleInstance};
use crate::remote::{RemoteInstance, RemoteSingletons};
use crate::router::{self, Target};
use crate::server::{RpcServer, ServerInner};
use crate::{Result, RpcError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

pub(crate) struct AppInner {
    name: String,
    client_only: bool,
    process_interop: AtomicBool,
    local: LocalRegistry,
    remote: RemoteSingletons,
    server: Mutex<Option<Weak<ServerInner>>>,
    modules: Mutex<BTreeSet<String>>,
}

impl AppInner {
    pub(crate) fn remote_singletons(&self) -> &RemoteSingletons {
        &self.remote
    }

    pub(crate) fn is_client_only(&self) -> bool {
        self.client_only
    }

    pub(crate) fn local_instance(&self, module: &str) -> Result<Arc<dyn ModuleInstance>> {
        if self.client_only {
            return Err(RpcError::unavailable(module));
        }
        self.local.instance(module)
    }

    /// Whether calls to `server_id` can skip the wire.
    pub(crate) fn serves_in_process(&self, server_id: &str) -> bool {
        if self.client_only || !self.process_interop.load(Ordering::SeqCst) {
            return false;
        }

        self.server
            .lock()
            .expect("app server lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|server| server.id() == server_id)
    }

    pub(crate) fn detach_server(&self, server: &Arc<ServerInner>) {
        let mut current = self.server.lock().expect("app server lock poisoned");
        let owned = current
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(server)));
        if owned {
            *current = None;
        }
    }
}

/// Root of a module namespace.
#[derive(Clone)]
pub struct ModuleProxyApp {
    inner: Arc<AppInner>,
}

impl fmt::Debug for ModuleProxyApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleProxyApp")
            .field("name", &self.inner.name)
            .field("client_only", &self.inner.client_only)
            .finish()
    }
}

impl ModuleProxyApp {
    /// A root named `name`. With `can_serve == false` the root is
    /// client-only: it cannot serve and never falls back to local instances.
    pub fn new(name: impl Into<String>, can_serve: bool) -> Self {
        Self {
            inner: Arc::new(AppInner {
                name: name.into(),
                client_only: !can_serve,
                process_interop: AtomicBool::new(can_serve),
                local: LocalRegistry::new(),
                remote: RemoteSingletons::new(),
                server: Mutex::new(None),
                modules: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_client_only(&self) -> bool {
        self.inner.client_only
    }

    /// Handle for `<root>.<segments...>`.
    pub fn resolve(&self, segments: &[&str]) -> ModuleProxy {
        let mut name = self.inner.name.clone();
        for segment in segments {
            name.push('.');
            name.push_str(segment);
        }
        ModuleProxy::named(self.inner.clone(), name)
    }

    /// Handle for a dotted path relative to the root, e.g. `"Services.User"`.
    pub fn module(&self, path: &str) -> ModuleProxy {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        self.resolve(&segments)
    }

    /// Module names handed out so far, sorted.
    pub fn modules(&self) -> Vec<String> {
        self.inner
            .modules
            .lock()
            .expect("app modules lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Register the factory building the local singleton of `module`.
    pub fn define<F>(&self, module: &ModuleProxy, factory: F)
    where
        F: Fn() -> Arc<dyn ModuleInstance> + Send + Sync + 'static,
    {
        let factory: ModuleFactory = Arc::new(factory);
        self.inner.local.define(module.name(), factory);
    }

    /// The local singleton of `module`, built on first access.
    pub fn local_instance(&self, module: &ModuleProxy) -> Result<Arc<dyn ModuleInstance>> {
        self.inner.local_instance(module.name())
    }

    /// Open a server bound to this root.
    pub async fn serve(&self, descriptor: impl Into<Descriptor>) -> Result<RpcServer> {
        if self.inner.client_only {
            return Err(RpcError::Usage {
                message: "serve() is not available for client-only module proxy app"
                    .to_string(),
            });
        }

        let server = RpcServer::new(descriptor)?;
        server.open().await?;
        server.attach(&self.inner);
        *self.inner.server.lock().expect("app server lock poisoned") =
            Some(Arc::downgrade(server.inner()));
        Ok(server)
    }

    /// Open a client channel.
    pub async fn connect(&self, descriptor: impl Into<Descriptor>) -> Result<RpcClient> {
        let client = RpcClient::new(descriptor)?;
        client.open().await?;
        Ok(client)
    }

    /// Toggle calling local instances directly when a channel points back at
    /// this root's own server.
    pub fn set_process_interop(&self, enabled: bool) {
        self.inner.process_interop.store(enabled, Ordering::SeqCst);
    }

    pub fn process_interop(&self) -> bool {
        self.inner.process_interop.load(Ordering::SeqCst)
    }

    /// Server ids currently registered for `module`.
    pub fn server_ids(&self, module: &ModuleProxy) -> Vec<String> {
        self.inner.remote.server_ids(module.name())
    }
}

/// Handle for one dotted module name under a root.
#[derive(Clone)]
pub struct ModuleProxy {
    name: String,
    app: Arc<AppInner>,
}

impl fmt::Debug for ModuleProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleProxy").field(&self.name).finish()
    }
}

impl PartialEq for ModuleProxy {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.app, &other.app)
    }
}

impl ModuleProxy {
    fn named(app: Arc<AppInner>, name: String) -> Self {
        app.modules
            .lock()
            .expect("app modules lock poisoned")
            .insert(name.clone());
        Self { name, app }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn app(&self) -> &Arc<AppInner> {
        &self.app
    }

    /// Handle for `<self>.<segment>`.
    pub fn child(&self, segment: &str) -> ModuleProxy {
        ModuleProxy::named(self.app.clone(), format!("{}.{}", self.name, segment))
    }

    /// Call `method` on whichever instance the router picks.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<CallResult> {
        self.invoke_on(None, method, args).await
    }

    /// Like [`invoke`](Self::invoke), preferring the server named `route`.
    ///
    /// The hint is only ever taken from `route`, never from `args`: every
    /// argument is forwarded to the method untouched, so a trailing string
    /// argument cannot redirect the call.
    pub async fn invoke_on(
        &self,
        route: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<CallResult> {
        match router::route(&self.app, &self.name, route)? {
            Target::Remote(instance) => instance.invoke(method, args).await,
            Target::Local(instance) => {
                debug!("Calling local {}.{}()", self.name, method);
                let invocation = instance.invoke(method, args).await?;
                CallResult::from_invocation(invocation).await
            }
        }
    }

    /// The remote instance the router would pick, without calling it.
    pub fn instance(&self, route: Option<&str>) -> Result<Arc<RemoteInstance>> {
        let candidates = self.app.remote_singletons().snapshot(&self.name);
        router::select_instance(&self.name, &candidates, route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Invocation;
    use async_trait::async_trait;
    use serde_json::json;

    struct Greeter;

    #[async_trait]
    impl ModuleInstance for Greeter {
        async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Invocation> {
            match method {
                "greet" => Ok(json!(format!("hello {}", args[0].as_str().unwrap_or("")))
                    .into()),
                _ => Err(RpcError::undefined_method("App.Greeter", method)),
            }
        }
    }

    #[test]
    fn test_resolve_builds_dotted_names() {
        let app = ModuleProxyApp::new("App", true);
        assert_eq!(app.resolve(&["Services", "User"]).name(), "App.Services.User");
        assert_eq!(app.module("Services.User"), app.resolve(&["Services", "User"]));
        assert_eq!(app.module("Services").child("Log").name(), "App.Services.Log");
        assert_eq!(
            app.modules(),
            vec![
                "App.Services".to_string(),
                "App.Services.Log".to_string(),
                "App.Services.User".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_local_fallback() {
        let app = ModuleProxyApp::new("App", true);
        let greeter = app.module("Greeter");
        app.define(&greeter, || Arc::new(Greeter));

        let value = greeter
            .invoke("greet", vec![json!("world")])
            .await
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(value, json!("hello world"));

        let err = greeter.invoke("wave", Vec::new()).await.unwrap_err();
        assert_eq!(err.error_name(), "BadMethodCallException");
        assert_eq!(err.to_string(), "Call to undefined method App.Greeter::wave()");
    }

    #[tokio::test]
    async fn test_local_singleton_is_cached() {
        let app = ModuleProxyApp::new("App", true);
        let greeter = app.module("Greeter");
        app.define(&greeter, || Arc::new(Greeter));

        let first = app.local_instance(&greeter).unwrap();
        let second = app.local_instance(&greeter).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_client_only_root() {
        let app = ModuleProxyApp::new("App", false);
        let greeter = app.module("Greeter");
        app.define(&greeter, || Arc::new(Greeter));

        let err = greeter.invoke("greet", Vec::new()).await.unwrap_err();
        assert!(err.is_service_unavailable());
        assert!(!app.process_interop());

        let err = app.serve(0u16).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "serve() is not available for client-only module proxy app"
        );
    }

    #[tokio::test]
    async fn test_undefined_module_is_unavailable() {
        let app = ModuleProxyApp::new("App", true);
        let err = app.module("Nowhere").invoke("get", Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Service App.Nowhere is not available");
        assert!(app.module("Nowhere").instance(None).is_err());
    }
}
