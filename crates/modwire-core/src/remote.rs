//! Remote instances: one per (module, server) pair a client has registered.

use crate::app::AppInner;
use crate::client::ClientInner;
use crate::codec::EventKind;
use crate::generator::GeneratorProxy;
use crate::module::CallResult;
use crate::{Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Stand-in for a module served by one remote server.
pub struct RemoteInstance {
    module: String,
    app: Weak<AppInner>,
    client: Weak<ClientInner>,
    ready: AtomicBool,
}

impl fmt::Debug for RemoteInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteInstance")
            .field("module", &self.module)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl RemoteInstance {
    pub(crate) fn new(
        module: &str,
        app: Weak<AppInner>,
        client: Weak<ClientInner>,
        ready: bool,
    ) -> Self {
        Self {
            module: module.to_string(),
            app,
            client,
            ready: AtomicBool::new(ready),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// 1 while the owning channel is connected, 0 otherwise.
    pub fn ready_state(&self) -> u8 {
        u8::from(self.is_ready())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Current server id of the owning channel.
    pub fn server_id(&self) -> Option<String> {
        self.client.upgrade().map(|client| client.server_id())
    }

    /// Call `method` on the module behind this instance.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<CallResult> {
        let client = self
            .client
            .upgrade()
            .ok_or_else(|| RpcError::unavailable(&self.module))?;

        if let Some(app) = self.app.upgrade() {
            if app.serves_in_process(&client.server_id()) {
                debug!("Calling {}.{}() in process", self.module, method);
                let instance = app.local_instance(&self.module)?;
                let invocation = instance.invoke(method, args).await?;
                return CallResult::from_invocation(invocation).await;
            }
        }

        if !client.is_connected() {
            return Err(RpcError::unavailable(&self.module));
        }

        let (task_id, event, value) = client
            .call(EventKind::Invoke, None, &self.module, method, args)
            .await?;

        match event {
            EventKind::Return => Ok(CallResult::Value(value)),
            EventKind::Invoke => Ok(CallResult::Generator(
                GeneratorProxy::remote(client, &self.module, method, task_id).await?,
            )),
            other => Err(RpcError::Protocol {
                message: format!("unexpected {:?} reply to {}.{}()", other, self.module, method),
            }),
        }
    }
}

/// Module name → server id → remote instance.
#[derive(Default)]
pub struct RemoteSingletons {
    table: Mutex<HashMap<String, HashMap<String, Arc<RemoteInstance>>>>,
}

impl RemoteSingletons {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an instance is already keyed under `server_id`.
    pub(crate) fn insert(
        &self,
        module: &str,
        server_id: &str,
        instance: Arc<RemoteInstance>,
    ) -> Arc<RemoteInstance> {
        self.table
            .lock()
            .expect("remote singletons lock poisoned")
            .entry(module.to_string())
            .or_default()
            .entry(server_id.to_string())
            .or_insert(instance)
            .clone()
    }

    /// Remove the entry under `server_id` if it is `owner`.
    ///
    /// Another channel to the same server may hold the slot; its entry stays.
    pub(crate) fn remove(
        &self,
        module: &str,
        server_id: &str,
        owner: &Arc<RemoteInstance>,
    ) -> Option<Arc<RemoteInstance>> {
        let mut table = self.table.lock().expect("remote singletons lock poisoned");
        let instances = table.get_mut(module)?;
        if !instances
            .get(server_id)
            .is_some_and(|current| Arc::ptr_eq(current, owner))
        {
            return None;
        }
        let removed = instances.remove(server_id);
        if instances.is_empty() {
            table.remove(module);
        }
        removed
    }

    /// Re-key `owner` after its server announced a different id.
    ///
    /// An entry already under `new_id` is kept.
    pub(crate) fn rename(
        &self,
        module: &str,
        old_id: &str,
        new_id: &str,
        owner: &Arc<RemoteInstance>,
    ) {
        let mut table = self.table.lock().expect("remote singletons lock poisoned");
        let Some(instances) = table.get_mut(module) else {
            return;
        };
        if !instances
            .get(old_id)
            .is_some_and(|current| Arc::ptr_eq(current, owner))
        {
            return;
        }
        if let Some(instance) = instances.remove(old_id) {
            instances.entry(new_id.to_string()).or_insert(instance);
        }
    }

    /// Instances of `module`, keyed by server id.
    pub fn snapshot(&self, module: &str) -> HashMap<String, Arc<RemoteInstance>> {
        self.table
            .lock()
            .expect("remote singletons lock poisoned")
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    /// Server ids currently registered for `module`.
    pub fn server_ids(&self, module: &str) -> Vec<String> {
        let mut ids: Vec<_> = self.snapshot(module).into_keys().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.table
            .lock()
            .expect("remote singletons lock poisoned")
            .is_empty()
    }
}
