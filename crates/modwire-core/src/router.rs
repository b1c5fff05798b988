//! Singleton routing: picks which instance serves a call to a module.

use crate::app::AppInner;
use crate::module::ModuleInstance;
use crate::remote::RemoteInstance;
use crate::{Result, RpcError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a call goes.
pub enum Target {
    Remote(Arc<RemoteInstance>),
    Local(Arc<dyn ModuleInstance>),
}

/// Choose among the remote instances registered for `module`.
///
/// A hint naming a known server id wins regardless of readiness. Otherwise
/// one of the ready instances is picked uniformly at random.
pub fn select_instance(
    module: &str,
    candidates: &HashMap<String, Arc<RemoteInstance>>,
    hint: Option<&str>,
) -> Result<Arc<RemoteInstance>> {
    if let Some(instance) = hint.and_then(|server_id| candidates.get(server_id)) {
        return Ok(instance.clone());
    }

    let ready: Vec<_> = candidates.values().filter(|i| i.is_ready()).collect();
    match ready.len() {
        0 => Err(RpcError::unavailable(module)),
        1 => Ok(ready[0].clone()),
        n => Ok(ready[rand::rng().random_range(0..n)].clone()),
    }
}

/// Route a call to `module` through the root's tables.
///
/// Modules nobody registered remotely fall back to the local singleton,
/// unless the root is client-only.
pub(crate) fn route(app: &AppInner, module: &str, hint: Option<&str>) -> Result<Target> {
    let candidates = app.remote_singletons().snapshot(module);

    if !candidates.is_empty() {
        return select_instance(module, &candidates, hint).map(Target::Remote);
    }

    if app.is_client_only() {
        return Err(RpcError::unavailable(module));
    }

    app.local_instance(module).map(Target::Local)
}
