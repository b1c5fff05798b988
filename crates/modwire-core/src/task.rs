//! Request/response correlation.
//!
//! Every outgoing call allocates a numeric id from an [`IdGenerator`] and
//! parks a [`Task`] in the [`TaskRegistry`] until the receive loop settles it
//! or its deadline passes. The registry entry is removed on whichever happens
//! first, so a task fires at most once.

use crate::codec::EventKind;
use crate::config::ClientDefaults;
use crate::{Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Settlement delivered to a waiting task.
pub type TaskOutcome = std::result::Result<(EventKind, Value), RpcError>;

struct IdState {
    next: u64,
    offset: u64,
    max: u64,
    wrap: bool,
    exhausted: bool,
}

/// Auto-incrementing id source.
///
/// Ids run from `offset` to `max` inclusive, then either wrap back to
/// `offset` or stop producing.
pub struct IdGenerator {
    state: Mutex<IdState>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::with_range(
            ClientDefaults::TASK_ID_OFFSET,
            ClientDefaults::TASK_ID_MAX,
            ClientDefaults::TASK_ID_WRAP,
        )
    }

    pub fn with_range(offset: u64, max: u64, wrap: bool) -> Self {
        Self {
            state: Mutex::new(IdState {
                next: offset,
                offset,
                max: max.max(offset),
                wrap,
                exhausted: false,
            }),
        }
    }

    /// Next id, or `None` once a non-wrapping generator is exhausted.
    pub fn next(&self) -> Option<u64> {
        let mut state = self.state.lock().expect("id generator lock poisoned");
        if state.exhausted {
            return None;
        }

        let id = state.next;
        if id >= state.max {
            if state.wrap {
                state.next = state.offset;
            } else {
                state.exhausted = true;
            }
        } else {
            state.next = id + 1;
        }
        Some(id)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct RegistryInner {
    ids: IdGenerator,
    pending: Mutex<HashMap<u64, oneshot::Sender<TaskOutcome>>>,
}

/// Pending tasks of one client channel, keyed by task id.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a custom id range.
    pub fn with_ids(ids: IdGenerator) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ids,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate a fresh id and register a task for it.
    pub fn create(&self, module: &str, method: &str, timeout: Duration) -> Result<Task> {
        let id = self.inner.ids.next().ok_or_else(|| RpcError::Usage {
            message: "task id space exhausted".to_string(),
        })?;
        Ok(self.create_with_id(id, module, method, timeout))
    }

    /// Register a task under an existing id (generator steps reuse theirs).
    pub fn create_with_id(&self, id: u64, module: &str, method: &str, timeout: Duration) -> Task {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("task registry lock poisoned")
            .insert(id, tx);

        Task {
            id,
            module: module.to_string(),
            method: method.to_string(),
            timeout,
            receiver: rx,
            registry: self.clone(),
        }
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<TaskOutcome>> {
        self.inner
            .pending
            .lock()
            .expect("task registry lock poisoned")
            .remove(&id)
    }

    /// Settle a task with a value; false if no such task is pending.
    pub fn resolve(&self, id: u64, event: EventKind, value: Value) -> bool {
        match self.take(id) {
            Some(tx) => tx.send(Ok((event, value))).is_ok(),
            None => {
                debug!("No pending task {} for {:?} frame", id, event);
                false
            }
        }
    }

    /// Settle a task with an error; false if no such task is pending.
    pub fn reject(&self, id: u64, err: RpcError) -> bool {
        match self.take(id) {
            Some(tx) => tx.send(Err(err)).is_ok(),
            None => {
                debug!("No pending task {} to reject", id);
                false
            }
        }
    }

    /// Reject every pending task, returning how many were settled.
    pub fn reject_all(&self, make_error: impl Fn() -> RpcError) -> usize {
        let drained: Vec<_> = self
            .inner
            .pending
            .lock()
            .expect("task registry lock poisoned")
            .drain()
            .collect();

        drained
            .into_iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(_, tx)| tx.send(Err(make_error())))
            .filter(|sent| sent.is_ok())
            .count()
    }

    pub fn remove(&self, id: u64) -> bool {
        self.take(id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .pending
            .lock()
            .expect("task registry lock poisoned")
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .expect("task registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single pending call.
pub struct Task {
    id: u64,
    module: String,
    method: String,
    timeout: Duration,
    receiver: oneshot::Receiver<TaskOutcome>,
    registry: TaskRegistry,
}

impl Task {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for settlement, failing with a timeout error at the deadline.
    pub async fn wait(self) -> Result<(EventKind, Value)> {
        match tokio::time::timeout(self.timeout, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Connection {
                message: format!("task {} was dropped before settling", self.id),
            }),
            Err(_) => {
                self.registry.remove(self.id);
                Err(RpcError::Timeout {
                    module: self.module,
                    method: self.method,
                    duration: self.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_generator_wraps() {
        let ids = IdGenerator::with_range(5, 7, true);
        let produced: Vec<_> = (0..5).map(|_| ids.next().unwrap()).collect();
        assert_eq!(produced, vec![5, 6, 7, 5, 6]);
    }

    #[test]
    fn test_id_generator_halts() {
        let ids = IdGenerator::with_range(1, 2, false);
        assert_eq!(ids.next(), Some(1));
        assert_eq!(ids.next(), Some(2));
        assert_eq!(ids.next(), None);
        assert_eq!(ids.next(), None);
    }

    #[tokio::test]
    async fn test_resolve_settles_once() {
        let registry = TaskRegistry::new();
        let task = registry
            .create("App.Config", "get", Duration::from_secs(1))
            .unwrap();
        let id = task.id();

        assert!(registry.resolve(id, EventKind::Return, json!("value")));
        assert!(!registry.resolve(id, EventKind::Return, json!("again")));

        let (event, value) = task.wait().await.unwrap();
        assert_eq!(event, EventKind::Return);
        assert_eq!(value, json!("value"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let registry = TaskRegistry::new();
        let task = registry
            .create("App.Config", "get", Duration::from_secs(1))
            .unwrap();

        assert!(registry.reject(task.id(), RpcError::raise("TypeError", "bad")));
        let err = task.wait().await.unwrap_err();
        assert_eq!(err.error_name(), "TypeError");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_task() {
        let registry = TaskRegistry::new();
        let task = registry
            .create("App.Services.Detail", "triggerTimeout", Duration::from_millis(1000))
            .unwrap();
        let id = task.id();
        assert!(registry.contains(id));

        let err = task.wait().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "App.Services.Detail.triggerTimeout() timeout after 1000 ms"
        );
        assert!(!registry.contains(id));
        assert!(!registry.resolve(id, EventKind::Return, Value::Null));
    }

    #[tokio::test]
    async fn test_reject_all() {
        let registry = TaskRegistry::new();
        let first = registry.create("A", "a", Duration::from_secs(5)).unwrap();
        let second = registry.create("B", "b", Duration::from_secs(5)).unwrap();

        let rejected = registry.reject_all(|| RpcError::ChannelClosed {
            server_id: "ws://127.0.0.1:80/".to_string(),
        });
        assert_eq!(rejected, 2);

        for task in [first, second] {
            assert!(matches!(
                task.wait().await,
                Err(RpcError::ChannelClosed { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_step_reuses_id() {
        let registry = TaskRegistry::new();
        let task = registry.create_with_id(42, "Gen", "run", Duration::from_secs(1));
        assert_eq!(task.id(), 42);
        assert!(registry.resolve(42, EventKind::Yield, json!({"done": false})));
        assert_eq!(task.wait().await.unwrap().0, EventKind::Yield);
    }
}
