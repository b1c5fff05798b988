//! Streaming calls.
//!
//! A served method may hand back a [`Generator`] instead of a value. The
//! server keeps it as a session and advances it one step per YIELD / THROW /
//! RETURN frame; the caller drives it through a [`GeneratorProxy`].

use crate::client::ClientInner;
use crate::codec::EventKind;
use crate::{Result, RpcError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Outcome of one generator step.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorState {
    /// The generator produced a value. `key` is optional; callers number
    /// unkeyed values from 0.
    Yielded { key: Option<Value>, value: Value },
    /// The generator finished with a return value.
    Complete(Value),
}

impl GeneratorState {
    pub fn yielded(value: Value) -> Self {
        GeneratorState::Yielded { key: None, value }
    }

    /// Wire payload of a step reply.
    pub(crate) fn to_payload(&self) -> (EventKind, Value) {
        match self {
            GeneratorState::Yielded { key: Some(key), value } => (
                EventKind::Yield,
                json!({ "done": false, "key": key, "value": value }),
            ),
            GeneratorState::Yielded { key: None, value } => {
                (EventKind::Yield, json!({ "done": false, "value": value }))
            }
            GeneratorState::Complete(value) => {
                (EventKind::Return, json!({ "done": true, "value": value }))
            }
        }
    }
}

/// A resumable computation served to remote callers.
#[async_trait]
pub trait Generator: Send {
    /// Advance to the next value. `input` is the value passed by `send()`.
    async fn resume(&mut self, input: Option<Value>) -> Result<GeneratorState>;

    /// Inject an error at the current suspension point.
    ///
    /// The default does not catch it. Implementations that do may yield
    /// again or complete.
    async fn throw(&mut self, err: RpcError) -> Result<GeneratorState> {
        Err(err)
    }
}

/// Generator over a plain iterator of values.
pub struct IterGenerator<I> {
    items: I,
    returns: Value,
}

impl<I> IterGenerator<I>
where
    I: Iterator<Item = Value> + Send,
{
    pub fn new(items: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            items: items.into_iter(),
            returns: Value::Null,
        }
    }

    /// Value returned once the iterator is exhausted.
    pub fn returning(mut self, value: Value) -> Self {
        self.returns = value;
        self
    }
}

#[async_trait]
impl<I> Generator for IterGenerator<I>
where
    I: Iterator<Item = Value> + Send,
{
    async fn resume(&mut self, _input: Option<Value>) -> Result<GeneratorState> {
        Ok(match self.items.next() {
            Some(value) => GeneratorState::yielded(value),
            None => GeneratorState::Complete(std::mem::take(&mut self.returns)),
        })
    }
}

/// Generator over `(key, value)` pairs.
pub struct KeyedGenerator<I> {
    entries: I,
    returns: Value,
}

impl<I> KeyedGenerator<I>
where
    I: Iterator<Item = (Value, Value)> + Send,
{
    pub fn new(entries: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            entries: entries.into_iter(),
            returns: Value::Null,
        }
    }

    pub fn returning(mut self, value: Value) -> Self {
        self.returns = value;
        self
    }
}

#[async_trait]
impl<I> Generator for KeyedGenerator<I>
where
    I: Iterator<Item = (Value, Value)> + Send,
{
    async fn resume(&mut self, _input: Option<Value>) -> Result<GeneratorState> {
        Ok(match self.entries.next() {
            Some((key, value)) => GeneratorState::Yielded {
                key: Some(key),
                value,
            },
            None => GeneratorState::Complete(std::mem::take(&mut self.returns)),
        })
    }
}

/// Lifecycle of a [`GeneratorProxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    Pending,
    Resolved,
    Rejected,
    Closed,
}

enum Driver {
    Remote {
        client: Arc<ClientInner>,
        module: String,
        method: String,
        task_id: u64,
    },
    Local(Box<dyn Generator>),
}

enum Step {
    Yield(Option<Value>),
    Throw(RpcError),
    Return(Value),
}

/// Caller-side handle of a streaming call.
///
/// Construction already runs the first step, so `current()` holds the first
/// value right away.
pub struct GeneratorProxy {
    driver: Driver,
    status: GeneratorStatus,
    counter: u64,
    key: Option<Value>,
    current: Option<Value>,
    returned: Option<Value>,
}

impl fmt::Debug for GeneratorProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorProxy")
            .field("status", &self.status)
            .field("key", &self.key)
            .field("current", &self.current)
            .finish()
    }
}

impl GeneratorProxy {
    pub(crate) async fn remote(
        client: Arc<ClientInner>,
        module: &str,
        method: &str,
        task_id: u64,
    ) -> Result<Self> {
        Self::primed(Driver::Remote {
            client,
            module: module.to_string(),
            method: method.to_string(),
            task_id,
        })
        .await
    }

    /// Wrap an in-process generator.
    pub async fn local(generator: Box<dyn Generator>) -> Result<Self> {
        Self::primed(Driver::Local(generator)).await
    }

    async fn primed(driver: Driver) -> Result<Self> {
        let mut proxy = Self {
            driver,
            status: GeneratorStatus::Pending,
            counter: 0,
            key: None,
            current: None,
            returned: None,
        };
        proxy.step(Step::Yield(None)).await?;
        Ok(proxy)
    }

    pub fn status(&self) -> GeneratorStatus {
        self.status
    }

    /// Whether there is a current value.
    pub fn valid(&self) -> bool {
        self.status == GeneratorStatus::Pending
    }

    pub fn current(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// Advance and return the new current value, `None` once finished.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        self.step(Step::Yield(None)).await
    }

    /// Advance, handing `value` to the generator.
    pub async fn send(&mut self, value: Value) -> Result<Option<Value>> {
        self.step(Step::Yield(Some(value))).await
    }

    /// Raise `err` inside the generator.
    pub async fn throw(&mut self, err: RpcError) -> Result<Option<Value>> {
        self.step(Step::Throw(err)).await
    }

    /// Finish the generator early with `value`.
    pub async fn return_value(&mut self, value: Value) -> Result<Value> {
        if self.status != GeneratorStatus::Pending {
            return Ok(value);
        }
        self.step(Step::Return(value.clone())).await?;
        Ok(self.returned.clone().unwrap_or(value))
    }

    /// Stop iterating and release the server-side session.
    pub async fn close(&mut self) {
        if self.status == GeneratorStatus::Pending {
            if let Driver::Remote {
                client,
                module,
                method,
                task_id,
            } = &self.driver
            {
                // The reply has no waiting task and is dropped by the client.
                client.send_step(EventKind::Return, *task_id, module, method, vec![Value::Null]);
            }
        }
        self.status = GeneratorStatus::Closed;
        self.key = None;
        self.current = None;
    }

    /// Return value of a finished generator.
    pub fn get_return(&self) -> Result<Value> {
        match self.status {
            GeneratorStatus::Resolved => Ok(self.returned.clone().unwrap_or(Value::Null)),
            _ => Err(RpcError::Usage {
                message: "Cannot get return value of a generator that hasn't returned"
                    .to_string(),
            }),
        }
    }

    /// Cached return value, if the generator has returned.
    pub fn result(&self) -> Option<&Value> {
        self.returned.as_ref()
    }

    /// Collect the remaining `(key, value)` pairs.
    pub async fn drain(&mut self) -> Result<Vec<(Value, Value)>> {
        let mut entries = Vec::new();
        while self.valid() {
            if let (Some(key), Some(value)) = (self.key.clone(), self.current.clone()) {
                entries.push((key, value));
            }
            self.next().await?;
        }
        Ok(entries)
    }

    async fn step(&mut self, step: Step) -> Result<Option<Value>> {
        if self.status != GeneratorStatus::Pending {
            return match step {
                Step::Yield(_) => Ok(None),
                Step::Throw(err) => Err(err),
                Step::Return(value) => Ok(Some(value)),
            };
        }

        match self.run(step).await {
            Ok(GeneratorState::Yielded { key, value }) => {
                self.key = Some(key.unwrap_or_else(|| json!(self.counter)));
                self.counter += 1;
                self.current = Some(value.clone());
                Ok(Some(value))
            }
            Ok(GeneratorState::Complete(value)) => {
                self.status = GeneratorStatus::Resolved;
                self.key = None;
                self.current = None;
                self.returned = Some(value);
                Ok(None)
            }
            Err(err) => {
                self.status = GeneratorStatus::Rejected;
                self.key = None;
                self.current = None;
                Err(err)
            }
        }
    }

    async fn run(&mut self, step: Step) -> Result<GeneratorState> {
        match &mut self.driver {
            Driver::Local(generator) => match step {
                Step::Yield(input) => generator.resume(input).await,
                Step::Throw(err) => generator.throw(err).await,
                Step::Return(value) => Ok(GeneratorState::Complete(value)),
            },
            Driver::Remote {
                client,
                module,
                method,
                task_id,
            } => {
                let (event, args) = match step {
                    Step::Yield(Some(value)) => (EventKind::Yield, vec![value]),
                    Step::Yield(None) => (EventKind::Yield, Vec::new()),
                    Step::Throw(err) => (EventKind::Throw, vec![err.to_payload().to_value()]),
                    Step::Return(value) => (EventKind::Return, vec![value]),
                };

                let (_, event, data) = client
                    .call(event, Some(*task_id), module, method, args)
                    .await?;
                Self::parse_reply(event, data)
            }
        }
    }

    fn parse_reply(event: EventKind, data: Value) -> Result<GeneratorState> {
        let value = data.get("value").cloned().unwrap_or(Value::Null);
        match event {
            EventKind::Yield => Ok(GeneratorState::Yielded {
                key: data.get("key").cloned(),
                value,
            }),
            EventKind::Return => Ok(GeneratorState::Complete(value)),
            other => {
                debug!("Unexpected {:?} reply to a generator step", other);
                Err(RpcError::Protocol {
                    message: format!("unexpected {:?} reply to a generator step", other),
                })
            }
        }
    }
}
