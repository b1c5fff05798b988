//! Served module implementations and their local registry.

use crate::generator::{Generator, GeneratorProxy};
use crate::{Result, RpcError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// What a module method hands back.
pub enum Invocation {
    Value(Value),
    Generator(Box<dyn Generator>),
}

impl Invocation {
    pub fn generator(generator: impl Generator + 'static) -> Self {
        Invocation::Generator(Box::new(generator))
    }
}

impl From<Value> for Invocation {
    fn from(value: Value) -> Self {
        Invocation::Value(value)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Invocation::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// A module singleton that can be served and called by method name.
///
/// Unknown methods should fail with [`RpcError::undefined_method`].
#[async_trait]
pub trait ModuleInstance: Send + Sync + 'static {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Invocation>;
}

/// What a caller gets back from a routed call.
#[derive(Debug)]
pub enum CallResult {
    Value(Value),
    Generator(GeneratorProxy),
}

impl CallResult {
    pub fn is_generator(&self) -> bool {
        matches!(self, CallResult::Generator(_))
    }

    /// The plain value; fails for streaming calls.
    pub fn value(self) -> Result<Value> {
        match self {
            CallResult::Value(value) => Ok(value),
            CallResult::Generator(_) => Err(RpcError::Usage {
                message: "call returned a generator, not a value".to_string(),
            }),
        }
    }

    /// The generator proxy; fails for plain calls.
    pub fn generator(self) -> Result<GeneratorProxy> {
        match self {
            CallResult::Generator(proxy) => Ok(proxy),
            CallResult::Value(_) => Err(RpcError::Usage {
                message: "call returned a value, not a generator".to_string(),
            }),
        }
    }

    pub(crate) async fn from_invocation(invocation: Invocation) -> Result<Self> {
        match invocation {
            Invocation::Value(value) => Ok(CallResult::Value(value)),
            Invocation::Generator(generator) => {
                Ok(CallResult::Generator(GeneratorProxy::local(generator).await?))
            }
        }
    }
}

/// Builds a module singleton on first use.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn ModuleInstance> + Send + Sync>;

/// Factories and lazily built singletons of locally implemented modules.
#[derive(Default)]
pub struct LocalRegistry {
    factories: Mutex<HashMap<String, ModuleFactory>>,
    singletons: Mutex<HashMap<String, Arc<dyn ModuleInstance>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory of `module`.
    pub fn define(&self, module: &str, factory: ModuleFactory) {
        self.factories
            .lock()
            .expect("module factories lock poisoned")
            .insert(module.to_string(), factory);
        self.singletons
            .lock()
            .expect("module singletons lock poisoned")
            .remove(module);
    }

    /// The singleton of `module`, built on first access.
    pub fn instance(&self, module: &str) -> Result<Arc<dyn ModuleInstance>> {
        if let Some(instance) = self
            .singletons
            .lock()
            .expect("module singletons lock poisoned")
            .get(module)
        {
            return Ok(instance.clone());
        }

        let factory = self
            .factories
            .lock()
            .expect("module factories lock poisoned")
            .get(module)
            .cloned()
            .ok_or_else(|| RpcError::unavailable(module))?;

        let built = factory();
        let mut singletons = self
            .singletons
            .lock()
            .expect("module singletons lock poisoned");
        Ok(singletons
            .entry(module.to_string())
            .or_insert(built)
            .clone())
    }
}
