//! Built-in `Demo.Echo` module served by `modwire-rpc serve`.

use async_trait::async_trait;
use modwire::{Generator, GeneratorState, Invocation, ModuleInstance, Result, RpcError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

pub const MODULE: &str = "Echo";

#[derive(Default)]
pub struct Echo {
    calls: AtomicU64,
}

#[async_trait]
impl ModuleInstance for Echo {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Invocation> {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("Echo.{}() call #{}", method, calls);

        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null).into()),
            "add" => {
                let mut sum = 0.0;
                for arg in &args {
                    sum += arg.as_f64().ok_or_else(|| {
                        RpcError::raise("TypeError", format!("{} is not a number", arg))
                    })?;
                }
                Ok(json!(sum).into())
            }
            "count" => {
                let limit = args.first().and_then(Value::as_u64).unwrap_or(3);
                Ok(Invocation::generator(Counter { next: 0, limit }))
            }
            "calls" => Ok(json!(calls).into()),
            _ => Err(RpcError::undefined_method("Demo.Echo", method)),
        }
    }
}

/// Counts from 0 up to `limit`; a sent number restarts the count there.
struct Counter {
    next: u64,
    limit: u64,
}

#[async_trait]
impl Generator for Counter {
    async fn resume(&mut self, input: Option<Value>) -> Result<GeneratorState> {
        if let Some(start) = input.as_ref().and_then(Value::as_u64) {
            self.next = start;
        }
        if self.next >= self.limit {
            return Ok(GeneratorState::Complete(json!(self.limit)));
        }
        let value = self.next;
        self.next += 1;
        Ok(GeneratorState::yielded(json!(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modwire::GeneratorProxy;

    #[tokio::test]
    async fn test_echo_and_add() {
        let echo = Echo::default();
        match echo.invoke("echo", vec![json!("hi")]).await.unwrap() {
            Invocation::Value(value) => assert_eq!(value, json!("hi")),
            other => panic!("Expected value, got: {:?}", other),
        }
        match echo.invoke("add", vec![json!(1), json!(2.5)]).await.unwrap() {
            Invocation::Value(value) => assert_eq!(value, json!(3.5)),
            other => panic!("Expected value, got: {:?}", other),
        }

        let err = echo.invoke("add", vec![json!("x")]).await.unwrap_err();
        assert_eq!(err.error_name(), "TypeError");
    }

    #[tokio::test]
    async fn test_count_generator() {
        let echo = Echo::default();
        let Invocation::Generator(generator) = echo.invoke("count", vec![json!(2)]).await.unwrap()
        else {
            panic!("Expected generator");
        };

        let mut proxy = GeneratorProxy::local(generator).await.unwrap();
        let entries = proxy.drain().await.unwrap();
        assert_eq!(entries, vec![(json!(0), json!(0)), (json!(1), json!(1))]);
        assert_eq!(proxy.get_return().unwrap(), json!(2));
    }
}
