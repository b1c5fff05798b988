//! End-to-end tests for calls across real channels.
//!
//! Each test starts a server root on an OS-assigned port, connects a
//! client-only root to it and calls through `ModuleProxy` handles.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use modwire::{
    CallResult, ChannelOptions, Generator, GeneratorState, GeneratorStatus, Invocation,
    IterGenerator, KeyedGenerator, ModuleInstance, ModuleProxyApp, RemoteErrorKind, RpcError,
    RpcServer,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const CONFIG: &str = "Services.Config";

/// Small key-value module with a few extra methods for edge cases.
struct ConfigService {
    owner: String,
    values: Mutex<HashMap<String, Value>>,
}

impl ConfigService {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            values: Mutex::new(HashMap::new()),
        }
    }
}

/// Running total of sent numbers; a RangeError resets it.
struct Accumulator {
    total: i64,
}

#[async_trait]
impl Generator for Accumulator {
    async fn resume(&mut self, input: Option<Value>) -> modwire::Result<GeneratorState> {
        self.total += input.as_ref().and_then(Value::as_i64).unwrap_or(0);
        if self.total >= 100 {
            return Ok(GeneratorState::Complete(json!(self.total)));
        }
        Ok(GeneratorState::yielded(json!(self.total)))
    }

    async fn throw(&mut self, err: RpcError) -> modwire::Result<GeneratorState> {
        if err.error_name() == "RangeError" {
            self.total = 0;
            Ok(GeneratorState::yielded(json!(self.total)))
        } else {
            Err(err)
        }
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

#[async_trait]
impl ModuleInstance for ConfigService {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> modwire::Result<Invocation> {
        match method {
            "set" => {
                let key = arg(&args, 0).as_str().unwrap_or_default().to_string();
                self.values.lock().unwrap().insert(key, arg(&args, 1));
                Ok(Value::Null.into())
            }
            "get" => {
                let key = arg(&args, 0);
                let key = key.as_str().unwrap_or_default();
                Ok(self
                    .values
                    .lock()
                    .unwrap()
                    .get(key)
                    .cloned()
                    .unwrap_or(Value::Null)
                    .into())
            }
            "owner" => Ok(json!(self.owner).into()),
            "slow" => {
                let ms = arg(&args, 0).as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!("done").into())
            }
            "fail" => Err(RpcError::raise("TypeError", "something went wrong")),
            "companies" => Ok(Invocation::generator(
                IterGenerator::new(vec![json!("Mozilla"), json!("GitHub"), json!("Linux")])
                    .returning(json!("Big Companies")),
            )),
            "accumulate" => Ok(Invocation::generator(Accumulator { total: 0 })),
            "pairs" => Ok(Invocation::generator(
                KeyedGenerator::new(vec![
                    (json!("foo"), json!("hello")),
                    (json!("bar"), json!("world")),
                ])
                .returning(json!("OK")),
            )),
            _ => Err(RpcError::undefined_method("App.Services.Config", method)),
        }
    }
}

async fn start_server(owner: &str, options: ChannelOptions) -> (ModuleProxyApp, RpcServer) {
    let app = ModuleProxyApp::new("App", true);
    let config = app.module(CONFIG);
    let owner = owner.to_string();
    app.define(&config, move || Arc::new(ConfigService::new(&owner)));

    let server = app
        .serve(options.hostname("127.0.0.1").port(0))
        .await
        .expect("server should open");
    server.register(&config);
    (app, server)
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn test_dsn_matches_between_client_and_server() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let client = app.connect(server.port()).await.unwrap();

    assert_eq!(client.dsn(), server.dsn());
    assert_eq!(client.server_id(), server.id());
    assert_eq!(server.dsn(), format!("ws://127.0.0.1:{}/", server.port()));
    assert!(client.is_connected());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_read_your_writes() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.dsn()).await.unwrap();
    client.register(&config);

    config
        .invoke("set", vec![json!("theme"), json!({"dark": true})])
        .await
        .unwrap();
    let value = config
        .invoke("get", vec![json!("theme")])
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(value, json!({"dark": true}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_remote_error_is_reconstructed() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    match config.invoke("fail", Vec::new()).await.unwrap_err() {
        RpcError::Remote(err) => {
            assert_eq!(err.kind, RemoteErrorKind::Type);
            assert_eq!(err.message, "something went wrong");
        }
        other => panic!("Expected remote error, got: {:?}", other),
    }

    let err = config.invoke("nope", Vec::new()).await.unwrap_err();
    assert_eq!(err.error_name(), "BadMethodCallException");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_call_timeout() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app
        .connect(
            ChannelOptions::new()
                .port(server.port())
                .timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    client.register(&config);

    let err = config.invoke("slow", vec![json!(1000)]).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "App.Services.Config.slow() timeout after 200 ms"
    );
    assert_eq!(client.pending_tasks(), 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_generator_values_and_return() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    let result = config.invoke("companies", Vec::new()).await.unwrap();
    assert!(result.is_generator());
    let mut generator = result.generator().unwrap();

    assert!(generator.get_return().is_err());
    let entries = generator.drain().await.unwrap();
    assert_eq!(
        entries,
        vec![
            (json!(0), json!("Mozilla")),
            (json!(1), json!("GitHub")),
            (json!(2), json!("Linux")),
        ]
    );
    assert_eq!(generator.get_return().unwrap(), json!("Big Companies"));
    assert_eq!(generator.next().await.unwrap(), None);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_generator_keys_are_preserved() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    let mut generator = config
        .invoke("pairs", Vec::new())
        .await
        .unwrap()
        .generator()
        .unwrap();
    assert_eq!(generator.key(), Some(&json!("foo")));
    assert_eq!(generator.current(), Some(&json!("hello")));

    let entries = generator.drain().await.unwrap();
    assert_eq!(
        entries,
        vec![
            (json!("foo"), json!("hello")),
            (json!("bar"), json!("world")),
        ]
    );
    assert_eq!(generator.get_return().unwrap(), json!("OK"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_generator_early_return() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    let mut generator = config
        .invoke("companies", Vec::new())
        .await
        .unwrap()
        .generator()
        .unwrap();
    assert_eq!(generator.current(), Some(&json!("Mozilla")));

    let value = generator.return_value(json!("stopped")).await.unwrap();
    assert_eq!(value, json!("stopped"));
    assert_eq!(generator.get_return().unwrap(), json!("stopped"));

    let err = generator
        .throw(RpcError::raise("Error", "late"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "late");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_unavailable_after_server_close() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    server.close().await;
    assert!(wait_until(|| !client.is_connected()).await);

    let err = config.invoke("get", vec![json!("theme")]).await.unwrap_err();
    assert!(err.is_service_unavailable());
    assert_eq!(err.to_string(), "Service App.Services.Config is not available");

    client.close().await;
}

#[tokio::test]
async fn test_secret_is_checked() {
    let (_server_app, server) = start_server("a", ChannelOptions::new().secret("tesla")).await;

    let app = ModuleProxyApp::new("App", false);
    let err = app
        .connect(ChannelOptions::new().port(server.port()).secret("edison"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), format!("Cannot connect to {}", server.dsn()));

    let client = app
        .connect(ChannelOptions::new().port(server.port()).secret("tesla"))
        .await
        .unwrap();
    assert!(client.is_connected());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_register_is_idempotent() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);
    client.register(&config);

    assert_eq!(app.server_ids(&config), vec![server.id()]);

    client.close().await;
    assert!(app.server_ids(&config).is_empty());
    server.close().await;
}

#[tokio::test]
async fn test_custom_server_id_is_adopted() {
    let (_server_app, server) =
        start_server("a", ChannelOptions::new().id("config-server")).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    assert_eq!(client.server_id(), "config-server");
    assert_eq!(app.server_ids(&config), vec!["config-server".to_string()]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_reconnects_after_server_restart() {
    let (_server_app, server) =
        start_server("a", ChannelOptions::new().id("config-server")).await;
    let port = server.port();

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app
        .connect(
            ChannelOptions::new()
                .port(port)
                .reconnect_backoff(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    client.register(&config);

    let instance = config.instance(None).unwrap();
    assert_eq!(instance.ready_state(), 1);

    server.close().await;
    assert!(wait_until(|| client.is_connecting()).await);
    assert_eq!(instance.ready_state(), 0);

    let restarted_app = ModuleProxyApp::new("App", true);
    let restarted_config = restarted_app.module(CONFIG);
    restarted_app.define(&restarted_config, || Arc::new(ConfigService::new("b")));
    let restarted = restarted_app
        .serve(
            ChannelOptions::new()
                .hostname("127.0.0.1")
                .port(port)
                .id("config-server"),
        )
        .await
        .unwrap();
    restarted.register(&restarted_config);

    assert!(wait_until(|| client.is_connected()).await);
    assert_eq!(instance.ready_state(), 1);

    let owner = config.invoke("owner", Vec::new()).await.unwrap().value().unwrap();
    assert_eq!(owner, json!("b"));

    client.close().await;
    restarted.close().await;
}

#[tokio::test]
async fn test_route_hint_and_readiness() {
    let (_app_a, server_a) = start_server("a", ChannelOptions::new().id("server-a")).await;
    let (_app_b, server_b) = start_server("b", ChannelOptions::new().id("server-b")).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client_a = app.connect(server_a.port()).await.unwrap();
    let client_b = app.connect(server_b.port()).await.unwrap();
    client_a.register(&config);
    client_b.register(&config);

    assert_eq!(
        app.server_ids(&config),
        vec!["server-a".to_string(), "server-b".to_string()]
    );

    let owner = |result: CallResult| result.value().unwrap();
    assert_eq!(
        owner(config.invoke_on(Some("server-b"), "owner", Vec::new()).await.unwrap()),
        json!("b")
    );

    server_a.close().await;
    assert!(wait_until(|| !client_a.is_connected()).await);
    for _ in 0..10 {
        assert_eq!(
            owner(config.invoke("owner", Vec::new()).await.unwrap()),
            json!("b")
        );
    }

    client_a.close().await;
    client_b.close().await;
    server_b.close().await;
}

#[tokio::test]
async fn test_same_process_calls() {
    let app = ModuleProxyApp::new("App", true);
    let config = app.module(CONFIG);
    app.define(&config, || Arc::new(ConfigService::new("local")));

    let server = app
        .serve(ChannelOptions::new().hostname("127.0.0.1").port(0))
        .await
        .unwrap();
    server.register(&config);

    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    config
        .invoke("set", vec![json!("lang"), json!("en")])
        .await
        .unwrap();
    let local = app
        .local_instance(&config)
        .unwrap()
        .invoke("get", vec![json!("lang")])
        .await
        .unwrap();
    assert!(matches!(local, Invocation::Value(ref v) if *v == json!("en")));

    app.set_process_interop(false);
    let value = config
        .invoke("get", vec![json!("lang")])
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(value, json!("en"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_generator_receives_sent_values() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    let mut generator = config
        .invoke("accumulate", Vec::new())
        .await
        .unwrap()
        .generator()
        .unwrap();
    assert_eq!(generator.current(), Some(&json!(0)));

    assert_eq!(generator.send(json!(5)).await.unwrap(), Some(json!(5)));
    assert_eq!(generator.send(json!(7)).await.unwrap(), Some(json!(12)));
    assert_eq!(generator.current(), Some(&json!(12)));

    assert_eq!(generator.send(json!(90)).await.unwrap(), None);
    assert_eq!(generator.status(), GeneratorStatus::Resolved);
    assert_eq!(generator.get_return().unwrap(), json!(102));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_generator_catches_thrown_error() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    let mut generator = config
        .invoke("accumulate", Vec::new())
        .await
        .unwrap()
        .generator()
        .unwrap();
    generator.send(json!(40)).await.unwrap();

    let value = generator
        .throw(RpcError::raise("RangeError", "out of range"))
        .await
        .unwrap();
    assert_eq!(value, Some(json!(0)));
    assert_eq!(generator.status(), GeneratorStatus::Pending);
    assert!(generator.valid());

    assert_eq!(generator.send(json!(3)).await.unwrap(), Some(json!(3)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_generator_rejects_uncaught_error() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    let mut generator = config
        .invoke("accumulate", Vec::new())
        .await
        .unwrap()
        .generator()
        .unwrap();

    match generator
        .throw(RpcError::raise("TypeError", "boom"))
        .await
        .unwrap_err()
    {
        RpcError::Remote(err) => {
            assert_eq!(err.kind, RemoteErrorKind::Type);
            assert_eq!(err.name, "TypeError");
            assert_eq!(err.message, "boom");
        }
        other => panic!("Expected remote error, got: {:?}", other),
    }
    assert_eq!(generator.status(), GeneratorStatus::Rejected);
    assert!(!generator.valid());
    assert_eq!(generator.next().await.unwrap(), None);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_missing_pong_drops_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    // Answers the handshake once and then ignores every frame.
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                drop(stream);
                continue;
            }
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                ws.send(Message::Text(json!([1, "silent"]).to_string()))
                    .await
                    .unwrap();
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app
        .connect(
            ChannelOptions::new()
                .port(port)
                .ping_interval(Duration::from_millis(100))
                .ping_timeout(Duration::from_millis(100))
                .reconnect_backoff(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    client.register(&config);
    assert_eq!(client.server_id(), "silent");

    let instance = config.instance(None).unwrap();
    assert_eq!(instance.ready_state(), 1);

    assert!(wait_until(|| accepted.load(Ordering::SeqCst) >= 2).await);
    assert!(!client.is_connected());
    assert!(client.is_connecting());
    assert_eq!(instance.ready_state(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_task_id_range_without_wrap() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app
        .connect(
            ChannelOptions::new()
                .port(server.port())
                .task_ids(1, 2, false),
        )
        .await
        .unwrap();
    client.register(&config);
    assert_eq!(client.config().task_id_max, 2);

    for _ in 0..2 {
        config.invoke("get", vec![json!("theme")]).await.unwrap();
    }
    match config.invoke("get", vec![json!("theme")]).await.unwrap_err() {
        RpcError::Usage { message } => assert_eq!(message, "task id space exhausted"),
        other => panic!("Expected usage error, got: {:?}", other),
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_closing_one_of_two_channels_to_a_server() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let first = app.connect(server.port()).await.unwrap();
    let second = app.connect(server.port()).await.unwrap();
    first.register(&config);
    second.register(&config);
    assert_eq!(app.server_ids(&config), vec![server.id()]);

    second.close().await;
    assert_eq!(app.server_ids(&config), vec![server.id()]);
    let owner = config.invoke("owner", Vec::new()).await.unwrap().value().unwrap();
    assert_eq!(owner, json!("a"));

    first.close().await;
    assert!(app.server_ids(&config).is_empty());
    server.close().await;
}

#[tokio::test]
async fn test_close_rejects_pending_calls() {
    let (_server_app, server) = start_server("a", ChannelOptions::new()).await;

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(server.port()).await.unwrap();
    client.register(&config);

    let pending = {
        let config = config.clone();
        tokio::spawn(async move { config.invoke("slow", vec![json!(1500)]).await })
    };
    assert!(wait_until(|| client.pending_tasks() == 1).await);

    client.close().await;
    match pending.await.unwrap().unwrap_err() {
        RpcError::ChannelClosed { server_id } => assert_eq!(server_id, server.id()),
        other => panic!("Expected closed channel error, got: {:?}", other),
    }
    assert_eq!(client.pending_tasks(), 0);

    server.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sockets").join("config.sock");
    let url = format!("ws+unix:{}", path.display());

    let server_app = ModuleProxyApp::new("App", true);
    let server_config = server_app.module(CONFIG);
    server_app.define(&server_config, || Arc::new(ConfigService::new("unix")));
    let server = server_app.serve(url.as_str()).await.unwrap();
    server.register(&server_config);
    assert_eq!(server.dsn(), url);
    assert!(path.exists());

    let app = ModuleProxyApp::new("App", false);
    let config = app.module(CONFIG);
    let client = app.connect(url.as_str()).await.unwrap();
    client.register(&config);
    assert_eq!(client.server_id(), url);

    let owner = config.invoke("owner", Vec::new()).await.unwrap().value().unwrap();
    assert_eq!(owner, json!("unix"));

    client.close().await;
    server.close().await;
    assert!(!path.exists());
}
