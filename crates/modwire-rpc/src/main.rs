//! Modwire RPC - demo server and client.
//!
//! `serve` exposes a `Demo.Echo` module on a channel; `call` connects to a
//! channel and calls one method, draining generators.

mod demo;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use modwire::{CallResult, ChannelOptions, ModuleProxyApp};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "modwire-rpc")]
#[command(about = "Demo server and client for modwire channels")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the Demo.Echo module
    Serve {
        /// Channel URL, Unix socket path or port (port 0 = auto-assign)
        #[arg(short, long, default_value = "ws://127.0.0.1:0/")]
        url: String,

        /// Secret clients must present
        #[arg(long)]
        secret: Option<String>,

        /// Server id announced to clients (defaults to the DSN)
        #[arg(long)]
        id: Option<String>,
    },

    /// Call a method on a served module
    Call {
        /// Channel URL or Unix socket path
        #[arg(short, long)]
        url: String,

        /// Module path under the Demo root
        #[arg(short, long, default_value = demo::MODULE)]
        module: String,

        /// Method name
        #[arg(long)]
        method: String,

        /// Arguments as a JSON array
        #[arg(short, long, default_value = "[]")]
        args: String,

        /// Secret to present
        #[arg(long)]
        secret: Option<String>,
    },
}

fn options(url: String, secret: Option<String>, id: Option<String>) -> ChannelOptions {
    let url = match url.parse::<u16>() {
        Ok(port) => format!("ws://127.0.0.1:{}/", port),
        Err(_) => url,
    };

    let mut options = ChannelOptions::new().url(url);
    if let Some(secret) = secret {
        options = options.secret(secret);
    }
    if let Some(id) = id {
        options = options.id(id);
    }
    options
}

async fn serve(url: String, secret: Option<String>, id: Option<String>) -> Result<()> {
    let app = ModuleProxyApp::new("Demo", true);
    let echo = app.module(demo::MODULE);
    app.define(&echo, || Arc::new(demo::Echo::default()));

    let server = app
        .serve(options(url, secret, id))
        .await
        .context("Failed to open the server")?;
    server.register(&echo);

    // Print the DSN for callers to read (intentional stdout)
    println!("RPC_DSN={}", server.dsn());

    info!("Serving {} on {}", echo.name(), server.id());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    server.close().await;
    Ok(())
}

async fn call(
    url: String,
    module: String,
    method: String,
    args: String,
    secret: Option<String>,
) -> Result<()> {
    let args: Vec<Value> = match serde_json::from_str(&args)? {
        Value::Array(args) => args,
        other => bail!("--args must be a JSON array, got {}", other),
    };

    let app = ModuleProxyApp::new("Demo", false);
    let target = app.module(&module);
    let client = app
        .connect(options(url, secret, None))
        .await
        .context("Failed to connect")?;
    client.register(&target);

    let outcome = target.invoke(&method, args).await;
    let printed = match outcome {
        Ok(CallResult::Value(value)) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Ok(CallResult::Generator(mut generator)) => {
            for (key, value) in generator.drain().await? {
                println!("{} => {}", key, value);
            }
            println!("return {}", generator.get_return()?);
            Ok(())
        }
        Err(e) => Err(e),
    };

    client.close().await;
    printed.with_context(|| format!("{}.{}() failed", target.name(), method))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve { url, secret, id } => serve(url, secret, id).await,
        Command::Call {
            url,
            module,
            method,
            args,
            secret,
        } => call(url, module, method, args, secret).await,
    }
}
