//! Reference daemon used by the supervisor tests and as a template for
//! application daemons.
//!
//! Methods:
//! - `math.add {a, b}` → `a + b`
//! - `math.fail` → always fails with "boom"
//! - `math.explode` → panics
//! - `echo.echo <any>` → its input
//! - `info.whoami` → `{appId, target, pid}`
//!
//! Passing `--fail-startup` makes a startup handler fail, so the process
//! exits non-zero without ever announcing a port.

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tether_daemon::{Daemon, DaemonContext, MethodRegistry, StartupHandlers};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct AddInput {
    a: i64,
    b: i64,
}

async fn add(input: AddInput) -> Result<i64> {
    Ok(input.a + input.b)
}

async fn fail(_input: Value) -> Result<Value> {
    anyhow::bail!("boom")
}

async fn explode(_input: Value) -> Result<Value> {
    panic!("demo daemon method panicked")
}

async fn echo(input: Value) -> Result<Value> {
    Ok(input)
}

async fn announce(ctx: DaemonContext) -> Result<()> {
    info!(
        "Demo daemon for {} starting (idle timeout {:?})",
        ctx.app_id(),
        ctx.idle_timeout()
    );
    Ok(())
}

async fn refuse_startup(_ctx: DaemonContext) -> Result<()> {
    anyhow::bail!("startup refused by --fail-startup")
}

#[derive(Parser, Debug)]
#[command(name = "tether-demo-daemon")]
#[command(about = "Reference daemon exposing a few demo methods")]
struct Args {
    /// Register a startup handler that always fails
    #[arg(long)]
    fail_startup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the port line, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let ctx = DaemonContext::from_env()?;

    let whoami = json!({
        "appId": ctx.app_id(),
        "target": ctx.target(),
        "pid": std::process::id(),
    });
    let registry = MethodRegistry::new()
        .with_method("math", "add", add)?
        .with_method("math", "fail", fail)?
        .with_method("math", "explode", explode)?
        .with_method("echo", "echo", echo)?
        .with_method("info", "whoami", move |_: Value| {
            let whoami = whoami.clone();
            async move { Ok::<_, anyhow::Error>(whoami) }
        })?;

    let mut startup = StartupHandlers::new();
    startup.add("announce", announce);
    if args.fail_startup {
        startup.add("refuse", refuse_startup);
    }

    Daemon::new(ctx, registry).with_startup(startup).run().await?;
    Ok(())
}
