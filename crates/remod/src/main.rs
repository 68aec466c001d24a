//! # remod
//!
//! Demo daemon for the remote object layer.
//!
//! ```text
//! remod serve [--port N] [--identity NAME]   expose Demo.Counter until Ctrl-C
//! remod probe <host:port> [--identity NAME]  drive a running server's counter
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`), or `--debug`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use remo::AccessPoint;
use remo::AppComponent;
use remo::ClientConfig;
use remo::ConnectionManager;
use remo::DynamicObject;
use remo::LinkEvent;
use remo::ObjectError;
use remo::Permissions;
use remo::RemoteCaller;
use remo::ServerConfig;
use remo::Value;

#[cfg(test)]
mod tests;

const DEFAULT_PORT: u16 = 7240;
const DEFAULT_IDENTITY: &str = "remod";

#[derive(Parser, Debug)]
#[command(name = "remod")]
#[command(about = "Expose or probe a demo remote object")]
struct Args {
    /// Enable debug logging when RUST_LOG is unset
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expose Demo.Counter until Ctrl-C
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Application identity clients must present
        #[arg(short, long, default_value = DEFAULT_IDENTITY)]
        identity: String,
    },
    /// Connect to a server and drive its counter
    Probe {
        /// Server address, e.g. 127.0.0.1:7240
        addr: SocketAddr,

        /// Application identity to present
        #[arg(short, long, default_value = DEFAULT_IDENTITY)]
        identity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let fallback = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .init();

    match args.command {
        Command::Serve { port, identity } => serve(port, &identity).await,
        Command::Probe { addr, identity } => probe(addr, &identity).await,
    }
}

/// A counter that announces every change through its `changed` event.
fn counter() -> Arc<DynamicObject> {
    let count = Arc::new(AtomicI64::new(0));
    let this: Arc<OnceLock<Weak<DynamicObject>>> = Arc::new(OnceLock::new());

    let publish = {
        let this = this.clone();
        move |value: i64| {
            if let Some(object) = this.get().and_then(Weak::upgrade) {
                object.set_local("count", value);
                object.emit("changed", &[Value::from(value)]);
            }
            Value::from(value)
        }
    };

    let increment = {
        let (count, publish) = (count.clone(), publish.clone());
        move |_: &[Value], _: &RemoteCaller| -> Result<Value, ObjectError> {
            Ok(publish(count.fetch_add(1, Ordering::SeqCst) + 1))
        }
    };
    let add = {
        let (count, publish) = (count.clone(), publish.clone());
        move |args: &[Value], _: &RemoteCaller| -> Result<Value, ObjectError> {
            let step = args[0]
                .as_i64()
                .ok_or_else(|| ObjectError::BadArguments(format!("expected an integer, got {}", args[0].kind())))?;
            Ok(publish(count.fetch_add(step, Ordering::SeqCst) + step))
        }
    };
    let reset = move |_: &[Value], _: &RemoteCaller| -> Result<Value, ObjectError> {
        count.store(0, Ordering::SeqCst);
        Ok(publish(0))
    };

    let object = Arc::new(
        DynamicObject::builder()
            .method("increment", 0, increment)
            .method("add", 1, add)
            .method("reset", 0, reset)
            .read_only_property("count", 0i64)
            .property("label", "demo counter")
            .event("changed")
            .build(),
    );
    let _ = this.set(Arc::downgrade(&object));
    object
}

async fn serve(port: u16, identity: &str) -> Result<()> {
    let access_point = AccessPoint::new(ServerConfig::new(identity).with_port(port));
    access_point.add_component(Arc::new(AppComponent::new("Demo")))?;
    let counter = access_point.expose("Demo", counter(), "Counter", Permissions::all())?;

    let addr = access_point.enable_default().await.context("failed to enable access point")?;
    info!(%addr, %identity, object = "Demo.Counter", "serving");

    tokio::signal::ctrl_c().await.context("failed to wait for Ctrl-C")?;
    info!(count = ?counter.get_local("count"), sessions = access_point.sessions().len(), "shutting down");
    access_point.disable();
    Ok(())
}

async fn probe(addr: SocketAddr, identity: &str) -> Result<()> {
    let manager = ConnectionManager::new(ClientConfig::new(identity).with_connect_timeout(Duration::from_secs(5)));
    let link = manager.get(addr.ip(), addr.port());
    let mut events = link.events();
    let counter = link.get_object("Demo.Counter");

    loop {
        match events.recv().await.context("link event stream closed")? {
            LinkEvent::AccessGranted => break,
            LinkEvent::AccessDenied => bail!("server {} refused identity '{}'", addr, identity),
            LinkEvent::ConnectFailed(reason) => bail!("could not connect to {}: {}", addr, reason),
            LinkEvent::Disconnected => bail!("server {} closed the connection", addr),
            LinkEvent::Connected => info!(%addr, "connected, waiting for access"),
        }
    }

    let id = counter.activated().await.context("Demo.Counter is not available")?;
    info!(id, "counter activated");

    counter.cache_properties().await?;
    for name in counter.property_names().await? {
        let value = counter.cached_property(&name).unwrap_or_default();
        info!(%name, %value, "property");
    }

    let mut changes = counter.subscribe("changed").await?;
    let value = counter.invoke("increment", Vec::new()).await?;
    info!(%value, "incremented");
    match tokio::time::timeout(Duration::from_secs(2), changes.recv()).await {
        Ok(Some(args)) => info!(?args, "change event"),
        Ok(None) => warn!("subscription ended"),
        Err(_) => warn!("no change event within 2s"),
    }
    counter.unsubscribe("changed").await?;

    manager.close_all();
    Ok(())
}
