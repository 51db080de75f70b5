use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use obexd::config::Config;
use obexd::group::ListenerGroup;
use obexd::listener::{ConnectionValidator, Verdict};
use obexd::telemetry::init_tracing;
use obexd::transport::{EndpointId, IncomingConnection, LoopbackFactory};

#[derive(Parser, Debug)]
#[command(name = "obexd")]
#[command(author, version, about = "Dual-transport OBEX connection listener")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

/// Accepts the first connection from an allow-listed endpoint and holds it
/// until the process exits. Stands in for the profile service that would own
/// the protocol session on the winning connection.
struct AllowListValidator {
    allowed: HashSet<String>,
    active: Mutex<Option<IncomingConnection>>,
}

impl AllowListValidator {
    fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed.iter().cloned().collect(),
            active: Mutex::new(None),
        }
    }
}

impl ConnectionValidator for AllowListValidator {
    fn on_connect(&self, endpoint: &EndpointId, conn: IncomingConnection) -> Verdict {
        if !self.allowed.is_empty() && !self.allowed.contains(endpoint.as_str()) {
            return Verdict::Rejected(conn);
        }

        info!(%endpoint, kind = %conn.kind(), "peer connected");
        *self.active.lock().unwrap() = Some(conn);
        Verdict::Accepted
    }

    fn on_accept_failed(&self) {
        warn!("transport listener failed, group is going down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    init_tracing(&config.telemetry)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting obexd"
    );

    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let factory = Arc::new(LoopbackFactory::new());
    let validator = Arc::new(AllowListValidator::new(&config.allowed_endpoints));
    let group = ListenerGroup::create(factory, validator, &config.group).await?;

    info!(
        stream_channel = group.stream_channel(),
        packet_channel = group.packet_channel(),
        allowed = config.allowed_endpoints.len(),
        "advertising service channels"
    );

    wait_for_shutdown().await;

    info!("shutdown signal received");
    group.shutdown(true).await;
    info!("obexd stopped");

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
