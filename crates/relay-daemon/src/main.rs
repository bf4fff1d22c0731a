//! Standalone relay daemon.
//!
//! ```text
//! relay-daemon --port 7420 --data-dir ./sessions --trace-dir ./traces
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_core::agents::HttpAgentWorker;
use relay_core::stream::{JsonlStreamStore, MemoryStreamStore};
use relay_core::{EventBus, RelayConfig, SessionProtocol, StreamStore};
use relay_http::AppState;

type DaemonResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "relay-daemon", about = "Agent session relay")]
struct Args {
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "RELAY_PORT", default_value_t = 7420)]
    port: u16,

    /// Directory for JSONL session logs. Logs stay in memory when unset.
    #[arg(long, env = "RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory for per-session trace files.
    #[arg(long, env = "RELAY_TRACE_DIR")]
    trace_dir: Option<PathBuf>,

    #[arg(long, env = "RELAY_FORWARD_TIMEOUT_SECS", default_value_t = 30)]
    forward_timeout_secs: u64,

    /// Default log filter; `RUST_LOG` takes precedence.
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> RelayConfig {
        let mut config =
            RelayConfig::default().with_forward_timeout(Duration::from_secs(self.forward_timeout_secs));
        if let Some(dir) = &self.trace_dir {
            config = config.with_trace_dir(dir);
        }
        config
    }

    fn store(&self) -> DaemonResult<Arc<dyn StreamStore>> {
        Ok(match &self.data_dir {
            Some(dir) => {
                log::info!("Persisting session logs to {}", dir.display());
                Arc::new(JsonlStreamStore::open(dir)?)
            }
            None => {
                log::info!("No data dir configured, session logs are kept in memory");
                Arc::new(MemoryStreamStore::new())
            }
        })
    }

    async fn addr(&self) -> DaemonResult<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| format!("Cannot resolve {}:{}", self.host, self.port).into())
    }
}

fn build_state(args: &Args) -> DaemonResult<Arc<AppState>> {
    let config = args.config();
    let protocol = SessionProtocol::new(
        args.store()?,
        Arc::new(HttpAgentWorker::new(config.invoke_connect_timeout)),
        Arc::new(EventBus::with_capacity(config.event_bus_capacity)),
        &config,
    );
    Ok(Arc::new(AppState::new(Arc::new(protocol))))
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let state = build_state(&args)?;
    let mut server = relay_http::start(state, args.addr().await?).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Received Ctrl-C");
    server.stop().await;
    Ok(())
}
