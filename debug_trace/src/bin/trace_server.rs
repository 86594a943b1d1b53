use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, ValueHint};
use debug_trace::api::{DebugApi, ExcludeFailedApi, TraceBackend};
use debug_trace::config::{cli::CliTraceConfig, TraceServiceConfig};
use debug_trace::env::load_env_file;
use debug_trace::memory::ChainFixture;
use debug_trace::metrics::{ConnectionType, PrometheusMetrics};
use debug_trace::provider::CachedBlockStore;
use debug_trace::server::{self, RpcState};
use tracing::info;

/// Serves the debug trace API over an in-memory chain.
#[derive(Parser)]
#[command(version = debug_trace::version(), propagate_version = true)]
struct Cli {
    /// JSON chain fixture to serve.
    #[arg(short, long, env = "DEBUG_TRACE_FIXTURE", value_hint = ValueHint::FilePath)]
    fixture: PathBuf,
    /// Port to listen on.
    #[arg(short, long, env = "DEBUG_TRACE_PORT", default_value_t = 8545)]
    port: u16,
    #[clap(flatten)]
    trace_config: CliTraceConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = load_env_file();
    debug_trace::tracing::init();
    if let Some(path) = env_file {
        info!(path = %path.display(), "read settings from env file");
    }

    let args = Cli::parse();
    let config: TraceServiceConfig = args.trace_config.into();

    let fixture = std::fs::read(&args.fixture)
        .with_context(|| format!("failed to read fixture {}", args.fixture.display()))?;
    let (chain, engine) = ChainFixture::from_json(&fixture)?.build();
    info!(
        latest_height = chain.latest_height(),
        ?config,
        "loaded chain fixture"
    );

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(PrometheusMetrics::new(&registry)?);
    let backend = TraceBackend {
        blocks: Arc::new(CachedBlockStore::new(chain.clone())),
        ..TraceBackend::from_node(chain, engine, metrics)
    };
    let api = DebugApi::new(backend, &config, ConnectionType::Http);

    server::serve(
        args.port,
        RpcState {
            api: ExcludeFailedApi::new(Arc::new(api)),
            registry,
        },
    )
    .await
}
