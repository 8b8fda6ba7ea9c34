use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cortex_cache::MemoryCache;
use cortex_domain::config::Config;
use cortex_gateway::api::{self, ApiContext};
use cortex_gateway::orchestrator::CortexOrchestrator;
use cortex_gateway::scheduler::Scheduler;
use cortex_gateway::state::AppState;
use cortex_gateway::limiter::StaticTierService;
use cortex_memory::PlaintextCipher;
use cortex_providers::client::HttpLlmClient;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cortexd", about = "Cortex orchestrator gateway")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the bind address from config.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    let api_key = std::env::var(&config.llm.api_key_env).unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!(
            env = %config.llm.api_key_env,
            "LLM gateway API key is not set; model calls will be rejected upstream"
        );
    }
    let backend = Arc::new(HttpLlmClient::new(config.llm.base_url.clone(), api_key)?);
    let cache = Arc::new(MemoryCache::new());
    let tiers = Arc::new(StaticTierService::new("free"));
    let cipher = Arc::new(PlaintextCipher);

    let instance_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(%instance_id, "starting cortexd");

    let state = AppState::build(
        config,
        instance_id.clone(),
        backend,
        cache.clone(),
        tiers,
        cipher,
        true,
    );

    // Recovery runs before any new work is admitted.
    state.startup_recovery();

    let orchestrator = Arc::new(CortexOrchestrator::new(state.clone()));

    let scheduler = Arc::new(Scheduler::new(
        state.schedules.clone(),
        cache,
        orchestrator.clone(),
        instance_id,
        Duration::from_secs(state.config.scheduler.lock_ttl_secs),
    ));
    let tick = Duration::from_secs(state.config.scheduler.tick_secs);
    tokio::spawn(scheduler.run(tick));

    // Engram TTL sweep rides its own slow tick.
    {
        let engrams = state.engrams.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                engrams.sweep_expired();
            }
        });
    }

    let bind_addr = state.config.server.bind_addr.clone();
    let router = api::router(ApiContext {
        state,
        orchestrator,
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
