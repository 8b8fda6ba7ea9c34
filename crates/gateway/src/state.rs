//! Shared application state passed to the orchestrator, scheduler, and
//! API handlers.

use std::sync::Arc;
use std::time::Duration;

use cortex_cache::SharedCache;
use cortex_domain::config::Config;
use cortex_memory::{EncryptionService, MemoryEngine};
use cortex_providers::client::ChatBackend;
use cortex_providers::health::HealthTracker;
use cortex_providers::pool::ModelPool;
use cortex_stores::{
    ApiKeyStore, ChatStore, DaemonStore, EngramStore, MemoryStore, ProjectStore, SessionStore,
    TaskStore,
};
use cortex_tools::{ToolPredictor, ToolRegistry};

use crate::bridge::McpBridge;
use crate::bus::EventBus;
use crate::classifier::Classifier;
use crate::limiter::{TierService, UsageLimiter};
use crate::pool::DaemonPool;
use crate::scheduler::ScheduleStore;

/// Everything a request handler or worker needs, cloneable by `Arc`
/// fields. Constructed once at startup.
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────
    pub config: Arc<Config>,
    pub instance_id: String,
    pub cache: Arc<dyn SharedCache>,
    pub backend: Arc<dyn ChatBackend>,
    pub models: Arc<ModelPool>,

    // ── Orchestration ─────────────────────────────────────────────
    pub bus: Arc<EventBus>,
    pub classifier: Arc<Classifier>,
    pub predictor: Arc<ToolPredictor>,
    pub registry: Arc<ToolRegistry>,
    pub bridge: Arc<McpBridge>,
    pub daemon_pool: Arc<DaemonPool>,
    pub limiter: Arc<UsageLimiter>,
    pub memory: Arc<MemoryEngine>,

    // ── Stores ────────────────────────────────────────────────────
    pub tasks: Arc<TaskStore>,
    pub daemons: Arc<DaemonStore>,
    pub sessions: Arc<SessionStore>,
    pub engrams: Arc<EngramStore>,
    pub chats: Arc<ChatStore>,
    pub memories: Arc<MemoryStore>,
    pub projects: Arc<ProjectStore>,
    pub api_keys: Arc<ApiKeyStore>,
    pub schedules: Arc<ScheduleStore>,
}

impl AppState {
    /// Wire the full service graph. `state_path = None` keeps every store
    /// in memory (tests).
    pub fn build(
        config: Config,
        instance_id: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
        cache: Arc<dyn SharedCache>,
        tiers: Arc<dyn TierService>,
        cipher: Arc<dyn EncryptionService>,
        persist_state: bool,
    ) -> Self {
        let config = Arc::new(config);
        let state_path = persist_state.then(|| config.store.state_path.clone());
        let state_path = state_path.as_deref();

        let health = Arc::new(HealthTracker::new(config.llm.failure_threshold));
        let models = Arc::new(ModelPool::from_config(&config.llm.models, health));
        let utility_timeout = Duration::from_secs(config.llm.utility_timeout_secs);

        let registry = Arc::new(ToolRegistry::new());
        let bus = Arc::new(EventBus::new());
        let memories = Arc::new(MemoryStore::new(state_path));

        Self {
            instance_id: instance_id.into(),
            cache: cache.clone(),
            backend: backend.clone(),
            models: models.clone(),
            bus: bus.clone(),
            classifier: Arc::new(Classifier::new(
                backend.clone(),
                models.clone(),
                utility_timeout,
            )),
            predictor: Arc::new(ToolPredictor::new(
                backend.clone(),
                models.clone(),
                cache.clone(),
                None,
                utility_timeout,
            )),
            registry: registry.clone(),
            bridge: Arc::new(McpBridge::new(registry, bus)),
            daemon_pool: Arc::new(DaemonPool::new(config.limits.max_daemons_per_user)),
            limiter: Arc::new(UsageLimiter::new(
                cache,
                tiers,
                config.limits.clone(),
            )),
            memory: Arc::new(MemoryEngine::new(
                memories.clone(),
                backend,
                models,
                cipher,
                config.memory.selection_pass_through,
                config.memory.archive_threshold,
                utility_timeout,
            )),
            tasks: Arc::new(TaskStore::new(state_path)),
            daemons: Arc::new(DaemonStore::new(state_path)),
            sessions: Arc::new(SessionStore::new(state_path)),
            engrams: Arc::new(EngramStore::new(state_path)),
            chats: Arc::new(ChatStore::new(state_path)),
            memories,
            projects: Arc::new(ProjectStore::new(state_path)),
            api_keys: Arc::new(ApiKeyStore::new(state_path)),
            schedules: Arc::new(ScheduleStore::new(state_path)),
            config,
        }
    }

    /// Startup recovery, run before the scheduler starts: convert zombie
    /// daemons to `failed`, then reattach orphaned task ids to the recent
    /// rings and clear the active sets.
    pub fn startup_recovery(&self) {
        let stale = self.daemons.cleanup_stale_daemons();
        let cleared = self.sessions.clear_all_active();
        tracing::info!(stale, cleared, "startup recovery finished");
    }
}
