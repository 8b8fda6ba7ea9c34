//! Application configuration, loaded once at startup from TOML + env.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub limits: LimitsConfig,
    pub scheduler: SchedulerConfig,
    pub memory: MemoryConfig,
    pub context: ContextConfig,
    pub store: StoreConfig,
    #[serde(rename = "template")]
    pub templates: Vec<TemplateConfig>,
    #[serde(rename = "skill")]
    pub skills: Vec<SkillConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            limits: LimitsConfig::default(),
            scheduler: SchedulerConfig::default(),
            memory: MemoryConfig::default(),
            context: ContextConfig::default(),
            store: StoreConfig::default(),
            templates: Vec::new(),
            skills: Vec::new(),
        }
    }
}

impl Config {
    /// Load a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_daemons_per_user == 0 {
            return Err(Error::Config("limits.max_daemons_per_user must be > 0".into()));
        }
        if self.llm.models.is_empty() {
            return Err(Error::Config("llm.models must not be empty".into()));
        }
        for m in &self.llm.models {
            if m.tags.is_empty() {
                return Err(Error::Config(format!(
                    "model {} has no capability tags",
                    m.model
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8090".into(),
        }
    }
}

/// One candidate model in the gateway, tagged with the capabilities it
/// serves (`router`, `extractor`, `selector`, `generator`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider_id: String,
    pub model: String,
    pub tags: Vec<String>,
    /// Observed structured-output latency, used to order candidates.
    #[serde(default = "default_latency_ms")]
    pub structured_latency_ms: u64,
}

fn default_latency_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    /// Env var holding the gateway API key.
    pub api_key_env: String,
    pub models: Vec<ModelConfig>,
    /// Deadline for generation calls.
    pub generation_timeout_secs: u64,
    /// Deadline for predictor/selector/extractor calls.
    pub utility_timeout_secs: u64,
    /// Consecutive failures before a model is considered unhealthy.
    pub failure_threshold: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000/v1".into(),
            api_key_env: "CORTEX_LLM_API_KEY".into(),
            models: vec![ModelConfig {
                provider_id: "gateway".into(),
                model: "default".into(),
                tags: vec![
                    "router".into(),
                    "generator".into(),
                    "extractor".into(),
                    "selector".into(),
                ],
                structured_latency_ms: default_latency_ms(),
            }],
            generation_timeout_secs: 120,
            utility_timeout_secs: 30,
            failure_threshold: 3,
        }
    }
}

/// Usage limits for one subscription tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimits {
    pub monthly_messages: u64,
    pub daily_file_uploads: u64,
    pub daily_image_generations: u64,
    /// Paid tiers reset on the billing-cycle anchor day instead of the
    /// calendar month.
    #[serde(default)]
    pub billing_cycle: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_daemons_per_user: u32,
    pub anon_daily_messages: u64,
    pub tiers: HashMap<String, TierLimits>,
    /// Enabled schedules allowed per user, by tier (fallback: free value).
    pub schedules_per_user: HashMap<String, u32>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "free".to_string(),
            TierLimits {
                monthly_messages: 200,
                daily_file_uploads: 10,
                daily_image_generations: 5,
                billing_cycle: false,
            },
        );
        tiers.insert(
            "pro".to_string(),
            TierLimits {
                monthly_messages: 5_000,
                daily_file_uploads: 200,
                daily_image_generations: 100,
                billing_cycle: true,
            },
        );
        let mut schedules_per_user = HashMap::new();
        schedules_per_user.insert("free".to_string(), 3);
        schedules_per_user.insert("pro".to_string(), 25);
        Self {
            max_daemons_per_user: 5,
            anon_daily_messages: 50,
            tiers,
            schedules_per_user,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub lock_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            lock_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Below this many active memories, selection returns all of them.
    pub selection_pass_through: usize,
    /// Memories scoring under this after decay are archived.
    pub archive_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            selection_pass_through: 10,
            archive_threshold: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_memories: usize,
    pub recent_engrams: usize,
    /// Dependency results above this are head/tail sampled.
    pub dependency_result_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_memories: 5,
            recent_engrams: 10,
            dependency_result_max_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub state_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("./data"),
        }
    }
}

/// A reusable daemon configuration keyed by slug. When the classifier emits
/// a `template_slug`, the template's persona and instructions override any
/// classifier-supplied persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub slug: String,
    pub role: crate::daemon::DaemonRole,
    pub label: String,
    pub persona: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// A named bundle of system-prompt text and required tool names,
/// attachable to a daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillConfig {
    pub id: String,
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
}
