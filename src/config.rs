use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Full configuration surface. Everything has a serde default so a bare
/// environment (API keys only) boots with sensible routing; a YAML file
/// can override any section, and env vars override secrets on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Shared directory for cancel-token files. The cancel endpoint and
    /// the streaming endpoints rendezvous here across request scopes.
    pub cancel_dir: PathBuf,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub task_routing: BTreeMap<String, TaskRoute>,
    pub tiers: TierLadder,
    pub limits: Limits,
    pub retry: RetryConfig,
    pub circuit_breaker: BreakerConfig,
    pub streaming: StreamingConfig,
    pub confidence: ConfidenceConfig,
    pub enrichment: EnrichmentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Never logged, never serialized back out.
    pub api_key: String,
    pub default_model: String,
    pub base_url: Option<String>,
    /// Default per-call wall clock in seconds; options may override.
    pub timeout_secs: u64,
    /// Sibling model used for the single-shot in-provider fallback when a
    /// high-tier model answers 503/404.
    pub fallback_model: Option<String>,
    pub models: BTreeMap<String, ModelCaps>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            default_model: String::new(),
            base_url: None,
            timeout_secs: 30,
            fallback_model: None,
            models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ModelCaps {
    pub supports_vision: bool,
    pub supports_tools: bool,
    pub supports_grounding: bool,
    pub supports_thinking: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRoute {
    pub primary: RouteTarget,
    pub fallback: Option<RouteTarget>,
}

/// Escalation ladder above Tier 1 (Tier 1 is whatever the task routes to).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TierLadder {
    pub tier1_5: TierSpec,
    pub tier2: TierSpec,
    pub tier3: TierSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierSpec {
    pub provider: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for TierLadder {
    fn default() -> Self {
        Self {
            tier1_5: TierSpec {
                provider: "gemini".into(),
                model: "gemini-2.0-flash".into(),
                timeout_secs: 60,
            },
            tier2: TierSpec {
                provider: "claude".into(),
                model: "claude-3-5-sonnet-latest".into(),
                timeout_secs: 60,
            },
            tier3: TierSpec {
                provider: "claude".into(),
                model: "claude-3-opus-latest".into(),
                timeout_secs: 90,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub daily_requests: i64,
    pub daily_cost_usd: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            daily_requests: 200,
            daily_cost_usd: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the multiplicative jitter, e.g. 0.1 for up to +10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: i64,
    pub success_threshold: u32,
    pub sample_window_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 2,
            sample_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enabled: bool,
    /// Task types allowed to stream; anything else gets the buffered path.
    pub tasks: Vec<String>,
    /// When true, only Tier 1 streams; escalation is always buffered.
    pub tier1_only: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tasks: vec![
                "identify_text".into(),
                "identify_image".into(),
                "enrich".into(),
            ],
            tier1_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub tier1_threshold: u8,
    pub tier1_5_threshold: u8,
    pub auto_threshold: u8,
    pub suggest_threshold: u8,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            tier1_threshold: 85,
            tier1_5_threshold: 70,
            auto_threshold: 85,
            suggest_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub cache_ttl_days: i64,
    pub fuzzy_thresholds: FuzzyThresholds,
    /// Artificial delay between replayed fields on a cache hit, so the
    /// client renders progressively even without a live stream.
    pub cache_replay_delay_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            cache_ttl_days: 90,
            fuzzy_thresholds: FuzzyThresholds::default(),
            cache_replay_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FuzzyThresholds {
    /// Max Levenshtein distance on the canonical producer.
    pub producer: usize,
    /// Max Levenshtein distance on the canonical wine name.
    pub wine: usize,
}

impl Default for FuzzyThresholds {
    fn default() -> Self {
        Self {
            producer: 2,
            wine: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = BTreeMap::new();

        let mut gemini_models = BTreeMap::new();
        gemini_models.insert(
            "gemini-2.0-flash".to_string(),
            ModelCaps {
                supports_vision: true,
                supports_tools: true,
                supports_grounding: true,
                supports_thinking: true,
            },
        );
        gemini_models.insert(
            "gemini-2.0-flash-lite".to_string(),
            ModelCaps {
                supports_vision: true,
                supports_tools: false,
                supports_grounding: false,
                supports_thinking: false,
            },
        );
        providers.insert(
            "gemini".to_string(),
            ProviderConfig {
                default_model: "gemini-2.0-flash".into(),
                fallback_model: Some("gemini-2.0-flash-lite".into()),
                models: gemini_models,
                ..Default::default()
            },
        );

        let mut claude_models = BTreeMap::new();
        claude_models.insert(
            "claude-3-5-sonnet-latest".to_string(),
            ModelCaps {
                supports_vision: true,
                supports_tools: true,
                supports_grounding: false,
                supports_thinking: false,
            },
        );
        claude_models.insert(
            "claude-3-opus-latest".to_string(),
            ModelCaps {
                supports_vision: true,
                supports_tools: true,
                supports_grounding: false,
                supports_thinking: false,
            },
        );
        providers.insert(
            "claude".to_string(),
            ProviderConfig {
                default_model: "claude-3-5-sonnet-latest".into(),
                fallback_model: Some("claude-3-5-sonnet-latest".into()),
                timeout_secs: 60,
                models: claude_models,
                ..Default::default()
            },
        );

        let mut task_routing = BTreeMap::new();
        for task in ["identify_text", "identify_image"] {
            task_routing.insert(
                task.to_string(),
                TaskRoute {
                    primary: RouteTarget {
                        provider: "gemini".into(),
                        model: "gemini-2.0-flash".into(),
                    },
                    fallback: Some(RouteTarget {
                        provider: "claude".into(),
                        model: "claude-3-5-sonnet-latest".into(),
                    }),
                },
            );
        }
        task_routing.insert(
            "enrich".to_string(),
            TaskRoute {
                primary: RouteTarget {
                    provider: "gemini".into(),
                    model: "gemini-2.0-flash".into(),
                },
                fallback: Some(RouteTarget {
                    provider: "claude".into(),
                    model: "claude-3-5-sonnet-latest".into(),
                }),
            },
        );
        task_routing.insert(
            "clarify_match".to_string(),
            TaskRoute {
                primary: RouteTarget {
                    provider: "gemini".into(),
                    model: "gemini-2.0-flash-lite".into(),
                },
                fallback: None,
            },
        );

        Self {
            port: 8470,
            database_url: "postgres://localhost/sommelier".into(),
            cancel_dir: std::env::temp_dir().join("sommelier-cancel"),
            providers,
            task_routing,
            tiers: TierLadder::default(),
            limits: Limits::default(),
            retry: RetryConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            streaming: StreamingConfig::default(),
            confidence: ConfidenceConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

impl Config {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn route(&self, task: &str) -> Option<&TaskRoute> {
        self.task_routing.get(task)
    }

    pub fn model_caps(&self, provider: &str, model: &str) -> ModelCaps {
        self.providers
            .get(provider)
            .and_then(|p| p.models.get(model).copied())
            .unwrap_or_default()
    }

    pub fn streams_task(&self, task: &str) -> bool {
        self.streaming.enabled && self.streaming.tasks.iter().any(|t| t == task)
    }
}

/// Load configuration: defaults ← YAML file (SOMMELIER_CONFIG) ← env.
pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let mut cfg: Config = match std::env::var("SOMMELIER_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("cannot read config file {}: {}", path, e))?;
            serde_yaml::from_str(&raw)?
        }
        Err(_) => Config::default(),
    };

    if let Ok(url) = std::env::var("DATABASE_URL") {
        cfg.database_url = url;
    }
    if let Ok(port) = std::env::var("SOMMELIER_PORT") {
        cfg.port = port.parse().unwrap_or(cfg.port);
    }
    if let Ok(dir) = std::env::var("SOMMELIER_CANCEL_DIR") {
        cfg.cancel_dir = PathBuf::from(dir);
    }

    // Secrets always come from the environment, overriding any file value.
    if let Some(p) = cfg.providers.get_mut("gemini") {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            p.api_key = key;
        }
    }
    if let Some(p) = cfg.providers.get_mut("claude") {
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            p.api_key = key;
        }
    }

    for (name, p) in &cfg.providers {
        if p.enabled && p.api_key.is_empty() {
            tracing::warn!("provider '{}' is enabled but has no API key", name);
        }
    }

    Ok(cfg)
}
