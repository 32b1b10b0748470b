use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Bearer token for the admin endpoints. Agent and event sockets accept it as `?token=`.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18800
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Lower bound of the randomized gap between any two dispatched commands.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Upper bound of the randomized gap between any two dispatched commands.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Minimum gap between two commands dispatched to the same agent.
    #[serde(default = "default_agent_cooldown_ms")]
    pub agent_cooldown_ms: u64,
    /// How many dispatch outcomes to keep for status queries.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_min_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_agent_cooldown_ms() -> u64 {
    30_000
}

fn default_history_limit() -> usize {
    50
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            agent_cooldown_ms: default_agent_cooldown_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl QueueConfig {
    /// Global delay window as an ordered `(min, max)` pair.
    pub fn delay_window(&self) -> (Duration, Duration) {
        let (lo, hi) = ordered(self.min_delay_ms, self.max_delay_ms);
        (Duration::from_millis(lo), Duration::from_millis(hi))
    }

    pub fn agent_cooldown(&self) -> Duration {
        Duration::from_millis(self.agent_cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmConfig {
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: u32,
    #[serde(default = "default_jitter_minutes")]
    pub default_jitter_minutes: u32,
    /// Delay before retrying after a transient error or a stalled cycle.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Floor applied to the jittered next-run delay.
    #[serde(default = "default_min_run_delay_secs")]
    pub min_run_delay_secs: u64,
    /// A farming cycle with no matching telemetry for this long is marked stalled.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

fn default_interval_minutes() -> u32 {
    30
}

fn default_jitter_minutes() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    120
}

fn default_min_run_delay_secs() -> u64 {
    60
}

fn default_stall_timeout_secs() -> u64 {
    15 * 60
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: default_interval_minutes(),
            default_jitter_minutes: default_jitter_minutes(),
            retry_delay_secs: default_retry_delay_secs(),
            min_run_delay_secs: default_min_run_delay_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
        }
    }
}

impl FarmConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn min_run_delay(&self) -> Duration {
        Duration::from_secs(self.min_run_delay_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkConfig {
    /// How long a started agent has to produce telemetry before it is presumed failed.
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_stagger_min_secs")]
    pub stagger_min_secs: u64,
    #[serde(default = "default_stagger_max_secs")]
    pub stagger_max_secs: u64,
    #[serde(default)]
    pub randomize_min_minutes: u32,
    #[serde(default = "default_randomize_max_minutes")]
    pub randomize_max_minutes: u32,
    /// Floors for randomized per-agent settings.
    #[serde(default = "default_min_interval_minutes")]
    pub min_interval_minutes: u32,
    #[serde(default)]
    pub min_jitter_minutes: u32,
}

fn default_confirm_timeout_secs() -> u64 {
    30
}

fn default_stagger_min_secs() -> u64 {
    20
}

fn default_stagger_max_secs() -> u64 {
    60
}

fn default_randomize_max_minutes() -> u32 {
    3
}

fn default_min_interval_minutes() -> u32 {
    5
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: default_confirm_timeout_secs(),
            stagger_min_secs: default_stagger_min_secs(),
            stagger_max_secs: default_stagger_max_secs(),
            randomize_min_minutes: 0,
            randomize_max_minutes: default_randomize_max_minutes(),
            min_interval_minutes: default_min_interval_minutes(),
            min_jitter_minutes: 0,
        }
    }
}

impl BulkConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub farm: FarmConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Admin token from config, falling back to `FARMHAND_API_TOKEN`.
    pub fn api_token(&self) -> Option<String> {
        self.gateway
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| {
                std::env::var("FARMHAND_API_TOKEN")
                    .ok()
                    .filter(|t| !t.trim().is_empty())
            })
    }
}

/// Returns `(min, max)` regardless of the order the bounds were configured in.
pub fn ordered<T: PartialOrd>(a: T, b: T) -> (T, T) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
