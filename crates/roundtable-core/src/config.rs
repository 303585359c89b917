use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoundtableError};

/// Top-level config (`roundtable.toml` + `ROUNDTABLE_*` env overrides).
///
/// All fields have defaults so an empty TOML file (or none at all) produces
/// a usable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundtableConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub room: RoomConfig,
}

impl Default for RoundtableConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            turn: TurnConfig::default(),
            sync: SyncConfig::default(),
            transport: TransportConfig::default(),
            room: RoomConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    #[serde(default = "default_proactive_ms")]
    pub proactive_ms: u64,
    #[serde(default = "default_poke_after_ms")]
    pub poke_after_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            turn_timeout_ms: default_turn_timeout_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
            proactive_ms: default_proactive_ms(),
            poke_after_ms: default_poke_after_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_max_tool_calls_per_turn")]
    pub max_tool_calls_per_turn: usize,
    #[serde(default = "default_hop_timeout_ms")]
    pub hop_timeout_ms: u64,
    #[serde(default = "default_user_interject_window_ms")]
    pub user_interject_window_ms: i64,
    #[serde(default = "default_soc_cap_chars")]
    pub soc_cap_chars: usize,
    /// Baseline message count driving compaction's hysteresis watermarks:
    /// `HIGH = max(maxMsgs+6, ceil(1.5*maxMsgs))`, `LOW = max(floor(0.6*maxMsgs), 6)`.
    /// Also the number of trailing context messages folded into a hop's history.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            max_tool_calls_per_turn: default_max_tool_calls_per_turn(),
            hop_timeout_ms: default_hop_timeout_ms(),
            user_interject_window_ms: default_user_interject_window_ms(),
            soc_cap_chars: default_soc_cap_chars(),
            max_context_messages: default_max_context_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_lock_max_ms")]
    pub lock_max_ms: u64,
    #[serde(default = "default_transport_cooldown_ms")]
    pub transport_cooldown_ms: u64,
    #[serde(default = "default_transport_cap")]
    pub transport_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_max_ms: default_lock_max_ms(),
            transport_cooldown_ms: default_transport_cooldown_ms(),
            transport_cap: default_transport_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_idle_stream_ms")]
    pub idle_stream_ms: u64,
    #[serde(default = "default_hard_stop_ms")]
    pub hard_stop_ms: u64,
    #[serde(default = "default_connect_stages_ms")]
    pub connect_stages_ms: Vec<u64>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_stream_ms: default_idle_stream_ms(),
            hard_stop_ms: default_hard_stop_ms(),
            connect_stages_ms: default_connect_stages_ms(),
            base_url: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(default = "default_fresh_window_ms")]
    pub fresh_window_ms: i64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            fresh_window_ms: default_fresh_window_ms(),
        }
    }
}

fn default_tick_ms() -> u64 {
    400
}
fn default_turn_timeout_ms() -> u64 {
    8000
}
fn default_idle_backoff_ms() -> u64 {
    1000
}
fn default_proactive_ms() -> u64 {
    3000
}
fn default_poke_after_ms() -> u64 {
    30_000
}
fn default_max_hops() -> usize {
    10
}
fn default_max_tool_calls_per_turn() -> usize {
    6
}
fn default_hop_timeout_ms() -> u64 {
    600_000
}
fn default_user_interject_window_ms() -> i64 {
    1500
}
fn default_soc_cap_chars() -> usize {
    50 * 1024
}
fn default_max_context_messages() -> usize {
    20
}
fn default_lock_max_ms() -> u64 {
    15 * 60 * 1000
}
fn default_transport_cooldown_ms() -> u64 {
    150
}
fn default_transport_cap() -> usize {
    1
}
fn default_idle_stream_ms() -> u64 {
    150_000
}
fn default_hard_stop_ms() -> u64 {
    300_000
}
fn default_connect_stages_ms() -> Vec<u64> {
    vec![5000, 10_000, 20_000]
}
fn default_fresh_window_ms() -> i64 {
    2000
}

impl RoundtableConfig {
    /// Load config from a TOML file with `ROUNDTABLE_*` env var overrides.
    ///
    /// `config_path` of `None` loads defaults merged only with env vars —
    /// there is no required on-disk file or fixed install directory.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(
            RoundtableConfig::default(),
        ));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("ROUNDTABLE_").split("_"));

        figment
            .extract()
            .map_err(|e| RoundtableError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let cfg = RoundtableConfig::load(None).unwrap();
        assert_eq!(cfg.scheduler.tick_ms, 400);
        assert_eq!(cfg.turn.max_hops, 10);
        assert_eq!(cfg.sync.transport_cap, 1);
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var("ROUNDTABLE_SCHEDULER_TICK_MS", "77");
        let cfg = RoundtableConfig::load(None).unwrap();
        assert_eq!(cfg.scheduler.tick_ms, 77);
        std::env::remove_var("ROUNDTABLE_SCHEDULER_TICK_MS");
    }
}
