use serde::{Deserialize, Serialize};

/// Tunables for the agent driver, orchestrator, and watchdog.
///
/// None of these are per-request — they are process-wide policy read once
/// at startup, mirroring the rest of the config tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Max tool-calling loop iterations per driver invocation.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    /// Extra "context reset" attempts a Developer gets before the
    /// orchestrator gives up on a subtask.
    #[serde(default = "d_max_context_resets")]
    pub max_context_resets: u32,
    /// Seconds the driver may wait in-place for a rate-limited service to
    /// become available again before surfacing `RateLimited` upward.
    #[serde(default = "d_availability_wait_secs")]
    pub availability_wait_secs: u64,
    /// Sub-agent nesting depth and duration limits.
    #[serde(default)]
    pub sub_agent: SubAgentConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub storage: TicketStorageConfig,
    #[serde(default)]
    pub repetition: RepetitionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_max_iterations(),
            max_context_resets: d_max_context_resets(),
            availability_wait_secs: d_availability_wait_secs(),
            sub_agent: SubAgentConfig::default(),
            watchdog: WatchdogConfig::default(),
            storage: TicketStorageConfig::default(),
            repetition: RepetitionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentConfig {
    #[serde(default = "d_max_depth")]
    pub max_depth: u32,
    #[serde(default = "d_max_concurrent_children")]
    pub max_concurrent_children: u32,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            max_depth: d_max_depth(),
            max_concurrent_children: d_max_concurrent_children(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "d_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "d_stale_after_secs")]
    pub stale_after_secs: i64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: d_sweep_interval_secs(),
            stale_after_secs: d_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStorageConfig {
    #[serde(default = "d_tickets_dir")]
    pub tickets_dir: String,
    #[serde(default = "d_conversations_dir")]
    pub conversations_dir: String,
    #[serde(default = "d_prompts_dir")]
    pub prompts_dir: String,
}

impl Default for TicketStorageConfig {
    fn default() -> Self {
        Self {
            tickets_dir: d_tickets_dir(),
            conversations_dir: d_conversations_dir(),
            prompts_dir: d_prompts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepetitionConfig {
    #[serde(default = "d_warn_count")]
    pub warn_count: u32,
    #[serde(default = "d_terminate_count")]
    pub terminate_count: u32,
}

impl Default for RepetitionConfig {
    fn default() -> Self {
        Self {
            warn_count: d_warn_count(),
            terminate_count: d_terminate_count(),
        }
    }
}

fn d_max_iterations() -> u32 {
    25
}
fn d_max_context_resets() -> u32 {
    2
}
fn d_availability_wait_secs() -> u64 {
    20
}
fn d_max_depth() -> u32 {
    6
}
fn d_max_concurrent_children() -> u32 {
    8
}
fn d_sweep_interval_secs() -> u64 {
    60
}
fn d_stale_after_secs() -> i64 {
    300
}
fn d_tickets_dir() -> String {
    "env/tickets".into()
}
fn d_conversations_dir() -> String {
    "env/conversations".into()
}
fn d_prompts_dir() -> String {
    "env/prompts".into()
}
fn d_warn_count() -> u32 {
    3
}
fn d_terminate_count() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_iterations, 25);
        assert_eq!(cfg.max_context_resets, 2);
        assert_eq!(cfg.watchdog.sweep_interval_secs, 60);
        assert_eq!(cfg.watchdog.stale_after_secs, 300);
        assert_eq!(cfg.repetition.warn_count, 3);
        assert_eq!(cfg.repetition.terminate_count, 5);
    }

    #[test]
    fn deserializes_partial_override() {
        let json = r#"{ "max_iterations": 10 }"#;
        let cfg: OrchestratorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_iterations, 10);
        assert_eq!(cfg.max_context_resets, 2);
    }
}
