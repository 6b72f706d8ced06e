use serde::{Deserialize, Serialize};

/// Top-level engine configuration loaded from `workflow-engine.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub discovery: DiscoveryConfig,
    pub limits: LimitsConfig,
    pub defaults: DefaultsConfig,
    /// Disables server-internal batching: every server-internal step is
    /// also surfaced to the client as a trace-only descriptor (§4.4, §4.8).
    pub debug: bool,
}

/// Workflow file discovery directories (§6): project-local first, then
/// user-home, each rooted under `.aromcp/workflows/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiscoveryConfig {
    pub project_dir: Option<String>,
    pub home_dir: Option<String>,
}

/// Resource limits enforced by the engine (§5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    pub max_state_bytes: u64,
    pub max_concurrent_workflows: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_state_bytes: 100 * 1024 * 1024,
            max_concurrent_workflows: 64,
        }
    }
}

/// Defaults applied when a workflow or step omits its own value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultsConfig {
    pub max_iterations: u32,
    pub step_timeout_seconds: u64,
    pub workflow_timeout_seconds: u64,
    pub max_parallel: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub retry_backoff_cap_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            step_timeout_seconds: 300,
            workflow_timeout_seconds: 3600,
            max_parallel: 10,
            retry_backoff_base_ms: 200,
            retry_backoff_multiplier: 2.0,
            retry_backoff_cap_ms: 30_000,
        }
    }
}
