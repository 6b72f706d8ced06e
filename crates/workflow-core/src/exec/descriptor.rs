//! Types crossing the client boundary: the step descriptor returned by
//! `get_next_step` and the result reported back via `step_complete` (§6).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One atomic action the client must perform, or a trace-only record of a
/// server-internal step executed while `EngineConfig.debug` is set (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub instructions: Json,
    pub definition: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_trace: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

/// The client's report of a completed (or failed) delegated step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<Json>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl StepResult {
    pub fn ok(output: Option<Json>) -> Self {
        StepResult { status: StepStatus::Ok, output, error_message: None }
    }
}

/// What the outer driver (a `WorkflowInstance`) must do after one call to
/// `exec::step` (§4.4, §4.5, §4.6).
pub enum Advance {
    /// Return this descriptor to the client and suspend until `step_complete`.
    Client(StepDescriptor),
    /// `parallel_foreach` needs a `SubAgentManager`; the instance layer owns
    /// sub-agent lifecycle, exec only evaluates the fan-out request.
    SubAgents(SubAgentDispatch),
    /// The instance has no more steps to run.
    Done,
}

#[derive(Debug, Clone)]
pub struct SubAgentDispatch {
    pub step_id: String,
    pub items: Vec<Json>,
    pub sub_agent_task: String,
    pub max_parallel: u32,
    pub wait_for_all: bool,
    pub timeout_seconds: Option<u64>,
    pub aggregation_path: String,
}
