//! Workflow definition types (§3, §6): the YAML-level raw shape and the
//! validated, immutable `WorkflowDef` the rest of the engine consumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::expr::Expr;
use crate::state::{ComputedGraph, ErrorPolicy};

// ---------------------------------------------------------------------------
// Raw YAML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub config: WorkflowConfig,
    #[serde(default)]
    pub default_state: DefaultState,
    #[serde(default)]
    pub state_schema: StateSchema,
    #[serde(default)]
    pub inputs: HashMap<String, Json>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub sub_agent_tasks: HashMap<String, SubAgentTaskDef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkflowConfig {
    pub timeout_seconds: Option<u64>,
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DefaultState {
    #[serde(default)]
    pub state: Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StateSchema {
    #[serde(default)]
    pub inputs: HashMap<String, Json>,
    #[serde(default)]
    pub state: HashMap<String, Json>,
    #[serde(default)]
    pub computed: HashMap<String, ComputedFieldDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComputedFieldDef {
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub transform: String,
    #[serde(default)]
    pub error_policy: ErrorPolicyDef,
    #[serde(default)]
    pub fallback: Option<Json>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicyDef {
    UseFallback,
    #[default]
    Propagate,
    Ignore,
}

impl From<ErrorPolicyDef> for ErrorPolicy {
    fn from(d: ErrorPolicyDef) -> Self {
        match d {
            ErrorPolicyDef::UseFallback => ErrorPolicy::UseFallback,
            ErrorPolicyDef::Propagate => ErrorPolicy::Propagate,
            ErrorPolicyDef::Ignore => ErrorPolicy::Ignore,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpName {
    #[default]
    Set,
    Increment,
    Decrement,
    Multiply,
    Append,
    Merge,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    #[default]
    Server,
    Client,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Step {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub body: StepBody,
    #[serde(default)]
    pub error_handling: Option<ErrorHandling>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepBody {
    StateUpdate {
        path: String,
        #[serde(default)]
        op: OpName,
        #[serde(default)]
        value: Json,
    },
    ShellCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        execution_context: ExecutionContext,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        output_path: Option<String>,
    },
    Conditional {
        condition: String,
        #[serde(default)]
        then_steps: Vec<Step>,
        #[serde(default)]
        else_steps: Vec<Step>,
    },
    While {
        condition: String,
        body: Vec<Step>,
        #[serde(default)]
        max_iterations: Option<u32>,
    },
    Foreach {
        items: String,
        body: Vec<Step>,
    },
    ParallelForeach {
        items: String,
        sub_agent_task: String,
        #[serde(default)]
        max_parallel: Option<u32>,
        #[serde(default = "default_true")]
        wait_for_all: bool,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        aggregation_path: String,
    },
    Break,
    Continue,
    UserMessage {
        message: String,
    },
    UserInput {
        prompt: String,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        choices: Option<Vec<String>>,
        #[serde(default)]
        state_path: Option<String>,
    },
    McpCall {
        tool: String,
        #[serde(default)]
        parameters: Json,
        #[serde(default)]
        output_path: Option<String>,
    },
    AgentPrompt {
        prompt: String,
        #[serde(default)]
        response_schema: Option<Json>,
        #[serde(default)]
        output_path: Option<String>,
    },
    AgentShellCommand {
        command: String,
        #[serde(default)]
        output_path: Option<String>,
    },
    WaitStep,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorHandling {
    pub strategy: ErrorStrategy,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Option<BackoffOverride>,
    #[serde(default)]
    pub fallback_value: Option<Json>,
    #[serde(default)]
    pub error_state_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    Fail,
    Continue,
    Retry,
    Fallback,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackoffOverride {
    pub base_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub cap_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubAgentTaskDef {
    #[serde(default)]
    pub input_schema: HashMap<String, Json>,
    pub steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Validated, immutable form
// ---------------------------------------------------------------------------

/// A sub-agent task template, with its step body pre-parsed the same way
/// the top-level step list is.
#[derive(Debug, Clone)]
pub struct SubAgentTask {
    pub id: String,
    pub steps: Vec<Step>,
}

/// The immutable, validated workflow definition (§3). Built once by the
/// loader; shared (read-only) by every instance created from it.
#[derive(Debug, Clone)]
pub struct WorkflowDef {
    pub name: String,
    pub description: String,
    pub version: String,
    pub config: WorkflowConfig,
    pub default_state: Json,
    pub inputs_schema: HashMap<String, Json>,
    pub steps: Vec<Step>,
    pub sub_agent_tasks: HashMap<String, SubAgentTask>,
    pub computed_fields: Vec<ComputedFieldSource>,
}

/// A computed field definition with its transform already parsed to an
/// `Expr`, paired with `ComputedGraph::new` to build the runtime graph.
#[derive(Debug, Clone)]
pub struct ComputedFieldSource {
    pub name: String,
    pub dependencies: Vec<String>,
    pub transform_src: String,
    pub transform: Expr,
    pub error_policy: ErrorPolicy,
    pub fallback: Option<Json>,
}

impl WorkflowDef {
    /// Build a fresh `ComputedGraph` for a new instance of this definition.
    /// The graph is stateless configuration, so each instance gets its own.
    pub fn build_computed_graph(&self) -> crate::error::Result<ComputedGraph> {
        let fields = self
            .computed_fields
            .iter()
            .map(|c| crate::state::ComputedField {
                name: c.name.clone(),
                dependencies: c.dependencies.clone(),
                transform: c.transform.clone(),
                error_policy: c.error_policy,
                fallback: c.fallback.clone().map(crate::value::Value::from_json),
            })
            .collect();
        ComputedGraph::new(fields)
    }
}
