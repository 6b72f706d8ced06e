//! The transport-agnostic control API (§6): a plain trait (`Engine`)
//! implemented by an in-process, synchronous `WorkflowEngine`. A stdio/HTTP
//! front end (out of scope here) can implement the same trait without
//! touching the core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::exec::{StepDescriptor, StepResult};
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::loader::{self, OpName, WorkflowDef};
use crate::path::Path;
use crate::state::{Op, Update};
use crate::value::Value;

/// `{data: …}` or `{error: {kind, message, location?, context?}}` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineEnvelope<T> {
    Ok { data: T },
    Err { error: ErrorEnvelope },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Json>,
}

impl<T> EngineEnvelope<T> {
    pub fn ok(data: T) -> Self {
        EngineEnvelope::Ok { data }
    }

    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(data) => EngineEnvelope::ok(data),
            Err(err) => EngineEnvelope::Err {
                error: ErrorEnvelope { kind: err.kind(), message: err.to_string(), location: None, context: None },
            },
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            EngineEnvelope::Ok { data } => Ok(data),
            EngineEnvelope::Err { error } => Err(error.into_engine_error()),
        }
    }
}

impl ErrorEnvelope {
    /// Rebuilds an `EngineError` of the same `kind` this envelope carries,
    /// so a round trip through the envelope doesn't collapse every error
    /// into `Internal` (§6/§7: the envelope must preserve the taxonomy).
    fn into_engine_error(self) -> EngineError {
        match self.kind {
            ErrorKind::ValidationError => EngineError::Validation(crate::error::ValidationFailure {
                issues: vec![crate::error::ValidationIssue { location: String::new(), message: self.message }],
            }),
            ErrorKind::PathError => EngineError::Path(self.message),
            ErrorKind::ExpressionError => EngineError::Expression(self.message),
            ErrorKind::Timeout => EngineError::Timeout(std::time::Duration::from_secs(0)),
            ErrorKind::ToolError => EngineError::Tool(self.message),
            ErrorKind::ValidationRejected => EngineError::ValidationRejected(self.message),
            ErrorKind::LoopBound => EngineError::LoopBound(self.message),
            ErrorKind::Cancelled => EngineError::Cancelled,
            ErrorKind::Internal => EngineError::Internal(self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub description: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOutput {
    pub workflow_id: Uuid,
    pub state: Json,
}

/// One entry of `workflow.state_update`'s request batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdateRequest {
    pub path: String,
    pub op: OpName,
    pub value: Json,
}

fn op_from_name(op: OpName) -> Op {
    match op {
        OpName::Set => Op::Set,
        OpName::Increment => Op::Increment,
        OpName::Decrement => Op::Decrement,
        OpName::Multiply => Op::Multiply,
        OpName::Append => Op::Append,
        OpName::Merge => Op::Merge,
    }
}

/// The control API (§6), expressed as a plain trait so a transport adapter
/// can wrap it without depending on this crate's internals.
pub trait Engine {
    fn info(&self, name: &str) -> EngineEnvelope<WorkflowInfo>;
    fn start(&self, name: &str, inputs: Json) -> EngineEnvelope<StartOutput>;
    fn get_next_step(&self, workflow_id: Uuid, sub_agent_context: Option<&str>) -> EngineEnvelope<Option<StepDescriptor>>;
    fn step_complete(&self, workflow_id: Uuid, sub_agent_context: Option<&str>, result: StepResult) -> EngineEnvelope<()>;
    fn state_read(&self, workflow_id: Uuid, path: Option<&str>) -> EngineEnvelope<Json>;
    fn state_update(&self, workflow_id: Uuid, updates: Vec<StateUpdateRequest>) -> EngineEnvelope<()>;
    fn status(&self, workflow_id: Uuid) -> EngineEnvelope<InstanceStatus>;
    fn stop(&self, workflow_id: Uuid) -> EngineEnvelope<()>;
}

/// The in-process control-API implementation: a workflow-definition cache
/// plus a registry of live instances, each driven synchronously behind a
/// lock (§9 "cooperative scheduling" — no instance runs on its own thread;
/// concurrency comes from many external callers taking turns).
pub struct WorkflowEngine {
    config: EngineConfig,
    defs: Mutex<HashMap<String, Arc<WorkflowDef>>>,
    instances: Mutex<HashMap<Uuid, WorkflowInstance>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> WorkflowEngine {
        WorkflowEngine { config, defs: Mutex::new(HashMap::new()), instances: Mutex::new(HashMap::new()) }
    }

    fn resolve_def(&self, name: &str) -> Result<Arc<WorkflowDef>> {
        let mut defs = self.defs.lock().expect("defs lock poisoned");
        if let Some(def) = defs.get(name) {
            return Ok(Arc::clone(def));
        }
        let (def, outcome) =
            loader::load_workflow(name, self.config.discovery.project_dir.as_deref(), self.config.discovery.home_dir.as_deref())?;
        for warning in &outcome.warnings {
            warn!(workflow = name, "{warning}");
        }
        let def = Arc::new(def);
        defs.insert(name.to_string(), Arc::clone(&def));
        Ok(def)
    }

    fn with_instance<R>(&self, workflow_id: Uuid, f: impl FnOnce(&mut WorkflowInstance) -> Result<R>) -> Result<R> {
        let mut instances = self.instances.lock().expect("instances lock poisoned");
        let instance = instances
            .get_mut(&workflow_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow instance '{workflow_id}' not found")))?;
        f(instance)
    }

    fn info_inner(&self, name: &str) -> Result<WorkflowInfo> {
        let def = self.resolve_def(name)?;
        Ok(WorkflowInfo { name: def.name.clone(), description: def.description.clone(), version: def.version.clone() })
    }

    fn start_inner(&self, name: &str, inputs: Json) -> Result<StartOutput> {
        let def = self.resolve_def(name)?;
        let mut instances = self.instances.lock().expect("instances lock poisoned");
        if instances.len() as u32 >= self.config.limits.max_concurrent_workflows {
            return Err(EngineError::Internal(format!(
                "max_concurrent_workflows ({}) reached",
                self.config.limits.max_concurrent_workflows
            )));
        }
        let instance = WorkflowInstance::new(Arc::clone(&def), inputs, &self.config.defaults, self.config.limits.max_state_bytes)?;
        let workflow_id = instance.id;
        let state = instance.state_read(None)?;
        info!(%workflow_id, workflow = %def.name, "workflow instance started");
        instances.insert(workflow_id, instance);
        Ok(StartOutput { workflow_id, state })
    }

    fn get_next_step_inner(&self, workflow_id: Uuid, sub_agent_context: Option<&str>) -> Result<Option<StepDescriptor>> {
        self.with_instance(workflow_id, |instance| instance.get_next_step(&self.config.defaults, sub_agent_context))
    }

    fn step_complete_inner(&self, workflow_id: Uuid, sub_agent_context: Option<&str>, result: StepResult) -> Result<()> {
        self.with_instance(workflow_id, |instance| instance.step_complete(&self.config.defaults, sub_agent_context, result))
    }

    fn state_read_inner(&self, workflow_id: Uuid, path: Option<&str>) -> Result<Json> {
        self.with_instance(workflow_id, |instance| instance.state_read(path))
    }

    fn state_update_inner(&self, workflow_id: Uuid, updates: Vec<StateUpdateRequest>) -> Result<()> {
        let updates = updates
            .into_iter()
            .map(|u| Ok(Update { path: Path::parse(&u.path)?, op: op_from_name(u.op), value: Value::from_json(u.value) }))
            .collect::<Result<Vec<_>>>()?;
        self.with_instance(workflow_id, |instance| {
            let bytes = instance.apply_state_updates(&updates)?;
            let _ = bytes;
            Ok(())
        })
    }

    fn status_inner(&self, workflow_id: Uuid) -> Result<InstanceStatus> {
        self.with_instance(workflow_id, |instance| Ok(instance.status()))
    }

    fn stop_inner(&self, workflow_id: Uuid) -> Result<()> {
        self.with_instance(workflow_id, |instance| {
            instance.cancel();
            Ok(())
        })
    }
}

impl Engine for WorkflowEngine {
    fn info(&self, name: &str) -> EngineEnvelope<WorkflowInfo> {
        EngineEnvelope::from_result(self.info_inner(name))
    }

    fn start(&self, name: &str, inputs: Json) -> EngineEnvelope<StartOutput> {
        EngineEnvelope::from_result(self.start_inner(name, inputs))
    }

    fn get_next_step(&self, workflow_id: Uuid, sub_agent_context: Option<&str>) -> EngineEnvelope<Option<StepDescriptor>> {
        EngineEnvelope::from_result(self.get_next_step_inner(workflow_id, sub_agent_context))
    }

    fn step_complete(&self, workflow_id: Uuid, sub_agent_context: Option<&str>, result: StepResult) -> EngineEnvelope<()> {
        EngineEnvelope::from_result(self.step_complete_inner(workflow_id, sub_agent_context, result))
    }

    fn state_read(&self, workflow_id: Uuid, path: Option<&str>) -> EngineEnvelope<Json> {
        EngineEnvelope::from_result(self.state_read_inner(workflow_id, path))
    }

    fn state_update(&self, workflow_id: Uuid, updates: Vec<StateUpdateRequest>) -> EngineEnvelope<()> {
        EngineEnvelope::from_result(self.state_update_inner(workflow_id, updates))
    }

    fn status(&self, workflow_id: Uuid) -> EngineEnvelope<InstanceStatus> {
        EngineEnvelope::from_result(self.status_inner(workflow_id))
    }

    fn stop(&self, workflow_id: Uuid) -> EngineEnvelope<()> {
        EngineEnvelope::from_result(self.stop_inner(workflow_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_workflow(dir: &tempfile::TempDir, contents: &str) {
        let workflows_dir = dir.path().join(".aromcp/workflows");
        std::fs::create_dir_all(&workflows_dir).unwrap();
        std::fs::write(workflows_dir.join("demo:s1.yaml"), contents).unwrap();
    }

    const S1: &str = r#"
name: demo:s1
description: a minimal demo workflow
version: 1.0.0
default_state:
  state:
    x: 2
state_schema:
  computed:
    y:
      dependencies: ["state.x"]
      transform: "state.x * 3"
steps:
  - type: state_update
    path: state.x
    op: set
    value: 5
  - type: user_message
    message: "y={{ computed.y }}"
"#;

    fn engine_with(dir: &tempfile::TempDir) -> WorkflowEngine {
        let mut config = EngineConfig::default();
        config.discovery.project_dir = Some(dir.path().to_string_lossy().to_string());
        WorkflowEngine::new(config)
    }

    #[test]
    fn info_reads_workflow_metadata_without_starting_it() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(&dir, S1);
        let engine = engine_with(&dir);
        let info = engine.info("demo:s1").into_result().unwrap();
        assert_eq!(info.version, "1.0.0");
        assert_eq!(info.description, "a minimal demo workflow");
    }

    #[test]
    fn full_round_trip_start_step_status_stop() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(&dir, S1);
        let engine = engine_with(&dir);

        let start = engine.start("demo:s1", Json::Null).into_result().unwrap();
        let workflow_id = start.workflow_id;

        let step = engine.get_next_step(workflow_id, None).into_result().unwrap().expect("a client step");
        assert_eq!(step.definition["message"], "y=15");

        engine.step_complete(workflow_id, None, StepResult::ok(None)).into_result().unwrap();
        let done = engine.get_next_step(workflow_id, None).into_result().unwrap();
        assert!(done.is_none());

        let status = engine.status(workflow_id).into_result().unwrap();
        assert_eq!(status.kind, crate::instance::InstanceStatusKind::Completed);

        engine.stop(workflow_id).into_result().unwrap();
    }

    #[test]
    fn state_read_and_state_update_bypass_the_step_cursor() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(&dir, S1);
        let engine = engine_with(&dir);
        let start = engine.start("demo:s1", Json::Null).into_result().unwrap();

        engine
            .state_update(
                start.workflow_id,
                vec![StateUpdateRequest { path: "state.x".to_string(), op: OpName::Set, value: Json::from(9) }],
            )
            .into_result()
            .unwrap();

        let y = engine.state_read(start.workflow_id, Some("computed.y")).into_result().unwrap();
        assert_eq!(y, 27.0);
    }

    #[test]
    fn unknown_workflow_instance_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir);
        let err = engine.status(Uuid::new_v4()).into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn max_concurrent_workflows_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(&dir, S1);
        let mut config = EngineConfig::default();
        config.discovery.project_dir = Some(dir.path().to_string_lossy().to_string());
        config.limits.max_concurrent_workflows = 1;
        let engine = WorkflowEngine::new(config);

        engine.start("demo:s1", Json::Null).into_result().unwrap();
        let err = engine.start("demo:s1", Json::Null).into_result().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_workflows"));
    }
}
