//! A single running workflow instance (§4, §6): owns the state store,
//! control stack, and (while a `parallel_foreach` is in flight) the
//! sub-agent manager for one run, driven one `get_next_step`/`step_complete`
//! call at a time by an external client loop. `WorkflowEngine` (`engine.rs`)
//! owns the registry of these; this type owns only one run's lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::config::DefaultsConfig;
use crate::control::ControlStack;
use crate::error::{EngineError, Result};
use crate::exec::{self, Advance, StepDescriptor, StepOutcome, StepResult, SubAgentDispatch};
use crate::loader::WorkflowDef;
use crate::path::Path;
use crate::session::SessionRecord;
use crate::state::{StateStore, Update};
use crate::subagent::SubAgentManager;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatusKind {
    Running,
    WaitingForClient,
    WaitingForSubAgents,
    Completed,
    Failed,
    Cancelled,
}

/// Where execution currently stands. Kept separate from `InstanceStatusKind`
/// because the `AwaitingClient`/`AwaitingSubAgents` variants carry the state
/// needed to resume, not just a label.
enum Phase {
    Active,
    AwaitingClient(StepDescriptor),
    AwaitingSubAgents(SubAgentManager),
    Done,
    Failed(String),
    Cancelled,
}

/// A point-in-time snapshot for `workflow.status` (§4.8, §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub id: Uuid,
    pub workflow_name: String,
    pub kind: InstanceStatusKind,
    pub step_counts: HashMap<String, u32>,
    pub retry_count: u32,
    pub error_count: u32,
    pub peak_state_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub struct WorkflowInstance {
    pub id: Uuid,
    def: Arc<WorkflowDef>,
    store: StateStore,
    stack: ControlStack,
    session: SessionRecord,
    phase: Phase,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    deadline: Option<Instant>,
    max_state_bytes: u64,
}

impl WorkflowInstance {
    pub fn new(def: Arc<WorkflowDef>, inputs: Json, defaults: &DefaultsConfig, max_state_bytes: u64) -> Result<WorkflowInstance> {
        let graph = def.build_computed_graph()?;
        let store = StateStore::new(Value::from_json(inputs), Value::from_json(def.default_state.clone()), graph)?;
        let stack = ControlStack::new(def.steps.clone());
        let timeout = def.config.timeout_seconds.unwrap_or(defaults.workflow_timeout_seconds);
        Ok(WorkflowInstance {
            id: Uuid::new_v4(),
            def,
            store,
            stack,
            session: SessionRecord::default(),
            phase: Phase::Active,
            started_at: Utc::now(),
            ended_at: None,
            deadline: Some(Instant::now() + Duration::from_secs(timeout)),
            max_state_bytes,
        })
    }

    pub fn workflow_name(&self) -> &str {
        &self.def.name
    }

    /// Flips an overdue instance to `Failed` and reports the timeout, rather
    /// than letting it silently keep accepting calls past its deadline
    /// (§4.7 workflow-level timeout).
    fn check_deadline(&mut self) -> Result<()> {
        let overdue = self.deadline.is_some_and(|d| Instant::now() >= d);
        if overdue && !self.is_terminal() {
            self.phase = Phase::Failed("workflow timeout exceeded".to_string());
            self.ended_at = Some(Utc::now());
            return Err(EngineError::Timeout(Duration::from_secs(0)));
        }
        Ok(())
    }

    /// Records the current state size for `status()` reporting and enforces
    /// `EngineConfig.limits.max_state_bytes` (§5 resource policy): an instance
    /// that grows its state past the limit fails rather than growing
    /// unbounded.
    fn observe_state_bytes(&mut self) -> Result<()> {
        let bytes = self.store.state_size_bytes() as u64;
        self.session.observe_state_bytes(bytes);
        if bytes > self.max_state_bytes {
            let message = format!("state size {bytes} bytes exceeds max_state_bytes ({})", self.max_state_bytes);
            self.phase = Phase::Failed(message.clone());
            self.ended_at = Some(Utc::now());
            return Err(EngineError::Internal(message));
        }
        Ok(())
    }

    /// One driving step (§6 `workflow.get_next_step`). `sub_agent_context`
    /// routes the call to that sub-agent task's own cursor instead of the
    /// top-level stack (§4.6.2) — only valid while a fan-out is in flight.
    pub fn get_next_step(&mut self, defaults: &DefaultsConfig, sub_agent_context: Option<&str>) -> Result<Option<StepDescriptor>> {
        self.check_deadline()?;

        if let Some(task_id) = sub_agent_context {
            let manager = match &mut self.phase {
                Phase::AwaitingSubAgents(manager) => manager,
                _ => return Err(EngineError::Internal("no active sub-agent fan-out for this workflow".to_string())),
            };
            return manager.get_next_step(&self.def, defaults, task_id);
        }

        match &self.phase {
            Phase::AwaitingClient(descriptor) => return Ok(Some(descriptor.clone())),
            Phase::AwaitingSubAgents(_) => return Ok(None),
            Phase::Done => return Ok(None),
            // §7 "rejects further get_next_step calls with Cancelled-like semantics".
            Phase::Failed(_) | Phase::Cancelled => return Err(EngineError::Cancelled),
            Phase::Active => {}
        }

        let advance = exec::step(&self.def, &self.store, &mut self.stack, defaults, false, &mut self.session);
        self.observe_state_bytes()?;
        match advance {
            Ok(Advance::Client(descriptor)) => {
                self.phase = Phase::AwaitingClient(descriptor.clone());
                Ok(Some(descriptor))
            }
            Ok(Advance::Done) => {
                self.phase = Phase::Done;
                self.ended_at = Some(Utc::now());
                Ok(None)
            }
            Ok(Advance::SubAgents(dispatch)) => self.start_sub_agents(dispatch),
            Err(EngineError::Cancelled) => {
                self.phase = Phase::Cancelled;
                self.ended_at = Some(Utc::now());
                Ok(None)
            }
            Err(err) => {
                self.phase = Phase::Failed(err.to_string());
                self.ended_at = Some(Utc::now());
                Err(err)
            }
        }
    }

    /// Materialize the sub-agent fan-out and hand the client a single
    /// `parallel_tasks` descriptor listing every task id (§4.6.2) — the
    /// client then drives each one by passing it back as `sub_agent_context`.
    fn start_sub_agents(&mut self, dispatch: SubAgentDispatch) -> Result<Option<StepDescriptor>> {
        let manager = SubAgentManager::start(&self.def, &self.store, &dispatch)?;
        let task_ids = manager.task_ids().to_vec();
        self.phase = Phase::AwaitingSubAgents(manager);
        Ok(Some(StepDescriptor {
            id: dispatch.step_id,
            kind: "parallel_tasks".to_string(),
            instructions: Json::String(format!("drive {} sub-agent task(s) via sub_agent_context", task_ids.len())),
            definition: serde_json::json!({ "task_ids": task_ids, "max_parallel": dispatch.max_parallel }),
            internal_trace: None,
        }))
    }

    /// Resolve a previously-returned descriptor (§6 `workflow.step_complete`).
    pub fn step_complete(&mut self, defaults: &DefaultsConfig, sub_agent_context: Option<&str>, result: StepResult) -> Result<()> {
        self.check_deadline()?;

        if let Some(task_id) = sub_agent_context {
            let joined = {
                let manager = match &mut self.phase {
                    Phase::AwaitingSubAgents(manager) => manager,
                    _ => return Err(EngineError::Internal("no active sub-agent fan-out for this workflow".to_string())),
                };
                manager.step_complete(defaults, task_id, result)?;
                manager.is_joined()
            };
            if joined {
                self.join_sub_agents()?;
            }
            return Ok(());
        }

        if !matches!(self.phase, Phase::AwaitingClient(_)) {
            return Err(EngineError::Internal("step_complete called with no pending client step".to_string()));
        }
        let outcome = exec::complete_client_step(&self.store, &mut self.stack, defaults, &mut self.session, result)?;
        self.observe_state_bytes()?;
        match outcome {
            StepOutcome::Advance => {
                self.phase = Phase::Active;
            }
            // The cached descriptor in `Phase::AwaitingClient` is still the
            // right one to re-issue; the client retries the same action.
            StepOutcome::Retry(_delay) => {}
            StepOutcome::Failed(err) => {
                self.phase = Phase::Failed(err.to_string());
                self.ended_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    /// Merge every sub-agent task's outcome into the parent store and resume
    /// the frame the `parallel_foreach` step itself lives in (§4.6.4-5).
    fn join_sub_agents(&mut self) -> Result<()> {
        let manager = match std::mem::replace(&mut self.phase, Phase::Active) {
            Phase::AwaitingSubAgents(manager) => manager,
            other => {
                self.phase = other;
                return Err(EngineError::Internal("join_sub_agents called without an active fan-out".to_string()));
            }
        };
        let recomputed = manager.join(&self.store)?;
        for field in &recomputed {
            self.session.record_recompute(field);
        }
        if let Some(top) = self.stack.top_mut() {
            top.pc += 1;
        }
        self.observe_state_bytes()?;
        Ok(())
    }

    /// `workflow.state_read` (§6): a specific dotted path, or the full
    /// `inputs`/`state`/`computed` snapshot when `path` is absent.
    pub fn state_read(&self, path: Option<&str>) -> Result<Json> {
        match path {
            Some(path) => Ok(self.store.read(&Path::parse(path)?)?.into_json()),
            None => {
                let flat = self.store.read_flat();
                Ok(serde_json::json!({
                    "inputs": flat.inputs.into_json(),
                    "state": flat.state.into_json(),
                    "computed": flat.computed.into_json(),
                }))
            }
        }
    }

    /// `workflow.state_update` (§6): a direct out-of-band write batch,
    /// bypassing the step cursor entirely. Used by operators/tests to patch
    /// state; ordinary workflow execution never needs it.
    pub fn apply_state_updates(&mut self, updates: &[Update]) -> Result<Vec<String>> {
        let recomputed = self.store.apply(updates)?;
        for field in &recomputed {
            self.session.record_recompute(field);
        }
        self.observe_state_bytes()?;
        Ok(recomputed)
    }

    pub fn status(&self) -> InstanceStatus {
        let kind = match &self.phase {
            Phase::Active => InstanceStatusKind::Running,
            Phase::AwaitingClient(_) => InstanceStatusKind::WaitingForClient,
            Phase::AwaitingSubAgents(_) => InstanceStatusKind::WaitingForSubAgents,
            Phase::Done => InstanceStatusKind::Completed,
            Phase::Failed(_) => InstanceStatusKind::Failed,
            Phase::Cancelled => InstanceStatusKind::Cancelled,
        };
        InstanceStatus {
            id: self.id,
            workflow_name: self.def.name.clone(),
            kind,
            step_counts: self.session.step_counts.clone(),
            retry_count: self.session.retry_count,
            error_count: self.session.error_count,
            peak_state_bytes: self.session.peak_state_bytes,
            started_at: self.started_at,
            ended_at: self.ended_at,
            error: match &self.phase {
                Phase::Failed(message) => Some(message.clone()),
                _ => None,
            },
        }
    }

    /// `workflow.stop` (§6): external cancellation. Idempotent on an
    /// already-terminal instance.
    pub fn cancel(&mut self) {
        if !self.is_terminal() {
            self.phase = Phase::Cancelled;
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Failed(_) | Phase::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_workflow;

    fn instance_for(yaml: &str, inputs: Json) -> WorkflowInstance {
        let (def, _) = parse_workflow(yaml).unwrap();
        WorkflowInstance::new(Arc::new(def), inputs, &DefaultsConfig::default(), 100 * 1024 * 1024).unwrap()
    }

    const S1: &str = r#"
name: demo:s1
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

    #[test]
    fn runs_to_a_client_step_then_to_completion() {
        let mut instance = instance_for(S1, Json::Null);
        let defaults = DefaultsConfig::default();

        let step = instance.get_next_step(&defaults, None).unwrap().expect("a client step");
        assert_eq!(step.definition["message"], "y=15");
        assert_eq!(instance.status().kind, InstanceStatusKind::WaitingForClient);

        instance.step_complete(&defaults, None, StepResult::ok(None)).unwrap();
        let done = instance.get_next_step(&defaults, None).unwrap();
        assert!(done.is_none());
        assert_eq!(instance.status().kind, InstanceStatusKind::Completed);
    }

    const PARALLEL: &str = r#"
name: demo:parallel
version: 1.0.0
default_state:
  state:
    results: {}
inputs:
  items:
    - 2
    - 3
steps:
  - type: parallel_foreach
    items: "inputs.items"
    sub_agent_task: square
    aggregation_path: state.results
  - type: user_message
    message: "done"
sub_agent_tasks:
  square:
    steps:
      - type: state_update
        path: state.result
        op: set
        value: "{{ item * item }}"
"#;

    #[test]
    fn parallel_foreach_fans_out_and_rejoins_the_parent_frame() {
        let mut instance = instance_for(PARALLEL, serde_json::json!({ "items": [2, 3] }));
        let defaults = DefaultsConfig::default();

        let fan_out = instance.get_next_step(&defaults, None).unwrap().expect("a parallel_tasks descriptor");
        assert_eq!(fan_out.kind, "parallel_tasks");
        assert_eq!(instance.status().kind, InstanceStatusKind::WaitingForSubAgents);
        let task_ids: Vec<String> = serde_json::from_value(fan_out.definition["task_ids"].clone()).unwrap();
        assert_eq!(task_ids.len(), 2);

        for task_id in &task_ids {
            let step = instance.get_next_step(&defaults, Some(task_id)).unwrap();
            assert!(step.is_none(), "a pure state_update sub-agent task needs no client step");
        }

        let resumed = instance.get_next_step(&defaults, None).unwrap().expect("resumed parent step");
        assert_eq!(resumed.definition["message"], "done");
        let results = instance.state_read(Some("state.results")).unwrap();
        assert_eq!(results["t0"], 4);
        assert_eq!(results["t1"], 9);
    }

    #[test]
    fn state_update_outside_of_the_step_cursor_recomputes() {
        let mut instance = instance_for(S1, Json::Null);
        instance
            .apply_state_updates(&[Update {
                path: Path::parse("state.x").unwrap(),
                op: crate::state::Op::Set,
                value: Value::number(10.0),
            }])
            .unwrap();
        assert_eq!(instance.state_read(Some("computed.y")).unwrap(), 30.0);
    }

    #[test]
    fn cancel_is_terminal_and_idempotent() {
        let mut instance = instance_for(S1, Json::Null);
        instance.cancel();
        assert_eq!(instance.status().kind, InstanceStatusKind::Cancelled);
        instance.cancel();
        assert_eq!(instance.status().kind, InstanceStatusKind::Cancelled);
    }
}
