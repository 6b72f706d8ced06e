//! Sub-agent fan-out for `parallel_foreach` (§4.6). Each item gets its own
//! isolated `SubAgentRun` — its own `StateStore` and `ControlStack`, driven
//! through the same `exec::step`/`exec::complete_client_step` machinery a
//! top-level instance uses — rather than a shared mutable namespace cut out
//! of the parent's state. Isolation is therefore architectural (a task
//! physically cannot reach another task's or the parent's state) rather
//! than enforced by a runtime path allow-list; results only ever cross back
//! into the parent store through `SubAgentManager::join`'s single merge.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value as Json;

use crate::config::DefaultsConfig;
use crate::control::{ControlStack, Frame, FrameKind};
use crate::error::{EngineError, Result};
use crate::exec::{self, Advance, StepDescriptor, StepOutcome, StepResult, SubAgentDispatch};
use crate::loader::{SubAgentTask, WorkflowDef};
use crate::path::Path;
use crate::session::SessionRecord;
use crate::state::{ComputedGraph, Op, StateStore, Update};
use crate::value::Value;

/// A sub-agent task's terminal result, recorded for aggregation (§4.6.5).
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Ok(Json),
    Error(String),
    Timeout,
    Cancelled,
}

fn outcome_to_json(outcome: &TaskOutcome) -> Json {
    match outcome {
        TaskOutcome::Ok(value) => value.clone(),
        TaskOutcome::Error(message) => serde_json::json!({ "status": "error", "error": message }),
        TaskOutcome::Timeout => serde_json::json!({ "status": "timeout" }),
        TaskOutcome::Cancelled => serde_json::json!({ "status": "cancelled" }),
    }
}

enum RunState {
    Active,
    AwaitingClient(StepDescriptor),
    Done(TaskOutcome),
}

/// One item's isolated execution context.
pub struct SubAgentRun {
    store: StateStore,
    stack: ControlStack,
    session: SessionRecord,
    state: RunState,
    retry_not_before: Option<Instant>,
}

impl SubAgentRun {
    fn new(task: &SubAgentTask, item: Value, index: usize, total: usize, parent_inputs: Value, parent_computed: Value) -> Result<SubAgentRun> {
        let store = StateStore::new(parent_inputs, Value::object(Default::default()), ComputedGraph::new(vec![])?)?;
        store.seed_computed(parent_computed);

        let mut stack = ControlStack::new(vec![]);
        stack.push(Frame { kind: FrameKind::SubAgentItem { item, index, total }, steps: task.steps.clone(), pc: 0 });

        Ok(SubAgentRun { store, stack, session: SessionRecord::default(), state: RunState::Active, retry_not_before: None })
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, RunState::Done(_))
    }

    fn into_outcome(self) -> TaskOutcome {
        match self.state {
            RunState::Done(outcome) => outcome,
            _ => TaskOutcome::Timeout,
        }
    }

    /// By convention a task reports its result by writing `state.result`
    /// against its own private store; absent that, the outcome is `null`.
    fn result_output(&self) -> Json {
        match self.store.read(&Path::parse("state.result").expect("constant path")) {
            Ok(value) => value.into_json(),
            Err(_) => Json::Null,
        }
    }

    fn advance(&mut self, def: &WorkflowDef, defaults: &DefaultsConfig) -> Result<Option<StepDescriptor>> {
        if let RunState::AwaitingClient(descriptor) = &self.state {
            if let Some(not_before) = self.retry_not_before {
                if Instant::now() < not_before {
                    return Ok(None);
                }
                self.retry_not_before = None;
            }
            return Ok(Some(descriptor.clone()));
        }
        if self.is_terminal() {
            return Ok(None);
        }

        match exec::step(def, &self.store, &mut self.stack, defaults, false, &mut self.session) {
            Ok(Advance::Client(descriptor)) => {
                self.state = RunState::AwaitingClient(descriptor.clone());
                Ok(Some(descriptor))
            }
            Ok(Advance::Done) => {
                self.state = RunState::Done(TaskOutcome::Ok(self.result_output()));
                Ok(None)
            }
            Ok(Advance::SubAgents(_)) => {
                self.state = RunState::Done(TaskOutcome::Error(
                    "nested parallel_foreach inside a sub-agent task is not supported".to_string(),
                ));
                Ok(None)
            }
            Err(EngineError::Cancelled) => {
                self.state = RunState::Done(TaskOutcome::Cancelled);
                Ok(None)
            }
            Err(err) => {
                self.state = RunState::Done(TaskOutcome::Error(err.to_string()));
                Ok(None)
            }
        }
    }

    fn complete(&mut self, defaults: &DefaultsConfig, result: StepResult) -> Result<()> {
        if !matches!(self.state, RunState::AwaitingClient(_)) {
            return Err(EngineError::Internal("step_complete called with no pending step for this task".to_string()));
        }
        match exec::complete_client_step(&self.store, &mut self.stack, defaults, &mut self.session, result)? {
            StepOutcome::Advance => self.state = RunState::Active,
            StepOutcome::Retry(delay) => self.retry_not_before = Some(Instant::now() + delay),
            StepOutcome::Failed(err) => self.state = RunState::Done(TaskOutcome::Error(err.to_string())),
        }
        Ok(())
    }
}

/// Drives one `parallel_foreach` fan-out: every item's `SubAgentRun`, a
/// join deadline, and the parent path the results merge into.
pub struct SubAgentManager {
    tasks: HashMap<String, SubAgentRun>,
    order: Vec<String>,
    aggregation_path: String,
    wait_for_all: bool,
    deadline: Option<Instant>,
}

impl SubAgentManager {
    /// Materialize one `SubAgentRun` per item (§4.6.1): isolated namespace,
    /// bound `item`/`index`/`total`, and a frozen snapshot of the parent's
    /// `inputs`/`computed` tiers.
    pub fn start(def: &WorkflowDef, store: &StateStore, dispatch: &SubAgentDispatch) -> Result<SubAgentManager> {
        let task = def.sub_agent_tasks.get(&dispatch.sub_agent_task).ok_or_else(|| {
            EngineError::Internal(format!("unknown sub_agent_task '{}'", dispatch.sub_agent_task))
        })?;

        let flat = store.read_flat();
        let total = dispatch.items.len();
        let mut tasks = HashMap::with_capacity(total);
        let mut order = Vec::with_capacity(total);

        for (index, item) in dispatch.items.iter().enumerate() {
            let task_id = format!("t{index}");
            let run = SubAgentRun::new(task, Value::from_json(item.clone()), index, total, flat.inputs.clone(), flat.computed.clone())?;
            tasks.insert(task_id.clone(), run);
            order.push(task_id);
        }

        Ok(SubAgentManager {
            tasks,
            order,
            aggregation_path: dispatch.aggregation_path.clone(),
            wait_for_all: dispatch.wait_for_all,
            deadline: dispatch.timeout_seconds.map(|secs| Instant::now() + Duration::from_secs(secs)),
        })
    }

    /// Task ids in fan-out order, for the single `parallel_tasks` client
    /// descriptor listing every task (§4.6.2).
    pub fn task_ids(&self) -> &[String] {
        &self.order
    }

    pub fn get_next_step(&mut self, def: &WorkflowDef, defaults: &DefaultsConfig, task_id: &str) -> Result<Option<StepDescriptor>> {
        let run = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("sub-agent task '{task_id}' not found")))?;
        run.advance(def, defaults)
    }

    pub fn step_complete(&mut self, defaults: &DefaultsConfig, task_id: &str, result: StepResult) -> Result<()> {
        let run = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("sub-agent task '{task_id}' not found")))?;
        run.complete(defaults, result)
    }

    /// Whether the parent may proceed: every task reached a terminal status,
    /// or the join deadline elapsed (§4.6.4). `wait_for_all: false` only
    /// requires one task to finish.
    pub fn is_joined(&self) -> bool {
        let timed_out = self.deadline.is_some_and(|d| Instant::now() >= d);
        if timed_out {
            return true;
        }
        if self.wait_for_all {
            self.tasks.values().all(SubAgentRun::is_terminal)
        } else {
            self.tasks.values().any(SubAgentRun::is_terminal)
        }
    }

    /// Merge every task's outcome into the parent's aggregation path and
    /// consume the manager (§4.6.5). Any task still running when the join
    /// fires (deadline elapsed, or `wait_for_all: false`) is recorded as
    /// `Timeout` rather than left unmerged.
    pub fn join(mut self, store: &StateStore) -> Result<Vec<String>> {
        let mut mapping = serde_json::Map::with_capacity(self.order.len());
        for task_id in &self.order {
            let run = self.tasks.remove(task_id).expect("task_id is always present in self.order");
            let outcome = run.into_outcome();
            mapping.insert(task_id.clone(), outcome_to_json(&outcome));
        }
        store.apply(&[Update {
            path: Path::parse(&self.aggregation_path)?,
            op: Op::Merge,
            value: Value::from_json(Json::Object(mapping)),
        }])
    }
}
