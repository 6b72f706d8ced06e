//! The step executor and control-flow interpreter (§4.4, §4.5): dispatches
//! one step at a time against a `ControlStack`, applying server-internal
//! steps inline and returning client-delegated steps as descriptors.
//!
//! Modeled as a state machine advanced per call rather than a coroutine
//! suspended on an await, so the core never depends on an async runtime
//! (§9 "Cooperative scheduling").

mod descriptor;
mod schema;
mod shell;
mod strategy;

pub use descriptor::{Advance, StepDescriptor, StepResult, StepStatus, SubAgentDispatch};
pub use strategy::StepOutcome;

use std::time::Duration;

use serde_json::Value as Json;

use crate::config::DefaultsConfig;
use crate::control::{ControlStack, Frame, FrameKind};
use crate::error::{EngineError, Result};
use crate::expr::{eval, evaluate_condition, parse_expression, render_template, render_template_value, Scope};
use crate::loader::{ErrorHandling, ExecutionContext, OpName, Step, StepBody, WorkflowDef};
use crate::path::Path;
use crate::session::SessionRecord;
use crate::state::{Op, StateStore, Update};
use crate::value::Value;

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

fn build_scope(store: &StateStore, stack: &ControlStack) -> Scope {
    let flat = store.read_flat();
    let mut scope = flat.to_scope();
    scope.locals = stack.loop_locals();
    scope
}

/// Recursively substitute `{{ expr }}` fragments inside every string leaf of
/// a JSON value, preserving the evaluated type when a leaf is a single bare
/// interpolation (§4.4 "template substitution").
fn substitute(value: &Json, scope: &Scope) -> Result<Json> {
    match value {
        Json::String(s) => Ok(render_template_value(s, scope)?.into_json()),
        Json::Array(items) => items.iter().map(|v| substitute(v, scope)).collect::<Result<Vec<_>>>().map(Json::Array),
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, scope)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Advance execution by exactly one client-visible unit: runs
/// server-internal steps (state updates, shell commands in a server
/// context, control-flow constructs) until a client-delegated step, a
/// `parallel_foreach` fan-out, or completion, per the §4.4 batching rule. In
/// debug mode, returns immediately after each server-internal step as a
/// trace-only descriptor instead of batching.
pub fn step(
    def: &WorkflowDef,
    store: &StateStore,
    stack: &mut ControlStack,
    defaults: &DefaultsConfig,
    debug: bool,
    session: &mut SessionRecord,
) -> Result<Advance> {
    loop {
        if unwind_exhausted_frames(store, stack)? {
            return Ok(Advance::Done);
        }

        let current = {
            let top = stack.top().expect("unwind guarantees a non-exhausted top frame");
            top.steps[top.pc].clone()
        };

        match dispatch(def, store, stack, &current, defaults, debug, session)? {
            Dispatch::Advanced => continue,
            Dispatch::Trace(descriptor) => return Ok(Advance::Client(descriptor)),
            Dispatch::Client(descriptor) => return Ok(Advance::Client(descriptor)),
            Dispatch::SubAgents(dispatch) => return Ok(Advance::SubAgents(dispatch)),
        }
    }
}

/// Pop frames whose program counter has run off the end of their step
/// list, applying loop re-entry/exit semantics. Returns `true` if the whole
/// stack is now empty (the instance is done).
fn unwind_exhausted_frames(store: &StateStore, stack: &mut ControlStack) -> Result<bool> {
    loop {
        let kind = match stack.top() {
            None => return Ok(true),
            Some(top) if top.pc < top.steps.len() => return Ok(false),
            Some(top) => top.kind.clone(),
        };

        match kind {
            FrameKind::Root => {
                stack.pop();
            }
            FrameKind::Conditional => {
                stack.pop();
                bump_parent(stack);
            }
            FrameKind::While { condition, max_iterations, attempt_number } => {
                let scope = build_scope(store, stack);
                if evaluate_condition(&condition, &scope)? {
                    if attempt_number >= max_iterations {
                        return Err(EngineError::LoopBound(format!(
                            "while loop exceeded max_iterations ({max_iterations})"
                        )));
                    }
                    let top = stack.top_mut().expect("matched above");
                    top.pc = 0;
                    if let FrameKind::While { attempt_number: a, .. } = &mut top.kind {
                        *a += 1;
                    }
                } else {
                    stack.pop();
                    bump_parent(stack);
                }
            }
            FrameKind::Foreach { items, index } => {
                if index + 1 < items.len() {
                    let top = stack.top_mut().expect("matched above");
                    top.pc = 0;
                    if let FrameKind::Foreach { index: i, .. } = &mut top.kind {
                        *i += 1;
                    }
                } else {
                    stack.pop();
                    bump_parent(stack);
                }
            }
            FrameKind::SubAgentItem { .. } => {
                stack.pop();
                bump_parent(stack);
            }
        }
    }
}

fn bump_parent(stack: &mut ControlStack) {
    if let Some(parent) = stack.top_mut() {
        parent.pc += 1;
    }
}

enum Dispatch {
    Advanced,
    Trace(StepDescriptor),
    Client(StepDescriptor),
    SubAgents(SubAgentDispatch),
}

fn step_type_tag(body: &StepBody) -> &'static str {
    match body {
        StepBody::StateUpdate { .. } => "state_update",
        StepBody::ShellCommand { .. } => "shell_command",
        StepBody::Conditional { .. } => "conditional",
        StepBody::While { .. } => "while",
        StepBody::Foreach { .. } => "foreach",
        StepBody::ParallelForeach { .. } => "parallel_foreach",
        StepBody::Break => "break",
        StepBody::Continue => "continue",
        StepBody::UserMessage { .. } => "user_message",
        StepBody::UserInput { .. } => "user_input",
        StepBody::McpCall { .. } => "mcp_call",
        StepBody::AgentPrompt { .. } => "agent_prompt",
        StepBody::AgentShellCommand { .. } => "agent_shell_command",
        StepBody::WaitStep => "wait_step",
    }
}

fn step_id(step: &Step, stack: &ControlStack) -> String {
    step.id.clone().unwrap_or_else(|| format!("step-{}-{}", stack.depth(), stack.top().map(|f| f.pc).unwrap_or(0)))
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    def: &WorkflowDef,
    store: &StateStore,
    stack: &mut ControlStack,
    step: &Step,
    defaults: &DefaultsConfig,
    debug: bool,
    session: &mut SessionRecord,
) -> Result<Dispatch> {
    let tag = step_type_tag(&step.body);
    let id = step_id(step, stack);

    match &step.body {
        StepBody::StateUpdate { path, op, value } => {
            let started = std::time::Instant::now();
            let (_, recomputed) = run_server_step(step.error_handling.as_ref(), defaults, session, || {
                let scope = build_scope(store, stack);
                let substituted = substitute(value, &scope)?;
                let parsed_path = Path::parse(path)?;
                let recomputed = store.apply(&[Update { path: parsed_path, op: op_from_name(*op), value: Value::from_json(substituted) }])?;
                Ok((None, recomputed))
            })?;
            for field in &recomputed {
                session.record_recompute(field);
            }
            session.record_step(tag);
            let output = serde_json::json!({ "recomputed": recomputed });
            advance_after_server_step(stack, step, tag, debug, session, started.elapsed(), value.clone(), output)
        }
        StepBody::ShellCommand { command, args, execution_context, timeout, output_path } => {
            if matches!(execution_context, ExecutionContext::Client) {
                let scope = build_scope(store, stack);
                let rendered_command = render_template(command, &scope)?;
                let rendered_args = args.iter().map(|a| render_template(a, &scope)).collect::<Result<Vec<_>>>()?;
                return Ok(Dispatch::Client(StepDescriptor {
                    id,
                    kind: tag.to_string(),
                    instructions: Json::String(format!("run: {rendered_command} {}", rendered_args.join(" "))),
                    definition: serde_json::json!({ "command": rendered_command, "args": rendered_args }),
                    internal_trace: None,
                }));
            }
            let timeout_secs = timeout.unwrap_or(defaults.step_timeout_seconds);
            let output_path = output_path.clone();
            let started = std::time::Instant::now();
            let input_snapshot = serde_json::json!({ "command": command, "args": args });
            let (result, recomputed) = run_server_step(step.error_handling.as_ref(), defaults, session, || {
                let scope = build_scope(store, stack);
                let rendered_command = render_template(command, &scope)?;
                let rendered_args = args.iter().map(|a| render_template(a, &scope)).collect::<Result<Vec<_>>>()?;
                let result = shell::run(&rendered_command, &rendered_args, Duration::from_secs(timeout_secs))?;
                let mut recomputed = Vec::new();
                if let Some(path) = &output_path {
                    recomputed = store.apply(&[Update { path: Path::parse(path)?, op: Op::Set, value: result.clone() }])?;
                }
                Ok((Some(result), recomputed))
            })?;
            for field in &recomputed {
                session.record_recompute(field);
            }
            session.record_step(tag);
            let output_snapshot = result.map(|v| v.into_json()).unwrap_or(Json::Null);
            advance_after_server_step(stack, step, tag, debug, session, started.elapsed(), input_snapshot, output_snapshot)
        }
        StepBody::Conditional { condition, then_steps, else_steps } => {
            let taken = {
                let scope = build_scope(store, stack);
                evaluate_condition(condition, &scope)?
            };
            let branch = if taken { then_steps } else { else_steps };
            stack.push(Frame { kind: FrameKind::Conditional, steps: branch.clone(), pc: 0 });
            session.record_step(tag);
            Ok(Dispatch::Advanced)
        }
        StepBody::While { condition, body, max_iterations } => {
            let cont = {
                let scope = build_scope(store, stack);
                evaluate_condition(condition, &scope)?
            };
            session.record_step(tag);
            if cont {
                stack.push(Frame {
                    kind: FrameKind::While {
                        condition: condition.clone(),
                        max_iterations: max_iterations.unwrap_or_else(|| def.config.max_iterations.unwrap_or(defaults.max_iterations)),
                        attempt_number: 1,
                    },
                    steps: body.clone(),
                    pc: 0,
                });
            } else {
                bump_parent(stack);
            }
            Ok(Dispatch::Advanced)
        }
        StepBody::Foreach { items, body } => {
            let sequence = {
                let scope = build_scope(store, stack);
                let value = eval(&parse_expression(items)?, &scope)?;
                value.as_array().cloned().unwrap_or_default()
            };
            session.record_step(tag);
            if sequence.is_empty() {
                bump_parent(stack);
            } else {
                stack.push(Frame {
                    kind: FrameKind::Foreach { items: sequence.into_iter().map(Value::from_json).collect(), index: 0 },
                    steps: body.clone(),
                    pc: 0,
                });
            }
            Ok(Dispatch::Advanced)
        }
        StepBody::ParallelForeach { items, sub_agent_task, max_parallel, wait_for_all, timeout_seconds, aggregation_path } => {
            let sequence = {
                let scope = build_scope(store, stack);
                let value = eval(&parse_expression(items)?, &scope)?;
                value.as_array().cloned().unwrap_or_default()
            };
            session.record_step(tag);
            if sequence.is_empty() {
                store.apply(&[Update { path: Path::parse(aggregation_path)?, op: Op::Merge, value: Value::object(Default::default()) }])?;
                bump_parent(stack);
                return Ok(Dispatch::Advanced);
            }
            Ok(Dispatch::SubAgents(SubAgentDispatch {
                step_id: id,
                items: sequence,
                sub_agent_task: sub_agent_task.clone(),
                max_parallel: max_parallel.unwrap_or(defaults.max_parallel),
                wait_for_all: *wait_for_all,
                timeout_seconds: *timeout_seconds,
                aggregation_path: aggregation_path.clone(),
            }))
        }
        StepBody::Break => {
            stack.apply_break();
            session.record_step(tag);
            Ok(Dispatch::Advanced)
        }
        StepBody::Continue => {
            stack.apply_continue();
            session.record_step(tag);
            Ok(Dispatch::Advanced)
        }
        StepBody::UserMessage { message } => {
            let scope = build_scope(store, stack);
            let rendered = render_template(message, &scope)?;
            Ok(Dispatch::Client(StepDescriptor {
                id,
                kind: tag.to_string(),
                instructions: Json::String(rendered.clone()),
                definition: serde_json::json!({ "message": rendered }),
                internal_trace: None,
            }))
        }
        StepBody::UserInput { prompt, pattern, choices, .. } => {
            let scope = build_scope(store, stack);
            let rendered = render_template(prompt, &scope)?;
            Ok(Dispatch::Client(StepDescriptor {
                id,
                kind: tag.to_string(),
                instructions: Json::String(rendered.clone()),
                definition: serde_json::json!({ "prompt": rendered, "pattern": pattern, "choices": choices }),
                internal_trace: None,
            }))
        }
        StepBody::McpCall { tool, parameters, .. } => {
            let scope = build_scope(store, stack);
            let rendered_params = substitute(parameters, &scope)?;
            Ok(Dispatch::Client(StepDescriptor {
                id,
                kind: tag.to_string(),
                instructions: Json::String(format!("call tool '{tool}'")),
                definition: serde_json::json!({ "tool": tool, "parameters": rendered_params }),
                internal_trace: None,
            }))
        }
        StepBody::AgentPrompt { prompt, response_schema, .. } => {
            let scope = build_scope(store, stack);
            let rendered = render_template(prompt, &scope)?;
            Ok(Dispatch::Client(StepDescriptor {
                id,
                kind: tag.to_string(),
                instructions: Json::String(rendered.clone()),
                definition: serde_json::json!({ "prompt": rendered, "response_schema": response_schema }),
                internal_trace: None,
            }))
        }
        StepBody::AgentShellCommand { command, .. } => {
            let scope = build_scope(store, stack);
            let rendered = render_template(command, &scope)?;
            Ok(Dispatch::Client(StepDescriptor {
                id,
                kind: tag.to_string(),
                instructions: Json::String(format!("run: {rendered}")),
                definition: serde_json::json!({ "command": rendered }),
                internal_trace: None,
            }))
        }
        StepBody::WaitStep => Ok(Dispatch::Client(StepDescriptor {
            id,
            kind: tag.to_string(),
            instructions: Json::String("waiting for client".to_string()),
            definition: Json::Null,
            internal_trace: None,
        })),
    }
}

/// After a server-internal step executes, advance the frame's cursor and
/// either keep batching (normal mode) or surface a trace descriptor and
/// stop (debug mode) per the §4.4/§4.8 batching rule. Debug mode also
/// records the step's timing and input/output snapshots to the session
/// trace ring.
#[allow(clippy::too_many_arguments)]
fn advance_after_server_step(
    stack: &mut ControlStack,
    step: &Step,
    tag: &'static str,
    debug: bool,
    session: &mut SessionRecord,
    duration: Duration,
    input_snapshot: Json,
    output_snapshot: Json,
) -> Result<Dispatch> {
    let id = step.id.clone().unwrap_or_else(|| format!("trace-{tag}"));
    if let Some(top) = stack.top_mut() {
        top.pc += 1;
    }
    if debug {
        session.push_trace(&id, tag, duration, input_snapshot, output_snapshot);
        Ok(Dispatch::Trace(StepDescriptor {
            id,
            kind: tag.to_string(),
            instructions: Json::String(format!("executed {tag}")),
            definition: Json::Null,
            internal_trace: Some(true),
        }))
    } else {
        Ok(Dispatch::Advanced)
    }
}

/// Runs a server-internal step body, retrying/falling back per its
/// configured error handling. The closure reports any computed-field names
/// its own `store.apply` call recomputed; `session.record_recompute` happens
/// in the caller so the closure never needs its own handle on `session`
/// (which `run_server_step` already borrows mutably for retry bookkeeping).
fn run_server_step<F>(
    error_handling: Option<&ErrorHandling>,
    defaults: &DefaultsConfig,
    session: &mut SessionRecord,
    mut run: F,
) -> Result<(Option<Value>, Vec<String>)>
where
    F: FnMut() -> Result<(Option<Value>, Vec<String>)>,
{
    let mut attempt = 0u32;
    loop {
        match run() {
            Ok(output) => return Ok(output),
            Err(err) => match strategy::decide(&err, error_handling, defaults, attempt) {
                strategy::Decision::Retry(delay) => {
                    attempt += 1;
                    session.record_retry();
                    std::thread::sleep(delay);
                }
                strategy::Decision::Fallback(value) => {
                    session.record_error();
                    return Ok((Some(value), Vec::new()));
                }
                strategy::Decision::ContinueEmpty => {
                    session.record_error();
                    return Ok((None, Vec::new()));
                }
                strategy::Decision::Fail => {
                    session.record_error();
                    return Err(err);
                }
            },
        }
    }
}

fn output_path_of(body: &StepBody) -> Option<String> {
    match body {
        StepBody::UserInput { state_path, .. } => state_path.clone(),
        StepBody::McpCall { output_path, .. } => output_path.clone(),
        StepBody::AgentPrompt { output_path, .. } => output_path.clone(),
        StepBody::AgentShellCommand { output_path, .. } => output_path.clone(),
        _ => None,
    }
}

fn validate_output(body: &StepBody, output: &Json) -> std::result::Result<(), String> {
    match body {
        StepBody::UserInput { pattern, choices, .. } => {
            if let Some(text) = output.as_str() {
                if let Some(pattern) = pattern {
                    let re = regex::Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
                    if !re.is_match(text) {
                        return Err(format!("response '{text}' does not match pattern '{pattern}'"));
                    }
                }
                if let Some(choices) = choices {
                    if !choices.iter().any(|c| c == text) {
                        return Err(format!("response '{text}' is not one of the allowed choices"));
                    }
                }
            }
            Ok(())
        }
        StepBody::AgentPrompt { response_schema: Some(schema), .. } => schema::validate(schema, output),
        _ => Ok(()),
    }
}

/// Resolve a previously-issued client descriptor against its reported
/// result: validates the response shape, writes any declared output path,
/// and advances the owning frame's cursor on success (§4.4, §4.7, §6).
pub fn complete_client_step(
    store: &StateStore,
    stack: &mut ControlStack,
    defaults: &DefaultsConfig,
    session: &mut SessionRecord,
    result: StepResult,
) -> Result<StepOutcome> {
    let step = {
        let top = stack.top().ok_or_else(|| EngineError::Internal("no active frame for step_complete".to_string()))?;
        top.steps
            .get(top.pc)
            .cloned()
            .ok_or_else(|| EngineError::Internal("program counter past end of frame".to_string()))?
    };

    let reported_err = match result.status {
        StepStatus::Ok => None,
        StepStatus::Timeout => Some(EngineError::Timeout(Duration::from_secs(defaults.step_timeout_seconds))),
        StepStatus::Cancelled => Some(EngineError::Cancelled),
        StepStatus::Error => {
            Some(EngineError::Tool(result.error_message.unwrap_or_else(|| "client reported an error".to_string())))
        }
    };

    if let Some(err) = reported_err {
        session.record_step(step_type_tag(&step.body));
        return Ok(resolve_error(err, step.error_handling.as_ref(), defaults, session));
    }

    let output = result.output.unwrap_or(Json::Null);
    if let Err(message) = validate_output(&step.body, &output) {
        session.record_step(step_type_tag(&step.body));
        return Ok(resolve_error(EngineError::ValidationRejected(message), step.error_handling.as_ref(), defaults, session));
    }

    if let Some(path) = output_path_of(&step.body) {
        store.apply(&[Update { path: Path::parse(&path)?, op: Op::Set, value: Value::from_json(output) }])?;
    }

    session.record_step(step_type_tag(&step.body));
    if let Some(top) = stack.top_mut() {
        top.pc += 1;
    }
    Ok(StepOutcome::Advance)
}

fn resolve_error(err: EngineError, handling: Option<&ErrorHandling>, defaults: &DefaultsConfig, session: &mut SessionRecord) -> StepOutcome {
    match strategy::decide(&err, handling, defaults, 0) {
        strategy::Decision::Retry(delay) => {
            session.record_retry();
            StepOutcome::Retry(delay)
        }
        strategy::Decision::Fallback(_) | strategy::Decision::ContinueEmpty => {
            session.record_error();
            StepOutcome::Advance
        }
        strategy::Decision::Fail => {
            session.record_error();
            StepOutcome::Failed(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_workflow;

    fn store_for(def: &WorkflowDef) -> StateStore {
        let graph = def.build_computed_graph().unwrap();
        StateStore::new(Value::null(), Value::from_json(def.default_state.clone()), graph).unwrap()
    }

    #[test]
    fn sequential_state_update_then_message_s1() {
        let yaml = r#"
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
        let (def, _) = parse_workflow(yaml).unwrap();
        let store = store_for(&def);
        let mut stack = ControlStack::new(def.steps.clone());
        let defaults = DefaultsConfig::default();
        let mut session = SessionRecord::default();

        let advance = step(&def, &store, &mut stack, &defaults, false, &mut session).unwrap();
        match advance {
            Advance::Client(d) => assert_eq!(d.definition["message"], "y=15"),
            _ => panic!("expected a client step"),
        }
        assert_eq!(store.read(&Path::parse("computed.y").unwrap()).unwrap().as_f64(), Some(15.0));
    }

    #[test]
    fn conditional_picks_branch_s2() {
        let yaml = r#"
name: demo:s2
version: 1.0.0
inputs:
  flag: true
steps:
  - type: conditional
    condition: "{{ inputs.flag }}"
    then_steps:
      - type: user_message
        message: "on"
    else_steps:
      - type: user_message
        message: "off"
"#;
        let (def, _) = parse_workflow(yaml).unwrap();
        let graph = def.build_computed_graph().unwrap();
        let store = StateStore::new(Value::bool(true), Value::from_json(def.default_state.clone()), graph).unwrap();
        let mut stack = ControlStack::new(def.steps.clone());
        let defaults = DefaultsConfig::default();
        let mut session = SessionRecord::default();

        let advance = step(&def, &store, &mut stack, &defaults, false, &mut session).unwrap();
        match advance {
            Advance::Client(d) => assert_eq!(d.definition["message"], "on"),
            _ => panic!("expected a client step"),
        }
    }

    #[test]
    fn while_with_break_runs_exactly_three_times_s3() {
        let yaml = r#"
name: demo:s3
version: 1.0.0
default_state:
  state:
    n: 0
steps:
  - type: while
    condition: "state.n < 10"
    body:
      - type: state_update
        path: state.n
        op: increment
        value: 1
      - type: conditional
        condition: "state.n == 3"
        then_steps:
          - type: break
  - type: user_message
    message: "done at {{ state.n }}"
"#;
        let (def, _) = parse_workflow(yaml).unwrap();
        let store = store_for(&def);
        let mut stack = ControlStack::new(def.steps.clone());
        let defaults = DefaultsConfig::default();
        let mut session = SessionRecord::default();

        let advance = step(&def, &store, &mut stack, &defaults, false, &mut session).unwrap();
        match advance {
            Advance::Client(d) => assert_eq!(d.definition["message"], "done at 3"),
            _ => panic!("expected a client step"),
        }
        assert_eq!(store.read(&Path::parse("state.n").unwrap()).unwrap().as_f64(), Some(3.0));
    }

    #[test]
    fn foreach_accumulates_sum_s4() {
        let yaml = r#"
name: demo:s4
version: 1.0.0
default_state:
  state:
    sum: 0
inputs:
  items:
    - id: 1
    - id: 2
    - id: 3
steps:
  - type: foreach
    items: "inputs.items"
    body:
      - type: state_update
        path: state.sum
        op: increment
        value: "{{ item.id }}"
  - type: user_message
    message: "total {{ state.sum }}"
"#;
        let (def, _) = parse_workflow(yaml).unwrap();
        let graph = def.build_computed_graph().unwrap();
        let inputs = serde_json::json!({ "items": [{"id": 1}, {"id": 2}, {"id": 3}] });
        let store = StateStore::new(Value::from_json(inputs), Value::from_json(def.default_state.clone()), graph).unwrap();
        let mut stack = ControlStack::new(def.steps.clone());
        let defaults = DefaultsConfig::default();
        let mut session = SessionRecord::default();

        let advance = step(&def, &store, &mut stack, &defaults, false, &mut session).unwrap();
        match advance {
            Advance::Client(d) => assert_eq!(d.definition["message"], "total 6"),
            _ => panic!("expected a client step"),
        }
    }

    #[test]
    fn empty_items_foreach_skips_body() {
        let yaml = r#"
name: demo:empty
version: 1.0.0
inputs:
  items: []
steps:
  - type: foreach
    items: "inputs.items"
    body:
      - type: user_message
        message: "should not run"
  - type: user_message
    message: "after"
"#;
        let (def, _) = parse_workflow(yaml).unwrap();
        let graph = def.build_computed_graph().unwrap();
        let store = StateStore::new(serde_json::json!({"items": []}).into(), Value::from_json(def.default_state.clone()), graph).unwrap();
        let mut stack = ControlStack::new(def.steps.clone());
        let defaults = DefaultsConfig::default();
        let mut session = SessionRecord::default();

        let advance = step(&def, &store, &mut stack, &defaults, false, &mut session).unwrap();
        match advance {
            Advance::Client(d) => assert_eq!(d.definition["message"], "after"),
            _ => panic!("expected a client step"),
        }
    }

    #[test]
    fn debug_mode_surfaces_server_step_as_trace() {
        let yaml = r#"
name: demo:debug
version: 1.0.0
default_state:
  state:
    x: 0
steps:
  - type: state_update
    path: state.x
    op: set
    value: 1
  - type: user_message
    message: "done"
"#;
        let (def, _) = parse_workflow(yaml).unwrap();
        let store = store_for(&def);
        let mut stack = ControlStack::new(def.steps.clone());
        let defaults = DefaultsConfig::default();
        let mut session = SessionRecord::default();

        let advance = step(&def, &store, &mut stack, &defaults, true, &mut session).unwrap();
        match advance {
            Advance::Client(d) => assert_eq!(d.internal_trace, Some(true)),
            _ => panic!("expected a trace descriptor"),
        }
        assert_eq!(session.trace.len(), 1);
        assert_eq!(session.trace[0].step_type, "state_update");

        let advance2 = step(&def, &store, &mut stack, &defaults, true, &mut session).unwrap();
        match advance2 {
            Advance::Client(d) => assert_eq!(d.definition["message"], "done"),
            _ => panic!("expected the message step"),
        }
    }

    #[test]
    fn complete_client_step_validates_pattern_and_writes_state_path() {
        let yaml = r#"
name: demo:input
version: 1.0.0
default_state:
  state:
    answer: ""
steps:
  - type: user_input
    prompt: "pick one"
    pattern: "^[a-z]+$"
    state_path: "state.answer"
"#;
        let (def, _) = parse_workflow(yaml).unwrap();
        let store = store_for(&def);
        let mut stack = ControlStack::new(def.steps.clone());
        let defaults = DefaultsConfig::default();
        let mut session = SessionRecord::default();

        step(&def, &store, &mut stack, &defaults, false, &mut session).unwrap();

        let bad = complete_client_step(
            &store,
            &mut stack,
            &defaults,
            &mut session,
            StepResult::ok(Some(Json::String("NOT-LOWER".to_string()))),
        )
        .unwrap();
        assert!(matches!(bad, StepOutcome::Failed(_)));

        let good = complete_client_step(
            &store,
            &mut stack,
            &defaults,
            &mut session,
            StepResult::ok(Some(Json::String("yes".to_string()))),
        )
        .unwrap();
        assert!(matches!(good, StepOutcome::Advance));
        assert_eq!(store.read(&Path::parse("state.answer").unwrap()).unwrap().as_str(), Some("yes"));
    }
}
