//! End-to-end scenarios driven through the public `Engine` trait, one per
//! literal example in the workflow-core design notes (conditional branching,
//! a bounded while/break loop, foreach aggregation, and retry-then-fallback
//! error handling).

use serde_json::{json, Value as Json};

use workflow_core::config::EngineConfig;
use workflow_core::engine::{Engine, WorkflowEngine};
use workflow_core::exec::StepResult;

fn write_workflow(dir: &tempfile::TempDir, file_name: &str, contents: &str) {
    let workflows_dir = dir.path().join(".aromcp/workflows");
    std::fs::create_dir_all(&workflows_dir).unwrap();
    std::fs::write(workflows_dir.join(file_name), contents).unwrap();
}

fn engine_in(dir: &tempfile::TempDir) -> WorkflowEngine {
    let mut config = EngineConfig::default();
    config.discovery.project_dir = Some(dir.path().to_string_lossy().to_string());
    WorkflowEngine::new(config)
}

fn drive_to_completion(engine: &WorkflowEngine, workflow_id: uuid::Uuid) -> Vec<Json> {
    let mut messages = Vec::new();
    while let Some(step) = engine.get_next_step(workflow_id, None).into_result().unwrap() {
        if step.kind == "user_message" {
            messages.push(step.definition["message"].clone());
        }
        engine.step_complete(workflow_id, None, StepResult::ok(None)).into_result().unwrap();
    }
    messages
}

#[test]
fn conditional_branches_on_an_input_flag() {
    const DEF: &str = r#"
name: demo:conditional
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
    let dir = tempfile::tempdir().unwrap();
    write_workflow(&dir, "demo:conditional.yaml", DEF);
    let engine = engine_in(&dir);

    let on = engine.start("demo:conditional", json!({"flag": true})).into_result().unwrap();
    assert_eq!(drive_to_completion(&engine, on.workflow_id), vec![json!("on")]);

    let off = engine.start("demo:conditional", json!({"flag": false})).into_result().unwrap();
    assert_eq!(drive_to_completion(&engine, off.workflow_id), vec![json!("off")]);
}

#[test]
fn while_loop_breaks_after_exactly_three_iterations() {
    const DEF: &str = r#"
name: demo:while-break
version: 1.0.0
default_state:
  state:
    n: 0
steps:
  - type: while
    condition: "{{ state.n < 10 }}"
    body:
      - type: state_update
        path: state.n
        op: increment
        value: 1
      - type: conditional
        condition: "{{ state.n == 3 }}"
        then_steps:
          - type: break
"#;
    let dir = tempfile::tempdir().unwrap();
    write_workflow(&dir, "demo:while-break.yaml", DEF);
    let engine = engine_in(&dir);

    let start = engine.start("demo:while-break", Json::Null).into_result().unwrap();
    drive_to_completion(&engine, start.workflow_id);

    let n = engine.state_read(start.workflow_id, Some("state.n")).into_result().unwrap();
    assert_eq!(n, 3);
}

#[test]
fn foreach_aggregates_a_running_sum() {
    const DEF: &str = r#"
name: demo:foreach-sum
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
        op: set
        value: "{{ state.sum + item.id }}"
"#;
    let dir = tempfile::tempdir().unwrap();
    write_workflow(&dir, "demo:foreach-sum.yaml", DEF);
    let engine = engine_in(&dir);

    let start = engine
        .start("demo:foreach-sum", json!({"items": [{"id": 1}, {"id": 2}, {"id": 3}]}))
        .into_result()
        .unwrap();
    drive_to_completion(&engine, start.workflow_id);

    let sum = engine.state_read(start.workflow_id, Some("state.sum")).into_result().unwrap();
    assert_eq!(sum, 6);
}

#[test]
fn empty_foreach_runs_the_body_zero_times() {
    const DEF: &str = r#"
name: demo:foreach-empty
version: 1.0.0
default_state:
  state:
    touched: false
inputs:
  items: []
steps:
  - type: foreach
    items: "inputs.items"
    body:
      - type: state_update
        path: state.touched
        op: set
        value: true
  - type: user_message
    message: "done"
"#;
    let dir = tempfile::tempdir().unwrap();
    write_workflow(&dir, "demo:foreach-empty.yaml", DEF);
    let engine = engine_in(&dir);

    let start = engine.start("demo:foreach-empty", json!({"items": []})).into_result().unwrap();
    let messages = drive_to_completion(&engine, start.workflow_id);

    assert_eq!(messages, vec![json!("done")]);
    let touched = engine.state_read(start.workflow_id, Some("state.touched")).into_result().unwrap();
    assert_eq!(touched, false);
}

#[test]
fn retry_exhausts_then_falls_back_after_exactly_three_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    std::fs::write(&counter, "").unwrap();

    let def = format!(
        r#"
name: demo:retry-fallback
version: 1.0.0
default_state:
  state:
    result: null
steps:
  - type: shell_command
    command: "sh"
    args: ["-c", "echo x >> {counter}; exit 1"]
    output_path: state.result
    error_handling:
      strategy: retry
      max_retries: 2
      backoff:
        base_ms: 1
        multiplier: 1.0
        cap_ms: 1
      fallback_value: "n/a"
"#,
        counter = counter.display()
    );
    write_workflow(&dir, "demo:retry-fallback.yaml", &def);
    let engine = engine_in(&dir);

    let start = engine.start("demo:retry-fallback", Json::Null).into_result().unwrap();
    drive_to_completion(&engine, start.workflow_id);

    let status = engine.status(start.workflow_id).into_result().unwrap();
    assert_eq!(status.kind, workflow_core::instance::InstanceStatusKind::Completed);
    assert_eq!(status.retry_count, 2);
    assert_eq!(status.error_count, 1);

    let attempts = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(attempts.lines().count(), 3, "expected exactly 3 invocations of the failing command");

    let result = engine.state_read(start.workflow_id, Some("state.result")).into_result().unwrap();
    assert_eq!(result, json!("n/a"));
}

#[test]
fn writing_an_undeclared_root_is_a_path_error() {
    const DEF: &str = r#"
name: demo:bad-path
version: 1.0.0
steps:
  - type: state_update
    path: garbage.nope
    op: set
    value: 1
"#;
    let dir = tempfile::tempdir().unwrap();
    write_workflow(&dir, "demo:bad-path.yaml", DEF);
    let engine = engine_in(&dir);

    let start = engine.start("demo:bad-path", Json::Null).into_result().unwrap();
    let err = engine.get_next_step(start.workflow_id, None).into_result().unwrap_err();
    assert_eq!(err.kind(), workflow_core::error::ErrorKind::PathError);
}
