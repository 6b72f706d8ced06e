//! Workflow discovery, YAML parsing, and validation (§4.1, §6).

mod def;
mod validator;

pub use def::{
    BackoffOverride, ComputedFieldSource, ErrorHandling, ErrorStrategy, ExecutionContext, OpName,
    Step, StepBody, SubAgentTask, WorkflowConfig, WorkflowDef,
};
pub use validator::ValidationOutcome;

use std::path::{Path as FsPath, PathBuf};

use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::expr::parse_expression;

/// Search order per §6: project directory first, then home directory, at
/// `<dir>/.aromcp/workflows/<ns>:<id>.yaml`.
pub fn discover(name: &str, project_dir: Option<&str>, home_dir: Option<&str>) -> Option<PathBuf> {
    for base in [project_dir, home_dir].into_iter().flatten() {
        let candidate = FsPath::new(base).join(".aromcp/workflows").join(format!("{name}.yaml"));
        debug!(path = %candidate.display(), "probing workflow discovery path");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Load and validate a workflow definition by name, searching the
/// configured discovery directories.
pub fn load_workflow(name: &str, project_dir: Option<&str>, home_dir: Option<&str>) -> Result<(WorkflowDef, ValidationOutcome)> {
    let path = discover(name, project_dir, home_dir)
        .ok_or_else(|| EngineError::NotFound(format!("workflow '{name}' not found in discovery directories")))?;
    debug!(path = %path.display(), "loading workflow file");
    let data = std::fs::read_to_string(&path)?;
    parse_workflow(&data)
}

/// Parse and validate a workflow definition from raw YAML bytes. Never
/// partially loads: on validation failure every violation is returned
/// together (§4.1).
pub fn parse_workflow(data: &str) -> Result<(WorkflowDef, ValidationOutcome)> {
    let file: def::WorkflowFile = serde_yaml::from_str(data)
        .map_err(|e| EngineError::Validation(crate::error::ValidationFailure {
            issues: vec![crate::error::ValidationIssue {
                location: "/".to_string(),
                message: format!("YAML parse error: {e}"),
            }],
        }))?;

    let outcome = validator::validate(&file).map_err(EngineError::Validation)?;
    for warning in &outcome.warnings {
        warn!(workflow = %file.name, "{warning}");
    }

    let computed_fields = file
        .state_schema
        .computed
        .iter()
        .map(|(name, field)| {
            let transform = parse_expression(&field.transform)?;
            Ok(ComputedFieldSource {
                name: name.clone(),
                dependencies: field.dependencies.clone(),
                transform_src: field.transform.clone(),
                transform,
                error_policy: field.error_policy.into(),
                fallback: field.fallback.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Acyclicity is checked at construction time; build once here so a bad
    // definition is rejected at load time rather than at first instance.
    let def = WorkflowDef {
        name: file.name.clone(),
        description: file.description.clone(),
        version: file.version.clone(),
        config: file.config.clone(),
        default_state: file.default_state.state.clone(),
        inputs_schema: file.inputs.clone(),
        steps: file.steps.clone(),
        sub_agent_tasks: file
            .sub_agent_tasks
            .iter()
            .map(|(name, task)| {
                (
                    name.clone(),
                    SubAgentTask {
                        id: name.clone(),
                        steps: task.steps.clone(),
                    },
                )
            })
            .collect(),
        computed_fields,
    };
    def.build_computed_graph()?;

    debug!(workflow = %def.name, version = %def.version, step_count = def.steps.len(), "workflow loaded and validated");

    Ok((def, outcome))
}
