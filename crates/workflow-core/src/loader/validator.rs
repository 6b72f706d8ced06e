//! Schema and semantic validation of a parsed `WorkflowFile` (§4.1).
//! Collects every violation before returning; never partially loads.

use std::collections::HashSet;

use regex::Regex;

use super::def::{StepBody, WorkflowFile};
use crate::error::{ValidationFailure, ValidationIssue};
use crate::expr::{parse_expression, Expr};

const BUILTIN_IDENTS: &[&str] = &["inputs", "state", "computed", "now", "Math", "JSON", "true", "false", "null"];

pub struct ValidationOutcome {
    pub warnings: Vec<String>,
}

pub fn validate(file: &WorkflowFile) -> Result<ValidationOutcome, ValidationFailure> {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    validate_name(&file.name, &mut issues);
    validate_version(&file.version, &mut issues);

    if file.steps.is_empty() {
        issues.push(ValidationIssue {
            location: "/steps".to_string(),
            message: "steps must be a non-empty list".to_string(),
        });
    }

    let task_names: HashSet<&str> = file.sub_agent_tasks.keys().map(String::as_str).collect();

    let base_scope: HashSet<String> = BUILTIN_IDENTS.iter().map(|s| s.to_string()).collect();
    validate_steps(&file.steps, false, &task_names, &base_scope, "/steps", &mut issues);

    for (name, task) in &file.sub_agent_tasks {
        let mut scope = base_scope.clone();
        scope.insert("item".to_string());
        scope.insert("index".to_string());
        scope.insert("total".to_string());
        scope.insert("local".to_string());
        for input_name in task.input_schema.keys() {
            scope.insert(input_name.clone());
        }
        validate_steps(
            &task.steps,
            false,
            &task_names,
            &scope,
            &format!("/sub_agent_tasks/{name}/steps"),
            &mut issues,
        );
    }

    detect_unreachable(&file.steps, "/steps", &mut warnings);

    if issues.is_empty() {
        Ok(ValidationOutcome { warnings })
    } else {
        Err(ValidationFailure { issues })
    }
}

fn validate_name(name: &str, issues: &mut Vec<ValidationIssue>) {
    let re = Regex::new(r"^[a-z0-9_-]+:[a-z0-9_-]+$").expect("static regex");
    if !re.is_match(name) {
        issues.push(ValidationIssue {
            location: "/name".to_string(),
            message: format!("'{name}' must match 'ns:id'"),
        });
    }
}

fn validate_version(version: &str, issues: &mut Vec<ValidationIssue>) {
    let re = Regex::new(r"^\d+\.\d+\.\d+$").expect("static regex");
    if !re.is_match(version) {
        issues.push(ValidationIssue {
            location: "/version".to_string(),
            message: format!("'{version}' is not a valid semver version"),
        });
    }
}

fn validate_steps(
    steps: &[super::def::Step],
    in_loop: bool,
    task_names: &HashSet<&str>,
    scope: &HashSet<String>,
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    for (i, step) in steps.iter().enumerate() {
        let step_loc = format!("{location}/{i}");
        validate_templates_in_step(step, scope, &step_loc, issues);

        match &step.body {
            StepBody::Break | StepBody::Continue => {
                if !in_loop {
                    issues.push(ValidationIssue {
                        location: step_loc.clone(),
                        message: "break/continue must appear inside a loop body".to_string(),
                    });
                }
            }
            StepBody::While { body, .. } => {
                validate_steps(body, true, task_names, scope, &format!("{step_loc}/body"), issues);
            }
            StepBody::Foreach { body, .. } => {
                let mut inner_scope = scope.clone();
                inner_scope.insert("item".to_string());
                inner_scope.insert("index".to_string());
                inner_scope.insert("total".to_string());
                validate_steps(body, true, task_names, &inner_scope, &format!("{step_loc}/body"), issues);
            }
            StepBody::Conditional { then_steps, else_steps, .. } => {
                validate_steps(then_steps, in_loop, task_names, scope, &format!("{step_loc}/then_steps"), issues);
                validate_steps(else_steps, in_loop, task_names, scope, &format!("{step_loc}/else_steps"), issues);
            }
            StepBody::ParallelForeach { sub_agent_task, .. } => {
                if !task_names.contains(sub_agent_task.as_str()) {
                    issues.push(ValidationIssue {
                        location: format!("{step_loc}/sub_agent_task"),
                        message: format!("sub_agent_task '{sub_agent_task}' is not defined"),
                    });
                }
            }
            _ => {}
        }
    }
}

/// Extract every `{{ expr }}` fragment and bare-path field from a step and
/// check that each referenced identifier resolves against the in-scope
/// root/loop-var set (§4.1).
fn validate_templates_in_step(
    step: &super::def::Step,
    scope: &HashSet<String>,
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut check = |raw: &str, field: &str| {
        check_reference_string(raw, scope, &format!("{location}/{field}"), issues);
    };

    match &step.body {
        StepBody::StateUpdate { path, .. } => check(path, "path"),
        StepBody::ShellCommand { command, .. } => check(command, "command"),
        StepBody::Conditional { condition, .. } => check(condition, "condition"),
        StepBody::While { condition, .. } => check(condition, "condition"),
        StepBody::Foreach { items, .. } => check(items, "items"),
        StepBody::ParallelForeach { items, .. } => check(items, "items"),
        StepBody::UserMessage { message } => check(message, "message"),
        StepBody::UserInput { prompt, .. } => check(prompt, "prompt"),
        StepBody::McpCall { tool, .. } => check(tool, "tool"),
        StepBody::AgentPrompt { prompt, .. } => check(prompt, "prompt"),
        StepBody::AgentShellCommand { command, .. } => check(command, "command"),
        StepBody::Break | StepBody::Continue | StepBody::WaitStep => {}
    }
}

fn check_reference_string(raw: &str, scope: &HashSet<String>, location: &str, issues: &mut Vec<ValidationIssue>) {
    let exprs = extract_expressions(raw);
    for expr_src in exprs {
        match parse_expression(&expr_src) {
            Ok(expr) => {
                for ident in free_idents(&expr) {
                    if !scope.contains(&ident) {
                        issues.push(ValidationIssue {
                            location: location.to_string(),
                            message: format!("undeclared reference '{ident}' in '{expr_src}'"),
                        });
                    }
                }
            }
            Err(e) => issues.push(ValidationIssue {
                location: location.to_string(),
                message: format!("invalid expression '{expr_src}': {e}"),
            }),
        }
    }
}

/// Pull out `{{ ... }}` fragments; a string with no markers is itself
/// treated as a single bare expression (used for `condition`/`items`).
fn extract_expressions(raw: &str) -> Vec<String> {
    if let Some(_start) = raw.find("{{") {
        let mut out = Vec::new();
        let mut rest = raw;
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            if let Some(end) = after.find("}}") {
                out.push(after[..end].trim().to_string());
                rest = &after[end + 2..];
            } else {
                break;
            }
        }
        out
    } else if looks_like_expression(raw) {
        vec![raw.trim().to_string()]
    } else {
        vec![]
    }
}

/// Bare fields like `condition: state.n < 10` or `items: state.list` are
/// authored without `{{ }}`; treat any non-empty field that isn't pure
/// literal text as an expression candidate.
fn looks_like_expression(raw: &str) -> bool {
    let trimmed = raw.trim();
    !trimmed.is_empty() && parse_expression(trimmed).is_ok()
}

fn free_idents(expr: &Expr) -> Vec<String> {
    let mut out = Vec::new();
    collect_idents(expr, &HashSet::new(), &mut out);
    out
}

fn collect_idents(expr: &Expr, bound: &HashSet<String>, out: &mut Vec<String>) {
    match expr {
        Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::Str(_) => {}
        Expr::Array(items) => items.iter().for_each(|e| collect_idents(e, bound, out)),
        Expr::Object(fields) => fields.iter().for_each(|(_, e)| collect_idents(e, bound, out)),
        Expr::Ident(name) => {
            if !bound.contains(name) {
                out.push(name.clone());
            }
        }
        Expr::Member(base, _) => collect_idents(base, bound, out),
        Expr::Index(base, idx) => {
            collect_idents(base, bound, out);
            collect_idents(idx, bound, out);
        }
        Expr::Call(callee, args) => {
            collect_idents(callee, bound, out);
            args.iter().for_each(|a| collect_idents(a, bound, out));
        }
        Expr::Lambda(params, body) => {
            let mut inner = bound.clone();
            inner.extend(params.iter().cloned());
            collect_idents(body, &inner, out);
        }
        Expr::Unary(_, inner) => collect_idents(inner, bound, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_idents(lhs, bound, out);
            collect_idents(rhs, bound, out);
        }
        Expr::Ternary(cond, then_branch, else_branch) => {
            collect_idents(cond, bound, out);
            collect_idents(then_branch, bound, out);
            collect_idents(else_branch, bound, out);
        }
    }
}

/// Find every step with a `false`-constant-only reachability gap. Kept
/// intentionally shallow: only flags steps after an unconditional `break`
/// or `continue` in the same block, which is the common authoring mistake.
fn detect_unreachable(steps: &[super::def::Step], location: &str, warnings: &mut Vec<String>) {
    let mut seen_terminal = false;
    for (i, step) in steps.iter().enumerate() {
        if seen_terminal {
            warnings.push(format!("{location}/{i} is unreachable (follows break/continue)"));
        }
        if matches!(step.body, StepBody::Break | StepBody::Continue) {
            seen_terminal = true;
        }
    }
}
