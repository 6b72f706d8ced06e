use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Command as ShellCommand;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as Json;
use uuid::Uuid;

use workflow_core::config::load_config;
use workflow_core::engine::{Engine, WorkflowEngine};
use workflow_core::exec::{StepDescriptor, StepResult, StepStatus};

/// Thin local driver over the control API (`Engine`) for interactive
/// testing of workflow files. Not a contractual surface: a real deployment
/// wraps `Engine` in whatever transport it needs.
#[derive(Parser)]
#[command(name = "workflow-engine", version, about = "Local control-API driver for the workflow orchestration engine")]
struct Cli {
    /// EngineConfig TOML file. Falls back to built-in defaults if absent.
    #[arg(long, default_value = "workflow-engine.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a workflow and drive it to completion, resolving client-delegated
    /// steps locally (prints messages, prompts for input, runs client shell commands).
    Start {
        name: String,
        /// JSON object of inputs, e.g. '{"path": "."}'.
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Start a workflow and print its first pending step without resolving it.
    Step {
        name: String,
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Start a workflow and print its status immediately.
    Status {
        name: String,
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Start a workflow and cancel it immediately.
    Stop {
        name: String,
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Print a workflow's metadata without starting an instance.
    Inspect { name: String },
}

fn main() -> Result<()> {
    workflow_core::init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config).context("loading engine config")?;
    let engine = WorkflowEngine::new(config);

    match cli.command {
        Command::Inspect { name } => print_json(&engine.info(&name)),
        Command::Status { name, inputs } => {
            let start = engine.start(&name, parse_inputs(inputs)?).into_result()?;
            print_json(&engine.status(start.workflow_id));
        }
        Command::Stop { name, inputs } => {
            let start = engine.start(&name, parse_inputs(inputs)?).into_result()?;
            print_json(&engine.stop(start.workflow_id));
        }
        Command::Step { name, inputs } => {
            let start = engine.start(&name, parse_inputs(inputs)?).into_result()?;
            print_json(&engine.get_next_step(start.workflow_id, None));
        }
        Command::Start { name, inputs } => {
            let start = engine.start(&name, parse_inputs(inputs)?).into_result()?;
            tracing::info!(workflow_id = %start.workflow_id, workflow = %name, "workflow started");
            run_to_completion(&engine, start.workflow_id)?;
            print_json(&engine.status(start.workflow_id));
        }
    }
    Ok(())
}

fn parse_inputs(raw: Option<String>) -> Result<Json> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).context("parsing --inputs as JSON"),
        None => Ok(Json::Null),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).expect("envelope serializes"));
}

/// Drives one workflow instance to completion, resolving every
/// client-delegated step it surfaces. Real deployments hand these
/// descriptors to whatever external agent drives the workflow; this is the
/// local stand-in for that loop.
fn run_to_completion(engine: &WorkflowEngine, workflow_id: Uuid) -> Result<()> {
    loop {
        let step = engine
            .get_next_step(workflow_id, None)
            .into_result()
            .map_err(|e| anyhow!("get_next_step: {e}"))?;
        let Some(descriptor) = step else { return Ok(()) };

        if descriptor.kind == "parallel_tasks" {
            drive_sub_agents(engine, workflow_id, &descriptor)?;
            continue;
        }

        let result = resolve_step(&descriptor)?;
        engine
            .step_complete(workflow_id, None, result)
            .into_result()
            .map_err(|e| anyhow!("step_complete: {e}"))?;
    }
}

fn drive_sub_agents(engine: &WorkflowEngine, workflow_id: Uuid, descriptor: &StepDescriptor) -> Result<()> {
    let task_ids: Vec<String> = serde_json::from_value(descriptor.definition["task_ids"].clone())?;
    for task_id in task_ids {
        loop {
            let step = engine
                .get_next_step(workflow_id, Some(&task_id))
                .into_result()
                .map_err(|e| anyhow!("get_next_step({task_id}): {e}"))?;
            let Some(descriptor) = step else { break };
            let result = resolve_step(&descriptor)?;
            engine
                .step_complete(workflow_id, Some(&task_id), result)
                .into_result()
                .map_err(|e| anyhow!("step_complete({task_id}): {e}"))?;
        }
    }
    Ok(())
}

/// Resolves a single client-delegated descriptor against the local terminal
/// and filesystem. `mcp_call`/`agent_prompt`/`agent_shell_command` stand in
/// for an actual tool-using agent, which is out of scope for this driver;
/// they are echoed and acknowledged rather than executed.
fn resolve_step(descriptor: &StepDescriptor) -> Result<StepResult> {
    match descriptor.kind.as_str() {
        "user_message" => {
            println!("{}", descriptor.definition["message"].as_str().unwrap_or_default());
            Ok(StepResult::ok(None))
        }
        "user_input" => {
            print!("{} ", descriptor.definition["prompt"].as_str().unwrap_or_default());
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(StepResult::ok(Some(Json::String(line.trim_end().to_string()))))
        }
        "shell_command" => {
            let command = descriptor.definition["command"].as_str().unwrap_or_default();
            let args: Vec<String> = serde_json::from_value(descriptor.definition["args"].clone()).unwrap_or_default();
            let output = ShellCommand::new(command).args(&args).output().context("spawning client shell command")?;
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                Ok(StepResult::ok(Some(Json::String(stdout))))
            } else {
                Ok(StepResult {
                    status: StepStatus::Error,
                    output: None,
                    error_message: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
                })
            }
        }
        "wait_step" => Ok(StepResult::ok(None)),
        "mcp_call" | "agent_prompt" | "agent_shell_command" => {
            println!("{} (not executed by this local driver)", descriptor.instructions.as_str().unwrap_or_default());
            Ok(StepResult::ok(None))
        }
        other => Err(anyhow!("no local handler for client step kind '{other}'")),
    }
}
