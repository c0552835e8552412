//! Agent abstraction for running one turn.
//!
//! The [`Agent`] trait decouples the turn loop from the actual agent backend
//! (any CLI that reads a prompt on stdin). Tests use scripted agents that
//! return predetermined output without spawning processes.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::CompletionMarkers;
use crate::io::process::{RunOptions, run_command};
use crate::task::Task;

/// Parameters for one agent turn.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    pub iteration: u32,
    pub story_id: Option<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Tee stdout here as it arrives.
    pub stream_path: Option<PathBuf>,
}

/// Raw result of one agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// Full textual output (stdout, then stderr).
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run one turn. Errors mean the turn could not run or finish at all;
    /// a non-zero exit with output is still a reply.
    fn run(&self, request: &AgentRequest) -> Result<AgentReply>;
}

/// Agent that pipes the prompt to a configured command.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    argv: Vec<String>,
}

impl CommandAgent {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("agent command must be a non-empty array"));
        }
        Ok(Self { argv })
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(iteration = request.iteration, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest) -> Result<AgentReply> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("agent command must be a non-empty array"))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let output = run_command(
            cmd,
            &RunOptions {
                stdin: Some(request.prompt.as_bytes().to_vec()),
                timeout: Some(request.timeout),
                output_limit_bytes: request.output_limit_bytes,
                stream_path: request.stream_path.clone(),
            },
        )
        .with_context(|| format!("run agent {program}"))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited non-zero");
        }
        debug!("agent turn finished");
        Ok(AgentReply {
            output: output.combined_lossy("agent"),
            exit_code: output.status.code(),
            timed_out: false,
        })
    }
}

/// Fixed per-turn prompt for `task` (or a wrap-up prompt when nothing is open).
pub fn build_prompt(task: Option<&Task>, task_list: &str, markers: &CompletionMarkers) -> String {
    let mut prompt = String::new();
    match task {
        Some(task) => {
            let _ = writeln!(prompt, "Work on task {}: {}", task.id, task.title);
            if !task.description.is_empty() {
                let _ = writeln!(prompt, "\n{}", task.description);
            }
            if !task.acceptance_criteria.is_empty() {
                prompt.push_str("\nAcceptance criteria:\n");
                for criterion in &task.acceptance_criteria {
                    let _ = writeln!(prompt, "- {criterion}");
                }
            }
            if !task.notes.is_empty() {
                let _ = writeln!(prompt, "\nNotes: {}", task.notes);
            }
        }
        None => prompt.push_str("Every task is marked done. Verify the work and fix anything missing.\n"),
    }
    let _ = write!(
        prompt,
        "\nThe task list is {task_list}. When the task is verified, set its \"passes\" to true \
         there and print {story}. When every task passes, print {done}.\n",
        story = markers.story_tag(),
        done = markers.done_tag(),
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    fn request(dir: &std::path::Path) -> AgentRequest {
        AgentRequest {
            workdir: dir.to_path_buf(),
            prompt: "do the thing\n".to_string(),
            iteration: 1,
            story_id: Some("T-001".to_string()),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            stream_path: Some(dir.join("stream.log")),
        }
    }

    #[test]
    fn command_agent_pipes_prompt_and_captures_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat; echo oops >&2; exit 1".to_string(),
        ])
        .expect("agent");
        let reply = agent.run(&request(temp.path())).expect("run");
        assert_eq!(reply.exit_code, Some(1));
        assert!(reply.output.starts_with("do the thing\n"));
        assert!(reply.output.contains("oops"));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("stream.log")).expect("stream"),
            "do the thing\n"
        );
    }

    #[test]
    fn command_agent_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(vec!["sleep".to_string(), "5".to_string()]).expect("agent");
        let mut req = request(temp.path());
        req.timeout = Duration::from_millis(100);
        let err = agent.run(&req).expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandAgent::new(Vec::new()).is_err());
        assert!(CommandAgent::new(vec![" ".to_string()]).is_err());
    }

    #[test]
    fn prompt_names_task_and_markers() {
        let mut t = task("T-002", false);
        t.acceptance_criteria = vec!["tests pass".to_string()];
        let markers = CompletionMarkers::default();
        let prompt = build_prompt(Some(&t), ".iterctl/tasks.json", &markers);
        assert!(prompt.starts_with("Work on task T-002: T-002 title"));
        assert!(prompt.contains("- tests pass"));
        assert!(prompt.contains(markers.story_tag()));
        assert!(prompt.contains(markers.done_tag()));

        let wrap_up = build_prompt(None, ".iterctl/tasks.json", &markers);
        assert!(wrap_up.starts_with("Every task is marked done"));
    }
}
