//! Test-only helpers for building task lists, workspaces, and scripted agents.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::{Context, Result, anyhow};
use serde_json::Map;
use tempfile::TempDir;

use crate::io::config::{IterctlConfig, write_config};
use crate::io::executor::{Agent, AgentReply, AgentRequest};
use crate::io::task_store::{load_task_list, write_task_list};
use crate::task::{Task, TaskList};

/// Create a deterministic task with explicit `passes`.
pub fn task(id: &str, passes: bool) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: String::new(),
        acceptance_criteria: Vec::new(),
        priority: 0,
        passes,
        notes: String::new(),
        extra: Map::new(),
    }
}

pub fn task_list(tasks: Vec<Task>) -> TaskList {
    TaskList::new(tasks)
}

/// Pid of a process that has already exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}

/// A live child process for lock ownership tests. Callers kill it.
pub fn spawn_sleeper() -> Child {
    Command::new("sleep").arg("30").spawn().expect("spawn sleep")
}

/// Write a hook script into `dir`, creating the directory.
pub fn write_hook(dir: &Path, name: &str, body: &str, executable: bool) -> PathBuf {
    fs::create_dir_all(dir).expect("create hook dir");
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write hook");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod hook");
    }
    #[cfg(not(unix))]
    let _ = executable;
    path
}

/// A scripted agent turn: the text to return, plus optional task ids to mark
/// as passing in the task list before returning (simulating the agent's edits).
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub output: String,
    pub exit_code: Option<i32>,
    pub mark_passes: Vec<String>,
}

impl ScriptedTurn {
    pub fn says(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: Some(0),
            mark_passes: Vec::new(),
        }
    }

    pub fn passing(mut self, id: impl Into<String>) -> Self {
        self.mark_passes.push(id.into());
        self
    }
}

/// Agent that replays queued turns and records every request it saw.
pub struct ScriptedAgent {
    task_list_path: PathBuf,
    turns: RefCell<VecDeque<ScriptedTurn>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(task_list_path: impl Into<PathBuf>, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            task_list_path: task_list_path.into(),
            turns: RefCell::new(turns.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.borrow().len()
    }
}

impl Agent for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentReply> {
        self.requests.borrow_mut().push(request.clone());
        let turn = self
            .turns
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no turns left"))?;
        if !turn.mark_passes.is_empty() {
            let mut list = load_task_list(&self.task_list_path)?;
            for id in &turn.mark_passes {
                list.mark_passes(id)?;
            }
            write_task_list(&self.task_list_path, &list)?;
        }
        Ok(AgentReply {
            output: turn.output,
            exit_code: turn.exit_code,
            timed_out: false,
        })
    }
}

/// Temporary workspace with a config, a task list, and an isolated lock dir.
pub struct TestWorkspace {
    temp: TempDir,
    pub config: IterctlConfig,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp workspace")?;
        let mut config = IterctlConfig::default();
        config.locks.dir = Some(temp.path().join("locks"));
        config.hooks.project_dir = Some(temp.path().join("project-hooks"));
        let workspace = Self { temp, config };
        fs::create_dir_all(workspace.root().join(".iterctl"))
            .context("create .iterctl dir")?;
        write_config(&workspace.root().join(".iterctl/config.toml"), &workspace.config)?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn task_list_path(&self) -> PathBuf {
        self.config.task_list_path(self.root())
    }

    pub fn feature_hook_dir(&self) -> PathBuf {
        self.config.feature_hook_dir(self.root())
    }

    pub fn write_tasks(&self, list: &TaskList) -> Result<()> {
        write_task_list(&self.task_list_path(), list)
    }

    pub fn read_tasks(&self) -> Result<TaskList> {
        load_task_list(&self.task_list_path())
    }

    /// Initialize a git repository with one empty commit.
    pub fn init_git(&self) -> Result<()> {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "iterctl test"],
            vec!["commit", "-q", "--allow-empty", "-m", "init"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(self.root())
                .status()
                .with_context(|| format!("git {}", args.join(" ")))?;
            if !status.success() {
                return Err(anyhow!("git {} failed", args.join(" ")));
            }
        }
        Ok(())
    }
}
