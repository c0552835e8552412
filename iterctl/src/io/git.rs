//! Read-only git working-tree inspection.
//!
//! Used to report uncommitted work when a loop is interrupted. Nothing here
//! stages, commits, or otherwise mutates the repository.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }

    pub fn is_staged(&self) -> bool {
        !self.is_untracked() && self.code.as_bytes().first().is_some_and(|c| *c != b' ')
    }

    pub fn is_modified(&self) -> bool {
        !self.is_untracked() && self.code.as_bytes().get(1).is_some_and(|c| *c != b' ')
    }
}

/// Dirty files grouped by kind. A file staged and then edited again shows
/// up under both `staged` and `modified`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTreeSummary {
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
}

impl WorkingTreeSummary {
    pub fn from_entries(entries: &[StatusEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            if entry.is_untracked() {
                summary.untracked.push(entry.path.clone());
                continue;
            }
            if entry.is_staged() {
                summary.staged.push(entry.path.clone());
            }
            if entry.is_modified() {
                summary.modified.push(entry.path.clone());
            }
        }
        summary
    }

    pub fn has_uncommitted_work(&self) -> bool {
        !(self.staged.is_empty() && self.modified.is_empty() && self.untracked.is_empty())
    }

    /// Multi-line listing; empty when the tree is clean.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, paths) in [
            ("staged", &self.staged),
            ("modified", &self.modified),
            ("untracked", &self.untracked),
        ] {
            if paths.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{label} ({}):", paths.len());
            for path in paths {
                let _ = writeln!(out, "  {path}");
            }
        }
        out
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Current branch name, or `None` on a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim();
        Ok((name != "HEAD").then(|| name.to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn working_tree_summary(&self) -> Result<WorkingTreeSummary> {
        let summary = WorkingTreeSummary::from_entries(&self.status_porcelain()?);
        debug!(
            staged = summary.staged.len(),
            modified = summary.modified.len(),
            untracked = summary.untracked.len(),
            "working tree inspected"
        );
        Ok(summary)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// What was happening when a loop stopped unexpectedly.
#[derive(Debug, Clone, Default)]
pub struct Interruption<'a> {
    pub task_id: Option<&'a str>,
    pub iteration: u32,
    pub error_line: Option<&'a str>,
    pub tree: Option<&'a WorkingTreeSummary>,
}

/// Human-readable block describing an interrupted turn.
pub fn interruption_summary(info: &Interruption<'_>) -> String {
    let mut out = String::from("Loop interrupted\n");
    let _ = writeln!(out, "  iteration: {}", info.iteration);
    let _ = writeln!(out, "  task: {}", info.task_id.unwrap_or("(none)"));
    if let Some(line) = info.error_line {
        let _ = writeln!(out, "  last error: {line}");
    }
    match info.tree {
        Some(tree) if tree.has_uncommitted_work() => {
            out.push_str("  uncommitted work:\n");
            for line in tree.render().lines() {
                let _ = writeln!(out, "    {line}");
            }
        }
        Some(_) => out.push_str("  working tree clean\n"),
        None => out.push_str("  working tree state unknown\n"),
    }
    out
}
