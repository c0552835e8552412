//! File-based extension points.
//!
//! For a lifecycle point, a script is looked up in the feature-scoped hook
//! directory first and the project-scoped one second; the first match wins.
//! No script is a no-op success. The script receives the path of a JSON
//! context file as its only argument, plus the same fields as environment
//! variables on the child process only.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{CallbackContext, ExitClass, HookPoint};
use crate::io::process::{RunOptions, run_command};

pub const ENV_HOOK_POINT: &str = "ITERCTL_HOOK_POINT";
pub const ENV_STORY_ID: &str = "ITERCTL_STORY_ID";
pub const ENV_ITERATION: &str = "ITERCTL_ITERATION";
pub const ENV_FEATURE_DIR: &str = "ITERCTL_FEATURE_DIR";
pub const ENV_OUTPUT_FILE: &str = "ITERCTL_OUTPUT_FILE";
pub const ENV_TIMESTAMP: &str = "ITERCTL_TIMESTAMP";
pub const ENV_CONTEXT_FILE: &str = "ITERCTL_CONTEXT_FILE";

const HOOK_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Where to look for hook scripts, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDirs {
    pub feature: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

impl HookDirs {
    pub fn new(feature: impl Into<PathBuf>, project: impl Into<PathBuf>) -> Self {
        Self {
            feature: Some(feature.into()),
            project: Some(project.into()),
        }
    }

    fn in_order(&self) -> impl Iterator<Item = &Path> {
        self.feature
            .as_deref()
            .into_iter()
            .chain(self.project.as_deref())
    }
}

/// A hook script exited non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{point} hook {} exited with {}", script.display(), describe_code(*code))]
pub struct HookFailure {
    pub point: HookPoint,
    pub script: PathBuf,
    /// Raw exit code; `None` if the script was killed by a signal.
    pub code: Option<i32>,
    pub class: ExitClass,
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no code (killed by signal)".to_string(),
    }
}

/// Result of running a file-based hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookRun {
    /// No script exists for this point.
    Missing,
    /// Script ran to completion.
    Ran {
        script: PathBuf,
        code: Option<i32>,
        class: ExitClass,
        output: String,
    },
}

impl HookRun {
    pub fn class(&self) -> ExitClass {
        match self {
            HookRun::Missing => ExitClass::Success,
            HookRun::Ran { class, .. } => *class,
        }
    }

    /// Convert a non-zero exit into a [`HookFailure`].
    pub fn failure(&self, point: HookPoint) -> Option<HookFailure> {
        match self {
            HookRun::Ran {
                script,
                code,
                class,
                ..
            } if *class != ExitClass::Success => Some(HookFailure {
                point,
                script: script.clone(),
                code: *code,
                class: *class,
            }),
            _ => None,
        }
    }
}

/// Candidate file names for a point inside one hook directory.
fn candidates(dir: &Path, point: HookPoint) -> [PathBuf; 2] {
    [
        dir.join(point.as_str()),
        dir.join(format!("{}.sh", point.as_str())),
    ]
}

/// Resolve the script for `point`, feature directory first.
pub fn resolve_hook(dirs: &HookDirs, point: HookPoint) -> Option<PathBuf> {
    dirs.in_order()
        .flat_map(|dir| candidates(dir, point))
        .find(|path| path.is_file())
}

/// Whether a script exists for `point` in `dir`, without running it.
pub fn hook_exists(point: HookPoint, dir: &Path) -> bool {
    candidates(dir, point).iter().any(|path| path.is_file())
}

/// Run the script for `ctx.hook_point`, if any. Blocks until it exits.
#[instrument(skip_all, fields(point = %ctx.hook_point, iteration = ctx.iteration))]
pub fn run_hook(dirs: &HookDirs, ctx: &CallbackContext) -> Result<HookRun> {
    let Some(script) = resolve_hook(dirs, ctx.hook_point) else {
        debug!("no hook script");
        return Ok(HookRun::Missing);
    };

    let context_file = tempfile::Builder::new()
        .prefix("iterctl-hook-")
        .suffix(".json")
        .tempfile()
        .context("create hook context file")?;
    let payload = serde_json::to_string_pretty(ctx).context("serialize hook context")?;
    fs::write(context_file.path(), payload)
        .with_context(|| format!("write hook context {}", context_file.path().display()))?;

    let mut cmd = if is_executable(&script) {
        Command::new(&script)
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg(&script);
        cmd
    };
    cmd.arg(context_file.path())
        .current_dir(&ctx.feature_dir)
        .env(ENV_HOOK_POINT, ctx.hook_point.as_str())
        .env(ENV_STORY_ID, ctx.story_id.as_deref().unwrap_or(""))
        .env(ENV_ITERATION, ctx.iteration.to_string())
        .env(ENV_FEATURE_DIR, &ctx.feature_dir)
        .env(
            ENV_OUTPUT_FILE,
            ctx.output_file.as_deref().unwrap_or(Path::new("")),
        )
        .env(ENV_TIMESTAMP, &ctx.timestamp)
        .env(ENV_CONTEXT_FILE, context_file.path());

    info!(script = %script.display(), "running hook");
    let output = run_command(
        cmd,
        &RunOptions {
            output_limit_bytes: HOOK_OUTPUT_LIMIT_BYTES,
            ..RunOptions::default()
        },
    )
    .with_context(|| format!("run hook {}", script.display()))?;

    let code = output.status.code();
    let class = ExitClass::from_code(code);
    match class {
        ExitClass::Success => debug!(?code, "hook passed"),
        ExitClass::NeedsRework => warn!(?code, "hook requested rework"),
        ExitClass::Failure => warn!(?code, "hook failed"),
    }
    Ok(HookRun::Ran {
        script,
        code,
        class,
        output: output.combined_lossy("hook"),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_hook;

    fn ctx(dir: &Path, point: HookPoint) -> CallbackContext {
        CallbackContext::new(point, dir, 4)
            .with_story("T-003")
            .with_output_file(dir.join("out.log"))
    }

    #[test]
    fn missing_hook_is_noop_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dirs = HookDirs::new(temp.path().join("feature"), temp.path().join("project"));
        let run = run_hook(&dirs, &ctx(temp.path(), HookPoint::PreIteration)).expect("run");
        assert_eq!(run, HookRun::Missing);
        assert_eq!(run.class(), ExitClass::Success);
    }

    #[test]
    fn feature_hook_overrides_project_hook() {
        let temp = tempfile::tempdir().expect("tempdir");
        let feature = temp.path().join("feature");
        let project = temp.path().join("project");
        write_hook(&project, "post-iteration", "exit 0\n", true);
        assert_eq!(
            resolve_hook(&HookDirs::new(&feature, &project), HookPoint::PostIteration),
            Some(project.join("post-iteration"))
        );

        write_hook(&feature, "post-iteration.sh", "exit 0\n", true);
        assert_eq!(
            resolve_hook(&HookDirs::new(&feature, &project), HookPoint::PostIteration),
            Some(feature.join("post-iteration.sh"))
        );
        assert!(hook_exists(HookPoint::PostIteration, &feature));
        assert!(!hook_exists(HookPoint::PreIteration, &feature));
    }

    #[test]
    fn hook_receives_context_file_and_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = temp.path().join("hooks");
        let record = temp.path().join("seen.txt");
        write_hook(
            &hooks,
            "pre-iteration",
            &format!(
                "cat \"$1\" > '{rec}.json'\necho \"$ITERCTL_HOOK_POINT $ITERCTL_STORY_ID $ITERCTL_ITERATION\" > '{rec}'\n",
                rec = record.display()
            ),
            true,
        );
        let dirs = HookDirs {
            feature: Some(hooks),
            project: None,
        };

        let run = run_hook(&dirs, &ctx(temp.path(), HookPoint::PreIteration)).expect("run");
        assert_eq!(run.class(), ExitClass::Success);

        let env_line = fs::read_to_string(&record).expect("env record");
        assert_eq!(env_line.trim(), "pre-iteration T-003 4");

        let json = fs::read_to_string(record.with_extension("txt.json")).expect("ctx record");
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["storyId"], "T-003");
        assert_eq!(value["iteration"], 4);
        assert_eq!(value["hookPoint"], "pre-iteration");

        assert!(std::env::var(ENV_HOOK_POINT).is_err());
    }

    #[test]
    fn non_executable_script_runs_through_shell() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = temp.path().join("hooks");
        write_hook(&hooks, "complete", "exit 0\n", false);
        let dirs = HookDirs {
            feature: None,
            project: Some(hooks),
        };
        let run = run_hook(&dirs, &ctx(temp.path(), HookPoint::Complete)).expect("run");
        assert_eq!(run.class(), ExitClass::Success);
    }

    #[test]
    fn exit_codes_map_to_classes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = temp.path().join("hooks");
        let dirs = HookDirs {
            feature: Some(hooks.clone()),
            project: None,
        };

        write_hook(&hooks, "post-iteration", "echo verifying\nexit 75\n", true);
        let run = run_hook(&dirs, &ctx(temp.path(), HookPoint::PostIteration)).expect("run");
        assert_eq!(run.class(), ExitClass::NeedsRework);
        let failure = run.failure(HookPoint::PostIteration).expect("failure");
        assert_eq!(failure.code, Some(75));
        assert!(failure.to_string().contains("code 75"));

        write_hook(&hooks, "post-iteration", "exit 2\n", true);
        let run = run_hook(&dirs, &ctx(temp.path(), HookPoint::PostIteration)).expect("run");
        assert_eq!(run.class(), ExitClass::Failure);
        assert_eq!(
            run.failure(HookPoint::PostIteration).expect("failure").code,
            Some(2)
        );
    }
}
