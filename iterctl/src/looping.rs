//! Multi-turn loop for `iterctl run`.
//!
//! One turn: pick the next open task, run `pre-iteration` hooks, run the
//! agent, save its output, run `post-iteration` hooks, classify. The
//! workspace lock is held for the whole loop.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::classifier::{CompletionMarkers, classify};
use crate::core::error_line::{extract_error, first_error_line};
use crate::core::types::{CallbackContext, ExitClass, HookPoint, Verdict};
use crate::hooks::{HookExecutor, HookOutcome};
use crate::io::config::IterctlConfig;
use crate::io::executor::{Agent, AgentRequest, build_prompt};
use crate::io::git::{Git, Interruption, interruption_summary};
use crate::io::iteration_log::{IterationMeta, IterationPaths, write_meta, write_output};
use crate::io::lock::LockManager;
use crate::io::task_store::load_task_list_lenient;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every task passes.
    Complete,
    /// The agent reported an upstream usage or rate limit.
    ApiLimit,
    /// A hook did not succeed at a point where the loop cannot carry on.
    HookFailed {
        point: HookPoint,
        class: ExitClass,
        code: Option<i32>,
        detail: String,
    },
    /// `max_iterations` turns ran without completing.
    MaxIterationsReached { max_iterations: u32 },
}

/// Summary of one turn, reported through `on_turn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub iteration: u32,
    pub story_id: Option<String>,
    pub verdict: Verdict,
    pub done_tag_seen: bool,
    /// `post-iteration` hooks asked for the work to be redone.
    pub rework: bool,
    pub exit_code: Option<i32>,
    pub error_line: Option<String>,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub turns: u32,
    pub stop: LoopStop,
}

/// Run turns until the task list completes, the agent hits a usage limit, a
/// hook fails hard, or `max_iterations` is reached.
///
/// A lock conflict is returned as a [`crate::io::lock::LockConflict`] inside
/// the `anyhow::Error`. Agent errors stop the loop immediately.
#[instrument(skip_all, fields(workspace = %workspace.display()))]
pub fn run_loop<A: Agent, F: FnMut(&TurnOutcome)>(
    workspace: &Path,
    agent: &A,
    hooks: &HookExecutor,
    config: &IterctlConfig,
    mut on_turn: F,
) -> Result<LoopOutcome> {
    let handle = LockManager::new(config.lock_dir()).acquire_workspace(workspace)?;

    let result = Turns {
        workspace,
        agent,
        hooks,
        config,
        markers: config.markers(),
    }
    .drive(&mut on_turn);

    if let Err(err) = handle.release() {
        warn!(err = %err, "failed to release workspace lock");
    }
    result
}

struct Turns<'a, A> {
    workspace: &'a Path,
    agent: &'a A,
    hooks: &'a HookExecutor,
    config: &'a IterctlConfig,
    markers: CompletionMarkers,
}

impl<A: Agent> Turns<'_, A> {
    fn drive<F: FnMut(&TurnOutcome)>(&self, on_turn: &mut F) -> Result<LoopOutcome> {
        let task_list_path = self.config.task_list_path(self.workspace);
        if load_task_list_lenient(Some(&task_list_path)).is_some_and(|list| list.all_pass()) {
            info!("task list already complete");
            return Ok(LoopOutcome {
                turns: 0,
                stop: LoopStop::Complete,
            });
        }

        let max_iterations = self.config.max_iterations;
        for iteration in 1..=max_iterations {
            let tasks = load_task_list_lenient(Some(&task_list_path));
            let current = match &tasks {
                Some(list) => list.next_open()?.cloned(),
                None => None,
            };
            let story_id = current.as_ref().map(|task| task.id.clone());
            info!(iteration, story = ?story_id, "starting turn");

            let paths = IterationPaths::new(self.workspace, iteration);
            paths.create()?;
            let mut ctx = CallbackContext::new(HookPoint::PreIteration, self.workspace, iteration)
                .with_output_file(&paths.output_path);
            if let Some(id) = &story_id {
                ctx = ctx.with_story(id.clone());
            }

            let started_at = now();
            let pre = self.hooks.run(HookPoint::PreIteration, &ctx)?;
            match pre.class() {
                ExitClass::Success => {}
                ExitClass::NeedsRework => {
                    warn!(
                        iteration,
                        story = ?story_id,
                        "pre-iteration hook asked to redo; skipping turn"
                    );
                    write_meta(
                        &paths,
                        &IterationMeta {
                            iteration,
                            story_id,
                            exit_code: None,
                            verdict: None,
                            done_tag_seen: false,
                            error_line: None,
                            started_at,
                            ended_at: now(),
                        },
                    )?;
                    continue;
                }
                ExitClass::Failure => return Ok(stopped(iteration - 1, hook_failed(&pre))),
            }

            let request = AgentRequest {
                workdir: self.workspace.to_path_buf(),
                prompt: build_prompt(
                    current.as_ref(),
                    &self.config.task_list.display().to_string(),
                    &self.markers,
                ),
                iteration,
                story_id: story_id.clone(),
                timeout: Duration::from_secs(self.config.agent.timeout_secs),
                output_limit_bytes: self.config.agent.output_limit_bytes,
                stream_path: Some(paths.stream_path.clone()),
            };
            let reply = match self.agent.run(&request) {
                Ok(reply) => reply,
                Err(err) => {
                    self.report_interruption(iteration, story_id.as_deref(), &paths, &err);
                    return Err(err.context(format!("agent turn {iteration}")));
                }
            };
            write_output(&paths, &reply.output)?;

            let post = self.hooks.run(HookPoint::PostIteration, &ctx)?;
            if post.class() == ExitClass::Failure {
                return Ok(stopped(iteration, hook_failed(&post)));
            }
            let rework = post.class() == ExitClass::NeedsRework;

            let tasks_after = load_task_list_lenient(Some(&task_list_path));
            let classification = classify(&reply.output, tasks_after.as_ref(), &self.markers);
            let verdict = if rework {
                Verdict::Continue
            } else {
                classification.verdict
            };
            let error_line = extract_error(&reply.output);

            write_meta(
                &paths,
                &IterationMeta {
                    iteration,
                    story_id: story_id.clone(),
                    exit_code: reply.exit_code,
                    verdict: Some(verdict),
                    done_tag_seen: classification.done_tag_seen,
                    error_line: error_line.clone(),
                    started_at,
                    ended_at: now(),
                },
            )?;
            info!(iteration, %verdict, rework, "turn classified");
            if classification.done_tag_seen && verdict != Verdict::Complete {
                warn!(iteration, "done tag printed but task list is not complete");
            }

            on_turn(&TurnOutcome {
                iteration,
                story_id,
                verdict,
                done_tag_seen: classification.done_tag_seen,
                rework,
                exit_code: reply.exit_code,
                error_line,
            });

            match verdict {
                Verdict::Complete => {
                    let done = self.hooks.run(HookPoint::Complete, &ctx)?;
                    if done.class() == ExitClass::Failure {
                        return Ok(stopped(iteration, hook_failed(&done)));
                    }
                    return Ok(stopped(iteration, LoopStop::Complete));
                }
                Verdict::StoryComplete => {
                    let story = self.hooks.run(HookPoint::StoryComplete, &ctx)?;
                    if story.class() == ExitClass::Failure {
                        return Ok(stopped(iteration, hook_failed(&story)));
                    }
                }
                Verdict::ApiLimit => {
                    warn!(iteration, "agent hit a usage limit; stopping");
                    return Ok(stopped(iteration, LoopStop::ApiLimit));
                }
                Verdict::Continue => {}
            }
        }

        warn!(max_iterations, "iteration limit reached");
        Ok(stopped(
            max_iterations,
            LoopStop::MaxIterationsReached { max_iterations },
        ))
    }

    fn report_interruption(
        &self,
        iteration: u32,
        story_id: Option<&str>,
        paths: &IterationPaths,
        err: &anyhow::Error,
    ) {
        let partial = fs::read_to_string(&paths.stream_path).unwrap_or_default();
        let cause = format!("{err:#}");
        let error_line = first_error_line(&partial).unwrap_or(&cause);

        let git = Git::new(self.workspace);
        let tree = if git.is_repo() {
            git.working_tree_summary()
                .inspect_err(|err| warn!(err = %err, "could not inspect working tree"))
                .ok()
        } else {
            None
        };
        let summary = interruption_summary(&Interruption {
            task_id: story_id,
            iteration,
            error_line: Some(error_line),
            tree: tree.as_ref(),
        });
        warn!("{summary}");
    }
}

fn stopped(turns: u32, stop: LoopStop) -> LoopOutcome {
    LoopOutcome { turns, stop }
}

fn hook_failed(outcome: &HookOutcome) -> LoopStop {
    LoopStop::HookFailed {
        point: outcome.point,
        class: outcome.class(),
        code: outcome.code(),
        detail: outcome.to_string(),
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
