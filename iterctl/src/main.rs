//! Agent iteration controller.
//!
//! Drives an external coding agent through a task list (`.iterctl/tasks.json`)
//! one turn at a time, holding a workspace lock and running lifecycle hooks.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use iterctl::core::classifier::classify;
use iterctl::core::error_line::{first_error_line, normalize_error};
use iterctl::core::types::{CallbackContext, ExitClass, HookPoint, Verdict};
use iterctl::exit_codes;
use iterctl::hooks::HookExecutor;
use iterctl::io::config::{CONFIG_PATH, IterctlConfig, load_config};
use iterctl::io::executor::CommandAgent;
use iterctl::io::git::Git;
use iterctl::io::hooks::{hook_exists, resolve_hook};
use iterctl::io::lock::{LockConflict, LockError, LockManager};
use iterctl::io::task_store::{load_task_list, load_task_list_lenient, write_task_list};
use iterctl::logging;
use iterctl::looping::{LoopStop, run_loop};
use iterctl::task::TaskDraft;

#[derive(Parser)]
#[command(
    name = "iterctl",
    version,
    about = "Run a coding agent through a task list, one turn at a time"
)]
struct Cli {
    /// Workspace directory (defaults to the current directory).
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run agent turns until the task list completes or the loop stops.
    Run {
        /// Override `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Classify one turn's output and print the verdict.
    Classify {
        /// File holding the agent output.
        #[arg(long)]
        output: PathBuf,
        /// Task list (defaults to the configured one).
        #[arg(long)]
        tasks: Option<PathBuf>,
    },
    /// Inspect or edit the task list.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
    /// Inspect workspace locks.
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
    /// Run or resolve file-based hooks.
    Hooks {
        #[command(subcommand)]
        command: HooksCommand,
    },
    /// Print the first genuine error line in an output file.
    ErrorLine {
        #[arg(long)]
        output: PathBuf,
        /// Print the normalized form instead of the raw line.
        #[arg(long)]
        normalize: bool,
    },
    /// Summarize the task list and uncommitted work.
    Status,
}

#[derive(Subcommand)]
enum TasksCommand {
    /// Print task ids in logical order.
    Sort,
    /// Print the first task that has not passed (exits 2 when none remain).
    Next,
    /// Insert a task after ID, past any existing minors.
    InsertAfter {
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Print the id `insert-after ID` would assign.
    NextId { id: String },
}

#[derive(Subcommand)]
enum LocksCommand {
    /// List live lock records.
    List,
    /// Remove records whose owner is no longer running.
    Reap,
    /// Report whether PATH overlaps a live lock (exits 3 on conflict).
    Check { path: PathBuf },
}

#[derive(Subcommand)]
enum HooksCommand {
    /// Run the hook script for POINT.
    Run {
        point: HookPoint,
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value_t = 0)]
        iteration: u32,
    },
    /// Print the script that would run for POINT (exits 1 when none).
    Exists { point: HookPoint },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<LockConflict>().is_some() {
                exit_codes::LOCK_CONFLICT
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workspace = match cli.workspace {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config = load_config(&workspace.join(CONFIG_PATH))?;
    match cli.command {
        Command::Run { max_iterations } => cmd_run(&workspace, config, max_iterations),
        Command::Classify { output, tasks } => {
            cmd_classify(&workspace, &config, &output, tasks.as_deref())
        }
        Command::Tasks { command } => cmd_tasks(&workspace, &config, command),
        Command::Locks { command } => cmd_locks(&config, command),
        Command::Hooks { command } => cmd_hooks(&workspace, &config, command),
        Command::ErrorLine { output, normalize } => cmd_error_line(&output, normalize),
        Command::Status => cmd_status(&workspace, &config),
    }
}

fn cmd_run(workspace: &Path, mut config: IterctlConfig, max_iterations: Option<u32>) -> Result<i32> {
    if let Some(max) = max_iterations {
        config.max_iterations = max;
        config.validate()?;
    }
    let agent = CommandAgent::new(config.agent.command.clone())?;
    let hooks = HookExecutor::scripts(config.hook_dirs(workspace));
    let outcome = run_loop(workspace, &agent, &hooks, &config, |turn| {
        println!(
            "turn {} [{}]: {}",
            turn.iteration,
            turn.story_id.as_deref().unwrap_or("-"),
            turn.verdict
        );
    })?;
    let code = match &outcome.stop {
        LoopStop::Complete => {
            println!("complete after {} turn(s)", outcome.turns);
            exit_codes::COMPLETE
        }
        LoopStop::ApiLimit => {
            eprintln!("stopped: agent usage limit reached");
            exit_codes::API_LIMIT
        }
        LoopStop::HookFailed { class, detail, .. } => {
            eprintln!("stopped: {detail}");
            match class {
                ExitClass::NeedsRework => exit_codes::VERIFICATION_FAILED,
                _ => exit_codes::INVALID,
            }
        }
        LoopStop::MaxIterationsReached { max_iterations } => {
            eprintln!("stopped: {max_iterations} turns without completing");
            exit_codes::INVALID
        }
    };
    Ok(code)
}

fn cmd_classify(
    workspace: &Path,
    config: &IterctlConfig,
    output: &Path,
    tasks: Option<&Path>,
) -> Result<i32> {
    let text =
        fs::read_to_string(output).with_context(|| format!("read output {}", output.display()))?;
    let task_path = match tasks {
        Some(path) => path.to_path_buf(),
        None => config.task_list_path(workspace),
    };
    let list = load_task_list_lenient(Some(&task_path));
    let classification = classify(&text, list.as_ref(), &config.markers());
    println!("{}", classification.verdict);
    Ok(match classification.verdict {
        Verdict::Complete => exit_codes::COMPLETE,
        Verdict::ApiLimit => exit_codes::API_LIMIT,
        Verdict::StoryComplete | Verdict::Continue => exit_codes::OK,
    })
}

fn cmd_tasks(workspace: &Path, config: &IterctlConfig, command: TasksCommand) -> Result<i32> {
    let path = config.task_list_path(workspace);
    // Edits hold the workspace lock so they cannot interleave with a running loop.
    let _lock = if matches!(command, TasksCommand::InsertAfter { .. }) {
        Some(LockManager::new(config.lock_dir()).acquire_workspace(workspace)?)
    } else {
        None
    };
    let mut list = load_task_list(&path)?;
    match command {
        TasksCommand::Sort => {
            for task in list.sorted()? {
                let state = if task.passes { "done" } else { "open" };
                println!("{} {state} {}", task.id, task.title);
            }
        }
        TasksCommand::Next => match list.next_open()? {
            Some(task) => println!("{}", task.id),
            None => return Ok(exit_codes::COMPLETE),
        },
        TasksCommand::InsertAfter {
            id,
            title,
            description,
        } => {
            let draft = TaskDraft {
                description,
                ..TaskDraft::titled(title)
            };
            let new_id = list.insert_after(&id, draft)?;
            write_task_list(&path, &list)?;
            println!("{new_id}");
        }
        TasksCommand::NextId { id } => println!("{}", list.next_id_after(&id)?),
    }
    Ok(exit_codes::OK)
}

fn cmd_locks(config: &IterctlConfig, command: LocksCommand) -> Result<i32> {
    let locks = LockManager::new(config.lock_dir());
    match command {
        LocksCommand::List => {
            for record in locks.list()? {
                println!(
                    "{}\tpid {}\t{}",
                    record.path.display(),
                    record.pid,
                    record.acquired_at
                );
            }
        }
        LocksCommand::Reap => {
            let reaped = locks.reap_stale()?;
            for record in &reaped {
                println!("reaped {} (pid {})", record.path.display(), record.pid);
            }
        }
        LocksCommand::Check { path } => match locks.check_conflicts(&path) {
            Ok(()) => println!("free"),
            Err(LockError::Conflict(conflict)) => {
                println!("{conflict}");
                return Ok(exit_codes::LOCK_CONFLICT);
            }
            Err(err) => return Err(err.into()),
        },
    }
    Ok(exit_codes::OK)
}

fn cmd_hooks(workspace: &Path, config: &IterctlConfig, command: HooksCommand) -> Result<i32> {
    let dirs = config.hook_dirs(workspace);
    match command {
        HooksCommand::Run {
            point,
            task,
            iteration,
        } => {
            let mut ctx = CallbackContext::new(point, workspace, iteration);
            if let Some(id) = task {
                ctx = ctx.with_story(id);
            }
            let outcome = HookExecutor::scripts(dirs).run(point, &ctx)?;
            Ok(match outcome.class() {
                ExitClass::Success => exit_codes::OK,
                ExitClass::NeedsRework => exit_codes::VERIFICATION_FAILED,
                ExitClass::Failure => {
                    eprintln!("{outcome}");
                    exit_codes::INVALID
                }
            })
        }
        HooksCommand::Exists { point } => {
            let Some(script) = resolve_hook(&dirs, point) else {
                eprintln!("no {point} hook");
                return Ok(exit_codes::INVALID);
            };
            let scope = match &dirs.feature {
                Some(dir) if hook_exists(point, dir) => "feature",
                _ => "project",
            };
            println!("{} ({scope})", script.display());
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_error_line(output: &Path, normalize: bool) -> Result<i32> {
    let text =
        fs::read_to_string(output).with_context(|| format!("read output {}", output.display()))?;
    if let Some(line) = first_error_line(&text) {
        if normalize {
            println!("{}", normalize_error(line));
        } else {
            println!("{line}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_status(workspace: &Path, config: &IterctlConfig) -> Result<i32> {
    let task_path = config.task_list_path(workspace);
    match load_task_list_lenient(Some(&task_path)) {
        Some(list) => {
            let open = list.tasks.iter().filter(|task| !task.passes).count();
            println!("tasks: {} total, {open} open", list.tasks.len());
            if let Some(next) = list.next_open()? {
                println!("next: {} {}", next.id, next.title);
            }
        }
        None => println!("tasks: none ({})", task_path.display()),
    }

    let git = Git::new(workspace);
    if !git.is_repo() {
        println!("git: not a repository");
        return Ok(exit_codes::OK);
    }
    let summary = git.working_tree_summary().context("inspect working tree")?;
    if summary.has_uncommitted_work() {
        print!("{}", summary.render());
    } else {
        println!("git: working tree clean");
    }
    Ok(exit_codes::OK)
}
