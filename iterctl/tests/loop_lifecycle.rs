//! Loop-level tests for full iteration lifecycles.
//!
//! These drive `run_loop` with a scripted agent through several turns to
//! verify task selection, checkpoints, follow-up insertion between turns,
//! callback/script ordering, and loop termination.

use std::fs;
use std::sync::{Arc, Mutex};

use iterctl::callbacks::CallbackRegistry;
use iterctl::core::classifier::DEFAULT_STORY_TAG;
use iterctl::core::types::{HookPoint, Verdict};
use iterctl::hooks::HookExecutor;
use iterctl::io::iteration_log::IterationPaths;
use iterctl::io::lock::LockManager;
use iterctl::io::task_store::{load_task_list, write_task_list};
use iterctl::looping::{LoopStop, run_loop};
use iterctl::task::TaskDraft;
use iterctl::test_support::{ScriptedAgent, ScriptedTurn, TestWorkspace, task, task_list, write_hook};

/// Full lifecycle: a follow-up task is inserted between turns and picked up
/// before the next major task.
///
/// Execution sequence:
/// 1. Turn 1: T-001 → passes, story checkpoint; follow-up T-001.1 inserted.
/// 2. Turn 2: T-001.1 → passes, story checkpoint.
/// 3. Turn 3: T-002 → passes; task list complete.
#[test]
fn follow_up_tasks_run_before_next_major() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_tasks(&task_list(vec![task("T-001", false), task("T-002", false)]))
        .expect("write tasks");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = CallbackRegistry::new();
    for point in [HookPoint::StoryComplete, HookPoint::Complete] {
        let seen = Arc::clone(&seen);
        registry
            .register(point, "record", move |ctx| {
                seen.lock().expect("lock").push(format!(
                    "{}:{}",
                    ctx.hook_point,
                    ctx.story_id.as_deref().unwrap_or("-")
                ));
                Ok(())
            })
            .expect("register");
    }
    let hooks = HookExecutor::new(registry, ws.config.hook_dirs(ws.root()));

    let agent = ScriptedAgent::new(
        ws.task_list_path(),
        vec![
            ScriptedTurn::says(format!("T-001 done {DEFAULT_STORY_TAG}")).passing("T-001"),
            ScriptedTurn::says(format!("T-001.1 done {DEFAULT_STORY_TAG}")).passing("T-001.1"),
            ScriptedTurn::says("all done").passing("T-002"),
        ],
    );

    let task_path = ws.task_list_path();
    let mut verdicts = Vec::new();
    let outcome = run_loop(ws.root(), &agent, &hooks, &ws.config, |turn| {
        verdicts.push((turn.story_id.clone(), turn.verdict));
        if turn.iteration == 1 {
            let mut list = load_task_list(&task_path).expect("load");
            let id = list
                .insert_after("T-001", TaskDraft::titled("follow-up"))
                .expect("insert");
            assert_eq!(id.to_string(), "T-001.1");
            write_task_list(&task_path, &list).expect("write");
        }
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.turns, 3);
    assert_eq!(
        verdicts,
        vec![
            (Some("T-001".to_string()), Verdict::StoryComplete),
            (Some("T-001.1".to_string()), Verdict::StoryComplete),
            (Some("T-002".to_string()), Verdict::Complete),
        ]
    );
    assert_eq!(
        *seen.lock().expect("lock"),
        vec!["story-complete:T-001", "story-complete:T-001.1", "complete:T-002"]
    );

    let stored = ws.read_tasks().expect("read tasks");
    let ids: Vec<&str> = stored.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["T-001", "T-001.1", "T-002"]);
    assert!(stored.all_pass());

    for iteration in 1..=3 {
        let paths = IterationPaths::new(ws.root(), iteration);
        assert!(paths.output_path.is_file(), "output log for turn {iteration}");
        assert!(paths.meta_path.is_file(), "meta for turn {iteration}");
    }
    assert!(
        LockManager::new(ws.config.lock_dir())
            .list()
            .expect("list")
            .is_empty()
    );
}

/// Hook scripts see the per-turn context: story id, iteration, and the path
/// of the output log already written for that turn.
#[test]
fn post_iteration_hook_reads_turn_output() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_tasks(&task_list(vec![task("T-001", false)]))
        .expect("write tasks");
    let copy = ws.root().join("copied-output.txt");
    write_hook(
        &ws.feature_hook_dir(),
        "post-iteration.sh",
        &format!(
            "echo \"$ITERCTL_STORY_ID/$ITERCTL_ITERATION\" > '{copy}'\ncat \"$ITERCTL_OUTPUT_FILE\" >> '{copy}'\n",
            copy = copy.display()
        ),
        false,
    );

    let agent = ScriptedAgent::new(
        ws.task_list_path(),
        vec![ScriptedTurn::says("Error: build broke\n").passing("T-001")],
    );
    let hooks = HookExecutor::scripts(ws.config.hook_dirs(ws.root()));
    let mut error_lines = Vec::new();
    let outcome = run_loop(ws.root(), &agent, &hooks, &ws.config, |turn| {
        error_lines.push(turn.error_line.clone());
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(error_lines, vec![Some("Error: build broke".to_string())]);
    assert_eq!(
        fs::read_to_string(&copy).expect("copy"),
        "T-001/1\nError: build broke\n"
    );
}

/// A missing task list never crashes the loop: turns classify as `Continue`
/// unless the output carries a checkpoint or limit signal.
#[test]
fn missing_task_list_degrades_to_continue() {
    let mut ws = TestWorkspace::new().expect("workspace");
    ws.config.max_iterations = 2;
    let agent = ScriptedAgent::new(
        ws.task_list_path(),
        vec![
            ScriptedTurn::says("working"),
            ScriptedTurn::says("429 Too Many Requests"),
        ],
    );
    let hooks = HookExecutor::scripts(ws.config.hook_dirs(ws.root()));
    let mut verdicts = Vec::new();
    let outcome = run_loop(ws.root(), &agent, &hooks, &ws.config, |turn| {
        assert!(turn.story_id.is_none());
        verdicts.push(turn.verdict);
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::ApiLimit);
    assert_eq!(verdicts, vec![Verdict::Continue, Verdict::ApiLimit]);
}
