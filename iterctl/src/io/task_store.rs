//! Task list load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;
use tracing::{debug, warn};

use crate::task::TaskList;

const TASK_LIST_SCHEMA: &str = include_str!("../../schemas/task_list.schema.json");

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(TASK_LIST_SCHEMA).unwrap();
    jsonschema::validator_for(&schema).unwrap()
});

/// Load and validate a task list from disk (schema + invariants).
pub fn load_task_list(path: &Path) -> Result<TaskList> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task list {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse task list {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate {}", path.display()))?;
    let list: TaskList = serde_json::from_value(value)
        .with_context(|| format!("deserialize task list {}", path.display()))?;
    list.validate()
        .with_context(|| format!("task list invariants failed in {}", path.display()))?;
    debug!(path = %path.display(), tasks = list.tasks.len(), "task list loaded");
    Ok(list)
}

/// Load a task list for classification, treating absence or damage as "no list".
pub fn load_task_list_lenient(path: Option<&Path>) -> Option<TaskList> {
    let path = path?;
    if !path.exists() {
        warn!(path = %path.display(), "task list missing; classifying without it");
        return None;
    }
    match load_task_list(path) {
        Ok(list) => Some(list),
        Err(err) => {
            let detail = format!("{err:#}");
            warn!(path = %path.display(), err = %detail, "task list unreadable; classifying without it");
            None
        }
    }
}

/// Atomically write a task list (temp file + rename), preserving storage order.
pub fn write_task_list(path: &Path, list: &TaskList) -> Result<()> {
    list.validate()
        .with_context(|| format!("refuse to write invalid task list {}", path.display()))?;
    let mut buf = serde_json::to_string_pretty(list).context("serialize task list")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("task list path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp task list {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace task list {}", path.display()))?;
    Ok(())
}

fn validate_schema(value: &Value) -> Result<()> {
    if VALIDATOR.is_valid(value) {
        return Ok(());
    }
    let messages = VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(anyhow!(
        "task list schema validation failed: {}",
        messages.join("; ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDraft;
    use crate::test_support::{task, task_list};

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let list = task_list(vec![task("T-002", false), task("T-001", true)]);

        write_task_list(&path, &list).expect("write");
        let loaded = load_task_list(&path).expect("load");
        assert_eq!(loaded, list);
        assert_eq!(loaded.tasks[0].id, "T-002");
    }

    #[test]
    fn load_rejects_schema_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        fs::write(&path, r#"{"tasks": [{"id": "T-001", "title": "x", "passes": "yes"}]}"#)
            .expect("write");
        let err = load_task_list(&path).expect_err("schema violation");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn load_rejects_duplicate_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        fs::write(
            &path,
            r#"{"tasks": [{"id": "T-001", "title": "a"}, {"id": "T-001", "title": "b"}]}"#,
        )
        .expect("write");
        let err = load_task_list(&path).expect_err("duplicate");
        assert!(format!("{err:#}").contains("duplicate task id 'T-001'"));
    }

    #[test]
    fn lenient_load_degrades_to_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("missing.json");
        assert!(load_task_list_lenient(Some(&missing)).is_none());
        assert!(load_task_list_lenient(None).is_none());

        let broken = temp.path().join("broken.json");
        fs::write(&broken, "{ not json").expect("write");
        assert!(load_task_list_lenient(Some(&broken)).is_none());
    }

    #[test]
    fn inserted_task_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let mut list = task_list(vec![task("T-001", false), task("T-002", false)]);
        list.insert_after("T-001", TaskDraft::titled("new"))
            .expect("insert");
        write_task_list(&path, &list).expect("write");

        let loaded = load_task_list(&path).expect("load");
        let stored: Vec<&str> = loaded.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(stored, vec!["T-001", "T-001.1", "T-002"]);
    }
}
