//! Workspace configuration stored under `.iterctl/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::classifier::{
    CompletionMarkers, DEFAULT_DONE_TAG, DEFAULT_STORY_TAG, MarkerKind,
};
use crate::io::hooks::HookDirs;
use crate::io::lock::{LOCK_DIR_ENV, LockManager};

pub const CONFIG_PATH: &str = ".iterctl/config.toml";
pub const DONE_TAG_ENV: &str = "ITERCTL_DONE_TAG";
pub const STORY_TAG_ENV: &str = "ITERCTL_STORY_TAG";

/// Workspace configuration (TOML).
///
/// Missing fields take their defaults, so an empty or absent file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IterctlConfig {
    /// Turns to run before giving up.
    pub max_iterations: u32,

    /// Task list path, relative to the workspace unless absolute.
    pub task_list: PathBuf,

    pub agent: AgentConfig,
    pub markers: MarkerConfig,
    pub hooks: HookConfig,
    pub background: BackgroundConfig,
    pub locks: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv; the prompt is piped to stdin.
    pub command: Vec<String>,
    /// Per-turn wall-clock budget in seconds.
    pub timeout_secs: u64,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MarkerConfig {
    pub done_tag: String,
    pub story_tag: String,
    pub custom_done: Vec<String>,
    pub custom_story: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            done_tag: DEFAULT_DONE_TAG.to_string(),
            story_tag: DEFAULT_STORY_TAG.to_string(),
            custom_done: Vec::new(),
            custom_story: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HookConfig {
    /// Feature-scoped scripts; default `<workspace>/.iterctl/hooks`.
    pub feature_dir: Option<PathBuf>,
    /// Project-scoped scripts; default `<workspace>/../.iterctl/hooks`.
    pub project_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackgroundConfig {
    pub max_concurrent: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub dir: Option<PathBuf>,
}

impl Default for IterctlConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            task_list: PathBuf::from(".iterctl/tasks.json"),
            agent: AgentConfig::default(),
            markers: MarkerConfig::default(),
            hooks: HookConfig::default(),
            background: BackgroundConfig::default(),
            locks: LockConfig::default(),
        }
    }
}

impl IterctlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.task_list.as_os_str().is_empty() {
            return Err(anyhow!("task_list must not be empty"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.markers.done_tag.is_empty() || self.markers.story_tag.is_empty() {
            return Err(anyhow!("markers.done_tag and markers.story_tag must be non-empty"));
        }
        if self.markers.done_tag == self.markers.story_tag {
            return Err(anyhow!("markers.done_tag and markers.story_tag must differ"));
        }
        if self.background.max_concurrent == 0 {
            return Err(anyhow!("background.max_concurrent must be > 0"));
        }
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
        if let Some(tag) = non_empty(DONE_TAG_ENV) {
            debug!(tag = %tag, "done tag overridden from environment");
            self.markers.done_tag = tag;
        }
        if let Some(tag) = non_empty(STORY_TAG_ENV) {
            debug!(tag = %tag, "story tag overridden from environment");
            self.markers.story_tag = tag;
        }
        if let Some(dir) = non_empty(LOCK_DIR_ENV) {
            self.locks.dir = Some(PathBuf::from(dir));
        }
    }

    pub fn markers(&self) -> CompletionMarkers {
        let mut markers =
            CompletionMarkers::new(self.markers.done_tag.clone(), self.markers.story_tag.clone());
        for marker in &self.markers.custom_done {
            markers.add(MarkerKind::Done, marker.clone());
        }
        for marker in &self.markers.custom_story {
            markers.add(MarkerKind::Story, marker.clone());
        }
        markers
    }

    pub fn task_list_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.task_list)
    }

    pub fn feature_hook_dir(&self, workspace: &Path) -> PathBuf {
        match &self.hooks.feature_dir {
            Some(dir) => workspace.join(dir),
            None => workspace.join(".iterctl").join("hooks"),
        }
    }

    /// Project hooks live beside the workspace's parent unless configured.
    pub fn project_hook_dir(&self, workspace: &Path) -> Option<PathBuf> {
        match &self.hooks.project_dir {
            Some(dir) => Some(workspace.join(dir)),
            None => workspace
                .parent()
                .map(|parent| parent.join(".iterctl").join("hooks")),
        }
    }

    pub fn hook_dirs(&self, workspace: &Path) -> HookDirs {
        HookDirs {
            feature: Some(self.feature_hook_dir(workspace)),
            project: self.project_hook_dir(workspace),
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.locks.dir.clone().unwrap_or_else(LockManager::default_dir)
    }
}

/// Load config from a TOML file and apply environment overrides.
///
/// If the file is missing, starts from `IterctlConfig::default()`.
pub fn load_config(path: &Path) -> Result<IterctlConfig> {
    let mut cfg = read_config(path)?;
    cfg.apply_overrides(|key| std::env::var(key).ok());
    cfg.validate()?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<IterctlConfig> {
    if !path.exists() {
        return Ok(IterctlConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &IterctlConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = read_config(&temp.path().join("missing.toml")).expect("read");
        assert_eq!(cfg, IterctlConfig::default());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".iterctl").join("config.toml");
        let mut cfg = IterctlConfig::default();
        cfg.max_iterations = 7;
        cfg.markers.custom_story.push("CHECKPOINT".to_string());
        cfg.locks.dir = Some(temp.path().join("locks"));
        write_config(&path, &cfg).expect("write");
        assert_eq!(read_config(&path).expect("read"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 3\n[agent]\ntimeout_secs = 10\n").expect("write");
        let cfg = read_config(&path).expect("read");
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.agent.timeout_secs, 10);
        assert_eq!(cfg.agent.command, vec!["claude", "-p"]);
        assert_eq!(cfg.markers.done_tag, DEFAULT_DONE_TAG);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = IterctlConfig::default();
        cfg.agent.command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = IterctlConfig::default();
        cfg.markers.story_tag = cfg.markers.done_tag.clone();
        assert!(cfg.validate().is_err());

        let mut cfg = IterctlConfig::default();
        cfg.background.max_concurrent = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = IterctlConfig::default();
        cfg.apply_overrides(|key| match key {
            DONE_TAG_ENV => Some("<done/>".to_string()),
            STORY_TAG_ENV => Some(String::new()),
            LOCK_DIR_ENV => Some("/tmp/iterctl-test-locks".to_string()),
            _ => None,
        });
        assert_eq!(cfg.markers.done_tag, "<done/>");
        assert_eq!(cfg.markers.story_tag, DEFAULT_STORY_TAG);
        assert_eq!(cfg.lock_dir(), PathBuf::from("/tmp/iterctl-test-locks"));
    }

    #[test]
    fn markers_include_custom_patterns() {
        let mut cfg = IterctlConfig::default();
        cfg.markers.custom_story.push("CHECKPOINT".to_string());
        let markers = cfg.markers();
        assert!(markers.matches(MarkerKind::Story, "reached CHECKPOINT"));
        assert!(markers.matches(MarkerKind::Done, DEFAULT_DONE_TAG));
        assert!(!markers.matches(MarkerKind::Done, "CHECKPOINT"));
    }

    #[test]
    fn hook_dirs_resolve_against_workspace() {
        let cfg = IterctlConfig::default();
        let ws = Path::new("/work/feature");
        assert_eq!(
            cfg.feature_hook_dir(ws),
            PathBuf::from("/work/feature/.iterctl/hooks")
        );
        assert_eq!(
            cfg.project_hook_dir(ws),
            Some(PathBuf::from("/work/.iterctl/hooks"))
        );
        assert_eq!(
            cfg.task_list_path(ws),
            PathBuf::from("/work/feature/.iterctl/tasks.json")
        );
    }
}
