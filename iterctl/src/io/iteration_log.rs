//! Per-turn artifacts under `.iterctl/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::Verdict;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub iteration: u32,
    pub story_id: Option<String>,
    pub exit_code: Option<i32>,
    pub verdict: Option<Verdict>,
    pub done_tag_seen: bool,
    pub error_line: Option<String>,
    pub started_at: String,
    pub ended_at: String,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub output_path: PathBuf,
    pub stream_path: PathBuf,
}

impl IterationPaths {
    pub fn new(workspace: &Path, iteration: u32) -> Self {
        let dir = workspace
            .join(".iterctl")
            .join("iterations")
            .join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            output_path: dir.join("output.log"),
            stream_path: dir.join("stream.log"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }
}

/// Write the full agent output; hooks receive this path as `outputFile`.
pub fn write_output(paths: &IterationPaths, output: &str) -> Result<()> {
    paths.create()?;
    fs::write(&paths.output_path, output)
        .with_context(|| format!("write {}", paths.output_path.display()))
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    paths.create()?;
    let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf).with_context(|| format!("write {}", paths.meta_path.display()))
}
