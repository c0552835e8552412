//! Shared deterministic types for iteration control.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// What the orchestrator should do after a turn.
///
/// Variants are listed in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every task in the task list passes.
    Complete,
    /// The agent finished one unit of work and asked for a fresh turn.
    StoryComplete,
    /// The upstream agent hit a usage or rate limit.
    ApiLimit,
    /// Nothing conclusive; run another turn.
    Continue,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Complete => "complete",
            Verdict::StoryComplete => "story_complete",
            Verdict::ApiLimit => "api_limit",
            Verdict::Continue => "continue",
        };
        f.write_str(label)
    }
}

/// Named lifecycle points at which extensions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPoint {
    PreIteration,
    PostIteration,
    StoryComplete,
    Complete,
}

impl HookPoint {
    pub const ALL: [HookPoint; 4] = [
        HookPoint::PreIteration,
        HookPoint::PostIteration,
        HookPoint::StoryComplete,
        HookPoint::Complete,
    ];

    /// Stable name used for script file names and the hook-point env var.
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::PreIteration => "pre-iteration",
            HookPoint::PostIteration => "post-iteration",
            HookPoint::StoryComplete => "story-complete",
            HookPoint::Complete => "complete",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .into_iter()
            .find(|point| point.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = HookPoint::ALL.iter().map(|p| p.as_str()).collect();
                anyhow!("unknown hook point '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// The three exit-code classes other subsystems may special-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    Success,
    /// Soft failure: redo the unit of work.
    NeedsRework,
    /// Hard failure: surfaced, never retried automatically.
    Failure,
}

impl ExitClass {
    /// Classify a process exit code. `None` (killed by a signal) is a hard failure.
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(exit_codes::OK) => ExitClass::Success,
            Some(exit_codes::VERIFICATION_FAILED) => ExitClass::NeedsRework,
            _ => ExitClass::Failure,
        }
    }
}

/// Per-invocation context handed to hooks and callbacks.
///
/// Serialized (camelCase) to a private temp file for file-based hooks and
/// mirrored into environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackContext {
    pub hook_point: HookPoint,
    pub story_id: Option<String>,
    pub iteration: u32,
    pub feature_dir: PathBuf,
    pub output_file: Option<PathBuf>,
    pub timestamp: String,
}

impl CallbackContext {
    /// Build a context stamped with the current UTC time.
    pub fn new(hook_point: HookPoint, feature_dir: impl Into<PathBuf>, iteration: u32) -> Self {
        Self {
            hook_point,
            story_id: None,
            iteration,
            feature_dir: feature_dir.into(),
            output_file: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// Same context retargeted at another lifecycle point.
    pub fn at(&self, hook_point: HookPoint) -> Self {
        Self {
            hook_point,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_class_maps_reserved_codes() {
        assert_eq!(ExitClass::from_code(Some(0)), ExitClass::Success);
        assert_eq!(ExitClass::from_code(Some(75)), ExitClass::NeedsRework);
        assert_eq!(ExitClass::from_code(Some(1)), ExitClass::Failure);
        assert_eq!(ExitClass::from_code(None), ExitClass::Failure);
    }

    #[test]
    fn hook_point_names_parse_back() {
        for point in HookPoint::ALL {
            assert_eq!(point.as_str().parse::<HookPoint>().expect("parse"), point);
        }
        assert!("before-turn".parse::<HookPoint>().is_err());
    }

    #[test]
    fn callback_context_serializes_camel_case() {
        let ctx = CallbackContext {
            hook_point: HookPoint::PostIteration,
            story_id: Some("T-001".to_string()),
            iteration: 3,
            feature_dir: PathBuf::from("/work/feature"),
            output_file: Some(PathBuf::from("/work/out.log")),
            timestamp: "2024-01-01T00:00:00+00:00".to_string(),
        };
        let value = serde_json::to_value(&ctx).expect("serialize");
        assert_eq!(value["hookPoint"], "post-iteration");
        assert_eq!(value["storyId"], "T-001");
        assert_eq!(value["iteration"], 3);
        assert_eq!(value["featureDir"], "/work/feature");
        assert_eq!(value["outputFile"], "/work/out.log");
    }
}
