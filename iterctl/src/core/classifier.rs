//! Turn classification: agent output + task list state to a single [`Verdict`].
//!
//! Priority, first match wins:
//! 1. `Complete` when the task list confirms every task passes.
//! 2. `StoryComplete` when the output carries a story tag.
//! 3. `ApiLimit` when the output mentions a usage or rate limit.
//! 4. `Continue` otherwise.
//!
//! A done tag in the output is reported on [`Classification::done_tag_seen`]
//! but never produces `Complete` without the task list agreeing.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Verdict;
use crate::task::TaskList;

pub const DEFAULT_DONE_TAG: &str = "<promise>COMPLETE</promise>";
pub const DEFAULT_STORY_TAG: &str = "<promise>STORY_COMPLETE</promise>";

/// Which completion signal a marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Whole-run completion claim (still needs task list confirmation).
    Done,
    /// Single unit of work finished; pause for a fresh turn.
    Story,
}

/// Literal substrings that signal completion in agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarkers {
    done_tag: String,
    story_tag: String,
    custom_done: Vec<String>,
    custom_story: Vec<String>,
}

impl Default for CompletionMarkers {
    fn default() -> Self {
        Self::new(DEFAULT_DONE_TAG, DEFAULT_STORY_TAG)
    }
}

impl CompletionMarkers {
    pub fn new(done_tag: impl Into<String>, story_tag: impl Into<String>) -> Self {
        Self {
            done_tag: done_tag.into(),
            story_tag: story_tag.into(),
            custom_done: Vec::new(),
            custom_story: Vec::new(),
        }
    }

    pub fn done_tag(&self) -> &str {
        &self.done_tag
    }

    pub fn story_tag(&self) -> &str {
        &self.story_tag
    }

    /// Register an extra marker. Empty or repeated markers are ignored.
    pub fn add(&mut self, kind: MarkerKind, marker: impl Into<String>) {
        let marker = marker.into();
        if marker.trim().is_empty() {
            return;
        }
        let list = match kind {
            MarkerKind::Done => &mut self.custom_done,
            MarkerKind::Story => &mut self.custom_story,
        };
        if !list.contains(&marker) {
            list.push(marker);
        }
    }

    fn patterns(&self, kind: MarkerKind) -> impl Iterator<Item = &str> {
        let (tag, custom) = match kind {
            MarkerKind::Done => (&self.done_tag, &self.custom_done),
            MarkerKind::Story => (&self.story_tag, &self.custom_story),
        };
        std::iter::once(tag.as_str())
            .chain(custom.iter().map(String::as_str))
            .filter(|pattern| !pattern.is_empty())
    }

    /// True if `output` contains any marker of `kind`.
    pub fn matches(&self, kind: MarkerKind, output: &str) -> bool {
        self.patterns(kind).any(|pattern| output.contains(pattern))
    }
}

/// Result of classifying one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    /// A done marker appeared in the output, whether or not it was confirmed.
    pub done_tag_seen: bool,
}

/// Classify a turn. `tasks` is `None` when no task list could be read.
pub fn classify(
    output: &str,
    tasks: Option<&TaskList>,
    markers: &CompletionMarkers,
) -> Classification {
    let done_tag_seen = markers.matches(MarkerKind::Done, output);
    let verdict = if tasks.is_some_and(TaskList::all_pass) {
        Verdict::Complete
    } else if markers.matches(MarkerKind::Story, output) {
        Verdict::StoryComplete
    } else if is_api_limit(output) {
        Verdict::ApiLimit
    } else {
        Verdict::Continue
    };
    Classification {
        verdict,
        done_tag_seen,
    }
}

static API_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)usage limit|rate[ _-]?limit|too many requests|\b\d+[ -]?hour limit|exceeded\b.*\blimit|limit\b.*\bexceeded|quota exceeded",
    )
    .unwrap()
});

/// Case-insensitive scan for upstream usage/rate limit phrases.
pub fn is_api_limit(output: &str) -> bool {
    API_LIMIT_RE.is_match(output)
}
