//! Error-line extraction from raw agent output.
//!
//! Agents echo file contents they read (`   42→    // Error: ...`) and embed
//! tool results in JSON payloads. Those lines are quoted material, not
//! failures, and are skipped before matching.

use std::sync::LazyLock;

use regex::Regex;

/// Substrings that mark a line as an error report.
pub const ERROR_MARKERS: [&str; 7] = [
    "Error:",
    "error:",
    "FAILED",
    "AssertionError:",
    "TypeError:",
    "SyntaxError:",
    "Exception:",
];

static LINE_NUMBER_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s*(?:→|->|\t)").unwrap());

static LEADING_TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*\[?(?:\d{4}-\d{2}-\d{2}[T ])?\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?\]?\s*",
    )
    .unwrap()
});

static LINE_NUMBER_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i):\d+(?::\d+)?\b|\bline \d+\b|\(\d+,\d+\)").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Return the first genuine error line in `output`, unmodified.
pub fn first_error_line(output: &str) -> Option<&str> {
    let mut in_tool_result = false;
    for line in output.lines() {
        if line.contains("<tool_result>") {
            in_tool_result = !line.contains("</tool_result>");
            continue;
        }
        if in_tool_result {
            if line.contains("</tool_result>") {
                in_tool_result = false;
            }
            continue;
        }
        if is_quoted_content(line) {
            continue;
        }
        if ERROR_MARKERS.iter().any(|marker| line.contains(marker)) {
            return Some(line);
        }
    }
    None
}

/// First genuine error line, normalized for comparison across turns.
pub fn extract_error(output: &str) -> Option<String> {
    first_error_line(output).map(normalize_error)
}

/// True for lines that are file content or tool payloads echoed by the agent.
fn is_quoted_content(line: &str) -> bool {
    if LINE_NUMBER_PREFIX_RE.is_match(line) {
        return true;
    }
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.contains("\"type\":\"tool_result\"") || compact.contains("\"tool_use_id\":")
}

/// Strip a leading timestamp, drop line/column tokens, collapse whitespace.
pub fn normalize_error(line: &str) -> String {
    let without_ts = LEADING_TIMESTAMP_RE.replace(line, "");
    let without_numbers = LINE_NUMBER_TOKEN_RE.replace_all(&without_ts, "");
    WHITESPACE_RE
        .replace_all(&without_numbers, " ")
        .trim()
        .to_string()
}
