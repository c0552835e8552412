//! Insertable task identifiers of the form `<prefix>-<major>[.<minor>]`.
//!
//! The minor suffix is an insertion counter: a new task spliced in after
//! `TASK-002` becomes `TASK-002.1`, the next one `TASK-002.2`, and so on,
//! without renumbering any sibling. Ordering compares `major` numerically and
//! then `minor` as a bare integer (`.9 < .10`), with an absent minor sorting
//! first.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing or generating task ids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskIdError {
    #[error("malformed task id '{id}': {reason}")]
    Malformed { id: String, reason: &'static str },
    #[error("cannot generate an id between '{lower}' and '{upper}': majors differ")]
    MajorMismatch { lower: String, upper: String },
    #[error("cannot generate an id between '{lower}' and '{upper}': bounds are not ordered")]
    BoundsNotOrdered { lower: String, upper: String },
    #[error("no free slot between '{lower}' and '{upper}'")]
    NoSlotBetween { lower: String, upper: String },
    #[error("minor counter of '{id}' is exhausted")]
    MinorOverflow { id: String },
}

/// Parsed task identifier.
///
/// The zero-padding width of the major number is kept so that `TASK-002`
/// renders back as `TASK-002` rather than `TASK-2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    prefix: String,
    major: u64,
    major_width: usize,
    minor: Option<u64>,
}

impl TaskId {
    /// Parse `<prefix>-<major>[.<minor>]`.
    pub fn parse(raw: &str) -> Result<Self, TaskIdError> {
        let malformed = |reason| TaskIdError::Malformed {
            id: raw.to_string(),
            reason,
        };

        let (prefix, number) = raw
            .rsplit_once('-')
            .ok_or_else(|| malformed("missing '-' between prefix and number"))?;
        if prefix.is_empty() {
            return Err(malformed("empty prefix"));
        }
        if prefix.chars().any(char::is_whitespace) {
            return Err(malformed("prefix contains whitespace"));
        }

        let (major_raw, minor_raw) = match number.split_once('.') {
            Some((major, minor)) => (major, Some(minor)),
            None => (number, None),
        };
        let major = parse_digits(major_raw).ok_or_else(|| malformed("major is not a number"))?;
        let minor = match minor_raw {
            // `.01` would compare equal to `.1` while spelling a different id.
            Some(minor) if minor.len() > 1 && minor.starts_with('0') => {
                return Err(malformed("minor has a leading zero"));
            }
            Some(minor) => {
                Some(parse_digits(minor).ok_or_else(|| malformed("minor is not a number"))?)
            }
            None => None,
        };

        Ok(Self {
            prefix: prefix.to_string(),
            major,
            major_width: major_raw.len(),
            minor,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> Option<u64> {
        self.minor
    }

    /// True when `other` shares this id's prefix and major number.
    pub fn same_major(&self, other: &TaskId) -> bool {
        self.prefix == other.prefix && self.major == other.major
    }

    fn with_minor(&self, minor: u64) -> Self {
        Self {
            prefix: self.prefix.clone(),
            major: self.major,
            major_width: self.major_width,
            minor: Some(minor),
        }
    }

    /// Next id in the insertion counter: `X` becomes `X.1`, `X.n` becomes `X.(n+1)`.
    pub fn generate_after(&self) -> Result<Self, TaskIdError> {
        match self.minor {
            None => Ok(self.with_minor(1)),
            Some(minor) => self.bumped(minor),
        }
    }

    fn bumped(&self, minor: u64) -> Result<Self, TaskIdError> {
        minor
            .checked_add(1)
            .map(|next| self.with_minor(next))
            .ok_or_else(|| TaskIdError::MinorOverflow {
                id: self.with_minor(minor).to_string(),
            })
    }

    /// Append past the highest minor already used under this id's major.
    ///
    /// Gaps are never filled: with `.1` and `.3` present the result is `.4`.
    pub fn generate_next_available<'a, I>(&self, existing: I) -> Result<Self, TaskIdError>
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        let max_minor = existing
            .into_iter()
            .filter(|id| id.same_major(self))
            .filter_map(|id| id.minor)
            .max();
        match max_minor {
            Some(max) => self.bumped(max),
            None => Ok(self.with_minor(1)),
        }
    }

    /// Midpoint between two ids that share a major, treating each minor as the
    /// digits after a decimal point.
    ///
    /// Minors `1` and `11` are padded to `10`/`11`, averaged to `10.5`, and the
    /// digits `105` become the new minor. The result is compared as a bare
    /// integer like every other minor, so it can sort after `upper`.
    pub fn generate_between(lower: &TaskId, upper: &TaskId) -> Result<Self, TaskIdError> {
        if !lower.same_major(upper) {
            return Err(TaskIdError::MajorMismatch {
                lower: lower.to_string(),
                upper: upper.to_string(),
            });
        }
        if lower >= upper {
            return Err(TaskIdError::BoundsNotOrdered {
                lower: lower.to_string(),
                upper: upper.to_string(),
            });
        }

        let mut lower_digits = lower.minor.unwrap_or(0).to_string();
        let mut upper_digits = upper.minor.unwrap_or(0).to_string();
        let width = lower_digits.len().max(upper_digits.len());
        pad_right(&mut lower_digits, width);
        pad_right(&mut upper_digits, width);

        let no_slot = || TaskIdError::NoSlotBetween {
            lower: lower.to_string(),
            upper: upper.to_string(),
        };
        let lower_value: u128 = lower_digits.parse().map_err(|_| no_slot())?;
        let upper_value: u128 = upper_digits.parse().map_err(|_| no_slot())?;
        let sum = lower_value + upper_value;
        let mut digits = format!("{:0width$}", sum / 2, width = width);
        if sum % 2 == 1 {
            digits.push('5');
        }

        let minor = parse_digits(&digits).ok_or_else(no_slot)?;
        let candidate = lower.with_minor(minor);
        if candidate == *lower || candidate == *upper || minor == 0 {
            return Err(no_slot());
        }
        Ok(candidate)
    }
}

fn parse_digits(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

fn pad_right(digits: &mut String, width: usize) {
    while digits.len() < width {
        digits.push('0');
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:0width$}",
            self.prefix,
            self.major,
            width = self.major_width
        )?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
        }
        Ok(())
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            // Ties on the numeric key fall back to the textual parts so that
            // distinct ids never compare equal.
            .then_with(|| self.prefix.cmp(&other.prefix))
            .then_with(|| self.major_width.cmp(&other.major_width))
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two raw ids, failing if either is malformed.
pub fn compare_ids(a: &str, b: &str) -> Result<Ordering, TaskIdError> {
    Ok(TaskId::parse(a)?.cmp(&TaskId::parse(b)?))
}
