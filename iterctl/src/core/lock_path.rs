//! Pure path logic behind workspace locks.
//!
//! Paths handed to these helpers must already be canonical (absolute, no `.`
//! or `..`, symlinks resolved). Relationship tests work on path components,
//! so `/a/project` is never treated as an ancestor of `/a/project-other`.

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Extension used for lock record files.
pub const LOCK_RECORD_EXT: &str = "lock";

/// How an existing lock's path relates to a requested path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRelation {
    /// Both paths name the same directory.
    Same,
    /// The existing lock covers a parent directory of the requested path.
    ParentLocked,
    /// The existing lock covers a subdirectory of the requested path.
    SubdirectoryLocked,
}

impl fmt::Display for PathRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PathRelation::Same => "same path",
            PathRelation::ParentLocked => "parent directory already locked",
            PathRelation::SubdirectoryLocked => "subdirectory already locked",
        };
        f.write_str(label)
    }
}

/// Classify how `held` relates to `requested`, or `None` if they are disjoint.
pub fn relation(requested: &Path, held: &Path) -> Option<PathRelation> {
    let requested = normalize(requested);
    let held = normalize(held);
    if requested == held {
        return Some(PathRelation::Same);
    }
    if requested.starts_with(&held) {
        return Some(PathRelation::ParentLocked);
    }
    if held.starts_with(&requested) {
        return Some(PathRelation::SubdirectoryLocked);
    }
    None
}

/// Lexically normalize a path: drop `.` and trailing separators, resolve `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Derive the lock record file name for a canonical workspace path.
///
/// Every byte outside `[A-Za-z0-9_.~-]` is percent-encoded (including `/` and
/// `%` itself), so the mapping is injective: distinct paths never share a
/// record.
pub fn record_name(canonical: &Path) -> String {
    let normalized = normalize(canonical);
    let raw = normalized.to_string_lossy();
    format!("{}.{}", urlencoding::encode(&raw), LOCK_RECORD_EXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_detects_same_parent_and_child() {
        let locked = Path::new("/a/b");
        assert_eq!(relation(Path::new("/a/b"), locked), Some(PathRelation::Same));
        assert_eq!(
            relation(Path::new("/a/b/c"), locked),
            Some(PathRelation::ParentLocked)
        );
        assert_eq!(
            relation(Path::new("/a"), locked),
            Some(PathRelation::SubdirectoryLocked)
        );
        assert_eq!(relation(Path::new("/x"), locked), None);
    }

    #[test]
    fn relation_ignores_shared_string_prefix() {
        assert_eq!(
            relation(Path::new("/a/project-other"), Path::new("/a/project")),
            None
        );
        assert_eq!(
            relation(Path::new("/a/project"), Path::new("/a/project-other")),
            None
        );
    }

    #[test]
    fn relation_ignores_trailing_separators() {
        assert_eq!(
            relation(Path::new("/a/b/"), Path::new("/a/b")),
            Some(PathRelation::Same)
        );
        assert_eq!(
            relation(Path::new("/a/b/./c/.."), Path::new("/a/b")),
            Some(PathRelation::Same)
        );
    }

    #[test]
    fn record_names_do_not_alias() {
        let names = [
            record_name(Path::new("/a/b-c")),
            record_name(Path::new("/a-b/c")),
            record_name(Path::new("/a/b_c")),
            record_name(Path::new("/a_b/c")),
            record_name(Path::new("/a/b%2Fc")),
            record_name(Path::new("/a/b/c")),
        ];
        for (i, left) in names.iter().enumerate() {
            for right in names.iter().skip(i + 1) {
                assert_ne!(left, right);
            }
        }
    }

    #[test]
    fn record_name_has_no_separators() {
        let name = record_name(Path::new("/home/dev/project/"));
        assert!(!name.contains('/'));
        assert!(name.ends_with(".lock"));
        assert_eq!(name, record_name(Path::new("/home/dev/project")));
    }
}
