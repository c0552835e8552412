//! Advisory workspace locks shared by every iterctl process on the machine.
//!
//! One JSON record per locked workspace lives in a shared lock directory. A
//! lock conflicts with any live record whose path is the same directory, an
//! ancestor, or a descendant. Records whose owner pid is gone are ignored and
//! reaped opportunistically. Nothing here sleeps or retries: on conflict the
//! caller decides whether to wait, prompt, or give up.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::lock_path::{LOCK_RECORD_EXT, PathRelation, normalize, record_name, relation};
use crate::io::process::is_process_alive;

/// Env var that overrides the shared lock directory.
pub const LOCK_DIR_ENV: &str = "ITERCTL_LOCK_DIR";

/// On-disk lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub path: PathBuf,
    pub acquired_at: String,
}

/// Another live process holds an overlapping lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "cannot lock {}: {relation} ({} is held by pid {holder_pid})",
    requested.display(),
    held.display()
)]
pub struct LockConflict {
    pub requested: PathBuf,
    pub held: PathBuf,
    pub holder_pid: u32,
    pub relation: PathRelation,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Conflict(#[from] LockConflict),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        LockError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn conflict(&self) -> Option<&LockConflict> {
        match self {
            LockError::Conflict(conflict) => Some(conflict),
            LockError::Io { .. } => None,
        }
    }
}

/// Exclusive claim on a workspace path. Released on drop if not released explicitly.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    record_path: PathBuf,
    pid: u32,
    released: bool,
}

impl LockHandle {
    /// Canonical workspace path this handle covers.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the record if it still belongs to this handle's pid.
    ///
    /// Returns `false` when the record was already gone or now belongs to a
    /// different process (which is left untouched).
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        release_record(&self.record_path, &self.path, self.pid)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_record(&self.record_path, &self.path, self.pid) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock on drop");
        }
    }
}

fn release_record(record_path: &Path, path: &Path, pid: u32) -> Result<bool, LockError> {
    let Some(record) = read_record(record_path)? else {
        debug!(path = %path.display(), "lock record already gone");
        return Ok(false);
    };
    if record.pid != pid {
        warn!(
            path = %path.display(),
            owner = record.pid,
            caller = pid,
            "lock record owned by another process; leaving it"
        );
        return Ok(false);
    }
    match fs::remove_file(record_path) {
        Ok(()) => {
            info!(path = %path.display(), pid, "lock released");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(LockError::io(
            format!("remove lock record {}", record_path.display()),
            err,
        )),
    }
}

/// Lock manager bound to a lock directory and an owner pid.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    pid: u32,
}

impl LockManager {
    /// Manager owning locks on behalf of the current process.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pid: std::process::id(),
        }
    }

    /// Act on behalf of another pid (diagnostics and tests).
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// `$ITERCTL_LOCK_DIR`, else `$HOME/.iterctl/locks`, else a temp-dir fallback.
    pub fn default_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(LOCK_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            Some(home) => PathBuf::from(home).join(".iterctl").join("locks"),
            None => std::env::temp_dir().join("iterctl-locks"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claim `path` for this manager's pid.
    #[instrument(skip_all, fields(path = %path.display(), pid = self.pid))]
    pub fn acquire(&self, path: &Path) -> Result<LockHandle, LockError> {
        let canonical = canonicalize_lenient(path)?;
        fs::create_dir_all(&self.dir)
            .map_err(|err| LockError::io(format!("create lock dir {}", self.dir.display()), err))?;
        self.reap_stale()?;
        self.scan_overlaps(&canonical, None)?;

        let record_path = self.dir.join(record_name(&canonical));
        let record = LockRecord {
            pid: self.pid,
            path: canonical.clone(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };

        // A dead owner may slip in between reap and publish; retry once after clearing it.
        for _ in 0..2 {
            if self.publish(&record_path, &record)? {
                // A racing acquire of a nested path may have passed its own scan
                // before our record existed. Both sides re-scan after publishing;
                // a side that sees an overlap withdraws.
                if let Err(err) = self.scan_overlaps(&canonical, Some(record_path.as_path())) {
                    remove_if_exists(&record_path)?;
                    return Err(err);
                }
                info!(path = %canonical.display(), pid = self.pid, "lock acquired");
                return Ok(LockHandle {
                    path: canonical,
                    record_path,
                    pid: self.pid,
                    released: false,
                });
            }
            match read_record(&record_path)? {
                Some(existing) if is_process_alive(existing.pid) => {
                    return Err(LockConflict {
                        requested: canonical,
                        held: existing.path,
                        holder_pid: existing.pid,
                        relation: PathRelation::Same,
                    }
                    .into());
                }
                _ => remove_if_exists(&record_path)?,
            }
        }
        Err(LockError::io(
            format!("publish lock record {}", record_path.display()),
            io::Error::new(ErrorKind::AlreadyExists, "record kept reappearing"),
        ))
    }

    /// [`Self::acquire`] for callers working in `anyhow`: a conflict comes back
    /// as a bare [`LockConflict`] so it can be recognized by downcasting.
    pub fn acquire_workspace(&self, workspace: &Path) -> anyhow::Result<LockHandle> {
        match self.acquire(workspace) {
            Ok(handle) => Ok(handle),
            Err(LockError::Conflict(conflict)) => Err(conflict.into()),
            Err(err) => Err(anyhow::Error::new(err).context("acquire workspace lock")),
        }
    }

    /// Report whether `path` overlaps any live lock.
    pub fn check_conflicts(&self, path: &Path) -> Result<(), LockError> {
        let canonical = canonicalize_lenient(path)?;
        self.scan_overlaps(&canonical, None)
    }

    fn scan_overlaps(&self, canonical: &Path, own_record: Option<&Path>) -> Result<(), LockError> {
        for (file, record) in self.read_all()? {
            if own_record == Some(file.as_path()) || !is_process_alive(record.pid) {
                continue;
            }
            if let Some(relation) = relation(canonical, &record.path) {
                debug!(held = %record.path.display(), holder = record.pid, %relation, "lock conflict");
                return Err(LockConflict {
                    requested: canonical.to_path_buf(),
                    held: record.path,
                    holder_pid: record.pid,
                    relation,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Release a handle obtained from this manager.
    pub fn release(&self, handle: LockHandle) -> Result<bool, LockError> {
        handle.release()
    }

    /// Delete every record whose owner pid is no longer running.
    #[instrument(skip_all)]
    pub fn reap_stale(&self) -> Result<Vec<LockRecord>, LockError> {
        let mut reaped = Vec::new();
        for (file, record) in self.read_all()? {
            if is_process_alive(record.pid) {
                continue;
            }
            warn!(path = %record.path.display(), pid = record.pid, "reaping stale lock");
            remove_if_exists(&file)?;
            reaped.push(record);
        }
        Ok(reaped)
    }

    /// Live lock records, sorted by path.
    pub fn list(&self) -> Result<Vec<LockRecord>, LockError> {
        let mut live: Vec<LockRecord> = self
            .read_all()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| is_process_alive(record.pid))
            .collect();
        live.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(live)
    }

    /// Write the record via temp file + hard link so readers never see a partial
    /// record. Returns `false` if a record already exists at `record_path`.
    fn publish(&self, record_path: &Path, record: &LockRecord) -> Result<bool, LockError> {
        let mut payload = serde_json::to_vec_pretty(record)
            .map_err(|err| LockError::io("serialize lock record", err.into()))?;
        payload.push(b'\n');

        let tmp_path = self.dir.join(format!(
            ".{}.{}.tmp",
            record_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            self.pid
        ));
        let write_tmp = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&payload)?;
            file.sync_all()
        };
        write_tmp().map_err(|err| {
            LockError::io(format!("write lock temp file {}", tmp_path.display()), err)
        })?;

        let linked = fs::hard_link(&tmp_path, record_path);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(LockError::io(
                format!("publish lock record {}", record_path.display()),
                err,
            )),
        }
    }

    fn read_all(&self) -> Result<Vec<(PathBuf, LockRecord)>, LockError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(LockError::io(
                    format!("read lock dir {}", self.dir.display()),
                    err,
                ));
            }
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| LockError::io(format!("read lock dir {}", self.dir.display()), err))?;
            let file = entry.path();
            if file.extension().and_then(|ext| ext.to_str()) != Some(LOCK_RECORD_EXT) {
                continue;
            }
            if let Some(record) = read_record(&file)? {
                records.push((file, record));
            }
        }
        Ok(records)
    }
}

/// Read one record. Missing files yield `None`; unparsable records are skipped.
fn read_record(file: &Path) -> Result<Option<LockRecord>, LockError> {
    let contents = match fs::read_to_string(file) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(LockError::io(
                format!("read lock record {}", file.display()),
                err,
            ));
        }
    };
    match serde_json::from_str(&contents) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            warn!(file = %file.display(), err = %err, "skipping unparsable lock record");
            Ok(None)
        }
    }
}

fn remove_if_exists(file: &Path) -> Result<(), LockError> {
    match fs::remove_file(file) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LockError::io(
            format!("remove lock record {}", file.display()),
            err,
        )),
    }
}

/// Canonicalize `path`, tolerating components that do not exist yet.
///
/// The longest existing ancestor is resolved through the filesystem; the
/// remainder is appended after lexical normalization.
pub fn canonicalize_lenient(path: &Path) -> Result<PathBuf, LockError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| LockError::io("resolve current directory", err))?
            .join(path)
    };
    let absolute = normalize(&absolute);

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        match fs::canonicalize(existing) {
            Ok(resolved) => {
                let mut out = resolved;
                for component in missing.iter().rev() {
                    out.push(component);
                }
                return Ok(out);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let Some(name) = existing.file_name() else {
                    return Err(LockError::io(
                        format!("canonicalize {}", path.display()),
                        err,
                    ));
                };
                missing.push(name.to_os_string());
                existing = match existing.parent() {
                    Some(parent) => parent,
                    None => return Err(LockError::io(format!("canonicalize {}", path.display()), err)),
                };
            }
            Err(err) => {
                return Err(LockError::io(
                    format!("canonicalize {}", path.display()),
                    err,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::test_support::{dead_pid, spawn_sleeper};

    fn manager(temp: &tempfile::TempDir) -> LockManager {
        LockManager::new(temp.path().join("locks"))
    }

    #[test]
    fn second_acquire_of_same_path_conflicts_until_released() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).expect("mkdir");
        let locks = manager(&temp);

        let mut sleeper = spawn_sleeper();
        let other = locks.clone().with_owner_pid(sleeper.id());
        let held = other.acquire(&workspace).expect("first acquire");

        let err = locks.acquire(&workspace).expect_err("conflict");
        let conflict = err.conflict().expect("conflict error");
        assert_eq!(conflict.relation, PathRelation::Same);
        assert_eq!(conflict.holder_pid, sleeper.id());

        assert!(held.release().expect("release"));
        let mine = locks.acquire(&workspace).expect("acquire after release");
        assert!(mine.release().expect("release"));

        let _ = sleeper.kill();
        let _ = sleeper.wait();
    }

    #[test]
    fn nested_paths_report_relationship() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("a");
        let locked = root.join("b");
        fs::create_dir_all(&locked).expect("mkdir");
        let locks = manager(&temp);
        let _handle = locks.acquire(&locked).expect("acquire");

        let err = locks.check_conflicts(&locked.join("c")).expect_err("child");
        assert_eq!(
            err.conflict().expect("conflict").relation,
            PathRelation::ParentLocked
        );

        let err = locks.check_conflicts(&root).expect_err("parent");
        assert_eq!(
            err.conflict().expect("conflict").relation,
            PathRelation::SubdirectoryLocked
        );

        locks
            .check_conflicts(&temp.path().join("a").join("b-other"))
            .expect("sibling with shared prefix is free");
    }

    #[test]
    fn concurrent_nested_acquires_never_both_succeed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(&temp);
        let mut sleeper = spawn_sleeper();
        let other = locks.clone().with_owner_pid(sleeper.id());

        for round in 0..100 {
            let parent = temp.path().join(format!("round-{round}"));
            let child = parent.join("nested");
            fs::create_dir_all(&child).expect("mkdir");
            let barrier = Arc::new(Barrier::new(2));

            let outer = {
                let barrier = Arc::clone(&barrier);
                let locks = locks.clone();
                thread::spawn(move || {
                    barrier.wait();
                    locks.acquire(&parent)
                })
            };
            let inner = {
                let barrier = Arc::clone(&barrier);
                let other = other.clone();
                thread::spawn(move || {
                    barrier.wait();
                    other.acquire(&child)
                })
            };
            let outer = outer.join().expect("outer thread");
            let inner = inner.join().expect("inner thread");

            if let Err(err) = &outer {
                assert!(err.conflict().is_some(), "round {round}: {err}");
            }
            if let Err(err) = &inner {
                assert!(err.conflict().is_some(), "round {round}: {err}");
            }
            assert!(
                outer.is_err() || inner.is_err(),
                "round {round}: overlapping locks both granted"
            );
            drop(outer);
            drop(inner);
            assert!(locks.list().expect("list").is_empty(), "round {round}");
        }

        let _ = sleeper.kill();
        let _ = sleeper.wait();
    }

    #[test]
    fn dead_owner_records_are_ignored_and_reaped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).expect("mkdir");
        let locks = manager(&temp);

        let ghost = locks.clone().with_owner_pid(dead_pid());
        let stale = ghost.acquire(&workspace).expect("stale acquire");
        std::mem::forget(stale);

        locks.check_conflicts(&workspace).expect("dead owner ignored");
        assert!(locks.list().expect("list").is_empty());

        let own_dir = temp.path().join("mine");
        fs::create_dir_all(&own_dir).expect("mkdir");
        let _mine = locks.acquire(&own_dir).expect("acquire own");

        let reaped = locks.reap_stale().expect("reap");
        assert!(reaped.is_empty(), "acquire already reaped the stale record");
        let live = locks.list().expect("list");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].pid, std::process::id());
    }

    #[test]
    fn reap_stale_keeps_live_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(&temp);
        let live_dir = temp.path().join("live");
        let dead_dir = temp.path().join("dead");
        fs::create_dir_all(&live_dir).expect("mkdir");
        fs::create_dir_all(&dead_dir).expect("mkdir");

        let _live = locks.acquire(&live_dir).expect("live");
        let dead = locks
            .clone()
            .with_owner_pid(dead_pid())
            .acquire(&dead_dir)
            .expect("dead");
        std::mem::forget(dead);

        let reaped = locks.reap_stale().expect("reap");
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].path, canonicalize_lenient(&dead_dir).expect("canon"));
        assert_eq!(locks.list().expect("list").len(), 1);
    }

    #[test]
    fn release_leaves_foreign_record_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).expect("mkdir");
        let locks = manager(&temp);

        let handle = locks.acquire(&workspace).expect("acquire");
        let record_file = locks.dir().join(record_name(handle.path()));
        let foreign = LockRecord {
            pid: handle.pid + 1,
            path: handle.path().to_path_buf(),
            acquired_at: "later".to_string(),
        };
        fs::write(&record_file, serde_json::to_string(&foreign).expect("json")).expect("write");

        assert!(!handle.release().expect("release"));
        assert!(record_file.exists());
    }

    #[test]
    fn missing_lock_dir_is_created_on_first_use() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = LockManager::new(temp.path().join("deep").join("locks"));
        assert!(locks.list().expect("list").is_empty());
        let _handle = locks.acquire(temp.path()).expect("acquire");
        assert!(locks.dir().is_dir());
    }

    #[test]
    fn drop_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = manager(&temp);
        {
            let _handle = locks.acquire(temp.path()).expect("acquire");
            assert_eq!(locks.list().expect("list").len(), 1);
        }
        assert!(locks.list().expect("list").is_empty());
    }

    #[test]
    fn canonicalize_tolerates_missing_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = fs::canonicalize(temp.path()).expect("canon");
        let resolved =
            canonicalize_lenient(&temp.path().join("x").join("..").join("y").join("z"))
                .expect("canon");
        assert_eq!(resolved, base.join("y").join("z"));
    }
}
