//! Bounded pool of background processes tracked by pid.

use std::collections::BTreeMap;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("background pool is full ({running}/{max_concurrent} running)")]
    PoolFull {
        running: usize,
        max_concurrent: usize,
    },
    #[error("spawn background job '{label}': {source}")]
    Spawn {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("wait for background job {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// A background job that has exited and is no longer tracked.
#[derive(Debug)]
pub struct Finished {
    pub pid: u32,
    pub label: String,
    pub status: ExitStatus,
}

struct Job {
    label: String,
    child: Child,
}

/// Launches processes up to a fixed ceiling; refuses beyond it.
pub struct BackgroundPool {
    max_concurrent: usize,
    jobs: BTreeMap<u32, Job>,
}

impl BackgroundPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            jobs: BTreeMap::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn running(&self) -> usize {
        self.jobs.len()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.jobs.keys().copied().collect()
    }

    /// Spawn `cmd` (stdin detached). Returns the child's pid.
    pub fn launch(&mut self, label: impl Into<String>, mut cmd: Command) -> Result<u32, PoolError> {
        let label = label.into();
        self.reap_finished()?;
        if self.jobs.len() >= self.max_concurrent {
            warn!(label = %label, running = self.jobs.len(), "background pool full");
            return Err(PoolError::PoolFull {
                running: self.jobs.len(),
                max_concurrent: self.max_concurrent,
            });
        }
        let child = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| PoolError::Spawn {
                label: label.clone(),
                source,
            })?;
        let pid = child.id();
        info!(pid, label = %label, "background job launched");
        self.jobs.insert(pid, Job { label, child });
        Ok(pid)
    }

    /// Block until every tracked job exits. Results are ordered by pid.
    ///
    /// On a wait error the failing job is dropped from tracking; jobs not yet
    /// waited on stay tracked so they can still be killed.
    pub fn wait_all(&mut self) -> Result<Vec<Finished>, PoolError> {
        let mut finished = Vec::with_capacity(self.jobs.len());
        while let Some(mut entry) = self.jobs.first_entry() {
            let pid = *entry.key();
            let waited = entry.get_mut().child.wait();
            let job = entry.remove();
            let status = waited.map_err(|source| PoolError::Wait { pid, source })?;
            debug!(pid, exit_code = ?status.code(), "background job finished");
            finished.push(Finished {
                pid,
                label: job.label,
                status,
            });
        }
        Ok(finished)
    }

    /// Block until the first tracked job exits. `None` when nothing is tracked.
    pub fn wait_any(&mut self) -> Result<Option<Finished>, PoolError> {
        if self.jobs.is_empty() {
            return Ok(None);
        }
        loop {
            if let Some(done) = self.poll_one()? {
                return Ok(Some(done));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kill every tracked job and stop tracking all of them. Jobs that have
    /// already exited are skipped. Returns how many were killed.
    pub fn kill_all(&mut self) -> usize {
        let mut killed = 0;
        for (pid, mut job) in std::mem::take(&mut self.jobs) {
            if matches!(job.child.try_wait(), Ok(Some(_))) {
                continue;
            }
            match job.child.kill() {
                Ok(()) => {
                    killed += 1;
                    let _ = job.child.wait();
                    info!(pid, label = %job.label, "background job killed");
                }
                Err(err) => debug!(pid, err = %err, "background job already gone"),
            }
        }
        killed
    }

    fn poll_one(&mut self) -> Result<Option<Finished>, PoolError> {
        let mut exited = None;
        for (pid, job) in &mut self.jobs {
            if let Some(status) = job
                .child
                .try_wait()
                .map_err(|source| PoolError::Wait { pid: *pid, source })?
            {
                exited = Some((*pid, status));
                break;
            }
        }
        let Some((pid, status)) = exited else {
            return Ok(None);
        };
        let Some(job) = self.jobs.remove(&pid) else {
            return Ok(None);
        };
        debug!(pid, exit_code = ?status.code(), "background job finished");
        Ok(Some(Finished {
            pid,
            label: job.label,
            status,
        }))
    }

    fn reap_finished(&mut self) -> Result<(), PoolError> {
        while self.poll_one()?.is_some() {}
        Ok(())
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        let killed = self.kill_all();
        if killed > 0 {
            warn!(killed, "background jobs killed on drop");
        }
    }
}
