//! Combined hook executor: in-process callbacks, then the file-based script.

use std::fmt;

use anyhow::Result;
use tracing::warn;

use crate::callbacks::{CallbackRegistry, CallbackReport};
use crate::core::types::{CallbackContext, ExitClass, HookPoint};
use crate::io::hooks::{HookDirs, HookRun, run_hook};

/// Everything that ran for one lifecycle point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub point: HookPoint,
    pub callbacks: CallbackReport,
    pub script: HookRun,
}

impl HookOutcome {
    /// Worst class across callbacks and the script. A failed callback is a
    /// hard failure.
    pub fn class(&self) -> ExitClass {
        let callbacks = if self.callbacks.succeeded() {
            ExitClass::Success
        } else {
            ExitClass::Failure
        };
        callbacks.max(self.script.class())
    }

    /// Raw script exit code, when a script ran.
    pub fn code(&self) -> Option<i32> {
        match &self.script {
            HookRun::Ran { code, .. } => *code,
            HookRun::Missing => None,
        }
    }
}

impl fmt::Display for HookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hooks", self.point)?;
        if let Some(failure) = self.script.failure(self.point) {
            write!(f, ": {failure}")?;
        }
        for failed in &self.callbacks.failures {
            write!(f, "; callback '{}' failed: {}", failed.name, failed.message)?;
        }
        Ok(())
    }
}

/// Runs both extension mechanisms for a point with one exit-code contract.
#[derive(Debug)]
pub struct HookExecutor {
    registry: CallbackRegistry,
    dirs: HookDirs,
}

impl HookExecutor {
    pub fn new(registry: CallbackRegistry, dirs: HookDirs) -> Self {
        Self { registry, dirs }
    }

    /// Scripts only, no in-process callbacks.
    pub fn scripts(dirs: HookDirs) -> Self {
        Self::new(CallbackRegistry::new(), dirs)
    }

    pub fn registry_mut(&mut self) -> &mut CallbackRegistry {
        &mut self.registry
    }

    pub fn dirs(&self) -> &HookDirs {
        &self.dirs
    }

    /// Run callbacks in registration order, then the resolved script.
    /// Blocks until the script exits.
    pub fn run(&self, point: HookPoint, ctx: &CallbackContext) -> Result<HookOutcome> {
        let ctx = ctx.at(point);
        let callbacks = self.registry.execute(point, &ctx);
        let script = run_hook(&self.dirs, &ctx)?;
        let outcome = HookOutcome {
            point,
            callbacks,
            script,
        };
        if outcome.class() != ExitClass::Success {
            warn!(%point, class = ?outcome.class(), code = ?outcome.code(), "hooks did not succeed");
        }
        Ok(outcome)
    }
}
