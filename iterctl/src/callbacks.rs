//! In-process callback registry.
//!
//! Handlers are typed closures bound to a lifecycle point under a unique name.
//! A registry is an ordinary value owned by its orchestrator, so independent
//! loops in one process never see each other's handlers.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{CallbackContext, HookPoint};

pub type Handler = Box<dyn Fn(&CallbackContext) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("callback name must not be empty")]
    EmptyName,
    #[error("callback '{name}' is already registered for {point}")]
    Duplicate { point: HookPoint, name: String },
    #[error("no callback named '{name}' is registered for {point}")]
    Unknown { point: HookPoint, name: String },
}

struct Registration {
    name: String,
    handler: Handler,
}

/// Named handlers per lifecycle point, kept in registration order.
#[derive(Default)]
pub struct CallbackRegistry {
    points: BTreeMap<HookPoint, Vec<Registration>>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (point, regs) in &self.points {
            let names: Vec<&str> = regs.iter().map(|r| r.name.as_str()).collect();
            map.entry(point, &names);
        }
        map.finish()
    }
}

/// Failure of one handler during [`CallbackRegistry::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure {
    pub name: String,
    pub message: String,
}

/// Outcome of running every handler for one point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackReport {
    pub point: HookPoint,
    pub ran: Vec<String>,
    pub failures: Vec<CallbackFailure>,
}

impl CallbackReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        point: HookPoint,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), CallbackError>
    where
        F: Fn(&CallbackContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CallbackError::EmptyName);
        }
        let regs = self.points.entry(point).or_default();
        if regs.iter().any(|reg| reg.name == name) {
            return Err(CallbackError::Duplicate { point, name });
        }
        debug!(%point, name = %name, "callback registered");
        regs.push(Registration {
            name,
            handler: Box::new(handler),
        });
        Ok(())
    }

    pub fn remove(&mut self, point: HookPoint, name: &str) -> Result<(), CallbackError> {
        let unknown = || CallbackError::Unknown {
            point,
            name: name.to_string(),
        };
        let regs = self.points.get_mut(&point).ok_or_else(unknown)?;
        let index = regs
            .iter()
            .position(|reg| reg.name == name)
            .ok_or_else(unknown)?;
        regs.remove(index);
        if regs.is_empty() {
            self.points.remove(&point);
        }
        Ok(())
    }

    /// Names registered for `point`, in execution order.
    pub fn names(&self, point: HookPoint) -> Vec<&str> {
        self.points
            .get(&point)
            .map(|regs| regs.iter().map(|reg| reg.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Run every handler for `point` in order, continuing past failures.
    ///
    /// Each handler sees `ctx` with `hook_point` set to `point`.
    pub fn execute(&self, point: HookPoint, ctx: &CallbackContext) -> CallbackReport {
        let ctx = ctx.at(point);
        let mut report = CallbackReport {
            point,
            ran: Vec::new(),
            failures: Vec::new(),
        };
        for reg in self.points.get(&point).into_iter().flatten() {
            report.ran.push(reg.name.clone());
            if let Err(err) = (reg.handler)(&ctx) {
                let message = format!("{err:#}");
                warn!(%point, name = %reg.name, err = %message, "callback failed");
                report.failures.push(CallbackFailure {
                    name: reg.name.clone(),
                    message,
                });
            }
        }
        report
    }
}
