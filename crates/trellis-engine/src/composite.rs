//! Round-based scheduler for a named set of dependent components
//!
//! A round computes the set of components that are ready to run, runs each
//! of them once in name order, and reports whether anything is left. The
//! scheduler never loops on its own: the caller requeues and the next
//! round picks up where this one stopped. Because a component only becomes
//! ready once everything it depends on has finished, nothing in one round's
//! ready set depends on anything else in it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, warn};
use trellis_common::Error;

use crate::component::Component;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Create,
    Delete,
}

/// Drives registered [`Component`]s in dependency order
pub struct Composite {
    name: String,
    components: BTreeMap<String, Box<dyn Component>>,
    finished: BTreeSet<String>,
}

impl Composite {
    /// An empty scheduler; `name` is only used for logging
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: BTreeMap::new(),
            finished: BTreeSet::new(),
        }
    }

    /// Add a component
    ///
    /// # Errors
    /// [`Error::Wiring`] if a component with the same name is registered.
    pub fn register(&mut self, component: Box<dyn Component>) -> Result<(), Error> {
        let name = component.name().to_string();
        if self.components.contains_key(&name) {
            return Err(Error::wiring(format!(
                "component {} registered twice in {}",
                name, self.name
            )));
        }
        self.components.insert(name, component);
        Ok(())
    }

    /// Names of the components that reached their target this invocation
    pub fn finished(&self) -> &BTreeSet<String> {
        &self.finished
    }

    /// True once `name` reached its target
    pub fn is_finished(&self, name: &str) -> bool {
        self.finished.contains(name)
    }

    /// Record a component as already done, e.g. from persisted status
    pub fn mark_finished(&mut self, name: impl Into<String>) {
        self.finished.insert(name.into());
    }

    /// Run one round toward the desired state
    ///
    /// `Ok(true)` asks for another round, `Ok(false)` means every component
    /// finished. A deadlock or a critical component error is returned as a
    /// critical error; recoverable component errors are gathered into one
    /// retryable error after the whole round ran.
    pub async fn reconcile(&mut self) -> Result<bool, Error> {
        self.round(Direction::Create).await
    }

    /// Run one round toward removal, dependents before dependencies
    pub async fn delete(&mut self) -> Result<bool, Error> {
        self.round(Direction::Delete).await
    }

    fn ready_to_run(&self, name: &str, direction: Direction) -> bool {
        if self.finished.contains(name) {
            return false;
        }
        match direction {
            Direction::Create => self
                .components
                .get(name)
                .is_some_and(|c| c.dependencies().iter().all(|d| self.finished.contains(d))),
            Direction::Delete => !self.components.iter().any(|(other, c)| {
                other != name
                    && !self.finished.contains(other)
                    && c.dependencies().iter().any(|d| d == name)
            }),
        }
    }

    fn unfinished(&self) -> Vec<String> {
        self.components
            .keys()
            .filter(|n| !self.finished.contains(*n))
            .cloned()
            .collect()
    }

    async fn round(&mut self, direction: Direction) -> Result<bool, Error> {
        let ready: Vec<String> = self
            .components
            .keys()
            .filter(|n| self.ready_to_run(n, direction))
            .cloned()
            .collect();

        let mut ran = 0usize;
        let mut recoverable = Vec::new();
        let mut critical: Option<Error> = None;

        for name in ready {
            let Some(component) = self.components.get(&name) else {
                continue;
            };
            ran += 1;
            let result = match direction {
                Direction::Create => component.reconcile().await,
                Direction::Delete => component.delete().await,
            };
            match result {
                Ok(false) => {
                    debug!(composite = %self.name, component = %name, ?direction, "component finished");
                    self.finished.insert(name);
                }
                Ok(true) => {
                    debug!(composite = %self.name, component = %name, ?direction, "component needs another round");
                }
                Err(e) if e.is_critical() => {
                    error!(composite = %self.name, component = %name, error = %e, "critical component error");
                    // siblings already in the ready set are independent of this one
                    critical.get_or_insert(e);
                }
                Err(e) => {
                    warn!(composite = %self.name, component = %name, error = %e, "component error, will retry");
                    recoverable.push(e);
                }
            }
        }

        if let Some(e) = critical {
            return Err(e);
        }

        let unfinished = self.unfinished();
        if unfinished.is_empty() {
            return Ok(false);
        }
        if ran == 0 {
            return Err(Error::Deadlock {
                components: unfinished,
            });
        }
        match Error::aggregate(recoverable) {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}
