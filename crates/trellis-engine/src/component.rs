//! The unit of work driven by the [`Composite`](crate::Composite) scheduler

use async_trait::async_trait;
use trellis_common::Error;

/// A named unit of work with declared dependencies
///
/// `reconcile` and `delete` return `Ok(true)` when another round is needed
/// and `Ok(false)` once the component has reached its target state. Both
/// must be idempotent: a component may be invoked again after it already
/// converged. Errors are classified with [`Error::is_critical`].
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique name within a scheduler
    fn name(&self) -> &str;

    /// Names of the components that must finish before this one runs
    fn dependencies(&self) -> &[String];

    /// Drive the component toward its desired state
    async fn reconcile(&self) -> Result<bool, Error>;

    /// Drive the component toward removal
    async fn delete(&self) -> Result<bool, Error>;
}
