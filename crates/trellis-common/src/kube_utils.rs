//! Kubernetes helpers shared by the operator and controllers
//!
//! The only blocking wait in Trellis is [`poll_until`]: everything else
//! yields back to the work queue with a requeue. `poll_until` is bounded by
//! a deadline and honours a cancellation token so shutdown never has to
//! wait for a stuck poll.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Poll until a condition is met, the timeout expires, or `cancel` fires
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Errors from `check_fn` are treated as transient and polled through.
///
/// # Errors
/// [`Error::Timeout`] when the deadline passes, [`Error::Cancelled`] when
/// the token is cancelled first.
pub async fn poll_until<F, Fut>(
    operation: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation, "condition not yet met"),
            Err(e) => trace!(operation, error = %e, "poll check failed, retrying"),
        }

        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(Error::Timeout {
                operation: operation.to_string(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    operation: operation.to_string(),
                });
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Wait until the named CRD reports `Established=True`
pub async fn wait_for_crd(
    client: &Client,
    crd_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let operation = format!("CRD {} to be established", crd_name);

    poll_until(&operation, timeout, Duration::from_secs(2), cancel, || {
        let crds = crds.clone();
        async move {
            let crd = crds.get_opt(crd_name).await?;
            Ok(crd
                .and_then(|c| c.status)
                .and_then(|s| s.conditions)
                .is_some_and(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Established" && c.status == "True")
                }))
        }
    })
    .await
}

/// Create a kube client from the ambient configuration with bounded timeouts
pub async fn create_client(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = kube::Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
