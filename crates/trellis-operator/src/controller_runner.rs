//! Controller runner - builds controller futures from an explicit registry
//!
//! Each registered builder returns a boxed future that runs one controller
//! until the shutdown token fires. Construction is kept separate from
//! execution so `main` decides how the futures are driven.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use tokio_util::sync::CancellationToken;

use trellis_cluster::controller::{error_policy, reconcile, Context};
use trellis_common::crd::{ClusterNetwork, ControlPlane, ManagedCluster, NodePool};
use trellis_common::Error;

use crate::config::OperatorConfig;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builds one controller from the shared client, config and shutdown token
pub type ControllerBuilder = fn(Client, &OperatorConfig, CancellationToken) -> ControllerFuture;

/// Named controller builders, run in registration order
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Vec<(&'static str, ControllerBuilder)>,
}

impl ControllerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every controller Trellis ships
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .controllers
            .push(("cluster", build_cluster_controller as ControllerBuilder));
        registry
    }

    /// Register a controller; names must be unique
    pub fn register(
        &mut self,
        name: &'static str,
        builder: ControllerBuilder,
    ) -> Result<(), Error> {
        if self.controllers.iter().any(|(n, _)| *n == name) {
            return Err(Error::wiring(format!("controller {} is already registered", name)));
        }
        self.controllers.push((name, builder));
        Ok(())
    }

    /// Registered controller names in run order
    pub fn names(&self) -> Vec<&'static str> {
        self.controllers.iter().map(|(n, _)| *n).collect()
    }

    /// Build every registered controller
    pub fn build_all(
        &self,
        client: Client,
        config: &OperatorConfig,
        shutdown: &CancellationToken,
    ) -> Vec<ControllerFuture> {
        self.controllers
            .iter()
            .map(|(name, build)| {
                tracing::info!(controller = %name, "starting controller");
                build(client.clone(), config, shutdown.clone())
            })
            .collect()
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Stream that yields once per `period`, starting one period from now
fn resync_ticks(period: Duration) -> impl futures::Stream<Item = ()> + Send + Sync + 'static {
    futures::stream::unfold((), move |()| async move {
        tokio::time::sleep(period).await;
        Some(((), ()))
    })
}

/// Build the ManagedCluster controller
///
/// Child kinds are owned so a status change on a network, control plane or
/// node pool wakes the parent without waiting for the resync.
pub fn build_cluster_controller(
    client: Client,
    config: &OperatorConfig,
    shutdown: CancellationToken,
) -> ControllerFuture {
    let ns = config.namespace.as_deref();
    let clusters: Api<ManagedCluster> = scoped_api(&client, ns);
    let networks: Api<ClusterNetwork> = scoped_api(&client, ns);
    let control_planes: Api<ControlPlane> = scoped_api(&client, ns);
    let node_pools: Api<NodePool> = scoped_api(&client, ns);

    let ctx = Arc::new(Context::new(client));
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    Box::pin(
        Controller::new(clusters, watcher())
            .owns(networks, watcher())
            .owns(control_planes, watcher())
            .owns(node_pools, watcher())
            .with_config(ControllerConfig::default().concurrency(config.workers))
            .reconcile_all_on(resync_ticks(config.resync))
            .graceful_shutdown_on(shutdown.cancelled_owned())
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Cluster")),
    )
}

/// Cancel `token` on SIGTERM or ctrl-c
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received, draining controllers");
        token.cancel();
    });
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
