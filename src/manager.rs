//! Registry of manage loops, one per pool.
//!
//! The embedding controller calls [`RunnerPoolManager::start_or_update`] when
//! it reconciles a pool resource and [`RunnerPoolManager::stop`] when the
//! resource goes away. The manager owns the loops; collaborators shared by
//! every pool (cluster client, status client, metrics) are injected once at
//! construction, while each pool gets its own registry client built from its
//! credentials.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::{ManagerOptions, PoolConfig, PoolIdentity, RegistryCredentials};
use crate::manage_loop::ManageLoop;
use crate::metrics::Metrics;
use crate::notify::{HttpNotifier, Notifier};
use crate::pods::{KubePodClient, PodClient};
use crate::registry::{GithubRegistryFactory, RegistryFactory};
use crate::status::{HttpStatusClient, PodStatusClient};

pub struct RunnerPoolManager {
    pod_client: Arc<dyn PodClient>,
    status_client: Arc<dyn PodStatusClient>,
    registry_factory: Arc<dyn RegistryFactory>,
    metrics: Arc<Metrics>,
    tick_interval: Duration,
    loops: Mutex<Loops>,
}

/// The loop registry and the stopped flag share one lock, so a loop can never
/// be added to a manager that is shutting down.
struct Loops {
    by_pool: HashMap<PoolIdentity, Arc<ManageLoop>>,
    stopped: bool,
}

impl RunnerPoolManager {
    pub fn new(
        pod_client: Arc<dyn PodClient>,
        status_client: Arc<dyn PodStatusClient>,
        registry_factory: Arc<dyn RegistryFactory>,
        metrics: Arc<Metrics>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            pod_client,
            status_client,
            registry_factory,
            metrics,
            tick_interval,
            loops: Mutex::new(Loops {
                by_pool: HashMap::new(),
                stopped: false,
            }),
        }
    }

    /// Wire a manager with the production collaborators.
    pub fn from_options(
        options: &ManagerOptions,
        kube_client: kube::Client,
        prometheus: &prometheus::Registry,
    ) -> Result<Self> {
        let registry_factory: Arc<dyn RegistryFactory> = match &options.registry_api_base {
            Some(base) => Arc::new(GithubRegistryFactory::with_api_base(base)),
            None => Arc::new(GithubRegistryFactory::new()),
        };
        Ok(Self::new(
            Arc::new(KubePodClient::new(kube_client)),
            Arc::new(HttpStatusClient::new(options.runner_port)?),
            registry_factory,
            Arc::new(Metrics::new(prometheus)?),
            options.tick_interval(),
        ))
    }

    /// Start managing a pool, or apply a configuration update to its running
    /// loop.
    ///
    /// The first call for a pool builds its registry client and notifier and
    /// launches the manage loop; construction failures are returned and the
    /// pool is not started. Later calls only swap the configuration; the loop
    /// keeps its tick cadence.
    pub async fn start_or_update(
        &self,
        pool: PoolIdentity,
        config: PoolConfig,
        credentials: &RegistryCredentials,
    ) -> Result<()> {
        let mut loops = self.loops.lock().await;
        if loops.stopped {
            bail!("Runner pool manager is already stopped");
        }

        if let Some(existing) = loops.by_pool.get(&pool) {
            existing.update(config).await;
            return Ok(());
        }

        let registry = self
            .registry_factory
            .create(credentials)
            .with_context(|| format!("Failed to create a registry client for pool {pool}"))?;
        let notifier: Arc<dyn Notifier> = Arc::new(
            HttpNotifier::new(config.notification_address.as_deref())
                .with_context(|| format!("Failed to create a notifier for pool {pool}"))?,
        );

        let manage_loop = Arc::new(ManageLoop::new(
            pool.clone(),
            config,
            self.tick_interval,
            registry,
            Arc::clone(&self.status_client),
            Arc::clone(&self.pod_client),
            notifier,
            Arc::clone(&self.metrics),
        ));
        Arc::clone(&manage_loop).start().await;
        loops.by_pool.insert(pool, manage_loop);
        Ok(())
    }

    /// Stop managing a pool and tear it down. Unknown pools are a no-op, so
    /// the call is idempotent.
    ///
    /// The loop is forgotten even when remote cleanup fails, so a retry never
    /// finds a half-stopped loop; the error still comes back because orphaned
    /// remote runners need the caller's attention.
    pub async fn stop(&self, pool: &PoolIdentity) -> Result<()> {
        let mut loops = self.loops.lock().await;
        let Some(manage_loop) = loops.by_pool.remove(pool) else {
            return Ok(());
        };
        info!("Stopping management of pool {pool}");
        manage_loop.stop().await
    }

    /// Tear down every managed pool, best-effort, and refuse new pools from
    /// here on. For the embedder's shutdown path.
    pub async fn stop_all(&self) {
        let mut loops = self.loops.lock().await;
        loops.stopped = true;
        for (pool, manage_loop) in loops.by_pool.drain() {
            if let Err(error) = manage_loop.stop().await {
                error!("Failed to tear down pool {pool}: {error:#}");
            }
        }
    }
}
