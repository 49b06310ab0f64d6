//! Per-pool manage loop.
//!
//! One `ManageLoop` runs per managed pool. On a fixed interval it fetches the
//! pool's pods and the remote registry's runners, then reconciles the two
//! views: broken or expired pods are deleted, pods with a live job are taken
//! out of steady-state control, finished jobs are notified once, and runners
//! the registry remembers without a backing pod are deregistered.
//!
//! Ticks never overlap. A failure on a single pod or runner is logged and the
//! rest of the tick proceeds; the next tick retries whatever is still wrong.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{POD_TEMPLATE_HASH_LABEL, PoolConfig, PoolIdentity};
use crate::metrics::Metrics;
use crate::notify::{Notifier, ResultNotification};
use crate::pods::{PodClient, RunnerPod, pool_selector};
use crate::registry::{RemoteRunner, RunnerRegistry};
use crate::status::{JobResult, PodStatusClient, RunnerState, RunnerStatus};

/// Bound on the remote-runner cleanup during teardown, so a hung registry
/// cannot wedge the caller's shutdown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the background tick task.
enum LoopState {
    Created,
    Running(LoopTask),
    Stopping,
    Stopped,
}

struct LoopTask {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// State carried from tick to tick.
///
/// `last_check_time` is the watermark deciding whether a finished job is
/// news; `prev_runner_names` is the set of runners whose metric series exist.
/// Whoever runs a tick holds this lock for the whole tick, so ticks never
/// interleave.
struct TickState {
    last_check_time: DateTime<Utc>,
    prev_runner_names: Vec<String>,
}

/// A single pool's reconciliation loop.
///
/// Created and owned by the manager; at most one exists per pool. `start`
/// launches the background task, `update` swaps the configuration under a
/// running loop, and `stop` cancels the task and tears the pool down.
pub struct ManageLoop {
    pool: PoolIdentity,
    tick_interval: Duration,
    registry: Arc<dyn RunnerRegistry>,
    status_client: Arc<dyn PodStatusClient>,
    pod_client: Arc<dyn PodClient>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<Metrics>,

    /// Written by the manager on config updates, read once per tick.
    config: Mutex<PoolConfig>,
    state: Mutex<LoopState>,
    tick: Mutex<TickState>,
}

impl ManageLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PoolIdentity,
        config: PoolConfig,
        tick_interval: Duration,
        registry: Arc<dyn RunnerRegistry>,
        status_client: Arc<dyn PodStatusClient>,
        pod_client: Arc<dyn PodClient>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            tick_interval,
            registry,
            status_client,
            pod_client,
            notifier,
            metrics,
            config: Mutex::new(config),
            state: Mutex::new(LoopState::Created),
            tick: Mutex::new(TickState {
                last_check_time: Utc::now(),
                prev_runner_names: Vec::new(),
            }),
        }
    }

    /// Launch the background tick task.
    pub async fn start(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if !matches!(*state, LoopState::Created) {
            error!("Manage loop for pool {} cannot start twice", self.pool);
            return;
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(&self).run(cancel_rx));
        *state = LoopState::Running(LoopTask {
            cancel: cancel_tx,
            handle,
        });
    }

    async fn run(self: Arc<Self>, mut cancel: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        // An overlong tick delays the next one instead of bursting.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Started manage loop for pool {}", self.pool);
        loop {
            tokio::select! {
                _ = &mut cancel => {
                    info!("Stopping manage loop for pool {}", self.pool);
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.run_once().await {
                        error!("Reconciliation tick failed for pool {}: {error:#}", self.pool);
                    }
                }
            }
        }
    }

    /// Apply a configuration update without interrupting the running cycle.
    ///
    /// Takes effect on the next tick. A failure to re-point the notifier is
    /// logged and the previous address stays in effect.
    pub async fn update(&self, new: PoolConfig) {
        let (address_changed, new_address) = {
            let mut config = self.config.lock().await;
            let changed = new.notification_address != config.notification_address;
            let address = new.notification_address.clone();
            *config = new;
            (changed, address)
        };

        if address_changed && let Some(address) = new_address {
            if let Err(error) = self.notifier.update_server_url(&address).await {
                warn!(
                    "Failed to re-point the notifier for pool {}: {error:#}",
                    self.pool
                );
            }
        }
    }

    /// Stop the tick task and tear the pool down.
    ///
    /// Waits for the task to exit before any cleanup, so no tick races with
    /// teardown. Then drops the pool's metric series and removes every remote
    /// runner still labeled for the pool, whatever its online or busy state.
    /// Cleanup errors are returned so orphaned runners get the caller's
    /// attention; the task is stopped and the series are gone regardless.
    pub async fn stop(&self) -> Result<()> {
        let task = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, LoopState::Stopping) {
                LoopState::Running(task) => Some(task),
                LoopState::Created | LoopState::Stopped => None,
                LoopState::Stopping => {
                    error!("Manage loop for pool {} is already stopping", self.pool);
                    None
                }
            }
        };

        if let Some(task) = task {
            // The task observes cancellation at its next timer wait, never
            // mid-tick.
            let _ = task.cancel.send(());
            if let Err(error) = task.handle.await {
                error!(
                    "Manage loop task for pool {} did not exit cleanly: {error}",
                    self.pool
                );
            }
        }
        *self.state.lock().await = LoopState::Stopped;

        self.delete_metric_series().await;
        self.delete_all_runners().await
    }

    /// Execute one reconciliation cycle.
    ///
    /// The background task calls this on every tick; it can also be driven by
    /// hand, in which case it serializes against the background ticks.
    pub async fn run_once(&self) -> Result<()> {
        let mut tick = self.tick.lock().await;
        let config = self.config.lock().await.clone();

        let pods = self.fetch_runner_pods().await?;
        let runners = self.fetch_runners(&config).await?;

        self.update_metrics(&mut tick, &config, &runners);
        self.maintain_runner_pods(&mut tick, &config, &pods, &runners)
            .await;
        self.delete_offline_runners(&config, &pods, &runners).await;
        Ok(())
    }

    async fn fetch_runner_pods(&self) -> Result<Vec<RunnerPod>> {
        self.pod_client
            .list_pods(&self.pool.namespace, &pool_selector(&self.pool.name))
            .await
            .context("Failed to list runner pods")
    }

    async fn fetch_runners(&self, config: &PoolConfig) -> Result<Vec<RemoteRunner>> {
        self.registry
            .list_runners(&config.repository, &[self.pool.to_string()])
            .await
            .context("Failed to list remote runners")
    }

    fn update_metrics(&self, tick: &mut TickState, config: &PoolConfig, runners: &[RemoteRunner]) {
        let pool = self.pool.to_string();
        self.metrics.set_pool_replicas(&pool, config.replicas);

        let current: Vec<String> = runners.iter().map(|runner| runner.name.clone()).collect();
        for runner in runners {
            self.metrics
                .set_runner(&pool, &runner.name, runner.online, runner.busy);
        }
        // The registry garbage-collects offline runners on its own schedule;
        // series for runners it forgot have to be dropped by hand or they
        // report stale values forever.
        for name in removed_runner_names(&tick.prev_runner_names, &current) {
            self.metrics.delete_runner(&pool, &name);
        }
        tick.prev_runner_names = current;
    }

    /// Reconcile each pod against its own status report and the registry's
    /// view of its runner.
    async fn maintain_runner_pods(
        &self,
        tick: &mut TickState,
        config: &PoolConfig,
        pods: &[RunnerPod],
        runners: &[RemoteRunner],
    ) {
        let now = Utc::now();
        // Advance the watermark first; a failure later in the tick must not
        // buy an already-seen job a second notification.
        let last_check_time = std::mem::replace(&mut tick.last_check_time, now);

        // Pods already unlinked from steady-state control still count against
        // the pod ceiling.
        let already_unlinked = pods
            .iter()
            .filter(|pod| !pod.has_label(POD_TEMPLATE_HASH_LABEL))
            .count() as i32;
        let mut removable_pods =
            (config.max_runner_pods - config.replicas - already_unlinked).max(0);

        for pod in pods {
            let pod_name = pod.namespaced_name();

            if !pod.is_running() {
                debug!("Skipping pod {pod_name} in phase {}", pod.phase);
                continue;
            }
            let Some(ip) = pod.ip.as_deref() else {
                warn!("Pod {pod_name} is running but has no IP, skipped");
                continue;
            };

            // Never guess a pod's state: no status report, no action.
            let status = match self.status_client.get_status(ip).await {
                Ok(status) => status,
                Err(error) => {
                    warn!("Failed to get status of pod {pod_name}, skipped this tick: {error:#}");
                    continue;
                }
            };

            match status.state {
                RunnerState::Stale => {
                    // The pod gave up on itself; nothing else matters.
                    self.delete_pod(pod, "stale").await;
                    continue;
                }
                RunnerState::Debugging => {
                    let finished_since_last_tick = status
                        .finished_at
                        .is_some_and(|finished| finished > last_check_time);
                    if finished_since_last_tick && config.notification_address.is_some() {
                        self.notify_job_result(pod, &status, config).await;
                    }

                    // A debugging pod without a deletion time requested no
                    // debugging window at all.
                    if status.deletion_time.is_none_or(|deletion| now >= deletion) {
                        self.delete_pod(pod, "debugging window over").await;
                        continue;
                    }
                    // Still in its window: eligible for unlinking below, like
                    // any busy pod.
                }
                RunnerState::Initializing | RunnerState::Running => {
                    let age = now.signed_duration_since(pod.created_at);
                    if age > config.recreate_deadline && !runner_busy(runners, &pod.name) {
                        self.delete_pod(pod, "recreate deadline exceeded").await;
                        continue;
                    }
                }
            }

            // A pod with a live job, or one still in its debugging window,
            // must not be recycled by the steady-state controller; dropping
            // the revision label takes it out of the replica count. The
            // budget caps how many pods may live outside that count, so the
            // pool cannot outgrow max_runner_pods.
            if runner_busy(runners, &pod.name) || status.state == RunnerState::Debugging {
                if removable_pods <= 0 || !pod.has_label(POD_TEMPLATE_HASH_LABEL) {
                    continue;
                }
                match self
                    .pod_client
                    .remove_pod_label(&pod.namespace, &pod.name, POD_TEMPLATE_HASH_LABEL)
                    .await
                {
                    Ok(()) => {
                        removable_pods -= 1;
                        info!("Unlinked pod {pod_name} from steady-state control");
                    }
                    Err(error) => error!("Failed to unlink pod {pod_name}: {error:#}"),
                }
            }
        }
    }

    async fn notify_job_result(&self, pod: &RunnerPod, status: &RunnerStatus, config: &PoolConfig) {
        let notification = ResultNotification {
            channel: status
                .channel
                .clone()
                .filter(|channel| !channel.is_empty())
                .unwrap_or_else(|| config.notification_channel.clone()),
            result: status.result.unwrap_or(JobResult::Unknown),
            extend: status.extend.unwrap_or(false),
            namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            job_info: status.job_info.clone(),
        };
        match self.notifier.post_result(&notification).await {
            Ok(()) => info!(
                "Sent job result notification for pod {}",
                pod.namespaced_name()
            ),
            Err(error) => error!(
                "Failed to send job result notification for pod {}: {error:#}",
                pod.namespaced_name()
            ),
        }
    }

    /// Deregister runners the registry still remembers although their pod is
    /// gone. Online runners are left alone even without a pod; they may be
    /// registering right now.
    async fn delete_offline_runners(
        &self,
        config: &PoolConfig,
        pods: &[RunnerPod],
        runners: &[RemoteRunner],
    ) {
        for runner in runners {
            if runner.online || pods.iter().any(|pod| pod.name == runner.name) {
                continue;
            }
            match self
                .registry
                .remove_runner(&config.repository, runner.id)
                .await
            {
                Ok(()) => info!("Removed offline runner {} (id {})", runner.name, runner.id),
                Err(error) => error!(
                    "Failed to remove offline runner {} (id {}): {error:#}",
                    runner.name, runner.id
                ),
            }
        }
    }

    async fn delete_pod(&self, pod: &RunnerPod, reason: &str) {
        match self
            .pod_client
            .delete_pod(&pod.namespace, &pod.name)
            .await
        {
            Ok(()) => info!("Deleted pod {} ({reason})", pod.namespaced_name()),
            Err(error) => error!(
                "Failed to delete pod {} ({reason}): {error:#}",
                pod.namespaced_name()
            ),
        }
    }

    /// Drop every metric series of this pool. The per-runner series are
    /// exactly those recorded in the tick state.
    async fn delete_metric_series(&self) {
        let pool = self.pool.to_string();
        self.metrics.delete_pool(&pool);
        let mut tick = self.tick.lock().await;
        for name in tick.prev_runner_names.drain(..) {
            self.metrics.delete_runner(&pool, &name);
        }
    }

    /// Remove every remote runner still labeled for this pool, bounded by
    /// [`TEARDOWN_TIMEOUT`].
    async fn delete_all_runners(&self) -> Result<()> {
        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.remove_pool_runners()).await {
            Ok(result) => result,
            Err(_) => bail!("Timed out removing the remote runners of pool {}", self.pool),
        }
    }

    async fn remove_pool_runners(&self) -> Result<()> {
        let repository = self.config.lock().await.repository.clone();
        let runners = self
            .registry
            .list_runners(&repository, &[self.pool.to_string()])
            .await
            .context("Failed to list remote runners for teardown")?;
        for runner in &runners {
            self.registry
                .remove_runner(&repository, runner.id)
                .await
                .with_context(|| {
                    format!("Failed to remove runner {} (id {})", runner.name, runner.id)
                })?;
            info!(
                "Removed runner {} (id {}) during teardown of pool {}",
                runner.name, runner.id, self.pool
            );
        }
        Ok(())
    }
}

/// True if the registry lists a busy runner under this name.
fn runner_busy(runners: &[RemoteRunner], name: &str) -> bool {
    runners
        .iter()
        .find(|runner| runner.name == name)
        .is_some_and(|runner| runner.busy)
}

/// Names present in `prev` but gone from `current`.
fn removed_runner_names(prev: &[String], current: &[String]) -> Vec<String> {
    prev.iter()
        .filter(|name| !current.contains(name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::notify::MockNotifier;
    use crate::pods::{MockPodClient, pool_labels};
    use crate::registry::MockRegistry;
    use crate::status::MockStatusClient;
    use prometheus::{Encoder, TextEncoder};

    const REPO: &str = "acme/widgets";
    const NS: &str = "ci";
    const POOL: &str = "pool-a";

    struct Harness {
        manage_loop: Arc<ManageLoop>,
        registry: Arc<MockRegistry>,
        statuses: Arc<MockStatusClient>,
        pods: Arc<MockPodClient>,
        notifier: Arc<MockNotifier>,
        prometheus: prometheus::Registry,
    }

    impl Harness {
        fn exposition(&self) -> String {
            let mut buffer = Vec::new();
            TextEncoder::new()
                .encode(&self.prometheus.gather(), &mut buffer)
                .unwrap();
            String::from_utf8(buffer).unwrap()
        }

        /// Pretend the previous tick happened an hour ago, so statuses seeded
        /// "now" count as news.
        async fn backdate_watermark(&self) {
            self.manage_loop.tick.lock().await.last_check_time =
                Utc::now() - chrono::Duration::hours(1);
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            repository: REPO.into(),
            replicas: 1,
            max_runner_pods: 2,
            notification_channel: "#ci".into(),
            notification_address: Some("http://notifier:8080".into()),
            recreate_deadline: chrono::Duration::hours(24),
        }
    }

    fn harness(config: PoolConfig) -> Harness {
        let registry = Arc::new(MockRegistry::new());
        let statuses = Arc::new(MockStatusClient::new());
        let pods = Arc::new(MockPodClient::new());
        let notifier = Arc::new(MockNotifier::new());
        let prometheus = prometheus::Registry::new();
        let metrics = Arc::new(Metrics::new(&prometheus).unwrap());
        let manage_loop = Arc::new(ManageLoop::new(
            PoolIdentity::new(NS, POOL),
            config,
            Duration::from_secs(60),
            Arc::clone(&registry) as Arc<dyn RunnerRegistry>,
            Arc::clone(&statuses) as Arc<dyn PodStatusClient>,
            Arc::clone(&pods) as Arc<dyn PodClient>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            metrics,
        ));
        Harness {
            manage_loop,
            registry,
            statuses,
            pods,
            notifier,
            prometheus,
        }
    }

    fn runner_pod(name: &str, ip: &str, linked: bool) -> RunnerPod {
        let mut labels = pool_labels(POOL);
        if linked {
            labels.insert(POD_TEMPLATE_HASH_LABEL.into(), "6d5f9c".into());
        }
        RunnerPod {
            namespace: NS.into(),
            name: name.into(),
            ip: Some(ip.into()),
            phase: "Running".into(),
            labels,
            created_at: Utc::now(),
        }
    }

    fn remote_runner(id: i64, name: &str, online: bool, busy: bool) -> RemoteRunner {
        RemoteRunner {
            id,
            name: name.into(),
            online,
            busy,
            labels: vec![format!("{NS}/{POOL}")],
        }
    }

    #[test]
    fn busy_lookup_matches_by_name() {
        let runners = vec![
            remote_runner(1, "pod-a", true, true),
            remote_runner(2, "pod-b", true, false),
        ];
        assert!(runner_busy(&runners, "pod-a"));
        assert!(!runner_busy(&runners, "pod-b"));
        assert!(!runner_busy(&runners, "pod-c"));
    }

    #[test]
    fn removed_names_diffs_the_lists() {
        let prev = vec!["a".to_string(), "b".to_string()];
        let current = vec!["b".to_string(), "c".to_string()];
        assert_eq!(removed_runner_names(&prev, &current), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn stale_pod_is_deleted_even_when_its_runner_is_busy() {
        let h = harness(test_config());
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", true)).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Stale,
                    ..Default::default()
                },
            )
            .await;
        h.registry
            .set_runners(REPO, vec![remote_runner(1, "pod-1", true, true)])
            .await;

        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_none());
    }

    #[tokio::test]
    async fn pod_with_unreachable_status_endpoint_is_left_alone() {
        let h = harness(test_config());
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", true)).await;
        // No status seeded for the IP yet: the fetch fails.

        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_some());

        // The endpoint comes up, then vanishes again; an unreachable pod
        // is skipped, not deleted.
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Running,
                    ..Default::default()
                },
            )
            .await;
        h.manage_loop.run_once().await.unwrap();
        h.statuses.clear_status("10.0.0.1").await;
        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_some());
    }

    #[tokio::test]
    async fn pod_not_in_running_phase_is_skipped() {
        let h = harness(test_config());
        let mut pod = runner_pod("pod-1", "10.0.0.1", true);
        pod.phase = "Pending".into();
        h.pods.add_pod(pod).await;
        // Even a stale status must not matter while the pod is not running.
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Stale,
                    ..Default::default()
                },
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_some());
    }

    #[tokio::test]
    async fn debugging_pod_is_notified_exactly_once() {
        let h = harness(test_config());
        h.backdate_watermark().await;
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", false)).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    result: Some(JobResult::Failure),
                    finished_at: Some(Utc::now()),
                    deletion_time: Some(Utc::now() + chrono::Duration::hours(1)),
                    extend: Some(true),
                    ..Default::default()
                },
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        // The window is still open, so the pod survives.
        assert!(h.pods.pod(NS, "pod-1").await.is_some());

        let posts = h.notifier.posts().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].channel, "#ci");
        assert_eq!(posts[0].result, JobResult::Failure);
        assert!(posts[0].extend);
        assert_eq!(posts[0].namespace, NS);
        assert_eq!(posts[0].pod_name, "pod-1");

        // The next tick sees the same finished_at behind the new watermark.
        h.manage_loop.run_once().await.unwrap();
        assert_eq!(h.notifier.posts().await.len(), 1);
    }

    #[tokio::test]
    async fn notification_uses_the_per_pod_channel_override() {
        let h = harness(test_config());
        h.backdate_watermark().await;
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", false)).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    result: Some(JobResult::Success),
                    finished_at: Some(Utc::now()),
                    deletion_time: Some(Utc::now() + chrono::Duration::hours(1)),
                    channel: Some("#release".into()),
                    ..Default::default()
                },
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        let posts = h.notifier.posts().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].channel, "#release");
    }

    #[tokio::test]
    async fn no_notification_without_a_configured_address() {
        let mut config = test_config();
        config.notification_address = None;
        let h = harness(config);
        h.backdate_watermark().await;
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", false)).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    result: Some(JobResult::Success),
                    finished_at: Some(Utc::now()),
                    deletion_time: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        assert!(h.notifier.posts().await.is_empty());
        assert!(h.pods.pod(NS, "pod-1").await.is_some());
    }

    #[tokio::test]
    async fn debugging_pod_is_deleted_after_its_window_without_a_second_notification() {
        let h = harness(test_config());
        // finished_at lies before the watermark: the finish was already seen.
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", false)).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    result: Some(JobResult::Success),
                    finished_at: Some(Utc::now() - chrono::Duration::hours(2)),
                    deletion_time: Some(Utc::now() - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_none());
        assert!(h.notifier.posts().await.is_empty());
    }

    #[tokio::test]
    async fn debugging_pod_without_a_deletion_time_is_deleted_immediately() {
        let h = harness(test_config());
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", false)).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    ..Default::default()
                },
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_none());
    }

    #[tokio::test]
    async fn idle_pod_past_the_recreate_deadline_is_recycled() {
        let h = harness(test_config());
        let mut pod = runner_pod("pod-1", "10.0.0.1", true);
        pod.created_at = Utc::now() - chrono::Duration::hours(25);
        h.pods.add_pod(pod).await;
        h.statuses
            .set_status("10.0.0.1", RunnerStatus::default())
            .await;
        h.registry
            .set_runners(REPO, vec![remote_runner(1, "pod-1", true, false)])
            .await;

        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_none());
    }

    #[tokio::test]
    async fn busy_pod_past_the_recreate_deadline_is_kept_and_unlinked() {
        let h = harness(test_config());
        let mut pod = runner_pod("pod-1", "10.0.0.1", true);
        pod.created_at = Utc::now() - chrono::Duration::hours(25);
        h.pods.add_pod(pod).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Running,
                    ..Default::default()
                },
            )
            .await;
        h.registry
            .set_runners(REPO, vec![remote_runner(1, "pod-1", true, true)])
            .await;

        h.manage_loop.run_once().await.unwrap();
        let pod = h.pods.pod(NS, "pod-1").await.unwrap();
        assert!(!pod.has_label(POD_TEMPLATE_HASH_LABEL));
    }

    #[tokio::test]
    async fn debugging_pod_in_its_window_survives_the_recreate_deadline() {
        let h = harness(test_config());
        let mut pod = runner_pod("pod-1", "10.0.0.1", false);
        pod.created_at = Utc::now() - chrono::Duration::hours(25);
        h.pods.add_pod(pod).await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    finished_at: Some(Utc::now() - chrono::Duration::hours(2)),
                    deletion_time: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        assert!(h.pods.pod(NS, "pod-1").await.is_some());
    }

    #[tokio::test]
    async fn debugging_pod_in_its_window_is_unlinked_like_a_busy_pod() {
        let h = harness(test_config());
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", true)).await;
        // The finish was seen on an earlier tick; only the open window is
        // left.
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    finished_at: Some(Utc::now() - chrono::Duration::hours(2)),
                    deletion_time: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await;
        // The runner is idle: the debugging state alone makes the pod
        // unlinkable.
        h.registry
            .set_runners(REPO, vec![remote_runner(1, "pod-1", true, false)])
            .await;

        h.manage_loop.run_once().await.unwrap();

        let pod = h.pods.pod(NS, "pod-1").await.unwrap();
        assert!(!pod.has_label(POD_TEMPLATE_HASH_LABEL));
        assert!(h.notifier.posts().await.is_empty());
    }

    #[tokio::test]
    async fn unlinking_respects_the_capacity_budget() {
        // replicas 1, ceiling 2: budget for exactly one unlinked pod.
        let h = harness(test_config());
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", true)).await;
        h.pods.add_pod(runner_pod("pod-2", "10.0.0.2", true)).await;
        h.pods.add_pod(runner_pod("pod-3", "10.0.0.3", true)).await;
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.statuses
                .set_status(
                    ip,
                    RunnerStatus {
                        state: RunnerState::Running,
                        ..Default::default()
                    },
                )
                .await;
        }
        // pod-1 and pod-3 are busy, pod-2 is idle.
        h.registry
            .set_runners(
                REPO,
                vec![
                    remote_runner(1, "pod-1", true, true),
                    remote_runner(2, "pod-2", true, false),
                    remote_runner(3, "pod-3", true, true),
                ],
            )
            .await;

        h.manage_loop.run_once().await.unwrap();

        // Only the first busy pod fit the budget; the idle pod is never
        // unlinked at all.
        assert!(
            !h.pods
                .pod(NS, "pod-1")
                .await
                .unwrap()
                .has_label(POD_TEMPLATE_HASH_LABEL)
        );
        assert!(
            h.pods
                .pod(NS, "pod-2")
                .await
                .unwrap()
                .has_label(POD_TEMPLATE_HASH_LABEL)
        );
        assert!(
            h.pods
                .pod(NS, "pod-3")
                .await
                .unwrap()
                .has_label(POD_TEMPLATE_HASH_LABEL)
        );
        // Unlinking relabels; it never deletes.
        assert_eq!(h.pods.pods().await.len(), 3);
    }

    #[tokio::test]
    async fn already_unlinked_pods_consume_the_budget() {
        let mut config = test_config();
        config.max_runner_pods = 3;
        let h = harness(config);
        // pod-0 was unlinked on an earlier tick.
        h.pods.add_pod(runner_pod("pod-0", "10.0.0.9", false)).await;
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", true)).await;
        h.pods.add_pod(runner_pod("pod-2", "10.0.0.2", true)).await;
        for ip in ["10.0.0.9", "10.0.0.1", "10.0.0.2"] {
            h.statuses
                .set_status(
                    ip,
                    RunnerStatus {
                        state: RunnerState::Running,
                        ..Default::default()
                    },
                )
                .await;
        }
        h.registry
            .set_runners(
                REPO,
                vec![
                    remote_runner(1, "pod-0", true, true),
                    remote_runner(2, "pod-1", true, true),
                    remote_runner(3, "pod-2", true, true),
                ],
            )
            .await;

        h.manage_loop.run_once().await.unwrap();

        // Budget was 3 - 1 - 1 = 1: pod-1 got it, pod-2 must wait.
        assert!(
            !h.pods
                .pod(NS, "pod-1")
                .await
                .unwrap()
                .has_label(POD_TEMPLATE_HASH_LABEL)
        );
        assert!(
            h.pods
                .pod(NS, "pod-2")
                .await
                .unwrap()
                .has_label(POD_TEMPLATE_HASH_LABEL)
        );
    }

    #[tokio::test]
    async fn a_blocked_unlink_happens_once_the_budget_frees_up() {
        let h = harness(test_config());
        // pod-0 was unlinked earlier and its debugging window is over; pod-1
        // is busy and waiting for a slot.
        h.pods.add_pod(runner_pod("pod-0", "10.0.0.9", false)).await;
        h.pods.add_pod(runner_pod("pod-1", "10.0.0.1", true)).await;
        h.statuses
            .set_status(
                "10.0.0.9",
                RunnerStatus {
                    state: RunnerState::Debugging,
                    finished_at: Some(Utc::now() - chrono::Duration::hours(2)),
                    deletion_time: Some(Utc::now() - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .await;
        h.statuses
            .set_status(
                "10.0.0.1",
                RunnerStatus {
                    state: RunnerState::Running,
                    ..Default::default()
                },
            )
            .await;
        h.registry
            .set_runners(
                REPO,
                vec![
                    remote_runner(1, "pod-0", true, false),
                    remote_runner(2, "pod-1", true, true),
                ],
            )
            .await;

        h.manage_loop.run_once().await.unwrap();

        // Tick 1 counted pod-0 against the ceiling, so pod-1 stayed linked;
        // deleting pod-0 freed the slot for the next tick.
        assert!(h.pods.pod(NS, "pod-0").await.is_none());
        assert!(
            h.pods
                .pod(NS, "pod-1")
                .await
                .unwrap()
                .has_label(POD_TEMPLATE_HASH_LABEL)
        );

        h.manage_loop.run_once().await.unwrap();
        assert!(
            !h.pods
                .pod(NS, "pod-1")
                .await
                .unwrap()
                .has_label(POD_TEMPLATE_HASH_LABEL)
        );
    }

    #[tokio::test]
    async fn offline_runner_without_a_pod_is_removed() {
        let h = harness(test_config());
        h.pods.add_pod(runner_pod("pod-c", "10.0.0.3", true)).await;
        h.statuses
            .set_status("10.0.0.3", RunnerStatus::default())
            .await;
        h.registry
            .set_runners(
                REPO,
                vec![
                    // Online without a pod: may be registering right now.
                    remote_runner(1, "pod-a", true, false),
                    // Offline without a pod: gone for good.
                    remote_runner(2, "pod-b", false, false),
                    // Offline with a pod: the pod is still starting up.
                    remote_runner(3, "pod-c", false, false),
                ],
            )
            .await;

        h.manage_loop.run_once().await.unwrap();

        let names: Vec<String> = h
            .registry
            .runners(REPO)
            .await
            .into_iter()
            .map(|runner| runner.name)
            .collect();
        assert_eq!(names, vec!["pod-a".to_string(), "pod-c".to_string()]);
    }

    #[tokio::test]
    async fn metric_series_follow_the_remote_runner_set() {
        let h = harness(test_config());
        h.registry
            .set_runners(
                REPO,
                vec![
                    remote_runner(1, "pod-x", true, true),
                    remote_runner(2, "pod-y", true, false),
                ],
            )
            .await;

        h.manage_loop.run_once().await.unwrap();
        let text = h.exposition();
        assert!(text.contains(r#"runnerpool_pool_replicas{pool="ci/pool-a"} 1"#));
        assert!(text.contains(r#"runnerpool_runner_busy{pool="ci/pool-a",runner="pod-x"} 1"#));
        assert!(text.contains(r#"runnerpool_runner_online{pool="ci/pool-a",runner="pod-y"} 1"#));

        h.registry
            .set_runners(REPO, vec![remote_runner(2, "pod-y", true, false)])
            .await;
        h.manage_loop.run_once().await.unwrap();

        let text = h.exposition();
        assert!(!text.contains("pod-x"));
        assert!(text.contains("pod-y"));
    }

    #[tokio::test]
    async fn stop_tears_down_runners_and_metric_series() {
        let h = harness(test_config());
        h.registry
            .set_runners(
                REPO,
                vec![
                    remote_runner(1, "pod-1", true, true),
                    remote_runner(2, "pod-2", true, false),
                ],
            )
            .await;

        Arc::clone(&h.manage_loop).start().await;
        h.manage_loop.run_once().await.unwrap();
        h.manage_loop.stop().await.unwrap();

        // Teardown is unconditional: even online, busy runners are removed.
        assert!(h.registry.runners(REPO).await.is_empty());
        assert!(!h.exposition().contains("runnerpool_"));

        // Stopping again finds nothing left to do.
        h.manage_loop.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_of_a_never_started_loop_is_fine() {
        let h = harness(test_config());
        h.manage_loop.stop().await.unwrap();
    }

    #[tokio::test]
    async fn update_swaps_the_config_and_repoints_the_notifier() {
        let h = harness(test_config());

        let mut new_config = test_config();
        new_config.replicas = 4;
        new_config.notification_address = Some("http://other-notifier:8080".into());
        h.manage_loop.update(new_config).await;

        h.manage_loop.run_once().await.unwrap();
        assert!(
            h.exposition()
                .contains(r#"runnerpool_pool_replicas{pool="ci/pool-a"} 4"#)
        );
        assert_eq!(
            h.notifier.server_urls().await,
            vec!["http://other-notifier:8080".to_string()]
        );

        // Same address again: no re-point.
        let mut same = test_config();
        same.replicas = 5;
        same.notification_address = Some("http://other-notifier:8080".into());
        h.manage_loop.update(same).await;
        assert_eq!(h.notifier.server_urls().await.len(), 1);
    }
}
