//! Gauge metrics for pools and their registered runners.
//!
//! The registry has no TTL for series, so the manage loop deletes series
//! explicitly: per-runner when the remote registry forgets a runner, and
//! everything for a pool when the pool stops.

use anyhow::{Context, Result};
use prometheus::{IntGaugeVec, Opts, Registry};

/// Gauge families maintained by the manage loops.
///
/// One instance is shared by every loop of a manager; the series are keyed by
/// the pool's `namespace/name` plus, for runner gauges, the runner name.
pub struct Metrics {
    pool_replicas: IntGaugeVec,
    runner_online: IntGaugeVec,
    runner_busy: IntGaugeVec,
}

impl Metrics {
    /// Create the gauge families and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let pool_replicas = IntGaugeVec::new(
            Opts::new("replicas", "Desired steady-state pod count of the pool")
                .namespace("runnerpool")
                .subsystem("pool"),
            &["pool"],
        )?;
        let runner_online = IntGaugeVec::new(
            Opts::new("online", "1 if the runner is connected to the remote registry")
                .namespace("runnerpool")
                .subsystem("runner"),
            &["pool", "runner"],
        )?;
        let runner_busy = IntGaugeVec::new(
            Opts::new("busy", "1 if the runner is executing a job")
                .namespace("runnerpool")
                .subsystem("runner"),
            &["pool", "runner"],
        )?;

        registry
            .register(Box::new(pool_replicas.clone()))
            .context("Failed to register pool replicas gauge")?;
        registry
            .register(Box::new(runner_online.clone()))
            .context("Failed to register runner online gauge")?;
        registry
            .register(Box::new(runner_busy.clone()))
            .context("Failed to register runner busy gauge")?;

        Ok(Self {
            pool_replicas,
            runner_online,
            runner_busy,
        })
    }

    pub fn set_pool_replicas(&self, pool: &str, replicas: i32) {
        self.pool_replicas
            .with_label_values(&[pool])
            .set(i64::from(replicas));
    }

    /// Drop the pool-level series. Absent series are fine.
    pub fn delete_pool(&self, pool: &str) {
        let _ = self.pool_replicas.remove_label_values(&[pool]);
    }

    pub fn set_runner(&self, pool: &str, runner: &str, online: bool, busy: bool) {
        self.runner_online
            .with_label_values(&[pool, runner])
            .set(i64::from(online));
        self.runner_busy
            .with_label_values(&[pool, runner])
            .set(i64::from(busy));
    }

    /// Drop both series of one runner. Absent series are fine.
    pub fn delete_runner(&self, pool: &str, runner: &str) {
        let _ = self.runner_online.remove_label_values(&[pool, runner]);
        let _ = self.runner_busy.remove_label_values(&[pool, runner]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    fn exposition(registry: &Registry) -> String {
        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn gauges_use_full_metric_names() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.set_pool_replicas("ci/pool", 3);
        metrics.set_runner("ci/pool", "pool-abc", true, false);

        let text = exposition(&registry);
        assert!(text.contains(r#"runnerpool_pool_replicas{pool="ci/pool"} 3"#));
        assert!(text.contains(r#"runnerpool_runner_online{pool="ci/pool",runner="pool-abc"} 1"#));
        assert!(text.contains(r#"runnerpool_runner_busy{pool="ci/pool",runner="pool-abc"} 0"#));
    }

    #[test]
    fn deleting_a_runner_removes_both_series() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.set_runner("ci/pool", "pool-abc", true, true);
        metrics.set_runner("ci/pool", "pool-def", false, false);

        metrics.delete_runner("ci/pool", "pool-abc");

        let text = exposition(&registry);
        assert!(!text.contains("pool-abc"));
        assert!(text.contains("pool-def"));

        // A second delete of the same runner is a no-op.
        metrics.delete_runner("ci/pool", "pool-abc");
    }

    #[test]
    fn deleting_a_pool_removes_the_replicas_series() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.set_pool_replicas("ci/pool", 2);
        metrics.delete_pool("ci/pool");
        assert!(!exposition(&registry).contains("runnerpool_pool_replicas"));
    }
}
