//! Runner pod self-reported status.
//!
//! Every runner pod serves a small JSON document describing where it is in
//! its life (`initializing`, `running`, `debugging`, `stale`), when its job
//! finished and how it ended. The manage loop fetches this fresh each tick
//! and never caches it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::STATUS_ENDPOINT;

/// How long to wait for a pod's status endpoint.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state a runner pod reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    /// Still setting up; no job accepted yet.
    #[default]
    Initializing,
    /// Registered and idle or executing a job.
    Running,
    /// Job finished; the pod is kept around for inspection until its
    /// deletion time.
    Debugging,
    /// The pod decided it can no longer serve jobs and wants to be deleted.
    Stale,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Debugging => "debugging",
            Self::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Outcome of the job a runner executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Success,
    Failure,
    Cancelled,
    Unknown,
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Metadata about the job, collected by the runner entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInfo {
    pub actor: String,
    pub git_ref: String,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_number: Option<i64>,
    pub repository: String,
    pub run_id: i64,
    pub run_number: i64,
    pub workflow_name: String,
}

/// The status document a runner pod serves.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub state: RunnerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_time: Option<DateTime<Utc>>,
    /// Whether the job asked for its debugging window to be extended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_info: Option<JobInfo>,
    /// Per-pod notification channel override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Fetches a pod's self-reported status by IP.
#[async_trait]
pub trait PodStatusClient: Send + Sync {
    async fn get_status(&self, ip: &str) -> Result<RunnerStatus>;
}

/// Production status client, one shared instance for all pools.
pub struct HttpStatusClient {
    http_client: Client,
    port: u16,
}

impl HttpStatusClient {
    pub fn new(port: u16) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(STATUS_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http_client, port })
    }
}

#[async_trait]
impl PodStatusClient for HttpStatusClient {
    async fn get_status(&self, ip: &str) -> Result<RunnerStatus> {
        let url = format!("http://{}:{}/{}", ip, self.port, STATUS_ENDPOINT);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach status endpoint of {ip}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Status endpoint of {} returned {}",
                ip,
                response.status()
            ));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse status of {ip}"))
    }
}

/// In-memory status client for tests: statuses seeded per pod IP, unknown
/// IPs error like an unreachable pod would.
#[derive(Default)]
pub struct MockStatusClient {
    statuses: RwLock<HashMap<String, RunnerStatus>>,
}

impl MockStatusClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, ip: &str, status: RunnerStatus) {
        self.statuses.write().await.insert(ip.to_string(), status);
    }

    pub async fn clear_status(&self, ip: &str) {
        self.statuses.write().await.remove(ip);
    }
}

#[async_trait]
impl PodStatusClient for MockStatusClient {
    async fn get_status(&self, ip: &str) -> Result<RunnerStatus> {
        self.statuses
            .read()
            .await
            .get(ip)
            .cloned()
            .ok_or_else(|| anyhow!("No status defined for pod IP {ip}"))
    }
}
