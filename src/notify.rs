//! Job-result notifications.
//!
//! When a runner pod finishes a job and enters its debugging window, the
//! manage loop posts one notification to the chat notification service. The
//! service owns message rendering; this client only reports what happened and
//! where.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::status::{JobInfo, JobResult};

/// Endpoint segment appended to the configured service address.
const NOTIFY_ENDPOINT: &str = "notify";

/// How long to wait for the notification service.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// One job-result notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultNotification {
    /// Channel to post to. Empty defers to the service's default channel.
    pub channel: String,
    pub result: JobResult,
    /// Whether the job asked for its debugging window to be extended.
    pub extend: bool,
    pub namespace: String,
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_info: Option<JobInfo>,
}

/// Posts job-result notifications to the notification service.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post_result(&self, notification: &ResultNotification) -> Result<()>;

    /// Re-point the notifier at a different service address.
    async fn update_server_url(&self, address: &str) -> Result<()>;
}

/// Production notifier.
///
/// The resolved endpoint URL lives behind a lock because a pool's
/// configuration can re-point it while the manage loop is running.
pub struct HttpNotifier {
    http_client: Client,
    notify_url: RwLock<Option<Url>>,
}

impl HttpNotifier {
    /// Create a notifier. `address` may be absent when the pool starts with
    /// notifications disabled; a later configuration update can still point
    /// the notifier somewhere.
    pub fn new(address: Option<&str>) -> Result<Self> {
        let notify_url = address.map(parse_address).transpose()?;
        // In-cluster traffic; never route it through an egress proxy.
        let http_client = Client::builder()
            .no_proxy()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http_client,
            notify_url: RwLock::new(notify_url),
        })
    }
}

/// Resolve the result endpoint under `address`, keeping any base path the
/// address carries.
fn parse_address(address: &str) -> Result<Url> {
    let mut url = Url::parse(address)
        .with_context(|| format!("Invalid notification service address '{address}'"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("Notification service address '{address}' cannot carry a path"))?
        .pop_if_empty()
        .push(NOTIFY_ENDPOINT);
    Ok(url)
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn post_result(&self, notification: &ResultNotification) -> Result<()> {
        let url = {
            let notify_url = self.notify_url.read().await;
            notify_url
                .clone()
                .ok_or_else(|| anyhow!("No notification service address configured"))?
        };

        let response = self
            .http_client
            .post(url)
            .json(notification)
            .send()
            .await
            .context("Failed to reach the notification service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Notification service error ({status}): {body}"));
        }
        Ok(())
    }

    async fn update_server_url(&self, address: &str) -> Result<()> {
        let url = parse_address(address)?;
        *self.notify_url.write().await = Some(url);
        Ok(())
    }
}

/// In-memory notifier for tests and downstream consumers: records every post
/// and every address change.
#[derive(Default)]
pub struct MockNotifier {
    posts: RwLock<Vec<ResultNotification>>,
    server_urls: RwLock<Vec<String>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything posted so far, oldest first.
    pub async fn posts(&self) -> Vec<ResultNotification> {
        self.posts.read().await.clone()
    }

    /// Addresses the notifier has been re-pointed at.
    pub async fn server_urls(&self) -> Vec<String> {
        self.server_urls.read().await.clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn post_result(&self, notification: &ResultNotification) -> Result<()> {
        self.posts.write().await.push(notification.clone());
        Ok(())
    }

    async fn update_server_url(&self, address: &str) -> Result<()> {
        self.server_urls.write().await.push(address.to_string());
        Ok(())
    }
}
