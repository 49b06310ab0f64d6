//! Remote runner registry client.
//!
//! Handles:
//! - App authentication (JWT generation + cached installation tokens) or a
//!   plain personal access token
//! - Listing registered runners with subset label filtering
//! - Removing runners (404 means the runner is already gone)
//! - Registration token creation for the surrounding token-rotation task

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::RegistryCredentials;

/// Default API base URL.
const GITHUB_API_URL: &str = "https://api.github.com";

/// Page size for runner listings.
const RUNNERS_PER_PAGE: usize = 100;

/// A runner as seen by the remote registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRunner {
    pub id: i64,
    pub name: String,
    /// The registry reports a status string; only `"online"` counts.
    pub online: bool,
    pub busy: bool,
    pub labels: Vec<String>,
}

impl RemoteRunner {
    /// True if the runner carries every one of `required`.
    pub fn has_labels(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|want| self.labels.iter().any(|have| have == want))
    }
}

/// A short-lived token a new runner uses to register itself.
#[derive(Debug, Clone)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Narrow read/write interface to the remote runner registry.
///
/// Abstracted so the manage loop can run against either the real API or an
/// in-memory mock.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// List runners registered against `repository` that carry all `labels`.
    async fn list_runners(&self, repository: &str, labels: &[String]) -> Result<Vec<RemoteRunner>>;

    /// Remove a runner by id. A runner that is already gone is success.
    async fn remove_runner(&self, repository: &str, runner_id: i64) -> Result<()>;

    /// Create a registration token for `repository`.
    ///
    /// Unused by the manage loop itself; the surrounding token-rotation task
    /// calls this.
    async fn create_registration_token(&self, repository: &str) -> Result<RegistrationToken>;
}

/// Builds a registry client from credentials.
///
/// The manager calls this once per pool, when it first sees the pool.
pub trait RegistryFactory: Send + Sync {
    fn create(&self, credentials: &RegistryCredentials) -> Result<Arc<dyn RunnerRegistry>>;
}

/// Cached installation access token with expiration tracking.
#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Check if the token is still valid (with a 5-minute buffer).
    fn is_valid(&self) -> bool {
        self.expires_at > Utc::now() + Duration::minutes(5)
    }
}

/// JWT claims for app authentication.
#[derive(Debug, Serialize)]
struct AppJwtClaims {
    /// Issued at time
    iat: i64,
    /// Expiration time (max 10 minutes)
    exp: i64,
    /// App ID (issuer)
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct RunnersPageResponse {
    runners: Vec<RunnerInfo>,
}

#[derive(Debug, Deserialize)]
struct RunnerInfo {
    id: i64,
    name: String,
    status: String,
    busy: bool,
    #[serde(default)]
    labels: Vec<RunnerLabel>,
}

#[derive(Debug, Deserialize)]
struct RunnerLabel {
    name: String,
}

impl From<RunnerInfo> for RemoteRunner {
    fn from(info: RunnerInfo) -> Self {
        Self {
            id: info.id,
            name: info.name,
            online: info.status == "online",
            busy: info.busy,
            labels: info.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

/// Authentication material held by the client.
enum RegistryAuth {
    App {
        app_id: u64,
        installation_id: u64,
        key: EncodingKey,
    },
    Token(String),
}

/// Registry client against the GitHub Actions API.
pub struct GithubRegistry {
    api_base: String,
    auth: RegistryAuth,
    http_client: Client,
    /// Cached installation access token; only used for app auth.
    cached_token: RwLock<Option<CachedToken>>,
}

impl GithubRegistry {
    /// Create a client. Key material is parsed here so bad credentials fail
    /// the pool up front instead of on the first tick.
    pub fn new(credentials: &RegistryCredentials, api_base: Option<&str>) -> Result<Self> {
        let auth = match credentials {
            RegistryCredentials::App {
                app_id,
                installation_id,
                private_key_pem,
            } => RegistryAuth::App {
                app_id: *app_id,
                installation_id: *installation_id,
                key: EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                    .context("Failed to parse app private key")?,
            },
            RegistryCredentials::Token(token) => RegistryAuth::Token(token.clone()),
        };

        let http_client = Client::builder()
            .user_agent("runnerpool")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_base: api_base.unwrap_or(GITHUB_API_URL).trim_end_matches('/').to_string(),
            auth,
            http_client,
            cached_token: RwLock::new(None),
        })
    }

    /// Generate a JWT for app authentication.
    fn generate_jwt(app_id: u64, key: &EncodingKey) -> Result<String> {
        let now = Utc::now();
        let claims = AppJwtClaims {
            // 60 seconds in the past to avoid clock drift
            iat: (now - Duration::seconds(60)).timestamp(),
            exp: (now + Duration::minutes(9)).timestamp(),
            iss: app_id.to_string(),
        };
        let header = Header::new(Algorithm::RS256);
        encode(&header, &claims, key).context("Failed to generate JWT")
    }

    /// Get a bearer token for API calls, refreshing the cached installation
    /// token when needed.
    async fn access_token(&self) -> Result<String> {
        let (app_id, installation_id, key) = match &self.auth {
            RegistryAuth::Token(token) => return Ok(token.clone()),
            RegistryAuth::App {
                app_id,
                installation_id,
                key,
            } => (*app_id, *installation_id, key),
        };

        {
            let cached = self.cached_token.read().await;
            if let Some(token) = cached.as_ref()
                && token.is_valid()
            {
                return Ok(token.token.clone());
            }
        }

        let jwt = Self::generate_jwt(app_id, key)?;
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.api_base
        );

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {jwt}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .context("Failed to request installation access token")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Registry API error ({status}): {body}"));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation access token response")?;

        let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);

        let mut cached = self.cached_token.write().await;
        *cached = Some(CachedToken {
            token: token_response.token.clone(),
            expires_at,
        });

        Ok(token_response.token)
    }
}

/// Split an `owner/name` slug into the repository API path.
fn repo_path(repository: &str) -> Result<String> {
    match repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
            Ok(format!("/repos/{owner}/{name}"))
        }
        _ => bail!("Repository must be an owner/name slug, got '{repository}'"),
    }
}

#[async_trait]
impl RunnerRegistry for GithubRegistry {
    async fn list_runners(&self, repository: &str, labels: &[String]) -> Result<Vec<RemoteRunner>> {
        let access_token = self.access_token().await?;
        let base = format!("{}{}/actions/runners", self.api_base, repo_path(repository)?);

        let mut runners = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{base}?per_page={RUNNERS_PER_PAGE}&page={page}");
            let response = self
                .http_client
                .get(&url)
                .header("Authorization", format!("Bearer {access_token}"))
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28")
                .send()
                .await
                .context("Failed to list runners")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(anyhow!("Registry API error listing runners ({status}): {body}"));
            }

            let page_response: RunnersPageResponse = response
                .json()
                .await
                .context("Failed to parse runners list response")?;

            let page_len = page_response.runners.len();
            runners.extend(
                page_response
                    .runners
                    .into_iter()
                    .map(RemoteRunner::from)
                    .filter(|r| r.has_labels(labels)),
            );

            if page_len < RUNNERS_PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(runners)
    }

    async fn remove_runner(&self, repository: &str, runner_id: i64) -> Result<()> {
        let access_token = self.access_token().await?;
        let url = format!(
            "{}{}/actions/runners/{runner_id}",
            self.api_base,
            repo_path(repository)?
        );

        let response = self
            .http_client
            .delete(&url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .context("Failed to remove runner")?;

        // 404 means the registry already forgot the runner; that is the
        // outcome we wanted.
        if response.status().as_u16() == 404 {
            info!(
                "Runner {} already removed from {} (404)",
                runner_id, repository
            );
            return Ok(());
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Registry API error removing runner ({status}): {body}"));
        }

        Ok(())
    }

    async fn create_registration_token(&self, repository: &str) -> Result<RegistrationToken> {
        let access_token = self.access_token().await?;
        let url = format!(
            "{}{}/actions/runners/registration-token",
            self.api_base,
            repo_path(repository)?
        );

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .context("Failed to request registration token")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Registry API error creating registration token ({status}): {body}"
            ));
        }

        let token_response: RegistrationTokenResponse = response
            .json()
            .await
            .context("Failed to parse registration token response")?;

        let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse registration token expiration")?
            .with_timezone(&Utc);

        Ok(RegistrationToken {
            token: token_response.token,
            expires_at,
        })
    }
}

/// Factory producing [`GithubRegistry`] clients.
pub struct GithubRegistryFactory {
    api_base: Option<String>,
}

impl GithubRegistryFactory {
    pub fn new() -> Self {
        Self { api_base: None }
    }

    /// Point clients at an enterprise API base instead of the default.
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: Some(api_base.into()),
        }
    }
}

impl Default for GithubRegistryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFactory for GithubRegistryFactory {
    fn create(&self, credentials: &RegistryCredentials) -> Result<Arc<dyn RunnerRegistry>> {
        let client = GithubRegistry::new(credentials, self.api_base.as_deref())?;
        Ok(Arc::new(client))
    }
}

/// In-memory registry for tests and downstream consumers.
#[derive(Default)]
pub struct MockRegistry {
    runners: RwLock<HashMap<String, Vec<RemoteRunner>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the runner list for a repository.
    pub async fn set_runners(&self, repository: &str, runners: Vec<RemoteRunner>) {
        self.runners
            .write()
            .await
            .insert(repository.to_string(), runners);
    }

    /// Current runner list for a repository, unfiltered.
    pub async fn runners(&self, repository: &str) -> Vec<RemoteRunner> {
        self.runners
            .read()
            .await
            .get(repository)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunnerRegistry for MockRegistry {
    async fn list_runners(&self, repository: &str, labels: &[String]) -> Result<Vec<RemoteRunner>> {
        Ok(self
            .runners(repository)
            .await
            .into_iter()
            .filter(|r| r.has_labels(labels))
            .collect())
    }

    async fn remove_runner(&self, repository: &str, runner_id: i64) -> Result<()> {
        let mut runners = self.runners.write().await;
        let list = runners
            .get_mut(repository)
            .ok_or_else(|| anyhow!("Runner {runner_id} does not exist"))?;
        let before = list.len();
        list.retain(|r| r.id != runner_id);
        if list.len() == before {
            bail!("Runner {runner_id} does not exist");
        }
        Ok(())
    }

    async fn create_registration_token(&self, _repository: &str) -> Result<RegistrationToken> {
        Ok(RegistrationToken {
            token: "mock-registration-token".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }
}

/// Factory handing out one shared [`MockRegistry`], so tests can seed and
/// inspect the same instance the manager uses.
pub struct MockRegistryFactory {
    pub registry: Arc<MockRegistry>,
}

impl MockRegistryFactory {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MockRegistry::new()),
        }
    }
}

impl Default for MockRegistryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFactory for MockRegistryFactory {
    fn create(&self, _credentials: &RegistryCredentials) -> Result<Arc<dyn RunnerRegistry>> {
        Ok(self.registry.clone())
    }
}
