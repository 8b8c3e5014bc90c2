//! Repository-server client.
//!
//! `RepoServerClient` is the seam the engine talks through; `PulpClient`
//! implements it against the Pulp 3 REST API with `reqwest`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::Config;
use crate::models::remote_task::{
    BannedPackages, Operation, RemoteTaskHandle, StepStart, TaskPoll, TaskState,
};
use crate::models::repo::{FollowUpStep, RemoteRepo, RemoteRepoState, RepoKind};
use crate::services::credential_service::CredentialResolver;
use crate::services::fleet_config_service::FleetConfig;

const API_ROOT: &str = "/pulp/api/v3";
const PAGE_SIZE: usize = 200;
const MAX_ERROR_BODY: usize = 512;

/// Errors returned by repository-server calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("HTTP {status} from {url}: {message}")]
    Http {
        status: u16,
        url: String,
        message: String,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("credential lookup failed: {0}")]
    Credentials(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            RemoteError::Timeout(_) | RemoteError::Connection(_) | RemoteError::Credentials(_) => {
                true
            }
            RemoteError::NotFound(_) | RemoteError::InvalidConfig(_) | RemoteError::Decode(_) => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            RemoteError::Timeout(url)
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::Http {
                status: status.as_u16(),
                url,
                message: e.to_string(),
            }
        } else if e.is_builder() {
            RemoteError::InvalidConfig(e.to_string())
        } else {
            RemoteError::Connection(e.to_string())
        }
    }
}

/// Operations the engine needs from a repository server.
#[async_trait]
pub trait RepoServerClient: Send + Sync {
    /// Every repository the server currently knows about.
    async fn list_repos(&self, server: &str) -> Result<Vec<RemoteRepo>, RemoteError>;

    /// Fetch the state needed to decide whether a sync call is required.
    async fn describe_repo(
        &self,
        server: &str,
        repo: &RemoteRepo,
    ) -> Result<RemoteRepoState, RemoteError>;

    /// Start the main step of `operation`.
    async fn trigger(
        &self,
        server: &str,
        repo: &RemoteRepo,
        operation: &Operation,
    ) -> Result<StepStart, RemoteError>;

    /// Start a follow-up step once the main step has completed.
    async fn start_follow_up(
        &self,
        server: &str,
        repo: &RemoteRepo,
        operation: &Operation,
        step: FollowUpStep,
    ) -> Result<StepStart, RemoteError>;

    async fn poll_task(
        &self,
        server: &str,
        handle: &RemoteTaskHandle,
    ) -> Result<TaskPoll, RemoteError>;

    /// Ask the server to cancel a task. Best effort.
    async fn cancel_task(&self, server: &str, handle: &RemoteTaskHandle)
        -> Result<(), RemoteError>;

    /// Make sure `server` carries a repo mirroring `repo` from `source_server`.
    /// Succeeds without changes when the mirror already exists.
    async fn register_mirror(
        &self,
        server: &str,
        source_server: &str,
        repo: &RemoteRepo,
    ) -> Result<(), RemoteError>;
}

// ── Pulp 3 response types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Page<T> {
    next: Option<String>,
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    name: String,
    pulp_href: String,
    #[serde(default)]
    remote: Option<String>,
    #[serde(default)]
    latest_version_href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HrefResponse {
    pulp_href: String,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    url: String,
}

/// A package content unit; deb packages carry their name as `package`.
#[derive(Debug, Deserialize)]
struct PackageResponse {
    pulp_href: String,
    #[serde(default, alias = "package")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AsyncOperationResponse {
    task: String,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    state: TaskState,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    created_resources: Vec<Option<String>>,
}

impl From<TaskResponse> for TaskPoll {
    fn from(task: TaskResponse) -> Self {
        let error = task.error.and_then(|e| match e {
            serde_json::Value::Null => None,
            serde_json::Value::Object(ref map) => map
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string)
                .or_else(|| Some(e.to_string())),
            other => Some(other.to_string()),
        });
        TaskPoll {
            state: task.state,
            error,
            created_resources: task.created_resources.into_iter().flatten().collect(),
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────────────

/// HTTP client for a fleet of Pulp 3 servers.
pub struct PulpClient {
    clients: HashMap<String, Client>,
    credentials: Arc<dyn CredentialResolver>,
    scheme: String,
    credential_timeout: Duration,
}

impl PulpClient {
    /// Build one HTTP client per server so each gets its own TLS policy.
    pub fn new(
        fleet: &FleetConfig,
        credentials: Arc<dyn CredentialResolver>,
        config: &Config,
    ) -> Result<Self, RemoteError> {
        let mut clients = HashMap::new();
        for entry in fleet.servers.values() {
            let tls = &entry.server.tls;
            let mut builder = Client::builder()
                .timeout(config.http_timeout)
                .danger_accept_invalid_certs(!tls.verify);
            if let Some(path) = &tls.ca_cert {
                let pem = std::fs::read(path).map_err(|e| {
                    RemoteError::InvalidConfig(format!(
                        "cannot read CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| RemoteError::InvalidConfig(e.to_string()))?;
                builder = builder.add_root_certificate(cert);
            }
            let client = builder
                .build()
                .map_err(|e| RemoteError::InvalidConfig(e.to_string()))?;
            clients.insert(entry.server.name.clone(), client);
        }

        Ok(Self {
            clients,
            credentials,
            scheme: config.pulp_api_scheme.clone(),
            credential_timeout: config.credential_timeout,
        })
    }

    fn url(&self, server: &str, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}://{}{}", self.scheme, server, path)
        }
    }

    async fn request(
        &self,
        server: &str,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, RemoteError> {
        let client = self
            .clients
            .get(server)
            .ok_or_else(|| RemoteError::InvalidConfig(format!("unknown server {}", server)))?;

        let creds = tokio::time::timeout(self.credential_timeout, self.credentials.resolve(server))
            .await
            .map_err(|_| {
                RemoteError::Credentials(format!("timed out resolving credentials for {}", server))
            })??;

        Ok(client
            .request(method, self.url(server, path))
            .basic_auth(creds.username, Some(creds.password)))
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, RemoteError> {
        let response = builder.send().await?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, server: &str, path: &str) -> Result<T, RemoteError> {
        Self::send_json(self.request(server, Method::GET, path).await?).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        server: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, RemoteError> {
        Self::send_json(self.request(server, Method::POST, path).await?.json(&body)).await
    }

    /// Follow `next` links from the first page; `query` applies to the
    /// first request only since the server carries it into `next`.
    async fn get_all<T: DeserializeOwned>(
        &self,
        server: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, RemoteError> {
        let first = self.request(server, Method::GET, path).await?.query(query);
        let mut page: Page<T> = Self::send_json(first).await?;
        let mut results = std::mem::take(&mut page.results);
        while let Some(next) = page.next.take() {
            page = self.get(server, &next).await?;
            results.append(&mut page.results);
        }
        Ok(results)
    }

    async fn first_named<T: DeserializeOwned>(
        &self,
        server: &str,
        path: &str,
        name: &str,
    ) -> Result<Option<T>, RemoteError> {
        let builder = by_name(self.request(server, Method::GET, path).await?, name);
        let page: Page<T> = Self::send_json(builder).await?;
        Ok(page.results.into_iter().next())
    }

    async fn find_repo(
        &self,
        server: &str,
        kind: &RepoKind,
        name: &str,
    ) -> Result<Option<RepositoryResponse>, RemoteError> {
        let path = format!("{}/repositories/{}/{}/", API_ROOT, kind.plugin, kind.repo_type);
        self.first_named(server, &path, name).await
    }

    /// The distribution serving `name`; distributions share their repo's name.
    async fn find_distribution(
        &self,
        server: &str,
        name: &str,
    ) -> Result<Option<HrefResponse>, RemoteError> {
        self.first_named(server, &format!("{}/distributions/", API_ROOT), name)
            .await
    }

    async fn start_task(
        &self,
        server: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<StepStart, RemoteError> {
        let op: AsyncOperationResponse = self.post(server, path, body).await?;
        Ok(StepStart::Task(RemoteTaskHandle(op.task)))
    }

    async fn is_published(
        &self,
        server: &str,
        kind: &RepoKind,
        version: &str,
    ) -> Result<bool, RemoteError> {
        let builder = self
            .request(server, Method::GET, &publication_path(kind))
            .await?
            .query(&[("repository_version", version)]);
        let existing: Page<HrefResponse> = Self::send_json(builder).await?;
        Ok(!existing.results.is_empty())
    }

    /// Publish the latest version. Without `force`, a version that already
    /// has a publication is left alone.
    async fn publish(
        &self,
        server: &str,
        kind: &RepoKind,
        repo_href: &str,
        force: bool,
    ) -> Result<StepStart, RemoteError> {
        let repo: RepositoryResponse = self.get(server, repo_href).await?;
        let version = repo.latest_version_href.ok_or_else(|| {
            RemoteError::NotFound(format!("{} has no version to publish", repo.name))
        })?;

        if !force && self.is_published(server, kind, &version).await? {
            tracing::debug!("{} already published at {}", repo.name, version);
            return Ok(StepStart::Skipped);
        }

        self.start_task(
            server,
            &publication_path(kind),
            json!({ "repository_version": version }),
        )
        .await
    }

    /// New version of `repo_href` based on `base_version` without `units`.
    async fn modify(
        &self,
        server: &str,
        repo_href: &str,
        base_version: &str,
        units: Vec<String>,
    ) -> Result<StepStart, RemoteError> {
        self.start_task(
            server,
            &format!("{}modify/", repo_href),
            json!({ "base_version": base_version, "remove_content_units": units }),
        )
        .await
    }

    /// Delete `href`. Already-gone resources count as done.
    async fn delete(&self, server: &str, href: &str) -> Result<StepStart, RemoteError> {
        let response = self
            .request(server, Method::DELETE, href)
            .await?
            .send()
            .await?;
        let response = match check_status(response).await {
            Ok(response) => response,
            Err(RemoteError::NotFound(_)) => return Ok(StepStart::Skipped),
            Err(e) => return Err(e),
        };
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(StepStart::Immediate);
        }
        let op: AsyncOperationResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(StepStart::Task(RemoteTaskHandle(op.task)))
    }

    /// Drop packages matching `policy` from a freshly synced version.
    async fn remove_banned_packages(
        &self,
        server: &str,
        repo: &RemoteRepo,
        policy: &BannedPackages,
    ) -> Result<StepStart, RemoteError> {
        let current: RepositoryResponse = self.get(server, &repo.href).await?;
        let (Some(remote_href), Some(version)) = (current.remote, current.latest_version_href)
        else {
            return Ok(StepStart::Skipped);
        };
        // A published version was already filtered when it was synced.
        if self.is_published(server, &repo.kind, &version).await? {
            return Ok(StepStart::Skipped);
        }
        let remote: RemoteResponse = self.get(server, &remote_href).await?;
        if !policy.applies_to(&remote.url) {
            tracing::debug!("{} syncs from an internal domain, not filtering", repo.name);
            return Ok(StepStart::Skipped);
        }

        let pattern = Regex::new(&policy.regex).map_err(|e| {
            RemoteError::InvalidConfig(format!("banned package regex {}: {}", policy.regex, e))
        })?;
        // deb content can be filtered server side; other kinds are matched here.
        let filtered_by_server = repo.kind.plugin == "deb";
        let mut query = vec![("repository_version", version.as_str())];
        if filtered_by_server {
            query.push(("package__iregex", policy.regex.as_str()));
        }
        let packages: Vec<PackageResponse> = self
            .get_all(
                server,
                &format!("{}/content/{}/packages/", API_ROOT, repo.kind.plugin),
                &query,
            )
            .await?;

        let banned = banned_hrefs(&pattern, filtered_by_server, packages);
        if banned.is_empty() {
            return Ok(StepStart::Skipped);
        }
        tracing::info!("Removing {} banned packages from {}", banned.len(), repo.name);
        self.modify(server, &repo.href, &version, banned).await
    }

    /// Create `name` as an empty repo of `kind`, or return the existing one.
    async fn ensure_repo(
        &self,
        server: &str,
        kind: &RepoKind,
        name: &str,
        remote_href: Option<&str>,
    ) -> Result<String, RemoteError> {
        if let Some(existing) = self.find_repo(server, kind, name).await? {
            return Ok(existing.pulp_href);
        }
        let mut body = json!({ "name": name });
        if let Some(remote) = remote_href {
            body["remote"] = json!(remote);
        }
        let created: HrefResponse = self
            .post(
                server,
                &format!("{}/repositories/{}/{}/", API_ROOT, kind.plugin, kind.repo_type),
                body,
            )
            .await?;
        Ok(created.pulp_href)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(url));
    }
    let mut message = response.text().await.unwrap_or_default();
    message.truncate(MAX_ERROR_BODY);
    Err(RemoteError::Http {
        status: status.as_u16(),
        url,
        message,
    })
}

/// Filter a list request down to the resource called `name`.
fn by_name(builder: RequestBuilder, name: &str) -> RequestBuilder {
    builder.query(&[("name", name)])
}

/// Describe a repo from its current server record. Pulp cannot tell whether
/// the remote has anything new without running the sync itself, so content
/// is never reported current.
fn repo_state(current: RepositoryResponse) -> RemoteRepoState {
    RemoteRepoState {
        has_remote: current.remote.is_some(),
        content_current: false,
        latest_version_href: current.latest_version_href,
    }
}

/// Hrefs of the packages to drop. Server-filtered listings are taken as is.
fn banned_hrefs(
    pattern: &Regex,
    filtered_by_server: bool,
    packages: Vec<PackageResponse>,
) -> Vec<String> {
    packages
        .into_iter()
        .filter(|p| {
            filtered_by_server || p.name.as_deref().is_some_and(|name| pattern.is_match(name))
        })
        .map(|p| p.pulp_href)
        .collect()
}

/// Publications endpoint for a repo kind.
pub(crate) fn publication_path(kind: &RepoKind) -> String {
    let publication_type = match (kind.plugin.as_str(), kind.repo_type.as_str()) {
        ("python", _) => "pypi",
        (_, repo_type) => repo_type,
    };
    format!("{}/publications/{}/{}/", API_ROOT, kind.plugin, publication_type)
}

/// Body of a sync request: the group's sync options plus the repo's remote.
pub(crate) fn sync_body(options: &serde_json::Value, remote_href: &str) -> serde_json::Value {
    let mut body = match options {
        serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
        _ => json!({}),
    };
    body["remote"] = json!(remote_href);
    body
}

#[async_trait]
impl RepoServerClient for PulpClient {
    async fn list_repos(&self, server: &str) -> Result<Vec<RemoteRepo>, RemoteError> {
        let limit = PAGE_SIZE.to_string();
        let raw: Vec<RepositoryResponse> = self
            .get_all(
                server,
                &format!("{}/repositories/", API_ROOT),
                &[("limit", limit.as_str()), ("offset", "0")],
            )
            .await?;
        let repos = raw
            .into_iter()
            .filter_map(|r| match RepoKind::from_href(&r.pulp_href) {
                Some(kind) => Some(RemoteRepo {
                    name: r.name,
                    href: r.pulp_href,
                    kind,
                    remote_href: r.remote,
                    latest_version_href: r.latest_version_href,
                }),
                None => {
                    tracing::warn!("Skipping repo {} with unrecognised href {}", r.name, r.pulp_href);
                    None
                }
            })
            .collect();
        Ok(repos)
    }

    async fn describe_repo(
        &self,
        server: &str,
        repo: &RemoteRepo,
    ) -> Result<RemoteRepoState, RemoteError> {
        let current: RepositoryResponse = self.get(server, &repo.href).await?;
        Ok(repo_state(current))
    }

    async fn trigger(
        &self,
        server: &str,
        repo: &RemoteRepo,
        operation: &Operation,
    ) -> Result<StepStart, RemoteError> {
        match operation {
            Operation::Sync { options, .. } => {
                let current: RepositoryResponse = self.get(server, &repo.href).await?;
                let remote = current.remote.ok_or_else(|| {
                    RemoteError::InvalidConfig(format!("{} has no remote to sync from", repo.name))
                })?;
                self.start_task(
                    server,
                    &format!("{}sync/", repo.href),
                    sync_body(options, &remote),
                )
                .await
            }
            Operation::Snapshot { name } => {
                let current: RepositoryResponse = self.get(server, &repo.href).await?;
                let version = current.latest_version_href.ok_or_else(|| {
                    RemoteError::NotFound(format!("{} has no version to snapshot", repo.name))
                })?;
                let dest = self.ensure_repo(server, &repo.kind, name, None).await?;
                let mut body = json!({
                    "config": [{ "source_repo_version": version, "dest_repo": dest }]
                });
                if repo.kind.plugin == "deb" {
                    body["structured"] = json!(true);
                }
                self.start_task(server, &format!("{}/{}/copy/", API_ROOT, repo.kind.plugin), body)
                    .await
            }
            Operation::Remove => match self.find_distribution(server, &repo.name).await? {
                Some(distribution) => self.delete(server, &distribution.pulp_href).await,
                None => Ok(StepStart::Skipped),
            },
            Operation::RemoveContent { content_hrefs, .. } => {
                let current: RepositoryResponse = self.get(server, &repo.href).await?;
                let version = current.latest_version_href.ok_or_else(|| {
                    RemoteError::NotFound(format!("{} has no version to modify", repo.name))
                })?;
                self.modify(server, &repo.href, &version, content_hrefs.clone())
                    .await
            }
        }
    }

    async fn start_follow_up(
        &self,
        server: &str,
        repo: &RemoteRepo,
        operation: &Operation,
        step: FollowUpStep,
    ) -> Result<StepStart, RemoteError> {
        match (step, operation) {
            (
                FollowUpStep::RemoveBannedPackages,
                Operation::Sync {
                    banned_packages: Some(policy),
                    ..
                },
            ) => self.remove_banned_packages(server, repo, policy).await,
            (FollowUpStep::Publish, Operation::Sync { .. }) => {
                self.publish(server, &repo.kind, &repo.href, false).await
            }
            (FollowUpStep::Publish, Operation::Snapshot { name }) => {
                let snapshot = self
                    .find_repo(server, &repo.kind, name)
                    .await?
                    .ok_or_else(|| RemoteError::NotFound(format!("snapshot repo {}", name)))?;
                self.publish(server, &repo.kind, &snapshot.pulp_href, false)
                    .await
            }
            (FollowUpStep::Publish, Operation::RemoveContent { force_publish, .. }) => {
                self.publish(server, &repo.kind, &repo.href, *force_publish)
                    .await
            }
            (FollowUpStep::DeleteRepository, Operation::Remove) => {
                self.delete(server, &repo.href).await
            }
            (FollowUpStep::DeleteRemote, Operation::Remove) => match &repo.remote_href {
                Some(remote) => self.delete(server, remote).await,
                None => Ok(StepStart::Skipped),
            },
            (step, operation) => Err(RemoteError::InvalidConfig(format!(
                "{:?} does not apply to a {}",
                step,
                operation.label()
            ))),
        }
    }

    async fn poll_task(
        &self,
        server: &str,
        handle: &RemoteTaskHandle,
    ) -> Result<TaskPoll, RemoteError> {
        let task: TaskResponse = self.get(server, &handle.0).await?;
        Ok(task.into())
    }

    async fn cancel_task(
        &self,
        server: &str,
        handle: &RemoteTaskHandle,
    ) -> Result<(), RemoteError> {
        let builder = self
            .request(server, Method::PATCH, &handle.0)
            .await?
            .json(&json!({ "state": "canceled" }));
        let response = builder.send().await?;
        match check_status(response).await {
            Ok(_) => Ok(()),
            // The task finished before the cancel landed.
            Err(RemoteError::Http { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn register_mirror(
        &self,
        server: &str,
        source_server: &str,
        repo: &RemoteRepo,
    ) -> Result<(), RemoteError> {
        if self.find_repo(server, &repo.kind, &repo.name).await?.is_some() {
            return Ok(());
        }

        let url = format!(
            "{}://{}/pulp/content/{}/",
            self.scheme, source_server, repo.name
        );
        let remotes = format!("{}/remotes/{}/{}/", API_ROOT, repo.kind.plugin, repo.kind.repo_type);
        let remote: HrefResponse = self
            .post(server, &remotes, json!({ "name": repo.name, "url": url }))
            .await?;
        self.ensure_repo(server, &repo.kind, &repo.name, Some(&remote.pulp_href))
            .await?;
        tracing::info!(
            "Registered {} on {} mirroring {}",
            repo.name,
            server,
            source_server
        );
        Ok(())
    }
}
