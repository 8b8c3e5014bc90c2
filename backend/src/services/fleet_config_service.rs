//! Fleet configuration: servers, repo groups and their schedules.
//!
//! The YAML sync config is parsed into loosely-typed raw structs and then
//! validated once into a [`FleetConfig`]. Validation collects every problem
//! it finds and fails the load as a whole, so the scheduler and worker only
//! ever see a consistent, fully-typed snapshot.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::watch;

use crate::error::{AppError, Result};
use crate::models::job_run::{JobSpec, TaskKind};
use crate::models::server::{Server, ServerRole, TlsPolicy};
use crate::services::repo_selector_service::RepoSelector;
use crate::services::scheduler_service::CronSchedule;

const DEFAULT_SNAPSHOT_RUNTIME: Duration = Duration::from_secs(6 * 3600);
const DEFAULT_REGISTRATION_RUNTIME: Duration = Duration::from_secs(3600);
const DEFAULT_SNAPSHOT_PREFIX: &str = "snap";
const DEFAULT_REMOVAL_RUNTIME: Duration = Duration::from_secs(3600);

fn server_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9.\-_]+(:[0-9]+)?$").unwrap())
}

fn group_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9\-_]+$").unwrap())
}

// ── Raw YAML shape ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFleet {
    #[serde(default)]
    credentials: BTreeMap<String, CredentialGroup>,
    #[serde(default)]
    repo_groups: BTreeMap<String, RawRepoGroup>,
    #[serde(default)]
    pulp_servers: BTreeMap<String, RawServer>,
    #[serde(default)]
    content_policy: ContentPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRepoGroup {
    regex_include: Option<String>,
    regex_exclude: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    credentials: String,
    #[serde(default)]
    role: ServerRole,
    pulp_primary: Option<String>,
    #[serde(default)]
    tls: TlsPolicy,
    repo_config_registration: Option<RawRegistration>,
    #[serde(default)]
    repo_groups: BTreeMap<String, RawServerGroup>,
    snapshot_support: Option<RawSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServerGroup {
    schedule: Option<String>,
    max_concurrent_syncs: Option<i64>,
    max_runtime: Option<RawDuration>,
    pulp_primary: Option<String>,
    #[serde(default)]
    sync_options: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSnapshot {
    max_concurrent_snapshots: Option<i64>,
    schedule: Option<String>,
    max_runtime: Option<RawDuration>,
    snapshot_prefix: Option<String>,
    regex_include: Option<String>,
    regex_exclude: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegistration {
    schedule: Option<String>,
    max_runtime: Option<RawDuration>,
    regex_include: Option<String>,
    regex_exclude: Option<String>,
}

/// A bare integer (seconds) or a human-readable duration such as `3h`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

// ── Validated configuration ─────────────────────────────────────────────────

/// Fleet-wide rules for content pulled from outside sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentPolicy {
    /// Packages matching this are removed from synced repos before publishing.
    pub banned_package_regex: Option<String>,
    /// Remotes pointing into these domains are exempt from the ban.
    #[serde(default)]
    pub internal_domains: Vec<String>,
}

/// Credential group: a username and the env var holding its password.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialGroup {
    pub username: String,
    pub password_env: String,
}

/// A repo group applied to one server.
#[derive(Debug, Clone)]
pub struct RepoGroupConfig {
    pub name: String,
    pub selector: RepoSelector,
    /// Unscheduled groups only run when enqueued ad hoc.
    pub schedule: Option<CronSchedule>,
    pub max_concurrent_syncs: usize,
    pub max_runtime: Duration,
    pub pulp_primary: Option<String>,
    pub sync_options: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub max_concurrent_snapshots: usize,
    pub schedule: Option<CronSchedule>,
    pub max_runtime: Duration,
    pub snapshot_prefix: String,
    pub selector: RepoSelector,
}

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub schedule: Option<CronSchedule>,
    pub max_runtime: Duration,
    pub selector: RepoSelector,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server: Server,
    pub repo_groups: BTreeMap<String, RepoGroupConfig>,
    pub snapshot: Option<SnapshotConfig>,
    pub registration: Option<RegistrationConfig>,
}

/// Everything needed to create a job run for one task.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub server: String,
    pub task: TaskKind,
    pub schedule: Option<CronSchedule>,
    pub max_runtime: Duration,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub credentials: BTreeMap<String, CredentialGroup>,
    pub servers: BTreeMap<String, ServerConfig>,
    pub content_policy: ContentPolicy,
}

impl FleetConfig {
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Every task on every server, scheduled or not.
    pub fn task_definitions(&self) -> Vec<TaskDefinition> {
        let mut tasks = Vec::new();
        for entry in self.servers.values() {
            let name = &entry.server.name;
            for group in entry.repo_groups.values() {
                tasks.push(TaskDefinition {
                    server: name.clone(),
                    task: TaskKind::RepoGroupSync {
                        group: group.name.clone(),
                    },
                    schedule: group.schedule.clone(),
                    max_runtime: group.max_runtime,
                    spec: JobSpec {
                        regex_include: group.selector.include_pattern().map(str::to_string),
                        regex_exclude: group.selector.exclude_pattern().map(str::to_string),
                        max_concurrent: group.max_concurrent_syncs,
                        upstream: group
                            .pulp_primary
                            .clone()
                            .or_else(|| entry.server.pulp_primary.clone()),
                        sync_options: group.sync_options.clone(),
                        banned_package_regex: self.content_policy.banned_package_regex.clone(),
                        internal_domains: self.content_policy.internal_domains.clone(),
                        ..JobSpec::default()
                    },
                });
            }
            if let Some(reg) = &entry.registration {
                tasks.push(TaskDefinition {
                    server: name.clone(),
                    task: TaskKind::ConfigRegistration,
                    schedule: reg.schedule.clone(),
                    max_runtime: reg.max_runtime,
                    spec: JobSpec {
                        regex_include: reg.selector.include_pattern().map(str::to_string),
                        regex_exclude: reg.selector.exclude_pattern().map(str::to_string),
                        max_concurrent: 1,
                        upstream: entry.server.pulp_primary.clone(),
                        ..JobSpec::default()
                    },
                });
            }
            if let Some(snap) = &entry.snapshot {
                tasks.push(TaskDefinition {
                    server: name.clone(),
                    task: TaskKind::Snapshot,
                    schedule: snap.schedule.clone(),
                    max_runtime: snap.max_runtime,
                    spec: JobSpec {
                        regex_include: snap.selector.include_pattern().map(str::to_string),
                        regex_exclude: snap.selector.exclude_pattern().map(str::to_string),
                        max_concurrent: snap.max_concurrent_snapshots,
                        snapshot_prefix: Some(snap.snapshot_prefix.clone()),
                        ..JobSpec::default()
                    },
                });
            }
        }
        tasks
    }

    /// Tasks with a cron schedule, evaluated by the scheduler each tick.
    pub fn scheduled_tasks(&self) -> Vec<TaskDefinition> {
        self.task_definitions()
            .into_iter()
            .filter(|t| t.schedule.is_some())
            .collect()
    }

    /// Look up one task for an ad-hoc run.
    pub fn task_definition(&self, server: &str, task: &TaskKind) -> Result<TaskDefinition> {
        self.require_server(server)?;
        self.task_definitions()
            .into_iter()
            .find(|t| t.server == server && &t.task == task)
            .ok_or_else(|| AppError::NotFound(format!("task {} on server {}", task, server)))
    }

    /// One-off removal of the repos matching `include`/`exclude` on `server`.
    pub fn removal_definition(
        &self,
        server: &str,
        include: Option<&str>,
        exclude: Option<&str>,
        dry_run: bool,
    ) -> Result<TaskDefinition> {
        self.require_server(server)?;
        if include.is_none() && exclude.is_none() {
            return Err(AppError::Validation(
                "repo removal needs regex_include or regex_exclude".to_string(),
            ));
        }
        RepoSelector::from_patterns(include, exclude)?;
        Ok(TaskDefinition {
            server: server.to_string(),
            task: TaskKind::RepoRemoval,
            schedule: None,
            max_runtime: DEFAULT_REMOVAL_RUNTIME,
            spec: JobSpec {
                regex_include: include.map(str::to_string),
                regex_exclude: exclude.map(str::to_string),
                max_concurrent: 1,
                dry_run,
                ..JobSpec::default()
            },
        })
    }

    /// One-off removal of content units from `repo`'s latest version.
    pub fn remove_content_definition(
        &self,
        server: &str,
        repo: &str,
        content_hrefs: Vec<String>,
        force_publish: bool,
    ) -> Result<TaskDefinition> {
        self.require_server(server)?;
        if content_hrefs.is_empty() {
            return Err(AppError::Validation(
                "content removal needs at least one content href".to_string(),
            ));
        }
        Ok(TaskDefinition {
            server: server.to_string(),
            task: TaskKind::RemoveContent {
                repo: repo.to_string(),
            },
            schedule: None,
            max_runtime: DEFAULT_REMOVAL_RUNTIME,
            spec: JobSpec {
                max_concurrent: 1,
                content_hrefs,
                force_publish,
                ..JobSpec::default()
            },
        })
    }

    fn require_server(&self, server: &str) -> Result<()> {
        if self.servers.contains_key(server) {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("server {}", server)))
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Read and validate the fleet config at `path`.
pub fn load_fleet_config(path: &Path) -> Result<FleetConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("cannot read sync config {}: {}", path.display(), e))
    })?;
    parse_fleet_config(&raw)
}

/// Parse and validate a fleet config document.
pub fn parse_fleet_config(raw: &str) -> Result<FleetConfig> {
    let raw: RawFleet = serde_yaml::from_str(raw)?;
    validate(raw)
}

fn validate(raw: RawFleet) -> Result<FleetConfig> {
    let mut errors: Vec<String> = Vec::new();

    for name in raw.credentials.keys() {
        if !group_name_re().is_match(name) {
            errors.push(format!("credential group name '{}' is invalid", name));
        }
    }

    if let Some(pattern) = &raw.content_policy.banned_package_regex {
        if let Err(e) = Regex::new(pattern) {
            errors.push(format!("content_policy: banned_package_regex: {}", e));
        }
    }

    let mut selectors: BTreeMap<String, RepoSelector> = BTreeMap::new();
    for (name, group) in &raw.repo_groups {
        if !group_name_re().is_match(name) {
            errors.push(format!("repo group name '{}' is invalid", name));
        }
        match RepoSelector::from_patterns(
            group.regex_include.as_deref(),
            group.regex_exclude.as_deref(),
        ) {
            Ok(selector) => {
                selectors.insert(name.clone(), selector);
            }
            Err(e) => errors.push(format!("repo group {}: {}", name, e)),
        }
    }

    let mut servers = BTreeMap::new();
    for (name, server) in &raw.pulp_servers {
        let ctx = format!("server {}", name);
        if !server_name_re().is_match(name) {
            errors.push(format!("{}: name must match host[:port]", ctx));
        }
        if !raw.credentials.contains_key(&server.credentials) {
            errors.push(format!(
                "{}: unknown credential group '{}'",
                ctx, server.credentials
            ));
        }
        if let Some(primary) = &server.pulp_primary {
            check_primary(&raw, name, primary, &ctx, &mut errors);
        }

        let mut repo_groups = BTreeMap::new();
        for (group_name, group) in &server.repo_groups {
            let gctx = format!("{} repo group {}", ctx, group_name);
            let Some(selector) = selectors.get(group_name) else {
                if !raw.repo_groups.contains_key(group_name) {
                    errors.push(format!("{}: not defined under repo_groups", gctx));
                }
                continue;
            };
            if let Some(primary) = &group.pulp_primary {
                check_primary(&raw, name, primary, &gctx, &mut errors);
            }
            let schedule = parse_schedule_field(group.schedule.as_deref(), &gctx, &mut errors);
            let max_concurrent =
                parse_limit(group.max_concurrent_syncs, "max_concurrent_syncs", &gctx, &mut errors);
            let max_runtime = match &group.max_runtime {
                Some(d) => parse_duration_field(d, &gctx, &mut errors),
                None => {
                    errors.push(format!("{}: max_runtime is required", gctx));
                    None
                }
            };
            if !matches!(
                group.sync_options,
                serde_json::Value::Null | serde_json::Value::Object(_)
            ) {
                errors.push(format!("{}: sync_options must be a map", gctx));
            }
            if let (Some(max_concurrent), Some(max_runtime)) = (max_concurrent, max_runtime) {
                repo_groups.insert(
                    group_name.clone(),
                    RepoGroupConfig {
                        name: group_name.clone(),
                        selector: selector.clone(),
                        schedule: schedule.unwrap_or(None),
                        max_concurrent_syncs: max_concurrent,
                        max_runtime,
                        pulp_primary: group.pulp_primary.clone(),
                        sync_options: group.sync_options.clone(),
                    },
                );
            }
        }

        let snapshot = server.snapshot_support.as_ref().and_then(|snap| {
            let sctx = format!("{} snapshot_support", ctx);
            let schedule = parse_schedule_field(snap.schedule.as_deref(), &sctx, &mut errors);
            let limit = parse_limit(
                snap.max_concurrent_snapshots,
                "max_concurrent_snapshots",
                &sctx,
                &mut errors,
            );
            let max_runtime = match &snap.max_runtime {
                Some(d) => parse_duration_field(d, &sctx, &mut errors),
                None => Some(DEFAULT_SNAPSHOT_RUNTIME),
            };
            let prefix = snap
                .snapshot_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_PREFIX.to_string());
            if prefix.trim().is_empty() {
                errors.push(format!("{}: snapshot_prefix must not be empty", sctx));
            }
            let selector = selector_field(
                snap.regex_include.as_deref(),
                snap.regex_exclude.as_deref(),
                &sctx,
                &mut errors,
            );
            Some(SnapshotConfig {
                max_concurrent_snapshots: limit?,
                schedule: schedule?,
                max_runtime: max_runtime?,
                snapshot_prefix: prefix,
                selector: selector?,
            })
        });

        let registration = server.repo_config_registration.as_ref().and_then(|reg| {
            let rctx = format!("{} repo_config_registration", ctx);
            let schedule = parse_schedule_field(reg.schedule.as_deref(), &rctx, &mut errors);
            let max_runtime = match &reg.max_runtime {
                Some(d) => parse_duration_field(d, &rctx, &mut errors),
                None => Some(DEFAULT_REGISTRATION_RUNTIME),
            };
            let selector = selector_field(
                reg.regex_include.as_deref(),
                reg.regex_exclude.as_deref(),
                &rctx,
                &mut errors,
            );
            Some(RegistrationConfig {
                schedule: schedule?,
                max_runtime: max_runtime?,
                selector: selector?,
            })
        });

        servers.insert(
            name.clone(),
            ServerConfig {
                server: Server {
                    name: name.clone(),
                    role: server.role,
                    pulp_primary: server.pulp_primary.clone(),
                    credentials: server.credentials.clone(),
                    tls: server.tls.clone(),
                },
                repo_groups,
                snapshot,
                registration,
            },
        );
    }

    if !errors.is_empty() {
        return Err(AppError::Validation(errors.join("; ")));
    }

    Ok(FleetConfig {
        credentials: raw.credentials,
        servers,
        content_policy: raw.content_policy,
    })
}

fn check_primary(raw: &RawFleet, name: &str, primary: &str, ctx: &str, errors: &mut Vec<String>) {
    if primary == name {
        errors.push(format!("{}: pulp_primary cannot reference itself", ctx));
        return;
    }
    match raw.pulp_servers.get(primary) {
        Some(target) if target.role == ServerRole::Primary => {}
        Some(_) => errors.push(format!(
            "{}: pulp_primary '{}' is not a primary",
            ctx, primary
        )),
        None => errors.push(format!("{}: unknown pulp_primary '{}'", ctx, primary)),
    }
}

/// `None` when the field failed validation; `Some(None)` when it is absent.
fn parse_schedule_field(
    expr: Option<&str>,
    ctx: &str,
    errors: &mut Vec<String>,
) -> Option<Option<CronSchedule>> {
    match expr {
        None => Some(None),
        Some(expr) => match CronSchedule::parse(expr) {
            Ok(schedule) => Some(Some(schedule)),
            Err(e) => {
                errors.push(format!("{}: {}", ctx, e));
                None
            }
        },
    }
}

fn parse_limit(
    value: Option<i64>,
    field: &str,
    ctx: &str,
    errors: &mut Vec<String>,
) -> Option<usize> {
    match value {
        Some(v) if v >= 1 => Some(v as usize),
        Some(v) => {
            errors.push(format!("{}: {} must be >= 1, got {}", ctx, field, v));
            None
        }
        None => {
            errors.push(format!("{}: {} is required", ctx, field));
            None
        }
    }
}

fn parse_duration_field(
    raw: &RawDuration,
    ctx: &str,
    errors: &mut Vec<String>,
) -> Option<Duration> {
    match parse_duration(raw) {
        Ok(d) => Some(d),
        Err(e) => {
            errors.push(format!("{}: max_runtime {}", ctx, e));
            None
        }
    }
}

fn selector_field(
    include: Option<&str>,
    exclude: Option<&str>,
    ctx: &str,
    errors: &mut Vec<String>,
) -> Option<RepoSelector> {
    match RepoSelector::from_patterns(include, exclude) {
        Ok(selector) => Some(selector),
        Err(e) => {
            errors.push(format!("{}: {}", ctx, e));
            None
        }
    }
}

fn parse_duration(raw: &RawDuration) -> std::result::Result<Duration, String> {
    let duration = match raw {
        RawDuration::Seconds(secs) => Duration::from_secs(*secs),
        RawDuration::Text(text) => {
            let text = text.trim();
            match text.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => humantime::parse_duration(text)
                    .map_err(|e| format!("'{}' is not a duration: {}", text, e))?,
            }
        }
    };
    if duration.is_zero() {
        return Err("must be greater than zero".to_string());
    }
    Ok(duration)
}

// ── Reloading ───────────────────────────────────────────────────────────────

/// Periodically re-read the fleet config and publish valid snapshots.
///
/// An invalid file is logged and skipped; the last good config stays live.
pub fn spawn_reloader(
    path: std::path::PathBuf,
    interval: Duration,
    sender: watch::Sender<Arc<FleetConfig>>,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match load_fleet_config(&path) {
                Ok(fleet) => {
                    tracing::debug!(
                        "Reloaded sync config from {} ({} servers)",
                        path.display(),
                        fleet.servers.len()
                    );
                    sender.send_replace(Arc::new(fleet));
                }
                Err(e) => {
                    tracing::warn!("Keeping previous sync config, reload failed: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
content_policy:
  banned_package_regex: "^(nmap|sslstrip)$"
  internal_domains: [corp.example.com]
credentials:
  ops:
    username: sync-bot
    password_env: PULP_PASSWORD
repo_groups:
  el9-base:
    regex_include: "^el9-"
    regex_exclude: "-debug$"
  ext:
    regex_include: "^ext-"
pulp_servers:
  pulp1.example.com:
    credentials: ops
    repo_groups:
      el9-base:
        schedule: "0 2 * * *"
        max_concurrent_syncs: 2
        max_runtime: 3h
        sync_options:
          mirror: true
      ext:
        max_concurrent_syncs: 1
        max_runtime: 5400
    snapshot_support:
      max_concurrent_snapshots: 2
      schedule: "0 0 1 * *"
  pulp2.example.com:8443:
    credentials: ops
    role: secondary
    pulp_primary: pulp1.example.com
    tls:
      verify: false
    repo_config_registration:
      schedule: "*/30 * * * *"
      regex_include: "^el9-"
    repo_groups:
      el9-base:
        schedule: "30 2 * * *"
        max_concurrent_syncs: 4
        max_runtime: 90m
"#;

    #[test]
    fn test_parse_valid_fleet() {
        let fleet = parse_fleet_config(VALID).unwrap();
        assert_eq!(fleet.servers.len(), 2);

        let pulp1 = fleet.server("pulp1.example.com").unwrap();
        assert_eq!(pulp1.server.role, ServerRole::Primary);
        let group = &pulp1.repo_groups["el9-base"];
        assert_eq!(group.max_concurrent_syncs, 2);
        assert_eq!(group.max_runtime, Duration::from_secs(3 * 3600));
        assert_eq!(group.selector.include_pattern(), Some("^el9-"));
        assert!(group.schedule.is_some());
        assert_eq!(group.sync_options["mirror"], serde_json::json!(true));

        let ext = &pulp1.repo_groups["ext"];
        assert!(ext.schedule.is_none());
        assert_eq!(ext.max_runtime, Duration::from_secs(5400));

        let snap = pulp1.snapshot.as_ref().unwrap();
        assert_eq!(snap.snapshot_prefix, "snap");
        assert_eq!(snap.max_runtime, DEFAULT_SNAPSHOT_RUNTIME);

        let pulp2 = fleet.server("pulp2.example.com:8443").unwrap();
        assert!(pulp2.server.is_secondary());
        assert!(!pulp2.server.tls.verify);
        assert_eq!(pulp2.repo_groups["el9-base"].max_runtime, Duration::from_secs(5400));
        assert!(pulp2.registration.is_some());
    }

    #[test]
    fn test_scheduled_tasks_skip_unscheduled_groups() {
        let fleet = parse_fleet_config(VALID).unwrap();
        let keys: Vec<(String, String)> = fleet
            .scheduled_tasks()
            .into_iter()
            .map(|t| (t.server, t.task.task_key()))
            .collect();
        assert!(keys.contains(&("pulp1.example.com".into(), "repo_group_sync:el9-base".into())));
        assert!(keys.contains(&("pulp1.example.com".into(), "snapshot".into())));
        assert!(keys.contains(&("pulp2.example.com:8443".into(), "config_registration".into())));
        assert!(!keys.contains(&("pulp1.example.com".into(), "repo_group_sync:ext".into())));
    }

    #[test]
    fn test_secondary_group_inherits_upstream() {
        let fleet = parse_fleet_config(VALID).unwrap();
        let def = fleet
            .task_definition(
                "pulp2.example.com:8443",
                &TaskKind::RepoGroupSync {
                    group: "el9-base".into(),
                },
            )
            .unwrap();
        assert_eq!(def.spec.upstream.as_deref(), Some("pulp1.example.com"));
        assert_eq!(def.spec.max_concurrent, 4);
        assert_eq!(def.spec.regex_exclude.as_deref(), Some("-debug$"));
        assert_eq!(
            def.spec.banned_package_regex.as_deref(),
            Some("^(nmap|sslstrip)$")
        );
        assert_eq!(def.spec.internal_domains, vec!["corp.example.com"]);
    }

    #[test]
    fn test_removal_needs_a_pattern() {
        let fleet = parse_fleet_config(VALID).unwrap();
        let err = fleet
            .removal_definition("pulp1.example.com", None, None, true)
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(fleet
            .removal_definition("pulp1.example.com", Some("(bad"), None, true)
            .is_err());
        assert!(matches!(
            fleet.removal_definition("nope.example.com", Some("^x"), None, true),
            Err(AppError::NotFound(_))
        ));

        let def = fleet
            .removal_definition("pulp1.example.com", None, Some("^keep-"), false)
            .unwrap();
        assert_eq!(def.task, TaskKind::RepoRemoval);
        assert!(!def.spec.dry_run);
        assert_eq!(def.spec.max_concurrent, 1);
        assert!(def.schedule.is_none());
    }

    #[test]
    fn test_remove_content_definition() {
        let fleet = parse_fleet_config(VALID).unwrap();
        assert!(fleet
            .remove_content_definition("pulp1.example.com", "el9-baseos", Vec::new(), false)
            .is_err());
        let def = fleet
            .remove_content_definition(
                "pulp1.example.com",
                "el9-baseos",
                vec!["/pulp/api/v3/content/rpm/packages/1/".into()],
                true,
            )
            .unwrap();
        assert_eq!(def.task.task_key(), "remove_content:el9-baseos");
        assert!(def.spec.force_publish);
    }

    #[test]
    fn test_invalid_banned_package_regex() {
        let raw = r#"
content_policy:
  banned_package_regex: "(unclosed"
"#;
        let msg = parse_fleet_config(raw).unwrap_err().to_string();
        assert!(msg.contains("banned_package_regex"), "{}", msg);
    }

    #[test]
    fn test_unscheduled_group_is_available_ad_hoc() {
        let fleet = parse_fleet_config(VALID).unwrap();
        let def = fleet
            .task_definition(
                "pulp1.example.com",
                &TaskKind::RepoGroupSync { group: "ext".into() },
            )
            .unwrap();
        assert!(def.schedule.is_none());
        assert!(fleet
            .task_definition("nope.example.com", &TaskKind::Snapshot)
            .is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let raw = r#"
credentials:
  ops:
    username: a
    password_env: B
repo_groups:
  Bad_Group:
    regex_include: "(unclosed"
pulp_servers:
  UPPER.example.com:
    credentials: missing
    repo_groups:
      Bad_Group:
        schedule: "not a cron"
        max_concurrent_syncs: 0
        max_runtime: soon
"#;
        let err = parse_fleet_config(raw).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("repo group name 'Bad_Group' is invalid"), "{}", msg);
        assert!(msg.contains("regex_include"), "{}", msg);
        assert!(msg.contains("name must match host[:port]"), "{}", msg);
        assert!(msg.contains("unknown credential group 'missing'"), "{}", msg);
    }

    #[test]
    fn test_validation_rejects_bad_limits_and_durations() {
        let raw = r#"
credentials:
  ops: { username: a, password_env: B }
repo_groups:
  ext: {}
pulp_servers:
  pulp1:
    credentials: ops
    repo_groups:
      ext:
        schedule: "every day"
        max_concurrent_syncs: 0
        max_runtime: soon
"#;
        let msg = parse_fleet_config(raw).unwrap_err().to_string();
        assert!(msg.contains("max_concurrent_syncs must be >= 1"), "{}", msg);
        assert!(msg.contains("'soon' is not a duration"), "{}", msg);
        assert!(msg.contains("invalid cron expression"), "{}", msg);
    }

    #[test]
    fn test_validation_rejects_bad_primary_references() {
        let raw = r#"
credentials:
  ops: { username: a, password_env: B }
pulp_servers:
  pulp1:
    credentials: ops
    pulp_primary: pulp1
  pulp2:
    credentials: ops
    role: secondary
    pulp_primary: pulp3
  pulp3:
    credentials: ops
    role: secondary
    pulp_primary: pulp2
"#;
        let msg = parse_fleet_config(raw).unwrap_err().to_string();
        assert!(msg.contains("cannot reference itself"), "{}", msg);
        assert!(msg.contains("'pulp3' is not a primary"), "{}", msg);
        assert!(msg.contains("'pulp2' is not a primary"), "{}", msg);
    }

    #[test]
    fn test_undefined_group_reference() {
        let raw = r#"
credentials:
  ops: { username: a, password_env: B }
pulp_servers:
  pulp1:
    credentials: ops
    repo_groups:
      ghost:
        max_concurrent_syncs: 1
        max_runtime: 1h
"#;
        let msg = parse_fleet_config(raw).unwrap_err().to_string();
        assert!(msg.contains("not defined under repo_groups"), "{}", msg);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let raw = r#"
pulp_servers:
  pulp1:
    credentials: ops
    max_concurent_syncs: 3
"#;
        assert!(matches!(parse_fleet_config(raw), Err(AppError::Yaml(_))));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(
            parse_duration(&RawDuration::Seconds(90)).unwrap(),
            Duration::from_secs(90)
        );
        assert_eq!(
            parse_duration(&RawDuration::Text("120".into())).unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            parse_duration(&RawDuration::Text("2h 30m".into())).unwrap(),
            Duration::from_secs(9000)
        );
        assert!(parse_duration(&RawDuration::Seconds(0)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();
        let fleet = load_fleet_config(file.path()).unwrap();
        assert_eq!(fleet.credentials["ops"].username, "sync-bot");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = load_fleet_config(Path::new("/nonexistent/sync_config.yml")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
