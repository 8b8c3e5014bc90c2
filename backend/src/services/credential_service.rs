//! Credential resolution for repository servers.
//!
//! Secrets are never stored in the fleet config itself: each credential
//! group names the environment variable that holds its password.

use std::collections::HashMap;
use std::env;

use async_trait::async_trait;

use crate::services::fleet_config_service::FleetConfig;
use crate::services::pulp_client::RemoteError;

/// Username and secret used to authenticate against a server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

redacted_debug!(Credentials {
    show username,
    redact password,
});

/// Resolves the credentials to use for a server.
///
/// Callers wrap each lookup in their own timeout; an implementation backed
/// by a remote secret store may retry internally.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, server: &str) -> Result<Credentials, RemoteError>;
}

#[derive(Debug, Clone)]
struct CredentialSource {
    username: String,
    password_env: String,
}

/// Reads passwords from the environment variables named in the fleet config.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialResolver {
    by_server: HashMap<String, CredentialSource>,
}

impl EnvCredentialResolver {
    pub fn from_fleet(fleet: &FleetConfig) -> Self {
        let by_server = fleet
            .servers
            .values()
            .filter_map(|server| {
                let group = fleet.credentials.get(&server.server.credentials)?;
                Some((
                    server.server.name.clone(),
                    CredentialSource {
                        username: group.username.clone(),
                        password_env: group.password_env.clone(),
                    },
                ))
            })
            .collect();
        Self { by_server }
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, server: &str) -> Result<Credentials, RemoteError> {
        let source = self.by_server.get(server).ok_or_else(|| {
            RemoteError::InvalidConfig(format!("no credential group for server {}", server))
        })?;
        let password = env::var(&source.password_env).map_err(|_| {
            RemoteError::InvalidConfig(format!(
                "credential variable {} is not set",
                source.password_env
            ))
        })?;
        Ok(Credentials {
            username: source.username.clone(),
            password,
        })
    }
}

/// Fixed credentials for every server; handy for tests and local tooling.
#[derive(Debug, Clone)]
pub struct StaticCredentialResolver(pub Credentials);

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, _server: &str) -> Result<Credentials, RemoteError> {
        Ok(self.0.clone())
    }
}
