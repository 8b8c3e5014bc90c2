//! Repository-server model.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whether a server pulls from the Internet or mirrors another server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    #[default]
    Primary,
    Secondary,
}

/// TLS policy applied to every request sent to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPolicy {
    #[serde(default = "default_verify")]
    pub verify: bool,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

fn default_verify() -> bool {
    true
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            verify: true,
            ca_cert: None,
        }
    }
}

/// A managed repository-server endpoint.
///
/// `name` is the `host[:port]` the server is reached at. A secondary's
/// `pulp_primary` always names a known primary once the fleet config has
/// been validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub name: String,
    pub role: ServerRole,
    pub pulp_primary: Option<String>,
    pub credentials: String,
    pub tls: TlsPolicy,
}

impl Server {
    pub fn is_secondary(&self) -> bool {
        self.role == ServerRole::Secondary
    }
}
