//! Global mesh configuration.
//!
//! The control plane mounts one JSON document with cluster-wide settings.
//! This controller only reads the control-plane namespace and the identity
//! section; an absent identity section means the operator disabled the
//! feature and the process exits cleanly without serving.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use strand_identity::Validity;

/// Issued leaves default to a 24 hour lifetime.
const DEFAULT_ISSUANCE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// The mesh's global configuration document.
#[derive(Debug, Deserialize)]
pub struct GlobalConfig {
    /// Namespace the control plane runs in.
    pub namespace: String,
    /// Identity settings; `null` or absent when the feature is disabled.
    #[serde(default)]
    pub identity: Option<IdentityConfig>,
}

/// Identity settings from the global configuration.
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    /// DNS root of the mesh, e.g. `cluster.local`.
    pub trust_domain: String,
    /// PEM bundle of trusted root certificates.
    pub trust_anchors_pem: String,
    /// Lifetime of issued leaves in seconds; 24 hours when absent.
    #[serde(default)]
    pub issuance_lifetime_secs: Option<u64>,
    /// Clock-skew allowance in seconds; absent defers to the CA default.
    #[serde(default)]
    pub clock_skew_allowance_secs: Option<u64>,
}

impl IdentityConfig {
    /// Validity policy for issued certificates.
    pub fn validity(&self) -> Validity {
        Validity {
            lifetime: self
                .issuance_lifetime_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ISSUANCE_LIFETIME),
            clock_skew_allowance: self
                .clock_skew_allowance_secs
                .map(Duration::from_secs)
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// Errors loading the global configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Loads the global configuration from `path`.
pub fn load(path: &Path) -> Result<GlobalConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
