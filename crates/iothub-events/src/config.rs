//! Client configuration, loaded from YAML or built from a connection string.
//!
//! ```yaml
//! host_name: my-hub.azure-devices.net
//! shared_access_key_name: service
//! shared_access_key: <base64>
//! consumer_group: analytics      # optional, defaults to $Default
//! trust_roots: certs/roots.pem   # optional, relative to this file
//! renewal:
//!   token_lifetime_secs: 3600
//!   renewal_margin_secs: 600
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::cbs::RenewalPolicy;
use crate::sas::SharedAccessKey;
use crate::transport::{AMQPS_PORT, SecurityConfig};

pub(crate) const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;
pub(crate) const DEFAULT_RENEWAL_MARGIN_SECS: u64 = 600;

const PEM_CERTIFICATE: &str = "-----BEGIN CERTIFICATE-----";

fn default_port() -> u16 {
    AMQPS_PORT
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// IoT hub entry host, e.g. `my-hub.azure-devices.net`.
    pub host_name: String,
    pub shared_access_key_name: String,
    /// Base64-encoded signing key.
    pub shared_access_key: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Used when the subscribe options name no group.
    pub consumer_group: Option<String>,
    /// PEM bundle used instead of the platform trust store.
    pub trust_roots: Option<PathBuf>,
    #[serde(default)]
    pub renewal: RenewalConfig,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<redacted>")
            .field("port", &self.port)
            .field("consumer_group", &self.consumer_group)
            .field("trust_roots", &self.trust_roots)
            .field("renewal", &self.renewal)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    /// Validity of each put token.
    pub token_lifetime_secs: u64,
    /// How long before expiry the next token is put.
    pub renewal_margin_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            token_lifetime_secs: DEFAULT_TOKEN_LIFETIME_SECS,
            renewal_margin_secs: DEFAULT_RENEWAL_MARGIN_SECS,
        }
    }
}

/// Load and validate a client config from a YAML file.
///
/// A relative `trust_roots` path is resolved against the config file's parent directory.
pub async fn load(path: &Path) -> Result<ClientConfig, Error> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ClientConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl ClientConfig {
    /// Build a config from an IoT hub connection string, with defaults for
    /// everything else.
    pub fn from_connection_string(s: &str) -> Result<Self, Error> {
        let key = SharedAccessKey::from_connection_string(s)?;
        let config = Self {
            host_name: key.host_name,
            shared_access_key_name: key.key_name,
            shared_access_key: key.key,
            port: AMQPS_PORT,
            consumer_group: None,
            trust_roots: None,
            renewal: RenewalConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.host_name.trim().is_empty() {
            return Err(Error::Config("host_name is empty".into()));
        }
        if self.shared_access_key_name.trim().is_empty() {
            return Err(Error::Config("shared_access_key_name is empty".into()));
        }
        BASE64.decode(&self.shared_access_key)?;
        if self.consumer_group.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config("consumer_group is empty".into()));
        }
        self.renewal_policy().validate()
    }

    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if let Some(p) = &mut self.trust_roots
            && p.is_relative()
        {
            *p = config_dir.join(&*p);
        }
    }

    pub fn credentials(&self) -> SharedAccessKey {
        SharedAccessKey {
            host_name: self.host_name.clone(),
            key_name: self.shared_access_key_name.clone(),
            key: self.shared_access_key.clone(),
        }
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            token_lifetime: Duration::from_secs(self.renewal.token_lifetime_secs),
            renewal_margin: Duration::from_secs(self.renewal.renewal_margin_secs),
        }
    }

    /// Read the trust-root bundle, if any, into a transport security config.
    pub async fn security_config(&self) -> Result<SecurityConfig, Error> {
        let Some(path) = &self.trust_roots else {
            return Ok(SecurityConfig::default());
        };
        let pem = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Config(format!("read trust roots {}: {e}", path.display())))?;
        if !String::from_utf8_lossy(&pem).contains(PEM_CERTIFICATE) {
            return Err(Error::Config(format!(
                "trust roots {} contain no PEM certificate",
                path.display()
            )));
        }
        Ok(SecurityConfig {
            server_name: None,
            trust_roots: Some(Arc::from(pem)),
        })
    }
}
