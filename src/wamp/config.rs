//! Realm and topic configuration
//!
//! The configuration is read once at startup and handed to the bridge as
//! plain data. Two file formats are accepted: JSON (both the keyed
//! `{"realms": {...}}` shape and the list shape `[{"realm": ...}]`) and TOML
//! (`[realms.<name>]` tables, plus an optional `[settings]` table).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::error::ConfigError;

pub const DEFAULT_ROUTER_URL: &str = "ws://127.0.0.1:60001/ws";
const DEFAULT_AUDIT_LOG: &str = "logs/log.txt";
const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETAINED_RECORDS: usize = 10_000;
const CONFIG_DIR: &str = "wampbench";
const CONFIG_FILE: &str = "realm_topic_config.toml";

/// An isolated routing domain and the router endpoint serving it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realm {
    name: String,
    router_url: Url,
}

impl Realm {
    /// Validates the realm name and router endpoint.
    ///
    /// The URL must use the `ws` or `wss` scheme and name a host.
    pub fn new(name: impl Into<String>, router_url: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidRealm(
                "realm name must not be empty".to_string(),
            ));
        }

        let parsed = Url::parse(router_url).map_err(|e| ConfigError::InvalidRouterUrl {
            url: router_url.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidRouterUrl {
                url: router_url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if parsed.host_str().is_none() {
            return Err(ConfigError::InvalidRouterUrl {
                url: router_url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        Ok(Self {
            name,
            router_url: parsed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router_url(&self) -> &Url {
        &self.router_url
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.name, self.router_url)
    }
}

/// Router endpoint and known topics for one realm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmEntry {
    #[serde(default = "default_router_url")]
    pub router_url: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Settings of the bridge itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchSettings {
    /// Audit trail file, one record per line
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    /// Upper bound for the join handshake
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    /// Activity records kept in memory; the audit file keeps all of them
    #[serde(default = "default_retained_records")]
    pub retained_records: usize,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            audit_log: default_audit_log(),
            join_timeout_secs: DEFAULT_JOIN_TIMEOUT_SECS,
            retained_records: DEFAULT_RETAINED_RECORDS,
        }
    }
}

impl BenchSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// The realm/topic map the bridge works with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmTopicConfig {
    #[serde(default)]
    pub realms: BTreeMap<String, RealmEntry>,
    #[serde(default)]
    pub settings: BenchSettings,
}

#[derive(Deserialize)]
struct ListedRealm {
    realm: String,
    #[serde(default = "default_router_url")]
    router_url: String,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonShape {
    Listed(Vec<ListedRealm>),
    Keyed(RealmTopicConfig),
}

fn default_router_url() -> String {
    DEFAULT_ROUTER_URL.to_string()
}

fn default_audit_log() -> PathBuf {
    PathBuf::from(DEFAULT_AUDIT_LOG)
}

fn default_join_timeout() -> u64 {
    DEFAULT_JOIN_TIMEOUT_SECS
}

fn default_retained_records() -> usize {
    DEFAULT_RETAINED_RECORDS
}

impl RealmTopicConfig {
    /// Default location under the user's configuration directory
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads a configuration file, choosing the format by extension.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_toml_str(&content)?,
        };

        info!(
            "Loaded {} realm(s) from {}",
            config.realms.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let shape: JsonShape =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let config = match shape {
            JsonShape::Keyed(config) => config,
            JsonShape::Listed(items) => {
                debug!("Converting list-shaped realm configuration");
                let mut realms = BTreeMap::new();
                for item in items {
                    if item.realm.trim().is_empty() {
                        warn!("Skipping realm entry without a name");
                        continue;
                    }
                    realms.insert(
                        item.realm,
                        RealmEntry {
                            router_url: item.router_url,
                            topics: item.topics,
                        },
                    );
                }
                RealmTopicConfig {
                    realms,
                    settings: BenchSettings::default(),
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RealmTopicConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, entry) in &self.realms {
            Realm::new(name.clone(), &entry.router_url)?;
        }
        Ok(())
    }

    /// Resolves a configured realm by name
    pub fn realm(&self, name: &str) -> Result<Realm, ConfigError> {
        let entry = self
            .realms
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRealm(name.to_string()))?;
        Realm::new(name, &entry.router_url)
    }

    /// Topics configured for a realm, empty when the realm is unknown
    pub fn topics(&self, name: &str) -> &[String] {
        self.realms
            .get(name)
            .map(|entry| entry.topics.as_slice())
            .unwrap_or(&[])
    }
}
