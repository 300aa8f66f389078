//! Chain parameters and their resolution from a beacon node.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::beacon::BeaconApi;

const FAR_FUTURE_EPOCH: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkConfigError {
    #[error("chain spec is missing {0}")]
    Missing(&'static str),

    #[error("chain spec field {field} is not an integer: {value}")]
    NotAnInteger { field: &'static str, value: String },
}

/// Chain parameters a validator service needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub config_name: String,
    pub preset_base: String,
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub genesis_fork_version: String,
    pub altair_fork_epoch: Option<u64>,
    pub bellatrix_fork_epoch: Option<u64>,
    pub capella_fork_epoch: Option<u64>,
    pub deneb_fork_epoch: Option<u64>,
}

impl NetworkConfig {
    pub fn mainnet() -> Self {
        Self {
            config_name: "mainnet".to_string(),
            preset_base: "mainnet".to_string(),
            seconds_per_slot: 12,
            slots_per_epoch: 32,
            genesis_fork_version: "0x00000000".to_string(),
            altair_fork_epoch: Some(74240),
            bellatrix_fork_epoch: Some(144896),
            capella_fork_epoch: Some(194048),
            deneb_fork_epoch: Some(269568),
        }
    }

    pub fn prater() -> Self {
        Self {
            config_name: "prater".to_string(),
            genesis_fork_version: "0x00001020".to_string(),
            altair_fork_epoch: Some(36660),
            bellatrix_fork_epoch: Some(112260),
            capella_fork_epoch: Some(162304),
            deneb_fork_epoch: Some(231680),
            ..Self::mainnet()
        }
    }

    pub fn sepolia() -> Self {
        Self {
            config_name: "sepolia".to_string(),
            genesis_fork_version: "0x90000069".to_string(),
            altair_fork_epoch: Some(50),
            bellatrix_fork_epoch: Some(100),
            capella_fork_epoch: Some(56832),
            deneb_fork_epoch: Some(132608),
            ..Self::mainnet()
        }
    }

    pub fn holesky() -> Self {
        Self {
            config_name: "holesky".to_string(),
            genesis_fork_version: "0x01017000".to_string(),
            altair_fork_epoch: Some(0),
            bellatrix_fork_epoch: Some(0),
            capella_fork_epoch: Some(256),
            deneb_fork_epoch: Some(29696),
            ..Self::mainnet()
        }
    }

    /// Well-known configuration for a network name; unknown names get mainnet.
    pub fn for_network(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "prater" | "goerli" => Self::prater(),
            "sepolia" => Self::sepolia(),
            "holesky" => Self::holesky(),
            _ => Self::mainnet(),
        }
    }

    /// Build from the key/value map served at `/eth/v1/config/spec`.
    pub fn from_spec(spec: &BTreeMap<String, serde_json::Value>) -> Result<Self, NetworkConfigError> {
        let text = |field: &'static str| -> Result<String, NetworkConfigError> {
            match spec.get(field) {
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(other) => Ok(other.to_string()),
                None => Err(NetworkConfigError::Missing(field)),
            }
        };
        let integer = |field: &'static str| -> Result<u64, NetworkConfigError> {
            let value = text(field)?;
            value
                .parse()
                .map_err(|_| NetworkConfigError::NotAnInteger { field, value })
        };
        let fork_epoch = |field: &'static str| -> Result<Option<u64>, NetworkConfigError> {
            match integer(field) {
                Ok(FAR_FUTURE_EPOCH) | Err(NetworkConfigError::Missing(_)) => Ok(None),
                Ok(epoch) => Ok(Some(epoch)),
                Err(e) => Err(e),
            }
        };

        let preset_base = text("PRESET_BASE")?;
        Ok(Self {
            config_name: text("CONFIG_NAME").unwrap_or_else(|_| preset_base.clone()),
            preset_base,
            seconds_per_slot: integer("SECONDS_PER_SLOT")?,
            slots_per_epoch: integer("SLOTS_PER_EPOCH")?,
            genesis_fork_version: text("GENESIS_FORK_VERSION")?,
            altair_fork_epoch: fork_epoch("ALTAIR_FORK_EPOCH")?,
            bellatrix_fork_epoch: fork_epoch("BELLATRIX_FORK_EPOCH")?,
            capella_fork_epoch: fork_epoch("CAPELLA_FORK_EPOCH")?,
            deneb_fork_epoch: fork_epoch("DENEB_FORK_EPOCH")?,
        })
    }

    pub fn epoch_at_slot(&self, slot: u64) -> u64 {
        slot / self.slots_per_epoch.max(1)
    }

    pub fn epoch_start_slot(&self, epoch: u64) -> u64 {
        epoch * self.slots_per_epoch.max(1)
    }
}

/// Where a resolved configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Remote,
    /// The node could not be asked; `reason` says why.
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub config: NetworkConfig,
    pub source: ConfigSource,
}

impl ResolvedConfig {
    pub fn is_degraded(&self) -> bool {
        matches!(self.source, ConfigSource::Fallback { .. })
    }
}

/// Fetches a node's chain configuration, falling back to the well-known
/// default when the node cannot supply one in time.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    timeout: Duration,
}

impl ConfigResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Never fails; degraded resolutions are logged at WARN.
    pub async fn resolve(&self, beacon: &dyn BeaconApi, network: &str) -> ResolvedConfig {
        let reason = match tokio::time::timeout(self.timeout, beacon.spec()).await {
            Ok(Ok(spec)) => match NetworkConfig::from_spec(&spec) {
                Ok(config) => {
                    debug!(
                        url = beacon.base_url(),
                        config = %config.config_name,
                        "Resolved chain config from beacon node"
                    );
                    return ResolvedConfig {
                        config,
                        source: ConfigSource::Remote,
                    };
                }
                Err(e) => format!("malformed chain spec: {e}"),
            },
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no response within {:?}", self.timeout),
        };

        let config = NetworkConfig::for_network(network);
        warn!(
            url = beacon.base_url(),
            network,
            fallback = %config.config_name,
            %reason,
            "Chain config fetch degraded, using default configuration"
        );
        ResolvedConfig {
            config,
            source: ConfigSource::Fallback { reason },
        }
    }
}
