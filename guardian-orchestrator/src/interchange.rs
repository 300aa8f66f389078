//! Slashing-protection interchange documents and the import workflow.
//!
//! Documents follow the EIP-3076 layout. Only the "complete" shape is
//! produced; versions "4" and "5" are accepted on import.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::beacon::BeaconError;
use crate::slashing::{ImportSummary, SlashingProtection, SlashingProtectionError};
use crate::types::{quoted_u64, PublicKey, Root};

pub const INTERCHANGE_FORMAT_VERSION: &str = "5";

const SUPPORTED_VERSIONS: &[&str] = &["4", "5"];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read interchange file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed interchange document: {0}")]
    Malformed(String),

    #[error("genesis validators root mismatch: expected {expected}, file has {found}")]
    RootMismatch { expected: Root, found: Root },

    #[error("failed to fetch genesis from beacon node: {0}")]
    Genesis(#[from] BeaconError),

    #[error("slashing protection store rejected import: {0}")]
    Storage(SlashingProtectionError),
}

impl From<SlashingProtectionError> for ImportError {
    fn from(e: SlashingProtectionError) -> Self {
        match e {
            SlashingProtectionError::GenesisRootMismatch { expected, found } => {
                ImportError::RootMismatch { expected, found }
            }
            other => ImportError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeMetadata {
    pub interchange_format_version: String,
    pub genesis_validators_root: Root,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    #[serde(with = "quoted_u64")]
    pub slot: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Root>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAttestation {
    #[serde(with = "quoted_u64")]
    pub source_epoch: u64,
    #[serde(with = "quoted_u64")]
    pub target_epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Root>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeData {
    pub pubkey: PublicKey,
    #[serde(default)]
    pub signed_blocks: Vec<SignedBlock>,
    #[serde(default)]
    pub signed_attestations: Vec<SignedAttestation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interchange {
    pub metadata: InterchangeMetadata,
    pub data: Vec<InterchangeData>,
}

impl Interchange {
    pub fn new(genesis_validators_root: Root, data: Vec<InterchangeData>) -> Self {
        Self {
            metadata: InterchangeMetadata {
                interchange_format_version: INTERCHANGE_FORMAT_VERSION.to_string(),
                genesis_validators_root,
            },
            data,
        }
    }

    /// Parse and check the format version.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ImportError> {
        let interchange: Interchange =
            serde_json::from_slice(bytes).map_err(|e| ImportError::Malformed(e.to_string()))?;
        let version = interchange.metadata.interchange_format_version.as_str();
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ImportError::Malformed(format!(
                "unsupported interchange_format_version {version:?}"
            )));
        }
        Ok(interchange)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn genesis_validators_root(&self) -> Root {
        self.metadata.genesis_validators_root
    }

    pub fn public_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.data.iter().map(|d| &d.pubkey)
    }
}

/// Import the interchange file at `path` into `store` for the chain
/// identified by `genesis_validators_root`.
pub async fn import_interchange_file(
    path: &Path,
    genesis_validators_root: Root,
    store: &dyn SlashingProtection,
) -> Result<ImportSummary, ImportError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let interchange = Interchange::from_json_slice(&bytes)?;

    let found = interchange.genesis_validators_root();
    if found != genesis_validators_root {
        return Err(ImportError::RootMismatch {
            expected: genesis_validators_root,
            found,
        });
    }

    let summary = store
        .import_interchange(&interchange, genesis_validators_root)
        .await?;
    info!(
        path = ?path,
        validators = summary.validators,
        blocks = summary.blocks,
        attestations = summary.attestations,
        "Imported slashing protection interchange"
    );
    Ok(summary)
}
