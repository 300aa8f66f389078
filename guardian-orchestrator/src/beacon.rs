//! Beacon node HTTP surface consumed by the orchestrator and validator service.
//!
//! [`BeaconApi`] is the seam: the coordinator and the duty loop only see the
//! trait, [`HttpBeaconClient`] speaks the standard `/eth/v1` REST API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{quoted_u64, BeaconNodeEndpoint, PublicKey, Root};

#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("beacon node returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// `GET /eth/v1/beacon/genesis`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    #[serde(with = "quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: Root,
    pub genesis_fork_version: String,
}

/// Validator status as reported by a beacon node.
///
/// Different vendors report a few extra spellings; those map onto the
/// standard states where the meaning is the same and are otherwise kept
/// verbatim in [`ValidatorStatus::VendorExtended`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorStatus {
    PendingInitialized,
    PendingQueued,
    ActiveOngoing,
    ActiveExiting,
    ActiveSlashed,
    ExitedUnslashed,
    ExitedSlashed,
    WithdrawalPossible,
    WithdrawalDone,
    Unknown,
    VendorExtended(String),
}

impl ValidatorStatus {
    pub fn from_api(status: &str) -> Self {
        match status {
            "pending_initialized" => Self::PendingInitialized,
            "pending_queued" => Self::PendingQueued,
            "active_ongoing" => Self::ActiveOngoing,
            "active_exiting" => Self::ActiveExiting,
            "active_slashed" => Self::ActiveSlashed,
            "exited_unslashed" => Self::ExitedUnslashed,
            "exited_slashed" => Self::ExitedSlashed,
            "withdrawal_possible" | "withdrawable" => Self::WithdrawalPossible,
            "withdrawal_done" | "withdrawned" => Self::WithdrawalDone,
            "unknown" => Self::Unknown,
            other => Self::VendorExtended(other.to_string()),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::ActiveOngoing | Self::ActiveExiting | Self::ActiveSlashed
        )
    }
}

fn status_from_api<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ValidatorStatus, D::Error> {
    let s = String::deserialize(deserializer)?;
    Ok(ValidatorStatus::from_api(&s))
}

/// `GET /eth/v1/beacon/states/head/validators/{pubkey}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ValidatorInfo {
    #[serde(with = "quoted_u64")]
    pub index: u64,
    #[serde(with = "quoted_u64")]
    pub balance: u64,
    #[serde(deserialize_with = "status_from_api")]
    pub status: ValidatorStatus,
}

/// `POST /eth/v1/validator/duties/attester/{epoch}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttesterDuty {
    pub pubkey: PublicKey,
    #[serde(with = "quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "quoted_u64")]
    pub committee_index: u64,
    #[serde(with = "quoted_u64")]
    pub committee_length: u64,
    #[serde(with = "quoted_u64")]
    pub committees_at_slot: u64,
    #[serde(with = "quoted_u64")]
    pub validator_committee_index: u64,
    #[serde(with = "quoted_u64")]
    pub slot: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "quoted_u64")]
    pub epoch: u64,
    pub root: Root,
}

/// `GET /eth/v1/validator/attestation_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationData {
    #[serde(with = "quoted_u64")]
    pub slot: u64,
    #[serde(with = "quoted_u64")]
    pub index: u64,
    pub beacon_block_root: Root,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

/// Body element of `POST /eth/v1/beacon/pool/attestations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Hex-encoded SSZ bitlist.
    pub aggregation_bits: String,
    pub data: AttestationData,
    /// Hex-encoded signature.
    pub signature: String,
}

/// Encode a single-participant aggregation bitlist of `committee_length`
/// bits with the trailing length sentinel.
pub fn aggregation_bits(committee_length: u64, position: u64) -> String {
    let len = committee_length as usize;
    let mut bytes = vec![0u8; len / 8 + 1];
    let pos = position as usize;
    if pos < len {
        bytes[pos / 8] |= 1 << (pos % 8);
    }
    bytes[len / 8] |= 1 << (len % 8);
    format!("0x{}", hex::encode(bytes))
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct NodeVersion {
    version: String,
}

/// Read-side and submission calls the orchestrator needs from a beacon node.
#[async_trait]
pub trait BeaconApi: Send + Sync {
    fn base_url(&self) -> &str;

    async fn node_version(&self) -> Result<String, BeaconError>;

    async fn genesis(&self) -> Result<Genesis, BeaconError>;

    /// Raw chain spec as published by `/eth/v1/config/spec`.
    async fn spec(&self) -> Result<BTreeMap<String, serde_json::Value>, BeaconError>;

    /// `None` when the node does not know the validator yet.
    async fn validator(&self, public_key: &PublicKey) -> Result<Option<ValidatorInfo>, BeaconError>;

    async fn attester_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<AttesterDuty>, BeaconError>;

    async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, BeaconError>;

    async fn submit_attestations(&self, attestations: &[Attestation]) -> Result<(), BeaconError>;
}

/// Creates API handles for endpoints.
pub trait BeaconConnector: Send + Sync {
    fn connect(&self, endpoint: &BeaconNodeEndpoint) -> Result<Arc<dyn BeaconApi>, BeaconError>;
}

/// reqwest-backed [`BeaconApi`].
#[derive(Clone)]
pub struct HttpBeaconClient {
    base: String,
    client: Client,
}

impl HttpBeaconClient {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, BeaconError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base = base.into().trim_end_matches('/').to_string();
        Ok(Self { base, client })
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, BeaconError> {
        let url = format!("{}{}", self.base, path);
        debug!(%url, "GET");
        let resp = self.client.get(&url).send().await?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, BeaconError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BeaconError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await?;
        let envelope: DataEnvelope<T> =
            serde_json::from_slice(&bytes).map_err(|e| BeaconError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl BeaconApi for HttpBeaconClient {
    fn base_url(&self) -> &str {
        &self.base
    }

    async fn node_version(&self) -> Result<String, BeaconError> {
        let version: NodeVersion = self.get_data("/eth/v1/node/version").await?;
        Ok(version.version)
    }

    async fn genesis(&self) -> Result<Genesis, BeaconError> {
        self.get_data("/eth/v1/beacon/genesis").await
    }

    async fn spec(&self) -> Result<BTreeMap<String, serde_json::Value>, BeaconError> {
        self.get_data("/eth/v1/config/spec").await
    }

    async fn validator(&self, public_key: &PublicKey) -> Result<Option<ValidatorInfo>, BeaconError> {
        let url = format!(
            "{}/eth/v1/beacon/states/head/validators/{}",
            self.base, public_key
        );
        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(resp).await.map(Some)
    }

    async fn attester_duties(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<AttesterDuty>, BeaconError> {
        let url = format!("{}/eth/v1/validator/duties/attester/{}", self.base, epoch);
        let body: Vec<String> = indices.iter().map(u64::to_string).collect();
        let resp = self.client.post(&url).json(&body).send().await?;
        Self::decode(resp).await
    }

    async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, BeaconError> {
        self.get_data(&format!(
            "/eth/v1/validator/attestation_data?slot={}&committee_index={}",
            slot, committee_index
        ))
        .await
    }

    async fn submit_attestations(&self, attestations: &[Attestation]) -> Result<(), BeaconError> {
        let url = format!("{}/eth/v1/beacon/pool/attestations", self.base);
        let resp = self.client.post(&url).json(attestations).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(BeaconError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Connects to endpoints over HTTP with a fixed per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl BeaconConnector for HttpConnector {
    fn connect(&self, endpoint: &BeaconNodeEndpoint) -> Result<Arc<dyn BeaconApi>, BeaconError> {
        Ok(Arc::new(HttpBeaconClient::new(&endpoint.url, self.timeout)?))
    }
}
