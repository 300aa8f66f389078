//! Slashing protection storage.
//!
//! Keeps, per genesis validators root and per validator, every block and
//! attestation this machine signed or imported, and refuses anything that
//! would conflict with them:
//!
//! - attestations: double votes (same target, different data), surround
//!   votes in either direction, and anything at or below the low-water marks
//!   left by an interchange import;
//! - blocks: a second proposal for the same slot, and anything at or below
//!   the imported low-water slot.
//!
//! State is persisted as JSON after every accepted record, through a
//! temp-file-then-rename so a crash never leaves a truncated database.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::interchange::{Interchange, InterchangeData, SignedAttestation, SignedBlock};
use crate::persist::{blocking_io, write_json_atomic};
use crate::types::{PublicKey, Root};

#[derive(Debug, Error)]
pub enum SlashingProtectionError {
    #[error("double vote for target epoch {target_epoch} by {public_key}")]
    DoubleVote { public_key: PublicKey, target_epoch: u64 },

    #[error("attestation ({source_epoch}, {target_epoch}) by {public_key} surrounds a previous vote")]
    NewSurroundsPrev {
        public_key: PublicKey,
        source_epoch: u64,
        target_epoch: u64,
    },

    #[error("attestation ({source_epoch}, {target_epoch}) by {public_key} is surrounded by a previous vote")]
    PrevSurroundsNew {
        public_key: PublicKey,
        source_epoch: u64,
        target_epoch: u64,
    },

    #[error("attestation ({source_epoch}, {target_epoch}) by {public_key} is below the low-water mark")]
    AttestationBelowWatermark {
        public_key: PublicKey,
        source_epoch: u64,
        target_epoch: u64,
    },

    #[error("attestation source {source_epoch} is after target {target_epoch}")]
    InvalidAttestation { source_epoch: u64, target_epoch: u64 },

    #[error("double block proposal at slot {slot} by {public_key}")]
    DoubleBlockProposal { public_key: PublicKey, slot: u64 },

    #[error("block at slot {slot} by {public_key} is at or below the low-water slot {min_slot}")]
    BlockBelowWatermark {
        public_key: PublicKey,
        slot: u64,
        min_slot: u64,
    },

    #[error("genesis validators root mismatch: expected {expected}, found {found}")]
    GenesisRootMismatch { expected: Root, found: Root },

    #[error("failed to persist slashing protection state: {0}")]
    Persist(#[from] std::io::Error),

    #[error("failed to parse slashing protection state: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Outcome of an accepted check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safe {
    /// Signing the exact same data twice is never slashable.
    SameData,
    /// New, non-conflicting data; it has been recorded.
    Valid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub validators: usize,
    pub blocks: usize,
    pub attestations: usize,
}

/// Slashing protection contract used by the gate and the validator service.
#[async_trait]
pub trait SlashingProtection: Send + Sync {
    /// Whether any history (signed or imported) exists for the key.
    async fn has_history(&self, public_key: &PublicKey) -> Result<bool, SlashingProtectionError>;

    async fn import_interchange(
        &self,
        interchange: &Interchange,
        genesis_validators_root: Root,
    ) -> Result<ImportSummary, SlashingProtectionError>;

    /// Export history for `public_keys` (all keys when empty).
    async fn export_interchange(
        &self,
        genesis_validators_root: Root,
        public_keys: &[PublicKey],
    ) -> Result<Interchange, SlashingProtectionError>;

    async fn check_and_record_attestation(
        &self,
        genesis_validators_root: Root,
        public_key: &PublicKey,
        attestation: &SignedAttestation,
    ) -> Result<Safe, SlashingProtectionError>;

    async fn check_and_record_block(
        &self,
        genesis_validators_root: Root,
        public_key: &PublicKey,
        block: &SignedBlock,
    ) -> Result<Safe, SlashingProtectionError>;
}

/// Low-water marks left behind by imports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub block_slot: Option<u64>,
    pub source_epoch: Option<u64>,
    pub target_epoch: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorHistory {
    pub signed_blocks: Vec<SignedBlock>,
    pub signed_attestations: Vec<SignedAttestation>,
    pub watermarks: Watermarks,
}

impl ValidatorHistory {
    /// No records and no low-water marks: nothing to protect against.
    pub fn is_empty(&self) -> bool {
        self.signed_blocks.is_empty()
            && self.signed_attestations.is_empty()
            && self.watermarks == Watermarks::default()
    }
}

/// Persistent state: genesis validators root (hex) -> public key (hex) -> history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlashingProtectionState {
    pub networks: BTreeMap<String, BTreeMap<String, ValidatorHistory>>,
}

impl SlashingProtectionState {
    fn history(&self, root: Root, public_key: &PublicKey) -> Option<&ValidatorHistory> {
        self.networks
            .get(&root.to_string())?
            .get(&public_key.to_string())
    }

    /// Drop the entry for `public_key` if it holds nothing.
    fn prune(&mut self, root: Root, public_key: &PublicKey) {
        let root = root.to_string();
        let Some(keys) = self.networks.get_mut(&root) else {
            return;
        };
        if keys.get(&public_key.to_string()).is_some_and(ValidatorHistory::is_empty) {
            keys.remove(&public_key.to_string());
        }
        if keys.is_empty() {
            self.networks.remove(&root);
        }
    }

    fn history_mut(&mut self, root: Root, public_key: &PublicKey) -> &mut ValidatorHistory {
        self.networks
            .entry(root.to_string())
            .or_default()
            .entry(public_key.to_string())
            .or_default()
    }
}

/// File-backed [`SlashingProtection`].
pub struct SlashingProtectionDb {
    state_file: PathBuf,
    state: Mutex<SlashingProtectionState>,
}

impl SlashingProtectionDb {
    /// Open the database, creating an empty one if the file does not exist.
    pub fn open(state_file: impl Into<PathBuf>) -> Result<Self, SlashingProtectionError> {
        let state_file = state_file.into();
        let state = if state_file.exists() {
            info!("Loading slashing protection state from {:?}", state_file);
            let reader = BufReader::new(File::open(&state_file)?);
            serde_json::from_reader(reader)?
        } else {
            info!("Creating new slashing protection state at {:?}", state_file);
            SlashingProtectionState::default()
        };

        Ok(Self {
            state_file,
            state: Mutex::new(state),
        })
    }

    fn check_attestation(
        history: &ValidatorHistory,
        public_key: &PublicKey,
        new: &SignedAttestation,
    ) -> Result<Safe, SlashingProtectionError> {
        let (source, target) = (new.source_epoch, new.target_epoch);
        if source > target {
            return Err(SlashingProtectionError::InvalidAttestation {
                source_epoch: source,
                target_epoch: target,
            });
        }

        // Re-signing identical data is always allowed, even below the watermark.
        if new.signing_root.is_some()
            && history.signed_attestations.iter().any(|prev| {
                prev.target_epoch == target
                    && prev.source_epoch == source
                    && prev.signing_root == new.signing_root
            })
        {
            return Ok(Safe::SameData);
        }

        let marks = &history.watermarks;
        if marks.source_epoch.is_some_and(|min| source < min)
            || marks.target_epoch.is_some_and(|min| target <= min)
        {
            return Err(SlashingProtectionError::AttestationBelowWatermark {
                public_key: *public_key,
                source_epoch: source,
                target_epoch: target,
            });
        }

        for prev in &history.signed_attestations {
            if prev.target_epoch == target {
                error!(
                    "DOUBLE VOTE BLOCKED: validator={}, target={}, prev_root={:?}, new_root={:?}",
                    public_key, target, prev.signing_root, new.signing_root
                );
                return Err(SlashingProtectionError::DoubleVote {
                    public_key: *public_key,
                    target_epoch: target,
                });
            }
            if source < prev.source_epoch && target > prev.target_epoch {
                return Err(SlashingProtectionError::NewSurroundsPrev {
                    public_key: *public_key,
                    source_epoch: source,
                    target_epoch: target,
                });
            }
            if source > prev.source_epoch && target < prev.target_epoch {
                return Err(SlashingProtectionError::PrevSurroundsNew {
                    public_key: *public_key,
                    source_epoch: source,
                    target_epoch: target,
                });
            }
        }

        Ok(Safe::Valid)
    }

    fn check_block(
        history: &ValidatorHistory,
        public_key: &PublicKey,
        new: &SignedBlock,
    ) -> Result<Safe, SlashingProtectionError> {
        if let Some(prev) = history.signed_blocks.iter().find(|b| b.slot == new.slot) {
            if new.signing_root.is_some() && prev.signing_root == new.signing_root {
                return Ok(Safe::SameData);
            }
            error!(
                "DOUBLE PROPOSAL BLOCKED: validator={}, slot={}, prev_root={:?}, new_root={:?}",
                public_key, new.slot, prev.signing_root, new.signing_root
            );
            return Err(SlashingProtectionError::DoubleBlockProposal {
                public_key: *public_key,
                slot: new.slot,
            });
        }

        if let Some(min_slot) = history.watermarks.block_slot {
            if new.slot <= min_slot {
                return Err(SlashingProtectionError::BlockBelowWatermark {
                    public_key: *public_key,
                    slot: new.slot,
                    min_slot,
                });
            }
        }

        Ok(Safe::Valid)
    }

    fn merge(history: &mut ValidatorHistory, data: &InterchangeData, summary: &mut ImportSummary) {
        for block in &data.signed_blocks {
            if !history.signed_blocks.contains(block) {
                history.signed_blocks.push(block.clone());
                summary.blocks += 1;
            }
            history.watermarks.block_slot = history.watermarks.block_slot.max(Some(block.slot));
        }
        for attestation in &data.signed_attestations {
            if !history.signed_attestations.contains(attestation) {
                history.signed_attestations.push(attestation.clone());
                summary.attestations += 1;
            }
            let marks = &mut history.watermarks;
            marks.source_epoch = marks.source_epoch.max(Some(attestation.source_epoch));
            marks.target_epoch = marks.target_epoch.max(Some(attestation.target_epoch));
        }
    }

    /// Persist state to disk.
    fn persist(&self, state: &SlashingProtectionState) -> Result<(), SlashingProtectionError> {
        blocking_io(|| write_json_atomic::<_, SlashingProtectionError>(&self.state_file, state))?;
        debug!("Persisted slashing protection state");
        Ok(())
    }
}

#[async_trait]
impl SlashingProtection for SlashingProtectionDb {
    async fn has_history(&self, public_key: &PublicKey) -> Result<bool, SlashingProtectionError> {
        let key = public_key.to_string();
        let state = self.state.lock();
        Ok(state
            .networks
            .values()
            .any(|keys| keys.get(&key).is_some_and(|history| !history.is_empty())))
    }

    async fn import_interchange(
        &self,
        interchange: &Interchange,
        genesis_validators_root: Root,
    ) -> Result<ImportSummary, SlashingProtectionError> {
        let found = interchange.genesis_validators_root();
        if found != genesis_validators_root {
            return Err(SlashingProtectionError::GenesisRootMismatch {
                expected: genesis_validators_root,
                found,
            });
        }

        let mut state = self.state.lock();
        let mut updated = state.clone();
        let mut summary = ImportSummary::default();
        for data in &interchange.data {
            let history = updated.history_mut(genesis_validators_root, &data.pubkey);
            Self::merge(history, data, &mut summary);
            summary.validators += 1;
        }

        self.persist(&updated)?;
        *state = updated;
        Ok(summary)
    }

    async fn export_interchange(
        &self,
        genesis_validators_root: Root,
        public_keys: &[PublicKey],
    ) -> Result<Interchange, SlashingProtectionError> {
        let state = self.state.lock();
        let mut data = Vec::new();
        if let Some(keys) = state.networks.get(&genesis_validators_root.to_string()) {
            for (key, history) in keys {
                let pubkey: PublicKey = match key.parse() {
                    Ok(pubkey) => pubkey,
                    Err(e) => {
                        error!(key = %key, error = %e, "Skipping unparseable key in slashing protection state");
                        continue;
                    }
                };
                if !public_keys.is_empty() && !public_keys.contains(&pubkey) {
                    continue;
                }
                data.push(InterchangeData {
                    pubkey,
                    signed_blocks: history.signed_blocks.clone(),
                    signed_attestations: history.signed_attestations.clone(),
                });
            }
        }
        Ok(Interchange::new(genesis_validators_root, data))
    }

    async fn check_and_record_attestation(
        &self,
        genesis_validators_root: Root,
        public_key: &PublicKey,
        attestation: &SignedAttestation,
    ) -> Result<Safe, SlashingProtectionError> {
        debug!(
            "Checking attestation: validator={}, source={}, target={}",
            public_key.short(),
            attestation.source_epoch,
            attestation.target_epoch
        );

        let mut state = self.state.lock();
        let empty = ValidatorHistory::default();
        let history = state
            .history(genesis_validators_root, public_key)
            .unwrap_or(&empty);
        let safe = Self::check_attestation(history, public_key, attestation)?;
        if safe == Safe::SameData {
            return Ok(safe);
        }

        state
            .history_mut(genesis_validators_root, public_key)
            .signed_attestations
            .push(attestation.clone());
        if let Err(e) = self.persist(&state) {
            // Nothing was signed yet; forget the record so a retry is judged afresh.
            state
                .history_mut(genesis_validators_root, public_key)
                .signed_attestations
                .pop();
            state.prune(genesis_validators_root, public_key);
            return Err(e);
        }
        Ok(safe)
    }

    async fn check_and_record_block(
        &self,
        genesis_validators_root: Root,
        public_key: &PublicKey,
        block: &SignedBlock,
    ) -> Result<Safe, SlashingProtectionError> {
        debug!(
            "Checking block: validator={}, slot={}",
            public_key.short(),
            block.slot
        );

        let mut state = self.state.lock();
        let empty = ValidatorHistory::default();
        let history = state
            .history(genesis_validators_root, public_key)
            .unwrap_or(&empty);
        let safe = Self::check_block(history, public_key, block)?;
        if safe == Safe::SameData {
            return Ok(safe);
        }

        state
            .history_mut(genesis_validators_root, public_key)
            .signed_blocks
            .push(block.clone());
        if let Err(e) = self.persist(&state) {
            state
                .history_mut(genesis_validators_root, public_key)
                .signed_blocks
                .pop();
            state.prune(genesis_validators_root, public_key);
            return Err(e);
        }
        Ok(safe)
    }
}
