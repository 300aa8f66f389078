//! Slashing protection gate.
//!
//! Runs before any service is created for a key. If local protection history
//! exists the key is clean. Otherwise the operator is asked, through a
//! [`DecisionPrompt`], to upload an interchange file, cancel, or explicitly
//! skip the import. The gate waits for that decision without a timeout.
//!
//! ```text
//!  Checking ──history──► Clean
//!     │
//!     └─no history──► AwaitingDecision ──Upload ok / Skip──► Resolved
//!                            │
//!                            └──Cancel / Upload failed──► Blocked
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::beacon::BeaconApi;
use crate::interchange::{import_interchange_file, ImportError};
use crate::slashing::{ImportSummary, SlashingProtection, SlashingProtectionError};
use crate::types::PublicKey;

/// Operator answer to a missing-history prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Import the interchange file at this path.
    Upload(PathBuf),
    Cancel,
    /// Start without any protection history.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decision for {public_key} is no longer awaited")]
pub struct DecisionClosed {
    pub public_key: PublicKey,
}

/// Handle through which exactly one [`Decision`] reaches a waiting gate.
///
/// Clones share one slot: the first decision sent wins and every later send
/// fails with [`DecisionClosed`].
#[derive(Debug, Clone)]
pub struct DecisionSender {
    public_key: PublicKey,
    tx: mpsc::Sender<Decision>,
}

impl DecisionSender {
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn send(&self, decision: Decision) -> Result<(), DecisionClosed> {
        self.tx.try_send(decision).map_err(|_| DecisionClosed {
            public_key: self.public_key,
        })
    }

    pub fn upload(&self, path: impl Into<PathBuf>) -> Result<(), DecisionClosed> {
        self.send(Decision::Upload(path.into()))
    }

    pub fn cancel(&self) -> Result<(), DecisionClosed> {
        self.send(Decision::Cancel)
    }

    pub fn skip(&self) -> Result<(), DecisionClosed> {
        self.send(Decision::Skip)
    }
}

/// The operator-facing side of the gate.
#[async_trait]
pub trait DecisionPrompt: Send + Sync {
    /// Ask the operator about `public_key`. The answer goes through `sender`.
    async fn open(&self, public_key: &PublicKey, sender: DecisionSender);

    /// Dismiss the prompt. Called exactly once per `open`.
    async fn close(&self, public_key: &PublicKey);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Checking,
    Clean,
    AwaitingDecision,
    Resolved,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// History already existed.
    Clean,
    Imported(ImportSummary),
    /// The operator accepted starting without history.
    Skipped,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("cancelled by operator")]
    Cancelled,

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("slashing protection lookup failed: {0}")]
    Storage(#[from] SlashingProtectionError),
}

/// Closes an open prompt exactly once, even if the waiting start is dropped.
struct PromptGuard {
    prompt: Arc<dyn DecisionPrompt>,
    public_key: PublicKey,
    armed: bool,
}

impl PromptGuard {
    async fn close(mut self) {
        self.armed = false;
        self.prompt.close(&self.public_key).await;
    }
}

impl Drop for PromptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let prompt = self.prompt.clone();
        let public_key = self.public_key;
        match Handle::try_current() {
            Ok(handle) => {
                debug!(validator = %public_key.short(), "Start abandoned, closing prompt");
                handle.spawn(async move { prompt.close(&public_key).await });
            }
            Err(_) => warn!(validator = %public_key.short(), "Prompt left open, no runtime to close it"),
        }
    }
}

/// One gate invocation for one key.
pub struct SlashingProtectionGate {
    public_key: PublicKey,
    store: Arc<dyn SlashingProtection>,
    prompt: Arc<dyn DecisionPrompt>,
    beacon: Arc<dyn BeaconApi>,
    state: GateState,
}

impl SlashingProtectionGate {
    pub fn new(
        public_key: PublicKey,
        store: Arc<dyn SlashingProtection>,
        prompt: Arc<dyn DecisionPrompt>,
        beacon: Arc<dyn BeaconApi>,
    ) -> Self {
        Self {
            public_key,
            store,
            prompt,
            beacon,
            state: GateState::Checking,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub async fn run(&mut self) -> Result<GateOutcome, GateError> {
        self.state = GateState::Checking;
        match self.store.has_history(&self.public_key).await {
            Ok(true) => {
                debug!(validator = %self.public_key.short(), "Slashing protection history present");
                self.state = GateState::Clean;
                return Ok(GateOutcome::Clean);
            }
            Ok(false) => {}
            Err(e) => {
                self.state = GateState::Blocked;
                return Err(e.into());
            }
        }

        self.state = GateState::AwaitingDecision;
        info!(validator = %self.public_key.short(), "No slashing protection history, awaiting operator decision");

        let decision = self.await_decision().await;
        let result = self.apply(decision).await;
        self.state = match result {
            Ok(_) => GateState::Resolved,
            Err(_) => GateState::Blocked,
        };
        result
    }

    async fn await_decision(&self) -> Decision {
        let (tx, mut rx) = mpsc::channel(1);
        self.prompt
            .open(
                &self.public_key,
                DecisionSender {
                    public_key: self.public_key,
                    tx,
                },
            )
            .await;

        let guard = PromptGuard {
            prompt: self.prompt.clone(),
            public_key: self.public_key,
            armed: true,
        };

        // Every sender gone without an answer counts as a cancel.
        let decision = rx.recv().await.unwrap_or(Decision::Cancel);
        drop(rx);

        guard.close().await;
        decision
    }

    async fn apply(&self, decision: Decision) -> Result<GateOutcome, GateError> {
        match decision {
            Decision::Cancel => {
                info!(validator = %self.public_key.short(), "Operator cancelled start");
                Err(GateError::Cancelled)
            }
            Decision::Skip => {
                warn!(
                    validator = %self.public_key.short(),
                    "Operator skipped slashing protection import, starting without history"
                );
                Ok(GateOutcome::Skipped)
            }
            Decision::Upload(path) => {
                let genesis = self.beacon.genesis().await.map_err(ImportError::from)?;
                let summary = import_interchange_file(
                    &path,
                    genesis.genesis_validators_root,
                    self.store.as_ref(),
                )
                .await?;
                Ok(GateOutcome::Imported(summary))
            }
        }
    }
}
