//! Per-key validator services.
//!
//! A [`ValidatorService`] performs the duties of one validator key against
//! one beacon node. Services are built by a [`ServiceFactory`] from a
//! [`ServiceContext`] that binds everything resolved during the start
//! sequence, so a running service never re-resolves its endpoint or chain
//! configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use guardian_keystore::{SignError, ValidatorKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::beacon::{aggregation_bits, Attestation, AttestationData, AttesterDuty, BeaconApi, BeaconError, Genesis};
use crate::events::{EventBus, LifecycleEvent};
use crate::interchange::SignedAttestation;
use crate::network::NetworkConfig;
use crate::slashing::{Safe, SlashingProtection, SlashingProtectionError};
use crate::types::{BeaconNodeEndpoint, PublicKey, Root};

/// Attester signing domain type.
pub const DOMAIN_BEACON_ATTESTER: [u8; 4] = [1, 0, 0, 0];

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("beacon node unavailable: {0}")]
    Beacon(#[from] BeaconError),

    #[error("service initialization failed: {0}")]
    Init(String),

    #[error("duty task failed: {0}")]
    Task(String),
}

/// A signing service for one validator key.
#[async_trait]
pub trait ValidatorService: Send + Sync {
    fn public_key(&self) -> &PublicKey;

    async fn start(&self) -> Result<(), ServiceError>;

    async fn stop(&self) -> Result<(), ServiceError>;

    fn is_running(&self) -> bool;
}

/// Everything a service is bound to for its lifetime.
#[derive(Clone)]
pub struct ServiceContext {
    pub key: ValidatorKey,
    pub endpoint: BeaconNodeEndpoint,
    pub network: NetworkConfig,
    pub slashing_protection: Arc<dyn SlashingProtection>,
    pub beacon: Arc<dyn BeaconApi>,
    /// Span the service logs under.
    pub logger: Span,
    pub events: EventBus,
    pub graffiti: Option<String>,
}

pub trait ServiceFactory: Send + Sync {
    fn create(&self, context: ServiceContext) -> Result<Arc<dyn ValidatorService>, ServiceError>;
}

/// Builds [`BeaconValidatorService`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct BeaconServiceFactory;

impl ServiceFactory for BeaconServiceFactory {
    fn create(&self, context: ServiceContext) -> Result<Arc<dyn ValidatorService>, ServiceError> {
        Ok(Arc::new(BeaconValidatorService::new(context)))
    }
}

/// Signing root of attestation data: SHA-256 over the attester domain, the
/// chain's genesis validators root and the canonical JSON of the data.
pub fn attestation_signing_root(
    genesis_validators_root: Root,
    data: &AttestationData,
) -> Result<Root, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_BEACON_ATTESTER);
    hasher.update(genesis_validators_root.as_bytes());
    hasher.update(serde_json::to_vec(data)?);
    Ok(Root(hasher.finalize().into()))
}

#[derive(Debug, Error)]
pub enum DutyError {
    #[error("beacon node error: {0}")]
    Beacon(#[from] BeaconError),

    #[error("refused by slashing protection: {0}")]
    Slashing(#[from] SlashingProtectionError),

    #[error("failed to encode attestation data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("signing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

struct DutyRunner {
    context: ServiceContext,
    genesis: Genesis,
}

impl DutyRunner {
    fn public_key(&self) -> &PublicKey {
        &self.context.key.public_key
    }

    fn slot_start(&self, slot: u64) -> Duration {
        Duration::from_secs(self.genesis.genesis_time + slot * self.context.network.seconds_per_slot)
    }

    fn current_slot(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now.saturating_sub(self.genesis.genesis_time) / self.context.network.seconds_per_slot.max(1)
    }

    /// Sleep until `at` (unix time). Returns `false` if shutdown was signalled first.
    async fn sleep_until(&self, at: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let delay = at.saturating_sub(now);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return false,
        }
        !*shutdown.borrow()
    }

    async fn resolve_index(&self) -> Option<u64> {
        match self.context.beacon.validator(self.public_key()).await {
            Ok(Some(info)) => Some(info.index),
            Ok(None) => {
                debug!("Validator not yet known to beacon node");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to look up validator index");
                None
            }
        }
    }

    async fn run(self, mut index: Option<u64>, mut shutdown: watch::Receiver<bool>) {
        let network = self.context.network.clone();
        loop {
            let slot = self.current_slot();
            let epoch = network.epoch_at_slot(slot);

            if index.is_none() {
                index = self.resolve_index().await;
            }

            let duties = match index {
                Some(index) => match self.context.beacon.attester_duties(epoch, &[index]).await {
                    Ok(duties) => duties,
                    Err(e) => {
                        warn!(epoch, error = %e, "Failed to fetch attester duties");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };

            for duty in duties.iter().filter(|d| d.slot >= slot) {
                // Attest a third of the way into the slot.
                let at = self.slot_start(duty.slot) + Duration::from_secs(network.seconds_per_slot) / 3;
                if !self.sleep_until(at, &mut shutdown).await {
                    return;
                }
                match self.attest(duty).await {
                    Ok(_) => {}
                    Err(DutyError::Slashing(e)) => {
                        error!(slot = duty.slot, error = %e, "Attestation refused by slashing protection");
                    }
                    Err(e) => {
                        warn!(slot = duty.slot, error = %e, "Attestation duty failed");
                    }
                }
            }

            let next_epoch = self.slot_start(network.epoch_start_slot(epoch + 1));
            if !self.sleep_until(next_epoch, &mut shutdown).await {
                return;
            }
        }
    }

    /// Perform one attestation duty end to end.
    async fn attest(&self, duty: &AttesterDuty) -> Result<Safe, DutyError> {
        let beacon = &self.context.beacon;
        let data = beacon.attestation_data(duty.slot, duty.committee_index).await?;
        let root = self.genesis.genesis_validators_root;
        let signing_root = attestation_signing_root(root, &data)?;

        let safe = self
            .context
            .slashing_protection
            .check_and_record_attestation(
                root,
                self.public_key(),
                &SignedAttestation {
                    source_epoch: data.source.epoch,
                    target_epoch: data.target.epoch,
                    signing_root: Some(signing_root),
                },
            )
            .await?;
        if safe == Safe::SameData {
            debug!(slot = duty.slot, "Already attested to identical data");
            return Ok(safe);
        }

        let credential = self.context.key.credential.clone();
        let signature = tokio::task::spawn_blocking(move || {
            credential.sign(&DOMAIN_BEACON_ATTESTER, signing_root.as_bytes())
        })
        .await??;

        let attestation = Attestation {
            aggregation_bits: aggregation_bits(duty.committee_length, duty.validator_committee_index),
            data,
            signature: format!("0x{}", hex::encode(signature)),
        };
        beacon.submit_attestations(std::slice::from_ref(&attestation)).await?;

        info!(
            slot = duty.slot,
            committee_index = duty.committee_index,
            "Attestation submitted"
        );
        self.context.events.publish(LifecycleEvent::AttestationSigned {
            public_key: *self.public_key(),
            slot: attestation.data.slot,
            committee_index: attestation.data.index,
            beacon_block_root: attestation.data.beacon_block_root,
        });
        Ok(safe)
    }
}

/// Attester service driven by the beacon node's duty schedule.
pub struct BeaconValidatorService {
    context: ServiceContext,
    running: AtomicBool,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl BeaconValidatorService {
    pub fn new(context: ServiceContext) -> Self {
        Self {
            context,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ValidatorService for BeaconValidatorService {
    fn public_key(&self) -> &PublicKey {
        &self.context.key.public_key
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let span = self.context.logger.clone();
        let beacon = self.context.beacon.clone();
        let (genesis, index) = async {
            let version = beacon.node_version().await?;
            let genesis = beacon.genesis().await?;
            let info = beacon.validator(self.public_key()).await?;
            if let Some(info) = info.as_ref().filter(|info| !info.status.is_active()) {
                warn!(status = ?info.status, "Validator is not active yet, duties start once it is");
            }
            let index = info.map(|info| info.index);
            info!(
                url = %self.context.endpoint.url,
                container = self.context.endpoint.container_id.as_deref().unwrap_or("-"),
                %version,
                network = %self.context.network.config_name,
                index = ?index,
                graffiti = self.context.graffiti.as_deref().unwrap_or(""),
                "Validator service starting"
            );
            Ok::<_, ServiceError>((genesis, index))
        }
        .instrument(span.clone())
        .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = DutyRunner {
            context: self.context.clone(),
            genesis,
        };
        let handle = tokio::spawn(runner.run(index, shutdown_rx).instrument(span));

        *task = Some((shutdown_tx, handle));
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let Some((shutdown, handle)) = self.task.lock().await.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        let _ = shutdown.send(true);
        handle
            .await
            .map_err(|e| ServiceError::Task(e.to_string()))?;
        info!(parent: &self.context.logger, "Validator service stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::Checkpoint;
    use crate::slashing::SlashingProtectionDb;
    use crate::testing::{test_key, test_validator_key, MockBeacon, GENESIS_ROOT};
    use tempfile::TempDir;

    fn context(beacon: Arc<MockBeacon>, temp_dir: &TempDir) -> (ServiceContext, EventBus) {
        let events = EventBus::new(16);
        let store = SlashingProtectionDb::open(temp_dir.path().join("slashing.json")).unwrap();
        let context = ServiceContext {
            key: test_validator_key(1),
            endpoint: BeaconNodeEndpoint::new(beacon.base_url()),
            network: NetworkConfig::mainnet(),
            slashing_protection: Arc::new(store),
            beacon,
            logger: Span::none(),
            events: events.clone(),
            graffiti: None,
        };
        (context, events)
    }

    fn duty(slot: u64) -> AttesterDuty {
        AttesterDuty {
            pubkey: test_key(1),
            validator_index: 7,
            committee_index: 3,
            committee_length: 10,
            committees_at_slot: 4,
            validator_committee_index: 2,
            slot,
        }
    }

    fn data(slot: u64, source: u64, target: u64, block: u8) -> AttestationData {
        AttestationData {
            slot,
            index: 3,
            beacon_block_root: Root([block; 32]),
            source: Checkpoint {
                epoch: source,
                root: Root([0x11; 32]),
            },
            target: Checkpoint {
                epoch: target,
                root: Root([0x22; 32]),
            },
        }
    }

    fn runner(context: ServiceContext) -> DutyRunner {
        DutyRunner {
            context,
            genesis: Genesis {
                genesis_time: 0,
                genesis_validators_root: GENESIS_ROOT,
                genesis_fork_version: "0x00000000".to_string(),
            },
        }
    }

    #[test]
    fn test_signing_root_depends_on_chain_and_data() {
        let a = attestation_signing_root(GENESIS_ROOT, &data(1, 0, 1, 1)).unwrap();
        let b = attestation_signing_root(Root([0x01; 32]), &data(1, 0, 1, 1)).unwrap();
        let c = attestation_signing_root(GENESIS_ROOT, &data(1, 0, 1, 2)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, attestation_signing_root(GENESIS_ROOT, &data(1, 0, 1, 1)).unwrap());
    }

    #[tokio::test]
    async fn test_attest_signs_submits_and_publishes() {
        let temp_dir = TempDir::new().unwrap();
        let beacon = Arc::new(MockBeacon::new());
        beacon.set_attestation_data(data(100, 2, 3, 0xAB));
        let (context, events) = context(beacon.clone(), &temp_dir);
        let mut rx = events.subscribe();

        let runner = runner(context);
        assert_eq!(runner.attest(&duty(100)).await.unwrap(), Safe::Valid);

        let submitted = beacon.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].data.slot, 100);
        assert_eq!(submitted[0].aggregation_bits, aggregation_bits(10, 2));
        assert!(submitted[0].signature.starts_with("0x"));

        match rx.recv().await.unwrap() {
            LifecycleEvent::AttestationSigned {
                slot,
                committee_index,
                beacon_block_root,
                ..
            } => {
                assert_eq!(slot, 100);
                assert_eq!(committee_index, 3);
                assert_eq!(beacon_block_root, Root([0xAB; 32]));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attest_refuses_double_vote() {
        let temp_dir = TempDir::new().unwrap();
        let beacon = Arc::new(MockBeacon::new());
        let (context, _events) = context(beacon.clone(), &temp_dir);
        let runner = runner(context);

        beacon.set_attestation_data(data(100, 2, 3, 0x01));
        runner.attest(&duty(100)).await.unwrap();

        // Same data again is not re-submitted.
        assert_eq!(runner.attest(&duty(100)).await.unwrap(), Safe::SameData);
        assert_eq!(beacon.submitted().len(), 1);

        beacon.set_attestation_data(data(101, 2, 3, 0x02));
        let err = runner.attest(&duty(101)).await.unwrap_err();
        assert!(matches!(err, DutyError::Slashing(SlashingProtectionError::DoubleVote { .. })));
        assert_eq!(beacon.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let beacon = Arc::new(MockBeacon::new());
        let (context, _events) = context(beacon, &temp_dir);
        let service = BeaconValidatorService::new(context);

        assert!(!service.is_running());
        service.start().await.unwrap();
        assert!(service.is_running());
        service.start().await.unwrap();

        service.stop().await.unwrap();
        assert!(!service.is_running());
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_node_unreachable() {
        let temp_dir = TempDir::new().unwrap();
        let beacon = Arc::new(MockBeacon::unreachable());
        let (context, _events) = context(beacon, &temp_dir);
        let service = BeaconValidatorService::new(context);

        assert!(matches!(service.start().await, Err(ServiceError::Beacon(_))));
        assert!(!service.is_running());
    }
}
