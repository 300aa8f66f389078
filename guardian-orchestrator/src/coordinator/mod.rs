//! Orchestration coordinator.
//!
//! Sequences a validator start:
//!
//! ```text
//! Idle → ResolvingEndpoint → ResolvingConfig → GatingSlashingProtection
//!      → StartingService → Running
//! ```
//!
//! Any failure along the way ends in `Aborted` with nothing left registered.
//! Stopping goes `Running → Stopping → Idle`.
//!
//! The registry entry for a key is held for the whole sequence, so a second
//! start of the same key waits and then finds the running service.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use guardian_keystore::AccountStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use crate::beacon::{BeaconApi, BeaconConnector, ValidatorStatus};
use crate::config::OrchestratorConfig;
use crate::endpoint::{EndpointSelector, EndpointStore};
use crate::error::OrchestrationError;
use crate::events::{EventBus, LifecycleEvent};
use crate::gate::{DecisionPrompt, GateOutcome, SlashingProtectionGate};
use crate::network::ConfigResolver;
use crate::registry::{Ensured, RegistryEntry, ValidatorRegistry};
use crate::service::{ServiceContext, ServiceFactory};
use crate::slashing::SlashingProtection;
use crate::types::{BeaconNodeEndpoint, PublicKey};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationState {
    Idle,
    ResolvingEndpoint,
    ResolvingConfig,
    GatingSlashingProtection,
    StartingService,
    Running,
    Stopping,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub public_key: PublicKey,
    pub from: OrchestrationState,
    pub to: OrchestrationState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

pub struct Coordinator {
    config: OrchestratorConfig,
    accounts: Arc<dyn AccountStore>,
    selector: EndpointSelector,
    connector: Arc<dyn BeaconConnector>,
    slashing_protection: Arc<dyn SlashingProtection>,
    prompt: Arc<dyn DecisionPrompt>,
    factory: Arc<dyn ServiceFactory>,
    registry: ValidatorRegistry,
    resolver: ConfigResolver,
    events: EventBus,
    states: RwLock<HashMap<PublicKey, OrchestrationState>>,
    transitions: broadcast::Sender<StateTransition>,
}

impl Coordinator {
    pub fn new(
        config: OrchestratorConfig,
        accounts: Arc<dyn AccountStore>,
        endpoints: Arc<dyn EndpointStore>,
        connector: Arc<dyn BeaconConnector>,
        slashing_protection: Arc<dyn SlashingProtection>,
        prompt: Arc<dyn DecisionPrompt>,
        factory: Arc<dyn ServiceFactory>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            resolver: ConfigResolver::new(config.config_fetch_timeout),
            events: EventBus::new(config.event_capacity),
            config,
            accounts,
            selector: EndpointSelector::new(endpoints),
            connector,
            slashing_protection,
            prompt,
            factory,
            registry: ValidatorRegistry::new(),
            states: RwLock::new(HashMap::new()),
            transitions,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    /// Last state of `public_key`; keys never seen are `Idle`.
    pub fn state(&self, public_key: &PublicKey) -> OrchestrationState {
        self.states
            .read()
            .get(public_key)
            .copied()
            .unwrap_or(OrchestrationState::Idle)
    }

    fn transition(&self, public_key: &PublicKey, to: OrchestrationState) {
        let from = self
            .states
            .write()
            .insert(*public_key, to)
            .unwrap_or(OrchestrationState::Idle);
        debug!(validator = %public_key.short(), ?from, ?to, "Orchestration transition");
        let _ = self.transitions.send(StateTransition {
            public_key: *public_key,
            from,
            to,
        });
    }

    /// Start the validator service for `public_key`.
    pub async fn start(&self, public_key: &PublicKey) -> Result<StartOutcome, OrchestrationError> {
        let mut entry = self.registry.lock(*public_key).await;
        if let Some(service) = entry.current() {
            if service.is_running() {
                debug!(validator = %public_key.short(), "Validator already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        match self.run_start(&mut entry).await {
            Ok(()) => {
                self.transition(public_key, OrchestrationState::Running);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                let step = self.state(public_key);
                if e.is_cancellation() {
                    info!(validator = %public_key.short(), ?step, "Validator start cancelled");
                } else {
                    error!(validator = %public_key.short(), ?step, error = %e, "Validator start aborted");
                }
                self.transition(public_key, OrchestrationState::Aborted);
                Err(e)
            }
        }
    }

    async fn run_start(&self, entry: &mut RegistryEntry) -> Result<(), OrchestrationError> {
        let public_key = *entry.public_key();

        self.transition(&public_key, OrchestrationState::ResolvingEndpoint);
        if entry.is_occupied() {
            return Err(OrchestrationError::RegistryConflict {
                public_key,
                reason: "registered service is not running".to_string(),
            });
        }
        let key = self.accounts.load_key(&public_key)?;
        let network = self.accounts.network(&public_key)?;
        let endpoint = self.selector.select(&public_key).await?;

        self.transition(&public_key, OrchestrationState::ResolvingConfig);
        let beacon = self.connector.connect(&endpoint)?;
        let resolved = self.resolver.resolve(beacon.as_ref(), &network).await;
        let degraded = resolved.is_degraded();

        self.transition(&public_key, OrchestrationState::GatingSlashingProtection);
        let mut gate = SlashingProtectionGate::new(
            public_key,
            self.slashing_protection.clone(),
            self.prompt.clone(),
            beacon.clone(),
        );
        match gate.run().await? {
            GateOutcome::Clean => {}
            GateOutcome::Imported(summary) => {
                info!(validator = %public_key.short(), ?summary, "Slashing protection history imported");
            }
            GateOutcome::Skipped => {}
        }

        self.transition(&public_key, OrchestrationState::StartingService);
        let logger = info_span!("validator", pubkey = %public_key.short(), network = %network);
        let context = ServiceContext {
            key,
            endpoint: endpoint.clone(),
            network: resolved.config,
            slashing_protection: self.slashing_protection.clone(),
            beacon,
            logger: logger.clone(),
            events: self.events.clone(),
            graffiti: self.config.graffiti.clone(),
        };
        let factory = self.factory.clone();
        let (_, ensured) = entry.ensure(move || factory.create(context)).await?;

        if ensured == Ensured::Created {
            info!(
                validator = %public_key.short(),
                url = %endpoint.url,
                degraded_config = degraded,
                "Validator started"
            );
            self.events.publish(LifecycleEvent::ValidatorStarted { public_key, logger });
        }
        Ok(())
    }

    /// Stop the validator service for `public_key`. No service is a no-op.
    pub async fn stop(&self, public_key: &PublicKey) -> Result<(), OrchestrationError> {
        let mut entry = self.registry.lock(*public_key).await;
        if !entry.is_occupied() {
            debug!(validator = %public_key.short(), "Stop requested for validator that is not running");
            return Ok(());
        }

        self.transition(public_key, OrchestrationState::Stopping);
        let result = entry.remove().await;
        drop(entry);

        self.transition(public_key, OrchestrationState::Idle);
        self.events.publish(LifecycleEvent::ValidatorStopped {
            public_key: *public_key,
        });

        match result {
            Ok(_) => {
                info!(validator = %public_key.short(), "Validator stopped");
                Ok(())
            }
            Err(e) => {
                error!(validator = %public_key.short(), error = %e, "Validator service did not stop cleanly");
                Err(OrchestrationError::ServiceStop(e))
            }
        }
    }

    /// Stop every running service.
    pub async fn stop_all(&self) {
        for public_key in self.registry.running() {
            if let Err(e) = self.stop(&public_key).await {
                warn!(validator = %public_key.short(), error = %e, "Failed to stop validator");
            }
        }
    }

    /// Replace the beacon nodes assigned to `public_key`.
    ///
    /// Takes effect on the next start; a running service keeps its node.
    pub async fn set_beacon_nodes(
        &self,
        public_key: &PublicKey,
        nodes: Vec<BeaconNodeEndpoint>,
    ) -> Result<(), OrchestrationError> {
        self.selector.store().upsert(public_key, nodes.clone()).await?;
        info!(validator = %public_key.short(), nodes = nodes.len(), "Beacon nodes updated");
        self.events.publish(LifecycleEvent::ValidatorBeaconNodesUpdated {
            public_key: *public_key,
            nodes,
        });
        Ok(())
    }

    async fn beacon_for(&self, public_key: &PublicKey) -> Result<Arc<dyn BeaconApi>, OrchestrationError> {
        let endpoint = self.selector.select(public_key).await?;
        Ok(self.connector.connect(&endpoint)?)
    }

    /// Chain status of the validator as reported by its beacon node.
    pub async fn validator_status(&self, public_key: &PublicKey) -> Result<ValidatorStatus, OrchestrationError> {
        let beacon = self.beacon_for(public_key).await?;
        Ok(beacon
            .validator(public_key)
            .await?
            .map(|info| info.status)
            .unwrap_or(ValidatorStatus::Unknown))
    }

    /// Write slashing protection history for `public_keys` (all account keys
    /// when empty) to `path`. Returns the number of validators exported.
    pub async fn export_slashing_protection(
        &self,
        public_keys: &[PublicKey],
        path: &Path,
    ) -> Result<usize, OrchestrationError> {
        let keys = if public_keys.is_empty() {
            self.accounts.public_keys()
        } else {
            public_keys.to_vec()
        };
        let first = keys
            .first()
            .ok_or_else(|| OrchestrationError::InvalidRequest("no validator keys to export".to_string()))?;

        let genesis = self.beacon_for(first).await?.genesis().await?;
        let interchange = self
            .slashing_protection
            .export_interchange(genesis.genesis_validators_root, &keys)
            .await?;
        let json = interchange
            .to_json_pretty()
            .map_err(|e| OrchestrationError::InvalidRequest(e.to_string()))?;

        tokio::fs::write(path, json)
            .await
            .map_err(|source| OrchestrationError::Io {
                path: path.display().to_string(),
                source,
            })?;
        info!(path = ?path, validators = interchange.data.len(), "Exported slashing protection history");
        Ok(interchange.data.len())
    }
}
