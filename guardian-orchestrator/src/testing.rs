//! In-memory collaborators shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use guardian_keystore::{SigningCredential, ValidatorKey};
use parking_lot::Mutex;
use serde_json::json;

use crate::beacon::{
    Attestation, AttestationData, AttesterDuty, BeaconApi, BeaconConnector, BeaconError, Checkpoint,
    Genesis, ValidatorInfo, ValidatorStatus,
};
use crate::gate::{Decision, DecisionPrompt, DecisionSender};
use crate::network::NetworkConfig;
use crate::service::{ServiceContext, ServiceError, ServiceFactory, ValidatorService};
use crate::types::{BeaconNodeEndpoint, PublicKey, Root};

pub const GENESIS_ROOT: Root = Root([0x4b; 32]);

pub fn test_key(byte: u8) -> PublicKey {
    PublicKey::from_bytes(&[byte; 48]).unwrap()
}

pub fn test_credential() -> SigningCredential {
    SigningCredential::new(Arc::new(|domain: &[u8], message: &[u8]| {
        let mut signature = vec![0u8; 96];
        signature[..domain.len()].copy_from_slice(domain);
        signature[domain.len()..domain.len() + message.len()].copy_from_slice(message);
        Ok(signature)
    }))
}

pub fn test_validator_key(byte: u8) -> ValidatorKey {
    ValidatorKey {
        public_key: test_key(byte),
        name: None,
        credential: test_credential(),
    }
}

/// A minimal valid interchange document for `public_key`.
pub fn interchange_json(root: Root, public_key: &PublicKey) -> String {
    json!({
        "metadata": {
            "interchange_format_version": "5",
            "genesis_validators_root": root.to_string(),
        },
        "data": [{
            "pubkey": public_key.to_string(),
            "signed_blocks": [{"slot": "100"}],
            "signed_attestations": [{"source_epoch": "2", "target_epoch": "3"}],
        }],
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reachability {
    Up,
    Down,
    /// `spec` never answers; everything else works.
    SpecHangs,
}

pub struct MockBeacon {
    url: String,
    reachability: Reachability,
    genesis_root: Root,
    attestation_data: Mutex<Option<AttestationData>>,
    validator: Mutex<Option<ValidatorInfo>>,
    submitted: Mutex<Vec<Attestation>>,
    spec_calls: AtomicUsize,
    genesis_calls: AtomicUsize,
}

impl MockBeacon {
    fn with(reachability: Reachability) -> Self {
        Self {
            url: "http://beacon.test:5052".to_string(),
            reachability,
            genesis_root: GENESIS_ROOT,
            attestation_data: Mutex::new(None),
            validator: Mutex::new(Some(ValidatorInfo {
                index: 7,
                balance: 32_000_000_000,
                status: ValidatorStatus::ActiveOngoing,
            })),
            submitted: Mutex::new(Vec::new()),
            spec_calls: AtomicUsize::new(0),
            genesis_calls: AtomicUsize::new(0),
        }
    }

    pub fn new() -> Self {
        Self::with(Reachability::Up)
    }

    pub fn unreachable() -> Self {
        Self::with(Reachability::Down)
    }

    pub fn spec_hangs() -> Self {
        Self::with(Reachability::SpecHangs)
    }

    pub fn set_attestation_data(&self, data: AttestationData) {
        *self.attestation_data.lock() = Some(data);
    }

    pub fn set_validator(&self, info: Option<ValidatorInfo>) {
        *self.validator.lock() = info;
    }

    pub fn submitted(&self) -> Vec<Attestation> {
        self.submitted.lock().clone()
    }

    pub fn spec_calls(&self) -> usize {
        self.spec_calls.load(Ordering::SeqCst)
    }

    pub fn genesis_calls(&self) -> usize {
        self.genesis_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BeaconError> {
        match self.reachability {
            Reachability::Down => Err(BeaconError::Status {
                status: 503,
                body: "unreachable".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BeaconApi for MockBeacon {
    fn base_url(&self) -> &str {
        &self.url
    }

    async fn node_version(&self) -> Result<String, BeaconError> {
        self.check()?;
        Ok("Mock/v1.0.0".to_string())
    }

    async fn genesis(&self) -> Result<Genesis, BeaconError> {
        self.genesis_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(Genesis {
            genesis_time: 1_606_824_023,
            genesis_validators_root: self.genesis_root,
            genesis_fork_version: "0x00000000".to_string(),
        })
    }

    async fn spec(&self) -> Result<BTreeMap<String, serde_json::Value>, BeaconError> {
        self.spec_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if self.reachability == Reachability::SpecHangs {
            std::future::pending::<()>().await;
        }
        Ok([
            ("CONFIG_NAME", "devnet"),
            ("PRESET_BASE", "mainnet"),
            ("SECONDS_PER_SLOT", "6"),
            ("SLOTS_PER_EPOCH", "32"),
            ("GENESIS_FORK_VERSION", "0x10000038"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect())
    }

    async fn validator(&self, _public_key: &PublicKey) -> Result<Option<ValidatorInfo>, BeaconError> {
        self.check()?;
        Ok(self.validator.lock().clone())
    }

    async fn attester_duties(&self, _epoch: u64, _indices: &[u64]) -> Result<Vec<AttesterDuty>, BeaconError> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn attestation_data(&self, slot: u64, committee_index: u64) -> Result<AttestationData, BeaconError> {
        self.check()?;
        Ok(self.attestation_data.lock().clone().unwrap_or(AttestationData {
            slot,
            index: committee_index,
            beacon_block_root: Root([0xbb; 32]),
            source: Checkpoint {
                epoch: 0,
                root: Root::default(),
            },
            target: Checkpoint {
                epoch: slot / 32,
                root: Root::default(),
            },
        }))
    }

    async fn submit_attestations(&self, attestations: &[Attestation]) -> Result<(), BeaconError> {
        self.check()?;
        self.submitted.lock().extend_from_slice(attestations);
        Ok(())
    }
}

/// Hands out the same beacon for every endpoint.
pub struct MockConnector {
    beacon: Arc<MockBeacon>,
    connected: Mutex<Vec<BeaconNodeEndpoint>>,
}

impl MockConnector {
    pub fn new(beacon: Arc<MockBeacon>) -> Self {
        Self {
            beacon,
            connected: Mutex::new(Vec::new()),
        }
    }

    pub fn connected(&self) -> Vec<BeaconNodeEndpoint> {
        self.connected.lock().clone()
    }
}

impl BeaconConnector for MockConnector {
    fn connect(&self, endpoint: &BeaconNodeEndpoint) -> Result<Arc<dyn BeaconApi>, BeaconError> {
        self.connected.lock().push(endpoint.clone());
        Ok(self.beacon.clone())
    }
}

enum Script {
    Reply(Decision),
    /// Drop the sender without answering.
    Hangup,
    /// Keep the sender for the test to answer.
    Park,
}

/// Decision prompt answering from a script and counting open/close calls.
pub struct ScriptedPrompt {
    script: Script,
    parked: Mutex<Vec<DecisionSender>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl ScriptedPrompt {
    /// Answer every prompt with `decision`; `None` hangs up instead.
    pub fn new(decision: Option<Decision>) -> Self {
        Self::with(decision.map(Script::Reply).unwrap_or(Script::Hangup))
    }

    pub fn parking() -> Self {
        Self::with(Script::Park)
    }

    fn with(script: Script) -> Self {
        Self {
            script,
            parked: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until a prompt has been parked and return its sender.
    pub async fn parked_sender(&self) -> DecisionSender {
        loop {
            if let Some(sender) = self.parked.lock().last().cloned() {
                return sender;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl DecisionPrompt for ScriptedPrompt {
    async fn open(&self, _public_key: &PublicKey, sender: DecisionSender) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Reply(decision) => sender.send(decision.clone()).unwrap(),
            Script::Hangup => drop(sender),
            Script::Park => self.parked.lock().push(sender),
        }
    }

    async fn close(&self, _public_key: &PublicKey) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.parked.lock().clear();
    }
}

pub struct MockService {
    public_key: PublicKey,
    running: AtomicBool,
    start_delay: Duration,
    fail_start: bool,
}

impl MockService {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            running: AtomicBool::new(false),
            start_delay: Duration::ZERO,
            fail_start: false,
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn failing_start(mut self, fail: bool) -> Self {
        self.fail_start = fail;
        self
    }
}

#[async_trait]
impl ValidatorService for MockService {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    async fn start(&self) -> Result<(), ServiceError> {
        tokio::time::sleep(self.start_delay).await;
        if self.fail_start {
            return Err(ServiceError::Init("mock start failure".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Builds [`MockService`]s and remembers what it was asked to build.
#[derive(Default)]
pub struct MockServiceFactory {
    fail_start: bool,
    start_delay: Duration,
    created: AtomicUsize,
    networks: Mutex<Vec<NetworkConfig>>,
    services: Mutex<Vec<Arc<MockService>>>,
}

impl MockServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_network(&self) -> Option<NetworkConfig> {
        self.networks.lock().last().cloned()
    }

    pub fn running(&self) -> usize {
        self.services.lock().iter().filter(|s| s.is_running()).count()
    }
}

impl ServiceFactory for MockServiceFactory {
    fn create(&self, context: ServiceContext) -> Result<Arc<dyn ValidatorService>, ServiceError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.networks.lock().push(context.network);
        let service = Arc::new(
            MockService::new(context.key.public_key)
                .with_start_delay(self.start_delay)
                .failing_start(self.fail_start),
        );
        self.services.lock().push(service.clone());
        Ok(service)
    }
}
