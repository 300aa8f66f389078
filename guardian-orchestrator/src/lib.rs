//! Validator orchestration with a mandatory slashing protection gate.
//!
//! Starts and stops per-key validator services against remote beacon nodes
//! and refuses to let a key sign on this machine until slashing protection
//! history exists for it, has been imported, or the operator explicitly
//! skipped the import.
//!
//! ## Architecture
//!
//! ```text
//!                 start(key)
//!                     │
//!            ┌────────▼────────┐      ┌──────────────────┐
//!            │   Coordinator   │─────►│ EndpointSelector │  first assigned node
//!            └────────┬────────┘      └──────────────────┘
//!                     │               ┌──────────────────┐
//!                     ├──────────────►│  ConfigResolver  │  remote spec or default
//!                     │               └──────────────────┘
//!                     │               ┌──────────────────┐     ┌────────────────┐
//!                     ├──────────────►│ SlashingProtec-  │────►│ DecisionPrompt │
//!                     │               │ tionGate         │     └────────────────┘
//!                     │               └──────────────────┘
//!            ┌────────▼────────┐      ┌──────────────────┐
//!            │ValidatorRegistry│─────►│ ValidatorService │──► beacon node
//!            └─────────────────┘      └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! guardian-daemon serve \
//!     --accounts /var/lib/guardian/accounts.json \
//!     --beacon-nodes /var/lib/guardian/beacon-nodes.json \
//!     --slashing-db /var/lib/guardian/slashing-protection.json
//!
//! guardian-daemon start 0xa99a76ed...
//! guardian-daemon decide 0xa99a76ed... upload ./interchange.json
//! ```

pub mod beacon;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod gate;
pub mod interchange;
pub mod network;
mod persist;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod slashing;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use beacon::{BeaconApi, BeaconConnector, BeaconError, HttpBeaconClient, HttpConnector, ValidatorStatus};
pub use config::OrchestratorConfig;
pub use coordinator::{Coordinator, OrchestrationState, StartOutcome, StateTransition};
pub use endpoint::{EndpointSelector, EndpointStore, FileEndpointStore, MemoryEndpointStore};
pub use error::OrchestrationError;
pub use events::{EventBus, LifecycleEvent};
pub use gate::{Decision, DecisionPrompt, DecisionSender, GateOutcome, SlashingProtectionGate};
pub use interchange::{import_interchange_file, ImportError, Interchange};
pub use network::{ConfigResolver, NetworkConfig, ResolvedConfig};
pub use protocol::{Request, Response};
pub use registry::ValidatorRegistry;
pub use server::{ControlClient, ControlServer, SocketDecisionPrompt};
pub use service::{BeaconServiceFactory, BeaconValidatorService, ServiceContext, ServiceFactory, ValidatorService};
pub use slashing::{SlashingProtection, SlashingProtectionDb, SlashingProtectionError};
pub use types::{BeaconNodeEndpoint, PublicKey, Root};
