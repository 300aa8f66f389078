//! Control socket server and client.
//!
//! Listens on a Unix socket and drives the [`Coordinator`]. Slashing
//! protection prompts raised while starting a validator are parked in the
//! [`SocketDecisionPrompt`] until a `Decide` request answers them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::gate::{Decision, DecisionClosed, DecisionPrompt, DecisionSender};
use crate::protocol::{
    read_frame, write_frame, ProtocolError, Request, Response, StatusReport, ValidatorSummary,
};
use crate::types::PublicKey;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("no slashing protection decision pending for {public_key}")]
    NotAwaiting { public_key: PublicKey },

    #[error(transparent)]
    Closed(#[from] DecisionClosed),
}

/// Decision prompt answered over the control socket.
#[derive(Default)]
pub struct SocketDecisionPrompt {
    pending: Mutex<HashMap<PublicKey, DecisionSender>>,
}

impl SocketDecisionPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, public_key: &PublicKey) -> bool {
        self.pending.lock().contains_key(public_key)
    }

    pub fn pending(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.pending.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn decide(&self, public_key: &PublicKey, decision: Decision) -> Result<(), PromptError> {
        let sender = self
            .pending
            .lock()
            .get(public_key)
            .cloned()
            .ok_or(PromptError::NotAwaiting {
                public_key: *public_key,
            })?;
        sender.send(decision)?;
        Ok(())
    }
}

#[async_trait]
impl DecisionPrompt for SocketDecisionPrompt {
    async fn open(&self, public_key: &PublicKey, sender: DecisionSender) {
        warn!(
            validator = %public_key,
            "No slashing protection history. Answer with `guardian-daemon decide {} upload <file>|skip|cancel`",
            public_key
        );
        self.pending.lock().insert(*public_key, sender);
    }

    async fn close(&self, public_key: &PublicKey) {
        self.pending.lock().remove(public_key);
    }
}

/// Control socket server.
pub struct ControlServer {
    listener: UnixListener,
    coordinator: Arc<Coordinator>,
    prompt: Arc<SocketDecisionPrompt>,
}

impl ControlServer {
    /// Bind the socket, replacing a stale socket file, owner-only permissions.
    pub fn bind(
        socket_path: &Path,
        coordinator: Arc<Coordinator>,
        prompt: Arc<SocketDecisionPrompt>,
    ) -> Result<Self, ServerError> {
        // Remove existing socket file if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!("Control server listening on {:?}", socket_path);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(socket_path, perms)?;
        }

        Ok(Self {
            listener,
            coordinator,
            prompt,
        })
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<(), ServerError> {
        let handler = Arc::new(Handler {
            coordinator: self.coordinator,
            prompt: self.prompt,
        });
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    debug!("New control connection");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_connection(stream).await {
                            error!("Error handling control connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

struct Handler {
    coordinator: Arc<Coordinator>,
    prompt: Arc<SocketDecisionPrompt>,
}

impl Handler {
    async fn handle_connection(&self, mut stream: UnixStream) -> Result<(), ServerError> {
        let request: Request = read_frame(&mut stream).await?;
        debug!(?request, "Control request");
        let response = self.handle(request).await;
        write_frame(&mut stream, &response).await?;
        Ok(())
    }

    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Start { public_key } => match self.coordinator.start(&public_key).await {
                Ok(outcome) => Response::Started(outcome),
                Err(e) => Response::from(&e),
            },
            Request::Stop { public_key } => match self.coordinator.stop(&public_key).await {
                Ok(()) => Response::Stopped,
                Err(e) => Response::from(&e),
            },
            Request::Decide {
                public_key,
                decision,
            } => match self.prompt.decide(&public_key, decision) {
                Ok(()) => Response::DecisionAccepted,
                Err(e) => Response::error(e.to_string()),
            },
            Request::SetBeaconNodes { public_key, nodes } => {
                match self.coordinator.set_beacon_nodes(&public_key, nodes).await {
                    Ok(()) => Response::BeaconNodesUpdated,
                    Err(e) => Response::from(&e),
                }
            }
            Request::Status { public_key } => {
                let chain_status = match self.coordinator.validator_status(&public_key).await {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!(validator = %public_key.short(), error = %e, "Chain status unavailable");
                        None
                    }
                };
                let running = self
                    .coordinator
                    .registry()
                    .running()
                    .contains(&public_key);
                Response::Status(StatusReport {
                    public_key,
                    state: self.coordinator.state(&public_key),
                    running,
                    awaiting_decision: self.prompt.is_pending(&public_key),
                    chain_status,
                })
            }
            Request::List => {
                let mut keys = self.coordinator.accounts().public_keys();
                keys.sort();
                Response::Validators(
                    keys.into_iter()
                        .map(|public_key| ValidatorSummary {
                            state: self.coordinator.state(&public_key),
                            awaiting_decision: self.prompt.is_pending(&public_key),
                            public_key,
                        })
                        .collect(),
                )
            }
            Request::Export { public_keys, path } => {
                match self
                    .coordinator
                    .export_slashing_protection(&public_keys, &path)
                    .await
                {
                    Ok(validators) => Response::Exported { validators },
                    Err(e) => Response::from(&e),
                }
            }
            Request::Ping => Response::Pong,
        }
    }
}

/// Client for the control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn request(&self, request: &Request) -> Result<Response, ProtocolError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        match self.request(&Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(ProtocolError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::coordinator::{OrchestrationState, StartOutcome};
    use crate::endpoint::{EndpointStore, MemoryEndpointStore};
    use crate::slashing::SlashingProtectionDb;
    use crate::testing::{test_credential, test_key, MockBeacon, MockConnector, MockServiceFactory};
    use crate::types::BeaconNodeEndpoint;
    use guardian_keystore::StaticAccounts;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn serve(temp_dir: &TempDir) -> (ControlClient, Arc<SocketDecisionPrompt>) {
        let accounts = Arc::new(StaticAccounts::new());
        accounts.insert("mainnet", test_key(1), test_credential());
        let endpoints = Arc::new(MemoryEndpointStore::new());
        endpoints
            .upsert(&test_key(1), vec![BeaconNodeEndpoint::new("http://beacon.test:5052")])
            .await
            .unwrap();
        let prompt = Arc::new(SocketDecisionPrompt::new());
        let coordinator = Arc::new(Coordinator::new(
            OrchestratorConfig::default(),
            accounts,
            endpoints,
            Arc::new(MockConnector::new(Arc::new(MockBeacon::new()))),
            Arc::new(SlashingProtectionDb::open(temp_dir.path().join("slashing.json")).unwrap()),
            prompt.clone(),
            Arc::new(MockServiceFactory::new()),
        ));

        let socket = temp_dir.path().join("control.sock");
        let server = ControlServer::bind(&socket, coordinator, prompt.clone()).unwrap();
        tokio::spawn(server.run());
        (ControlClient::new(socket), prompt)
    }

    #[tokio::test]
    async fn test_ping() {
        let temp_dir = TempDir::new().unwrap();
        let (client, _) = serve(&temp_dir).await;
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_waits_for_decision_over_socket() {
        let temp_dir = TempDir::new().unwrap();
        let (client, prompt) = serve(&temp_dir).await;

        let starter = client.clone();
        let start = tokio::spawn(async move {
            starter
                .request(&Request::Start {
                    public_key: test_key(1),
                })
                .await
        });

        while !prompt.is_pending(&test_key(1)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        match client.request(&Request::Status { public_key: test_key(1) }).await.unwrap() {
            Response::Status(report) => {
                assert!(report.awaiting_decision);
                assert_eq!(report.state, OrchestrationState::GatingSlashingProtection);
            }
            other => panic!("unexpected response {other:?}"),
        }

        let decided = client
            .request(&Request::Decide {
                public_key: test_key(1),
                decision: Decision::Skip,
            })
            .await
            .unwrap();
        assert_eq!(decided, Response::DecisionAccepted);
        assert_eq!(
            start.await.unwrap().unwrap(),
            Response::Started(StartOutcome::Started)
        );

        // Nothing is pending any more.
        let late = client
            .request(&Request::Decide {
                public_key: test_key(1),
                decision: Decision::Cancel,
            })
            .await
            .unwrap();
        assert!(matches!(late, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_cancel_is_reported_as_cancellation() {
        let temp_dir = TempDir::new().unwrap();
        let (client, prompt) = serve(&temp_dir).await;

        let starter = client.clone();
        let start = tokio::spawn(async move {
            starter
                .request(&Request::Start {
                    public_key: test_key(1),
                })
                .await
        });
        while !prompt.is_pending(&test_key(1)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        prompt.decide(&test_key(1), Decision::Cancel).unwrap();

        assert!(matches!(
            start.await.unwrap().unwrap(),
            Response::Error {
                cancelled: true,
                retryable: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_list_validators() {
        let temp_dir = TempDir::new().unwrap();
        let (client, _) = serve(&temp_dir).await;
        match client.request(&Request::List).await.unwrap() {
            Response::Validators(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].public_key, test_key(1));
                assert_eq!(list[0].state, OrchestrationState::Idle);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }
}
