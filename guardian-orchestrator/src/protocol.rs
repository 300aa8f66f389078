//! Wire protocol for the daemon's control socket.
//!
//! One request per connection. Both directions are a little-endian `u32`
//! length followed by that many bytes of bincode.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::beacon::ValidatorStatus;
use crate::coordinator::{OrchestrationState, StartOutcome};
use crate::error::OrchestrationError;
use crate::gate::Decision;
use crate::types::{BeaconNodeEndpoint, PublicKey};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Requests from the CLI (or any other client) to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Run the start sequence; answered once the validator runs or the start aborts.
    Start { public_key: PublicKey },
    Stop { public_key: PublicKey },
    /// Answer a pending slashing protection prompt.
    Decide { public_key: PublicKey, decision: Decision },
    SetBeaconNodes {
        public_key: PublicKey,
        nodes: Vec<BeaconNodeEndpoint>,
    },
    Status { public_key: PublicKey },
    List,
    Export {
        public_keys: Vec<PublicKey>,
        path: PathBuf,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub public_key: PublicKey,
    pub state: OrchestrationState,
    pub running: bool,
    pub awaiting_decision: bool,
    /// `None` when the beacon node could not be asked.
    pub chain_status: Option<ValidatorStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSummary {
    pub public_key: PublicKey,
    pub state: OrchestrationState,
    pub awaiting_decision: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Started(StartOutcome),
    Stopped,
    DecisionAccepted,
    BeaconNodesUpdated,
    Status(StatusReport),
    Validators(Vec<ValidatorSummary>),
    Exported { validators: usize },
    Pong,
    Error {
        message: String,
        /// Operator cancellation rather than a failure.
        cancelled: bool,
        retryable: bool,
    },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            cancelled: false,
            retryable: false,
        }
    }
}

impl From<&OrchestrationError> for Response {
    fn from(e: &OrchestrationError) -> Self {
        Response::Error {
            message: e.to_string(),
            cancelled: e.is_cancellation(),
            retryable: e.is_retryable(),
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PublicKey {
        PublicKey::from_bytes(&[3u8; 48]).unwrap()
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = Request::Decide {
            public_key: key(),
            decision: Decision::Upload("/tmp/interchange.json".into()),
        };
        write_frame(&mut client, &request).await.unwrap();
        let received: Request = read_frame(&mut server).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        let result: Result<Request, _> = read_frame(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn test_error_response_flags() {
        let response = Response::from(&OrchestrationError::UserCancelled);
        assert!(matches!(
            response,
            Response::Error {
                cancelled: true,
                retryable: false,
                ..
            }
        ));
    }
}
