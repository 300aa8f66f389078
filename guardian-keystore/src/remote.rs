// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Remote signing credentials.
//!
//! A validator key configured with a [`RemoteSignerConfig`] never has its
//! secret on this machine. Every signature request is forwarded to a signer
//! daemon over a Unix socket using length-prefixed bincode frames.
//!
//! ```ignore
//! use guardian_keystore::remote::{create_remote_credential, RemoteSignerConfig};
//!
//! let config = RemoteSignerConfig {
//!     socket_path: PathBuf::from("/var/run/guardian-signer.sock"),
//!     verify_pubkey: true,
//! };
//! let credential = create_remote_credential(&public_key, &config)?;
//! let signature = credential.sign(&domain, &signing_root)?;
//! ```

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::key::{PublicKey, SigningCallback, SigningCredential};

/// Largest response frame accepted from the signer.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Configuration for remote signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSignerConfig {
    /// Path to the signer's Unix socket
    pub socket_path: PathBuf,
    /// Ask the signer for its public key before trusting it
    #[serde(default)]
    pub verify_pubkey: bool,
}

/// Key type understood by the signer daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Bls,
    Secp256k1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignRequest {
    key_type: KeyType,
    domain: Vec<u8>,
    message: Vec<u8>,
    request_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum SignResponse {
    Success { signature: Vec<u8>, request_id: u64 },
    Rejected { reason: String, request_id: u64 },
    Error { message: String, request_id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PubKeyRequest {
    key_type: KeyType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Request {
    Sign(SignRequest),
    GetPubKey(PubKeyRequest),
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PubKeyResponse {
    pubkey: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Response {
    Sign(SignResponse),
    PubKey(PubKeyResponse),
    Pong,
}

/// Error from remote signing operations.
#[derive(Debug, Error)]
pub enum RemoteSignError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Signer holds {actual}, expected {expected}")]
    PubkeyMismatch { expected: String, actual: String },
}

/// Build a credential that forwards signing to the remote signer.
///
/// With `verify_pubkey` set the signer is contacted once up front and must
/// report `public_key`; otherwise no connection is made until the first
/// signature is requested.
pub fn create_remote_credential(
    public_key: &PublicKey,
    config: &RemoteSignerConfig,
) -> Result<SigningCredential, RemoteSignError> {
    if config.verify_pubkey {
        let remote = fetch_pubkey(&config.socket_path)?;
        if remote.as_slice() != public_key.as_bytes().as_slice() {
            return Err(RemoteSignError::PubkeyMismatch {
                expected: public_key.to_string(),
                actual: format!("0x{}", hex::encode(&remote)),
            });
        }
    }

    let socket_path = config.socket_path.clone();
    let callback: SigningCallback = Arc::new(move |domain: &[u8], message: &[u8]| {
        send_sign_request(&socket_path, domain, message).map_err(|e| e.to_string())
    });

    Ok(SigningCredential::new(callback))
}

/// Check that the signer daemon is reachable.
pub fn ping(socket_path: &Path) -> Result<(), RemoteSignError> {
    match send_request(socket_path, &Request::Ping)? {
        Response::Pong => Ok(()),
        _ => Err(RemoteSignError::Protocol("Unexpected response".to_string())),
    }
}

fn send_request(socket_path: &Path, request: &Request) -> Result<Response, RemoteSignError> {
    let mut stream = UnixStream::connect(socket_path)?;

    let request_bytes = bincode::serialize(request)?;
    let len_bytes = (request_bytes.len() as u32).to_le_bytes();
    stream.write_all(&len_bytes)?;
    stream.write_all(&request_bytes)?;
    stream.flush()?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_FRAME_LEN {
        return Err(RemoteSignError::Protocol(format!(
            "Response too large: {msg_len} bytes"
        )));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf)?;

    Ok(bincode::deserialize(&msg_buf)?)
}

fn send_sign_request(
    socket_path: &Path,
    domain: &[u8],
    message: &[u8],
) -> Result<Vec<u8>, RemoteSignError> {
    let request_id = generate_request_id();
    debug!(request_id, domain = %hex::encode(domain), "Forwarding sign request");

    let request = Request::Sign(SignRequest {
        key_type: KeyType::Bls,
        domain: domain.to_vec(),
        message: message.to_vec(),
        request_id,
    });

    match send_request(socket_path, &request)? {
        Response::Sign(SignResponse::Success { signature, .. }) => Ok(signature),
        Response::Sign(SignResponse::Rejected { reason, .. }) => {
            Err(RemoteSignError::Protocol(format!("Rejected: {}", reason)))
        }
        Response::Sign(SignResponse::Error { message, .. }) => {
            Err(RemoteSignError::Protocol(format!("Error: {}", message)))
        }
        _ => Err(RemoteSignError::Protocol("Unexpected response".to_string())),
    }
}

fn fetch_pubkey(socket_path: &Path) -> Result<Vec<u8>, RemoteSignError> {
    let request = Request::GetPubKey(PubKeyRequest {
        key_type: KeyType::Bls,
    });

    match send_request(socket_path, &request)? {
        Response::PubKey(PubKeyResponse { pubkey }) => Ok(pubkey),
        _ => Err(RemoteSignError::Protocol("Unexpected response".to_string())),
    }
}

/// Timestamp mixed with randomness so retries are distinguishable.
fn generate_request_id() -> u64 {
    use rand::Rng;
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random: u32 = rand::thread_rng().gen();
    timestamp ^ (random as u64)
}
