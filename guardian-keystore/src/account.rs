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

//! Account layer: which validator keys exist and which network each belongs to.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::key::{PublicKey, SigningCredential, ValidatorKey};
use crate::remote::{create_remote_credential, ping, RemoteSignError, RemoteSignerConfig};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("validator key {public_key} not found")]
    KeyNotFound { public_key: PublicKey },

    #[error("failed to access accounts file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse accounts file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to set up signing credential: {0}")]
    Credential(#[from] RemoteSignError),
}

/// Read access to the validator keys of the signed-in account.
pub trait AccountStore: Send + Sync {
    fn load_key(&self, public_key: &PublicKey) -> Result<ValidatorKey, AccountError>;

    fn network(&self, public_key: &PublicKey) -> Result<String, AccountError>;

    fn public_keys(&self) -> Vec<PublicKey>;
}

/// One validator in the accounts file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub public_key: PublicKey,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub remote_signer: RemoteSignerConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsDocument {
    #[serde(default)]
    validators: Vec<AccountEntry>,
}

/// JSON file listing the validators managed on this machine.
///
/// ```json
/// {"validators": [{"public_key": "0x…", "network": "mainnet",
///                  "remote_signer": {"socket_path": "/var/run/guardian-signer.sock"}}]}
/// ```
pub struct AccountsFile {
    path: PathBuf,
    entries: RwLock<Vec<AccountEntry>>,
}

impl AccountsFile {
    /// Load the accounts file; a missing file is an empty account.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, AccountError> {
        let path = path.into();
        let document = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            AccountsDocument::default()
        };
        info!(
            path = ?path,
            validators = document.validators.len(),
            "Loaded accounts file"
        );

        Ok(Self {
            path,
            entries: RwLock::new(document.validators),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or replace a validator entry and persist the file.
    pub fn upsert(&self, entry: AccountEntry) -> Result<(), AccountError> {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.public_key == entry.public_key) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.persist(&entries)
    }

    /// Remove a validator entry; returns whether it existed.
    pub fn remove(&self, public_key: &PublicKey) -> Result<bool, AccountError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| &e.public_key != public_key);
        let removed = entries.len() != before;
        if removed {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    /// Ping the remote signer of every validator. Returns the validators
    /// whose signer did not answer.
    pub fn check_signers(&self) -> Vec<(PublicKey, RemoteSignError)> {
        let entries = self.entries.read().clone();
        entries
            .into_iter()
            .filter_map(|entry| match ping(&entry.remote_signer.socket_path) {
                Ok(()) => {
                    debug!(validator = %entry.public_key, "Remote signer reachable");
                    None
                }
                Err(e) => {
                    warn!(
                        validator = %entry.public_key,
                        socket = ?entry.remote_signer.socket_path,
                        error = %e,
                        "Remote signer unreachable"
                    );
                    Some((entry.public_key, e))
                }
            })
            .collect()
    }

    fn entry(&self, public_key: &PublicKey) -> Result<AccountEntry, AccountError> {
        self.entries
            .read()
            .iter()
            .find(|e| &e.public_key == public_key)
            .cloned()
            .ok_or(AccountError::KeyNotFound {
                public_key: *public_key,
            })
    }

    fn persist(&self, entries: &[AccountEntry]) -> Result<(), AccountError> {
        let temp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let document = AccountsDocument {
            validators: entries.to_vec(),
        };
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        debug!(path = ?self.path, "Persisted accounts file");
        Ok(())
    }
}

impl AccountStore for AccountsFile {
    fn load_key(&self, public_key: &PublicKey) -> Result<ValidatorKey, AccountError> {
        let entry = self.entry(public_key)?;
        let credential = create_remote_credential(&entry.public_key, &entry.remote_signer)?;
        Ok(ValidatorKey {
            public_key: entry.public_key,
            name: entry.name,
            credential,
        })
    }

    fn network(&self, public_key: &PublicKey) -> Result<String, AccountError> {
        Ok(self.entry(public_key)?.network)
    }

    fn public_keys(&self) -> Vec<PublicKey> {
        self.entries.read().iter().map(|e| e.public_key).collect()
    }
}

/// In-memory account store, for embedding and tests.
#[derive(Default)]
pub struct StaticAccounts {
    keys: RwLock<HashMap<PublicKey, (String, ValidatorKey)>>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, network: impl Into<String>, public_key: PublicKey, credential: SigningCredential) {
        let key = ValidatorKey {
            public_key,
            name: None,
            credential,
        };
        self.keys.write().insert(public_key, (network.into(), key));
    }
}

impl AccountStore for StaticAccounts {
    fn load_key(&self, public_key: &PublicKey) -> Result<ValidatorKey, AccountError> {
        self.keys
            .read()
            .get(public_key)
            .map(|(_, key)| key.clone())
            .ok_or(AccountError::KeyNotFound {
                public_key: *public_key,
            })
    }

    fn network(&self, public_key: &PublicKey) -> Result<String, AccountError> {
        self.keys
            .read()
            .get(public_key)
            .map(|(network, _)| network.clone())
            .ok_or(AccountError::KeyNotFound {
                public_key: *public_key,
            })
    }

    fn public_keys(&self) -> Vec<PublicKey> {
        self.keys.read().keys().copied().collect()
    }
}
