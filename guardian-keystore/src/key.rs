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

//! Validator key identity and signing credential.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a compressed BLS12-381 public key.
pub const PUBLIC_KEY_LEN: usize = 48;

/// Errors parsing a public key from its hex form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublicKeyError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("expected {PUBLIC_KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// Validator public key.
///
/// Externally represented as a `0x`-prefixed lowercase hex string; the prefix
/// is optional when parsing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PublicKeyError> {
        let array: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| PublicKeyError::Length(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// First four bytes, used to label log lines and spans.
    pub fn short(&self) -> String {
        format!("0x{}", hex::encode(&self.0[..4]))
    }
}

impl FromStr for PublicKey {
    type Err = PublicKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| PublicKeyError::Hex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error returned by a signing callback.
#[derive(Debug, Clone, Error)]
#[error("signing failed: {0}")]
pub struct SignError(pub String);

/// Callback performing the actual signature.
///
/// Takes the signing domain and the message (signing root) and returns the
/// serialized signature bytes or an error string.
pub type SigningCallback = Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Opaque handle able to produce signatures for one validator key.
///
/// Key material never passes through the orchestrator: the credential only
/// forwards signing requests to whatever sits behind the callback.
#[derive(Clone)]
pub struct SigningCredential {
    callback: SigningCallback,
}

impl SigningCredential {
    pub fn new(callback: SigningCallback) -> Self {
        Self { callback }
    }

    /// Sign `message` under `domain`.
    ///
    /// Remote callbacks block on socket I/O; async callers should run this on
    /// a blocking thread.
    pub fn sign(&self, domain: &[u8], message: &[u8]) -> Result<Vec<u8>, SignError> {
        (self.callback)(domain, message).map_err(SignError)
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningCredential(..)")
    }
}

/// A loaded validator key: identity plus the credential used to sign for it.
#[derive(Debug, Clone)]
pub struct ValidatorKey {
    pub public_key: PublicKey,
    pub name: Option<String>,
    pub credential: SigningCredential,
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "a99a76ed7796f7be22d5b7e85deeb7c5677e88e511e0b337618f8c4eb61349b4bf2d153f649f7b53359fe8b94a38e44c";

    #[test]
    fn test_parse_with_and_without_prefix() {
        let a: PublicKey = KEY_HEX.parse().unwrap();
        let b: PublicKey = format!("0x{KEY_HEX}").parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), format!("0x{KEY_HEX}"));
        assert_eq!(a.short(), "0xa99a76ed");
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = "0xabcd".parse::<PublicKey>().unwrap_err();
        assert_eq!(err, PublicKeyError::Length(2));
        assert!(matches!("0xzz".parse::<PublicKey>(), Err(PublicKeyError::Hex(_))));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let key: PublicKey = KEY_HEX.parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"0x{KEY_HEX}\""));

        let encoded = bincode::serialize(&key).unwrap();
        let decoded: PublicKey = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_credential_forwards_to_callback() {
        let credential = SigningCredential::new(Arc::new(|domain: &[u8], message: &[u8]| {
            let mut out = domain.to_vec();
            out.extend_from_slice(message);
            Ok(out)
        }));
        assert_eq!(credential.sign(&[1], &[2, 3]).unwrap(), vec![1, 2, 3]);

        let failing = SigningCredential::new(Arc::new(|_: &[u8], _: &[u8]| Err("offline".to_string())));
        assert_eq!(failing.sign(&[], &[]).unwrap_err().0, "offline");
    }
}
