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

//! Validator accounts for the guardian orchestrator.
//!
//! The orchestrator never owns key material. It asks an [`AccountStore`] for a
//! [`ValidatorKey`] by public key and hands the key's [`SigningCredential`] to
//! the validator service. Credentials produced by this crate delegate the
//! actual signing to a remote signer daemon (see [`remote`]).

pub mod account;
pub mod key;
pub mod remote;

pub use account::{AccountEntry, AccountError, AccountStore, AccountsFile, StaticAccounts};
pub use key::{PublicKey, PublicKeyError, SignError, SigningCallback, SigningCredential, ValidatorKey};
pub use remote::{create_remote_credential, RemoteSignError, RemoteSignerConfig};
