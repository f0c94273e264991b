// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Credentials and the `ssh-userauth` method set.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use skiff_cryptovec::CryptoVec;
use skiff_keys::key;
use thiserror::Error;

bitflags! {
	/// Set of authentication methods, represented by bit flags.
	pub struct MethodSet: u32 {
		const NONE = 1;
		const PASSWORD = 2;
		const PUBLICKEY = 4;
		const HOSTBASED = 8;
		const KEYBOARD_INTERACTIVE = 16;
	}
}

impl MethodSet {
	pub(crate) fn from_name(name:&[u8]) -> Option<MethodSet> {
		match name {
			b"none" => Some(MethodSet::NONE),
			b"password" => Some(MethodSet::PASSWORD),
			b"publickey" => Some(MethodSet::PUBLICKEY),
			b"hostbased" => Some(MethodSet::HOSTBASED),
			b"keyboard-interactive" => Some(MethodSet::KEYBOARD_INTERACTIVE),
			_ => None,
		}
	}

	/// Parse the comma-separated method list of a `USERAUTH_FAILURE`.
	pub(crate) fn from_server_list(list:&[u8]) -> MethodSet {
		let mut set = MethodSet::empty();

		for name in list.split(|&b| b == b',') {
			if let Some(m) = MethodSet::from_name(name) {
				set |= m
			}
		}

		set
	}
}

#[derive(Debug, Error)]
pub enum AgentAuthError {
	#[error("Unable to connect to the signing agent")]
	Connect,

	#[error("The agent refused to sign")]
	Refused,
}

/// An external signer, typically backed by an SSH agent. Only the
/// signing hook is modelled here; the agent wire protocol is not.
#[async_trait]
pub trait Signer: Send + Sync {
	/// The public half of the key this signer holds.
	fn public_key(&self) -> key::PublicKey;

	/// Produce an SSH signature blob over `to_sign`.
	async fn auth_publickey_sign(&self, to_sign:&[u8]) -> Result<CryptoVec, AgentAuthError>;
}

/// One way of authenticating, tried in the order configured.
#[derive(Clone)]
pub enum Credential {
	Password(String),
	Key(Arc<key::KeyPair>),
	KeyFile { path:PathBuf, password:Option<String> },
	Agent(Arc<dyn Signer>),
	KeyboardInteractive,
}

impl std::fmt::Debug for Credential {
	fn fmt(&self, f:&mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
		match self {
			Credential::Password(_) => write!(f, "Password(***)"),
			Credential::Key(key) => write!(f, "Key({:?})", key.name()),
			Credential::KeyFile { path, .. } => write!(f, "KeyFile({:?})", path),
			Credential::Agent(_) => write!(f, "Agent"),
			Credential::KeyboardInteractive => write!(f, "KeyboardInteractive"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_list_parsing() {
		let set = MethodSet::from_server_list(b"publickey,password");

		assert!(set.contains(MethodSet::PUBLICKEY));

		assert!(set.contains(MethodSet::PASSWORD));

		assert!(!set.contains(MethodSet::KEYBOARD_INTERACTIVE));

		// Unknown methods are ignored rather than rejected.
		let set = MethodSet::from_server_list(b"gssapi-with-mic,password");

		assert_eq!(set, MethodSet::PASSWORD);
	}

	#[test]
	fn passwords_do_not_leak_through_debug() {
		let c = Credential::Password("hunter2".into());

		assert!(!format!("{:?}", c).contains("hunter2"));
	}
}
