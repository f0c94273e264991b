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

//! Key-exchange session state: the transcript both sides hash, and the
//! client-side progression from `KEXINIT` to `NEWKEYS`.

use skiff_cryptovec::CryptoVec;

use crate::{cipher::OpeningKey, kex::KexAlgorithm, negotiation::Names};

/// Everything the exchange hash covers, collected as the handshake runs.
pub(crate) struct Exchange {
	pub client_id:CryptoVec,
	pub server_id:CryptoVec,
	pub client_kex_init:CryptoVec,
	pub server_kex_init:CryptoVec,
	pub server_host_key:CryptoVec,
	pub client_ephemeral:CryptoVec,
	pub server_ephemeral:CryptoVec,
}

impl Exchange {
	pub fn new(client_id:&[u8], server_id:&[u8]) -> Self {
		Exchange {
			client_id:CryptoVec::from_slice(client_id),
			server_id:CryptoVec::from_slice(server_id),
			client_kex_init:CryptoVec::new(),
			server_kex_init:CryptoVec::new(),
			server_host_key:CryptoVec::new(),
			client_ephemeral:CryptoVec::new(),
			server_ephemeral:CryptoVec::new(),
		}
	}
}

/// Our `KEXINIT` is out; waiting for the server's.
pub(crate) struct KexInit {
	pub exchange:Exchange,
	pub session_id:Option<CryptoVec>,
}

/// Our DH init is out; waiting for the server's reply.
pub(crate) struct KexDhDone {
	pub exchange:Exchange,
	pub kex:KexAlgorithm,
	pub names:Names,
	pub session_id:Option<CryptoVec>,
}

/// Keys are derived and our `NEWKEYS` is out; waiting for the server's.
/// Only the inbound half is still pending: the outbound side switched
/// the moment our `NEWKEYS` was written.
pub(crate) struct NewKeys {
	pub names:Names,
	pub session_id:CryptoVec,
	pub cipher:Option<Box<dyn OpeningKey + Send>>,
}

/// The client-side key-exchange state machine, driven by the transport
/// loop. `None` between exchanges.
pub(crate) enum Kex {
	Init(KexInit),
	DhDone(KexDhDone),
	NewKeys(NewKeys),
}
