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

//! Key exchange: the negotiated algorithm produces a shared secret and
//! the exchange hash H, then the six session keys are derived per
//! RFC 4253 §7.2 — `HASH(K ‖ H ‖ letter ‖ session_id)`, extended with
//! `HASH(K ‖ H ‖ accumulated)` until each key is long enough.

use digest::Digest;
use sha2::Sha256;
use skiff_cryptovec::CryptoVec;

use crate::{
	Error,
	cipher::{self, CIPHERS, CipherPair},
	mac::{self, MACS},
	session::Exchange,
};

pub(crate) mod curve25519;
pub(crate) mod dh;

/// `curve25519-sha256`
pub const CURVE25519:Name = Name("curve25519-sha256");
/// `curve25519-sha256@libssh.org`
pub const CURVE25519_PRE_RFC_8731:Name = Name("curve25519-sha256@libssh.org");
/// `diffie-hellman-group14-sha256`
pub const DH_G14_SHA256:Name = Name("diffie-hellman-group14-sha256");
/// `diffie-hellman-group14-sha1`
pub const DH_G14_SHA1:Name = Name("diffie-hellman-group14-sha1");

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
	fn as_ref(&self) -> &str { self.0 }
}

/// Feed an `mpint` into a hash: same sign rules as the wire encoding.
pub(crate) fn hash_mpint<D:Digest>(hasher:&mut D, s:&[u8]) {
	let mut i = 0;

	while i < s.len() && s[i] == 0 {
		i += 1
	}

	if s[i..].first().map_or(false, |&b| b & 0x80 != 0) {
		hasher.update(((s.len() - i + 1) as u32).to_be_bytes());

		hasher.update([0u8]);
	} else {
		hasher.update(((s.len() - i) as u32).to_be_bytes());
	}

	hasher.update(&s[i..]);
}

fn hash_string<D:Digest>(hasher:&mut D, s:&[u8]) {
	hasher.update((s.len() as u32).to_be_bytes());

	hasher.update(s);
}

/// The negotiated key-exchange state.
pub(crate) enum KexAlgorithm {
	Curve25519(curve25519::Curve25519),
	DhGroup14(dh::DhGroup14),
}

impl KexAlgorithm {
	pub fn new(name:Name) -> Result<Self, Error> {
		if name == CURVE25519 || name == CURVE25519_PRE_RFC_8731 {
			Ok(KexAlgorithm::Curve25519(curve25519::Curve25519::new()))
		} else if name == DH_G14_SHA256 {
			Ok(KexAlgorithm::DhGroup14(dh::DhGroup14::new(false)))
		} else if name == DH_G14_SHA1 {
			Ok(KexAlgorithm::DhGroup14(dh::DhGroup14::new(true)))
		} else {
			Err(Error::NoCommonKexAlgo)
		}
	}

	/// Generate our ephemeral, record it in `client_ephemeral`, and write
	/// the kex init payload (message byte included) into `buf`.
	pub fn client_dh(
		&mut self,
		client_ephemeral:&mut CryptoVec,
		buf:&mut CryptoVec,
	) -> Result<(), Error> {
		match self {
			KexAlgorithm::Curve25519(kex) => kex.client_dh(client_ephemeral, buf),
			KexAlgorithm::DhGroup14(kex) => kex.client_dh(client_ephemeral, buf),
		}
	}

	pub fn compute_shared_secret(&mut self, server_ephemeral:&[u8]) -> Result<(), Error> {
		match self {
			KexAlgorithm::Curve25519(kex) => kex.compute_shared_secret(server_ephemeral),
			KexAlgorithm::DhGroup14(kex) => kex.compute_shared_secret(server_ephemeral),
		}
	}

	/// The exchange hash H over both identification strings, both
	/// KEXINIT payloads, the host key, the ephemerals and K.
	pub fn compute_exchange_hash(&self, exchange:&Exchange) -> Result<CryptoVec, Error> {
		match self {
			KexAlgorithm::Curve25519(kex) => {
				let shared = kex.shared()?;

				Ok(hash_exchange::<Sha256>(exchange, shared, false))
			},
			KexAlgorithm::DhGroup14(kex) => {
				let shared = kex.shared()?;

				if kex.sha1() {
					Ok(hash_exchange::<sha1::Sha1>(exchange, shared, true))
				} else {
					Ok(hash_exchange::<Sha256>(exchange, shared, true))
				}
			},
		}
	}

	/// Derive the six keys and build the cipher pair for both directions.
	/// `is_server` swaps the letter assignments, so a peer playing the
	/// server side seals with B/D/F and opens with A/C/E.
	#[allow(clippy::too_many_arguments)]
	pub fn compute_keys(
		&self,
		session_id:&CryptoVec,
		exchange_hash:&CryptoVec,
		client_cipher:cipher::Name,
		server_cipher:cipher::Name,
		client_mac:mac::Name,
		server_mac:mac::Name,
		is_server:bool,
	) -> Result<CipherPair, Error> {
		match self {
			KexAlgorithm::Curve25519(kex) => {
				compute_keys::<Sha256>(
					kex.shared()?,
					session_id,
					exchange_hash,
					client_cipher,
					server_cipher,
					client_mac,
					server_mac,
					is_server,
				)
			},
			KexAlgorithm::DhGroup14(kex) => {
				let shared = kex.shared()?;

				if kex.sha1() {
					compute_keys::<sha1::Sha1>(
						shared,
						session_id,
						exchange_hash,
						client_cipher,
						server_cipher,
						client_mac,
						server_mac,
						is_server,
					)
				} else {
					compute_keys::<Sha256>(
						shared,
						session_id,
						exchange_hash,
						client_cipher,
						server_cipher,
						client_mac,
						server_mac,
						is_server,
					)
				}
			},
		}
	}
}

fn hash_exchange<D:Digest>(exchange:&Exchange, shared:&[u8], mpint_ephemerals:bool) -> CryptoVec {
	let mut hasher = D::new();

	hash_string(&mut hasher, &exchange.client_id);

	hash_string(&mut hasher, &exchange.server_id);

	hash_string(&mut hasher, &exchange.client_kex_init);

	hash_string(&mut hasher, &exchange.server_kex_init);

	hash_string(&mut hasher, &exchange.server_host_key);

	if mpint_ephemerals {
		hash_mpint(&mut hasher, &exchange.client_ephemeral);

		hash_mpint(&mut hasher, &exchange.server_ephemeral);
	} else {
		hash_string(&mut hasher, &exchange.client_ephemeral);

		hash_string(&mut hasher, &exchange.server_ephemeral);
	}

	hash_mpint(&mut hasher, shared);

	CryptoVec::from_slice(&hasher.finalize())
}

#[allow(clippy::too_many_arguments)]
fn compute_keys<D:Digest>(
	shared:&[u8],
	session_id:&CryptoVec,
	exchange_hash:&CryptoVec,
	client_cipher:cipher::Name,
	server_cipher:cipher::Name,
	client_mac:mac::Name,
	server_mac:mac::Name,
	is_server:bool,
) -> Result<CipherPair, Error> {
	// The sealing direction is client-to-server for the client and
	// server-to-client for the server.
	let (seal_cipher, open_cipher, seal_mac, open_mac) = if is_server {
		(server_cipher, client_cipher, server_mac, client_mac)
	} else {
		(client_cipher, server_cipher, client_mac, server_mac)
	};

	let local_cipher = *CIPHERS.get(&seal_cipher).ok_or(Error::NoCommonCipher)?;

	let remote_cipher = *CIPHERS.get(&open_cipher).ok_or(Error::NoCommonCipher)?;

	let local_mac = *MACS.get(&seal_mac).ok_or(Error::NoCommonMac)?;

	let remote_mac = *MACS.get(&open_mac).ok_or(Error::NoCommonMac)?;

	let derive = |letter:u8, len:usize| -> CryptoVec {
		let mut out = CryptoVec::new();

		let mut hasher = D::new();

		hash_mpint(&mut hasher, shared);

		hasher.update(&exchange_hash[..]);

		hasher.update([letter]);

		hasher.update(&session_id[..]);

		out.extend(&hasher.finalize());

		while out.len() < len {
			let mut hasher = D::new();

			hash_mpint(&mut hasher, shared);

			hasher.update(&exchange_hash[..]);

			hasher.update(&out[..]);

			out.extend(&hasher.finalize());
		}

		out.resize(len);

		out
	};

	// RFC 4253 §7.2, letters A through F; the client seals with A/C/E,
	// the server with B/D/F.
	let (iv_seal, iv_open, key_seal, key_open, mac_seal, mac_open) = if is_server {
		(b'B', b'A', b'D', b'C', b'F', b'E')
	} else {
		(b'A', b'B', b'C', b'D', b'E', b'F')
	};

	let iv_local = derive(iv_seal, local_cipher.nonce_len());

	let iv_remote = derive(iv_open, remote_cipher.nonce_len());

	let key_local = derive(key_seal, local_cipher.key_len());

	let key_remote = derive(key_open, remote_cipher.key_len());

	let mac_local = derive(mac_seal, local_mac.key_len());

	let mac_remote = derive(mac_open, remote_mac.key_len());

	Ok(CipherPair {
		local_to_remote:local_cipher.make_sealing_key(
			&key_local,
			&iv_local,
			&mac_local,
			local_mac,
		)?,
		remote_to_local:remote_cipher.make_opening_key(
			&key_remote,
			&iv_remote,
			&mac_remote,
			remote_mac,
		)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn exchange() -> Exchange {
		let mut exchange = Exchange::new(b"SSH-2.0-client", b"SSH-2.0-server");

		exchange.client_kex_init.extend(b"\x14client kexinit");

		exchange.server_kex_init.extend(b"\x14server kexinit");

		exchange.server_host_key.extend(b"host key blob");

		exchange.client_ephemeral.extend(&[0x41; 32]);

		exchange.server_ephemeral.extend(&[0x42; 32]);

		exchange
	}

	#[test]
	fn exchange_hash_is_deterministic_and_binds_inputs() {
		let e = exchange();

		let h1 = hash_exchange::<Sha256>(&e, &[9u8; 32], false);

		let h2 = hash_exchange::<Sha256>(&e, &[9u8; 32], false);

		assert_eq!(&h1[..], &h2[..]);

		assert_eq!(h1.len(), 32);

		let mut other = exchange();

		other.server_host_key.push(0);

		let h3 = hash_exchange::<Sha256>(&other, &[9u8; 32], false);

		assert_ne!(&h1[..], &h3[..]);

		// A different shared secret changes H too.
		let h4 = hash_exchange::<Sha256>(&e, &[10u8; 32], false);

		assert_ne!(&h1[..], &h4[..]);
	}

	#[test]
	fn derived_keys_reach_the_requested_length() {
		// chacha20-poly1305 needs 64 key bytes, two hash rounds of
		// extension with SHA-256.
		let session_id = CryptoVec::from_slice(&[1u8; 32]);

		let hash = CryptoVec::from_slice(&[2u8; 32]);

		let pair = compute_keys::<Sha256>(
			&[3u8; 32],
			&session_id,
			&hash,
			cipher::CHACHA20_POLY1305,
			cipher::AES_256_GCM,
			mac::NONE,
			mac::NONE,
			false,
		);

		assert!(pair.is_ok());
	}

	#[test]
	fn server_derivation_mirrors_the_client() {
		use crate::{cipher::SealingKey, sshbuffer::SSHBuffer};

		let session_id = CryptoVec::from_slice(&[1u8; 32]);

		let hash = CryptoVec::from_slice(&[2u8; 32]);

		let mut client = compute_keys::<Sha256>(
			&[3u8; 32],
			&session_id,
			&hash,
			cipher::CHACHA20_POLY1305,
			cipher::CHACHA20_POLY1305,
			mac::NONE,
			mac::NONE,
			false,
		)
		.unwrap();

		let mut server = compute_keys::<Sha256>(
			&[3u8; 32],
			&session_id,
			&hash,
			cipher::CHACHA20_POLY1305,
			cipher::CHACHA20_POLY1305,
			mac::NONE,
			mac::NONE,
			true,
		)
		.unwrap();

		// A packet sealed by the client side opens on the server side.
		let mut out = SSHBuffer::new();

		client.local_to_remote.write(b"\x14ping", &mut out);

		let wire = out.buffer[..].to_vec();

		let mut read_buffer = SSHBuffer::new();

		let end = futures::executor::block_on(crate::cipher::read(
			&mut &wire[..],
			&mut read_buffer,
			server.remote_to_local.as_mut(),
			35_000,
		))
		.unwrap();

		assert_eq!(&read_buffer.buffer[5..end], b"\x14ping");

		// And the other way around.
		let mut out = SSHBuffer::new();

		server.local_to_remote.write(b"\x15pong", &mut out);

		let wire = out.buffer[..].to_vec();

		let mut read_buffer = SSHBuffer::new();

		let end = futures::executor::block_on(crate::cipher::read(
			&mut &wire[..],
			&mut read_buffer,
			client.remote_to_local.as_mut(),
			35_000,
		))
		.unwrap();

		assert_eq!(&read_buffer.buffer[5..end], b"\x15pong");
	}
}
