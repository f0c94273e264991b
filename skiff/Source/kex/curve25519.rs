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

//! `curve25519-sha256` (RFC 8731): X25519 over the Montgomery ladder,
//! ephemerals exchanged as 32-byte strings.

use curve25519_dalek::{constants::X25519_BASEPOINT, montgomery::MontgomeryPoint, scalar::Scalar};
use rand::RngCore;
use skiff_cryptovec::CryptoVec;
use skiff_keys::encoding::Encoding;

use crate::{Error, msg};

pub(crate) struct Curve25519 {
	local_secret:Option<Scalar>,
	shared_secret:Option<CryptoVec>,
}

impl Curve25519 {
	pub fn new() -> Self { Curve25519 { local_secret:None, shared_secret:None } }

	pub fn client_dh(
		&mut self,
		client_ephemeral:&mut CryptoVec,
		buf:&mut CryptoVec,
	) -> Result<(), Error> {
		let mut bytes = [0u8; 32];

		rand::thread_rng().fill_bytes(&mut bytes);

		// RFC 7748 §5 scalar clamping.
		bytes[0] &= 248;

		bytes[31] &= 127;

		bytes[31] |= 64;

		let secret = Scalar::from_bits(bytes);

		let public = &X25519_BASEPOINT * &secret;

		client_ephemeral.clear();

		client_ephemeral.extend(public.as_bytes());

		buf.push(msg::KEX_ECDH_INIT);

		buf.extend_ssh_string(public.as_bytes());

		self.local_secret = Some(secret);

		Ok(())
	}

	pub fn compute_shared_secret(&mut self, server_ephemeral:&[u8]) -> Result<(), Error> {
		if server_ephemeral.len() != 32 {
			return Err(Error::Kex);
		}

		let mut point = [0u8; 32];

		point.copy_from_slice(server_ephemeral);

		let server = MontgomeryPoint(point);

		let secret = self.local_secret.take().ok_or(Error::Inconsistent)?;

		let shared = &server * &secret;

		// A low-order server point yields the identity; reject it.
		if shared.as_bytes().iter().all(|&b| b == 0) {
			return Err(Error::Kex);
		}

		self.shared_secret = Some(CryptoVec::from_slice(shared.as_bytes()));

		Ok(())
	}

	pub fn shared(&self) -> Result<&[u8], Error> {
		self.shared_secret.as_deref().ok_or(Error::Inconsistent)
	}
}

#[cfg(test)]
mod tests {
	use hex_literal::hex;

	use super::*;

	#[test]
	fn rfc7748_vector() {
		// First test vector from RFC 7748 §5.2.
		let mut scalar = hex!("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4");

		let point = hex!("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c");

		let expected = hex!("c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552");

		scalar[0] &= 248;

		scalar[31] &= 127;

		scalar[31] |= 64;

		let out = &MontgomeryPoint(point) * &Scalar::from_bits(scalar);

		assert_eq!(out.as_bytes(), &expected);
	}

	#[test]
	fn both_sides_agree() {
		let mut alice = Curve25519::new();

		let mut bob = Curve25519::new();

		let mut alice_pub = CryptoVec::new();

		let mut bob_pub = CryptoVec::new();

		let mut scratch = CryptoVec::new();

		alice.client_dh(&mut alice_pub, &mut scratch).unwrap();

		bob.client_dh(&mut bob_pub, &mut scratch).unwrap();

		alice.compute_shared_secret(&bob_pub).unwrap();

		bob.compute_shared_secret(&alice_pub).unwrap();

		assert_eq!(alice.shared().unwrap(), bob.shared().unwrap());
	}

	#[test]
	fn missing_state_is_an_error() {
		let kex = Curve25519::new();

		assert!(kex.shared().is_err());

		let mut kex = Curve25519::new();

		assert!(matches!(kex.compute_shared_secret(&[0u8; 32]), Err(Error::Inconsistent)));
	}
}
