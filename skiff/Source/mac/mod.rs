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

//! This module exports MAC names for use with [Preferred].

use std::{collections::HashMap, marker::PhantomData};

use hmac::{Hmac, Mac as _};
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use skiff_cryptovec::CryptoVec;
use subtle::ConstantTimeEq;

/// `none`
pub const NONE:Name = Name("none");
/// `hmac-sha1`
pub const HMAC_SHA1:Name = Name("hmac-sha1");
/// `hmac-sha2-256`
pub const HMAC_SHA256:Name = Name("hmac-sha2-256");
/// `hmac-sha2-512`
pub const HMAC_SHA512:Name = Name("hmac-sha2-512");
/// `hmac-sha1-etm@openssh.com`
pub const HMAC_SHA1_ETM:Name = Name("hmac-sha1-etm@openssh.com");
/// `hmac-sha2-256-etm@openssh.com`
pub const HMAC_SHA256_ETM:Name = Name("hmac-sha2-256-etm@openssh.com");
/// `hmac-sha2-512-etm@openssh.com`
pub const HMAC_SHA512_ETM:Name = Name("hmac-sha2-512-etm@openssh.com");

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
	fn as_ref(&self) -> &str { self.0 }
}

/// Negotiable integrity algorithm: knows its key length and builds
/// per-direction [`Mac`] state from derived key material.
pub(crate) trait MacAlgorithm {
	fn key_len(&self) -> usize;

	fn make_mac(&self, key:&[u8]) -> Box<dyn Mac + Send>;
}

/// Per-direction integrity state. `compute`/`verify` take the sequence
/// number separately; it is prepended as a big-endian `uint32` per
/// RFC 4253 §6.4.
pub(crate) trait Mac {
	fn mac_len(&self) -> usize;

	/// Whether this is an encrypt-then-MAC variant, i.e. the MAC covers
	/// the encrypted packet and the length field stays in clear.
	fn is_etm(&self) -> bool { false }

	fn compute(&self, seqn:u32, packet:&[u8], output:&mut [u8]);

	fn verify(&self, seqn:u32, packet:&[u8], mac:&[u8]) -> bool;
}

struct NoMacAlgorithm {}
struct NoMac {}

impl MacAlgorithm for NoMacAlgorithm {
	fn key_len(&self) -> usize { 0 }

	fn make_mac(&self, _:&[u8]) -> Box<dyn Mac + Send> { Box::new(NoMac {}) }
}

impl Mac for NoMac {
	fn mac_len(&self) -> usize { 0 }

	fn compute(&self, _:u32, _:&[u8], _:&mut [u8]) {}

	fn verify(&self, _:u32, _:&[u8], mac:&[u8]) -> bool { mac.is_empty() }
}

struct CryptoMacAlgorithm<M>(bool, PhantomData<M>);

struct CryptoMac<M> {
	/// Zeroed on drop along with the rest of the buffer.
	key:CryptoVec,
	etm:bool,
	p:PhantomData<M>,
}

impl<M:hmac::Mac + hmac::digest::KeyInit + Send + 'static> MacAlgorithm for CryptoMacAlgorithm<M> {
	fn key_len(&self) -> usize { <M as hmac::digest::OutputSizeUser>::output_size() }

	fn make_mac(&self, key:&[u8]) -> Box<dyn Mac + Send> {
		Box::new(CryptoMac::<M> { key:CryptoVec::from_slice(key), etm:self.0, p:PhantomData })
	}
}

impl<M:hmac::Mac + hmac::digest::KeyInit + Send + 'static> Mac for CryptoMac<M> {
	fn mac_len(&self) -> usize { <M as hmac::digest::OutputSizeUser>::output_size() }

	fn is_etm(&self) -> bool { self.etm }

	fn compute(&self, seqn:u32, packet:&[u8], output:&mut [u8]) {
		let mut mac = match <M as hmac::digest::KeyInit>::new_from_slice(&self.key) {
			Ok(mac) => mac,
			// HMAC accepts keys of any length.
			Err(_) => unreachable!(),
		};

		mac.update(&seqn.to_be_bytes());

		mac.update(packet);

		output.clone_from_slice(&mac.finalize().into_bytes());
	}

	fn verify(&self, seqn:u32, packet:&[u8], mac:&[u8]) -> bool {
		let mut computed = vec![0; self.mac_len()];

		self.compute(seqn, packet, &mut computed);

		computed.ct_eq(mac).into()
	}
}

static _NONE:NoMacAlgorithm = NoMacAlgorithm {};
static _HMAC_SHA1:CryptoMacAlgorithm<Hmac<Sha1>> = CryptoMacAlgorithm(false, PhantomData);
static _HMAC_SHA256:CryptoMacAlgorithm<Hmac<Sha256>> = CryptoMacAlgorithm(false, PhantomData);
static _HMAC_SHA512:CryptoMacAlgorithm<Hmac<Sha512>> = CryptoMacAlgorithm(false, PhantomData);
static _HMAC_SHA1_ETM:CryptoMacAlgorithm<Hmac<Sha1>> = CryptoMacAlgorithm(true, PhantomData);
static _HMAC_SHA256_ETM:CryptoMacAlgorithm<Hmac<Sha256>> = CryptoMacAlgorithm(true, PhantomData);
static _HMAC_SHA512_ETM:CryptoMacAlgorithm<Hmac<Sha512>> = CryptoMacAlgorithm(true, PhantomData);

pub(crate) static MACS:Lazy<HashMap<&'static Name, &(dyn MacAlgorithm + Send + Sync)>> =
	Lazy::new(|| {
		let mut h:HashMap<&'static Name, &(dyn MacAlgorithm + Send + Sync)> = HashMap::new();

		h.insert(&NONE, &_NONE);

		h.insert(&HMAC_SHA1, &_HMAC_SHA1);

		h.insert(&HMAC_SHA256, &_HMAC_SHA256);

		h.insert(&HMAC_SHA512, &_HMAC_SHA512);

		h.insert(&HMAC_SHA1_ETM, &_HMAC_SHA1_ETM);

		h.insert(&HMAC_SHA256_ETM, &_HMAC_SHA256_ETM);

		h.insert(&HMAC_SHA512_ETM, &_HMAC_SHA512_ETM);

		h
	});

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mac_verifies_own_output() {
		let algo = MACS.get(&HMAC_SHA256).unwrap();

		assert_eq!(algo.key_len(), 32);

		let mac = algo.make_mac(&[7u8; 32]);

		let mut tag = vec![0; mac.mac_len()];

		mac.compute(3, b"packet bytes", &mut tag);

		assert!(mac.verify(3, b"packet bytes", &tag));

		// Any change to the sequence number or packet must fail.
		assert!(!mac.verify(4, b"packet bytes", &tag));

		assert!(!mac.verify(3, b"packet bytez", &tag));
	}

	#[test]
	fn etm_flag_follows_the_name() {
		let algo = MACS.get(&HMAC_SHA256_ETM).unwrap();

		assert!(algo.make_mac(&[0u8; 32]).is_etm());

		let algo = MACS.get(&HMAC_SHA256).unwrap();

		assert!(!algo.make_mac(&[0u8; 32]).is_etm());
	}
}
