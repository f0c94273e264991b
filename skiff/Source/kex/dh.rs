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

//! Classic Diffie-Hellman over the 2048-bit MODP group 14 of RFC 3526,
//! ephemerals exchanged as `mpint`s.

use hex_literal::hex;
use num_bigint::{BigUint, RandBigInt};
use skiff_cryptovec::CryptoVec;
use skiff_keys::encoding::Encoding;

use crate::{Error, msg};

// RFC 3526 §3.
const GROUP14_PRIME:[u8; 256] = hex!(
	"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74"
	"020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437"
	"4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED"
	"EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05"
	"98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB"
	"9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B"
	"E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718"
	"3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);

const GENERATOR:u32 = 2;

pub(crate) struct DhGroup14 {
	sha1:bool,
	local_secret:Option<BigUint>,
	shared_secret:Option<CryptoVec>,
}

impl DhGroup14 {
	pub fn new(sha1:bool) -> Self { DhGroup14 { sha1, local_secret:None, shared_secret:None } }

	pub fn sha1(&self) -> bool { self.sha1 }

	pub fn client_dh(
		&mut self,
		client_ephemeral:&mut CryptoVec,
		buf:&mut CryptoVec,
	) -> Result<(), Error> {
		let p = BigUint::from_bytes_be(&GROUP14_PRIME);

		let x = rand::thread_rng()
			.gen_biguint_range(&BigUint::from(2u32), &(&p - 2u32));

		let e = BigUint::from(GENERATOR).modpow(&x, &p);

		let bytes = e.to_bytes_be();

		client_ephemeral.clear();

		client_ephemeral.extend(&bytes);

		buf.push(msg::KEXDH_INIT);

		buf.extend_ssh_mpint(&bytes);

		self.local_secret = Some(x);

		Ok(())
	}

	pub fn compute_shared_secret(&mut self, server_ephemeral:&[u8]) -> Result<(), Error> {
		let p = BigUint::from_bytes_be(&GROUP14_PRIME);

		let f = BigUint::from_bytes_be(server_ephemeral);

		// RFC 4253 §8: 1 < f < p - 1.
		if f <= BigUint::from(1u32) || f >= &p - 1u32 {
			return Err(Error::Kex);
		}

		let x = self.local_secret.take().ok_or(Error::Inconsistent)?;

		let k = f.modpow(&x, &p);

		self.shared_secret = Some(CryptoVec::from_slice(&k.to_bytes_be()));

		Ok(())
	}

	pub fn shared(&self) -> Result<&[u8], Error> {
		self.shared_secret.as_deref().ok_or(Error::Inconsistent)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn both_sides_agree() {
		let mut alice = DhGroup14::new(false);

		let mut bob = DhGroup14::new(false);

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
	fn degenerate_ephemerals_are_rejected() {
		let mut kex = DhGroup14::new(false);

		let mut scratch = CryptoVec::new();

		let mut ephemeral = CryptoVec::new();

		kex.client_dh(&mut ephemeral, &mut scratch).unwrap();

		// f = 1 and f = p - 1 both collapse the shared secret.
		assert!(matches!(kex.compute_shared_secret(&[1]), Err(Error::Kex)));

		let p_minus_one = BigUint::from_bytes_be(&GROUP14_PRIME) - 1u32;

		let mut kex = DhGroup14::new(false);

		kex.client_dh(&mut ephemeral, &mut scratch).unwrap();

		assert!(matches!(
			kex.compute_shared_secret(&p_minus_one.to_bytes_be()),
			Err(Error::Kex)
		));
	}
}
