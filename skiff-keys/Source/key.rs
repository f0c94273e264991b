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

//! Public and secret key types, signature verification and fingerprints.

use ed25519_dalek::{Signer, Verifier};
use num_bigint::BigUint;
use sha2::{Digest, Sha256, Sha512};

use crate::{
	Error,
	encoding::{Encoding, Reader},
};

/// The name of an SSH public-key or signature algorithm.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(pub &'static str);

impl AsRef<str> for Name {
	fn as_ref(&self) -> &str { self.0 }
}

/// `ssh-ed25519`
pub const ED25519:Name = Name("ssh-ed25519");
/// `ssh-rsa`
pub const SSH_RSA:Name = Name("ssh-rsa");
/// `rsa-sha2-256`
pub const RSA_SHA2_256:Name = Name("rsa-sha2-256");
/// `rsa-sha2-512`
pub const RSA_SHA2_512:Name = Name("rsa-sha2-512");
/// `none`
pub const NONE:Name = Name("none");

/// The hash used by an RSA signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureHash {
	SHA2_256,
	SHA2_512,
	SHA1,
}

impl SignatureHash {
	pub fn name(&self) -> Name {
		match *self {
			SignatureHash::SHA2_256 => RSA_SHA2_256,
			SignatureHash::SHA2_512 => RSA_SHA2_512,
			SignatureHash::SHA1 => SSH_RSA,
		}
	}

	pub fn from_rsa_hostkey_algo(algo:&[u8]) -> Option<Self> {
		match algo {
			b"rsa-sha2-256" => Some(SignatureHash::SHA2_256),
			b"rsa-sha2-512" => Some(SignatureHash::SHA2_512),
			b"ssh-rsa" => Some(SignatureHash::SHA1),
			_ => None,
		}
	}
}

// EMSA-PKCS1-v1_5 DigestInfo prefixes, DER.
const DIGEST_INFO_SHA1:&[u8] =
	&[0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14];
const DIGEST_INFO_SHA256:&[u8] = &[
	0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
	0x05, 0x00, 0x04, 0x20,
];
const DIGEST_INFO_SHA512:&[u8] = &[
	0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
	0x05, 0x00, 0x04, 0x40,
];

/// A server or client public key.
#[derive(Debug, Clone, PartialEq)]
pub enum PublicKey {
	Ed25519(ed25519_dalek::PublicKey),
	Rsa { e:BigUint, n:BigUint, hash:SignatureHash },
}

impl PublicKey {
	/// Parse a wire-format public key blob (`string algo ‖ key fields`).
	pub fn parse(algo:&[u8], pubkey:&[u8]) -> Result<Self, Error> {
		let mut p = pubkey.reader(0);

		let key_algo = p.read_string()?;

		match key_algo {
			b"ssh-ed25519" => {
				if algo != b"ssh-ed25519" {
					return Err(Error::KeyIsCorrupt);
				}

				let key_bytes = p.read_string()?;

				let key = ed25519_dalek::PublicKey::from_bytes(key_bytes)
					.map_err(|_| Error::CouldNotReadKey)?;

				Ok(PublicKey::Ed25519(key))
			},
			b"ssh-rsa" => {
				let hash = SignatureHash::from_rsa_hostkey_algo(algo)
					.ok_or_else(|| Error::UnsupportedKeyType(algo.to_vec()))?;

				let e = p.read_mpint()?;

				let n = p.read_mpint()?;

				Ok(PublicKey::Rsa {
					e:BigUint::from_bytes_be(e),
					n:BigUint::from_bytes_be(n),
					hash,
				})
			},
			_ => Err(Error::UnsupportedKeyType(key_algo.to_vec())),
		}
	}

	/// Algorithm name, reflecting the RSA hash variant where relevant.
	pub fn name(&self) -> &'static str {
		match *self {
			PublicKey::Ed25519(_) => ED25519.0,
			PublicKey::Rsa { ref hash, .. } => hash.name().0,
		}
	}

	/// Re-tag an RSA key with the hash the negotiated algorithm implies.
	pub fn set_algorithm(&mut self, algo:&[u8]) {
		if let PublicKey::Rsa { ref mut hash, .. } = *self {
			if let Some(h) = SignatureHash::from_rsa_hostkey_algo(algo) {
				*hash = h
			}
		}
	}

	/// Verify a raw signature over `buffer`.
	pub fn verify_detached(&self, buffer:&[u8], sig:&[u8]) -> bool {
		match *self {
			PublicKey::Ed25519(ref public) => {
				use std::convert::TryFrom;

				ed25519_dalek::Signature::try_from(sig)
					.map_or(false, |sig| public.verify(buffer, &sig).is_ok())
			},
			PublicKey::Rsa { ref e, ref n, ref hash } => {
				let (digest_info, digest):(&[u8], Vec<u8>) = match hash {
					SignatureHash::SHA2_256 =>
						(DIGEST_INFO_SHA256, Sha256::digest(buffer).to_vec()),
					SignatureHash::SHA2_512 =>
						(DIGEST_INFO_SHA512, Sha512::digest(buffer).to_vec()),
					SignatureHash::SHA1 =>
						(DIGEST_INFO_SHA1, sha1::Sha1::digest(buffer).to_vec()),
				};

				let k = ((n.bits() + 7) / 8) as usize;

				let t_len = digest_info.len() + digest.len();

				// RFC 8017: k must leave room for 0x00 0x01 PS 0x00 with
				// at least eight bytes of padding.
				if k < t_len + 11 || sig.len() > k {
					return false;
				}

				let em = BigUint::from_bytes_be(sig).modpow(e, n).to_bytes_be();

				if em.len() > k {
					return false;
				}

				let mut expected = Vec::with_capacity(k);

				expected.push(0x00);

				expected.push(0x01);

				expected.resize(k - t_len - 1, 0xff);

				expected.push(0x00);

				expected.extend_from_slice(digest_info);

				expected.extend_from_slice(&digest);

				// `em` dropped its leading zero byte in to_bytes_be.
				let mut padded = vec![0u8; k - em.len()];

				padded.extend_from_slice(&em);

				padded == expected
			},
		}
	}

	/// The wire-format blob (`string algo ‖ key fields`).
	pub fn public_key_bytes(&self) -> Vec<u8> {
		let mut blob = Vec::new();

		match *self {
			PublicKey::Ed25519(ref public) => {
				blob.extend_ssh_string(b"ssh-ed25519");

				blob.extend_ssh_string(public.as_bytes());
			},
			PublicKey::Rsa { ref e, ref n, .. } => {
				blob.extend_ssh_string(b"ssh-rsa");

				blob.extend_ssh_mpint(&e.to_bytes_be());

				blob.extend_ssh_mpint(&n.to_bytes_be());
			},
		}

		blob
	}

	/// The base64 of the wire blob, as it appears in known-hosts lines.
	pub fn public_key_base64(&self) -> String {
		data_encoding::BASE64.encode(&self.public_key_bytes())
	}

	/// SHA-256 fingerprint, base64 without padding (the `SHA256:` form
	/// without its prefix).
	pub fn fingerprint(&self) -> String {
		data_encoding::BASE64_NOPAD.encode(&Sha256::digest(&self.public_key_bytes()))
	}

	/// Legacy MD5 fingerprint, colon-separated hex pairs.
	pub fn fingerprint_md5(&self) -> String {
		let digest = md5::compute(&self.public_key_bytes());

		digest.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
	}
}

/// A secret key, i.e. one that can sign.
pub enum KeyPair {
	Ed25519(ed25519_dalek::Keypair),
}

impl Clone for KeyPair {
	fn clone(&self) -> Self {
		match self {
			#[allow(clippy::expect_used)] // round-trips its own bytes
			KeyPair::Ed25519(kp) => {
				KeyPair::Ed25519(
					ed25519_dalek::Keypair::from_bytes(&kp.to_bytes())
						.expect("keypair round-trip"),
				)
			},
		}
	}
}

impl std::fmt::Debug for KeyPair {
	fn fmt(&self, f:&mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
		match self {
			KeyPair::Ed25519(kp) => {
				write!(f, "Ed25519 {{ public: {:?}, secret: (hidden) }}", kp.public)
			},
		}
	}
}

impl KeyPair {
	pub fn generate_ed25519() -> Option<Self> {
		let keypair = ed25519_dalek::Keypair::generate(&mut rand::rngs::OsRng {});

		Some(KeyPair::Ed25519(keypair))
	}

	pub fn name(&self) -> &'static str {
		match *self {
			KeyPair::Ed25519(_) => ED25519.0,
		}
	}

	pub fn clone_public_key(&self) -> PublicKey {
		match self {
			KeyPair::Ed25519(kp) => PublicKey::Ed25519(kp.public),
		}
	}

	/// Append an SSH signature blob over `to_sign`:
	/// `string (string algo ‖ string raw-signature)`.
	pub fn add_signature<V:Encoding>(&self, buffer:&mut V, to_sign:&[u8]) -> Result<(), Error> {
		match self {
			KeyPair::Ed25519(kp) => {
				let sig = kp.sign(to_sign);

				let bytes = sig.to_bytes();

				buffer.push_u32_be((ED25519.0.len() + bytes.len() + 8) as u32);

				buffer.extend_ssh_string(ED25519.0.as_bytes());

				buffer.extend_ssh_string(&bytes);
			},
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ed25519_sign_verify() {
		let kp = KeyPair::generate_ed25519().unwrap();

		let public = kp.clone_public_key();

		let mut blob = Vec::new();

		kp.add_signature(&mut blob, b"exchange hash").unwrap();

		// Unwrap the signature blob: outer string, algo string, raw bytes.
		let mut r = blob.as_slice().reader(0);

		let sig_blob = r.read_string().unwrap();

		let mut r = sig_blob.reader(0);

		assert_eq!(r.read_string().unwrap(), b"ssh-ed25519");

		let raw = r.read_string().unwrap();

		assert!(public.verify_detached(b"exchange hash", raw));

		assert!(!public.verify_detached(b"another hash", raw));
	}

	#[test]
	fn public_key_blob_roundtrip() {
		let kp = KeyPair::generate_ed25519().unwrap();

		let public = kp.clone_public_key();

		let blob = public.public_key_bytes();

		let parsed = PublicKey::parse(b"ssh-ed25519", &blob).unwrap();

		assert_eq!(parsed, public);

		assert_eq!(parsed.name(), "ssh-ed25519");
	}

	#[test]
	fn fingerprints_have_expected_shape() {
		let kp = KeyPair::generate_ed25519().unwrap();

		let public = kp.clone_public_key();

		// SHA-256 of a 51-byte blob, base64 without padding.
		assert_eq!(public.fingerprint().len(), 43);

		let md5 = public.fingerprint_md5();

		assert_eq!(md5.len(), 47);

		assert_eq!(md5.matches(':').count(), 15);
	}

	#[test]
	fn rsa_verifier_rejects_garbage() {
		let key = PublicKey::Rsa {
			e:BigUint::from(65537u32),
			n:BigUint::from_bytes_be(&[0xff; 256]),
			hash:SignatureHash::SHA2_256,
		};

		assert!(!key.verify_detached(b"data", &[0u8; 256]));

		assert!(!key.verify_detached(b"data", &[]));
	}
}
