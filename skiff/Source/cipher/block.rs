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

//! CTR stream ciphers paired with a negotiated HMAC, in both the classic
//! encrypt-and-MAC layout of RFC 4253 (the length field is encrypted, the
//! MAC covers the plaintext) and the `-etm@openssh.com` layout (the
//! length field stays clear, the MAC covers the ciphertext).

use std::marker::PhantomData;

use aes::cipher::{BlockSizeUser, KeyIvInit, StreamCipher};
use rand::RngCore;

use super::{Cipher, Error, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::{Mac, MacAlgorithm};

pub struct SshBlockCipher<C:BlockSizeUser + KeyIvInit + StreamCipher + Clone + Send + 'static>(
	pub PhantomData<C>,
);

impl<C:BlockSizeUser + KeyIvInit + StreamCipher + Clone + Send + 'static> Cipher
	for SshBlockCipher<C>
{
	fn needs_mac(&self) -> bool { true }

	fn key_len(&self) -> usize { C::key_size() }

	fn nonce_len(&self) -> usize { C::iv_size() }

	fn make_opening_key(
		&self,
		key:&[u8],
		nonce:&[u8],
		mac_key:&[u8],
		mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
		Ok(Box::new(OpeningKey {
			cipher:C::new_from_slices(key, nonce).map_err(|_| Error::Kex)?,
			mac:mac.make_mac(mac_key),
		}))
	}

	fn make_sealing_key(
		&self,
		key:&[u8],
		nonce:&[u8],
		mac_key:&[u8],
		mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn super::SealingKey + Send>, Error> {
		Ok(Box::new(SealingKey {
			cipher:C::new_from_slices(key, nonce).map_err(|_| Error::Kex)?,
			mac:mac.make_mac(mac_key),
		}))
	}
}

pub(crate) struct OpeningKey<C:StreamCipher + Clone> {
	cipher:C,
	mac:Box<dyn Mac + Send>,
}

pub(crate) struct SealingKey<C:StreamCipher + Clone> {
	cipher:C,
	mac:Box<dyn Mac + Send>,
}

impl<C:BlockSizeUser + StreamCipher + Clone + Send> super::OpeningKey for OpeningKey<C> {
	fn decrypt_packet_length(
		&self,
		_seqn:u32,
		encrypted_packet_length:[u8; 4],
	) -> Result<[u8; 4], Error> {
		if self.mac.is_etm() {
			// The length travels in clear; the MAC will cover it later.
			Ok(encrypted_packet_length)
		} else {
			// Peek at the keystream with a clone: the real cipher state
			// advances only in `open`, over the full packet.
			let mut cipher = self.cipher.clone();

			let mut length = encrypted_packet_length;

			cipher.apply_keystream(&mut length);

			Ok(length)
		}
	}

	fn tag_len(&self) -> usize { self.mac.mac_len() }

	fn check_packet_length(&self, length:usize) -> Result<(), Error> {
		let block = C::block_size();

		let framed = if self.mac.is_etm() { length } else { PACKET_LENGTH_LEN + length };

		if framed % block != 0 {
			return Err(Error::BadLength(length));
		}

		Ok(())
	}

	fn open<'a>(
		&mut self,
		seqn:u32,
		ciphertext_in_plaintext_out:&'a mut [u8],
		tag:&[u8],
	) -> Result<&'a [u8], Error> {
		if self.mac.is_etm() {
			if !self.mac.verify(seqn, ciphertext_in_plaintext_out, tag) {
				return Err(Error::IntegrityFailure);
			}

			#[allow(clippy::indexing_slicing)] // length checked by the caller
			self.cipher.apply_keystream(&mut ciphertext_in_plaintext_out[PACKET_LENGTH_LEN..]);
		} else {
			self.cipher.apply_keystream(ciphertext_in_plaintext_out);

			if !self.mac.verify(seqn, ciphertext_in_plaintext_out, tag) {
				return Err(Error::IntegrityFailure);
			}
		}

		#[allow(clippy::indexing_slicing)] // length checked by the caller
		Ok(&ciphertext_in_plaintext_out[PACKET_LENGTH_LEN..])
	}
}

impl<C:BlockSizeUser + StreamCipher + Clone + Send> super::SealingKey for SealingKey<C> {
	fn padding_length(&self, payload:&[u8]) -> usize {
		let block = C::block_size();

		// In ETM mode the cleartext length field is outside the padded
		// region.
		let extra = if self.mac.is_etm() {
			PADDING_LENGTH_LEN
		} else {
			PACKET_LENGTH_LEN + PADDING_LENGTH_LEN
		};

		let padding_len = block - ((extra + payload.len()) % block);

		if padding_len < PACKET_LENGTH_LEN { padding_len + block } else { padding_len }
	}

	fn fill_padding(&self, padding_out:&mut [u8]) { rand::thread_rng().fill_bytes(padding_out) }

	fn tag_len(&self) -> usize { self.mac.mac_len() }

	fn seal(&mut self, seqn:u32, plaintext_in_ciphertext_out:&mut [u8], tag_out:&mut [u8]) {
		if self.mac.is_etm() {
			#[allow(clippy::indexing_slicing)] // fixed offset into a framed packet
			self.cipher.apply_keystream(&mut plaintext_in_ciphertext_out[PACKET_LENGTH_LEN..]);

			self.mac.compute(seqn, plaintext_in_ciphertext_out, tag_out);
		} else {
			self.mac.compute(seqn, plaintext_in_ciphertext_out, tag_out);

			self.cipher.apply_keystream(plaintext_in_ciphertext_out);
		}
	}
}
