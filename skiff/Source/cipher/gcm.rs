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

//! `aes256-gcm@openssh.com`, per RFC 5647: the cleartext length field is
//! the associated data, the 12-byte IV is a 4-byte fixed field followed
//! by an 8-byte invocation counter incremented big-endian after every
//! packet, and the tag is 16 bytes.

use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit};
use generic_array::GenericArray;
use rand::RngCore;

use super::{Cipher, Error, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::MacAlgorithm;

pub struct GcmCipher {}

const KEY_LEN:usize = 32;

const NONCE_LEN:usize = 12;

const TAG_LEN:usize = 16;

const BLOCK_SIZE:usize = 16;

impl Cipher for GcmCipher {
	fn key_len(&self) -> usize { KEY_LEN }

	fn nonce_len(&self) -> usize { NONCE_LEN }

	fn make_opening_key(
		&self,
		key:&[u8],
		nonce:&[u8],
		_mac_key:&[u8],
		_mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
		let mut iv = [0; NONCE_LEN];

		iv.clone_from_slice(nonce);

		Ok(Box::new(OpeningKey {
			nonce:iv,
			cipher:Aes256Gcm::new_from_slice(key).map_err(|_| Error::Kex)?,
		}))
	}

	fn make_sealing_key(
		&self,
		key:&[u8],
		nonce:&[u8],
		_mac_key:&[u8],
		_mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn super::SealingKey + Send>, Error> {
		let mut iv = [0; NONCE_LEN];

		iv.clone_from_slice(nonce);

		Ok(Box::new(SealingKey {
			nonce:iv,
			cipher:Aes256Gcm::new_from_slice(key).map_err(|_| Error::Kex)?,
		}))
	}
}

pub(crate) struct OpeningKey {
	nonce:[u8; NONCE_LEN],
	cipher:Aes256Gcm,
}

pub(crate) struct SealingKey {
	nonce:[u8; NONCE_LEN],
	cipher:Aes256Gcm,
}

/// The low 8 bytes are the invocation counter; the fixed field stays.
fn inc_nonce(nonce:&mut [u8; NONCE_LEN]) {
	for i in (4..NONCE_LEN).rev() {
		nonce[i] = nonce[i].wrapping_add(1);

		if nonce[i] != 0 {
			break;
		}
	}
}

impl super::OpeningKey for OpeningKey {
	fn decrypt_packet_length(&self, _seqn:u32, packet_length:[u8; 4]) -> Result<[u8; 4], Error> {
		// The length is authenticated but not encrypted.
		Ok(packet_length)
	}

	fn tag_len(&self) -> usize { TAG_LEN }

	fn check_packet_length(&self, length:usize) -> Result<(), Error> {
		if length % BLOCK_SIZE != 0 {
			return Err(Error::BadLength(length));
		}

		Ok(())
	}

	fn open<'a>(
		&mut self,
		_seqn:u32,
		ciphertext_in_plaintext_out:&'a mut [u8],
		tag:&[u8],
	) -> Result<&'a [u8], Error> {
		{
			let (length, ciphertext) =
				ciphertext_in_plaintext_out.split_at_mut(PACKET_LENGTH_LEN);

			self.cipher
				.decrypt_in_place_detached(
					GenericArray::from_slice(&self.nonce),
					length,
					ciphertext,
					GenericArray::from_slice(tag),
				)
				.map_err(|_| Error::IntegrityFailure)?;
		}

		inc_nonce(&mut self.nonce);

		#[allow(clippy::indexing_slicing)] // length checked by the caller
		Ok(&ciphertext_in_plaintext_out[PACKET_LENGTH_LEN..])
	}
}

impl super::SealingKey for SealingKey {
	fn padding_length(&self, payload:&[u8]) -> usize {
		// The length field is outside the encrypted region.
		let padding_len = BLOCK_SIZE - ((PADDING_LENGTH_LEN + payload.len()) % BLOCK_SIZE);

		if padding_len < PACKET_LENGTH_LEN { padding_len + BLOCK_SIZE } else { padding_len }
	}

	fn fill_padding(&self, padding_out:&mut [u8]) { rand::thread_rng().fill_bytes(padding_out) }

	fn tag_len(&self) -> usize { TAG_LEN }

	fn seal(&mut self, _seqn:u32, plaintext_in_ciphertext_out:&mut [u8], tag_out:&mut [u8]) {
		let (length, plaintext) = plaintext_in_ciphertext_out.split_at_mut(PACKET_LENGTH_LEN);

		// The framing layer only hands over buffers within AES-GCM's
		// size bounds, so a failure here must never ship a packet.
		#[allow(clippy::expect_used)]
		let tag = self
			.cipher
			.encrypt_in_place_detached(GenericArray::from_slice(&self.nonce), length, plaintext)
			.expect("aes-gcm seal");

		tag_out.clone_from_slice(tag.as_slice());

		inc_nonce(&mut self.nonce);
	}
}
