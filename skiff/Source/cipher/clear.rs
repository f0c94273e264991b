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

//! Plain framing, used before the first key exchange completes and when
//! `none` is negotiated explicitly.

use rand::RngCore;

use super::{
	Cipher, Error, OpeningKey, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN, SealingKey,
};
use crate::mac::MacAlgorithm;

pub struct Clear {}

#[derive(Debug)]
pub(crate) struct Key;

impl Cipher for Clear {
	fn key_len(&self) -> usize { 0 }

	fn make_opening_key(
		&self,
		_key:&[u8],
		_nonce:&[u8],
		_mac_key:&[u8],
		_mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn OpeningKey + Send>, Error> {
		Ok(Box::new(Key))
	}

	fn make_sealing_key(
		&self,
		_key:&[u8],
		_nonce:&[u8],
		_mac_key:&[u8],
		_mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn SealingKey + Send>, Error> {
		Ok(Box::new(Key))
	}
}

const BLOCK_SIZE:usize = 8;

impl OpeningKey for Key {
	fn decrypt_packet_length(&self, _seqn:u32, packet_length:[u8; 4]) -> Result<[u8; 4], Error> {
		Ok(packet_length)
	}

	fn tag_len(&self) -> usize { 0 }

	fn check_packet_length(&self, length:usize) -> Result<(), Error> {
		if (PACKET_LENGTH_LEN + length) % BLOCK_SIZE != 0 {
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
		debug_assert!(tag.is_empty());

		#[allow(clippy::indexing_slicing)] // length checked by the caller
		Ok(&ciphertext_in_plaintext_out[PACKET_LENGTH_LEN..])
	}
}

impl SealingKey for Key {
	fn padding_length(&self, payload:&[u8]) -> usize {
		let padding_len =
			BLOCK_SIZE - ((PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload.len()) % BLOCK_SIZE);

		if padding_len < PACKET_LENGTH_LEN { padding_len + BLOCK_SIZE } else { padding_len }
	}

	fn fill_padding(&self, padding_out:&mut [u8]) { rand::thread_rng().fill_bytes(padding_out) }

	fn tag_len(&self) -> usize { 0 }

	fn seal(&mut self, _seqn:u32, _plaintext_in_ciphertext_out:&mut [u8], _tag_out:&mut [u8]) {}
}
