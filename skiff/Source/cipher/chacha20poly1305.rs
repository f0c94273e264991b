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

// http://cvsweb.openbsd.org/cgi-bin/cvsweb/src/usr.bin/ssh/PROTOCOL.chacha20poly1305?annotate=HEAD

use byteorder::{BigEndian, ByteOrder};
use chacha20::{
	ChaCha20Legacy,
	cipher::{KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek},
};
use generic_array::GenericArray;
use poly1305::Poly1305;
use skiff_cryptovec::CryptoVec;
use subtle::ConstantTimeEq;

use super::{Cipher, Error, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::MacAlgorithm;

pub struct SshChacha20Poly1305Cipher {}

const KEY_BYTES:usize = 32;

const TAG_LEN:usize = 16;

const BLOCK_SIZE:usize = 8;

const MINIMUM_PACKET_LEN:usize = 16;

impl Cipher for SshChacha20Poly1305Cipher {
	// K_2 ‖ K_1, two 256-bit keys.
	fn key_len(&self) -> usize { 2 * KEY_BYTES }

	fn make_opening_key(
		&self,
		key:&[u8],
		_nonce:&[u8],
		_mac_key:&[u8],
		_mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
		Ok(Box::new(OpeningKey {
			k1:CryptoVec::from_slice(&key[KEY_BYTES..]),
			k2:CryptoVec::from_slice(&key[..KEY_BYTES]),
		}))
	}

	fn make_sealing_key(
		&self,
		key:&[u8],
		_nonce:&[u8],
		_mac_key:&[u8],
		_mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn super::SealingKey + Send>, Error> {
		Ok(Box::new(SealingKey {
			k1:CryptoVec::from_slice(&key[KEY_BYTES..]),
			k2:CryptoVec::from_slice(&key[..KEY_BYTES]),
		}))
	}
}

pub(crate) struct OpeningKey {
	k1:CryptoVec,
	k2:CryptoVec,
}

pub(crate) struct SealingKey {
	k1:CryptoVec,
	k2:CryptoVec,
}

/// The AEAD nonce is the packet sequence number, big-endian, in the low
/// four bytes of the 8-byte legacy nonce.
fn make_counter(seqn:u32) -> [u8; 8] {
	let mut nonce = [0; 8];

	BigEndian::write_u32(&mut nonce[4..], seqn);

	nonce
}

fn keystream(key:&[u8], nonce:&[u8; 8]) -> ChaCha20Legacy {
	// Key and nonce lengths are fixed at construction time.
	#[allow(clippy::unwrap_used)]
	ChaCha20Legacy::new_from_slices(key, nonce).unwrap()
}

/// The one-time Poly1305 key is the first 32 bytes of K_2's keystream at
/// block 0.
fn poly1305_tag(cipher:&mut ChaCha20Legacy, data:&[u8]) -> poly1305::Tag {
	let mut poly_key = [0u8; 32];

	cipher.apply_keystream(&mut poly_key);

	Poly1305::new(GenericArray::from_slice(&poly_key)).compute_unpadded(data)
}

impl super::OpeningKey for OpeningKey {
	fn decrypt_packet_length(
		&self,
		seqn:u32,
		mut encrypted_packet_length:[u8; 4],
	) -> Result<[u8; 4], Error> {
		let mut cipher = keystream(&self.k1, &make_counter(seqn));

		cipher.apply_keystream(&mut encrypted_packet_length);

		Ok(encrypted_packet_length)
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
		seqn:u32,
		ciphertext_in_plaintext_out:&'a mut [u8],
		tag:&[u8],
	) -> Result<&'a [u8], Error> {
		let mut cipher = keystream(&self.k2, &make_counter(seqn));

		// Tag over length ‖ ciphertext, before anything is decrypted.
		let expected = poly1305_tag(&mut cipher, ciphertext_in_plaintext_out);

		if !bool::from(expected.as_slice().ct_eq(tag)) {
			return Err(Error::IntegrityFailure);
		}

		// Payload keystream starts at block 1.
		cipher.seek(64u64);

		#[allow(clippy::indexing_slicing)] // length checked by the caller
		cipher.apply_keystream(&mut ciphertext_in_plaintext_out[PACKET_LENGTH_LEN..]);

		#[allow(clippy::indexing_slicing)]
		Ok(&ciphertext_in_plaintext_out[PACKET_LENGTH_LEN..])
	}
}

impl super::SealingKey for SealingKey {
	fn padding_length(&self, payload:&[u8]) -> usize {
		let extra_len = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN;

		let padding_len = if payload.len() + extra_len <= MINIMUM_PACKET_LEN {
			MINIMUM_PACKET_LEN - payload.len() - PADDING_LENGTH_LEN
		} else {
			BLOCK_SIZE - ((PADDING_LENGTH_LEN + payload.len()) % BLOCK_SIZE)
		};

		if padding_len < PACKET_LENGTH_LEN { padding_len + BLOCK_SIZE } else { padding_len }
	}

	fn fill_padding(&self, padding_out:&mut [u8]) {
		use rand::RngCore;

		rand::thread_rng().fill_bytes(padding_out)
	}

	fn tag_len(&self) -> usize { TAG_LEN }

	fn seal(&mut self, seqn:u32, plaintext_in_ciphertext_out:&mut [u8], tag_out:&mut [u8]) {
		let nonce = make_counter(seqn);

		{
			let (length, payload) = plaintext_in_ciphertext_out.split_at_mut(PACKET_LENGTH_LEN);

			keystream(&self.k1, &nonce).apply_keystream(length);

			let mut cipher = keystream(&self.k2, &nonce);

			cipher.seek(64u64);

			cipher.apply_keystream(payload);
		}

		let mut cipher = keystream(&self.k2, &nonce);

		let tag = poly1305_tag(&mut cipher, plaintext_in_ciphertext_out);

		tag_out.clone_from_slice(tag.as_slice());
	}
}
