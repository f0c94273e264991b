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

//! This module exports cipher names for use with [Preferred], and drives
//! packet framing: length decryption, length sanity checks, open/seal and
//! per-direction sequence numbers.

use std::{collections::HashMap, fmt::Debug, marker::PhantomData, num::Wrapping};

use byteorder::{BigEndian, ByteOrder};
use log::debug;
use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, mac::MacAlgorithm, sshbuffer::SSHBuffer};

pub(crate) mod clear;

pub(crate) mod block;
pub(crate) mod chacha20poly1305;
pub(crate) mod gcm;

use block::SshBlockCipher;
use chacha20poly1305::SshChacha20Poly1305Cipher;
use clear::Clear;
use gcm::GcmCipher;

pub(crate) trait Cipher {
	fn needs_mac(&self) -> bool { false }

	fn key_len(&self) -> usize;

	fn nonce_len(&self) -> usize { 0 }

	fn make_opening_key(
		&self,
		key:&[u8],
		nonce:&[u8],
		mac_key:&[u8],
		mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn OpeningKey + Send>, Error>;

	fn make_sealing_key(
		&self,
		key:&[u8],
		nonce:&[u8],
		mac_key:&[u8],
		mac:&dyn MacAlgorithm,
	) -> Result<Box<dyn SealingKey + Send>, Error>;
}

/// `clear`
pub const CLEAR:Name = Name("clear");
/// `aes128-ctr`
pub const AES_128_CTR:Name = Name("aes128-ctr");
/// `aes192-ctr`
pub const AES_192_CTR:Name = Name("aes192-ctr");
/// `aes256-ctr`
pub const AES_256_CTR:Name = Name("aes256-ctr");
/// `aes256-gcm@openssh.com`
pub const AES_256_GCM:Name = Name("aes256-gcm@openssh.com");
/// `chacha20-poly1305@openssh.com`
pub const CHACHA20_POLY1305:Name = Name("chacha20-poly1305@openssh.com");
/// `none`
pub const NONE:Name = Name("none");

static _CLEAR:Clear = Clear {};

static _AES_128_CTR:SshBlockCipher<ctr::Ctr128BE<aes::Aes128>> = SshBlockCipher(PhantomData);

static _AES_192_CTR:SshBlockCipher<ctr::Ctr128BE<aes::Aes192>> = SshBlockCipher(PhantomData);

static _AES_256_CTR:SshBlockCipher<ctr::Ctr128BE<aes::Aes256>> = SshBlockCipher(PhantomData);

static _AES_256_GCM:GcmCipher = GcmCipher {};

static _CHACHA20_POLY1305:SshChacha20Poly1305Cipher = SshChacha20Poly1305Cipher {};

pub(crate) static CIPHERS:Lazy<HashMap<&'static Name, &(dyn Cipher + Send + Sync)>> =
	Lazy::new(|| {
		let mut h:HashMap<&'static Name, &(dyn Cipher + Send + Sync)> = HashMap::new();

		h.insert(&CLEAR, &_CLEAR);

		h.insert(&NONE, &_CLEAR);

		h.insert(&AES_128_CTR, &_AES_128_CTR);

		h.insert(&AES_192_CTR, &_AES_192_CTR);

		h.insert(&AES_256_CTR, &_AES_256_CTR);

		h.insert(&AES_256_GCM, &_AES_256_GCM);

		h.insert(&CHACHA20_POLY1305, &_CHACHA20_POLY1305);

		h
	});

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
	fn as_ref(&self) -> &str { self.0 }
}

/// Both directions of a connection. Replaced wholesale when `NEWKEYS` is
/// exchanged; the old keys are zeroed as they are dropped.
pub(crate) struct CipherPair {
	pub local_to_remote:Box<dyn SealingKey + Send>,
	pub remote_to_local:Box<dyn OpeningKey + Send>,
}

impl CipherPair {
	pub fn clear() -> Self {
		CipherPair {
			local_to_remote:Box::new(clear::Key),
			remote_to_local:Box::new(clear::Key),
		}
	}
}

impl Debug for CipherPair {
	fn fmt(&self, _:&mut std::fmt::Formatter) -> Result<(), std::fmt::Error> { Ok(()) }
}

pub(crate) trait OpeningKey {
	fn decrypt_packet_length(
		&self,
		seqn:u32,
		encrypted_packet_length:[u8; 4],
	) -> Result<[u8; 4], Error>;

	fn tag_len(&self) -> usize;

	/// Cipher-specific block-alignment constraint on the declared length.
	fn check_packet_length(&self, length:usize) -> Result<(), Error>;

	fn open<'a>(
		&mut self,
		seqn:u32,
		ciphertext_in_plaintext_out:&'a mut [u8],
		tag:&[u8],
	) -> Result<&'a [u8], Error>;
}

pub(crate) trait SealingKey {
	fn padding_length(&self, plaintext:&[u8]) -> usize;

	fn fill_padding(&self, padding_out:&mut [u8]);

	fn tag_len(&self) -> usize;

	fn seal(&mut self, seqn:u32, plaintext_in_ciphertext_out:&mut [u8], tag_out:&mut [u8]);

	fn write(&mut self, payload:&[u8], buffer:&mut SSHBuffer) {
		// https://tools.ietf.org/html/rfc4253#section-6
		//
		// The variables `payload`, `packet_length` and `padding_length`
		// refer to the protocol fields of the same names.
		debug!("writing, seqn = {:?}", buffer.seqn.0);

		let padding_length = self.padding_length(payload);

		let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;

		debug!("packet_length {:?}", packet_length);

		let offset = buffer.buffer.len();

		// Maximum packet length:
		// https://tools.ietf.org/html/rfc4253#section-6.1
		assert!(packet_length <= u32::MAX as usize);

		buffer.buffer.push_u32_be(packet_length as u32);

		assert!(padding_length <= u8::MAX as usize);

		buffer.buffer.push(padding_length as u8);

		buffer.buffer.extend(payload);

		self.fill_padding(buffer.buffer.resize_mut(padding_length));

		buffer.buffer.resize_mut(self.tag_len());

		#[allow(clippy::indexing_slicing)] // length checked
		let (plaintext, tag) =
			buffer.buffer[offset..].split_at_mut(PACKET_LENGTH_LEN + packet_length);

		self.seal(buffer.seqn.0, plaintext, tag);

		buffer.bytes += payload.len();

		buffer.packets += 1;

		// Sequence numbers are on 32 bits and wrap.
		// https://tools.ietf.org/html/rfc4253#section-6.4
		buffer.seqn += Wrapping(1);
	}
}

/// Read and decrypt one packet, leaving `[length ‖ padding_length ‖
/// payload]` in `buffer.buffer` and returning the offset one past the
/// payload. The declared length is validated against `max_len` and the
/// cipher's block constraint before the body is read.
pub(crate) async fn read<'a, R:AsyncRead + Unpin>(
	stream:&'a mut R,
	buffer:&'a mut SSHBuffer,
	cipher:&'a mut (dyn OpeningKey + Send),
	max_len:u32,
) -> Result<usize, Error> {
	if buffer.len == 0 {
		let mut len = [0; 4];

		stream.read_exact(&mut len).await?;

		{
			let seqn = buffer.seqn.0;

			buffer.buffer.clear();

			buffer.buffer.extend(&len);

			debug!("reading, seqn = {:?}", seqn);

			let len = cipher.decrypt_packet_length(seqn, len)?;

			let packet_length = BigEndian::read_u32(&len) as usize;

			debug!("reading, clear len = {:?}", packet_length);

			if packet_length > max_len as usize || packet_length > MAX_PACKET_LENGTH {
				return Err(Error::PacketTooLong(packet_length));
			}

			if packet_length < PADDING_LENGTH_LEN + MINIMUM_PADDING_LEN {
				return Err(Error::MalformedPacket);
			}

			cipher.check_packet_length(packet_length)?;

			buffer.len = packet_length + cipher.tag_len();
		}
	}

	buffer.buffer.resize(buffer.len + PACKET_LENGTH_LEN);

	#[allow(clippy::indexing_slicing)] // length checked
	stream.read_exact(&mut buffer.buffer[PACKET_LENGTH_LEN..]).await?;

	let seqn = buffer.seqn.0;

	let ciphertext_len = buffer.buffer.len() - cipher.tag_len();

	let (ciphertext, tag) = buffer.buffer.split_at_mut(ciphertext_len);

	let plaintext = cipher.open(seqn, ciphertext, tag)?;

	let padding_length = *plaintext.first().unwrap_or(&0) as usize;

	debug!("reading, padding_length {:?}", padding_length);

	if padding_length < MINIMUM_PADDING_LEN {
		return Err(Error::MalformedPacket);
	}

	let plaintext_end = plaintext.len().checked_sub(padding_length).ok_or(Error::MalformedPacket)?;

	buffer.bytes += plaintext_end;

	buffer.packets += 1;

	// Sequence numbers are on 32 bits and wrap.
	// https://tools.ietf.org/html/rfc4253#section-6.4
	buffer.seqn += Wrapping(1);

	buffer.len = 0;

	// Remove the padding
	buffer.buffer.resize(plaintext_end + PACKET_LENGTH_LEN);

	Ok(plaintext_end + PACKET_LENGTH_LEN)
}

pub(crate) const PACKET_LENGTH_LEN:usize = 4;

const MINIMUM_PADDING_LEN:usize = 4;

const PADDING_LENGTH_LEN:usize = 1;

/// Hard upper bound on the declared packet length, above the 35 000-byte
/// default of RFC 4253 §6.1.
const MAX_PACKET_LENGTH:usize = 1 << 18;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mac::{self, MACS};

	const MAX:u32 = 35_000;

	fn pair(
		cipher:Name,
		mac:mac::Name,
	) -> (Box<dyn SealingKey + Send>, Box<dyn OpeningKey + Send>) {
		let cipher = CIPHERS.get(&cipher).unwrap();

		let mac = *MACS.get(&mac).unwrap();

		let key = vec![42u8; cipher.key_len()];

		let nonce = vec![7u8; cipher.nonce_len()];

		let mac_key = vec![13u8; mac.key_len()];

		(
			cipher.make_sealing_key(&key, &nonce, &mac_key, mac).unwrap(),
			cipher.make_opening_key(&key, &nonce, &mac_key, mac).unwrap(),
		)
	}

	fn seal_packets(seal:&mut (dyn SealingKey + Send), payloads:&[&[u8]]) -> (Vec<u8>, u32) {
		let mut out = SSHBuffer::new();

		for payload in payloads {
			seal.write(payload, &mut out);
		}

		(out.buffer[..].to_vec(), out.seqn.0)
	}

	async fn open_packets(
		open:&mut (dyn OpeningKey + Send),
		mut wire:&[u8],
		count:usize,
	) -> Result<Vec<Vec<u8>>, Error> {
		let mut buffer = SSHBuffer::new();

		let mut payloads = Vec::new();

		for _ in 0..count {
			let end = read(&mut wire, &mut buffer, open, MAX).await?;

			payloads.push(buffer.buffer[5..end].to_vec());
		}

		Ok(payloads)
	}

	fn roundtrip(cipher:Name, mac:mac::Name) {
		let (mut seal, mut open) = pair(cipher, mac);

		let payloads:&[&[u8]] =
			&[b"\x14first packet", b"", b"\x15a somewhat longer second packet payload"];

		let (wire, sent) = seal_packets(seal.as_mut(), payloads);

		// One increment per packet, no gaps.
		assert_eq!(sent, payloads.len() as u32);

		let out = futures::executor::block_on(open_packets(open.as_mut(), &wire, payloads.len()))
			.unwrap();

		assert_eq!(out, payloads);
	}

	#[test]
	fn roundtrip_clear() { roundtrip(CLEAR, mac::NONE) }

	#[test]
	fn roundtrip_aes256_ctr_hmac() { roundtrip(AES_256_CTR, mac::HMAC_SHA256) }

	#[test]
	fn roundtrip_aes192_ctr_hmac_sha512() { roundtrip(AES_192_CTR, mac::HMAC_SHA512) }

	#[test]
	fn roundtrip_aes128_ctr_hmac_etm() { roundtrip(AES_128_CTR, mac::HMAC_SHA256_ETM) }

	#[test]
	fn roundtrip_chacha20_poly1305() { roundtrip(CHACHA20_POLY1305, mac::NONE) }

	#[test]
	fn roundtrip_aes256_gcm() { roundtrip(AES_256_GCM, mac::NONE) }

	#[test]
	fn tampering_is_detected_without_plaintext() {
		for (cipher, mac) in [
			(CHACHA20_POLY1305, mac::NONE),
			(AES_256_GCM, mac::NONE),
			(AES_256_CTR, mac::HMAC_SHA256_ETM),
			(AES_256_CTR, mac::HMAC_SHA1),
		] {
			let (mut seal, _) = pair(cipher, mac);

			let (wire, _) = seal_packets(seal.as_mut(), &[b"\x14sensitive payload"]);

			// Flip one bit anywhere in the packet: every position must
			// trip a decoder error, never yield a payload.
			for bit in 0..wire.len() * 8 {
				let (_, mut open) = pair(cipher, mac);

				let mut tampered = wire.clone();

				tampered[bit / 8] ^= 1 << (bit % 8);

				let r =
					futures::executor::block_on(open_packets(open.as_mut(), &tampered, 1));

				match r {
					Err(Error::IntegrityFailure)
					| Err(Error::PacketTooLong(_))
					| Err(Error::BadLength(_))
					| Err(Error::MalformedPacket)
					| Err(Error::IO(_)) => {},
					r => panic!("{:?}/{:?} bit {}: {:?}", cipher, mac, bit, r),
				}
			}
		}
	}

	#[test]
	fn oversized_length_fails_before_reading_the_body() {
		let (_, mut open) = pair(CLEAR, mac::NONE);

		// A declared length beyond max_len, and no body at all: the
		// decoder must fail on the length alone.
		let mut wire = Vec::new();

		wire.extend_from_slice(&100_000u32.to_be_bytes());

		let r = futures::executor::block_on(open_packets(open.as_mut(), &wire, 1));

		assert!(matches!(r, Err(Error::PacketTooLong(100_000))));
	}

	#[test]
	fn misaligned_length_is_rejected() {
		let (_, mut open) = pair(AES_256_GCM, mac::NONE);

		let mut wire = Vec::new();

		// 24 is not a multiple of the AES block size.
		wire.extend_from_slice(&24u32.to_be_bytes());

		wire.extend_from_slice(&[0u8; 64]);

		let r = futures::executor::block_on(open_packets(open.as_mut(), &wire, 1));

		assert!(matches!(r, Err(Error::BadLength(24))));
	}

	#[test]
	fn sequence_numbers_span_packets() {
		let (mut seal, mut open) = pair(CHACHA20_POLY1305, mac::NONE);

		let payloads:Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 9]).collect();

		let refs:Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();

		let (wire, sent) = seal_packets(seal.as_mut(), &refs);

		assert_eq!(sent, 10);

		let out = futures::executor::block_on(open_packets(open.as_mut(), &wire, 10)).unwrap();

		assert_eq!(out, payloads);
	}
}
