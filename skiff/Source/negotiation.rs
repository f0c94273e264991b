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

//! `KEXINIT` negotiation: for every category independently, the chosen
//! algorithm is the first entry of the client's preference list that the
//! server also supports.

use log::debug;
use rand::RngCore;
use skiff_cryptovec::CryptoVec;
use skiff_keys::{encoding::{Encoding, Reader}, key};

use crate::{Error, cipher, compression::Compression, kex, mac, msg};

/// Client preference lists, in decreasing order of preference.
#[derive(Debug, Clone)]
pub struct Preferred {
	pub kex:&'static [kex::Name],
	pub key:&'static [key::Name],
	pub cipher:&'static [cipher::Name],
	pub mac:&'static [mac::Name],
	pub compression:&'static [&'static str],
}

impl Preferred {
	pub const COMPRESSED:Preferred = Preferred {
		kex:SAFE_KEX_ORDER,
		key:SAFE_KEY_ORDER,
		cipher:SAFE_CIPHER_ORDER,
		mac:SAFE_MAC_ORDER,
		compression:COMPRESSED_COMPRESSION_ORDER,
	};
	pub const DEFAULT:Preferred = Preferred {
		kex:SAFE_KEX_ORDER,
		key:SAFE_KEY_ORDER,
		cipher:SAFE_CIPHER_ORDER,
		mac:SAFE_MAC_ORDER,
		compression:DEFAULT_COMPRESSION_ORDER,
	};
}

#[cfg(feature = "flate2")]
const DEFAULT_COMPRESSION_ORDER:&[&str] = &["none", "zlib@openssh.com", "zlib"];
#[cfg(not(feature = "flate2"))]
const DEFAULT_COMPRESSION_ORDER:&[&str] = &["none"];

#[cfg(feature = "flate2")]
const COMPRESSED_COMPRESSION_ORDER:&[&str] = &["zlib@openssh.com", "zlib", "none"];
#[cfg(not(feature = "flate2"))]
const COMPRESSED_COMPRESSION_ORDER:&[&str] = &["none"];

const SAFE_KEX_ORDER:&[kex::Name] =
	&[kex::CURVE25519, kex::CURVE25519_PRE_RFC_8731, kex::DH_G14_SHA256, kex::DH_G14_SHA1];

const SAFE_KEY_ORDER:&[key::Name] = &[key::ED25519, key::RSA_SHA2_512, key::RSA_SHA2_256];

const SAFE_CIPHER_ORDER:&[cipher::Name] = &[
	cipher::CHACHA20_POLY1305,
	cipher::AES_256_GCM,
	cipher::AES_256_CTR,
	cipher::AES_192_CTR,
	cipher::AES_128_CTR,
];

const SAFE_MAC_ORDER:&[mac::Name] = &[
	mac::HMAC_SHA256_ETM,
	mac::HMAC_SHA512_ETM,
	mac::HMAC_SHA1_ETM,
	mac::HMAC_SHA256,
	mac::HMAC_SHA512,
	mac::HMAC_SHA1,
];

impl Default for Preferred {
	fn default() -> Preferred { Preferred::DEFAULT }
}

/// Advertised in the kex list per RFC 8308 §2.1.
const EXTENSION_EXT_INFO_C:&str = "ext-info-c";

pub trait Named {
	fn name(&self) -> &'static str;
}

impl Named for key::PublicKey {
	fn name(&self) -> &'static str { key::PublicKey::name(self) }
}

impl Named for key::KeyPair {
	fn name(&self) -> &'static str { key::KeyPair::name(self) }
}

/// The outcome of negotiation, one algorithm per category and direction.
#[derive(Debug)]
pub(crate) struct Names {
	pub kex:kex::Name,
	pub key:key::Name,
	pub client_cipher:cipher::Name,
	pub server_cipher:cipher::Name,
	pub client_mac:mac::Name,
	pub server_mac:mac::Name,
	pub client_compression:Compression,
	pub server_compression:Compression,
	/// The server guessed a first kex packet that lost the negotiation;
	/// its next kex packet must be discarded (RFC 4253 §7).
	pub ignore_guessed:bool,
}

/// First entry of `client_list` that appears in the server's
/// comma-separated `server_list`.
fn select<S:AsRef<str> + Copy>(client_list:&[S], server_list:&[u8]) -> Option<S> {
	client_list.iter().copied().find(|c| {
		server_list.split(|&b| b == b',').any(|s| s == c.as_ref().as_bytes())
	})
}

fn first_server_name(server_list:&[u8]) -> &[u8] {
	server_list.split(|&b| b == b',').next().unwrap_or(b"")
}

/// Parse the server `KEXINIT` payload (message byte included) and run
/// the negotiation against `pref`.
pub(crate) fn read_kex(buf:&[u8], pref:&Preferred) -> Result<Names, Error> {
	if buf.first() != Some(&msg::KEXINIT) {
		return Err(Error::Inconsistent);
	}

	let mut r = buf.reader(1);

	// 16-byte cookie.
	r.position += 16;

	let kex_list = r.read_string()?;

	let key_list = r.read_string()?;

	let cipher_c2s = r.read_string()?;

	let cipher_s2c = r.read_string()?;

	let mac_c2s = r.read_string()?;

	let mac_s2c = r.read_string()?;

	let comp_c2s = r.read_string()?;

	let comp_s2c = r.read_string()?;

	// Language lists, ignored.
	r.read_string()?;

	r.read_string()?;

	let follows = r.read_bool()?;

	let kex = select(pref.kex, kex_list).ok_or(Error::NoCommonKexAlgo)?;

	let key = select(pref.key, key_list).ok_or(Error::NoCommonKeyAlgo)?;

	let client_cipher = select(pref.cipher, cipher_c2s).ok_or(Error::NoCommonCipher)?;

	let server_cipher = select(pref.cipher, cipher_s2c).ok_or(Error::NoCommonCipher)?;

	let client_mac = select(pref.mac, mac_c2s).ok_or(Error::NoCommonMac)?;

	let server_mac = select(pref.mac, mac_s2c).ok_or(Error::NoCommonMac)?;

	let client_compression =
		select(pref.compression, comp_c2s).ok_or(Error::NoCommonCompression)?;

	let server_compression =
		select(pref.compression, comp_s2c).ok_or(Error::NoCommonCompression)?;

	debug!(
		"negotiated kex {:?}, key {:?}, ciphers {:?}/{:?}, macs {:?}/{:?}",
		kex, key, client_cipher, server_cipher, client_mac, server_mac
	);

	Ok(Names {
		kex,
		key,
		client_cipher,
		server_cipher,
		client_mac,
		server_mac,
		client_compression:Compression::from_string(client_compression),
		server_compression:Compression::from_string(server_compression),
		ignore_guessed:follows && first_server_name(kex_list) != kex.as_ref().as_bytes(),
	})
}

/// Write our `KEXINIT` payload (message byte included).
pub(crate) fn write_kexinit(pref:&Preferred, buf:&mut CryptoVec) {
	buf.push(msg::KEXINIT);

	let mut cookie = [0u8; 16];

	rand::thread_rng().fill_bytes(&mut cookie);

	buf.extend(&cookie);

	buf.extend_list(
		pref.kex.iter().map(|k| k.as_ref()).chain(std::iter::once(EXTENSION_EXT_INFO_C)),
	);

	buf.extend_list(pref.key.iter().map(|k| k.as_ref()));

	buf.extend_list(pref.cipher.iter().map(|k| k.as_ref()));

	buf.extend_list(pref.cipher.iter().map(|k| k.as_ref()));

	buf.extend_list(pref.mac.iter().map(|k| k.as_ref()));

	buf.extend_list(pref.mac.iter().map(|k| k.as_ref()));

	buf.extend_list(pref.compression.iter().copied());

	buf.extend_list(pref.compression.iter().copied());

	// Languages.
	buf.write_empty_list();

	buf.write_empty_list();

	// first_kex_packet_follows, reserved.
	buf.push(0);

	buf.push_u32_be(0);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn server_kexinit(
		kex:&str,
		key:&str,
		cipher:&str,
		mac:&str,
		comp:&str,
		follows:bool,
	) -> CryptoVec {
		let mut buf = CryptoVec::new();

		buf.push(msg::KEXINIT);

		buf.extend(&[0u8; 16]);

		for list in [kex, key, cipher, cipher, mac, mac, comp, comp, "", ""] {
			buf.extend_ssh_string(list.as_bytes());
		}

		buf.push(follows as u8);

		buf.push_u32_be(0);

		buf
	}

	#[test]
	fn picks_first_client_preference() {
		let server = server_kexinit(
			"diffie-hellman-group14-sha256,curve25519-sha256",
			"ssh-ed25519,rsa-sha2-512",
			"aes256-ctr,chacha20-poly1305@openssh.com",
			"hmac-sha2-256,hmac-sha2-256-etm@openssh.com",
			"none,zlib",
			false,
		);

		let names = read_kex(&server, &Preferred::DEFAULT).unwrap();

		// Client order wins, not server order.
		assert_eq!(names.kex, kex::CURVE25519);

		assert_eq!(names.key, key::ED25519);

		assert_eq!(names.client_cipher, cipher::CHACHA20_POLY1305);

		assert_eq!(names.client_mac, mac::HMAC_SHA256_ETM);

		assert_eq!(names.client_compression, Compression::None);

		assert!(!names.ignore_guessed);
	}

	#[test]
	fn no_intersection_is_an_error() {
		let server = server_kexinit(
			"some-imaginary-kex",
			"ssh-ed25519",
			"aes256-ctr",
			"hmac-sha2-256",
			"none",
			false,
		);

		assert!(matches!(read_kex(&server, &Preferred::DEFAULT), Err(Error::NoCommonKexAlgo)));

		let server = server_kexinit(
			"curve25519-sha256",
			"ssh-ed25519",
			"serpent256-cbc",
			"hmac-sha2-256",
			"none",
			false,
		);

		assert!(matches!(read_kex(&server, &Preferred::DEFAULT), Err(Error::NoCommonCipher)));
	}

	#[test]
	fn wrong_server_guess_is_flagged() {
		let server = server_kexinit(
			"diffie-hellman-group14-sha256,curve25519-sha256",
			"ssh-ed25519",
			"aes256-ctr",
			"hmac-sha2-256",
			"none",
			true,
		);

		assert!(read_kex(&server, &Preferred::DEFAULT).unwrap().ignore_guessed);

		// A correct guess is not discarded.
		let server = server_kexinit(
			"curve25519-sha256",
			"ssh-ed25519",
			"aes256-ctr",
			"hmac-sha2-256",
			"none",
			true,
		);

		assert!(!read_kex(&server, &Preferred::DEFAULT).unwrap().ignore_guessed);
	}

	#[test]
	fn our_kexinit_parses_back() {
		let mut buf = CryptoVec::new();

		write_kexinit(&Preferred::DEFAULT, &mut buf);

		let mut r = buf.reader(17);

		let kex_list = r.read_string().unwrap();

		// The extension marker rides along with the kex algorithms.
		assert!(kex_list.ends_with(b",ext-info-c"));

		for _ in 0..9 {
			r.read_string().unwrap();
		}

		assert!(!r.read_bool().unwrap());

		assert_eq!(r.read_u32().unwrap(), 0);
	}
}
