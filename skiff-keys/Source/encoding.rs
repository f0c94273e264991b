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

//! Reading and writing the SSH wire primitives of RFC 4251 §5: `byte`,
//! `boolean`, `uint32`, `string`, `mpint` and `name-list`.

use byteorder::{BigEndian, ByteOrder};
use skiff_cryptovec::CryptoVec;

use crate::Error;

#[doc(hidden)]
pub trait Bytes {
	fn bytes(&self) -> &[u8];
}

impl<A:AsRef<str>> Bytes for A {
	fn bytes(&self) -> &[u8] { self.as_ref().as_bytes() }
}

/// Encode in the SSH format.
pub trait Encoding {
	/// Push a big-endian `uint32`.
	fn push_u32_be(&mut self, u:u32);

	/// Push an SSH-encoded `string` (length-prefixed bytes).
	fn extend_ssh_string(&mut self, s:&[u8]);

	/// Push the length prefix of an `s`-byte string, returning the blank
	/// body to be filled in by the caller.
	fn extend_ssh_string_blank(&mut self, s:usize) -> &mut [u8];

	/// Push an SSH-encoded `mpint`: two's complement, no redundant leading
	/// zeros, a zero byte prepended when the high bit would flip the sign,
	/// and the number zero encoded as the empty string.
	fn extend_ssh_mpint(&mut self, s:&[u8]);

	/// Push a comma-separated `name-list`.
	fn extend_list<A:Bytes, I:Iterator<Item = A>>(&mut self, list:I);

	/// Push an empty `name-list`.
	fn write_empty_list(&mut self);
}

impl Encoding for CryptoVec {
	fn push_u32_be(&mut self, u:u32) { CryptoVec::push_u32_be(self, u) }

	fn extend_ssh_string(&mut self, s:&[u8]) {
		self.push_u32_be(s.len() as u32);

		self.extend(s);
	}

	fn extend_ssh_string_blank(&mut self, len:usize) -> &mut [u8] {
		self.push_u32_be(len as u32);

		self.resize_mut(len)
	}

	fn extend_ssh_mpint(&mut self, s:&[u8]) {
		// Skip leading zeros.
		let mut i = 0;

		while i < s.len() && s[i] == 0 {
			i += 1
		}

		// If the high bit is set, the positive sign needs an extra byte.
		if s[i..].first().map_or(false, |&b| b & 0x80 != 0) {
			self.push_u32_be((s.len() - i + 1) as u32);

			self.push(0)
		} else {
			self.push_u32_be((s.len() - i) as u32);
		}

		self.extend(&s[i..]);
	}

	fn extend_list<A:Bytes, I:Iterator<Item = A>>(&mut self, list:I) {
		let len0 = self.len();

		self.extend(&[0, 0, 0, 0]);

		let mut first = true;

		for i in list {
			if !first {
				self.push(b',')
			} else {
				first = false;
			}

			self.extend(i.bytes())
		}

		let len = (self.len() - len0 - 4) as u32;

		BigEndian::write_u32(&mut self[len0..], len);
	}

	fn write_empty_list(&mut self) { self.extend(&[0, 0, 0, 0]); }
}

impl Encoding for Vec<u8> {
	fn push_u32_be(&mut self, u:u32) { self.extend_from_slice(&u.to_be_bytes()) }

	fn extend_ssh_string(&mut self, s:&[u8]) {
		self.push_u32_be(s.len() as u32);

		self.extend_from_slice(s);
	}

	fn extend_ssh_string_blank(&mut self, len:usize) -> &mut [u8] {
		self.push_u32_be(len as u32);

		let current = self.len();

		self.resize(current + len, 0u8);

		&mut self[current..]
	}

	fn extend_ssh_mpint(&mut self, s:&[u8]) {
		let mut i = 0;

		while i < s.len() && s[i] == 0 {
			i += 1
		}

		if s[i..].first().map_or(false, |&b| b & 0x80 != 0) {
			self.push_u32_be((s.len() - i + 1) as u32);

			self.push(0)
		} else {
			self.push_u32_be((s.len() - i) as u32);
		}

		self.extend_from_slice(&s[i..]);
	}

	fn extend_list<A:Bytes, I:Iterator<Item = A>>(&mut self, list:I) {
		let len0 = self.len();

		self.extend_from_slice(&[0, 0, 0, 0]);

		let mut first = true;

		for i in list {
			if !first {
				self.push(b',')
			} else {
				first = false;
			}

			self.extend_from_slice(i.bytes())
		}

		let len = (self.len() - len0 - 4) as u32;

		BigEndian::write_u32(&mut self[len0..], len);
	}

	fn write_empty_list(&mut self) { self.extend_from_slice(&[0, 0, 0, 0]); }
}

/// Anything with a cursor over SSH-encoded bytes.
pub trait Reader {
	fn reader(&self, starting_at:usize) -> Position;
}

impl Reader for CryptoVec {
	fn reader(&self, starting_at:usize) -> Position { Position { s:self, position:starting_at } }
}

impl Reader for [u8] {
	fn reader(&self, starting_at:usize) -> Position { Position { s:self, position:starting_at } }
}

/// A cursor into a slice of SSH-encoded bytes. All reads fail with
/// [`Error::IndexOutOfBounds`] rather than reading past the end or past a
/// corrupt length field.
#[derive(Debug, Clone, Copy)]
pub struct Position<'a> {
	s:&'a [u8],
	pub position:usize,
}

impl<'a> Position<'a> {
	pub fn read_byte(&mut self) -> Result<u8, Error> {
		let b = *self.s.get(self.position).ok_or(Error::IndexOutOfBounds)?;

		self.position += 1;

		Ok(b)
	}

	pub fn read_u32(&mut self) -> Result<u32, Error> {
		let b = self.s.get(self.position..self.position + 4).ok_or(Error::IndexOutOfBounds)?;

		self.position += 4;

		Ok(BigEndian::read_u32(b))
	}

	/// Read a `boolean`: one byte, non-zero meaning true.
	pub fn read_bool(&mut self) -> Result<bool, Error> { Ok(self.read_byte()? != 0) }

	/// Read a `string`, returning its bytes without copying.
	pub fn read_string(&mut self) -> Result<&'a [u8], Error> {
		let len = self.read_u32()? as usize;

		let s = self.s.get(self.position..self.position + len).ok_or(Error::IndexOutOfBounds)?;

		self.position += len;

		Ok(s)
	}

	/// Read an `mpint`, returning its raw magnitude bytes.
	pub fn read_mpint(&mut self) -> Result<&'a [u8], Error> { self.read_string() }

	/// The bytes remaining after the cursor.
	pub fn remaining(&self) -> &'a [u8] { self.s.get(self.position..).unwrap_or(&[]) }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mpint_sign_rules() {
		// High bit set: a leading zero keeps the sign positive.
		let mut v = CryptoVec::new();

		v.extend_ssh_mpint(&[0x80]);

		assert_eq!(&v[..], &[0, 0, 0, 2, 0, 0x80]);

		// Redundant leading zeros are stripped.
		let mut v = CryptoVec::new();

		v.extend_ssh_mpint(&[0, 0, 0x7f, 0x01]);

		assert_eq!(&v[..], &[0, 0, 0, 2, 0x7f, 0x01]);

		// Zero is the empty string.
		let mut v = CryptoVec::new();

		v.extend_ssh_mpint(&[0, 0, 0]);

		assert_eq!(&v[..], &[0, 0, 0, 0]);
	}

	#[test]
	fn name_list() {
		let mut v = CryptoVec::new();

		v.extend_list(["curve25519-sha256", "ext-info-c"].iter());

		let mut r = v.reader(0);

		assert_eq!(r.read_string().unwrap(), b"curve25519-sha256,ext-info-c");

		let mut v = CryptoVec::new();

		v.write_empty_list();

		let mut r = v.reader(0);

		assert_eq!(r.read_string().unwrap(), b"");
	}

	#[test]
	fn truncated_reads_fail() {
		let v = CryptoVec::from_slice(&[0, 0, 0, 10, b'a']);

		let mut r = v.reader(0);

		assert!(matches!(r.read_string(), Err(Error::IndexOutOfBounds)));

		// The cursor did not move past the length field it rejected.
		let mut r = v.reader(4);

		assert_eq!(r.read_byte().unwrap(), b'a');
	}

	#[test]
	fn string_roundtrip() {
		let mut v = CryptoVec::new();

		v.extend_ssh_string(b"ssh-userauth");

		v.extend_ssh_string(b"");

		let mut r = v.reader(0);

		assert_eq!(r.read_string().unwrap(), b"ssh-userauth");

		assert_eq!(r.read_string().unwrap(), b"");

		assert!(r.read_byte().is_err());
	}
}
