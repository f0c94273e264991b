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

//! A contiguous byte vector for key material and packet plaintext. The
//! backing memory is locked into RAM where the platform allows it, and is
//! overwritten with zeros before it is ever handed back to the allocator.

use std::{
	alloc::{self, Layout},
	ops::{Deref, DerefMut, Index, IndexMut, Range, RangeFrom, RangeFull, RangeTo},
	ptr,
};

/// A vector which zeroes its memory on clears and reallocations, and
/// locks the underlying pages while they hold data.
pub struct CryptoVec {
	p:*mut u8,
	size:usize,
	capacity:usize,
}

unsafe impl Send for CryptoVec {}
unsafe impl Sync for CryptoVec {}

impl Default for CryptoVec {
	fn default() -> Self { CryptoVec { p:ptr::NonNull::dangling().as_ptr(), size:0, capacity:0 } }
}

impl std::fmt::Debug for CryptoVec {
	fn fmt(&self, fmt:&mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
		self.deref().fmt(fmt)
	}
}

impl Clone for CryptoVec {
	fn clone(&self) -> Self {
		let mut v = CryptoVec::new();

		v.extend(self);

		v
	}
}

impl PartialEq for CryptoVec {
	fn eq(&self, other:&Self) -> bool { self.deref() == other.deref() }
}

impl Eq for CryptoVec {}

impl Deref for CryptoVec {
	type Target = [u8];

	fn deref(&self) -> &[u8] { unsafe { std::slice::from_raw_parts(self.p, self.size) } }
}

impl DerefMut for CryptoVec {
	fn deref_mut(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.p, self.size) }
	}
}

impl AsRef<[u8]> for CryptoVec {
	fn as_ref(&self) -> &[u8] { self.deref() }
}

impl AsMut<[u8]> for CryptoVec {
	fn as_mut(&mut self) -> &mut [u8] { self.deref_mut() }
}

impl Index<RangeFrom<usize>> for CryptoVec {
	type Output = [u8];

	fn index(&self, index:RangeFrom<usize>) -> &[u8] { self.deref().index(index) }
}
impl Index<RangeTo<usize>> for CryptoVec {
	type Output = [u8];

	fn index(&self, index:RangeTo<usize>) -> &[u8] { self.deref().index(index) }
}
impl Index<Range<usize>> for CryptoVec {
	type Output = [u8];

	fn index(&self, index:Range<usize>) -> &[u8] { self.deref().index(index) }
}
impl Index<RangeFull> for CryptoVec {
	type Output = [u8];

	fn index(&self, _:RangeFull) -> &[u8] { self.deref() }
}
impl Index<usize> for CryptoVec {
	type Output = u8;

	fn index(&self, index:usize) -> &u8 { self.deref().index(index) }
}
impl IndexMut<RangeFrom<usize>> for CryptoVec {
	fn index_mut(&mut self, index:RangeFrom<usize>) -> &mut [u8] { self.deref_mut().index_mut(index) }
}
impl IndexMut<Range<usize>> for CryptoVec {
	fn index_mut(&mut self, index:Range<usize>) -> &mut [u8] { self.deref_mut().index_mut(index) }
}
impl IndexMut<usize> for CryptoVec {
	fn index_mut(&mut self, index:usize) -> &mut u8 { self.deref_mut().index_mut(index) }
}

impl std::io::Write for CryptoVec {
	fn write(&mut self, buf:&[u8]) -> std::io::Result<usize> {
		self.extend(buf);

		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

#[cfg(not(windows))]
fn mlock(ptr:*const u8, len:usize) {
	unsafe {
		libc::mlock(ptr as *const libc::c_void, len);
	}
}
#[cfg(not(windows))]
fn munlock(ptr:*const u8, len:usize) {
	unsafe {
		libc::munlock(ptr as *const libc::c_void, len);
	}
}

#[cfg(windows)]
fn mlock(ptr:*const u8, len:usize) {
	use winapi::{shared::basetsd::SIZE_T, um::memoryapi::VirtualLock};

	unsafe {
		VirtualLock(ptr as *mut winapi::ctypes::c_void, len as SIZE_T);
	}
}
#[cfg(windows)]
fn munlock(ptr:*const u8, len:usize) {
	use winapi::{shared::basetsd::SIZE_T, um::memoryapi::VirtualUnlock};

	unsafe {
		VirtualUnlock(ptr as *mut winapi::ctypes::c_void, len as SIZE_T);
	}
}

/// Overwrite a region with zeros in a way the optimiser must not elide.
unsafe fn zero(ptr:*mut u8, len:usize) {
	for i in 0..len {
		ptr::write_volatile(ptr.add(i), 0);
	}

	std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

impl CryptoVec {
	/// Creates an empty vector, with no allocated memory.
	pub fn new() -> CryptoVec { CryptoVec::default() }

	/// Creates a zeroed vector of length `size`.
	pub fn new_zeroed(size:usize) -> CryptoVec {
		let mut v = CryptoVec::new();

		v.resize(size);

		v
	}

	/// Creates a vector with the given content.
	pub fn from_slice(s:&[u8]) -> CryptoVec {
		let mut v = CryptoVec::new();

		v.extend(s);

		v
	}

	pub fn len(&self) -> usize { self.size }

	pub fn is_empty(&self) -> bool { self.size == 0 }

	/// Sets the length to 0, zeroing the previous contents. The allocation
	/// is kept for reuse.
	pub fn clear(&mut self) {
		unsafe {
			zero(self.p, self.size);
		}

		self.size = 0;
	}

	fn grow(&mut self, target:usize) {
		let mut capacity = if self.capacity == 0 { 64 } else { self.capacity };

		while capacity < target {
			capacity *= 2;
		}

		unsafe {
			let layout = Layout::from_size_align(capacity, 1).expect("layout overflow");

			let p = alloc::alloc_zeroed(layout);

			if p.is_null() {
				alloc::handle_alloc_error(layout)
			}

			mlock(p, capacity);

			if self.capacity > 0 {
				ptr::copy_nonoverlapping(self.p, p, self.size);

				zero(self.p, self.size);

				munlock(self.p, self.capacity);

				let old = Layout::from_size_align(self.capacity, 1).expect("layout overflow");

				alloc::dealloc(self.p, old);
			}

			self.p = p;

			self.capacity = capacity;
		}
	}

	/// Resizes to `size` bytes. Bytes revealed by growing are zero; bytes
	/// dropped by shrinking are zeroed before becoming unreachable.
	pub fn resize(&mut self, size:usize) {
		if size > self.capacity {
			self.grow(size);
		} else if size < self.size {
			unsafe {
				zero(self.p.add(size), self.size - size);
			}
		}

		self.size = size;
	}

	/// Appends `n` zero bytes and returns the newly appended region.
	pub fn resize_mut(&mut self, n:usize) -> &mut [u8] {
		let old = self.size;

		self.resize(old + n);

		unsafe { std::slice::from_raw_parts_mut(self.p.add(old), n) }
	}

	pub fn push(&mut self, byte:u8) {
		let old = self.size;

		self.resize(old + 1);

		unsafe {
			*self.p.add(old) = byte;
		}
	}

	/// Appends a big-endian `u32`.
	pub fn push_u32_be(&mut self, u:u32) { self.extend(&u.to_be_bytes()) }

	/// Reads a big-endian `u32` at offset `i`, if there are four bytes there.
	pub fn read_u32_be(&self, i:usize) -> Option<u32> {
		let b = self.deref().get(i..i + 4)?;

		Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}

	pub fn extend(&mut self, s:&[u8]) {
		let old = self.size;

		self.resize(old + s.len());

		unsafe {
			ptr::copy_nonoverlapping(s.as_ptr(), self.p.add(old), s.len());
		}
	}
}

impl Drop for CryptoVec {
	fn drop(&mut self) {
		if self.capacity > 0 {
			unsafe {
				zero(self.p, self.capacity);

				munlock(self.p, self.capacity);

				let layout = Layout::from_size_align(self.capacity, 1).expect("layout overflow");

				alloc::dealloc(self.p, layout);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn grow_keeps_contents() {
		let mut v = CryptoVec::new();

		v.extend(b"hello");

		v.resize_mut(200);

		assert_eq!(&v[..5], b"hello");

		assert_eq!(v.len(), 205);

		assert!(v[5..].iter().all(|&b| b == 0));
	}

	#[test]
	fn shrink_zeroes_tail() {
		let mut v = CryptoVec::from_slice(b"secret material");

		v.resize(6);

		assert_eq!(&v[..], b"secret");

		// Growing back must not resurrect the old bytes.
		v.resize(15);

		assert!(v[6..].iter().all(|&b| b == 0));
	}

	#[test]
	fn u32_roundtrip() {
		let mut v = CryptoVec::new();

		v.push_u32_be(35000);

		assert_eq!(v.read_u32_be(0), Some(35000));

		assert_eq!(v.read_u32_be(1), None);
	}

	#[test]
	fn clear_keeps_capacity() {
		let mut v = CryptoVec::from_slice(&[1u8; 300]);

		v.clear();

		assert!(v.is_empty());

		v.extend(&[2u8; 300]);

		assert_eq!(v.len(), 300);
	}
}
