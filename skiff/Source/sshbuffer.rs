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

//! Per-direction framing buffers and a shared pool of reusable byte
//! buffers. Sequence numbers live here: one per direction, starting at 0
//! at connection time, incremented once per packet, wrapping on 32 bits
//! and never reset — not even by a key re-exchange.

use std::{num::Wrapping, sync::Mutex};

use once_cell::sync::Lazy;
use skiff_cryptovec::CryptoVec;

/// The framing state of one direction of the connection.
pub struct SSHBuffer {
	pub buffer:CryptoVec,
	/// Length of the packet currently being read, 0 between packets.
	pub len:usize,
	/// Payload bytes carried since the last key exchange.
	pub bytes:usize,
	/// The sequence number of the next packet.
	pub seqn:Wrapping<u32>,
	/// Packets carried since the last key exchange.
	pub packets:u64,
}

impl SSHBuffer {
	pub fn new() -> Self {
		SSHBuffer { buffer:POOL.take(), len:0, bytes:0, seqn:Wrapping(0), packets:0 }
	}
}

impl Default for SSHBuffer {
	fn default() -> Self { Self::new() }
}

impl Drop for SSHBuffer {
	fn drop(&mut self) { POOL.recycle(std::mem::take(&mut self.buffer)) }
}

/// A multi-producer pool of cleared [`CryptoVec`]s. Taking from an empty
/// pool allocates; recycling zeroes the buffer (a `CryptoVec::clear`) and
/// keeps a bounded number of allocations around for reuse.
pub struct BufferPool {
	pool:Mutex<Vec<CryptoVec>>,
}

const POOL_KEEP:usize = 32;

impl BufferPool {
	pub fn new() -> Self { BufferPool { pool:Mutex::new(Vec::new()) } }

	pub fn take(&self) -> CryptoVec {
		if let Ok(mut pool) = self.pool.lock() {
			if let Some(buffer) = pool.pop() {
				return buffer;
			}
		}

		CryptoVec::new()
	}

	pub fn recycle(&self, mut buffer:CryptoVec) {
		buffer.clear();

		if let Ok(mut pool) = self.pool.lock() {
			if pool.len() < POOL_KEEP {
				pool.push(buffer)
			}
		}
	}
}

impl Default for BufferPool {
	fn default() -> Self { Self::new() }
}

/// The process-wide buffer pool.
pub static POOL:Lazy<BufferPool> = Lazy::new(BufferPool::new);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recycled_buffers_come_back_empty() {
		let pool = BufferPool::new();

		let mut buffer = pool.take();

		buffer.extend(b"key material");

		pool.recycle(buffer);

		let buffer = pool.take();

		assert!(buffer.is_empty());
	}

	#[test]
	fn sequence_number_starts_at_zero() {
		let buffer = SSHBuffer::new();

		assert_eq!(buffer.seqn.0, 0);

		assert_eq!(buffer.len, 0);
	}
}
