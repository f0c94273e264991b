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

//! Client-side SSH library, based on tokio/futures: the transport layer
//! (framed, sequence-numbered, encrypted packets over TCP), key exchange
//! with host-key verification against a known-hosts store, and user
//! authentication. The channel layer above the packet stream is left to
//! the caller: once [`client::connect`] returns, the [`client::Handle`]
//! sends raw packets and the [`client::Handler`] receives them.
//!
//! The normal way to use this library is to implement [`client::Handler`]
//! (at least the host-key decision callback), build a [`client::Config`]
//! with an ordered list of [`Credential`]s, and call [`client::connect`]
//! with a destination and a cancellation token.
//!
//! # Design principles
//!
//! The main goal of this library is conciseness and readability: one
//! transport loop owns the socket and its cipher state, the key-exchange
//! and authentication state machines run inline on that loop, and
//! everything that touched key material is zeroed before it is freed.
//!
//! One non-goal is implementing every algorithm published since SSH was
//! released. Prefer recent primitives: Ed25519 for public keys,
//! ChaCha20-Poly1305 or AES-GCM for the wire.

#[macro_use]
extern crate bitflags;

pub use skiff_cryptovec::CryptoVec;
pub use skiff_keys::{KnownHostsCheck, key};

mod auth;
/// Cipher names for [`Preferred`].
pub mod cipher;
mod compression;
/// Key-exchange names for [`Preferred`].
pub mod kex;
/// MAC names for [`Preferred`].
pub mod mac;
mod msg;
mod negotiation;
mod session;
mod ssh_read;
mod sshbuffer;

pub use auth::{AgentAuthError, Credential, MethodSet, Signer};
pub use negotiation::{Named, Preferred};

/// Client side of this library.
pub mod client;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	/// Umbrella for everything that can go wrong before the connection
	/// is ready; always carries the original failure.
	#[error("Connection failed: {0}")]
	ConnectFailed(#[source] Box<Error>),

	/// The connect deadline elapsed.
	#[error("Connection timeout")]
	Timeout,

	/// The caller's cancellation token fired. Never wrapped.
	#[error("Cancelled")]
	Cancelled,

	/// Banner, framing or an unexpected message id.
	#[error("Protocol error")]
	ProtocolError,

	/// Invalid SSH version string.
	#[error("Invalid SSH version string")]
	Version,

	/// A packet declared a length over the configured maximum.
	#[error("Packet too long ({0} bytes)")]
	PacketTooLong(usize),

	/// Invalid packet authentication code or AEAD tag.
	#[error("Wrong packet authentication code")]
	IntegrityFailure,

	/// Framing that contradicts itself (padding, truncation).
	#[error("Malformed packet")]
	MalformedPacket,

	/// A declared length violating the cipher's block constraint.
	#[error("Bad packet length ({0} bytes)")]
	BadLength(usize),

	/// No common key exchange algorithm.
	#[error("No common key exchange algorithm")]
	NoCommonKexAlgo,

	/// No common host key algorithm.
	#[error("No common key algorithm")]
	NoCommonKeyAlgo,

	/// No common cipher.
	#[error("No common cipher")]
	NoCommonCipher,

	/// No common MAC algorithm.
	#[error("No common MAC algorithm")]
	NoCommonMac,

	/// No common compression algorithm.
	#[error("No common compression algorithm")]
	NoCommonCompression,

	/// The host-key decision did not allow the connection.
	#[error("Host key verification failed")]
	HostKeyVerificationFailed,

	/// The server provided a wrong signature over the exchange hash.
	#[error("Wrong server signature")]
	WrongServerSig,

	/// Every configured credential was tried and rejected.
	#[error("Authentication failed (methods left by the server: {methods:?})")]
	AuthenticationFailed { methods:MethodSet },

	/// The credential list was empty when connect started.
	#[error("No authentication credential was configured")]
	NoCredentials,

	/// Transport loss after the connection was ready.
	#[error("Connection closed by the remote side")]
	ConnectionClosed,

	/// Error during key exchange.
	#[error("Key exchange failed")]
	Kex,

	/// The protocol is in an inconsistent state.
	#[error("Inconsistent state of the protocol")]
	Inconsistent,

	/// Index out of bounds.
	#[error("Index out of bounds")]
	IndexOutOfBounds,

	#[error("Channel send error")]
	SendError,

	/// A user callback failed; the cause is preserved verbatim.
	#[error(transparent)]
	Callback(Box<dyn std::error::Error + Send + Sync>),

	#[error(transparent)]
	Keys(#[from] skiff_keys::Error),

	#[error(transparent)]
	IO(#[from] std::io::Error),

	#[error(transparent)]
	Utf8(#[from] std::str::Utf8Error),

	#[cfg(feature = "flate2")]
	#[error(transparent)]
	Compress(#[from] flate2::CompressError),

	#[cfg(feature = "flate2")]
	#[error(transparent)]
	Decompress(#[from] flate2::DecompressError),

	#[error(transparent)]
	Join(#[from] tokio::task::JoinError),

	#[error(transparent)]
	Elapsed(#[from] tokio::time::error::Elapsed),
}

impl Error {
	/// Wrap a handshake failure exactly once: cancellation is never
	/// wrapped, and a failure that is already wrapped stays as it is.
	pub(crate) fn wrap_connect(self) -> Error {
		match self {
			Error::Cancelled => Error::Cancelled,
			e @ Error::ConnectFailed(_) => e,
			e => Error::ConnectFailed(Box::new(e)),
		}
	}

	/// Is this `ConnectFailed` whose cause matches `pred` (or a direct
	/// match itself)?
	pub fn connect_cause(&self) -> Option<&Error> {
		match self {
			Error::ConnectFailed(inner) => Some(inner),
			_ => None,
		}
	}
}

/// The number of bytes read/written, and the number of seconds before a
/// key re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
	pub rekey_write_limit:usize,
	pub rekey_read_limit:usize,
	pub rekey_time_limit:std::time::Duration,
}

impl Limits {
	/// Create a new `Limits`, checking that the given bounds cannot lead
	/// to nonce reuse.
	pub fn new(write_limit:usize, read_limit:usize, time_limit:std::time::Duration) -> Limits {
		assert!(write_limit <= 1 << 30 && read_limit <= 1 << 30);

		Limits {
			rekey_write_limit:write_limit,
			rekey_read_limit:read_limit,
			rekey_time_limit:time_limit,
		}
	}
}

impl Default for Limits {
	fn default() -> Self {
		// Following the recommendations of
		// https://tools.ietf.org/html/rfc4253#section-9
		Limits {
			rekey_write_limit:1 << 30, // 1 GiB
			rekey_read_limit:1 << 30,  // 1 GiB
			rekey_time_limit:std::time::Duration::from_secs(3600),
		}
	}
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug)]
pub enum Disconnect {
	HostNotAllowedToConnect = 1,
	ProtocolError = 2,
	KeyExchangeFailed = 3,
	#[doc(hidden)]
	Reserved = 4,
	MACError = 5,
	CompressionError = 6,
	ServiceNotAvailable = 7,
	ProtocolVersionNotSupported = 8,
	HostKeyNotVerifiable = 9,
	ConnectionLost = 10,
	ByApplication = 11,
	TooManyConnections = 12,
	AuthCancelledByUser = 13,
	NoMoreAuthMethodsAvailable = 14,
	IllegalUserName = 15,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cancellation_is_never_wrapped() {
		assert!(matches!(Error::Cancelled.wrap_connect(), Error::Cancelled));
	}

	#[test]
	fn wrapping_is_idempotent() {
		let once = Error::Timeout.wrap_connect();

		let twice = once.wrap_connect();

		match twice {
			Error::ConnectFailed(inner) => assert!(matches!(*inner, Error::Timeout)),
			e => panic!("unexpected: {:?}", e),
		}
	}

	#[test]
	fn callback_causes_are_preserved() {
		let original = std::io::Error::new(std::io::ErrorKind::Other, "user hook exploded");

		let wrapped = Error::Callback(Box::new(original)).wrap_connect();

		let cause = wrapped.connect_cause().expect("a cause");

		assert_eq!(cause.to_string(), "user hook exploded");
	}
}
