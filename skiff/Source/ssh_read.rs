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

//! Reading the server identification line. The banner may be preceded by
//! arbitrary non-`SSH-` lines, each at most 255 bytes, within a 64 KiB
//! total budget. Bytes read past the banner are served back to the
//! transport afterwards.

use std::{
	pin::Pin,
	task::{Context, Poll},
};

use skiff_cryptovec::CryptoVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::Error;

const MAX_BANNER_LINE:usize = 255;

const MAX_BANNER_TOTAL:usize = 64 * 1024;

struct ReadSshIdBuffer {
	buf:CryptoVec,
	/// Bytes already served back through `AsyncRead`.
	bytes_read:usize,
	total:usize,
}

/// A stream wrapper that buffers the identification exchange.
pub(crate) struct SshRead<R> {
	id:Option<ReadSshIdBuffer>,
	r:R,
}

impl<R:AsyncRead + AsyncWrite + Unpin> SshRead<R> {
	pub fn new(r:R) -> Self { SshRead { id:None, r } }

	/// Read the server identification line, skipping any preceding
	/// banner lines, and return it without its line terminator.
	pub async fn read_ssh_id(&mut self) -> Result<Vec<u8>, Error> {
		let mut buf = CryptoVec::new();

		let mut line_start = 0;

		loop {
			// Scan complete lines already buffered.
			let mut i = line_start;

			while i < buf.len() {
				if buf[i] == b'\n' {
					let mut line_end = i;

					if line_end > line_start && buf[line_end - 1] == b'\r' {
						line_end -= 1;
					}

					if line_end - line_start > MAX_BANNER_LINE {
						return Err(Error::ProtocolError);
					}

					let line = &buf[line_start..line_end];

					if line.starts_with(b"SSH-") {
						if !line.starts_with(b"SSH-2.0-") && !line.starts_with(b"SSH-1.99-") {
							return Err(Error::Version);
						}

						let id = line.to_vec();

						self.id = Some(ReadSshIdBuffer {
							bytes_read:i + 1,
							total:buf.len(),
							buf,
						});

						return Ok(id);
					}

					// A pre-banner line the server is allowed to send.
					line_start = i + 1;
				}

				i += 1;
			}

			if buf.len() - line_start > MAX_BANNER_LINE {
				return Err(Error::ProtocolError);
			}

			if buf.len() >= MAX_BANNER_TOTAL {
				return Err(Error::ProtocolError);
			}

			let mut chunk = [0u8; 256];

			let n = self.r.read(&mut chunk).await?;

			if n == 0 {
				return Err(Error::ConnectionClosed);
			}

			buf.extend(&chunk[..n]);
		}
	}
}

impl<R:AsyncRead + Unpin> AsyncRead for SshRead<R> {
	fn poll_read(
		self:Pin<&mut Self>,
		cx:&mut Context,
		buf:&mut ReadBuf,
	) -> Poll<Result<(), std::io::Error>> {
		let this = self.get_mut();

		if let Some(ref mut id) = this.id {
			if id.bytes_read < id.total {
				let n = std::cmp::min(buf.remaining(), id.total - id.bytes_read);

				buf.put_slice(&id.buf[id.bytes_read..id.bytes_read + n]);

				id.bytes_read += n;

				if id.bytes_read >= id.total {
					this.id = None
				}

				return Poll::Ready(Ok(()));
			}

			this.id = None
		}

		Pin::new(&mut this.r).poll_read(cx, buf)
	}
}

impl<R:AsyncWrite + Unpin> AsyncWrite for SshRead<R> {
	fn poll_write(
		self:Pin<&mut Self>,
		cx:&mut Context,
		buf:&[u8],
	) -> Poll<Result<usize, std::io::Error>> {
		Pin::new(&mut self.get_mut().r).poll_write(cx, buf)
	}

	fn poll_flush(self:Pin<&mut Self>, cx:&mut Context) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.get_mut().r).poll_flush(cx)
	}

	fn poll_shutdown(self:Pin<&mut Self>, cx:&mut Context) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.get_mut().r).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::AsyncWriteExt;

	use super::*;

	#[tokio::test]
	async fn plain_banner() {
		let (client, mut server) = tokio::io::duplex(1024);

		server.write_all(b"SSH-2.0-OpenSSH_9.3\r\nrest").await.unwrap();

		let mut ssh = SshRead::new(client);

		let id = ssh.read_ssh_id().await.unwrap();

		assert_eq!(id, b"SSH-2.0-OpenSSH_9.3");

		// The over-read bytes come back in order.
		let mut rest = [0u8; 4];

		ssh.read_exact(&mut rest).await.unwrap();

		assert_eq!(&rest, b"rest");
	}

	#[tokio::test]
	async fn banner_after_preamble_lines() {
		let (client, mut server) = tokio::io::duplex(1024);

		server
			.write_all(b"welcome to the machine\r\nplease behave\nSSH-2.0-sshd\r\n")
			.await
			.unwrap();

		let mut ssh = SshRead::new(client);

		assert_eq!(ssh.read_ssh_id().await.unwrap(), b"SSH-2.0-sshd");
	}

	#[tokio::test]
	async fn old_protocol_is_rejected() {
		let (client, mut server) = tokio::io::duplex(1024);

		server.write_all(b"SSH-1.5-antique\r\n").await.unwrap();

		let mut ssh = SshRead::new(client);

		assert!(matches!(ssh.read_ssh_id().await, Err(Error::Version)));
	}

	#[tokio::test]
	async fn overlong_line_is_rejected() {
		let (client, mut server) = tokio::io::duplex(70 * 1024);

		let long = vec![b'x'; 300];

		server.write_all(&long).await.unwrap();

		server.write_all(b"\r\nSSH-2.0-x\r\n").await.unwrap();

		let mut ssh = SshRead::new(client);

		assert!(matches!(ssh.read_ssh_id().await, Err(Error::ProtocolError)));
	}

	#[tokio::test]
	async fn eof_before_banner() {
		let (client, server) = tokio::io::duplex(16);

		drop(server);

		let mut ssh = SshRead::new(client);

		assert!(matches!(ssh.read_ssh_id().await, Err(Error::ConnectionClosed)));
	}
}
