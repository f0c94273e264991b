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

//! The client: connection establishment (TCP, banner, key exchange,
//! host-key verification, authentication) and the transport loop that
//! carries raw packets for the channel layer afterwards.

use std::{collections::VecDeque, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use skiff_cryptovec::CryptoVec;
use skiff_keys::{
	KnownHostsCheck, check_known_hosts,
	encoding::{Encoding, Reader},
	key, learn_known_hosts,
};
use tokio::{
	io::{AsyncRead, AsyncWrite, AsyncWriteExt},
	net::TcpStream,
	sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
	Disconnect, Error, Limits,
	auth::{Credential, MethodSet, Signer},
	cipher::{self, CipherPair},
	compression::{Compress, Compression, Decompress},
	kex::KexAlgorithm,
	msg,
	negotiation::{self, Preferred},
	session::{Kex, KexDhDone, KexInit, NewKeys},
	session,
	ssh_read::SshRead,
	sshbuffer::{POOL, SSHBuffer},
};

/// Connection settings. Immutable once [`connect`] starts.
#[derive(Debug)]
pub struct Config {
	/// Our identification string, sent as the banner.
	pub client_id:String,
	/// Absolute deadline for the whole of [`connect`], from call start.
	pub connect_timeout:Option<Duration>,
	/// The user known-hosts file. `None` means no file: nothing is ever
	/// looked up or appended.
	pub known_hosts_path:Option<PathBuf>,
	/// Also consult `/etc/ssh/ssh_known_hosts`.
	pub check_global_known_hosts:bool,
	/// Credentials, tried in order.
	pub credentials:Vec<Credential>,
	/// Algorithm preference lists.
	pub preferred:Preferred,
	/// Rekey thresholds.
	pub limits:Limits,
	/// Refuse inbound packets longer than this (RFC 4253 §6.1).
	pub maximum_packet_length:u32,
}

impl Default for Config {
	fn default() -> Config {
		Config {
			client_id:format!("SSH-2.0-{}_{}", "skiff", env!("CARGO_PKG_VERSION")),
			connect_timeout:None,
			known_hosts_path:None,
			check_global_known_hosts:false,
			credentials:Vec::new(),
			preferred:Preferred::DEFAULT,
			limits:Limits::default(),
			maximum_packet_length:35_000,
		}
	}
}

/// `[user@]host[:port]`, port 22 and the process user by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
	pub user:String,
	pub host:String,
	pub port:u16,
}

fn default_user() -> String {
	std::env::var("USER")
		.or_else(|_| std::env::var("USERNAME"))
		.unwrap_or_else(|_| String::from("root"))
}

impl Destination {
	pub fn parse(s:&str) -> Result<Destination, Error> {
		let (user, rest) = match s.rfind('@') {
			Some(i) => (s[..i].to_string(), &s[i + 1..]),
			None => (default_user(), s),
		};

		if user.is_empty() || rest.is_empty() {
			return Err(Error::ProtocolError);
		}

		let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
			// Bracketed form, [host]:port or [host].
			match rest.split_once(']') {
				Some((host, "")) => (host.to_string(), 22),
				Some((host, port)) => {
					let port = port
						.strip_prefix(':')
						.and_then(|p| p.parse().ok())
						.ok_or(Error::ProtocolError)?;

					(host.to_string(), port)
				},
				None => return Err(Error::ProtocolError),
			}
		} else if rest.matches(':').count() > 1 {
			// A bare IPv6 address.
			(rest.to_string(), 22)
		} else {
			match rest.split_once(':') {
				Some((host, port)) => {
					(host.to_string(), port.parse().map_err(|_| Error::ProtocolError)?)
				},
				None => (rest.to_string(), 22),
			}
		};

		if host.is_empty() {
			return Err(Error::ProtocolError);
		}

		Ok(Destination { user, host, port })
	}
}

/// What the caller and its callbacks can observe about a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub host:String,
	pub port:u16,
	/// The server's identification string.
	pub server_id:String,
	/// The exchange hash of the first key exchange.
	pub session_id:Vec<u8>,
	pub server_key:key::PublicKey,
	/// SHA-256 fingerprint of the server key, base64 without padding.
	pub sha256_fingerprint:String,
	/// MD5 fingerprint of the server key, colon-separated hex.
	pub md5_fingerprint:String,
	pub kex:String,
	pub host_key:String,
	pub cipher_client_to_server:String,
	pub cipher_server_to_client:String,
	pub mac_client_to_server:String,
	pub mac_server_to_client:String,
}

/// The decision a host-key callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
	/// Accept the key for this connection.
	Trusted,
	/// Accept the key and append it to the user known-hosts file.
	AddKnownHost,
	Revoked,
	Changed,
	Unknown,
}

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone)]
pub struct Prompt {
	pub prompt:String,
	pub echo:bool,
}

/// Client callbacks. All methods are suspension points; the transport
/// holds no locks across them, and cancellation arrives as a parameter
/// rather than ambient state.
#[async_trait]
pub trait Handler: Send + Sized {
	/// Decide whether to trust the server key. The default accepts what
	/// the known-hosts store already trusts and rejects everything else.
	async fn check_server_key(
		&mut self,
		check:KnownHostsCheck,
		info:&ConnectionInfo,
		cancel:&CancellationToken,
	) -> Result<HostKeyDecision, Error> {
		let _ = (info, cancel);

		Ok(match check {
			KnownHostsCheck::Trusted => HostKeyDecision::Trusted,
			KnownHostsCheck::Changed { .. } => HostKeyDecision::Changed,
			KnownHostsCheck::Revoked => HostKeyDecision::Revoked,
			KnownHostsCheck::Unknown => HostKeyDecision::Unknown,
		})
	}

	/// A `USERAUTH_BANNER` from the server.
	async fn auth_banner(&mut self, banner:&str) -> Result<(), Error> {
		let _ = banner;

		Ok(())
	}

	/// One round of keyboard-interactive prompts; return one response
	/// per prompt, in order.
	async fn auth_interactive(
		&mut self,
		name:&str,
		instruction:&str,
		prompts:&[Prompt],
	) -> Result<Vec<String>, Error> {
		let _ = (name, instruction, prompts);

		Ok(Vec::new())
	}

	/// A post-handshake packet for the channel layer. `payload` starts
	/// with the message id.
	async fn data(&mut self, payload:&[u8]) -> Result<(), Error> {
		let _ = payload;

		Ok(())
	}
}

/// Send half of an established connection. Packets are strictly FIFO.
pub struct Handle {
	sender:mpsc::Sender<CryptoVec>,
	info:ConnectionInfo,
}

impl Handle {
	/// Queue one packet (payload starting with its message id).
	pub async fn send_packet(&self, payload:&[u8]) -> Result<(), Error> {
		self.sender
			.send(CryptoVec::from_slice(payload))
			.await
			.map_err(|_| Error::ConnectionClosed)
	}

	pub fn connection_info(&self) -> &ConnectionInfo { &self.info }

	/// Send `DISCONNECT` and let the transport wind down.
	pub async fn disconnect(&self, reason:Disconnect, description:&str) -> Result<(), Error> {
		let mut payload = CryptoVec::new();

		payload.push(msg::DISCONNECT);

		payload.push_u32_be(reason as u32);

		payload.extend_ssh_string(description.as_bytes());

		payload.extend_ssh_string(b"");

		self.sender.send(payload).await.map_err(|_| Error::ConnectionClosed)
	}

	pub fn is_closed(&self) -> bool { self.sender.is_closed() }
}

/// Open a TCP connection, do the SSH handshake, verify the host key,
/// authenticate, and return a [`Handle`] once the transport is ready.
///
/// Cancelling `cancel` at any point closes the socket and fails with
/// [`Error::Cancelled`], unwrapped. Every other failure is wrapped
/// exactly once as [`Error::ConnectFailed`].
pub async fn connect<H:Handler + 'static>(
	config:Arc<Config>,
	destination:Destination,
	handler:H,
	cancel:CancellationToken,
) -> Result<Handle, Error> {
	if config.credentials.is_empty() {
		return Err(Error::NoCredentials.wrap_connect());
	}

	if cancel.is_cancelled() {
		return Err(Error::Cancelled);
	}

	let timeout = config.connect_timeout;

	let inner = connect_inner(config, destination, handler, cancel.clone());

	let result = tokio::select! {
		biased;

		_ = cancel.cancelled() => Err(Error::Cancelled),

		r = async {
			match timeout {
				Some(timeout) => {
					match tokio::time::timeout(timeout, inner).await {
						Ok(r) => r,
						Err(_) => Err(Error::Timeout),
					}
				},
				None => inner.await,
			}
		} => r,
	};

	result.map_err(Error::wrap_connect)
}

async fn connect_inner<H:Handler + 'static>(
	config:Arc<Config>,
	destination:Destination,
	handler:H,
	cancel:CancellationToken,
) -> Result<Handle, Error> {
	let socket = TcpStream::connect((destination.host.as_str(), destination.port)).await?;

	let mut stream = SshRead::new(socket);

	stream.write_all(format!("{}\r\n", config.client_id).as_bytes()).await?;

	let server_id = stream.read_ssh_id().await?;

	info!("server identification: {:?}", String::from_utf8_lossy(&server_id));

	let mut session = Session::new(config, destination, handler, cancel, server_id);

	session.begin_kex()?;

	session.run_handshake(&mut stream).await?;

	let info = session.info.clone().ok_or(Error::Inconsistent)?;

	let (sender, outbound) = mpsc::channel(10);

	tokio::spawn(async move {
		if let Err(e) = session.run(stream, outbound).await {
			debug!("transport closed: {:?}", e);
		}
	});

	Ok(Handle { sender, info })
}

/// How many packets one direction may carry before a rekey is forced.
const REKEY_MAX_PACKETS:u64 = 1 << 32;

enum CurrentAuth {
	ProbeNone,
	Password,
	PublicKeyProbe(Arc<key::KeyPair>),
	PublicKeySigned,
	AgentProbe(Arc<dyn Signer>),
	KeyboardInteractive,
}

struct AuthState {
	credentials:VecDeque<Credential>,
	current:Option<CurrentAuth>,
	/// Methods the server last said could continue.
	methods:MethodSet,
	success:bool,
}

struct Session<H:Handler> {
	config:Arc<Config>,
	destination:Destination,
	handler:H,
	cancel:CancellationToken,
	read_buffer:SSHBuffer,
	write_buffer:SSHBuffer,
	cipher:CipherPair,
	kex:Option<Kex>,
	session_id:Option<CryptoVec>,
	server_id:Vec<u8>,
	info:Option<ConnectionInfo>,
	compress:Compress,
	decompress:Decompress,
	compress_buffer:CryptoVec,
	decompress_buffer:CryptoVec,
	/// Compression negotiated for each direction, kept for delayed
	/// (post-auth) activation.
	negotiated_compression:(Compression, Compression),
	ignore_next_kex_packet:bool,
	last_rekey:tokio::time::Instant,
	auth:AuthState,
}

impl<H:Handler> Session<H> {
	fn new(
		config:Arc<Config>,
		destination:Destination,
		handler:H,
		cancel:CancellationToken,
		server_id:Vec<u8>,
	) -> Self {
		let credentials = config.credentials.iter().cloned().collect();

		Session {
			config,
			destination,
			handler,
			cancel,
			read_buffer:SSHBuffer::new(),
			write_buffer:SSHBuffer::new(),
			cipher:CipherPair::clear(),
			kex:None,
			session_id:None,
			server_id,
			info:None,
			compress:Compress::None,
			decompress:Decompress::None,
			compress_buffer:CryptoVec::new(),
			decompress_buffer:CryptoVec::new(),
			negotiated_compression:(Compression::None, Compression::None),
			ignore_next_kex_packet:false,
			last_rekey:tokio::time::Instant::now(),
			auth:AuthState {
				credentials,
				current:None,
				methods:MethodSet::empty(),
				success:false,
			},
		}
	}

	/// Compress and seal one payload into the write buffer.
	fn write_packet(&mut self, payload:&[u8]) -> Result<(), Error> {
		let payload = self.compress.compress(payload, &mut self.compress_buffer)?;

		self.cipher.local_to_remote.write(payload, &mut self.write_buffer);

		Ok(())
	}

	async fn flush<R:AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		stream:&mut SshRead<R>,
	) -> Result<(), Error> {
		if !self.write_buffer.buffer.is_empty() {
			stream.write_all(&self.write_buffer.buffer).await?;

			self.write_buffer.buffer.clear();
		}

		Ok(())
	}

	/// Send our `KEXINIT` and arm the kex state machine.
	fn begin_kex(&mut self) -> Result<(), Error> {
		let mut exchange =
			session::Exchange::new(self.config.client_id.as_bytes(), &self.server_id);

		negotiation::write_kexinit(&self.config.preferred, &mut exchange.client_kex_init);

		let payload = exchange.client_kex_init.clone();

		self.write_packet(&payload)?;

		self.kex = Some(Kex::Init(KexInit { exchange, session_id:self.session_id.clone() }));

		Ok(())
	}

	fn rekey_due(&self) -> bool {
		self.write_buffer.bytes >= self.config.limits.rekey_write_limit
			|| self.read_buffer.bytes >= self.config.limits.rekey_read_limit
			|| self.write_buffer.packets >= REKEY_MAX_PACKETS
			|| self.read_buffer.packets >= REKEY_MAX_PACKETS
			|| self.last_rekey.elapsed() >= self.config.limits.rekey_time_limit
	}

	/// Decompress the framed payload into an owned, pooled buffer. The
	/// transport never aliases it afterwards.
	fn take_payload(&mut self, end:usize) -> Result<CryptoVec, Error> {
		let mut packet = POOL.take();

		{
			#[allow(clippy::indexing_slicing)] // framed by cipher::read
			let payload = &self.read_buffer.buffer[5..end];

			let payload = self.decompress.decompress(payload, &mut self.decompress_buffer)?;

			packet.extend(payload);
		}

		Ok(packet)
	}

	/// Drive the handshake (kex, verification, auth) to completion.
	async fn run_handshake<R:AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		stream:&mut SshRead<R>,
	) -> Result<(), Error> {
		let cancel = self.cancel.clone();

		loop {
			self.flush(stream).await?;

			if self.auth.success {
				return Ok(());
			}

			let end = tokio::select! {
				biased;

				_ = cancel.cancelled() => return Err(Error::Cancelled),

				end = cipher::read(
					stream,
					&mut self.read_buffer,
					self.cipher.remote_to_local.as_mut(),
					self.config.maximum_packet_length,
				) => end?,
			};

			let packet = self.take_payload(end)?;

			let result = self.dispatch(&packet).await;

			POOL.recycle(packet);

			result?;
		}
	}

	/// The post-handshake transport loop: serve the outbound queue,
	/// dispatch inbound packets, initiate rekeys.
	async fn run<R:AsyncRead + AsyncWrite + Unpin + Send>(
		mut self,
		mut stream:SshRead<R>,
		mut outbound:mpsc::Receiver<CryptoVec>,
	) -> Result<(), Error> {
		let cancel = self.cancel.clone();

		loop {
			self.flush(&mut stream).await?;

			if self.kex.is_none() && self.rekey_due() {
				debug!("rekey threshold reached, sending KEXINIT");

				self.begin_kex()?;

				continue;
			}

			enum Event {
				Packet(usize),
				Outbound(Option<CryptoVec>),
				RekeyTimer,
			}

			let deadline = self.last_rekey + self.config.limits.rekey_time_limit;

			let event = tokio::select! {
				biased;

				_ = cancel.cancelled() => return Err(Error::Cancelled),

				end = cipher::read(
					&mut stream,
					&mut self.read_buffer,
					self.cipher.remote_to_local.as_mut(),
					self.config.maximum_packet_length,
				) => Event::Packet(end?),

				out = outbound.recv() => Event::Outbound(out),

				_ = tokio::time::sleep_until(deadline) => Event::RekeyTimer,
			};

			match event {
				Event::Packet(end) => {
					let packet = self.take_payload(end)?;

					let result = self.dispatch(&packet).await;

					POOL.recycle(packet);

					result?;
				},
				Event::Outbound(Some(payload)) => self.write_packet(&payload)?,
				Event::Outbound(None) => {
					// Every handle is gone: say goodbye and stop.
					let mut payload = CryptoVec::new();

					payload.push(msg::DISCONNECT);

					payload.push_u32_be(Disconnect::ByApplication as u32);

					payload.extend_ssh_string(b"");

					payload.extend_ssh_string(b"");

					self.write_packet(&payload)?;

					self.flush(&mut stream).await?;

					return Ok(());
				},
				Event::RekeyTimer => {},
			}
		}
	}

	async fn dispatch(&mut self, buf:&[u8]) -> Result<(), Error> {
		let id = *buf.first().ok_or(Error::MalformedPacket)?;

		// A wrongly guessed first kex packet from the server is dropped
		// (RFC 4253 §7).
		if self.ignore_next_kex_packet && (30..50).contains(&id) {
			self.ignore_next_kex_packet = false;

			return Ok(());
		}

		match id {
			msg::DISCONNECT => {
				let mut r = buf.reader(1);

				let code = r.read_u32().unwrap_or(0);

				let message = r.read_string().unwrap_or(b"");

				warn!("server disconnected ({}): {:?}", code, String::from_utf8_lossy(message));

				Err(Error::ConnectionClosed)
			},
			msg::IGNORE | msg::DEBUG | msg::UNIMPLEMENTED => Ok(()),
			msg::KEXINIT => self.server_kexinit(buf),
			msg::NEWKEYS => self.server_newkeys(),
			msg::EXT_INFO => self.server_ext_info(buf),
			msg::KEX_ECDH_REPLY if matches!(self.kex, Some(Kex::DhDone(_))) => {
				self.server_kexdh_reply(buf).await
			},
			msg::SERVICE_ACCEPT
			| msg::USERAUTH_SUCCESS
			| msg::USERAUTH_FAILURE
			| msg::USERAUTH_BANNER
			| msg::USERAUTH_PK_OK => self.auth_dispatch(buf).await,
			msg::GLOBAL_REQUEST => {
				let mut r = buf.reader(1);

				let name = r.read_string()?;

				let want_reply = r.read_bool()?;

				debug!("global request {:?}", String::from_utf8_lossy(name));

				if want_reply {
					self.write_packet(&[msg::REQUEST_FAILURE])?;
				}

				Ok(())
			},
			id if id >= 80 => {
				if self.auth.success {
					self.handler.data(buf).await
				} else {
					Err(Error::ProtocolError)
				}
			},
			id => {
				debug!("unimplemented message id {:?}", id);

				let mut reply = CryptoVec::new();

				reply.push(msg::UNIMPLEMENTED);

				reply.push_u32_be(self.read_buffer.seqn.0.wrapping_sub(1));

				self.write_packet(&reply)?;

				Ok(())
			},
		}
	}

	fn server_kexinit(&mut self, buf:&[u8]) -> Result<(), Error> {
		// A server-initiated rekey starts with its KEXINIT; answer with
		// ours before negotiating.
		if self.kex.is_none() {
			self.begin_kex()?;
		}

		let mut kexinit = match self.kex.take() {
			Some(Kex::Init(kexinit)) => kexinit,
			_ => return Err(Error::Inconsistent),
		};

		kexinit.exchange.server_kex_init.clear();

		kexinit.exchange.server_kex_init.extend(buf);

		let names = negotiation::read_kex(buf, &self.config.preferred)?;

		self.ignore_next_kex_packet = names.ignore_guessed;

		let mut kex = KexAlgorithm::new(names.kex)?;

		let mut payload = POOL.take();

		kex.client_dh(&mut kexinit.exchange.client_ephemeral, &mut payload)?;

		let result = self.write_packet(&payload);

		POOL.recycle(payload);

		result?;

		self.kex = Some(Kex::DhDone(KexDhDone {
			exchange:kexinit.exchange,
			kex,
			names,
			session_id:kexinit.session_id,
		}));

		Ok(())
	}

	async fn server_kexdh_reply(&mut self, buf:&[u8]) -> Result<(), Error> {
		let mut dhdone = match self.kex.take() {
			Some(Kex::DhDone(dhdone)) => dhdone,
			_ => return Err(Error::Inconsistent),
		};

		let mut r = buf.reader(1);

		let host_key_blob = r.read_string()?;

		let server_ephemeral = r.read_string()?;

		let signature_blob = r.read_string()?;

		dhdone.exchange.server_host_key.clear();

		dhdone.exchange.server_host_key.extend(host_key_blob);

		dhdone.exchange.server_ephemeral.clear();

		dhdone.exchange.server_ephemeral.extend(server_ephemeral);

		let mut server_key =
			key::PublicKey::parse(dhdone.names.key.as_ref().as_bytes(), host_key_blob)?;

		dhdone.kex.compute_shared_secret(server_ephemeral)?;

		let exchange_hash = dhdone.kex.compute_exchange_hash(&dhdone.exchange)?;

		{
			let mut sig = signature_blob.reader(0);

			let sig_type = sig.read_string()?;

			let sig_bytes = sig.read_string()?;

			server_key.set_algorithm(sig_type);

			if !server_key.verify_detached(&exchange_hash, sig_bytes) {
				return Err(Error::WrongServerSig);
			}
		}

		debug!("server signature verified");

		// Trust is decided on the first exchange only; rekeys are bound
		// to the session id.
		if dhdone.session_id.is_none() {
			self.verify_host(&server_key, &dhdone, &exchange_hash).await?;
		}

		let session_id = match dhdone.session_id {
			Some(session_id) => session_id,
			None => exchange_hash.clone(),
		};

		let pair = dhdone.kex.compute_keys(
			&session_id,
			&exchange_hash,
			dhdone.names.client_cipher,
			dhdone.names.server_cipher,
			dhdone.names.client_mac,
			dhdone.names.server_mac,
			false,
		)?;

		self.write_packet(&[msg::NEWKEYS])?;

		// Everything after our NEWKEYS goes out under the new keys.
		self.cipher.local_to_remote = pair.local_to_remote;

		self.negotiated_compression =
			(dhdone.names.client_compression, dhdone.names.server_compression);

		if !dhdone.names.client_compression.delayed() || self.auth.success {
			dhdone.names.client_compression.init_compress(&mut self.compress);
		}

		self.kex = Some(Kex::NewKeys(NewKeys {
			names:dhdone.names,
			session_id,
			cipher:Some(pair.remote_to_local),
		}));

		Ok(())
	}

	fn server_newkeys(&mut self) -> Result<(), Error> {
		let mut newkeys = match self.kex.take() {
			Some(Kex::NewKeys(newkeys)) => newkeys,
			_ => return Err(Error::Inconsistent),
		};

		let opening = newkeys.cipher.take().ok_or(Error::Inconsistent)?;

		// Everything after the server's NEWKEYS arrives under the new
		// keys. The sequence counters are untouched.
		self.cipher.remote_to_local = opening;

		if !newkeys.names.server_compression.delayed() || self.auth.success {
			newkeys.names.server_compression.init_decompress(&mut self.decompress);
		}

		self.read_buffer.bytes = 0;

		self.write_buffer.bytes = 0;

		self.read_buffer.packets = 0;

		self.write_buffer.packets = 0;

		self.last_rekey = tokio::time::Instant::now();

		if self.session_id.is_none() {
			self.session_id = Some(newkeys.session_id.clone());

			// First exchange complete: ask for the auth service.
			let mut payload = CryptoVec::new();

			payload.push(msg::SERVICE_REQUEST);

			payload.extend_ssh_string(b"ssh-userauth");

			self.write_packet(&payload)?;
		}

		Ok(())
	}

	fn server_ext_info(&mut self, buf:&[u8]) -> Result<(), Error> {
		let mut r = buf.reader(1);

		let count = r.read_u32()?;

		for _ in 0..count {
			let name = r.read_string()?;

			let value = r.read_string()?;

			if name == b"server-sig-algs" {
				debug!("server accepts signatures: {:?}", String::from_utf8_lossy(value));
			}
		}

		Ok(())
	}

	async fn verify_host(
		&mut self,
		server_key:&key::PublicKey,
		dhdone:&KexDhDone,
		exchange_hash:&CryptoVec,
	) -> Result<(), Error> {
		let check = check_known_hosts(
			&self.destination.host,
			self.destination.port,
			server_key,
			self.config.known_hosts_path.as_deref(),
			self.config.check_global_known_hosts,
		)?;

		debug!("known hosts: {:?}", check);

		let info = ConnectionInfo {
			host:self.destination.host.clone(),
			port:self.destination.port,
			server_id:String::from_utf8_lossy(&self.server_id).into_owned(),
			session_id:exchange_hash[..].to_vec(),
			server_key:server_key.clone(),
			sha256_fingerprint:server_key.fingerprint(),
			md5_fingerprint:server_key.fingerprint_md5(),
			kex:dhdone.names.kex.as_ref().to_string(),
			host_key:dhdone.names.key.as_ref().to_string(),
			cipher_client_to_server:dhdone.names.client_cipher.as_ref().to_string(),
			cipher_server_to_client:dhdone.names.server_cipher.as_ref().to_string(),
			mac_client_to_server:dhdone.names.client_mac.as_ref().to_string(),
			mac_server_to_client:dhdone.names.server_mac.as_ref().to_string(),
		};

		// A key the store already trusts is accepted without consulting
		// the callback.
		if let KnownHostsCheck::Trusted = check {
			self.info = Some(info);

			return Ok(());
		}

		let decision = self.handler.check_server_key(check, &info, &self.cancel).await;

		// Cancellation from inside the callback stays cancellation.
		if self.cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let decision = decision?;

		self.info = Some(info);

		match decision {
			HostKeyDecision::Trusted => Ok(()),
			HostKeyDecision::AddKnownHost => {
				if let Some(path) = &self.config.known_hosts_path {
					learn_known_hosts(
						&self.destination.host,
						self.destination.port,
						server_key,
						path,
					)?;
				}

				Ok(())
			},
			_ => Err(Error::HostKeyVerificationFailed),
		}
	}

	fn userauth_header(&self, method:&str, payload:&mut CryptoVec) {
		payload.push(msg::USERAUTH_REQUEST);

		payload.extend_ssh_string(self.destination.user.as_bytes());

		payload.extend_ssh_string(b"ssh-connection");

		payload.extend_ssh_string(method.as_bytes());
	}

	fn publickey_probe(&mut self, public:&key::PublicKey) -> Result<(), Error> {
		let mut payload = POOL.take();

		self.userauth_header("publickey", &mut payload);

		payload.push(0);

		payload.extend_ssh_string(public.name().as_bytes());

		payload.extend_ssh_string(&public.public_key_bytes());

		let result = self.write_packet(&payload);

		POOL.recycle(payload);

		result
	}

	/// The signed form covers `string session_id ‖ request`.
	fn signed_publickey_request(&self, public:&key::PublicKey) -> Result<(CryptoVec, CryptoVec), Error> {
		let session_id = self.session_id.as_ref().ok_or(Error::Inconsistent)?;

		let mut request = POOL.take();

		self.userauth_header("publickey", &mut request);

		request.push(1);

		request.extend_ssh_string(public.name().as_bytes());

		request.extend_ssh_string(&public.public_key_bytes());

		let mut to_sign = POOL.take();

		to_sign.extend_ssh_string(session_id);

		to_sign.extend(&request);

		Ok((request, to_sign))
	}

	/// Try the next configured credential, skipping methods the server
	/// has ruled out.
	async fn next_credential(&mut self) -> Result<(), Error> {
		loop {
			let credential = match self.auth.credentials.pop_front() {
				Some(credential) => credential,
				None => {
					return Err(Error::AuthenticationFailed { methods:self.auth.methods });
				},
			};

			let allowed = |m:MethodSet, set:MethodSet| set.is_empty() || set.contains(m);

			match credential {
				Credential::Password(password) => {
					if !allowed(MethodSet::PASSWORD, self.auth.methods) {
						debug!("server does not accept password auth, skipping");

						continue;
					}

					let mut payload = POOL.take();

					self.userauth_header("password", &mut payload);

					payload.push(0);

					payload.extend_ssh_string(password.as_bytes());

					let result = self.write_packet(&payload);

					POOL.recycle(payload);

					result?;

					self.auth.current = Some(CurrentAuth::Password);

					return Ok(());
				},
				Credential::Key(keypair) => {
					if !allowed(MethodSet::PUBLICKEY, self.auth.methods) {
						debug!("server does not accept publickey auth, skipping");

						continue;
					}

					self.publickey_probe(&keypair.clone_public_key())?;

					self.auth.current = Some(CurrentAuth::PublicKeyProbe(keypair));

					return Ok(());
				},
				Credential::KeyFile { path, password } => {
					match skiff_keys::load_secret_key(&path, password.as_deref()) {
						Ok(keypair) => {
							self.auth.credentials.push_front(Credential::Key(Arc::new(keypair)))
						},
						Err(e) => {
							warn!("could not load key file {:?}: {}", path, e);
						},
					}

					continue;
				},
				Credential::Agent(signer) => {
					if !allowed(MethodSet::PUBLICKEY, self.auth.methods) {
						continue;
					}

					self.publickey_probe(&signer.public_key())?;

					self.auth.current = Some(CurrentAuth::AgentProbe(signer));

					return Ok(());
				},
				Credential::KeyboardInteractive => {
					if !allowed(MethodSet::KEYBOARD_INTERACTIVE, self.auth.methods) {
						continue;
					}

					let mut payload = POOL.take();

					self.userauth_header("keyboard-interactive", &mut payload);

					// Language and submethods.
					payload.extend_ssh_string(b"");

					payload.extend_ssh_string(b"");

					let result = self.write_packet(&payload);

					POOL.recycle(payload);

					result?;

					self.auth.current = Some(CurrentAuth::KeyboardInteractive);

					return Ok(());
				},
			}
		}
	}

	async fn auth_dispatch(&mut self, buf:&[u8]) -> Result<(), Error> {
		#[allow(clippy::indexing_slicing)] // dispatch checked buf[0]
		match buf[0] {
			msg::SERVICE_ACCEPT => {
				let mut r = buf.reader(1);

				if r.read_string()? != b"ssh-userauth" {
					return Err(Error::ProtocolError);
				}

				// Probe with `none` first to learn the allowed methods.
				let mut payload = POOL.take();

				self.userauth_header("none", &mut payload);

				let result = self.write_packet(&payload);

				POOL.recycle(payload);

				result?;

				self.auth.current = Some(CurrentAuth::ProbeNone);

				Ok(())
			},
			msg::USERAUTH_SUCCESS => {
				info!("authentication succeeded");

				self.auth.success = true;

				self.auth.current = None;

				// zlib@openssh.com engages only now.
				let (client, server) = self.negotiated_compression;

				if client.delayed() {
					client.init_compress(&mut self.compress);
				}

				if server.delayed() {
					server.init_decompress(&mut self.decompress);
				}

				Ok(())
			},
			msg::USERAUTH_BANNER => {
				let mut r = buf.reader(1);

				let banner = r.read_string()?;

				let banner = std::str::from_utf8(banner)?;

				self.handler.auth_banner(banner).await
			},
			msg::USERAUTH_FAILURE => {
				let mut r = buf.reader(1);

				let methods = MethodSet::from_server_list(r.read_string()?);

				let partial = r.read_bool()?;

				debug!("auth failure, methods that can continue: {:?} (partial: {})", methods, partial);

				self.auth.methods = methods;

				self.auth.current = None;

				self.next_credential().await
			},
			// PK_OK, PASSWD_CHANGEREQ and INFO_REQUEST share 60; the
			// method we are currently running disambiguates.
			msg::USERAUTH_PK_OK => {
				match self.auth.current.take() {
					Some(CurrentAuth::PublicKeyProbe(keypair)) => {
						debug!("server accepted the key, sending the signed request");

						let public = keypair.clone_public_key();

						let (mut request, to_sign) = self.signed_publickey_request(&public)?;

						keypair.add_signature(&mut request, &to_sign)?;

						POOL.recycle(to_sign);

						let result = self.write_packet(&request);

						POOL.recycle(request);

						result?;

						self.auth.current = Some(CurrentAuth::PublicKeySigned);

						Ok(())
					},
					Some(CurrentAuth::AgentProbe(signer)) => {
						let public = signer.public_key();

						let (mut request, to_sign) = self.signed_publickey_request(&public)?;

						let signature = signer
							.auth_publickey_sign(&to_sign)
							.await
							.map_err(|e| Error::Callback(Box::new(e)))?;

						POOL.recycle(to_sign);

						request.extend_ssh_string(&signature);

						let result = self.write_packet(&request);

						POOL.recycle(request);

						result?;

						self.auth.current = Some(CurrentAuth::PublicKeySigned);

						Ok(())
					},
					Some(CurrentAuth::Password) => {
						// USERAUTH_PASSWD_CHANGEREQ: unsupported, the
						// credential fails.
						warn!("server requests a password change, not supported");

						self.auth.current = None;

						self.next_credential().await
					},
					Some(CurrentAuth::KeyboardInteractive) => {
						self.auth.current = Some(CurrentAuth::KeyboardInteractive);

						self.info_request(buf).await
					},
					_ => Err(Error::ProtocolError),
				}
			},
			_ => Err(Error::ProtocolError),
		}
	}

	async fn info_request(&mut self, buf:&[u8]) -> Result<(), Error> {
		let mut r = buf.reader(1);

		let name = std::str::from_utf8(r.read_string()?)?.to_string();

		let instruction = std::str::from_utf8(r.read_string()?)?.to_string();

		// Deprecated language tag.
		r.read_string()?;

		let count = r.read_u32()?;

		// The count is server-controlled; let the bounded reads below
		// grow the vector instead of trusting it.
		let mut prompts = Vec::new();

		for _ in 0..count {
			let prompt = std::str::from_utf8(r.read_string()?)?.to_string();

			let echo = r.read_bool()?;

			prompts.push(Prompt { prompt, echo });
		}

		let responses = self.handler.auth_interactive(&name, &instruction, &prompts).await?;

		let mut payload = POOL.take();

		payload.push(msg::USERAUTH_INFO_RESPONSE);

		payload.push_u32_be(responses.len() as u32);

		for response in &responses {
			payload.extend_ssh_string(response.as_bytes());
		}

		let result = self.write_packet(&payload);

		POOL.recycle(payload);

		result
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::AsyncReadExt;

	use super::*;
	use crate::{cipher::SealingKey, kex, mac};

	#[test]
	fn destination_forms() {
		let d = Destination::parse("git@example.com:2222").unwrap();

		assert_eq!(
			d,
			Destination { user:"git".into(), host:"example.com".into(), port:2222 }
		);

		let d = Destination::parse("root@[::1]:2022").unwrap();

		assert_eq!(d.host, "::1");

		assert_eq!(d.port, 2022);

		let d = Destination::parse("root@fe80::1").unwrap();

		assert_eq!(d.host, "fe80::1");

		assert_eq!(d.port, 22);

		let d = Destination::parse("root@example.com").unwrap();

		assert_eq!(d.port, 22);

		assert!(Destination::parse("@example.com").is_err());

		assert!(Destination::parse("root@").is_err());

		assert!(Destination::parse("root@host:not-a-port").is_err());
	}

	#[test]
	fn destination_defaults_the_user() {
		let d = Destination::parse("example.com").unwrap();

		assert!(!d.user.is_empty());
	}

	struct TrustingHandler;

	#[async_trait]
	impl Handler for TrustingHandler {
		async fn check_server_key(
			&mut self,
			_check:KnownHostsCheck,
			_info:&ConnectionInfo,
			_cancel:&CancellationToken,
		) -> Result<HostKeyDecision, Error> {
			Ok(HostKeyDecision::Trusted)
		}
	}

	fn config_with_password() -> Arc<Config> {
		Arc::new(Config {
			credentials:vec![Credential::Password("secret".into())],
			..Config::default()
		})
	}

	// A minimal loopback peer, built from the same framing, kex and key
	// pieces the client uses: banner, KEXINIT, curve25519 +
	// chacha20-poly1305, then password authentication. Just enough
	// server to drive the client's whole connect path in tests.
	async fn serve(
		mut stream:TcpStream,
		host_key:Arc<key::KeyPair>,
		password:&'static str,
	) -> Result<(), Error> {
		stream.write_all(b"SSH-2.0-testpeer\r\n").await?;

		let mut client_id = Vec::new();

		loop {
			let mut byte = [0u8; 1];

			stream.read_exact(&mut byte).await?;

			match byte[0] {
				b'\n' => break,
				b'\r' => {},
				byte => client_id.push(byte),
			}
		}

		let mut read_buffer = SSHBuffer::new();

		let mut write_buffer = SSHBuffer::new();

		let mut pair = CipherPair::clear();

		let mut server_kexinit = CryptoVec::new();

		server_kexinit.push(msg::KEXINIT);

		server_kexinit.extend(&[7u8; 16]);

		for list in [
			"curve25519-sha256",
			"ssh-ed25519",
			"chacha20-poly1305@openssh.com",
			"chacha20-poly1305@openssh.com",
			"hmac-sha2-256-etm@openssh.com",
			"hmac-sha2-256-etm@openssh.com",
			"none",
			"none",
			"",
			"",
		] {
			server_kexinit.extend_ssh_string(list.as_bytes());
		}

		server_kexinit.push(0);

		server_kexinit.push_u32_be(0);

		pair.local_to_remote.write(&server_kexinit, &mut write_buffer);

		stream.write_all(&write_buffer.buffer).await?;

		write_buffer.buffer.clear();

		let end =
			cipher::read(&mut stream, &mut read_buffer, pair.remote_to_local.as_mut(), 35_000)
				.await?;

		let client_kexinit = read_buffer.buffer[5..end].to_vec();

		if client_kexinit.first() != Some(&msg::KEXINIT) {
			return Err(Error::Inconsistent);
		}

		let end =
			cipher::read(&mut stream, &mut read_buffer, pair.remote_to_local.as_mut(), 35_000)
				.await?;

		let ecdh_init = read_buffer.buffer[5..end].to_vec();

		if ecdh_init.first() != Some(&msg::KEX_ECDH_INIT) {
			return Err(Error::Inconsistent);
		}

		let mut r = ecdh_init.as_slice().reader(1);

		let client_ephemeral = r.read_string()?.to_vec();

		let mut kexalg = KexAlgorithm::new(kex::CURVE25519)?;

		let mut server_ephemeral = CryptoVec::new();

		let mut scratch = CryptoVec::new();

		kexalg.client_dh(&mut server_ephemeral, &mut scratch)?;

		kexalg.compute_shared_secret(&client_ephemeral)?;

		let host_key_blob = host_key.clone_public_key().public_key_bytes();

		let mut exchange = session::Exchange::new(&client_id, b"SSH-2.0-testpeer");

		exchange.client_kex_init.extend(&client_kexinit);

		exchange.server_kex_init.extend(&server_kexinit);

		exchange.server_host_key.extend(&host_key_blob);

		exchange.client_ephemeral.extend(&client_ephemeral);

		exchange.server_ephemeral.extend(&server_ephemeral);

		let exchange_hash = kexalg.compute_exchange_hash(&exchange)?;

		let mut reply = CryptoVec::new();

		reply.push(msg::KEX_ECDH_REPLY);

		reply.extend_ssh_string(&host_key_blob);

		reply.extend_ssh_string(&server_ephemeral);

		host_key.add_signature(&mut reply, &exchange_hash)?;

		pair.local_to_remote.write(&reply, &mut write_buffer);

		pair.local_to_remote.write(&[msg::NEWKEYS], &mut write_buffer);

		stream.write_all(&write_buffer.buffer).await?;

		write_buffer.buffer.clear();

		// The client's NEWKEYS still arrives under the old keys.
		let end =
			cipher::read(&mut stream, &mut read_buffer, pair.remote_to_local.as_mut(), 35_000)
				.await?;

		if read_buffer.buffer[5..end].first() != Some(&msg::NEWKEYS) {
			return Err(Error::Inconsistent);
		}

		pair = kexalg.compute_keys(
			&exchange_hash,
			&exchange_hash,
			cipher::CHACHA20_POLY1305,
			cipher::CHACHA20_POLY1305,
			mac::HMAC_SHA256_ETM,
			mac::HMAC_SHA256_ETM,
			true,
		)?;

		loop {
			let end = cipher::read(
				&mut stream,
				&mut read_buffer,
				pair.remote_to_local.as_mut(),
				35_000,
			)
			.await?;

			let payload = read_buffer.buffer[5..end].to_vec();

			let mut response = CryptoVec::new();

			match payload.first() {
				Some(&msg::SERVICE_REQUEST) => {
					response.push(msg::SERVICE_ACCEPT);

					response.extend_ssh_string(b"ssh-userauth");
				},
				Some(&msg::USERAUTH_REQUEST) => {
					let mut r = payload.as_slice().reader(1);

					r.read_string()?;

					r.read_string()?;

					let method = r.read_string()?;

					if method == b"password" {
						r.read_bool()?;

						if r.read_string()? == password.as_bytes() {
							response.push(msg::USERAUTH_SUCCESS);
						}
					}

					if response.is_empty() {
						response.push(msg::USERAUTH_FAILURE);

						response.extend_ssh_string(b"password");

						response.push(0);
					}
				},
				Some(&msg::DISCONNECT) => return Ok(()),
				_ => continue,
			}

			pair.local_to_remote.write(&response, &mut write_buffer);

			stream.write_all(&write_buffer.buffer).await?;

			write_buffer.buffer.clear();
		}
	}

	/// Bind a loopback listener that serves any number of connections.
	async fn start_test_server(password:&'static str) -> (u16, key::PublicKey) {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

		let port = listener.local_addr().unwrap().port();

		let host_key = Arc::new(key::KeyPair::generate_ed25519().unwrap());

		let public = host_key.clone_public_key();

		tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((socket, _)) => {
						let host_key = host_key.clone();

						tokio::spawn(async move {
							let _ = serve(socket, host_key, password).await;
						});
					},
					Err(_) => return,
				}
			}
		});

		(port, public)
	}

	fn loopback_config(
		credentials:Vec<Credential>,
		known_hosts_path:Option<PathBuf>,
	) -> Arc<Config> {
		Arc::new(Config {
			connect_timeout:Some(Duration::from_secs(10)),
			known_hosts_path,
			credentials,
			..Config::default()
		})
	}

	fn loopback_destination(port:u16) -> Destination {
		Destination::parse(&format!("tester@127.0.0.1:{}", port)).unwrap()
	}

	/// Fails the test if the host-key callback runs at all.
	struct PanickingHandler;

	#[async_trait]
	impl Handler for PanickingHandler {
		async fn check_server_key(
			&mut self,
			_check:KnownHostsCheck,
			_info:&ConnectionInfo,
			_cancel:&CancellationToken,
		) -> Result<HostKeyDecision, Error> {
			panic!("the host-key callback must not be invoked for a trusted key")
		}
	}

	/// Checks what the callback observes, then returns a fixed decision.
	struct DecisionHandler {
		decision:HostKeyDecision,
		expect_host:String,
		expect_port:u16,
		expect_fingerprint:String,
	}

	#[async_trait]
	impl Handler for DecisionHandler {
		async fn check_server_key(
			&mut self,
			check:KnownHostsCheck,
			info:&ConnectionInfo,
			_cancel:&CancellationToken,
		) -> Result<HostKeyDecision, Error> {
			assert!(matches!(check, KnownHostsCheck::Unknown));

			assert_eq!(info.host, self.expect_host);

			assert_eq!(info.port, self.expect_port);

			assert_eq!(info.sha256_fingerprint, self.expect_fingerprint);

			Ok(self.decision)
		}
	}

	struct RejectingHandler {
		decision:HostKeyDecision,
	}

	#[async_trait]
	impl Handler for RejectingHandler {
		async fn check_server_key(
			&mut self,
			_check:KnownHostsCheck,
			_info:&ConnectionInfo,
			_cancel:&CancellationToken,
		) -> Result<HostKeyDecision, Error> {
			Ok(self.decision)
		}
	}

	/// Relies on every default method.
	struct DefaultHandler;

	#[async_trait]
	impl Handler for DefaultHandler {}

	struct FailingHandler;

	#[async_trait]
	impl Handler for FailingHandler {
		async fn check_server_key(
			&mut self,
			_check:KnownHostsCheck,
			_info:&ConnectionInfo,
			_cancel:&CancellationToken,
		) -> Result<HostKeyDecision, Error> {
			Err(Error::Callback(Box::new(std::io::Error::new(
				std::io::ErrorKind::Other,
				"callback exploded",
			))))
		}
	}

	#[tokio::test]
	async fn connect_succeeds_against_a_known_host() {
		// S1: a good known-hosts file and a matching password; a second
		// connect with the same settings succeeds as well, and neither
		// consults the callback.
		let (port, public) = start_test_server("secret").await;

		let dir = tempdir::TempDir::new("skiff").unwrap();

		let path = dir.path().join("known_hosts");

		learn_known_hosts("127.0.0.1", port, &public, &path).unwrap();

		let config =
			loopback_config(vec![Credential::Password("secret".into())], Some(path));

		let handle = connect(
			config.clone(),
			loopback_destination(port),
			PanickingHandler,
			CancellationToken::new(),
		)
		.await
		.unwrap();

		assert_eq!(handle.connection_info().host, "127.0.0.1");

		assert_eq!(handle.connection_info().kex, "curve25519-sha256");

		let handle = connect(
			config,
			loopback_destination(port),
			PanickingHandler,
			CancellationToken::new(),
		)
		.await
		.unwrap();

		assert!(!handle.is_closed());
	}

	#[tokio::test]
	async fn unknown_host_is_rejected_by_default() {
		// S2: an unusable known-hosts path and no callback override.
		let (port, _public) = start_test_server("secret").await;

		let config = loopback_config(
			vec![Credential::Password("secret".into())],
			Some(PathBuf::from("/")),
		);

		let e = connect(
			config,
			loopback_destination(port),
			DefaultHandler,
			CancellationToken::new(),
		)
		.await
		.unwrap_err();

		match e {
			Error::ConnectFailed(inner) => {
				assert!(matches!(*inner, Error::HostKeyVerificationFailed))
			},
			e => panic!("unexpected: {:?}", e),
		}
	}

	#[tokio::test]
	async fn callback_sees_connection_details() {
		// S3: the callback observes the configured endpoint and the real
		// server fingerprint; returning Trusted lets the connect finish.
		let (port, public) = start_test_server("secret").await;

		let handler = DecisionHandler {
			decision:HostKeyDecision::Trusted,
			expect_host:"127.0.0.1".into(),
			expect_port:port,
			expect_fingerprint:public.fingerprint(),
		};

		let config = loopback_config(vec![Credential::Password("secret".into())], None);

		let handle =
			connect(config, loopback_destination(port), handler, CancellationToken::new())
				.await
				.unwrap();

		assert_eq!(handle.connection_info().md5_fingerprint, public.fingerprint_md5());
	}

	#[tokio::test]
	async fn callback_rejection_fails_the_connect() {
		// S4: every non-accepting decision fails the connection.
		let (port, _public) = start_test_server("secret").await;

		for decision in
			[HostKeyDecision::Revoked, HostKeyDecision::Changed, HostKeyDecision::Unknown]
		{
			let config = loopback_config(vec![Credential::Password("secret".into())], None);

			let e = connect(
				config,
				loopback_destination(port),
				RejectingHandler { decision },
				CancellationToken::new(),
			)
			.await
			.unwrap_err();

			match e {
				Error::ConnectFailed(inner) => {
					assert!(matches!(*inner, Error::HostKeyVerificationFailed))
				},
				e => panic!("unexpected for {:?}: {:?}", decision, e),
			}
		}
	}

	#[tokio::test]
	async fn add_known_host_persists() {
		// S5: the first connect creates the file (and its parent); the
		// second trusts it without invoking the callback.
		let (port, public) = start_test_server("secret").await;

		let dir = tempdir::TempDir::new("skiff").unwrap();

		let path = dir.path().join("fresh").join("known_hosts");

		let handler = DecisionHandler {
			decision:HostKeyDecision::AddKnownHost,
			expect_host:"127.0.0.1".into(),
			expect_port:port,
			expect_fingerprint:public.fingerprint(),
		};

		let config = loopback_config(
			vec![Credential::Password("secret".into())],
			Some(path.clone()),
		);

		connect(
			config.clone(),
			loopback_destination(port),
			handler,
			CancellationToken::new(),
		)
		.await
		.unwrap();

		assert_eq!(
			skiff_keys::check_known_hosts_path("127.0.0.1", port, &public, &path).unwrap(),
			KnownHostsCheck::Trusted
		);

		connect(
			config,
			loopback_destination(port),
			PanickingHandler,
			CancellationToken::new(),
		)
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn wrong_password_fails_authentication() {
		// S6: the server rejects the password; the credential list is
		// exhausted.
		let (port, _public) = start_test_server("secret").await;

		let config = loopback_config(vec![Credential::Password("invalid".into())], None);

		let e = connect(
			config,
			loopback_destination(port),
			TrustingHandler,
			CancellationToken::new(),
		)
		.await
		.unwrap_err();

		match e {
			Error::ConnectFailed(inner) => {
				assert!(matches!(*inner, Error::AuthenticationFailed { .. }))
			},
			e => panic!("unexpected: {:?}", e),
		}
	}

	#[tokio::test]
	async fn callback_error_is_the_connect_cause() {
		// S10: the callback's own error comes back as the inner cause,
		// wrapped exactly once and never mistaken for a closed
		// connection.
		let (port, _public) = start_test_server("secret").await;

		let config = loopback_config(vec![Credential::Password("secret".into())], None);

		let e = connect(
			config,
			loopback_destination(port),
			FailingHandler,
			CancellationToken::new(),
		)
		.await
		.unwrap_err();

		match e {
			Error::ConnectFailed(inner) => {
				assert!(!matches!(*inner, Error::ConnectionClosed));

				assert_eq!(inner.to_string(), "callback exploded");
			},
			e => panic!("unexpected: {:?}", e),
		}
	}

	#[tokio::test]
	async fn empty_credentials_fail_immediately() {
		let config = Arc::new(Config::default());

		let destination = Destination::parse("root@127.0.0.1:4").unwrap();

		let e = connect(config, destination, TrustingHandler, CancellationToken::new())
			.await
			.unwrap_err();

		match e {
			Error::ConnectFailed(inner) => assert!(matches!(*inner, Error::NoCredentials)),
			e => panic!("unexpected: {:?}", e),
		}
	}

	#[tokio::test]
	async fn pre_cancelled_token_is_not_wrapped() {
		let cancel = CancellationToken::new();

		cancel.cancel();

		let destination = Destination::parse("root@127.0.0.1:4").unwrap();

		let e = connect(config_with_password(), destination, TrustingHandler, cancel)
			.await
			.unwrap_err();

		assert!(matches!(e, Error::Cancelled));
	}

	#[tokio::test]
	async fn mute_server_times_out() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

		let addr = listener.local_addr().unwrap();

		tokio::spawn(async move {
			// Accept and never speak SSH.
			let _socket = listener.accept().await;

			tokio::time::sleep(Duration::from_secs(60)).await;
		});

		let config = Arc::new(Config {
			connect_timeout:Some(Duration::from_millis(100)),
			credentials:vec![Credential::Password("secret".into())],
			..Config::default()
		});

		let destination = Destination::parse(&format!("root@127.0.0.1:{}", addr.port())).unwrap();

		let e = connect(config, destination, TrustingHandler, CancellationToken::new())
			.await
			.unwrap_err();

		match e {
			Error::ConnectFailed(inner) => assert!(matches!(*inner, Error::Timeout)),
			e => panic!("unexpected: {:?}", e),
		}
	}

	#[tokio::test]
	async fn cancellation_during_handshake() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

		let addr = listener.local_addr().unwrap();

		tokio::spawn(async move {
			let _socket = listener.accept().await;

			tokio::time::sleep(Duration::from_secs(60)).await;
		});

		let cancel = CancellationToken::new();

		let cancel_later = cancel.clone();

		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;

			cancel_later.cancel();
		});

		let destination = Destination::parse(&format!("root@127.0.0.1:{}", addr.port())).unwrap();

		let e = connect(config_with_password(), destination, TrustingHandler, cancel)
			.await
			.unwrap_err();

		assert!(matches!(e, Error::Cancelled));
	}

	#[tokio::test]
	async fn refused_connection_is_wrapped() {
		// Port 1 on localhost is almost certainly closed.
		let destination = Destination::parse("root@127.0.0.1:1").unwrap();

		let e = connect(
			config_with_password(),
			destination,
			TrustingHandler,
			CancellationToken::new(),
		)
		.await
		.unwrap_err();

		assert!(matches!(e, Error::ConnectFailed(_)));
	}
}
