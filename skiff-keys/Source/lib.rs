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

//! Keys and trust for SSH clients: parse and load keys, verify signatures,
//! and maintain an OpenSSH-format known-hosts store, including hashed
//! hostnames, `@revoked`/`@cert-authority` markers, glob patterns and
//! `[host]:port` entries.

use std::{
	io::Write,
	path::{Path, PathBuf},
};

use hmac::{Hmac, Mac};
use log::debug;
use sha1::Sha1;
use thiserror::Error;

pub mod encoding;
pub mod format;
pub mod key;

pub use format::decode_secret_key;

use encoding::Reader;

#[derive(Debug, Error)]
pub enum Error {
	/// The key file could not be parsed.
	#[error("Could not read key")]
	CouldNotReadKey,

	/// The key is encrypted and no (or the wrong) password was supplied.
	#[error("The key is encrypted (should supply a password?)")]
	KeyIsEncrypted,

	/// The key blob contradicts its declared algorithm.
	#[error("The key is corrupt")]
	KeyIsCorrupt,

	#[error("Unsupported key type {:?}", .0)]
	UnsupportedKeyType(Vec<u8>),

	/// A wire read ran past the end of its buffer.
	#[error("Index out of bounds")]
	IndexOutOfBounds,

	/// No home directory found when trying to locate the user store.
	#[error("No home directory when saving host key")]
	NoHomeDir,

	#[error(transparent)]
	IO(#[from] std::io::Error),

	#[error(transparent)]
	Utf8(#[from] std::str::Utf8Error),
}

/// Load a secret key from a file, decrypting with `password` if needed.
pub fn load_secret_key<P:AsRef<Path>>(
	path:P,
	password:Option<&str>,
) -> Result<key::KeyPair, Error> {
	let secret = std::fs::read_to_string(path)?;

	decode_secret_key(&secret, password)
}

/// Parse a public key from its base64 blob (the third field of a
/// known-hosts or authorized-keys line).
pub fn parse_public_key_base64(key:&str) -> Result<key::PublicKey, Error> {
	let base = data_encoding::BASE64
		.decode(key.as_bytes())
		.map_err(|_| Error::CouldNotReadKey)?;

	let mut r = base.as_slice().reader(0);

	let algo = r.read_string()?.to_vec();

	key::PublicKey::parse(&algo, &base)
}

/// What the known-hosts store says about a server key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostsCheck {
	/// A matching entry with this exact key exists.
	Trusted,
	/// An entry for this host and key type exists, with a different key.
	Changed { line:usize },
	/// A matching `@revoked` entry names this key.
	Revoked,
	/// Nothing known about this host.
	Unknown,
}

/// The user's default store, `~/.ssh/known_hosts`.
pub fn known_hosts_user_path() -> Result<PathBuf, Error> {
	let mut home = dirs::home_dir().ok_or(Error::NoHomeDir)?;

	home.push(".ssh");

	home.push("known_hosts");

	Ok(home)
}

/// The system-wide store consulted when global checking is enabled.
pub const GLOBAL_KNOWN_HOSTS:&str = "/etc/ssh/ssh_known_hosts";

/// The host field as it appears on a known-hosts line: bare for the
/// default port, `[host]:port` otherwise.
fn format_host(host:&str, port:u16) -> String {
	if port == 22 { host.to_string() } else { format!("[{}]:{}", host, port) }
}

/// The type name under which a key is stored (RSA keys are stored as
/// `ssh-rsa` whatever signature hash was negotiated).
fn stored_type_name(key:&key::PublicKey) -> &'static str {
	match key {
		key::PublicKey::Ed25519(_) => "ssh-ed25519",
		key::PublicKey::Rsa { .. } => "ssh-rsa",
	}
}

/// Shell-style pattern match with `*` and `?`.
fn wildcard_match(pattern:&[u8], s:&[u8]) -> bool {
	match (pattern.split_first(), s.split_first()) {
		(None, None) => true,
		(Some((&b'*', rest)), _) => {
			(0..=s.len()).any(|i| wildcard_match(rest, &s[i..]))
		},
		(Some((&b'?', p_rest)), Some((_, s_rest))) => wildcard_match(p_rest, s_rest),
		(Some((p, p_rest)), Some((c, s_rest))) => {
			p.eq_ignore_ascii_case(c) && wildcard_match(p_rest, s_rest)
		},
		_ => false,
	}
}

/// Check a `|1|salt|hash` hashed host field: HMAC-SHA1 over the hostname,
/// keyed by the salt.
fn check_hashed_host(pattern:&str, target:&str) -> bool {
	let mut parts = pattern.split('|');

	// Leading empty field before the first '|'.
	if parts.next() != Some("") || parts.next() != Some("1") {
		return false;
	}

	let (salt, hash) = match (parts.next(), parts.next()) {
		(Some(salt), Some(hash)) => (salt, hash),
		_ => return false,
	};

	let (salt, hash) = match (
		data_encoding::BASE64.decode(salt.as_bytes()),
		data_encoding::BASE64.decode(hash.as_bytes()),
	) {
		(Ok(salt), Ok(hash)) => (salt, hash),
		_ => return false,
	};

	let hmac = match Hmac::<Sha1>::new_from_slice(&salt) {
		Ok(mut hmac) => {
			hmac.update(target.as_bytes());

			hmac.finalize().into_bytes()
		},
		Err(_) => return false,
	};

	hmac.as_slice() == hash.as_slice()
}

/// Does the host field of a line cover `target`? Plain fields are
/// comma-separated patterns, possibly negated with `!`; hashed fields are
/// a single `|1|…` element.
fn hosts_field_matches(hosts:&str, target:&str) -> bool {
	if hosts.starts_with('|') {
		return check_hashed_host(hosts, target);
	}

	let mut matched = false;

	for pattern in hosts.split(',') {
		if let Some(negated) = pattern.strip_prefix('!') {
			if wildcard_match(negated.as_bytes(), target.as_bytes()) {
				return false;
			}
		} else if wildcard_match(pattern.as_bytes(), target.as_bytes()) {
			matched = true
		}
	}

	matched
}

struct KnownHostLine<'a> {
	marker:Option<&'a str>,
	hosts:&'a str,
	key_type:&'a str,
	key_base64:&'a str,
}

fn parse_line(line:&str) -> Option<KnownHostLine> {
	let line = line.trim();

	if line.is_empty() || line.starts_with('#') {
		return None;
	}

	let mut fields = line.split_whitespace();

	let first = fields.next()?;

	let (marker, hosts) = if let Some(marker) = first.strip_prefix('@') {
		(Some(marker), fields.next()?)
	} else {
		(None, first)
	};

	let key_type = fields.next()?;

	let key_base64 = fields.next()?;

	Some(KnownHostLine { marker, hosts, key_type, key_base64 })
}

/// Classify `key` against a single known-hosts file. A missing file is an
/// empty one.
pub fn check_known_hosts_path<P:AsRef<Path>>(
	host:&str,
	port:u16,
	key:&key::PublicKey,
	path:P,
) -> Result<KnownHostsCheck, Error> {
	// A store that cannot be read holds no trust: missing files,
	// directories and permission problems all classify as Unknown.
	let contents = match std::fs::read_to_string(path.as_ref()) {
		Ok(contents) => contents,
		Err(e) => {
			debug!("could not read {:?}: {}", path.as_ref(), e);

			return Ok(KnownHostsCheck::Unknown);
		},
	};

	let target = format_host(host, port);

	let key_type = stored_type_name(key);

	let key_base64 = key.public_key_base64();

	// Revocations take precedence over everything else in the file.
	for line in contents.lines() {
		let parsed = match parse_line(line) {
			Some(parsed) => parsed,
			None => continue,
		};

		if parsed.marker == Some("revoked")
			&& parsed.key_type == key_type
			&& parsed.key_base64 == key_base64
			&& hosts_field_matches(parsed.hosts, &target)
		{
			return Ok(KnownHostsCheck::Revoked);
		}
	}

	let mut changed = None;

	for (n, line) in contents.lines().enumerate() {
		let parsed = match parse_line(line) {
			Some(parsed) => parsed,
			None => continue,
		};

		// Certificate-authority entries vouch for signed certificates,
		// which is not the check being made here.
		if parsed.marker.is_some() {
			continue;
		}

		if parsed.key_type != key_type || !hosts_field_matches(parsed.hosts, &target) {
			continue;
		}

		if parsed.key_base64 == key_base64 {
			return Ok(KnownHostsCheck::Trusted);
		}

		if changed.is_none() {
			changed = Some(n + 1)
		}
	}

	Ok(match changed {
		Some(line) => KnownHostsCheck::Changed { line },
		None => KnownHostsCheck::Unknown,
	})
}

/// Classify `key` against the user store and, optionally, the global one.
pub fn check_known_hosts(
	host:&str,
	port:u16,
	key:&key::PublicKey,
	user_path:Option<&Path>,
	check_global:bool,
) -> Result<KnownHostsCheck, Error> {
	let mut result = KnownHostsCheck::Unknown;

	let global = PathBuf::from(GLOBAL_KNOWN_HOSTS);

	let paths = user_path
		.into_iter()
		.chain(if check_global { Some(global.as_path()) } else { None });

	for path in paths {
		match check_known_hosts_path(host, port, key, path)? {
			KnownHostsCheck::Revoked => return Ok(KnownHostsCheck::Revoked),
			KnownHostsCheck::Trusted => result = KnownHostsCheck::Trusted,
			KnownHostsCheck::Changed { line } => {
				if result != KnownHostsCheck::Trusted {
					result = KnownHostsCheck::Changed { line }
				}
			},
			KnownHostsCheck::Unknown => {},
		}
	}

	Ok(result)
}

#[cfg(unix)]
fn lock_exclusive(file:&std::fs::File) {
	use std::os::unix::io::AsRawFd;

	unsafe {
		libc::flock(file.as_raw_fd(), libc::LOCK_EX);
	}
}

#[cfg(not(unix))]
fn lock_exclusive(_file:&std::fs::File) {}

#[cfg(unix)]
fn restrict_permissions(path:&Path, dir:bool) {
	use std::os::unix::fs::PermissionsExt;

	let mode = if dir { 0o700 } else { 0o600 };

	let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn restrict_permissions(_path:&Path, _dir:bool) {}

/// Append `key` for `host` to a known-hosts file, creating the file and
/// its parent directory as needed. Appending a key the file already
/// trusts is a no-op. Returns whether a line was written.
pub fn learn_known_hosts<P:AsRef<Path>>(
	host:&str,
	port:u16,
	key:&key::PublicKey,
	path:P,
) -> Result<bool, Error> {
	let path = path.as_ref();

	if let KnownHostsCheck::Trusted = check_known_hosts_path(host, port, key, path)? {
		debug!("key for {:?} already known", host);

		return Ok(false);
	}

	let created = !path.exists();

	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() && !parent.exists() {
			std::fs::create_dir_all(parent)?;

			restrict_permissions(parent, true);
		}
	}

	let mut file = std::fs::OpenOptions::new().append(true).create(true).open(path)?;

	if created {
		restrict_permissions(path, false);
	}

	lock_exclusive(&file);

	let line = format!(
		"{} {} {}\n",
		format_host(host, port),
		stored_type_name(key),
		key.public_key_base64()
	);

	file.write_all(line.as_bytes())?;

	file.flush()?;

	Ok(true)
}

#[cfg(test)]
mod test {
	use super::*;

	const ED25519_B64:&str = "AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";

	fn test_key() -> key::PublicKey { parse_public_key_base64(ED25519_B64).unwrap() }

	fn other_key() -> key::PublicKey {
		key::KeyPair::generate_ed25519().unwrap().clone_public_key()
	}

	#[test]
	fn parse_public_key() {
		let key = test_key();

		assert_eq!(key.name(), "ssh-ed25519");

		assert_eq!(key.public_key_base64(), ED25519_B64);
	}

	#[test]
	fn plain_entry_roundtrip() {
		let dir = tempdir::TempDir::new("known_hosts").unwrap();

		let path = dir.path().join("subdir").join("known_hosts");

		let key = test_key();

		// The parent directory does not exist yet.
		assert!(learn_known_hosts("pijul.org", 22, &key, &path).unwrap());

		assert_eq!(
			check_known_hosts_path("pijul.org", 22, &key, &path).unwrap(),
			KnownHostsCheck::Trusted
		);

		// Learning the same key again must not duplicate the line.
		assert!(!learn_known_hosts("pijul.org", 22, &key, &path).unwrap());

		let contents = std::fs::read_to_string(&path).unwrap();

		assert_eq!(contents.lines().count(), 1);

		assert!(contents.ends_with('\n'));
	}

	#[test]
	fn changed_key_reports_line() {
		let dir = tempdir::TempDir::new("known_hosts").unwrap();

		let path = dir.path().join("known_hosts");

		learn_known_hosts("example.com", 22, &test_key(), &path).unwrap();

		match check_known_hosts_path("example.com", 22, &other_key(), &path).unwrap() {
			KnownHostsCheck::Changed { line } => assert_eq!(line, 1),
			r => panic!("expected Changed, got {:?}", r),
		}
	}

	#[test]
	fn non_default_port_is_bracketed() {
		let dir = tempdir::TempDir::new("known_hosts").unwrap();

		let path = dir.path().join("known_hosts");

		learn_known_hosts("example.com", 2222, &test_key(), &path).unwrap();

		let contents = std::fs::read_to_string(&path).unwrap();

		assert!(contents.starts_with("[example.com]:2222 "));

		assert_eq!(
			check_known_hosts_path("example.com", 2222, &test_key(), &path).unwrap(),
			KnownHostsCheck::Trusted
		);

		// The same host on the default port is a different identity.
		assert_eq!(
			check_known_hosts_path("example.com", 22, &test_key(), &path).unwrap(),
			KnownHostsCheck::Unknown
		);
	}

	#[test]
	fn revoked_marker_wins() {
		let dir = tempdir::TempDir::new("known_hosts").unwrap();

		let path = dir.path().join("known_hosts");

		let key = test_key();

		std::fs::write(
			&path,
			format!(
				"example.com ssh-ed25519 {}\n@revoked example.com ssh-ed25519 {}\n",
				key.public_key_base64(),
				key.public_key_base64()
			),
		)
		.unwrap();

		assert_eq!(
			check_known_hosts_path("example.com", 22, &key, &path).unwrap(),
			KnownHostsCheck::Revoked
		);
	}

	#[test]
	fn glob_and_negation() {
		assert!(hosts_field_matches("*.example.com", "www.example.com"));

		assert!(!hosts_field_matches("*.example.com", "example.com"));

		assert!(hosts_field_matches("www?.example.com", "www1.example.com"));

		assert!(hosts_field_matches("*.example.com,!www.example.com", "mail.example.com"));

		assert!(!hosts_field_matches("*.example.com,!www.example.com", "www.example.com"));

		// Comma-separated alternatives.
		assert!(hosts_field_matches("pijul.org,nest.pijul.com", "nest.pijul.com"));
	}

	#[test]
	fn hashed_host_entries() {
		// Hash "example.com" with a fixed salt and check the lookup path.
		let salt = [7u8; 20];

		let mut hmac = Hmac::<Sha1>::new_from_slice(&salt).unwrap();

		hmac.update(b"example.com");

		let digest = hmac.finalize().into_bytes();

		let field = format!(
			"|1|{}|{}",
			data_encoding::BASE64.encode(&salt),
			data_encoding::BASE64.encode(&digest)
		);

		assert!(hosts_field_matches(&field, "example.com"));

		assert!(!hosts_field_matches(&field, "example.org"));

		let dir = tempdir::TempDir::new("known_hosts").unwrap();

		let path = dir.path().join("known_hosts");

		let key = test_key();

		std::fs::write(&path, format!("{} ssh-ed25519 {}\n", field, key.public_key_base64()))
			.unwrap();

		assert_eq!(
			check_known_hosts_path("example.com", 22, &key, &path).unwrap(),
			KnownHostsCheck::Trusted
		);
	}

	#[test]
	fn comments_and_markers_are_skipped() {
		let dir = tempdir::TempDir::new("known_hosts").unwrap();

		let path = dir.path().join("known_hosts");

		let key = test_key();

		std::fs::write(
			&path,
			format!(
				"# a comment\n\n@cert-authority *.example.com ssh-ed25519 {}\n",
				key.public_key_base64()
			),
		)
		.unwrap();

		assert_eq!(
			check_known_hosts_path("www.example.com", 22, &key, &path).unwrap(),
			KnownHostsCheck::Unknown
		);
	}

	#[test]
	fn missing_file_is_unknown() {
		assert_eq!(
			check_known_hosts_path("example.com", 22, &test_key(), "/nonexistent/known_hosts")
				.unwrap(),
			KnownHostsCheck::Unknown
		);
	}
}
