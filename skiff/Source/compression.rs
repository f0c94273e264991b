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

//! Payload compression: `none`, `zlib` (active from NEWKEYS) and
//! `zlib@openssh.com` (active only once authentication succeeds).

use skiff_cryptovec::CryptoVec;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
	None,
	#[cfg(feature = "flate2")]
	Zlib,
	#[cfg(feature = "flate2")]
	ZlibAfterAuth,
}

pub(crate) enum Compress {
	None,
	#[cfg(feature = "flate2")]
	Zlib(flate2::Compress),
}

pub(crate) enum Decompress {
	None,
	#[cfg(feature = "flate2")]
	Zlib(flate2::Decompress),
}

impl Compression {
	pub fn from_string(s:&str) -> Self {
		match s {
			#[cfg(feature = "flate2")]
			"zlib" => Compression::Zlib,
			#[cfg(feature = "flate2")]
			"zlib@openssh.com" => Compression::ZlibAfterAuth,
			_ => Compression::None,
		}
	}

	/// Does this algorithm wait for `USERAUTH_SUCCESS` before engaging?
	pub fn delayed(&self) -> bool {
		match *self {
			#[cfg(feature = "flate2")]
			Compression::ZlibAfterAuth => true,
			_ => false,
		}
	}

	pub(crate) fn init_compress(&self, comp:&mut Compress) {
		match *self {
			Compression::None => *comp = Compress::None,
			#[cfg(feature = "flate2")]
			Compression::Zlib | Compression::ZlibAfterAuth => {
				*comp = Compress::Zlib(flate2::Compress::new(flate2::Compression::fast(), true))
			},
		}
	}

	pub(crate) fn init_decompress(&self, comp:&mut Decompress) {
		match *self {
			Compression::None => *comp = Decompress::None,
			#[cfg(feature = "flate2")]
			Compression::Zlib | Compression::ZlibAfterAuth => {
				*comp = Decompress::Zlib(flate2::Decompress::new(true))
			},
		}
	}
}

impl Compress {
	pub fn compress<'a>(
		&mut self,
		buffer:&'a [u8],
		output:&'a mut CryptoVec,
	) -> Result<&'a [u8], Error> {
		match *self {
			Compress::None => Ok(buffer),
			#[cfg(feature = "flate2")]
			Compress::Zlib(ref mut z) => {
				output.clear();

				let mut input = 0;

				loop {
					let n_in = z.total_in() as usize;

					let n_out = z.total_out() as usize;

					let chunk = output.resize_mut(256);

					z.compress(&buffer[input..], chunk, flate2::FlushCompress::Partial)?;

					let produced = z.total_out() as usize - n_out;

					input += z.total_in() as usize - n_in;

					let len = output.len();

					output.resize(len - (256 - produced));

					if input >= buffer.len() && produced < 256 {
						break;
					}
				}

				Ok(output)
			},
		}
	}
}

impl Decompress {
	pub fn decompress<'a>(
		&mut self,
		buffer:&'a [u8],
		output:&'a mut CryptoVec,
	) -> Result<&'a [u8], Error> {
		match *self {
			Decompress::None => Ok(buffer),
			#[cfg(feature = "flate2")]
			Decompress::Zlib(ref mut z) => {
				output.clear();

				let mut input = 0;

				loop {
					let n_in = z.total_in() as usize;

					let n_out = z.total_out() as usize;

					let chunk = output.resize_mut(256);

					let status =
						z.decompress(&buffer[input..], chunk, flate2::FlushDecompress::None)?;

					let produced = z.total_out() as usize - n_out;

					input += z.total_in() as usize - n_in;

					let len = output.len();

					output.resize(len - (256 - produced));

					match status {
						flate2::Status::Ok | flate2::Status::BufError => {
							if input >= buffer.len() && produced < 256 {
								break;
							}
						},
						flate2::Status::StreamEnd => break,
					}
				}

				Ok(output)
			},
		}
	}
}
