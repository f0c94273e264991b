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

//! Message numbers from RFC 4250 §4.1.2, plus the RFC 8308 extension
//! message. Several numbers in the 60s are method-specific and overlap.

#![allow(dead_code)]

pub const DISCONNECT:u8 = 1;
pub const IGNORE:u8 = 2;
pub const UNIMPLEMENTED:u8 = 3;
pub const DEBUG:u8 = 4;
pub const SERVICE_REQUEST:u8 = 5;
pub const SERVICE_ACCEPT:u8 = 6;
pub const EXT_INFO:u8 = 7;

pub const KEXINIT:u8 = 20;
pub const NEWKEYS:u8 = 21;

// Both ECDH (RFC 5656) and classic DH (RFC 4253) use 30/31.
pub const KEX_ECDH_INIT:u8 = 30;
pub const KEX_ECDH_REPLY:u8 = 31;
pub const KEXDH_INIT:u8 = 30;
pub const KEXDH_REPLY:u8 = 31;

pub const USERAUTH_REQUEST:u8 = 50;
pub const USERAUTH_FAILURE:u8 = 51;
pub const USERAUTH_SUCCESS:u8 = 52;
pub const USERAUTH_BANNER:u8 = 53;

pub const USERAUTH_PK_OK:u8 = 60;
pub const USERAUTH_PASSWD_CHANGEREQ:u8 = 60;
pub const USERAUTH_INFO_REQUEST:u8 = 60;
pub const USERAUTH_INFO_RESPONSE:u8 = 61;

pub const GLOBAL_REQUEST:u8 = 80;
pub const REQUEST_SUCCESS:u8 = 81;
pub const REQUEST_FAILURE:u8 = 82;
