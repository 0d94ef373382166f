// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

#![deny(unsafe_code)]
// Documentation
//! This is the core library for leshy. It implements configuration parsing,
//! split-horizon zone matching, response caching, upstream failover and
//! on-demand kernel route installation.

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
#[doc(hidden)]
pub mod mock;
pub mod pattern;
pub mod pipeline;
pub mod route;
pub mod upstream;
pub mod zone;

pub use self::error::LeshyError;

/// The largest message size this library ever allocates a buffer for. EDNS0
/// allows larger UDP responses, but leshy never advertises an OPT record
/// larger than this, and the TCP path frames its own length prefix
/// regardless of payload size.
pub(crate) const MAX_LEN: usize = 1232;
