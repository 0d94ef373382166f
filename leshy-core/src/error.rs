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

//! Universal error type used across the library. Each submodule owns a
//! narrow `thiserror` enum for its own concern; this type only wraps them
//! for callers that need a single error to propagate up to the binary.

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::route::RouteError;
use crate::upstream::UpstreamError;
use thiserror::Error;

/// `LeshyError` enumerates all possible errors returned by this library.
/// Route and upstream failures are always handled internally (logged and
/// turned into a SERVFAIL or a skipped route) and never actually surface
/// through this type in normal operation; it exists for callers, such as
/// the binary's startup path, that need one error type to propagate with
/// `?`.
#[derive(Error, Debug)]
pub enum LeshyError {
    /// Error loading or compiling the configuration file.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error rebuilding a cached or upstream response.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Error exhausting an upstream pool.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Error installing or withdrawing a kernel route.
    #[error(transparent)]
    Route(#[from] RouteError),
}
