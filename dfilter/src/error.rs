// Copyright 2024 dshield developers
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

//! This module provides the universal error type used in the library. The
//! error type uses `thiserror` and aggregates each section's error
//! transparently.

pub use crate::{
    codec::CodecError,
    config::ConfigError,
    fetch::FetchError,
    manifest::ManifestError,
    rules::{parsers::ParseError, store::StoreError},
    upstream::UpstreamError,
};
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, FilterError>;

/// FilterError enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum FilterError {
    /// Error related to DNS wire parsing or construction.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Error related to the rule store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Error related to rule list parsing.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Error related to manifest resolution.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Error related to rule source fetching.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Error related to upstream resolvers.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Error related to the configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
