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

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! This is the core library for dshield. It implements the DNS query
//! pipeline (classify, synthesize, cache, forward), the layered rule engine
//! behind it, and the manifest/fetch/schedule control plane that keeps the
//! rules fresh.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
mod filter;
pub mod manager;
pub mod manifest;
#[doc(hidden)]
pub mod mock;
pub mod pipeline;
pub mod rules;
pub mod sched;
pub mod upstream;

pub use self::{
    config::FilterConfig,
    error::FilterError,
    filter::{Filter, FilterBuilder, StatusSnapshot},
    manager::{ManagerState, RuleManager, RulesEvent},
    pipeline::{FlowHandle, QueryPipeline},
};

use async_trait::async_trait;
use compact_str::CompactString;

// Maximum TTL as defined in https://tools.ietf.org/html/rfc2181, 2147483647
//   Setting this to a value of 1 day, in seconds
pub(crate) const MAX_TTL: u32 = 86400_u32;

// Maximum UDP payload we handle without truncation (EDNS-safe size).
pub(crate) const MAX_LEN: usize = 1232;

/// Identifier for rule sources, manifests, and other small tags.
pub type Label = CompactString;

/// A conversion that has to perform I/O, used by the configuration builders.
#[async_trait]
pub trait AsyncTryInto<T>: Sized {
    /// The possible errors from the conversion.
    type Error;

    /// Build the target, performing whatever I/O the configuration demands.
    async fn async_try_into(self) -> std::result::Result<T, Self::Error>;
}
