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

//! Fetchers for rule source payloads.
//!
//! Two kinds: HTTPS and local file. Both expose the same contract: one
//! cancellable `fetch` returning raw bytes. Retry policy lives with the
//! scheduler and retry manager, never in here.

pub mod file;
pub mod https;

pub use file::FileFetcher;
pub use https::HttpsFetcher;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::watch;

/// A shorthand for returning fetch errors.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Failure taxonomy surfaced to the rule manager.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The network is down or the host is unreachable.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The configured URL does not parse or has the wrong scheme.
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    /// The fetch exceeded its deadline.
    #[error("fetch timed out")]
    Timeout,

    /// The server answered with an unaccepted status.
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// Credentials were rejected or missing.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The payload arrived but is unusable.
    #[error("fetched data is corrupted: {0}")]
    DataCorrupted(String),

    /// A file source's path does not exist.
    #[error("file not found: {0}")]
    FileMissing(PathBuf),

    /// A file source's path is not readable.
    #[error("permission denied reading {0}")]
    PermissionDenied(PathBuf),

    /// The fetch was cancelled.
    #[error("fetch cancelled")]
    Cancelled,

    /// TLS handshake or certificate (pin) failure.
    #[error("TLS failure: {0}")]
    Ssl(String),

    /// Redirect chain exceeded the configured bound.
    #[error("too many redirects")]
    RedirectLimit,

    /// The payload exceeds the configured size cap.
    #[error("payload of {got} bytes exceeds cap of {cap} bytes")]
    TooLarge {
        /// Observed (or announced) size.
        got: u64,
        /// Configured cap.
        cap: u64,
    },
}

impl FetchError {
    /// Whether the scheduler should retry with backoff, or park the source
    /// until its next scheduled attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::NetworkUnavailable | FetchError::Timeout | FetchError::Ssl(_) => true,
            FetchError::HttpStatus(code) => *code >= 500,
            _ => false,
        }
    }

    /// Short user-facing hint shown next to the failure.
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            FetchError::NetworkUnavailable | FetchError::Timeout => {
                "Check your network connection"
            }
            FetchError::AuthenticationFailed => "Verify authentication credentials",
            FetchError::InvalidUrl(_) => "Check the source URL in the configuration",
            FetchError::FileMissing(_) => "Check that the rule list file exists",
            FetchError::PermissionDenied(_) => "Check file permissions on the rule list",
            FetchError::TooLarge { .. } => "Raise the size cap or use a smaller list",
            FetchError::Ssl(_) => "Verify the server certificate or configured pins",
            FetchError::DataCorrupted(_) => "The source may be serving a broken list",
            FetchError::HttpStatus(_) => "The server rejected the request; check the source",
            FetchError::RedirectLimit => "The source redirects too many times",
            FetchError::Cancelled => "The fetch was cancelled",
        }
    }
}

/// A resolved credential, materialized only for the duration of a request.
#[derive(Clone)]
pub enum Credential {
    /// Username and password.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// A bearer/API token.
    Token(String),
}

/// Resolves opaque credential handles at request time. Handles, not
/// secrets, appear in configuration and logs.
pub trait CredentialStore: Send + Sync {
    /// Resolve a handle into a usable credential.
    fn resolve(&self, handle: &str) -> Option<Credential>;
}

/// A store that knows no credentials.
pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn resolve(&self, _handle: &str) -> Option<Credential> {
        None
    }
}

/// Authentication schemes for HTTPS sources. `credential` fields are opaque
/// handles resolved through the [`CredentialStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AuthScheme {
    /// HTTP basic auth.
    Basic {
        /// Credential handle resolving to username/password.
        credential: String,
    },
    /// Bearer token.
    Bearer {
        /// Credential handle resolving to a token.
        credential: String,
    },
    /// Token in a custom header.
    ApiKey {
        /// Header name to carry the key.
        header: String,
        /// Credential handle resolving to the key.
        credential: String,
    },
}

/// Progress reporting channel; values are completion fractions in `0..=1`.
pub type ProgressSender = watch::Sender<f32>;

/// The common fetcher contract.
#[async_trait]
pub trait RuleFetch: Send + Sync {
    /// Fetch the payload, optionally reporting progress. Cancellation via
    /// [`RuleFetch::cancel`] resolves the future with `Cancelled` within a
    /// bounded time.
    async fn fetch(&self, progress: Option<ProgressSender>) -> Result<Bytes>;

    /// Abort an in-flight fetch.
    fn cancel(&self);

    /// Whether interrupted downloads can resume.
    fn supports_resume(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        assert!(FetchError::NetworkUnavailable.is_transient());
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::HttpStatus(503).is_transient());
        assert!(!FetchError::HttpStatus(404).is_transient());
        assert!(!FetchError::AuthenticationFailed.is_transient());
        assert!(!FetchError::Cancelled.is_transient());
        assert!(!FetchError::FileMissing(PathBuf::from("/x")).is_transient());
    }

    #[test]
    fn suggestions_exist_for_user_facing_errors() {
        assert_eq!(
            FetchError::NetworkUnavailable.recovery_suggestion(),
            "Check your network connection"
        );
        assert_eq!(
            FetchError::AuthenticationFailed.recovery_suggestion(),
            "Verify authentication credentials"
        );
    }

    #[test]
    fn auth_scheme_serde_shape() {
        let auth: AuthScheme =
            serde_json::from_str(r#"{"scheme": "bearer", "credential": "corp-token"}"#).unwrap();
        assert_eq!(
            auth,
            AuthScheme::Bearer {
                credential: "corp-token".into()
            }
        );
        let auth: AuthScheme = serde_json::from_str(
            r#"{"scheme": "apikey", "header": "X-Api-Key", "credential": "h"}"#,
        )
        .unwrap();
        assert!(matches!(auth, AuthScheme::ApiKey { .. }));
    }
}
