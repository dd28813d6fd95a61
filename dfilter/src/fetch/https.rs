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

//! The HTTPS rule fetcher.
//!
//! A reqwest GET with auth from the credential store, a redirect bound, an
//! accepted-status set, a streamed body with size cap and progress, and
//! optional SHA-256 certificate pinning through a rustls custom verifier.

use super::{AuthScheme, Credential, CredentialStore, FetchError, ProgressSender, Result, RuleFetch};
use crate::manifest::RuleSourceConfig;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, warn};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    redirect::Policy,
    Client, StatusCode,
};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName,
};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration, time::SystemTime};
use tokio::sync::Notify;

// Strict pin verification: the end-entity certificate's SHA-256 digest must
// match one of the configured pins. Pins pre-empt web-PKI trust for the
// pinned source.
struct PinnedCertVerifier {
    pins: Vec<[u8; 32]>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let digest: [u8; 32] = Sha256::digest(&end_entity.0).into();
        if self.pins.iter().any(|pin| *pin == digest) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate matches no configured pin".into(),
            ))
        }
    }
}

fn webpki_roots_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_store
}

fn pinned_client_config(pins: Vec<[u8; 32]>) -> ClientConfig {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(webpki_roots_store())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(PinnedCertVerifier { pins }));
    config
}

fn parse_pins(hex_pins: &[String]) -> Result<Vec<[u8; 32]>> {
    hex_pins
        .iter()
        .map(|p| {
            let raw = hex::decode(p.trim_start_matches("sha256:"))
                .map_err(|_| FetchError::Ssl(format!("pin '{}' is not hex", p)))?;
            <[u8; 32]>::try_from(raw.as_slice())
                .map_err(|_| FetchError::Ssl(format!("pin '{}' is not a SHA-256 digest", p)))
        })
        .collect()
}

/// Fetches one HTTPS rule source.
pub struct HttpsFetcher {
    url: String,
    client: Client,
    auth: Option<AuthScheme>,
    accepted: Vec<u16>,
    max_bytes: u64,
    credentials: Arc<dyn CredentialStore>,
    cancel: Notify,
}

impl HttpsFetcher {
    /// Build a fetcher for `source`. The client carries the redirect bound,
    /// extra headers, timeout, and (when pins are configured) the pinning
    /// TLS config.
    pub fn new(
        source: &RuleSourceConfig,
        credentials: Arc<dyn CredentialStore>,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<Self> {
        let url = source
            .url
            .clone()
            .ok_or_else(|| FetchError::InvalidUrl(String::from("<missing url>")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &source.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidUrl(format!("bad header name '{}'", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| FetchError::InvalidUrl(format!("bad header value for {:?}", name)))?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder()
            .redirect(Policy::limited(source.max_redirects as usize))
            .default_headers(headers)
            .timeout(timeout);
        if !source.pinned_cert_hashes.is_empty() {
            builder = builder.use_preconfigured_tls(pinned_client_config(parse_pins(
                &source.pinned_cert_hashes,
            )?));
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Ssl(e.to_string()))?;

        Ok(Self {
            url,
            client,
            auth: source.auth.clone(),
            accepted: source.accepted_statuses.clone(),
            max_bytes,
            credentials,
            cancel: Notify::new(),
        })
    }

    fn status_accepted(&self, status: StatusCode) -> bool {
        if self.accepted.is_empty() {
            status.is_success()
        } else {
            self.accepted.contains(&status.as_u16())
        }
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let Some(auth) = &self.auth else {
            return Ok(request);
        };
        let resolve = |handle: &str| -> Result<Credential> {
            self.credentials
                .resolve(handle)
                .ok_or(FetchError::AuthenticationFailed)
        };
        Ok(match auth {
            AuthScheme::Basic { credential } => match resolve(credential)? {
                Credential::Basic { username, password } => {
                    request.basic_auth(username, Some(password))
                }
                Credential::Token(token) => request.basic_auth(token, Option::<String>::None),
            },
            AuthScheme::Bearer { credential } => match resolve(credential)? {
                Credential::Token(token) => request.bearer_auth(token),
                Credential::Basic { .. } => return Err(FetchError::AuthenticationFailed),
            },
            AuthScheme::ApiKey { header, credential } => {
                let token = match resolve(credential)? {
                    Credential::Token(token) => token,
                    Credential::Basic { .. } => return Err(FetchError::AuthenticationFailed),
                };
                request.header(
                    HeaderName::from_bytes(header.as_bytes())
                        .map_err(|_| FetchError::InvalidUrl(format!("bad header '{}'", header)))?,
                    HeaderValue::from_str(&token).map_err(|_| FetchError::AuthenticationFailed)?,
                )
            }
        })
    }

    fn map_reqwest_error(e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_redirect() {
            FetchError::RedirectLimit
        } else if e.is_connect() {
            // TLS failures surface as connect errors; tell them apart by text.
            let text = e.to_string();
            if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
                FetchError::Ssl(text)
            } else {
                FetchError::NetworkUnavailable
            }
        } else if e.is_request() && e.url().is_some() {
            FetchError::InvalidUrl(e.url().map(|u| u.to_string()).unwrap_or_default())
        } else {
            FetchError::NetworkUnavailable
        }
    }

    async fn run(&self, progress: Option<ProgressSender>) -> Result<Bytes> {
        let request = self.apply_auth(self.client.get(&self.url))?;
        debug!("fetching rule list from {}", self.url);
        let response = request.send().await.map_err(Self::map_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::AuthenticationFailed);
        }
        if !self.status_accepted(status) {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let total = response.content_length();
        if let Some(announced) = total {
            if announced > self.max_bytes {
                return Err(FetchError::TooLarge {
                    got: announced,
                    cap: self.max_bytes,
                });
            }
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::map_reqwest_error)?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge {
                    got: (body.len() + chunk.len()) as u64,
                    cap: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
            if let (Some(progress), Some(total)) = (&progress, total) {
                let _ = progress.send(body.len() as f32 / total as f32);
            }
        }
        if let Some(progress) = &progress {
            let _ = progress.send(1.0);
        }
        Ok(body.freeze())
    }
}

#[async_trait]
impl RuleFetch for HttpsFetcher {
    async fn fetch(&self, progress: Option<ProgressSender>) -> Result<Bytes> {
        tokio::select! {
            result = self.run(progress) => result,
            _ = self.cancel.notified() => {
                warn!("fetch of {} cancelled", self.url);
                Err(FetchError::Cancelled)
            }
        }
    }

    fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    fn supports_resume(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::NoCredentials;
    use crate::manifest::{RuleSourceConfig, SourceKind};
    use std::collections::BTreeMap;

    fn source(url: &str) -> RuleSourceConfig {
        RuleSourceConfig {
            identifier: "s".into(),
            name: None,
            kind: SourceKind::Https,
            format: None,
            url: Some(url.into()),
            path: None,
            update_interval: 3600,
            priority: 0,
            enabled: true,
            auth: None,
            headers: BTreeMap::new(),
            pinned_cert_hashes: Vec::new(),
            accepted_statuses: Vec::new(),
            max_redirects: 5,
            allow_insecure_http: false,
            watch: false,
        }
    }

    #[test]
    fn pin_parsing() {
        let good = vec![
            "ab".repeat(32),
            format!("sha256:{}", "cd".repeat(32)),
        ];
        assert_eq!(parse_pins(&good).unwrap().len(), 2);
        assert!(parse_pins(&["nothex!".to_string()]).is_err());
        assert!(parse_pins(&["abcd".to_string()]).is_err());
    }

    #[test]
    fn pin_verifier_accepts_only_pinned() {
        let cert = Certificate(b"fake-der-bytes".to_vec());
        let digest: [u8; 32] = Sha256::digest(&cert.0).into();
        let verifier = PinnedCertVerifier {
            pins: vec![digest],
        };
        let name = ServerName::try_from("lists.example.com").unwrap();
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &mut std::iter::empty(), &[], SystemTime::now())
            .is_ok());

        let other = Certificate(b"different-der".to_vec());
        assert!(verifier
            .verify_server_cert(&other, &[], &name, &mut std::iter::empty(), &[], SystemTime::now())
            .is_err());
    }

    #[tokio::test]
    async fn missing_credential_is_auth_failure() {
        let mut src = source("https://lists.example.com/ads.json");
        src.auth = Some(AuthScheme::Bearer {
            credential: "no-such-handle".into(),
        });
        let fetcher = HttpsFetcher::new(
            &src,
            Arc::new(NoCredentials),
            Duration::from_secs(5),
            1024,
        )
        .unwrap();
        assert!(matches!(
            fetcher.fetch(None).await,
            Err(FetchError::AuthenticationFailed)
        ));
    }

    #[test]
    fn status_acceptance_defaults_to_success() {
        let fetcher = HttpsFetcher::new(
            &source("https://lists.example.com/l"),
            Arc::new(NoCredentials),
            Duration::from_secs(5),
            1024,
        )
        .unwrap();
        assert!(fetcher.status_accepted(StatusCode::OK));
        assert!(fetcher.status_accepted(StatusCode::NO_CONTENT));
        assert!(!fetcher.status_accepted(StatusCode::NOT_FOUND));

        let mut src = source("https://lists.example.com/l");
        src.accepted_statuses = vec![200, 304];
        let fetcher =
            HttpsFetcher::new(&src, Arc::new(NoCredentials), Duration::from_secs(5), 1024).unwrap();
        assert!(fetcher.status_accepted(StatusCode::NOT_MODIFIED));
        assert!(!fetcher.status_accepted(StatusCode::NO_CONTENT));
    }
}
