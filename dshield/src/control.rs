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

//! Control surface for the external CLI/UI.
//!
//! Line-delimited JSON over a Unix socket. The message shapes are the
//! contract; the transport stays deliberately thin.

use dfilter::Filter;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};

/// Commands the control surface accepts.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Refresh rule sources; all of them unless one is named.
    UpdateRules {
        /// Optional single source to refresh.
        #[serde(default)]
        source: Option<String>,
    },
    /// Report a status snapshot.
    GetStatus,
    /// Drop the response cache and cached verdicts.
    ClearCache,
    /// Re-read the configuration file and apply it.
    ReloadConfiguration,
}

/// Structured reply for every command.
#[derive(Debug, Serialize)]
pub struct ControlResponse {
    /// Whether the command took effect.
    pub ok: bool,
    /// Error text when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Command-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ControlResponse {
    fn ok(result: Option<serde_json::Value>) -> Self {
        Self {
            ok: true,
            error: None,
            result,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            result: None,
        }
    }
}

/// Execute one request against the filter core.
pub async fn execute(
    filter: &Filter,
    config_path: Option<&PathBuf>,
    request: ControlRequest,
) -> ControlResponse {
    match request {
        ControlRequest::UpdateRules { source: None } => {
            filter.update_now();
            ControlResponse::ok(None)
        }
        ControlRequest::UpdateRules {
            source: Some(source),
        } => {
            if filter.update_source_now(&source) {
                ControlResponse::ok(None)
            } else {
                ControlResponse::err(format!("source '{}' unknown or rate-limited", source))
            }
        }
        ControlRequest::GetStatus => match serde_json::to_value(filter.status().await) {
            Ok(status) => ControlResponse::ok(Some(status)),
            Err(e) => ControlResponse::err(e.to_string()),
        },
        ControlRequest::ClearCache => {
            filter.clear_caches();
            ControlResponse::ok(None)
        }
        ControlRequest::ReloadConfiguration => {
            let Some(path) = config_path else {
                return ControlResponse::err("no configuration file to reload");
            };
            let raw = match tokio::fs::read_to_string(path).await {
                Ok(raw) => raw,
                Err(e) => return ControlResponse::err(e.to_string()),
            };
            let config = match serde_yaml::from_str(&raw) {
                Ok(config) => config,
                Err(e) => return ControlResponse::err(e.to_string()),
            };
            match filter.reload(config).await {
                Ok(()) => ControlResponse::ok(None),
                Err(e) => ControlResponse::err(e.to_string()),
            }
        }
    }
}

/// Serve control requests on a Unix socket, one JSON object per line.
#[cfg(unix)]
pub fn serve(filter: Arc<Filter>, socket_path: PathBuf, config_path: Option<PathBuf>) {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::UnixListener,
    };

    tokio::spawn(async move {
        let _ = tokio::fs::remove_file(&socket_path).await;
        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("cannot bind control socket {}: {}", socket_path.display(), e);
                return;
            }
        };
        info!("control socket listening on {}", socket_path.display());

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("control accept failed: {}", e);
                    continue;
                }
            };
            let filter = filter.clone();
            let config_path = config_path.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let response = match serde_json::from_str::<ControlRequest>(&line) {
                        Ok(request) => execute(&filter, config_path.as_ref(), request).await,
                        Err(e) => ControlResponse::err(format!("bad request: {}", e)),
                    };
                    let mut body = match serde_json::to_vec(&response) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!("cannot serialize control response: {}", e);
                            continue;
                        }
                    };
                    body.push(b'\n');
                    if write.write_all(&body).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
}

#[cfg(not(unix))]
pub fn serve(_filter: Arc<Filter>, _socket_path: PathBuf, _config_path: Option<PathBuf>) {
    warn!("control socket unsupported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfilter::FilterConfig;

    #[test]
    fn request_shapes() {
        let request: ControlRequest = serde_json::from_str(r#"{"command": "get-status"}"#).unwrap();
        assert_eq!(request, ControlRequest::GetStatus);

        let request: ControlRequest =
            serde_json::from_str(r#"{"command": "update-rules", "source": "ads"}"#).unwrap();
        assert_eq!(
            request,
            ControlRequest::UpdateRules {
                source: Some("ads".into())
            }
        );

        let request: ControlRequest =
            serde_json::from_str(r#"{"command": "clear-cache"}"#).unwrap();
        assert_eq!(request, ControlRequest::ClearCache);

        assert!(serde_json::from_str::<ControlRequest>(r#"{"command": "self-destruct"}"#).is_err());
    }

    #[tokio::test]
    async fn commands_execute_against_a_live_core() {
        let mut config = FilterConfig::default();
        config.db_path = ":memory:".into();
        config.update.update_on_start = false;
        let filter = dfilter::Filter::start(config).await.unwrap();

        let response = execute(&filter, None, ControlRequest::GetStatus).await;
        assert!(response.ok);
        let status = response.result.unwrap();
        assert!(status.get("state").is_some());
        assert!(status.get("total_rules").is_some());

        let response = execute(&filter, None, ControlRequest::ClearCache).await;
        assert!(response.ok);

        let response = execute(&filter, None, ControlRequest::ReloadConfiguration).await;
        assert!(!response.ok, "reload without a config file must fail");

        let response = execute(
            &filter,
            None,
            ControlRequest::UpdateRules {
                source: Some("nope".into()),
            },
        )
        .await;
        assert!(!response.ok);
        filter.shutdown();
    }
}
