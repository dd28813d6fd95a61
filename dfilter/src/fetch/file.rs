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

//! The file rule fetcher: local path with a size cap, transparent
//! decompression, and an optional modification watch.

use super::{FetchError, ProgressSender, Result, RuleFetch};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::{
    io::Read,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// Fetches one file-based rule source.
pub struct FileFetcher {
    path: PathBuf,
    max_bytes: u64,
    cancelled: Arc<AtomicBool>,
}

impl FileFetcher {
    /// A fetcher reading `path` with a `max_bytes` cap.
    pub fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self {
            path,
            max_bytes,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn map_io(&self, e: std::io::Error) -> FetchError {
        match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::FileMissing(self.path.clone()),
            std::io::ErrorKind::PermissionDenied => FetchError::PermissionDenied(self.path.clone()),
            _ => FetchError::DataCorrupted(e.to_string()),
        }
    }

    /// Watch the file for modification-time changes, emitting on each one.
    /// The watch task ends when the receiver is dropped.
    pub fn watch_changes(&self, poll_every: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut last = tokio::fs::metadata(&path).await.ok().and_then(|m| m.modified().ok());
            loop {
                tokio::time::sleep(poll_every).await;
                let current = tokio::fs::metadata(&path)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok());
                if current != last {
                    last = current;
                    debug!("rule file {} changed", path.display());
                    if tx.send(()).await.is_err() {
                        return;
                    }
                }
            }
        });
        rx
    }
}

#[async_trait]
impl RuleFetch for FileFetcher {
    async fn fetch(&self, progress: Option<ProgressSender>) -> Result<Bytes> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            return Err(FetchError::Cancelled);
        }
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| self.map_io(e))?;
        if metadata.len() > self.max_bytes {
            return Err(FetchError::TooLarge {
                got: metadata.len(),
                cap: self.max_bytes,
            });
        }

        // niffler is synchronous; hand the (bounded) read to the blocking pool.
        let path = self.path.clone();
        let cap = self.max_bytes;
        let data = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<u8>, FetchError> {
            let (mut reader, _format) = niffler::from_path(&path)
                .map_err(|e| FetchError::DataCorrupted(e.to_string()))?;
            let mut data = Vec::new();
            reader
                .by_ref()
                .take(cap + 1)
                .read_to_end(&mut data)
                .map_err(|e| FetchError::DataCorrupted(e.to_string()))?;
            if data.len() as u64 > cap {
                return Err(FetchError::TooLarge {
                    got: data.len() as u64,
                    cap,
                });
            }
            Ok(data)
        })
        .await
        .map_err(|e| {
            warn!("file read task failed: {}", e);
            FetchError::Cancelled
        })??;

        if let Some(progress) = progress {
            let _ = progress.send(1.0);
        }
        Ok(Bytes::from(data))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn supports_resume(&self) -> bool {
        // Local reads restart cheaply.
        false
    }
}
