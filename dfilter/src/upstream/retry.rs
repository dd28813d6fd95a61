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

//! Retry policy for transient upstream failures: capped exponential backoff
//! with jitter, and a per-transaction attempt history for diagnostics.

use super::UpstreamError;
use log::debug;
use rand::Rng;
use std::{collections::HashMap, sync::Mutex, time::Duration};

/// Why an attempt failed, for the retryable subset of failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// The upstream closed the exchange.
    PeerClosed,
    /// The per-query deadline elapsed.
    Timeout,
    /// A network-level send/receive error.
    NetworkError,
    /// The egress interface went away.
    InterfaceUnavailable,
}

impl RetryReason {
    /// Classify an upstream error; `None` means not retryable.
    pub fn from_error(error: &UpstreamError) -> Option<Self> {
        match error {
            UpstreamError::TimeError(_) => Some(RetryReason::Timeout),
            UpstreamError::PeerClosed => Some(RetryReason::PeerClosed),
            UpstreamError::IoError(e) => Some(match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => RetryReason::PeerClosed,
                std::io::ErrorKind::AddrNotAvailable | std::io::ErrorKind::NotConnected => {
                    RetryReason::InterfaceUnavailable
                }
                _ => RetryReason::NetworkError,
            }),
            UpstreamError::PoolRunError(_) => Some(RetryReason::NetworkError),
            _ => None,
        }
    }
}

/// One recorded attempt.
#[derive(Clone, Debug)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Why it is being retried.
    pub reason: RetryReason,
    /// Backoff applied before the retry.
    pub backoff: Duration,
    /// Resolver the failed attempt used.
    pub resolver: String,
}

/// Backoff policy plus the per-transaction history table.
pub struct RetryManager {
    max_retries: u32,
    initial_backoff: Duration,
    ceiling: Duration,
    jitter: f64,
    history: Mutex<HashMap<u16, Vec<RetryAttempt>>>,
}

impl RetryManager {
    /// Policy with `max_retries` attempts, exponential backoff from
    /// `initial_backoff` capped at `ceiling`, randomized by ±`jitter`.
    pub fn new(max_retries: u32, initial_backoff: Duration, ceiling: Duration, jitter: f64) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ceiling,
            jitter: jitter.clamp(0.0, 1.0),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Configured retry bound.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether `error` on attempt number `attempt` (1-based) warrants a
    /// retry.
    pub fn should_retry(&self, error: &UpstreamError, attempt: u32) -> Option<RetryReason> {
        if attempt > self.max_retries {
            return None;
        }
        RetryReason::from_error(error)
    }

    /// Backoff before retry number `attempt` (1-based):
    /// `min(initial × 2^(attempt−1), ceiling)` with jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.ceiling);
        if self.jitter == 0.0 {
            return capped;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped.as_secs_f64() * factor).max(0.0))
    }

    /// Record an attempt against its transaction for diagnostics.
    pub fn record_attempt(&self, txid: u16, attempt: RetryAttempt) {
        debug!(
            "txid {:#06x}: retry {} after {:?} ({:?} on {})",
            txid, attempt.attempt, attempt.backoff, attempt.reason, attempt.resolver
        );
        self.history
            .lock()
            .unwrap()
            .entry(txid)
            .or_default()
            .push(attempt);
    }

    /// The recorded attempts for a transaction.
    pub fn attempts(&self, txid: u16) -> Vec<RetryAttempt> {
        self.history
            .lock()
            .unwrap()
            .get(&txid)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a transaction's history on its terminal outcome.
    pub fn clear(&self, txid: u16) {
        self.history.lock().unwrap().remove(&txid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RetryManager {
        RetryManager::new(3, Duration::from_millis(100), Duration::from_secs(2), 0.0)
    }

    #[test]
    fn classification() {
        assert_eq!(
            RetryReason::from_error(&UpstreamError::PeerClosed),
            Some(RetryReason::PeerClosed)
        );
        let refused =
            UpstreamError::IoError(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(
            RetryReason::from_error(&refused),
            Some(RetryReason::PeerClosed)
        );
        assert_eq!(RetryReason::from_error(&UpstreamError::NoUpstreams), None);
    }

    #[test]
    fn retry_count_is_bounded() {
        let mgr = manager();
        let timeout_err = || {
            // Manufacture an Elapsed through a zero-duration timeout.
            tokio_test::block_on(async {
                tokio::time::timeout(Duration::ZERO, std::future::pending::<()>())
                    .await
                    .unwrap_err()
            })
        };
        for attempt in 1..=3 {
            assert!(
                mgr.should_retry(&UpstreamError::TimeError(timeout_err()), attempt)
                    .is_some(),
                "attempt {} should retry",
                attempt
            );
        }
        assert!(mgr
            .should_retry(&UpstreamError::TimeError(timeout_err()), 4)
            .is_none());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mgr = manager();
        assert_eq!(mgr.backoff(1), Duration::from_millis(100));
        assert_eq!(mgr.backoff(2), Duration::from_millis(200));
        assert_eq!(mgr.backoff(3), Duration::from_millis(400));
        assert_eq!(mgr.backoff(6), Duration::from_secs(2));
        assert_eq!(mgr.backoff(30), Duration::from_secs(2));
    }

    #[test]
    fn jittered_backoff_stays_in_band() {
        let mgr = RetryManager::new(3, Duration::from_millis(100), Duration::from_secs(2), 0.25);
        for _ in 0..100 {
            let d = mgr.backoff(2);
            assert!(d >= Duration::from_millis(150));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[test]
    fn history_lifecycle() {
        let mgr = manager();
        mgr.record_attempt(
            7,
            RetryAttempt {
                attempt: 1,
                reason: RetryReason::Timeout,
                backoff: Duration::from_millis(100),
                resolver: "9.9.9.9:53".into(),
            },
        );
        assert_eq!(mgr.attempts(7).len(), 1);
        assert!(mgr.attempts(8).is_empty());
        mgr.clear(7);
        assert!(mgr.attempts(7).is_empty());
    }
}
