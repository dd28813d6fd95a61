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

//! Update timing strategies as pure next-fire/outcome logic.
//!
//! Interval and Adaptive reason in monotonic durations; Scheduled reasons in
//! wall-clock time on purpose (a 02:00 update means 02:00 even across DST).

use chrono::{DateTime, Datelike, Local, NaiveTime, TimeZone, Weekday};
use rand::Rng;
use std::time::{Duration, Instant};

/// How one rule source decides when to refresh.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateStrategy {
    /// Every `every`, randomized by ±`jitter_percent`.
    Interval {
        /// Base period.
        every: Duration,
        /// Jitter fraction in `0..=1`.
        jitter_percent: f64,
    },
    /// At fixed wall-clock times, optionally restricted to weekdays.
    Scheduled {
        /// Times of day to fire.
        times: Vec<NaiveTime>,
        /// Days the schedule applies to; `None` means every day.
        days: Option<Vec<Weekday>>,
    },
    /// Never auto-fires; manual triggers are rate-limited.
    Manual {
        /// Minimum spacing between manual triggers.
        minimum_interval: Duration,
    },
    /// Interval that expands on success and contracts on failure.
    Adaptive {
        /// Starting interval.
        base: Duration,
        /// Lower clamp.
        min: Duration,
        /// Upper clamp.
        max: Duration,
        /// Interval multiplier applied on success.
        success_multiplier: f64,
        /// Interval multiplier applied on failure.
        failure_multiplier: f64,
    },
}

/// Mutable per-source strategy state.
#[derive(Clone, Debug)]
pub struct StrategyState {
    /// Adaptive's current interval; unused by other strategies.
    pub current_interval: Duration,
    /// Consecutive successful updates.
    pub consecutive_successes: u32,
    /// Consecutive failed updates.
    pub consecutive_failures: u32,
    /// Last accepted manual trigger.
    pub last_manual_trigger: Option<Instant>,
}

impl UpdateStrategy {
    /// Fresh state for this strategy.
    pub fn initial_state(&self) -> StrategyState {
        StrategyState {
            current_interval: match self {
                UpdateStrategy::Adaptive { base, .. } => *base,
                UpdateStrategy::Interval { every, .. } => *every,
                _ => Duration::ZERO,
            },
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_manual_trigger: None,
        }
    }

    /// Delay until the next automatic fire, or `None` for strategies that
    /// never fire on their own. `now` only matters to `Scheduled`.
    pub fn next_fire(&self, state: &StrategyState, now: DateTime<Local>) -> Option<Duration> {
        match self {
            UpdateStrategy::Interval {
                every,
                jitter_percent,
            } => Some(apply_jitter(*every, *jitter_percent)),
            UpdateStrategy::Adaptive { .. } => Some(state.current_interval),
            UpdateStrategy::Manual { .. } => None,
            UpdateStrategy::Scheduled { times, days } => {
                next_scheduled(times, days.as_deref(), now).map(|at| {
                    (at - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
            }
        }
    }

    /// Feed an update outcome back; only Adaptive changes its interval.
    pub fn record_outcome(&self, state: &mut StrategyState, success: bool) {
        if success {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
        }
        if let UpdateStrategy::Adaptive {
            min,
            max,
            success_multiplier,
            failure_multiplier,
            ..
        } = self
        {
            let factor = if success {
                *success_multiplier
            } else {
                *failure_multiplier
            };
            let next = state.current_interval.as_secs_f64() * factor;
            state.current_interval = Duration::from_secs_f64(
                next.clamp(min.as_secs_f64(), max.as_secs_f64()),
            );
        }
    }

    /// Whether a manual trigger is allowed now; records it when accepted.
    pub fn try_manual_trigger(&self, state: &mut StrategyState, now: Instant) -> bool {
        if let UpdateStrategy::Manual { minimum_interval } = self {
            if let Some(last) = state.last_manual_trigger {
                if now.saturating_duration_since(last) < *minimum_interval {
                    return false;
                }
            }
        }
        state.last_manual_trigger = Some(now);
        true
    }
}

fn apply_jitter(base: Duration, jitter_percent: f64) -> Duration {
    let jitter = jitter_percent.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

// The soonest wall-clock instant at one of `times` on an allowed day,
// strictly after `now`.
fn next_scheduled(
    times: &[NaiveTime],
    days: Option<&[Weekday]>,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    if times.is_empty() {
        return None;
    }
    let mut best: Option<DateTime<Local>> = None;
    for offset in 0..=7i64 {
        let date = now.date_naive() + chrono::Duration::days(offset);
        if let Some(days) = days {
            if !days.contains(&date.weekday()) {
                continue;
            }
        }
        for time in times {
            let naive = date.and_time(*time);
            let Some(candidate) = Local.from_local_datetime(&naive).earliest() else {
                continue;
            };
            if candidate > now && best.map_or(true, |b| candidate < b) {
                best = Some(candidate);
            }
        }
        if best.is_some() {
            break;
        }
    }
    best
}
