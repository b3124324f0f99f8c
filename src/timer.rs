// Copyright 2025 The dcSCTP Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::api::SocketTime;
use std::cmp::min;
use std::time::Duration;

/// Upper bound of any timer duration. Nothing in SCTP needs to wait longer than this.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 3600);

// Doubling more often than this would overflow long before reaching `MAX_DURATION` matters.
const MAX_BACKOFF_COUNT: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BackoffAlgorithm {
    /// Every expiry re-arms the timer with the base duration.
    Fixed,

    /// Every expiry doubles the duration, up to the max backoff duration.
    Exponential,
}

/// A timer driven by the owner calling [`Timer::expire`] with the current time.
///
/// The timer doesn't schedule anything by itself. The owner is expected to ask for
/// [`Timer::next_expiry`] and call `expire` at, or after, that time. An expired timer re-arms
/// itself with a duration given by its [`BackoffAlgorithm`], until it has been restarted
/// `max_restarts` times, after which it stays stopped.
pub struct Timer {
    name: &'static str,
    base_duration: Duration,
    backoff_algorithm: BackoffAlgorithm,
    max_restarts: Option<u32>,
    max_backoff_duration: Duration,
    expiration_count: u32,
    next_expiry: Option<SocketTime>,
}

impl Timer {
    pub fn new(
        name: &'static str,
        duration: Duration,
        backoff_algorithm: BackoffAlgorithm,
        max_restarts: Option<u32>,
        max_backoff_duration: Option<Duration>,
    ) -> Self {
        Self {
            name,
            base_duration: duration,
            backoff_algorithm,
            max_restarts,
            max_backoff_duration: max_backoff_duration
                .map_or(MAX_DURATION, |d| d.min(MAX_DURATION)),
            expiration_count: 0,
            next_expiry: None,
        }
    }

    /// The duration to wait until the next expiry, given how many times the timer has expired.
    fn current_duration(&self) -> Duration {
        let duration = match self.backoff_algorithm {
            BackoffAlgorithm::Fixed => self.base_duration,
            BackoffAlgorithm::Exponential => {
                let doublings = min(self.expiration_count, MAX_BACKOFF_COUNT);
                self.base_duration.saturating_mul(1 << doublings)
            }
        };
        min(duration, self.max_backoff_duration)
    }

    /// Starts the timer, or restarts it if it's already running. The expiration count is reset.
    pub fn start(&mut self, now: SocketTime) {
        self.expiration_count = 0;
        self.next_expiry = match self.base_duration.is_zero() {
            true => None,
            false => Some(now + self.current_duration()),
        };
    }

    pub fn stop(&mut self) {
        self.next_expiry = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_expiry.is_some()
    }

    pub fn next_expiry(&self) -> Option<SocketTime> {
        self.next_expiry
    }

    /// Returns true if the timer has expired at `now`, and re-arms it unless the restart limit has
    /// been reached. Re-arming is relative to the previous expiry time, not to `now`, so that a
    /// late call doesn't make the timer drift.
    pub fn expire(&mut self, now: SocketTime) -> bool {
        match self.next_expiry {
            Some(expiry) if expiry <= now => {
                let can_restart = self.max_restarts.is_none_or(|max| self.expiration_count < max);
                self.expiration_count = self.expiration_count.saturating_add(1);
                self.next_expiry = can_restart.then(|| expiry + self.current_duration());
                log::debug!(
                    "{} timer expired (count={}, restarting={})",
                    self.name,
                    self.expiration_count,
                    can_restart
                );
                true
            }
            _ => false,
        }
    }

    /// Number of times the timer has expired since it was last started.
    #[cfg(test)]
    pub fn expiration_count(&self) -> u32 {
        self.expiration_count
    }

    /// Sets the base duration, which will be used the next time the timer is started or re-armed.
    pub fn set_duration(&mut self, duration: Duration) {
        self.base_duration = duration;
    }
}
