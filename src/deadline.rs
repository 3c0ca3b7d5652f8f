// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cancellable deadlines.
//!
//! A [`Deadline`] bounds every blocking step of a unit of work: row-lock waits
//! and the commit. Clones share one cancellation flag, so a caller can hand a
//! clone to a worker and abort it from outside.

use crate::error::{EngineError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// Longest single sleep while waiting, so cancellation is observed promptly.
    pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

    /// A deadline that never expires (it can still be cancelled).
    pub fn none() -> Self {
        Self {
            expires_at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            expires_at: Some(instant),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancels this deadline and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Returns [`EngineError::Timeout`] once cancelled or expired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Timeout("operation cancelled".into()));
        }
        if self.is_expired() {
            return Err(EngineError::Timeout("deadline exceeded".into()));
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early with a timeout if the deadline fires.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            self.check()?;
            let left = duration.saturating_sub(started.elapsed());
            if left.is_zero() {
                return Ok(());
            }
            let mut slice = left.min(Self::POLL_INTERVAL);
            if let Some(remaining) = self.remaining() {
                slice = slice.min(remaining);
            }
            thread::sleep(slice);
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}
