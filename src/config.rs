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

//! Application configuration.
//!
//! Loaded from YAML. Every field has a default, so a partial file, an empty
//! file or no file at all yields a working configuration:
//!
//! ```yaml
//! log:
//!   level: debug
//!   json: false
//! store:
//!   lock_timeout_ms: 5000
//!   commit_delay_ms: 0
//! transfer:
//!   default_timeout_ms: 30000
//! order:
//!   saga_step_timeout_ms: 10000
//!   checkout_timeout_ms: 30000
//! stock:
//!   max_attempts: 3
//!   backoff: linear        # or exponential_jitter
//!   step_ms: 50
//!   max_backoff_ms: 1000
//! harness:
//!   initial_balance_a_minor: 1000000
//!   initial_balance_b_minor: 1000000
//!   max_amount_minor: 10000
//!   min_timeout_ms: 500
//!   max_timeout_ms: 1000
//! ```

use crate::amount::Amount;
use crate::checkout::OrderProcessor;
use crate::harness::HarnessConfig;
use crate::saga::OrderSaga;
use crate::stock::{Backoff, RetryPolicy};
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub store: StoreSection,
    pub transfer: TransferSection,
    pub order: OrderSection,
    pub stock: StockSection,
    pub harness: HarnessSection,
}

impl AppConfig {
    /// Reads and parses a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub lock_timeout_ms: u64,
    pub commit_delay_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        let defaults = StoreConfig::default();
        Self {
            lock_timeout_ms: millis(defaults.lock_timeout),
            commit_delay_ms: millis(defaults.commit_delay),
        }
    }
}

impl StoreSection {
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            commit_delay: Duration::from_millis(self.commit_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub default_timeout_ms: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

impl TransferSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderSection {
    /// Bounds each saga step and each compensation.
    pub saga_step_timeout_ms: u64,
    /// Bounds the whole single-transaction checkout.
    pub checkout_timeout_ms: u64,
}

impl Default for OrderSection {
    fn default() -> Self {
        Self {
            saga_step_timeout_ms: millis(OrderSaga::DEFAULT_STEP_TIMEOUT),
            checkout_timeout_ms: millis(OrderProcessor::DEFAULT_TIMEOUT),
        }
    }
}

impl OrderSection {
    pub fn saga_step_timeout(&self) -> Duration {
        Duration::from_millis(self.saga_step_timeout_ms)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Linear,
    ExponentialJitter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockSection {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    /// Linear step, or exponential base.
    pub step_ms: u64,
    /// Exponential cap; unused for linear backoff.
    pub max_backoff_ms: u64,
}

impl Default for StockSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Linear,
            step_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

impl StockSection {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        let step = Duration::from_millis(self.step_ms);
        let backoff = match self.backoff {
            BackoffKind::Linear => Backoff::Linear { step },
            BackoffKind::ExponentialJitter => Backoff::ExponentialJitter {
                base: step,
                max: Duration::from_millis(self.max_backoff_ms),
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff,
        }
    }
}

/// Amounts are integer minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSection {
    pub initial_balance_a_minor: i64,
    pub initial_balance_b_minor: i64,
    pub max_amount_minor: i64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for HarnessSection {
    fn default() -> Self {
        Self {
            initial_balance_a_minor: 1_000_000,
            initial_balance_b_minor: 1_000_000,
            max_amount_minor: 10_000,
            min_timeout_ms: 500,
            max_timeout_ms: 1_000,
        }
    }
}

impl HarnessSection {
    pub fn to_harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            initial_balance_a: Amount::from_minor(self.initial_balance_a_minor),
            initial_balance_b: Amount::from_minor(self.initial_balance_b_minor),
            max_amount: Amount::from_minor(self.max_amount_minor),
            min_timeout: Duration::from_millis(self.min_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
