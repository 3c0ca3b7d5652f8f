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

//! Optimistic stock updates.
//!
//! [`StockService`] never holds a row lock across its read-modify-write gap.
//! It reads a product, decides, and writes back with a compare-and-swap on
//! the version it read. A lost race costs a retry instead of blocking.

use crate::amount::Amount;
use crate::base::ProductId;
use crate::error::{EngineError, Result};
use crate::product::Product;
use crate::store::Store;
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between compare-and-swap attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `attempt × step`.
    Linear { step: Duration },
    /// Uniformly random in `[0, min(base × 2^(attempt-1), max)]`.
    ExponentialJitter { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::ExponentialJitter { base, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                let cap = base.saturating_mul(factor).min(max);
                let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_millis(50),
            },
        }
    }
}

/// Result of a successful stock change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockUpdate {
    pub product: Product,
    /// Compare-and-swap attempts used, including the successful one.
    pub attempts: u32,
}

pub struct StockService {
    store: Arc<Store>,
    policy: RetryPolicy,
}

impl StockService {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: Arc<Store>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// # Errors
    ///
    /// See [`Store::create_product`].
    pub fn add_product(&self, name: &str, sku: &str, price: Amount, stock: u32) -> Result<Product> {
        self.store.create_product(name, sku, price, stock)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn get_product(&self, id: ProductId) -> Result<Product> {
        self.store
            .product(id)
            .ok_or_else(|| EngineError::not_found("product", id))
    }

    /// Removes `quantity` units from available stock.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] - zero quantity.
    /// - [`EngineError::NotFound`] - unknown product.
    /// - [`EngineError::InsufficientStock`] - fewer than `quantity` units
    ///   available; never retried.
    /// - [`EngineError::Conflict`] - every attempt lost its race.
    pub fn update_stock(&self, id: ProductId, quantity: u32) -> Result<StockUpdate> {
        if quantity == 0 {
            return Err(EngineError::Validation("quantity must be positive".into()));
        }
        self.retry_cas(id, "decrement", |product| product.decrement(quantity))
    }

    /// Adds `quantity` units of stock.
    ///
    /// # Errors
    ///
    /// Same as [`StockService::update_stock`], except it cannot run short.
    pub fn restock(&self, id: ProductId, quantity: u32) -> Result<StockUpdate> {
        if quantity == 0 {
            return Err(EngineError::Validation("quantity must be positive".into()));
        }
        self.retry_cas(id, "restock", |product| product.restock(quantity))
    }

    fn retry_cas<F>(&self, id: ProductId, operation: &str, change: F) -> Result<StockUpdate>
    where
        F: Fn(&mut Product) -> Result<()>,
    {
        let products = self.store.products();
        for attempt in 1..=self.policy.max_attempts {
            let snapshot = self.get_product(id)?;
            // Business-rule failures surface here, before any write, and are final.
            let mut preview = snapshot.clone();
            change(&mut preview)?;

            if self
                .store
                .compare_and_swap(products, id, snapshot.version, &change)?
            {
                let product = self.get_product(id)?;
                info!(product = %id, operation, attempt, stock = product.stock, "stock updated");
                return Ok(StockUpdate {
                    product,
                    attempts: attempt,
                });
            }

            debug!(product = %id, operation, attempt, "version changed underneath, retrying");
            if attempt < self.policy.max_attempts {
                thread::sleep(self.policy.backoff.delay(attempt));
            }
        }

        warn!(product = %id, operation, attempts = self.policy.max_attempts, "stock update gave up");
        Err(EngineError::Conflict("too many concurrent updates".into()))
    }
}
