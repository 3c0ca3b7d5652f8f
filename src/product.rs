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

//! Product rows and the stock invariant `0 <= reserved <= stock`.

use crate::amount::Amount;
use crate::base::ProductId;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Stock keeping unit, unique across the store.
    pub sku: String,
    pub price: Amount,
    pub stock: u32,
    /// Units held by in-flight orders; never exceeds `stock`.
    pub reserved: u32,
    pub version: u64,
}

impl Product {
    pub fn new(
        id: ProductId,
        name: impl Into<String>,
        sku: impl Into<String>,
        price: Amount,
        stock: u32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            sku: sku.into(),
            price,
            stock,
            reserved: 0,
            version: 1,
        }
    }

    /// Units that can still be sold or reserved.
    pub fn available(&self) -> u32 {
        self.stock - self.reserved
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.reserved <= self.stock,
            "Invariant violated: product {} reserves {} of {} units",
            self.id,
            self.reserved,
            self.stock
        );
    }

    /// Holds `quantity` units for an order.
    pub(crate) fn reserve(&mut self, quantity: u32) -> Result<()> {
        if self.available() < quantity {
            return Err(EngineError::InsufficientStock);
        }
        self.reserved += quantity;
        self.version += 1;
        self.assert_invariants();
        Ok(())
    }

    /// Returns previously reserved units. Releasing more than is reserved
    /// clamps at zero so a repeated compensation is harmless.
    pub(crate) fn release(&mut self, quantity: u32) {
        self.reserved = self.reserved.saturating_sub(quantity);
        self.version += 1;
        self.assert_invariants();
    }

    /// Removes `quantity` units from unreserved stock.
    pub(crate) fn decrement(&mut self, quantity: u32) -> Result<()> {
        if self.available() < quantity {
            return Err(EngineError::InsufficientStock);
        }
        self.stock -= quantity;
        self.version += 1;
        self.assert_invariants();
        Ok(())
    }

    pub(crate) fn restock(&mut self, quantity: u32) -> Result<()> {
        self.stock = self
            .stock
            .checked_add(quantity)
            .ok_or_else(|| EngineError::Validation("stock overflow".into()))?;
        self.version += 1;
        Ok(())
    }
}
