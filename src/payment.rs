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

//! Payment gateway boundary.
//!
//! Charging a customer is an external call. The order workflows reach it
//! only through [`PaymentGateway`], so a real processor, the always-approving
//! [`SimulatedGateway`] or a failing double can be injected.

use crate::order::Order;

pub trait PaymentGateway: Send + Sync {
    /// Charges the order total. `Err` carries the decline reason.
    fn charge(&self, order: &Order) -> std::result::Result<(), String>;

    /// Payment method recorded on the payment row.
    fn method(&self) -> &str {
        "card"
    }
}

/// Approves every charge.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedGateway;

impl PaymentGateway for SimulatedGateway {
    fn charge(&self, _order: &Order) -> std::result::Result<(), String> {
        Ok(())
    }

    fn method(&self) -> &str {
        "simulated"
    }
}

/// Declines every charge with a fixed reason.
#[derive(Debug, Clone)]
pub struct DecliningGateway {
    reason: String,
}

impl DecliningGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl PaymentGateway for DecliningGateway {
    fn charge(&self, _order: &Order) -> std::result::Result<(), String> {
        Err(self.reason.clone())
    }
}
