//! Exchange fee schedule
//!
//! A flat taker fee applied symmetrically on entry and exit, plus the
//! exchange's minimum order notional. Shared by the simulator and the live
//! bot so both size orders identically.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Fee and order-size rules of the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Fee as a fraction of notional (default 0.0005 = 0.05%)
    pub fee_rate: Decimal,
    /// Smallest accepted order notional in quote currency (default 5000)
    pub min_order: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            fee_rate: dec!(0.0005),
            min_order: dec!(5000),
        }
    }
}

/// A sized entry: what is spent and what is received
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFill {
    pub quantity: Decimal,
    pub fee: Decimal,
    /// Quote amount spent, fee included
    pub cost: Decimal,
}

/// A sized exit
#[derive(Debug, Clone, PartialEq)]
pub struct ExitFill {
    /// Quote amount received after the fee
    pub proceeds: Decimal,
    pub fee: Decimal,
    pub profit: Decimal,
    pub profit_pct: Decimal,
}

impl FeeSchedule {
    pub fn fee_on(&self, notional: Decimal) -> Decimal {
        if notional <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        notional * self.fee_rate
    }

    pub fn meets_minimum(&self, notional: Decimal) -> bool {
        notional >= self.min_order
    }

    /// Spend `invest` quote at `price`; the fee comes out of the invested amount.
    pub fn entry(&self, invest: Decimal, price: Decimal) -> Option<EntryFill> {
        if invest <= Decimal::ZERO || price <= Decimal::ZERO {
            return None;
        }
        let fee = self.fee_on(invest);
        Some(EntryFill {
            quantity: (invest - fee) / price,
            fee,
            cost: invest,
        })
    }

    /// Sell `quantity` at `price` against a position that cost `cost`.
    pub fn exit(&self, quantity: Decimal, price: Decimal, cost: Decimal) -> ExitFill {
        let gross = quantity * price;
        let fee = self.fee_on(gross);
        let proceeds = gross - fee;
        let profit = proceeds - cost;
        let profit_pct = if cost > Decimal::ZERO {
            profit / cost * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        ExitFill {
            proceeds,
            fee,
            profit,
            profit_pct,
        }
    }
}
