//! Condition evaluator
//!
//! Turns a compiled strategy into a boolean signal series aligned with the
//! candles. An operand that is still warming up never fires.

use std::collections::HashMap;

use crate::indicators::Series;
use crate::strategy::{CompiledCondition, CompiledOperand, CompiledStrategy, Logic, Operator};
use crate::types::Candle;

const EQUAL_TOLERANCE: f64 = 1e-9;

/// True at i when `a` moves from at-or-below `b` to strictly above it
pub fn crosses_above(a: &[Option<f64>], b: &[Option<f64>]) -> Vec<bool> {
    crossing(a, b, |prev_a, prev_b, a, b| prev_a <= prev_b && a > b)
}

/// True at i when `a` moves from at-or-above `b` to strictly below it
pub fn crosses_below(a: &[Option<f64>], b: &[Option<f64>]) -> Vec<bool> {
    crossing(a, b, |prev_a, prev_b, a, b| prev_a >= prev_b && a < b)
}

fn crossing(
    a: &[Option<f64>],
    b: &[Option<f64>],
    test: impl Fn(f64, f64, f64, f64) -> bool,
) -> Vec<bool> {
    let n = a.len().min(b.len());
    (0..n)
        .map(|i| {
            if i == 0 {
                return false;
            }
            match (a[i - 1], b[i - 1], a[i], b[i]) {
                (Some(pa), Some(pb), Some(ca), Some(cb)) => test(pa, pb, ca, cb),
                _ => false,
            }
        })
        .collect()
}

fn compare(op: Operator, a: &[Option<f64>], b: &[Option<f64>]) -> Vec<bool> {
    match op {
        Operator::CrossesAbove => crosses_above(a, b),
        Operator::CrossesBelow => crosses_below(a, b),
        _ => a
            .iter()
            .zip(b)
            .map(|pair| match pair {
                (Some(x), Some(y)) => match op {
                    Operator::GreaterThan => x > y,
                    Operator::LessThan => x < y,
                    Operator::GreaterEqual => x >= y,
                    Operator::LessEqual => x <= y,
                    Operator::Equal => (x - y).abs() <= EQUAL_TOLERANCE,
                    Operator::CrossesAbove | Operator::CrossesBelow => false,
                },
                _ => false,
            })
            .collect(),
    }
}

/// Evaluates conditions over one candle window, computing each distinct
/// indicator at most once.
pub struct Evaluator<'a> {
    candles: &'a [Candle],
    memo: HashMap<String, Series>,
}

impl<'a> Evaluator<'a> {
    pub fn new(candles: &'a [Candle]) -> Self {
        Self {
            candles,
            memo: HashMap::new(),
        }
    }

    fn operand(&mut self, operand: &CompiledOperand) -> Series {
        match operand {
            CompiledOperand::Number(v) => vec![Some(*v); self.candles.len()],
            CompiledOperand::Indicator(ind) => {
                let candles = self.candles;
                self.memo
                    .entry(ind.cache_key())
                    .or_insert_with(|| ind.compute(candles))
                    .clone()
            }
        }
    }

    pub fn condition(&mut self, cond: &CompiledCondition) -> Vec<bool> {
        let left = self.operand(&CompiledOperand::Indicator(cond.left.clone()));
        let right = self.operand(&cond.right);
        compare(cond.operator, &left, &right)
    }

    /// Combined signal for every bar
    pub fn signals(&mut self, strategy: &CompiledStrategy) -> Vec<bool> {
        let n = self.candles.len();
        if strategy.conditions.is_empty() {
            return vec![false; n];
        }
        let mut combined = match strategy.logic {
            Logic::And => vec![true; n],
            Logic::Or => vec![false; n],
        };
        for cond in &strategy.conditions {
            let series = self.condition(cond);
            for (acc, v) in combined.iter_mut().zip(series) {
                *acc = match strategy.logic {
                    Logic::And => *acc && v,
                    Logic::Or => *acc || v,
                };
            }
        }
        combined
    }
}

/// Signal series for a strategy over `candles`
pub fn signal_series(strategy: &CompiledStrategy, candles: &[Candle]) -> Vec<bool> {
    Evaluator::new(candles).signals(strategy)
}

/// Signal on the most recent bar, as read by the live engine
pub fn last_signal(strategy: &CompiledStrategy, candles: &[Candle]) -> bool {
    signal_series(strategy, candles)
        .last()
        .copied()
        .unwrap_or(false)
}
