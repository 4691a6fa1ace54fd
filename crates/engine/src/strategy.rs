//! Declarative strategy model
//!
//! `StrategyConfig` is the user-authored, serde-facing form. Operator, logic
//! and order type stay as raw strings there so that unknown values surface
//! as validation violations rather than parse failures. `CompiledStrategy`
//! is the typed form produced by the validator, with every indicator
//! resolved against the registry once.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::indicators::Series;
use crate::registry::{IndicatorKind, ResolvedParams};
use crate::types::Candle;

// ============================================================================
// User-facing config
// ============================================================================

/// Reference to one indicator with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    /// Output key for multi-output indicators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl IndicatorSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: BTreeMap::new(),
            output: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: f64) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }
}

/// Right-hand side of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Number(f64),
    Indicator(IndicatorSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub left: IndicatorSpec,
    pub operator: String,
    pub right: Operand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub order_type: String,
    /// Percent of capital to commit, 0 < amount <= 100
    pub amount: Decimal,
    /// Distance from the last close for limit orders, in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_offset_pct: Option<Decimal>,
}

fn default_max_position() -> Decimal {
    dec!(100)
}

/// Exit thresholds and position cap. A zero threshold is disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Safety {
    /// Percent, <= 0
    #[serde(default)]
    pub stop_loss: Decimal,
    /// Percent, >= 0
    #[serde(default)]
    pub take_profit: Decimal,
    /// Percent of capital a single position may use
    #[serde(default = "default_max_position")]
    pub max_position: Decimal,
}

impl Default for Safety {
    fn default() -> Self {
        Self {
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            max_position: default_max_position(),
        }
    }
}

fn default_logic() -> String {
    "and".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub conditions: Vec<Condition>,
    #[serde(default = "default_logic")]
    pub logic: String,
    pub action: Action,
    #[serde(default)]
    pub safety: Safety,
}

// ============================================================================
// Typed vocabulary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    GreaterThan,
    LessThan,
    Equal,
    GreaterEqual,
    LessEqual,
    CrossesAbove,
    CrossesBelow,
}

impl Operator {
    pub const ALL: [Operator; 7] = [
        Operator::GreaterThan,
        Operator::LessThan,
        Operator::Equal,
        Operator::GreaterEqual,
        Operator::LessEqual,
        Operator::CrossesAbove,
        Operator::CrossesBelow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::Equal => "equal",
            Self::GreaterEqual => "greater_equal",
            Self::LessEqual => "less_equal",
            Self::CrossesAbove => "crosses_above",
            Self::CrossesBelow => "crosses_below",
        }
    }

    pub fn is_crossing(&self) -> bool {
        matches!(self, Self::CrossesAbove | Self::CrossesBelow)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == lower)
            .ok_or_else(|| format!("unknown operator: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

impl FromStr for Logic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            _ => Err(format!("unknown logic: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    MarketBuy,
    LimitBuy,
    MarketSell,
    LimitSell,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketBuy => "market_buy",
            Self::LimitBuy => "limit_buy",
            Self::MarketSell => "market_sell",
            Self::LimitSell => "limit_sell",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::MarketBuy | Self::LimitBuy)
    }

    pub fn is_limit(&self) -> bool {
        matches!(self, Self::LimitBuy | Self::LimitSell)
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "market_buy" => Ok(Self::MarketBuy),
            "limit_buy" => Ok(Self::LimitBuy),
            "market_sell" => Ok(Self::MarketSell),
            "limit_sell" => Ok(Self::LimitSell),
            _ => Err(format!("unknown order type: {s}")),
        }
    }
}

// ============================================================================
// Compiled form
// ============================================================================

/// An indicator spec resolved against the registry
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIndicator {
    pub kind: IndicatorKind,
    pub params: ResolvedParams,
    pub output: Option<&'static str>,
}

impl ResolvedIndicator {
    pub fn compute(&self, candles: &[Candle]) -> Series {
        self.kind
            .compute(candles, &self.params)
            .into_series(self.output.unwrap_or_default())
            .unwrap_or_else(|| vec![None; candles.len()])
    }

    pub fn warmup(&self) -> usize {
        self.kind.warmup(&self.params, self.output)
    }

    /// Identity of the computed series, used for memoisation
    pub fn cache_key(&self) -> String {
        format!(
            "{}({})/{}",
            self.kind.name(),
            self.params.key(),
            self.output.unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledOperand {
    Number(f64),
    Indicator(ResolvedIndicator),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    pub left: ResolvedIndicator,
    pub operator: Operator,
    pub right: CompiledOperand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledAction {
    pub order_type: OrderType,
    pub amount: Decimal,
    pub limit_offset_pct: Decimal,
}

/// A validated strategy, ready for the evaluator
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStrategy {
    pub conditions: Vec<CompiledCondition>,
    pub logic: Logic,
    pub action: CompiledAction,
    pub safety: Safety,
}

impl CompiledStrategy {
    /// Longest warm-up across every indicator the strategy references
    pub fn warmup(&self) -> usize {
        self.conditions
            .iter()
            .flat_map(|c| {
                let right = match &c.right {
                    CompiledOperand::Indicator(ind) => ind.warmup(),
                    CompiledOperand::Number(_) => 0,
                };
                // A crossing also reads the previous bar.
                let extra = usize::from(c.operator.is_crossing());
                [c.left.warmup() + extra, right + extra]
            })
            .max()
            .unwrap_or(0)
    }

    /// Bars needed before a backtest says anything
    pub fn required_bars(&self) -> usize {
        (self.warmup() + 1).max(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_config_parses_from_json() {
        let json = r#"{
            "conditions": [
                {"left": {"name": "rsi", "params": {"period": 14}}, "operator": "less_than", "right": 30},
                {"left": {"name": "price"}, "operator": "crosses_above",
                 "right": {"name": "sma", "params": {"period": 20}}}
            ],
            "logic": "or",
            "action": {"order_type": "market_buy", "amount": 50},
            "safety": {"stop_loss": -5, "take_profit": 10}
        }"#;
        let config: StrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.conditions.len(), 2);
        assert_eq!(config.conditions[0].right, Operand::Number(30.0));
        assert!(matches!(
            config.conditions[1].right,
            Operand::Indicator(ref spec) if spec.name == "sma"
        ));
        assert_eq!(config.action.amount, dec!(50));
        assert_eq!(config.safety.max_position, dec!(100));
    }

    #[test]
    fn test_logic_defaults_to_and() {
        let json = r#"{
            "conditions": [],
            "action": {"order_type": "market_buy", "amount": 10}
        }"#;
        let config: StrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.logic.parse::<Logic>().unwrap(), Logic::And);
        assert_eq!(config.safety, Safety::default());
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!(
            "crosses_above".parse::<Operator>().unwrap(),
            Operator::CrossesAbove
        );
        assert_eq!("EQUAL".parse::<Operator>().unwrap(), Operator::Equal);
        assert!("between".parse::<Operator>().is_err());
    }

    #[test]
    fn test_order_type_sides() {
        assert!(OrderType::LimitBuy.is_buy());
        assert!(OrderType::LimitBuy.is_limit());
        assert!(!OrderType::MarketSell.is_buy());
        assert!("stop_market".parse::<OrderType>().is_err());
    }
}
