//! Strategy validator
//!
//! Static, side-effect-free checks run before a strategy is saved or run.
//! Collects every violation instead of stopping at the first one.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::registry::IndicatorKind;
use crate::strategy::{
    CompiledAction, CompiledCondition, CompiledOperand, CompiledStrategy, IndicatorSpec, Logic,
    Operand, Operator, OrderType, ResolvedIndicator, StrategyConfig,
};

/// One problem with a strategy config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Path of the offending field, e.g. `conditions[0].left.name`
    pub field: String,
    pub message: String,
}

impl Violation {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation in `config`; empty when it is well-formed
pub fn validate(config: &StrategyConfig) -> Vec<Violation> {
    match compile(config) {
        Ok(_) => Vec::new(),
        Err(violations) => violations,
    }
}

/// Validate and resolve `config` against the registry
pub fn compile(config: &StrategyConfig) -> Result<CompiledStrategy, Vec<Violation>> {
    let mut violations = Vec::new();

    if config.conditions.is_empty() {
        violations.push(Violation::new(
            "conditions",
            "at least one condition is required",
        ));
    }

    let mut conditions = Vec::with_capacity(config.conditions.len());
    for (i, cond) in config.conditions.iter().enumerate() {
        let base = format!("conditions[{i}]");
        let left = resolve_indicator(&cond.left, &format!("{base}.left"), &mut violations);

        let operator = match cond.operator.parse::<Operator>() {
            Ok(op) => Some(op),
            Err(_) => {
                violations.push(Violation::new(
                    format!("{base}.operator"),
                    format!(
                        "unknown operator '{}' (expected one of: {})",
                        cond.operator,
                        Operator::ALL
                            .iter()
                            .map(|o| o.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ));
                None
            }
        };

        let right = match &cond.right {
            Operand::Number(v) => {
                if v.is_finite() {
                    Some(CompiledOperand::Number(*v))
                } else {
                    violations.push(Violation::new(
                        format!("{base}.right"),
                        "literal must be a finite number",
                    ));
                    None
                }
            }
            Operand::Indicator(spec) => {
                resolve_indicator(spec, &format!("{base}.right"), &mut violations)
                    .map(CompiledOperand::Indicator)
            }
        };

        if let (Some(left), Some(operator), Some(right)) = (left, operator, right) {
            conditions.push(CompiledCondition {
                left,
                operator,
                right,
            });
        }
    }

    let logic = match config.logic.parse::<Logic>() {
        Ok(logic) => Some(logic),
        Err(_) => {
            violations.push(Violation::new(
                "logic",
                format!("unknown logic '{}' (expected and/or)", config.logic),
            ));
            None
        }
    };

    let order_type = match config.action.order_type.parse::<OrderType>() {
        Ok(t) => Some(t),
        Err(_) => {
            violations.push(Violation::new(
                "action.order_type",
                format!(
                    "unsupported order type '{}' (expected market_buy, limit_buy, market_sell or limit_sell)",
                    config.action.order_type
                ),
            ));
            None
        }
    };

    let amount = config.action.amount;
    if amount <= Decimal::ZERO || amount > Decimal::ONE_HUNDRED {
        violations.push(Violation::new(
            "action.amount",
            format!("amount must be in (0, 100], got {amount}"),
        ));
    }
    if let Some(offset) = config.action.limit_offset_pct {
        if offset < Decimal::ZERO || offset >= Decimal::ONE_HUNDRED {
            violations.push(Violation::new(
                "action.limit_offset_pct",
                format!("limit offset must be in [0, 100), got {offset}"),
            ));
        }
    }

    let safety = &config.safety;
    if safety.stop_loss > Decimal::ZERO {
        violations.push(Violation::new(
            "safety.stop_loss",
            format!("stop loss must be <= 0, got {}", safety.stop_loss),
        ));
    }
    if safety.stop_loss <= -Decimal::ONE_HUNDRED {
        violations.push(Violation::new(
            "safety.stop_loss",
            "stop loss must be above -100",
        ));
    }
    if safety.take_profit < Decimal::ZERO {
        violations.push(Violation::new(
            "safety.take_profit",
            format!("take profit must be >= 0, got {}", safety.take_profit),
        ));
    }
    if safety.max_position <= Decimal::ZERO || safety.max_position > Decimal::ONE_HUNDRED {
        violations.push(Violation::new(
            "safety.max_position",
            format!("max position must be in (0, 100], got {}", safety.max_position),
        ));
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    match (logic, order_type) {
        (Some(logic), Some(order_type)) => Ok(CompiledStrategy {
            conditions,
            logic,
            action: CompiledAction {
                order_type,
                amount,
                limit_offset_pct: config.action.limit_offset_pct.unwrap_or(Decimal::ZERO),
            },
            safety: safety.clone(),
        }),
        _ => Err(violations),
    }
}

fn resolve_indicator(
    spec: &IndicatorSpec,
    field: &str,
    violations: &mut Vec<Violation>,
) -> Option<ResolvedIndicator> {
    let Some(kind) = IndicatorKind::from_name(&spec.name) else {
        violations.push(Violation::new(
            format!("{field}.name"),
            format!("unknown indicator '{}'", spec.name),
        ));
        return None;
    };

    let before = violations.len();
    for (name, value) in &spec.params {
        if let Err(message) = kind.check_param(name, *value) {
            violations.push(Violation::new(format!("{field}.params.{name}"), message));
        }
    }

    let output = match (&spec.output, kind.is_multi_output()) {
        (None, _) => kind.default_output(),
        (Some(key), true) => match kind.outputs().iter().find(|o| **o == key.as_str()) {
            Some(found) => Some(*found),
            None => {
                violations.push(Violation::new(
                    format!("{field}.output"),
                    format!(
                        "unknown output '{}' for {} (expected one of: {})",
                        key,
                        kind.name(),
                        kind.outputs().join(", ")
                    ),
                ));
                None
            }
        },
        (Some(key), false) => {
            violations.push(Violation::new(
                format!("{field}.output"),
                format!("{} has a single output; '{}' is not valid", kind.name(), key),
            ));
            None
        }
    };

    if violations.len() > before {
        return None;
    }
    Some(ResolvedIndicator {
        kind,
        params: kind.resolve_params(&spec.params),
        output,
    })
}
