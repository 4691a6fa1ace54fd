//! Indicator registry
//!
//! Closed catalogue of every indicator a strategy may reference: stable
//! name, accepted parameters with defaults and ranges, required input
//! channels and output keys. Both the validator and the evaluator resolve
//! indicator specs through this table.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::indicators::{self, Series};
use crate::types::Candle;

/// Candle channel an indicator reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Open,
    High,
    Low,
    Close,
    Volume,
}

/// Indicator family, used for catalogue grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Trend,
    Momentum,
    Volatility,
    Volume,
    Price,
}

/// An accepted parameter with its default and inclusive range
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub integer: bool,
}

const fn period(name: &'static str, default: f64) -> ParamSpec {
    ParamSpec {
        name,
        default,
        min: 1.0,
        max: 500.0,
        integer: true,
    }
}

const fn factor(name: &'static str, default: f64, min: f64, max: f64) -> ParamSpec {
    ParamSpec {
        name,
        default,
        min,
        max,
        integer: false,
    }
}

use Channel::{Close, High, Low, Open, Volume};

const HLC: &[Channel] = &[High, Low, Close];
const HLCV: &[Channel] = &[High, Low, Close, Volume];

const PERIOD_1: &[ParamSpec] = &[period("period", 1.0)];
const PERIOD_14: &[ParamSpec] = &[period("period", 14.0)];
const PERIOD_20: &[ParamSpec] = &[period("period", 20.0)];
const MACD_PARAMS: &[ParamSpec] = &[
    period("fast", 12.0),
    period("slow", 26.0),
    period("signal", 9.0),
];
const ICHIMOKU_PARAMS: &[ParamSpec] = &[
    period("tenkan", 9.0),
    period("kijun", 26.0),
    period("senkou_b", 52.0),
    period("displacement", 26.0),
];
const STOCHASTIC_PARAMS: &[ParamSpec] = &[period("k_period", 14.0), period("d_period", 3.0)];
const BOLLINGER_PARAMS: &[ParamSpec] = &[
    period("period", 20.0),
    factor("std_dev", 2.0, 0.1, 10.0),
];
const KELTNER_PARAMS: &[ParamSpec] = &[
    period("period", 20.0),
    factor("multiplier", 2.0, 0.1, 10.0),
];
const BREAKOUT_PARAMS: &[ParamSpec] = &[factor("k", 0.5, 0.0, 5.0)];
// 0 means cumulative from the first bar
const VWAP_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "period",
    default: 0.0,
    min: 0.0,
    max: 500.0,
    integer: true,
}];

/// Every supported indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Sma,
    Ema,
    Wma,
    Macd,
    Ichimoku,
    Rsi,
    Stochastic,
    Cci,
    WilliamsR,
    Mfi,
    Bollinger,
    Atr,
    Keltner,
    VolatilityBreakout,
    Obv,
    Vwap,
    VolumeSpike,
    VolumeMa,
    PriceChange,
    HighestHigh,
    LowestLow,
    PivotPoints,
    Price,
}

/// Computed indicator values
pub enum IndicatorOutput {
    Single(Series),
    Multi(BTreeMap<&'static str, Series>),
}

impl IndicatorOutput {
    /// Select the series for `output` (ignored for single-output indicators)
    pub fn into_series(self, output: &str) -> Option<Series> {
        match self {
            Self::Single(series) => Some(series),
            Self::Multi(mut map) => map.remove(output),
        }
    }
}

impl IndicatorKind {
    pub fn all() -> &'static [IndicatorKind] {
        use IndicatorKind::*;
        &[
            Sma,
            Ema,
            Wma,
            Macd,
            Ichimoku,
            Rsi,
            Stochastic,
            Cci,
            WilliamsR,
            Mfi,
            Bollinger,
            Atr,
            Keltner,
            VolatilityBreakout,
            Obv,
            Vwap,
            VolumeSpike,
            VolumeMa,
            PriceChange,
            HighestHigh,
            LowestLow,
            PivotPoints,
            Price,
        ]
    }

    /// Stable name used in strategy configs
    pub fn name(&self) -> &'static str {
        use IndicatorKind::*;
        match self {
            Sma => "sma",
            Ema => "ema",
            Wma => "wma",
            Macd => "macd",
            Ichimoku => "ichimoku",
            Rsi => "rsi",
            Stochastic => "stochastic",
            Cci => "cci",
            WilliamsR => "williams_r",
            Mfi => "mfi",
            Bollinger => "bollinger",
            Atr => "atr",
            Keltner => "keltner",
            VolatilityBreakout => "volatility_breakout",
            Obv => "obv",
            Vwap => "vwap",
            VolumeSpike => "volume_spike",
            VolumeMa => "volume_ma",
            PriceChange => "price_change",
            HighestHigh => "highest_high",
            LowestLow => "lowest_low",
            PivotPoints => "pivot_points",
            Price => "price",
        }
    }

    /// Case-insensitive lookup by name
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        Self::all().iter().copied().find(|k| k.name() == lower)
    }

    pub fn category(&self) -> Category {
        use IndicatorKind::*;
        match self {
            Sma | Ema | Wma | Macd | Ichimoku => Category::Trend,
            Rsi | Stochastic | Cci | WilliamsR | Mfi => Category::Momentum,
            Bollinger | Atr | Keltner | VolatilityBreakout => Category::Volatility,
            Obv | Vwap | VolumeSpike | VolumeMa => Category::Volume,
            PriceChange | HighestHigh | LowestLow | PivotPoints | Price => Category::Price,
        }
    }

    pub fn params(&self) -> &'static [ParamSpec] {
        use IndicatorKind::*;
        match self {
            Sma | Ema | Wma | VolumeSpike | VolumeMa | HighestHigh | LowestLow => PERIOD_20,
            Macd => MACD_PARAMS,
            Ichimoku => ICHIMOKU_PARAMS,
            Rsi | Cci | WilliamsR | Mfi | Atr => PERIOD_14,
            Stochastic => STOCHASTIC_PARAMS,
            Bollinger => BOLLINGER_PARAMS,
            Keltner => KELTNER_PARAMS,
            VolatilityBreakout => BREAKOUT_PARAMS,
            Obv | PivotPoints | Price => &[],
            Vwap => VWAP_PARAMS,
            PriceChange => PERIOD_1,
        }
    }

    /// Output keys of a multi-output indicator; empty for single-output ones
    pub fn outputs(&self) -> &'static [&'static str] {
        use IndicatorKind::*;
        match self {
            Macd => &["macd", "signal", "histogram"],
            Ichimoku => &["tenkan", "kijun", "senkou_a", "senkou_b"],
            Stochastic => &["k", "d"],
            Bollinger => &["upper", "middle", "lower", "pct_b"],
            Keltner => &["upper", "middle", "lower"],
            PivotPoints => &["pivot", "r1", "s1", "r2", "s2"],
            Price => &["close", "open", "high", "low", "volume"],
            _ => &[],
        }
    }

    pub fn is_multi_output(&self) -> bool {
        !self.outputs().is_empty()
    }

    /// Output used when a spec names none
    pub fn default_output(&self) -> Option<&'static str> {
        self.outputs().first().copied()
    }

    pub fn inputs(&self) -> &'static [Channel] {
        use IndicatorKind::*;
        match self {
            Sma | Ema | Wma | Macd | Rsi | Bollinger | PriceChange => &[Close],
            Ichimoku => &[High, Low],
            Stochastic | Cci | WilliamsR | Atr | Keltner => HLC,
            Mfi | Vwap => HLCV,
            VolatilityBreakout => &[Open, High, Low],
            Obv => &[Close, Volume],
            VolumeSpike | VolumeMa => &[Volume],
            HighestHigh => &[High],
            LowestLow => &[Low],
            PivotPoints => HLC,
            Price => &[Open, High, Low, Close, Volume],
        }
    }

    fn param_spec(&self, name: &str) -> Option<&'static ParamSpec> {
        self.params().iter().find(|p| p.name == name)
    }

    /// Fill in defaults for parameters the spec leaves out
    pub fn resolve_params(&self, given: &BTreeMap<String, f64>) -> ResolvedParams {
        let values = self
            .params()
            .iter()
            .map(|p| (p.name, given.get(p.name).copied().unwrap_or(p.default)))
            .collect();
        ResolvedParams(values)
    }

    /// Number of leading undefined values for the given output
    pub fn warmup(&self, params: &ResolvedParams, output: Option<&str>) -> usize {
        use IndicatorKind::*;
        let p = |name| params.usize(name);
        match self {
            Sma | Ema | Wma | Cci | WilliamsR | Atr | Keltner | Bollinger | VolumeMa
            | HighestHigh | LowestLow => p("period").saturating_sub(1),
            Rsi | Mfi | VolumeSpike | PriceChange => p("period"),
            Vwap => p("period").saturating_sub(1),
            Macd => {
                let line = p("fast").max(p("slow")).saturating_sub(1);
                match output {
                    Some("signal") | Some("histogram") => line + p("signal").saturating_sub(1),
                    _ => line,
                }
            }
            Ichimoku => {
                let tenkan = p("tenkan").saturating_sub(1);
                let kijun = p("kijun").saturating_sub(1);
                match output {
                    Some("kijun") => kijun,
                    Some("senkou_a") => tenkan.max(kijun) + p("displacement"),
                    Some("senkou_b") => p("senkou_b").saturating_sub(1) + p("displacement"),
                    _ => tenkan,
                }
            }
            Stochastic => {
                let k = p("k_period").saturating_sub(1);
                match output {
                    Some("d") => k + p("d_period").saturating_sub(1),
                    _ => k,
                }
            }
            VolatilityBreakout | PivotPoints => 1,
            Obv | Price => 0,
        }
    }

    /// Compute the indicator over `candles`
    pub fn compute(&self, candles: &[Candle], params: &ResolvedParams) -> IndicatorOutput {
        use IndicatorKind::*;
        use IndicatorOutput::{Multi, Single};
        let p = |name| params.usize(name);
        let f = |name| params.f64(name);

        match self {
            Sma => Single(indicators::sma(&indicators::closes(candles), p("period"))),
            Ema => Single(indicators::ema(&indicators::closes(candles), p("period"))),
            Wma => Single(indicators::wma(&indicators::closes(candles), p("period"))),
            Macd => {
                let out = indicators::macd(
                    &indicators::closes(candles),
                    p("fast"),
                    p("slow"),
                    p("signal"),
                );
                Multi(BTreeMap::from([
                    ("macd", out.macd),
                    ("signal", out.signal),
                    ("histogram", out.histogram),
                ]))
            }
            Ichimoku => {
                let out = indicators::ichimoku(
                    candles,
                    p("tenkan"),
                    p("kijun"),
                    p("senkou_b"),
                    p("displacement"),
                );
                Multi(BTreeMap::from([
                    ("tenkan", out.tenkan),
                    ("kijun", out.kijun),
                    ("senkou_a", out.senkou_a),
                    ("senkou_b", out.senkou_b),
                ]))
            }
            Rsi => Single(indicators::rsi(&indicators::closes(candles), p("period"))),
            Stochastic => {
                let out = indicators::stochastic(candles, p("k_period"), p("d_period"));
                Multi(BTreeMap::from([("k", out.k), ("d", out.d)]))
            }
            Cci => Single(indicators::cci(candles, p("period"))),
            WilliamsR => Single(indicators::williams_r(candles, p("period"))),
            Mfi => Single(indicators::mfi(candles, p("period"))),
            Bollinger => {
                let out = indicators::bollinger(
                    &indicators::closes(candles),
                    p("period"),
                    f("std_dev"),
                );
                Multi(BTreeMap::from([
                    ("upper", out.upper),
                    ("middle", out.middle),
                    ("lower", out.lower),
                    ("pct_b", out.pct_b),
                ]))
            }
            Atr => Single(indicators::atr(candles, p("period"))),
            Keltner => {
                let out = indicators::keltner(candles, p("period"), f("multiplier"));
                Multi(BTreeMap::from([
                    ("upper", out.upper),
                    ("middle", out.middle),
                    ("lower", out.lower),
                ]))
            }
            VolatilityBreakout => Single(indicators::volatility_breakout(candles, f("k"))),
            Obv => Single(indicators::obv(candles)),
            Vwap => Single(indicators::vwap(candles, p("period"))),
            VolumeSpike => Single(indicators::volume_spike(candles, p("period"))),
            VolumeMa => Single(indicators::volume_ma(candles, p("period"))),
            PriceChange => Single(indicators::price_change_pct(
                &indicators::closes(candles),
                p("period"),
            )),
            HighestHigh => Single(indicators::highest_high(candles, p("period"))),
            LowestLow => Single(indicators::lowest_low(candles, p("period"))),
            PivotPoints => {
                let out = indicators::pivot_points(candles);
                Multi(BTreeMap::from([
                    ("pivot", out.pivot),
                    ("r1", out.r1),
                    ("s1", out.s1),
                    ("r2", out.r2),
                    ("s2", out.s2),
                ]))
            }
            Price => Multi(BTreeMap::from([
                ("close", indicators::channel(indicators::closes(candles))),
                ("open", indicators::channel(indicators::opens(candles))),
                ("high", indicators::channel(indicators::highs(candles))),
                ("low", indicators::channel(indicators::lows(candles))),
                ("volume", indicators::channel(indicators::volumes(candles))),
            ])),
        }
    }

    /// Check one parameter value against its spec
    pub fn check_param(&self, name: &str, value: f64) -> Result<(), String> {
        let Some(spec) = self.param_spec(name) else {
            return Err(format!(
                "unknown parameter '{}' for {} (accepted: {})",
                name,
                self.name(),
                self.params()
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        };
        if !value.is_finite() {
            return Err(format!("parameter '{name}' must be a finite number"));
        }
        if spec.integer && value.fract() != 0.0 {
            return Err(format!("parameter '{name}' must be an integer"));
        }
        if value < spec.min || value > spec.max {
            return Err(format!(
                "parameter '{}' must be between {} and {}",
                name, spec.min, spec.max
            ));
        }
        Ok(())
    }
}

/// Parameter values with defaults filled in, keyed by the registry's names
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams(BTreeMap<&'static str, f64>);

impl ResolvedParams {
    pub fn f64(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn usize(&self, name: &str) -> usize {
        let v = self.f64(name);
        if v.is_finite() && v > 0.0 {
            v as usize
        } else {
            0
        }
    }

    /// Stable textual key, used to memoise computed series
    pub fn key(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Catalogue entry exposed over the API
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub category: Category,
    pub params: &'static [ParamSpec],
    pub inputs: &'static [Channel],
    pub outputs: &'static [&'static str],
    pub multi_output: bool,
}

pub fn catalog() -> Vec<CatalogEntry> {
    IndicatorKind::all()
        .iter()
        .map(|k| CatalogEntry {
            name: k.name(),
            category: k.category(),
            params: k.params(),
            inputs: k.inputs(),
            outputs: k.outputs(),
            multi_output: k.is_multi_output(),
        })
        .collect()
}
