//! Shared types for the indicator library, simulator and bot runtime

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Candle {
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
}

// `ta` reads candles through these accessor traits.
impl ta::Open for Candle {
    fn open(&self) -> f64 {
        self.open.to_f64().unwrap_or(0.0)
    }
}

impl ta::High for Candle {
    fn high(&self) -> f64 {
        self.high.to_f64().unwrap_or(0.0)
    }
}

impl ta::Low for Candle {
    fn low(&self) -> f64 {
        self.low.to_f64().unwrap_or(0.0)
    }
}

impl ta::Close for Candle {
    fn close(&self) -> f64 {
        self.close_f64()
    }
}

impl ta::Volume for Candle {
    fn volume(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }
}

/// Candle bucket size of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn minutes(&self) -> u64 {
        match self {
            Self::M1 => 1,
            Self::M3 => 3,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.minutes() * 60)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" | "60m" => Ok(Self::H1),
            "4h" | "240m" => Ok(Self::H4),
            "1d" | "day" => Ok(Self::D1),
            other => Err(format!("unsupported timeframe: {other}")),
        }
    }
}

/// Side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Why a trade was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeReason {
    Signal,
    StopLoss,
    TakeProfit,
    PeriodEnd,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::PeriodEnd => "period_end",
        }
    }
}

impl FromStr for TradeReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(Self::Signal),
            "stop_loss" => Ok(Self::StopLoss),
            "take_profit" => Ok(Self::TakeProfit),
            "period_end" => Ok(Self::PeriodEnd),
            other => Err(format!("unknown trade reason: {other}")),
        }
    }
}

/// An open long position. At most one per bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Quote amount spent including the entry fee
    pub cost: Decimal,
    pub entry_time: i64,
}

impl Position {
    /// Price-based P&L of the position at `price`, in percent
    pub fn pnl_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED
    }
}

/// An executed trade. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: TradeSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub total: Decimal,
    pub fee: Decimal,
    pub profit: Decimal,
    pub profit_pct: Decimal,
    pub reason: TradeReason,
    pub timestamp: i64,
}

/// A point on the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: Decimal,
}

/// Reported when a backtest had too few candles to say anything
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataInsufficiency {
    pub required: usize,
    pub available: usize,
}

/// Result of a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub start_time: i64,
    pub end_time: i64,
    pub bars: usize,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_return_pct: Decimal,
    pub buy_and_hold_return_pct: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: Decimal,
    pub max_drawdown_pct: Decimal,
    pub sharpe_ratio: Decimal,
    pub profit_factor: Decimal,
    pub avg_win_pct: Decimal,
    pub avg_loss_pct: Decimal,
    pub avg_holding_bars: Decimal,
    pub total_fees: Decimal,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub insufficient_data: Option<DataInsufficiency>,
}

impl BacktestResult {
    /// All statistics at their zero values
    pub fn empty(candles: &[Candle], initial_capital: Decimal) -> Self {
        Self {
            start_time: candles.first().map(|c| c.open_time).unwrap_or(0),
            end_time: candles.last().map(|c| c.close_time).unwrap_or(0),
            bars: candles.len(),
            initial_capital,
            final_capital: initial_capital,
            total_return_pct: Decimal::ZERO,
            buy_and_hold_return_pct: Decimal::ZERO,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: Decimal::ZERO,
            max_drawdown_pct: Decimal::ZERO,
            sharpe_ratio: Decimal::ZERO,
            profit_factor: Decimal::ZERO,
            avg_win_pct: Decimal::ZERO,
            avg_loss_pct: Decimal::ZERO,
            avg_holding_bars: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            insufficient_data: None,
        }
    }
}

/// Lifecycle status of a bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Idle,
    Running,
    Paused,
    Error,
    Stopped,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown bot status: {other}")),
        }
    }
}
