//! Technical indicator library
//!
//! Every function maps a candle (or value) series to one or more series of
//! the same length. `None` marks the warm-up window where an indicator does
//! not yet have enough history. All indicators are causal: the value at `i`
//! only looks at indices `<= i`. The Ichimoku leading spans are displaced
//! forward, so their value at `i` is the one computed `displacement` bars
//! earlier.
//!
//! Streaming primitives come from `ta`; their warm-up prefix (where `ta`
//! returns a partial-window value) is masked here.

use crate::types::Candle;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, KeltnerChannel, Maximum, Minimum,
    MovingAverageConvergenceDivergence, SimpleMovingAverage,
};
use ta::{Close, High, Low, Next, Open, Volume};

/// An indicator output series, index-aligned with its input
pub type Series = Vec<Option<f64>>;

// ============================================================================
// Helpers
// ============================================================================

fn undefined(len: usize) -> Series {
    vec![None; len]
}

/// Turn a raw stream into a series with its first `warmup` values undefined.
/// Non-finite values are treated as undefined as well.
fn mask_warmup(values: Vec<f64>, warmup: usize) -> Series {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| if i < warmup || !v.is_finite() { None } else { Some(v) })
        .collect()
}

fn stream<I: Next<f64, Output = f64>>(mut indicator: I, input: &[f64]) -> Vec<f64> {
    input.iter().map(|&x| indicator.next(x)).collect()
}

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close()).collect()
}

pub fn opens(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.open()).collect()
}

pub fn highs(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.high()).collect()
}

pub fn lows(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.low()).collect()
}

pub fn volumes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.volume()).collect()
}

fn typical_prices(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .map(|c| (c.high() + c.low() + c.close()) / 3.0)
        .collect()
}

/// Rolling max/min over `period` values, warm-up masked
fn rolling_max(values: &[f64], period: usize) -> Series {
    match Maximum::new(period) {
        Ok(ind) => mask_warmup(stream(ind, values), period - 1),
        Err(_) => undefined(values.len()),
    }
}

fn rolling_min(values: &[f64], period: usize) -> Series {
    match Minimum::new(period) {
        Ok(ind) => mask_warmup(stream(ind, values), period - 1),
        Err(_) => undefined(values.len()),
    }
}

/// SMA over an already-masked series: undefined until `period` consecutive
/// defined inputs have been seen.
fn sma_of_series(input: &Series, period: usize) -> Series {
    let mut out = undefined(input.len());
    if period == 0 {
        return out;
    }
    for i in 0..input.len() {
        if i + 1 < period {
            continue;
        }
        let window = &input[i + 1 - period..=i];
        if window.iter().all(Option::is_some) {
            let sum: f64 = window.iter().flatten().sum();
            out[i] = Some(sum / period as f64);
        }
    }
    out
}

// ============================================================================
// Trend
// ============================================================================

pub fn sma(values: &[f64], period: usize) -> Series {
    match SimpleMovingAverage::new(period) {
        Ok(ind) => mask_warmup(stream(ind, values), period - 1),
        Err(_) => undefined(values.len()),
    }
}

pub fn ema(values: &[f64], period: usize) -> Series {
    match ExponentialMovingAverage::new(period) {
        Ok(ind) => mask_warmup(stream(ind, values), period - 1),
        Err(_) => undefined(values.len()),
    }
}

/// Linearly weighted moving average (newest bar weight = period)
pub fn wma(values: &[f64], period: usize) -> Series {
    let mut out = undefined(values.len());
    if period == 0 {
        return out;
    }
    let denom = (period * (period + 1)) as f64 / 2.0;
    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        let weighted: f64 = window
            .iter()
            .enumerate()
            .map(|(w, v)| (w + 1) as f64 * v)
            .sum();
        out[i] = Some(weighted / denom);
    }
    out
}

pub struct Macd {
    pub macd: Series,
    pub signal: Series,
    pub histogram: Series,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let Ok(mut ind) = MovingAverageConvergenceDivergence::new(fast, slow, signal) else {
        return Macd {
            macd: undefined(values.len()),
            signal: undefined(values.len()),
            histogram: undefined(values.len()),
        };
    };

    let mut line = Vec::with_capacity(values.len());
    let mut sig = Vec::with_capacity(values.len());
    let mut hist = Vec::with_capacity(values.len());
    for &v in values {
        let out = ind.next(v);
        line.push(out.macd);
        sig.push(out.signal);
        hist.push(out.histogram);
    }

    let line_warmup = slow.max(fast) - 1;
    let signal_warmup = line_warmup + signal - 1;
    Macd {
        macd: mask_warmup(line, line_warmup),
        signal: mask_warmup(sig, signal_warmup),
        histogram: mask_warmup(hist, signal_warmup),
    }
}

pub struct Ichimoku {
    pub tenkan: Series,
    pub kijun: Series,
    pub senkou_a: Series,
    pub senkou_b: Series,
}

fn midpoint(high: &[f64], low: &[f64], period: usize) -> Series {
    rolling_max(high, period)
        .into_iter()
        .zip(rolling_min(low, period))
        .map(|(h, l)| Some((h? + l?) / 2.0))
        .collect()
}

/// Ichimoku cloud. The leading spans are displaced forward by
/// `displacement` bars, so `senkou_a[i]` is the value computed at
/// `i - displacement`. The lagging span is not provided: it looks ahead.
pub fn ichimoku(
    candles: &[Candle],
    tenkan_period: usize,
    kijun_period: usize,
    senkou_b_period: usize,
    displacement: usize,
) -> Ichimoku {
    let high = highs(candles);
    let low = lows(candles);
    let tenkan = midpoint(&high, &low, tenkan_period);
    let kijun = midpoint(&high, &low, kijun_period);
    let span_b_raw = midpoint(&high, &low, senkou_b_period);
    let span_a_raw: Series = tenkan
        .iter()
        .zip(&kijun)
        .map(|(t, k)| Some((t.as_ref()? + k.as_ref()?) / 2.0))
        .collect();

    let shift = |raw: &Series| -> Series {
        (0..raw.len())
            .map(|i| i.checked_sub(displacement).and_then(|j| raw[j]))
            .collect()
    };

    Ichimoku {
        senkou_a: shift(&span_a_raw),
        senkou_b: shift(&span_b_raw),
        tenkan,
        kijun,
    }
}

// ============================================================================
// Momentum
// ============================================================================

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain == 0.0 {
        0.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Wilder's RSI. The first value appears at index `period` (after `period`
/// price changes). A window without gains reads 0, flat ones included, so
/// a flat stretch followed by a jump crosses every threshold upward.
pub fn rsi(values: &[f64], period: usize) -> Series {
    let mut out = undefined(values.len());
    if period == 0 || values.len() <= period {
        return out;
    }

    let p = period as f64;
    let (mut gain, mut loss) = (0.0, 0.0);
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta > 0.0 {
            gain += delta;
        } else {
            loss -= delta;
        }
    }
    let mut avg_gain = gain / p;
    let mut avg_loss = loss / p;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let delta = values[i] - values[i - 1];
        avg_gain = (avg_gain * (p - 1.0) + delta.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-delta).max(0.0)) / p;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

pub struct Stochastic {
    pub k: Series,
    pub d: Series,
}

/// Fast stochastic %K over `k_period` bars and its `d_period` SMA (%D).
/// A window with no range reads 50.
pub fn stochastic(candles: &[Candle], k_period: usize, d_period: usize) -> Stochastic {
    let close = closes(candles);
    let hh = rolling_max(&highs(candles), k_period);
    let ll = rolling_min(&lows(candles), k_period);

    let k: Series = close
        .iter()
        .zip(hh.iter().zip(&ll))
        .map(|(&c, (h, l))| {
            let (h, l) = (h.as_ref()?, l.as_ref()?);
            let range = h - l;
            Some(if range == 0.0 { 50.0 } else { (c - l) / range * 100.0 })
        })
        .collect();
    let d = sma_of_series(&k, d_period);
    Stochastic { k, d }
}

/// Commodity Channel Index with the conventional 0.015 constant
pub fn cci(candles: &[Candle], period: usize) -> Series {
    let tp = typical_prices(candles);
    let mut out = undefined(tp.len());
    if period == 0 {
        return out;
    }
    for i in (period - 1)..tp.len() {
        let window = &tp[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let mad = window.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
        out[i] = Some(if mad == 0.0 {
            0.0
        } else {
            (tp[i] - mean) / (0.015 * mad)
        });
    }
    out
}

/// Williams %R in [-100, 0]. A window with no range reads -50.
pub fn williams_r(candles: &[Candle], period: usize) -> Series {
    let close = closes(candles);
    let hh = rolling_max(&highs(candles), period);
    let ll = rolling_min(&lows(candles), period);
    close
        .iter()
        .zip(hh.iter().zip(&ll))
        .map(|(&c, (h, l))| {
            let (h, l) = (h.as_ref()?, l.as_ref()?);
            let range = h - l;
            Some(if range == 0.0 { -50.0 } else { (h - c) / range * -100.0 })
        })
        .collect()
}

/// Money Flow Index over `period` typical-price changes
pub fn mfi(candles: &[Candle], period: usize) -> Series {
    let tp = typical_prices(candles);
    let vol = volumes(candles);
    let mut out = undefined(tp.len());
    if period == 0 || tp.len() <= period {
        return out;
    }

    for i in period..tp.len() {
        let (mut positive, mut negative) = (0.0, 0.0);
        for j in (i + 1 - period)..=i {
            let flow = tp[j] * vol[j];
            if tp[j] > tp[j - 1] {
                positive += flow;
            } else if tp[j] < tp[j - 1] {
                negative += flow;
            }
        }
        out[i] = Some(if negative == 0.0 {
            if positive == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + positive / negative)
        });
    }
    out
}

// ============================================================================
// Volatility
// ============================================================================

pub struct Bollinger {
    pub upper: Series,
    pub middle: Series,
    pub lower: Series,
    pub pct_b: Series,
}

/// Bollinger bands (population standard deviation). `pct_b` is the close's
/// position inside the bands; collapsed bands read 0.5.
pub fn bollinger(values: &[f64], period: usize, multiplier: f64) -> Bollinger {
    let Ok(mut ind) = BollingerBands::new(period, multiplier) else {
        return Bollinger {
            upper: undefined(values.len()),
            middle: undefined(values.len()),
            lower: undefined(values.len()),
            pct_b: undefined(values.len()),
        };
    };

    let mut upper = Vec::with_capacity(values.len());
    let mut middle = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());
    let mut pct_b = Vec::with_capacity(values.len());
    for &v in values {
        let out = ind.next(v);
        let width = out.upper - out.lower;
        upper.push(out.upper);
        middle.push(out.average);
        lower.push(out.lower);
        pct_b.push(if width == 0.0 { 0.5 } else { (v - out.lower) / width });
    }

    let warmup = period - 1;
    Bollinger {
        upper: mask_warmup(upper, warmup),
        middle: mask_warmup(middle, warmup),
        lower: mask_warmup(lower, warmup),
        pct_b: mask_warmup(pct_b, warmup),
    }
}

pub fn atr(candles: &[Candle], period: usize) -> Series {
    let Ok(mut ind) = AverageTrueRange::new(period) else {
        return undefined(candles.len());
    };
    let raw: Vec<f64> = candles.iter().map(|c| ind.next(c)).collect();
    mask_warmup(raw, period - 1)
}

pub struct Keltner {
    pub upper: Series,
    pub middle: Series,
    pub lower: Series,
}

pub fn keltner(candles: &[Candle], period: usize, multiplier: f64) -> Keltner {
    let Ok(mut ind) = KeltnerChannel::new(period, multiplier) else {
        return Keltner {
            upper: undefined(candles.len()),
            middle: undefined(candles.len()),
            lower: undefined(candles.len()),
        };
    };

    let mut upper = Vec::with_capacity(candles.len());
    let mut middle = Vec::with_capacity(candles.len());
    let mut lower = Vec::with_capacity(candles.len());
    for candle in candles {
        let out = ind.next(candle);
        upper.push(out.upper);
        middle.push(out.average);
        lower.push(out.lower);
    }

    let warmup = period - 1;
    Keltner {
        upper: mask_warmup(upper, warmup),
        middle: mask_warmup(middle, warmup),
        lower: mask_warmup(lower, warmup),
    }
}

/// Volatility-breakout target: today's open plus `k` times the previous
/// bar's range. Compare the close against it to detect a breakout.
pub fn volatility_breakout(candles: &[Candle], k: f64) -> Series {
    let mut out = undefined(candles.len());
    for i in 1..candles.len() {
        let prev = &candles[i - 1];
        out[i] = Some(candles[i].open() + k * (prev.high() - prev.low()));
    }
    out
}

// ============================================================================
// Volume
// ============================================================================

/// On-balance volume, starting at 0 on the first bar
pub fn obv(candles: &[Candle]) -> Series {
    let mut out = Vec::with_capacity(candles.len());
    let mut total = 0.0;
    for (i, candle) in candles.iter().enumerate() {
        if i > 0 {
            let prev = candles[i - 1].close();
            if candle.close() > prev {
                total += candle.volume();
            } else if candle.close() < prev {
                total -= candle.volume();
            }
        }
        out.push(Some(total));
    }
    out
}

/// Volume-weighted average of the typical price. `period == 0` means
/// cumulative from the first bar, otherwise a rolling window.
pub fn vwap(candles: &[Candle], period: usize) -> Series {
    let tp = typical_prices(candles);
    let vol = volumes(candles);
    let mut out = undefined(tp.len());

    let (mut pv_sum, mut vol_sum) = (0.0, 0.0);
    for i in 0..tp.len() {
        pv_sum += tp[i] * vol[i];
        vol_sum += vol[i];
        if period > 0 && i >= period {
            pv_sum -= tp[i - period] * vol[i - period];
            vol_sum -= vol[i - period];
        }
        if period > 0 && i + 1 < period {
            continue;
        }
        if vol_sum > 0.0 {
            out[i] = Some(pv_sum / vol_sum);
        }
    }
    out
}

/// Ratio of the bar's volume to the mean volume of the previous `period` bars
pub fn volume_spike(candles: &[Candle], period: usize) -> Series {
    let vol = volumes(candles);
    let mut out = undefined(vol.len());
    if period == 0 {
        return out;
    }
    for i in period..vol.len() {
        let mean = vol[i - period..i].iter().sum::<f64>() / period as f64;
        if mean > 0.0 {
            out[i] = Some(vol[i] / mean);
        }
    }
    out
}

pub fn volume_ma(candles: &[Candle], period: usize) -> Series {
    sma(&volumes(candles), period)
}

// ============================================================================
// Price
// ============================================================================

/// Percent change of the close over `period` bars
pub fn price_change_pct(values: &[f64], period: usize) -> Series {
    let mut out = undefined(values.len());
    if period == 0 {
        return out;
    }
    for i in period..values.len() {
        let base = values[i - period];
        if base != 0.0 {
            out[i] = Some((values[i] - base) / base * 100.0);
        }
    }
    out
}

pub fn highest_high(candles: &[Candle], period: usize) -> Series {
    rolling_max(&highs(candles), period)
}

pub fn lowest_low(candles: &[Candle], period: usize) -> Series {
    rolling_min(&lows(candles), period)
}

pub struct PivotPoints {
    pub pivot: Series,
    pub r1: Series,
    pub s1: Series,
    pub r2: Series,
    pub s2: Series,
}

/// Classic floor pivots computed from the previous bar
pub fn pivot_points(candles: &[Candle]) -> PivotPoints {
    let n = candles.len();
    let mut pp = PivotPoints {
        pivot: undefined(n),
        r1: undefined(n),
        s1: undefined(n),
        r2: undefined(n),
        s2: undefined(n),
    };
    for i in 1..n {
        let prev = &candles[i - 1];
        let (h, l, c) = (prev.high(), prev.low(), prev.close());
        let p = (h + l + c) / 3.0;
        pp.pivot[i] = Some(p);
        pp.r1[i] = Some(2.0 * p - l);
        pp.s1[i] = Some(2.0 * p - h);
        pp.r2[i] = Some(p + (h - l));
        pp.s2[i] = Some(p - (h - l));
    }
    pp
}

/// A raw candle channel as a fully defined series
pub fn channel(values: Vec<f64>) -> Series {
    values.into_iter().map(Some).collect()
}
