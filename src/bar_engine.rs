// =============================================================================
// Bar Engine — stateful per-stock tick aggregation into 1-minute OHLCV bars
// =============================================================================
//
// A ring-buffer-per-key shape
// (`RwLock<HashMap<key, VecDeque<_>>>`) folding raw ticks into 1-minute bars
// ourselves, extended with day-scoped running VWAP.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;

use crate::types::{Bar, Tick};

/// Closed bars retained per stock — enough history for the indicator
/// pipeline (MA55, ATR14, RSI14) without unbounded growth.
const MAX_BARS: usize = 60;
/// Window used for the rolling volume-ratio average.
const VOLUME_RATIO_WINDOW: usize = 20;

struct VwapState {
    date: NaiveDate,
    cum_price_volume: f64,
    cum_volume: f64,
    vwap: f64,
}

impl VwapState {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            cum_price_volume: 0.0,
            cum_volume: 0.0,
            vwap: 0.0,
        }
    }
}

struct StockState {
    current_bar: Option<Bar>,
    closed_bars: VecDeque<Bar>,
    vwap: VwapState,
    last_price: f64,
}

impl StockState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_bar: None,
            closed_bars: VecDeque::with_capacity(MAX_BARS + 1),
            vwap: VwapState::new(now.date_naive()),
            last_price: 0.0,
        }
    }
}

/// Stateful per-stock tick→bar aggregator shared across the Signal Detector
/// and Position Monitor tasks of this process, whether they run co-located
/// in one process or split across two.
pub struct BarEngine {
    stocks: RwLock<HashMap<String, RwLock<StockState>>>,
}

/// Rolling current-bar vs historical-average volume comparison.
#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo {
    pub current_bar_volume: f64,
    pub avg_20_bar: f64,
    pub ratio: f64,
}

impl BarEngine {
    pub fn new() -> Self {
        Self {
            stocks: RwLock::new(HashMap::new()),
        }
    }

    fn bar_ts(now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = now.timestamp();
        let floored = secs - secs.rem_euclid(60);
        DateTime::from_timestamp(floored, 0).unwrap_or(now)
    }

    /// Fold one tick into the per-stock bar state.
    pub fn ingest(&self, tick: &Tick) {
        self.with_stock(&tick.code, |state| {
            let now = tick.server_timestamp;
            let bar_ts = Self::bar_ts(now);
            let today = now.date_naive();

            if state.vwap.date != today {
                state.vwap = VwapState::new(today);
            }

            if tick.volume_delta > 0.0 {
                state.vwap.cum_price_volume += tick.price * tick.volume_delta;
                state.vwap.cum_volume += tick.volume_delta;
                if state.vwap.cum_volume > 0.0 {
                    state.vwap.vwap = state.vwap.cum_price_volume / state.vwap.cum_volume;
                }
            }

            state.last_price = tick.price;

            let needs_new_bar = match &state.current_bar {
                None => true,
                Some(b) => b.bar_start != bar_ts,
            };

            if needs_new_bar {
                if let Some(prev) = state.current_bar.take() {
                    state.closed_bars.push_back(prev);
                    while state.closed_bars.len() > MAX_BARS {
                        state.closed_bars.pop_front();
                    }
                }
                state.current_bar = Some(Bar {
                    code: tick.code.clone(),
                    bar_start: bar_ts,
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                    volume: tick.volume_delta,
                });
            } else if let Some(bar) = state.current_bar.as_mut() {
                bar.high = bar.high.max(tick.price);
                bar.low = bar.low.min(tick.price);
                bar.close = tick.price;
                bar.volume += tick.volume_delta;
            }
        });
    }

    fn with_stock<R>(&self, code: &str, f: impl FnOnce(&mut StockState) -> R) -> R {
        {
            let stocks = self.stocks.read();
            if let Some(lock) = stocks.get(code) {
                return f(&mut lock.write());
            }
        }
        let mut stocks = self.stocks.write();
        let lock = stocks
            .entry(code.to_string())
            .or_insert_with(|| RwLock::new(StockState::new(Utc::now())));
        f(&mut lock.write())
    }

    pub fn vwap(&self, code: &str) -> Option<f64> {
        let stocks = self.stocks.read();
        let lock = stocks.get(code)?;
        let state = lock.read();
        if state.vwap.cum_volume > 0.0 {
            Some(state.vwap.vwap)
        } else if state.last_price > 0.0 {
            Some(state.last_price)
        } else {
            None
        }
    }

    pub fn current_price(&self, code: &str) -> Option<f64> {
        let stocks = self.stocks.read();
        let lock = stocks.get(code)?;
        let state = lock.read();
        state
            .current_bar
            .as_ref()
            .map(|b| b.close)
            .or(if state.last_price > 0.0 { Some(state.last_price) } else { None })
    }

    /// Most recent `count` **closed** bars, oldest-first.
    pub fn recent_bars(&self, code: &str, count: usize) -> Vec<Bar> {
        let stocks = self.stocks.read();
        let Some(lock) = stocks.get(code) else {
            return Vec::new();
        };
        let state = lock.read();
        let start = state.closed_bars.len().saturating_sub(count);
        state.closed_bars.iter().skip(start).cloned().collect()
    }

    pub fn bar_count(&self, code: &str) -> usize {
        let stocks = self.stocks.read();
        stocks.get(code).map_or(0, |lock| lock.read().closed_bars.len())
    }

    /// `volume_info(code)`: current (in-progress) bar volume vs the 20-bar
    /// historical average of *closed* bars.
    pub fn volume_info(&self, code: &str) -> Option<VolumeInfo> {
        let stocks = self.stocks.read();
        let lock = stocks.get(code)?;
        let state = lock.read();
        let current_bar_volume = state.current_bar.as_ref().map(|b| b.volume).unwrap_or(0.0);

        let window_start = state.closed_bars.len().saturating_sub(VOLUME_RATIO_WINDOW);
        let window: Vec<f64> = state
            .closed_bars
            .iter()
            .skip(window_start)
            .map(|b| b.volume)
            .collect();
        if window.is_empty() {
            return Some(VolumeInfo {
                current_bar_volume,
                avg_20_bar: 0.0,
                ratio: 0.0,
            });
        }
        let avg_20_bar = window.iter().sum::<f64>() / window.len() as f64;
        let ratio = if avg_20_bar > 0.0 {
            current_bar_volume / avg_20_bar
        } else {
            0.0
        };
        Some(VolumeInfo {
            current_bar_volume,
            avg_20_bar,
            ratio,
        })
    }
}

impl Default for BarEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(code: &str, price: f64, volume: f64, secs: i64) -> Tick {
        Tick {
            code: code.to_string(),
            price,
            high_of_day: price,
            volume_delta: volume,
            server_timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn folds_ticks_within_same_minute_into_one_bar() {
        let engine = BarEngine::new();
        engine.ingest(&tick("005930", 100.0, 10.0, 0));
        engine.ingest(&tick("005930", 105.0, 5.0, 10));
        engine.ingest(&tick("005930", 95.0, 5.0, 20));

        assert_eq!(engine.bar_count("005930"), 0, "bar not closed until a new minute starts");
        assert_eq!(engine.current_price("005930"), Some(95.0));
    }

    #[test]
    fn closes_bar_on_minute_boundary() {
        let engine = BarEngine::new();
        engine.ingest(&tick("005930", 100.0, 10.0, 0));
        engine.ingest(&tick("005930", 110.0, 10.0, 61));

        let bars = engine.recent_bars("005930", 10);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].high, 100.0);
    }

    #[test]
    fn caps_closed_bars_at_max() {
        let engine = BarEngine::new();
        for i in 0..(MAX_BARS as i64 + 10) {
            engine.ingest(&tick("005930", 100.0, 1.0, i * 61));
        }
        assert_eq!(engine.bar_count("005930"), MAX_BARS);
    }

    #[test]
    fn vwap_is_volume_weighted() {
        let engine = BarEngine::new();
        engine.ingest(&tick("005930", 100.0, 10.0, 0));
        engine.ingest(&tick("005930", 200.0, 10.0, 10));
        // (100*10 + 200*10) / 20 = 150
        assert_eq!(engine.vwap("005930"), Some(150.0));
    }

    #[test]
    fn volume_info_computes_ratio_against_closed_bar_average() {
        let engine = BarEngine::new();
        for i in 0..5 {
            engine.ingest(&tick("005930", 100.0, 10.0, i * 61));
        }
        let info = engine.volume_info("005930").unwrap();
        assert!(info.avg_20_bar > 0.0);
    }
}
