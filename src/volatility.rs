use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::VolatilitySettings;
use crate::model::{sorted_candles, Candle};
use crate::ports::market_data::{with_timeout, CandleSource};

pub const ATR_PERIOD: usize = 14;
pub const AVERAGE_ATR_MAX_PERIOD: usize = 50;
pub const DAILY_RANGE_WINDOW: usize = 30;
pub const MIN_CANDLES: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolatilityAssessment {
    pub current_atr: f64,
    pub average_atr: f64,
    pub current_daily_range: f64,
    pub average_daily_range: f64,
    pub daily_change_percent: f64,
    pub candles: usize,
    pub verdict: bool,
}

pub fn true_range(candle: &Candle, prev: Option<&Candle>) -> f64 {
    let range = candle.high - candle.low;
    match prev {
        Some(prev) => range
            .max((candle.high - prev.close).abs())
            .max((candle.low - prev.close).abs()),
        None => range,
    }
}

/// Mean true range over the trailing `period` candles. The first candle of the window
/// has no predecessor and contributes its plain high-low range.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period {
        return 0.0;
    }
    let window = &candles[candles.len() - period..];
    let sum: f64 = window
        .iter()
        .enumerate()
        .map(|(i, c)| true_range(c, if i == 0 { None } else { Some(&window[i - 1]) }))
        .sum();
    sum / period as f64
}

pub fn average_daily_range(candles: &[Candle], window: usize) -> f64 {
    let take = window.min(candles.len());
    if take == 0 {
        return 0.0;
    }
    candles[candles.len() - take..]
        .iter()
        .map(Candle::range)
        .sum::<f64>()
        / take as f64
}

pub fn daily_change_percent(candles: &[Candle]) -> f64 {
    match candles {
        [.., prev, last] if prev.close != 0.0 => (last.close - prev.close) / prev.close * 100.0,
        _ => 0.0,
    }
}

/// Indicators of the reference instrument and the resulting verdict. None when fewer
/// than `MIN_CANDLES` candles are available.
pub fn assess(candles: &[Candle], settings: &VolatilitySettings) -> Option<VolatilityAssessment> {
    if candles.len() < MIN_CANDLES {
        return None;
    }
    let candles = sorted_candles(candles);
    let last = candles.last()?;
    let current_atr = atr(&candles, ATR_PERIOD);
    let average_atr = atr(&candles, candles.len().min(AVERAGE_ATR_MAX_PERIOD));
    let current_daily_range = last.range();
    let average_daily_range = average_daily_range(&candles, DAILY_RANGE_WINDOW);
    let daily_change_percent = daily_change_percent(&candles);

    let atr_ok = average_atr <= 0.0
        || current_atr / average_atr <= settings.atr_threshold_multiplier;
    let range_ok = average_daily_range <= 0.0
        || current_daily_range / average_daily_range <= settings.daily_range_multiplier;
    let change_ok = daily_change_percent.abs() <= settings.max_daily_change_percent;

    Some(VolatilityAssessment {
        current_atr,
        average_atr,
        current_daily_range,
        average_daily_range,
        daily_change_percent,
        candles: candles.len(),
        verdict: atr_ok && range_ok && change_ok,
    })
}

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    verdict: bool,
    computed_at: Instant,
    assessment: Option<VolatilityAssessment>,
}

/// Market-wide gate on new trades, driven by the reference instrument. The verdict is
/// cached for the configured TTL; the first caller after expiry recomputes while the
/// others wait on the cache lock and reuse its result.
pub struct VolatilityBreaker {
    source: Arc<dyn CandleSource>,
    fetch_timeout: Duration,
    cache: Mutex<Option<CachedVerdict>>,
}

impl VolatilityBreaker {
    pub fn new(source: Arc<dyn CandleSource>, fetch_timeout: Duration) -> Self {
        Self {
            source,
            fetch_timeout,
            cache: Mutex::new(None),
        }
    }

    pub async fn can_trade_now(&self, settings: &VolatilitySettings) -> bool {
        if !settings.enabled {
            return true;
        }
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.computed_at.elapsed() < settings.cache_ttl() {
                return cached.verdict;
            }
        }
        let (verdict, assessment) = self.evaluate(settings).await;
        *cache = Some(CachedVerdict {
            verdict,
            computed_at: Instant::now(),
            assessment,
        });
        verdict
    }

    pub async fn last_assessment(&self) -> Option<VolatilityAssessment> {
        self.cache.lock().await.as_ref().and_then(|c| c.assessment)
    }

    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn evaluate(&self, settings: &VolatilitySettings) -> (bool, Option<VolatilityAssessment>) {
        let instrument = settings.reference_instrument.clone();
        let fetched = with_timeout(
            "reference candles",
            self.fetch_timeout,
            self.source.fetch_candles(
                std::slice::from_ref(&instrument),
                &settings.timeframe,
                settings.candle_limit,
            ),
        )
        .await;

        let candles = match fetched {
            Ok(mut by_instrument) => by_instrument.remove(&instrument).unwrap_or_default(),
            Err(err) => {
                log::warn!(
                    "[BREAKER] {} unavailable ({}), trading {}",
                    instrument,
                    err,
                    if settings.fail_open { "permitted" } else { "blocked" }
                );
                return (settings.fail_open, None);
            }
        };

        match assess(&candles, settings) {
            Some(assessment) => {
                if assessment.verdict {
                    log::debug!(
                        "[BREAKER] {} calm atr={:.2}/{:.2} range={:.2}/{:.2} change={:.2}%",
                        instrument,
                        assessment.current_atr,
                        assessment.average_atr,
                        assessment.current_daily_range,
                        assessment.average_daily_range,
                        assessment.daily_change_percent
                    );
                } else {
                    log::warn!(
                        "[BREAKER] {} turbulent, new trades blocked: atr={:.2}/{:.2} range={:.2}/{:.2} change={:.2}%",
                        instrument,
                        assessment.current_atr,
                        assessment.average_atr,
                        assessment.current_daily_range,
                        assessment.average_daily_range,
                        assessment.daily_change_percent
                    );
                }
                (assessment.verdict, Some(assessment))
            }
            None => {
                log::warn!(
                    "[BREAKER] {} has {} candles, need {}; trading {}",
                    instrument,
                    candles.len(),
                    MIN_CANDLES,
                    if settings.fail_open { "permitted" } else { "blocked" }
                );
                (settings.fail_open, None)
            }
        }
    }
}
