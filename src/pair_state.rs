use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::exit::ExitReason;
use crate::model::{pair_name, Candidate, ZScorePoint};
use crate::pixel_spread::{spread_stats, PixelSpreadPoint, PixelSpreadStats};

/// Profit and correlation points closer together than this replace the previous point.
pub const HISTORY_COALESCE_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PairId {
    pub long_ticker: String,
    pub short_ticker: String,
}

impl PairId {
    pub fn new(long_ticker: impl Into<String>, short_ticker: impl Into<String>) -> Self {
        Self {
            long_ticker: long_ticker.into(),
            short_ticker: short_ticker.into(),
        }
    }

    pub fn of(candidate: &Candidate) -> Self {
        Self::new(candidate.long_ticker.clone(), candidate.short_ticker.clone())
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", pair_name(&self.long_ticker, &self.short_ticker))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairKind {
    /// Observed candidate, no position.
    Stable,
    Trading,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct StatSnapshot {
    pub z_score: f64,
    pub correlation: f64,
    pub adf_p_value: f64,
    pub p_value: f64,
    pub spread: f64,
    pub mean: f64,
    pub std: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl From<&ZScorePoint> for StatSnapshot {
    fn from(p: &ZScorePoint) -> Self {
        Self {
            z_score: p.z_score,
            correlation: p.correlation,
            adf_p_value: p.adf_p_value,
            p_value: p.p_value,
            spread: p.spread,
            mean: p.mean,
            std: p.std,
            alpha: p.alpha,
            beta: p.beta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryExecution {
    pub long_price: Decimal,
    pub short_price: Decimal,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub stats: StatSnapshot,
    pub long_price: Decimal,
    pub short_price: Decimal,
    pub entry_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp: i64,
    pub value: f64,
}

/// Running min/max of a metric plus the minutes after entry at which each was seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunningRange {
    pub min: f64,
    pub max: f64,
    pub minutes_to_min: i64,
    pub minutes_to_max: i64,
}

impl RunningRange {
    pub fn observe(slot: &mut Option<RunningRange>, value: f64, minutes: i64) {
        match slot {
            None => {
                *slot = Some(RunningRange {
                    min: value,
                    max: value,
                    minutes_to_min: minutes,
                    minutes_to_max: minutes,
                })
            }
            Some(range) => {
                if value > range.max {
                    range.max = value;
                    range.minutes_to_max = minutes;
                }
                if value < range.min {
                    range.min = value;
                    range.minutes_to_min = minutes;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extremes {
    pub profit: Option<RunningRange>,
    pub z_score: Option<RunningRange>,
    pub correlation: Option<RunningRange>,
    pub long_change: Option<RunningRange>,
    pub short_change: Option<RunningRange>,
}

/// Settings in force when the last averaging fired.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AveragingAudit {
    pub base_threshold: f64,
    pub multiplier: f64,
    pub max_count: u32,
    pub threshold: f64,
    pub margin_scale: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AveragingState {
    pub count: u32,
    pub last_timestamp: Option<i64>,
    pub last_profit_percent: Option<f64>,
    pub audit: Option<AveragingAudit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub appended: usize,
    pub current: StatSnapshot,
}

#[derive(Debug, Clone)]
pub struct TrackedPair {
    pub id: PairId,
    pub kind: PairKind,
    pub current: Option<StatSnapshot>,
    pub entry: Option<EntrySnapshot>,
    pub z_history: Vec<ZScorePoint>,
    pub profit_history: Vec<HistoryPoint>,
    pub correlation_history: Vec<HistoryPoint>,
    pub pixel_spread_history: Vec<PixelSpreadPoint>,
    pub extremes: Extremes,
    pub profit_percent: Option<f64>,
    pub averaging: AveragingState,
    pub exit_reason: Option<ExitReason>,
}

impl TrackedPair {
    pub fn new(id: PairId) -> Self {
        Self {
            id,
            kind: PairKind::Stable,
            current: None,
            entry: None,
            z_history: Vec::new(),
            profit_history: Vec::new(),
            correlation_history: Vec::new(),
            pixel_spread_history: Vec::new(),
            extremes: Extremes::default(),
            profit_percent: None,
            averaging: AveragingState::default(),
            exit_reason: None,
        }
    }

    pub fn is_trading(&self) -> bool {
        self.kind == PairKind::Trading
    }

    pub fn current_z(&self) -> Option<f64> {
        self.current.map(|s| s.z_score)
    }

    pub fn last_z_timestamp(&self) -> Option<i64> {
        self.z_history.last().map(|p| p.timestamp)
    }

    /// Whole minutes between entry and `timestamp_ms`, or None before entry.
    pub fn minutes_since_entry(&self, timestamp_ms: i64) -> Option<i64> {
        let entry = self.entry.as_ref()?;
        let at = Utc.timestamp_millis_opt(timestamp_ms).single()?;
        Some((at - entry.entry_time).num_minutes().max(0))
    }

    /// Refreshes the current snapshot from the newest incoming point and appends only the
    /// points newer than the last stored one, keeping timestamps strictly increasing.
    pub fn ingest_statistics(&mut self, history: &[ZScorePoint]) -> EngineResult<IngestReport> {
        if history.is_empty() {
            log::error!("[TRACKER] {} received an empty z-score history", self.id);
            return Err(EngineError::insufficient(
                self.id.to_string(),
                "empty z-score history",
            ));
        }
        let mut incoming = history.to_vec();
        incoming.sort_by_key(|p| p.timestamp);
        let latest = incoming[incoming.len() - 1];
        let current = StatSnapshot::from(&latest);
        self.current = Some(current);

        let mut last = self.last_z_timestamp();
        let mut appended = 0;
        for point in incoming {
            if last.map_or(true, |ts| point.timestamp > ts) {
                last = Some(point.timestamp);
                self.z_history.push(point);
                appended += 1;
            }
        }

        if self.is_trading() {
            if let Some(minutes) = self.minutes_since_entry(latest.timestamp) {
                RunningRange::observe(&mut self.extremes.z_score, current.z_score, minutes);
                RunningRange::observe(
                    &mut self.extremes.correlation,
                    current.correlation,
                    minutes,
                );
            }
            push_coalesced(
                &mut self.correlation_history,
                HistoryPoint {
                    timestamp: latest.timestamp,
                    value: current.correlation,
                },
            );
        }

        log::debug!(
            "[TRACKER] {} ingested z={:.3} appended={} total={}",
            self.id,
            current.z_score,
            appended,
            self.z_history.len()
        );
        Ok(IngestReport { appended, current })
    }

    /// Records entry prices and statistics. Returns false, leaving the first capture
    /// untouched, when the entry was already set.
    pub fn capture_entry(&mut self, execution: &EntryExecution) -> EngineResult<bool> {
        if let Some(entry) = &self.entry {
            log::warn!(
                "[TRACKER] {} entry already captured at {}, ignoring",
                self.id,
                entry.entry_time
            );
            return Ok(false);
        }
        let stats = self.current.ok_or_else(|| {
            EngineError::insufficient(self.id.to_string(), "no statistics before entry")
        })?;
        self.entry = Some(EntrySnapshot {
            stats,
            long_price: execution.long_price,
            short_price: execution.short_price,
            entry_time: execution.executed_at,
        });
        self.kind = PairKind::Trading;
        log::info!(
            "[TRACKER] {} entry captured z={:.3} long={} short={}",
            self.id,
            stats.z_score,
            execution.long_price,
            execution.short_price
        );
        Ok(true)
    }

    pub fn record_profit_point(&mut self, percent: f64, timestamp: i64) {
        self.profit_percent = Some(percent);
        let minutes = self.minutes_since_entry(timestamp).unwrap_or(0);
        RunningRange::observe(&mut self.extremes.profit, percent, minutes);
        push_coalesced(
            &mut self.profit_history,
            HistoryPoint {
                timestamp,
                value: percent,
            },
        );
    }

    pub fn record_leg_changes(&mut self, long_percent: f64, short_percent: f64, timestamp: i64) {
        let minutes = self.minutes_since_entry(timestamp).unwrap_or(0);
        RunningRange::observe(&mut self.extremes.long_change, long_percent, minutes);
        RunningRange::observe(&mut self.extremes.short_change, short_percent, minutes);
    }

    pub fn append_pixel_spread(&mut self, points: &[PixelSpreadPoint]) -> usize {
        let mut last = self.pixel_spread_history.last().map(|p| p.timestamp);
        let mut appended = 0;
        for point in points {
            if point.value.is_finite() && last.map_or(true, |ts| point.timestamp > ts) {
                last = Some(point.timestamp);
                self.pixel_spread_history.push(*point);
                appended += 1;
            }
        }
        appended
    }

    pub fn pixel_spread_stats(&self) -> Option<PixelSpreadStats> {
        let values: Vec<f64> = self.pixel_spread_history.iter().map(|p| p.value).collect();
        spread_stats(&values)
    }

    pub fn mark_completed(&mut self, reason: ExitReason) {
        log::info!("[TRACKER] {} completed: {}", self.id, reason);
        self.exit_reason = Some(reason);
        self.kind = PairKind::Completed;
    }
}

fn push_coalesced(history: &mut Vec<HistoryPoint>, point: HistoryPoint) {
    match history.last_mut() {
        Some(last) if point.timestamp <= last.timestamp => {}
        Some(last) if point.timestamp - last.timestamp < HISTORY_COALESCE_MS => *last = point,
        _ => history.push(point),
    }
}

pub type SharedPair = Arc<Mutex<TrackedPair>>;

/// Tracked pairs keyed by identity. Each pair sits behind its own mutex so writers of
/// one pair never interleave, while different pairs proceed independently.
#[derive(Default)]
pub struct PairRegistry {
    pairs: RwLock<HashMap<PairId, SharedPair>>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &PairId) -> Option<SharedPair> {
        self.pairs.read().await.get(id).cloned()
    }

    pub async fn get_or_insert(&self, id: &PairId) -> SharedPair {
        if let Some(pair) = self.get(id).await {
            return pair;
        }
        let mut pairs = self.pairs.write().await;
        pairs
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TrackedPair::new(id.clone()))))
            .clone()
    }

    pub async fn remove(&self, id: &PairId) -> Option<SharedPair> {
        self.pairs.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.pairs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pairs.read().await.is_empty()
    }

    pub async fn trading_pairs(&self) -> Vec<(PairId, SharedPair)> {
        let snapshot: Vec<(PairId, SharedPair)> = self
            .pairs
            .read()
            .await
            .iter()
            .map(|(id, pair)| (id.clone(), pair.clone()))
            .collect();
        let mut out = Vec::new();
        for (id, pair) in snapshot {
            if pair.lock().await.is_trading() {
                out.push((id, pair));
            }
        }
        out
    }

    /// Every ticker currently held in an open pair.
    pub async fn trading_tickers(&self) -> HashSet<String> {
        let mut tickers = HashSet::new();
        for (id, _) in self.trading_pairs().await {
            tickers.insert(id.long_ticker);
            tickers.insert(id.short_ticker);
        }
        tickers
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::entered_pair;
    use super::*;
    use crate::model::fixtures::point;
    use rust_decimal_macros::dec;

    fn assert_strictly_increasing(pair: &TrackedPair) {
        assert!(pair
            .z_history
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn first_ingestion_copies_history_and_sets_current() {
        let mut pair = TrackedPair::new(PairId::new("A", "B"));
        let report = pair
            .ingest_statistics(&[point(1, 1.0), point(2, 1.5), point(3, 2.0)])
            .unwrap();
        assert_eq!(report.appended, 3);
        assert_eq!(pair.current_z(), Some(2.0));
        assert_eq!(pair.z_history.len(), 3);
    }

    #[test]
    fn overlapping_batches_keep_history_monotonic() {
        let mut pair = TrackedPair::new(PairId::new("A", "B"));
        pair.ingest_statistics(&[point(1, 1.0), point(2, 1.1), point(3, 1.2)])
            .unwrap();
        let report = pair
            .ingest_statistics(&[point(2, 9.0), point(3, 9.0), point(4, 1.3), point(5, 1.4)])
            .unwrap();
        assert_eq!(report.appended, 2);
        pair.ingest_statistics(&[point(5, 1.4), point(1, 0.0)]).unwrap();
        pair.ingest_statistics(&[point(7, 2.0), point(6, 1.9), point(6, 1.8)])
            .unwrap();

        assert_strictly_increasing(&pair);
        let stamps: Vec<i64> = pair.z_history.iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(pair.z_history[1].z_score, 1.1);
        assert_eq!(pair.current_z(), Some(2.0));
    }

    #[test]
    fn empty_history_is_rejected() {
        let mut pair = TrackedPair::new(PairId::new("A", "B"));
        let err = pair.ingest_statistics(&[]).unwrap_err();
        assert!(err.is_data_problem());
        assert!(pair.current.is_none());
    }

    #[test]
    fn entry_is_captured_once() {
        let mut pair = entered_pair(2.5);
        assert_eq!(pair.kind, PairKind::Trading);
        pair.ingest_statistics(&[point(60_000, 1.0)]).unwrap();
        let second = pair
            .capture_entry(&EntryExecution {
                long_price: dec!(999),
                short_price: dec!(999),
                executed_at: Utc::now(),
            })
            .unwrap();
        assert!(!second);
        let entry = pair.entry.as_ref().unwrap();
        assert_eq!(entry.long_price, dec!(100));
        assert_eq!(entry.stats.z_score, 2.5);
    }

    #[test]
    fn entry_requires_statistics() {
        let mut pair = TrackedPair::new(PairId::new("A", "B"));
        let result = pair.capture_entry(&EntryExecution {
            long_price: dec!(1),
            short_price: dec!(1),
            executed_at: Utc::now(),
        });
        assert!(result.is_err());
        assert_eq!(pair.kind, PairKind::Stable);
    }

    #[test]
    fn profit_extremes_track_time_of_observation() {
        let mut pair = entered_pair(2.0);
        pair.record_profit_point(0.5, 60_000);
        let seeded = pair.extremes.profit.unwrap();
        assert_eq!((seeded.min, seeded.max), (0.5, 0.5));
        assert_eq!((seeded.minutes_to_min, seeded.minutes_to_max), (1, 1));

        pair.record_profit_point(-1.0, 5 * 60_000);
        pair.record_profit_point(2.0, 10 * 60_000);
        pair.record_profit_point(1.0, 20 * 60_000);
        let range = pair.extremes.profit.unwrap();
        assert_eq!((range.min, range.minutes_to_min), (-1.0, 5));
        assert_eq!((range.max, range.minutes_to_max), (2.0, 10));
        assert_eq!(pair.profit_percent, Some(1.0));
    }

    #[test]
    fn close_profit_points_replace_the_last_one() {
        let mut pair = entered_pair(2.0);
        pair.record_profit_point(0.1, 100_000);
        pair.record_profit_point(0.2, 110_000);
        pair.record_profit_point(0.3, 200_000);
        pair.record_profit_point(0.4, 150_000);
        let values: Vec<(i64, f64)> = pair
            .profit_history
            .iter()
            .map(|p| (p.timestamp, p.value))
            .collect();
        assert_eq!(values, vec![(110_000, 0.2), (200_000, 0.3)]);
    }

    #[test]
    fn trading_ingestion_tracks_z_and_correlation_extremes() {
        let mut pair = entered_pair(2.0);
        pair.ingest_statistics(&[point(3 * 60_000, 2.6)]).unwrap();
        pair.ingest_statistics(&[point(9 * 60_000, 0.4)]).unwrap();
        let z = pair.extremes.z_score.unwrap();
        assert_eq!((z.max, z.minutes_to_max), (2.6, 3));
        assert_eq!((z.min, z.minutes_to_min), (0.4, 9));
        assert!(pair.extremes.correlation.is_some());
        assert_eq!(pair.correlation_history.len(), 2);
    }

    #[test]
    fn leg_changes_are_tracked_separately() {
        let mut pair = entered_pair(2.0);
        pair.record_leg_changes(1.0, -0.5, 60_000);
        pair.record_leg_changes(-2.0, 0.7, 120_000);
        assert_eq!(pair.extremes.long_change.unwrap().min, -2.0);
        assert_eq!(pair.extremes.short_change.unwrap().max, 0.7);
    }

    #[test]
    fn pixel_spread_history_only_grows_forward() {
        let mut pair = TrackedPair::new(PairId::new("A", "B"));
        let pts = |v: &[(i64, f64)]| {
            v.iter()
                .map(|(t, x)| PixelSpreadPoint {
                    timestamp: *t,
                    value: *x,
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(pair.append_pixel_spread(&pts(&[(1, 100.0), (2, 200.0)])), 2);
        assert_eq!(pair.append_pixel_spread(&pts(&[(2, 900.0), (3, 300.0)])), 1);
        let stats = pair.pixel_spread_stats().unwrap();
        assert_eq!(stats.current, 300.0);
        assert_eq!(stats.average, 200.0);
    }

    #[tokio::test]
    async fn concurrent_ingestion_of_one_pair_stays_ordered() {
        let registry = Arc::new(PairRegistry::new());
        let id = PairId::new("A", "B");
        let mut handles = Vec::new();
        for offset in 0..8i64 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let batch: Vec<ZScorePoint> =
                    (offset..offset + 20).map(|t| point(t, t as f64)).collect();
                let pair = registry.get_or_insert(&id).await;
                let mut guard = pair.lock().await;
                guard.ingest_statistics(&batch).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len().await, 1);
        let pair = registry.get(&id).await.unwrap();
        let guard = pair.lock().await;
        assert_strictly_increasing(&guard);
        assert_eq!(guard.z_history.last().unwrap().timestamp, 26);
    }

    #[tokio::test]
    async fn registry_lists_trading_tickers() {
        let registry = PairRegistry::new();
        let trading = registry.get_or_insert(&PairId::new("ETH", "SOL")).await;
        *trading.lock().await = entered_pair(2.0);
        registry.get_or_insert(&PairId::new("ADA", "XRP")).await;
        let tickers = registry.trading_tickers().await;
        assert!(tickers.contains("ETH") && tickers.contains("SOL"));
        assert!(!tickers.contains("ADA"));
        assert_eq!(registry.trading_pairs().await.len(), 1);
    }
}
