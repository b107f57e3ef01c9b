use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crate::error::{EngineError, EngineResult};
use crate::model::{Candidate, CandidateStats, Candle};
use crate::pair_state::PairId;
use crate::ports::execution::PriceFeed;
use crate::ports::market_data::{AnalyticsSource, CandleSource};

// One line of the JSONL replay file
#[derive(Debug, Clone, Deserialize)]
struct ReplayFrame {
    timestamp: i64,
    #[serde(default)]
    candles: HashMap<String, Vec<Candle>>,
    #[serde(default)]
    candidates: Vec<Candidate>,
    /// Keyed by "LONG/SHORT".
    #[serde(default)]
    statistics: HashMap<String, CandidateStats>,
}

/// Serves recorded analytics and candles frame by frame for offline runs.
#[derive(Debug)]
pub struct ReplaySource {
    frames: Vec<ReplayFrame>,
    cursor: AtomicUsize,
}

impl ReplaySource {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open replay file {}", path_ref.display()))?;
        let reader = BufReader::new(file);
        let mut frames = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("failed to read replay line {}", idx + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: ReplayFrame = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse replay line {}", idx + 1))?;
            frames.push(frame);
        }

        if frames.is_empty() {
            return Err(anyhow!("replay file {} has no frames", path_ref.display()));
        }
        frames.sort_by_key(|f| f.timestamp);
        log::info!(
            "[REPLAY] loaded {} frames from {}",
            frames.len(),
            path_ref.display()
        );

        Ok(Self {
            frames,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Advances to the next frame. Returns false at the end of the data.
    pub fn tick(&self) -> bool {
        let current = self.cursor.load(AtomicOrdering::SeqCst);
        if current + 1 < self.frames.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn current_timestamp_ms(&self) -> Option<i64> {
        self.frame().map(|f| f.timestamp)
    }

    fn frame(&self) -> Option<&ReplayFrame> {
        self.frames.get(self.cursor.load(AtomicOrdering::SeqCst))
    }

    fn current_frame(&self) -> EngineResult<&ReplayFrame> {
        self.frame()
            .ok_or_else(|| EngineError::Source("replay cursor out of bounds".to_string()))
    }
}

#[async_trait]
impl CandleSource for ReplaySource {
    async fn fetch_candles(
        &self,
        instruments: &[String],
        _timeframe: &str,
        limit: usize,
    ) -> EngineResult<HashMap<String, Vec<Candle>>> {
        let frame = self.current_frame()?;
        let mut out = HashMap::new();
        for instrument in instruments {
            match frame.candles.get(instrument) {
                Some(series) => {
                    let start = series.len().saturating_sub(limit);
                    out.insert(instrument.clone(), series[start..].to_vec());
                }
                None => log::debug!(
                    "[REPLAY] {} has no candles at {}",
                    instrument,
                    frame.timestamp
                ),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl AnalyticsSource for ReplaySource {
    async fn fetch_candidates(&self) -> EngineResult<Vec<Candidate>> {
        Ok(self.current_frame()?.candidates.clone())
    }

    async fn fetch_pair_statistics(&self, id: &PairId) -> EngineResult<CandidateStats> {
        let frame = self.current_frame()?;
        let key = id.to_string();
        if let Some(stats) = frame.statistics.get(&key) {
            return Ok(stats.clone());
        }
        frame
            .candidates
            .iter()
            .find(|c| c.long_ticker == id.long_ticker && c.short_ticker == id.short_ticker)
            .map(|c| c.stats.clone())
            .ok_or_else(|| EngineError::insufficient(key, "no statistics in replay frame"))
    }
}

impl PriceFeed for ReplaySource {
    fn last_price(&self, instrument: &str) -> Option<Decimal> {
        let candle = self.frame()?.candles.get(instrument)?.iter().max_by_key(|c| c.timestamp)?;
        Decimal::from_f64(candle.close)
    }
}
