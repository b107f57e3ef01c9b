use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// One row of the analytics service's Z-score history for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZScorePoint {
    pub timestamp: i64,
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

/// Statistics snapshot produced upstream for a candidate pair. Scalar fields win over
/// the last history row when both are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CandidateStats {
    pub latest_z_score: Option<f64>,
    pub correlation: Option<f64>,
    pub correlation_p_value: Option<f64>,
    pub cointegration_p_value: Option<f64>,
    pub r_squared: Option<f64>,
    pub johansen_p_value: Option<f64>,
    pub johansen_trace_statistic: Option<f64>,
    pub johansen_critical_value_95: Option<f64>,
    pub stable_periods: Option<u32>,
    pub total_observations: Option<u32>,
    pub z_score_history: Vec<ZScorePoint>,
}

impl CandidateStats {
    pub fn latest_point(&self) -> Option<&ZScorePoint> {
        self.z_score_history.iter().max_by_key(|p| p.timestamp)
    }

    pub fn latest_z(&self) -> Option<f64> {
        self.latest_z_score
            .or_else(|| self.latest_point().map(|p| p.z_score))
    }

    pub fn latest_correlation(&self) -> Option<f64> {
        self.correlation
            .or_else(|| self.latest_point().map(|p| p.correlation))
    }

    pub fn correlation_significance(&self) -> Option<f64> {
        self.correlation_p_value
            .or_else(|| self.latest_point().map(|p| p.p_value))
    }

    pub fn unit_root_p_value(&self) -> Option<f64> {
        self.cointegration_p_value
            .or_else(|| self.latest_point().map(|p| p.adf_p_value))
    }

    /// Z-scores of the history ordered by timestamp.
    pub fn z_series(&self) -> Vec<f64> {
        let mut points: Vec<&ZScorePoint> = self.z_score_history.iter().collect();
        points.sort_by_key(|p| p.timestamp);
        points.into_iter().map(|p| p.z_score).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Candidate {
    /// Undervalued leg, bought.
    pub long_ticker: String,
    /// Overvalued leg, sold.
    pub short_ticker: String,
    pub stats: CandidateStats,
    pub long_candles: Vec<Candle>,
    pub short_candles: Vec<Candle>,
}

impl Candidate {
    pub fn name(&self) -> String {
        pair_name(&self.long_ticker, &self.short_ticker)
    }

    pub fn has_valid_tickers(&self) -> bool {
        let long = self.long_ticker.trim();
        let short = self.short_ticker.trim();
        !long.is_empty() && !short.is_empty() && long != short
    }
}

pub fn pair_name(long: &str, short: &str) -> String {
    format!("{}/{}", long, short)
}

pub fn sorted_candles(candles: &[Candle]) -> Vec<Candle> {
    let mut out = candles.to_vec();
    out.sort_by_key(|c| c.timestamp);
    out
}

/// Both legs must cover the same bars. Misaligned legs are an error, never truncated.
pub fn validate_aligned(pair: &str, long: &[Candle], short: &[Candle]) -> EngineResult<()> {
    if long.is_empty() || short.is_empty() {
        return Err(EngineError::insufficient(
            pair,
            format!("candles missing (long={}, short={})", long.len(), short.len()),
        ));
    }
    if long.len() != short.len() {
        return Err(EngineError::mismatch(
            pair,
            format!("length {} vs {}", long.len(), short.len()),
        ));
    }
    let bounds = |series: &[Candle]| {
        let first = series.iter().map(|c| c.timestamp).min().unwrap_or_default();
        let last = series.iter().map(|c| c.timestamp).max().unwrap_or_default();
        (first, last)
    };
    let (long_first, long_last) = bounds(long);
    let (short_first, short_last) = bounds(short);
    if long_first != short_first || long_last != short_last {
        return Err(EngineError::mismatch(
            pair,
            format!(
                "range [{}, {}] vs [{}, {}]",
                long_first, long_last, short_first, short_last
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn candle(timestamp: i64, close: f64) -> Candle {
        Candle {
            timestamp,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 0.0,
        }
    }

    pub fn series(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| candle(i as i64 * 60_000, *c))
            .collect()
    }

    pub fn point(timestamp: i64, z: f64) -> ZScorePoint {
        ZScorePoint {
            timestamp,
            z_score: z,
            correlation: 0.8,
            adf_p_value: 0.02,
            p_value: 0.01,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn scalar_fields_take_precedence_over_history() {
        let stats = CandidateStats {
            latest_z_score: Some(2.5),
            z_score_history: vec![point(1, 1.0), point(2, 1.5)],
            ..Default::default()
        };
        assert_eq!(stats.latest_z(), Some(2.5));
        assert_eq!(stats.latest_correlation(), Some(0.8));
        assert_eq!(stats.unit_root_p_value(), Some(0.02));
    }

    #[test]
    fn latest_point_uses_newest_timestamp() {
        let stats = CandidateStats {
            z_score_history: vec![point(5, 3.0), point(2, 1.0)],
            ..Default::default()
        };
        assert_eq!(stats.latest_z(), Some(3.0));
        assert_eq!(stats.z_series(), vec![1.0, 3.0]);
    }

    #[test]
    fn tickers_must_differ() {
        let mut candidate = Candidate {
            long_ticker: "ETH".into(),
            short_ticker: "ETH".into(),
            ..Default::default()
        };
        assert!(!candidate.has_valid_tickers());
        candidate.short_ticker = " ".into();
        assert!(!candidate.has_valid_tickers());
        candidate.short_ticker = "SOL".into();
        assert!(candidate.has_valid_tickers());
    }

    #[test]
    fn misaligned_legs_are_rejected() {
        let long = series(&[1.0, 2.0, 3.0]);
        let short = series(&[1.0, 2.0]);
        let err = validate_aligned("A/B", &long, &short).unwrap_err();
        assert!(matches!(err, EngineError::SeriesMismatch { .. }));

        let mut shifted = series(&[1.0, 2.0, 3.0]);
        shifted.iter_mut().for_each(|c| c.timestamp += 1);
        assert!(validate_aligned("A/B", &long, &shifted).is_err());
        assert!(validate_aligned("A/B", &long, &series(&[3.0, 2.0, 1.0])).is_ok());
    }

    #[test]
    fn empty_leg_is_insufficient_data() {
        let err = validate_aligned("A/B", &[], &series(&[1.0])).unwrap_err();
        assert!(err.is_data_problem());
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }
}
