use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::{sorted_candles, Candle};

/// Height of the virtual chart both curves are drawn on.
pub const CANVAS_HEIGHT: f64 = 720.0;
/// Display range shared with the Z-score chart.
pub const NORMALIZED_MIN: f64 = -3.0;
pub const NORMALIZED_MAX: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelSpreadPoint {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSpreadStats {
    pub average: f64,
    pub max: f64,
    pub min: f64,
    pub current: f64,
    pub std_dev: f64,
}

fn normalize(candles: &[Candle]) -> Option<Vec<(i64, f64)>> {
    let min = candles.iter().map(|c| c.close).fold(f64::INFINITY, f64::min);
    let max = candles
        .iter()
        .map(|c| c.close)
        .fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if candles.is_empty() || !range.is_finite() || range <= 0.0 {
        return None;
    }
    Some(
        candles
            .iter()
            .map(|c| {
                let scaled = (c.close - min) / range;
                (
                    c.timestamp,
                    NORMALIZED_MIN + scaled * (NORMALIZED_MAX - NORMALIZED_MIN),
                )
            })
            .collect(),
    )
}

// `series` must be sorted by timestamp and non-empty. Ties go to the earlier sample.
fn nearest(series: &[(i64, f64)], timestamp: i64) -> f64 {
    let idx = series.partition_point(|(ts, _)| *ts < timestamp);
    if idx == 0 {
        return series[0].1;
    }
    if idx == series.len() {
        return series[idx - 1].1;
    }
    let (before_ts, before) = series[idx - 1];
    let (after_ts, after) = series[idx];
    if (after_ts - timestamp).abs() < (timestamp - before_ts).abs() {
        after
    } else {
        before
    }
}

/// Pixel distance between two price curves drawn on the same canvas, one sample per
/// timestamp in the union of both series. Returns an empty vector when either curve is
/// empty or flat, since a flat series has no normalized shape.
pub fn pixel_spread_points(a: &[Candle], b: &[Candle]) -> Vec<PixelSpreadPoint> {
    let (Some(norm_a), Some(norm_b)) = (normalize(&sorted_candles(a)), normalize(&sorted_candles(b)))
    else {
        return Vec::new();
    };

    let lo = norm_a
        .iter()
        .chain(norm_b.iter())
        .map(|(_, v)| *v)
        .fold(f64::INFINITY, f64::min);
    let hi = norm_a
        .iter()
        .chain(norm_b.iter())
        .map(|(_, v)| *v)
        .fold(f64::NEG_INFINITY, f64::max);
    let to_pixel = |value: f64| {
        if hi == lo {
            CANVAS_HEIGHT / 2.0
        } else {
            CANVAS_HEIGHT - (value - lo) / (hi - lo) * CANVAS_HEIGHT
        }
    };

    let timestamps: BTreeSet<i64> = norm_a
        .iter()
        .chain(norm_b.iter())
        .map(|(ts, _)| *ts)
        .collect();

    timestamps
        .into_iter()
        .map(|ts| PixelSpreadPoint {
            timestamp: ts,
            value: (to_pixel(nearest(&norm_a, ts)) - to_pixel(nearest(&norm_b, ts))).abs(),
        })
        .collect()
}

pub fn pixel_distance(a: &[Candle], b: &[Candle]) -> Vec<f64> {
    pixel_spread_points(a, b)
        .into_iter()
        .map(|p| p.value)
        .collect()
}

/// Summary of a spread series. `current` is the last sample.
pub fn spread_stats(values: &[f64]) -> Option<PixelSpreadStats> {
    let current = *values.last()?;
    let n = values.len() as f64;
    let average = values.iter().sum::<f64>() / n;
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let std_dev = if values.len() > 1 {
        let var = values.iter().map(|v| (v - average).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    } else {
        0.0
    };
    Some(PixelSpreadStats {
        average,
        max,
        min,
        current,
        std_dev,
    })
}
