use crate::config::{FilterSettings, ScoringWeights};
use crate::error::{EngineError, EngineResult};
use crate::model::{validate_aligned, Candidate, CandidateStats};
use crate::pixel_spread::{pixel_distance, spread_stats, CANVAS_HEIGHT};

const SIGNIFICANCE_LEVEL: f64 = 0.05;
const Z_FULL_WEIGHT_AT: f64 = 5.0;
const MIN_POINTS_FOR_CYCLES: usize = 10;
const MIN_CYCLE_RANGE_PX: f64 = 50.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub z_score: f64,
    pub pixel_spread: f64,
    pub cointegration: f64,
    pub model_quality: f64,
    pub statistics: f64,
    pub bonus: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.z_score
            + self.pixel_spread
            + self.cointegration
            + self.model_quality
            + self.statistics
            + self.bonus
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub pair: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFailure {
    pub pair: String,
    pub error: EngineError,
}

/// Outcome of one scan's scoring pass. `ranked` is ordered best first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringReport {
    pub ranked: Vec<ScoredCandidate>,
    pub rejected: Vec<Rejection>,
    pub failures: Vec<CandidateFailure>,
}

impl ScoringReport {
    pub fn best(&self) -> Option<&ScoredCandidate> {
        self.ranked.first()
    }
}

/// Returns the reason a candidate fails the hard criteria, or None if it survives.
pub fn hard_filter_reason(candidate: &Candidate, filters: &FilterSettings) -> Option<String> {
    let stats = &candidate.stats;
    let Some(z) = stats.latest_z() else {
        return Some("statistics missing".to_string());
    };
    if !candidate.has_valid_tickers() {
        return Some(format!(
            "invalid tickers '{}' / '{}'",
            candidate.long_ticker, candidate.short_ticker
        ));
    }
    if z <= 0.0 {
        return Some(format!("z-score {:.2} <= 0, no directional signal", z));
    }
    if filters.use_min_z_filter && z < filters.min_z {
        return Some(format!("z-score {:.2} < min {:.2}", z, filters.min_z));
    }
    if filters.use_max_p_value_filter {
        if let Some(p) = stats.correlation_significance() {
            if p > filters.max_p_value {
                return Some(format!("p-value {:.4} > max {:.4}", p, filters.max_p_value));
            }
        }
    }
    if filters.use_max_adf_value_filter {
        if let Some(adf) = stats.unit_root_p_value() {
            if adf > filters.max_adf_value {
                return Some(format!(
                    "adf p-value {:.4} > max {:.4}",
                    adf, filters.max_adf_value
                ));
            }
        }
    }
    if filters.use_min_r_squared_filter {
        match stats.r_squared {
            Some(r2) if r2 >= filters.min_r_squared => {}
            other => {
                return Some(format!(
                    "r-squared {:?} < min {:.2}",
                    other, filters.min_r_squared
                ))
            }
        }
    }
    if filters.use_min_correlation_filter {
        match stats.latest_correlation() {
            Some(corr) if corr.abs() >= filters.min_correlation => {}
            other => {
                return Some(format!(
                    "correlation {:?} < min {:.2}",
                    other, filters.min_correlation
                ))
            }
        }
    }
    None
}

fn significance_ratio(p: f64) -> f64 {
    ((SIGNIFICANCE_LEVEL - p.min(SIGNIFICANCE_LEVEL)) / SIGNIFICANCE_LEVEL).max(0.0)
}

pub fn z_component(z: f64, weight: f64) -> f64 {
    (z.abs() * weight / Z_FULL_WEIGHT_AT).min(weight)
}

/// Maps an average pixel spread to a share of the pixel weight.
pub fn spread_ratio(spread: f64) -> f64 {
    if !(0.0..=CANVAS_HEIGHT).contains(&spread) {
        return 0.0;
    }
    if spread <= 240.0 {
        0.1 + spread / 240.0 * 0.5
    } else if spread <= 480.0 {
        0.6 + (spread - 240.0) / 240.0 * 0.4
    } else {
        1.0 - (spread - 480.0) / 240.0 * 0.7
    }
}

/// Number of swings from the bottom decile of the spread range up to the top decile.
pub fn spread_cycles(series: &[f64]) -> usize {
    if series.len() < MIN_POINTS_FOR_CYCLES {
        return 0;
    }
    let min = series.iter().copied().fold(f64::INFINITY, f64::min);
    let max = series.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range < MIN_CYCLE_RANGE_PX {
        return 0;
    }
    let low = min + range * 0.1;
    let high = min + range * 0.9;
    let mut cycles = 0;
    let mut in_low = false;
    for value in series {
        if *value <= low {
            in_low = true;
        } else if *value >= high && in_low {
            cycles += 1;
            in_low = false;
        }
    }
    cycles
}

pub fn current_spread_bonus_ratio(current: f64) -> f64 {
    match current {
        s if s <= 0.0 => 0.0,
        s if s < 30.0 => -0.1,
        s if s < 60.0 => 0.0,
        s if s < 120.0 => 0.15,
        s if s < 240.0 => 0.30,
        s if s <= 480.0 => 0.45,
        s => 0.15 - ((s - 480.0) / 240.0).min(1.0) * 0.1,
    }
}

fn pixel_component(candidate: &Candidate, weight: f64) -> EngineResult<f64> {
    if candidate.long_candles.is_empty() || candidate.short_candles.is_empty() {
        log::debug!("[SCORE] {} has no candles, pixel score 0", candidate.name());
        return Ok(0.0);
    }
    validate_aligned(
        &candidate.name(),
        &candidate.long_candles,
        &candidate.short_candles,
    )?;
    let series = pixel_distance(&candidate.long_candles, &candidate.short_candles);
    let Some(stats) = spread_stats(&series) else {
        log::debug!("[SCORE] {} has a flat leg, pixel score 0", candidate.name());
        return Ok(0.0);
    };

    let base = spread_ratio(stats.average) * weight;
    let volatility = match spread_cycles(&series) {
        0 => 0.0,
        1 => weight * 0.07,
        _ => weight * 0.15,
    };
    let current = current_spread_bonus_ratio(stats.current) * weight;
    log::debug!(
        "[SCORE] {} pixel avg={:.1}px current={:.1}px base={:.2} volatility={:.2} current_bonus={:.2}",
        candidate.name(),
        stats.average,
        stats.current,
        base,
        volatility,
        current
    );
    Ok(base + volatility + current)
}

fn present_positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

pub fn cointegration_component(stats: &CandidateStats, weight: f64) -> f64 {
    let johansen = present_positive(stats.johansen_p_value);
    let adf = present_positive(stats.unit_root_p_value());
    let mut score = match (johansen, adf) {
        (Some(j), Some(a)) => {
            significance_ratio(j) * weight * 0.5 + significance_ratio(a) * weight * 0.5
        }
        (Some(p), None) | (None, Some(p)) => significance_ratio(p) * weight,
        (None, None) => 0.0,
    };
    if let (Some(_), Some(trace), Some(critical)) = (
        johansen,
        stats.johansen_trace_statistic,
        stats.johansen_critical_value_95,
    ) {
        if trace > critical {
            score += weight * 0.05;
        }
    }
    score
}

pub fn model_quality_component(stats: &CandidateStats, weight: f64) -> f64 {
    let mut score = 0.0;
    if let Some(r2) = present_positive(stats.r_squared) {
        score += r2 * weight * 0.75;
    }
    if let (Some(stable), Some(total)) = (stats.stable_periods, stats.total_observations) {
        if total > 0 {
            score += stable as f64 / total as f64 * weight * 0.25;
        }
    }
    score
}

pub fn statistics_component(stats: &CandidateStats, weight: f64) -> f64 {
    let mut score = 0.0;
    if let Some(p) = stats.correlation_significance().filter(|p| *p >= 0.0) {
        score += significance_ratio(p) * weight * 0.5;
    }
    if let Some(corr) = stats.latest_correlation() {
        score += corr.abs().min(1.0) * weight * 0.5;
    }
    score
}

pub fn bonus_component(stats: &CandidateStats, weight: f64) -> f64 {
    let mut score = 0.0;
    if stats.johansen_p_value.is_some() && stats.johansen_trace_statistic.is_some() {
        score += weight * 0.3;
    }
    if stats.stable_periods.is_some() && stats.total_observations.is_some() {
        score += weight * 0.2;
    }
    if stats.r_squared.map_or(false, |r2| r2 > 0.8) {
        score += weight * 0.3;
    }
    score
}

/// Composite score of a candidate that already passed the hard filter.
pub fn score_candidate(
    candidate: &Candidate,
    weights: &ScoringWeights,
) -> EngineResult<ScoredCandidate> {
    let stats = &candidate.stats;
    let z = stats
        .latest_z()
        .ok_or_else(|| EngineError::insufficient(candidate.name(), "z-score missing"))?;

    let mut breakdown = ScoreBreakdown::default();
    if weights.use_z_score_scoring {
        breakdown.z_score = z_component(z, weights.z_score_weight);
    }
    if weights.use_pixel_spread_scoring {
        breakdown.pixel_spread = pixel_component(candidate, weights.pixel_spread_weight)?;
    }
    if weights.use_cointegration_scoring {
        breakdown.cointegration = cointegration_component(stats, weights.cointegration_weight);
    }
    if weights.use_model_quality_scoring {
        breakdown.model_quality = model_quality_component(stats, weights.model_quality_weight);
    }
    if weights.use_statistics_scoring {
        breakdown.statistics = statistics_component(stats, weights.statistics_weight);
    }
    if weights.use_bonus_scoring {
        breakdown.bonus = bonus_component(stats, weights.bonus_weight);
    }

    let score = breakdown.total();
    if !score.is_finite() {
        return Err(EngineError::NonFinite {
            pair: candidate.name(),
            what: "score".to_string(),
        });
    }
    Ok(ScoredCandidate {
        candidate: candidate.clone(),
        score,
        breakdown,
    })
}

/// Filters and scores a scan. A candidate that cannot be scored is recorded as a failure
/// and the rest of the batch continues.
pub fn rank(
    candidates: &[Candidate],
    weights: &ScoringWeights,
    filters: &FilterSettings,
) -> ScoringReport {
    let mut report = ScoringReport::default();
    for candidate in candidates {
        if let Some(reason) = hard_filter_reason(candidate, filters) {
            log::info!("[SCORE] {} rejected: {}", candidate.name(), reason);
            report.rejected.push(Rejection {
                pair: candidate.name(),
                reason,
            });
            continue;
        }
        match score_candidate(candidate, weights) {
            Ok(scored) => report.ranked.push(scored),
            Err(error) => {
                log::warn!("[SCORE] {} excluded: {}", candidate.name(), error);
                report.failures.push(CandidateFailure {
                    pair: candidate.name(),
                    error,
                });
            }
        }
    }
    // sort_by is stable, so equal scores keep scan order
    report.ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    if let Some(best) = report.best() {
        log::info!(
            "[SCORE] best {} score={:.2} of {} ranked, {} rejected, {} failed",
            best.candidate.name(),
            best.score,
            report.ranked.len(),
            report.rejected.len(),
            report.failures.len()
        );
    }
    report
}

pub fn select_best(
    candidates: &[Candidate],
    weights: &ScoringWeights,
    filters: &FilterSettings,
) -> Option<Candidate> {
    rank(candidates, weights, filters)
        .ranked
        .into_iter()
        .next()
        .map(|scored| scored.candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::series;

    fn candidate(long: &str, short: &str, z: f64, corr: f64, p_coint: f64) -> Candidate {
        Candidate {
            long_ticker: long.into(),
            short_ticker: short.into(),
            stats: CandidateStats {
                latest_z_score: Some(z),
                correlation: Some(corr),
                cointegration_p_value: Some(p_coint),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn permissive_filters() -> FilterSettings {
        FilterSettings {
            use_min_z_filter: false,
            use_max_p_value_filter: false,
            use_max_adf_value_filter: false,
            use_min_r_squared_filter: false,
            use_min_correlation_filter: false,
            ..FilterSettings::default()
        }
    }

    #[test]
    fn z_component_is_linear_then_capped() {
        assert!((z_component(2.0, 20.0) - 8.0).abs() < 1e-12);
        assert!((z_component(-2.5, 40.0) - 20.0).abs() < 1e-12);
        assert_eq!(z_component(5.0, 20.0), 20.0);
        assert_eq!(z_component(9.0, 20.0), 20.0);
    }

    #[test]
    fn spread_ratio_has_three_segments() {
        assert!((spread_ratio(0.0) - 0.1).abs() < 1e-12);
        assert!((spread_ratio(240.0) - 0.6).abs() < 1e-12);
        assert!((spread_ratio(480.0) - 1.0).abs() < 1e-12);
        assert!((spread_ratio(720.0) - 0.3).abs() < 1e-12);
        assert_eq!(spread_ratio(-1.0), 0.0);
        assert_eq!(spread_ratio(721.0), 0.0);
    }

    #[test]
    fn current_spread_bonus_penalizes_near_zero() {
        assert_eq!(current_spread_bonus_ratio(10.0), -0.1);
        assert_eq!(current_spread_bonus_ratio(300.0), 0.45);
        assert!((current_spread_bonus_ratio(720.0) - 0.05).abs() < 1e-12);
        assert_eq!(current_spread_bonus_ratio(0.0), 0.0);
    }

    #[test]
    fn cycles_need_range_and_points() {
        let swing = [0.0, 100.0, 0.0, 100.0, 0.0, 100.0, 50.0, 50.0, 50.0, 50.0];
        assert_eq!(spread_cycles(&swing), 3);
        let narrow = [0.0, 40.0, 0.0, 40.0, 0.0, 40.0, 0.0, 40.0, 0.0, 40.0];
        assert_eq!(spread_cycles(&narrow), 0);
        assert_eq!(spread_cycles(&[0.0, 100.0, 0.0]), 0);
    }

    #[test]
    fn cointegration_splits_weight_when_both_tests_present() {
        let mut stats = CandidateStats {
            cointegration_p_value: Some(0.01),
            ..Default::default()
        };
        assert!((cointegration_component(&stats, 20.0) - 16.0).abs() < 1e-9);

        stats.johansen_p_value = Some(0.0);
        assert!((cointegration_component(&stats, 20.0) - 16.0).abs() < 1e-9);

        stats.johansen_p_value = Some(0.025);
        stats.johansen_trace_statistic = Some(30.0);
        stats.johansen_critical_value_95 = Some(20.0);
        // 0.5*20*0.5 + 0.8*20*0.5 + 1.0
        assert!((cointegration_component(&stats, 20.0) - 14.0).abs() < 1e-9);

        stats.cointegration_p_value = Some(0.2);
        stats.johansen_trace_statistic = None;
        assert!((cointegration_component(&stats, 20.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn trace_bonus_needs_a_johansen_p_value() {
        let mut stats = CandidateStats {
            cointegration_p_value: Some(0.01),
            johansen_trace_statistic: Some(30.0),
            johansen_critical_value_95: Some(20.0),
            ..Default::default()
        };
        assert!((cointegration_component(&stats, 20.0) - 16.0).abs() < 1e-9);

        stats.johansen_p_value = Some(0.01);
        // 0.8*20*0.5 + 0.8*20*0.5 + 1.0
        assert!((cointegration_component(&stats, 20.0) - 17.0).abs() < 1e-9);
    }

    #[test]
    fn model_quality_and_bonus_use_optional_fields() {
        let stats = CandidateStats {
            r_squared: Some(0.9),
            stable_periods: Some(50),
            total_observations: Some(100),
            ..Default::default()
        };
        assert!((model_quality_component(&stats, 20.0) - (13.5 + 2.5)).abs() < 1e-9);
        assert!((bonus_component(&stats, 10.0) - 5.0).abs() < 1e-9);
        assert_eq!(model_quality_component(&CandidateStats::default(), 20.0), 0.0);
    }

    #[test]
    fn statistics_mix_significance_and_correlation() {
        let stats = CandidateStats {
            correlation_p_value: Some(0.0),
            correlation: Some(-1.4),
            ..Default::default()
        };
        assert!((statistics_component(&stats, 10.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn hard_filter_reports_first_failing_rule() {
        let filters = FilterSettings::default();
        let mut c = candidate("A", "A", 2.5, 0.9, 0.01);
        assert!(hard_filter_reason(&c, &filters)
            .unwrap()
            .contains("invalid tickers"));
        c.short_ticker = "B".into();
        c.stats.latest_z_score = Some(-1.0);
        assert!(hard_filter_reason(&c, &filters).unwrap().contains("<= 0"));
        c.stats.latest_z_score = Some(2.5);
        assert!(hard_filter_reason(&c, &filters)
            .unwrap()
            .contains("r-squared"));
        c.stats.r_squared = Some(0.7);
        assert_eq!(hard_filter_reason(&c, &filters), None);
        c.stats.cointegration_p_value = Some(0.3);
        assert!(hard_filter_reason(&c, &filters).unwrap().contains("adf"));
        assert_eq!(
            hard_filter_reason(&Candidate::default(), &filters).as_deref(),
            Some("statistics missing")
        );
    }

    #[test]
    fn correlation_filters_reject_weak_or_insignificant_pairs() {
        let filters = FilterSettings::default();
        let mut c = candidate("A", "B", 2.5, 0.9, 0.01);
        c.stats.r_squared = Some(0.7);
        assert_eq!(hard_filter_reason(&c, &filters), None);

        c.stats.correlation_p_value = Some(0.2);
        assert!(hard_filter_reason(&c, &filters).unwrap().contains("p-value 0.2000"));
        c.stats.correlation_p_value = Some(0.01);

        c.stats.correlation = Some(0.3);
        assert!(hard_filter_reason(&c, &filters)
            .unwrap()
            .contains("correlation"));

        c.stats.correlation = Some(-0.85);
        assert_eq!(hard_filter_reason(&c, &filters), None);
    }

    #[test]
    fn ties_keep_scan_order() {
        let list = vec![
            candidate("A", "B", 3.0, 0.9, 0.01),
            candidate("C", "D", 3.0, 0.9, 0.01),
            candidate("E", "F", 4.0, 0.9, 0.01),
        ];
        let report = rank(&list, &ScoringWeights::uniform(20.0), &permissive_filters());
        let order: Vec<String> = report.ranked.iter().map(|s| s.candidate.name()).collect();
        assert_eq!(order, vec!["E/F", "A/B", "C/D"]);
    }

    #[test]
    fn scoring_twice_gives_identical_results() {
        let mut list = vec![
            candidate("A", "B", 2.2, 0.8, 0.02),
            candidate("C", "D", 3.1, 0.7, 0.04),
            candidate("E", "F", 1.4, 0.95, 0.001),
        ];
        list[1].long_candles = series(&[1.0, 3.0, 2.0, 5.0, 4.0, 6.0]);
        list[1].short_candles = series(&[2.0, 1.0, 4.0, 3.0, 6.0, 5.0]);
        let weights = ScoringWeights::default();
        let first = rank(&list, &weights, &permissive_filters());
        let second = rank(&list, &weights, &permissive_filters());
        assert_eq!(first, second);
        assert_eq!(first.ranked.len(), 3);
    }

    #[test]
    fn misaligned_candles_exclude_only_that_candidate() {
        let mut bad = candidate("A", "B", 4.0, 0.9, 0.01);
        bad.long_candles = series(&[1.0, 2.0, 3.0]);
        bad.short_candles = series(&[1.0, 2.0]);
        let good = candidate("C", "D", 2.0, 0.9, 0.01);
        let report = rank(
            &[bad, good],
            &ScoringWeights::default(),
            &permissive_filters(),
        );
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].error,
            EngineError::SeriesMismatch { .. }
        ));
        assert_eq!(report.best().unwrap().candidate.name(), "C/D");
    }

    #[test]
    fn low_z_candidate_is_filtered_and_strong_pair_selected() {
        let list = vec![
            candidate("A", "B", 2.0, 0.9, 0.01),
            candidate("C", "D", 0.5, 0.2, 0.2),
        ];
        let filters = FilterSettings {
            use_min_z_filter: true,
            min_z: 1.0,
            ..permissive_filters()
        };
        let weights = ScoringWeights::uniform(20.0);
        let report = rank(&list, &weights, &filters);

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].pair, "C/D");
        assert!(report.rejected[0].reason.contains("min"));

        let best = report.best().unwrap();
        assert_eq!(best.candidate.name(), "A/B");
        assert!((best.breakdown.z_score - 8.0).abs() < 1e-9);
        assert!((best.breakdown.cointegration - 16.0).abs() < 1e-9);
        assert!((best.breakdown.statistics - 9.0).abs() < 1e-9);
        assert_eq!(best.breakdown.pixel_spread, 0.0);
        assert!((best.score - 33.0).abs() < 1e-9);

        let selected = select_best(&list, &weights, &filters).unwrap();
        assert_eq!(selected.name(), "A/B");
    }

    #[test]
    fn empty_batch_selects_nothing() {
        assert!(select_best(&[], &ScoringWeights::default(), &FilterSettings::default()).is_none());
    }
}
