use std::fmt;

use crate::capital::CapitalView;
use crate::config::{EngineConfig, FilterSettings};
use crate::model::{Candidate, CandidateStats};
use crate::pair_state::TrackedPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Automatic,
    /// Operator-initiated; skips the auto-trading switch.
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    TickerMismatch {
        expected_long: String,
        expected_short: String,
        long: String,
        short: String,
    },
    AutoTradingDisabled,
    NegativeZ(f64),
    ZBelowMinimum { z: f64, min: f64 },
    InsufficientCapital { required: f64, available: f64 },
    ZHistoryTooShort { required: usize, available: usize },
    ZNotDeclining { window: Vec<f64> },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TickerMismatch {
                expected_long,
                expected_short,
                long,
                short,
            } => write!(
                f,
                "tickers {}/{} do not match candidate {}/{}",
                long, short, expected_long, expected_short
            ),
            RejectReason::AutoTradingDisabled => write!(f, "auto trading is disabled"),
            RejectReason::NegativeZ(z) => write!(f, "z-score {:.2} is negative", z),
            RejectReason::ZBelowMinimum { z, min } => {
                write!(f, "z-score {:.2} below minimum {:.2}", z, min)
            }
            RejectReason::InsufficientCapital {
                required,
                available,
            } => write!(
                f,
                "required margin {:.2} exceeds available {:.2}",
                required, available
            ),
            RejectReason::ZHistoryTooShort {
                required,
                available,
            } => write!(
                f,
                "z-score history has {} points, decline filter needs {}",
                available, required
            ),
            RejectReason::ZNotDeclining { window } => {
                write!(f, "z-score is not declining over {:?}", window)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admit,
    Reject(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit)
    }
}

pub fn check_tickers(pair: &TrackedPair, candidate: &Candidate) -> Result<(), RejectReason> {
    if pair.id.long_ticker == candidate.long_ticker && pair.id.short_ticker == candidate.short_ticker
    {
        return Ok(());
    }
    Err(RejectReason::TickerMismatch {
        expected_long: candidate.long_ticker.clone(),
        expected_short: candidate.short_ticker.clone(),
        long: pair.id.long_ticker.clone(),
        short: pair.id.short_ticker.clone(),
    })
}

/// `cfg` must be the configuration loaded for this decision, not a cached copy.
pub fn check_auto_trading(cfg: &EngineConfig, mode: TriggerMode) -> Result<(), RejectReason> {
    match mode {
        TriggerMode::Manual => Ok(()),
        TriggerMode::Automatic if cfg.trading.auto_trading_enabled => Ok(()),
        TriggerMode::Automatic => Err(RejectReason::AutoTradingDisabled),
    }
}

pub fn check_min_z(pair: &TrackedPair, filters: &FilterSettings) -> Result<(), RejectReason> {
    let z = pair.current_z().unwrap_or(0.0);
    if z >= filters.min_z {
        return Ok(());
    }
    if z < 0.0 {
        Err(RejectReason::NegativeZ(z))
    } else {
        Err(RejectReason::ZBelowMinimum {
            z,
            min: filters.min_z,
        })
    }
}

pub fn check_balance(cfg: &EngineConfig, capital: &dyn CapitalView) -> Result<(), RejectReason> {
    let required = cfg.trading.margin_per_pair();
    let available = capital.available_balance();
    if required <= available {
        Ok(())
    } else {
        Err(RejectReason::InsufficientCapital {
            required,
            available,
        })
    }
}

/// Passes when the last N z-scores fall strictly at every step.
pub fn check_z_decline(
    stats: &CandidateStats,
    filters: &FilterSettings,
) -> Result<(), RejectReason> {
    if !filters.use_z_score_decline_filter {
        return Ok(());
    }
    let required = filters.z_score_decline_candles_count;
    let series = stats.z_series();
    if series.is_empty() || series.len() < required {
        return Err(RejectReason::ZHistoryTooShort {
            required,
            available: series.len(),
        });
    }
    let window = &series[series.len() - required..];
    if window.windows(2).all(|w| w[1] < w[0]) {
        Ok(())
    } else {
        Err(RejectReason::ZNotDeclining {
            window: window.to_vec(),
        })
    }
}

/// Runs the admission checks in order and stops at the first rejection.
pub fn can_open(
    pair: &TrackedPair,
    candidate: &Candidate,
    cfg: &EngineConfig,
    capital: &dyn CapitalView,
    mode: TriggerMode,
) -> Admission {
    let result = check_tickers(pair, candidate)
        .and_then(|_| check_auto_trading(cfg, mode))
        .and_then(|_| check_min_z(pair, &cfg.filters))
        .and_then(|_| check_balance(cfg, capital))
        .and_then(|_| check_z_decline(&candidate.stats, &cfg.filters));
    match result {
        Ok(()) => {
            log::info!("[GATE] {} admitted ({:?})", pair.id, mode);
            Admission::Admit
        }
        Err(reason) => {
            match reason {
                RejectReason::NegativeZ(_) => {
                    log::warn!("[GATE] {} rejected, negative z: {}", pair.id, reason)
                }
                RejectReason::ZBelowMinimum { .. } => {
                    log::warn!("[GATE] {} rejected, weak z: {}", pair.id, reason)
                }
                _ => log::info!("[GATE] {} rejected: {}", pair.id, reason),
            }
            Admission::Reject(reason)
        }
    }
}
