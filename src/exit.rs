use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::config::ExitSettings;
use crate::pair_state::TrackedPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    ZMin,
    ZMax,
    Time,
    Breakeven,
    NegativeZMinProfit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::ZMin => "z_min",
            ExitReason::ZMax => "z_max",
            ExitReason::Time => "time",
            ExitReason::Breakeven => "breakeven",
            ExitReason::NegativeZMinProfit => "negative_z_min_profit",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First matching exit rule for an open pair. Pairs without an entry, a profit reading
/// or a current z-score never exit.
pub fn exit_reason(
    pair: &TrackedPair,
    cfg: &ExitSettings,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    let entry = pair.entry.as_ref()?;
    let profit = pair.profit_percent?;
    let z = pair.current_z()?;

    if cfg.use_exit_stop && profit <= cfg.exit_stop_percent {
        return Some(ExitReason::StopLoss);
    }
    if cfg.use_exit_take && profit >= cfg.exit_take_percent {
        return Some(ExitReason::TakeProfit);
    }
    if cfg.use_exit_z_min && z <= cfg.exit_z_min {
        return Some(ExitReason::ZMin);
    }
    if cfg.use_exit_z_max {
        let entry_z = entry.stats.z_score;
        let limit = match cfg.exit_z_max_percent {
            Some(percent) => entry_z * (1.0 + percent / 100.0),
            None => entry_z + cfg.exit_z_max,
        };
        if z >= limit {
            return Some(ExitReason::ZMax);
        }
    }
    if cfg.use_exit_time && (now - entry.entry_time).num_minutes() >= cfg.exit_time_minutes {
        return Some(ExitReason::Time);
    }
    if cfg.close_at_breakeven && profit >= cfg.exit_breakeven_percent {
        return Some(ExitReason::Breakeven);
    }
    if cfg.use_exit_negative_z_min_profit
        && z < 0.0
        && profit >= cfg.exit_negative_z_min_profit_percent
    {
        return Some(ExitReason::NegativeZMinProfit);
    }
    None
}
