use serde::Serialize;

use crate::config::EngineConfig;

/// Capital needed to run the configured number of pairs through every averaging level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapitalRequirement {
    pub pairs_count: u32,
    pub base_per_pair: f64,
    pub total_base: f64,
    pub total_averaging: f64,
    pub total_required: f64,
    pub averaging_enabled: bool,
    pub max_averaging_count: u32,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DepositCheck {
    pub required: f64,
    pub available: f64,
    pub exceeded: bool,
    /// Positive when the deposit covers the requirement.
    pub difference: f64,
    pub utilization_percent: f64,
}

/// Balance the admission gate may commit.
pub trait CapitalView {
    fn available_balance(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CapitalSnapshot {
    pub available: f64,
}

impl CapitalSnapshot {
    pub fn new(available: f64) -> Self {
        Self { available }
    }
}

impl CapitalView for CapitalSnapshot {
    fn available_balance(&self) -> f64 {
        self.available
    }
}

pub fn required_capital(cfg: &EngineConfig) -> CapitalRequirement {
    let pairs = cfg.trading.use_pairs;
    let base_per_pair = cfg.trading.margin_per_pair();
    let total_base = pairs as f64 * base_per_pair;
    let averaging = &cfg.averaging;
    let total_averaging = if averaging.auto_averaging_enabled {
        (1..=averaging.max_averaging_count)
            .map(|level| total_base * averaging.multiplier.powi(level as i32))
            .sum()
    } else {
        0.0
    };
    CapitalRequirement {
        pairs_count: pairs,
        base_per_pair,
        total_base,
        total_averaging,
        total_required: total_base + total_averaging,
        averaging_enabled: averaging.auto_averaging_enabled,
        max_averaging_count: averaging.max_averaging_count,
        multiplier: averaging.multiplier,
    }
}

pub fn check_deposit(requirement: &CapitalRequirement, available: f64) -> DepositCheck {
    let required = requirement.total_required;
    let utilization_percent = if available > 0.0 {
        required / available * 100.0
    } else {
        0.0
    };
    let check = DepositCheck {
        required,
        available,
        exceeded: required > available,
        difference: available - required,
        utilization_percent,
    };
    if check.exceeded {
        log::warn!(
            "[CAPITAL] required {:.2} exceeds deposit {:.2} ({:.1}% utilization)",
            required,
            available,
            utilization_percent
        );
    }
    check
}

/// Margin for one new pair at base size.
pub fn can_open_new_pair(cfg: &EngineConfig, view: &dyn CapitalView) -> bool {
    cfg.trading.margin_per_pair() <= view.available_balance()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pairs: u32, averaging: bool) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.trading.use_pairs = pairs;
        cfg.trading.max_long_margin_size = 100.0;
        cfg.trading.max_short_margin_size = 100.0;
        cfg.averaging.auto_averaging_enabled = averaging;
        cfg.averaging.multiplier = 1.5;
        cfg.averaging.max_averaging_count = 3;
        cfg
    }

    #[test]
    fn base_only_without_averaging() {
        let req = required_capital(&cfg(2, false));
        assert_eq!(req.total_base, 400.0);
        assert_eq!(req.total_averaging, 0.0);
        assert_eq!(req.total_required, 400.0);
    }

    #[test]
    fn averaging_levels_compound() {
        let req = required_capital(&cfg(1, true));
        // 200 * (1.5 + 2.25 + 3.375)
        assert!((req.total_averaging - 1425.0).abs() < 1e-9);
        assert!((req.total_required - 1625.0).abs() < 1e-9);
        assert!(req.averaging_enabled);
    }

    #[test]
    fn deposit_check_reports_shortfall() {
        let req = required_capital(&cfg(1, true));
        let check = check_deposit(&req, 1000.0);
        assert!(check.exceeded);
        assert!((check.difference + 625.0).abs() < 1e-9);
        assert!((check.utilization_percent - 162.5).abs() < 1e-9);

        let empty = check_deposit(&req, 0.0);
        assert_eq!(empty.utilization_percent, 0.0);
    }

    #[test]
    fn new_pair_needs_both_margins() {
        let cfg = cfg(1, false);
        assert!(can_open_new_pair(&cfg, &CapitalSnapshot::new(200.0)));
        assert!(!can_open_new_pair(&cfg, &CapitalSnapshot::new(199.99)));
    }
}
