use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::{AveragingSettings, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::pair_state::{AveragingAudit, PairId, TrackedPair};
use crate::ports::execution::{ExecutionResult, OrderExecutor, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AveragingTrigger {
    Auto,
    Manual,
}

/// Drawdown (in percent, always negative) at which averaging number `k` fires, k from 0.
pub fn threshold_for(settings: &AveragingSettings, k: u32) -> f64 {
    -(settings.drawdown_threshold * settings.multiplier.powi(k as i32)).abs()
}

/// Margin multiple used by averaging number `k`.
pub fn margin_scale(settings: &AveragingSettings, k: u32) -> f64 {
    settings.multiplier.powi(k as i32 + 1)
}

pub fn should_average(pair: &TrackedPair, settings: &AveragingSettings) -> bool {
    if !settings.auto_averaging_enabled || !pair.is_trading() {
        return false;
    }
    let k = pair.averaging.count;
    if k >= settings.max_averaging_count {
        return false;
    }
    let Some(profit) = pair.profit_percent else {
        return false;
    };
    let threshold = threshold_for(settings, k);
    let fire = profit <= threshold;
    if fire {
        log::info!(
            "[AVG] {} profit {:.2}% <= threshold {:.2}% (averaging #{})",
            pair.id,
            profit,
            threshold,
            k + 1
        );
    }
    fire
}

#[derive(Debug, Clone, PartialEq)]
pub struct AveragingReport {
    pub pair: PairId,
    pub trigger: AveragingTrigger,
    pub count: u32,
    pub threshold: f64,
    pub margin_scale: f64,
    pub long: ExecutionResult,
    pub short: ExecutionResult,
}

fn to_decimal(value: f64, what: &str) -> EngineResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| EngineError::Execution(format!("cannot convert {} {} to decimal", what, value)))
}

/// Adds to an open pair. The pair's counters move only after both legs fill.
pub struct AveragingController {
    executor: Arc<dyn OrderExecutor>,
}

impl AveragingController {
    pub fn new(executor: Arc<dyn OrderExecutor>) -> Self {
        Self { executor }
    }

    pub async fn execute(
        &self,
        pair: &mut TrackedPair,
        cfg: &EngineConfig,
        trigger: AveragingTrigger,
        now: DateTime<Utc>,
    ) -> EngineResult<AveragingReport> {
        let settings = &cfg.averaging;
        if !pair.is_trading() {
            return Err(EngineError::NotEligible(format!(
                "{} is not in an open trade",
                pair.id
            )));
        }
        let k = pair.averaging.count;
        if k >= settings.max_averaging_count {
            return Err(EngineError::NotEligible(format!(
                "{} already averaged {} of {} times",
                pair.id, k, settings.max_averaging_count
            )));
        }

        let scale = margin_scale(settings, k);
        let threshold = threshold_for(settings, k);
        let leverage = to_decimal(cfg.trading.leverage, "leverage")?;
        let long_notional = to_decimal(
            cfg.trading.max_long_margin_size * scale * cfg.trading.leverage,
            "long notional",
        )?;
        let short_notional = to_decimal(
            cfg.trading.max_short_margin_size * scale * cfg.trading.leverage,
            "short notional",
        )?;

        log::info!(
            "[AVG] {} {:?} averaging #{} scale={:.3} long={} short={}",
            pair.id,
            trigger,
            k + 1,
            scale,
            long_notional.round_dp(4),
            short_notional.round_dp(4)
        );

        let long = self
            .executor
            .open_position(&pair.id.long_ticker, Side::Long, long_notional, leverage)
            .await?;
        if !long.success {
            log::warn!("[AVG] {} long leg not filled", pair.id);
            return Err(EngineError::Execution(format!(
                "{} long leg not filled",
                pair.id.long_ticker
            )));
        }
        let short = match self
            .executor
            .open_position(&pair.id.short_ticker, Side::Short, short_notional, leverage)
            .await
        {
            Ok(result) if result.success => result,
            Ok(_) => {
                log::error!(
                    "[AVG] {} short leg not filled after long leg filled size={}",
                    pair.id,
                    long.size
                );
                return Err(EngineError::Execution(format!(
                    "{} short leg not filled, long leg left unhedged",
                    pair.id.short_ticker
                )));
            }
            Err(err) => {
                log::error!(
                    "[AVG] {} short leg failed after long leg filled: {}",
                    pair.id,
                    err
                );
                return Err(err);
            }
        };

        pair.averaging.count = k + 1;
        pair.averaging.last_timestamp = Some(now.timestamp_millis());
        pair.averaging.last_profit_percent = pair.profit_percent;
        pair.averaging.audit = Some(AveragingAudit {
            base_threshold: settings.drawdown_threshold,
            multiplier: settings.multiplier,
            max_count: settings.max_averaging_count,
            threshold,
            margin_scale: scale,
        });
        log::info!(
            "[AVG] {} averaged ({}/{}) at profit {:?}",
            pair.id,
            pair.averaging.count,
            settings.max_averaging_count,
            pair.profit_percent
        );

        Ok(AveragingReport {
            pair: pair.id.clone(),
            trigger,
            count: pair.averaging.count,
            threshold,
            margin_scale: scale,
            long,
            short,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair_state::test_support::entered_pair;
    use crate::pair_state::PairId;
    use crate::ports::execution::PairPnl;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct DummyExecutor {
        calls: Mutex<Vec<(String, Side, Decimal, Decimal)>>,
        fail_on_call: Option<usize>,
        unfilled_on_call: Option<usize>,
    }

    #[async_trait]
    impl OrderExecutor for DummyExecutor {
        async fn open_position(
            &self,
            instrument: &str,
            side: Side,
            notional: Decimal,
            leverage: Decimal,
        ) -> EngineResult<ExecutionResult> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((instrument.to_string(), side, notional, leverage));
            let n = calls.len();
            if self.fail_on_call == Some(n) {
                return Err(EngineError::Execution("exchange rejected".to_string()));
            }
            Ok(ExecutionResult {
                price: dec!(100),
                size: notional / dec!(100),
                fees: Decimal::ZERO,
                success: self.unfilled_on_call != Some(n),
            })
        }

        async fn close_position(&self, _instrument: &str) -> EngineResult<ExecutionResult> {
            Err(EngineError::Execution("not used".to_string()))
        }

        async fn available_balance(&self) -> EngineResult<f64> {
            Ok(10_000.0)
        }

        async fn pair_pnl(&self, _id: &PairId) -> EngineResult<PairPnl> {
            Ok(PairPnl::default())
        }
    }

    fn settings() -> AveragingSettings {
        AveragingSettings {
            auto_averaging_enabled: true,
            drawdown_threshold: 10.0,
            multiplier: 1.5,
            max_averaging_count: 3,
        }
    }

    fn cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.averaging = settings();
        cfg.trading.max_long_margin_size = 100.0;
        cfg.trading.max_short_margin_size = 80.0;
        cfg.trading.leverage = 2.0;
        cfg
    }

    #[test]
    fn thresholds_deepen_geometrically() {
        let mut s = settings();
        let expected = [-10.0, -15.0, -22.5];
        for (k, want) in expected.iter().enumerate() {
            assert!((threshold_for(&s, k as u32) - want).abs() < 1e-9);
        }
        s.drawdown_threshold = -10.0;
        for (k, want) in expected.iter().enumerate() {
            assert!((threshold_for(&s, k as u32) - want).abs() < 1e-9);
        }
        assert!((margin_scale(&s, 0) - 1.5).abs() < 1e-12);
        assert!((margin_scale(&s, 1) - 2.25).abs() < 1e-12);
    }

    #[test]
    fn should_average_respects_threshold_and_cap() {
        let s = settings();
        let mut pair = entered_pair(2.0);
        pair.record_profit_point(-9.9, 60_000);
        assert!(!should_average(&pair, &s));
        pair.record_profit_point(-10.0, 120_000);
        assert!(should_average(&pair, &s));

        pair.averaging.count = 1;
        assert!(!should_average(&pair, &s));
        pair.record_profit_point(-15.0, 180_000);
        assert!(should_average(&pair, &s));

        pair.averaging.count = 3;
        pair.record_profit_point(-90.0, 240_000);
        assert!(!should_average(&pair, &s));
    }

    #[test]
    fn should_average_needs_enabled_open_trade() {
        let mut s = settings();
        let mut pair = entered_pair(2.0);
        pair.record_profit_point(-50.0, 60_000);
        s.auto_averaging_enabled = false;
        assert!(!should_average(&pair, &s));

        let mut stable = TrackedPair::new(PairId::new("A", "B"));
        stable.profit_percent = Some(-50.0);
        assert!(!should_average(&stable, &settings()));
    }

    #[tokio::test]
    async fn execute_scales_margin_and_records_state() {
        let executor = Arc::new(DummyExecutor::default());
        let controller = AveragingController::new(executor.clone());
        let mut pair = entered_pair(2.0);
        pair.record_profit_point(-12.0, 60_000);

        let at = Utc.timestamp_millis_opt(90_000).unwrap();
        let report = controller
            .execute(&mut pair, &cfg(), AveragingTrigger::Auto, at)
            .await
            .unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(pair.averaging.count, 1);
        assert_eq!(pair.averaging.last_profit_percent, Some(-12.0));
        assert_eq!(pair.averaging.last_timestamp, Some(90_000));
        let audit = pair.averaging.audit.unwrap();
        assert_eq!(audit.multiplier, 1.5);
        assert_eq!(audit.max_count, 3);

        {
            let calls = executor.calls.lock().unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0], ("ETH".to_string(), Side::Long, dec!(300), dec!(2)));
            assert_eq!(calls[1], ("SOL".to_string(), Side::Short, dec!(240), dec!(2)));
        }

        controller
            .execute(&mut pair, &cfg(), AveragingTrigger::Manual, Utc::now())
            .await
            .unwrap();
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls[2].2, dec!(450));
        assert_eq!(pair.averaging.count, 2);
    }

    #[tokio::test]
    async fn failed_execution_leaves_counters_alone() {
        for executor in [
            DummyExecutor {
                fail_on_call: Some(1),
                ..Default::default()
            },
            DummyExecutor {
                fail_on_call: Some(2),
                ..Default::default()
            },
            DummyExecutor {
                unfilled_on_call: Some(1),
                ..Default::default()
            },
        ] {
            let controller = AveragingController::new(Arc::new(executor));
            let mut pair = entered_pair(2.0);
            pair.record_profit_point(-12.0, 60_000);
            let result = controller
                .execute(&mut pair, &cfg(), AveragingTrigger::Auto, Utc::now())
                .await;
            assert!(matches!(result, Err(EngineError::Execution(_))));
            assert_eq!(pair.averaging.count, 0);
            assert!(pair.averaging.last_timestamp.is_none());
            assert!(pair.averaging.audit.is_none());
        }
    }

    #[tokio::test]
    async fn execute_refuses_beyond_cap_or_without_trade() {
        let controller = AveragingController::new(Arc::new(DummyExecutor::default()));
        let mut pair = entered_pair(2.0);
        pair.averaging.count = 3;
        assert!(matches!(
            controller
                .execute(&mut pair, &cfg(), AveragingTrigger::Manual, Utc::now())
                .await,
            Err(EngineError::NotEligible(_))
        ));
        let mut stable = TrackedPair::new(PairId::new("A", "B"));
        assert!(controller
            .execute(&mut stable, &cfg(), AveragingTrigger::Manual, Utc::now())
            .await
            .is_err());
    }
}
