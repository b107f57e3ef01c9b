use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, EngineResult};
use crate::pair_state::PairId;
use crate::ports::execution::{ExecutionResult, OrderExecutor, PairPnl, PriceFeed, Side};

lazy_static! {
    static ref FILLED_PROBABILITY_IN_EMULATION: f64 = {
        match env::var("FILLED_PROBABILITY_IN_EMULATION") {
            Ok(val) => val.parse::<f64>().unwrap_or(1.0),
            Err(_) => 1.0,
        }
    };
    static ref PAPER_FEE_BPS: Decimal = {
        match env::var("PAPER_FEE_BPS") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(Decimal::ZERO),
            Err(_) => Decimal::ZERO,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PaperPosition {
    side: Side,
    size: Decimal,
    avg_price: Decimal,
    margin: Decimal,
}

/// Simulated executor for dry runs. Fills at the feed price and tracks positions per
/// instrument; fills are randomly refused according to `FILLED_PROBABILITY_IN_EMULATION`.
pub struct PaperExecutor {
    prices: Arc<dyn PriceFeed>,
    balance: Mutex<Decimal>,
    positions: Mutex<HashMap<String, PaperPosition>>,
    fill_probability: f64,
}

impl PaperExecutor {
    pub fn new(prices: Arc<dyn PriceFeed>, starting_balance: Decimal) -> Self {
        Self::with_fill_probability(prices, starting_balance, *FILLED_PROBABILITY_IN_EMULATION)
    }

    pub fn with_fill_probability(
        prices: Arc<dyn PriceFeed>,
        starting_balance: Decimal,
        fill_probability: f64,
    ) -> Self {
        Self {
            prices,
            balance: Mutex::new(starting_balance),
            positions: Mutex::new(HashMap::new()),
            fill_probability,
        }
    }

    fn position(&self, instrument: &str) -> EngineResult<Option<PaperPosition>> {
        let positions = self
            .positions
            .lock()
            .map_err(|_| EngineError::Execution("paper positions poisoned".to_string()))?;
        Ok(positions.get(instrument).copied())
    }

    fn leg_percent(&self, instrument: &str) -> EngineResult<(Decimal, Decimal, f64)> {
        let position = self.position(instrument)?.ok_or_else(|| {
            EngineError::insufficient(instrument, "no paper position for instrument")
        })?;
        let price = self
            .prices
            .last_price(instrument)
            .ok_or_else(|| EngineError::Source(format!("no price for {}", instrument)))?;
        let move_per_unit = match position.side {
            Side::Long => price - position.avg_price,
            Side::Short => position.avg_price - price,
        };
        let pnl = move_per_unit * position.size;
        let percent = if position.avg_price.is_zero() {
            0.0
        } else {
            (move_per_unit / position.avg_price * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        };
        Ok((pnl, position.margin, percent))
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn open_position(
        &self,
        instrument: &str,
        side: Side,
        notional: Decimal,
        leverage: Decimal,
    ) -> EngineResult<ExecutionResult> {
        if notional <= Decimal::ZERO || leverage <= Decimal::ZERO {
            return Err(EngineError::Execution(format!(
                "invalid order for {}: notional={} leverage={}",
                instrument, notional, leverage
            )));
        }
        let price = self
            .prices
            .last_price(instrument)
            .ok_or_else(|| EngineError::Execution(format!("no price for {}", instrument)))?;
        if price <= Decimal::ZERO {
            return Err(EngineError::Execution(format!(
                "non-positive price {} for {}",
                price, instrument
            )));
        }
        if self.fill_probability < 1.0 && rand::random::<f64>() >= self.fill_probability {
            log::info!("[PAPER] {} {:?} not filled (emulated)", instrument, side);
            return Ok(ExecutionResult {
                price,
                size: Decimal::ZERO,
                fees: Decimal::ZERO,
                success: false,
            });
        }

        let margin = notional / leverage;
        let fees = notional * *PAPER_FEE_BPS / Decimal::new(10_000, 0);
        let size = notional / price;
        let mut positions = self
            .positions
            .lock()
            .map_err(|_| EngineError::Execution("paper positions poisoned".to_string()))?;
        if let Some(held) = positions.get(instrument) {
            if held.side != side {
                return Err(EngineError::Execution(format!(
                    "{} already held {:?}, refusing {:?}",
                    instrument, held.side, side
                )));
            }
        }
        {
            let mut balance = self
                .balance
                .lock()
                .map_err(|_| EngineError::Execution("paper balance poisoned".to_string()))?;
            if *balance < margin + fees {
                return Err(EngineError::Execution(format!(
                    "insufficient paper balance {} for margin {}",
                    balance, margin
                )));
            }
            *balance -= margin + fees;
        }

        let entry = positions
            .entry(instrument.to_string())
            .or_insert(PaperPosition {
                side,
                size: Decimal::ZERO,
                avg_price: price,
                margin: Decimal::ZERO,
            });
        let total_size = entry.size + size;
        entry.avg_price = (entry.avg_price * entry.size + price * size) / total_size;
        entry.size = total_size;
        entry.margin += margin;
        log::info!(
            "[PAPER] filled {} {:?} size={} price={} avg={}",
            instrument,
            side,
            size.round_dp(6),
            price,
            entry.avg_price.round_dp(6)
        );

        Ok(ExecutionResult {
            price,
            size,
            fees,
            success: true,
        })
    }

    async fn close_position(&self, instrument: &str) -> EngineResult<ExecutionResult> {
        let price = self
            .prices
            .last_price(instrument)
            .ok_or_else(|| EngineError::Execution(format!("no price for {}", instrument)))?;
        let position = self
            .positions
            .lock()
            .map_err(|_| EngineError::Execution("paper positions poisoned".to_string()))?
            .remove(instrument)
            .ok_or_else(|| {
                EngineError::Execution(format!("no paper position to close for {}", instrument))
            })?;

        let move_per_unit = match position.side {
            Side::Long => price - position.avg_price,
            Side::Short => position.avg_price - price,
        };
        let fees = position.size * price * *PAPER_FEE_BPS / Decimal::new(10_000, 0);
        let proceeds = (position.margin + move_per_unit * position.size - fees).max(Decimal::ZERO);
        {
            let mut balance = self
                .balance
                .lock()
                .map_err(|_| EngineError::Execution("paper balance poisoned".to_string()))?;
            *balance += proceeds;
        }
        log::info!(
            "[PAPER] closed {} {:?} size={} price={} released={}",
            instrument,
            position.side,
            position.size.round_dp(6),
            price,
            proceeds.round_dp(4)
        );
        Ok(ExecutionResult {
            price,
            size: position.size,
            fees,
            success: true,
        })
    }

    async fn available_balance(&self) -> EngineResult<f64> {
        let balance = self
            .balance
            .lock()
            .map_err(|_| EngineError::Execution("paper balance poisoned".to_string()))?;
        Ok(balance.to_f64().unwrap_or(0.0))
    }

    async fn pair_pnl(&self, id: &PairId) -> EngineResult<PairPnl> {
        let (long_pnl, long_margin, long_percent) = self.leg_percent(&id.long_ticker)?;
        let (short_pnl, short_margin, short_percent) = self.leg_percent(&id.short_ticker)?;
        let margin = long_margin + short_margin;
        let profit_percent = if margin.is_zero() {
            0.0
        } else {
            ((long_pnl + short_pnl) / margin * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        };
        Ok(PairPnl {
            profit_percent,
            long_percent,
            short_percent,
        })
    }
}
