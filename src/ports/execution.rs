use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::EngineResult;
use crate::pair_state::PairId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub price: Decimal,
    pub size: Decimal,
    pub fees: Decimal,
    pub success: bool,
}

/// Live P&L of both legs of an open pair, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PairPnl {
    pub profit_percent: f64,
    pub long_percent: f64,
    pub short_percent: f64,
}

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn open_position(
        &self,
        instrument: &str,
        side: Side,
        notional: Decimal,
        leverage: Decimal,
    ) -> EngineResult<ExecutionResult>;

    /// Flattens whatever is held on `instrument` and releases its margin.
    async fn close_position(&self, instrument: &str) -> EngineResult<ExecutionResult>;

    async fn available_balance(&self) -> EngineResult<f64>;

    async fn pair_pnl(&self, id: &PairId) -> EngineResult<PairPnl>;
}

/// Latest traded price per instrument.
pub trait PriceFeed: Send + Sync {
    fn last_price(&self, instrument: &str) -> Option<Decimal>;
}
