use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::admission::{can_open, Admission, RejectReason, TriggerMode};
use crate::averaging::{should_average, AveragingController, AveragingReport, AveragingTrigger};
use crate::capital::CapitalSnapshot;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::exit::{exit_reason, ExitReason};
use crate::model::{sorted_candles, validate_aligned, Candidate, CandidateStats, Candle, ZScorePoint};
use crate::pair_state::{EntryExecution, PairId, PairKind, PairRegistry, SharedPair};
use crate::pixel_spread::pixel_spread_points;
use crate::ports::execution::{ExecutionResult, OrderExecutor, Side};
use crate::ports::market_data::{with_timeout, AnalyticsSource, CandleSource, SettingsSource};
use crate::ports::replay_source::ReplaySource;
use crate::scoring::rank;
use crate::volatility::VolatilityBreaker;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// The volatility breaker blocked new trades.
    Vetoed,
    AtCapacity {
        open: usize,
        limit: u32,
    },
    NoCandidate,
    Rejected {
        pair: PairId,
        reason: RejectReason,
    },
    Opened {
        pair: PairId,
        long: ExecutionResult,
        short: ExecutionResult,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairAction {
    Held,
    Exited(ExitReason),
    Averaged(AveragingReport),
}

#[derive(Debug, Default)]
pub struct ReevaluateReport {
    pub actions: Vec<(PairId, PairAction)>,
    pub failures: Vec<(PairId, EngineError)>,
}

#[derive(Clone)]
enum Clock {
    System,
    Replay(Arc<ReplaySource>),
}

impl Clock {
    fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Replay(replay) => replay
                .current_timestamp_ms()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now),
        }
    }
}

// Everything a per-pair re-evaluation task needs, cloneable into a spawned task.
#[derive(Clone)]
struct PairWorker {
    analytics: Arc<dyn AnalyticsSource>,
    executor: Arc<dyn OrderExecutor>,
    averaging: Arc<AveragingController>,
    clock: Clock,
}

impl PairWorker {
    async fn reevaluate(
        &self,
        id: &PairId,
        pair: SharedPair,
        cfg: &EngineConfig,
    ) -> EngineResult<PairAction> {
        let limit = cfg.trading.fetch_timeout();
        let pnl = with_timeout("pair pnl", limit, self.executor.pair_pnl(id)).await?;
        // without fresh statistics the exit rules still run on the last snapshot
        let stats = match with_timeout(
            "pair statistics",
            limit,
            self.analytics.fetch_pair_statistics(id),
        )
        .await
        {
            Ok(stats) => Some(stats),
            Err(err) => {
                log::warn!("[EXIT] {} statistics unavailable ({}), using last snapshot", id, err);
                None
            }
        };

        let now = self.clock.now();
        let ts = now.timestamp_millis();
        let mut guard = pair.lock().await;
        if !guard.is_trading() {
            return Ok(PairAction::Held);
        }
        if let Some(stats) = &stats {
            let points = statistics_points(stats, ts);
            if !points.is_empty() {
                guard.ingest_statistics(&points)?;
            }
        }
        guard.record_profit_point(pnl.profit_percent, ts);
        guard.record_leg_changes(pnl.long_percent, pnl.short_percent, ts);

        if let Some(reason) = exit_reason(&guard, &cfg.exit, now) {
            log::info!(
                "[EXIT] {} {} at profit {:.2}% z={:?}",
                id,
                reason,
                pnl.profit_percent,
                guard.current_z()
            );
            guard.mark_completed(reason);
            if cfg.trading.dry_run {
                self.release_legs(id, limit).await;
            }
            return Ok(PairAction::Exited(reason));
        }
        if should_average(&guard, &cfg.averaging) {
            let report = self
                .averaging
                .execute(&mut guard, cfg, AveragingTrigger::Auto, now)
                .await?;
            return Ok(PairAction::Averaged(report));
        }
        Ok(PairAction::Held)
    }

    // Dry runs flatten both legs so the simulated margin comes back to the balance.
    async fn release_legs(&self, id: &PairId, limit: Duration) {
        for instrument in [&id.long_ticker, &id.short_ticker] {
            if let Err(err) =
                with_timeout("close position", limit, self.executor.close_position(instrument))
                    .await
            {
                log::error!("[EXIT] {} failed to close {}: {}", id, instrument, err);
            }
        }
    }
}

/// Points to feed the tracker. A stats snapshot without history becomes a single point
/// stamped `now_ms`.
fn statistics_points(stats: &CandidateStats, now_ms: i64) -> Vec<ZScorePoint> {
    if !stats.z_score_history.is_empty() {
        let mut points = stats.z_score_history.clone();
        // scalar fields win over the newest history row
        if let Some(newest) = points.iter_mut().max_by_key(|p| p.timestamp) {
            if let Some(z) = stats.latest_z_score {
                newest.z_score = z;
            }
            if let Some(corr) = stats.correlation {
                newest.correlation = corr;
            }
        }
        return points;
    }
    match stats.latest_z_score {
        Some(z) => vec![ZScorePoint {
            timestamp: now_ms,
            z_score: z,
            correlation: stats.correlation.unwrap_or_default(),
            adf_p_value: stats.cointegration_p_value.unwrap_or_default(),
            p_value: stats.correlation_p_value.unwrap_or_default(),
            ..ZScorePoint::default()
        }],
        None => Vec::new(),
    }
}

fn to_decimal(value: f64, what: &str) -> EngineResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| EngineError::Execution(format!("cannot convert {} {} to decimal", what, value)))
}

fn attach_candles(
    mut candidate: Candidate,
    candles: &HashMap<String, Vec<Candle>>,
) -> EngineResult<Candidate> {
    let name = candidate.name();
    let long = candles
        .get(&candidate.long_ticker)
        .map(|c| sorted_candles(c))
        .unwrap_or_default();
    let short = candles
        .get(&candidate.short_ticker)
        .map(|c| sorted_candles(c))
        .unwrap_or_default();
    validate_aligned(&name, &long, &short)?;
    candidate.long_candles = long;
    candidate.short_candles = short;
    Ok(candidate)
}

/// Drives the scan cycle (find and open one new pair) and the re-evaluation cycle
/// (exit or average the open ones).
pub struct DecisionEngine {
    settings: Arc<dyn SettingsSource>,
    analytics: Arc<dyn AnalyticsSource>,
    candles: Arc<dyn CandleSource>,
    executor: Arc<dyn OrderExecutor>,
    registry: PairRegistry,
    breaker: VolatilityBreaker,
    averaging: Arc<AveragingController>,
    replay: Option<Arc<ReplaySource>>,
}

impl DecisionEngine {
    pub async fn new(
        settings: Arc<dyn SettingsSource>,
        analytics: Arc<dyn AnalyticsSource>,
        candles: Arc<dyn CandleSource>,
        executor: Arc<dyn OrderExecutor>,
    ) -> Result<Self> {
        let cfg = settings.load().await?;
        cfg.validate()?;
        let breaker = VolatilityBreaker::new(candles.clone(), cfg.trading.fetch_timeout());
        Ok(Self {
            settings,
            analytics,
            candles,
            averaging: Arc::new(AveragingController::new(executor.clone())),
            executor,
            registry: PairRegistry::new(),
            breaker,
            replay: None,
        })
    }

    /// Runs against recorded frames: time follows the frame clock and `run` stops at
    /// the end of the file.
    pub fn with_replay(mut self, replay: Arc<ReplaySource>) -> Self {
        self.replay = Some(replay);
        self
    }

    pub fn registry(&self) -> &PairRegistry {
        &self.registry
    }

    fn clock(&self) -> Clock {
        match &self.replay {
            Some(replay) => Clock::Replay(replay.clone()),
            None => Clock::System,
        }
    }

    fn worker(&self) -> PairWorker {
        PairWorker {
            analytics: self.analytics.clone(),
            executor: self.executor.clone(),
            averaging: self.averaging.clone(),
            clock: self.clock(),
        }
    }

    async fn load_settings(&self) -> EngineResult<EngineConfig> {
        self.settings
            .load()
            .await
            .map_err(|e| EngineError::Source(format!("settings unavailable: {:#}", e)))
    }

    pub async fn scan_cycle(&self) -> EngineResult<ScanOutcome> {
        let cfg = self.load_settings().await?;
        let limit = cfg.trading.fetch_timeout();

        if !self.breaker.can_trade_now(&cfg.volatility).await {
            log::info!("[SCAN] volatility breaker vetoed new trades");
            return Ok(ScanOutcome::Vetoed);
        }

        let open = self.registry.trading_pairs().await.len();
        if open >= cfg.trading.use_pairs as usize {
            log::debug!(
                "[SCAN] {} of {} pairs open, skipping scan",
                open,
                cfg.trading.use_pairs
            );
            return Ok(ScanOutcome::AtCapacity {
                open,
                limit: cfg.trading.use_pairs,
            });
        }

        let candidates =
            with_timeout("candidates", limit, self.analytics.fetch_candidates()).await?;
        let busy = self.registry.trading_tickers().await;
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| {
                let overlaps =
                    busy.contains(&c.long_ticker) || busy.contains(&c.short_ticker);
                if overlaps {
                    log::debug!("[SCAN] {} skipped, ticker already trading", c.name());
                }
                !overlaps
            })
            .collect();
        if candidates.is_empty() {
            log::info!("[SCAN] no candidates this cycle");
            return Ok(ScanOutcome::NoCandidate);
        }

        let tickers: Vec<String> = candidates
            .iter()
            .flat_map(|c| [c.long_ticker.clone(), c.short_ticker.clone()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        // a failed fetch drops every candidate below instead of failing the cycle
        let candles = with_timeout(
            "pair candles",
            limit,
            self.candles
                .fetch_candles(&tickers, &cfg.trading.timeframe, cfg.trading.candle_limit),
        )
        .await
        .unwrap_or_else(|err| {
            log::warn!("[SCAN] candles unavailable: {}", err);
            HashMap::new()
        });
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter_map(|c| {
                let name = c.name();
                match attach_candles(c, &candles) {
                    Ok(c) => Some(c),
                    Err(err) => {
                        log::warn!("[SCAN] {} dropped: {}", name, err);
                        None
                    }
                }
            })
            .collect();

        let report = rank(&candidates, &cfg.scoring, &cfg.filters);
        let Some(best) = report.ranked.into_iter().next().map(|s| s.candidate) else {
            log::info!(
                "[SCAN] no candidate survived ({} rejected, {} failed)",
                report.rejected.len(),
                report.failures.len()
            );
            return Ok(ScanOutcome::NoCandidate);
        };
        self.open_pair(best, &cfg).await
    }

    async fn open_pair(&self, candidate: Candidate, cfg: &EngineConfig) -> EngineResult<ScanOutcome> {
        let id = PairId::of(&candidate);
        if let Some(existing) = self.registry.get(&id).await {
            if existing.lock().await.kind == PairKind::Completed {
                self.registry.remove(&id).await;
            }
        }
        let shared = self.registry.get_or_insert(&id).await;
        let outcome = self.try_open(&id, &shared, &candidate, cfg).await;
        // a candidate that did not become a trade is not kept around
        let still_stable = shared.lock().await.kind == PairKind::Stable;
        if still_stable {
            self.registry.remove(&id).await;
        }
        outcome
    }

    async fn try_open(
        &self,
        id: &PairId,
        shared: &SharedPair,
        candidate: &Candidate,
        cfg: &EngineConfig,
    ) -> EngineResult<ScanOutcome> {
        let mut pair = shared.lock().await;
        let now = self.clock().now();

        pair.ingest_statistics(&statistics_points(&candidate.stats, now.timestamp_millis()))?;
        pair.append_pixel_spread(&pixel_spread_points(
            &candidate.long_candles,
            &candidate.short_candles,
        ));

        let balance = with_timeout(
            "available balance",
            cfg.trading.fetch_timeout(),
            self.executor.available_balance(),
        )
        .await?;
        let capital = CapitalSnapshot::new(balance);
        if let Admission::Reject(reason) =
            can_open(&pair, candidate, cfg, &capital, TriggerMode::Automatic)
        {
            return Ok(ScanOutcome::Rejected {
                pair: id.clone(),
                reason,
            });
        }

        let leverage = to_decimal(cfg.trading.leverage, "leverage")?;
        let long_notional = to_decimal(
            cfg.trading.max_long_margin_size * cfg.trading.leverage,
            "long notional",
        )?;
        let short_notional = to_decimal(
            cfg.trading.max_short_margin_size * cfg.trading.leverage,
            "short notional",
        )?;

        let long = self
            .executor
            .open_position(&id.long_ticker, Side::Long, long_notional, leverage)
            .await?;
        if !long.success {
            log::warn!("[SCAN] {} long leg not filled, entry abandoned", id);
            return Err(EngineError::Execution(format!(
                "{} long leg not filled",
                id.long_ticker
            )));
        }
        let short = self
            .executor
            .open_position(&id.short_ticker, Side::Short, short_notional, leverage)
            .await
            .map_err(|err| {
                log::error!("[SCAN] {} short leg failed after long leg filled: {}", id, err);
                err
            })?;
        if !short.success {
            log::error!("[SCAN] {} short leg not filled, long leg left unhedged", id);
            return Err(EngineError::Execution(format!(
                "{} short leg not filled",
                id.short_ticker
            )));
        }

        pair.capture_entry(&EntryExecution {
            long_price: long.price,
            short_price: short.price,
            executed_at: now,
        })?;
        log::info!(
            "[SCAN] opened {} long@{} short@{}",
            id,
            long.price,
            short.price
        );
        Ok(ScanOutcome::Opened {
            pair: id.clone(),
            long,
            short,
        })
    }

    /// Re-evaluates every open pair concurrently. A failing pair is reported and the
    /// others carry on.
    pub async fn reevaluate_cycle(&self) -> EngineResult<ReevaluateReport> {
        let cfg = Arc::new(self.load_settings().await?);
        let mut tasks = JoinSet::new();
        for (id, pair) in self.registry.trading_pairs().await {
            let worker = self.worker();
            let cfg = cfg.clone();
            tasks.spawn(async move {
                let result = worker.reevaluate(&id, pair, &cfg).await;
                (id, result)
            });
        }

        let mut report = ReevaluateReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(action))) => report.actions.push((id, action)),
                Ok((id, Err(err))) => {
                    log::warn!("[SCAN] re-evaluation of {} failed: {}", id, err);
                    report.failures.push((id, err));
                }
                Err(join_err) => log::error!("[SCAN] re-evaluation task panicked: {}", join_err),
            }
        }
        Ok(report)
    }

    /// Operator-triggered averaging. Skips the drawdown threshold, keeps the count cap.
    pub async fn average_manually(&self, id: &PairId) -> EngineResult<AveragingReport> {
        let cfg = self.load_settings().await?;
        let pair = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| EngineError::NotEligible(format!("{} is not tracked", id)))?;
        let mut guard = pair.lock().await;
        self.averaging
            .execute(&mut guard, &cfg, AveragingTrigger::Manual, self.clock().now())
            .await
    }

    async fn step(&self) {
        match self.reevaluate_cycle().await {
            Ok(report) if !report.actions.is_empty() || !report.failures.is_empty() => {
                log::debug!(
                    "[SCAN] re-evaluated {} pairs, {} failures",
                    report.actions.len(),
                    report.failures.len()
                )
            }
            Ok(_) => {}
            Err(err) => log::error!("[SCAN] re-evaluation cycle failed: {}", err),
        }
        match self.scan_cycle().await {
            Ok(outcome) => log::debug!("[SCAN] cycle outcome {:?}", outcome),
            Err(err) => log::error!("[SCAN] scan cycle failed: {}", err),
        }
    }

    pub async fn run(&self) -> Result<()> {
        if let Some(replay) = &self.replay {
            log::info!("[REPLAY] running over recorded frames");
            loop {
                self.step().await;
                if !replay.tick() {
                    log::info!("[REPLAY] end of data reached");
                    break;
                }
            }
            for (id, pair) in self.registry.trading_pairs().await {
                let pair = pair.lock().await;
                log::info!(
                    "[REPLAY] {} still open, profit {:?}, averaged {} times",
                    id,
                    pair.profit_percent,
                    pair.averaging.count
                );
            }
            return Ok(());
        }

        let cfg = self.settings.load().await?;
        log::info!(
            "[CONFIG] scan every {}s, re-evaluate every {}s, auto_trading={} dry_run={}",
            cfg.trading.scan_interval_secs,
            cfg.trading.reevaluate_interval_secs,
            cfg.trading.auto_trading_enabled,
            cfg.trading.dry_run
        );
        let mut scan = tokio::time::interval(Duration::from_secs(
            cfg.trading.scan_interval_secs.max(1),
        ));
        let mut reevaluate = tokio::time::interval(Duration::from_secs(
            cfg.trading.reevaluate_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                _ = reevaluate.tick() => {
                    if let Err(err) = self.reevaluate_cycle().await {
                        log::error!("[SCAN] re-evaluation cycle failed: {}", err);
                    }
                }
                _ = scan.tick() => {
                    if let Err(err) = self.scan_cycle().await {
                        log::error!("[SCAN] scan cycle failed: {}", err);
                    }
                }
            }
        }
    }
}
