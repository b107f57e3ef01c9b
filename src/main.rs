use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use pairdesk::config::EngineConfig;
use pairdesk::engine::DecisionEngine;
use pairdesk::ports::market_data::{SettingsSource, StaticSettings, YamlSettingsSource};
use pairdesk::ports::replay_source::ReplaySource;
use pairdesk::trade::execution::paper_executor::PaperExecutor;
use rust_decimal::Decimal;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_PAPER_BALANCE: &str = "10000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
                .unwrap_or(LevelFilter::Debug),
        )
        .init();

    log::info!("Starting pairdesk decision loop...");
    let cfg = EngineConfig::from_env_or_yaml().expect("invalid engine config");
    cfg.validate().expect("invalid engine config");
    if !cfg.trading.dry_run {
        log::warn!("[CONFIG] no live executor is wired in, orders go to the paper executor");
    }

    let settings: Arc<dyn SettingsSource> = match env::var("PAIRDESK_CONFIG_PATH") {
        Ok(path) if !path.trim().is_empty() => Arc::new(YamlSettingsSource::new(path)),
        _ => Arc::new(StaticSettings::new(cfg)),
    };

    let replay_path = env::var("REPLAY_FILE").context("REPLAY_FILE must point to a JSONL replay")?;
    let replay = Arc::new(ReplaySource::from_path(&replay_path)?);

    let balance = env::var("PAPER_BALANCE").unwrap_or_else(|_| DEFAULT_PAPER_BALANCE.to_string());
    let balance = Decimal::from_str(balance.trim())
        .with_context(|| format!("invalid PAPER_BALANCE {}", balance))?;
    let executor = Arc::new(PaperExecutor::new(replay.clone(), balance));

    let engine = DecisionEngine::new(settings, replay.clone(), replay.clone(), executor)
        .await?
        .with_replay(replay);
    engine.run().await
}
