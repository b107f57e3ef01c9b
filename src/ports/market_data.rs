use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{Candidate, CandidateStats, Candle};
use crate::pair_state::PairId;

/// OHLC candles per instrument. Every returned series must cover the same bars.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(
        &self,
        instruments: &[String],
        timeframe: &str,
        limit: usize,
    ) -> EngineResult<HashMap<String, Vec<Candle>>>;
}

/// Output of the upstream cointegration analysis.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    /// Candidates of the current scan, without candles.
    async fn fetch_candidates(&self) -> EngineResult<Vec<Candidate>>;

    async fn fetch_pair_statistics(&self, id: &PairId) -> EngineResult<CandidateStats>;
}

/// Read-through settings. Implementations must not cache between calls.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load(&self) -> Result<EngineConfig>;
}

pub struct StaticSettings {
    inner: RwLock<EngineConfig>,
}

impl StaticSettings {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            inner: RwLock::new(cfg),
        }
    }

    pub async fn update<F: FnOnce(&mut EngineConfig)>(&self, f: F) {
        let mut guard = self.inner.write().await;
        f(&mut guard);
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn load(&self) -> Result<EngineConfig> {
        Ok(self.inner.read().await.clone())
    }
}

/// Re-reads the YAML file on every call so edits apply on the next decision.
pub struct YamlSettingsSource {
    path: PathBuf,
}

impl YamlSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsSource for YamlSettingsSource {
    async fn load(&self) -> Result<EngineConfig> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || EngineConfig::from_yaml_path(path)).await?
    }
}

/// Bounds an external call by `limit`.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            operation: operation.to_string(),
            millis: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn timeout_is_reported_as_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, EngineError>(1)
        };
        let result = with_timeout("slow fetch", Duration::from_millis(10), slow).await;
        assert_eq!(
            result,
            Err(EngineError::Timeout {
                operation: "slow fetch".to_string(),
                millis: 10
            })
        );
        let fast = with_timeout("fast", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(fast, Ok(7));
    }

    #[tokio::test]
    async fn static_settings_reflect_updates() {
        let settings = StaticSettings::new(EngineConfig::default());
        assert!(!settings.load().await.unwrap().trading.auto_trading_enabled);
        settings
            .update(|cfg| cfg.trading.auto_trading_enabled = true)
            .await;
        assert!(settings.load().await.unwrap().trading.auto_trading_enabled);
    }

    #[tokio::test]
    async fn yaml_settings_are_reread_each_time() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "min_z: 1.5").unwrap();
        let source = YamlSettingsSource::new(file.path());
        assert_eq!(source.load().await.unwrap().filters.min_z, 1.5);

        std::fs::write(file.path(), "min_z: 2.5\n").unwrap();
        assert_eq!(source.load().await.unwrap().filters.min_z, 2.5);
    }
}
