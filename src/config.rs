use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_Z_SCORE_WEIGHT: f64 = 40.0;
const DEFAULT_PIXEL_SPREAD_WEIGHT: f64 = 25.0;
const DEFAULT_COINTEGRATION_WEIGHT: f64 = 25.0;
const DEFAULT_MODEL_QUALITY_WEIGHT: f64 = 20.0;
const DEFAULT_STATISTICS_WEIGHT: f64 = 10.0;
const DEFAULT_BONUS_WEIGHT: f64 = 5.0;

const DEFAULT_MIN_Z: f64 = 2.0;
const DEFAULT_MAX_P_VALUE: f64 = 0.05;
const DEFAULT_MAX_ADF_VALUE: f64 = 0.05;
const DEFAULT_MIN_R_SQUARED: f64 = 0.5;
const DEFAULT_MIN_CORRELATION: f64 = 0.6;
const DEFAULT_Z_DECLINE_COUNT: usize = 4;

const DEFAULT_USE_PAIRS: u32 = 1;
const DEFAULT_MARGIN_SIZE: f64 = 100.0;
const DEFAULT_LEVERAGE: f64 = 1.0;
const DEFAULT_TIMEFRAME: &str = "15m";
const DEFAULT_CANDLE_LIMIT: usize = 300;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;
const DEFAULT_REEVALUATE_INTERVAL_SECS: u64 = 60;

const DEFAULT_AVERAGING_DRAWDOWN: f64 = 5.0;
const DEFAULT_AVERAGING_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_AVERAGING_COUNT: u32 = 3;

const DEFAULT_REFERENCE_INSTRUMENT: &str = "BTC-USDT-SWAP";
const DEFAULT_VOLATILITY_TIMEFRAME: &str = "1D";
const DEFAULT_VOLATILITY_CANDLE_LIMIT: usize = 60;
const DEFAULT_ATR_THRESHOLD_MULTIPLIER: f64 = 1.5;
const DEFAULT_DAILY_RANGE_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_DAILY_CHANGE_PERCENT: f64 = 5.0;
const DEFAULT_VOLATILITY_CACHE_TTL_SECS: u64 = 300;

const DEFAULT_EXIT_STOP_PERCENT: f64 = -5.0;
const DEFAULT_EXIT_TAKE_PERCENT: f64 = 3.0;
const DEFAULT_EXIT_Z_MIN: f64 = 0.0;
const DEFAULT_EXIT_Z_MAX: f64 = 1.0;
const DEFAULT_EXIT_TIME_MINUTES: i64 = 480;
const DEFAULT_EXIT_BREAKEVEN_PERCENT: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub z_score_weight: f64,
    pub pixel_spread_weight: f64,
    pub cointegration_weight: f64,
    pub model_quality_weight: f64,
    pub statistics_weight: f64,
    pub bonus_weight: f64,
    pub use_z_score_scoring: bool,
    pub use_pixel_spread_scoring: bool,
    pub use_cointegration_scoring: bool,
    pub use_model_quality_scoring: bool,
    pub use_statistics_scoring: bool,
    pub use_bonus_scoring: bool,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            z_score_weight: DEFAULT_Z_SCORE_WEIGHT,
            pixel_spread_weight: DEFAULT_PIXEL_SPREAD_WEIGHT,
            cointegration_weight: DEFAULT_COINTEGRATION_WEIGHT,
            model_quality_weight: DEFAULT_MODEL_QUALITY_WEIGHT,
            statistics_weight: DEFAULT_STATISTICS_WEIGHT,
            bonus_weight: DEFAULT_BONUS_WEIGHT,
            use_z_score_scoring: true,
            use_pixel_spread_scoring: true,
            use_cointegration_scoring: true,
            use_model_quality_scoring: true,
            use_statistics_scoring: true,
            use_bonus_scoring: true,
        }
    }
}

impl ScoringWeights {
    /// Same weight on every dimension, everything enabled.
    pub fn uniform(weight: f64) -> Self {
        Self {
            z_score_weight: weight,
            pixel_spread_weight: weight,
            cointegration_weight: weight,
            model_quality_weight: weight,
            statistics_weight: weight,
            bonus_weight: weight,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterSettings {
    pub use_min_z_filter: bool,
    pub min_z: f64,
    pub use_max_p_value_filter: bool,
    pub max_p_value: f64,
    pub use_max_adf_value_filter: bool,
    pub max_adf_value: f64,
    pub use_min_r_squared_filter: bool,
    pub min_r_squared: f64,
    pub use_min_correlation_filter: bool,
    pub min_correlation: f64,
    pub use_z_score_decline_filter: bool,
    pub z_score_decline_candles_count: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            use_min_z_filter: true,
            min_z: DEFAULT_MIN_Z,
            use_max_p_value_filter: true,
            max_p_value: DEFAULT_MAX_P_VALUE,
            use_max_adf_value_filter: true,
            max_adf_value: DEFAULT_MAX_ADF_VALUE,
            use_min_r_squared_filter: true,
            min_r_squared: DEFAULT_MIN_R_SQUARED,
            use_min_correlation_filter: true,
            min_correlation: DEFAULT_MIN_CORRELATION,
            use_z_score_decline_filter: false,
            z_score_decline_candles_count: DEFAULT_Z_DECLINE_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradingSettings {
    pub auto_trading_enabled: bool,
    pub dry_run: bool,
    pub use_pairs: u32,
    pub max_long_margin_size: f64,
    pub max_short_margin_size: f64,
    pub leverage: f64,
    pub timeframe: String,
    pub candle_limit: usize,
    pub fetch_timeout_ms: u64,
    pub scan_interval_secs: u64,
    pub reevaluate_interval_secs: u64,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            auto_trading_enabled: false,
            dry_run: true,
            use_pairs: DEFAULT_USE_PAIRS,
            max_long_margin_size: DEFAULT_MARGIN_SIZE,
            max_short_margin_size: DEFAULT_MARGIN_SIZE,
            leverage: DEFAULT_LEVERAGE,
            timeframe: DEFAULT_TIMEFRAME.to_string(),
            candle_limit: DEFAULT_CANDLE_LIMIT,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            reevaluate_interval_secs: DEFAULT_REEVALUATE_INTERVAL_SECS,
        }
    }
}

impl TradingSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn margin_per_pair(&self) -> f64 {
        self.max_long_margin_size + self.max_short_margin_size
    }
}

/// Drawdown thresholds and averaging volume share one multiplier: the k-th averaging
/// fires at `-|drawdown_threshold * multiplier^k|` and opens `multiplier^(k+1)` times the
/// base margin.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragingSettings {
    pub auto_averaging_enabled: bool,
    pub drawdown_threshold: f64,
    pub multiplier: f64,
    pub max_averaging_count: u32,
}

impl Default for AveragingSettings {
    fn default() -> Self {
        Self {
            auto_averaging_enabled: false,
            drawdown_threshold: DEFAULT_AVERAGING_DRAWDOWN,
            multiplier: DEFAULT_AVERAGING_MULTIPLIER,
            max_averaging_count: DEFAULT_MAX_AVERAGING_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolatilitySettings {
    pub enabled: bool,
    pub reference_instrument: String,
    pub timeframe: String,
    pub candle_limit: usize,
    pub atr_threshold_multiplier: f64,
    pub daily_range_multiplier: f64,
    pub max_daily_change_percent: f64,
    pub cache_ttl_secs: u64,
    /// When false, an unavailable reference feed blocks trading instead of allowing it.
    pub fail_open: bool,
}

impl Default for VolatilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reference_instrument: DEFAULT_REFERENCE_INSTRUMENT.to_string(),
            timeframe: DEFAULT_VOLATILITY_TIMEFRAME.to_string(),
            candle_limit: DEFAULT_VOLATILITY_CANDLE_LIMIT,
            atr_threshold_multiplier: DEFAULT_ATR_THRESHOLD_MULTIPLIER,
            daily_range_multiplier: DEFAULT_DAILY_RANGE_MULTIPLIER,
            max_daily_change_percent: DEFAULT_MAX_DAILY_CHANGE_PERCENT,
            cache_ttl_secs: DEFAULT_VOLATILITY_CACHE_TTL_SECS,
            fail_open: true,
        }
    }
}

impl VolatilitySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitSettings {
    pub use_exit_stop: bool,
    pub exit_stop_percent: f64,
    pub use_exit_take: bool,
    pub exit_take_percent: f64,
    pub use_exit_z_min: bool,
    pub exit_z_min: f64,
    pub use_exit_z_max: bool,
    pub exit_z_max: f64,
    pub exit_z_max_percent: Option<f64>,
    pub use_exit_time: bool,
    pub exit_time_minutes: i64,
    pub close_at_breakeven: bool,
    pub exit_breakeven_percent: f64,
    pub use_exit_negative_z_min_profit: bool,
    pub exit_negative_z_min_profit_percent: f64,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            use_exit_stop: true,
            exit_stop_percent: DEFAULT_EXIT_STOP_PERCENT,
            use_exit_take: true,
            exit_take_percent: DEFAULT_EXIT_TAKE_PERCENT,
            use_exit_z_min: true,
            exit_z_min: DEFAULT_EXIT_Z_MIN,
            use_exit_z_max: true,
            exit_z_max: DEFAULT_EXIT_Z_MAX,
            exit_z_max_percent: None,
            use_exit_time: true,
            exit_time_minutes: DEFAULT_EXIT_TIME_MINUTES,
            close_at_breakeven: false,
            exit_breakeven_percent: DEFAULT_EXIT_BREAKEVEN_PERCENT,
            use_exit_negative_z_min_profit: false,
            exit_negative_z_min_profit_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub scoring: ScoringWeights,
    pub filters: FilterSettings,
    pub trading: TradingSettings,
    pub averaging: AveragingSettings,
    pub volatility: VolatilitySettings,
    pub exit: ExitSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct EngineConfigYaml {
    z_score_weight: Option<f64>,
    pixel_spread_weight: Option<f64>,
    cointegration_weight: Option<f64>,
    model_quality_weight: Option<f64>,
    statistics_weight: Option<f64>,
    bonus_weight: Option<f64>,
    use_z_score_scoring: Option<bool>,
    use_pixel_spread_scoring: Option<bool>,
    use_cointegration_scoring: Option<bool>,
    use_model_quality_scoring: Option<bool>,
    use_statistics_scoring: Option<bool>,
    use_bonus_scoring: Option<bool>,

    use_min_z_filter: Option<bool>,
    min_z: Option<f64>,
    use_max_p_value_filter: Option<bool>,
    max_p_value: Option<f64>,
    use_max_adf_value_filter: Option<bool>,
    max_adf_value: Option<f64>,
    use_min_r_squared_filter: Option<bool>,
    min_r_squared: Option<f64>,
    use_min_correlation_filter: Option<bool>,
    min_correlation: Option<f64>,
    use_z_score_decline_filter: Option<bool>,
    z_score_decline_candles_count: Option<usize>,

    auto_trading_enabled: Option<bool>,
    dry_run: Option<bool>,
    use_pairs: Option<u32>,
    max_long_margin_size: Option<f64>,
    max_short_margin_size: Option<f64>,
    leverage: Option<f64>,
    timeframe: Option<String>,
    candle_limit: Option<usize>,
    fetch_timeout_ms: Option<u64>,
    scan_interval_secs: Option<u64>,
    reevaluate_interval_secs: Option<u64>,

    auto_averaging_enabled: Option<bool>,
    averaging_drawdown_threshold: Option<f64>,
    averaging_multiplier: Option<f64>,
    max_averaging_count: Option<u32>,

    volatility_filter_enabled: Option<bool>,
    volatility_reference_instrument: Option<String>,
    volatility_timeframe: Option<String>,
    volatility_candle_limit: Option<usize>,
    atr_threshold_multiplier: Option<f64>,
    daily_range_multiplier: Option<f64>,
    max_daily_change_percent: Option<f64>,
    volatility_cache_ttl_secs: Option<u64>,
    volatility_fail_open: Option<bool>,

    use_exit_stop: Option<bool>,
    exit_stop_percent: Option<f64>,
    use_exit_take: Option<bool>,
    exit_take_percent: Option<f64>,
    use_exit_z_min: Option<bool>,
    exit_z_min: Option<f64>,
    use_exit_z_max: Option<bool>,
    exit_z_max: Option<f64>,
    exit_z_max_percent: Option<f64>,
    use_exit_time: Option<bool>,
    exit_time_minutes: Option<i64>,
    close_at_breakeven: Option<bool>,
    exit_breakeven_percent: Option<f64>,
    use_exit_negative_z_min_profit: Option<bool>,
    exit_negative_z_min_profit_percent: Option<f64>,
}

impl EngineConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRDESK_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open engine config {}", path_ref.display()))?;
        let yaml: EngineConfigYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse engine config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml);
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let yaml: EngineConfigYaml =
            serde_yaml::from_str(raw).context("failed to parse engine config")?;
        let cfg = Self::from_yaml(yaml);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: EngineConfigYaml) -> Self {
        let scoring = ScoringWeights {
            z_score_weight: yaml.z_score_weight.unwrap_or(DEFAULT_Z_SCORE_WEIGHT),
            pixel_spread_weight: yaml
                .pixel_spread_weight
                .unwrap_or(DEFAULT_PIXEL_SPREAD_WEIGHT),
            cointegration_weight: yaml
                .cointegration_weight
                .unwrap_or(DEFAULT_COINTEGRATION_WEIGHT),
            model_quality_weight: yaml
                .model_quality_weight
                .unwrap_or(DEFAULT_MODEL_QUALITY_WEIGHT),
            statistics_weight: yaml.statistics_weight.unwrap_or(DEFAULT_STATISTICS_WEIGHT),
            bonus_weight: yaml.bonus_weight.unwrap_or(DEFAULT_BONUS_WEIGHT),
            use_z_score_scoring: yaml.use_z_score_scoring.unwrap_or(true),
            use_pixel_spread_scoring: yaml.use_pixel_spread_scoring.unwrap_or(true),
            use_cointegration_scoring: yaml.use_cointegration_scoring.unwrap_or(true),
            use_model_quality_scoring: yaml.use_model_quality_scoring.unwrap_or(true),
            use_statistics_scoring: yaml.use_statistics_scoring.unwrap_or(true),
            use_bonus_scoring: yaml.use_bonus_scoring.unwrap_or(true),
        };
        let filters = FilterSettings {
            use_min_z_filter: yaml.use_min_z_filter.unwrap_or(true),
            min_z: yaml.min_z.unwrap_or(DEFAULT_MIN_Z),
            use_max_p_value_filter: yaml.use_max_p_value_filter.unwrap_or(true),
            max_p_value: yaml.max_p_value.unwrap_or(DEFAULT_MAX_P_VALUE),
            use_max_adf_value_filter: yaml.use_max_adf_value_filter.unwrap_or(true),
            max_adf_value: yaml.max_adf_value.unwrap_or(DEFAULT_MAX_ADF_VALUE),
            use_min_r_squared_filter: yaml.use_min_r_squared_filter.unwrap_or(true),
            min_r_squared: yaml.min_r_squared.unwrap_or(DEFAULT_MIN_R_SQUARED),
            use_min_correlation_filter: yaml.use_min_correlation_filter.unwrap_or(true),
            min_correlation: yaml.min_correlation.unwrap_or(DEFAULT_MIN_CORRELATION),
            use_z_score_decline_filter: yaml.use_z_score_decline_filter.unwrap_or(false),
            z_score_decline_candles_count: yaml
                .z_score_decline_candles_count
                .unwrap_or(DEFAULT_Z_DECLINE_COUNT),
        };
        let trading = TradingSettings {
            auto_trading_enabled: yaml.auto_trading_enabled.unwrap_or(false),
            dry_run: yaml.dry_run.unwrap_or(true),
            use_pairs: yaml.use_pairs.unwrap_or(DEFAULT_USE_PAIRS),
            max_long_margin_size: yaml.max_long_margin_size.unwrap_or(DEFAULT_MARGIN_SIZE),
            max_short_margin_size: yaml.max_short_margin_size.unwrap_or(DEFAULT_MARGIN_SIZE),
            leverage: yaml.leverage.unwrap_or(DEFAULT_LEVERAGE),
            timeframe: yaml
                .timeframe
                .unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string()),
            candle_limit: yaml.candle_limit.unwrap_or(DEFAULT_CANDLE_LIMIT),
            fetch_timeout_ms: yaml.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS),
            scan_interval_secs: yaml
                .scan_interval_secs
                .unwrap_or(DEFAULT_SCAN_INTERVAL_SECS),
            reevaluate_interval_secs: yaml
                .reevaluate_interval_secs
                .unwrap_or(DEFAULT_REEVALUATE_INTERVAL_SECS),
        };
        let averaging = AveragingSettings {
            auto_averaging_enabled: yaml.auto_averaging_enabled.unwrap_or(false),
            drawdown_threshold: yaml
                .averaging_drawdown_threshold
                .unwrap_or(DEFAULT_AVERAGING_DRAWDOWN),
            multiplier: yaml
                .averaging_multiplier
                .unwrap_or(DEFAULT_AVERAGING_MULTIPLIER),
            max_averaging_count: yaml
                .max_averaging_count
                .unwrap_or(DEFAULT_MAX_AVERAGING_COUNT),
        };
        let volatility = VolatilitySettings {
            enabled: yaml.volatility_filter_enabled.unwrap_or(true),
            reference_instrument: yaml
                .volatility_reference_instrument
                .unwrap_or_else(|| DEFAULT_REFERENCE_INSTRUMENT.to_string()),
            timeframe: yaml
                .volatility_timeframe
                .unwrap_or_else(|| DEFAULT_VOLATILITY_TIMEFRAME.to_string()),
            candle_limit: yaml
                .volatility_candle_limit
                .unwrap_or(DEFAULT_VOLATILITY_CANDLE_LIMIT),
            atr_threshold_multiplier: yaml
                .atr_threshold_multiplier
                .unwrap_or(DEFAULT_ATR_THRESHOLD_MULTIPLIER),
            daily_range_multiplier: yaml
                .daily_range_multiplier
                .unwrap_or(DEFAULT_DAILY_RANGE_MULTIPLIER),
            max_daily_change_percent: yaml
                .max_daily_change_percent
                .unwrap_or(DEFAULT_MAX_DAILY_CHANGE_PERCENT),
            cache_ttl_secs: yaml
                .volatility_cache_ttl_secs
                .unwrap_or(DEFAULT_VOLATILITY_CACHE_TTL_SECS),
            fail_open: yaml.volatility_fail_open.unwrap_or(true),
        };
        let exit = ExitSettings {
            use_exit_stop: yaml.use_exit_stop.unwrap_or(true),
            exit_stop_percent: yaml.exit_stop_percent.unwrap_or(DEFAULT_EXIT_STOP_PERCENT),
            use_exit_take: yaml.use_exit_take.unwrap_or(true),
            exit_take_percent: yaml.exit_take_percent.unwrap_or(DEFAULT_EXIT_TAKE_PERCENT),
            use_exit_z_min: yaml.use_exit_z_min.unwrap_or(true),
            exit_z_min: yaml.exit_z_min.unwrap_or(DEFAULT_EXIT_Z_MIN),
            use_exit_z_max: yaml.use_exit_z_max.unwrap_or(true),
            exit_z_max: yaml.exit_z_max.unwrap_or(DEFAULT_EXIT_Z_MAX),
            exit_z_max_percent: yaml.exit_z_max_percent,
            use_exit_time: yaml.use_exit_time.unwrap_or(true),
            exit_time_minutes: yaml.exit_time_minutes.unwrap_or(DEFAULT_EXIT_TIME_MINUTES),
            close_at_breakeven: yaml.close_at_breakeven.unwrap_or(false),
            exit_breakeven_percent: yaml
                .exit_breakeven_percent
                .unwrap_or(DEFAULT_EXIT_BREAKEVEN_PERCENT),
            use_exit_negative_z_min_profit: yaml.use_exit_negative_z_min_profit.unwrap_or(false),
            exit_negative_z_min_profit_percent: yaml
                .exit_negative_z_min_profit_percent
                .unwrap_or(0.0),
        };

        EngineConfig {
            scoring,
            filters,
            trading,
            averaging,
            volatility,
            exit,
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = EngineConfig::default();
        let s = &mut cfg.scoring;
        env_override("Z_SCORE_WEIGHT", &mut s.z_score_weight);
        env_override("PIXEL_SPREAD_WEIGHT", &mut s.pixel_spread_weight);
        env_override("COINTEGRATION_WEIGHT", &mut s.cointegration_weight);
        env_override("MODEL_QUALITY_WEIGHT", &mut s.model_quality_weight);
        env_override("STATISTICS_WEIGHT", &mut s.statistics_weight);
        env_override("BONUS_WEIGHT", &mut s.bonus_weight);

        let f = &mut cfg.filters;
        env_flag("USE_MIN_Z_FILTER", &mut f.use_min_z_filter);
        env_override("MIN_Z", &mut f.min_z);
        env_flag("USE_MAX_P_VALUE_FILTER", &mut f.use_max_p_value_filter);
        env_override("MAX_P_VALUE", &mut f.max_p_value);
        env_flag("USE_MAX_ADF_VALUE_FILTER", &mut f.use_max_adf_value_filter);
        env_override("MAX_ADF_VALUE", &mut f.max_adf_value);
        env_flag("USE_MIN_R_SQUARED_FILTER", &mut f.use_min_r_squared_filter);
        env_override("MIN_R_SQUARED", &mut f.min_r_squared);
        env_flag("USE_MIN_CORRELATION_FILTER", &mut f.use_min_correlation_filter);
        env_override("MIN_CORRELATION", &mut f.min_correlation);
        env_flag("USE_Z_SCORE_DECLINE_FILTER", &mut f.use_z_score_decline_filter);
        env_override(
            "Z_SCORE_DECLINE_CANDLES_COUNT",
            &mut f.z_score_decline_candles_count,
        );

        let t = &mut cfg.trading;
        env_override("USE_PAIRS", &mut t.use_pairs);
        env_override("MAX_LONG_MARGIN_SIZE", &mut t.max_long_margin_size);
        env_override("MAX_SHORT_MARGIN_SIZE", &mut t.max_short_margin_size);
        env_override("LEVERAGE", &mut t.leverage);
        env_override("TIMEFRAME", &mut t.timeframe);
        env_override("CANDLE_LIMIT", &mut t.candle_limit);
        env_override("FETCH_TIMEOUT_MS", &mut t.fetch_timeout_ms);

        let a = &mut cfg.averaging;
        env_override("AVERAGING_DRAWDOWN_THRESHOLD", &mut a.drawdown_threshold);
        env_override("AVERAGING_MULTIPLIER", &mut a.multiplier);
        env_override("MAX_AVERAGING_COUNT", &mut a.max_averaging_count);

        let v = &mut cfg.volatility;
        env_override(
            "VOLATILITY_REFERENCE_INSTRUMENT",
            &mut v.reference_instrument,
        );
        env_override("ATR_THRESHOLD_MULTIPLIER", &mut v.atr_threshold_multiplier);
        env_override("DAILY_RANGE_MULTIPLIER", &mut v.daily_range_multiplier);
        env_override("MAX_DAILY_CHANGE_PERCENT", &mut v.max_daily_change_percent);
        env_override("VOLATILITY_CACHE_TTL_SECS", &mut v.cache_ttl_secs);
        env_flag("VOLATILITY_FAIL_OPEN", &mut v.fail_open);

        let e = &mut cfg.exit;
        env_override("EXIT_STOP_PERCENT", &mut e.exit_stop_percent);
        env_override("EXIT_TAKE_PERCENT", &mut e.exit_take_percent);
        env_override("EXIT_Z_MIN", &mut e.exit_z_min);
        env_override("EXIT_Z_MAX", &mut e.exit_z_max);
        env_override("EXIT_TIME_MINUTES", &mut e.exit_time_minutes);
        env_flag("CLOSE_AT_BREAKEVEN", &mut e.close_at_breakeven);

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Operational switches that the environment may flip regardless of the YAML file.
    fn apply_env_overrides(&mut self) {
        env_flag("AUTO_TRADING_ENABLED", &mut self.trading.auto_trading_enabled);
        env_flag("DRY_RUN", &mut self.trading.dry_run);
        env_flag(
            "AUTO_AVERAGING_ENABLED",
            &mut self.averaging.auto_averaging_enabled,
        );
        env_flag("VOLATILITY_FILTER_ENABLED", &mut self.volatility.enabled);
        env_override("SCAN_INTERVAL_SECS", &mut self.trading.scan_interval_secs);
        env_override(
            "REEVALUATE_INTERVAL_SECS",
            &mut self.trading.reevaluate_interval_secs,
        );
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        let weights = [
            ("z_score_weight", s.use_z_score_scoring, s.z_score_weight),
            (
                "pixel_spread_weight",
                s.use_pixel_spread_scoring,
                s.pixel_spread_weight,
            ),
            (
                "cointegration_weight",
                s.use_cointegration_scoring,
                s.cointegration_weight,
            ),
            (
                "model_quality_weight",
                s.use_model_quality_scoring,
                s.model_quality_weight,
            ),
            ("statistics_weight", s.use_statistics_scoring, s.statistics_weight),
            ("bonus_weight", s.use_bonus_scoring, s.bonus_weight),
        ];
        for (name, enabled, weight) in weights {
            if enabled && !(weight.is_finite() && weight > 0.0) {
                return Err(anyhow!("{} must be positive when enabled, got {}", name, weight));
            }
        }
        if !(self.averaging.multiplier.is_finite() && self.averaging.multiplier >= 1.0) {
            return Err(anyhow!(
                "averaging_multiplier must be >= 1, got {}",
                self.averaging.multiplier
            ));
        }
        if self.averaging.auto_averaging_enabled && self.averaging.max_averaging_count == 0 {
            return Err(anyhow!(
                "max_averaging_count must be positive when auto averaging is enabled"
            ));
        }
        if self.trading.max_long_margin_size <= 0.0 || self.trading.max_short_margin_size <= 0.0 {
            return Err(anyhow!("margin sizes must be positive"));
        }
        if self.trading.leverage <= 0.0 {
            return Err(anyhow!("leverage must be positive"));
        }
        Ok(())
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = env::var(key) {
        if value.trim().is_empty() {
            return;
        }
        match value.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => log::warn!("[CONFIG] ignoring invalid {}={}", key, value),
        }
    }
}

fn env_flag(key: &str, target: &mut bool) {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            *target = value.trim().to_lowercase() == "true";
        }
    }
}
