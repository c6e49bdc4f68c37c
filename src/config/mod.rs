use std::env;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::predicate::{EnqueuePredicate, RateLimitingPredicate, ThresholdEnqueuePredicate};
use crate::core::queue::{DefaultQueue, FixedSizeQueue, Queue};
use crate::core::thread::{TpcConfig, TpspConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `[fixed_pool]`: the thread-per-processor manager.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FixedPoolConfig {
    pub processors: usize,
    pub threads_per_processor: usize,
    pub sleep_time_ms: u64,
    pub keep_alive_time_ms: u64,
    pub force_shutdown: bool,
    pub dequeue_batch: usize,
}

impl Default for FixedPoolConfig {
    fn default() -> Self {
        Self {
            processors: 0,
            threads_per_processor: 1,
            sleep_time_ms: 1000,
            keep_alive_time_ms: 300_000,
            force_shutdown: false,
            dequeue_batch: 0,
        }
    }
}

impl FixedPoolConfig {
    pub fn to_tpc_config(&self) -> TpcConfig {
        TpcConfig {
            processors: self.processors,
            threads_per_processor: self.threads_per_processor,
            sleep_time: Duration::from_millis(self.sleep_time_ms),
            keep_alive: Duration::from_millis(self.keep_alive_time_ms),
            force_shutdown: self.force_shutdown,
            dequeue_batch: self.dequeue_batch,
        }
    }
}

/// `[elastic_pool]`: the per-source elastic manager.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ElasticPoolConfig {
    pub max_threads_per_pool: usize,
    pub threshold: usize,
    /// Defaults to a quarter of the threshold.
    pub margin: Option<usize>,
    pub yield_ms: u64,
}

impl Default for ElasticPoolConfig {
    fn default() -> Self {
        Self {
            max_threads_per_pool: 2,
            threshold: 1000,
            margin: None,
            yield_ms: 1,
        }
    }
}

impl ElasticPoolConfig {
    pub fn to_tpsp_config(&self) -> TpspConfig {
        let mut config = TpspConfig::new(self.max_threads_per_pool, self.threshold);
        if let Some(margin) = self.margin {
            config.margin = margin;
        }
        config.yield_interval = Duration::from_millis(self.yield_ms);
        config
    }
}

/// `[queue]`: admission and dequeue settings for queues built from config.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub timeout_ms: u64,
    /// `0` = unbounded.
    pub max_size: usize,
    pub rate_limit_per_sec: Option<f64>,
    /// Burst size of the rate limiter; defaults to one second of traffic.
    pub rate_limit_depth: Option<usize>,
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn rate_limiter(&self) -> Result<Option<RateLimitingPredicate>, ConfigError> {
        let Some(rate) = self.rate_limit_per_sec else {
            return Ok(None);
        };
        let depth = self
            .rate_limit_depth
            .unwrap_or_else(|| (rate.ceil() as usize).max(1));
        RateLimitingPredicate::new(rate, depth)
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("[queue] {e}")))
    }

    /// Admission policy for a growable queue: the rate limiter if one is
    /// configured, else a size bound of `max_size` elements.
    pub fn predicate(&self) -> Result<Option<Arc<dyn EnqueuePredicate>>, ConfigError> {
        if let Some(limiter) = self.rate_limiter()? {
            return Ok(Some(Arc::new(limiter)));
        }
        if self.max_size > 0 {
            return Ok(Some(Arc::new(ThresholdEnqueuePredicate::new(self.max_size + 1))));
        }
        Ok(None)
    }

    /// A ring buffer of `max_size` slots when it is set, otherwise a
    /// growable queue guarded by [`predicate`](Self::predicate).
    pub fn build_queue<T: Send + 'static>(&self) -> Result<Arc<dyn Queue<T>>, ConfigError> {
        let queue: Arc<dyn Queue<T>> = match FixedSizeQueue::<T>::new(self.max_size) {
            Some(fixed) => Arc::new(fixed),
            None => match self.predicate()? {
                Some(predicate) => Arc::new(DefaultQueue::<T>::with_predicate(predicate)),
                None => Arc::new(DefaultQueue::<T>::new()),
            },
        };
        queue.set_timeout(self.timeout());
        Ok(queue)
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub fixed_pool: FixedPoolConfig,
    pub elastic_pool: ElasticPoolConfig,
    pub queue: QueueConfig,
}

fn env_override<T>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Ok(v) = env::var(name) {
        *target = v
            .trim()
            .parse()
            .map_err(|e| ConfigError::Parse(format!("{name}: {e}")))?;
    }
    Ok(())
}

fn env_flag(name: &str, target: &mut bool) {
    if let Ok(v) = env::var(name) {
        *target = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}

impl Config {
    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: file values override defaults, environment variables
    /// override both.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("SEDAQ_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let mut cfg = match effective_path {
            Some(p) => load_config(p)?,
            None => Config::default(),
        };

        let fixed = &mut cfg.fixed_pool;
        env_override("SEDAQ_PROCESSORS", &mut fixed.processors)?;
        env_override("SEDAQ_THREADS_PER_PROCESSOR", &mut fixed.threads_per_processor)?;
        env_override("SEDAQ_SLEEP_TIME_MS", &mut fixed.sleep_time_ms)?;
        env_override("SEDAQ_KEEP_ALIVE_TIME_MS", &mut fixed.keep_alive_time_ms)?;
        env_flag("SEDAQ_FORCE_SHUTDOWN", &mut fixed.force_shutdown);

        let elastic = &mut cfg.elastic_pool;
        env_override("SEDAQ_MAX_THREADS_PER_POOL", &mut elastic.max_threads_per_pool)?;
        env_override("SEDAQ_THRESHOLD", &mut elastic.threshold)?;
        if env::var("SEDAQ_MARGIN").is_ok() {
            let mut margin = 0usize;
            env_override("SEDAQ_MARGIN", &mut margin)?;
            elastic.margin = Some(margin);
        }

        env_override("SEDAQ_QUEUE_TIMEOUT_MS", &mut cfg.queue.timeout_ms)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fixed_pool
            .to_tpc_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("[fixed_pool] {e}")))?;
        self.elastic_pool
            .to_tpsp_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("[elastic_pool] {e}")))?;
        if self.queue.max_size > 0 && self.queue.rate_limit_per_sec.is_some() {
            return Err(ConfigError::Invalid(
                "[queue] set either max_size or rate_limit_per_sec, not both".into(),
            ));
        }
        self.queue.rate_limiter()?;
        if self.fixed_pool.sleep_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "[fixed_pool] sleep_time_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Reads a TOML file without environment overrides or validation.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}
