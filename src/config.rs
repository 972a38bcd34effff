use crate::errors::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_mb: usize,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub image_model: String,
    pub use_streaming: bool,
    pub timeout: Duration,
}

/// Bounds for the adaptive rate limiter and the retry policy.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub inter_page_delay: Duration,
    pub inter_batch_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub pacing: PacingConfig,
    pub batch: BatchConfig,
}

impl Config {
    /// Load configuration from the environment (and `.env` when present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 3000)?,
                max_upload_mb: parse_var("MAX_UPLOAD_MB", 200)?,
                output_dir: PathBuf::from(
                    env::var("OUTPUT_DIR").unwrap_or_else(|_| "./output".to_string()),
                ),
            },
            gemini: GeminiConfig {
                api_key: env::var("GEMINI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
                api_base: env::var("GEMINI_API_BASE").unwrap_or_else(|_| {
                    "https://generativelanguage.googleapis.com/v1beta".to_string()
                }),
                image_model: env::var("GEMINI_IMAGE_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash-image-preview".to_string()),
                use_streaming: parse_var("GEMINI_USE_STREAMING", true)?,
                timeout: Duration::from_secs(parse_var("API_TIMEOUT_SECONDS", 120)?),
            },
            pacing: PacingConfig {
                min_delay: Duration::from_millis(parse_var("RATE_LIMIT_MIN_DELAY_MS", 1000)?),
                max_delay: Duration::from_millis(parse_var("RATE_LIMIT_MAX_DELAY_MS", 30_000)?),
                max_retries: parse_var("MAX_RETRIES", 5)?,
                retry_base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", 2000)?),
                retry_jitter: Duration::from_millis(parse_var("RETRY_JITTER_MS", 2000)?),
            },
            batch: BatchConfig {
                batch_size: parse_var("BATCH_SIZE", 3)?,
                inter_page_delay: Duration::from_millis(parse_var("INTER_PAGE_DELAY_MS", 2000)?),
                inter_batch_delay: Duration::from_millis(parse_var("INTER_BATCH_DELAY_MS", 3000)?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.batch.batch_size));
        }
        if self.pacing.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(self.pacing.max_retries));
        }
        if self.pacing.min_delay > self.pacing.max_delay {
            return Err(ConfigError::InvalidRateLimit {
                min_ms: self.pacing.min_delay.as_millis() as u64,
                max_ms: self.pacing.max_delay.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        _ => Ok(default),
    }
}
