//! Application configuration from environment variables.
//!
//! `.env` values are loaded in main.rs at startup; actual environment
//! variables override them. Invalid or missing required settings fail the
//! process before any audio is processed.

use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::core::buffer::BufferConfig;
use crate::core::engine::ws::WsEngineConfig;
use crate::core::session::BackoffPolicy;

/// Configuration loading errors. All fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Everything the pipeline needs, resolved and validated.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Recognition endpoint
    pub speech_endpoint: String,
    pub speech_subscription_key: String,
    /// Region the subscription key is tied to.
    pub speech_region: String,
    /// Candidate languages for server-side language identification.
    pub speech_languages: Vec<String>,

    // Audio format (raw PCM from the chunk source)
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,

    pub buffer: BufferConfig,
    pub backoff: BackoffPolicy,
}

impl AppConfig {
    /// Load and validate from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let speech_endpoint = require("SPEECH_ENDPOINT")?;
        Url::parse(&speech_endpoint).map_err(|e| ConfigError::Invalid {
            var: "SPEECH_ENDPOINT",
            reason: e.to_string(),
        })?;

        let speech_subscription_key = require("SPEECH_SUBSCRIPTION_KEY")?;
        let speech_region =
            env::var("SPEECH_REGION").unwrap_or_else(|_| "westeurope".to_string());
        let speech_languages: Vec<String> = env::var("SPEECH_LANGUAGES")
            .unwrap_or_else(|_| "en-US".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if speech_languages.is_empty() {
            return Err(ConfigError::Invalid {
                var: "SPEECH_LANGUAGES",
                reason: "at least one language is required".to_string(),
            });
        }

        let buffer = BufferConfig {
            max_buffer_bytes: parse_or("BUFFER_MAX_BYTES", 64_000)?,
            high_water_bytes: parse_or("BUFFER_HIGH_WATER_BYTES", 57_600)?,
            resume_water_bytes: parse_or("BUFFER_RESUME_WATER_BYTES", 19_200)?,
            batch_bytes: parse_or("BUFFER_BATCH_BYTES", 3_200)?,
            drain_interval: Duration::from_millis(parse_or("BUFFER_DRAIN_INTERVAL_MS", 50)?),
            report_interval: Duration::from_millis(parse_or(
                "BUFFER_REPORT_INTERVAL_MS",
                10_000,
            )?),
        };
        buffer.validate().map_err(|e| ConfigError::Invalid {
            var: "BUFFER_MAX_BYTES",
            reason: e.to_string(),
        })?;

        let backoff = BackoffPolicy {
            base: Duration::from_millis(parse_or("BACKOFF_BASE_MS", 1_000)?),
            cap: Duration::from_millis(parse_or("BACKOFF_CAP_MS", 15_000)?),
        };
        if backoff.base.is_zero() || backoff.cap < backoff.base {
            return Err(ConfigError::Invalid {
                var: "BACKOFF_BASE_MS",
                reason: "base must be non-zero and at most the cap".to_string(),
            });
        }

        Ok(Self {
            speech_endpoint,
            speech_subscription_key,
            speech_region,
            speech_languages,
            sample_rate: parse_or("AUDIO_SAMPLE_RATE", 16_000)?,
            channels: parse_or("AUDIO_CHANNELS", 1)?,
            bytes_per_sample: parse_or("AUDIO_BYTES_PER_SAMPLE", 2)?,
            buffer,
            backoff,
        })
    }

    /// Engine connection parameters derived from this configuration.
    pub fn engine_config(&self) -> WsEngineConfig {
        WsEngineConfig {
            endpoint: self.speech_endpoint.clone(),
            subscription_key: self.speech_subscription_key.clone(),
            region: self.speech_region.clone(),
            languages: self.speech_languages.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Bytes per second of the incoming PCM stream.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.bytes_per_sample as usize
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

fn parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "SPEECH_ENDPOINT",
            "SPEECH_SUBSCRIPTION_KEY",
            "SPEECH_REGION",
            "SPEECH_LANGUAGES",
            "AUDIO_SAMPLE_RATE",
            "AUDIO_CHANNELS",
            "AUDIO_BYTES_PER_SAMPLE",
            "BUFFER_MAX_BYTES",
            "BUFFER_HIGH_WATER_BYTES",
            "BUFFER_RESUME_WATER_BYTES",
            "BUFFER_BATCH_BYTES",
            "BUFFER_DRAIN_INTERVAL_MS",
            "BUFFER_REPORT_INTERVAL_MS",
            "BACKOFF_BASE_MS",
            "BACKOFF_CAP_MS",
        ] {
            unsafe { env::remove_var(var) };
        }
    }

    fn set_required() {
        unsafe {
            env::set_var("SPEECH_ENDPOINT", "wss://speech.example.com/recognition");
            env::set_var("SPEECH_SUBSCRIPTION_KEY", "key-123");
        }
    }

    #[test]
    #[serial]
    fn defaults_are_applied() {
        clear_env();
        set_required();

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.speech_region, "westeurope");
        assert_eq!(config.speech_languages, vec!["en-US".to_string()]);
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.bytes_per_sample, 2);
        assert_eq!(config.bytes_per_second(), 32_000);
        assert_eq!(config.buffer.max_buffer_bytes, 64_000);
        assert_eq!(config.buffer.high_water_bytes, 57_600);
        assert_eq!(config.buffer.resume_water_bytes, 19_200);
        assert_eq!(config.backoff.base, Duration::from_millis(1_000));
        assert_eq!(config.backoff.cap, Duration::from_millis(15_000));
    }

    #[test]
    #[serial]
    fn missing_endpoint_is_fatal() {
        clear_env();
        unsafe { env::set_var("SPEECH_SUBSCRIPTION_KEY", "key-123") };

        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::MissingVar("SPEECH_ENDPOINT"))
        ));
    }

    #[test]
    #[serial]
    fn missing_subscription_key_is_fatal() {
        clear_env();
        unsafe { env::set_var("SPEECH_ENDPOINT", "wss://speech.example.com/recognition") };

        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::MissingVar("SPEECH_SUBSCRIPTION_KEY"))
        ));
    }

    #[test]
    #[serial]
    fn invalid_endpoint_url_is_fatal() {
        clear_env();
        unsafe {
            env::set_var("SPEECH_ENDPOINT", "not a url");
            env::set_var("SPEECH_SUBSCRIPTION_KEY", "key-123");
        }

        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::Invalid {
                var: "SPEECH_ENDPOINT",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn languages_are_parsed_from_csv() {
        clear_env();
        set_required();
        unsafe { env::set_var("SPEECH_LANGUAGES", "en-US, de-DE ,fr-FR") };

        let config = AppConfig::from_env().unwrap();
        assert_eq!(
            config.speech_languages,
            vec!["en-US".to_string(), "de-DE".to_string(), "fr-FR".to_string()]
        );
    }

    #[test]
    #[serial]
    fn inverted_watermarks_are_fatal() {
        clear_env();
        set_required();
        unsafe { env::set_var("BUFFER_RESUME_WATER_BYTES", "60000") };

        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    #[serial]
    fn non_numeric_threshold_is_fatal() {
        clear_env();
        set_required();
        unsafe { env::set_var("BUFFER_MAX_BYTES", "lots") };

        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::Invalid {
                var: "BUFFER_MAX_BYTES",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn engine_config_mirrors_speech_settings() {
        clear_env();
        set_required();
        unsafe {
            env::set_var("SPEECH_REGION", "northeurope");
            env::set_var("SPEECH_LANGUAGES", "sv-SE");
        }

        let config = AppConfig::from_env().unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.endpoint, "wss://speech.example.com/recognition");
        assert_eq!(engine.region, "northeurope");
        assert_eq!(engine.languages, vec!["sv-SE".to_string()]);
        assert_eq!(engine.sample_rate, 16_000);
    }
}
