//! # Configuration Management
//!
//! Loads the relay configuration from multiple sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables prefixed with `APP`, nested with `__`
//!   (e.g. `APP_LIFECYCLE__GRACE_PERIOD_SECS=120`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults
//!
//! ## Sections:
//! - **server**: bind address
//! - **gate**: allow-list and shared secret checked once per WebSocket handshake
//! - **audio**: flush thresholds and suspicious-input screening
//! - **providers**: ranked provider tiers per capability
//! - **lifecycle**: session timeouts and sweep interval
//! - **delivery**: fan-out policy

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Upper bound for every lifecycle duration (30 days).
pub const MAX_LIFECYCLE_SECS: u64 = 30 * 24 * 60 * 60;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gate: GateConfig,
    pub audio: AudioConfig,
    pub providers: ProvidersConfig,
    pub lifecycle: LifecycleConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection-time admission policy.
///
/// An empty `allowed_ips` list admits every peer. When `shared_secret` is set,
/// clients must present it as `?token=` or in the `x-relay-secret` header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    pub allowed_ips: Vec<String>,
    pub shared_secret: Option<String>,
}

/// Audio ingestion thresholds.
///
/// ## Flush rules:
/// A buffered stream is handed to transcription when a single chunk or the
/// cumulative buffer exceeds `min_flush_bytes`, or when more than one chunk is
/// buffered and the gap since the previous chunk exceeds `silence_gap_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate written into synthesized WAV headers
    pub sample_rate: u32,

    /// Size threshold (bytes) that triggers a flush
    pub min_flush_bytes: usize,

    /// Silence gap (milliseconds) that triggers a flush of a multi-chunk buffer
    pub silence_gap_ms: u64,

    /// Oldest chunks are dropped beyond this count
    pub max_buffered_chunks: usize,

    /// Drop payloads that look like synthetic test fixtures
    pub screen_suspicious_input: bool,

    /// Exact payload lengths treated as synthetic fixtures
    pub suspicious_sizes: Vec<usize>,

    /// Payloads at least this large that are an exact multiple of
    /// `round_unit_bytes` are treated as synthetic
    pub large_payload_bytes: usize,
    pub round_unit_bytes: usize,
}

/// Provider tier selection per capability, highest rank first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub stt_tiers: Vec<String>,
    pub translation_tiers: Vec<String>,
    pub tts_tiers: Vec<String>,

    /// Attempts per TTS tier before moving to the next one
    pub tts_retries: u32,

    /// Pause between TTS attempts on the same tier
    pub tts_retry_backoff_ms: u64,

    /// Tier sequence tried for synthesis; `auto` resolves to the first TTS tier
    pub tts_sequence: Vec<String>,
}

/// Session lifecycle durations, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Teacher-only session with no student ever joined
    pub empty_teacher_timeout_secs: u64,

    /// Countdown after the last student leaves
    pub grace_period_secs: u64,

    /// Global staleness limit regardless of student count
    pub inactivity_timeout_secs: u64,

    pub sweep_interval_secs: u64,
}

impl LifecycleConfig {
    pub fn empty_teacher_timeout(&self) -> Duration {
        Duration::from_secs(self.empty_teacher_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Fan-out policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Target languages students may request; empty admits any language
    pub allowed_target_languages: Vec<String>,

    /// Extra attempts after a failed unicast send
    pub send_retries: u32,

    pub send_retry_backoff_ms: u64,

    /// Record delivered translations through the translation store
    pub persist_translations: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            gate: GateConfig::default(),
            audio: AudioConfig {
                sample_rate: 16000,
                min_flush_bytes: 5000,
                silence_gap_ms: 2000,
                max_buffered_chunks: 50,
                screen_suspicious_input: true,
                suspicious_sizes: vec![100, 1000, 1024, 2048, 4096, 8192, 16384, 32768],
                large_payload_bytes: 1_000_000,
                round_unit_bytes: 1000,
            },
            providers: ProvidersConfig {
                stt_tiers: vec!["unavailable".to_string()],
                translation_tiers: vec!["passthrough".to_string()],
                tts_tiers: vec!["silent".to_string()],
                tts_retries: 3,
                tts_retry_backoff_ms: 250,
                tts_sequence: vec!["auto".to_string()],
            },
            lifecycle: LifecycleConfig {
                empty_teacher_timeout_secs: 15 * 60,
                grace_period_secs: 5 * 60,
                inactivity_timeout_secs: 90 * 60,
                sweep_interval_secs: 60,
            },
            delivery: DeliveryConfig {
                allowed_target_languages: Vec::new(),
                send_retries: 2,
                send_retry_backoff_ms: 50,
                persist_translations: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_PROVIDERS__TTS_SEQUENCE=auto,elevenlabs`
    /// - `APP_GATE__SHARED_SECRET=classroom`
    /// - `PORT=3000`: special case for deployment platforms
    pub fn load() -> Result<Self> {
        let environment = config::Environment::with_prefix("APP")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("gate.allowed_ips")
            .with_list_parse_key("audio.suspicious_sizes")
            .with_list_parse_key("providers.stt_tiers")
            .with_list_parse_key("providers.translation_tiers")
            .with_list_parse_key("providers.tts_tiers")
            .with_list_parse_key("providers.tts_sequence")
            .with_list_parse_key("delivery.allowed_target_languages");

        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(environment);

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.min_flush_bytes == 0 {
            return Err(anyhow::anyhow!("Minimum flush size must be greater than 0"));
        }

        if self.audio.max_buffered_chunks == 0 {
            return Err(anyhow::anyhow!("Max buffered chunks must be greater than 0"));
        }

        if self.audio.round_unit_bytes == 0 {
            return Err(anyhow::anyhow!("Round unit must be greater than 0"));
        }

        if self.providers.stt_tiers.is_empty()
            || self.providers.translation_tiers.is_empty()
            || self.providers.tts_tiers.is_empty()
        {
            return Err(anyhow::anyhow!("Every capability needs at least one provider tier"));
        }

        if self.providers.tts_retries == 0 {
            return Err(anyhow::anyhow!("TTS retries must be at least 1"));
        }

        let lifecycle = &self.lifecycle;
        if lifecycle.empty_teacher_timeout_secs == 0
            || lifecycle.grace_period_secs == 0
            || lifecycle.inactivity_timeout_secs == 0
            || lifecycle.sweep_interval_secs == 0
        {
            return Err(anyhow::anyhow!("Lifecycle durations must be greater than 0"));
        }

        if lifecycle.empty_teacher_timeout_secs > MAX_LIFECYCLE_SECS
            || lifecycle.grace_period_secs > MAX_LIFECYCLE_SECS
            || lifecycle.inactivity_timeout_secs > MAX_LIFECYCLE_SECS
            || lifecycle.sweep_interval_secs > MAX_LIFECYCLE_SECS
        {
            return Err(anyhow::anyhow!(
                "Lifecycle durations cannot exceed {}s",
                MAX_LIFECYCLE_SECS
            ));
        }

        if lifecycle.grace_period_secs > lifecycle.inactivity_timeout_secs {
            return Err(anyhow::anyhow!(
                "Grace period ({}s) cannot exceed the inactivity timeout ({}s)",
                lifecycle.grace_period_secs,
                lifecycle.inactivity_timeout_secs
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (runtime tuning endpoint).
    ///
    /// Only the fields present are changed, e.g. `{"lifecycle": {"grace_period_secs": 60}}`.
    /// Provider tiers and the bind address are fixed at startup and ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(audio) = partial_config.get("audio") {
            if let Some(v) = audio.get("min_flush_bytes").and_then(|v| v.as_u64()) {
                self.audio.min_flush_bytes = usize::try_from(v)
                    .map_err(|_| anyhow::anyhow!("min_flush_bytes out of range: {}", v))?;
            }
            if let Some(v) = audio.get("silence_gap_ms").and_then(|v| v.as_u64()) {
                self.audio.silence_gap_ms = v;
            }
            if let Some(v) = audio.get("screen_suspicious_input").and_then(|v| v.as_bool()) {
                self.audio.screen_suspicious_input = v;
            }
        }

        if let Some(lifecycle) = partial_config.get("lifecycle") {
            if let Some(v) = lifecycle.get("empty_teacher_timeout_secs").and_then(|v| v.as_u64()) {
                self.lifecycle.empty_teacher_timeout_secs = v;
            }
            if let Some(v) = lifecycle.get("grace_period_secs").and_then(|v| v.as_u64()) {
                self.lifecycle.grace_period_secs = v;
            }
            if let Some(v) = lifecycle.get("inactivity_timeout_secs").and_then(|v| v.as_u64()) {
                self.lifecycle.inactivity_timeout_secs = v;
            }
        }

        if let Some(delivery) = partial_config.get("delivery") {
            if let Some(v) = delivery.get("send_retries").and_then(|v| v.as_u64()) {
                self.delivery.send_retries = u32::try_from(v)
                    .map_err(|_| anyhow::anyhow!("send_retries out of range: {}", v))?;
            }
            if let Some(v) = delivery.get("persist_translations").and_then(|v| v.as_bool()) {
                self.delivery.persist_translations = v;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.providers.tts_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lifecycle.grace_period_secs = config.lifecycle.inactivity_timeout_secs + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.providers.tts_tiers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"lifecycle": {"grace_period_secs": 90}, "audio": {"silence_gap_ms": 750}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.lifecycle.grace_period_secs, 90);
        assert_eq!(config.audio.silence_gap_ms, 750);
        assert_eq!(config.lifecycle.sweep_interval_secs, 60);
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"lifecycle": {"grace_period_secs": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_huge_lifecycle_durations_are_rejected() {
        let mut config = AppConfig::default();
        let json = r#"{"lifecycle": {"inactivity_timeout_secs": 10000000000000000}}"#;
        assert!(config.update_from_json(json).is_err());

        let mut config = AppConfig::default();
        config.lifecycle.sweep_interval_secs = MAX_LIFECYCLE_SECS + 1;
        assert!(config.validate().is_err());

        config.lifecycle.sweep_interval_secs = MAX_LIFECYCLE_SECS;
        config.lifecycle.inactivity_timeout_secs = MAX_LIFECYCLE_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_integers_are_rejected() {
        let mut config = AppConfig::default();
        let json = r#"{"delivery": {"send_retries": 4294967296}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.delivery.send_retries, 2);

        let json = r#"{"delivery": {"send_retries": 4294967295}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.delivery.send_retries, u32::MAX);
    }
}
