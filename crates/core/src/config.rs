use crate::reconnect::BackoffPolicy;
use std::time::Duration;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Tunables for a [`crate::controller::VoiceSessionController`].
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Phrase that ends the conversation when heard in a user utterance.
    pub goodbye_phrase: String,
    /// Delay between goodbye detection and teardown, so the reply can finish.
    pub goodbye_grace: Duration,
    pub backoff: BackoffPolicy,
    pub stability_interval: Duration,
    pub stability_window: Duration,
    /// Seconds of assistant audio assumed per completed response.
    pub audio_output_seconds_per_response: f64,
    pub audio_tokens_per_minute: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            goodbye_phrase: "au revoir".to_string(),
            goodbye_grace: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
            stability_interval: Duration::from_secs(20),
            stability_window: Duration::from_secs(45),
            audio_output_seconds_per_response: 4.0,
            audio_tokens_per_minute: 600.0,
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from `GYMVOICE_*` environment variables, falling
    /// back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let defaults = Self::default();

        let goodbye_phrase = std::env::var("GYMVOICE_GOODBYE_PHRASE")
            .unwrap_or(defaults.goodbye_phrase)
            .trim()
            .to_string();
        if goodbye_phrase.is_empty() {
            return Err(ConfigError::InvalidValue(
                "GYMVOICE_GOODBYE_PHRASE".to_string(),
                "phrase must not be empty".to_string(),
            ));
        }

        let goodbye_grace = env_millis("GYMVOICE_GOODBYE_GRACE_MS")?.unwrap_or(defaults.goodbye_grace);

        let backoff = BackoffPolicy::new(
            env_millis("GYMVOICE_RECONNECT_BASE_MS")?.unwrap_or(defaults.backoff.base),
            env_parse::<f64>("GYMVOICE_RECONNECT_MULTIPLIER")?.unwrap_or(defaults.backoff.multiplier),
            env_millis("GYMVOICE_RECONNECT_MAX_DELAY_MS")?.unwrap_or(defaults.backoff.max_delay),
            env_parse::<u32>("GYMVOICE_RECONNECT_MAX_ATTEMPTS")?
                .unwrap_or(defaults.backoff.max_attempts),
        )
        .map_err(|msg| ConfigError::InvalidValue("GYMVOICE_RECONNECT_*".to_string(), msg))?;

        let stability_interval =
            env_millis("GYMVOICE_STABILITY_INTERVAL_MS")?.unwrap_or(defaults.stability_interval);
        let stability_window =
            env_millis("GYMVOICE_STABILITY_WINDOW_MS")?.unwrap_or(defaults.stability_window);

        let audio_output_seconds_per_response = env_parse::<f64>("GYMVOICE_AUDIO_OUTPUT_SECONDS")?
            .unwrap_or(defaults.audio_output_seconds_per_response);
        let audio_tokens_per_minute = env_parse::<f64>("GYMVOICE_AUDIO_TOKENS_PER_MINUTE")?
            .unwrap_or(defaults.audio_tokens_per_minute);

        Ok(Self {
            goodbye_phrase,
            goodbye_grace,
            backoff,
            stability_interval,
            stability_window,
            audio_output_seconds_per_response,
            audio_tokens_per_minute,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), format!("'{}' is not valid", raw))),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}
