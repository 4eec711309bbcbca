use gymvoice_core::ConfigError;
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_REALTIME_ENDPOINT: &str = "https://api.openai.com/v1/realtime/calls";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Where the HTTP collaborators send their requests.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointConfig {
    pub session_endpoint: Url,
    pub realtime_endpoint: Url,
    pub realtime_model: String,
    /// Base URL for location lookups; the slug is appended as a path segment.
    pub location_endpoint: Option<Url>,
    pub logging_endpoint: Option<Url>,
    pub accounting_endpoint: Option<Url>,
    pub http_timeout: Duration,
}

impl EndpointConfig {
    /// Loads endpoint configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let session_endpoint = std::env::var("SESSION_ENDPOINT")
            .map_err(|_| ConfigError::MissingVar("SESSION_ENDPOINT".to_string()))
            .and_then(|raw| parse_url("SESSION_ENDPOINT", &raw))?;

        let realtime_endpoint = parse_url(
            "REALTIME_ENDPOINT",
            &std::env::var("REALTIME_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_REALTIME_ENDPOINT.to_string()),
        )?;

        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_string());

        let location_endpoint = optional_url("LOCATION_ENDPOINT")?;
        let logging_endpoint = optional_url("LOGGING_ENDPOINT")?;
        let accounting_endpoint = optional_url("ACCOUNTING_ENDPOINT")?;

        let timeout_str = std::env::var("HTTP_TIMEOUT_SECS").unwrap_or_else(|_| "10".to_string());
        let timeout_secs = timeout_str.parse::<u64>().map_err(|_| {
            ConfigError::InvalidValue(
                "HTTP_TIMEOUT_SECS".to_string(),
                format!("'{}' is not a whole number of seconds", timeout_str),
            )
        })?;

        Ok(Self {
            session_endpoint,
            realtime_endpoint,
            realtime_model,
            location_endpoint,
            logging_endpoint,
            accounting_endpoint,
            http_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Builds the shared HTTP client with the configured timeout.
    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.http_timeout)
            .connect_timeout(self.http_timeout)
            .build()?)
    }
}

fn parse_url(var: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))
}

fn optional_url(var: &str) -> Result<Option<Url>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => parse_url(var, raw.trim()).map(Some),
        _ => Ok(None),
    }
}
