//! Interaction logging and usage accounting collaborators.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gymvoice_core::{
    collaborators::{InteractionLogger, UsageSink},
    model::{EndReason, InteractionLog, Speaker, UsageRecord},
};
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InteractionPayload<'a> {
    session_id: &'a str,
    speaker: Speaker,
    text: &'a str,
    turn_number: u32,
}

impl<'a> From<&'a InteractionLog> for InteractionPayload<'a> {
    fn from(log: &'a InteractionLog) -> Self {
        Self {
            session_id: &log.session_id,
            speaker: log.speaker,
            text: &log.text,
            turn_number: log.turn_number,
        }
    }
}

/// Posts each finalized user utterance to the logging endpoint.
pub struct HttpInteractionLogger {
    client: Client,
    endpoint: Url,
}

impl HttpInteractionLogger {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl InteractionLogger for HttpInteractionLogger {
    async fn log(&self, entry: InteractionLog) -> Result<()> {
        self.client
            .post(self.endpoint.clone())
            .json(&InteractionPayload::from(&entry))
            .send()
            .await
            .context("Interaction log request failed")?
            .error_for_status()?;
        debug!(session_id = %entry.session_id, turn = entry.turn_number, "Interaction logged");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsagePayload<'a> {
    session_id: &'a str,
    gym_id: Option<&'a str>,
    franchise_id: Option<&'a str>,
    start_time: DateTime<Utc>,
    duration_seconds: f64,
    text_input_tokens: u64,
    text_output_tokens: u64,
    audio_input_tokens: u64,
    audio_output_tokens: u64,
    error_occurred: bool,
    end_reason: EndReason,
}

impl<'a> From<&'a UsageRecord> for UsagePayload<'a> {
    fn from(record: &'a UsageRecord) -> Self {
        Self {
            session_id: &record.session_id,
            gym_id: record.gym_id.as_deref(),
            franchise_id: record.franchise_id.as_deref(),
            start_time: record.start_time,
            duration_seconds: record.duration_seconds,
            text_input_tokens: record.text_input_tokens,
            text_output_tokens: record.text_output_tokens,
            audio_input_tokens: record.audio_input_tokens,
            audio_output_tokens: record.audio_output_tokens,
            error_occurred: record.error_occurred,
            end_reason: record.end_reason,
        }
    }
}

/// Submits the per-session usage record. The endpoint does not deduplicate.
pub struct HttpUsageSink {
    client: Client,
    endpoint: Url,
}

impl HttpUsageSink {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl UsageSink for HttpUsageSink {
    async fn submit(&self, record: UsageRecord) -> Result<()> {
        self.client
            .post(self.endpoint.clone())
            .json(&UsagePayload::from(&record))
            .send()
            .await
            .context("Usage submission request failed")?
            .error_for_status()?;
        info!(session_id = %record.session_id, end_reason = %record.end_reason, "Usage record accepted");
        Ok(())
    }
}
