//! Session, transcript and usage data types.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-supplied context for a new voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionContext {
    /// Public slug of the gym location the kiosk or app is running at.
    pub location_slug: String,
    pub member_id: Option<String>,
    /// Free-form member profile forwarded to the session issuer.
    pub member_data: Option<serde_json::Value>,
    pub language_preference: String,
}

/// The ephemeral credential and descriptor returned by the session issuer.
#[derive(Debug)]
pub struct SessionDescriptor {
    pub credential: SecretString,
    pub session_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub member_ref: Option<String>,
    pub gym_ref: Option<String>,
}

/// Gym and franchise identifiers used to attribute usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub gym_id: Option<String>,
    pub franchise_id: Option<String>,
    /// `false` when the location lookup failed and the ids are partial.
    pub complete: bool,
}

/// A logical voice session, created on `connect()` and finalized on teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub member_ref: Option<String>,
    pub attribution: Attribution,
}

/// Status of the realtime connection as seen by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Listening,
    Speaking,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// The status edges a session may take.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (from, to) if from == to => false,
            (_, Error) | (_, Idle) => true,
            (Idle, Connecting) | (Reconnecting, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Listening) | (Connected, Speaking) => true,
            (Listening, Connected) | (Listening, Speaking) => true,
            (Speaking, Connected) | (Speaking, Listening) => true,
            (Connecting | Connected | Listening | Speaking, Reconnecting) => true,
            _ => false,
        }
    }

    /// True while a transport is up or being (re)established.
    pub fn is_live(self) -> bool {
        !matches!(self, ConnectionState::Idle | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Listening => "listening",
            ConnectionState::Speaking => "speaking",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Ai,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Ai => write!(f, "ai"),
        }
    }
}

/// One finalized utterance in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub turn_number: u32,
}

/// Usage accumulated over a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub text_input_tokens: u64,
    pub text_output_tokens: u64,
    pub audio_input_seconds: f64,
    pub audio_output_seconds: f64,
    pub error_occurred: bool,
}

/// Why a session ended, as reported to the accounting collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserAction,
    UserGoodbye,
    Error,
    ConnectionLost,
    ConnectionFailed,
    OwnerTeardown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EndReason::UserAction => "user_action",
            EndReason::UserGoodbye => "user_goodbye",
            EndReason::Error => "error",
            EndReason::ConnectionLost => "connection_lost",
            EndReason::ConnectionFailed => "connection_failed",
            EndReason::OwnerTeardown => "owner_teardown",
        };
        f.write_str(label)
    }
}

/// The record submitted exactly once per session to the accounting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub session_id: String,
    pub gym_id: Option<String>,
    pub franchise_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub text_input_tokens: u64,
    pub text_output_tokens: u64,
    pub audio_input_tokens: u64,
    pub audio_output_tokens: u64,
    pub error_occurred: bool,
    pub end_reason: EndReason,
}

/// One finalized user utterance sent to the logging collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionLog {
    pub session_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub turn_number: u32,
}
