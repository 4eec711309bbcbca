//! Defines the event protocol between the remote speech service and the
//! controller, and the updates the controller pushes to its owner.

use crate::{
    error::SessionError,
    model::{ConnectionState, Speaker},
};
use serde::Deserialize;

/// Events received on the realtime event channel.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Server-side voice activity detection heard the user start speaking.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.created")]
    ResponseCreated,
    /// A chunk of the assistant's spoken reply, as text.
    #[serde(rename = "response.audio_transcript.delta")]
    AssistantTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    AssistantTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    UserTranscriptDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscriptCompleted { transcript: String },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error { error: RemoteError },
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        #[serde(default)]
        rate_limits: Vec<RateLimit>,
    },
    /// Any event type this controller does not act on.
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RateLimit {
    pub name: String,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub remaining: Option<u64>,
    #[serde(default)]
    pub reset_seconds: Option<f64>,
}

impl ServerEvent {
    /// Parses one frame from the event channel.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Updates pushed from the controller to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    StatusChanged(ConnectionState),
    /// A partial (`is_final == false`) or finalized utterance.
    Transcript {
        speaker: Speaker,
        text: String,
        is_final: bool,
    },
    Error(SessionError),
    /// The user said goodbye and the session was closed.
    Goodbye,
    SessionCreated { session_id: String },
}
