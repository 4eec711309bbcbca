//! Consumes inbound protocol events in order, drives the connection status,
//! assembles the transcript and feeds the usage accountant.
//!
//! Every handler is synchronous and runs to completion before the next event
//! is taken from the channel. The only side effect that leaves this module
//! asynchronously is the fire-and-forget utterance log.

use crate::{
    accounting::{UsageAccountant, estimate_text_tokens},
    collaborators::InteractionLogger,
    error::SessionError,
    model::{ConnectionState, InteractionLog, Speaker, TranscriptEntry},
    protocol::{ServerEvent, SessionUpdate},
    stability::ActivityMarker,
    status::{StatusTracker, UpdateSender, notify},
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

/// Decides whether a user utterance ends the conversation.
pub trait GoodbyeMatcher: Send + Sync {
    fn matches(&self, utterance: &str) -> bool;
}

/// Case-insensitive substring match against one configured phrase.
///
/// This deliberately matches anywhere in the utterance, so a sentence that
/// merely contains the phrase also ends the session.
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    phrase: String,
}

impl PhraseMatcher {
    pub fn new(phrase: &str) -> Self {
        Self {
            phrase: phrase.trim().to_lowercase(),
        }
    }
}

impl GoodbyeMatcher for PhraseMatcher {
    fn matches(&self, utterance: &str) -> bool {
        !self.phrase.is_empty() && utterance.to_lowercase().contains(&self.phrase)
    }
}

/// Rolling partial text plus the finalized conversation history.
#[derive(Debug, Default, Clone)]
pub struct TranscriptBuffer {
    assistant_partial: String,
    user_partial: String,
    history: Vec<TranscriptEntry>,
    turn: u32,
}

impl TranscriptBuffer {
    pub fn history(&self) -> &[TranscriptEntry] {
        &self.history
    }

    pub fn assistant_partial(&self) -> &str {
        &self.assistant_partial
    }

    pub fn user_partial(&self) -> &str {
        &self.user_partial
    }

    /// Number of the most recent user turn, 0 before the first one.
    pub fn current_turn(&self) -> u32 {
        self.turn
    }

    fn finalize_assistant(&mut self, text: String) -> TranscriptEntry {
        self.assistant_partial.clear();
        let entry = TranscriptEntry {
            speaker: Speaker::Ai,
            text,
            turn_number: self.turn,
        };
        self.history.push(entry.clone());
        entry
    }

    fn finalize_user(&mut self, text: String) -> TranscriptEntry {
        self.user_partial.clear();
        self.turn += 1;
        let entry = TranscriptEntry {
            speaker: Speaker::User,
            text,
            turn_number: self.turn,
        };
        self.history.push(entry.clone());
        entry
    }
}

/// What the controller must do after an event was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Continue,
    /// The user said goodbye; close the session after the grace delay.
    Goodbye,
    /// The remote service reported an error; the session must end.
    Terminate(SessionError),
}

pub struct ProtocolEventDispatcher {
    session_id: String,
    status: Arc<StatusTracker>,
    accountant: Arc<UsageAccountant>,
    activity: Arc<ActivityMarker>,
    logger: Arc<dyn InteractionLogger>,
    goodbye: Arc<dyn GoodbyeMatcher>,
    updates: UpdateSender,
    audio_output_seconds_per_response: f64,
    transcript: TranscriptBuffer,
    speech_started_at: Option<Instant>,
    recording: bool,
    playing: bool,
}

impl ProtocolEventDispatcher {
    pub fn new(
        status: Arc<StatusTracker>,
        accountant: Arc<UsageAccountant>,
        activity: Arc<ActivityMarker>,
        logger: Arc<dyn InteractionLogger>,
        goodbye: Arc<dyn GoodbyeMatcher>,
        updates: UpdateSender,
        audio_output_seconds_per_response: f64,
    ) -> Self {
        Self {
            session_id: String::new(),
            status,
            accountant,
            activity,
            logger,
            goodbye,
            updates,
            audio_output_seconds_per_response,
            transcript: TranscriptBuffer::default(),
            speech_started_at: None,
            recording: false,
            playing: false,
        }
    }

    /// Resets the transcript and turn numbering for a new session.
    pub fn begin(&mut self, session_id: &str) {
        self.session_id = session_id.to_string();
        self.transcript = TranscriptBuffer::default();
        self.clear_transient();
    }

    /// Drops partial state that cannot survive a transport change.
    pub fn clear_transient(&mut self) {
        self.transcript.assistant_partial.clear();
        self.transcript.user_partial.clear();
        self.speech_started_at = None;
        self.recording = false;
        self.playing = false;
    }

    pub fn transcript(&self) -> &TranscriptBuffer {
        &self.transcript
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Parses and handles one raw frame. Malformed frames are ignored.
    pub fn dispatch_raw(&mut self, raw: &str) -> DispatchOutcome {
        match ServerEvent::parse(raw) {
            Ok(event) => self.dispatch(event),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed protocol event");
                DispatchOutcome::Continue
            }
        }
    }

    pub fn dispatch(&mut self, event: ServerEvent) -> DispatchOutcome {
        match event {
            ServerEvent::SpeechStarted => {
                self.status.transition(ConnectionState::Listening);
                self.speech_started_at = Some(Instant::now());
                self.recording = true;
                self.activity.touch();
            }
            ServerEvent::SpeechStopped => {
                self.recording = false;
                if let Some(started) = self.speech_started_at.take() {
                    self.accountant
                        .add_audio_input_seconds(started.elapsed().as_secs_f64());
                }
            }
            ServerEvent::ResponseCreated => {
                self.status.transition(ConnectionState::Speaking);
                self.playing = true;
                self.activity.touch();
            }
            ServerEvent::AssistantTranscriptDelta { delta } => {
                self.transcript.assistant_partial.push_str(&delta);
                notify(
                    &self.updates,
                    SessionUpdate::Transcript {
                        speaker: Speaker::Ai,
                        text: self.transcript.assistant_partial.clone(),
                        is_final: false,
                    },
                );
                self.activity.touch();
            }
            ServerEvent::AssistantTranscriptDone { transcript } => {
                let text = if transcript.is_empty() {
                    std::mem::take(&mut self.transcript.assistant_partial)
                } else {
                    transcript
                };
                let entry = self.transcript.finalize_assistant(text);
                self.accountant
                    .add_text_output_tokens(estimate_text_tokens(&entry.text));
                notify(
                    &self.updates,
                    SessionUpdate::Transcript {
                        speaker: Speaker::Ai,
                        text: entry.text,
                        is_final: true,
                    },
                );
            }
            ServerEvent::UserTranscriptDelta { delta } => {
                self.transcript.user_partial.push_str(&delta);
                notify(
                    &self.updates,
                    SessionUpdate::Transcript {
                        speaker: Speaker::User,
                        text: self.transcript.user_partial.clone(),
                        is_final: false,
                    },
                );
            }
            ServerEvent::UserTranscriptCompleted { transcript } => {
                return self.on_user_utterance(transcript);
            }
            ServerEvent::ResponseAudioDone => {
                self.playing = false;
                self.accountant
                    .add_audio_output_seconds(self.audio_output_seconds_per_response);
            }
            ServerEvent::ResponseDone => {
                self.status.transition(ConnectionState::Connected);
            }
            ServerEvent::Error { error } => {
                self.accountant.mark_error();
                self.status.transition(ConnectionState::Error);
                let message = if error.message.is_empty() {
                    "The voice service reported an error".to_string()
                } else {
                    error.message
                };
                warn!(session_id = %self.session_id, code = ?error.code, %message, "Remote protocol error");
                let err = SessionError::RemoteProtocolError(message);
                notify(&self.updates, SessionUpdate::Error(err.clone()));
                return DispatchOutcome::Terminate(err);
            }
            ServerEvent::RateLimitsUpdated { rate_limits } => {
                for limit in &rate_limits {
                    debug!(name = %limit.name, remaining = ?limit.remaining, limit = ?limit.limit, "Rate limit notice");
                }
            }
            ServerEvent::Unknown => {}
        }
        DispatchOutcome::Continue
    }

    fn on_user_utterance(&mut self, text: String) -> DispatchOutcome {
        let entry = self.transcript.finalize_user(text);
        self.accountant
            .add_text_input_tokens(estimate_text_tokens(&entry.text));
        notify(
            &self.updates,
            SessionUpdate::Transcript {
                speaker: Speaker::User,
                text: entry.text.clone(),
                is_final: true,
            },
        );

        let matched = self.goodbye.matches(&entry.text);
        self.submit_log(entry);

        if matched {
            info!(session_id = %self.session_id, "Goodbye phrase detected");
            DispatchOutcome::Goodbye
        } else {
            DispatchOutcome::Continue
        }
    }

    fn submit_log(&self, entry: TranscriptEntry) {
        let log = InteractionLog {
            session_id: self.session_id.clone(),
            speaker: entry.speaker,
            text: entry.text,
            turn_number: entry.turn_number,
        };
        let logger = self.logger.clone();
        let span = info_span!("interaction_log", session_id = %log.session_id, turn = log.turn_number);
        tokio::spawn(
            async move {
                if let Err(e) = logger.log(log).await {
                    warn!(error = %format!("{:#}", e), "Failed to log interaction");
                }
            }
            .instrument(span),
        );
    }
}
