use crate::{
    local::{CapturingUsageSink, LocalIssuer, LogOnlyLogger, UnresolvedDirectory},
    media::{LogPlayback, LoopbackSignaling, ReplayMicrophone, ReplayPeers},
    script::ReplayScript,
};
use anyhow::{Context, Result};
use gymvoice_core::{
    ConnectionState, ControllerConfig, SessionContext, SessionUpdate, UsageRecord,
    VoiceSessionController,
    collaborators::{Collaborators, InteractionLogger, LocationDirectory, SessionIssuer, UsageSink},
    model::TranscriptEntry,
};
use gymvoice_realtime::{EndpointConfig, HttpCollaborators};
use std::sync::Arc;
use tracing::{info, warn};

/// The backend-facing collaborators of a replay.
pub struct ReplayBackend {
    pub issuer: Arc<dyn SessionIssuer>,
    pub directory: Arc<dyn LocationDirectory>,
    pub logger: Arc<dyn InteractionLogger>,
    pub usage: Option<Arc<dyn UsageSink>>,
}

impl ReplayBackend {
    /// Everything stays in-process; the usage record is only logged.
    pub fn local() -> Self {
        Self {
            issuer: Arc::new(LocalIssuer),
            directory: Arc::new(UnresolvedDirectory),
            logger: Arc::new(LogOnlyLogger),
            usage: None,
        }
    }

    /// Issuance, attribution, logging and accounting go to the configured
    /// endpoints. Media stays local, so the HTTP signaling is not used.
    pub fn http(endpoints: &EndpointConfig) -> Result<Self> {
        let http = HttpCollaborators::from_config(endpoints)
            .context("Failed to build HTTP collaborators")?;
        Ok(Self {
            issuer: http.issuer,
            directory: http
                .directory
                .unwrap_or_else(|| Arc::new(UnresolvedDirectory)),
            logger: http.logger.unwrap_or_else(|| Arc::new(LogOnlyLogger)),
            usage: http.usage,
        })
    }
}

#[derive(Debug)]
pub struct ReplayReport {
    pub final_status: ConnectionState,
    pub transcript: Vec<TranscriptEntry>,
    pub usage: UsageRecord,
}

/// Drives one controller session through `script` and returns what it
/// produced. `on_update` sees every update as it is emitted.
pub async fn replay(
    script: Arc<ReplayScript>,
    backend: ReplayBackend,
    config: ControllerConfig,
    context: SessionContext,
    mut on_update: impl FnMut(&SessionUpdate),
) -> Result<ReplayReport> {
    let capture = Arc::new(CapturingUsageSink::new(backend.usage));
    let collaborators = Collaborators {
        issuer: backend.issuer,
        directory: backend.directory,
        audio: Arc::new(ReplayMicrophone),
        peers: Arc::new(ReplayPeers::new(script.clone())),
        signaling: Arc::new(LoopbackSignaling),
        playback: Arc::new(LogPlayback),
        logger: backend.logger,
        usage: capture.clone(),
    };
    let (controller, mut updates) = VoiceSessionController::new(collaborators, config);

    let handle = controller
        .connect(context)
        .await
        .context("Could not start the replay session")?
        .context("A session was already running")?;
    info!(session_id = ?handle.session_id(), steps = script.remaining(), "Replay started");

    loop {
        tokio::select! {
            _ = script.finished() => {
                info!("Event log exhausted; ending session");
                break;
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                on_update(&update);
                match update {
                    SessionUpdate::Goodbye
                    | SessionUpdate::StatusChanged(ConnectionState::Error) => break,
                    _ => {}
                }
            }
        }
    }

    handle.release().await;
    let usage = capture.recorded().await;
    while let Ok(update) = updates.try_recv() {
        on_update(&update);
    }

    let final_status = controller.status();
    if final_status == ConnectionState::Error {
        warn!(session_id = %usage.session_id, "Replay ended in error");
    }
    Ok(ReplayReport {
        final_status,
        transcript: controller.transcript(),
        usage,
    })
}
