//! The voice session controller.
//!
//! One controller supervises at most one logical session. Its lifecycle:
//!
//! - `connect()`: negotiate a session, start the usage ledger, establish the
//!   transport and spawn the event pump.
//! - transport failure: the pump (or a failed connect) hands the error to the
//!   reconnection scheduler, which re-issues a credential and re-establishes
//!   the transport for the same session.
//! - teardown: explicit `disconnect()`, a released or dropped
//!   [`SessionHandle`], goodbye detection, a remote error or exhausted
//!   reconnection all converge on the same release sequence, which finalizes
//!   usage at most once.

use crate::{
    accounting::UsageAccountant,
    collaborators::{ChannelFrame, Collaborators, EventChannel},
    config::ControllerConfig,
    connection::ConnectionManager,
    dispatcher::{DispatchOutcome, GoodbyeMatcher, PhraseMatcher, ProtocolEventDispatcher},
    error::SessionError,
    model::{
        ConnectionState, EndReason, Session, SessionContext, SessionDescriptor, TranscriptEntry,
        UsageCounters,
    },
    negotiator::SessionNegotiator,
    protocol::SessionUpdate,
    reconnect::{ReconnectPhase, ReconnectionScheduler, ScheduleOutcome},
    stability::{ActivityMarker, StabilityMonitor},
    status::{StatusTracker, UpdateSender, notify},
};
use chrono::Utc;
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    Connecting,
    /// A session exists; the transport is up or being re-established.
    Active,
}

#[derive(Default)]
struct Lifecycle {
    phase: Phase,
    /// Incremented by every `connect()`; background tasks of an older
    /// session compare against it and stand down.
    generation: u64,
    context: Option<SessionContext>,
    session: Option<Session>,
    /// The most recently ended session, with its end time.
    ended: Option<Session>,
    pump: Option<JoinHandle<()>>,
    goodbye: Option<JoinHandle<()>>,
    stability: Option<StabilityMonitor>,
}

struct Shared {
    config: ControllerConfig,
    negotiator: SessionNegotiator,
    connection: ConnectionManager,
    reconnect: ReconnectionScheduler,
    accountant: Arc<UsageAccountant>,
    status: Arc<StatusTracker>,
    activity: Arc<ActivityMarker>,
    dispatcher: Mutex<ProtocolEventDispatcher>,
    updates: UpdateSender,
    lifecycle: Mutex<Lifecycle>,
}

/// Opens, supervises and tears down realtime voice sessions.
#[derive(Clone)]
pub struct VoiceSessionController {
    shared: Arc<Shared>,
}

impl VoiceSessionController {
    /// Creates a controller that ends sessions on the configured goodbye phrase.
    ///
    /// Returns the controller and the receiver of its [`SessionUpdate`]s.
    pub fn new(
        collaborators: Collaborators,
        config: ControllerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let matcher = Arc::new(PhraseMatcher::new(&config.goodbye_phrase));
        Self::with_goodbye_matcher(collaborators, config, matcher)
    }

    pub fn with_goodbye_matcher(
        collaborators: Collaborators,
        config: ControllerConfig,
        goodbye: Arc<dyn GoodbyeMatcher>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let status = Arc::new(StatusTracker::new(updates.clone()));
        let accountant = Arc::new(UsageAccountant::new(
            collaborators.usage.clone(),
            config.audio_tokens_per_minute,
        ));
        let activity = Arc::new(ActivityMarker::default());
        let dispatcher = ProtocolEventDispatcher::new(
            status.clone(),
            accountant.clone(),
            activity.clone(),
            collaborators.logger.clone(),
            goodbye,
            updates.clone(),
            config.audio_output_seconds_per_response,
        );

        let shared = Shared {
            negotiator: SessionNegotiator::new(collaborators.issuer, collaborators.directory),
            connection: ConnectionManager::new(
                collaborators.audio,
                collaborators.peers,
                collaborators.signaling,
                collaborators.playback,
            ),
            reconnect: ReconnectionScheduler::new(config.backoff.clone()),
            accountant,
            status,
            activity,
            dispatcher: Mutex::new(dispatcher),
            updates,
            lifecycle: Mutex::new(Lifecycle::default()),
            config,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            receiver,
        )
    }

    /// Starts a new session for `context`.
    ///
    /// Returns `Ok(None)` when a session is already connecting or active.
    /// Device and session-issuance failures are returned immediately. A
    /// transport failure after the session was created is handed to the
    /// reconnection scheduler and the handle is still returned; the status
    /// stream reports `reconnecting`.
    pub async fn connect(
        &self,
        context: SessionContext,
    ) -> Result<Option<SessionHandle>, SessionError> {
        let shared = &self.shared;
        let generation = {
            let mut lc = shared.lifecycle();
            if lc.phase != Phase::Idle {
                debug!(phase = ?lc.phase, "connect() ignored: session already in progress");
                return Ok(None);
            }
            lc.phase = Phase::Connecting;
            lc.generation += 1;
            lc.context = Some(context.clone());
            lc.generation
        };

        shared.reconnect.reset();
        if shared.status.get() == ConnectionState::Error {
            shared.status.transition(ConnectionState::Idle);
        }
        shared.status.transition(ConnectionState::Connecting);

        let negotiated = match shared.negotiator.create_session(&context).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                shared.abandon(generation, &e);
                return Err(e);
            }
        };

        let session = Session {
            id: negotiated.descriptor.session_id.clone(),
            started_at: Utc::now(),
            ended_at: None,
            member_ref: negotiated.descriptor.member_ref.clone(),
            attribution: negotiated.attribution,
        };
        {
            let mut lc = shared.lifecycle();
            if lc.generation != generation || lc.phase != Phase::Connecting {
                info!(session_id = %session.id, "Session torn down during negotiation");
                return Err(SessionError::Cancelled);
            }
            lc.session = Some(session.clone());
        }
        shared
            .accountant
            .begin(&session.id, session.started_at, session.attribution.clone());
        shared.dispatcher().begin(&session.id);
        notify(
            &shared.updates,
            SessionUpdate::SessionCreated {
                session_id: session.id.clone(),
            },
        );
        info!(session_id = %session.id, complete_attribution = session.attribution.complete, "Voice session created");

        match shared.establish(generation, &negotiated.descriptor).await {
            Ok(()) => Ok(Some(SessionHandle::new(shared.clone(), generation))),
            Err(SessionError::Cancelled) => Err(SessionError::Cancelled),
            Err(e) if e.is_retryable() => {
                shared.on_transport_failure(generation, e);
                Ok(Some(SessionHandle::new(shared.clone(), generation)))
            }
            Err(e) => {
                notify(&shared.updates, SessionUpdate::Error(e.clone()));
                shared
                    .terminate(generation, &e, EndReason::ConnectionFailed)
                    .await;
                Err(e)
            }
        }
    }

    /// Ends the current session, if any.
    ///
    /// Cancels both timers, closes the transport, releases the microphone,
    /// clears playback and finalizes usage. Idempotent.
    pub async fn disconnect(&self, reason: EndReason) {
        self.shared.teardown(reason, ConnectionState::Idle).await;
    }

    pub fn status(&self) -> ConnectionState {
        self.shared.status.get()
    }

    /// Finalized utterances of the current (or most recent) session.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.dispatcher().transcript().history().to_vec()
    }

    pub fn usage(&self) -> Option<UsageCounters> {
        self.shared.accountant.counters()
    }

    /// The running session or, once it has ended, the last one.
    pub fn session(&self) -> Option<Session> {
        let lc = self.shared.lifecycle();
        lc.session.clone().or_else(|| lc.ended.clone())
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect.attempts()
    }

    pub fn reconnect_phase(&self) -> ReconnectPhase {
        self.shared.reconnect.phase()
    }

    pub fn last_activity(&self) -> Instant {
        self.shared.activity.last()
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatcher(&self) -> MutexGuard<'_, ProtocolEventDispatcher> {
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `generation` is the live session.
    fn is_live(&self, generation: u64) -> bool {
        let lc = self.lifecycle();
        lc.generation == generation && lc.phase != Phase::Idle
    }

    /// Gives up on a connect that never produced a session.
    fn abandon(&self, generation: u64, err: &SessionError) {
        {
            let mut lc = self.lifecycle();
            if lc.generation != generation {
                return;
            }
            lc.phase = Phase::Idle;
            lc.context = None;
        }
        warn!(error = %err, "Could not create voice session");
        self.status.transition(ConnectionState::Error);
        notify(&self.updates, SessionUpdate::Error(err.clone()));
    }

    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        descriptor: &SessionDescriptor,
    ) -> Result<(), SessionError> {
        let Some(channel) = self.connection.connect(descriptor).await? else {
            // Leftover transport from an earlier attempt; the retry path
            // releases it before connecting again.
            return Err(SessionError::ChannelError(
                "transport already active".to_string(),
            ));
        };

        let session_id = {
            let lc = self.lifecycle();
            (lc.generation == generation && lc.phase != Phase::Idle)
                .then(|| lc.session.as_ref().map(|s| s.id.clone()).unwrap_or_default())
        };
        let Some(session_id) = session_id else {
            return self.discard_transport().await;
        };

        self.status.transition(ConnectionState::Connected);
        self.reconnect.reset();
        self.activity.touch();

        let span = info_span!("voice_session", %session_id);
        let pump = tokio::spawn(self.clone().pump(generation, channel).instrument(span));

        let pump = {
            let mut lc = self.lifecycle();
            if lc.generation != generation || lc.phase == Phase::Idle {
                Some(pump)
            } else {
                lc.phase = Phase::Active;
                if let Some(previous) = lc.pump.replace(pump) {
                    previous.abort();
                }
                if lc.stability.is_none() {
                    lc.stability = Some(StabilityMonitor::start(
                        self.activity.clone(),
                        self.config.stability_interval,
                        self.config.stability_window,
                    ));
                }
                None
            }
        };
        if let Some(pump) = pump {
            pump.abort();
            return self.discard_transport().await;
        }
        Ok(())
    }

    /// Releases a transport that came up after its session was torn down.
    async fn discard_transport(&self) -> Result<(), SessionError> {
        info!("Session ended while the transport was being established; releasing it");
        self.connection.release().await;
        Err(SessionError::Cancelled)
    }

    /// Feeds inbound frames to the dispatcher, one at a time, in order.
    async fn pump(self: Arc<Self>, generation: u64, mut channel: EventChannel) {
        while let Some(frame) = channel.recv().await {
            let outcome = match frame {
                ChannelFrame::Message(raw) => {
                    let mut dispatcher = self.dispatcher();
                    dispatcher.dispatch_raw(&raw)
                }
                ChannelFrame::Failed(reason) => {
                    self.on_transport_failure(generation, SessionError::ChannelError(reason));
                    return;
                }
            };

            match outcome {
                DispatchOutcome::Continue => {}
                DispatchOutcome::Goodbye => self.schedule_goodbye(generation),
                DispatchOutcome::Terminate(err) => {
                    let shared = self.clone();
                    tokio::spawn(async move {
                        shared.terminate(generation, &err, EndReason::Error).await;
                    });
                    return;
                }
            }
        }

        self.on_transport_failure(
            generation,
            SessionError::ChannelError("event channel closed".to_string()),
        );
    }

    fn on_transport_failure(self: &Arc<Self>, generation: u64, err: SessionError) {
        if !self.is_live(generation) {
            return;
        }
        warn!(error = %err, "Realtime transport failed");
        self.dispatcher().clear_transient();

        let shared = self.clone();
        match self
            .reconnect
            .schedule(move || async move { shared.retry(generation).await })
        {
            ScheduleOutcome::Scheduled { .. } => {
                self.status.transition(ConnectionState::Reconnecting);
            }
            ScheduleOutcome::AlreadyPending => {}
            ScheduleOutcome::Exhausted { attempts } => {
                let err = SessionError::ReconnectExhausted { attempts };
                notify(&self.updates, SessionUpdate::Error(err.clone()));
                let shared = self.clone();
                tokio::spawn(async move {
                    shared
                        .terminate(generation, &err, EndReason::ConnectionLost)
                        .await;
                });
            }
        }
    }

    async fn retry(self: Arc<Self>, generation: u64) {
        let context = {
            let mut lc = self.lifecycle();
            if lc.generation != generation || lc.phase == Phase::Idle {
                return;
            }
            // The stale pump would report the channel closing below as a
            // second failure.
            if let Some(pump) = lc.pump.take() {
                pump.abort();
            }
            match lc.context.clone() {
                Some(context) => context,
                None => return,
            }
        };

        self.connection.release().await;
        self.status.transition(ConnectionState::Connecting);

        // Credentials are single-use, so every attempt gets a fresh one.
        let result = match self.negotiator.refresh_credential(&context).await {
            Ok(_) if !self.is_live(generation) => {
                debug!("Session ended while the credential was refreshed");
                return;
            }
            Ok(descriptor) => self.establish(generation, &descriptor).await,
            Err(e) => Err(SessionError::TransportNegotiationFailed(e.to_string())),
        };

        match result {
            Ok(()) => info!("Realtime transport re-established"),
            Err(SessionError::Cancelled) => {}
            Err(e) if e.is_retryable() => self.on_transport_failure(generation, e),
            Err(e) => {
                notify(&self.updates, SessionUpdate::Error(e.clone()));
                self.terminate(generation, &e, EndReason::ConnectionLost).await;
            }
        }
    }

    fn schedule_goodbye(self: &Arc<Self>, generation: u64) {
        let mut lc = self.lifecycle();
        if lc.generation != generation || lc.phase == Phase::Idle || lc.goodbye.is_some() {
            return;
        }

        let shared = self.clone();
        let grace = self.config.goodbye_grace;
        lc.goodbye = Some(tokio::spawn(
            async move {
                tokio::time::sleep(grace).await;
                {
                    let mut lc = shared.lifecycle();
                    if lc.generation != generation || lc.phase == Phase::Idle {
                        return;
                    }
                    // Detach so the teardown below does not abort this task.
                    lc.goodbye.take();
                }
                shared
                    .teardown(EndReason::UserGoodbye, ConnectionState::Idle)
                    .await;
                notify(&shared.updates, SessionUpdate::Goodbye);
            }
            .instrument(info_span!("goodbye", generation)),
        ));
    }

    /// Ends `generation` after an unrecoverable failure, leaving status `error`.
    async fn terminate(self: &Arc<Self>, generation: u64, err: &SessionError, reason: EndReason) {
        if !self.is_live(generation) {
            return;
        }
        error!(error = %err, %reason, "Voice session failed");
        self.accountant.mark_error();
        self.status.transition(ConnectionState::Error);
        self.teardown(reason, ConnectionState::Error).await;
    }

    async fn teardown(&self, reason: EndReason, final_state: ConnectionState) {
        let (session, pump, goodbye, stability) = {
            let mut lc = self.lifecycle();
            lc.phase = Phase::Idle;
            lc.context = None;
            (
                lc.session.take(),
                lc.pump.take(),
                lc.goodbye.take(),
                lc.stability.take(),
            )
        };

        self.reconnect.cancel();
        if let Some(goodbye) = goodbye {
            goodbye.abort();
        }
        if let Some(stability) = stability {
            stability.stop();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        self.connection.release().await;
        self.dispatcher().clear_transient();
        self.status.transition(final_state);

        let Some(mut session) = session else {
            debug!(%reason, "Teardown with no active session");
            return;
        };
        session.ended_at = Some(Utc::now());
        info!(session_id = %session.id, %reason, "Voice session ended");
        let session_id = session.id.clone();
        self.lifecycle().ended = Some(session);
        self.accountant.finalize(&session_id, reason).await;
    }
}

/// Owned handle to a running session.
///
/// [`SessionHandle::release`] runs the same teardown as
/// [`VoiceSessionController::disconnect`]. Dropping a handle that was not
/// released schedules that teardown with [`EndReason::OwnerTeardown`].
#[must_use = "dropping the handle ends the voice session"]
pub struct SessionHandle {
    shared: Arc<Shared>,
    generation: u64,
    released: AtomicBool,
}

impl SessionHandle {
    fn new(shared: Arc<Shared>, generation: u64) -> Self {
        Self {
            shared,
            generation,
            released: AtomicBool::new(false),
        }
    }

    /// Id of the session this handle owns, while it is still running.
    pub fn session_id(&self) -> Option<String> {
        let lc = self.shared.lifecycle();
        if lc.generation != self.generation {
            return None;
        }
        lc.session.as_ref().map(|s| s.id.clone())
    }

    pub async fn release(&self) {
        self.release_with(EndReason::UserAction).await;
    }

    pub async fn release_with(&self, reason: EndReason) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = self.shared.lifecycle().generation == self.generation;
        if current {
            self.shared.teardown(reason, ConnectionState::Idle).await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Session handle dropped outside a runtime; session left running");
            return;
        };
        let shared = self.shared.clone();
        let generation = self.generation;
        runtime.spawn(async move {
            let current = shared.lifecycle().generation == generation;
            if current {
                shared
                    .teardown(EndReason::OwnerTeardown, ConnectionState::Idle)
                    .await;
            }
        });
    }
}
