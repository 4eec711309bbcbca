//! Owns the realtime transport of one controller.
//!
//! Resources are adopted into [`ConnectionManager`] as soon as they are
//! acquired, so [`ConnectionManager::release`] can free them on any exit path,
//! including while a connect is still suspended in the handshake. Each release
//! bumps an epoch; a connect that resumes after its epoch was released closes
//! whatever it acquired itself and reports [`SessionError::Cancelled`].

use crate::{
    collaborators::{
        AudioDevice, CaptureStream, EventChannel, PeerConnection, PeerFactory, PlaybackSink,
        Signaling,
    },
    error::SessionError,
    model::SessionDescriptor,
};
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info, instrument, warn};

#[derive(Default)]
struct Resources {
    epoch: u64,
    capture: Option<Box<dyn CaptureStream>>,
    peer: Option<Box<dyn PeerConnection>>,
    playback_bound: bool,
    established: bool,
}

pub struct ConnectionManager {
    audio: Arc<dyn AudioDevice>,
    peers: Arc<dyn PeerFactory>,
    signaling: Arc<dyn Signaling>,
    playback: Arc<dyn PlaybackSink>,
    in_flight: AtomicBool,
    resources: Mutex<Resources>,
}

impl ConnectionManager {
    pub fn new(
        audio: Arc<dyn AudioDevice>,
        peers: Arc<dyn PeerFactory>,
        signaling: Arc<dyn Signaling>,
        playback: Arc<dyn PlaybackSink>,
    ) -> Self {
        Self {
            audio,
            peers,
            signaling,
            playback,
            in_flight: AtomicBool::new(false),
            resources: Mutex::new(Resources::default()),
        }
    }

    pub fn is_established(&self) -> bool {
        self.lock().established
    }

    pub fn is_connecting(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Establishes the transport described by `descriptor`.
    ///
    /// Returns `Ok(None)` without doing anything when a connect is already in
    /// progress or a transport is established. On failure every resource
    /// acquired so far has been released.
    #[instrument(skip_all, fields(session_id = %descriptor.session_id))]
    pub async fn connect(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<Option<EventChannel>, SessionError> {
        if self.is_established() || self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Connect ignored: transport already active");
            return Ok(None);
        }
        let epoch = self.lock().epoch;

        let result = self.open(descriptor, epoch).await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(channel) => Ok(Some(channel)),
            Err(e) => {
                if e != SessionError::Cancelled {
                    self.release_epoch(epoch).await;
                }
                Err(e)
            }
        }
    }

    async fn open(&self, descriptor: &SessionDescriptor, epoch: u64) -> Result<EventChannel, SessionError> {
        // 1. Microphone.
        let capture = self.audio.acquire().await.map_err(SessionError::from)?;
        let track = capture.track();
        info!(track = %track.id, sample_rate = track.sample_rate, "Microphone acquired");
        if let Err(mut capture) = self.adopt(epoch, |r| &mut r.capture, capture) {
            release_capture(&mut *capture).await;
            return Err(SessionError::Cancelled);
        }

        // 2. Offer/answer exchange.
        let mut peer = self
            .peers
            .create(&track)
            .await
            .map_err(|e| SessionError::TransportNegotiationFailed(format!("{:#}", e)))?;
        let answer = match self.negotiate(&mut *peer, descriptor).await {
            Ok(answer) => answer,
            Err(e) => {
                close_peer(&mut *peer).await;
                return Err(e);
            }
        };

        // 3. Remote answer and event channel.
        let channel = match peer.apply_answer(&answer).await {
            Ok(channel) => channel,
            Err(e) => {
                close_peer(&mut *peer).await;
                return Err(SessionError::ChannelError(format!("{:#}", e)));
            }
        };
        let remote_audio = peer.take_remote_audio();
        if let Err(mut peer) = self.adopt(epoch, |r| &mut r.peer, peer) {
            close_peer(&mut *peer).await;
            return Err(SessionError::Cancelled);
        }

        // 4. Playback.
        {
            let mut resources = self.lock();
            if resources.epoch != epoch {
                return Err(SessionError::Cancelled);
            }
            if let Some(audio) = remote_audio {
                self.playback.bind(audio);
                resources.playback_bound = true;
            } else {
                warn!("Peer exposed no remote audio; playback not bound");
            }
            resources.established = true;
        }

        info!("Realtime transport established");
        Ok(channel)
    }

    async fn negotiate(
        &self,
        peer: &mut dyn PeerConnection,
        descriptor: &SessionDescriptor,
    ) -> Result<String, SessionError> {
        let offer = peer
            .create_offer()
            .await
            .map_err(|e| SessionError::TransportNegotiationFailed(format!("{:#}", e)))?;
        self.signaling
            .exchange(&offer, descriptor)
            .await
            .map_err(|e| SessionError::TransportNegotiationFailed(format!("{:#}", e)))
    }

    /// Stores `item` in its slot unless the epoch was released meanwhile, in
    /// which case the item is handed back to the caller to close.
    fn adopt<T>(
        &self,
        epoch: u64,
        slot: impl FnOnce(&mut Resources) -> &mut Option<T>,
        item: T,
    ) -> Result<(), T> {
        let mut resources = self.lock();
        if resources.epoch != epoch {
            return Err(item);
        }
        *slot(&mut resources) = Some(item);
        Ok(())
    }

    /// Closes the peer, releases the microphone and clears playback.
    ///
    /// Every step runs even if an earlier one fails. Safe to call repeatedly
    /// and while a connect is in flight.
    pub async fn release(&self) {
        let epoch = self.lock().epoch;
        self.release_epoch(epoch).await;
    }

    async fn release_epoch(&self, epoch: u64) {
        let (peer, capture, playback_bound) = {
            let mut resources = self.lock();
            if resources.epoch != epoch {
                return;
            }
            resources.epoch += 1;
            resources.established = false;
            (
                resources.peer.take(),
                resources.capture.take(),
                std::mem::take(&mut resources.playback_bound),
            )
        };

        if let Some(mut peer) = peer {
            close_peer(&mut *peer).await;
        }
        if let Some(mut capture) = capture {
            release_capture(&mut *capture).await;
        }
        if playback_bound {
            self.playback.clear();
        }
        debug!("Transport resources released");
    }

    fn lock(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn close_peer(peer: &mut dyn PeerConnection) {
    if let Err(e) = peer.close().await {
        warn!(error = %format!("{:#}", e), "Failed to close realtime peer");
    }
}

async fn release_capture(capture: &mut dyn CaptureStream) {
    if let Err(e) = capture.release().await {
        warn!(error = %format!("{:#}", e), "Failed to release microphone");
    }
}
