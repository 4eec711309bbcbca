//! External collaborators of the voice session controller.
//!
//! Everything that touches the network, the audio hardware or the remote
//! speech service sits behind one of these traits and is injected into the
//! controller at construction. This keeps the session lifecycle testable and
//! lets a kiosk, a browser bridge or a replay tool supply its own media stack.

use crate::{
    error::DeviceError,
    model::{InteractionLog, SessionContext, SessionDescriptor, UsageRecord},
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Issues ephemeral credentials for new realtime sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionIssuer: Send + Sync {
    /// Requests a session descriptor for the given member/location context.
    async fn issue(&self, context: &SessionContext) -> Result<SessionDescriptor>;
}

/// Gym and franchise identifiers for a location.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct LocationRefs {
    pub gym_id: String,
    pub franchise_id: Option<String>,
}

/// Resolves a location slug to the ids used for usage attribution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocationDirectory: Send + Sync {
    async fn resolve(&self, location_slug: &str) -> Result<LocationRefs>;
}

/// Describes the captured microphone track handed to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Grants access to the local microphone.
#[async_trait]
pub trait AudioDevice: Send + Sync {
    async fn acquire(&self) -> std::result::Result<Box<dyn CaptureStream>, DeviceError>;
}

/// A live microphone capture. Released exactly once by the connection manager.
#[async_trait]
pub trait CaptureStream: Send + Sync {
    fn track(&self) -> LocalTrack;
    async fn release(&mut self) -> Result<()>;
}

/// Opaque handle to the remote audio stream of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAudio {
    pub track_id: String,
}

/// One frame read from the realtime event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Message(String),
    /// The transport reported an error; the channel is unusable afterwards.
    Failed(String),
}

/// Inbound side of the structured event channel. `None` from
/// [`EventChannel::recv`] means the channel closed.
#[derive(Debug)]
pub struct EventChannel {
    inbound: mpsc::Receiver<ChannelFrame>,
}

impl EventChannel {
    /// Creates a channel and the sender a peer implementation feeds it with.
    pub fn pair(buffer: usize) -> (mpsc::Sender<ChannelFrame>, EventChannel) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, EventChannel { inbound: rx })
    }

    pub async fn recv(&mut self) -> Option<ChannelFrame> {
        self.inbound.recv().await
    }
}

/// Creates realtime peers bound to a local capture track.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, track: &LocalTrack) -> Result<Box<dyn PeerConnection>>;
}

/// The local end of the realtime transport.
#[async_trait]
pub trait PeerConnection: Send {
    /// Builds the local session offer.
    async fn create_offer(&mut self) -> Result<String>;
    /// Applies the remote answer and opens the event channel.
    async fn apply_answer(&mut self, answer: &str) -> Result<EventChannel>;
    /// The remote audio stream, once the answer has been applied.
    fn take_remote_audio(&mut self) -> Option<RemoteAudio>;
    async fn close(&mut self) -> Result<()>;
}

/// Exchanges a local offer for the remote answer, authenticated with the
/// descriptor's ephemeral credential.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn exchange(&self, offer: &str, descriptor: &SessionDescriptor) -> Result<String>;
}

/// Where remote audio is played back.
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackSink: Send + Sync {
    fn bind(&self, audio: RemoteAudio);
    fn clear(&self);
}

/// Fire-and-forget log of finalized utterances.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InteractionLogger: Send + Sync {
    async fn log(&self, entry: InteractionLog) -> Result<()>;
}

/// Receives the per-session usage record. Assumed not to deduplicate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn submit(&self, record: UsageRecord) -> Result<()>;
}

/// The full set of collaborators a controller is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub issuer: Arc<dyn SessionIssuer>,
    pub directory: Arc<dyn LocationDirectory>,
    pub audio: Arc<dyn AudioDevice>,
    pub peers: Arc<dyn PeerFactory>,
    pub signaling: Arc<dyn Signaling>,
    pub playback: Arc<dyn PlaybackSink>,
    pub logger: Arc<dyn InteractionLogger>,
    pub usage: Arc<dyn UsageSink>,
}
