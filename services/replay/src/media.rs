//! Offline media stack: a virtual microphone and peers that play back a
//! recorded event log instead of talking to the speech service.

use crate::script::{ReplayAction, ReplayScript};
use anyhow::{Result, bail};
use async_trait::async_trait;
use gymvoice_core::{
    DeviceError,
    collaborators::{
        AudioDevice, CaptureStream, ChannelFrame, EventChannel, LocalTrack, PeerConnection,
        PeerFactory, PlaybackSink, RemoteAudio, Signaling,
    },
    model::SessionDescriptor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

pub struct ReplayMicrophone;

struct ReplayCapture;

#[async_trait]
impl AudioDevice for ReplayMicrophone {
    async fn acquire(&self) -> std::result::Result<Box<dyn CaptureStream>, DeviceError> {
        Ok(Box::new(ReplayCapture))
    }
}

#[async_trait]
impl CaptureStream for ReplayCapture {
    fn track(&self) -> LocalTrack {
        LocalTrack {
            id: "replay-mic".to_string(),
            sample_rate: 24_000,
            channels: 1,
        }
    }

    async fn release(&mut self) -> Result<()> {
        debug!("Replay microphone released");
        Ok(())
    }
}

/// Creates peers that feed the shared script into their event channel.
pub struct ReplayPeers {
    script: Arc<ReplayScript>,
}

impl ReplayPeers {
    pub fn new(script: Arc<ReplayScript>) -> Self {
        Self { script }
    }
}

#[async_trait]
impl PeerFactory for ReplayPeers {
    async fn create(&self, track: &LocalTrack) -> Result<Box<dyn PeerConnection>> {
        debug!(track = %track.id, "Creating replay peer");
        Ok(Box::new(ReplayPeer {
            script: self.script.clone(),
            feeder: None,
        }))
    }
}

struct ReplayPeer {
    script: Arc<ReplayScript>,
    feeder: Option<JoinHandle<()>>,
}

#[async_trait]
impl PeerConnection for ReplayPeer {
    async fn create_offer(&mut self) -> Result<String> {
        Ok("v=0\r\ns=gymvoice-replay\r\n".to_string())
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<EventChannel> {
        if answer.trim().is_empty() {
            bail!("empty answer");
        }
        let (tx, channel) = EventChannel::pair(64);
        self.feeder = Some(tokio::spawn(feed(self.script.clone(), tx)));
        Ok(channel)
    }

    fn take_remote_audio(&mut self) -> Option<RemoteAudio> {
        Some(RemoteAudio {
            track_id: "replay-remote".to_string(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        Ok(())
    }
}

impl Drop for ReplayPeer {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

async fn feed(script: Arc<ReplayScript>, tx: mpsc::Sender<ChannelFrame>) {
    while let Some((delay, action)) = script.next_step() {
        tokio::time::sleep(delay).await;
        match action {
            ReplayAction::Event(raw) => {
                if tx.send(ChannelFrame::Message(raw)).await.is_err() {
                    return;
                }
            }
            ReplayAction::TransportError(reason) => {
                info!(%reason, "Simulating transport failure");
                let _ = tx.send(ChannelFrame::Failed(reason)).await;
                return;
            }
        }
    }
    // Let the controller read everything before reporting the end of the log.
    while tx.capacity() < tx.max_capacity() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    script.mark_done();
    // Closing the channel would read as a transport failure; hold it open
    // until the peer is closed.
    std::future::pending::<()>().await;
}

/// Answers every offer locally.
pub struct LoopbackSignaling;

#[async_trait]
impl Signaling for LoopbackSignaling {
    async fn exchange(&self, offer: &str, descriptor: &SessionDescriptor) -> Result<String> {
        if offer.trim().is_empty() {
            bail!("empty offer");
        }
        debug!(session_id = %descriptor.session_id, "Loopback answer");
        Ok("v=0\r\ns=gymvoice-replay-answer\r\n".to_string())
    }
}

pub struct LogPlayback;

impl PlaybackSink for LogPlayback {
    fn bind(&self, audio: RemoteAudio) {
        debug!(track = %audio.track_id, "Playback bound");
    }

    fn clear(&self) {
        debug!("Playback cleared");
    }
}
