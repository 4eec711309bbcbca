//! Liveness heartbeat for quiet stretches of an active session.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

/// Timestamp of the most recent session activity.
#[derive(Debug)]
pub struct ActivityMarker {
    last: Mutex<Instant>,
}

impl Default for ActivityMarker {
    fn default() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }
}

impl ActivityMarker {
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn idle_for(&self) -> Duration {
        self.last().elapsed()
    }
}

/// Periodically refreshes the activity marker when nothing else has.
///
/// This sends no protocol traffic. Dropping or stopping the monitor ends the
/// heartbeat immediately.
#[derive(Debug)]
pub struct StabilityMonitor {
    handle: JoinHandle<()>,
}

impl StabilityMonitor {
    pub fn start(marker: Arc<ActivityMarker>, interval: Duration, window: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let idle = marker.idle_for();
                if idle >= window {
                    debug!(idle_ms = idle.as_millis() as u64, "No recent activity; refreshing keep-alive marker");
                    marker.touch();
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for StabilityMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_marker_only_after_window() {
        let marker = Arc::new(ActivityMarker::default());
        let started = marker.last();
        let monitor = StabilityMonitor::start(
            marker.clone(),
            Duration::from_secs(20),
            Duration::from_secs(45),
        );

        // Ticks at 20s and 40s find the marker inside the window.
        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(marker.last(), started);

        // The 60s tick sees 60s of silence and refreshes.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(marker.last(), started + Duration::from_secs(60));
        assert!(monitor.is_running());
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_activity_suppresses_refresh() {
        let marker = Arc::new(ActivityMarker::default());
        let _monitor = StabilityMonitor::start(
            marker.clone(),
            Duration::from_secs(20),
            Duration::from_secs(45),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        marker.touch();
        let touched = marker.last();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(marker.last(), touched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_heartbeat() {
        let marker = Arc::new(ActivityMarker::default());
        let started = marker.last();
        let monitor = StabilityMonitor::start(
            marker.clone(),
            Duration::from_secs(20),
            Duration::from_secs(45),
        );
        monitor.stop();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(marker.last(), started);
    }
}
