//! Collaborators used when the replay runs without backend endpoints.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use gymvoice_core::{
    collaborators::{InteractionLogger, LocationDirectory, LocationRefs, SessionIssuer, UsageSink},
    model::{InteractionLog, SessionContext, SessionDescriptor, UsageRecord},
};
use secrecy::SecretString;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

/// Issues throwaway sessions with random ids.
pub struct LocalIssuer;

#[async_trait]
impl SessionIssuer for LocalIssuer {
    async fn issue(&self, context: &SessionContext) -> Result<SessionDescriptor> {
        Ok(SessionDescriptor {
            credential: SecretString::from(format!("replay-{}", Uuid::new_v4())),
            session_id: format!("replay_{}", Uuid::new_v4().simple()),
            expires_at: None,
            member_ref: context.member_id.clone(),
            gym_ref: None,
        })
    }
}

/// Has no location data; attribution ends up incomplete.
pub struct UnresolvedDirectory;

#[async_trait]
impl LocationDirectory for UnresolvedDirectory {
    async fn resolve(&self, location_slug: &str) -> Result<LocationRefs> {
        Err(anyhow!("no location endpoint configured for '{}'", location_slug))
    }
}

pub struct LogOnlyLogger;

#[async_trait]
impl InteractionLogger for LogOnlyLogger {
    async fn log(&self, entry: InteractionLog) -> Result<()> {
        info!(
            session_id = %entry.session_id,
            turn = entry.turn_number,
            text = %entry.text,
            "Interaction"
        );
        Ok(())
    }
}

/// Keeps the submitted record for the report and forwards it to `inner`,
/// if there is one.
pub struct CapturingUsageSink {
    inner: Option<Arc<dyn UsageSink>>,
    record: Mutex<Option<UsageRecord>>,
    recorded: Notify,
}

impl CapturingUsageSink {
    pub fn new(inner: Option<Arc<dyn UsageSink>>) -> Self {
        Self {
            inner,
            record: Mutex::new(None),
            recorded: Notify::new(),
        }
    }

    pub fn record(&self) -> Option<UsageRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Waits for the session's usage record.
    pub async fn recorded(&self) -> UsageRecord {
        loop {
            let notified = self.recorded.notified();
            if let Some(record) = self.record() {
                return record;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl UsageSink for CapturingUsageSink {
    async fn submit(&self, record: UsageRecord) -> Result<()> {
        {
            let mut slot = self.record.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                warn!(session_id = %record.session_id, "Second usage record for one replay");
            }
            *slot = Some(record.clone());
        }
        self.recorded.notify_waiters();

        match &self.inner {
            Some(inner) => inner.submit(record).await,
            None => {
                info!(session_id = %record.session_id, end_reason = %record.end_reason, "Usage record (not submitted)");
                Ok(())
            }
        }
    }
}
