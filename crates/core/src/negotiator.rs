use crate::{
    collaborators::{LocationDirectory, SessionIssuer},
    error::SessionError,
    model::{Attribution, SessionContext, SessionDescriptor},
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A freshly issued session together with its accounting attribution.
#[derive(Debug)]
pub struct NegotiatedSession {
    pub descriptor: SessionDescriptor,
    pub attribution: Attribution,
}

/// Obtains ephemeral credentials and resolves usage attribution.
#[derive(Clone)]
pub struct SessionNegotiator {
    issuer: Arc<dyn SessionIssuer>,
    directory: Arc<dyn LocationDirectory>,
}

impl SessionNegotiator {
    pub fn new(issuer: Arc<dyn SessionIssuer>, directory: Arc<dyn LocationDirectory>) -> Self {
        Self { issuer, directory }
    }

    /// Issues a new session descriptor for `context`.
    ///
    /// Fails with [`SessionError::SessionCreationFailed`] when the issuer
    /// rejects the request. A failed location lookup is not fatal: the
    /// session proceeds with `attribution.complete == false`.
    #[instrument(skip_all, fields(location = %context.location_slug))]
    pub async fn create_session(
        &self,
        context: &SessionContext,
    ) -> Result<NegotiatedSession, SessionError> {
        let descriptor = self.issue(context).await?;
        info!(session_id = %descriptor.session_id, "Realtime session issued");

        let attribution = self.resolve_attribution(context, &descriptor).await;
        Ok(NegotiatedSession {
            descriptor,
            attribution,
        })
    }

    /// Issues a new ephemeral credential for re-establishing the transport
    /// of a session that already exists. Attribution is not looked up again.
    #[instrument(skip_all, fields(location = %context.location_slug))]
    pub async fn refresh_credential(
        &self,
        context: &SessionContext,
    ) -> Result<SessionDescriptor, SessionError> {
        let descriptor = self.issue(context).await?;
        debug!(session_id = %descriptor.session_id, "Credential refreshed");
        Ok(descriptor)
    }

    async fn issue(&self, context: &SessionContext) -> Result<SessionDescriptor, SessionError> {
        self.issuer
            .issue(context)
            .await
            .map_err(|e| SessionError::SessionCreationFailed(format!("{:#}", e)))
    }

    async fn resolve_attribution(
        &self,
        context: &SessionContext,
        descriptor: &SessionDescriptor,
    ) -> Attribution {
        match self.directory.resolve(&context.location_slug).await {
            Ok(refs) => Attribution {
                gym_id: Some(refs.gym_id),
                franchise_id: refs.franchise_id,
                complete: true,
            },
            Err(e) => {
                warn!(
                    session_id = %descriptor.session_id,
                    error = %format!("{:#}", e),
                    "Location lookup failed; usage attribution will be incomplete"
                );
                Attribution {
                    gym_id: descriptor.gym_ref.clone(),
                    franchise_id: None,
                    complete: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LocationRefs, MockLocationDirectory, MockSessionIssuer};
    use anyhow::anyhow;
    use secrecy::{ExposeSecret, SecretString};

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            credential: SecretString::from("ek_test".to_string()),
            session_id: "sess_42".to_string(),
            expires_at: None,
            member_ref: Some("member_7".to_string()),
            gym_ref: Some("gym_from_issuer".to_string()),
        }
    }

    fn context() -> SessionContext {
        SessionContext {
            location_slug: "lyon-part-dieu".to_string(),
            member_id: Some("member_7".to_string()),
            member_data: None,
            language_preference: "fr".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_session_with_full_attribution() {
        let mut issuer = MockSessionIssuer::new();
        issuer.expect_issue().times(1).returning(|_| Ok(descriptor()));
        let mut directory = MockLocationDirectory::new();
        directory
            .expect_resolve()
            .withf(|slug| slug == "lyon-part-dieu")
            .returning(|_| {
                Ok(LocationRefs {
                    gym_id: "gym_1".to_string(),
                    franchise_id: Some("fr_1".to_string()),
                })
            });

        let negotiator = SessionNegotiator::new(Arc::new(issuer), Arc::new(directory));
        let negotiated = negotiator.create_session(&context()).await.unwrap();

        assert_eq!(negotiated.descriptor.session_id, "sess_42");
        assert_eq!(negotiated.descriptor.credential.expose_secret(), "ek_test");
        assert_eq!(
            negotiated.attribution,
            Attribution {
                gym_id: Some("gym_1".to_string()),
                franchise_id: Some("fr_1".to_string()),
                complete: true,
            }
        );
    }

    #[tokio::test]
    async fn test_issuer_failure_maps_to_session_creation_failed() {
        let mut issuer = MockSessionIssuer::new();
        issuer
            .expect_issue()
            .returning(|_| Err(anyhow!("session endpoint returned 503")));
        let mut directory = MockLocationDirectory::new();
        directory.expect_resolve().never();

        let negotiator = SessionNegotiator::new(Arc::new(issuer), Arc::new(directory));
        let err = negotiator.create_session(&context()).await.unwrap_err();

        match err {
            SessionError::SessionCreationFailed(msg) => assert!(msg.contains("503")),
            other => panic!("expected SessionCreationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attribution_failure_is_not_fatal() {
        let mut issuer = MockSessionIssuer::new();
        issuer.expect_issue().returning(|_| Ok(descriptor()));
        let mut directory = MockLocationDirectory::new();
        directory
            .expect_resolve()
            .returning(|_| Err(anyhow!("unknown location")));

        let negotiator = SessionNegotiator::new(Arc::new(issuer), Arc::new(directory));
        let negotiated = negotiator.create_session(&context()).await.unwrap();

        assert!(!negotiated.attribution.complete);
        assert_eq!(
            negotiated.attribution.gym_id.as_deref(),
            Some("gym_from_issuer")
        );
        assert_eq!(negotiated.attribution.franchise_id, None);
    }

    #[tokio::test]
    async fn test_refresh_credential_skips_location_lookup() {
        let mut issuer = MockSessionIssuer::new();
        issuer.expect_issue().times(2).returning(|_| Ok(descriptor()));
        let mut directory = MockLocationDirectory::new();
        directory.expect_resolve().never();

        let negotiator = SessionNegotiator::new(Arc::new(issuer), Arc::new(directory));
        let first = negotiator.refresh_credential(&context()).await.unwrap();
        let second = negotiator.refresh_credential(&context()).await.unwrap();

        assert_eq!(first.credential.expose_secret(), "ek_test");
        assert_eq!(second.session_id, "sess_42");
    }

    #[tokio::test]
    async fn test_refresh_failure_maps_to_session_creation_failed() {
        let mut issuer = MockSessionIssuer::new();
        issuer
            .expect_issue()
            .returning(|_| Err(anyhow!("credential quota reached")));
        let negotiator =
            SessionNegotiator::new(Arc::new(issuer), Arc::new(MockLocationDirectory::new()));

        let err = negotiator.refresh_credential(&context()).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionCreationFailed(msg) if msg.contains("quota")));
    }
}
