use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use gymvoice_core::{collaborators::Signaling, model::SessionDescriptor};
use reqwest::{Client, Url, header::CONTENT_TYPE};
use secrecy::ExposeSecret;
use tracing::{debug, instrument};

/// Offer/answer exchange with the realtime speech service.
///
/// The local offer is posted as `application/sdp`, authenticated with the
/// session's ephemeral credential; the response body is the remote answer.
pub struct HttpSignaling {
    client: Client,
    endpoint: Url,
    model: String,
}

impl HttpSignaling {
    pub fn new(client: Client, endpoint: Url, model: impl Into<String>) -> Self {
        Self {
            client,
            endpoint,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    #[instrument(skip_all, fields(session_id = %descriptor.session_id, model = %self.model))]
    async fn exchange(&self, offer: &str, descriptor: &SessionDescriptor) -> Result<String> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("model", &self.model);

        let answer = self
            .client
            .post(url)
            .bearer_auth(descriptor.credential.expose_secret())
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer.to_string())
            .send()
            .await
            .context("Signaling request failed")?
            .error_for_status()?
            .text()
            .await?;

        if answer.trim().is_empty() {
            bail!("Realtime service returned an empty answer");
        }
        debug!(answer_len = answer.len(), "Remote answer received");
        Ok(answer)
    }
}
