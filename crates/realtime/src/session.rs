//! Session issuance and location attribution over HTTP.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gymvoice_core::{
    collaborators::{LocationDirectory, LocationRefs, SessionIssuer},
    model::{SessionContext, SessionDescriptor},
};
use reqwest::{Client, Url};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    location_slug: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    member_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    member_data: Option<&'a serde_json::Value>,
    language_preference: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueResponse {
    credential: String,
    session_id: String,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    member_ref: Option<String>,
    #[serde(default)]
    gym_ref: Option<String>,
}

/// Requests ephemeral realtime sessions from the backend.
pub struct HttpSessionIssuer {
    client: Client,
    endpoint: Url,
}

impl HttpSessionIssuer {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl SessionIssuer for HttpSessionIssuer {
    #[instrument(skip_all, fields(location = %context.location_slug))]
    async fn issue(&self, context: &SessionContext) -> Result<SessionDescriptor> {
        let request = IssueRequest {
            location_slug: &context.location_slug,
            member_id: context.member_id.as_deref(),
            member_data: context.member_data.as_ref(),
            language_preference: &context.language_preference,
        };

        let response: IssueResponse = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .context("Session issuance request failed")?
            .error_for_status()?
            .json()
            .await
            .context("Malformed session issuance response")?;

        if response.credential.is_empty() {
            bail!("Session issuance returned an empty credential");
        }
        debug!(session_id = %response.session_id, "Session descriptor received");

        Ok(SessionDescriptor {
            credential: SecretString::from(response.credential),
            session_id: response.session_id,
            expires_at: response.expiry,
            member_ref: response.member_ref,
            gym_ref: response.gym_ref,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationResponse {
    gym_id: String,
    #[serde(default)]
    franchise_id: Option<String>,
}

/// Looks up gym/franchise ids at `{endpoint}/{slug}`.
pub struct HttpLocationDirectory {
    client: Client,
    endpoint: Url,
}

impl HttpLocationDirectory {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    fn location_url(&self, slug: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Location endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push(slug);
        Ok(url)
    }
}

#[async_trait]
impl LocationDirectory for HttpLocationDirectory {
    async fn resolve(&self, location_slug: &str) -> Result<LocationRefs> {
        let response: LocationResponse = self
            .client
            .get(self.location_url(location_slug)?)
            .send()
            .await
            .context("Location lookup request failed")?
            .error_for_status()?
            .json()
            .await
            .context("Malformed location response")?;

        Ok(LocationRefs {
            gym_id: response.gym_id,
            franchise_id: response.franchise_id,
        })
    }
}
