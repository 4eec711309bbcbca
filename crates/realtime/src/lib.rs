//! HTTP implementations of the voice session collaborators.

pub mod config;
pub mod reporting;
pub mod session;
pub mod signaling;

use gymvoice_core::collaborators::{
    InteractionLogger, LocationDirectory, SessionIssuer, Signaling, UsageSink,
};
use std::sync::Arc;

pub use config::EndpointConfig;
pub use reporting::{HttpInteractionLogger, HttpUsageSink};
pub use session::{HttpLocationDirectory, HttpSessionIssuer};
pub use signaling::HttpSignaling;

/// The network-backed collaborators an [`EndpointConfig`] describes.
///
/// Optional endpoints that are not configured are left as `None` so the
/// caller can supply its own fallback.
pub struct HttpCollaborators {
    pub issuer: Arc<dyn SessionIssuer>,
    pub signaling: Arc<dyn Signaling>,
    pub directory: Option<Arc<dyn LocationDirectory>>,
    pub logger: Option<Arc<dyn InteractionLogger>>,
    pub usage: Option<Arc<dyn UsageSink>>,
}

impl HttpCollaborators {
    pub fn from_config(config: &EndpointConfig) -> anyhow::Result<Self> {
        let client = config.http_client()?;

        Ok(Self {
            issuer: Arc::new(HttpSessionIssuer::new(
                client.clone(),
                config.session_endpoint.clone(),
            )),
            signaling: Arc::new(HttpSignaling::new(
                client.clone(),
                config.realtime_endpoint.clone(),
                config.realtime_model.clone(),
            )),
            directory: config.location_endpoint.clone().map(|endpoint| {
                Arc::new(HttpLocationDirectory::new(client.clone(), endpoint))
                    as Arc<dyn LocationDirectory>
            }),
            logger: config.logging_endpoint.clone().map(|endpoint| {
                Arc::new(HttpInteractionLogger::new(client.clone(), endpoint))
                    as Arc<dyn InteractionLogger>
            }),
            usage: config.accounting_endpoint.clone().map(|endpoint| {
                Arc::new(HttpUsageSink::new(client.clone(), endpoint)) as Arc<dyn UsageSink>
            }),
        })
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use axum::Router;
    use reqwest::Url;

    /// Serves `router` on an ephemeral local port and returns its base URL.
    pub async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }
}
