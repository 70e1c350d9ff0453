//! services/api/src/adapters/register_client.rs
//!
//! `RegistrationClient` over HTTP: finishes a pending sign-up after a sign-in
//! redirect by calling this service's own register endpoint as the user.

use async_trait::async_trait;
use curriculum_portal_core::ports::{PortError, PortResult, RegistrationClient};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpRegistrationClient {
    client: Client,
    endpoint: String,
}

impl HttpRegistrationClient {
    /// `origin` is the API root, e.g. `http://localhost:3001`.
    pub fn new(origin: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/api/user/register", origin.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl RegistrationClient for HttpRegistrationClient {
    async fn register(&self, id_token: &str, body: &Value) -> PortResult<u16> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(id_token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, endpoint = %self.endpoint, "Registration request failed");
                PortError::Unavailable(e.to_string())
            })?;

        let status = response.status().as_u16();
        debug!(status, "Registration endpoint responded");
        Ok(status)
    }
}
