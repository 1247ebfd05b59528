//! OAuth2 client self-registration at startup
//!
//! Platforms that manage clients centrally inject `OAUTH2_SERVICE_*`
//! environment variables; when both the client secret and the admin URI are
//! present the service registers itself before serving. Missing settings
//! make this a no-op so local development needs no OAuth2 stack.

use serde_json::json;

use crate::config::OAuth2RegistrationConfig;
use crate::error::{Error, Result};

/// Register the service as an OAuth2 client against the configured admin
/// endpoint.
///
/// An admin endpoint reporting the client already exists (409) counts as
/// success: registration is idempotent across restarts.
pub async fn register_oauth2_client(
    service_name: &str,
    config: &OAuth2RegistrationConfig,
) -> Result<()> {
    if !config.is_configured() {
        tracing::debug!("oauth2 self-registration not configured, skipping");
        return Ok(());
    }

    let payload = json!({
        "client_id": service_name,
        "client_name": service_name,
        "client_secret": config.client_secret,
        "grant_types": ["client_credentials"],
        "audience": config.audiences,
    });

    let response = reqwest::Client::new()
        .post(&config.admin_uri)
        .json(&payload)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() || status == reqwest::StatusCode::CONFLICT {
        tracing::info!(service = service_name, %status, "oauth2 client registered");
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Other(format!(
        "oauth2 client registration failed with status {status}: {body}"
    )))
}
