//! Server reachability check.

use serde::Deserialize;

use super::error::ClientError;
use super::transport::http_base_url;

/// Response from the `/health` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    /// Identities currently connected to the broker
    pub connections: usize,
}

/// Checks that the broker at `server_url` is reachable and healthy.
pub async fn check_server(server_url: &str) -> Result<HealthStatus, ClientError> {
    let url = format!("{}/health", http_base_url(server_url));

    let response = reqwest::get(&url)
        .await
        .map_err(|e| ClientError::HttpError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ClientError::HttpError(format!(
            "Server returned status {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| ClientError::HttpError(e.to_string()))
}
