// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound HTTP client backing `call_external_api` actions.

use async_trait::async_trait;
use tracing::debug;

use playbook_core::error::EngineError;
use playbook_core::notify::ExternalApi;

/// `reqwest`-backed implementation of the external API seam.
pub struct HttpApiClient {
    client: reqwest::Client,
}

impl HttpApiClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalApi for HttpApiClient {
    async fn call(
        &self,
        method: &str,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, EngineError> {
        let method: reqwest::Method =
            method
                .to_uppercase()
                .parse()
                .map_err(|_| EngineError::Validation {
                    field: "method".to_string(),
                    message: format!("unsupported HTTP method '{}'", method),
                })?;

        debug!(%method, url = %url, "Calling external API");

        let mut request = self.client.request(method, url);
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|e| EngineError::Store {
            operation: "external_api".to_string(),
            details: e.to_string(),
        })?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            return Err(EngineError::Store {
                operation: "external_api".to_string(),
                details: format!("upstream returned {}", status),
            });
        }
        Ok(body)
    }
}
