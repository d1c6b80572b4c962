// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound seams: notifications and external API calls.
//!
//! Both are trait objects injected into the engine. Notifications are
//! fire-and-forget: a delivery failure is logged, recorded on the step, and
//! never retried by the engine.

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;

/// Delivers notifications to humans or downstream systems.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one notification.
    async fn send(
        &self,
        organization_id: Uuid,
        channel: &str,
        recipient: &str,
        message: &str,
    ) -> Result<()>;
}

/// Notifier that records delivery intent in the log only.
///
/// The default wiring for deployments without a delivery integration.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        organization_id: Uuid,
        channel: &str,
        recipient: &str,
        message: &str,
    ) -> Result<()> {
        info!(
            organization_id = %organization_id,
            channel = %channel,
            recipient = %recipient,
            message_len = message.len(),
            "Notification (log only)"
        );
        Ok(())
    }
}

/// Calls external HTTP APIs on behalf of `call_external_api` actions.
#[async_trait]
pub trait ExternalApi: Send + Sync {
    /// Perform the call and return the response body.
    async fn call(
        &self,
        method: &str,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value>;
}

/// External API stub that records intent and returns `null`.
pub struct NullExternalApi;

#[async_trait]
impl ExternalApi for NullExternalApi {
    async fn call(
        &self,
        method: &str,
        url: &str,
        _payload: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        warn!(
            method = %method,
            url = %url,
            "No external API client configured; call recorded only"
        );
        Ok(serde_json::Value::Null)
    }
}
