// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotency cache for retried mutating requests.
//!
//! Requests carrying a client-supplied idempotency key are deduplicated per
//! `(organization, key, endpoint)` within a TTL window. The first call
//! executes the handler and persists its outcome; identical retries replay
//! the cached response without invoking the handler again; a retry with a
//! different payload is a contract violation and fails with `Conflict`.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{EntityFilter, EntityRecord, NewEntity, Store};

/// Entity type used for idempotency records.
pub const IDEMPOTENCY_ENTITY_TYPE: &str = "idempotency_record";

const RECORD_SMART_CODE: &str = "PLAYBOOK.IDEMPOTENCY.RECORD.V1";
const FIELD_SMART_CODE: &str = "PLAYBOOK.IDEMPOTENCY.FIELD.V1";

/// Response payload a handler produces for caching.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// HTTP-level status code to replay.
    pub status_code: u16,
    /// Response body to replay.
    pub body: serde_json::Value,
}

/// Outcome of an idempotency-wrapped request.
#[derive(Debug, Clone)]
pub struct IdempotentOutcome {
    /// The response body (fresh or replayed).
    pub response: serde_json::Value,
    /// The status code recorded for the response. `0` when the original
    /// handler failed before producing a status; callers map the stored
    /// error code instead.
    pub status_code: u16,
    /// Whether the response was replayed from the cache.
    pub cached: bool,
}

/// Deduplicates mutating requests by client-supplied key.
pub struct IdempotencyService {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl IdempotencyService {
    /// Create a new idempotency service with the given record TTL in hours.
    pub fn new(store: Arc<dyn Store>, ttl_hours: i64) -> Self {
        Self {
            store,
            ttl: Duration::hours(ttl_hours),
        }
    }

    /// Compute a stable, field-order-independent hash of a request body.
    pub fn stable_hash(body: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(body));
        hex::encode(hasher.finalize())
    }

    /// Execute `handler` with idempotency dedup.
    ///
    /// Without a key the handler runs directly (dedup is opt-in per
    /// caller). With a key, the outcome is persisted whether or not the
    /// handler failed, so a crashed-but-completed mutation is never
    /// silently re-executed on retry. TTL expiry is lazy: expired records
    /// are replaced on lookup, never swept.
    #[instrument(skip(self, body, handler), fields(endpoint = %endpoint))]
    pub async fn process<F, Fut>(
        &self,
        organization_id: Uuid,
        key: Option<&str>,
        endpoint: &str,
        body: &serde_json::Value,
        handler: F,
    ) -> Result<IdempotentOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse>> + Send,
    {
        let Some(key) = key else {
            let response = handler().await?;
            return Ok(IdempotentOutcome {
                response: response.body,
                status_code: response.status_code,
                cached: false,
            });
        };

        let request_hash = Self::stable_hash(body);
        let code = format!("{}:{}", key, endpoint);

        let record = match self.find_record(organization_id, &code).await? {
            Some(existing) => {
                match self
                    .classify_existing(organization_id, &existing, key, &request_hash)
                    .await?
                {
                    Existing::Replay(outcome) => return Ok(outcome),
                    Existing::Expired => {
                        // Reuse the expired record's entity row
                        self.reserve_fields(organization_id, existing.id, &request_hash)
                            .await?;
                        existing
                    }
                }
            }
            None => match self.reserve(organization_id, key, endpoint, &code, &request_hash).await {
                Ok(record) => record,
                Err(EngineError::Conflict { .. }) => {
                    // Lost the race: read back the winner's record
                    let winner = self
                        .find_record(organization_id, &code)
                        .await?
                        .ok_or_else(|| EngineError::Conflict {
                            resource: IDEMPOTENCY_ENTITY_TYPE.to_string(),
                            details: "record vanished during race resolution".to_string(),
                        })?;
                    match self
                        .classify_existing(organization_id, &winner, key, &request_hash)
                        .await?
                    {
                        Existing::Replay(outcome) => return Ok(outcome),
                        Existing::Expired => {
                            self.reserve_fields(organization_id, winner.id, &request_hash)
                                .await?;
                            winner
                        }
                    }
                }
                Err(e) => return Err(e),
            },
        };

        let result = handler().await;

        match result {
            Ok(response) => {
                self.persist_outcome(
                    organization_id,
                    record.id,
                    "succeeded",
                    response.status_code,
                    &response.body,
                )
                .await?;
                Ok(IdempotentOutcome {
                    response: response.body,
                    status_code: response.status_code,
                    cached: false,
                })
            }
            Err(e) => {
                let error_body = serde_json::json!({
                    "code": e.error_code(),
                    "message": e.to_string(),
                });
                // The record must outlive the failure so retries replay it
                if let Err(persist_err) = self
                    .persist_outcome(organization_id, record.id, "failed", 0, &error_body)
                    .await
                {
                    warn!(error = %persist_err, "Failed to persist idempotency outcome");
                }
                Err(e)
            }
        }
    }

    async fn find_record(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> Result<Option<EntityRecord>> {
        let mut records = self
            .store
            .query_entities(
                organization_id,
                &EntityFilter {
                    entity_type: Some(IDEMPOTENCY_ENTITY_TYPE.to_string()),
                    code: Some(code.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(records.pop())
    }

    async fn classify_existing(
        &self,
        organization_id: Uuid,
        record: &EntityRecord,
        key: &str,
        request_hash: &str,
    ) -> Result<Existing> {
        let fields = self
            .store
            .get_dynamic_fields(organization_id, record.id)
            .await?;

        let field = |name: &str| -> Option<&serde_json::Value> {
            fields.iter().find(|f| f.field_name == name).map(|f| &f.value)
        };

        // A record with no expiry on file is a reservation whose fields are
        // still being written by the winner of the race: treat it as in
        // progress, never as expired.
        let Some(expires_at) = field("expires_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            return Err(EngineError::Conflict {
                resource: IDEMPOTENCY_ENTITY_TYPE.to_string(),
                details: format!(
                    "request with idempotency key '{}' is still in progress",
                    key
                ),
            });
        };
        if expires_at <= Utc::now() {
            debug!(record_id = %record.id, "Idempotency record expired, replacing");
            return Ok(Existing::Expired);
        }

        let stored_hash = field("request_hash").and_then(|v| v.as_str()).unwrap_or("");
        if stored_hash != request_hash {
            return Err(EngineError::Conflict {
                resource: IDEMPOTENCY_ENTITY_TYPE.to_string(),
                details: format!("idempotency key '{}' reused with a different request", key),
            });
        }

        let status = field("status").and_then(|v| v.as_str()).unwrap_or("");
        match status {
            "succeeded" | "failed" => {
                let response = field("response").cloned().unwrap_or(serde_json::Value::Null);
                let status_code = field("status_code")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u16;
                debug!(record_id = %record.id, status = %status, "Replaying cached response");
                Ok(Existing::Replay(IdempotentOutcome {
                    response,
                    status_code,
                    cached: true,
                }))
            }
            _ => Err(EngineError::Conflict {
                resource: IDEMPOTENCY_ENTITY_TYPE.to_string(),
                details: format!(
                    "request with idempotency key '{}' is still in progress",
                    key
                ),
            }),
        }
    }

    async fn reserve(
        &self,
        organization_id: Uuid,
        key: &str,
        endpoint: &str,
        code: &str,
        request_hash: &str,
    ) -> Result<EntityRecord> {
        let record = self
            .store
            .create_entity(&NewEntity {
                organization_id,
                entity_type: IDEMPOTENCY_ENTITY_TYPE.to_string(),
                name: key.to_string(),
                code: Some(code.to_string()),
                smart_code: RECORD_SMART_CODE.to_string(),
                metadata: serde_json::json!({ "endpoint": endpoint, "key": key }),
            })
            .await?;
        self.reserve_fields(organization_id, record.id, request_hash)
            .await?;
        Ok(record)
    }

    async fn reserve_fields(
        &self,
        organization_id: Uuid,
        record_id: Uuid,
        request_hash: &str,
    ) -> Result<()> {
        let expires_at = (Utc::now() + self.ttl).to_rfc3339();
        for (name, value) in [
            ("request_hash", serde_json::json!(request_hash)),
            ("status", serde_json::json!("in_progress")),
            ("expires_at", serde_json::json!(expires_at)),
            ("response", serde_json::Value::Null),
            ("status_code", serde_json::json!(0)),
        ] {
            self.store
                .set_dynamic_field(organization_id, record_id, name, &value, FIELD_SMART_CODE)
                .await?;
        }
        Ok(())
    }

    async fn persist_outcome(
        &self,
        organization_id: Uuid,
        record_id: Uuid,
        status: &str,
        status_code: u16,
        response: &serde_json::Value,
    ) -> Result<()> {
        for (name, value) in [
            ("response", response.clone()),
            ("status_code", serde_json::json!(status_code)),
            ("status", serde_json::json!(status)),
        ] {
            self.store
                .set_dynamic_field(organization_id, record_id, name, &value, FIELD_SMART_CODE)
                .await?;
        }
        Ok(())
    }
}

enum Existing {
    /// A live record with a persisted outcome: replay it.
    Replay(IdempotentOutcome),
    /// The record's TTL has elapsed: replace it.
    Expired,
}

/// Serialize JSON with object keys sorted recursively.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let elems: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", elems.join(","))
        }
        other => other.to_string(),
    }
}
