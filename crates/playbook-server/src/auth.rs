// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Security-context extraction.
//!
//! Authentication happens upstream; the gateway forwards the resolved
//! caller as `X-Auth-User-Id` / `X-Auth-Organization-Id` headers. This
//! extractor derives the caller's effective permission set fresh from
//! entity and relationship data on every request.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use uuid::Uuid;

use playbook_core::security::SecurityContext;

use crate::{ApiError, AppState};

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-auth-user-id";
/// Header carrying the organization scope.
pub const ORG_HEADER: &str = "x-auth-organization-id";

/// Extractor wrapping the resolved [`SecurityContext`].
pub struct Auth(pub SecurityContext);

impl FromRequestParts<Arc<AppState>> for Auth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = header_uuid(parts, USER_HEADER)?;
        let organization_id = header_uuid(parts, ORG_HEADER)?;

        let ctx = state
            .permissions
            .resolve_context(organization_id, user_id)
            .await
            .map_err(|e| ApiError::from_engine(&e, false))?;
        Ok(Auth(ctx))
    }
}

fn header_uuid(parts: &Parts, name: &str) -> Result<Uuid, ApiError> {
    let raw = parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                format!("missing {} header", name),
            )
        })?;
    Uuid::parse_str(raw).map_err(|_| {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            format!("{} is not a valid id", name),
        )
    })
}
