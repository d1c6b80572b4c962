// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status transitions implemented as time-bounded relationships.
//!
//! "Current status" is never a mutable column: it is the single active,
//! unexpired `HAS_STATUS` relationship from a subject entity to a status
//! entity. Transitions retire the old edge and create the new one; retired
//! edges remain as a queryable history of every status change.
//!
//! The store guarantees single-row atomic writes only, so a crash between
//! the deactivate and create writes can leave zero or duplicate active
//! edges. Both are treated as repairable: reads re-derive the current value
//! and deactivate surplus edges, keeping the latest effective date.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{
    EntityFilter, EntityRecord, NewRelationship, RelationshipFilter, RelationshipRecord, Store,
};

/// Reserved relationship type carrying the current-status invariant.
pub const HAS_STATUS: &str = "HAS_STATUS";

/// Entity type of status values.
pub const STATUS_ENTITY_TYPE: &str = "status";

const STATUS_LINK_SMART_CODE: &str = "PLAYBOOK.STATUS.LINK.V1";

/// Manages the one-active-status-edge invariant for subject entities.
pub struct StatusManager {
    store: Arc<dyn Store>,
}

impl StatusManager {
    /// Create a new status manager over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Transition a subject entity to the status identified by smart code.
    ///
    /// The target status entity is resolved before any edge is touched, so
    /// an unknown smart code fails without mutating anything. Every active
    /// edge found is retired (the invariant allows at most one, but
    /// duplicates left by an interrupted transition are repaired here, not
    /// treated as fatal), then the new active edge is created.
    #[instrument(skip(self), fields(subject = %subject_entity_id, status = %status_smart_code))]
    pub async fn set_status(
        &self,
        organization_id: Uuid,
        subject_entity_id: Uuid,
        status_smart_code: &str,
    ) -> Result<()> {
        let target = self
            .resolve_status_entity(organization_id, status_smart_code)
            .await?;

        let active = self.active_edges(organization_id, subject_entity_id).await?;
        if active.len() > 1 {
            warn!(
                count = active.len(),
                "Repairing duplicate active status relationships"
            );
        }

        let now = Utc::now();
        for edge in &active {
            self.store
                .update_relationship(organization_id, edge.id, false, Some(now))
                .await?;
        }

        self.store
            .create_relationship(&NewRelationship {
                organization_id,
                from_entity_id: subject_entity_id,
                to_entity_id: target.id,
                relationship_type: HAS_STATUS.to_string(),
                smart_code: STATUS_LINK_SMART_CODE.to_string(),
                is_active: true,
                effective_date: now,
            })
            .await?;

        debug!(status_entity = %target.id, "Status transition applied");
        Ok(())
    }

    /// Re-derive the current status of a subject entity.
    ///
    /// Returns the status entity, or `None` if the subject has never had a
    /// status set. Duplicate active edges (from an interrupted transition)
    /// are repaired on the way out: the edge with the latest effective date
    /// wins and the rest are retired.
    pub async fn current_status(
        &self,
        organization_id: Uuid,
        subject_entity_id: Uuid,
    ) -> Result<Option<EntityRecord>> {
        let mut active = self.active_edges(organization_id, subject_entity_id).await?;
        active.sort_by_key(|e| e.effective_date);
        let Some(winner) = active.pop() else {
            return Ok(None);
        };

        if !active.is_empty() {
            warn!(
                subject = %subject_entity_id,
                count = active.len() + 1,
                "Repairing duplicate active status relationships on read"
            );
            let now = Utc::now();
            for edge in &active {
                self.store
                    .update_relationship(organization_id, edge.id, false, Some(now))
                    .await?;
            }
        }

        self.store
            .get_entity(organization_id, winner.to_entity_id)
            .await
    }

    /// Full status history of a subject, oldest first, retired edges
    /// included.
    pub async fn status_history(
        &self,
        organization_id: Uuid,
        subject_entity_id: Uuid,
    ) -> Result<Vec<RelationshipRecord>> {
        let mut edges = self
            .store
            .query_relationships(
                organization_id,
                &RelationshipFilter {
                    from_entity_id: Some(subject_entity_id),
                    relationship_type: Some(HAS_STATUS.to_string()),
                    active_only: false,
                    ..Default::default()
                },
            )
            .await?;
        edges.sort_by_key(|e| e.effective_date);
        Ok(edges)
    }

    async fn active_edges(
        &self,
        organization_id: Uuid,
        subject_entity_id: Uuid,
    ) -> Result<Vec<RelationshipRecord>> {
        self.store
            .query_relationships(
                organization_id,
                &RelationshipFilter {
                    from_entity_id: Some(subject_entity_id),
                    relationship_type: Some(HAS_STATUS.to_string()),
                    active_only: true,
                    ..Default::default()
                },
            )
            .await
    }

    async fn resolve_status_entity(
        &self,
        organization_id: Uuid,
        status_smart_code: &str,
    ) -> Result<EntityRecord> {
        let mut matches = self
            .store
            .query_entities(
                organization_id,
                &EntityFilter {
                    entity_type: Some(STATUS_ENTITY_TYPE.to_string()),
                    smart_code: Some(status_smart_code.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        matches.pop().ok_or_else(|| EngineError::NotFound {
            kind: "status",
            id: status_smart_code.to_string(),
        })
    }
}
