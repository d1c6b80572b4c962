// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Permission resolution and enforcement.
//!
//! A [`SecurityContext`] is derived fresh per request from entity and
//! relationship data; it is never persisted. Enforcement fails fast on the
//! first missing permission with a typed [`EngineError::Forbidden`].

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{EntityFilter, RelationshipFilter, Store};

/// Relationship type linking a user entity to a role entity.
pub const HAS_ROLE: &str = "HAS_ROLE";

/// Global permission that short-circuits all checks.
pub const ADMIN_PERMISSION: &str = "admin";

/// Resolved security context for one request.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    /// The authenticated user.
    pub user_id: Uuid,
    /// The organization the request is scoped to.
    pub organization_id: Uuid,
    /// Effective permission set (direct + role-derived).
    pub permissions: HashSet<String>,
    /// Names of the roles the user holds.
    pub roles: HashSet<String>,
}

impl SecurityContext {
    /// Whether the context holds the permission directly, via wildcard, or
    /// via the global admin short-circuit. Contextual rules are applied by
    /// [`PermissionService::check_permission`].
    pub fn holds(&self, permission: &str) -> bool {
        if self.permissions.contains(ADMIN_PERMISSION) {
            return true;
        }
        if self.permissions.contains(permission) {
            return true;
        }
        // resource:* grants resource:<anything>
        if let Some((resource, _)) = permission.split_once(':')
            && self.permissions.contains(&format!("{}:*", resource))
        {
            return true;
        }
        false
    }
}

/// Contextual inputs for permission checks.
#[derive(Debug, Clone, Default)]
pub struct PermissionScope {
    /// Owner of the resource being accessed, when known.
    pub resource_owner_id: Option<Uuid>,
    /// Department the resource belongs to, when known.
    pub department: Option<String>,
}

/// Resolves effective permission sets and enforces required permissions.
pub struct PermissionService {
    store: Arc<dyn Store>,
}

impl PermissionService {
    /// Create a new permission service over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve the effective security context for a user.
    ///
    /// Reads direct permissions from the user entity's metadata and merges
    /// permissions from role entities linked via `HAS_ROLE` relationships.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unauthorized`] if the user entity does not
    /// exist in the organization.
    #[instrument(skip(self))]
    pub async fn resolve_context(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<SecurityContext> {
        let user = self
            .store
            .get_entity(organization_id, user_id)
            .await?
            .filter(|e| e.entity_type == "user")
            .ok_or_else(|| EngineError::Unauthorized {
                reason: format!("user '{}' not found in organization", user_id),
            })?;

        let mut permissions = permissions_from_metadata(&user.metadata);
        let mut roles = HashSet::new();

        let role_links = self
            .store
            .query_relationships(
                organization_id,
                &RelationshipFilter {
                    from_entity_id: Some(user_id),
                    relationship_type: Some(HAS_ROLE.to_string()),
                    active_only: true,
                    ..Default::default()
                },
            )
            .await?;

        for link in role_links {
            let Some(role) = self
                .store
                .get_entity(organization_id, link.to_entity_id)
                .await?
            else {
                continue;
            };
            roles.insert(role.name.clone());
            permissions.extend(permissions_from_metadata(&role.metadata));
        }

        debug!(
            user_id = %user_id,
            permission_count = permissions.len(),
            role_count = roles.len(),
            "Security context resolved"
        );

        Ok(SecurityContext {
            user_id,
            organization_id,
            permissions,
            roles,
        })
    }

    /// Check a single permission against the context and optional scope.
    ///
    /// Resolution order: direct or role-derived grant, `resource:*`
    /// wildcard, global `admin`, then contextual rules:
    /// - a `<resource>:read` permission is granted on a resource the caller
    ///   owns (`scope.resource_owner_id == ctx.user_id`);
    /// - a department-scoped grant `<permission>:<department>` counts when
    ///   `scope.department` matches.
    pub fn check_permission(
        &self,
        ctx: &SecurityContext,
        permission: &str,
        scope: Option<&PermissionScope>,
    ) -> bool {
        if ctx.holds(permission) {
            return true;
        }

        let Some(scope) = scope else {
            return false;
        };

        if permission.ends_with(":read")
            && scope.resource_owner_id == Some(ctx.user_id)
        {
            return true;
        }

        if let Some(ref department) = scope.department
            && ctx
                .permissions
                .contains(&format!("{}:{}", permission, department))
        {
            return true;
        }

        false
    }

    /// Enforce that all listed permissions are held.
    ///
    /// Fails fast on the first missing permission with
    /// [`EngineError::Forbidden`] carrying its name. Callers are responsible
    /// for auditing failures.
    pub fn enforce_permissions(
        &self,
        ctx: &SecurityContext,
        permissions: &[&str],
        scope: Option<&PermissionScope>,
    ) -> Result<()> {
        for permission in permissions {
            if !self.check_permission(ctx, permission, scope) {
                debug!(
                    user_id = %ctx.user_id,
                    permission = %permission,
                    "Permission denied"
                );
                return Err(EngineError::Forbidden {
                    permission: permission.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Extract a permission list from entity metadata (`metadata.permissions`).
fn permissions_from_metadata(metadata: &serde_json::Value) -> HashSet<String> {
    metadata
        .get("permissions")
        .and_then(|p| p.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewEntity, NewRelationship};
    use chrono::Utc;
    use serde_json::json;

    async fn create_user(
        store: &MemoryStore,
        org: Uuid,
        name: &str,
        permissions: serde_json::Value,
    ) -> Uuid {
        store
            .create_entity(&NewEntity {
                organization_id: org,
                entity_type: "user".to_string(),
                name: name.to_string(),
                code: None,
                smart_code: "PLAYBOOK.SECURITY.USER.V1".to_string(),
                metadata: json!({ "permissions": permissions }),
            })
            .await
            .unwrap()
            .id
    }

    async fn assign_role(
        store: &MemoryStore,
        org: Uuid,
        user_id: Uuid,
        role_name: &str,
        permissions: serde_json::Value,
    ) {
        let role = store
            .create_entity(&NewEntity {
                organization_id: org,
                entity_type: "role".to_string(),
                name: role_name.to_string(),
                code: None,
                smart_code: "PLAYBOOK.SECURITY.ROLE.V1".to_string(),
                metadata: json!({ "permissions": permissions }),
            })
            .await
            .unwrap();
        store
            .create_relationship(&NewRelationship {
                organization_id: org,
                from_entity_id: user_id,
                to_entity_id: role.id,
                relationship_type: HAS_ROLE.to_string(),
                smart_code: "PLAYBOOK.SECURITY.HAS_ROLE.V1".to_string(),
                is_active: true,
                effective_date: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_direct_permission() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = create_user(&store, org, "alice", json!(["playbook_run:read"])).await;

        let service = PermissionService::new(Arc::new(store));
        let ctx = service.resolve_context(org, user).await.unwrap();

        assert!(service.check_permission(&ctx, "playbook_run:read", None));
        assert!(!service.check_permission(&ctx, "playbook_run:cancel", None));
    }

    #[tokio::test]
    async fn test_role_derived_permissions() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = create_user(&store, org, "bob", json!([])).await;
        assign_role(
            &store,
            org,
            user,
            "manager",
            json!(["playbook_run:manage", "playbook_run:cancel"]),
        )
        .await;

        let service = PermissionService::new(Arc::new(store));
        let ctx = service.resolve_context(org, user).await.unwrap();

        assert!(ctx.roles.contains("manager"));
        assert!(service.check_permission(&ctx, "playbook_run:cancel", None));
        assert!(service.check_permission(&ctx, "playbook_run:manage", None));
    }

    #[tokio::test]
    async fn test_wildcard_permission() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = create_user(&store, org, "carol", json!(["playbook_run:*"])).await;

        let service = PermissionService::new(Arc::new(store));
        let ctx = service.resolve_context(org, user).await.unwrap();

        assert!(service.check_permission(&ctx, "playbook_run:cancel", None));
        assert!(service.check_permission(&ctx, "playbook_run:read", None));
        assert!(!service.check_permission(&ctx, "audit:read", None));
    }

    #[tokio::test]
    async fn test_admin_short_circuit() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = create_user(&store, org, "root", json!(["admin"])).await;

        let service = PermissionService::new(Arc::new(store));
        let ctx = service.resolve_context(org, user).await.unwrap();

        assert!(service.check_permission(&ctx, "playbook_run:cancel", None));
        assert!(service.check_permission(&ctx, "anything:at_all", None));
    }

    #[tokio::test]
    async fn test_owner_read_contextual_rule() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = create_user(&store, org, "dave", json!([])).await;

        let service = PermissionService::new(Arc::new(store));
        let ctx = service.resolve_context(org, user).await.unwrap();

        let own = PermissionScope {
            resource_owner_id: Some(user),
            department: None,
        };
        let other = PermissionScope {
            resource_owner_id: Some(Uuid::new_v4()),
            department: None,
        };

        assert!(service.check_permission(&ctx, "playbook_run:read", Some(&own)));
        assert!(!service.check_permission(&ctx, "playbook_run:read", Some(&other)));
        // Ownership never grants mutation
        assert!(!service.check_permission(&ctx, "playbook_run:cancel", Some(&own)));
    }

    #[tokio::test]
    async fn test_department_scoped_permission() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = create_user(&store, org, "erin", json!(["schedule:edit:spa"])).await;

        let service = PermissionService::new(Arc::new(store));
        let ctx = service.resolve_context(org, user).await.unwrap();

        let spa = PermissionScope {
            resource_owner_id: None,
            department: Some("spa".to_string()),
        };
        let retail = PermissionScope {
            resource_owner_id: None,
            department: Some("retail".to_string()),
        };

        assert!(service.check_permission(&ctx, "schedule:edit", Some(&spa)));
        assert!(!service.check_permission(&ctx, "schedule:edit", Some(&retail)));
        assert!(!service.check_permission(&ctx, "schedule:edit", None));
    }

    #[tokio::test]
    async fn test_enforce_fails_fast_with_permission_name() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let user = create_user(&store, org, "frank", json!(["playbook_run:read"])).await;

        let service = PermissionService::new(Arc::new(store));
        let ctx = service.resolve_context(org, user).await.unwrap();

        let err = service
            .enforce_permissions(
                &ctx,
                &["playbook_run:read", "playbook_run:cancel", "playbook_run:manage"],
                None,
            )
            .unwrap_err();
        match err {
            EngineError::Forbidden { permission } => {
                assert_eq!(permission, "playbook_run:cancel");
            }
            other => panic!("Expected Forbidden, got {:?}", other),
        }

        assert!(
            service
                .enforce_permissions(&ctx, &["playbook_run:read"], None)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unknown_user_is_unauthorized() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();

        let service = PermissionService::new(Arc::new(store));
        let err = service
            .resolve_context(org, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_non_user_entity_is_unauthorized() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let task = store
            .create_entity(&NewEntity {
                organization_id: org,
                entity_type: "task".to_string(),
                name: "not a user".to_string(),
                code: None,
                smart_code: "PLAYBOOK.WORKFLOW.TASK.V1".to_string(),
                metadata: json!({}),
            })
            .await
            .unwrap();

        let service = PermissionService::new(Arc::new(store));
        let err = service.resolve_context(org, task.id).await.unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }
}
