//! In-memory store backend.
//!
//! Used by tests and embedded deployments that do not want a database.
//! All writes go through a single `RwLock`, which gives the same row-level
//! atomicity guarantees the trait documents for the PostgreSQL backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;

use super::{
    DynamicFieldRecord, EntityFilter, EntityRecord, NewEntity, NewRelationship, NewTransaction,
    NewTransactionLine, RelationshipFilter, RelationshipRecord, Store, TransactionFilter,
    TransactionLineRecord, TransactionRecord,
};

#[derive(Default)]
struct Inner {
    entities: Vec<EntityRecord>,
    dynamic_fields: Vec<DynamicFieldRecord>,
    relationships: Vec<RelationshipRecord>,
    transactions: Vec<TransactionRecord>,
    transaction_lines: Vec<TransactionLineRecord>,
}

/// In-memory store backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn entity_matches(entity: &EntityRecord, filter: &EntityFilter) -> bool {
    if let Some(ref t) = filter.entity_type
        && entity.entity_type != *t
    {
        return false;
    }
    if let Some(ref c) = filter.code
        && entity.code.as_deref() != Some(c.as_str())
    {
        return false;
    }
    if let Some(ref sc) = filter.smart_code
        && entity.smart_code != *sc
    {
        return false;
    }
    if let Some(ref n) = filter.name
        && entity.name != *n
    {
        return false;
    }
    true
}

fn relationship_matches(
    rel: &RelationshipRecord,
    filter: &RelationshipFilter,
    now: DateTime<Utc>,
) -> bool {
    if let Some(from) = filter.from_entity_id
        && rel.from_entity_id != from
    {
        return false;
    }
    if let Some(to) = filter.to_entity_id
        && rel.to_entity_id != to
    {
        return false;
    }
    if let Some(ref t) = filter.relationship_type
        && rel.relationship_type != *t
    {
        return false;
    }
    if let Some(ref suffix) = filter.relationship_type_suffix
        && !rel.relationship_type.ends_with(suffix)
    {
        return false;
    }
    if filter.active_only {
        let unexpired = rel.expiration_date.is_none_or(|exp| exp > now);
        if !rel.is_active || !unexpired {
            return false;
        }
    }
    true
}

fn transaction_matches(txn: &TransactionRecord, filter: &TransactionFilter) -> bool {
    if let Some(ref t) = filter.transaction_type
        && txn.transaction_type != *t
    {
        return false;
    }
    if let Some(ref sc) = filter.smart_code
        && txn.smart_code != *sc
    {
        return false;
    }
    if let Some(source) = filter.source_entity_id
        && txn.source_entity_id != Some(source)
    {
        return false;
    }
    if let Some(target) = filter.target_entity_id
        && txn.target_entity_id != Some(target)
    {
        return false;
    }
    if let Some(ref contains) = filter.metadata_contains
        && let Some(pairs) = contains.as_object()
    {
        for (key, expected) in pairs {
            if txn.metadata.get(key) != Some(expected) {
                return false;
            }
        }
    }
    if let Some(after) = filter.created_after
        && txn.created_at < after
    {
        return false;
    }
    if let Some(before) = filter.created_before
        && txn.created_at >= before
    {
        return false;
    }
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_entity(&self, entity: &NewEntity) -> Result<EntityRecord, EngineError> {
        let mut inner = self.inner.write().await;

        if let Some(ref code) = entity.code {
            let duplicate = inner.entities.iter().any(|e| {
                e.organization_id == entity.organization_id
                    && e.entity_type == entity.entity_type
                    && e.code.as_deref() == Some(code.as_str())
            });
            if duplicate {
                return Err(EngineError::Conflict {
                    resource: entity.entity_type.clone(),
                    details: format!("code '{}' already exists", code),
                });
            }
        }

        let record = EntityRecord {
            id: Uuid::new_v4(),
            organization_id: entity.organization_id,
            entity_type: entity.entity_type.clone(),
            name: entity.name.clone(),
            code: entity.code.clone(),
            smart_code: entity.smart_code.clone(),
            metadata: entity.metadata.clone(),
            created_at: Utc::now(),
        };
        inner.entities.push(record.clone());
        Ok(record)
    }

    async fn update_entity(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
        name: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .iter_mut()
            .find(|e| e.organization_id == organization_id && e.id == entity_id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "entity",
                id: entity_id.to_string(),
            })?;
        if let Some(name) = name {
            entity.name = name.to_string();
        }
        if let Some(metadata) = metadata {
            entity.metadata = metadata.clone();
        }
        Ok(())
    }

    async fn get_entity(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
    ) -> Result<Option<EntityRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entities
            .iter()
            .find(|e| e.organization_id == organization_id && e.id == entity_id)
            .cloned())
    }

    async fn query_entities(
        &self,
        organization_id: Uuid,
        filter: &EntityFilter,
    ) -> Result<Vec<EntityRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entities
            .iter()
            .filter(|e| e.organization_id == organization_id && entity_matches(e, filter))
            .cloned()
            .collect())
    }

    async fn create_relationship(
        &self,
        relationship: &NewRelationship,
    ) -> Result<RelationshipRecord, EngineError> {
        let mut inner = self.inner.write().await;
        let record = RelationshipRecord {
            id: Uuid::new_v4(),
            organization_id: relationship.organization_id,
            from_entity_id: relationship.from_entity_id,
            to_entity_id: relationship.to_entity_id,
            relationship_type: relationship.relationship_type.clone(),
            smart_code: relationship.smart_code.clone(),
            is_active: relationship.is_active,
            effective_date: relationship.effective_date,
            expiration_date: None,
        };
        inner.relationships.push(record.clone());
        Ok(record)
    }

    async fn update_relationship(
        &self,
        organization_id: Uuid,
        relationship_id: Uuid,
        is_active: bool,
        expiration_date: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        let rel = inner
            .relationships
            .iter_mut()
            .find(|r| r.organization_id == organization_id && r.id == relationship_id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "relationship",
                id: relationship_id.to_string(),
            })?;
        rel.is_active = is_active;
        rel.expiration_date = expiration_date;
        Ok(())
    }

    async fn query_relationships(
        &self,
        organization_id: Uuid,
        filter: &RelationshipFilter,
    ) -> Result<Vec<RelationshipRecord>, EngineError> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        Ok(inner
            .relationships
            .iter()
            .filter(|r| {
                r.organization_id == organization_id && relationship_matches(r, filter, now)
            })
            .cloned()
            .collect())
    }

    async fn create_transaction(
        &self,
        header: &NewTransaction,
        lines: &[NewTransactionLine],
    ) -> Result<TransactionRecord, EngineError> {
        let mut inner = self.inner.write().await;
        let record = TransactionRecord {
            id: Uuid::new_v4(),
            organization_id: header.organization_id,
            transaction_type: header.transaction_type.clone(),
            smart_code: header.smart_code.clone(),
            source_entity_id: header.source_entity_id,
            target_entity_id: header.target_entity_id,
            total_amount: header.total_amount,
            transaction_date: header.transaction_date,
            metadata: header.metadata.clone(),
            created_at: Utc::now(),
        };
        for line in lines {
            inner.transaction_lines.push(TransactionLineRecord {
                transaction_id: record.id,
                organization_id: header.organization_id,
                line_number: line.line_number,
                line_entity_id: line.line_entity_id,
                description: line.description.clone(),
                amount: line.amount,
                metadata: line.metadata.clone(),
            });
        }
        inner.transactions.push(record.clone());
        Ok(record)
    }

    async fn update_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        let txn = inner
            .transactions
            .iter_mut()
            .find(|t| t.organization_id == organization_id && t.id == transaction_id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "transaction",
                id: transaction_id.to_string(),
            })?;
        txn.metadata = metadata.clone();
        Ok(())
    }

    async fn get_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<TransactionRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .transactions
            .iter()
            .find(|t| t.organization_id == organization_id && t.id == transaction_id)
            .cloned())
    }

    async fn query_transactions(
        &self,
        organization_id: Uuid,
        filter: &TransactionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.organization_id == organization_id && transaction_matches(t, filter))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_transactions(
        &self,
        organization_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<i64, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.organization_id == organization_id && transaction_matches(t, filter))
            .count() as i64)
    }

    async fn get_transaction_lines(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<TransactionLineRecord>, EngineError> {
        let inner = self.inner.read().await;
        let mut lines: Vec<TransactionLineRecord> = inner
            .transaction_lines
            .iter()
            .filter(|l| l.organization_id == organization_id && l.transaction_id == transaction_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.line_number);
        Ok(lines)
    }

    async fn set_dynamic_field(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
        field_name: &str,
        value: &serde_json::Value,
        smart_code: &str,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.dynamic_fields.iter_mut().find(|f| {
            f.organization_id == organization_id
                && f.entity_id == entity_id
                && f.field_name == field_name
        }) {
            existing.value = value.clone();
            existing.smart_code = smart_code.to_string();
            existing.updated_at = Utc::now();
        } else {
            inner.dynamic_fields.push(DynamicFieldRecord {
                entity_id,
                organization_id,
                field_name: field_name.to_string(),
                value: value.clone(),
                smart_code: smart_code.to_string(),
                updated_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn get_dynamic_fields(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
    ) -> Result<Vec<DynamicFieldRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner
            .dynamic_fields
            .iter()
            .filter(|f| f.organization_id == organization_id && f.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_entity(org: Uuid, entity_type: &str, name: &str, code: Option<&str>) -> NewEntity {
        NewEntity {
            organization_id: org,
            entity_type: entity_type.to_string(),
            name: name.to_string(),
            code: code.map(String::from),
            smart_code: "PLAYBOOK.TEST.ENTITY.V1".to_string(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_entity_code_unique_per_org_and_type() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();

        store
            .create_entity(&new_entity(org, "idempotency_record", "r1", Some("k1:start")))
            .await
            .unwrap();

        // Same code, same type, same org: conflict
        let err = store
            .create_entity(&new_entity(org, "idempotency_record", "r2", Some("k1:start")))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");

        // Same code, different type: allowed
        store
            .create_entity(&new_entity(org, "task", "t1", Some("k1:start")))
            .await
            .unwrap();

        // Same code, different org: allowed
        store
            .create_entity(&new_entity(
                Uuid::new_v4(),
                "idempotency_record",
                "r3",
                Some("k1:start"),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_entities_are_organization_scoped() {
        let store = MemoryStore::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        let created = store
            .create_entity(&new_entity(org_a, "user", "alice", None))
            .await
            .unwrap();

        assert!(store.get_entity(org_a, created.id).await.unwrap().is_some());
        assert!(store.get_entity(org_b, created.id).await.unwrap().is_none());

        let filter = EntityFilter {
            entity_type: Some("user".to_string()),
            ..Default::default()
        };
        assert_eq!(store.query_entities(org_a, &filter).await.unwrap().len(), 1);
        assert!(store.query_entities(org_b, &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relationship_active_only_filter() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();

        let rel = store
            .create_relationship(&NewRelationship {
                organization_id: org,
                from_entity_id: from,
                to_entity_id: to,
                relationship_type: "HAS_STATUS".to_string(),
                smart_code: "PLAYBOOK.STATUS.LINK.V1".to_string(),
                is_active: true,
                effective_date: Utc::now(),
            })
            .await
            .unwrap();

        let filter = RelationshipFilter {
            from_entity_id: Some(from),
            relationship_type: Some("HAS_STATUS".to_string()),
            active_only: true,
            ..Default::default()
        };
        assert_eq!(
            store.query_relationships(org, &filter).await.unwrap().len(),
            1
        );

        store
            .update_relationship(org, rel.id, false, Some(Utc::now()))
            .await
            .unwrap();
        assert!(
            store
                .query_relationships(org, &filter)
                .await
                .unwrap()
                .is_empty()
        );

        // Inactive edges are still visible without the filter (history)
        let all = RelationshipFilter {
            from_entity_id: Some(from),
            ..Default::default()
        };
        assert_eq!(store.query_relationships(org, &all).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_relationship_type_suffix_filter() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let from = Uuid::new_v4();

        for rel_type in ["ORDER_LINKED_TO_PAYMENT", "INVOICE_LINKED_TO_PAYMENT", "HAS_ROLE"] {
            store
                .create_relationship(&NewRelationship {
                    organization_id: org,
                    from_entity_id: from,
                    to_entity_id: Uuid::new_v4(),
                    relationship_type: rel_type.to_string(),
                    smart_code: "PLAYBOOK.TEST.LINK.V1".to_string(),
                    is_active: true,
                    effective_date: Utc::now(),
                })
                .await
                .unwrap();
        }

        let filter = RelationshipFilter {
            from_entity_id: Some(from),
            relationship_type_suffix: Some("_LINKED_TO_PAYMENT".to_string()),
            active_only: true,
            ..Default::default()
        };
        assert_eq!(
            store.query_relationships(org, &filter).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_transaction_metadata_containment_filter() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let instance_id = Uuid::new_v4().to_string();

        for (txn_type, instance) in [
            ("WORKFLOW_STEP_EXECUTION", Some(instance_id.as_str())),
            ("WORKFLOW_STEP_EXECUTION", None),
            ("payment", None),
        ] {
            let mut metadata = json!({"status": "completed"});
            if let Some(id) = instance {
                metadata["instance_id"] = json!(id);
            }
            store
                .create_transaction(
                    &NewTransaction {
                        organization_id: org,
                        transaction_type: txn_type.to_string(),
                        smart_code: "PLAYBOOK.TEST.TXN.V1".to_string(),
                        source_entity_id: None,
                        target_entity_id: None,
                        total_amount: 0.0,
                        transaction_date: Utc::now(),
                        metadata,
                    },
                    &[],
                )
                .await
                .unwrap();
        }

        let filter = TransactionFilter {
            transaction_type: Some("WORKFLOW_STEP_EXECUTION".to_string()),
            metadata_contains: Some(json!({"instance_id": instance_id})),
            ..Default::default()
        };
        let rows = store.query_transactions(org, &filter, 100, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(store.count_transactions(org, &filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transaction_lines_ordered() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();

        let txn = store
            .create_transaction(
                &NewTransaction {
                    organization_id: org,
                    transaction_type: "payment".to_string(),
                    smart_code: "PLAYBOOK.TEST.TXN.V1".to_string(),
                    source_entity_id: None,
                    target_entity_id: None,
                    total_amount: 30.0,
                    transaction_date: Utc::now(),
                    metadata: json!({}),
                },
                &[
                    NewTransactionLine {
                        line_number: 2,
                        line_entity_id: None,
                        description: Some("second".to_string()),
                        amount: 20.0,
                        metadata: json!({}),
                    },
                    NewTransactionLine {
                        line_number: 1,
                        line_entity_id: None,
                        description: Some("first".to_string()),
                        amount: 10.0,
                        metadata: json!({}),
                    },
                ],
            )
            .await
            .unwrap();

        let lines = store.get_transaction_lines(org, txn.id).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_number, 1);
        assert_eq!(lines[1].line_number, 2);
    }

    #[tokio::test]
    async fn test_dynamic_field_upsert() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let entity = store
            .create_entity(&new_entity(org, "idempotency_record", "r1", None))
            .await
            .unwrap();

        store
            .set_dynamic_field(
                org,
                entity.id,
                "request_hash",
                &json!("abc"),
                "PLAYBOOK.IDEMPOTENCY.FIELD.V1",
            )
            .await
            .unwrap();
        store
            .set_dynamic_field(
                org,
                entity.id,
                "request_hash",
                &json!("def"),
                "PLAYBOOK.IDEMPOTENCY.FIELD.V1",
            )
            .await
            .unwrap();

        let fields = store.get_dynamic_fields(org, entity.id).await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, json!("def"));

        let store: &dyn Store = &store;
        let value = store
            .get_dynamic_field(org, entity.id, "request_hash")
            .await
            .unwrap();
        assert_eq!(value, Some(json!("def")));
        let missing = store
            .get_dynamic_field(org, entity.id, "nope")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
