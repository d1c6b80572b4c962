//! Store adapter interfaces and backends for playbook-core.
//!
//! This module defines the generic persistent store abstraction (entities,
//! relationships, transactions, dynamic fields) and backend implementations.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;

/// Entity record from the store.
///
/// Entities are the generic typed records of the store: users, roles,
/// status values, tasks, workflow definitions, idempotency records.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntityRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Entity type discriminator (user, role, status, task, ...).
    pub entity_type: String,
    /// Human-readable name.
    pub name: String,
    /// Optional business code, unique per (organization, entity_type).
    pub code: Option<String>,
    /// Smart code classifying the entity by domain and version.
    pub smart_code: String,
    /// Arbitrary metadata attached to the entity.
    pub metadata: serde_json::Value,
    /// When the entity was created.
    pub created_at: DateTime<Utc>,
}

/// Input for creating an entity.
#[derive(Debug, Clone)]
pub struct NewEntity {
    /// Owning organization.
    pub organization_id: Uuid,
    /// Entity type discriminator.
    pub entity_type: String,
    /// Human-readable name.
    pub name: String,
    /// Optional business code, unique per (organization, entity_type).
    pub code: Option<String>,
    /// Smart code classifying the entity.
    pub smart_code: String,
    /// Arbitrary metadata.
    pub metadata: serde_json::Value,
}

/// Dynamic field attached to an entity without schema change.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DynamicFieldRecord {
    /// Entity the field belongs to.
    pub entity_id: Uuid,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Field name, unique per entity.
    pub field_name: String,
    /// Field value as JSON.
    pub value: serde_json::Value,
    /// Smart code classifying the field.
    pub smart_code: String,
    /// When the field was last written.
    pub updated_at: DateTime<Utc>,
}

/// Directed, typed, time-bounded edge between two entities.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RelationshipRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Source entity.
    pub from_entity_id: Uuid,
    /// Target entity.
    pub to_entity_id: Uuid,
    /// Relationship type (HAS_STATUS, HAS_ROLE, ...).
    pub relationship_type: String,
    /// Smart code classifying the relationship.
    pub smart_code: String,
    /// Whether the edge is currently active.
    pub is_active: bool,
    /// When the edge became effective.
    pub effective_date: DateTime<Utc>,
    /// When the edge was retired (None while active).
    pub expiration_date: Option<DateTime<Utc>>,
}

/// Input for creating a relationship.
#[derive(Debug, Clone)]
pub struct NewRelationship {
    /// Owning organization.
    pub organization_id: Uuid,
    /// Source entity.
    pub from_entity_id: Uuid,
    /// Target entity.
    pub to_entity_id: Uuid,
    /// Relationship type.
    pub relationship_type: String,
    /// Smart code classifying the relationship.
    pub smart_code: String,
    /// Whether the edge starts active.
    pub is_active: bool,
    /// When the edge becomes effective.
    pub effective_date: DateTime<Utc>,
}

/// Transaction header record.
///
/// Transactions record both business events (payments) and workflow
/// bookkeeping (instances, step executions, engine events, audit entries).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransactionRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Transaction type discriminator.
    pub transaction_type: String,
    /// Smart code classifying the transaction.
    pub smart_code: String,
    /// Optional source entity.
    pub source_entity_id: Option<Uuid>,
    /// Optional target entity.
    pub target_entity_id: Option<Uuid>,
    /// Total amount (0 for bookkeeping rows).
    pub total_amount: f64,
    /// Business timestamp of the transaction.
    pub transaction_date: DateTime<Utc>,
    /// Arbitrary metadata attached to the transaction.
    pub metadata: serde_json::Value,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

/// Input for creating a transaction header.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    /// Owning organization.
    pub organization_id: Uuid,
    /// Transaction type discriminator.
    pub transaction_type: String,
    /// Smart code classifying the transaction.
    pub smart_code: String,
    /// Optional source entity.
    pub source_entity_id: Option<Uuid>,
    /// Optional target entity.
    pub target_entity_id: Option<Uuid>,
    /// Total amount.
    pub total_amount: f64,
    /// Business timestamp.
    pub transaction_date: DateTime<Utc>,
    /// Arbitrary metadata.
    pub metadata: serde_json::Value,
}

/// Ordered line row belonging to a transaction.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransactionLineRecord {
    /// Transaction the line belongs to.
    pub transaction_id: Uuid,
    /// Owning organization.
    pub organization_id: Uuid,
    /// 1-based line order within the transaction.
    pub line_number: i32,
    /// Optional entity the line refers to.
    pub line_entity_id: Option<Uuid>,
    /// Line description.
    pub description: Option<String>,
    /// Line amount.
    pub amount: f64,
    /// Arbitrary metadata.
    pub metadata: serde_json::Value,
}

/// Input for creating a transaction line.
#[derive(Debug, Clone)]
pub struct NewTransactionLine {
    /// 1-based line order within the transaction.
    pub line_number: i32,
    /// Optional entity the line refers to.
    pub line_entity_id: Option<Uuid>,
    /// Line description.
    pub description: Option<String>,
    /// Line amount.
    pub amount: f64,
    /// Arbitrary metadata.
    pub metadata: serde_json::Value,
}

/// Filter options for querying entities.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Filter by entity type.
    pub entity_type: Option<String>,
    /// Filter by exact business code.
    pub code: Option<String>,
    /// Filter by exact smart code.
    pub smart_code: Option<String>,
    /// Filter by exact name.
    pub name: Option<String>,
}

/// Filter options for querying relationships.
#[derive(Debug, Clone, Default)]
pub struct RelationshipFilter {
    /// Filter by source entity.
    pub from_entity_id: Option<Uuid>,
    /// Filter by target entity.
    pub to_entity_id: Option<Uuid>,
    /// Filter by exact relationship type.
    pub relationship_type: Option<String>,
    /// Filter by relationship type suffix (e.g. `_LINKED_TO_PAYMENT`).
    pub relationship_type_suffix: Option<String>,
    /// When true, only active edges whose expiration date is unset or in
    /// the future are returned.
    pub active_only: bool,
}

/// Filter options for querying transactions.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Filter by transaction type.
    pub transaction_type: Option<String>,
    /// Filter by exact smart code.
    pub smart_code: Option<String>,
    /// Filter by source entity.
    pub source_entity_id: Option<Uuid>,
    /// Filter by target entity.
    pub target_entity_id: Option<Uuid>,
    /// Require the given top-level key/value pairs to be present in the
    /// transaction metadata (JSON containment).
    pub metadata_contains: Option<serde_json::Value>,
    /// Filter transactions created at or after this time.
    pub created_after: Option<DateTime<Utc>>,
    /// Filter transactions created before this time.
    pub created_before: Option<DateTime<Utc>>,
}

/// Generic persistent store interface consumed by the engine.
///
/// Every operation is organization-scoped: a call never reads or writes
/// rows belonging to another organization. Writes are atomic at the row
/// level; the store offers no multi-row transactions, and callers are
/// expected to tolerate and repair interleavings (see the status manager).
///
/// `create_entity` enforces a unique `(organization, entity_type, code)`
/// constraint when `code` is set and returns [`EngineError::Conflict`] on
/// violation. This constraint is the arbiter for idempotency-record races.
#[allow(missing_docs)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_entity(&self, entity: &NewEntity) -> Result<EntityRecord, EngineError>;

    async fn update_entity(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
        name: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), EngineError>;

    async fn get_entity(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
    ) -> Result<Option<EntityRecord>, EngineError>;

    async fn query_entities(
        &self,
        organization_id: Uuid,
        filter: &EntityFilter,
    ) -> Result<Vec<EntityRecord>, EngineError>;

    async fn create_relationship(
        &self,
        relationship: &NewRelationship,
    ) -> Result<RelationshipRecord, EngineError>;

    /// Update the activity window of a relationship (single-row atomic).
    async fn update_relationship(
        &self,
        organization_id: Uuid,
        relationship_id: Uuid,
        is_active: bool,
        expiration_date: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError>;

    async fn query_relationships(
        &self,
        organization_id: Uuid,
        filter: &RelationshipFilter,
    ) -> Result<Vec<RelationshipRecord>, EngineError>;

    /// Create a transaction header with its ordered lines.
    async fn create_transaction(
        &self,
        header: &NewTransaction,
        lines: &[NewTransactionLine],
    ) -> Result<TransactionRecord, EngineError>;

    /// Replace the metadata of a transaction (single-row atomic).
    async fn update_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<(), EngineError>;

    async fn get_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<TransactionRecord>, EngineError>;

    /// Query transactions ordered by creation time (oldest first).
    async fn query_transactions(
        &self,
        organization_id: Uuid,
        filter: &TransactionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>, EngineError>;

    async fn count_transactions(
        &self,
        organization_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<i64, EngineError>;

    async fn get_transaction_lines(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<TransactionLineRecord>, EngineError>;

    /// Upsert a dynamic field on an entity.
    async fn set_dynamic_field(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
        field_name: &str,
        value: &serde_json::Value,
        smart_code: &str,
    ) -> Result<(), EngineError>;

    async fn get_dynamic_fields(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
    ) -> Result<Vec<DynamicFieldRecord>, EngineError>;

    async fn health_check(&self) -> Result<bool, EngineError>;
}

impl dyn Store {
    /// Convenience lookup of a single dynamic field by name.
    pub async fn get_dynamic_field(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
        field_name: &str,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        let fields = self.get_dynamic_fields(organization_id, entity_id).await?;
        Ok(fields
            .into_iter()
            .find(|f| f.field_name == field_name)
            .map(|f| f.value))
    }
}
