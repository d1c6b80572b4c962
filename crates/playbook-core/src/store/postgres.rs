//! PostgreSQL-backed store implementation.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::error::EngineError;

use super::{
    DynamicFieldRecord, EntityFilter, EntityRecord, NewEntity, NewRelationship, NewTransaction,
    NewTransactionLine, RelationshipFilter, RelationshipRecord, Store, TransactionFilter,
    TransactionLineRecord, TransactionRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL-backed store provider.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database and run migrations.
    pub async fn from_url(url: &str) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| EngineError::Store {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::Store {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    /// Access the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a sqlx error, converting unique violations into [`EngineError::Conflict`].
fn map_insert_error(err: sqlx::Error, resource: &str, code: Option<&str>) -> EngineError {
    if let Some(db_err) = err.as_database_error()
        && db_err.is_unique_violation()
    {
        return EngineError::Conflict {
            resource: resource.to_string(),
            details: format!(
                "code '{}' already exists",
                code.unwrap_or("<none>")
            ),
        };
    }
    err.into()
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    async fn create_entity(&self, entity: &NewEntity) -> Result<EntityRecord, EngineError> {
        let record = sqlx::query_as::<_, EntityRecord>(
            r#"
            INSERT INTO entities (id, organization_id, entity_type, name, code, smart_code, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, organization_id, entity_type, name, code, smart_code, metadata, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity.organization_id)
        .bind(&entity.entity_type)
        .bind(&entity.name)
        .bind(&entity.code)
        .bind(&entity.smart_code)
        .bind(&entity.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &entity.entity_type, entity.code.as_deref()))?;

        Ok(record)
    }

    async fn update_entity(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
        name: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE entities
            SET name = COALESCE($3, name),
                metadata = COALESCE($4, metadata)
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(entity_id)
        .bind(name)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                kind: "entity",
                id: entity_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_entity(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
    ) -> Result<Option<EntityRecord>, EngineError> {
        let record = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT id, organization_id, entity_type, name, code, smart_code, metadata, created_at
            FROM entities
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn query_entities(
        &self,
        organization_id: Uuid,
        filter: &EntityFilter,
    ) -> Result<Vec<EntityRecord>, EngineError> {
        let records = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT id, organization_id, entity_type, name, code, smart_code, metadata, created_at
            FROM entities
            WHERE organization_id = $1
              AND ($2::TEXT IS NULL OR entity_type = $2)
              AND ($3::TEXT IS NULL OR code = $3)
              AND ($4::TEXT IS NULL OR smart_code = $4)
              AND ($5::TEXT IS NULL OR name = $5)
            ORDER BY created_at
            "#,
        )
        .bind(organization_id)
        .bind(&filter.entity_type)
        .bind(&filter.code)
        .bind(&filter.smart_code)
        .bind(&filter.name)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn create_relationship(
        &self,
        relationship: &NewRelationship,
    ) -> Result<RelationshipRecord, EngineError> {
        let record = sqlx::query_as::<_, RelationshipRecord>(
            r#"
            INSERT INTO relationships
                (id, organization_id, from_entity_id, to_entity_id,
                 relationship_type, smart_code, is_active, effective_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, organization_id, from_entity_id, to_entity_id,
                      relationship_type, smart_code, is_active, effective_date, expiration_date
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(relationship.organization_id)
        .bind(relationship.from_entity_id)
        .bind(relationship.to_entity_id)
        .bind(&relationship.relationship_type)
        .bind(&relationship.smart_code)
        .bind(relationship.is_active)
        .bind(relationship.effective_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_relationship(
        &self,
        organization_id: Uuid,
        relationship_id: Uuid,
        is_active: bool,
        expiration_date: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE relationships
            SET is_active = $3, expiration_date = $4
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(relationship_id)
        .bind(is_active)
        .bind(expiration_date)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                kind: "relationship",
                id: relationship_id.to_string(),
            });
        }
        Ok(())
    }

    async fn query_relationships(
        &self,
        organization_id: Uuid,
        filter: &RelationshipFilter,
    ) -> Result<Vec<RelationshipRecord>, EngineError> {
        let records = sqlx::query_as::<_, RelationshipRecord>(
            r#"
            SELECT id, organization_id, from_entity_id, to_entity_id,
                   relationship_type, smart_code, is_active, effective_date, expiration_date
            FROM relationships
            WHERE organization_id = $1
              AND ($2::UUID IS NULL OR from_entity_id = $2)
              AND ($3::UUID IS NULL OR to_entity_id = $3)
              AND ($4::TEXT IS NULL OR relationship_type = $4)
              AND ($5::TEXT IS NULL OR relationship_type LIKE '%' || $5)
              AND (NOT $6 OR (is_active AND (expiration_date IS NULL OR expiration_date > now())))
            ORDER BY effective_date
            "#,
        )
        .bind(organization_id)
        .bind(filter.from_entity_id)
        .bind(filter.to_entity_id)
        .bind(&filter.relationship_type)
        .bind(&filter.relationship_type_suffix)
        .bind(filter.active_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn create_transaction(
        &self,
        header: &NewTransaction,
        lines: &[NewTransactionLine],
    ) -> Result<TransactionRecord, EngineError> {
        let record = sqlx::query_as::<_, TransactionRecord>(
            r#"
            INSERT INTO transactions
                (id, organization_id, transaction_type, smart_code,
                 source_entity_id, target_entity_id, total_amount, transaction_date, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, organization_id, transaction_type, smart_code,
                      source_entity_id, target_entity_id, total_amount,
                      transaction_date, metadata, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(header.organization_id)
        .bind(&header.transaction_type)
        .bind(&header.smart_code)
        .bind(header.source_entity_id)
        .bind(header.target_entity_id)
        .bind(header.total_amount)
        .bind(header.transaction_date)
        .bind(&header.metadata)
        .fetch_one(&self.pool)
        .await?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO transaction_lines
                    (transaction_id, organization_id, line_number,
                     line_entity_id, description, amount, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record.id)
            .bind(header.organization_id)
            .bind(line.line_number)
            .bind(line.line_entity_id)
            .bind(&line.description)
            .bind(line.amount)
            .bind(&line.metadata)
            .execute(&self.pool)
            .await?;
        }

        Ok(record)
    }

    async fn update_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET metadata = $3
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(transaction_id)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                kind: "transaction",
                id: transaction_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_transaction(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<TransactionRecord>, EngineError> {
        let record = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT id, organization_id, transaction_type, smart_code,
                   source_entity_id, target_entity_id, total_amount,
                   transaction_date, metadata, created_at
            FROM transactions
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn query_transactions(
        &self,
        organization_id: Uuid,
        filter: &TransactionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        let records = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT id, organization_id, transaction_type, smart_code,
                   source_entity_id, target_entity_id, total_amount,
                   transaction_date, metadata, created_at
            FROM transactions
            WHERE organization_id = $1
              AND ($2::TEXT IS NULL OR transaction_type = $2)
              AND ($3::TEXT IS NULL OR smart_code = $3)
              AND ($4::UUID IS NULL OR source_entity_id = $4)
              AND ($5::UUID IS NULL OR target_entity_id = $5)
              AND ($6::JSONB IS NULL OR metadata @> $6)
              AND ($7::TIMESTAMPTZ IS NULL OR created_at >= $7)
              AND ($8::TIMESTAMPTZ IS NULL OR created_at < $8)
            ORDER BY created_at
            LIMIT $9 OFFSET $10
            "#,
        )
        .bind(organization_id)
        .bind(&filter.transaction_type)
        .bind(&filter.smart_code)
        .bind(filter.source_entity_id)
        .bind(filter.target_entity_id)
        .bind(&filter.metadata_contains)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn count_transactions(
        &self,
        organization_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<i64, EngineError> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM transactions
            WHERE organization_id = $1
              AND ($2::TEXT IS NULL OR transaction_type = $2)
              AND ($3::TEXT IS NULL OR smart_code = $3)
              AND ($4::UUID IS NULL OR source_entity_id = $4)
              AND ($5::UUID IS NULL OR target_entity_id = $5)
              AND ($6::JSONB IS NULL OR metadata @> $6)
              AND ($7::TIMESTAMPTZ IS NULL OR created_at >= $7)
              AND ($8::TIMESTAMPTZ IS NULL OR created_at < $8)
            "#,
        )
        .bind(organization_id)
        .bind(&filter.transaction_type)
        .bind(&filter.smart_code)
        .bind(filter.source_entity_id)
        .bind(filter.target_entity_id)
        .bind(&filter.metadata_contains)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    async fn get_transaction_lines(
        &self,
        organization_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<TransactionLineRecord>, EngineError> {
        let records = sqlx::query_as::<_, TransactionLineRecord>(
            r#"
            SELECT transaction_id, organization_id, line_number,
                   line_entity_id, description, amount, metadata
            FROM transaction_lines
            WHERE organization_id = $1 AND transaction_id = $2
            ORDER BY line_number
            "#,
        )
        .bind(organization_id)
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn set_dynamic_field(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
        field_name: &str,
        value: &serde_json::Value,
        smart_code: &str,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO dynamic_fields (entity_id, organization_id, field_name, value, smart_code, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (entity_id, field_name)
            DO UPDATE SET value = EXCLUDED.value,
                          smart_code = EXCLUDED.smart_code,
                          updated_at = now()
            "#,
        )
        .bind(entity_id)
        .bind(organization_id)
        .bind(field_name)
        .bind(value)
        .bind(smart_code)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_dynamic_fields(
        &self,
        organization_id: Uuid,
        entity_id: Uuid,
    ) -> Result<Vec<DynamicFieldRecord>, EngineError> {
        let records = sqlx::query_as::<_, DynamicFieldRecord>(
            r#"
            SELECT entity_id, organization_id, field_name, value, smart_code, updated_at
            FROM dynamic_fields
            WHERE organization_id = $1 AND entity_id = $2
            ORDER BY field_name
            "#,
        )
        .bind(organization_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
