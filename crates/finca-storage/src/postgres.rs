//! Postgres-backed document store: one jsonb table shared by all collections.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::document::{DocumentQuery, DocumentStore, FieldKind, FieldValue, SortDirection, StoredDocument};
use crate::PersistenceError;

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS finca_documents (
                seq         BIGSERIAL PRIMARY KEY,
                id          UUID NOT NULL UNIQUE,
                collection  TEXT NOT NULL,
                doc         JSONB NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS finca_documents_collection_seq_idx
                ON finca_documents (collection, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn push_field_expr(qb: &mut QueryBuilder<'_, Postgres>, field: &str, kind: FieldKind) {
    qb.push("(doc ->> ");
    qb.push_bind(field.to_string());
    match kind {
        FieldKind::Timestamp => qb.push(")::timestamptz"),
        FieldKind::Number => qb.push(")::double precision"),
        FieldKind::Text => qb.push(")"),
    };
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Timestamp(ts) => qb.push_bind(*ts),
        FieldValue::Number(n) => qb.push_bind(*n),
        FieldValue::Text(s) => qb.push_bind(s.clone()),
    };
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn append(&self, collection: &str, doc: JsonValue) -> Result<Uuid, PersistenceError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO finca_documents (id, collection, doc)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(collection)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn query(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, PersistenceError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id, doc FROM finca_documents WHERE collection = ");
        qb.push_bind(collection.to_string());

        for filter in &query.filters {
            qb.push(" AND ");
            push_field_expr(&mut qb, &filter.field, filter.value.kind());
            qb.push(filter.op.sql());
            push_value(&mut qb, &filter.value);
        }

        let direction = match &query.order_by {
            Some(order) if order.direction == SortDirection::Ascending => " ASC",
            Some(_) => " DESC",
            None => " ASC",
        };
        qb.push(" ORDER BY ");
        if let Some(order) = &query.order_by {
            push_field_expr(&mut qb, &order.field, order.kind);
            qb.push(direction);
            qb.push(" NULLS LAST, ");
        }
        qb.push("seq");
        qb.push(direction);

        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredDocument {
                id: row.try_get("id")?,
                doc: row.try_get("doc")?,
            });
        }
        Ok(out)
    }
}
