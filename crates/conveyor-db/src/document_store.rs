//! PostgreSQL-backed document store.
//!
//! Documents live in a single `documents` table keyed by `(collection, id)`
//! with a JSONB body and a monotonic version column; compare-and-swap is a
//! conditional UPDATE on that version. Equality filters compile to JSONB
//! containment so the GIN index applies; `created_at` ordering and cursors
//! read the body field directly.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use conveyor_core::CoreError;
use conveyor_core::store::{
    Document, Expect, MAX_TRANSACTION_OPS, MetadataStore, Order, QueryFilter, TxOp,
};

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend_err(e: sqlx::Error) -> CoreError {
    CoreError::RetryableBackend(format!("postgres: {e}"))
}

async fn exec_put<'e, E>(
    executor: E,
    collection: &str,
    id: &str,
    body: &serde_json::Value,
    expect: Expect,
) -> Result<u64, CoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let version: Option<i64> = match expect {
        Expect::Absent => sqlx::query_scalar(
            r#"
            INSERT INTO documents (collection, id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO NOTHING
            RETURNING version
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .fetch_optional(executor)
        .await
        .map_err(backend_err)?,
        Expect::Version(expected) => sqlx::query_scalar(
            r#"
            UPDATE documents
            SET body = $3, version = version + 1, updated_at = now()
            WHERE collection = $1 AND id = $2 AND version = $4
            RETURNING version
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .bind(expected as i64)
        .fetch_optional(executor)
        .await
        .map_err(backend_err)?,
        Expect::Any => sqlx::query_scalar(
            r#"
            INSERT INTO documents (collection, id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO UPDATE
            SET body = EXCLUDED.body, version = documents.version + 1, updated_at = now()
            RETURNING version
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .fetch_optional(executor)
        .await
        .map_err(backend_err)?,
    };

    version.map(|v| v as u64).ok_or_else(|| match expect {
        Expect::Absent => CoreError::Conflict(format!("document {collection}/{id} already exists")),
        Expect::Version(v) => CoreError::Conflict(format!(
            "document {collection}/{id} is not at version {v}"
        )),
        Expect::Any => CoreError::Internal(format!("upsert of {collection}/{id} returned nothing")),
    })
}

async fn exec_delete<'e, E>(
    executor: E,
    collection: &str,
    id: &str,
    expect: Expect,
) -> Result<(), CoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = match expect {
        Expect::Version(expected) => {
            sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2 AND version = $3")
                .bind(collection)
                .bind(id)
                .bind(expected as i64)
                .execute(executor)
                .await
                .map_err(backend_err)?
        }
        Expect::Any | Expect::Absent => {
            sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .execute(executor)
                .await
                .map_err(backend_err)?
        }
    };

    if matches!(expect, Expect::Version(_)) && result.rows_affected() == 0 {
        return Err(CoreError::Conflict(format!(
            "document {collection}/{id} was not at the expected version"
        )));
    }
    Ok(())
}

impl MetadataStore for PgDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, CoreError> {
        let row = sqlx::query(
            "SELECT id, body, version, updated_at FROM documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(row.map(|row| Document {
            id: row.get("id"),
            body: row.get("body"),
            version: row.get::<i64, _>("version") as u64,
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        }))
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
        expect: Expect,
    ) -> Result<u64, CoreError> {
        exec_put(&self.pool, collection, id, &body, expect).await
    }

    async fn delete(&self, collection: &str, id: &str, expect: Expect) -> Result<(), CoreError> {
        exec_delete(&self.pool, collection, id, expect).await
    }

    async fn query(
        &self,
        collection: &str,
        filter: QueryFilter,
        limit: usize,
    ) -> Result<Vec<Document>, CoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, body, version, updated_at FROM documents WHERE collection = ",
        );
        qb.push_bind(collection.to_string());

        for (field, value) in &filter.equals {
            let mut containment = serde_json::Map::new();
            containment.insert(field.clone(), value.clone());
            qb.push(" AND body @> ");
            qb.push_bind(serde_json::Value::Object(containment));
        }
        if let Some(bound) = filter.created_after {
            qb.push(" AND (body->>'created_at')::timestamptz >= ");
            qb.push_bind(bound);
        }
        if let Some(bound) = filter.created_before {
            qb.push(" AND (body->>'created_at')::timestamptz < ");
            qb.push_bind(bound);
        }
        if let Some((after_ts, after_id)) = &filter.after {
            qb.push(" AND ((body->>'created_at')::timestamptz, id) ");
            qb.push(match filter.order {
                Order::Asc => "> (",
                Order::Desc => "< (",
            });
            qb.push_bind(*after_ts);
            qb.push(", ");
            qb.push_bind(after_id.clone());
            qb.push(")");
        }
        qb.push(match filter.order {
            Order::Asc => " ORDER BY (body->>'created_at')::timestamptz ASC, id ASC",
            Order::Desc => " ORDER BY (body->>'created_at')::timestamptz DESC, id DESC",
        });
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(backend_err)?;
        Ok(rows
            .into_iter()
            .map(|row| Document {
                id: row.get("id"),
                body: row.get("body"),
                version: row.get::<i64, _>("version") as u64,
                updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            })
            .collect())
    }

    async fn transaction(&self, ops: Vec<TxOp>) -> Result<(), CoreError> {
        if ops.len() > MAX_TRANSACTION_OPS {
            return Err(CoreError::InvalidRequest(format!(
                "transaction exceeds {MAX_TRANSACTION_OPS} operations"
            )));
        }

        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        for op in &ops {
            match op {
                TxOp::Put {
                    collection,
                    id,
                    body,
                    expect,
                } => {
                    exec_put(&mut *tx, collection, id, body, *expect).await?;
                }
                TxOp::Delete {
                    collection,
                    id,
                    expect,
                } => {
                    exec_delete(&mut *tx, collection, id, *expect).await?;
                }
            }
        }
        tx.commit().await.map_err(backend_err)?;
        Ok(())
    }
}
