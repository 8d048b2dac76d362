//! PostgreSQL-backed tuple store
//!
//! Tuples live in a single `rebac_tuples` table with:
//! - Tenant isolation: every statement is scoped by `organization_id`
//! - A unique key over the full triple, so duplicate writes are no-ops
//! - Indexes for object-side (check) and subject-side (list) lookups
//! - Transactional batches with guard evaluation before commit

use crate::{
    error::{RebacError, Result},
    models::*,
    store::{ensure_consistent, TupleStore},
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT subject_type, subject_id, subject_relation, \
                                     relation_name, object_type, object_id \
                              FROM rebac_tuples WHERE organization_id = ";

/// PostgreSQL-backed tuple store for one organization
#[derive(Clone)]
pub struct PostgresTupleStore {
    pool: PgPool,
    organization_id: Uuid,
}

impl PostgresTupleStore {
    pub fn new(pool: PgPool, organization_id: Uuid) -> Self {
        Self {
            pool,
            organization_id,
        }
    }

    /// Connect with a connection string. `acquire_timeout` bounds how long a
    /// call waits for a connection before failing with `StoreUnavailable`.
    pub async fn connect(
        connection_string: &str,
        organization_id: Uuid,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(acquire_timeout)
            .connect(connection_string)
            .await
            .map_err(|e| RebacError::StoreUnavailable(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool, organization_id))
    }

    /// Run the bundled migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RebacError::StoreUnavailable(format!("Migration failed: {}", e)))?;
        info!("Tuple store migrations applied");
        Ok(())
    }

    pub fn organization_id(&self) -> Uuid {
        self.organization_id
    }

    fn push_filter(&self, builder: &mut QueryBuilder<'_, Postgres>, filter: &TupleFilter) {
        builder.push_bind(self.organization_id);

        if let Some(ref s) = filter.subject {
            builder
                .push(" AND subject_type = ")
                .push_bind(s.entity.entity_type.as_str())
                .push(" AND subject_id = ")
                .push_bind(s.entity.id.clone())
                .push(" AND subject_relation = ")
                .push_bind(subject_relation(s));
        }

        if let Some(ref e) = filter.subject_entity {
            builder
                .push(" AND subject_type = ")
                .push_bind(e.entity_type.as_str())
                .push(" AND subject_id = ")
                .push_bind(e.id.clone());
        }

        if let Some(r) = filter.relation {
            builder.push(" AND relation_name = ").push_bind(r.as_str());
        }

        if let Some(ref o) = filter.object {
            builder
                .push(" AND object_type = ")
                .push_bind(o.entity_type.as_str())
                .push(" AND object_id = ")
                .push_bind(o.id.clone());
        }

        if let Some(t) = filter.object_type {
            builder.push(" AND object_type = ").push_bind(t.as_str());
        }
    }

    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tuple: &Tuple) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rebac_tuples (
                organization_id,
                subject_type, subject_id, subject_relation,
                relation_name,
                object_type, object_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT ON CONSTRAINT rebac_tuples_unique DO NOTHING
            "#,
        )
        .bind(self.organization_id)
        .bind(tuple.subject.entity.entity_type.as_str())
        .bind(&tuple.subject.entity.id)
        .bind(subject_relation(&tuple.subject))
        .bind(tuple.relation.as_str())
        .bind(tuple.object.entity_type.as_str())
        .bind(&tuple.object.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("Failed to write tuple", e))?;
        Ok(())
    }

    async fn remove(&self, tx: &mut Transaction<'_, Postgres>, tuple: &Tuple) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM rebac_tuples
            WHERE organization_id = $1
              AND subject_type = $2
              AND subject_id = $3
              AND subject_relation = $4
              AND relation_name = $5
              AND object_type = $6
              AND object_id = $7
            "#,
        )
        .bind(self.organization_id)
        .bind(tuple.subject.entity.entity_type.as_str())
        .bind(&tuple.subject.entity.id)
        .bind(subject_relation(&tuple.subject))
        .bind(tuple.relation.as_str())
        .bind(tuple.object.entity_type.as_str())
        .bind(&tuple.object.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("Failed to delete tuple", e))?;
        Ok(())
    }

    async fn guard_holds(&self, tx: &mut Transaction<'_, Postgres>, filter: &TupleFilter) -> Result<bool> {
        let mut builder = QueryBuilder::new("SELECT EXISTS(SELECT 1 FROM rebac_tuples WHERE organization_id = ");
        self.push_filter(&mut builder, filter);
        builder.push(")");

        builder
            .build_query_scalar::<bool>()
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("Failed to evaluate guard", e))
    }
}

#[async_trait]
impl TupleStore for PostgresTupleStore {
    async fn apply(&self, change_set: ChangeSet) -> Result<()> {
        ensure_consistent(&change_set)?;
        if change_set.is_empty() {
            return Ok(());
        }
        debug!(
            "Batch write: {} writes, {} deletes, {} guards",
            change_set.writes.len(),
            change_set.deletes.len(),
            change_set.guards.len()
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("Failed to start transaction", e))?;

        // Guards read what the batch leaves behind; serializable isolation
        // keeps two concurrent guarded batches from both passing.
        if !change_set.guards.is_empty() {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("Failed to set isolation level", e))?;
        }

        for tuple in &change_set.deletes {
            self.remove(&mut tx, tuple).await?;
        }
        for tuple in &change_set.writes {
            self.insert(&mut tx, tuple).await?;
        }

        for guard in &change_set.guards {
            let Guard::RequireAny { filter, reason } = guard;
            if !self.guard_holds(&mut tx, filter).await? {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("Failed to roll back", e))?;
                return Err(RebacError::Conflict(reason.clone()));
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("Failed to commit transaction", e))?;

        info!("Batch write committed");
        Ok(())
    }

    async fn read(&self, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        debug!("Reading tuples: {:?}", filter);

        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        self.push_filter(&mut builder, filter);
        builder.push(" ORDER BY id");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("Failed to read tuples", e))?;

        let tuples: Vec<Tuple> = rows
            .iter()
            .filter_map(|row| match decode_row(row) {
                Ok(tuple) => Some(tuple),
                Err(e) => {
                    warn!("Skipping malformed tuple row: {}", e);
                    None
                }
            })
            .collect();

        debug!("Found {} tuples", tuples.len());
        Ok(tuples)
    }

    async fn exists(&self, tuple: &Tuple) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM rebac_tuples
                WHERE organization_id = $1
                  AND subject_type = $2
                  AND subject_id = $3
                  AND subject_relation = $4
                  AND relation_name = $5
                  AND object_type = $6
                  AND object_id = $7
            )
            "#,
        )
        .bind(self.organization_id)
        .bind(tuple.subject.entity.entity_type.as_str())
        .bind(&tuple.subject.entity.id)
        .bind(subject_relation(&tuple.subject))
        .bind(tuple.relation.as_str())
        .bind(tuple.object.entity_type.as_str())
        .bind(&tuple.object.id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("Failed to check tuple existence", e))
    }
}

/// Absent userset relations are stored as '' so the unique key covers them
fn subject_relation(subject: &SubjectRef) -> &'static str {
    subject.relation.map(|r| r.as_str()).unwrap_or("")
}

fn decode_row(row: &PgRow) -> std::result::Result<Tuple, RebacError> {
    let get = |column: &str| -> std::result::Result<String, RebacError> {
        row.try_get::<String, _>(column)
            .map_err(|e| RebacError::InvalidTuple(format!("{}: {}", column, e)))
    };

    let subject_entity = EntityRef::new(get("subject_type")?.parse()?, get("subject_id")?);
    let subject_relation = get("subject_relation")?;
    let subject = if subject_relation.is_empty() {
        SubjectRef::entity(subject_entity)
    } else {
        SubjectRef::userset(subject_entity, subject_relation.parse()?)
    };

    Ok(Tuple {
        subject,
        relation: get("relation_name")?.parse()?,
        object: EntityRef::new(get("object_type")?.parse()?, get("object_id")?),
    })
}

fn map_sqlx_error(context: &str, error: sqlx::Error) -> RebacError {
    if let sqlx::Error::Database(ref db) = error {
        // unique_violation, serialization_failure, deadlock_detected
        if matches!(db.code().as_deref(), Some("23505") | Some("40001") | Some("40P01")) {
            return RebacError::Conflict(format!("{}: {}", context, error));
        }
    }
    RebacError::StoreUnavailable(format!("{}: {}", context, error))
}
