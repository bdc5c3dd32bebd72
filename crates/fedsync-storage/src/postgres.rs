//! Postgres backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedsync_core::{
    EntityKeys, ErrorDetail, Lifecycle, LocalEntity, RunCompletion, SourceFields, SyncRun,
    SyncType,
};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    EntityStore, EntityTx, SeenKeys, SourceUpdate, StoreError, SyncRunQuery, SyncRunStore,
};

const RUN_COLUMNS: &str = "id, sync_type, mode, status, started_at, completed_at, \
     records_processed, error_count, error_detail, watermark, updated_at";

const ENTITY_COLUMNS: &str = "id, key_primary, key_secondary, source_fields, curated_fields, \
     is_active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(Duration::from_secs(idle));
        }
        let pool = opts.connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn table_for(sync_type: SyncType) -> &'static str {
    match sync_type {
        SyncType::Opportunities => "opportunities",
        SyncType::Awards => "awards",
        SyncType::Organizations => "organizations",
    }
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("counter {value} out of range")))
}

fn to_u64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative counter {value}")))
}

fn entity_from_row(sync_type: SyncType, row: &PgRow) -> Result<LocalEntity, StoreError> {
    let source: Value = row.try_get("source_fields")?;
    let fields = SourceFields::from_json(sync_type, source)
        .map_err(|err| StoreError::Corrupt(format!("{sync_type} source_fields: {err}")))?;
    let curated = match row.try_get::<Value, _>("curated_fields")? {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(StoreError::Corrupt(format!(
                "{sync_type} curated_fields is not an object: {other}"
            )))
        }
    };
    let key_primary: Option<String> = row.try_get("key_primary")?;
    let key_secondary: Option<String> = row.try_get("key_secondary")?;
    let is_active: bool = row.try_get("is_active")?;
    Ok(LocalEntity {
        id: row.try_get("id")?,
        sync_type,
        keys: EntityKeys::new(key_primary.as_deref(), key_secondary.as_deref()),
        fields,
        curated,
        lifecycle: if is_active {
            Lifecycle::Active
        } else {
            Lifecycle::Inactive
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<SyncRun, StoreError> {
    let sync_type: String = row.try_get("sync_type")?;
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let detail: Option<Value> = row.try_get("error_detail")?;
    let error_detail = detail
        .map(serde_json::from_value::<ErrorDetail>)
        .transpose()
        .map_err(|err| StoreError::Corrupt(format!("error_detail: {err}")))?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        sync_type: sync_type
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("{err}")))?,
        mode: mode.parse().map_err(|err| StoreError::Corrupt(format!("{err}")))?,
        status: status
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("{err}")))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        records_processed: to_u64(row.try_get("records_processed")?)?,
        error_count: to_u64(row.try_get("error_count")?)?,
        error_detail,
        watermark: row.try_get("watermark")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn detail_json(detail: Option<&ErrorDetail>) -> Result<Option<Value>, StoreError> {
    detail
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| StoreError::Corrupt(format!("error_detail: {err}")))
}

pub struct PgEntityTx {
    tx: Transaction<'static, Postgres>,
}

impl PgEntityTx {
    async fn find_by(
        &mut self,
        sync_type: SyncType,
        column: &str,
        key: &str,
    ) -> Result<Vec<LocalEntity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM {} WHERE {column} = $1 FOR UPDATE",
            table_for(sync_type)
        );
        let rows = sqlx::query(&sql).bind(key).fetch_all(&mut *self.tx).await?;
        rows.iter()
            .map(|row| entity_from_row(sync_type, row))
            .collect()
    }
}

#[async_trait]
impl EntityTx for PgEntityTx {
    async fn find_by_primary_key(
        &mut self,
        sync_type: SyncType,
        key: &str,
    ) -> Result<Vec<LocalEntity>, StoreError> {
        self.find_by(sync_type, "key_primary", key).await
    }

    async fn find_by_secondary_key(
        &mut self,
        sync_type: SyncType,
        key: &str,
    ) -> Result<Vec<LocalEntity>, StoreError> {
        self.find_by(sync_type, "key_secondary", key).await
    }

    async fn insert(&mut self, entity: &LocalEntity) -> Result<(), StoreError> {
        let source = entity
            .fields
            .to_json()
            .map_err(|err| StoreError::Corrupt(format!("source_fields: {err}")))?;
        let sql = format!(
            "INSERT INTO {} ({ENTITY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            table_for(entity.sync_type)
        );
        sqlx::query(&sql)
            .bind(entity.id)
            .bind(entity.keys.primary.as_deref())
            .bind(entity.keys.secondary.as_deref())
            .bind(source)
            .bind(Value::Object(entity.curated.clone()))
            .bind(entity.lifecycle.is_active())
            .bind(entity.created_at)
            .bind(entity.updated_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_source(
        &mut self,
        sync_type: SyncType,
        update: &SourceUpdate,
    ) -> Result<(), StoreError> {
        let source = update
            .fields
            .to_json()
            .map_err(|err| StoreError::Corrupt(format!("source_fields: {err}")))?;
        let sql = format!(
            r#"
            UPDATE {}
               SET key_primary = $2,
                   key_secondary = $3,
                   source_fields = $4,
                   is_active = $5,
                   updated_at = $6
             WHERE id = $1
            "#,
            table_for(sync_type)
        );
        let result = sqlx::query(&sql)
            .bind(update.id)
            .bind(update.keys.primary.as_deref())
            .bind(update.keys.secondary.as_deref())
            .bind(source)
            .bind(update.lifecycle.is_active())
            .bind(update.updated_at)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "entity",
                id: update.id.to_string(),
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn EntityTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgEntityTx { tx }))
    }

    async fn get(&self, sync_type: SyncType, id: Uuid) -> Result<Option<LocalEntity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM {} WHERE id = $1",
            table_for(sync_type)
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref()
            .map(|row| entity_from_row(sync_type, row))
            .transpose()
    }

    async fn deactivate_missing(
        &self,
        sync_type: SyncType,
        seen: &SeenKeys,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let primary: Vec<String> = seen.primary.iter().cloned().collect();
        let secondary: Vec<String> = seen.secondary.iter().cloned().collect();
        let sql = format!(
            r#"
            UPDATE {}
               SET is_active = FALSE,
                   updated_at = $3
             WHERE is_active
               AND NOT (CASE
                          WHEN key_primary IS NOT NULL THEN key_primary = ANY($1)
                          ELSE COALESCE(key_secondary = ANY($2), FALSE)
                        END)
            "#,
            table_for(sync_type)
        );
        let result = sqlx::query(&sql)
            .bind(primary)
            .bind(secondary)
            .bind(now)
            .execute(&self.pool)
            .await?;
        debug!(%sync_type, rows = result.rows_affected(), "soft-delete pass");
        Ok(result.rows_affected())
    }

    async fn count(
        &self,
        sync_type: SyncType,
        lifecycle: Option<Lifecycle>,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE ($1::BOOLEAN IS NULL OR is_active = $1)",
            table_for(sync_type)
        );
        let row = sqlx::query(&sql)
            .bind(lifecycle.map(Lifecycle::is_active))
            .fetch_one(&self.pool)
            .await?;
        to_u64(row.try_get("n")?)
    }
}

#[async_trait]
impl SyncRunStore for PgStore {
    async fn insert_running(&self, run: &SyncRun) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_logs
                (id, sync_type, mode, status, started_at, records_processed,
                 error_count, watermark, created_at, updated_at)
            VALUES ($1, $2, $3, 'RUNNING', $4, 0, 0, $5, $4, $4)
            "#,
        )
        .bind(run.id)
        .bind(run.sync_type.as_str())
        .bind(run.mode.as_str())
        .bind(run.started_at)
        .bind(run.watermark)
        .execute(&self.pool)
        .await;
        match inserted {
            Ok(_) => Ok(true),
            Err(err) => match StoreError::from(err) {
                StoreError::UniqueViolation(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn add_progress(
        &self,
        id: Uuid,
        processed_delta: u64,
        error_delta: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_logs
               SET records_processed = records_processed + $2,
                   error_count = error_count + $3,
                   updated_at = $4
             WHERE id = $1
               AND status = 'RUNNING'
            "#,
        )
        .bind(id)
        .bind(to_i64(processed_delta)?)
        .bind(to_i64(error_delta)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        completion: &RunCompletion,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        let sql = format!(
            r#"
            UPDATE sync_logs
               SET status = $2,
                   completed_at = $3,
                   records_processed = GREATEST(records_processed, $4),
                   error_count = GREATEST(error_count, $5),
                   error_detail = $6,
                   updated_at = $3
             WHERE id = $1
               AND status IN ('PENDING', 'RUNNING')
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(completion.status.as_str())
            .bind(now)
            .bind(to_i64(completion.records_processed)?)
            .bind(to_i64(completion.error_count)?)
            .bind(detail_json(completion.error_detail.as_ref())?)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => match self.get_run(id).await? {
                Some(_) => Err(StoreError::AlreadyTerminal(id)),
                None => Err(StoreError::NotFound {
                    entity: "sync run",
                    id: id.to_string(),
                }),
            },
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM sync_logs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, query: &SyncRunQuery) -> Result<Vec<SyncRun>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {RUN_COLUMNS} FROM sync_logs WHERE TRUE"
        ));
        if let Some(sync_type) = query.sync_type {
            qb.push(" AND sync_type = ").push_bind(sync_type.as_str());
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(since) = query.since {
            qb.push(" AND started_at >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            qb.push(" AND started_at <= ").push_bind(until);
        }
        qb.push(" ORDER BY started_at DESC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(to_i64(limit as u64)?);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn fail_stale(
        &self,
        sync_type: SyncType,
        started_before: DateTime<Utc>,
        alive: &[Uuid],
        detail: &ErrorDetail,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncRun>, StoreError> {
        let sql = format!(
            r#"
            UPDATE sync_logs
               SET status = 'FAILED',
                   completed_at = $3,
                   error_detail = $4,
                   updated_at = $3
             WHERE sync_type = $1
               AND status = 'RUNNING'
               AND started_at < $2
               AND NOT (id = ANY($5))
            RETURNING {RUN_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(sync_type.as_str())
            .bind(started_before)
            .bind(now)
            .bind(detail_json(Some(detail))?)
            .bind(alive)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_sync_type_has_its_own_table() {
        let tables: Vec<_> = SyncType::ALL.iter().map(|t| table_for(*t)).collect();
        assert_eq!(tables, vec!["opportunities", "awards", "organizations"]);
    }

    #[test]
    fn counters_reject_out_of_range_values() {
        assert_eq!(to_i64(42).unwrap(), 42);
        assert!(to_i64(u64::MAX).is_err());
        assert!(to_u64(-1).is_err());
    }

    #[test]
    fn pool_defaults_are_sane() {
        let config = PoolConfig::default();
        assert!(config.max_connections >= config.min_connections);
    }
}
