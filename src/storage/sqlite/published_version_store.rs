//! SQLite PublishedVersionStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::interfaces::aggregate_store::Result;
use crate::interfaces::{PublishedVersionStore, StorageError};
use crate::storage::schema::{PublishedVersions, CREATE_PUBLISHED_VERSIONS_TABLE};

/// SQLite implementation of PublishedVersionStore.
pub struct SqlitePublishedVersionStore {
    pool: SqlitePool,
}

impl SqlitePublishedVersionStore {
    /// Create a new SQLite published version store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file and its schema.
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Create the published versions table if it does not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_PUBLISHED_VERSIONS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PublishedVersionStore for SqlitePublishedVersionStore {
    async fn get(
        &self,
        processor_name: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<u64> {
        let query = Query::select()
            .column(PublishedVersions::Version)
            .from(PublishedVersions::Table)
            .and_where(Expr::col(PublishedVersions::ProcessorName).eq(processor_name))
            .and_where(Expr::col(PublishedVersions::AggregateType).eq(aggregate_type))
            .and_where(Expr::col(PublishedVersions::AggregateId).eq(aggregate_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version")?;
                Ok(version as u64)
            }
            None => Ok(0),
        }
    }

    async fn update(
        &self,
        processor_name: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        version: u64,
    ) -> Result<()> {
        let updated_at = chrono::Utc::now().to_rfc3339();
        let version = version as i64;

        // The conflict guard keeps the cursor monotonic under concurrent writers.
        let query = Query::insert()
            .into_table(PublishedVersions::Table)
            .columns([
                PublishedVersions::ProcessorName,
                PublishedVersions::AggregateType,
                PublishedVersions::AggregateId,
                PublishedVersions::Version,
                PublishedVersions::UpdatedAt,
            ])
            .values_panic([
                processor_name.into(),
                aggregate_type.into(),
                aggregate_id.into(),
                version.into(),
                updated_at.into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    PublishedVersions::ProcessorName,
                    PublishedVersions::AggregateType,
                    PublishedVersions::AggregateId,
                ])
                .update_columns([PublishedVersions::Version, PublishedVersions::UpdatedAt])
                .action_and_where(
                    Expr::col((PublishedVersions::Table, PublishedVersions::Version)).lt(version),
                )
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;

        Ok(())
    }
}
