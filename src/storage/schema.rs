//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Published versions table schema.
#[derive(Iden)]
pub enum PublishedVersions {
    Table,
    #[iden = "processor_name"]
    ProcessorName,
    #[iden = "aggregate_type"]
    AggregateType,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "version"]
    Version,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// SQL for creating the published versions table.
pub const CREATE_PUBLISHED_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS published_versions (
    processor_name TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (processor_name, aggregate_type, aggregate_id)
)
"#;
