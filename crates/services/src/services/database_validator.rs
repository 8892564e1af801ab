//! Startup checks that the remote store carries the schema the stores rely on

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DatabaseValidationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Inspects `sqlite_master` and the sqlx migration ledger
pub struct DatabaseValidator {
    pool: SqlitePool,
}

impl DatabaseValidator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn validate(
        &self,
        required_tables: &[&str],
    ) -> Result<ValidationResult, DatabaseValidationError> {
        let migrations_applied = if self.table_exists("_sqlx_migrations").await? {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
                .fetch_one(&self.pool)
                .await?
        } else {
            warn!("Remote store has no migration ledger");
            0
        };

        let missing_tables = self.validate_tables(required_tables).await?;
        for table in &missing_tables {
            warn!(table = %table, "Remote store is missing a required table");
        }

        info!(
            migrations_applied = migrations_applied,
            missing_tables = missing_tables.len(),
            "Remote store validation complete"
        );

        Ok(ValidationResult {
            migrations_applied: migrations_applied as usize,
            missing_tables,
        })
    }

    /// Names from `required_tables` that do not exist
    pub async fn validate_tables(
        &self,
        required_tables: &[&str],
    ) -> Result<Vec<String>, DatabaseValidationError> {
        let mut missing_tables = Vec::new();
        for table in required_tables {
            if !self.table_exists(table).await? {
                missing_tables.push(table.to_string());
            }
        }
        Ok(missing_tables)
    }

    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub migrations_applied: usize,
    pub missing_tables: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.migrations_applied > 0 && self.missing_tables.is_empty()
    }

    pub fn summary(&self) -> String {
        if !self.missing_tables.is_empty() {
            format!(
                "Remote store missing tables: {}",
                self.missing_tables.join(", ")
            )
        } else if self.migrations_applied == 0 {
            "Remote store has no applied migrations".to_string()
        } else {
            format!(
                "Remote store OK - {} migrations applied",
                self.migrations_applied
            )
        }
    }
}
