//! The `repositories` table: store trait, Postgres implementation, in-memory double.

use std::collections::HashSet;

use async_trait::async_trait;
use mosaic_core::{PersistedRepositoryRow, RowChanges, RowKey};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store rejected statement: {0}")]
    Rejected(String),
}

/// Parametrized-query capability over the `repositories` table.
///
/// Each method issues at most one statement.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Delete every row whose `github_id` is not in `keep_ids`.
    ///
    /// An empty `keep_ids` matches every row. Callers that must not wipe the
    /// table skip the call instead of passing an empty slice.
    async fn delete_missing(&self, keep_ids: &[String]) -> Result<u64, StoreError>;

    /// Ids of rows that [`RepositoryStore::delete_missing`] would remove. Read-only.
    async fn stale_ids(&self, keep_ids: &[String]) -> Result<Vec<String>, StoreError>;

    async fn find_by_key(&self, key: &RowKey) -> Result<Option<PersistedRepositoryRow>, StoreError>;

    /// Insert a row. A row already holding the same `github_id` under an older
    /// composite key (renamed or transferred repository) is replaced.
    async fn insert(&self, row: &PersistedRepositoryRow) -> Result<(), StoreError>;

    /// Single UPDATE touching only the columns present in `changes`.
    async fn update_fields(&self, key: &RowKey, changes: &RowChanges) -> Result<u64, StoreError>;

    async fn list(&self) -> Result<Vec<PersistedRepositoryRow>, StoreError>;

    async fn get(&self, github_id: &str) -> Result<Option<PersistedRepositoryRow>, StoreError>;
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgRepositoryStore {
    pool: PgPool,
}

impl PgRepositoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_from_pg(row: &PgRow) -> Result<PersistedRepositoryRow, sqlx::Error> {
    Ok(PersistedRepositoryRow {
        github_id: row.try_get("github_id")?,
        name_with_owner: row.try_get("name_with_owner")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        config: row.try_get("config")?,
    })
}

#[async_trait]
impl RepositoryStore for PgRepositoryStore {
    async fn delete_missing(&self, keep_ids: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM repositories
             WHERE NOT (github_id = ANY($1))
            "#,
        )
        .bind(keep_ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stale_ids(&self, keep_ids: &[String]) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT github_id
              FROM repositories
             WHERE NOT (github_id = ANY($1))
             ORDER BY github_id
            "#,
        )
        .bind(keep_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_by_key(
        &self,
        key: &RowKey,
    ) -> Result<Option<PersistedRepositoryRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT github_id, name_with_owner, name, url, description, config
              FROM repositories
             WHERE name_with_owner = $1
               AND github_id = $2
               AND url = $3
            "#,
        )
        .bind(&key.name_with_owner)
        .bind(&key.github_id)
        .bind(&key.url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_from_pg).transpose()?)
    }

    async fn insert(&self, row: &PersistedRepositoryRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO repositories (github_id, name_with_owner, name, url, description, config)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (github_id) DO UPDATE
               SET name_with_owner = EXCLUDED.name_with_owner,
                   name = EXCLUDED.name,
                   url = EXCLUDED.url,
                   description = EXCLUDED.description,
                   config = EXCLUDED.config
            "#,
        )
        .bind(&row.github_id)
        .bind(&row.name_with_owner)
        .bind(&row.name)
        .bind(&row.url)
        .bind(&row.description)
        .bind(&row.config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_fields(&self, key: &RowKey, changes: &RowChanges) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE repositories SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(description) = &changes.description {
                set.push("description = ");
                set.push_bind_unseparated(description.clone());
            }
            if let Some(config) = &changes.config {
                set.push("config = ");
                set.push_bind_unseparated(config.clone());
            }
        }
        qb.push(" WHERE name_with_owner = ")
            .push_bind(key.name_with_owner.clone())
            .push(" AND github_id = ")
            .push_bind(key.github_id.clone())
            .push(" AND url = ")
            .push_bind(key.url.clone());

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list(&self) -> Result<Vec<PersistedRepositoryRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT github_id, name_with_owner, name, url, description, config
              FROM repositories
             ORDER BY name_with_owner
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let out = rows.iter().map(row_from_pg).collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }

    async fn get(&self, github_id: &str) -> Result<Option<PersistedRepositoryRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT github_id, name_with_owner, name, url, description, config
              FROM repositories
             WHERE github_id = $1
            "#,
        )
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_from_pg).transpose()?)
    }
}

/// Write statement executed against a [`MemoryRepositoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatement {
    Delete { kept: usize, removed: u64 },
    Insert { github_id: String },
    Update { github_id: String, changes: RowChanges },
}

/// In-process store with the same semantics as the Postgres table.
///
/// Records every successful write so callers can count statements. With the
/// `testing` feature, writes can be made to fail per repository and the
/// stale-row delete can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryRepositoryStore {
    rows: Mutex<Vec<PersistedRepositoryRow>>,
    statements: Mutex<Vec<StoreStatement>>,
    failing_writes: HashSet<String>,
    failing_delete: bool,
}

impl MemoryRepositoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = PersistedRepositoryRow>) -> Self {
        Self {
            rows: Mutex::new(rows.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Inserts and updates for `name_with_owner` fail.
    #[cfg(any(test, feature = "testing"))]
    pub fn failing_writes_for(mut self, name_with_owner: impl Into<String>) -> Self {
        self.failing_writes.insert(name_with_owner.into());
        self
    }

    /// The stale-row delete fails.
    #[cfg(any(test, feature = "testing"))]
    pub fn failing_delete(mut self) -> Self {
        self.failing_delete = true;
        self
    }

    pub async fn rows(&self) -> Vec<PersistedRepositoryRow> {
        let mut rows = self.rows.lock().await.clone();
        rows.sort_by(|a, b| a.name_with_owner.cmp(&b.name_with_owner));
        rows
    }

    pub async fn statements(&self) -> Vec<StoreStatement> {
        self.statements.lock().await.clone()
    }

    pub async fn clear_statements(&self) {
        self.statements.lock().await.clear();
    }

    fn check_write(&self, name_with_owner: &str) -> Result<(), StoreError> {
        if self.failing_writes.contains(name_with_owner) {
            return Err(StoreError::Rejected(format!("write for {name_with_owner}")));
        }
        Ok(())
    }

    async fn record(&self, statement: StoreStatement) {
        self.statements.lock().await.push(statement);
    }
}

#[async_trait]
impl RepositoryStore for MemoryRepositoryStore {
    async fn delete_missing(&self, keep_ids: &[String]) -> Result<u64, StoreError> {
        if self.failing_delete {
            return Err(StoreError::Rejected("delete of stale rows".to_string()));
        }
        let keep: HashSet<&str> = keep_ids.iter().map(String::as_str).collect();
        let removed = {
            let mut rows = self.rows.lock().await;
            let before = rows.len();
            rows.retain(|row| keep.contains(row.github_id.as_str()));
            (before - rows.len()) as u64
        };
        self.record(StoreStatement::Delete {
            kept: keep_ids.len(),
            removed,
        })
        .await;
        Ok(removed)
    }

    async fn stale_ids(&self, keep_ids: &[String]) -> Result<Vec<String>, StoreError> {
        let keep: HashSet<&str> = keep_ids.iter().map(String::as_str).collect();
        let rows = self.rows.lock().await;
        let mut ids = rows
            .iter()
            .filter(|row| !keep.contains(row.github_id.as_str()))
            .map(|row| row.github_id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    async fn find_by_key(
        &self,
        key: &RowKey,
    ) -> Result<Option<PersistedRepositoryRow>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|row| row.matches_key(key)).cloned())
    }

    async fn insert(&self, row: &PersistedRepositoryRow) -> Result<(), StoreError> {
        self.check_write(&row.name_with_owner)?;
        {
            let mut rows = self.rows.lock().await;
            rows.retain(|existing| existing.github_id != row.github_id);
            rows.push(row.clone());
        }
        self.record(StoreStatement::Insert {
            github_id: row.github_id.clone(),
        })
        .await;
        Ok(())
    }

    async fn update_fields(&self, key: &RowKey, changes: &RowChanges) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.check_write(&key.name_with_owner)?;
        let affected = {
            let mut rows = self.rows.lock().await;
            let mut affected = 0u64;
            for row in rows.iter_mut().filter(|row| row.matches_key(key)) {
                row.apply(changes);
                affected += 1;
            }
            affected
        };
        self.record(StoreStatement::Update {
            github_id: key.github_id.clone(),
            changes: changes.clone(),
        })
        .await;
        Ok(affected)
    }

    async fn list(&self) -> Result<Vec<PersistedRepositoryRow>, StoreError> {
        Ok(self.rows().await)
    }

    async fn get(&self, github_id: &str) -> Result<Option<PersistedRepositoryRow>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|row| row.github_id == github_id).cloned())
    }
}
