//! Diff the resolved set against the `repositories` table and apply the result.

use std::collections::BTreeSet;

use mosaic_core::{PersistedRepositoryRow, ResolvedRepository, RowChanges};
use mosaic_storage::{RepositoryStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("looking up stale repositories failed: {0}")]
    StaleLookup(#[source] StoreError),
    #[error("deleting stale repositories failed: {0}")]
    StaleDelete(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryFailure {
    pub name_with_owner: String,
    pub github_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub deleted: u64,
    pub delete_skipped: bool,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failures: Vec<RepositoryFailure>,
}

impl ReconcileReport {
    pub fn writes(&self) -> usize {
        self.deleted as usize + self.inserted + self.updated
    }
}

/// Bring the store in line with `resolved`.
///
/// Stale rows go first in a single delete, issued only when the store holds
/// rows outside `resolved` and skipped entirely when `resolved` is empty. A
/// failed stale lookup or delete aborts before any row is touched. After that each
/// repository is handled on its own and failures are only recorded.
pub async fn reconcile(
    store: &dyn RepositoryStore,
    resolved: &[ResolvedRepository],
) -> Result<ReconcileReport, ReconcileError> {
    let mut report = ReconcileReport::default();

    let keep_ids = resolved
        .iter()
        .map(|r| r.id().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    if keep_ids.is_empty() {
        warn!("resolved set is empty; skipping stale repository delete");
        report.delete_skipped = true;
    } else {
        let stale = store
            .stale_ids(&keep_ids)
            .await
            .map_err(ReconcileError::StaleLookup)?;
        if stale.is_empty() {
            debug!(kept = keep_ids.len(), "no stale repositories");
        } else {
            report.deleted = store
                .delete_missing(&keep_ids)
                .await
                .map_err(ReconcileError::StaleDelete)?;
            info!(
                kept = keep_ids.len(),
                stale = ?stale,
                deleted = report.deleted,
                "deleted stale repositories"
            );
        }
    }

    for repo in resolved {
        match reconcile_one(store, repo).await {
            Ok(RowOutcome::Inserted) => report.inserted += 1,
            Ok(RowOutcome::Updated) => report.updated += 1,
            Ok(RowOutcome::Unchanged) => report.unchanged += 1,
            Err(err) => {
                error!(
                    repository = %repo.name_with_owner(),
                    github_id = %repo.id(),
                    error = %err,
                    "reconciling repository failed"
                );
                report.failures.push(RepositoryFailure {
                    name_with_owner: repo.name_with_owner().to_string(),
                    github_id: repo.id().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failures.len(),
        "reconciled repositories"
    );
    Ok(report)
}

async fn reconcile_one(
    store: &dyn RepositoryStore,
    repo: &ResolvedRepository,
) -> Result<RowOutcome, StoreError> {
    let key = repo.key();
    match store.find_by_key(&key).await? {
        Some(existing) => {
            let changes = RowChanges::between(&existing, repo);
            if changes.is_empty() {
                debug!(repository = %repo.name_with_owner(), "unchanged");
                return Ok(RowOutcome::Unchanged);
            }
            store.update_fields(&key, &changes).await?;
            debug!(
                repository = %repo.name_with_owner(),
                description = changes.description.is_some(),
                config = changes.config.is_some(),
                "updated"
            );
            Ok(RowOutcome::Updated)
        }
        None => {
            store.insert(&PersistedRepositoryRow::from(repo)).await?;
            debug!(repository = %repo.name_with_owner(), "inserted");
            Ok(RowOutcome::Inserted)
        }
    }
}
