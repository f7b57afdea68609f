//! Remote ignore list and the candidate exclusion predicate.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use mosaic_core::CandidateRepository;
use mosaic_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info};

use crate::AdapterContext;

const SOURCE_ID: &str = "ignore-list";

#[derive(Debug, Error)]
pub enum IgnoreListError {
    #[error("fetching ignore list: {0}")]
    Fetch(#[from] FetchError),
}

/// Set of `owner/name` or bare `name` entries to keep out of the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    entries: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    Fork,
    Private,
    Archived,
    IgnoredFullName,
    IgnoredBareName,
}

impl IgnoreList {
    /// One entry per line; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(ToString::to_string)
            .collect();
        Self { entries }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Why `repo` is kept out of the catalog, if it is.
    pub fn exclusion(&self, repo: &CandidateRepository) -> Option<ExclusionReason> {
        if repo.is_fork {
            Some(ExclusionReason::Fork)
        } else if repo.is_private {
            Some(ExclusionReason::Private)
        } else if repo.is_archived {
            Some(ExclusionReason::Archived)
        } else if self.contains(&repo.name_with_owner) {
            Some(ExclusionReason::IgnoredFullName)
        } else if self.contains(repo.bare_name()) {
            Some(ExclusionReason::IgnoredBareName)
        } else {
            None
        }
    }
}

pub fn apply_ignore_filter(
    candidates: Vec<CandidateRepository>,
    ignore: &IgnoreList,
) -> Vec<CandidateRepository> {
    let before = candidates.len();
    let kept = candidates
        .into_iter()
        .filter(|repo| match ignore.exclusion(repo) {
            Some(reason) => {
                debug!(repository = %repo.name_with_owner, ?reason, "excluding candidate");
                false
            }
            None => true,
        })
        .collect::<Vec<_>>();
    info!(
        candidates = before,
        kept = kept.len(),
        ignore_entries = ignore.len(),
        "applied ignore filter"
    );
    kept
}

#[async_trait]
pub trait IgnoreListSource: Send + Sync {
    async fn fetch_ignore_list(&self, ctx: &AdapterContext) -> Result<IgnoreList, IgnoreListError>;
}

pub struct RemoteIgnoreList {
    http: Arc<HttpFetcher>,
    url: String,
}

impl RemoteIgnoreList {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl IgnoreListSource for RemoteIgnoreList {
    async fn fetch_ignore_list(&self, ctx: &AdapterContext) -> Result<IgnoreList, IgnoreListError> {
        let resp = self.http.fetch_bytes(ctx.run_id, SOURCE_ID, &self.url).await?;
        Ok(IgnoreList::parse(&resp.text()))
    }
}
