//! Chunked config resolution against the mosaic config endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use mosaic_core::{CandidateRepository, ConfigPayload, ResolvedRepository};
use mosaic_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use crate::AdapterContext;

pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Header carrying the comma-joined `owner/name` list of one chunk.
pub const CONFIG_REPOSITORIES_HEADER: &str = "x-mosaic-repositories";

const SOURCE_ID: &str = "config-resolver";
const SUCCESS: &str = "success";

/// One element of the config endpoint's response array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigLookupEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub content: Option<JsonValue>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ConfigLookupEntry {
    pub fn is_success(&self) -> bool {
        self.kind == SUCCESS
    }
}

#[derive(Debug, Error)]
pub enum ConfigLookupError {
    #[error("config lookup request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("decoding config lookup response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ConfigLookup: Send + Sync {
    /// One request for the whole batch of `owner/name` identifiers.
    async fn lookup(
        &self,
        ctx: &AdapterContext,
        repositories: &[String],
    ) -> Result<Vec<ConfigLookupEntry>, ConfigLookupError>;
}

pub struct HttpConfigLookup {
    http: Arc<HttpFetcher>,
    url: String,
}

impl HttpConfigLookup {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ConfigLookup for HttpConfigLookup {
    async fn lookup(
        &self,
        ctx: &AdapterContext,
        repositories: &[String],
    ) -> Result<Vec<ConfigLookupEntry>, ConfigLookupError> {
        let joined = repositories.join(",");
        let resp = self
            .http
            .execute(ctx.run_id, SOURCE_ID, |client| {
                client
                    .get(&self.url)
                    .header(CONFIG_REPOSITORIES_HEADER, joined.as_str())
            })
            .await?;
        Ok(resp.json()?)
    }
}

/// Result of resolving one run's filtered candidates.
#[derive(Debug, Clone, Default)]
pub struct ResolveOutcome {
    pub resolved: Vec<ResolvedRepository>,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub non_success: usize,
    pub unmatched: usize,
}

pub struct ConfigResolver {
    lookup: Arc<dyn ConfigLookup>,
    chunk_size: usize,
}

impl ConfigResolver {
    pub fn new(lookup: Arc<dyn ConfigLookup>, chunk_size: usize) -> Self {
        Self {
            lookup,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Look up every chunk concurrently and merge successes onto their candidates.
    ///
    /// A failed chunk only removes its own repositories from the result.
    pub async fn resolve(
        &self,
        ctx: &AdapterContext,
        candidates: &[CandidateRepository],
    ) -> ResolveOutcome {
        let lookups = candidates
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| async move {
                let names = chunk
                    .iter()
                    .map(|c| c.name_with_owner.clone())
                    .collect::<Vec<_>>();
                (index, chunk, self.lookup.lookup(ctx, &names).await)
            });
        let results = join_all(lookups).await;

        let mut outcome = ResolveOutcome {
            chunks: results.len(),
            ..ResolveOutcome::default()
        };
        for (index, chunk, result) in results {
            match result {
                Ok(entries) => merge_chunk(index, chunk, entries, &mut outcome),
                Err(err) => {
                    warn!(
                        chunk = index,
                        repositories = chunk.len(),
                        error = %err,
                        "config lookup failed; chunk excluded from this run"
                    );
                    outcome.failed_chunks += 1;
                }
            }
        }

        info!(
            candidates = candidates.len(),
            resolved = outcome.resolved.len(),
            chunks = outcome.chunks,
            failed_chunks = outcome.failed_chunks,
            "resolved repository configs"
        );
        outcome
    }
}

fn merge_chunk(
    index: usize,
    chunk: &[CandidateRepository],
    entries: Vec<ConfigLookupEntry>,
    outcome: &mut ResolveOutcome,
) {
    let by_name: HashMap<&str, &CandidateRepository> = chunk
        .iter()
        .map(|c| (c.name_with_owner.as_str(), c))
        .collect();
    let mut merged: HashSet<&str> = HashSet::new();

    for entry in entries {
        let name = entry.repository.as_deref().unwrap_or_default();
        if !entry.is_success() {
            warn!(
                chunk = index,
                repository = name,
                kind = %entry.kind,
                message = entry.message.as_deref().unwrap_or_default(),
                "config unavailable; repository excluded from this run"
            );
            outcome.non_success += 1;
            continue;
        }

        let Some(candidate) = by_name.get(name) else {
            warn!(chunk = index, repository = name, "config returned for unknown repository");
            outcome.unmatched += 1;
            continue;
        };

        if !merged.insert(candidate.name_with_owner.as_str()) {
            warn!(chunk = index, repository = name, "duplicate config entry ignored");
            continue;
        }

        outcome.resolved.push(ResolvedRepository::new(
            (*candidate).clone(),
            entry.content.map(ConfigPayload::new),
        ));
    }
}
