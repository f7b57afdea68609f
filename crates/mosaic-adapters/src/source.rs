//! Candidate listing from the GitHub GraphQL API.

use std::sync::Arc;

use async_trait::async_trait;
use mosaic_core::CandidateRepository;
use mosaic_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::AdapterContext;

/// GitHub caps `first` on connections at 100.
pub const DEFAULT_PAGE_SIZE: usize = 100;

const SOURCE_ID: &str = "github";

const OWNER_REPOSITORIES_QUERY: &str = r#"
query ownerRepositories($owner: String!, $first: Int!) {
  repositoryOwner(login: $owner) {
    repositories(
      first: $first
      isFork: false
      privacy: PUBLIC
      ownerAffiliations: [OWNER]
      orderBy: { field: STARGAZERS, direction: DESC }
    ) {
      totalCount
      nodes {
        id
        name
        nameWithOwner
        url
        description
        isFork
        isPrivate
        isArchived
      }
      pageInfo {
        hasNextPage
      }
    }
  }
}
"#;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source rejected credentials (http {status})")]
    Unauthorized { status: u16 },
    #[error("source request failed: {0}")]
    Fetch(FetchError),
    #[error("decoding source response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("source query failed: {0}")]
    Query(String),
    #[error("owner {0} not found")]
    OwnerNotFound(String),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err.status() {
            Some(status @ (401 | 403)) => SourceError::Unauthorized { status },
            _ => SourceError::Fetch(err),
        }
    }
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// First `page_size` repositories of `owner`, most starred first.
    ///
    /// Repositories beyond one page are not fetched.
    async fn fetch_candidates(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        page_size: usize,
    ) -> Result<Vec<CandidateRepository>, SourceError>;
}

pub struct GithubSourceConnector {
    http: Arc<HttpFetcher>,
    graphql_url: String,
    token: String,
}

impl GithubSourceConnector {
    pub fn new(
        http: Arc<HttpFetcher>,
        graphql_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            graphql_url: graphql_url.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerData {
    repository_owner: Option<OwnerNode>,
}

#[derive(Debug, Deserialize)]
struct OwnerNode {
    repositories: RepositoryConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryConnection {
    total_count: u64,
    #[serde(default)]
    nodes: Vec<Option<CandidateRepository>>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
}

#[async_trait]
impl SourceConnector for GithubSourceConnector {
    async fn fetch_candidates(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        page_size: usize,
    ) -> Result<Vec<CandidateRepository>, SourceError> {
        let body = json!({
            "query": OWNER_REPOSITORIES_QUERY,
            "variables": {
                "owner": owner,
                "first": page_size.clamp(1, DEFAULT_PAGE_SIZE),
            },
        });

        let resp = self
            .http
            .execute(ctx.run_id, SOURCE_ID, |client| {
                client
                    .post(&self.graphql_url)
                    .bearer_auth(&self.token)
                    .json(&body)
            })
            .await?;

        let parsed: GraphqlResponse<OwnerData> = resp.json()?;
        if !parsed.errors.is_empty() {
            let message = parsed
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SourceError::Query(message));
        }

        let connection = parsed
            .data
            .and_then(|d| d.repository_owner)
            .ok_or_else(|| SourceError::OwnerNotFound(owner.to_string()))?
            .repositories;

        let candidates = connection.nodes.into_iter().flatten().collect::<Vec<_>>();
        if connection.page_info.has_next_page {
            warn!(
                owner,
                fetched = candidates.len(),
                total = connection.total_count,
                "owner has more repositories than one page; the rest are not synced"
            );
        }
        info!(owner, candidates = candidates.len(), "fetched candidate repositories");
        Ok(candidates)
    }
}
