//! Core domain model for the Mosaic repository catalog.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "mosaic-core";

/// Repository as reported by the authoritative listing, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRepository {
    pub id: String,
    pub name_with_owner: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_fork: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_archived: bool,
}

impl CandidateRepository {
    /// Segment after the `/` in `owner/name`; the whole identifier if there is none.
    pub fn bare_name(&self) -> &str {
        self.name_with_owner
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.name_with_owner)
    }
}

/// Opaque configuration document returned by the config resolver.
///
/// The catalog never looks inside it. Equality is defined on the canonical
/// serialization only: compact JSON with object keys sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigPayload(pub JsonValue);

impl ConfigPayload {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    /// Compact JSON with sorted object keys.
    pub fn canonical_json(&self) -> String {
        // serde_json::Map is BTreeMap-backed, so keys come out sorted.
        self.0.to_string()
    }

    /// Parses previously stored config text.
    pub fn from_stored(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok().map(Self)
    }
}

/// Re-canonicalizes stored config text; text that is not JSON is returned as-is.
pub fn canonicalize_stored_config(text: &str) -> String {
    match ConfigPayload::from_stored(text) {
        Some(payload) => payload.canonical_json(),
        None => text.to_string(),
    }
}

/// Candidate enriched with its resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRepository {
    #[serde(flatten)]
    pub candidate: CandidateRepository,
    pub config: Option<ConfigPayload>,
}

impl ResolvedRepository {
    pub fn new(candidate: CandidateRepository, config: Option<ConfigPayload>) -> Self {
        Self { candidate, config }
    }

    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    pub fn name_with_owner(&self) -> &str {
        &self.candidate.name_with_owner
    }

    pub fn key(&self) -> RowKey {
        RowKey {
            name_with_owner: self.candidate.name_with_owner.clone(),
            github_id: self.candidate.id.clone(),
            url: self.candidate.url.clone(),
        }
    }

    pub fn canonical_config(&self) -> Option<String> {
        self.config.as_ref().map(ConfigPayload::canonical_json)
    }
}

/// Composite existence key used to decide insert vs update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub name_with_owner: String,
    pub github_id: String,
    pub url: String,
}

/// Row of the `repositories` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRepositoryRow {
    pub github_id: String,
    pub name_with_owner: String,
    pub name: String,
    pub url: String,
    pub description: Option<String>,
    pub config: Option<String>,
}

impl PersistedRepositoryRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            name_with_owner: self.name_with_owner.clone(),
            github_id: self.github_id.clone(),
            url: self.url.clone(),
        }
    }

    pub fn matches_key(&self, key: &RowKey) -> bool {
        self.name_with_owner == key.name_with_owner
            && self.github_id == key.github_id
            && self.url == key.url
    }

    pub fn canonical_config(&self) -> Option<String> {
        self.config.as_deref().map(canonicalize_stored_config)
    }

    pub fn config_payload(&self) -> Option<ConfigPayload> {
        self.config.as_deref().and_then(ConfigPayload::from_stored)
    }

    /// Apply a targeted update in place.
    pub fn apply(&mut self, changes: &RowChanges) {
        if let Some(description) = &changes.description {
            self.description = description.clone();
        }
        if let Some(config) = &changes.config {
            self.config = config.clone();
        }
    }
}

impl From<&ResolvedRepository> for PersistedRepositoryRow {
    fn from(repo: &ResolvedRepository) -> Self {
        Self {
            github_id: repo.candidate.id.clone(),
            name_with_owner: repo.candidate.name_with_owner.clone(),
            name: repo.candidate.name.clone(),
            url: repo.candidate.url.clone(),
            description: repo.candidate.description.clone(),
            config: repo.canonical_config(),
        }
    }
}

/// Column-level update; an outer `None` leaves that column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChanges {
    pub description: Option<Option<String>>,
    pub config: Option<Option<String>>,
}

impl RowChanges {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.config.is_none()
    }

    /// Diff a stored row against the freshly resolved repository.
    pub fn between(existing: &PersistedRepositoryRow, resolved: &ResolvedRepository) -> Self {
        let mut changes = Self::default();
        if existing.description != resolved.candidate.description {
            changes.description = Some(resolved.candidate.description.clone());
        }
        let resolved_config = resolved.canonical_config();
        if existing.canonical_config() != resolved_config {
            changes.config = Some(resolved_config);
        }
        changes
    }
}
