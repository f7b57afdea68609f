//! Adapters for the external collaborators of a catalog sync run: the GitHub
//! listing, the remote ignore list, and the batched config resolver.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod ignore;
pub mod resolver;
pub mod source;

pub use ignore::{
    apply_ignore_filter, ExclusionReason, IgnoreList, IgnoreListError, IgnoreListSource,
    RemoteIgnoreList,
};
pub use resolver::{
    ConfigLookup, ConfigLookupEntry, ConfigLookupError, ConfigResolver, HttpConfigLookup,
    ResolveOutcome, CONFIG_REPOSITORIES_HEADER, DEFAULT_CHUNK_SIZE,
};
pub use source::{GithubSourceConnector, SourceConnector, SourceError, DEFAULT_PAGE_SIZE};

pub const CRATE_NAME: &str = "mosaic-adapters";

/// Per-run context handed to every adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}
