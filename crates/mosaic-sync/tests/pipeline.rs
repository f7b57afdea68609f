use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use mosaic_adapters::{
    AdapterContext, ConfigLookup, ConfigLookupEntry, ConfigLookupError, IgnoreList, IgnoreListError,
    IgnoreListSource, SourceConnector, SourceError, CONFIG_REPOSITORIES_HEADER,
};
use mosaic_core::{CandidateRepository, PersistedRepositoryRow};
use mosaic_storage::{FetchError, MemoryRepositoryStore, StoreStatement};
use mosaic_sync::{ReconcileError, SyncConfig, SyncError, SyncOptions, SyncPipeline};
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn repo(name: &str) -> CandidateRepository {
    CandidateRepository {
        id: format!("R_{name}"),
        name_with_owner: format!("luxass/{name}"),
        name: name.to_string(),
        url: format!("https://github.com/luxass/{name}"),
        description: Some(format!("{name} description")),
        is_fork: false,
        is_private: false,
        is_archived: false,
    }
}

struct StaticSource {
    result: Result<Vec<CandidateRepository>, u16>,
}

#[async_trait]
impl SourceConnector for StaticSource {
    async fn fetch_candidates(
        &self,
        _ctx: &AdapterContext,
        _owner: &str,
        page_size: usize,
    ) -> Result<Vec<CandidateRepository>, SourceError> {
        match &self.result {
            Ok(candidates) => Ok(candidates.iter().take(page_size).cloned().collect()),
            Err(status) => Err(SourceError::Unauthorized { status: *status }),
        }
    }
}

/// Ignore list that can be swapped between runs; `None` fails the fetch.
struct SwappableIgnore {
    entries: Mutex<Option<Vec<String>>>,
}

impl SwappableIgnore {
    fn with(entries: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Some(entries.iter().map(ToString::to_string).collect())),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(None),
        })
    }

    async fn set(&self, entries: &[&str]) {
        *self.entries.lock().await = Some(entries.iter().map(ToString::to_string).collect());
    }
}

#[async_trait]
impl IgnoreListSource for SwappableIgnore {
    async fn fetch_ignore_list(
        &self,
        _ctx: &AdapterContext,
    ) -> Result<IgnoreList, IgnoreListError> {
        match self.entries.lock().await.as_ref() {
            Some(entries) => Ok(IgnoreList::from_entries(entries.iter().cloned())),
            None => Err(IgnoreListError::Fetch(FetchError::HttpStatus {
                status: 500,
                url: "https://raw.example/.mosaicignore".to_string(),
            })),
        }
    }
}

#[derive(Default)]
struct RecordingLookup {
    batches: Mutex<Vec<Vec<String>>>,
    unavailable: HashSet<String>,
}

#[async_trait]
impl ConfigLookup for RecordingLookup {
    async fn lookup(
        &self,
        _ctx: &AdapterContext,
        repositories: &[String],
    ) -> Result<Vec<ConfigLookupEntry>, ConfigLookupError> {
        self.batches.lock().await.push(repositories.to_vec());
        Ok(repositories
            .iter()
            .map(|name| ConfigLookupEntry {
                kind: if self.unavailable.contains(name) { "error" } else { "success" }.to_string(),
                repository: Some(name.clone()),
                content: Some(json!({"project": {"name": name}})),
                message: None,
            })
            .collect())
    }
}

fn pipeline(
    candidates: Vec<CandidateRepository>,
    ignore: Arc<SwappableIgnore>,
    lookup: Arc<RecordingLookup>,
    store: Arc<MemoryRepositoryStore>,
) -> SyncPipeline {
    SyncPipeline::new(
        Arc::new(StaticSource { result: Ok(candidates) }),
        ignore,
        lookup,
        store,
    )
}

fn options() -> SyncOptions {
    SyncOptions::for_owner("luxass")
}

#[tokio::test]
async fn second_run_with_unchanged_upstream_writes_nothing() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let pipeline = pipeline(
        vec![repo("lesetid"), repo("mosaic"), repo("vscode")],
        SwappableIgnore::with(&[]),
        Arc::new(RecordingLookup::default()),
        store.clone(),
    );

    let first = pipeline.run_once(&options()).await.expect("first run");
    assert_eq!(first.reconcile.inserted, 3);

    store.clear_statements().await;
    let second = pipeline.run_once(&options()).await.expect("second run");
    assert_eq!(second.reconcile.writes(), 0);
    assert_eq!(second.reconcile.unchanged, 3);
    assert!(store.statements().await.is_empty());
}

#[tokio::test]
async fn ignored_full_and_bare_names_never_reach_the_store() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let lookup = Arc::new(RecordingLookup::default());
    let mut fork = repo("forked");
    fork.is_fork = true;
    let pipeline = pipeline(
        vec![repo("dotfiles"), repo("playground"), repo("lesetid"), fork],
        SwappableIgnore::with(&["# personal", "luxass/dotfiles", "playground"]),
        lookup.clone(),
        store.clone(),
    );

    let summary = pipeline.run_once(&options()).await.expect("run");
    assert_eq!(summary.candidates, 4);
    assert_eq!(summary.filtered, 1);
    assert_eq!(summary.resolved, 1);

    let sent = lookup.batches.lock().await.concat();
    assert_eq!(sent, vec!["luxass/lesetid".to_string()]);
    let ids = store
        .rows()
        .await
        .into_iter()
        .map(|r| r.github_id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["R_lesetid".to_string()]);
}

#[tokio::test]
async fn twenty_five_candidates_are_resolved_in_batches_of_ten() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let lookup = Arc::new(RecordingLookup::default());
    let candidates = (0..25).map(|i| repo(&format!("repo-{i}"))).collect::<Vec<_>>();
    let pipeline = pipeline(candidates, SwappableIgnore::with(&[]), lookup.clone(), store.clone());

    let summary = pipeline.run_once(&options()).await.expect("run");
    assert_eq!(summary.chunks, 3);

    let mut sizes = lookup
        .batches
        .lock()
        .await
        .iter()
        .map(Vec::len)
        .collect::<Vec<_>>();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(store.rows().await.len(), 25);
}

#[tokio::test]
async fn unavailable_config_excludes_only_that_repository() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let lookup = Arc::new(RecordingLookup {
        unavailable: HashSet::from(["luxass/repo-4".to_string()]),
        ..RecordingLookup::default()
    });
    let candidates = (0..15).map(|i| repo(&format!("repo-{i}"))).collect::<Vec<_>>();
    let pipeline = pipeline(candidates, SwappableIgnore::with(&[]), lookup, store.clone());

    let summary = pipeline.run_once(&options()).await.expect("run");
    assert_eq!(summary.resolved, 14);
    let rows = store.rows().await;
    assert_eq!(rows.len(), 14);
    assert!(rows.iter().all(|r| r.name_with_owner != "luxass/repo-4"));
    assert!(rows.iter().any(|r| r.name_with_owner == "luxass/repo-12"));
}

#[tokio::test]
async fn source_auth_failure_is_fatal_and_touches_nothing() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let pipeline = SyncPipeline::new(
        Arc::new(StaticSource { result: Err(401) }),
        SwappableIgnore::with(&[]),
        Arc::new(RecordingLookup::default()),
        store.clone(),
    );

    let err = pipeline.run_once(&options()).await.expect_err("fatal");
    assert!(matches!(err, SyncError::Source(SourceError::Unauthorized { status: 401 })));
    assert!(store.statements().await.is_empty());
}

#[tokio::test]
async fn ignore_list_failure_is_fatal_and_touches_nothing() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let lookup = Arc::new(RecordingLookup::default());
    let pipeline = pipeline(
        vec![repo("lesetid")],
        SwappableIgnore::failing(),
        lookup.clone(),
        store.clone(),
    );

    let err = pipeline.run_once(&options()).await.expect_err("fatal");
    assert!(matches!(err, SyncError::IgnoreList(_)));
    assert!(lookup.batches.lock().await.is_empty());
    assert!(store.statements().await.is_empty());
}

#[tokio::test]
async fn stale_delete_failure_is_fatal() {
    let gone = PersistedRepositoryRow {
        github_id: "R_gone".into(),
        name_with_owner: "luxass/gone".into(),
        name: "gone".into(),
        url: "https://github.com/luxass/gone".into(),
        description: None,
        config: None,
    };
    let store = Arc::new(MemoryRepositoryStore::with_rows([gone]).failing_delete());
    let pipeline = pipeline(
        vec![repo("lesetid")],
        SwappableIgnore::with(&[]),
        Arc::new(RecordingLookup::default()),
        store.clone(),
    );

    let err = pipeline.run_once(&options()).await.expect_err("fatal");
    assert!(matches!(err, SyncError::Reconcile(ReconcileError::StaleDelete(_))));
    assert!(store.statements().await.is_empty());
    let ids = store
        .rows()
        .await
        .into_iter()
        .map(|r| r.github_id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["R_gone".to_string()]);
}

#[tokio::test]
async fn empty_upstream_keeps_existing_catalog() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let seeded = pipeline(
        vec![repo("a"), repo("b"), repo("c")],
        SwappableIgnore::with(&[]),
        Arc::new(RecordingLookup::default()),
        store.clone(),
    );
    seeded.run_once(&options()).await.expect("seed");
    store.clear_statements().await;

    let empty = pipeline(
        vec![],
        SwappableIgnore::with(&[]),
        Arc::new(RecordingLookup::default()),
        store.clone(),
    );
    let summary = empty.run_once(&options()).await.expect("empty run");
    assert!(summary.reconcile.delete_skipped);
    assert!(store.statements().await.is_empty());
    assert_eq!(store.rows().await.len(), 3);
}

#[tokio::test]
async fn repository_ignored_after_persisting_is_deleted_next_run() {
    let store = Arc::new(MemoryRepositoryStore::new());
    let ignore = SwappableIgnore::with(&[]);
    let pipeline = pipeline(
        vec![repo("lesetid"), repo("playground")],
        ignore.clone(),
        Arc::new(RecordingLookup::default()),
        store.clone(),
    );
    pipeline.run_once(&options()).await.expect("first run");
    assert_eq!(store.rows().await.len(), 2);

    ignore.set(&["playground"]).await;
    store.clear_statements().await;
    let summary = pipeline.run_once(&options()).await.expect("second run");
    assert_eq!(summary.reconcile.deleted, 1);
    assert_eq!(
        store.statements().await,
        vec![StoreStatement::Delete { kept: 1, removed: 1 }]
    );
    let names = store
        .rows()
        .await
        .into_iter()
        .map(|r| r.name_with_owner)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["luxass/lesetid".to_string()]);
}

#[tokio::test]
async fn row_write_failure_does_not_fail_the_run() {
    let store = Arc::new(MemoryRepositoryStore::new().failing_writes_for("luxass/mosaic"));
    let pipeline = pipeline(
        vec![repo("lesetid"), repo("mosaic"), repo("vscode")],
        SwappableIgnore::with(&[]),
        Arc::new(RecordingLookup::default()),
        store.clone(),
    );

    let summary = pipeline.run_once(&options()).await.expect("completes");
    assert_eq!(summary.reconcile.inserted, 2);
    assert_eq!(summary.reconcile.failures.len(), 1);
    assert_eq!(summary.reconcile.failures[0].name_with_owner, "luxass/mosaic");
}

struct BlockingSource {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl SourceConnector for BlockingSource {
    async fn fetch_candidates(
        &self,
        _ctx: &AdapterContext,
        _owner: &str,
        _page_size: usize,
    ) -> Result<Vec<CandidateRepository>, SourceError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(vec![repo("lesetid")])
    }
}

#[tokio::test]
async fn overlapping_run_in_same_process_is_rejected() {
    let source = Arc::new(BlockingSource {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let pipeline = Arc::new(SyncPipeline::new(
        source.clone(),
        SwappableIgnore::with(&[]),
        Arc::new(RecordingLookup::default()),
        Arc::new(MemoryRepositoryStore::new()),
    ));

    let first = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run_once(&options()).await }
    });
    source.entered.notified().await;

    let err = pipeline.run_once(&options()).await.expect_err("overlap");
    assert!(matches!(err, SyncError::AlreadyRunning));

    source.release.notify_one();
    let summary = first.await.expect("join").expect("first run");
    assert_eq!(summary.reconcile.inserted, 1);
}

/// Echoes a success entry for every repository named in the request header.
struct EchoConfigs;

impl Respond for EchoConfigs {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let names = request
            .headers
            .get(CONFIG_REPOSITORIES_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let body = names
            .split(',')
            .filter(|n| !n.is_empty())
            .map(|n| json!({"type": "success", "repository": n, "content": {"name": n}}))
            .collect::<Vec<_>>();
        ResponseTemplate::new(200).set_body_json(body)
    }
}

#[tokio::test]
async fn http_adapters_end_to_end() {
    let server = MockServer::start().await;

    let mut nodes = (0..25)
        .map(|i| {
            json!({
                "id": format!("R_{i}"),
                "name": format!("repo-{i}"),
                "nameWithOwner": format!("luxass/repo-{i}"),
                "url": format!("https://github.com/luxass/repo-{i}"),
                "description": null,
                "isFork": false,
                "isPrivate": false,
                "isArchived": false
            })
        })
        .collect::<Vec<_>>();
    nodes.push(json!({
        "id": "R_archived",
        "name": "old",
        "nameWithOwner": "luxass/old",
        "url": "https://github.com/luxass/old",
        "description": "archived",
        "isFork": false,
        "isPrivate": false,
        "isArchived": true
    }));
    nodes.push(json!({
        "id": "R_dotfiles",
        "name": "dotfiles",
        "nameWithOwner": "luxass/dotfiles",
        "url": "https://github.com/luxass/dotfiles",
        "description": null,
        "isFork": false,
        "isPrivate": false,
        "isArchived": false
    }));

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "repositoryOwner": {
                    "repositories": {
                        "totalCount": nodes.len(),
                        "nodes": nodes,
                        "pageInfo": {"hasNextPage": false}
                    }
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/.mosaicignore"))
        .respond_with(ResponseTemplate::new(200).set_body_string("# ignored\ndotfiles\n"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/mosaic/config"))
        .respond_with(EchoConfigs)
        .expect(3)
        .mount(&server)
        .await;

    let mut config = SyncConfig::from_env();
    config.github_token = "token".into();
    config.graphql_url = format!("{}/graphql", server.uri());
    config.ignore_url = format!("{}/.mosaicignore", server.uri());
    config.config_url = format!("{}/api/v1/mosaic/config", server.uri());
    config.chunk_size = 10;
    config.page_size = 100;

    let store = Arc::new(MemoryRepositoryStore::new());
    let pipeline = SyncPipeline::from_config(&config, store.clone()).expect("pipeline");
    let summary = pipeline.run_once(&config.options()).await.expect("run");

    assert_eq!(summary.candidates, 27);
    assert_eq!(summary.filtered, 25);
    assert_eq!(summary.resolved, 25);
    assert_eq!(store.rows().await.len(), 25);

    let mut sizes = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/api/v1/mosaic/config")
        .filter_map(|r| r.headers.get(CONFIG_REPOSITORIES_HEADER))
        .filter_map(|v| v.to_str().ok().map(|s| s.split(',').count()))
        .collect::<Vec<_>>();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(sizes, vec![10, 10, 5]);
}
