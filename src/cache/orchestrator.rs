//! Refresh orchestrator
//!
//! The only component that touches both the entry table and the upstream
//! client. A resolve serves a fresh entry straight from memory; otherwise it
//! joins (or starts) the single in-flight refresh for its key, which fetches
//! upstream, writes through to the snapshot store and the table, and on
//! failure falls back to the newest of snapshot and stale memory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::freshness::is_fresh;
use super::snapshot::SnapshotStore;
use super::table::{CacheEntry, EntryTable};
use crate::config::TtlConfig;
use crate::data::{CacheKey, Query, Upstream};
use crate::error::{FetchError, ResolveError};

/// Where a resolved payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Fresh entry already in memory
    Cache,
    /// Fetched from upstream during this resolve
    Upstream,
    /// Recovered from the snapshot store after an upstream failure
    Snapshot,
    /// Expired in-memory entry served after an upstream failure
    StaleMemory,
}

/// A successfully resolved payload
#[derive(Debug, Clone)]
pub struct Resolved {
    pub payload: Arc<Value>,
    pub fetched_at: DateTime<Utc>,
    pub source: Source,
    /// Non-fatal problem encountered on the way, e.g. a failed snapshot write
    pub warning: Option<String>,
}

impl Resolved {
    fn from_entry(entry: &CacheEntry, source: Source) -> Self {
        Self {
            payload: Arc::clone(&entry.payload),
            fetched_at: entry.fetched_at,
            source,
            warning: None,
        }
    }
}

type Outcome = Result<Resolved, ResolveError>;
type SharedRefresh = Shared<BoxFuture<'static, Outcome>>;

/// Settings the orchestrator needs from the application config
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub ttl: TtlConfig,
    pub upstream_timeout: Duration,
    pub max_keyed_entries: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ttl: TtlConfig::default(),
            upstream_timeout: Duration::from_secs(10),
            max_keyed_entries: None,
        }
    }
}

/// Coordinates the entry table, snapshot store and upstream client
///
/// Cheap to clone; clones share all state. Construct one at startup and hand
/// it to whatever serves requests.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    table: EntryTable,
    store: SnapshotStore,
    upstream: Arc<dyn Upstream>,
    ttl: TtlConfig,
    upstream_timeout: Duration,
    in_flight: DashMap<CacheKey, SharedRefresh>,
}

/// Clears a key's in-flight slot when its refresh task ends, even on panic
struct InFlightGuard {
    inner: Arc<Inner>,
    key: CacheKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

impl Orchestrator {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: SnapshotStore,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: EntryTable::with_keyed_limit(config.max_keyed_entries),
                store,
                upstream,
                ttl: config.ttl,
                upstream_timeout: config.upstream_timeout,
                in_flight: DashMap::new(),
            }),
        }
    }

    /// Resolves `query` against the current time
    pub async fn resolve(&self, query: &Query) -> Result<Resolved, ResolveError> {
        self.resolve_at(query, Utc::now()).await
    }

    /// Resolves `query` as of `now`
    ///
    /// Freshness is checked once, against the table as observed on entry.
    pub async fn resolve_at(
        &self,
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<Resolved, ResolveError> {
        let key = query.key();
        let current = self.inner.table.get(&key);

        if let Some(entry) = &current {
            if is_fresh(entry.fetched_at, now, self.inner.ttl.for_category(key.category)) {
                debug!(%key, "cache hit");
                return Ok(Resolved::from_entry(entry, Source::Cache));
            }
        }

        self.join_refresh(query, current, now).await
    }

    /// Refreshes `query` from upstream regardless of freshness
    pub async fn refresh(&self, query: &Query) -> Result<Resolved, ResolveError> {
        self.refresh_at(query, Utc::now()).await
    }

    /// Refreshes `query` as of `now`, sharing any refresh already in flight
    pub async fn refresh_at(
        &self,
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<Resolved, ResolveError> {
        let current = self.inner.table.get(&query.key());
        self.join_refresh(query, current, now).await
    }

    /// Read-only view of the in-memory entry for `key`
    pub fn cached(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.inner.table.get(key)
    }

    /// Number of keys with a refresh currently in flight
    pub fn refreshes_in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Awaits the in-flight refresh for the query's key, starting one if none
    ///
    /// The refresh runs on its own task, so callers that give up waiting do
    /// not cancel it for the others. The task is spawned only after the slot
    /// is inserted and the map entry released: a task dropped at spawn (runtime
    /// shutting down) clears the slot from its guard.
    async fn join_refresh(
        &self,
        query: &Query,
        stale: Option<Arc<CacheEntry>>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let key = query.key();
        let (refresh, result_tx) = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                debug!(%key, "joining in-flight refresh");
                (slot.get().clone(), None)
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let refresh = await_result(key.clone(), rx);
                slot.insert(refresh.clone());
                (refresh, Some(tx))
            }
        };

        if let Some(tx) = result_tx {
            self.spawn_refresh(query.clone(), stale, now, tx);
        }
        refresh.await
    }

    fn spawn_refresh(
        &self,
        query: Query,
        stale: Option<Arc<CacheEntry>>,
        now: DateTime<Utc>,
        result_tx: oneshot::Sender<Outcome>,
    ) {
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            key: query.key(),
        };

        tokio::spawn(async move {
            let guard = guard;
            let outcome = guard.inner.refresh(&query, stale, now).await;
            drop(guard);
            // every waiter may have given up
            let _ = result_tx.send(outcome);
        });
    }
}

/// Shared handle on a refresh task's result
///
/// Resolves to `Unavailable` if the task ends without reporting, which
/// happens when it panics or is dropped unpolled.
fn await_result(key: CacheKey, result_rx: oneshot::Receiver<Outcome>) -> SharedRefresh {
    async move {
        result_rx.await.unwrap_or_else(|_| {
            error!(%key, "refresh task ended without a result");
            Err(ResolveError::Unavailable {
                key,
                cause: "refresh task ended without a result".into(),
            })
        })
    }
    .boxed()
    .shared()
}

impl Inner {
    /// Fetch, write through, or fall back
    async fn refresh(&self, query: &Query, stale: Option<Arc<CacheEntry>>, now: DateTime<Utc>) -> Outcome {
        let key = query.key();

        match self.fetch_upstream(query).await {
            Ok(payload) => {
                let warning = match self.store.save(&key, &payload, now).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(%key, "failed to persist snapshot: {}", e);
                        Some(format!("snapshot not persisted: {}", e))
                    }
                };
                let entry = self.table.put(key.clone(), Arc::new(payload), now);
                info!(%key, "refreshed from upstream");

                let mut resolved = Resolved::from_entry(&entry, Source::Upstream);
                resolved.warning = warning;
                Ok(resolved)
            }
            Err(FetchError::NotFound(message)) => {
                debug!(%key, "upstream has no such key");
                Err(ResolveError::NotFound(message))
            }
            Err(e) => {
                warn!(%key, "upstream fetch failed, falling back: {}", e);
                self.fall_back(key, stale, now, e).await
            }
        }
    }

    async fn fetch_upstream(&self, query: &Query) -> Result<Value, FetchError> {
        tokio::time::timeout(self.upstream_timeout, self.upstream.fetch(query))
            .await
            .unwrap_or(Err(FetchError::Timeout(self.upstream_timeout)))
    }

    /// Serves the newest of snapshot and stale memory
    ///
    /// A snapshot only beats stale memory if it was fetched strictly later.
    /// A recovered snapshot is stamped with `now` so it is not re-read from
    /// disk on every request; stale memory is returned unchanged.
    async fn fall_back(
        &self,
        key: CacheKey,
        stale: Option<Arc<CacheEntry>>,
        now: DateTime<Utc>,
        cause: FetchError,
    ) -> Outcome {
        let snapshot = match self.store.load(&key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%key, "failed to load snapshot: {}", e);
                None
            }
        };

        match (snapshot, stale) {
            (Some(record), Some(memory)) if record.fetched_at <= memory.fetched_at => {
                warn!(%key, fetched_at = %memory.fetched_at, "serving stale entry");
                Ok(Resolved::from_entry(&memory, Source::StaleMemory))
            }
            (Some(record), _) => {
                info!(%key, fetched_at = %record.fetched_at, "recovered from snapshot");
                let entry = self.table.put(key, Arc::new(record.payload), now);
                Ok(Resolved::from_entry(&entry, Source::Snapshot))
            }
            (None, Some(memory)) => {
                warn!(%key, fetched_at = %memory.fetched_at, "serving stale entry");
                Ok(Resolved::from_entry(&memory, Source::StaleMemory))
            }
            (None, None) => {
                error!(%key, "no fallback data available");
                Err(ResolveError::Unavailable {
                    key,
                    cause: cause.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Category, Lookback};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Upstream that answers with whatever the test last scripted
    struct ScriptedUpstream {
        response: Mutex<Result<Value, FetchError>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedUpstream {
        fn new(response: Result<Value, FetchError>) -> Arc<Self> {
            Self::with_delay(response, Duration::ZERO)
        }

        fn with_delay(response: Result<Value, FetchError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(response),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn set(&self, response: Result<Value, FetchError>) {
            *self.response.lock().unwrap() = response;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn fetch(&self, _query: &Query) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.lock().unwrap().clone()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn setup(upstream: Arc<ScriptedUpstream>) -> (Orchestrator, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = SnapshotStore::with_dir(temp_dir.path().to_path_buf());
        let orchestrator = Orchestrator::new(upstream, store, OrchestratorConfig::default());
        (orchestrator, temp_dir)
    }

    fn unreachable() -> Result<Value, FetchError> {
        Err(FetchError::Unreachable("connection refused".into()))
    }

    #[tokio::test]
    async fn test_fresh_entry_served_without_upstream_call() {
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 1})));
        let (orch, _dir) = setup(upstream.clone());
        let t0 = at(1_700_000_000);

        let first = orch.resolve_at(&Query::Global, t0).await.unwrap();
        assert_eq!(first.source, Source::Upstream);

        let second = orch
            .resolve_at(&Query::Global, t0 + ChronoDuration::seconds(3600))
            .await
            .unwrap();
        assert_eq!(second.source, Source::Cache);
        assert_eq!(*second.payload, json!({"cases": 1}));
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_refresh() {
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 1})));
        let (orch, _dir) = setup(upstream.clone());
        let t0 = at(1_700_000_000);

        orch.resolve_at(&Query::Global, t0).await.unwrap();
        upstream.set(Ok(json!({"cases": 2})));

        let later = t0 + ChronoDuration::seconds(3601);
        let resolved = orch.resolve_at(&Query::Global, later).await.unwrap();
        assert_eq!(resolved.source, Source::Upstream);
        assert_eq!(*resolved.payload, json!({"cases": 2}));
        assert_eq!(resolved.fetched_at, later);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_successful_fetch_writes_through_to_snapshot() {
        let upstream = ScriptedUpstream::new(Ok(json!([{"country": "Chad"}])));
        let (orch, dir) = setup(upstream);

        orch.resolve_at(&Query::AllCountries, at(50)).await.unwrap();

        let store = SnapshotStore::with_dir(dir.path().to_path_buf());
        let record = store
            .load(&Query::AllCountries.key())
            .await
            .unwrap()
            .expect("snapshot should be written");
        assert_eq!(record.payload, json!([{"country": "Chad"}]));
        assert_eq!(record.fetched_at, at(50));
    }

    #[tokio::test]
    async fn test_persist_failure_is_warning_not_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 3})));
        let orch = Orchestrator::new(
            upstream,
            SnapshotStore::with_dir(blocker),
            OrchestratorConfig::default(),
        );

        let resolved = orch.resolve_at(&Query::Global, at(10)).await.unwrap();
        assert_eq!(resolved.source, Source::Upstream);
        assert!(resolved.warning.is_some());
        assert!(orch.cached(&Query::Global.key()).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_recovery_is_stamped_with_now() {
        let upstream = ScriptedUpstream::new(unreachable());
        let (orch, dir) = setup(upstream.clone());
        let store = SnapshotStore::with_dir(dir.path().to_path_buf());
        store
            .save(&Query::Global.key(), &json!({"cases": 90}), at(1000))
            .await
            .unwrap();

        let now = at(100_000);
        let resolved = orch.resolve_at(&Query::Global, now).await.unwrap();
        assert_eq!(resolved.source, Source::Snapshot);
        assert_eq!(*resolved.payload, json!({"cases": 90}));
        assert_eq!(resolved.fetched_at, now);

        // recovered data counts as fresh until the TTL passes again
        let again = orch
            .resolve_at(&Query::Global, now + ChronoDuration::seconds(10))
            .await
            .unwrap();
        assert_eq!(again.source, Source::Cache);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_memory_beats_older_snapshot() {
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 100})));
        let (orch, dir) = setup(upstream.clone());
        let now = at(1_700_000_000);
        let two_hours_ago = now - ChronoDuration::hours(2);
        let three_hours_ago = now - ChronoDuration::hours(3);

        orch.resolve_at(&Query::Global, two_hours_ago).await.unwrap();
        let store = SnapshotStore::with_dir(dir.path().to_path_buf());
        store
            .save(&Query::Global.key(), &json!({"cases": 90}), three_hours_ago)
            .await
            .unwrap();
        upstream.set(unreachable());

        let resolved = orch.resolve_at(&Query::Global, now).await.unwrap();
        assert_eq!(resolved.source, Source::StaleMemory);
        assert_eq!(*resolved.payload, json!({"cases": 100}));
        assert_eq!(resolved.fetched_at, two_hours_ago);
    }

    #[tokio::test]
    async fn test_newer_snapshot_beats_stale_memory() {
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 100})));
        let (orch, dir) = setup(upstream.clone());
        let now = at(1_700_000_000);

        orch.resolve_at(&Query::Global, now - ChronoDuration::hours(3))
            .await
            .unwrap();
        let store = SnapshotStore::with_dir(dir.path().to_path_buf());
        store
            .save(&Query::Global.key(), &json!({"cases": 120}), now - ChronoDuration::hours(2))
            .await
            .unwrap();
        upstream.set(Err(FetchError::BadStatus(502)));

        let resolved = orch.resolve_at(&Query::Global, now).await.unwrap();
        assert_eq!(resolved.source, Source::Snapshot);
        assert_eq!(*resolved.payload, json!({"cases": 120}));
    }

    #[tokio::test]
    async fn test_stale_memory_when_snapshot_unreadable() {
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 7})));
        let (orch, dir) = setup(upstream.clone());
        orch.resolve_at(&Query::Global, at(0) + ChronoDuration::seconds(1))
            .await
            .unwrap();

        let store = SnapshotStore::with_dir(dir.path().to_path_buf());
        std::fs::write(store.path_for(&Query::Global.key()), b"garbage").unwrap();
        upstream.set(Err(FetchError::MalformedPayload("bad".into())));

        let resolved = orch.resolve_at(&Query::Global, at(1_000_000)).await.unwrap();
        assert_eq!(resolved.source, Source::StaleMemory);
        assert_eq!(*resolved.payload, json!({"cases": 7}));
    }

    #[tokio::test]
    async fn test_unavailable_when_nothing_to_fall_back_to() {
        let upstream = ScriptedUpstream::new(unreachable());
        let (orch, _dir) = setup(upstream);

        let err = orch.resolve_at(&Query::Global, at(10)).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unavailable { ref key, .. } if key.category == Category::GlobalTotals));
        assert!(orch.cached(&Query::Global.key()).is_none());
    }

    #[tokio::test]
    async fn test_not_found_skips_fallback() {
        let upstream = ScriptedUpstream::new(Err(FetchError::NotFound("Country not found".into())));
        let (orch, dir) = setup(upstream);
        let query = Query::history("Narnia", Lookback::Days(30));

        let store = SnapshotStore::with_dir(dir.path().to_path_buf());
        store.save(&query.key(), &json!({"old": true}), at(1)).await.unwrap();

        let err = orch.resolve_at(&query, at(100)).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
        assert!(orch.cached(&query.key()).is_none());
    }

    #[tokio::test]
    async fn test_upstream_timeout_enters_fallback() {
        let upstream = ScriptedUpstream::with_delay(Ok(json!({})), Duration::from_secs(5));
        let temp_dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(
            upstream,
            SnapshotStore::with_dir(temp_dir.path().to_path_buf()),
            OrchestratorConfig {
                upstream_timeout: Duration::from_millis(20),
                ..OrchestratorConfig::default()
            },
        );

        let err = orch.resolve_at(&Query::Global, at(10)).await.unwrap_err();
        match err {
            ResolveError::Unavailable { cause, .. } => assert!(cause.contains("timed out")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert_eq!(orch.refreshes_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_forced_refresh_ignores_freshness() {
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 1})));
        let (orch, _dir) = setup(upstream.clone());

        orch.resolve_at(&Query::Global, at(10)).await.unwrap();
        upstream.set(Ok(json!({"cases": 2})));
        let resolved = orch.refresh_at(&Query::Global, at(11)).await.unwrap();

        assert_eq!(resolved.source, Source::Upstream);
        assert_eq!(*resolved.payload, json!({"cases": 2}));
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_slot_cleared_after_refresh() {
        let upstream = ScriptedUpstream::new(Ok(json!({})));
        let (orch, _dir) = setup(upstream);
        orch.resolve_at(&Query::Global, at(10)).await.unwrap();
        assert_eq!(orch.refreshes_in_flight(), 0);
    }

    struct PanickingUpstream;

    #[async_trait]
    impl Upstream for PanickingUpstream {
        async fn fetch(&self, _query: &Query) -> Result<Value, FetchError> {
            panic!("upstream client bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_refresh_is_unavailable_and_clears_slot() {
        let temp_dir = TempDir::new().unwrap();
        let orch = Orchestrator::new(
            Arc::new(PanickingUpstream),
            SnapshotStore::with_dir(temp_dir.path().to_path_buf()),
            OrchestratorConfig::default(),
        );

        let err = orch.resolve_at(&Query::Global, at(10)).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unavailable { .. }));
        assert_eq!(orch.refreshes_in_flight(), 0);
    }

    #[test]
    fn test_refresh_started_during_shutdown_does_not_hang() {
        let temp_dir = TempDir::new().unwrap();
        let upstream = ScriptedUpstream::new(Ok(json!({"cases": 1})));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        runtime.shutdown_background();
        let orch = Orchestrator::new(
            upstream.clone(),
            SnapshotStore::with_dir(temp_dir.path().to_path_buf()),
            OrchestratorConfig::default(),
        );

        // spawning on a shut-down runtime drops the refresh task on the spot
        let _enter = handle.enter();
        let result = futures::executor::block_on(orch.resolve_at(&Query::Global, at(10)));
        assert!(matches!(result, Err(ResolveError::Unavailable { .. })));
        assert_eq!(orch.refreshes_in_flight(), 0);
        assert_eq!(upstream.calls(), 0);
    }
}
