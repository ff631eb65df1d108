//! Incremental reconciliation of a remote catalog against the local store
//!
//! One [`SyncOrchestrator`] drives any entity family through the
//! [`SyncFamily`] capability trait. A pass lists the remote catalog, skips
//! targets the local index says are fresh, fetches the rest one at a time
//! behind the host's rate limit, and merge-upserts the results. A bad item
//! is recorded and skipped; only catalog, store and repeated authentication
//! failures end a pass early.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::rate_limiter::HostRateLimiter;
use super::retry::RetryManager;
use crate::config::SyncConfig;
use crate::database::RecordStore;
use crate::error::{DbError, ErrorClass, JobError, SyncError};
use crate::models::{EntityKind, JobStats, LocalRecord, RecordFilter, UpsertOutcome};

/// Raw remote payload for one entity
pub type RemoteItem = serde_json::Value;

/// Remote identifier half of one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    /// Local canonical id
    pub canonical_id: String,
    /// Id or path the source uses for the detail fetch
    pub remote_locator: String,
    /// Last-modified time advertised by the listing
    pub completeness_hint: Option<DateTime<Utc>>,
    /// Source-scoped key (`source:remote_id`) bound to the canonical id on first sighting
    pub alias: Option<String>,
    /// Owning scope, e.g. an organization slug
    pub parent: Option<String>,
}

impl SyncTarget {
    /// Target whose locator equals its canonical id
    pub fn new(canonical_id: impl Into<String>) -> Self {
        let canonical_id = canonical_id.into();
        Self {
            remote_locator: canonical_id.clone(),
            canonical_id,
            completeness_hint: None,
            alias: None,
            parent: None,
        }
    }

    /// Set the remote locator
    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.remote_locator = locator.into();
        self
    }

    /// Set the listing's last-modified hint
    pub fn with_hint(mut self, hint: Option<DateTime<Utc>>) -> Self {
        self.completeness_hint = hint;
        self
    }

    /// Set the source alias
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the owning scope
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// One page of a catalog listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    /// Targets on this page
    pub targets: Vec<SyncTarget>,
    /// Opaque continuation token for the next page
    pub next: Option<String>,
}

/// Freshness signals for one local record
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Source timestamp of the stored data
    pub source_updated_at: Option<DateTime<Utc>>,
    /// Last successful reconciliation
    pub last_reconciled_at: DateTime<Utc>,
    /// Every required field is populated
    pub complete: bool,
    /// Still present upstream
    pub active: bool,
}

/// Snapshot of what the store already knows about one family
#[derive(Debug, Clone, Default)]
pub struct LocalIndex {
    entries: HashMap<String, IndexEntry>,
    aliases: HashMap<String, String>,
}

impl LocalIndex {
    /// Build from stored records and alias bindings
    pub fn build(
        records: &[LocalRecord],
        required_fields: &[&str],
        aliases: Vec<(String, String)>,
    ) -> Self {
        let entries = records
            .iter()
            .map(|r| {
                (
                    r.canonical_id.clone(),
                    IndexEntry {
                        source_updated_at: r.source_updated_at,
                        last_reconciled_at: r.last_reconciled_at,
                        complete: r.has_fields(required_fields),
                        active: r.active,
                    },
                )
            })
            .collect();

        Self {
            entries,
            aliases: aliases.into_iter().collect(),
        }
    }

    /// Entry for a canonical id
    pub fn get(&self, canonical_id: &str) -> Option<&IndexEntry> {
        self.entries.get(canonical_id)
    }

    /// Number of indexed records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite a target's canonical id if its alias is already bound
    pub fn resolve(&self, mut target: SyncTarget) -> SyncTarget {
        if let Some(bound) = target.alias.as_ref().and_then(|a| self.aliases.get(a)) {
            if *bound != target.canonical_id {
                target.canonical_id = bound.clone();
            }
        }
        target
    }

    /// Active canonical ids not in `seen`
    pub fn missing_from(&self, seen: &HashSet<String>) -> Vec<String> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(id, e)| e.active && !seen.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Default staleness rule shared by the JSON families
    ///
    /// A target is stale when it is unknown, inactive or incomplete, when the
    /// listing advertises a newer copy, or when it was last reconciled more
    /// than `stale_after` ago. `None` disables the age check.
    pub fn is_stale(
        &self,
        target: &SyncTarget,
        now: DateTime<Utc>,
        stale_after: Option<chrono::Duration>,
    ) -> bool {
        let Some(entry) = self.get(&target.canonical_id) else {
            return true;
        };
        if !entry.active || !entry.complete {
            return true;
        }
        if let Some(hint) = target.completeness_hint {
            match entry.source_updated_at {
                Some(stored) if stored >= hint => {}
                _ => return true,
            }
        }
        stale_after.is_some_and(|max_age| now - entry.last_reconciled_at >= max_age)
    }
}

/// Which targets a pass covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScope {
    /// Every target in the catalog
    All,
    /// One entity by canonical id or remote locator
    Entity(String),
    /// Targets owned by one organization
    Org(String),
}

impl JobScope {
    /// Whether a target belongs to this scope
    pub fn includes(&self, target: &SyncTarget) -> bool {
        match self {
            JobScope::All => true,
            JobScope::Entity(id) => target.canonical_id == *id || target.remote_locator == *id,
            JobScope::Org(slug) => {
                target.parent.as_deref() == Some(slug.as_str()) || target.canonical_id == *slug
            }
        }
    }
}

impl std::fmt::Display for JobScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobScope::All => write!(f, "all"),
            JobScope::Entity(id) => write!(f, "{}", id),
            JobScope::Org(slug) => write!(f, "org:{}", slug),
        }
    }
}

impl FromStr for JobScope {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(JobScope::All);
        }
        if let Some(slug) = s.strip_prefix("org:") {
            if slug.is_empty() {
                return Err(JobError::InvalidRequest("empty organization slug".to_string()));
            }
            return Ok(JobScope::Org(slug.to_string()));
        }
        Ok(JobScope::Entity(s.to_string()))
    }
}

/// Cooperative cancellation checked between items
///
/// A [`child`](StopSignal::child) fires when it or any of its ancestors is
/// stopped; stopping a child leaves the ancestors untouched.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl StopSignal {
    /// A signal that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also fires when this one does
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.flag.clone());
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    /// Ask running passes to stop after the current item
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether stop was requested here or on an ancestor
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.ancestors.iter().any(|a| a.load(Ordering::SeqCst))
    }
}

/// Capabilities one entity family provides to the orchestrator
#[async_trait]
pub trait SyncFamily: Send + Sync {
    /// Job name used in logs and run history
    fn name(&self) -> &str;

    /// Entity kind this family writes
    fn kind(&self) -> EntityKind;

    /// Rate-limit bucket for every request this family makes
    fn host_key(&self) -> String;

    /// Fields a record needs before it counts as complete
    fn required_fields(&self) -> &[&'static str] {
        &[]
    }

    /// Whether records absent from a full listing should be marked inactive
    fn deactivate_missing(&self) -> bool {
        false
    }

    /// One catalog page; `None` starts from the beginning
    async fn list_catalog(&self, continuation: Option<String>) -> Result<CatalogPage, SyncError>;

    /// Whether a target needs fetching
    fn is_stale(&self, target: &SyncTarget, index: &LocalIndex) -> bool;

    /// Remote detail for a target; `None` when the source has nothing
    async fn fetch_detail(&self, target: &SyncTarget) -> Result<Option<RemoteItem>, SyncError>;

    /// Normalize a remote payload
    fn to_local_record(
        &self,
        target: &SyncTarget,
        item: RemoteItem,
    ) -> Result<LocalRecord, SyncError>;

    /// Persist a record under the merge policy
    async fn upsert(&self, record: &LocalRecord) -> Result<UpsertOutcome, DbError>;
}

enum ItemFailure {
    Remote(SyncError),
    Store(DbError),
}

impl From<SyncError> for ItemFailure {
    fn from(err: SyncError) -> Self {
        ItemFailure::Remote(err)
    }
}

/// Generic reconciliation loop
pub struct SyncOrchestrator {
    store: Arc<dyn RecordStore>,
    limiter: Arc<HostRateLimiter>,
    retry: RetryManager,
    auth_failure_threshold: u32,
}

impl SyncOrchestrator {
    /// Create an orchestrator over shared infrastructure
    pub fn new(
        store: Arc<dyn RecordStore>,
        limiter: Arc<HostRateLimiter>,
        retry: RetryManager,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            retry,
            auth_failure_threshold: config.auth_failure_threshold.max(1),
        }
    }

    /// Run one pass of `family` over `scope`
    pub async fn run(
        &self,
        family: &dyn SyncFamily,
        scope: &JobScope,
        stop: &StopSignal,
    ) -> Result<JobStats, JobError> {
        let job = family.name().to_string();
        let kind = family.kind();
        let host = family.host_key();

        info!(job = %job, scope = %scope, host = %host, "Starting reconciliation pass");

        let records = self.store.find_many(&RecordFilter::kind(kind)).await?;
        let aliases = self.store.aliases(kind).await?;
        let index = LocalIndex::build(&records, family.required_fields(), aliases);
        debug!(job = %job, indexed = index.len(), "Local index built");

        let mut stats = JobStats::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursors: HashSet<String> = HashSet::new();
        let mut continuation: Option<String> = None;
        let mut consecutive_auth_failures = 0u32;
        let mut listing_complete = false;

        'pages: loop {
            if stop.is_stopped() {
                break;
            }

            let listed = self
                .retry
                .execute(|| {
                    let continuation = continuation.clone();
                    let host = host.as_str();
                    async move {
                        self.limiter.acquire(host).await;
                        family.list_catalog(continuation).await
                    }
                })
                .await;

            let page = match (listed, &continuation) {
                (Ok(page), _) => page,
                // A bad continuation page ends the listing; earlier pages stand
                (Err(e), Some(cursor)) if e.class() == ErrorClass::Permanent => {
                    warn!(job = %job, cursor = %cursor, error = %e, "Catalog page unusable, ending listing");
                    stats.record_error(format!("{}:catalog@{}", job, cursor), e.to_string());
                    break;
                }
                (Err(e), _) => {
                    error!(job = %job, error = %e, "Catalog listing failed");
                    return Err(JobError::CatalogUnavailable(e));
                }
            };

            if page.targets.is_empty() && continuation.is_none() {
                warn!(job = %job, "Catalog listing returned no targets");
            }

            for target in page.targets {
                if stop.is_stopped() {
                    info!(job = %job, "Stop requested, ending pass early");
                    break 'pages;
                }

                let target = index.resolve(target);
                if !scope.includes(&target) {
                    continue;
                }
                if !seen.insert(target.canonical_id.clone()) {
                    debug!(job = %job, item = %target.canonical_id, "Duplicate target in listing");
                    continue;
                }
                if !family.is_stale(&target, &index) {
                    stats.record_skip();
                    continue;
                }

                match self.reconcile(family, &host, &target).await {
                    Ok(outcome) => {
                        consecutive_auth_failures = 0;
                        debug!(job = %job, item = %target.canonical_id, outcome = ?outcome, "Item reconciled");
                        stats.record_outcome(outcome);
                    }
                    Err(ItemFailure::Store(e)) => {
                        error!(job = %job, item = %target.canonical_id, error = %e, "Store failed");
                        return Err(JobError::Store(e));
                    }
                    Err(ItemFailure::Remote(e)) => {
                        if e.class() == ErrorClass::Auth {
                            consecutive_auth_failures += 1;
                            if consecutive_auth_failures >= self.auth_failure_threshold {
                                error!(
                                    job = %job,
                                    failures = consecutive_auth_failures,
                                    "Authentication keeps failing, aborting pass"
                                );
                                return Err(JobError::AuthFailuresExceeded(
                                    consecutive_auth_failures,
                                ));
                            }
                        } else {
                            consecutive_auth_failures = 0;
                        }

                        warn!(job = %job, item = %target.canonical_id, error = %e, "Item failed");
                        stats.record_error(target.canonical_id.clone(), e.to_string());
                    }
                }
            }

            match page.next {
                Some(next) if cursors.insert(next.clone()) => continuation = Some(next),
                Some(next) => {
                    warn!(job = %job, cursor = %next, "Catalog repeated a continuation token");
                    break;
                }
                None => {
                    listing_complete = true;
                    break;
                }
            }
        }

        if listing_complete && *scope == JobScope::All && family.deactivate_missing() {
            let missing = index.missing_from(&seen);
            if !missing.is_empty() {
                let n = self.store.mark_inactive(kind, &missing).await?;
                info!(job = %job, deactivated = n, "Marked records missing upstream as inactive");
            }
        }

        info!(
            job = %job,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            errors = stats.errors.len(),
            "Reconciliation pass finished"
        );
        Ok(stats)
    }

    async fn reconcile(
        &self,
        family: &dyn SyncFamily,
        host: &str,
        target: &SyncTarget,
    ) -> Result<UpsertOutcome, ItemFailure> {
        let item = self
            .retry
            .execute(|| async move {
                self.limiter.acquire(host).await;
                match family.fetch_detail(target).await {
                    Ok(Some(item)) => Ok(item),
                    Ok(None) => Err(SyncError::Empty(format!(
                        "no detail for {}",
                        target.remote_locator
                    ))),
                    Err(e) => Err(e),
                }
            })
            .await?;

        let mut record = family.to_local_record(target, item)?;

        if let Some(alias) = &target.alias {
            let bound = self
                .store
                .link_alias(family.kind(), alias, &record.canonical_id)
                .await
                .map_err(ItemFailure::Store)?;
            if bound != record.canonical_id {
                debug!(alias = %alias, canonical = %bound, "Alias already bound, enriching existing record");
                record.canonical_id = bound;
            }
        }

        family.upsert(&record).await.map_err(ItemFailure::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{RateLimitConfig, RetryConfig};
    use crate::database::SqliteDatabase;
    use crate::sync::merge::merge_upsert;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// In-memory family with scripted detail results
    struct ScriptedFamily {
        store: Arc<dyn RecordStore>,
        pages: Vec<CatalogPage>,
        details: HashMap<String, Result<Option<RemoteItem>, SyncError>>,
        fetches: Mutex<Vec<String>>,
        list_failures: AtomicU32,
        clock: Arc<dyn Clock>,
    }

    impl ScriptedFamily {
        fn new(store: Arc<dyn RecordStore>, targets: Vec<SyncTarget>) -> Self {
            Self {
                store,
                pages: vec![CatalogPage {
                    targets,
                    next: None,
                }],
                details: HashMap::new(),
                fetches: Mutex::new(Vec::new()),
                list_failures: AtomicU32::new(0),
                clock: Arc::new(ManualClock::new()),
            }
        }

        fn detail(mut self, id: &str, result: Result<Option<RemoteItem>, SyncError>) -> Self {
            self.details.insert(id.to_string(), result);
            self
        }

        fn fetched(&self) -> Vec<String> {
            self.fetches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncFamily for ScriptedFamily {
        fn name(&self) -> &str {
            "players"
        }

        fn kind(&self) -> EntityKind {
            EntityKind::Player
        }

        fn host_key(&self) -> String {
            "players.example.com".to_string()
        }

        fn required_fields(&self) -> &[&'static str] {
            &["name"]
        }

        fn deactivate_missing(&self) -> bool {
            true
        }

        async fn list_catalog(
            &self,
            continuation: Option<String>,
        ) -> Result<CatalogPage, SyncError> {
            if self.list_failures.load(Ordering::SeqCst) > 0 {
                self.list_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SyncError::ServerError(502));
            }
            if continuation.as_deref() == Some("garbled") {
                return Err(SyncError::InvalidData("expected value at line 1".to_string()));
            }
            let idx = continuation.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(self.pages.get(idx).cloned().unwrap_or_default())
        }

        fn is_stale(&self, target: &SyncTarget, index: &LocalIndex) -> bool {
            index.is_stale(target, self.clock.utc_now(), Some(chrono::Duration::days(1)))
        }

        async fn fetch_detail(
            &self,
            target: &SyncTarget,
        ) -> Result<Option<RemoteItem>, SyncError> {
            self.fetches
                .lock()
                .unwrap()
                .push(target.canonical_id.clone());
            self.details
                .get(&target.remote_locator)
                .cloned()
                .unwrap_or_else(|| Ok(Some(json!({ "name": format!("Player {}", target.remote_locator) }))))
        }

        fn to_local_record(
            &self,
            target: &SyncTarget,
            item: RemoteItem,
        ) -> Result<LocalRecord, SyncError> {
            let name = item["name"]
                .as_str()
                .ok_or_else(|| SyncError::InvalidData("missing name".to_string()))?;
            Ok(LocalRecord::new(EntityKind::Player, &target.canonical_id, "scripted")
                .with_field("name", name)
                .with_opt_field("country", item["country"].as_str()))
        }

        async fn upsert(&self, record: &LocalRecord) -> Result<UpsertOutcome, DbError> {
            merge_upsert(self.store.as_ref(), record).await
        }
    }

    async fn setup() -> (Arc<dyn RecordStore>, SyncOrchestrator, Arc<ManualClock>) {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(HostRateLimiter::new(RateLimitConfig::default(), clock.clone()));
        let retry = RetryManager::with_clock(
            RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 100,
                max_backoff_ms: 1000,
                backoff_multiplier: 2.0,
                jitter: false,
            },
            clock.clone(),
        );
        let orchestrator =
            SyncOrchestrator::new(store.clone(), limiter, retry, &SyncConfig::default());
        (store, orchestrator, clock)
    }

    async fn seed(store: &Arc<dyn RecordStore>, id: &str) {
        let record = LocalRecord::new(EntityKind::Player, id, "seed").with_field("name", "Seeded");
        store.upsert(id, &record, &record).await.unwrap();
    }

    // Test 1: Stale, fresh and unfetchable targets in one pass
    #[tokio::test]
    async fn test_stale_fresh_unfetchable() {
        let (store, orchestrator, _) = setup().await;
        seed(&store, "b").await;

        let family = ScriptedFamily::new(
            store.clone(),
            vec![SyncTarget::new("a"), SyncTarget::new("b"), SyncTarget::new("c")],
        )
        .detail("c", Err(SyncError::NotFound));

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(stats.created + stats.updated, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].item_id, "c");
        assert_eq!(family.fetched(), vec!["a", "c"]);
    }

    // Test 2: Second identical pass creates nothing
    #[tokio::test]
    async fn test_idempotent_second_pass() {
        let (store, orchestrator, _) = setup().await;
        let targets = vec![SyncTarget::new("a"), SyncTarget::new("b")];

        let family = ScriptedFamily::new(store.clone(), targets.clone());
        let first = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(first.created, 2);
        let before = store.find_many(&RecordFilter::kind(EntityKind::Player)).await.unwrap();

        let family = ScriptedFamily::new(store.clone(), targets);
        let second = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 2);

        let after = store.find_many(&RecordFilter::kind(EntityKind::Player)).await.unwrap();
        let fields = |rs: &[LocalRecord]| rs.iter().map(|r| r.fields.clone()).collect::<Vec<_>>();
        assert_eq!(fields(&before), fields(&after));
    }

    // Test 3: One failing item among N
    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let (store, orchestrator, _) = setup().await;
        let targets: Vec<_> = (0..5).map(|i| SyncTarget::new(format!("p{}", i))).collect();
        let family = ScriptedFamily::new(store.clone(), targets)
            .detail("p2", Err(SyncError::InvalidData("bad html".to_string())));

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(stats.created, 4);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].item_id, "p2");
        assert_eq!(store.count(&RecordFilter::kind(EntityKind::Player)).await.unwrap(), 4);
    }

    // Test 4: Transient item failures are retried with backoff
    #[tokio::test]
    async fn test_transient_item_retried() {
        let (store, orchestrator, clock) = setup().await;
        let family = ScriptedFamily::new(store.clone(), vec![SyncTarget::new("a")])
            .detail("a", Err(SyncError::NetworkTimeout));

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(family.fetched().len(), 3);
        assert_eq!(stats.errors[0].message, "Network timeout");
        // 100ms + 200ms of backoff on the virtual clock
        assert_eq!(clock.elapsed(), std::time::Duration::from_millis(300));
    }

    // Test 5: Absent detail is a permanent item error
    #[tokio::test]
    async fn test_absent_detail() {
        let (store, orchestrator, _) = setup().await;
        let family =
            ScriptedFamily::new(store.clone(), vec![SyncTarget::new("a")]).detail("a", Ok(None));

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(family.fetched().len(), 1);
        assert!(stats.errors[0].message.starts_with("Empty result"));
    }

    // Test 6: Consecutive auth failures abort the pass
    #[tokio::test]
    async fn test_auth_failure_threshold() {
        let (store, orchestrator, _) = setup().await;
        let targets: Vec<_> = (0..10).map(|i| SyncTarget::new(format!("p{}", i))).collect();
        let mut family = ScriptedFamily::new(store.clone(), targets);
        for i in 0..10 {
            family = family.detail(&format!("p{}", i), Err(SyncError::Unauthorized));
        }

        let err = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::AuthFailuresExceeded(5)));
        assert_eq!(family.fetched().len(), 5);
    }

    // Test 7: A success resets the auth failure streak
    #[tokio::test]
    async fn test_auth_streak_resets() {
        let (store, orchestrator, _) = setup().await;
        let targets: Vec<_> = (0..9).map(|i| SyncTarget::new(format!("p{}", i))).collect();
        let mut family = ScriptedFamily::new(store.clone(), targets);
        for i in [0, 1, 2, 3, 5, 6, 7, 8] {
            family = family.detail(&format!("p{}", i), Err(SyncError::Forbidden));
        }

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.errors.len(), 8);
    }

    // Test 8: Catalog failure is fatal after retries
    #[tokio::test]
    async fn test_catalog_unavailable() {
        let (store, orchestrator, _) = setup().await;
        let family = ScriptedFamily::new(store.clone(), vec![SyncTarget::new("a")]);
        family.list_failures.store(10, Ordering::SeqCst);

        let err = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::CatalogUnavailable(SyncError::ServerError(502))
        ));
    }

    // Test 9: Catalog hiccup recovers within the retry budget
    #[tokio::test]
    async fn test_catalog_transient_recovers() {
        let (store, orchestrator, _) = setup().await;
        let family = ScriptedFamily::new(store.clone(), vec![SyncTarget::new("a")]);
        family.list_failures.store(1, Ordering::SeqCst);

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.created, 1);
    }

    // Test 10: Pagination follows continuation tokens and stops on repeats
    #[tokio::test]
    async fn test_pagination() {
        let (store, orchestrator, _) = setup().await;
        let mut family = ScriptedFamily::new(store.clone(), vec![]);
        family.pages = vec![
            CatalogPage {
                targets: vec![SyncTarget::new("a")],
                next: Some("1".to_string()),
            },
            CatalogPage {
                targets: vec![SyncTarget::new("b"), SyncTarget::new("a")],
                next: Some("1".to_string()),
            },
        ];

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(family.fetched(), vec!["a", "b"]);
    }

    // Test 11: An unusable continuation page ends the listing without failing the pass
    #[tokio::test]
    async fn test_garbled_continuation_page() {
        let (store, orchestrator, _) = setup().await;
        seed(&store, "z").await;
        let mut family = ScriptedFamily::new(store.clone(), vec![]);
        family.pages = vec![CatalogPage {
            targets: vec![SyncTarget::new("a")],
            next: Some("garbled".to_string()),
        }];

        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].item_id, "players:catalog@garbled");

        // Incomplete listing: nothing is deactivated
        let z = store.find_unique(EntityKind::Player, "z").await.unwrap().unwrap();
        assert!(z.active);
    }

    // Test 12: Scoped passes only touch matching targets
    #[tokio::test]
    async fn test_scope_filtering() {
        let (store, orchestrator, _) = setup().await;
        let targets = vec![
            SyncTarget::new("a").with_parent("falcons"),
            SyncTarget::new("b").with_parent("liquid"),
            SyncTarget::new("c").with_parent("falcons"),
        ];

        let family = ScriptedFamily::new(store.clone(), targets.clone());
        let stats = orchestrator
            .run(&family, &"org:falcons".parse().unwrap(), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(family.fetched(), vec!["a", "c"]);

        let family = ScriptedFamily::new(store.clone(), targets);
        let stats = orchestrator
            .run(&family, &JobScope::Entity("b".to_string()), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(family.fetched(), vec!["b"]);
    }

    // Test 13: Stop signal halts between items
    #[tokio::test]
    async fn test_stop_signal() {
        let (store, orchestrator, _) = setup().await;
        let family = ScriptedFamily::new(store.clone(), vec![SyncTarget::new("a")]);
        let stop = StopSignal::new();
        stop.stop();

        let stats = orchestrator.run(&family, &JobScope::All, &stop).await.unwrap();
        assert_eq!(stats, JobStats::default());
        assert!(family.fetched().is_empty());
    }

    // Test 14: First writer keeps the canonical id for an alias
    #[tokio::test]
    async fn test_alias_first_writer_wins() {
        let (store, orchestrator, _) = setup().await;
        store
            .link_alias(EntityKind::Player, "earnings:42", "bugha")
            .await
            .unwrap();
        let existing = LocalRecord::new(EntityKind::Player, "bugha", "seed").with_field("name", "Bugha");
        store.upsert("bugha", &existing, &existing).await.unwrap();

        let family = ScriptedFamily::new(
            store.clone(),
            vec![SyncTarget::new("kyle-giersdorf")
                .with_locator("42")
                .with_alias("earnings:42")],
        )
        .detail("42", Ok(Some(json!({ "name": "Kyle", "country": "US" }))));

        // Stale by hint so the record is re-fetched
        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.skipped, 1);

        let family = ScriptedFamily::new(
            store.clone(),
            vec![SyncTarget::new("kyle-giersdorf")
                .with_locator("42")
                .with_alias("earnings:42")
                .with_hint(Some(Utc::now()))],
        )
        .detail("42", Ok(Some(json!({ "name": "Kyle", "country": "US" }))));
        let stats = orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(stats.updated, 1);

        assert!(store
            .find_unique(EntityKind::Player, "kyle-giersdorf")
            .await
            .unwrap()
            .is_none());
        let stored = store.find_unique(EntityKind::Player, "bugha").await.unwrap().unwrap();
        assert_eq!(stored.field_str("name"), Some("Bugha"));
        assert_eq!(stored.field_str("country"), Some("US"));
    }

    // Test 15: Complete listings deactivate vanished records
    #[tokio::test]
    async fn test_deactivate_missing() {
        let (store, orchestrator, _) = setup().await;
        seed(&store, "gone").await;

        let family = ScriptedFamily::new(store.clone(), vec![SyncTarget::new("a")]);
        orchestrator
            .run(&family, &JobScope::All, &StopSignal::new())
            .await
            .unwrap();

        let gone = store.find_unique(EntityKind::Player, "gone").await.unwrap().unwrap();
        assert!(!gone.active);
        assert_eq!(
            store
                .count(&RecordFilter::kind(EntityKind::Player).active())
                .await
                .unwrap(),
            1
        );
    }

    // Test 16: Scope parsing
    #[test]
    fn test_scope_parse() {
        assert_eq!("all".parse::<JobScope>().unwrap(), JobScope::All);
        assert_eq!("".parse::<JobScope>().unwrap(), JobScope::All);
        assert_eq!(
            "org:falcons".parse::<JobScope>().unwrap(),
            JobScope::Org("falcons".to_string())
        );
        assert_eq!(
            "bugha".parse::<JobScope>().unwrap(),
            JobScope::Entity("bugha".to_string())
        );
        assert!("org:".parse::<JobScope>().is_err());
        assert_eq!(JobScope::Org("x".to_string()).to_string(), "org:x");
    }

    // Test 17: Staleness rules
    #[test]
    fn test_index_staleness() {
        let now = Utc::now();
        let fresh = LocalRecord::new(EntityKind::Player, "fresh", "s")
            .with_field("name", "A")
            .with_source_updated_at(Some(now - chrono::Duration::hours(1)));
        let incomplete = LocalRecord::new(EntityKind::Player, "incomplete", "s");
        let mut old = LocalRecord::new(EntityKind::Player, "old", "s").with_field("name", "B");
        old.last_reconciled_at = now - chrono::Duration::days(2);

        let index = LocalIndex::build(&[fresh, incomplete, old], &["name"], vec![]);
        let day = Some(chrono::Duration::days(1));

        assert!(!index.is_stale(&SyncTarget::new("fresh"), now, day));
        assert!(index.is_stale(&SyncTarget::new("incomplete"), now, day));
        assert!(index.is_stale(&SyncTarget::new("old"), now, day));
        assert!(index.is_stale(&SyncTarget::new("unknown"), now, day));
        assert!(index.is_stale(&SyncTarget::new("fresh").with_hint(Some(now)), now, day));
        assert!(!index.is_stale(
            &SyncTarget::new("fresh").with_hint(Some(now - chrono::Duration::hours(2))),
            now,
            day
        ));
        assert!(!index.is_stale(&SyncTarget::new("old"), now, None));
    }

    // Test 18: Child signals follow their parent but not the other way round
    #[test]
    fn test_child_stop_signal() {
        let parent = StopSignal::new();
        let child = parent.child();
        let grandchild = child.child();

        grandchild.stop();
        assert!(grandchild.is_stopped());
        assert!(!child.is_stopped());
        assert!(!parent.is_stopped());

        let sibling = parent.child();
        parent.stop();
        assert!(sibling.is_stopped());
        assert!(child.is_stopped());
    }
}
