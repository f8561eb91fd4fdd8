//! StateStore — redb-backed persistence for Capstan.
//!
//! Holds deployment records and operation leases in one database. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! Record mutations go through [`StateStore::update_record`], which applies
//! a closure inside a single write transaction and enforces the record
//! invariants: status never moves backward, terminal records are immutable,
//! logs are append-only, `updated_at` is always stamped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Default lease timeout: a stale lease may be reclaimed after 5 minutes.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
    pub(crate) lease_timeout_ms: u64,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            lease_timeout_ms: DEFAULT_LEASE_TIMEOUT.as_millis() as u64,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            lease_timeout_ms: DEFAULT_LEASE_TIMEOUT.as_millis() as u64,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Override the lease timeout (default 5 minutes).
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployment records ─────────────────────────────────────────

    /// Persist the initial record for a new pipeline run.
    pub fn create_record(&self, spec: RecordSpec) -> StateResult<DeploymentRecord> {
        let record = DeploymentRecord::new(spec);
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %record.id, "deployment record created");
        Ok(record)
    }

    /// Apply a partial update to a record inside one write transaction.
    ///
    /// The closure receives the current record and mutates it in place.
    /// Updates that would move `status` backward, touch a terminal record,
    /// or truncate `logs` are rejected. `updated_at` is stamped after the
    /// closure runs. Returns the stored record.
    pub fn update_record<F>(&self, id: &str, apply: F) -> StateResult<DeploymentRecord>
    where
        F: FnOnce(&mut DeploymentRecord),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let before: DeploymentRecord = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(id.to_string())),
            };

            if before.status.is_terminal() {
                return Err(StateError::TerminalRecord(id.to_string()));
            }

            let mut after = before.clone();
            apply(&mut after);

            if after.status != DeploymentStatus::Failed
                && after.status.rank() < before.status.rank()
            {
                return Err(StateError::InvalidTransition {
                    from: before.status.as_str().to_string(),
                    to: after.status.as_str().to_string(),
                });
            }
            if after.logs.len() < before.logs.len()
                || after.logs[..before.logs.len()] != before.logs[..]
            {
                return Err(StateError::LogsTruncated);
            }

            after.updated_at = now_millis();
            let value = serde_json::to_vec(&after).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            after
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Get a record by id.
    pub fn get_record(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// The most recently completed successful release, if any.
    pub fn latest_deployed(&self) -> StateResult<Option<DeploymentRecord>> {
        let all = self.all_records()?;
        Ok(all
            .into_iter()
            .filter(|r| r.status == DeploymentStatus::Deployed)
            .max_by_key(|r| r.completed_at.unwrap_or(r.updated_at)))
    }

    /// List records newest-first with filtering, pagination, and a status
    /// tally.
    ///
    /// `status_counts` is computed over the status/branch-filtered set
    /// before search and pagination apply; the record page additionally
    /// honors `filter.search`. Pages are 1-based.
    pub fn list_records(
        &self,
        filter: &RecordFilter,
        page: usize,
        page_size: usize,
    ) -> StateResult<RecordPage> {
        let mut all = self.all_records()?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let branch_lower = filter.branch.as_deref().map(str::to_lowercase);
        let narrowed: Vec<DeploymentRecord> = all
            .into_iter()
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| {
                branch_lower
                    .as_deref()
                    .is_none_or(|b| r.branch.to_lowercase().contains(b))
            })
            .collect();

        let mut status_counts = StatusCounts::default();
        for record in &narrowed {
            status_counts.bump(record.status);
        }

        let search_lower = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        let matched: Vec<DeploymentRecord> = narrowed
            .into_iter()
            .filter(|r| {
                search_lower
                    .as_deref()
                    .is_none_or(|needle| record_matches(r, needle))
            })
            .collect();

        let page = page.max(1);
        let page_size = page_size.max(1);
        let total_items = matched.len();
        let total_pages = total_items.div_ceil(page_size);
        let start = (page - 1) * page_size;
        let records: Vec<DeploymentRecord> =
            matched.into_iter().skip(start).take(page_size).collect();

        Ok(RecordPage {
            records,
            pagination: Pagination {
                current_page: page,
                total_pages,
                total_items,
                page_size,
                has_next_page: page < total_pages,
                has_previous_page: page > 1 && total_pages > 0,
            },
            status_counts,
        })
    }

    fn all_records(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

/// Case-insensitive search over commit, message, branch, and initiator.
fn record_matches(record: &DeploymentRecord, needle: &str) -> bool {
    record.commit.to_lowercase().contains(needle)
        || record.message.to_lowercase().contains(needle)
        || record.branch.to_lowercase().contains(needle)
        || record.initiator.name.to_lowercase().contains(needle)
        || record.initiator.label.to_lowercase().contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(branch: &str, commit: &str) -> RecordSpec {
        RecordSpec {
            branch: branch.to_string(),
            commit: commit.to_string(),
            message: "update pricing tables".to_string(),
            author: "dev".to_string(),
            initiator: Initiator {
                id: "u1".to_string(),
                name: "Ada".to_string(),
                label: "ada@example.com".to_string(),
            },
        }
    }

    #[test]
    fn create_and_get_record() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.create_record(test_spec("main", "abc123")).unwrap();

        let fetched = store.get_record(&record.id).unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(fetched.status, DeploymentStatus::Initializing);
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_record("nope").unwrap().is_none());
    }

    #[test]
    fn update_advances_status_and_stamps_updated_at() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.create_record(test_spec("main", "abc123")).unwrap();

        let updated = store
            .update_record(&record.id, |r| {
                r.status = DeploymentStatus::Syncing;
                r.steps.checkout.start(now_millis());
                r.logs.push("Syncing repository".to_string());
            })
            .unwrap();

        assert_eq!(updated.status, DeploymentStatus::Syncing);
        assert_eq!(updated.logs.len(), 2);
        assert!(updated.updated_at >= record.updated_at);
    }

    #[test]
    fn update_rejects_backward_status() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.create_record(test_spec("main", "abc123")).unwrap();
        store
            .update_record(&record.id, |r| r.status = DeploymentStatus::Building)
            .unwrap();

        let err = store
            .update_record(&record.id, |r| r.status = DeploymentStatus::Syncing)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn update_allows_failure_from_any_nonterminal_state() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.create_record(test_spec("main", "abc123")).unwrap();
        store
            .update_record(&record.id, |r| r.status = DeploymentStatus::Deploying)
            .unwrap();

        let failed = store
            .update_record(&record.id, |r| {
                r.status = DeploymentStatus::Failed;
                r.error = Some("rollout timed out".to_string());
            })
            .unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
    }

    #[test]
    fn terminal_records_are_immutable() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.create_record(test_spec("main", "abc123")).unwrap();
        store
            .update_record(&record.id, |r| r.status = DeploymentStatus::Deployed)
            .unwrap();

        let err = store
            .update_record(&record.id, |r| r.logs.push("late write".to_string()))
            .unwrap_err();
        assert!(matches!(err, StateError::TerminalRecord(_)));
    }

    #[test]
    fn update_rejects_log_truncation() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.create_record(test_spec("main", "abc123")).unwrap();

        let err = store
            .update_record(&record.id, |r| {
                r.logs.clear();
            })
            .unwrap_err();
        assert!(matches!(err, StateError::LogsTruncated));
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.update_record("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn latest_deployed_picks_most_recent_completion() {
        let store = StateStore::open_in_memory().unwrap();

        let first = store.create_record(test_spec("main", "aaa111")).unwrap();
        store
            .update_record(&first.id, |r| {
                r.status = DeploymentStatus::Deployed;
                r.completed_at = Some(1_000);
            })
            .unwrap();

        let second = store.create_record(test_spec("main", "bbb222")).unwrap();
        store
            .update_record(&second.id, |r| {
                r.status = DeploymentStatus::Deployed;
                r.completed_at = Some(2_000);
            })
            .unwrap();

        let third = store.create_record(test_spec("main", "ccc333")).unwrap();
        store
            .update_record(&third.id, |r| r.status = DeploymentStatus::Failed)
            .unwrap();

        let latest = store.latest_deployed().unwrap().unwrap();
        assert_eq!(latest.commit, "bbb222");
    }

    #[test]
    fn latest_deployed_none_when_nothing_succeeded() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_record(test_spec("main", "abc123")).unwrap();
        assert!(store.latest_deployed().unwrap().is_none());
    }

    #[test]
    fn list_filters_by_status_and_branch() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.create_record(test_spec("main", "aaa111")).unwrap();
        store
            .update_record(&a.id, |r| r.status = DeploymentStatus::Deployed)
            .unwrap();
        store
            .create_record(test_spec("release/2.0", "bbb222"))
            .unwrap();

        let page = store
            .list_records(
                &RecordFilter {
                    status: Some(DeploymentStatus::Deployed),
                    ..Default::default()
                },
                1,
                20,
            )
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].commit, "aaa111");

        let page = store
            .list_records(
                &RecordFilter {
                    branch: Some("release".to_string()),
                    ..Default::default()
                },
                1,
                20,
            )
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].branch, "release/2.0");
    }

    #[test]
    fn list_search_matches_commit_message_and_initiator() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_record(test_spec("main", "deadbeef")).unwrap();
        store.create_record(test_spec("main", "cafef00d")).unwrap();

        let by_commit = store
            .list_records(
                &RecordFilter {
                    search: Some("DEADBEEF".to_string()),
                    ..Default::default()
                },
                1,
                20,
            )
            .unwrap();
        assert_eq!(by_commit.records.len(), 1);

        let by_initiator = store
            .list_records(
                &RecordFilter {
                    search: Some("ada@".to_string()),
                    ..Default::default()
                },
                1,
                20,
            )
            .unwrap();
        assert_eq!(by_initiator.records.len(), 2);
    }

    #[test]
    fn list_paginates_and_counts_statuses() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            let record = store
                .create_record(test_spec("main", &format!("c{i}")))
                .unwrap();
            if i < 2 {
                store
                    .update_record(&record.id, |r| r.status = DeploymentStatus::Deployed)
                    .unwrap();
            }
        }

        let page = store
            .list_records(&RecordFilter::default(), 2, 2)
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.pagination.total_items, 5);
        assert_eq!(page.pagination.total_pages, 3);
        assert!(page.pagination.has_next_page);
        assert!(page.pagination.has_previous_page);

        assert_eq!(page.status_counts.total, 5);
        assert_eq!(page.status_counts.deployed, 2);
        assert_eq!(page.status_counts.initializing, 3);
        assert_eq!(page.status_counts.failed, 0);
    }

    #[test]
    fn search_does_not_skew_status_counts() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_record(test_spec("main", "deadbeef")).unwrap();
        store.create_record(test_spec("main", "cafef00d")).unwrap();

        let page = store
            .list_records(
                &RecordFilter {
                    search: Some("deadbeef".to_string()),
                    ..Default::default()
                },
                1,
                20,
            )
            .unwrap();
        assert_eq!(page.records.len(), 1);
        // The tally covers the status/branch-filtered set, not the search.
        assert_eq!(page.status_counts.total, 2);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("capstan.redb");

        let id = {
            let store = StateStore::open(&db_path).unwrap();
            store.create_record(test_spec("main", "abc123")).unwrap().id
        };

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let record = store.get_record(&id).unwrap();
        assert!(record.is_some());
        assert_eq!(record.unwrap().commit, "abc123");
    }
}
