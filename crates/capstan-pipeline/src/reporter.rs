//! Read-side views over the state store for pollers.

use serde::{Deserialize, Serialize};

use capstan_state::{
    DeploymentRecord, LeaseStatus, OperationKind, RecordFilter, RecordPage, StateResult,
    StateStore,
};

/// Lease state of both guarded operations, for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub sync: LeaseStatus,
    pub release: LeaseStatus,
}

/// Read-only facade over the state store used by polling endpoints.
#[derive(Clone)]
pub struct ProgressReporter {
    store: StateStore,
}

impl ProgressReporter {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn get(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        self.store.get_record(id)
    }

    pub fn latest_deployed(&self) -> StateResult<Option<DeploymentRecord>> {
        self.store.latest_deployed()
    }

    pub fn list(
        &self,
        filter: &RecordFilter,
        page: usize,
        page_size: usize,
    ) -> StateResult<RecordPage> {
        self.store.list_records(filter, page, page_size)
    }

    /// Snapshot of both operation leases. Expired leases are swept first
    /// so the answer reflects liveness, not stale rows.
    pub fn operation_status(&self) -> OperationStatus {
        self.store.sweep_expired_leases();
        OperationStatus {
            sync: self.store.lease_status(OperationKind::Sync),
            release: self.store.lease_status(OperationKind::Release),
        }
    }
}
