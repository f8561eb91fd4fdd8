//! Operation lease operations on the state store.
//!
//! Leases give one owner exclusive rights to run an operation kind (sync
//! or release) across every service instance sharing the database. The
//! `leases` table is keyed by operation kind, so at most one row per kind
//! can exist; acquisition reads, reclaims, and inserts inside a single
//! serialized write transaction — an atomic insert-if-absent, never a
//! read-then-write race across transactions.
//!
//! Expired leases are reclaimed lazily: `acquire` deletes them before
//! inserting, `status` deletes them and reports `Unlocked`, and
//! `sweep_expired` bulk-deletes them. Nothing cancels the operation a
//! stale lease belonged to; expiry only lets a new owner start.

use redb::{ReadableDatabase, ReadableTable};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, map_err};
use crate::tables::LEASES;
use crate::types::{AcquireOutcome, LeaseStatus, OperationKind, OperationLease, now_millis};

impl StateStore {
    /// Try to take the lease for `kind`.
    ///
    /// Returns `Conflict` with the current holder if an unexpired lease
    /// exists. An expired lease is deleted and replaced. Store failures
    /// are fatal to the caller.
    pub fn acquire_lease(
        &self,
        kind: OperationKind,
        owner_id: &str,
        owner_label: &str,
    ) -> StateResult<AcquireOutcome> {
        let now = now_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Ok(lease) to commit, Err(holder) to abort with a conflict.
        let attempt: Result<OperationLease, (String, u64)> = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;

            let existing: Option<OperationLease> =
                match table.get(kind.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };

            match existing {
                Some(lease) if now.saturating_sub(lease.acquired_at) < self.lease_timeout_ms => {
                    Err((lease.owner_label, lease.acquired_at))
                }
                other => {
                    if let Some(stale) = other {
                        // Stale lease: reclaim it before inserting ours.
                        info!(
                            kind = kind.as_str(),
                            stale_owner = %stale.owner_label,
                            "reclaiming expired lease"
                        );
                        table.remove(kind.as_str()).map_err(map_err!(Write))?;
                    }
                    let lease = OperationLease {
                        kind,
                        owner_id: owner_id.to_string(),
                        owner_label: owner_label.to_string(),
                        acquired_at: now,
                        expires_at: now + self.lease_timeout_ms,
                    };
                    let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                    table
                        .insert(kind.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    Ok(lease)
                }
            }
        };

        match attempt {
            Ok(lease) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(kind = kind.as_str(), owner = owner_label, "lease acquired");
                Ok(AcquireOutcome::Acquired(lease))
            }
            Err((owner_label, acquired_at)) => {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(
                    kind = kind.as_str(),
                    holder = %owner_label,
                    "lease acquisition conflict"
                );
                Ok(AcquireOutcome::Conflict {
                    owner_label,
                    acquired_at,
                })
            }
        }
    }

    /// Release the lease for `kind` if `owner_id` holds it.
    ///
    /// Releasing a lease you do not own is a no-op, not an error. Returns
    /// whether a lease was actually removed.
    pub fn release_lease(&self, kind: OperationKind, owner_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let owned = match table.get(kind.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lease: OperationLease =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    lease.owner_id == owner_id
                }
                None => false,
            };
            if owned {
                table.remove(kind.as_str()).map_err(map_err!(Write))?;
            }
            owned
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = kind.as_str(), removed, "lease release");
        Ok(removed)
    }

    /// Observable lease state for `kind`, reclaiming an expired lease as a
    /// side effect. Store errors degrade to `Unlocked` so dashboards never
    /// block on the lock table.
    pub fn lease_status(&self, kind: OperationKind) -> LeaseStatus {
        match self.lease_status_inner(kind) {
            Ok(status) => status,
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "lease status query failed");
                LeaseStatus::Unlocked
            }
        }
    }

    fn lease_status_inner(&self, kind: OperationKind) -> StateResult<LeaseStatus> {
        let now = now_millis();
        let lease: Option<OperationLease> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            match table.get(kind.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            }
        };

        let Some(lease) = lease else {
            return Ok(LeaseStatus::Unlocked);
        };

        if now.saturating_sub(lease.acquired_at) >= self.lease_timeout_ms {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
                table.remove(kind.as_str()).map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            info!(kind = kind.as_str(), "expired lease reclaimed on status read");
            return Ok(LeaseStatus::Unlocked);
        }

        Ok(LeaseStatus::Locked {
            owner_label: lease.owner_label,
            acquired_at: lease.acquired_at,
            expires_at: lease.expires_at,
        })
    }

    /// Bulk-delete all leases older than the timeout. Returns how many
    /// were removed; degrades to 0 on store error.
    pub fn sweep_expired_leases(&self) -> usize {
        match self.sweep_expired_inner() {
            Ok(count) => {
                if count > 0 {
                    info!(count, "swept expired leases");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "lease sweep failed");
                0
            }
        }
    }

    fn sweep_expired_inner(&self) -> StateResult<usize> {
        let now = now_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let expired: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, value) = entry.ok()?;
                    let lease: OperationLease = serde_json::from_slice(value.value()).ok()?;
                    (now.saturating_sub(lease.acquired_at) >= self.lease_timeout_ms)
                        .then(|| key.value().to_string())
                })
                .collect();
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            expired.len()
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}
