//! redb table definitions for the Capstan state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Deployment records are keyed by their UUID; leases are keyed by
//! operation kind, so the table key itself is the uniqueness constraint
//! that guarantees at most one lease per operation.

use redb::TableDefinition;

/// Deployment records keyed by `{deployment_id}` (UUID v4).
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Operation leases keyed by operation kind (`"sync"` or `"release"`).
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
