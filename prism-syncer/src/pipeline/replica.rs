//! The in-process handle onto the local replica.
//!
//! The logical-replication ingester (out of scope here) writes versioned
//! deltas into this handle; pipeline drivers read a consistent checkpoint at
//! startup and then follow the delta log. Every applied delta bumps the
//! version on a watch channel, which is the replica-version-ready signal the
//! view syncer's run loop consumes.

use prism_core::models::{Row, RowKey, StateVersion};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, RwLock},
};
use tokio::sync::watch;

/// One table's data as the replica sees it. Rows carry the `_0_version`
/// column like every other column.
#[derive(Clone, Debug, Default)]
pub struct TableSnapshot {
    pub columns: BTreeSet<String>,
    pub rows: BTreeMap<RowKey, Row>,
}

/// One replicated row change. `row == None` deletes the row.
#[derive(Clone, Debug)]
pub struct ReplicaChange {
    pub schema: String,
    pub table: String,
    pub key: RowKey,
    pub row: Option<Row>,
}

/// One replica advancement: the changes of one upstream transaction batch
/// and the state version it produces.
#[derive(Clone, Debug)]
pub struct ReplicaDelta {
    pub version: StateVersion,
    pub changes: Vec<ReplicaChange>,
}

struct ReplicaInner {
    version: StateVersion,
    tables: HashMap<(String, String), TableSnapshot>,
    log: Vec<ReplicaDelta>,
}

/// Consistent view a driver initializes from: table data, the version it
/// represents, and the log offset to resume from.
pub(crate) struct ReplicaCheckpoint {
    pub version: StateVersion,
    pub tables: HashMap<(String, String), TableSnapshot>,
    pub log_offset: usize,
}

#[derive(Clone)]
pub struct ReplicaHandle {
    inner: Arc<RwLock<ReplicaInner>>,
    versions: watch::Sender<StateVersion>,
}

impl ReplicaHandle {
    pub fn new(version: StateVersion) -> Self {
        let (versions, _) = watch::channel(version.clone());
        ReplicaHandle {
            inner: Arc::new(RwLock::new(ReplicaInner {
                version,
                tables: HashMap::new(),
                log: Vec::new(),
            })),
            versions,
        }
    }

    /// The replica-version-ready signal stream consumed by view syncers.
    pub fn subscribe(&self) -> watch::Receiver<StateVersion> {
        self.versions.subscribe()
    }

    pub fn version(&self) -> StateVersion {
        self.inner
            .read()
            .expect("replica lock poisoned")
            .version
            .clone()
    }

    /// Registers a table with its column set. Called by the ingester during
    /// initial snapshot replication.
    pub fn create_table(
        &self,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let mut inner = self.inner.write().expect("replica lock poisoned");
        let snapshot = inner
            .tables
            .entry((schema.into(), table.into()))
            .or_default();
        snapshot
            .columns
            .extend(columns.into_iter().map(Into::into));
    }

    /// Seeds a row without producing a delta; part of initial snapshot
    /// replication.
    pub fn seed_row(&self, schema: &str, table: &str, key: RowKey, row: Row) {
        let mut inner = self.inner.write().expect("replica lock poisoned");
        let snapshot = inner
            .tables
            .entry((schema.to_string(), table.to_string()))
            .or_default();
        snapshot
            .columns
            .extend(row.keys().cloned());
        snapshot.rows.insert(key, row);
    }

    /// Applies one replicated delta and signals the new version.
    pub fn apply_delta(&self, delta: ReplicaDelta) {
        {
            let mut inner = self.inner.write().expect("replica lock poisoned");
            for change in &delta.changes {
                let snapshot = inner
                    .tables
                    .entry((change.schema.clone(), change.table.clone()))
                    .or_default();
                match &change.row {
                    Some(row) => {
                        snapshot
                            .columns
                            .extend(row.keys().cloned());
                        snapshot
                            .rows
                            .insert(change.key.clone(), row.clone());
                    }
                    None => {
                        snapshot.rows.remove(&change.key);
                    }
                }
            }
            inner.version = delta.version.clone();
            inner.log.push(delta);
        }
        let version = self.version();
        let _ = self.versions.send(version);
    }

    pub(crate) fn checkpoint(&self) -> ReplicaCheckpoint {
        let inner = self.inner.read().expect("replica lock poisoned");
        ReplicaCheckpoint {
            version: inner.version.clone(),
            tables: inner.tables.clone(),
            log_offset: inner.log.len(),
        }
    }

    pub(crate) fn delta_at(&self, index: usize) -> Option<ReplicaDelta> {
        let inner = self.inner.read().expect("replica lock poisoned");
        inner.log.get(index).cloned()
    }
}
