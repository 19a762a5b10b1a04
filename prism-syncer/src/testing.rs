//! # Reusable test doubles for the view syncer.
//!
//! The in-memory gateway mirrors the Postgres gateway's observable
//! semantics (tombstones, ordered patch pages, compare-and-swap commits) so
//! updater and service tests run without a database. Failure toggles stand
//! in for storage outages.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use prism_core::{
    models::{
        cvr::{ClientRecord, CvrSnapshot, QueryRecord, RowRecord},
        query::QueryHash,
        row::RowId,
        version::CvrVersion,
        ClientId,
    },
    storage::{
        ClientWrite, ConfigPatchRecord, CvrGateway, CvrWriteBatch, QueryWrite, RowPatchCursor,
        RowPatchRecord, RowWrite, StorageError,
    },
    sync::PatchOp,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

#[derive(Default)]
struct GroupTables {
    instance: Option<(CvrVersion, NaiveDateTime)>,
    clients: BTreeMap<ClientId, ClientWrite>,
    queries: BTreeMap<QueryHash, QueryWrite>,
    rows: BTreeMap<(String, String, String), RowWrite>,
}

#[derive(Default)]
pub struct InMemoryCvrGateway {
    groups: Mutex<HashMap<String, GroupTables>>,
    fail_loads: AtomicBool,
    fail_commits: AtomicBool,
}

impl InMemoryCvrGateway {
    /// Makes every subsequent `load` fail with `Unavailable`.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `commit` fail with `Unavailable`.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// The stored version cookie of a group, if any. Used by tests asserting
    /// that a failed cycle left the CVR untouched.
    pub fn stored_version(&self, group_id: &str) -> Option<String> {
        let groups = self.groups.lock().expect("gateway lock poisoned");
        groups
            .get(group_id)
            .and_then(|t| t.instance.as_ref())
            .map(|(version, _)| version.to_cookie())
    }

    fn row_key_tuple(row_id: &RowId) -> (String, String, String) {
        (row_id.schema.clone(), row_id.table.clone(), row_id.key.canonical())
    }
}

fn in_range(version: &CvrVersion, from: &CvrVersion, to: &CvrVersion) -> bool {
    version > from && version <= to
}

#[async_trait]
impl CvrGateway for InMemoryCvrGateway {
    async fn load(&self, group_id: &str) -> Result<Option<CvrSnapshot>, StorageError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("simulated load failure".to_string()));
        }
        let groups = self.groups.lock().expect("gateway lock poisoned");
        let Some(tables) = groups.get(group_id) else {
            return Ok(None);
        };
        let Some((version, last_active)) = &tables.instance else {
            return Ok(None);
        };

        let mut snapshot = CvrSnapshot::empty(group_id);
        snapshot.version = version.clone();
        snapshot.last_active = *last_active;
        for (client_id, write) in &tables.clients {
            if write.deleted {
                continue;
            }
            snapshot.clients.insert(
                client_id.clone(),
                ClientRecord {
                    id: client_id.clone(),
                    patch_version: write.patch_version.clone(),
                    desired_query_ids: write
                        .desired_query_ids
                        .iter()
                        .cloned()
                        .collect(),
                },
            );
        }
        for (hash, write) in &tables.queries {
            if write.deleted {
                continue;
            }
            let ast = write
                .ast
                .clone()
                .ok_or_else(|| {
                    StorageError::Unexpected(format!("live query `{}` without ast", hash))
                })?;
            snapshot.queries.insert(
                hash.clone(),
                QueryRecord {
                    id: hash.clone(),
                    ast,
                    internal: write.internal,
                    desired_by: write.desired_by.clone(),
                    transformation_hash: write.transformation_hash.clone(),
                    transformation_version: write.transformation_version.clone(),
                    patch_version: write.patch_version.clone(),
                },
            );
        }
        for write in tables.rows.values() {
            snapshot.rows.insert(
                write.row_id.clone(),
                RowRecord {
                    patch_version: write.patch_version.clone(),
                    row_version: write.row_version.clone(),
                    ref_counts: write.ref_counts.clone(),
                },
            );
        }
        Ok(Some(snapshot))
    }

    async fn row_patches_page(
        &self,
        group_id: &str,
        from: &CvrVersion,
        to: &CvrVersion,
        cursor: Option<&RowPatchCursor>,
        limit: i64,
    ) -> Result<Vec<RowPatchRecord>, StorageError> {
        let groups = self.groups.lock().expect("gateway lock poisoned");
        let Some(tables) = groups.get(group_id) else {
            return Ok(Vec::new());
        };
        let mut records: Vec<RowPatchRecord> = tables
            .rows
            .values()
            .filter(|w| in_range(&w.patch_version, from, to))
            .map(|w| RowPatchRecord {
                row_id: w.row_id.clone(),
                patch_version: w.patch_version.clone(),
                row_version: w.row_version.clone(),
                ref_counts: w.ref_counts.clone(),
            })
            .collect();
        records.sort_by_key(|r| {
            (
                r.patch_version.clone(),
                r.row_id.schema.clone(),
                r.row_id.table.clone(),
                r.row_id.key.canonical(),
            )
        });
        let records = records
            .into_iter()
            .filter(|r| match cursor {
                None => true,
                Some(c) => {
                    (
                        r.patch_version.clone(),
                        r.row_id.schema.clone(),
                        r.row_id.table.clone(),
                        r.row_id.key.canonical(),
                    ) > (
                        c.patch_version.clone(),
                        c.schema.clone(),
                        c.table.clone(),
                        c.row_key_text.clone(),
                    )
                }
            })
            .take(limit as usize)
            .collect();
        Ok(records)
    }

    async fn config_patches(
        &self,
        group_id: &str,
        from: &CvrVersion,
        to: &CvrVersion,
    ) -> Result<Vec<ConfigPatchRecord>, StorageError> {
        let groups = self.groups.lock().expect("gateway lock poisoned");
        let Some(tables) = groups.get(group_id) else {
            return Ok(Vec::new());
        };
        let mut patches = Vec::new();
        for (client_id, write) in &tables.clients {
            if in_range(&write.patch_version, from, to) {
                patches.push(ConfigPatchRecord::Client {
                    op: if write.deleted { PatchOp::Del } else { PatchOp::Put },
                    client_id: client_id.clone(),
                    patch_version: write.patch_version.clone(),
                });
            }
        }
        for (hash, write) in &tables.queries {
            if let Some(patch_version) = &write.patch_version {
                if in_range(patch_version, from, to) {
                    if write.deleted {
                        patches.push(ConfigPatchRecord::GotQuery {
                            op: PatchOp::Del,
                            hash: hash.clone(),
                            ast: None,
                            patch_version: patch_version.clone(),
                        });
                    } else if write.transformation_hash.is_some() {
                        patches.push(ConfigPatchRecord::GotQuery {
                            op: PatchOp::Put,
                            hash: hash.clone(),
                            ast: write.ast.clone(),
                            patch_version: patch_version.clone(),
                        });
                    }
                }
            }
            if write.deleted {
                continue;
            }
            for (client_id, desired_at) in &write.desired_by {
                if in_range(desired_at, from, to) {
                    patches.push(ConfigPatchRecord::DesiredQuery {
                        op: PatchOp::Put,
                        client_id: client_id.clone(),
                        hash: hash.clone(),
                        ast: write.ast.clone(),
                        patch_version: desired_at.clone(),
                    });
                }
            }
        }
        patches.sort_by(|a, b| {
            (a.patch_version(), a.sort_key()).cmp(&(b.patch_version(), b.sort_key()))
        });
        Ok(patches)
    }

    async fn commit(&self, group_id: &str, batch: &CvrWriteBatch) -> Result<(), StorageError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("simulated commit failure".to_string()));
        }
        let mut groups = self.groups.lock().expect("gateway lock poisoned");
        let tables = groups.entry(group_id.to_string()).or_default();

        match (&batch.expected_version, &tables.instance) {
            (None, None) => {}
            (Some(expected), Some((stored, _))) if expected == stored => {}
            (expected, _) => {
                return Err(StorageError::ConcurrentModification(
                    group_id.to_string(),
                    expected
                        .as_ref()
                        .map(CvrVersion::to_cookie)
                        .unwrap_or_else(|| "<none>".to_string()),
                ));
            }
        }

        tables.instance = Some((batch.version.clone(), batch.last_active));
        for write in &batch.clients {
            tables
                .clients
                .insert(write.client_id.clone(), write.clone());
        }
        for write in &batch.queries {
            tables
                .queries
                .insert(write.hash.clone(), write.clone());
        }
        for write in &batch.rows {
            tables
                .rows
                .insert(Self::row_key_tuple(&write.row_id), write.clone());
        }
        Ok(())
    }
}
