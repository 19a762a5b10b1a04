//! CVR updaters.
//!
//! Two builder-style objects stage modifications against a loaded CVR
//! snapshot and atomically flush, producing the next snapshot:
//!
//! * [`ConfigUpdater`] handles client/query membership changes (desired
//!   query put/del/clear, client add/remove). It bumps the minor version.
//! * [`RowsUpdater`] handles row-set changes coming out of the pipeline
//!   (query tracking, the reference-count merge, unreferenced-row
//!   deletion). Its version carries the pipeline's state version.
//!
//! Staged state is keyed the same way the durable tables are, so a flush is
//! exactly one [`CvrWriteBatch`] handed to the store.

use super::CvrStore;
use crate::{error::SyncError, syncer::client::PokePatch};
use chrono::Utc;
use prism_core::{
    models::{
        cvr::{ClientRecord, CvrSnapshot, QueryRecord, RowRecord},
        query::{QueryAst, QueryHash},
        row::{Row, RowId},
        version::{CvrVersion, StateVersion},
        ClientId,
    },
    storage::{ClientWrite, CvrWriteBatch, QueryWrite, RowWrite},
    sync::{ClientPatch, PatchOp, QueryPatch},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, warn};

fn client_write(record: &ClientRecord) -> ClientWrite {
    ClientWrite {
        client_id: record.id.clone(),
        patch_version: record.patch_version.clone(),
        desired_query_ids: record
            .desired_query_ids
            .iter()
            .cloned()
            .collect(),
        deleted: false,
    }
}

fn query_write(record: &QueryRecord) -> QueryWrite {
    QueryWrite {
        hash: record.id.clone(),
        ast: Some(record.ast.clone()),
        internal: record.internal,
        desired_by: record.desired_by.clone(),
        transformation_hash: record.transformation_hash.clone(),
        transformation_version: record.transformation_version.clone(),
        patch_version: record.patch_version.clone(),
        deleted: false,
    }
}

fn query_record(write: &QueryWrite) -> Result<QueryRecord, SyncError> {
    Ok(QueryRecord {
        id: write.hash.clone(),
        ast: write
            .ast
            .clone()
            .ok_or_else(|| {
                SyncError::Internal(format!("staged live query `{}` without ast", write.hash))
            })?,
        internal: write.internal,
        desired_by: write.desired_by.clone(),
        transformation_hash: write.transformation_hash.clone(),
        transformation_version: write.transformation_version.clone(),
        patch_version: write.patch_version.clone(),
    })
}

/// Shared staging state of both updaters.
struct UpdaterCore {
    store: CvrStore,
    base: Arc<CvrSnapshot>,
    exists: bool,
    new_version: CvrVersion,
    clients: BTreeMap<ClientId, ClientWrite>,
    queries: BTreeMap<QueryHash, QueryWrite>,
    rows: BTreeMap<RowId, RowWrite>,
}

impl UpdaterCore {
    fn new(store: CvrStore, base: Arc<CvrSnapshot>, exists: bool, new_version: CvrVersion) -> Self {
        UpdaterCore {
            store,
            base,
            exists,
            new_version,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            rows: BTreeMap::new(),
        }
    }

    fn current_client(&self, client_id: &str) -> Option<ClientRecord> {
        if let Some(staged) = self.clients.get(client_id) {
            if staged.deleted {
                return None;
            }
            return Some(ClientRecord {
                id: staged.client_id.clone(),
                patch_version: staged.patch_version.clone(),
                desired_query_ids: staged
                    .desired_query_ids
                    .iter()
                    .cloned()
                    .collect(),
            });
        }
        self.base.clients.get(client_id).cloned()
    }

    fn current_query(&self, hash: &QueryHash) -> Option<QueryRecord> {
        if let Some(staged) = self.queries.get(hash) {
            if staged.deleted {
                return None;
            }
            return query_record(staged).ok();
        }
        self.base.queries.get(hash).cloned()
    }

    fn put_client_patch(&mut self, record: &ClientRecord) {
        self.clients
            .insert(record.id.clone(), client_write(record));
    }

    fn put_query_patch(&mut self, record: &QueryRecord) {
        self.queries
            .insert(record.id.clone(), query_write(record));
    }

    fn put_query_tombstone(&mut self, hash: &QueryHash) {
        self.queries.insert(
            hash.clone(),
            QueryWrite {
                hash: hash.clone(),
                ast: None,
                internal: false,
                desired_by: BTreeMap::new(),
                transformation_hash: None,
                transformation_version: None,
                patch_version: Some(self.new_version.clone()),
                deleted: true,
            },
        );
    }

    fn put_row_patch(&mut self, write: RowWrite) {
        self.rows.insert(write.row_id.clone(), write);
    }

    fn has_changes(&self) -> bool {
        !self.clients.is_empty() || !self.queries.is_empty() || !self.rows.is_empty()
    }

    /// Persists all staged patches in one atomic commit and applies them to
    /// the base snapshot.
    async fn flush(self) -> Result<Arc<CvrSnapshot>, SyncError> {
        let last_active = Utc::now().naive_utc();
        let batch = CvrWriteBatch {
            expected_version: self.exists.then(|| self.base.version.clone()),
            version: self.new_version.clone(),
            last_active,
            clients: self.clients.values().cloned().collect(),
            queries: self.queries.values().cloned().collect(),
            rows: self.rows.values().cloned().collect(),
        };
        self.store.flush(&batch).await?;

        let mut snapshot = (*self.base).clone();
        snapshot.version = self.new_version;
        snapshot.last_active = last_active;
        for (client_id, write) in self.clients {
            if write.deleted {
                snapshot.clients.remove(&client_id);
            } else {
                snapshot.clients.insert(
                    client_id.clone(),
                    ClientRecord {
                        id: client_id,
                        patch_version: write.patch_version,
                        desired_query_ids: write.desired_query_ids.into_iter().collect(),
                    },
                );
            }
        }
        for (hash, write) in self.queries {
            if write.deleted {
                snapshot.queries.remove(&hash);
            } else {
                snapshot
                    .queries
                    .insert(hash, query_record(&write)?);
            }
        }
        for (row_id, write) in self.rows {
            snapshot.rows.insert(
                row_id,
                RowRecord {
                    patch_version: write.patch_version,
                    row_version: write.row_version,
                    ref_counts: write.ref_counts,
                },
            );
        }
        debug!(group_id = %self.store.group_id(), version = %snapshot.version, "cvr flushed");
        Ok(Arc::new(snapshot))
    }
}

/// Config-driven updater: client and desired-query membership. Bumps the
/// minor version once per cycle.
pub struct ConfigUpdater {
    core: UpdaterCore,
    patches: Vec<PokePatch>,
}

impl ConfigUpdater {
    pub fn new(store: CvrStore, base: Arc<CvrSnapshot>, exists: bool) -> Self {
        let new_version = base.version.bump_minor();
        ConfigUpdater { core: UpdaterCore::new(store, base, exists, new_version), patches: Vec::new() }
    }

    pub fn updated_version(&self) -> &CvrVersion {
        &self.core.new_version
    }

    pub fn has_changes(&self) -> bool {
        self.core.has_changes()
    }

    /// Adds the client if absent.
    pub fn put_client(&mut self, client_id: &str) {
        if self.core.current_client(client_id).is_some() {
            return;
        }
        let record = ClientRecord {
            id: client_id.to_string(),
            patch_version: self.core.new_version.clone(),
            desired_query_ids: BTreeSet::new(),
        };
        self.core.put_client_patch(&record);
        self.patches.push(PokePatch::Client(ClientPatch {
            op: PatchOp::Put,
            client_id: client_id.to_string(),
        }));
    }

    /// Registers an internal query the syncer maintains on its own behalf.
    pub fn put_internal_query(&mut self, hash: QueryHash, ast: QueryAst) {
        if self.core.current_query(&hash).is_none() {
            let record = QueryRecord::new(hash, ast, true);
            self.core.put_query_patch(&record);
        }
    }

    /// Marks queries as desired by `client_id`, adding the client and any
    /// unknown queries. Returns the queries newly added to the CVR; those
    /// still need hydration by the pipeline reconciler.
    pub fn put_desired_queries(
        &mut self,
        client_id: &str,
        queries: &BTreeMap<QueryHash, QueryAst>,
    ) -> Vec<(QueryHash, QueryAst)> {
        self.put_client(client_id);
        let mut client = self
            .core
            .current_client(client_id)
            .expect("client staged above");
        let mut added = Vec::new();
        for (hash, ast) in queries {
            let record = match self.core.current_query(hash) {
                Some(mut existing) => {
                    existing
                        .desired_by
                        .insert(client_id.to_string(), self.core.new_version.clone());
                    existing
                }
                None => {
                    let mut fresh = QueryRecord::new(hash.clone(), ast.clone(), false);
                    fresh
                        .desired_by
                        .insert(client_id.to_string(), self.core.new_version.clone());
                    added.push((hash.clone(), ast.clone()));
                    fresh
                }
            };
            self.core.put_query_patch(&record);
            client.desired_query_ids.insert(hash.clone());
            self.patches.push(PokePatch::DesiredQuery {
                client_id: client_id.to_string(),
                patch: QueryPatch {
                    op: PatchOp::Put,
                    hash: hash.to_string(),
                    ast: Some(ast.clone()),
                },
            });
        }
        client.patch_version = self.core.new_version.clone();
        self.core.put_client_patch(&client);
        added
    }

    /// Drops `client_id`'s desire for the given queries. A query left with
    /// no desirers becomes removable; the query-driven updater performs the
    /// actual removal once the pipeline has been updated.
    pub fn delete_desired_queries(&mut self, client_id: &str, hashes: &[QueryHash]) {
        let Some(mut client) = self.core.current_client(client_id) else {
            return;
        };
        for hash in hashes {
            if let Some(mut record) = self.core.current_query(hash) {
                if record.desired_by.remove(client_id).is_some() {
                    self.core.put_query_patch(&record);
                    self.patches.push(PokePatch::DesiredQuery {
                        client_id: client_id.to_string(),
                        patch: QueryPatch { op: PatchOp::Del, hash: hash.to_string(), ast: None },
                    });
                }
            }
            client.desired_query_ids.remove(hash);
        }
        client.patch_version = self.core.new_version.clone();
        self.core.put_client_patch(&client);
    }

    pub fn clear_desired_queries(&mut self, client_id: &str) {
        let Some(client) = self.core.current_client(client_id) else {
            return;
        };
        let hashes: Vec<QueryHash> = client.desired_query_ids.into_iter().collect();
        self.delete_desired_queries(client_id, &hashes);
    }

    /// Removes a client record entirely (explicit delete, not a mere
    /// disconnect).
    pub fn delete_client(&mut self, client_id: &str) {
        let Some(client) = self.core.current_client(client_id) else {
            return;
        };
        for hash in &client.desired_query_ids {
            if let Some(mut record) = self.core.current_query(hash) {
                record.desired_by.remove(client_id);
                self.core.put_query_patch(&record);
            }
        }
        self.core.clients.insert(
            client_id.to_string(),
            ClientWrite {
                client_id: client_id.to_string(),
                patch_version: self.core.new_version.clone(),
                desired_query_ids: Vec::new(),
                deleted: true,
            },
        );
        self.patches.push(PokePatch::Client(ClientPatch {
            op: PatchOp::Del,
            client_id: client_id.to_string(),
        }));
    }

    /// Flushes atomically; returns the new snapshot and the patches to
    /// broadcast with the next poke.
    pub async fn flush(self) -> Result<(Arc<CvrSnapshot>, Vec<PokePatch>), SyncError> {
        let patches = self.patches;
        let snapshot = self.core.flush().await?;
        Ok((snapshot, patches))
    }
}

/// One row's accumulated change within a processing page.
#[derive(Debug, Default, Clone)]
pub struct RowUpdate {
    pub version: Option<String>,
    pub contents: Option<Row>,
    pub ref_counts: BTreeMap<QueryHash, i32>,
}

/// One row patch to hand to the pokers.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPatchOutput {
    Put { row_id: RowId, contents: Row },
    Del { row_id: RowId },
}

/// Query-driven updater: applies pipeline row changes to the CVR. Its
/// version carries the pipeline's state version; the minor version bumps
/// only when the state version stands still.
pub struct RowsUpdater {
    core: UpdaterCore,
    removed: BTreeSet<QueryHash>,
    rehydrated: BTreeSet<QueryHash>,
    finalized: bool,
}

impl RowsUpdater {
    pub fn new(
        store: CvrStore,
        base: Arc<CvrSnapshot>,
        exists: bool,
        state_version: StateVersion,
    ) -> Self {
        let new_version = base.version.advance_to(state_version);
        RowsUpdater {
            core: UpdaterCore::new(store, base, exists, new_version),
            removed: BTreeSet::new(),
            rehydrated: BTreeSet::new(),
            finalized: false,
        }
    }

    pub fn updated_version(&self) -> &CvrVersion {
        &self.core.new_version
    }

    /// Records queries entering and leaving the got set. Returns the query
    /// patches to include in the current poke. Internal queries are tracked
    /// but never advertised.
    pub fn track_queries(
        &mut self,
        add: &[(QueryHash, QueryAst)],
        remove: &[QueryHash],
    ) -> Result<Vec<QueryPatch>, SyncError> {
        let mut patches = Vec::new();
        for (hash, ast) in add {
            let mut record = self
                .core
                .current_query(hash)
                .ok_or_else(|| {
                    SyncError::Internal(format!("tracking unknown query `{}`", hash))
                })?;
            if record.is_got() {
                // Re-hydration: stale row references are reconciled during
                // finalization.
                self.rehydrated.insert(hash.clone());
            }
            record.transformation_hash = Some(ast.transformation_hash());
            record.transformation_version = Some(self.core.new_version.clone());
            record.patch_version = Some(self.core.new_version.clone());
            let internal = record.internal;
            self.core.put_query_patch(&record);
            if !internal {
                patches.push(QueryPatch {
                    op: PatchOp::Put,
                    hash: hash.to_string(),
                    ast: Some(ast.clone()),
                });
            }
        }
        for hash in remove {
            let internal = self
                .core
                .current_query(hash)
                .map(|q| q.internal)
                .unwrap_or(false);
            self.core.put_query_tombstone(hash);
            self.removed.insert(hash.clone());
            if !internal {
                patches.push(QueryPatch { op: PatchOp::Del, hash: hash.to_string(), ast: None });
            }
        }
        Ok(patches)
    }

    fn current_row(&self, row_id: &RowId) -> Option<RowWrite> {
        if let Some(staged) = self.core.rows.get(row_id) {
            return Some(staged.clone());
        }
        self.core
            .base
            .rows
            .get(row_id)
            .map(|record| RowWrite {
                row_id: row_id.clone(),
                patch_version: record.patch_version.clone(),
                row_version: record.row_version.clone(),
                ref_counts: record.ref_counts.clone(),
            })
    }

    /// Merges one page of row updates into the staged row set.
    ///
    /// For each row the signed per-query deltas are merged into the stored
    /// reference counts; a query whose count reaches zero is dropped from
    /// the row, and a row left without queries becomes a `del` patch. A row
    /// with surviving references and fresh contents becomes a `put` patch
    /// carrying the row's `_0_version`.
    pub fn received(
        &mut self,
        rows: BTreeMap<RowId, RowUpdate>,
    ) -> Result<Vec<RowPatchOutput>, SyncError> {
        let mut patches = Vec::new();
        for (row_id, update) in rows {
            let existing = self.current_row(&row_id);
            let existing_counts = existing
                .as_ref()
                .and_then(|w| w.ref_counts.clone())
                .unwrap_or_default();

            let mut merged = existing_counts.clone();
            for (hash, delta) in &update.ref_counts {
                let count = merged.entry(hash.clone()).or_insert(0);
                *count += delta;
                if *count <= 0 {
                    merged.remove(hash);
                }
            }

            if merged.is_empty() {
                if !existing_counts.is_empty() {
                    let row_version = existing
                        .map(|w| w.row_version)
                        .unwrap_or_default();
                    self.core.put_row_patch(RowWrite {
                        row_id: row_id.clone(),
                        patch_version: self.core.new_version.clone(),
                        row_version,
                        ref_counts: None,
                    });
                    patches.push(RowPatchOutput::Del { row_id });
                }
                // A row that entered and left within one batch never
                // surfaces.
                continue;
            }

            match (update.contents, update.version) {
                (Some(contents), Some(version)) => {
                    self.core.put_row_patch(RowWrite {
                        row_id: row_id.clone(),
                        patch_version: self.core.new_version.clone(),
                        row_version: version,
                        ref_counts: Some(merged),
                    });
                    patches.push(RowPatchOutput::Put { row_id, contents });
                }
                (Some(_), None) => {
                    return Err(SyncError::Internal(format!(
                        "row {} received contents without a row version",
                        row_id
                    )));
                }
                (None, _) => {
                    // Reference-count-only change; contents and patch
                    // version stay as they are.
                    let existing = existing.ok_or_else(|| {
                        SyncError::Internal(format!(
                            "row {} received a bare refcount change but has no stored state",
                            row_id
                        ))
                    })?;
                    self.core.put_row_patch(RowWrite {
                        row_id,
                        patch_version: existing.patch_version,
                        row_version: existing.row_version,
                        ref_counts: Some(merged),
                    });
                }
            }
        }
        Ok(patches)
    }

    /// Finalization step, called exactly once after all `received` pages:
    /// drops references held by removed queries and the stale references of
    /// re-hydrated queries, emitting `del` patches for rows that lose their
    /// last reference.
    pub fn delete_unreferenced_rows(&mut self) -> Vec<RowPatchOutput> {
        if self.finalized {
            warn!("delete_unreferenced_rows called twice in one cycle");
            return Vec::new();
        }
        self.finalized = true;
        if self.removed.is_empty() && self.rehydrated.is_empty() {
            return Vec::new();
        }

        let affected: Vec<RowId> = self
            .core
            .base
            .rows
            .iter()
            .filter(|(_, record)| {
                record
                    .ref_counts
                    .as_ref()
                    .map(|rc| {
                        rc.keys()
                            .any(|h| self.removed.contains(h) || self.rehydrated.contains(h))
                    })
                    .unwrap_or(false)
            })
            .map(|(row_id, _)| row_id.clone())
            .collect();

        let mut patches = Vec::new();
        for row_id in affected {
            let Some(current) = self.current_row(&row_id) else {
                continue;
            };
            let Some(mut counts) = current.ref_counts else {
                // Already tombstoned this cycle.
                continue;
            };
            let base_counts = self
                .core
                .base
                .rows
                .get(&row_id)
                .and_then(|r| r.ref_counts.clone())
                .unwrap_or_default();

            for hash in &self.removed {
                counts.remove(hash);
            }
            for hash in &self.rehydrated {
                if let (Some(stale), Some(count)) = (base_counts.get(hash), counts.get_mut(hash)) {
                    *count -= stale;
                    if *count <= 0 {
                        counts.remove(hash);
                    }
                }
            }

            if counts.is_empty() {
                self.core.put_row_patch(RowWrite {
                    row_id: row_id.clone(),
                    patch_version: self.core.new_version.clone(),
                    row_version: current.row_version,
                    ref_counts: None,
                });
                patches.push(RowPatchOutput::Del { row_id });
            } else {
                self.core.put_row_patch(RowWrite {
                    row_id,
                    patch_version: current.patch_version,
                    row_version: current.row_version,
                    ref_counts: Some(counts),
                });
            }
        }
        patches
    }

    pub async fn flush(self) -> Result<Arc<CvrSnapshot>, SyncError> {
        self.core.flush().await
    }
}
