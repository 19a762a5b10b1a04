//! Storage contracts for the durable CVR.
//!
//! The gateway trait defined here is implemented by the Postgres backend in
//! `prism-storage`; the view syncer only ever sees this interface. All
//! version columns are persisted as cookie strings, whose byte order equals
//! version order, so ordered scans and the commit compare-and-swap work on
//! plain text comparison.

use crate::{
    models::{
        cvr::CvrSnapshot,
        query::{QueryAst, QueryHash},
        row::RowId,
        version::CvrVersion,
        ClientId,
    },
    sync::PatchOp,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum StorageError {
    #[error("could not find {0} with id `{1}`")]
    NotFound(String, String),
    #[error("cvr `{0}` was modified concurrently, expected version {1}")]
    ConcurrentModification(String, String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected storage error: {0}")]
    Unexpected(String),
}

/// One row-patch record streamed during catch-up. `ref_counts == None`
/// means the record is a delete tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowPatchRecord {
    pub row_id: RowId,
    pub patch_version: CvrVersion,
    pub row_version: String,
    pub ref_counts: Option<BTreeMap<QueryHash, i32>>,
}

/// Keyset cursor into the row-patch ordering
/// `(patch_version, schema, table, row_key)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowPatchCursor {
    pub patch_version: CvrVersion,
    pub schema: String,
    pub table: String,
    pub row_key_text: String,
}

impl RowPatchCursor {
    pub fn after(record: &RowPatchRecord) -> Self {
        RowPatchCursor {
            patch_version: record.patch_version.clone(),
            schema: record.row_id.schema.clone(),
            table: record.row_id.table.clone(),
            row_key_text: record.row_id.key.canonical(),
        }
    }
}

/// One client or query patch produced by config catch-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigPatchRecord {
    Client {
        op: PatchOp,
        client_id: ClientId,
        patch_version: CvrVersion,
    },
    GotQuery {
        op: PatchOp,
        hash: QueryHash,
        ast: Option<QueryAst>,
        patch_version: CvrVersion,
    },
    DesiredQuery {
        op: PatchOp,
        client_id: ClientId,
        hash: QueryHash,
        ast: Option<QueryAst>,
        patch_version: CvrVersion,
    },
}

impl ConfigPatchRecord {
    pub fn patch_version(&self) -> &CvrVersion {
        match self {
            ConfigPatchRecord::Client { patch_version, .. } |
            ConfigPatchRecord::GotQuery { patch_version, .. } |
            ConfigPatchRecord::DesiredQuery { patch_version, .. } => patch_version,
        }
    }

    /// Deterministic tie-break within one patch version.
    pub fn sort_key(&self) -> (u8, String, String) {
        match self {
            ConfigPatchRecord::Client { client_id, .. } => (0, client_id.clone(), String::new()),
            ConfigPatchRecord::GotQuery { hash, .. } => (1, hash.to_string(), String::new()),
            ConfigPatchRecord::DesiredQuery { client_id, hash, .. } => {
                (2, client_id.clone(), hash.to_string())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientWrite {
    pub client_id: ClientId,
    pub patch_version: CvrVersion,
    pub desired_query_ids: Vec<QueryHash>,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryWrite {
    pub hash: QueryHash,
    pub ast: Option<QueryAst>,
    pub internal: bool,
    pub desired_by: BTreeMap<ClientId, CvrVersion>,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<CvrVersion>,
    pub patch_version: Option<CvrVersion>,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowWrite {
    pub row_id: RowId,
    pub patch_version: CvrVersion,
    pub row_version: String,
    /// `None` writes the tombstone form.
    pub ref_counts: Option<BTreeMap<QueryHash, i32>>,
}

/// Everything one CVR flush persists. The commit is atomic: either the new
/// instance version and all patch rows become durably visible, or none do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CvrWriteBatch {
    /// Version the stored CVR must still be at; `None` inserts a fresh
    /// instance row. A mismatch fails with
    /// [`StorageError::ConcurrentModification`].
    pub expected_version: Option<CvrVersion>,
    pub version: CvrVersion,
    pub last_active: NaiveDateTime,
    pub clients: Vec<ClientWrite>,
    pub queries: Vec<QueryWrite>,
    pub rows: Vec<RowWrite>,
}

/// Durable CVR storage. One implementation serves many groups concurrently;
/// per-group serializability is the implementation's responsibility (the
/// Postgres backend transacts on the instance row).
#[async_trait]
pub trait CvrGateway: Send + Sync {
    /// Loads the full CVR of a group. `None` if the group has never been
    /// flushed.
    async fn load(&self, group_id: &str) -> Result<Option<CvrSnapshot>, StorageError>;

    /// One ordered page of row patches with
    /// `from < patch_version <= to`, starting after `cursor` when given.
    /// Order: ascending `patch_version`, ties broken by
    /// `(schema, table, row_key)`.
    async fn row_patches_page(
        &self,
        group_id: &str,
        from: &CvrVersion,
        to: &CvrVersion,
        cursor: Option<&RowPatchCursor>,
        limit: i64,
    ) -> Result<Vec<RowPatchRecord>, StorageError>;

    /// All client/query patches with `from < patch_version <= to`, in
    /// ascending patch-version order.
    async fn config_patches(
        &self,
        group_id: &str,
        from: &CvrVersion,
        to: &CvrVersion,
    ) -> Result<Vec<ConfigPatchRecord>, StorageError>;

    /// Atomically persists one flush.
    async fn commit(&self, group_id: &str, batch: &CvrWriteBatch) -> Result<(), StorageError>;
}
