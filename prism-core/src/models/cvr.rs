//! The in-memory Client View Record model.
//!
//! A `CvrSnapshot` is an immutable value: updaters stage modifications
//! against a borrowed snapshot and produce a new one on flush. The view
//! syncer service exclusively owns the current snapshot pointer for its
//! group.

use crate::models::{
    query::{QueryAst, QueryHash},
    row::RowId,
    version::CvrVersion,
    ClientId,
};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: ClientId,
    pub patch_version: CvrVersion,
    pub desired_query_ids: BTreeSet<QueryHash>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRecord {
    pub id: QueryHash,
    pub ast: QueryAst,
    /// Internal queries are maintained by the syncer itself (e.g. the
    /// last-mutation-id query) and are desired regardless of clients.
    pub internal: bool,
    /// Which clients desire this query, and at which CVR version each
    /// desire was recorded.
    pub desired_by: BTreeMap<ClientId, CvrVersion>,
    /// Set once the query has been hydrated; a query is "got" iff set.
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<CvrVersion>,
    /// Version at which the got-query patch was recorded.
    pub patch_version: Option<CvrVersion>,
}

impl QueryRecord {
    pub fn new(id: QueryHash, ast: QueryAst, internal: bool) -> Self {
        QueryRecord {
            id,
            ast,
            internal,
            desired_by: BTreeMap::new(),
            transformation_hash: None,
            transformation_version: None,
            patch_version: None,
        }
    }

    pub fn is_desired(&self) -> bool {
        self.internal || !self.desired_by.is_empty()
    }

    pub fn is_got(&self) -> bool {
        self.transformation_hash.is_some()
    }
}

/// One row's CVR entry. `ref_counts == None` is the tombstone form kept
/// until clients have caught up past the delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowRecord {
    pub patch_version: CvrVersion,
    pub row_version: String,
    pub ref_counts: Option<BTreeMap<QueryHash, i32>>,
}

impl RowRecord {
    pub fn is_referenced(&self) -> bool {
        self.ref_counts
            .as_ref()
            .map(|rc| !rc.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CvrSnapshot {
    pub id: String,
    pub version: CvrVersion,
    pub last_active: NaiveDateTime,
    pub clients: HashMap<ClientId, ClientRecord>,
    pub queries: HashMap<QueryHash, QueryRecord>,
    pub rows: HashMap<RowId, RowRecord>,
}

impl CvrSnapshot {
    /// The CVR of a group that has never been flushed.
    pub fn empty(id: impl Into<String>) -> Self {
        CvrSnapshot {
            id: id.into(),
            version: CvrVersion::min(),
            last_active: NaiveDateTime::default(),
            clients: HashMap::new(),
            queries: HashMap::new(),
            rows: HashMap::new(),
        }
    }

    /// Hashes of all queries some client wants (or that are internal).
    pub fn desired_queries(&self) -> BTreeSet<QueryHash> {
        self.queries
            .values()
            .filter(|q| q.is_desired())
            .map(|q| q.id.clone())
            .collect()
    }

    pub fn all_queries(&self) -> BTreeSet<QueryHash> {
        self.queries.keys().cloned().collect()
    }
}
