//! Incremental view maintenance over the local replica.
//!
//! The driver owns a private copy of the replica's table data plus, per
//! registered query, the set of row keys currently in the result. Adding a
//! query hydrates it against the snapshot; advancing applies the next
//! replica delta and yields one `RowChange` per query whose membership or
//! contents changed. A row that stays in a query across an update yields a
//! `-1`/`+1` pair so net reference counts are unchanged.

use super::replica::{ReplicaHandle, TableSnapshot};
use crate::error::SyncError;
use prism_core::models::{
    query::{QueryAst, QueryHash},
    row::{Row, RowId, RowKey, SqlValue, ROW_VERSION_COLUMN},
    StateVersion,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// One incremental result change. `row == None` means the row no longer
/// matches the query; a present row includes all columns plus
/// `_0_version`.
#[derive(Clone, Debug, PartialEq)]
pub struct RowChange {
    pub query_hash: QueryHash,
    pub row_id: RowId,
    pub row: Option<Row>,
}

/// The outcome of consuming one replica delta.
#[derive(Debug)]
pub struct Advancement {
    pub version: StateVersion,
    pub num_changes: usize,
    pub changes: Vec<RowChange>,
}

struct RegisteredQuery {
    ast: QueryAst,
    matched: BTreeSet<RowKey>,
}

pub struct PipelineDriver {
    replica: ReplicaHandle,
    tables: HashMap<(String, String), TableSnapshot>,
    queries: BTreeMap<QueryHash, RegisteredQuery>,
    version: Option<StateVersion>,
    applied: usize,
}

impl PipelineDriver {
    pub fn new(replica: ReplicaHandle) -> Self {
        PipelineDriver {
            replica,
            tables: HashMap::new(),
            queries: BTreeMap::new(),
            version: None,
            applied: 0,
        }
    }

    /// Idempotent start: takes a consistent checkpoint of the replica and
    /// registers this driver as a reader of its delta log.
    pub fn init(&mut self) {
        if self.initialized() {
            return;
        }
        let checkpoint = self.replica.checkpoint();
        debug!(version = %checkpoint.version, tables = checkpoint.tables.len(), "pipeline initialized");
        self.tables = checkpoint.tables;
        self.applied = checkpoint.log_offset;
        self.version = Some(checkpoint.version);
    }

    pub fn initialized(&self) -> bool {
        self.version.is_some()
    }

    /// The state version the pipeline has fully applied.
    pub fn current_version(&self) -> Option<&StateVersion> {
        self.version.as_ref()
    }

    fn table(&self, schema: &str, table: &str) -> Result<&TableSnapshot, SyncError> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| SyncError::BadQuery(format!("unknown table `{}.{}`", schema, table)))
    }

    /// Checks an AST against the replica schema without registering it.
    pub fn validate_query(&self, ast: &QueryAst) -> Result<(), SyncError> {
        if !self.initialized() {
            // Nothing to check against yet; hydration validates later.
            return Ok(());
        }
        let table = self.table(&ast.schema, &ast.table)?;
        for column in ast.referenced_columns() {
            if !table.columns.contains(column) {
                return Err(SyncError::BadQuery(format!(
                    "unknown column `{}` on `{}.{}`",
                    column, ast.schema, ast.table
                )));
            }
        }
        Ok(())
    }

    /// Hydrates a query against the current snapshot, yielding a `+1`
    /// change per matching row. Re-registering an existing hash resets its
    /// membership and hydrates from scratch.
    pub fn add_query(
        &mut self,
        hash: QueryHash,
        ast: QueryAst,
    ) -> Result<Vec<RowChange>, SyncError> {
        if !self.initialized() {
            return Err(SyncError::Internal("pipeline not initialized".to_string()));
        }
        self.validate_query(&ast)?;
        let table = self.table(&ast.schema, &ast.table)?;

        let mut matched = BTreeSet::new();
        let mut changes = Vec::new();
        for (key, row) in &table.rows {
            if ast.matches(row) {
                matched.insert(key.clone());
                changes.push(RowChange {
                    query_hash: hash.clone(),
                    row_id: RowId::new(ast.schema.clone(), ast.table.clone(), key.clone()),
                    row: Some(row.clone()),
                });
            }
        }
        debug!(%hash, rows = changes.len(), "hydrated query");
        self.queries
            .insert(hash, RegisteredQuery { ast, matched });
        Ok(changes)
    }

    /// Drops a query; subsequent advancements will not include it. No
    /// changes are emitted.
    pub fn remove_query(&mut self, hash: &QueryHash) {
        self.queries.remove(hash);
    }

    pub fn added_queries(&self) -> BTreeSet<QueryHash> {
        self.queries.keys().cloned().collect()
    }

    /// Point lookup used by catch-up to materialize current row contents.
    pub fn get_row(&self, schema: &str, table: &str, key: &RowKey) -> Option<&Row> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .and_then(|t| t.rows.get(key))
    }

    fn check_row_version(row: &Row, row_id: &RowId) -> Result<(), SyncError> {
        match row.get(ROW_VERSION_COLUMN) {
            Some(SqlValue::Text(v)) if !v.is_empty() => Ok(()),
            _ => Err(SyncError::Internal(format!(
                "replicated row {} is missing a valid `{}` column",
                row_id, ROW_VERSION_COLUMN
            ))),
        }
    }

    /// Consumes the next replica delta, if any. Yields membership changes
    /// tagged with the query that now includes (`row` present) or excludes
    /// (`row == None`) the row; a row may appear under multiple query
    /// hashes in a single advancement.
    pub fn advance(&mut self) -> Result<Option<Advancement>, SyncError> {
        if !self.initialized() {
            return Err(SyncError::Internal("pipeline not initialized".to_string()));
        }
        let Some(delta) = self.replica.delta_at(self.applied) else {
            return Ok(None);
        };

        let mut changes = Vec::new();
        for change in &delta.changes {
            let row_id =
                RowId::new(change.schema.clone(), change.table.clone(), change.key.clone());
            if let Some(row) = &change.row {
                Self::check_row_version(row, &row_id)?;
            }

            for (hash, query) in self.queries.iter_mut() {
                if query.ast.schema != change.schema || query.ast.table != change.table {
                    continue;
                }
                let was = query.matched.contains(&change.key);
                let now = change
                    .row
                    .as_ref()
                    .map(|r| query.ast.matches(r))
                    .unwrap_or(false);
                match (was, now) {
                    (true, true) => {
                        // In-place update: leave then re-enter so reference
                        // counts net out to zero.
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id: row_id.clone(),
                            row: None,
                        });
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id: row_id.clone(),
                            row: change.row.clone(),
                        });
                    }
                    (false, true) => {
                        query.matched.insert(change.key.clone());
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id: row_id.clone(),
                            row: change.row.clone(),
                        });
                    }
                    (true, false) => {
                        query.matched.remove(&change.key);
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id: row_id.clone(),
                            row: None,
                        });
                    }
                    (false, false) => {}
                }
            }

            let snapshot = self
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

        self.applied += 1;
        self.version = Some(delta.version.clone());
        Ok(Some(Advancement { version: delta.version, num_changes: changes.len(), changes }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::replica::{ReplicaChange, ReplicaDelta};
    use prism_core::models::query::Condition;

    fn issue_row(id: i64, title: &str, version: &str) -> Row {
        Row::from([
            ("id".to_string(), SqlValue::Int(id)),
            ("title".to_string(), SqlValue::Text(title.to_string())),
            (ROW_VERSION_COLUMN.to_string(), SqlValue::Text(version.to_string())),
        ])
    }

    fn issues_replica() -> ReplicaHandle {
        let replica = ReplicaHandle::new(StateVersion::from_lexi(100));
        replica.create_table("public", "issues", ["id", "title", ROW_VERSION_COLUMN]);
        for id in 1..=5 {
            replica.seed_row(
                "public",
                "issues",
                RowKey::single("id", SqlValue::Int(id)),
                issue_row(id, &format!("issue {}", id), "1aa"),
            );
        }
        replica
    }

    fn issues_by_id(ids: &[i64]) -> QueryAst {
        QueryAst::filtered(
            "public",
            "issues",
            Condition::In {
                column: "id".to_string(),
                values: ids.iter().map(|i| SqlValue::Int(*i)).collect(),
            },
        )
    }

    fn init_driver() -> PipelineDriver {
        let mut driver = PipelineDriver::new(issues_replica());
        driver.init();
        driver
    }

    #[test]
    fn hydration_yields_matching_rows() {
        let mut driver = init_driver();
        let changes = driver
            .add_query(QueryHash::from("qH"), issues_by_id(&[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(changes.len(), 4);
        assert!(changes.iter().all(|c| c.row.is_some()));
        assert_eq!(driver.added_queries().len(), 1);
    }

    #[test]
    fn bad_query_is_rejected_without_registration() {
        let mut driver = init_driver();
        let err = driver
            .add_query(
                QueryHash::from("bad"),
                QueryAst::filtered(
                    "public",
                    "issues",
                    Condition::Eq { column: "nope".into(), value: SqlValue::Null },
                ),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::BadQuery(_)));
        assert!(driver.added_queries().is_empty());

        let err = driver
            .add_query(QueryHash::from("bad2"), QueryAst::table("public", "missing"))
            .unwrap_err();
        assert!(matches!(err, SyncError::BadQuery(_)));
    }

    #[test]
    fn advance_emits_update_as_leave_then_enter() {
        let mut driver = init_driver();
        driver
            .add_query(QueryHash::from("qH"), issues_by_id(&[1, 2, 3, 4]))
            .unwrap();

        driver.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![ReplicaChange {
                schema: "public".into(),
                table: "issues".into(),
                key: RowKey::single("id", SqlValue::Int(3)),
                row: Some(issue_row(3, "baz", "1ab")),
            }],
        });

        let advancement = driver.advance().unwrap().unwrap();
        assert_eq!(advancement.version, StateVersion::from_lexi(101));
        assert_eq!(advancement.num_changes, 2);
        assert_eq!(advancement.changes[0].row, None);
        assert!(advancement.changes[1].row.is_some());

        // Nothing further pending.
        assert!(driver.advance().unwrap().is_none());
    }

    #[test]
    fn advance_emits_leave_when_row_stops_matching() {
        let mut driver = init_driver();
        driver
            .add_query(QueryHash::from("qH"), issues_by_id(&[1, 2, 3, 4]))
            .unwrap();

        driver.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![
                // id=3 leaves the filter, id=5 enters nothing (not matched).
                ReplicaChange {
                    schema: "public".into(),
                    table: "issues".into(),
                    key: RowKey::single("id", SqlValue::Int(3)),
                    row: None,
                },
                ReplicaChange {
                    schema: "public".into(),
                    table: "issues".into(),
                    key: RowKey::single("id", SqlValue::Int(5)),
                    row: Some(issue_row(5, "still out", "1ab")),
                },
            ],
        });

        let advancement = driver.advance().unwrap().unwrap();
        assert_eq!(advancement.num_changes, 1);
        assert_eq!(advancement.changes[0].row, None);
        assert_eq!(
            advancement.changes[0].row_id.key,
            RowKey::single("id", SqlValue::Int(3))
        );
        assert!(driver
            .get_row("public", "issues", &RowKey::single("id", SqlValue::Int(3)))
            .is_none());
    }

    #[test]
    fn advance_rejects_rows_without_version() {
        let mut driver = init_driver();
        driver
            .add_query(QueryHash::from("qH"), issues_by_id(&[1, 2, 3, 4]))
            .unwrap();

        let mut bad = issue_row(3, "baz", "1ab");
        bad.insert(ROW_VERSION_COLUMN.to_string(), SqlValue::Text(String::new()));
        driver.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![ReplicaChange {
                schema: "public".into(),
                table: "issues".into(),
                key: RowKey::single("id", SqlValue::Int(3)),
                row: Some(bad),
            }],
        });

        let err = driver.advance().unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
    }

    #[test]
    fn rehydration_resets_membership() {
        let mut driver = init_driver();
        driver
            .add_query(QueryHash::from("qH"), issues_by_id(&[1, 2]))
            .unwrap();
        let changes = driver
            .add_query(QueryHash::from("qH"), issues_by_id(&[1, 2]))
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(driver.added_queries().len(), 1);
    }
}
