//! Structural query ASTs and transformation hashes.
//!
//! SQL parsing happens upstream; by the time a query reaches the view
//! syncer it is a structural AST over one table with a simple predicate
//! tree. The transformation hash is the keccak-256 of the canonical JSON
//! encoding of the normalized AST: queries with equal transformation hashes
//! produce byte-equal result sets.

use crate::models::row::{Row, SqlValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

/// Client-assigned identifier of a query within a group.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct QueryHash(pub String);

impl QueryHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryHash {
    fn from(s: &str) -> Self {
        QueryHash(s.to_string())
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum Condition {
    Eq { column: String, value: SqlValue },
    In { column: String, values: Vec<SqlValue> },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
}

impl Condition {
    fn normalize(self) -> Condition {
        match self {
            Condition::Eq { column, value } => Condition::Eq { column, value },
            Condition::In { column, mut values } => {
                values.sort();
                values.dedup();
                Condition::In { column, values }
            }
            Condition::And { conditions } => {
                let mut conditions: Vec<Condition> = conditions
                    .into_iter()
                    .map(Condition::normalize)
                    .collect();
                conditions.sort_by_key(|c| serde_json::to_string(c).expect("conditions are json"));
                Condition::And { conditions }
            }
            Condition::Or { conditions } => {
                let mut conditions: Vec<Condition> = conditions
                    .into_iter()
                    .map(Condition::normalize)
                    .collect();
                conditions.sort_by_key(|c| serde_json::to_string(c).expect("conditions are json"));
                conditions.dedup();
                Condition::Or { conditions }
            }
        }
    }

    fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Eq { column, value } => row.get(column) == Some(value),
            Condition::In { column, values } => row
                .get(column)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            Condition::And { conditions } => conditions.iter().all(|c| c.matches(row)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.matches(row)),
        }
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Eq { column, .. } | Condition::In { column, .. } => out.push(column),
            Condition::And { conditions } | Condition::Or { conditions } => {
                for c in conditions {
                    c.collect_columns(out);
                }
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAst {
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filter: Option<Condition>,
}

impl QueryAst {
    pub fn table(schema: impl Into<String>, table: impl Into<String>) -> Self {
        QueryAst { schema: schema.into(), table: table.into(), filter: None }
    }

    pub fn filtered(
        schema: impl Into<String>,
        table: impl Into<String>,
        filter: Condition,
    ) -> Self {
        QueryAst { schema: schema.into(), table: table.into(), filter: Some(filter) }
    }

    pub fn normalize(self) -> QueryAst {
        QueryAst {
            schema: self.schema,
            table: self.table,
            filter: self.filter.map(Condition::normalize),
        }
    }

    /// Stable identifier of the normalized form; equal hashes mean byte
    /// equal result sets.
    pub fn transformation_hash(&self) -> String {
        let canonical = serde_json::to_string(&self.clone().normalize())
            .expect("asts serialize to json");
        let mut keccak = Keccak::v256();
        let mut output = [0u8; 32];
        keccak.update(canonical.as_bytes());
        keccak.finalize(&mut output);
        hex::encode(output)
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filter
            .as_ref()
            .map(|f| f.matches(row))
            .unwrap_or(true)
    }

    /// All column names the predicate references, for validation against the
    /// table's actual columns.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(f) = &self.filter {
            f.collect_columns(&mut out);
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

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

    #[test]
    fn transformation_hash_ignores_predicate_order() {
        assert_eq!(
            issues_by_id(&[1, 2, 3, 4]).transformation_hash(),
            issues_by_id(&[4, 3, 2, 2, 1]).transformation_hash(),
        );
        assert_ne!(
            issues_by_id(&[1, 2]).transformation_hash(),
            issues_by_id(&[1, 3]).transformation_hash(),
        );
    }

    #[test]
    fn matches_evaluates_the_predicate_tree() {
        let row = Row::from([
            ("id".to_string(), SqlValue::Int(3)),
            ("owner".to_string(), SqlValue::Text("ada".into())),
        ]);
        assert!(issues_by_id(&[1, 2, 3, 4]).matches(&row));
        assert!(!issues_by_id(&[1, 2]).matches(&row));
        assert!(QueryAst::table("public", "issues").matches(&row));

        let owner_and_id = QueryAst::filtered(
            "public",
            "issues",
            Condition::And {
                conditions: vec![
                    Condition::Eq { column: "owner".into(), value: SqlValue::Text("ada".into()) },
                    Condition::In { column: "id".into(), values: vec![SqlValue::Int(3)] },
                ],
            },
        );
        assert!(owner_and_id.matches(&row));
    }

    #[test]
    fn referenced_columns_are_deduplicated() {
        let ast = QueryAst::filtered(
            "public",
            "issues",
            Condition::Or {
                conditions: vec![
                    Condition::Eq { column: "id".into(), value: SqlValue::Int(1) },
                    Condition::Eq { column: "id".into(), value: SqlValue::Int(2) },
                    Condition::Eq { column: "owner".into(), value: SqlValue::Null },
                ],
            },
        );
        assert_eq!(ast.referenced_columns(), vec!["id", "owner"]);
    }
}
