//! The downstream poke protocol.
//!
//! One version increment is delivered to one client as a three-message
//! sequence: `pokeStart`, zero or more `pokePart`s, `pokeEnd`. The frames
//! serialize as two-element `(tag, body)` tuples, which is what the
//! websocket framing layer puts on the wire unchanged.

use crate::models::{query::QueryAst, row::Row, RowKey};
use serde::{ser::SerializeTuple, Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use strum_macros::Display;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PatchOp {
    Put,
    Del,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPatch {
    pub op: PatchOp,
    pub client_id: String,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPatch {
    pub op: PatchOp,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ast: Option<QueryAst>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    pub op: PatchOp,
    /// `schema.table` of the row.
    pub entity_type: String,
    pub entity_id: RowKey,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Row>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    pub poke_id: String,
    pub base_cookie: Option<String>,
    pub cookie: String,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    pub poke_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub clients_patch: Option<Vec<ClientPatch>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub desired_queries_patches: Option<BTreeMap<String, Vec<QueryPatch>>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub got_queries_patch: Option<Vec<QueryPatch>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entities_patch: Option<Vec<EntityPatch>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_mutation_id_changes: Option<BTreeMap<String, u64>>,
}

impl PokePart {
    pub fn new(poke_id: impl Into<String>) -> Self {
        PokePart { poke_id: poke_id.into(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.clients_patch.is_none() &&
            self.desired_queries_patches.is_none() &&
            self.got_queries_patch.is_none() &&
            self.entities_patch.is_none() &&
            self.last_mutation_id_changes.is_none()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    pub poke_id: String,
}

/// One frame of the per-client downstream sequence.
#[derive(Clone, PartialEq, Debug)]
pub enum Downstream {
    PokeStart(PokeStart),
    PokePart(PokePart),
    PokeEnd(PokeEnd),
    Error { kind: String, message: String },
}

impl Downstream {
    pub fn tag(&self) -> &'static str {
        match self {
            Downstream::PokeStart(_) => "pokeStart",
            Downstream::PokePart(_) => "pokePart",
            Downstream::PokeEnd(_) => "pokeEnd",
            Downstream::Error { .. } => "error",
        }
    }
}

impl Serialize for Downstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(self.tag())?;
        match self {
            Downstream::PokeStart(body) => tuple.serialize_element(body)?,
            Downstream::PokePart(body) => tuple.serialize_element(body)?,
            Downstream::PokeEnd(body) => tuple.serialize_element(body)?,
            Downstream::Error { kind, message } => {
                #[derive(Serialize)]
                struct ErrorBody<'a> {
                    kind: &'a str,
                    message: &'a str,
                }
                tuple.serialize_element(&ErrorBody { kind, message })?
            }
        }
        tuple.end()
    }
}

/// One desired-query operation of `initConnection` / `changeDesiredQueries`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum DesiredQueryOp {
    Put { hash: String, ast: QueryAst },
    Del { hash: String },
    Clear,
}
