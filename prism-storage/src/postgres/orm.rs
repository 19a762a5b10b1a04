use super::schema::{cvr_clients, cvr_instances, cvr_queries, cvr_rows};
use chrono::NaiveDateTime;
use diesel::{
    prelude::*,
    sql_query,
    sql_types::{BigInt, Jsonb, Nullable, Text},
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use prism_core::{
    models::{
        cvr::{ClientRecord, QueryRecord, RowRecord},
        query::{QueryAst, QueryHash},
        row::{RowId, RowKey},
        version::CvrVersion,
        ClientId,
    },
    storage::{RowPatchCursor, RowPatchRecord, StorageError},
};
use std::collections::BTreeMap;

fn parse_cookie(cookie: &str) -> Result<CvrVersion, StorageError> {
    CvrVersion::from_cookie(cookie)
        .map_err(|e| StorageError::Unexpected(format!("stored version `{}`: {}", cookie, e)))
}

fn parse_opt_cookie(cookie: &Option<String>) -> Result<Option<CvrVersion>, StorageError> {
    cookie
        .as_deref()
        .map(parse_cookie)
        .transpose()
}

fn from_jsonb<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    what: &str,
) -> Result<T, StorageError> {
    serde_json::from_value(value)
        .map_err(|e| StorageError::Unexpected(format!("stored {}: {}", what, e)))
}

#[derive(Identifiable, Queryable, Selectable, Debug)]
#[diesel(table_name = cvr_instances, primary_key(client_group_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CvrInstance {
    pub client_group_id: String,
    pub version: String,
    pub last_active: NaiveDateTime,
}

impl CvrInstance {
    pub async fn by_group(
        group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Option<CvrInstance>> {
        cvr_instances::table
            .filter(cvr_instances::client_group_id.eq(group_id))
            .select(CvrInstance::as_select())
            .first::<CvrInstance>(conn)
            .await
            .optional()
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = cvr_instances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewCvrInstance<'a> {
    pub client_group_id: &'a str,
    pub version: String,
    pub last_active: NaiveDateTime,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = cvr_clients)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CvrClient {
    pub client_group_id: String,
    pub client_id: String,
    pub patch_version: String,
    pub desired_query_ids: Vec<String>,
    pub deleted: bool,
}

impl CvrClient {
    pub async fn by_group(
        group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<CvrClient>> {
        cvr_clients::table
            .filter(cvr_clients::client_group_id.eq(group_id))
            .select(CvrClient::as_select())
            .load(conn)
            .await
    }

    pub async fn patched_between(
        group_id: &str,
        from: &str,
        to: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<CvrClient>> {
        cvr_clients::table
            .filter(cvr_clients::client_group_id.eq(group_id))
            .filter(cvr_clients::patch_version.gt(from))
            .filter(cvr_clients::patch_version.le(to))
            .select(CvrClient::as_select())
            .load(conn)
            .await
    }

    pub fn try_into_record(self) -> Result<ClientRecord, StorageError> {
        Ok(ClientRecord {
            id: self.client_id,
            patch_version: parse_cookie(&self.patch_version)?,
            desired_query_ids: self
                .desired_query_ids
                .into_iter()
                .map(QueryHash)
                .collect(),
        })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = cvr_clients)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewCvrClient<'a> {
    pub client_group_id: &'a str,
    pub client_id: &'a str,
    pub patch_version: String,
    pub desired_query_ids: Vec<String>,
    pub deleted: bool,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = cvr_queries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CvrQuery {
    pub client_group_id: String,
    pub query_hash: String,
    pub ast: Option<serde_json::Value>,
    pub internal: bool,
    pub desired_by: serde_json::Value,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<String>,
    pub patch_version: Option<String>,
    pub deleted: bool,
}

impl CvrQuery {
    pub async fn by_group(
        group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<CvrQuery>> {
        cvr_queries::table
            .filter(cvr_queries::client_group_id.eq(group_id))
            .select(CvrQuery::as_select())
            .load(conn)
            .await
    }

    pub fn parse_ast(&self) -> Result<Option<QueryAst>, StorageError> {
        self.ast
            .clone()
            .map(|v| from_jsonb(v, "query ast"))
            .transpose()
    }

    pub fn parse_desired_by(&self) -> Result<BTreeMap<ClientId, CvrVersion>, StorageError> {
        let cookies: BTreeMap<String, String> =
            from_jsonb(self.desired_by.clone(), "desired_by map")?;
        cookies
            .into_iter()
            .map(|(client, cookie)| Ok((client, parse_cookie(&cookie)?)))
            .collect()
    }

    pub fn try_into_record(self) -> Result<QueryRecord, StorageError> {
        let ast = self
            .parse_ast()?
            .ok_or_else(|| {
                StorageError::Unexpected(format!("live query `{}` without ast", self.query_hash))
            })?;
        let desired_by = self.parse_desired_by()?;
        Ok(QueryRecord {
            id: QueryHash(self.query_hash),
            ast,
            internal: self.internal,
            desired_by,
            transformation_hash: self.transformation_hash,
            transformation_version: parse_opt_cookie(&self.transformation_version)?,
            patch_version: parse_opt_cookie(&self.patch_version)?,
        })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = cvr_queries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewCvrQuery<'a> {
    pub client_group_id: &'a str,
    pub query_hash: &'a str,
    pub ast: Option<serde_json::Value>,
    pub internal: bool,
    pub desired_by: serde_json::Value,
    pub transformation_hash: Option<&'a str>,
    pub transformation_version: Option<String>,
    pub patch_version: Option<String>,
    pub deleted: bool,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = cvr_rows)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CvrRow {
    pub client_group_id: String,
    pub row_schema: String,
    pub row_table: String,
    pub row_key_text: String,
    pub row_key: serde_json::Value,
    pub row_version: String,
    pub patch_version: String,
    pub ref_counts: Option<serde_json::Value>,
}

impl CvrRow {
    pub async fn by_group(
        group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<CvrRow>> {
        cvr_rows::table
            .filter(cvr_rows::client_group_id.eq(group_id))
            .select(CvrRow::as_select())
            .load(conn)
            .await
    }

    pub fn try_into_entry(self) -> Result<(RowId, RowRecord), StorageError> {
        let key: RowKey = from_jsonb(self.row_key, "row key")?;
        let ref_counts: Option<BTreeMap<String, i32>> = self
            .ref_counts
            .map(|v| from_jsonb(v, "ref_counts map"))
            .transpose()?;
        Ok((
            RowId::new(self.row_schema, self.row_table, key),
            RowRecord {
                patch_version: parse_cookie(&self.patch_version)?,
                row_version: self.row_version,
                ref_counts: ref_counts.map(|rc| {
                    rc.into_iter()
                        .map(|(hash, count)| (QueryHash(hash), count))
                        .collect()
                }),
            },
        ))
    }

    pub fn try_into_patch_record(self) -> Result<RowPatchRecord, StorageError> {
        let (row_id, record) = self.try_into_entry()?;
        Ok(RowPatchRecord {
            row_id,
            patch_version: record.patch_version,
            row_version: record.row_version,
            ref_counts: record.ref_counts,
        })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = cvr_rows)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewCvrRow<'a> {
    pub client_group_id: &'a str,
    pub row_schema: &'a str,
    pub row_table: &'a str,
    pub row_key_text: String,
    pub row_key: serde_json::Value,
    pub row_version: &'a str,
    pub patch_version: String,
    pub ref_counts: Option<serde_json::Value>,
}

#[derive(QueryableByName, Debug)]
pub struct RowPatchPageRow {
    #[diesel(sql_type = Text)]
    pub row_schema: String,
    #[diesel(sql_type = Text)]
    pub row_table: String,
    #[diesel(sql_type = Text)]
    pub row_key_text: String,
    #[diesel(sql_type = Jsonb)]
    pub row_key: serde_json::Value,
    #[diesel(sql_type = Text)]
    pub row_version: String,
    #[diesel(sql_type = Text)]
    pub patch_version: String,
    #[diesel(sql_type = Nullable<Jsonb>)]
    pub ref_counts: Option<serde_json::Value>,
}

impl RowPatchPageRow {
    /// One keyset page of the row-patch ordering. Tuple comparison against
    /// the cursor is not expressible with pure diesel, hence the raw query
    /// with binds.
    pub async fn page(
        group_id: &str,
        from: &str,
        to: &str,
        cursor: Option<&RowPatchCursor>,
        limit: i64,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<RowPatchPageRow>> {
        match cursor {
            None => {
                sql_query(
                    r#"
                    SELECT row_schema, row_table, row_key_text, row_key,
                           row_version, patch_version, ref_counts
                    FROM cvr_rows
                    WHERE client_group_id = $1
                      AND patch_version > $2 AND patch_version <= $3
                    ORDER BY patch_version, row_schema, row_table, row_key_text
                    LIMIT $4
                    "#,
                )
                .bind::<Text, _>(group_id)
                .bind::<Text, _>(from)
                .bind::<Text, _>(to)
                .bind::<BigInt, _>(limit)
                .load(conn)
                .await
            }
            Some(cur) => {
                sql_query(
                    r#"
                    SELECT row_schema, row_table, row_key_text, row_key,
                           row_version, patch_version, ref_counts
                    FROM cvr_rows
                    WHERE client_group_id = $1
                      AND patch_version > $2 AND patch_version <= $3
                      AND (patch_version, row_schema, row_table, row_key_text) > ($4, $5, $6, $7)
                    ORDER BY patch_version, row_schema, row_table, row_key_text
                    LIMIT $8
                    "#,
                )
                .bind::<Text, _>(group_id)
                .bind::<Text, _>(from)
                .bind::<Text, _>(to)
                .bind::<Text, _>(cur.patch_version.to_cookie())
                .bind::<Text, _>(cur.schema.as_str())
                .bind::<Text, _>(cur.table.as_str())
                .bind::<Text, _>(cur.row_key_text.as_str())
                .bind::<BigInt, _>(limit)
                .load(conn)
                .await
            }
        }
    }

    pub fn try_into_patch_record(self) -> Result<RowPatchRecord, StorageError> {
        let key: RowKey = from_jsonb(self.row_key, "row key")?;
        let ref_counts: Option<BTreeMap<String, i32>> = self
            .ref_counts
            .map(|v| from_jsonb(v, "ref_counts map"))
            .transpose()?;
        Ok(RowPatchRecord {
            row_id: RowId::new(self.row_schema, self.row_table, key),
            patch_version: parse_cookie(&self.patch_version)?,
            row_version: self.row_version,
            ref_counts: ref_counts.map(|rc| {
                rc.into_iter()
                    .map(|(hash, count)| (QueryHash(hash), count))
                    .collect()
            }),
        })
    }
}
