//! The `CvrGateway` implementation.

use super::{orm, pool_error, schema, PostgresError};
use async_trait::async_trait;
use diesel::{prelude::*, upsert::excluded};
use diesel_async::{
    pooled_connection::deadpool::Pool, scoped_futures::ScopedFutureExt, AsyncConnection,
    AsyncPgConnection, RunQueryDsl,
};
use itertools::Itertools;
use prism_core::{
    models::{cvr::CvrSnapshot, version::CvrVersion},
    storage::{
        ConfigPatchRecord, CvrGateway, CvrWriteBatch, RowPatchCursor, RowPatchRecord, StorageError,
    },
    sync::PatchOp,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Upserts are chunked so one flush with many row patches stays well below
/// the postgres bind-parameter limit.
const INSERT_CHUNK_SIZE: usize = 1000;

#[derive(Clone)]
pub struct PostgresCvrGateway {
    pool: Pool<AsyncPgConnection>,
}

impl PostgresCvrGateway {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        PostgresCvrGateway { pool }
    }

    async fn conn(&self) -> Result<
        diesel_async::pooled_connection::deadpool::Object<AsyncPgConnection>,
        StorageError,
    > {
        self.pool.get().await.map_err(pool_error)
    }
}

fn desired_by_jsonb(desired_by: &BTreeMap<String, CvrVersion>) -> serde_json::Value {
    serde_json::to_value(
        desired_by
            .iter()
            .map(|(client, version)| (client.clone(), version.to_cookie()))
            .collect::<BTreeMap<String, String>>(),
    )
    .expect("cookie maps are valid json")
}

fn ref_counts_jsonb(
    ref_counts: &Option<BTreeMap<prism_core::models::QueryHash, i32>>,
) -> Option<serde_json::Value> {
    ref_counts.as_ref().map(|rc| {
        serde_json::to_value(
            rc.iter()
                .map(|(hash, count)| (hash.to_string(), *count))
                .collect::<BTreeMap<String, i32>>(),
        )
        .expect("ref count maps are valid json")
    })
}

async fn apply_instance_cas(
    group_id: &str,
    batch: &CvrWriteBatch,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    match &batch.expected_version {
        None => {
            let inserted = diesel::insert_into(schema::cvr_instances::table)
                .values(orm::NewCvrInstance {
                    client_group_id: group_id,
                    version: batch.version.to_cookie(),
                    last_active: batch.last_active,
                })
                .on_conflict_do_nothing()
                .execute(conn)
                .await?;
            if inserted != 1 {
                return Err(PostgresError(StorageError::ConcurrentModification(
                    group_id.to_string(),
                    "<none>".to_string(),
                )));
            }
        }
        Some(expected) => {
            let updated = diesel::update(
                schema::cvr_instances::table
                    .filter(schema::cvr_instances::client_group_id.eq(group_id))
                    .filter(schema::cvr_instances::version.eq(expected.to_cookie())),
            )
            .set((
                schema::cvr_instances::version.eq(batch.version.to_cookie()),
                schema::cvr_instances::last_active.eq(batch.last_active),
            ))
            .execute(conn)
            .await?;
            if updated != 1 {
                return Err(PostgresError(StorageError::ConcurrentModification(
                    group_id.to_string(),
                    expected.to_cookie(),
                )));
            }
        }
    }
    Ok(())
}

async fn upsert_clients(
    group_id: &str,
    batch: &CvrWriteBatch,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    for chunk in batch.clients.chunks(INSERT_CHUNK_SIZE) {
        let values: Vec<orm::NewCvrClient<'_>> = chunk
            .iter()
            .map(|w| orm::NewCvrClient {
                client_group_id: group_id,
                client_id: &w.client_id,
                patch_version: w.patch_version.to_cookie(),
                desired_query_ids: w
                    .desired_query_ids
                    .iter()
                    .map(|h| h.to_string())
                    .collect(),
                deleted: w.deleted,
            })
            .collect();
        diesel::insert_into(schema::cvr_clients::table)
            .values(&values)
            .on_conflict((
                schema::cvr_clients::client_group_id,
                schema::cvr_clients::client_id,
            ))
            .do_update()
            .set((
                schema::cvr_clients::patch_version
                    .eq(excluded(schema::cvr_clients::patch_version)),
                schema::cvr_clients::desired_query_ids
                    .eq(excluded(schema::cvr_clients::desired_query_ids)),
                schema::cvr_clients::deleted.eq(excluded(schema::cvr_clients::deleted)),
            ))
            .execute(conn)
            .await?;
    }
    Ok(())
}

async fn upsert_queries(
    group_id: &str,
    batch: &CvrWriteBatch,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    for chunk in batch.queries.chunks(INSERT_CHUNK_SIZE) {
        let values: Vec<orm::NewCvrQuery<'_>> = chunk
            .iter()
            .map(|w| orm::NewCvrQuery {
                client_group_id: group_id,
                query_hash: w.hash.as_str(),
                ast: w
                    .ast
                    .as_ref()
                    .map(|ast| serde_json::to_value(ast).expect("asts are valid json")),
                internal: w.internal,
                desired_by: desired_by_jsonb(&w.desired_by),
                transformation_hash: w.transformation_hash.as_deref(),
                transformation_version: w
                    .transformation_version
                    .as_ref()
                    .map(CvrVersion::to_cookie),
                patch_version: w.patch_version.as_ref().map(CvrVersion::to_cookie),
                deleted: w.deleted,
            })
            .collect();
        diesel::insert_into(schema::cvr_queries::table)
            .values(&values)
            .on_conflict((
                schema::cvr_queries::client_group_id,
                schema::cvr_queries::query_hash,
            ))
            .do_update()
            .set((
                schema::cvr_queries::ast.eq(excluded(schema::cvr_queries::ast)),
                schema::cvr_queries::internal.eq(excluded(schema::cvr_queries::internal)),
                schema::cvr_queries::desired_by.eq(excluded(schema::cvr_queries::desired_by)),
                schema::cvr_queries::transformation_hash
                    .eq(excluded(schema::cvr_queries::transformation_hash)),
                schema::cvr_queries::transformation_version
                    .eq(excluded(schema::cvr_queries::transformation_version)),
                schema::cvr_queries::patch_version
                    .eq(excluded(schema::cvr_queries::patch_version)),
                schema::cvr_queries::deleted.eq(excluded(schema::cvr_queries::deleted)),
            ))
            .execute(conn)
            .await?;
    }
    Ok(())
}

async fn upsert_rows(
    group_id: &str,
    batch: &CvrWriteBatch,
    conn: &mut AsyncPgConnection,
) -> Result<(), PostgresError> {
    for chunk in batch.rows.chunks(INSERT_CHUNK_SIZE) {
        let values: Vec<orm::NewCvrRow<'_>> = chunk
            .iter()
            .map(|w| orm::NewCvrRow {
                client_group_id: group_id,
                row_schema: &w.row_id.schema,
                row_table: &w.row_id.table,
                row_key_text: w.row_id.key.canonical(),
                row_key: serde_json::to_value(&w.row_id.key).expect("row keys are valid json"),
                row_version: &w.row_version,
                patch_version: w.patch_version.to_cookie(),
                ref_counts: ref_counts_jsonb(&w.ref_counts),
            })
            .collect();
        diesel::insert_into(schema::cvr_rows::table)
            .values(&values)
            .on_conflict((
                schema::cvr_rows::client_group_id,
                schema::cvr_rows::row_schema,
                schema::cvr_rows::row_table,
                schema::cvr_rows::row_key_text,
            ))
            .do_update()
            .set((
                schema::cvr_rows::row_key.eq(excluded(schema::cvr_rows::row_key)),
                schema::cvr_rows::row_version.eq(excluded(schema::cvr_rows::row_version)),
                schema::cvr_rows::patch_version.eq(excluded(schema::cvr_rows::patch_version)),
                schema::cvr_rows::ref_counts.eq(excluded(schema::cvr_rows::ref_counts)),
            ))
            .execute(conn)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl CvrGateway for PostgresCvrGateway {
    async fn load(&self, group_id: &str) -> Result<Option<CvrSnapshot>, StorageError> {
        let mut conn = self.conn().await?;
        let unavailable =
            |err: diesel::result::Error| StorageError::Unavailable(format!("{}", err));

        let Some(instance) = orm::CvrInstance::by_group(group_id, &mut conn)
            .await
            .map_err(unavailable)?
        else {
            return Ok(None);
        };

        let mut snapshot = CvrSnapshot::empty(group_id);
        snapshot.version = CvrVersion::from_cookie(&instance.version)
            .map_err(|e| StorageError::Unexpected(format!("stored cvr version: {}", e)))?;
        snapshot.last_active = instance.last_active;

        for client in orm::CvrClient::by_group(group_id, &mut conn)
            .await
            .map_err(unavailable)?
        {
            if client.deleted {
                continue;
            }
            let record = client.try_into_record()?;
            snapshot
                .clients
                .insert(record.id.clone(), record);
        }

        for query in orm::CvrQuery::by_group(group_id, &mut conn)
            .await
            .map_err(unavailable)?
        {
            if query.deleted {
                continue;
            }
            let record = query.try_into_record()?;
            snapshot
                .queries
                .insert(record.id.clone(), record);
        }

        let mut rows = HashMap::new();
        for row in orm::CvrRow::by_group(group_id, &mut conn)
            .await
            .map_err(unavailable)?
        {
            let (row_id, record) = row.try_into_entry()?;
            rows.insert(row_id, record);
        }
        snapshot.rows = rows;

        debug!(
            group_id,
            version = %snapshot.version,
            clients = snapshot.clients.len(),
            queries = snapshot.queries.len(),
            rows = snapshot.rows.len(),
            "loaded cvr"
        );
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
        let mut conn = self.conn().await?;
        orm::RowPatchPageRow::page(
            group_id,
            &from.to_cookie(),
            &to.to_cookie(),
            cursor,
            limit,
            &mut conn,
        )
        .await
        .map_err(|err| PostgresError::from(err).into())
        .and_then(|rows| {
            rows.into_iter()
                .map(orm::RowPatchPageRow::try_into_patch_record)
                .collect()
        })
    }

    async fn config_patches(
        &self,
        group_id: &str,
        from: &CvrVersion,
        to: &CvrVersion,
    ) -> Result<Vec<ConfigPatchRecord>, StorageError> {
        let mut conn = self.conn().await?;
        let from_cookie = from.to_cookie();
        let to_cookie = to.to_cookie();
        let mut patches = Vec::new();

        for client in
            orm::CvrClient::patched_between(group_id, &from_cookie, &to_cookie, &mut conn)
                .await
                .map_err(PostgresError::from)?
        {
            patches.push(ConfigPatchRecord::Client {
                op: if client.deleted { PatchOp::Del } else { PatchOp::Put },
                patch_version: CvrVersion::from_cookie(&client.patch_version)
                    .map_err(|e| StorageError::Unexpected(format!("client patch version: {}", e)))?,
                client_id: client.client_id,
            });
        }

        // Queries are few per group; desired-by versions live inside the
        // jsonb map, so the range filter for those happens here.
        for query in orm::CvrQuery::by_group(group_id, &mut conn)
            .await
            .map_err(PostgresError::from)?
        {
            let ast = query.parse_ast()?;
            let hash = prism_core::models::QueryHash(query.query_hash.clone());
            if let Some(patch_version) = &query.patch_version {
                if patch_version.as_str() > from_cookie.as_str() &&
                    patch_version.as_str() <= to_cookie.as_str()
                {
                    let patch_version = CvrVersion::from_cookie(patch_version).map_err(|e| {
                        StorageError::Unexpected(format!("query patch version: {}", e))
                    })?;
                    if query.deleted {
                        patches.push(ConfigPatchRecord::GotQuery {
                            op: PatchOp::Del,
                            hash: hash.clone(),
                            ast: None,
                            patch_version,
                        });
                    } else if query.transformation_hash.is_some() {
                        patches.push(ConfigPatchRecord::GotQuery {
                            op: PatchOp::Put,
                            hash: hash.clone(),
                            ast: ast.clone(),
                            patch_version,
                        });
                    }
                }
            }
            if query.deleted {
                continue;
            }
            for (client_id, desired_at) in query.parse_desired_by()? {
                let cookie = desired_at.to_cookie();
                if cookie.as_str() > from_cookie.as_str() && cookie.as_str() <= to_cookie.as_str() {
                    patches.push(ConfigPatchRecord::DesiredQuery {
                        op: PatchOp::Put,
                        client_id,
                        hash: hash.clone(),
                        ast: ast.clone(),
                        patch_version: desired_at,
                    });
                }
            }
        }

        Ok(patches
            .into_iter()
            .sorted_by(|a, b| {
                (a.patch_version(), a.sort_key()).cmp(&(b.patch_version(), b.sort_key()))
            })
            .collect())
    }

    async fn commit(&self, group_id: &str, batch: &CvrWriteBatch) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, PostgresError, _>(|conn| {
            async move {
                apply_instance_cas(group_id, batch, conn).await?;
                upsert_clients(group_id, batch, conn).await?;
                upsert_queries(group_id, batch, conn).await?;
                upsert_rows(group_id, batch, conn).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(StorageError::from)?;
        debug!(
            group_id,
            version = %batch.version,
            clients = batch.clients.len(),
            queries = batch.queries.len(),
            rows = batch.rows.len(),
            "committed cvr flush"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::db_fixtures;
    use diesel_async::AsyncConnection;
    use prism_core::{
        models::{query::QueryAst, row::RowKey, QueryHash, SqlValue},
        storage::{ClientWrite, QueryWrite, RowWrite},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup_db() -> AsyncPgConnection {
        let db_url = std::env::var("DATABASE_URL").unwrap();
        let mut conn = AsyncPgConnection::establish(&db_url)
            .await
            .unwrap();
        conn.begin_test_transaction()
            .await
            .unwrap();
        conn
    }

    async fn setup_data(conn: &mut AsyncPgConnection) {
        db_fixtures::insert_instance(conn, "g1", "1xz.01", "2026-07-18T00:00:00").await;
        db_fixtures::insert_client(conn, "g1", "cA", "1xz.01", &["qH"], false).await;
        let ast = serde_json::to_value(QueryAst::table("public", "issues")).unwrap();
        db_fixtures::insert_query(
            conn,
            "g1",
            "qH",
            Some(ast),
            false,
            json!({"cA": "1xz.01"}),
            Some("tH"),
            Some("1xz.01"),
            false,
        )
        .await;
        db_fixtures::insert_row(
            conn,
            "g1",
            "public",
            "issues",
            json!({"id": 1}),
            "1aa",
            "1xz",
            Some(json!({"qH": 1})),
        )
        .await;
        db_fixtures::insert_row(
            conn,
            "g1",
            "public",
            "issues",
            json!({"id": 2}),
            "1ab",
            "1xz.01",
            Some(json!({"qH": 1})),
        )
        .await;
        db_fixtures::insert_row(
            conn,
            "g1",
            "public",
            "issues",
            json!({"id": 3}),
            "1ac",
            "1xz.01",
            None,
        )
        .await;
    }

    // These tests require a live postgres reachable through DATABASE_URL,
    // with migrations applied.

    #[ignore = "requires DATABASE_URL"]
    #[tokio::test]
    async fn test_load_assembles_snapshot() {
        let mut conn = setup_db().await;
        setup_data(&mut conn).await;
        drop(conn);

        let pool = crate::postgres::testing::setup_pool().await;
        let gateway = PostgresCvrGateway::new(pool);
        let snapshot = CvrGateway::load(&gateway, "g1").await.unwrap().unwrap();

        assert_eq!(snapshot.version.to_cookie(), "1xz.01");
        assert_eq!(snapshot.clients.len(), 1);
        assert_eq!(snapshot.queries.len(), 1);
        assert_eq!(snapshot.rows.len(), 3);
        assert!(CvrGateway::load(&gateway, "absent").await.unwrap().is_none());
    }

    #[ignore = "requires DATABASE_URL"]
    #[tokio::test]
    async fn test_row_patch_pages_are_ordered_and_resumable() {
        crate::postgres::testing::run_against_db(|pool| async move {
            let mut conn = pool.get().await.unwrap();
            setup_data(&mut conn).await;
            drop(conn);

            let gateway = PostgresCvrGateway::new(pool);
            let from = CvrVersion::from_cookie("1xz").unwrap();
            let to = CvrVersion::from_cookie("1xz.01").unwrap();
            let first = gateway
                .row_patches_page("g1", &from, &to, None, 1)
                .await
                .unwrap();
            assert_eq!(first.len(), 1);
            assert_eq!(first[0].row_id.key, RowKey::single("id", SqlValue::Int(2)));

            let cursor = RowPatchCursor::after(&first[0]);
            let rest = gateway
                .row_patches_page("g1", &from, &to, Some(&cursor), 10)
                .await
                .unwrap();
            assert_eq!(rest.len(), 1);
            assert_eq!(rest[0].row_id.key, RowKey::single("id", SqlValue::Int(3)));
            assert_eq!(rest[0].ref_counts, None);
        })
        .await;
    }

    #[ignore = "requires DATABASE_URL"]
    #[tokio::test]
    async fn test_commit_cas_detects_concurrent_writer() {
        crate::postgres::testing::run_against_db(|pool| async move {
            let gateway = PostgresCvrGateway::new(pool);
            let base = CvrWriteBatch {
                expected_version: None,
                version: CvrVersion::from_cookie("1xz").unwrap(),
                last_active: "2026-07-18T00:00:00".parse().unwrap(),
                clients: vec![ClientWrite {
                    client_id: "cA".into(),
                    patch_version: CvrVersion::from_cookie("1xz").unwrap(),
                    desired_query_ids: vec![QueryHash::from("qH")],
                    deleted: false,
                }],
                queries: vec![QueryWrite {
                    hash: QueryHash::from("qH"),
                    ast: Some(QueryAst::table("public", "issues")),
                    internal: false,
                    desired_by: Default::default(),
                    transformation_hash: None,
                    transformation_version: None,
                    patch_version: None,
                    deleted: false,
                }],
                rows: vec![RowWrite {
                    row_id: prism_core::models::RowId::new(
                        "public",
                        "issues",
                        RowKey::single("id", SqlValue::Int(1)),
                    ),
                    patch_version: CvrVersion::from_cookie("1xz").unwrap(),
                    row_version: "1aa".into(),
                    ref_counts: Some([(QueryHash::from("qH"), 1)].into_iter().collect()),
                }],
            };
            gateway.commit("g1", &base).await.unwrap();

            // Second insert of the same fresh group must conflict.
            let err = gateway.commit("g1", &base).await.unwrap_err();
            assert!(matches!(err, StorageError::ConcurrentModification(..)));

            // A stale expected version must conflict without mutating.
            let mut stale = base.clone();
            stale.expected_version = Some(CvrVersion::from_cookie("0z").unwrap());
            stale.version = CvrVersion::from_cookie("1y0").unwrap();
            let err = gateway.commit("g1", &stale).await.unwrap_err();
            assert!(matches!(err, StorageError::ConcurrentModification(..)));
            let snapshot = CvrGateway::load(&gateway, "g1").await.unwrap().unwrap();
            assert_eq!(snapshot.version.to_cookie(), "1xz");
        })
        .await;
    }
}
