//! # Postgres based CVR storage backend
//!
//! Implements the `CvrGateway` trait from `prism-core` on top of the four
//! CVR tables (`cvr_instances`, `cvr_clients`, `cvr_queries`, `cvr_rows`).
//!
//! ## Design Decisions
//!
//! ### Versions as cookie strings
//!
//! Every version column stores the cookie encoding of the CVR version. The
//! cookie encoding is order preserving, so range scans for catch-up and the
//! commit compare-and-swap are plain text comparisons that postgres can
//! serve from the `(client_group_id, patch_version, …)` indexes without any
//! decoding.
//!
//! ### Tombstones
//!
//! Deleted clients and queries keep their row with `deleted = TRUE` and the
//! patch version of the deletion, so catch-up can emit `del` patches for
//! clients that reconnect from an older cookie. Unreferenced rows keep
//! their row with `ref_counts = NULL` for the same reason. Pruning
//! tombstones once every client has advanced past them is an external
//! garbage collection concern.
//!
//! ### Atomic commits
//!
//! A flush is a single transaction: the instance row is updated with a
//! compare-and-swap on its version column, then clients, queries and rows
//! are upserted in chunks. If the stored version does not match the
//! expected one, another service instance owns the group and the commit
//! fails with `ConcurrentModification` without touching any table.
//!
//! ### Timestamps
//!
//! We use naive timestamps as it is assumed that the server running the
//! application always uses UTC as its local time. Tests should create
//! timezone aware timestamps and convert to UTC before comparing.
use diesel::{prelude::*, ConnectionError};
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use prism_core::storage::StorageError;
use tracing::info;

pub mod cvr;
pub mod orm;
pub mod schema;

pub use cvr::PostgresCvrGateway;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/");

pub(crate) struct PostgresError(pub(crate) StorageError);

impl From<diesel::result::Error> for PostgresError {
    fn from(value: diesel::result::Error) -> Self {
        PostgresError(StorageError::Unexpected(format!("DieselError: {}", value)))
    }
}

impl From<PostgresError> for StorageError {
    fn from(value: PostgresError) -> Self {
        value.0
    }
}

impl From<StorageError> for PostgresError {
    fn from(value: StorageError) -> Self {
        PostgresError(value)
    }
}

pub(crate) fn pool_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Unavailable(format!("{}", err))
}

/// Establishes a connection pool to the CVR database and brings the schema
/// up to date.
///
/// # Arguments
///
/// - `db_url`: connection string of the CVR database.
pub async fn connect(db_url: &str) -> Result<Pool<AsyncPgConnection>, StorageError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    let pool = Pool::builder(config)
        .build()
        .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;
    run_migrations(db_url)?;
    Ok(pool)
}

fn run_migrations(db_url: &str) -> Result<(), StorageError> {
    info!("Upgrading CVR database...");
    let mut conn = PgConnection::establish(db_url).map_err(|err: ConnectionError| {
        StorageError::Unavailable(format!("could not connect for migrations: {}", err))
    })?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| StorageError::Unexpected(format!("migrations failed: {}", err)))?;
    Ok(())
}

// TODO: add cfg(test) once the syncer crate no longer needs these fixtures
// for its ignored end-to-end DB tests.
pub mod testing {
    //! # Reusable components to write tests against the DB.
    use diesel::sql_query;
    use diesel_async::{
        pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
        AsyncPgConnection, RunQueryDsl,
    };
    use std::future::Future;

    pub async fn setup_pool() -> Pool<AsyncPgConnection> {
        let database_url =
            std::env::var("DATABASE_URL").expect("Database URL must be set for testing");
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        Pool::builder(config).build().unwrap()
    }

    pub async fn teardown(conn: &mut AsyncPgConnection) {
        // cvr_instances last, the other tables cascade from it.
        let tables = vec!["cvr_rows", "cvr_queries", "cvr_clients", "cvr_instances"];
        for t in tables.iter() {
            sql_query(format!("DELETE FROM {};", t))
                .execute(conn)
                .await
                .unwrap_or_else(|_| panic!("Error truncating {} table", t));
        }
    }

    /// Run tests that require committing data to the db.
    ///
    /// Passes a connection pool to the test body and purges all CVR tables
    /// afterwards so the next test starts from a clean slate. Prefer
    /// `begin_test_transaction` where the setup allows it; tests using this
    /// helper have to run serially.
    pub async fn run_against_db<F, Fut>(test_f: F)
    where
        F: FnOnce(Pool<AsyncPgConnection>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let connection_pool = setup_pool().await;
        let inner_pool = connection_pool.clone();
        let res = tokio::spawn(async move {
            test_f(inner_pool).await;
        })
        .await;

        let mut connection = connection_pool
            .get()
            .await
            .expect("Failed to get a connection from the pool");

        teardown(&mut connection).await;
        res.unwrap();
    }
}

// TODO: add cfg(test) once the syncer crate no longer needs these fixtures
// for its ignored end-to-end DB tests.
pub mod db_fixtures {
    //! # General Purpose Fixtures for CVR Database State
    //!
    //! The fixtures insert raw table rows without going through the gateway,
    //! so gateway tests never depend on the code they are validating.
    use chrono::NaiveDateTime;
    use diesel_async::{AsyncPgConnection, RunQueryDsl};

    use super::schema;
    use diesel::prelude::*;

    pub async fn insert_instance(
        conn: &mut AsyncPgConnection,
        group_id: &str,
        version: &str,
        last_active: &str,
    ) {
        diesel::insert_into(schema::cvr_instances::table)
            .values((
                schema::cvr_instances::client_group_id.eq(group_id),
                schema::cvr_instances::version.eq(version),
                schema::cvr_instances::last_active.eq(last_active
                    .parse::<NaiveDateTime>()
                    .expect("timestamp")),
            ))
            .execute(conn)
            .await
            .expect("instance insert ok");
    }

    pub async fn insert_client(
        conn: &mut AsyncPgConnection,
        group_id: &str,
        client_id: &str,
        patch_version: &str,
        desired: &[&str],
        deleted: bool,
    ) {
        diesel::insert_into(schema::cvr_clients::table)
            .values((
                schema::cvr_clients::client_group_id.eq(group_id),
                schema::cvr_clients::client_id.eq(client_id),
                schema::cvr_clients::patch_version.eq(patch_version),
                schema::cvr_clients::desired_query_ids
                    .eq(desired.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
                schema::cvr_clients::deleted.eq(deleted),
            ))
            .execute(conn)
            .await
            .expect("client insert ok");
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_query(
        conn: &mut AsyncPgConnection,
        group_id: &str,
        hash: &str,
        ast: Option<serde_json::Value>,
        internal: bool,
        desired_by: serde_json::Value,
        transformation_hash: Option<&str>,
        patch_version: Option<&str>,
        deleted: bool,
    ) {
        diesel::insert_into(schema::cvr_queries::table)
            .values((
                schema::cvr_queries::client_group_id.eq(group_id),
                schema::cvr_queries::query_hash.eq(hash),
                schema::cvr_queries::ast.eq(ast),
                schema::cvr_queries::internal.eq(internal),
                schema::cvr_queries::desired_by.eq(desired_by),
                schema::cvr_queries::transformation_hash.eq(transformation_hash),
                schema::cvr_queries::transformation_version.eq(patch_version),
                schema::cvr_queries::patch_version.eq(patch_version),
                schema::cvr_queries::deleted.eq(deleted),
            ))
            .execute(conn)
            .await
            .expect("query insert ok");
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_row(
        conn: &mut AsyncPgConnection,
        group_id: &str,
        row_schema: &str,
        row_table: &str,
        row_key: serde_json::Value,
        row_version: &str,
        patch_version: &str,
        ref_counts: Option<serde_json::Value>,
    ) {
        diesel::insert_into(schema::cvr_rows::table)
            .values((
                schema::cvr_rows::client_group_id.eq(group_id),
                schema::cvr_rows::row_schema.eq(row_schema),
                schema::cvr_rows::row_table.eq(row_table),
                schema::cvr_rows::row_key_text.eq(row_key.to_string()),
                schema::cvr_rows::row_key.eq(row_key),
                schema::cvr_rows::row_version.eq(row_version),
                schema::cvr_rows::patch_version.eq(patch_version),
                schema::cvr_rows::ref_counts.eq(ref_counts),
            ))
            .execute(conn)
            .await
            .expect("row insert ok");
    }
}
