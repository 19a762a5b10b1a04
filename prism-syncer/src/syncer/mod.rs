//! The view syncer service.
//!
//! One `ViewSyncer` instance serves one client group. It owns the group's
//! CVR snapshot pointer, the connected client handlers and the incremental
//! query pipeline, all behind a single fair mutex. The run loop consumes
//! replica-version-ready signals; client RPCs enter the same lock. There is
//! no shared mutable state between groups, so scaling out is by
//! partitioning groups across instances.
//!
//! Operations inside the lock may suspend for storage I/O, pipeline reads
//! or poker sends; the mutex is fair FIFO, and the CVR snapshot pointer is
//! only replaced after a successful atomic flush, so no invariant-violating
//! state is visible across a suspension point.

pub mod client;

use crate::{
    cvr::{
        updater::{ConfigUpdater, RowPatchOutput, RowUpdate, RowsUpdater},
        CvrStore, CURSOR_PAGE_SIZE,
    },
    error::SyncError,
    pipeline::{PipelineDriver, ReplicaHandle, RowChange},
};
use client::{ClientHandler, PokeOutcome, PokePatch, Poker, Subscription};
use futures03::StreamExt;
use prism_core::{
    models::{
        cvr::CvrSnapshot,
        query::{Condition, QueryAst, QueryHash},
        row::{split_row_version, Row, RowId, SqlValue, ROW_VERSION_COLUMN},
        version::{CvrVersion, StateVersion},
        ClientGroupId, ClientId,
    },
    storage::{ConfigPatchRecord, CvrGateway},
    sync::{ClientPatch, DesiredQueryOp, EntityPatch, PatchOp, QueryPatch},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Default idle timeout before an unused group service shuts down.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(30_000);

/// Identifier of the internal query tracking last-mutation-ids for the
/// group's clients.
pub const LMIDS_QUERY_ID: &str = "lmids";

/// Schema and table of the replicated sync-metadata clients table.
pub const SYNC_SCHEMA: &str = "prism";
pub const SYNC_CLIENTS_TABLE: &str = "clients";

const CLIENT_GROUP_ID_COLUMN: &str = "clientGroupID";
const CLIENT_ID_COLUMN: &str = "clientID";
const LAST_MUTATION_ID_COLUMN: &str = "lastMutationID";

/// The internal query over the sync-metadata clients table for one group.
pub fn lmids_query(group_id: &str) -> QueryAst {
    QueryAst::filtered(
        SYNC_SCHEMA,
        SYNC_CLIENTS_TABLE,
        Condition::Eq {
            column: CLIENT_GROUP_ID_COLUMN.to_string(),
            value: SqlValue::Text(group_id.to_string()),
        },
    )
}

fn is_sync_clients_row(row_id: &RowId) -> bool {
    row_id.schema == SYNC_SCHEMA && row_id.table == SYNC_CLIENTS_TABLE
}

fn last_mutation_id_change(contents: &Row) -> Option<(ClientId, u64)> {
    let client_id = match contents.get(CLIENT_ID_COLUMN)? {
        SqlValue::Text(s) => s.clone(),
        _ => return None,
    };
    match contents.get(LAST_MUTATION_ID_COLUMN)? {
        SqlValue::Int(lmid) if *lmid >= 0 => Some((client_id, *lmid as u64)),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct SyncerConfig {
    pub keepalive: Duration,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        SyncerConfig { keepalive: DEFAULT_KEEPALIVE }
    }
}

/// Connection context of `initConnection`.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub client_id: ClientId,
    pub ws_id: String,
    pub base_cookie: Option<String>,
}

/// Context of per-connection RPCs after `initConnection`.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub client_id: ClientId,
    pub ws_id: String,
}

struct ServiceState {
    cvr: Option<Arc<CvrSnapshot>>,
    cvr_exists: bool,
    clients: HashMap<ClientId, ClientHandler>,
    pipeline: PipelineDriver,
    /// Config patches (desired-query deletes) that have no durable
    /// catch-up representation; broadcast with the next poke.
    pending_config_patches: Vec<PokePatch>,
    /// Queries whose hydration failed; excluded from reconciliation until
    /// the service restarts.
    poisoned: BTreeSet<QueryHash>,
}

pub struct ViewSyncer {
    store: CvrStore,
    config: SyncerConfig,
    state: Mutex<ServiceState>,
    shutdown: Notify,
    stopped: AtomicBool,
    /// Group failure raised outside the run loop (e.g. by an RPC); the run
    /// loop picks it up on shutdown so clients are closed with the error.
    failure: std::sync::Mutex<Option<SyncError>>,
    idle_tx: watch::Sender<Option<tokio::time::Instant>>,
}

impl ViewSyncer {
    pub fn new(store: CvrStore, replica: ReplicaHandle, config: SyncerConfig) -> Self {
        let (idle_tx, _) = watch::channel(None);
        ViewSyncer {
            store,
            config,
            state: Mutex::new(ServiceState {
                cvr: None,
                cvr_exists: false,
                clients: HashMap::new(),
                pipeline: PipelineDriver::new(replica),
                pending_config_patches: Vec::new(),
                poisoned: BTreeSet::new(),
            }),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
            failure: std::sync::Mutex::new(None),
            idle_tx,
        }
    }

    pub fn group_id(&self) -> &str {
        self.store.group_id()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Cancels the run loop; connected clients are closed cleanly after the
    /// current iteration. `notify_one` stores a permit, so a stop raised
    /// while the loop is mid-iteration is not lost.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    fn arm_idle(&self) {
        self.idle_tx
            .send_replace(Some(tokio::time::Instant::now() + self.config.keepalive));
    }

    fn disarm_idle(&self) {
        self.idle_tx.send_replace(None);
    }

    /// Resolves once the armed idle deadline passes; pends forever while
    /// disarmed.
    async fn idle_fired(rx: &mut watch::Receiver<Option<tokio::time::Instant>>) {
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    /// Drives the service until stop, idle timeout, fatal error or the end
    /// of the version stream.
    pub async fn run(self: Arc<Self>, mut version_changes: watch::Receiver<StateVersion>) {
        let span = info_span!("view-syncer", group_id = %self.group_id());
        async {
            info!("view syncer starting");
            let result = self.run_inner(&mut version_changes).await;
            let failure = result.err().or_else(|| {
                self.failure
                    .lock()
                    .expect("failure lock poisoned")
                    .take()
            });
            if let Some(err) = &failure {
                error!(%err, "view syncer failed");
            }
            self.cleanup(failure).await;
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        version_changes: &mut watch::Receiver<StateVersion>,
    ) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock().await;
            self.ensure_cvr(&mut state).await?;
            self.process_version_ready(&mut state).await?;
            if state.clients.is_empty() {
                self.arm_idle();
            }
        }

        let mut idle_rx = self.idle_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => return Ok(()),
                _ = Self::idle_fired(&mut idle_rx) => {
                    let state = self.state.lock().await;
                    if state.clients.is_empty() {
                        info!("idle timeout reached, shutting down");
                        return Ok(());
                    }
                }
                changed = version_changes.changed() => {
                    if changed.is_err() {
                        info!("replica version stream ended");
                        return Ok(());
                    }
                    let mut state = self.state.lock().await;
                    self.process_version_ready(&mut state).await?;
                }
            }
        }
    }

    async fn cleanup(&self, err: Option<SyncError>) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        for (_, handler) in state.clients.drain() {
            match &err {
                Some(e) => handler.fail(e),
                None => handler.close(),
            }
        }
        info!("view syncer stopped");
    }

    async fn ensure_cvr(&self, state: &mut ServiceState) -> Result<(), SyncError> {
        if state.cvr.is_none() {
            let loaded = self.store.load().await?;
            state.cvr = Some(loaded.snapshot);
            state.cvr_exists = loaded.exists;
        }
        Ok(())
    }

    fn cvr(state: &ServiceState) -> Result<&Arc<CvrSnapshot>, SyncError> {
        state
            .cvr
            .as_ref()
            .ok_or_else(|| SyncError::Internal("cvr not loaded".to_string()))
    }

    async fn process_version_ready(&self, state: &mut ServiceState) -> Result<(), SyncError> {
        if !state.pipeline.initialized() {
            state.pipeline.init();
            self.hydrate_unchanged_queries(state)?;
            self.sync_query_pipeline_set(state).await?;
        }
        while self.advance_pipelines(state).await? {}
        Ok(())
    }

    /// Fast path at startup: when the CVR is already at the pipeline's
    /// state version, re-register got queries whose transformation hash is
    /// unchanged, discarding their hydration output. This rebuilds pipeline
    /// state without touching the CVR.
    fn hydrate_unchanged_queries(&self, state: &mut ServiceState) -> Result<(), SyncError> {
        let cvr = Self::cvr(state)?.clone();
        let pipeline_version = state
            .pipeline
            .current_version()
            .cloned()
            .ok_or_else(|| SyncError::Internal("pipeline not initialized".to_string()))?;
        if cvr.version.state_version != pipeline_version {
            if cvr.version.state_version > pipeline_version {
                return Err(SyncError::Fatal(format!(
                    "cvr at state version {} is ahead of the replica at {}",
                    cvr.version.state_version, pipeline_version
                )));
            }
            return Ok(());
        }
        for query in cvr.queries.values().filter(|q| q.is_got()) {
            let identity = query.ast.transformation_hash();
            if query.transformation_hash.as_deref() != Some(identity.as_str()) {
                continue;
            }
            match state
                .pipeline
                .add_query(query.id.clone(), query.ast.clone())
            {
                Ok(changes) => {
                    debug!(hash = %query.id, rows = changes.len(), "re-hydrated unchanged query");
                }
                Err(err) => {
                    return Err(SyncError::Fatal(format!(
                        "re-hydration of query `{}` failed: {}",
                        query.id, err
                    )));
                }
            }
        }
        Ok(())
    }

    /// The reconciler: converges the pipeline's registered query set with
    /// the CVR's desired set, then catches connected clients up.
    async fn sync_query_pipeline_set(&self, state: &mut ServiceState) -> Result<(), SyncError> {
        let cvr = Self::cvr(state)?.clone();
        let hydrated = state.pipeline.added_queries();
        let desired = cvr.desired_queries();
        let all = cvr.all_queries();

        let to_add: Vec<(QueryHash, QueryAst)> = desired
            .difference(&hydrated)
            .filter(|hash| !state.poisoned.contains(*hash))
            .filter_map(|hash| {
                cvr.queries
                    .get(hash)
                    .map(|q| (hash.clone(), q.ast.clone()))
            })
            .collect();
        let to_remove: Vec<QueryHash> = all.difference(&desired).cloned().collect();

        if !to_add.is_empty() || !to_remove.is_empty() {
            self.add_and_remove_queries(state, to_add, to_remove)
                .await?;
        } else {
            let target = cvr.version.clone();
            let mut pokers = Self::start_pokers(state, &target);
            if !pokers.is_empty() {
                self.catchup_clients(state, BTreeSet::new(), target, &mut pokers)
                    .await?;
            }
            self.finish_pokers(state, pokers);
        }

        let cvr = Self::cvr(state)?;
        if let Some(pipeline_version) = state.pipeline.current_version() {
            if &cvr.version.state_version > pipeline_version {
                return Err(SyncError::Fatal(format!(
                    "cvr advanced past the pipeline: {} > {}",
                    cvr.version.state_version, pipeline_version
                )));
            }
        }
        Ok(())
    }

    async fn add_and_remove_queries(
        &self,
        state: &mut ServiceState,
        to_add: Vec<(QueryHash, QueryAst)>,
        to_remove: Vec<QueryHash>,
    ) -> Result<(), SyncError> {
        let base_cvr = Self::cvr(state)?.clone();
        let pipeline_version = state
            .pipeline
            .current_version()
            .cloned()
            .ok_or_else(|| SyncError::Internal("pipeline not initialized".to_string()))?;
        debug!(
            add = to_add.len(),
            remove = to_remove.len(),
            version = %pipeline_version,
            "reconciling query pipeline set"
        );

        let mut updater = RowsUpdater::new(
            self.store.clone(),
            base_cvr.clone(),
            state.cvr_exists,
            pipeline_version,
        );
        let query_patches = updater.track_queries(&to_add, &to_remove)?;
        let new_version = updater.updated_version().clone();

        let mut pokers = Self::start_pokers(state, &new_version);
        for patch in &query_patches {
            let patch = PokePatch::GotQuery(patch.clone());
            for poker in pokers.iter_mut() {
                poker.add_patch(&patch);
            }
        }

        for hash in &to_remove {
            state.pipeline.remove_query(hash);
        }

        for (hash, ast) in &to_add {
            let hydrated = state
                .pipeline
                .add_query(hash.clone(), ast.clone())
                .and_then(|changes| Self::process_changes(changes, &mut updater, &mut pokers));
            if let Err(err) = hydrated {
                if err.terminates_group() {
                    return Err(err);
                }
                self.abort_query_cycle(state, &to_add, hash, pokers, err);
                return Ok(());
            }
        }

        let del_patches = updater.delete_unreferenced_rows();
        Self::push_row_patches(&del_patches, &mut pokers);

        let new_cvr = updater.flush().await?;
        state.cvr = Some(new_cvr);
        state.cvr_exists = true;

        let exclude: BTreeSet<QueryHash> = to_add.into_iter().map(|(hash, _)| hash).collect();
        self.catchup_clients(state, exclude, base_cvr.version.clone(), &mut pokers)
            .await?;
        self.finish_pokers(state, pokers);
        Ok(())
    }

    /// Unwinds a cycle whose hydration failed: nothing has been flushed, so
    /// the CVR is untouched; clients desiring the failed query (and any
    /// client whose poke already hit the wire) are closed, everyone else
    /// stays connected.
    fn abort_query_cycle(
        &self,
        state: &mut ServiceState,
        to_add: &[(QueryHash, QueryAst)],
        failed: &QueryHash,
        pokers: Vec<Poker>,
        err: SyncError,
    ) {
        warn!(hash = %failed, %err, "query hydration failed, aborting cycle");
        for (hash, _) in to_add {
            state.pipeline.remove_query(hash);
        }
        state.poisoned.insert(failed.clone());

        let offenders: BTreeSet<ClientId> = state
            .cvr
            .as_ref()
            .and_then(|cvr| cvr.queries.get(failed))
            .map(|q| q.desired_by.keys().cloned().collect())
            .unwrap_or_default();

        for mut poker in pokers {
            let client_id = poker.client_id().clone();
            let tainted = poker.fail();
            if tainted || offenders.contains(&client_id) {
                if let Some(handler) = state.clients.remove(&client_id) {
                    handler.fail(&err);
                }
            }
        }
        if state.clients.is_empty() {
            self.arm_idle();
        }
    }

    /// The hot path: consumes one replica delta, pages its row changes
    /// through a query-driven updater and pokes every client to the new
    /// version. Returns `false` when the pipeline is up to date.
    async fn advance_pipelines(&self, state: &mut ServiceState) -> Result<bool, SyncError> {
        let Some(advancement) = state.pipeline.advance()? else {
            return Ok(false);
        };
        debug!(
            version = %advancement.version,
            num_changes = advancement.num_changes,
            "advancing pipelines"
        );

        let base_cvr = Self::cvr(state)?.clone();
        let mut updater = RowsUpdater::new(
            self.store.clone(),
            base_cvr,
            state.cvr_exists,
            advancement.version,
        );
        let new_version = updater.updated_version().clone();
        let mut pokers = Self::start_pokers(state, &new_version);

        Self::process_changes(advancement.changes, &mut updater, &mut pokers)?;
        let del_patches = updater.delete_unreferenced_rows();
        Self::push_row_patches(&del_patches, &mut pokers);

        let new_cvr = updater.flush().await?;
        state.cvr = Some(new_cvr);
        state.cvr_exists = true;
        self.finish_pokers(state, pokers);
        Ok(true)
    }

    /// Pages row changes through the updater, [`CURSOR_PAGE_SIZE`] rows at
    /// a time, pushing the resulting patches to the pokers as each page
    /// flushes.
    fn process_changes(
        changes: Vec<RowChange>,
        updater: &mut RowsUpdater,
        pokers: &mut [Poker],
    ) -> Result<(), SyncError> {
        let mut batch: BTreeMap<RowId, RowUpdate> = BTreeMap::new();
        for change in changes {
            let update = batch.entry(change.row_id.clone()).or_default();
            let count = update
                .ref_counts
                .entry(change.query_hash.clone())
                .or_insert(0);
            *count += if change.row.is_some() { 1 } else { -1 };

            if let Some(row) = &change.row {
                if update.contents.is_none() {
                    let (version, contents) = split_row_version(row).ok_or_else(|| {
                        SyncError::Internal(format!(
                            "row {} is missing a valid `{}` column",
                            change.row_id, ROW_VERSION_COLUMN
                        ))
                    })?;
                    update.version = Some(version);
                    update.contents = Some(contents);
                }
            }

            if batch.len() >= CURSOR_PAGE_SIZE {
                let page = std::mem::take(&mut batch);
                let patches = updater.received(page)?;
                Self::push_row_patches(&patches, pokers);
            }
        }
        if !batch.is_empty() {
            let patches = updater.received(batch)?;
            Self::push_row_patches(&patches, pokers);
        }
        Ok(())
    }

    fn push_row_patches(patches: &[RowPatchOutput], pokers: &mut [Poker]) {
        for patch in patches {
            let poke_patch = match patch {
                RowPatchOutput::Put { row_id, contents } if is_sync_clients_row(row_id) => {
                    match last_mutation_id_change(contents) {
                        Some((client_id, last_mutation_id)) => {
                            PokePatch::LastMutationId { client_id, last_mutation_id }
                        }
                        None => {
                            warn!(%row_id, "malformed sync-metadata client row");
                            continue;
                        }
                    }
                }
                RowPatchOutput::Del { row_id } if is_sync_clients_row(row_id) => continue,
                RowPatchOutput::Put { row_id, contents } => PokePatch::Entity(EntityPatch {
                    op: PatchOp::Put,
                    entity_type: row_id.entity_type(),
                    entity_id: row_id.key.clone(),
                    value: Some(contents.clone()),
                }),
                RowPatchOutput::Del { row_id } => PokePatch::Entity(EntityPatch {
                    op: PatchOp::Del,
                    entity_type: row_id.entity_type(),
                    entity_id: row_id.key.clone(),
                    value: None,
                }),
            };
            for poker in pokers.iter_mut() {
                poker.add_patch(&poke_patch);
            }
        }
    }

    /// Streams stored catch-up patches to every poker whose client is
    /// behind `target`. Row patches solely referenced by `exclude` are
    /// skipped; the excluded queries' own hydration output replaces them.
    async fn catchup_clients(
        &self,
        state: &mut ServiceState,
        exclude: BTreeSet<QueryHash>,
        target: CvrVersion,
        pokers: &mut [Poker],
    ) -> Result<(), SyncError> {
        for poker in pokers.iter_mut() {
            let from = poker.base_version().clone();
            if from >= target {
                continue;
            }

            for record in self
                .store
                .catchup_config_patches(&from, &target)
                .await?
            {
                poker.add_patch(&config_patch_to_poke(record));
            }

            let stream =
                self.store
                    .catchup_row_patches(from, target.clone(), exclude.clone());
            tokio::pin!(stream);
            while let Some(record) = stream.next().await {
                let record = record?;
                let patch = match &record.ref_counts {
                    Some(_) => {
                        let row = state
                            .pipeline
                            .get_row(&record.row_id.schema, &record.row_id.table, &record.row_id.key)
                            .ok_or_else(|| {
                                SyncError::Internal(format!(
                                    "row {} referenced by the cvr has vanished from the replica",
                                    record.row_id
                                ))
                            })?;
                        let (_, contents) = split_row_version(row).ok_or_else(|| {
                            SyncError::Internal(format!(
                                "row {} is missing a valid `{}` column",
                                record.row_id, ROW_VERSION_COLUMN
                            ))
                        })?;
                        if is_sync_clients_row(&record.row_id) {
                            match last_mutation_id_change(&contents) {
                                Some((client_id, last_mutation_id)) => {
                                    PokePatch::LastMutationId { client_id, last_mutation_id }
                                }
                                None => continue,
                            }
                        } else {
                            PokePatch::Entity(EntityPatch {
                                op: PatchOp::Put,
                                entity_type: record.row_id.entity_type(),
                                entity_id: record.row_id.key.clone(),
                                value: Some(contents),
                            })
                        }
                    }
                    None => {
                        if is_sync_clients_row(&record.row_id) {
                            continue;
                        }
                        PokePatch::Entity(EntityPatch {
                            op: PatchOp::Del,
                            entity_type: record.row_id.entity_type(),
                            entity_id: record.row_id.key.clone(),
                            value: None,
                        })
                    }
                };
                poker.add_patch(&patch);
            }
        }
        Ok(())
    }

    /// Starts a poke towards `version` on every client that is behind it,
    /// carrying over any pending config patches.
    fn start_pokers(state: &mut ServiceState, version: &CvrVersion) -> Vec<Poker> {
        let mut pokers: Vec<Poker> = state
            .clients
            .values()
            .filter(|handler| handler.version() < version)
            .map(|handler| handler.start_poke(version.clone()))
            .collect();
        for patch in state.pending_config_patches.drain(..) {
            for poker in pokers.iter_mut() {
                poker.add_patch(&patch);
            }
        }
        pokers
    }

    fn finish_pokers(&self, state: &mut ServiceState, pokers: Vec<Poker>) {
        for poker in pokers {
            let client_id = poker.client_id().clone();
            match poker.end() {
                PokeOutcome::Applied(version) => {
                    if let Some(handler) = state.clients.get_mut(&client_id) {
                        handler.set_version(version);
                    }
                }
                PokeOutcome::Failed => {
                    warn!(%client_id, "poke failed, dropping client");
                    if let Some(handler) = state.clients.remove(&client_id) {
                        handler.close();
                    }
                }
            }
        }
        if state.clients.is_empty() {
            self.arm_idle();
        }
    }

    fn apply_desired_ops(
        updater: &mut ConfigUpdater,
        client_id: &str,
        ops: &[DesiredQueryOp],
    ) {
        for op in ops {
            match op {
                DesiredQueryOp::Put { hash, ast } => {
                    updater.put_desired_queries(
                        client_id,
                        &BTreeMap::from([(QueryHash::from(hash.as_str()), ast.clone())]),
                    );
                }
                DesiredQueryOp::Del { hash } => {
                    updater
                        .delete_desired_queries(client_id, &[QueryHash::from(hash.as_str())]);
                }
                DesiredQueryOp::Clear => updater.clear_desired_queries(client_id),
            }
        }
    }

    fn validate_desired_ops(
        state: &ServiceState,
        ops: &[DesiredQueryOp],
    ) -> Result<(), SyncError> {
        for op in ops {
            if let DesiredQueryOp::Put { ast, .. } = op {
                state.pipeline.validate_query(ast)?;
            }
        }
        Ok(())
    }

    /// Keeps only patches that have no durable catch-up representation;
    /// everything else reaches clients through the catch-up streams.
    fn stash_pending_patches(state: &mut ServiceState, patches: Vec<PokePatch>) {
        state
            .pending_config_patches
            .extend(patches.into_iter().filter(|patch| {
                matches!(
                    patch,
                    PokePatch::DesiredQuery { patch: QueryPatch { op: PatchOp::Del, .. }, .. }
                )
            }));
    }

    fn escalate(&self, err: &SyncError) {
        if err.terminates_group() {
            error!(%err, "group failure, shutting down");
            self.failure
                .lock()
                .expect("failure lock poisoned")
                .replace(err.clone());
            self.shutdown.notify_one();
        }
    }

    /// Registers a client connection and applies its initial desired-query
    /// patch. Returns the ordered downstream message sequence; any prior
    /// handler with the same client id is closed.
    pub async fn init_connection(
        &self,
        ctx: ConnectionContext,
        desired: Vec<DesiredQueryOp>,
    ) -> Result<Subscription, SyncError> {
        let result = self.init_connection_inner(ctx, desired).await;
        if let Err(err) = &result {
            self.escalate(err);
        }
        result
    }

    async fn init_connection_inner(
        &self,
        ctx: ConnectionContext,
        desired: Vec<DesiredQueryOp>,
    ) -> Result<Subscription, SyncError> {
        if self.is_stopped() {
            return Err(SyncError::Unavailable(prism_core::storage::StorageError::Unavailable(
                "view syncer is stopped".to_string(),
            )));
        }
        let mut state = self.state.lock().await;
        self.ensure_cvr(&mut state).await?;
        let cvr = Self::cvr(&state)?.clone();

        let base_version = CvrVersion::from_base_cookie(ctx.base_cookie.as_deref())?;
        if base_version > cvr.version {
            return Err(SyncError::BadRequest(format!(
                "base cookie `{}` is ahead of the cvr at `{}`",
                base_version, cvr.version
            )));
        }
        Self::validate_desired_ops(&state, &desired)?;

        info!(client_id = %ctx.client_id, ws_id = %ctx.ws_id, "initializing connection");
        let (handler, subscription) =
            ClientHandler::new(&ctx.client_id, &ctx.ws_id, base_version);
        if let Some(previous) = state.clients.insert(ctx.client_id.clone(), handler) {
            debug!(client_id = %ctx.client_id, "closing superseded connection");
            previous.close();
        }
        self.disarm_idle();

        let mut updater = ConfigUpdater::new(self.store.clone(), cvr, state.cvr_exists);
        updater.put_client(&ctx.client_id);
        updater.put_internal_query(
            QueryHash::from(LMIDS_QUERY_ID),
            lmids_query(self.store.group_id()),
        );
        Self::apply_desired_ops(&mut updater, &ctx.client_id, &desired);
        if updater.has_changes() {
            let (new_cvr, patches) = updater.flush().await?;
            state.cvr = Some(new_cvr);
            state.cvr_exists = true;
            Self::stash_pending_patches(&mut state, patches);
        }

        if state.pipeline.initialized() {
            self.sync_query_pipeline_set(&mut state).await?;
        }
        Ok(subscription)
    }

    /// Applies a desired-query patch for an existing connection. Messages
    /// carrying a stale websocket id are silently dropped; the connection
    /// they belong to is already gone.
    pub async fn change_desired_queries(
        &self,
        ctx: &RequestContext,
        desired: Vec<DesiredQueryOp>,
    ) -> Result<(), SyncError> {
        let result = self
            .change_desired_queries_inner(ctx, desired)
            .await;
        if let Err(err) = &result {
            self.escalate(err);
        }
        result
    }

    async fn change_desired_queries_inner(
        &self,
        ctx: &RequestContext,
        desired: Vec<DesiredQueryOp>,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        match state.clients.get(&ctx.client_id) {
            Some(handler) if handler.ws_id() == ctx.ws_id => {}
            _ => {
                debug!(client_id = %ctx.client_id, ws_id = %ctx.ws_id, "dropping stale message");
                return Ok(());
            }
        }
        self.ensure_cvr(&mut state).await?;
        Self::validate_desired_ops(&state, &desired)?;

        let cvr = Self::cvr(&state)?.clone();
        let mut updater = ConfigUpdater::new(self.store.clone(), cvr, state.cvr_exists);
        Self::apply_desired_ops(&mut updater, &ctx.client_id, &desired);
        if updater.has_changes() {
            let (new_cvr, patches) = updater.flush().await?;
            state.cvr = Some(new_cvr);
            state.cvr_exists = true;
            Self::stash_pending_patches(&mut state, patches);
        }

        if state.pipeline.initialized() {
            self.sync_query_pipeline_set(&mut state).await?;
        }
        Ok(())
    }

    /// Liveness probe from the connection layer; extends the idle timer.
    pub async fn keepalive(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let state = self.state.lock().await;
        if state.clients.is_empty() {
            self.arm_idle();
        }
        true
    }

    /// Removes a client's handler after its connection closed. Stale
    /// websocket ids are ignored.
    pub async fn remove_client(&self, ctx: &RequestContext) {
        let mut state = self.state.lock().await;
        let current = state
            .clients
            .get(&ctx.client_id)
            .map(|handler| handler.ws_id() == ctx.ws_id)
            .unwrap_or(false);
        if !current {
            debug!(client_id = %ctx.client_id, "ignoring removal of stale connection");
            return;
        }
        if let Some(handler) = state.clients.remove(&ctx.client_id) {
            handler.close();
        }
        if state.clients.is_empty() {
            self.arm_idle();
        }
    }
}

fn config_patch_to_poke(record: ConfigPatchRecord) -> PokePatch {
    match record {
        ConfigPatchRecord::Client { op, client_id, .. } => {
            PokePatch::Client(ClientPatch { op, client_id })
        }
        ConfigPatchRecord::GotQuery { op, hash, ast, .. } => {
            PokePatch::GotQuery(QueryPatch { op, hash: hash.to_string(), ast })
        }
        ConfigPatchRecord::DesiredQuery { op, client_id, hash, ast, .. } => {
            PokePatch::DesiredQuery {
                client_id,
                patch: QueryPatch { op, hash: hash.to_string(), ast },
            }
        }
    }
}

/// Hands out one running [`ViewSyncer`] per client group; stopped syncers
/// are replaced on the next lookup and recover from their durable CVR.
pub struct SyncerRegistry {
    gateway: Arc<dyn CvrGateway>,
    replica: ReplicaHandle,
    config: SyncerConfig,
    syncers: Mutex<HashMap<ClientGroupId, Arc<ViewSyncer>>>,
}

impl SyncerRegistry {
    pub fn new(
        gateway: Arc<dyn CvrGateway>,
        replica: ReplicaHandle,
        config: SyncerConfig,
    ) -> Self {
        SyncerRegistry { gateway, replica, config, syncers: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, group_id: &str) -> Arc<ViewSyncer> {
        let mut syncers = self.syncers.lock().await;
        if let Some(existing) = syncers.get(group_id) {
            if !existing.is_stopped() {
                return existing.clone();
            }
        }
        let syncer = Arc::new(ViewSyncer::new(
            CvrStore::new(self.gateway.clone(), group_id),
            self.replica.clone(),
            self.config.clone(),
        ));
        tokio::spawn(syncer.clone().run(self.replica.subscribe()));
        syncers.insert(group_id.to_string(), syncer.clone());
        syncer
    }

    pub async fn stop_all(&self) {
        for syncer in self.syncers.lock().await.values() {
            syncer.stop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        pipeline::{ReplicaChange, ReplicaDelta},
        testing::InMemoryCvrGateway,
    };
    use prism_core::{
        models::{Row, RowKey},
        sync::{Downstream, PokePart, PokeStart},
    };
    use tokio::task::JoinHandle;

    const GROUP: &str = "g1";

    fn issue_row(id: i64, title: &str, version: &str) -> Row {
        Row::from([
            ("id".to_string(), SqlValue::Int(id)),
            ("title".to_string(), SqlValue::Text(title.to_string())),
            (ROW_VERSION_COLUMN.to_string(), SqlValue::Text(version.to_string())),
        ])
    }

    fn user_row(id: i64, name: &str, version: &str) -> Row {
        Row::from([
            ("id".to_string(), SqlValue::Int(id)),
            ("name".to_string(), SqlValue::Text(name.to_string())),
            (ROW_VERSION_COLUMN.to_string(), SqlValue::Text(version.to_string())),
        ])
    }

    fn lmid_row(client_id: &str, lmid: i64, version: &str) -> Row {
        Row::from([
            (CLIENT_GROUP_ID_COLUMN.to_string(), SqlValue::Text(GROUP.to_string())),
            (CLIENT_ID_COLUMN.to_string(), SqlValue::Text(client_id.to_string())),
            (LAST_MUTATION_ID_COLUMN.to_string(), SqlValue::Int(lmid)),
            (ROW_VERSION_COLUMN.to_string(), SqlValue::Text(version.to_string())),
        ])
    }

    /// Replica at version 100 with five issues, two users, one sync-metadata
    /// client row, and a table carrying a row with an empty version token.
    fn fixture_replica() -> ReplicaHandle {
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
        replica.create_table("public", "users", ["id", "name", ROW_VERSION_COLUMN]);
        replica.seed_row(
            "public",
            "users",
            RowKey::single("id", SqlValue::Int(1)),
            user_row(1, "ada", "1aa"),
        );
        replica.seed_row(
            "public",
            "users",
            RowKey::single("id", SqlValue::Int(2)),
            user_row(2, "grace", "1aa"),
        );
        replica.create_table(
            SYNC_SCHEMA,
            SYNC_CLIENTS_TABLE,
            [CLIENT_GROUP_ID_COLUMN, CLIENT_ID_COLUMN, LAST_MUTATION_ID_COLUMN, ROW_VERSION_COLUMN],
        );
        replica.seed_row(
            SYNC_SCHEMA,
            SYNC_CLIENTS_TABLE,
            RowKey::single(CLIENT_ID_COLUMN, SqlValue::Text("cA".to_string())),
            lmid_row("cA", 7, "1aa"),
        );
        replica.create_table("public", "broken", ["id", ROW_VERSION_COLUMN]);
        replica.seed_row(
            "public",
            "broken",
            RowKey::single("id", SqlValue::Int(1)),
            Row::from([
                ("id".to_string(), SqlValue::Int(1)),
                (ROW_VERSION_COLUMN.to_string(), SqlValue::Text(String::new())),
            ]),
        );
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

    fn users_all() -> QueryAst {
        QueryAst::table("public", "users")
    }

    struct Harness {
        gateway: Arc<InMemoryCvrGateway>,
        replica: ReplicaHandle,
        syncer: Arc<ViewSyncer>,
        run: JoinHandle<()>,
    }

    fn setup_with_config(config: SyncerConfig) -> Harness {
        let gateway = Arc::new(InMemoryCvrGateway::default());
        let replica = fixture_replica();
        let syncer = Arc::new(ViewSyncer::new(
            CvrStore::new(gateway.clone(), GROUP),
            replica.clone(),
            config,
        ));
        let run = tokio::spawn(syncer.clone().run(replica.subscribe()));
        Harness { gateway, replica, syncer, run }
    }

    fn setup() -> Harness {
        setup_with_config(SyncerConfig::default())
    }

    async fn connect(
        syncer: &Arc<ViewSyncer>,
        client_id: &str,
        ws_id: &str,
        base_cookie: Option<&str>,
        desired: Vec<DesiredQueryOp>,
    ) -> Subscription {
        syncer
            .init_connection(
                ConnectionContext {
                    client_id: client_id.to_string(),
                    ws_id: ws_id.to_string(),
                    base_cookie: base_cookie.map(str::to_string),
                },
                desired,
            )
            .await
            .expect("init connection failed")
    }

    fn put(hash: &str, ast: QueryAst) -> DesiredQueryOp {
        DesiredQueryOp::Put { hash: hash.to_string(), ast }
    }

    fn del(hash: &str) -> DesiredQueryOp {
        DesiredQueryOp::Del { hash: hash.to_string() }
    }

    async fn next_frame(sub: &mut Subscription) -> Downstream {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for a downstream frame")
            .expect("downstream closed")
    }

    struct CollectedPoke {
        start: PokeStart,
        parts: Vec<PokePart>,
    }

    impl CollectedPoke {
        fn entities(&self) -> Vec<EntityPatch> {
            self.parts
                .iter()
                .flat_map(|p| p.entities_patch.clone().unwrap_or_default())
                .collect()
        }

        fn got(&self) -> Vec<QueryPatch> {
            self.parts
                .iter()
                .flat_map(|p| p.got_queries_patch.clone().unwrap_or_default())
                .collect()
        }

        fn desired(&self) -> BTreeMap<String, Vec<QueryPatch>> {
            let mut merged: BTreeMap<String, Vec<QueryPatch>> = BTreeMap::new();
            for part in &self.parts {
                for (client, patches) in part
                    .desired_queries_patches
                    .clone()
                    .unwrap_or_default()
                {
                    merged.entry(client).or_default().extend(patches);
                }
            }
            merged
        }

        fn clients(&self) -> Vec<ClientPatch> {
            self.parts
                .iter()
                .flat_map(|p| p.clients_patch.clone().unwrap_or_default())
                .collect()
        }

        fn lmids(&self) -> BTreeMap<String, u64> {
            let mut merged = BTreeMap::new();
            for part in &self.parts {
                merged.extend(
                    part.last_mutation_id_changes
                        .clone()
                        .unwrap_or_default(),
                );
            }
            merged
        }
    }

    /// Reads exactly one well-framed poke off the stream, panicking on any
    /// frame that violates the start/part*/end sequence.
    async fn collect_poke(sub: &mut Subscription) -> CollectedPoke {
        let start = match next_frame(sub).await {
            Downstream::PokeStart(start) => start,
            other => panic!("expected pokeStart, got {:?}", other),
        };
        let mut parts = Vec::new();
        loop {
            match next_frame(sub).await {
                Downstream::PokePart(part) => {
                    assert_eq!(part.poke_id, start.poke_id);
                    parts.push(part);
                }
                Downstream::PokeEnd(end) => {
                    assert_eq!(end.poke_id, start.poke_id);
                    break;
                }
                other => panic!("unexpected frame inside a poke: {:?}", other),
            }
        }
        CollectedPoke { start, parts }
    }

    fn entity_ids(patches: &[EntityPatch], op: PatchOp, entity_type: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = patches
            .iter()
            .filter(|p| p.op == op && p.entity_type == entity_type)
            .filter_map(|p| match p.entity_id.0.get("id") {
                Some(SqlValue::Int(id)) => Some(*id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    #[test_log::test(tokio::test)]
    async fn fresh_client_with_one_query_gets_hydrated() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;

        let poke = collect_poke(&mut sub).await;
        assert_eq!(poke.start.base_cookie, None);
        assert_eq!(poke.start.cookie, StateVersion::from_lexi(100).to_string());

        let entities = poke.entities();
        assert_eq!(entity_ids(&entities, PatchOp::Put, "public.issues"), vec![1, 2, 3, 4]);
        for patch in &entities {
            let value = patch.value.as_ref().unwrap();
            assert!(!value.contains_key(ROW_VERSION_COLUMN));
            assert!(value.contains_key("title"));
        }

        let got = poke.got();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].op, PatchOp::Put);
        assert_eq!(got[0].hash, "qH");

        assert_eq!(
            poke.clients(),
            vec![ClientPatch { op: PatchOp::Put, client_id: "cA".to_string() }]
        );
        assert_eq!(poke.desired()["cA"].len(), 1);
        // The internal lmids query is tracked but never advertised.
        assert!(got.iter().all(|p| p.hash != LMIDS_QUERY_ID));
        assert_eq!(poke.lmids(), BTreeMap::from([("cA".to_string(), 7)]));
    }

    #[test_log::test(tokio::test)]
    async fn swapping_queries_delivers_both_row_sets_in_one_poke() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        collect_poke(&mut sub).await;

        harness
            .syncer
            .change_desired_queries(
                &RequestContext { client_id: "cA".into(), ws_id: "ws1".into() },
                vec![put("uH", users_all()), del("qH")],
            )
            .await
            .unwrap();

        let poke = collect_poke(&mut sub).await;
        let got = poke.got();
        assert!(got
            .iter()
            .any(|p| p.op == PatchOp::Put && p.hash == "uH"));
        assert!(got
            .iter()
            .any(|p| p.op == PatchOp::Del && p.hash == "qH"));

        let entities = poke.entities();
        assert_eq!(entity_ids(&entities, PatchOp::Put, "public.users"), vec![1, 2]);
        assert_eq!(entity_ids(&entities, PatchOp::Del, "public.issues"), vec![1, 2, 3, 4]);

        let desired = poke.desired();
        assert!(desired["cA"]
            .iter()
            .any(|p| p.op == PatchOp::Del && p.hash == "qH"));
        assert!(desired["cA"]
            .iter()
            .any(|p| p.op == PatchOp::Put && p.hash == "uH"));
    }

    #[test_log::test(tokio::test)]
    async fn advancement_pokes_updated_rows() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        let first = collect_poke(&mut sub).await;

        harness.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![ReplicaChange {
                schema: "public".into(),
                table: "issues".into(),
                key: RowKey::single("id", SqlValue::Int(3)),
                row: Some(issue_row(3, "baz", "1ab")),
            }],
        });

        let poke = collect_poke(&mut sub).await;
        assert_eq!(poke.start.base_cookie.as_deref(), Some(first.start.cookie.as_str()));
        assert_eq!(poke.start.cookie, StateVersion::from_lexi(101).to_string());

        let entities = poke.entities();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].op, PatchOp::Put);
        assert_eq!(
            entities[0].value.as_ref().unwrap().get("title"),
            Some(&SqlValue::Text("baz".to_string()))
        );
    }

    #[test_log::test(tokio::test)]
    async fn row_leaving_the_query_is_deleted() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        collect_poke(&mut sub).await;

        harness.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![ReplicaChange {
                schema: "public".into(),
                table: "issues".into(),
                key: RowKey::single("id", SqlValue::Int(3)),
                row: None,
            }],
        });

        let poke = collect_poke(&mut sub).await;
        let entities = poke.entities();
        assert_eq!(entity_ids(&entities, PatchOp::Del, "public.issues"), vec![3]);
    }

    #[test_log::test(tokio::test)]
    async fn mutation_acks_arrive_as_lmid_changes() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1]))],
        )
        .await;
        collect_poke(&mut sub).await;

        harness.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![ReplicaChange {
                schema: SYNC_SCHEMA.into(),
                table: SYNC_CLIENTS_TABLE.into(),
                key: RowKey::single(CLIENT_ID_COLUMN, SqlValue::Text("cA".into())),
                row: Some(lmid_row("cA", 8, "1ab")),
            }],
        });

        let poke = collect_poke(&mut sub).await;
        assert_eq!(poke.lmids(), BTreeMap::from([("cA".to_string(), 8)]));
        assert!(poke.entities().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn cookies_are_strictly_increasing() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;

        let mut cookies = vec![collect_poke(&mut sub).await.start.cookie];
        for (version, title) in [(101, "one"), (102, "two"), (103, "three")] {
            harness.replica.apply_delta(ReplicaDelta {
                version: StateVersion::from_lexi(version),
                changes: vec![ReplicaChange {
                    schema: "public".into(),
                    table: "issues".into(),
                    key: RowKey::single("id", SqlValue::Int(1)),
                    row: Some(issue_row(1, title, &format!("1a{}", version))),
                }],
            });
        }
        for _ in 0..3 {
            let poke = collect_poke(&mut sub).await;
            assert_eq!(poke.start.base_cookie.as_deref(), Some(cookies.last().unwrap().as_str()));
            cookies.push(poke.start.cookie);
        }
        let mut sorted = cookies.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(cookies, sorted);
    }

    #[test_log::test(tokio::test)]
    async fn bad_row_version_fails_only_the_offending_client() {
        let harness = setup();
        let mut sub_a = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        collect_poke(&mut sub_a).await;
        let version_before = harness.gateway.stored_version(GROUP);

        let mut sub_b = connect(
            &harness.syncer,
            "cB",
            "ws2",
            None,
            vec![put("vH", QueryAst::table("public", "broken"))],
        )
        .await;

        // cB's poke fails and its connection is closed with an error.
        match next_frame(&mut sub_b).await {
            Downstream::Error { kind, .. } => assert_eq!(kind, "internal"),
            other => panic!("expected an error frame, got {:?}", other),
        }
        assert!(sub_b.recv().await.is_none());

        // The row-state flush never happened: the query never became got and
        // no broken rows were recorded.
        let snapshot = harness
            .gateway
            .load(GROUP)
            .await
            .unwrap()
            .unwrap();
        let broken = snapshot
            .queries
            .get(&QueryHash::from("vH"))
            .expect("desire was recorded before hydration");
        assert!(!broken.is_got());
        assert!(snapshot
            .rows
            .keys()
            .all(|row_id| row_id.table != "broken"));
        // Only cB's config flush moved the version.
        assert_ne!(harness.gateway.stored_version(GROUP), version_before);

        // The group stays up: cA still receives advancement pokes.
        harness.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![ReplicaChange {
                schema: "public".into(),
                table: "issues".into(),
                key: RowKey::single("id", SqlValue::Int(2)),
                row: Some(issue_row(2, "still alive", "1ab")),
            }],
        });
        let poke = collect_poke(&mut sub_a).await;
        assert_eq!(entity_ids(&poke.entities(), PatchOp::Put, "public.issues"), vec![2]);
        assert!(!harness.syncer.is_stopped());
    }

    #[test_log::test(tokio::test)]
    async fn stale_ws_id_is_silently_dropped() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1]))],
        )
        .await;
        collect_poke(&mut sub).await;
        let version_before = harness.gateway.stored_version(GROUP);

        harness
            .syncer
            .change_desired_queries(
                &RequestContext { client_id: "cA".into(), ws_id: "old-ws".into() },
                vec![put("uH", users_all())],
            )
            .await
            .unwrap();

        assert_eq!(harness.gateway.stored_version(GROUP), version_before);
        let quiet =
            tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(quiet.is_err(), "no poke expected for a stale message");
    }

    #[test_log::test(tokio::test)]
    async fn bad_queries_and_cookies_fail_the_rpc_only() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1]))],
        )
        .await;
        collect_poke(&mut sub).await;
        let version_before = harness.gateway.stored_version(GROUP);

        let err = harness
            .syncer
            .change_desired_queries(
                &RequestContext { client_id: "cA".into(), ws_id: "ws1".into() },
                vec![put(
                    "wH",
                    QueryAst::filtered(
                        "public",
                        "issues",
                        Condition::Eq { column: "no_such_column".into(), value: SqlValue::Null },
                    ),
                )],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BadQuery(_)));
        assert_eq!(harness.gateway.stored_version(GROUP), version_before);

        let err = harness
            .syncer
            .init_connection(
                ConnectionContext {
                    client_id: "cB".into(),
                    ws_id: "ws2".into(),
                    base_cookie: Some("NOT a cookie".into()),
                },
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BadRequest(_)));

        // A cookie from the future is rejected too.
        let err = harness
            .syncer
            .init_connection(
                ConnectionContext {
                    client_id: "cB".into(),
                    ws_id: "ws2".into(),
                    base_cookie: Some("zzzz".into()),
                },
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BadRequest(_)));
        assert!(!harness.syncer.is_stopped());
    }

    #[test_log::test(tokio::test)]
    async fn reconnect_from_current_cookie_receives_no_row_patches() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        let first = collect_poke(&mut sub).await;

        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws2",
            Some(&first.start.cookie),
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        let poke = collect_poke(&mut sub).await;
        assert_eq!(poke.start.base_cookie.as_deref(), Some(first.start.cookie.as_str()));
        // The rows were already delivered at the base cookie; only config
        // state is replayed.
        assert!(poke.entities().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn storage_failure_stops_the_group() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1]))],
        )
        .await;
        collect_poke(&mut sub).await;

        harness.gateway.set_fail_commits(true);
        let err = harness
            .syncer
            .change_desired_queries(
                &RequestContext { client_id: "cA".into(), ws_id: "ws1".into() },
                vec![put("uH", users_all())],
            )
            .await
            .unwrap_err();
        assert!(err.terminates_group());

        harness.run.await.unwrap();
        assert!(harness.syncer.is_stopped());
        // The connected client was closed with an error frame.
        match next_frame(&mut sub).await {
            Downstream::Error { kind, .. } => assert_eq!(kind, "unavailable"),
            other => panic!("expected an error frame, got {:?}", other),
        }
        assert!(sub.recv().await.is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn idle_timeout_stops_the_service() {
        let harness = setup_with_config(SyncerConfig { keepalive: Duration::from_millis(30_000) });
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1]))],
        )
        .await;
        collect_poke(&mut sub).await;

        harness
            .syncer
            .remove_client(&RequestContext { client_id: "cA".into(), ws_id: "ws1".into() })
            .await;

        // Activity within the keepalive window keeps the service alive.
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert!(harness.syncer.keepalive().await);
        let mut sub = connect(&harness.syncer, "cA", "ws2", None, vec![]).await;
        collect_poke(&mut sub).await;
        assert!(!harness.syncer.is_stopped());

        // Once the last client is gone and the timer fires, the service
        // stops and new connections are refused.
        harness
            .syncer
            .remove_client(&RequestContext { client_id: "cA".into(), ws_id: "ws2".into() })
            .await;
        harness.run.await.unwrap();
        assert!(harness.syncer.is_stopped());
        let err = harness
            .syncer
            .init_connection(
                ConnectionContext { client_id: "cA".into(), ws_id: "ws3".into(), base_cookie: None },
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unavailable(_)));
    }

    #[test_log::test(tokio::test)]
    async fn restart_recovers_from_the_durable_cvr() {
        let harness = setup();
        let mut sub = connect(
            &harness.syncer,
            "cA",
            "ws1",
            None,
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        let first = collect_poke(&mut sub).await;
        harness.syncer.stop();
        harness.run.await.unwrap();

        // A new service instance over the same gateway and replica picks up
        // where the old one left off; the unchanged query is re-hydrated
        // without re-sending its rows.
        let syncer = Arc::new(ViewSyncer::new(
            CvrStore::new(harness.gateway.clone(), GROUP),
            harness.replica.clone(),
            SyncerConfig::default(),
        ));
        let run = tokio::spawn(syncer.clone().run(harness.replica.subscribe()));

        let mut sub = connect(
            &syncer,
            "cA",
            "ws2",
            Some(&first.start.cookie),
            vec![put("qH", issues_by_id(&[1, 2, 3, 4]))],
        )
        .await;
        let poke = collect_poke(&mut sub).await;
        assert!(poke.entities().is_empty());

        harness.replica.apply_delta(ReplicaDelta {
            version: StateVersion::from_lexi(101),
            changes: vec![ReplicaChange {
                schema: "public".into(),
                table: "issues".into(),
                key: RowKey::single("id", SqlValue::Int(4)),
                row: Some(issue_row(4, "revived", "1ab")),
            }],
        });
        let poke = collect_poke(&mut sub).await;
        assert_eq!(entity_ids(&poke.entities(), PatchOp::Put, "public.issues"), vec![4]);

        syncer.stop();
        run.await.unwrap();
    }
}
