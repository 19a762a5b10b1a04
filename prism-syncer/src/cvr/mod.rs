//! The CVR store: snapshot load, catch-up streams and atomic flush.
//!
//! `CvrStore` is a thin per-group wrapper over the `CvrGateway`; the
//! staging of modifications lives in the updaters (see [`updater`]), which
//! hand a complete write batch to [`CvrStore::flush`] for one atomic
//! commit.

pub mod updater;

use crate::error::SyncError;
use async_stream::try_stream;
use futures03::Stream;
use prism_core::{
    models::{cvr::CvrSnapshot, query::QueryHash, version::CvrVersion, ClientGroupId},
    storage::{ConfigPatchRecord, CvrGateway, CvrWriteBatch, RowPatchCursor, RowPatchRecord},
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

/// Row updates are processed in pages of this many rows, both when paging
/// catch-up reads and when batching pipeline changes through an updater.
pub const CURSOR_PAGE_SIZE: usize = 10_000;

/// A loaded CVR plus whether it exists durably; a fresh group's first flush
/// must insert rather than compare-and-swap.
#[derive(Clone)]
pub struct LoadedCvr {
    pub snapshot: Arc<CvrSnapshot>,
    pub exists: bool,
}

#[derive(Clone)]
pub struct CvrStore {
    gateway: Arc<dyn CvrGateway>,
    group_id: ClientGroupId,
}

impl CvrStore {
    pub fn new(gateway: Arc<dyn CvrGateway>, group_id: impl Into<ClientGroupId>) -> Self {
        CvrStore { gateway, group_id: group_id.into() }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Loads the group's CVR into an immutable snapshot; an absent group
    /// yields the empty CVR at the minimum version.
    pub async fn load(&self) -> Result<LoadedCvr, SyncError> {
        match self.gateway.load(&self.group_id).await? {
            Some(snapshot) => Ok(LoadedCvr { snapshot: Arc::new(snapshot), exists: true }),
            None => {
                debug!(group_id = %self.group_id, "no stored cvr, starting empty");
                Ok(LoadedCvr {
                    snapshot: Arc::new(CvrSnapshot::empty(self.group_id.clone())),
                    exists: false,
                })
            }
        }
    }

    /// Streams row patches with `from < patch_version <= to` in the
    /// deterministic catch-up order, lazily paged. Patches whose only query
    /// references are in `exclude` are skipped; those rows are replayed by
    /// the excluded queries' own hydration instead.
    pub fn catchup_row_patches(
        &self,
        from: CvrVersion,
        to: CvrVersion,
        exclude: BTreeSet<QueryHash>,
    ) -> impl Stream<Item = Result<RowPatchRecord, SyncError>> + '_ {
        try_stream! {
            let mut cursor: Option<RowPatchCursor> = None;
            loop {
                let page = self
                    .gateway
                    .row_patches_page(
                        &self.group_id,
                        &from,
                        &to,
                        cursor.as_ref(),
                        CURSOR_PAGE_SIZE as i64,
                    )
                    .await?;
                let done = page.len() < CURSOR_PAGE_SIZE;
                if let Some(last) = page.last() {
                    cursor = Some(RowPatchCursor::after(last));
                }
                for record in page {
                    let solely_excluded = record
                        .ref_counts
                        .as_ref()
                        .map(|rc| !rc.is_empty() && rc.keys().all(|h| exclude.contains(h)))
                        .unwrap_or(false);
                    if solely_excluded {
                        continue;
                    }
                    yield record;
                }
                if done {
                    break;
                }
            }
        }
    }

    /// All client/query patches with `from < patch_version <= to`, in the
    /// same deterministic order.
    pub async fn catchup_config_patches(
        &self,
        from: &CvrVersion,
        to: &CvrVersion,
    ) -> Result<Vec<ConfigPatchRecord>, SyncError> {
        Ok(self
            .gateway
            .config_patches(&self.group_id, from, to)
            .await?)
    }

    pub(crate) async fn flush(&self, batch: &CvrWriteBatch) -> Result<(), SyncError> {
        Ok(self.gateway.commit(&self.group_id, batch).await?)
    }
}
