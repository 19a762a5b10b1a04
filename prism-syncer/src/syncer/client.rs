//! Per-connected-client outbound channel and poke assembly.
//!
//! A `ClientHandler` owns the order-preserving downstream channel of one
//! websocket connection; the connection layer drains the `Subscription`
//! half. A `Poker` delivers exactly one version increment as a
//! `pokeStart` / `pokePart`* / `pokeEnd` sequence. The start frame is sent
//! lazily with the first flushed part, so a cycle that aborts before
//! flushing anything leaves untouched clients with a clean stream.

use prism_core::{
    models::{version::CvrVersion, ClientId},
    sync::{ClientPatch, Downstream, EntityPatch, PokeEnd, PokePart, PokeStart, QueryPatch},
};
use std::{
    collections::BTreeMap,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// How many patches accumulate before a `pokePart` is flushed.
pub const PATCH_PART_SIZE: usize = 2048;

/// The downstream half handed to the connection layer. Dropping it is how
/// a connection goes away; the handler notices on the next send.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Downstream>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Downstream> {
        self.rx.recv().await
    }
}

impl futures03::Stream for Subscription {
    type Item = Downstream;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// One patch on its way into a poke.
#[derive(Clone, Debug)]
pub enum PokePatch {
    Client(ClientPatch),
    DesiredQuery { client_id: ClientId, patch: QueryPatch },
    GotQuery(QueryPatch),
    Entity(EntityPatch),
    LastMutationId { client_id: ClientId, last_mutation_id: u64 },
}

pub struct ClientHandler {
    client_id: ClientId,
    ws_id: String,
    version: CvrVersion,
    tx: mpsc::UnboundedSender<Downstream>,
}

impl ClientHandler {
    pub fn new(
        client_id: impl Into<ClientId>,
        ws_id: impl Into<String>,
        base_version: CvrVersion,
    ) -> (Self, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientHandler { client_id: client_id.into(), ws_id: ws_id.into(), version: base_version, tx },
            Subscription { rx },
        )
    }

    /// The latest version this client has been brought to.
    pub fn version(&self) -> &CvrVersion {
        &self.version
    }

    pub fn set_version(&mut self, version: CvrVersion) {
        self.version = version;
    }

    pub fn ws_id(&self) -> &str {
        &self.ws_id
    }

    /// Begins a poke that brings the client to `new_version`.
    pub fn start_poke(&self, new_version: CvrVersion) -> Poker {
        let base_cookie =
            (self.version != CvrVersion::min()).then(|| self.version.to_cookie());
        Poker {
            client_id: self.client_id.clone(),
            poke_id: Uuid::new_v4().to_string(),
            base_version: self.version.clone(),
            base_cookie,
            new_version,
            tx: self.tx.clone(),
            part: None,
            part_count: 0,
            started: false,
            failed: false,
        }
    }

    /// Closes the channel cleanly; the connection layer sees end-of-stream.
    pub fn close(self) {
        debug!(client_id = %self.client_id, "closing client handler");
    }

    /// Sends a terminal error frame and closes the channel.
    pub fn fail(self, err: &crate::error::SyncError) {
        let _ = self.tx.send(Downstream::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        debug!(client_id = %self.client_id, %err, "failing client handler");
    }
}

/// What happened to a poke.
#[derive(Debug, PartialEq, Eq)]
pub enum PokeOutcome {
    /// The full sequence was delivered; the client is now at this version.
    Applied(CvrVersion),
    /// The connection must be dropped; no `pokeEnd` was sent.
    Failed,
}

pub struct Poker {
    client_id: ClientId,
    poke_id: String,
    base_version: CvrVersion,
    base_cookie: Option<String>,
    new_version: CvrVersion,
    tx: mpsc::UnboundedSender<Downstream>,
    part: Option<PokePart>,
    part_count: usize,
    started: bool,
    failed: bool,
}

impl Poker {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The version the client was at when this poke began; catch-up streams
    /// start here.
    pub fn base_version(&self) -> &CvrVersion {
        &self.base_version
    }

    /// Whether any frame of this poke has reached the channel. Once true, a
    /// failure must kill the connection to preserve poke framing.
    pub fn started(&self) -> bool {
        self.started
    }

    fn send(&mut self, frame: Downstream) {
        if self.failed {
            return;
        }
        if self.tx.send(frame).is_err() {
            // Connection gone; the service removes the handler when the
            // poke ends.
            self.failed = true;
        }
    }

    fn ensure_started(&mut self) {
        if self.started || self.failed {
            return;
        }
        self.started = true;
        self.send(Downstream::PokeStart(PokeStart {
            poke_id: self.poke_id.clone(),
            base_cookie: self.base_cookie.clone(),
            cookie: self.new_version.to_cookie(),
        }));
    }

    fn part(&mut self) -> &mut PokePart {
        let poke_id = self.poke_id.clone();
        self.part
            .get_or_insert_with(|| PokePart::new(poke_id))
    }

    /// Adds one patch, coalescing into the current part and flushing when
    /// the part reaches [`PATCH_PART_SIZE`] patches.
    pub fn add_patch(&mut self, patch: &PokePatch) {
        if self.failed {
            return;
        }
        match patch {
            PokePatch::Client(p) => self
                .part()
                .clients_patch
                .get_or_insert_with(Vec::new)
                .push(p.clone()),
            PokePatch::DesiredQuery { client_id, patch } => self
                .part()
                .desired_queries_patches
                .get_or_insert_with(BTreeMap::new)
                .entry(client_id.clone())
                .or_default()
                .push(patch.clone()),
            PokePatch::GotQuery(p) => self
                .part()
                .got_queries_patch
                .get_or_insert_with(Vec::new)
                .push(p.clone()),
            PokePatch::Entity(p) => self
                .part()
                .entities_patch
                .get_or_insert_with(Vec::new)
                .push(p.clone()),
            PokePatch::LastMutationId { client_id, last_mutation_id } => {
                self.part()
                    .last_mutation_id_changes
                    .get_or_insert_with(BTreeMap::new)
                    .insert(client_id.clone(), *last_mutation_id);
            }
        }
        self.part_count += 1;
        if self.part_count >= PATCH_PART_SIZE {
            self.flush_part();
        }
    }

    fn flush_part(&mut self) {
        if let Some(part) = self.part.take() {
            if !part.is_empty() {
                self.ensure_started();
                self.send(Downstream::PokePart(part));
            }
        }
        self.part_count = 0;
    }

    /// Commits the poke: flushes the pending part and sends `pokeEnd`. A
    /// poke with no patches still advances the client's cookie.
    pub fn end(mut self) -> PokeOutcome {
        if self.failed && !self.started {
            return PokeOutcome::Failed;
        }
        self.flush_part();
        self.ensure_started();
        self.send(Downstream::PokeEnd(PokeEnd { poke_id: self.poke_id.clone() }));
        if self.failed {
            PokeOutcome::Failed
        } else {
            PokeOutcome::Applied(self.new_version.clone())
        }
    }

    /// Abandons the poke. Returns `true` when frames were already sent, in
    /// which case the connection must be dropped to preserve framing.
    pub fn fail(&mut self) -> bool {
        self.failed = true;
        self.part = None;
        self.started
    }
}
