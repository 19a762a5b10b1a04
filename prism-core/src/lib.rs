//! Shared models and storage contracts for the prism view syncer.
//!
//! This crate holds everything that crosses a component boundary: version
//! and cookie types, SQL value and row fingerprint types, query ASTs, the
//! immutable CVR snapshot model, the downstream poke protocol and the
//! `CvrGateway` storage trait implemented by `prism-storage`.

pub mod models;
pub mod storage;
pub mod sync;
