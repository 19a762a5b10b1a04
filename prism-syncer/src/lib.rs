//! Prism view syncer.
//!
//! Streams query results from an upstream relational database to connected
//! clients, keeping each client's local view continuously in sync. One
//! [`syncer::ViewSyncer`] serves one client group: it tracks what every
//! client has seen in a durable Client View Record, maintains an
//! incremental query pipeline over the local replica, and delivers
//! versioned patch streams ("pokes") downstream.

pub mod cvr;
pub mod error;
pub mod pipeline;
pub mod syncer;
pub mod testing;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
