//! The incremental query pipeline and the replica handle feeding it.

pub mod driver;
pub mod replica;

pub use driver::{Advancement, PipelineDriver, RowChange};
pub use replica::{ReplicaChange, ReplicaDelta, ReplicaHandle};
