//! Queue snapshots and job list files

pub mod export;
pub mod snapshot;

pub use snapshot::{reconcile, Reconciled, SnapshotStore};
