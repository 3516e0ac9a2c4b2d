//! Service discovery: the `Provider` trait and its two implementors.
//!
//! A provider's only operation is `list()`, returning a cheap `Arc`
//! clone of the current immutable snapshot. Writers (the static list at
//! construction time, the cluster watcher's background task) publish a
//! whole new snapshot rather than mutating entries in place, matching
//! the registry's own publish discipline.

mod cluster;
mod static_provider;

pub use cluster::ClusterProvider;
pub use static_provider::StaticProvider;

use std::sync::Arc;

use thiserror::Error;

use crate::registry::BackendEndpoint;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("pod {0} is missing the model annotation/label, skipping")]
    MissingModelLabel(String),
}

/// A source of backend membership. `list()` must never block on network
/// I/O on the hot path: implementors maintain their own background
/// refresh and serve the last good snapshot.
pub trait Provider: Send + Sync {
    fn list(&self) -> Arc<Vec<BackendEndpoint>>;
}
