// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the storage collaborators of an access controller.
//!
//! Access controllers never own their data. Manifests live in a content-addressed
//! [`BlockStore`] and grants in a replicated, append-only [`Log`] opened through a [`LogStore`].
//! Every log consults an [`AppendGuard`] before it accepts an entry, no matter if the entry was
//! authored locally or received from a remote peer.
//!
//! The `memory` feature provides in-process implementations of all interfaces. Several hosts may
//! share one memory store to simulate peers which replicate instantly, or a process restarting
//! on top of the same persisted data.
#[cfg(feature = "memory")]
pub mod memory;
mod traits;

pub use traits::{AllowAll, AppendGuard, BlockStore, Log, LogEvent, LogStore};
