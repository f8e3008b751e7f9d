//! Server-side replication protocol core for the tideway mobile-sync
//! gateway: the per-peer session, verb dispatch, and the pull/push/
//! checkpoint/attachment handlers over an established bidirectional
//! message channel.

#![warn(clippy::pedantic)]

mod attachments;
mod checkpoint;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod document;
pub mod messages;
pub mod metrics;
mod pull;
mod push;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::{
    SequenceCallback, SequencesCallback, SessionConfig, Subscription, SyncSession,
    UserChangeWaiter,
};
pub use db::{
    ChangeEntry, ChangesQuery, Database, DeltaResult, RevDiffResult, Revision, SequenceId,
    StoreError, StubAttachment, User, store_status,
};
pub use dispatch::{Handler, dispatch};
pub use document::{Document, parse_expiry, rev_generation};
pub use metrics::SyncMetrics;
