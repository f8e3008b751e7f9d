//! Database capability consumed by the protocol handlers.
//!
//! The document store, authenticator, and change index live outside the
//! core; handlers see them through this trait. A `Database` value is a
//! *view*: cloning is cheap and each clone carries its own user binding,
//! so a session can swap its view without disturbing tasks holding an
//! older clone.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use tideway_core::{Body, HandlerError};

use crate::document::{Document, parse_expiry};

/// Position in the database's change log. Encoded on the wire as a JSON
/// number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(pub u64);

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authenticated principal bound to a database view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub channels: BTreeSet<String>,
    pub roles: BTreeSet<String>,
}

impl User {
    /// Keys whose mutation invalidates this user's channel access: the user
    /// record itself plus each granted role.
    #[must_use]
    pub fn tracked_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        keys.insert(format!("user/{}", self.name));
        for role in &self.roles {
            keys.insert(format!("role/{role}"));
        }
        keys
    }
}

/// One entry from the change feed. `revs` lists the alternate leaf
/// revisions for the document at this sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub seq: SequenceId,
    pub id: String,
    pub revs: Vec<String>,
    pub deleted: bool,
}

/// A revision loaded from the store. `history` lists ancestor revision IDs,
/// most recent first, excluding `rev_id` itself.
#[derive(Debug, Clone, Default)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    pub body: Body,
    pub history: Vec<String>,
    pub attachments: Option<Body>,
}

/// Outcome of a delta request: the patch bytes, or a redacted revision when
/// the requested rev is only visible in redacted form.
#[derive(Debug, Clone, Default)]
pub struct DeltaResult {
    pub delta: Option<Bytes>,
    pub redacted: Option<Revision>,
}

/// A stub attachment referenced by an incoming revision body.
#[derive(Debug, Clone)]
pub struct StubAttachment {
    pub name: String,
    pub digest: String,
    /// The bytes when the store already holds this attachment.
    pub known_data: Option<Bytes>,
    pub length: Option<u64>,
    pub content_type: Option<String>,
}

/// Result of a revision diff: `missing` is `None` when the revision is
/// already present; `possible` lists candidate ancestors for the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevDiffResult {
    pub missing: Option<Vec<String>>,
    pub possible: Vec<String>,
}

/// One page request against the underlying change feed.
#[derive(Debug, Clone)]
pub struct ChangesQuery {
    pub since: SequenceId,
    pub limit: usize,
    pub active_only: bool,
    /// `None` is the all-channels wildcard.
    pub channels: Option<BTreeSet<String>>,
    pub doc_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Conflict,
    Forbidden,
    DeltaFailed,
    Storage,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::Conflict => f.write_str("document version conflict"),
            Self::Forbidden => f.write_str("access denied"),
            Self::DeltaFailed => f.write_str("delta generation failed"),
            Self::Storage => f.write_str("storage operation failed"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Wire status for a store failure.
#[must_use]
pub fn store_status(err: &StoreError) -> u16 {
    match err {
        StoreError::NotFound => 404,
        StoreError::Conflict => 409,
        StoreError::Forbidden => 403,
        StoreError::DeltaFailed | StoreError::Storage => 500,
    }
}

/// Converts a store failure into the handler's error, preserving the chain.
pub(crate) fn store_error(report: Report<StoreError>) -> Report<HandlerError> {
    let context = report.current_context();
    let error = HandlerError::new(store_status(context), context.to_string());
    report.change_context(error)
}

/// The database view a session operates against.
pub trait Database: Clone + Send + Sync + 'static {
    fn user(&self) -> Option<&Arc<User>>;

    fn set_user(&mut self, user: Option<Arc<User>>);

    fn allow_conflicts(&self) -> bool;

    /// The sequence value a subscription with no `since` starts from.
    fn zero_since(&self) -> SequenceId {
        SequenceId::default()
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] for an unparseable sequence.
    fn parse_sequence_id(&self, raw: &str) -> Result<SequenceId, Report<StoreError>> {
        raw.parse::<u64>()
            .map(SequenceId)
            .map_err(|_| Report::new(StoreError::Storage).attach(format!("bad sequence {raw:?}")))
    }

    /// Parses a reserved `_exp` value into an absolute expiry. The exact
    /// grammar belongs to the store; the default accepts integer seconds
    /// (absolute or now-relative below a 30-day cutoff) and RFC3339.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] for an unparseable value.
    fn extract_expiry(&self, value: &Value) -> Result<DateTime<Utc>, Report<StoreError>> {
        parse_expiry(value).change_context(StoreError::Storage)
    }

    /// Monotonic counter bumped whenever any principal (user or role)
    /// changes; backs the session's user-change waiter.
    fn principal_changes(&self) -> watch::Receiver<u64>;

    fn get_user(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Arc<User>, Report<StoreError>>> + Send;

    fn get_special(
        &self,
        kind: &str,
        doc_id: &str,
    ) -> impl Future<Output = Result<Option<Body>, Report<StoreError>>> + Send;

    /// Writes a non-replicated document, returning its new revision.
    fn put_special(
        &self,
        kind: &str,
        doc_id: &str,
        body: Body,
    ) -> impl Future<Output = Result<String, Report<StoreError>>> + Send;

    fn rev_diff(
        &self,
        doc_id: &str,
        rev_ids: &[String],
    ) -> impl Future<Output = RevDiffResult> + Send;

    /// Status for a proposed revision; `0` means "accepted, send it".
    fn check_proposed_rev(
        &self,
        doc_id: &str,
        rev_id: &str,
        parent_rev_id: &str,
    ) -> impl Future<Output = u16> + Send;

    /// Access-checked revision fetch.
    fn get_rev(
        &self,
        doc_id: &str,
        rev_id: &str,
        attachments_inline: bool,
    ) -> impl Future<Output = Result<Revision, Report<StoreError>>> + Send;

    fn put_existing_rev(
        &self,
        doc: Document,
        history: &[String],
        no_conflicts: bool,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send;

    fn get_delta(
        &self,
        doc_id: &str,
        from_rev: &str,
        to_rev: &str,
    ) -> impl Future<Output = Result<DeltaResult, Report<StoreError>>> + Send;

    fn get_attachment(
        &self,
        digest: &str,
    ) -> impl Future<Output = Result<Bytes, Report<StoreError>>> + Send;

    /// The stub attachments in `body` whose revpos is at or above
    /// `min_revpos`, each annotated with the locally known bytes if any.
    fn stub_attachments(
        &self,
        body: &Body,
        min_revpos: u64,
    ) -> impl Future<Output = Result<Vec<StubAttachment>, Report<StoreError>>> + Send;

    fn store_attachment(
        &self,
        digest: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send;

    /// One page of the change feed, already filtered to what this view's
    /// user may see.
    fn changes_since(
        &self,
        query: &ChangesQuery,
    ) -> impl Future<Output = Result<Vec<ChangeEntry>, Report<StoreError>>> + Send;

    /// Wakes continuous feeds; carries the latest sequence.
    fn subscribe_changes(&self) -> watch::Receiver<SequenceId>;

    /// Wakes change feeds blocked on behalf of `user_name` so they can
    /// observe a forced close.
    fn notify_terminated_changes(&self, user_name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_keys_cover_user_and_roles() {
        let user = User {
            name: "alice".to_string(),
            channels: BTreeSet::new(),
            roles: ["editor".to_string(), "reader".to_string()].into(),
        };
        let keys = user.tracked_keys();
        assert!(keys.contains("user/alice"));
        assert!(keys.contains("role/editor"));
        assert!(keys.contains("role/reader"));
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn sequence_id_serializes_as_number() {
        let seq = SequenceId(42);
        assert_eq!(serde_json::to_string(&seq).unwrap(), "42");
        let back: SequenceId = serde_json::from_str("42").unwrap();
        assert_eq!(back, seq);
    }

    #[test]
    fn store_status_taxonomy() {
        assert_eq!(store_status(&StoreError::NotFound), 404);
        assert_eq!(store_status(&StoreError::Conflict), 409);
        assert_eq!(store_status(&StoreError::Forbidden), 403);
        assert_eq!(store_status(&StoreError::DeltaFailed), 500);
        assert_eq!(store_status(&StoreError::Storage), 500);
    }

    #[test]
    fn store_error_keeps_status_in_handler_error() {
        let report = Report::new(StoreError::Conflict);
        let handler = store_error(report);
        assert_eq!(handler.current_context().code(), Some(409));
    }

    #[test]
    fn default_expiry_extraction_uses_the_store_grammar() {
        let db = crate::testutil::NullDatabase::new(None);
        let ts = db
            .extract_expiry(&serde_json::json!(4_000_000_000_i64))
            .unwrap();
        assert_eq!(ts.timestamp(), 4_000_000_000);
        assert!(db.extract_expiry(&serde_json::json!("whenever")).is_err());
    }
}
