//! Per-peer session state for one replication connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use error_stack::Report;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tideway_core::{HandlerError, MessageSender, OutgoingMessage};

use crate::db::{Database, User, store_error};
use crate::metrics::SyncMetrics;

/// Watches the database's principal-mutation counter on behalf of one
/// session, tracking the keys (user + roles) whose change should trigger a
/// reload.
pub struct UserChangeWaiter {
    rx: watch::Receiver<u64>,
    last_seen: u64,
    tracked_keys: BTreeSet<String>,
}

impl UserChangeWaiter {
    #[must_use]
    pub fn new(rx: watch::Receiver<u64>, user: Option<&User>) -> Self {
        let last_seen = *rx.borrow();
        Self {
            rx,
            last_seen,
            tracked_keys: user.map(User::tracked_keys).unwrap_or_default(),
        }
    }

    /// True when the principal counter advanced since the last check;
    /// idempotent otherwise.
    pub fn refresh_count(&mut self) -> bool {
        let current = *self.rx.borrow();
        if current > self.last_seen {
            self.last_seen = current;
            true
        } else {
            false
        }
    }

    /// Reinstalls the tracked key set for a freshly loaded principal.
    pub fn refresh_keys(&mut self, user: &User) {
        self.tracked_keys = user.tracked_keys();
    }

    #[must_use]
    pub fn tracked_keys(&self) -> &BTreeSet<String> {
        &self.tracked_keys
    }
}

/// Parameters of the active `subChanges` subscription.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    pub batch_size: usize,
    pub continuous: bool,
    pub active_only: bool,
    /// `None` is the all-channels wildcard.
    pub channels: Option<BTreeSet<String>>,
}

/// Fired after `changes` completes with the sequences of the rows we asked
/// the peer to send.
pub type SequencesCallback = Box<dyn Fn(Vec<String>) + Send + Sync>;
/// Fired after each persisted `rev` with its `sequence` property.
pub type SequenceCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Optional session wiring beyond the mandatory collaborators.
#[derive(Default)]
pub struct SessionConfig {
    /// Whether delta encoding was negotiated for this peer, both ways.
    pub can_use_deltas: bool,
    pub post_handle_changes: Option<SequencesCallback>,
    pub post_handle_rev: Option<SequenceCallback>,
}

struct UserState<D> {
    db: D,
    waiter: UserChangeWaiter,
}

struct SessionInner<D> {
    peer_id: String,
    user_name: String,
    can_use_deltas: bool,
    sender: Arc<dyn MessageSender>,
    metrics: Arc<SyncMetrics>,
    /// Guards user refresh and context-view swap. Readers holding an older
    /// view clone keep observing the pre-swap user.
    db_user: Mutex<UserState<D>>,
    active_sub_changes: AtomicBool,
    got_sub_changes: AtomicBool,
    subscription: std::sync::Mutex<Subscription>,
    terminator: CancellationToken,
    allowed_attachments: std::sync::Mutex<HashMap<String, usize>>,
    handler_serial: AtomicU64,
    post_handle_changes: Option<SequencesCallback>,
    post_handle_rev: Option<SequenceCallback>,
}

/// The per-peer session ("sync context"). Cheap to clone; all clones share
/// the same state.
pub struct SyncSession<D: Database> {
    inner: Arc<SessionInner<D>>,
}

impl<D: Database> Clone for SyncSession<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Database> SyncSession<D> {
    #[must_use]
    pub fn new(
        peer_id: impl Into<String>,
        db: D,
        sender: Arc<dyn MessageSender>,
        metrics: Arc<SyncMetrics>,
        config: SessionConfig,
    ) -> Self {
        let user_name = db.user().map(|u| u.name.clone()).unwrap_or_default();
        let waiter = UserChangeWaiter::new(db.principal_changes(), db.user().map(Arc::as_ref));
        Self {
            inner: Arc::new(SessionInner {
                peer_id: peer_id.into(),
                user_name,
                can_use_deltas: config.can_use_deltas,
                sender,
                metrics,
                db_user: Mutex::new(UserState { db, waiter }),
                active_sub_changes: AtomicBool::new(false),
                got_sub_changes: AtomicBool::new(false),
                subscription: std::sync::Mutex::new(Subscription::default()),
                terminator: CancellationToken::new(),
                allowed_attachments: std::sync::Mutex::new(HashMap::new()),
                handler_serial: AtomicU64::new(0),
                post_handle_changes: config.post_handle_changes,
                post_handle_rev: config.post_handle_rev,
            }),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    #[must_use]
    pub fn user_name(&self) -> &str {
        &self.inner.user_name
    }

    #[must_use]
    pub fn can_use_deltas(&self) -> bool {
        self.inner.can_use_deltas
    }

    #[must_use]
    pub fn metrics(&self) -> &SyncMetrics {
        &self.inner.metrics
    }

    #[must_use]
    pub fn terminator(&self) -> &CancellationToken {
        &self.inner.terminator
    }

    /// Tags the next inbound message; strictly monotonic per session.
    pub fn increment_serial(&self) -> u64 {
        self.inner.handler_serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot of the current database view, bound to the current user.
    pub async fn copy_context_database(&self) -> D {
        self.inner.db_user.lock().await.db.clone()
    }

    /// Returns `false` iff the transport is closed.
    pub fn send_message(&self, request: OutgoingMessage) -> bool {
        self.inner.sender.send(request)
    }

    /// Reloads the user and swaps the context view when the principal
    /// counter advanced; returns the refreshed view for the caller to
    /// republish, or `None` when nothing moved.
    ///
    /// # Errors
    ///
    /// Propagates the authenticator's failure to reload the principal.
    pub async fn refresh_user(&self) -> Result<Option<D>, Report<HandlerError>> {
        if self.inner.user_name.is_empty() {
            return Ok(None);
        }
        let mut state = self.inner.db_user.lock().await;
        if !state.waiter.refresh_count() {
            return Ok(None);
        }
        let user = state
            .db
            .get_user(&self.inner.user_name)
            .await
            .map_err(store_error)?;
        state.waiter.refresh_keys(&user);
        state.db.set_user(Some(user));
        debug!(peer = %self.inner.peer_id, user = %self.inner.user_name, "refreshed session user");
        Ok(Some(state.db.clone()))
    }

    /// CAS gate: at most one change feed per session.
    pub(crate) fn try_begin_sub_changes(&self) -> bool {
        self.inner
            .active_sub_changes
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_sub_changes(&self) {
        self.inner.active_sub_changes.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn sub_changes_active(&self) -> bool {
        self.inner.active_sub_changes.load(Ordering::Acquire)
    }

    /// Sticky: set once the peer has ever subscribed.
    pub(crate) fn mark_sub_changes(&self) {
        self.inner.got_sub_changes.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn got_sub_changes(&self) -> bool {
        self.inner.got_sub_changes.load(Ordering::Acquire)
    }

    pub(crate) fn set_subscription(&self, subscription: Subscription) {
        *self.inner.subscription.lock().expect("subscription lock") = subscription;
    }

    #[must_use]
    pub fn subscription(&self) -> Subscription {
        self.inner.subscription.lock().expect("subscription lock").clone()
    }

    pub fn add_allowed_attachments(&self, digests: &[String]) {
        let mut allowed = self
            .inner
            .allowed_attachments
            .lock()
            .expect("allowed attachments lock");
        for digest in digests {
            *allowed.entry(digest.clone()).or_insert(0) += 1;
        }
        trace!(added = ?digests, current = ?allowed.keys(), "allowed attachments updated");
    }

    pub fn remove_allowed_attachments(&self, digests: &[String]) {
        let mut allowed = self
            .inner
            .allowed_attachments
            .lock()
            .expect("allowed attachments lock");
        for digest in digests {
            if let Some(count) = allowed.get_mut(digest) {
                if *count > 1 {
                    *count -= 1;
                } else {
                    allowed.remove(digest);
                }
            }
        }
        trace!(removed = ?digests, current = ?allowed.keys(), "allowed attachments updated");
    }

    #[must_use]
    pub fn is_attachment_allowed(&self, digest: &str) -> bool {
        self.inner
            .allowed_attachments
            .lock()
            .expect("allowed attachments lock")
            .contains_key(digest)
    }

    pub(crate) fn has_post_handle_changes(&self) -> bool {
        self.inner.post_handle_changes.is_some()
    }

    pub(crate) fn notify_changes_handled(&self, sequences: Vec<String>) {
        if let Some(callback) = &self.inner.post_handle_changes {
            callback(sequences);
        }
    }

    pub(crate) fn notify_rev_handled(&self, sequence: &str) {
        if let Some(callback) = &self.inner.post_handle_rev {
            callback(sequence);
        }
    }

    /// Tears the session down: signals the terminator to every in-flight
    /// change feed and wakes feeds blocked on behalf of a named user.
    pub async fn close(&self) {
        self.inner.terminator.cancel();
        if !self.inner.user_name.is_empty() {
            let state = self.inner.db_user.lock().await;
            state.db.notify_terminated_changes(&self.inner.user_name);
        }
        debug!(peer = %self.inner.peer_id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testutil::{NullDatabase, null_sender};

    fn session() -> SyncSession<NullDatabase> {
        SyncSession::new(
            "peer-1",
            NullDatabase::new(None),
            null_sender(),
            Arc::new(SyncMetrics::new()),
            SessionConfig::default(),
        )
    }

    #[test]
    fn serial_numbers_are_strictly_monotonic() {
        let session = session();
        let mut last = 0;
        for _ in 0..100 {
            let next = session.increment_serial();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn allowed_attachments_refcount() {
        let session = session();
        let digest = "sha1-abc".to_string();
        assert!(!session.is_attachment_allowed(&digest));

        session.add_allowed_attachments(std::slice::from_ref(&digest));
        session.add_allowed_attachments(std::slice::from_ref(&digest));
        assert!(session.is_attachment_allowed(&digest));

        session.remove_allowed_attachments(std::slice::from_ref(&digest));
        assert!(session.is_attachment_allowed(&digest));

        session.remove_allowed_attachments(std::slice::from_ref(&digest));
        assert!(!session.is_attachment_allowed(&digest));

        // Draining an absent digest never underflows.
        session.remove_allowed_attachments(std::slice::from_ref(&digest));
        assert!(!session.is_attachment_allowed(&digest));
    }

    #[test]
    fn sub_changes_gate_admits_one_feed() {
        let session = session();
        assert!(session.try_begin_sub_changes());
        assert!(!session.try_begin_sub_changes());
        session.end_sub_changes();
        assert!(session.try_begin_sub_changes());
    }

    #[test]
    fn got_sub_changes_is_sticky() {
        let session = session();
        assert!(!session.got_sub_changes());
        session.mark_sub_changes();
        session.end_sub_changes();
        assert!(session.got_sub_changes());
    }

    #[test]
    fn waiter_reports_counter_advance_once() {
        let (tx, rx) = watch::channel(0u64);
        let mut waiter = UserChangeWaiter::new(rx, None);
        assert!(!waiter.refresh_count());
        tx.send(1).unwrap();
        assert!(waiter.refresh_count());
        assert!(!waiter.refresh_count());
    }

    #[test]
    fn waiter_tracks_user_and_role_keys() {
        let (_tx, rx) = watch::channel(0u64);
        let user = User {
            name: "alice".to_string(),
            channels: BTreeSet::new(),
            roles: ["editor".to_string()].into(),
        };
        let mut waiter = UserChangeWaiter::new(rx, Some(&user));
        assert_eq!(waiter.tracked_keys().len(), 2);

        let wider = User {
            roles: ["editor".to_string(), "admin".to_string()].into(),
            ..user
        };
        waiter.refresh_keys(&wider);
        assert_eq!(waiter.tracked_keys().len(), 3);
    }

    #[test]
    fn post_handle_callbacks_fire() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_changes = Arc::clone(&seen);
        let seen_rev = Arc::clone(&seen);
        let session = SyncSession::new(
            "peer-1",
            NullDatabase::new(None),
            null_sender(),
            Arc::new(SyncMetrics::new()),
            SessionConfig {
                can_use_deltas: false,
                post_handle_changes: Some(Box::new(move |seqs| {
                    seen_changes.fetch_add(seqs.len(), Ordering::SeqCst);
                })),
                post_handle_rev: Some(Box::new(move |_| {
                    seen_rev.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );
        assert!(session.has_post_handle_changes());
        session.notify_changes_handled(vec!["1".to_string(), "2".to_string()]);
        session.notify_rev_handled("3");
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn close_signals_terminator() {
        let session = session();
        assert!(!session.terminator().is_cancelled());
        session.close().await;
        assert!(session.terminator().is_cancelled());
    }
}
