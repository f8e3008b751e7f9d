//! Test utilities for tideway integration tests: an in-memory database, a
//! scripted peer transport, and session constructors.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use error_stack::Report;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{EnvFilter, fmt};

use tideway_core::{
    BODY_ATTACHMENTS, BODY_REV, Body, MessageSender, OutgoingMessage, Properties, Reply, WireError,
    proof,
};
use tideway_gateway::{
    ChangeEntry, ChangesQuery, Database, DeltaResult, Document, RevDiffResult, Revision,
    SequenceId, SessionConfig, StoreError, StubAttachment, SyncMetrics, SyncSession, User,
};

/// Safe to call multiple times.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tideway=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Builds a property map from literal pairs.
#[must_use]
pub fn props(entries: &[(&str, &str)]) -> Properties {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// A revision persisted through `put_existing_rev`, kept for assertions.
#[derive(Clone)]
pub struct StoredPut {
    pub doc: Document,
    pub history: Vec<String>,
    pub no_conflicts: bool,
}

struct TaggedChange {
    entry: ChangeEntry,
    channels: BTreeSet<String>,
}

struct Inner {
    allow_conflicts: bool,
    specials: Mutex<HashMap<(String, String), Body>>,
    special_rev: Mutex<u64>,
    users: Mutex<HashMap<String, Arc<User>>>,
    principals_tx: watch::Sender<u64>,
    changes: Mutex<Vec<TaggedChange>>,
    changes_tx: watch::Sender<SequenceId>,
    revs: Mutex<HashMap<(String, String), Revision>>,
    current: Mutex<HashMap<String, String>>,
    attachments: Mutex<HashMap<String, Bytes>>,
    deltas: Mutex<HashMap<(String, String, String), Result<DeltaResult, StoreError>>>,
    proposed: Mutex<HashMap<(String, String), u16>>,
    puts: Mutex<Vec<StoredPut>>,
    terminated: Mutex<Vec<String>>,
}

/// In-memory [`Database`] with linear revision histories, watch-backed
/// change and principal feeds, and scriptable delta / proposed-rev
/// outcomes. Cloning shares the store; each clone carries its own user
/// binding, like a real view.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
    user: Option<Arc<User>>,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::with_allow_conflicts(true)
    }

    #[must_use]
    pub fn with_allow_conflicts(allow_conflicts: bool) -> Self {
        let (principals_tx, _) = watch::channel(0);
        let (changes_tx, _) = watch::channel(SequenceId::default());
        Self {
            inner: Arc::new(Inner {
                allow_conflicts,
                specials: Mutex::new(HashMap::new()),
                special_rev: Mutex::new(0),
                users: Mutex::new(HashMap::new()),
                principals_tx,
                changes: Mutex::new(Vec::new()),
                changes_tx,
                revs: Mutex::new(HashMap::new()),
                current: Mutex::new(HashMap::new()),
                attachments: Mutex::new(HashMap::new()),
                deltas: Mutex::new(HashMap::new()),
                proposed: Mutex::new(HashMap::new()),
                puts: Mutex::new(Vec::new()),
                terminated: Mutex::new(Vec::new()),
            }),
            user: None,
        }
    }

    pub fn add_user(&self, name: &str, channels: &[&str], roles: &[&str]) {
        let user = Arc::new(User {
            name: name.to_string(),
            channels: channels.iter().map(|c| (*c).to_string()).collect(),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
        });
        self.inner
            .users
            .lock()
            .unwrap()
            .insert(name.to_string(), user);
    }

    /// Replaces the user's channel grants and bumps the principal counter,
    /// as an admin-side grant change would.
    pub fn set_user_channels(&self, name: &str, channels: &[&str]) {
        let mut users = self.inner.users.lock().unwrap();
        if let Some(existing) = users.get(name) {
            let updated = Arc::new(User {
                name: existing.name.clone(),
                channels: channels.iter().map(|c| (*c).to_string()).collect(),
                roles: existing.roles.clone(),
            });
            users.insert(name.to_string(), updated);
        }
        drop(users);
        self.inner.principals_tx.send_modify(|count| *count += 1);
    }

    /// A view of this database bound to a previously added user.
    ///
    /// # Panics
    ///
    /// Panics if the user was never added.
    #[must_use]
    pub fn as_user(&self, name: &str) -> Self {
        let user = self
            .inner
            .users
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .expect("user not added");
        Self {
            inner: Arc::clone(&self.inner),
            user: Some(user),
        }
    }

    /// Appends a change entry and wakes subscribed feeds.
    pub fn push_change(&self, seq: u64, id: &str, rev: &str, deleted: bool, channels: &[&str]) {
        self.inner.changes.lock().unwrap().push(TaggedChange {
            entry: ChangeEntry {
                seq: SequenceId(seq),
                id: id.to_string(),
                revs: vec![rev.to_string()],
                deleted,
            },
            channels: channels.iter().map(|c| (*c).to_string()).collect(),
        });
        let _ = self.inner.changes_tx.send(SequenceId(seq));
    }

    pub fn insert_revision(&self, revision: Revision) {
        self.inner
            .current
            .lock()
            .unwrap()
            .insert(revision.doc_id.clone(), revision.rev_id.clone());
        self.inner
            .revs
            .lock()
            .unwrap()
            .insert((revision.doc_id.clone(), revision.rev_id.clone()), revision);
    }

    pub fn insert_rev(&self, doc_id: &str, rev_id: &str, body: &Value, deleted: bool) {
        let body = match body {
            Value::Object(map) => map.clone(),
            other => panic!("revision body must be an object, got {other}"),
        };
        self.insert_revision(Revision {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            deleted,
            body,
            history: Vec::new(),
            attachments: None,
        });
    }

    /// Stores a blob and returns its digest key.
    pub fn set_attachment(&self, data: &[u8]) -> String {
        let digest = proof::digest_key(data);
        self.inner
            .attachments
            .lock()
            .unwrap()
            .insert(digest.clone(), Bytes::copy_from_slice(data));
        digest
    }

    pub fn script_delta(
        &self,
        doc_id: &str,
        from_rev: &str,
        to_rev: &str,
        result: Result<DeltaResult, StoreError>,
    ) {
        self.inner.deltas.lock().unwrap().insert(
            (doc_id.to_string(), from_rev.to_string(), to_rev.to_string()),
            result,
        );
    }

    pub fn script_proposed_status(&self, doc_id: &str, rev_id: &str, status: u16) {
        self.inner
            .proposed
            .lock()
            .unwrap()
            .insert((doc_id.to_string(), rev_id.to_string()), status);
    }

    #[must_use]
    pub fn puts(&self) -> Vec<StoredPut> {
        self.inner.puts.lock().unwrap().clone()
    }

    #[must_use]
    pub fn terminated(&self) -> Vec<String> {
        self.inner.terminated.lock().unwrap().clone()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn intersects(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.intersection(b).next().is_some()
}

impl Database for MemoryDatabase {
    fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    fn set_user(&mut self, user: Option<Arc<User>>) {
        self.user = user;
    }

    fn allow_conflicts(&self) -> bool {
        self.inner.allow_conflicts
    }

    fn principal_changes(&self) -> watch::Receiver<u64> {
        self.inner.principals_tx.subscribe()
    }

    async fn get_user(&self, name: &str) -> Result<Arc<User>, Report<StoreError>> {
        self.inner
            .users
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Report::new(StoreError::NotFound))
    }

    async fn get_special(
        &self,
        kind: &str,
        doc_id: &str,
    ) -> Result<Option<Body>, Report<StoreError>> {
        Ok(self
            .inner
            .specials
            .lock()
            .unwrap()
            .get(&(kind.to_string(), doc_id.to_string()))
            .cloned())
    }

    async fn put_special(
        &self,
        kind: &str,
        doc_id: &str,
        mut body: Body,
    ) -> Result<String, Report<StoreError>> {
        let key = (kind.to_string(), doc_id.to_string());
        let mut specials = self.inner.specials.lock().unwrap();

        // Optimistic concurrency on the embedded `_rev`.
        if let Some(existing) = specials.get(&key) {
            let existing_rev = existing.get(BODY_REV).and_then(Value::as_str);
            let supplied_rev = body.get(BODY_REV).and_then(Value::as_str);
            if existing_rev != supplied_rev {
                return Err(Report::new(StoreError::Conflict));
            }
        }

        let mut counter = self.inner.special_rev.lock().unwrap();
        *counter += 1;
        let rev = format!("0-{}", *counter);
        body.insert(BODY_REV.to_string(), Value::String(rev.clone()));
        specials.insert(key, body);
        Ok(rev)
    }

    async fn rev_diff(&self, doc_id: &str, rev_ids: &[String]) -> RevDiffResult {
        let revs = self.inner.revs.lock().unwrap();
        let missing: Vec<String> = rev_ids
            .iter()
            .filter(|rev| !revs.contains_key(&(doc_id.to_string(), (*rev).clone())))
            .cloned()
            .collect();
        if missing.is_empty() {
            return RevDiffResult::default();
        }
        let possible = self
            .inner
            .current
            .lock()
            .unwrap()
            .get(doc_id)
            .map(|rev| vec![rev.clone()])
            .unwrap_or_default();
        RevDiffResult {
            missing: Some(missing),
            possible,
        }
    }

    async fn check_proposed_rev(&self, doc_id: &str, rev_id: &str, _parent_rev_id: &str) -> u16 {
        self.inner
            .proposed
            .lock()
            .unwrap()
            .get(&(doc_id.to_string(), rev_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    async fn get_rev(
        &self,
        doc_id: &str,
        rev_id: &str,
        _attachments_inline: bool,
    ) -> Result<Revision, Report<StoreError>> {
        self.inner
            .revs
            .lock()
            .unwrap()
            .get(&(doc_id.to_string(), rev_id.to_string()))
            .cloned()
            .ok_or_else(|| Report::new(StoreError::NotFound))
    }

    async fn put_existing_rev(
        &self,
        doc: Document,
        history: &[String],
        no_conflicts: bool,
    ) -> Result<(), Report<StoreError>> {
        let mut doc = doc;
        let body = doc
            .body()
            .map_err(|_| Report::new(StoreError::Storage))?
            .clone();
        self.insert_revision(Revision {
            doc_id: doc.id.clone(),
            rev_id: doc.rev_id.clone(),
            deleted: doc.deleted,
            body,
            history: history.get(1..).unwrap_or_default().to_vec(),
            attachments: doc.attachments.clone(),
        });
        self.inner.puts.lock().unwrap().push(StoredPut {
            doc,
            history: history.to_vec(),
            no_conflicts,
        });
        Ok(())
    }

    async fn get_delta(
        &self,
        doc_id: &str,
        from_rev: &str,
        to_rev: &str,
    ) -> Result<DeltaResult, Report<StoreError>> {
        match self.inner.deltas.lock().unwrap().get(&(
            doc_id.to_string(),
            from_rev.to_string(),
            to_rev.to_string(),
        )) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(err)) => Err(Report::new(err.clone())),
            None => Err(Report::new(StoreError::NotFound)),
        }
    }

    async fn get_attachment(&self, digest: &str) -> Result<Bytes, Report<StoreError>> {
        self.inner
            .attachments
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| Report::new(StoreError::NotFound))
    }

    async fn stub_attachments(
        &self,
        body: &Body,
        min_revpos: u64,
    ) -> Result<Vec<StubAttachment>, Report<StoreError>> {
        let Some(Value::Object(attachments)) = body.get(BODY_ATTACHMENTS) else {
            return Ok(Vec::new());
        };
        let known = self.inner.attachments.lock().unwrap();
        let mut stubs = Vec::new();
        for (name, meta) in attachments {
            let Value::Object(meta) = meta else {
                return Err(Report::new(StoreError::Storage));
            };
            if meta.contains_key("data") {
                // Inline attachment; nothing to resolve.
                continue;
            }
            let Some(digest) = meta.get("digest").and_then(Value::as_str) else {
                return Err(Report::new(StoreError::Storage));
            };
            let revpos = meta.get("revpos").and_then(Value::as_u64).unwrap_or(0);
            if revpos < min_revpos {
                continue;
            }
            stubs.push(StubAttachment {
                name: name.clone(),
                digest: digest.to_string(),
                known_data: known.get(digest).cloned(),
                length: meta.get("length").and_then(Value::as_u64),
                content_type: meta
                    .get("content_type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(stubs)
    }

    async fn store_attachment(&self, digest: &str, data: Bytes) -> Result<(), Report<StoreError>> {
        self.inner
            .attachments
            .lock()
            .unwrap()
            .insert(digest.to_string(), data);
        Ok(())
    }

    async fn changes_since(
        &self,
        query: &ChangesQuery,
    ) -> Result<Vec<ChangeEntry>, Report<StoreError>> {
        let changes = self.inner.changes.lock().unwrap();
        let mut page = Vec::new();
        for tagged in changes.iter() {
            if tagged.entry.seq <= query.since {
                continue;
            }
            if query.active_only && tagged.entry.deleted {
                continue;
            }
            if let Some(filter) = &query.channels
                && !intersects(&tagged.channels, filter)
            {
                continue;
            }
            if let Some(user) = &self.user
                && !intersects(&tagged.channels, &user.channels)
            {
                continue;
            }
            if !query.doc_ids.is_empty() && !query.doc_ids.contains(&tagged.entry.id) {
                continue;
            }
            page.push(tagged.entry.clone());
            if page.len() >= query.limit {
                break;
            }
        }
        Ok(page)
    }

    fn subscribe_changes(&self) -> watch::Receiver<SequenceId> {
        self.inner.changes_tx.subscribe()
    }

    fn notify_terminated_changes(&self, user_name: &str) {
        self.inner
            .terminated
            .lock()
            .unwrap()
            .push(user_name.to_string());
    }
}

/// A [`MessageSender`] that queues outgoing messages for the test to
/// inspect and answer.
pub struct PeerTransport {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
    closed: AtomicBool,
}

impl PeerTransport {
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MessageSender for PeerTransport {
    fn send(&self, request: OutgoingMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(request).is_ok()
    }
}

/// Answers an outgoing request with a successful reply. Returns `false`
/// when the message did not expect one.
pub fn reply_ok(message: &mut OutgoingMessage, body: impl Into<Bytes>) -> bool {
    reply_with(message, Reply::ok(body))
}

/// Answers an outgoing request with an error reply.
pub fn reply_err(message: &mut OutgoingMessage, code: u16, reason: &str) -> bool {
    reply_with(
        message,
        Reply {
            properties: Properties::new(),
            body: Bytes::new(),
            error: Some(WireError::http(code, reason)),
        },
    )
}

/// Answers an outgoing request with a fully specified reply.
pub fn reply_with(message: &mut OutgoingMessage, reply: Reply) -> bool {
    match message.take_reply_sender() {
        Some(tx) => tx.send(reply).is_ok(),
        None => false,
    }
}

/// A session over the given database view with a scripted peer transport.
#[must_use]
pub fn test_session(
    db: MemoryDatabase,
) -> (
    SyncSession<MemoryDatabase>,
    mpsc::UnboundedReceiver<OutgoingMessage>,
) {
    test_session_with(db, SessionConfig::default())
}

#[must_use]
pub fn test_session_with(
    db: MemoryDatabase,
    config: SessionConfig,
) -> (
    SyncSession<MemoryDatabase>,
    mpsc::UnboundedReceiver<OutgoingMessage>,
) {
    let (transport, rx) = PeerTransport::channel();
    let session = SyncSession::new(
        "test-peer",
        db,
        transport,
        Arc::new(SyncMetrics::new()),
        config,
    );
    (session, rx)
}
