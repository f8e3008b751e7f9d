//! Minimal in-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use error_stack::Report;
use tokio::sync::watch;

use tideway_core::{Body, MessageSender, OutgoingMessage};

use crate::db::{
    ChangeEntry, ChangesQuery, Database, DeltaResult, RevDiffResult, Revision, SequenceId,
    StoreError, StubAttachment, User,
};
use crate::document::Document;

/// A `Database` that stores nothing but specials and answers everything
/// else with empty results. Enough for session, dispatch, and checkpoint
/// unit tests.
#[derive(Clone)]
pub(crate) struct NullDatabase {
    user: Option<Arc<User>>,
    specials: Arc<Mutex<HashMap<(String, String), Body>>>,
    special_rev: Arc<Mutex<u64>>,
    principals_rx: watch::Receiver<u64>,
    _principals_tx: Arc<watch::Sender<u64>>,
    changes_rx: watch::Receiver<SequenceId>,
    _changes_tx: Arc<watch::Sender<SequenceId>>,
}

impl NullDatabase {
    pub(crate) fn new(user: Option<User>) -> Self {
        let (principals_tx, principals_rx) = watch::channel(0);
        let (changes_tx, changes_rx) = watch::channel(SequenceId::default());
        Self {
            user: user.map(Arc::new),
            specials: Arc::new(Mutex::new(HashMap::new())),
            special_rev: Arc::new(Mutex::new(0)),
            principals_rx,
            _principals_tx: Arc::new(principals_tx),
            changes_rx,
            _changes_tx: Arc::new(changes_tx),
        }
    }
}

impl Database for NullDatabase {
    fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    fn set_user(&mut self, user: Option<Arc<User>>) {
        self.user = user;
    }

    fn allow_conflicts(&self) -> bool {
        true
    }

    fn principal_changes(&self) -> watch::Receiver<u64> {
        self.principals_rx.clone()
    }

    async fn get_user(&self, name: &str) -> Result<Arc<User>, Report<StoreError>> {
        match &self.user {
            Some(user) if user.name == name => Ok(Arc::clone(user)),
            _ => Err(Report::new(StoreError::NotFound)),
        }
    }

    async fn get_special(
        &self,
        kind: &str,
        doc_id: &str,
    ) -> Result<Option<Body>, Report<StoreError>> {
        Ok(self
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
        let mut counter = self.special_rev.lock().unwrap();
        *counter += 1;
        let rev = format!("0-{}", *counter);
        body.insert(
            tideway_core::BODY_REV.to_string(),
            serde_json::Value::String(rev.clone()),
        );
        self.specials
            .lock()
            .unwrap()
            .insert((kind.to_string(), doc_id.to_string()), body);
        Ok(rev)
    }

    async fn rev_diff(&self, _doc_id: &str, rev_ids: &[String]) -> RevDiffResult {
        RevDiffResult {
            missing: Some(rev_ids.to_vec()),
            possible: Vec::new(),
        }
    }

    async fn check_proposed_rev(&self, _doc_id: &str, _rev_id: &str, _parent_rev_id: &str) -> u16 {
        0
    }

    async fn get_rev(
        &self,
        _doc_id: &str,
        _rev_id: &str,
        _attachments_inline: bool,
    ) -> Result<Revision, Report<StoreError>> {
        Err(Report::new(StoreError::NotFound))
    }

    async fn put_existing_rev(
        &self,
        _doc: Document,
        _history: &[String],
        _no_conflicts: bool,
    ) -> Result<(), Report<StoreError>> {
        Ok(())
    }

    async fn get_delta(
        &self,
        _doc_id: &str,
        _from_rev: &str,
        _to_rev: &str,
    ) -> Result<DeltaResult, Report<StoreError>> {
        Err(Report::new(StoreError::NotFound))
    }

    async fn get_attachment(&self, _digest: &str) -> Result<Bytes, Report<StoreError>> {
        Err(Report::new(StoreError::NotFound))
    }

    async fn stub_attachments(
        &self,
        _body: &Body,
        _min_revpos: u64,
    ) -> Result<Vec<StubAttachment>, Report<StoreError>> {
        Ok(Vec::new())
    }

    async fn store_attachment(&self, _digest: &str, _data: Bytes) -> Result<(), Report<StoreError>> {
        Ok(())
    }

    async fn changes_since(
        &self,
        _query: &ChangesQuery,
    ) -> Result<Vec<ChangeEntry>, Report<StoreError>> {
        Ok(Vec::new())
    }

    fn subscribe_changes(&self) -> watch::Receiver<SequenceId> {
        self.changes_rx.clone()
    }

    fn notify_terminated_changes(&self, _user_name: &str) {}
}

/// Drops every outgoing message; `send` always succeeds.
struct NullSender;

impl MessageSender for NullSender {
    fn send(&self, _request: OutgoingMessage) -> bool {
        true
    }
}

pub(crate) fn null_sender() -> Arc<dyn MessageSender> {
    Arc::new(NullSender)
}

/// Records outgoing messages for assertions; `send` always succeeds.
pub(crate) struct RecordingSender {
    pub(crate) sent: Mutex<Vec<OutgoingMessage>>,
}

impl RecordingSender {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }
}

impl MessageSender for RecordingSender {
    fn send(&self, request: OutgoingMessage) -> bool {
        self.sent.lock().unwrap().push(request);
        true
    }
}
