//! Verb dispatch and the user-refresh interlock.

use error_stack::Report;
use tracing::{debug, info, warn};

use tideway_core::{
    HandlerError, IncomingMessage, PROFILE_CHANGES, PROFILE_GET_ATTACHMENT,
    PROFILE_GET_CHECKPOINT, PROFILE_NO_REV, PROFILE_PROPOSE_CHANGES, PROFILE_PROVE_ATTACHMENT,
    PROFILE_REV, PROFILE_SET_CHECKPOINT, PROFILE_SUB_CHANGES, WireError,
};

use crate::context::SyncSession;
use crate::db::Database;

/// Per-message handler: a clone of the session plus a handler-local
/// snapshot of its database view.
pub struct Handler<D: Database> {
    pub(crate) session: SyncSession<D>,
    pub(crate) db: D,
    pub(crate) serial: u64,
}

impl<D: Database> Handler<D> {
    /// Re-runs the interlock and republishes the refreshed view locally.
    pub(crate) async fn refresh_user(&mut self) -> Result<(), Report<HandlerError>> {
        if let Some(db) = self.session.refresh_user().await? {
            self.db = db;
        }
        Ok(())
    }

    pub(crate) fn log_endpoint_entry(&self, profile: &str, detail: &str) {
        info!(serial = self.serial, profile, "{detail}");
    }
}

/// Handles one inbound message: routes it by profile, encodes any handler
/// failure onto the paired response, and completes the exchange.
pub async fn dispatch<D: Database>(session: &SyncSession<D>, mut rq: IncomingMessage) {
    let serial = session.increment_serial();
    let db = session.copy_context_database().await;
    let mut handler = Handler {
        session: session.clone(),
        db,
        serial,
    };

    if let Err(report) = route(&mut handler, &mut rq).await {
        match report.current_context() {
            HandlerError::SenderClosed => {
                debug!(serial, profile = rq.profile(), "handler stopped: transport closed");
            }
            HandlerError::Protocol { code, message } => {
                warn!(serial, profile = rq.profile(), code, error = ?report, "handler failed");
                if let Some(response) = rq.response() {
                    response.set_error(WireError::http(*code, message.clone()));
                }
            }
        }
    }
    rq.finish();
}

/// The verb table. User-scoped verbs run the permission-refresh interlock
/// before their handler body.
async fn route<D: Database>(
    h: &mut Handler<D>,
    rq: &mut IncomingMessage,
) -> Result<(), Report<HandlerError>> {
    match rq.profile() {
        PROFILE_GET_CHECKPOINT => h.handle_get_checkpoint(rq).await,
        PROFILE_SET_CHECKPOINT => h.handle_set_checkpoint(rq).await,
        PROFILE_SUB_CHANGES => {
            h.refresh_user().await?;
            h.handle_sub_changes(rq).await
        }
        PROFILE_CHANGES => {
            h.refresh_user().await?;
            h.handle_changes(rq).await
        }
        PROFILE_PROPOSE_CHANGES => h.handle_propose_changes(rq).await,
        PROFILE_REV => {
            h.refresh_user().await?;
            h.handle_rev(rq).await
        }
        PROFILE_NO_REV => h.handle_no_rev(rq),
        PROFILE_GET_ATTACHMENT => {
            h.refresh_user().await?;
            h.handle_get_attachment(rq).await
        }
        PROFILE_PROVE_ATTACHMENT => h.handle_prove_attachment(rq).await,
        other => Err(Report::new(HandlerError::not_found(format!(
            "no handler for profile {other:?}"
        )))),
    }
}
