//! Push engine: peer-pushed change lists, proposals, and revision bodies.

use error_stack::{Report, ResultExt};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use tideway_core::{
    BODY_ATTACHMENTS, BODY_EXPIRY, HandlerError, IncomingMessage, PROP_DELTAS, PROP_HANDLER,
    PROP_SEQUENCE, PROP_SHOW_HANDLER, delta,
};

use crate::db::{Database, store_error};
use crate::dispatch::Handler;
use crate::document::{Document, rev_generation};
use crate::messages::{NoRevMessage, RevMessage};

impl<D: Database> Handler<D> {
    /// A set of changes pushed by the peer (allow-conflicts mode). Answers
    /// each row with `0` (already present) or the possible ancestors.
    pub(crate) async fn handle_changes(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        if !self.db.allow_conflicts() {
            return Err(Report::new(HandlerError::conflict(
                "Use 'proposeChanges' instead",
            )));
        }

        let change_list: Vec<Vec<Value>> = rq.read_json_body()?;
        self.log_endpoint_entry(rq.profile(), &format!("#Changes:{}", change_list.len()));
        if change_list.is_empty() {
            return Ok(());
        }

        self.session
            .metrics()
            .propose_changes_total
            .inc_by(change_list.len() as u64);

        let mut output = String::with_capacity(change_list.len() * 4);
        output.push('[');
        let mut n_written = 0;
        let mut expected_seqs = Vec::new();

        for change in &change_list {
            let doc_id = change
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| Report::new(HandlerError::bad_request("invalid change row")))?;
            let rev_id = change
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| Report::new(HandlerError::bad_request("invalid change row")))?;

            let diff = self.db.rev_diff(doc_id, &[rev_id.to_string()]).await;
            if n_written > 0 {
                output.push(',');
            }
            if diff.missing.is_none() {
                // Already have this rev; tell the peer to skip sending it.
                output.push('0');
            } else {
                if diff.possible.is_empty() {
                    output.push_str("[]");
                } else {
                    let encoded = serde_json::to_string(&diff.possible)
                        .change_context(HandlerError::internal("failed to encode ancestors"))?;
                    output.push_str(&encoded);
                }

                // Sequence bookkeeping is only needed when someone listens.
                if self.session.has_post_handle_changes() {
                    match change.first() {
                        Some(Value::String(seq)) => expected_seqs.push(seq.clone()),
                        Some(Value::Number(seq)) => expected_seqs.push(seq.to_string()),
                        _ => {}
                    }
                }
            }
            n_written += 1;
        }
        output.push(']');

        if let Some(response) = rq.response() {
            response.set_compressed(true);
            response.set_body(output.into_bytes());
        }

        self.session.notify_changes_handled(expected_seqs);
        Ok(())
    }

    /// A set of proposed changes in no-conflicts mode. Only non-zero
    /// statuses are materialized; the emitted index always equals the row
    /// index, and trailing zeros are elided.
    pub(crate) async fn handle_propose_changes(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let change_list: Vec<Vec<Value>> = rq.read_json_body()?;
        self.log_endpoint_entry(rq.profile(), &format!("#Changes:{}", change_list.len()));
        if change_list.is_empty() {
            return Ok(());
        }

        self.session
            .metrics()
            .propose_changes_total
            .inc_by(change_list.len() as u64);

        let mut output = String::with_capacity(change_list.len() * 2);
        output.push('[');
        let mut n_written = 0;

        for (index, change) in change_list.iter().enumerate() {
            let doc_id = change
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| Report::new(HandlerError::bad_request("invalid proposal row")))?;
            let rev_id = change
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| Report::new(HandlerError::bad_request("invalid proposal row")))?;
            let parent_rev_id = change.get(2).and_then(Value::as_str).unwrap_or_default();

            let status = self.db.check_proposed_rev(doc_id, rev_id, parent_rev_id).await;
            if status != 0 {
                append_status(&mut output, &mut n_written, index, status);
            }
        }
        output.push(']');

        if let Some(response) = rq.response() {
            if self.session.can_use_deltas() {
                trace!("advertising deltas on proposeChanges response");
                response
                    .properties
                    .insert(PROP_DELTAS.to_string(), "true".to_string());
            }
            response.set_compressed(true);
            response.set_body(output.into_bytes());
        }
        Ok(())
    }

    /// The peer is pushing a revision body.
    pub(crate) async fn handle_rev(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let rev_message = RevMessage::new(rq);
        debug!(serial = self.serial, profile = rq.profile(), "{rev_message}");

        let body_bytes = rq.body().clone();
        self.session
            .metrics()
            .doc_push_bytes_total
            .inc_by(body_bytes.len() as u64);

        let (Some(doc_id), Some(rev_id)) = (rev_message.id(), rev_message.rev()) else {
            return Err(Report::new(HandlerError::bad_request("Missing docID or revID")));
        };
        let doc_id = doc_id.to_string();
        let rev_id = rev_id.to_string();

        let mut doc = Document::new(&doc_id, &rev_id);
        doc.update_body_bytes(body_bytes);
        doc.deleted = rev_message.deleted();

        let mut injected_attachments = false;
        if let Some(delta_src) = rev_message.delta_src() {
            if !self.session.can_use_deltas() {
                return Err(Report::new(HandlerError::bad_request(
                    "Deltas are disabled for this peer",
                )));
            }

            // The access-checked fetch path: even with the no-conflict
            // write guarantee, a peer with write-only access must not learn
            // about prior revisions.
            let src = self
                .db
                .get_rev(&doc_id, delta_src, false)
                .await
                .map_err(|report| {
                    report.change_context(HandlerError::not_found(format!(
                        "Can't fetch doc for deltaSrc={delta_src}"
                    )))
                })?;
            if src.deleted {
                return Err(Report::new(HandlerError::not_found(format!(
                    "Can't use delta. Found tombstone for deltaSrc={delta_src}"
                ))));
            }

            let mut src_body = src.body.clone();
            if let Some(attachments) = &src.attachments
                && !attachments.is_empty()
            {
                // Stamp the source's attachments so the patch can edit them.
                src_body.insert(
                    BODY_ATTACHMENTS.to_string(),
                    Value::Object(attachments.clone()),
                );
                injected_attachments = true;
            }

            let patch = doc.body()?.clone();
            delta::apply(&mut src_body, &patch).map_err(|err| {
                warn!(doc = %doc_id, from = delta_src, to = %rev_id, error = %err,
                    "failed to patch delta source");
                Report::new(HandlerError::internal(format!(
                    "Error patching deltaSrc with delta: {err}"
                )))
            })?;
            doc.update_body(src_body);
            self.session.metrics().delta_docs_pushed_total.inc();
        }

        if let Some(raw_expiry) = doc.body()?.get(BODY_EXPIRY).cloned() {
            // The expiry grammar is the store's, not ours.
            let expiry = self.db.extract_expiry(&raw_expiry).map_err(|report| {
                report.change_context(HandlerError::bad_request("Invalid expiry"))
            })?;
            doc.expiry = Some(expiry);
            doc.body()?.remove(BODY_EXPIRY);
        }

        let no_conflicts = rev_message.no_conflicts()?;

        let ancestors = rev_message.history();
        let mut history = vec![rev_id.clone()];
        history.extend(ancestors.iter().cloned());

        // Attachments whose revpos is above the oldest ancestor's
        // generation still need validation; with no ancestry every stub
        // does.
        let min_revpos = ancestors
            .last()
            .and_then(|oldest| rev_generation(oldest))
            .map_or(1, |generation| generation + 1);

        if injected_attachments || doc.body()?.contains_key(BODY_ATTACHMENTS) {
            let body_snapshot = doc.body()?.clone();
            if let Err(report) = self
                .download_or_verify_attachments(&body_snapshot, min_revpos, &doc_id)
                .await
            {
                warn!(doc = %doc_id, rev = %rev_id, error = ?report,
                    "failed to reconcile pushed attachments");
                return Err(report);
            }

            if let Some(Value::Object(attachments)) = doc.body()?.remove(BODY_ATTACHMENTS) {
                doc.attachments = Some(attachments);
            }
        }

        self.session.metrics().docs_pushed_total.inc();
        self.db
            .put_existing_rev(doc, &history, no_conflicts)
            .await
            .map_err(store_error)?;

        self.session
            .notify_rev_handled(rq.property(PROP_SEQUENCE).unwrap_or_default());
        Ok(())
    }

    /// The peer could not send a revision we asked for. Log-only, except
    /// for the testing acknowledgement.
    pub(crate) fn handle_no_rev(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let norev = NoRevMessage::new(rq);
        info!(
            serial = self.serial,
            doc = norev.id(),
            rev = norev.rev(),
            error = norev.error(),
            reason = norev.reason(),
            "peer sent norev"
        );

        if !rq.no_reply() && rq.property(PROP_SHOW_HANDLER) == Some("true") {
            if let Some(response) = rq.response() {
                response
                    .properties
                    .insert(PROP_HANDLER.to_string(), "handleNoRev".to_string());
            }
        }
        Ok(())
    }
}

/// Emits `status` at `index`, forward-padding skipped zeros so the emitted
/// position always equals the row index.
fn append_status(output: &mut String, n_written: &mut usize, index: usize, status: u16) {
    if *n_written > 0 {
        output.push(',');
    }
    while *n_written < index {
        output.push_str("0,");
        *n_written += 1;
    }
    output.push_str(&status.to_string());
    *n_written += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(statuses: &[u16]) -> String {
        let mut output = String::from("[");
        let mut n_written = 0;
        for (index, status) in statuses.iter().enumerate() {
            if *status != 0 {
                append_status(&mut output, &mut n_written, index, *status);
            }
        }
        output.push(']');
        output
    }

    #[test]
    fn propose_statuses_elide_trailing_zeros() {
        assert_eq!(encode(&[0, 2, 0]), "[0,2]");
        assert_eq!(encode(&[0, 0, 0]), "[]");
        assert_eq!(encode(&[1, 0, 0]), "[1]");
    }

    #[test]
    fn propose_statuses_materialize_interior_zeros() {
        assert_eq!(encode(&[2, 0, 3]), "[2,0,3]");
        assert_eq!(encode(&[0, 0, 409]), "[0,0,409]");
        assert_eq!(encode(&[304, 409]), "[304,409]");
    }
}
