//! Pull engine: `subChanges` subscriptions, the change-feed batcher, and
//! the revision senders.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use error_stack::{Report, ResultExt};
use futures::FutureExt as _;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use tideway_core::{
    BODY_ATTACHMENTS, BY_CHANNEL_FILTER, HandlerError, IncomingMessage, OutgoingMessage,
    PROFILE_CHANGES, PROFILE_NO_REV, PROFILE_REV, PROP_DELETED, PROP_DELTA_SRC, PROP_DELTAS,
    PROP_ERROR, PROP_HISTORY, PROP_ID, PROP_MAX_HISTORY, PROP_REASON, PROP_REV, PROP_SEQUENCE,
    ReplyHandle,
};

use crate::context::{Subscription, SyncSession};
use crate::db::{
    ChangeEntry, ChangesQuery, Database, Revision, SequenceId, StoreError, store_error,
    store_status,
};
use crate::dispatch::Handler;
use crate::messages::SubChangesParams;

impl<D: Database> Handler<D> {
    pub(crate) async fn handle_sub_changes(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        self.session.mark_sub_changes();

        // Only one change feed per session at any time.
        if !self.session.try_begin_sub_changes() {
            return Err(Report::new(HandlerError::internal(
                "connection already has an outstanding continuous subChanges",
            )));
        }

        match self.start_sub_changes(rq).await {
            Ok(()) => Ok(()),
            Err(report) => {
                // The feed never started; release the gate so a corrected
                // subscription can proceed.
                self.session.end_sub_changes();
                Err(report)
            }
        }
    }

    async fn start_sub_changes(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let params = SubChangesParams::parse(rq, &self.db)
            .map_err(|r| r.change_context(HandlerError::bad_request("Invalid subChanges parameters")))?;

        if !params.doc_ids().is_empty() && params.continuous() {
            return Err(Report::new(HandlerError::bad_request(
                "DocIDs filter not supported for continuous subChanges",
            )));
        }

        let mut channels = None;
        match params.filter() {
            Some(BY_CHANNEL_FILTER) => {
                let expanded = params.expanded_channels();
                if expanded.is_empty() {
                    return Err(Report::new(HandlerError::bad_request("Empty channel list")));
                }
                channels = Some(expanded);
            }
            Some(_) => {
                return Err(Report::new(HandlerError::bad_request(
                    "Unknown filter; try sync_gateway/bychannel",
                )));
            }
            None => {}
        }

        self.log_endpoint_entry(rq.profile(), &params.to_string());

        let continuous = params.continuous();
        self.session.set_subscription(Subscription {
            batch_size: params.batch_size(),
            continuous,
            active_only: params.active_only(),
            channels,
        });

        if continuous {
            self.session.metrics().pull_active_continuous.inc();
            self.session.metrics().pull_total_continuous.inc();
        } else {
            self.session.metrics().pull_active_one_shot.inc();
            self.session.metrics().pull_total_one_shot.inc();
        }

        let session = self.session.clone();
        let feed_db = self.session.copy_context_database().await;
        let since = params.since();
        let doc_ids = params.doc_ids().to_vec();
        let serial = self.serial;

        tokio::spawn(async move {
            let started = Instant::now();
            let feed = AssertUnwindSafe(send_changes(&session, &feed_db, since, doc_ids));
            match feed.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(report)) => {
                    if matches!(report.current_context(), HandlerError::SenderClosed) {
                        debug!(serial, "change feed stopped: transport closed");
                    } else {
                        warn!(serial, error = ?report, "change feed failed");
                    }
                }
                Err(panicked) => {
                    warn!(serial, panic = describe_panic(&*panicked), "panic while sending changes");
                }
            }
            if continuous {
                session.metrics().pull_active_continuous.dec();
            } else {
                session.metrics().pull_active_one_shot.dec();
            }
            session.end_sub_changes();
            debug!(serial, elapsed = ?started.elapsed(), "change feed exited");
        });

        Ok(())
    }
}

fn describe_panic(panicked: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panicked.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panicked.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// One wire row: `[seq, docID, rev]`, or `[seq, docID, rev, true]` for a
/// tombstone.
fn change_row(entry: &ChangeEntry, rev: &str) -> Value {
    if entry.deleted {
        json!([entry.seq, entry.id, rev, true])
    } else {
        json!([entry.seq, entry.id, rev])
    }
}

fn decode_change_row(row: &Value) -> Option<(SequenceId, String, String)> {
    let row = row.as_array()?;
    let seq = SequenceId(row.first()?.as_u64()?);
    let doc_id = row.get(1)?.as_str()?.to_string();
    let rev_id = row.get(2)?.as_str()?.to_string();
    Some((seq, doc_id, rev_id))
}

/// Drives the change feed for one subscription until caught up (one-shot),
/// the terminator fires, or the transport closes.
async fn send_changes<D: Database>(
    session: &SyncSession<D>,
    db: &D,
    since: SequenceId,
    doc_ids: Vec<String>,
) -> Result<(), Report<HandlerError>> {
    let subscription = session.subscription();
    let batch_size = subscription.batch_size.max(1);
    info!(since = %since, continuous = subscription.continuous, "sending changes");

    let mut changes_rx = db.subscribe_changes();
    // Everything up to now is covered by the first query pass; only later
    // notifications should wake the feed.
    changes_rx.borrow_and_update();

    let mut pending: Vec<Value> = Vec::with_capacity(batch_size);
    let mut caught_up = false;
    let mut since = since;

    let forced_close = loop {
        if session.terminator().is_cancelled() {
            break true;
        }

        let query = ChangesQuery {
            since,
            limit: batch_size,
            active_only: subscription.active_only,
            channels: subscription.channels.clone(),
            doc_ids: doc_ids.clone(),
        };
        let entries = db.changes_since(&query).await.map_err(store_error)?;

        if entries.is_empty() {
            if !pending.is_empty() {
                send_batch_of_changes(session, std::mem::take(&mut pending)).await?;
            }
            if !caught_up {
                caught_up = true;
                // Signal to the client that it is caught up; once per
                // subscription.
                send_batch_of_changes(session, Vec::new()).await?;
            }
            if !subscription.continuous {
                break false;
            }
            tokio::select! {
                () = session.terminator().cancelled() => break true,
                changed = changes_rx.changed() => {
                    if changed.is_err() {
                        break false;
                    }
                }
            }
        } else {
            debug!(count = entries.len(), "forwarding changes page");
            for entry in entries {
                since = entry.seq;
                // Reserved namespace; never replicated.
                if entry.id.starts_with('_') {
                    continue;
                }
                for rev in entry.revs.clone() {
                    pending.push(change_row(&entry, &rev));
                    if pending.len() >= batch_size {
                        let batch =
                            std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                        send_batch_of_changes(session, batch).await?;
                    }
                }
            }
        }
    };

    if forced_close && let Some(user) = db.user() {
        db.notify_terminated_changes(&user.name);
    }
    Ok(())
}

/// Ships one `changes` batch. Non-empty batches expect the peer's per-row
/// reply, which is handled on its own task against a freshly refreshed
/// database view; empty batches are the caught-up signal.
async fn send_batch_of_changes<D: Database>(
    session: &SyncSession<D>,
    rows: Vec<Value>,
) -> Result<(), Report<HandlerError>> {
    let mut outrq = OutgoingMessage::new(PROFILE_CHANGES);
    outrq.set_json_body(&rows)?;
    outrq.set_compressed(true);

    if rows.is_empty() {
        outrq.set_no_reply(true);
        if !session.send_message(outrq) {
            return Err(Report::new(HandlerError::SenderClosed));
        }
        info!("sent all changes to client");
        return Ok(());
    }

    // Catch user updates before snapshotting the view the response handler
    // will run against.
    let _ = session.refresh_user().await?;
    let response_db = session.copy_context_database().await;

    let reply = outrq.expect_reply();
    if !session.send_message(outrq) {
        return Err(Report::new(HandlerError::SenderClosed));
    }
    info!(count = rows.len(), "sent changes to client");

    let session = session.clone();
    tokio::spawn(async move {
        if let Err(report) = handle_changes_response(&session, &response_db, reply, rows).await {
            if matches!(report.current_context(), HandlerError::SenderClosed) {
                debug!("changes response handling stopped: transport closed");
            } else {
                error!(error = ?report, "failed to handle changes response");
            }
        }
    });
    Ok(())
}

/// Reads the peer's per-row verdicts and ships the revisions it asked for.
/// A `0`/`null` row means the peer already has that revision; an array row
/// lists the revs the peer knows, which bound the history we ship and pick
/// the delta base.
async fn handle_changes_response<D: Database>(
    session: &SyncSession<D>,
    db: &D,
    reply: ReplyHandle,
    sent_rows: Vec<Value>,
) -> Result<(), Report<HandlerError>> {
    let reply = reply.reply().await?;
    if let Some(error) = &reply.error {
        warn!(code = error.code, message = %error.message, "peer rejected changes batch");
        return Ok(());
    }

    let max_history = reply
        .property(PROP_MAX_HISTORY)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let deltas_ready = session.can_use_deltas() && reply.property(PROP_DELTAS) == Some("true");

    if reply.body.is_empty() {
        return Ok(());
    }
    let answers: Vec<Value> = serde_json::from_slice(&reply.body)
        .change_context(HandlerError::bad_request("invalid changes response body"))?;

    for (row, answer) in sent_rows.iter().zip(&answers) {
        let Value::Array(known) = answer else {
            continue;
        };
        let Some((seq, doc_id, rev_id)) = decode_change_row(row) else {
            continue;
        };
        let known_revs: Vec<String> = known
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        if deltas_ready && !known_revs.is_empty() {
            send_rev_as_delta(
                session,
                db,
                &doc_id,
                &rev_id,
                &known_revs[0],
                seq,
                &known_revs,
                max_history,
            )
            .await?;
        } else {
            send_revision(session, db, &doc_id, &rev_id, seq, &known_revs, max_history).await?;
        }
    }
    Ok(())
}

/// Ships a revision as a delta against `delta_src`, falling back to the
/// full body when no usable delta exists. Losing read access to the
/// source revision is not a fallback case.
#[allow(clippy::too_many_arguments)]
async fn send_rev_as_delta<D: Database>(
    session: &SyncSession<D>,
    db: &D,
    doc_id: &str,
    rev_id: &str,
    delta_src: &str,
    seq: SequenceId,
    known_revs: &[String],
    max_history: usize,
) -> Result<(), Report<HandlerError>> {
    session.metrics().deltas_requested_total.inc();

    let result = match db.get_delta(doc_id, delta_src, rev_id).await {
        Ok(result) => result,
        Err(report) => {
            return match report.current_context() {
                StoreError::Forbidden => Err(store_error(report)),
                StoreError::DeltaFailed => {
                    warn!(doc = doc_id, from = delta_src, to = rev_id, error = ?report,
                        "delta generation failed, falling back to full body");
                    send_revision(session, db, doc_id, rev_id, seq, known_revs, max_history).await
                }
                _ => {
                    debug!(doc = doc_id, from = delta_src, to = rev_id,
                        "no delta available, falling back to full body");
                    send_revision(session, db, doc_id, rev_id, seq, known_revs, max_history).await
                }
            };
        }
    };

    if let Some(redacted) = result.redacted {
        return send_revision_message(session, seq, &redacted, known_revs, max_history).await;
    }

    let Some(delta_bytes) = result.delta else {
        debug!(doc = doc_id, from = delta_src, to = rev_id,
            "store produced no delta, falling back to full body");
        return send_revision(session, db, doc_id, rev_id, seq, known_revs, max_history).await;
    };

    let mut outrq = OutgoingMessage::new(PROFILE_REV);
    outrq.set_property(PROP_ID, doc_id);
    outrq.set_property(PROP_REV, rev_id);
    outrq.set_property(PROP_DELTA_SRC, delta_src);
    outrq.set_property(PROP_SEQUENCE, seq.to_string());
    outrq.set_compressed(true);
    outrq.set_body(delta_bytes);
    if !session.send_message(outrq) {
        return Err(Report::new(HandlerError::SenderClosed));
    }

    session.metrics().deltas_sent_total.inc();
    Ok(())
}

/// Loads and ships a full revision; an unloadable revision becomes a
/// `norev` so the peer can account for the sequence.
async fn send_revision<D: Database>(
    session: &SyncSession<D>,
    db: &D,
    doc_id: &str,
    rev_id: &str,
    seq: SequenceId,
    known_revs: &[String],
    max_history: usize,
) -> Result<(), Report<HandlerError>> {
    match db.get_rev(doc_id, rev_id, true).await {
        Ok(revision) => {
            send_revision_message(session, seq, &revision, known_revs, max_history).await
        }
        Err(report) => {
            debug!(doc = doc_id, rev = rev_id, error = ?report, "revision unavailable, sending norev");
            send_no_rev(session, doc_id, rev_id, seq, &report)
        }
    }
}

async fn send_revision_message<D: Database>(
    session: &SyncSession<D>,
    seq: SequenceId,
    revision: &Revision,
    known_revs: &[String],
    max_history: usize,
) -> Result<(), Report<HandlerError>> {
    let mut body = revision.body.clone();
    let mut digests = Vec::new();
    if let Some(attachments) = &revision.attachments {
        for meta in attachments.values() {
            if let Some(digest) = meta.get("digest").and_then(Value::as_str) {
                digests.push(digest.to_string());
            }
        }
        body.insert(
            BODY_ATTACHMENTS.to_string(),
            Value::Object(attachments.clone()),
        );
    }

    let mut outrq = OutgoingMessage::new(PROFILE_REV);
    outrq.set_property(PROP_ID, &revision.doc_id);
    outrq.set_property(PROP_REV, &revision.rev_id);
    if revision.deleted {
        outrq.set_property(PROP_DELETED, "true");
    }
    let history = trim_history(&revision.history, known_revs, max_history);
    if !history.is_empty() {
        outrq.set_property(PROP_HISTORY, history.join(","));
    }
    outrq.set_property(PROP_SEQUENCE, seq.to_string());
    outrq.set_compressed(true);
    outrq.set_json_body(&body)?;

    if digests.is_empty() {
        if !session.send_message(outrq) {
            return Err(Report::new(HandlerError::SenderClosed));
        }
        return Ok(());
    }

    // The digests become serveable for the lifetime of this exchange.
    session.add_allowed_attachments(&digests);
    let reply = outrq.expect_reply();
    if !session.send_message(outrq) {
        session.remove_allowed_attachments(&digests);
        return Err(Report::new(HandlerError::SenderClosed));
    }
    let session = session.clone();
    tokio::spawn(async move {
        // Drain regardless of the peer's verdict.
        let _ = reply.reply().await;
        session.remove_allowed_attachments(&digests);
    });
    Ok(())
}

fn send_no_rev<D: Database>(
    session: &SyncSession<D>,
    doc_id: &str,
    rev_id: &str,
    seq: SequenceId,
    report: &Report<StoreError>,
) -> Result<(), Report<HandlerError>> {
    let mut outrq = OutgoingMessage::new(PROFILE_NO_REV);
    outrq.set_property(PROP_ID, doc_id);
    outrq.set_property(PROP_REV, rev_id);
    outrq.set_property(PROP_SEQUENCE, seq.to_string());
    outrq.set_property(PROP_ERROR, store_status(report.current_context()).to_string());
    outrq.set_property(PROP_REASON, report.current_context().to_string());
    outrq.set_no_reply(true);
    if !session.send_message(outrq) {
        return Err(Report::new(HandlerError::SenderClosed));
    }
    Ok(())
}

/// Ancestors to ship with a revision: stop after the first rev the peer
/// already knows; `max_history` of zero means unbounded.
fn trim_history(history: &[String], known_revs: &[String], max_history: usize) -> Vec<String> {
    let mut out = Vec::new();
    for rev in history {
        out.push(rev.clone());
        if known_revs.iter().any(|known| known == rev) {
            break;
        }
        if max_history > 0 && out.len() >= max_history {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::context::SessionConfig;
    use crate::metrics::SyncMetrics;
    use crate::testutil::{NullDatabase, RecordingSender};

    use super::*;

    fn revs(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn trim_history_stops_at_known_rev() {
        let history = revs(&["3-c", "2-b", "1-a"]);
        let trimmed = trim_history(&history, &revs(&["2-b"]), 0);
        assert_eq!(trimmed, revs(&["3-c", "2-b"]));
    }

    #[test]
    fn trim_history_caps_at_max() {
        let history = revs(&["4-d", "3-c", "2-b", "1-a"]);
        let trimmed = trim_history(&history, &[], 2);
        assert_eq!(trimmed, revs(&["4-d", "3-c"]));
    }

    #[test]
    fn trim_history_unbounded_without_max() {
        let history = revs(&["2-b", "1-a"]);
        assert_eq!(trim_history(&history, &[], 0), history);
    }

    #[test]
    fn change_row_shapes() {
        let entry = ChangeEntry {
            seq: SequenceId(7),
            id: "doc".to_string(),
            revs: revs(&["1-a"]),
            deleted: false,
        };
        assert_eq!(change_row(&entry, "1-a"), json!([7, "doc", "1-a"]));

        let tombstone = ChangeEntry {
            deleted: true,
            ..entry
        };
        assert_eq!(
            change_row(&tombstone, "1-a"),
            json!([7, "doc", "1-a", true])
        );
    }

    #[test]
    fn decode_change_row_round_trips() {
        let row = json!([9, "doc", "2-b", true]);
        let (seq, doc_id, rev_id) = decode_change_row(&row).unwrap();
        assert_eq!(seq, SequenceId(9));
        assert_eq!(doc_id, "doc");
        assert_eq!(rev_id, "2-b");
        assert!(decode_change_row(&json!("nope")).is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_the_caught_up_signal() {
        let sender = RecordingSender::new();
        let session = SyncSession::new(
            "peer-1",
            NullDatabase::new(None),
            sender.clone(),
            Arc::new(SyncMetrics::new()),
            SessionConfig::default(),
        );
        send_batch_of_changes(&session, Vec::new()).await.unwrap();

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].profile(), PROFILE_CHANGES);
        assert!(sent[0].no_reply());
        assert_eq!(sent[0].body().as_ref(), b"[]");
    }

    #[tokio::test]
    async fn non_empty_batch_expects_a_reply() {
        let sender = RecordingSender::new();
        let session = SyncSession::new(
            "peer-1",
            NullDatabase::new(None),
            sender.clone(),
            Arc::new(SyncMetrics::new()),
            SessionConfig::default(),
        );
        let rows = vec![json!([1, "a", "1-a"])];
        send_batch_of_changes(&session, rows).await.unwrap();

        let mut sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].no_reply());
        // The reply slot was allocated for the response handler.
        assert!(sent[0].take_reply_sender().is_some());
    }
}
