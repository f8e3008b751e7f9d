//! Replication metrics, injected into each session as a shared sink.

use measured::{Counter, Gauge, MetricGroup};

#[derive(MetricGroup)]
#[metric(new())]
pub struct SyncMetrics {
    /// Continuous pull replications currently running.
    pub pull_active_continuous: Gauge,
    /// One-shot pull replications currently running.
    pub pull_active_one_shot: Gauge,
    pub pull_total_continuous: Counter,
    pub pull_total_one_shot: Counter,

    /// Change rows offered by peers via `changes`/`proposeChanges`.
    pub propose_changes_total: Counter,

    pub deltas_requested_total: Counter,
    pub deltas_sent_total: Counter,
    /// Revisions pushed to us as deltas and patched locally.
    pub delta_docs_pushed_total: Counter,

    pub docs_pushed_total: Counter,
    pub doc_push_bytes_total: Counter,

    pub attachments_pulled_total: Counter,
    pub attachment_pull_bytes_total: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let metrics = SyncMetrics::new();
        metrics.docs_pushed_total.inc();
        metrics.doc_push_bytes_total.inc_by(128);
        metrics.pull_active_continuous.inc();
        metrics.pull_active_continuous.dec();
    }
}
