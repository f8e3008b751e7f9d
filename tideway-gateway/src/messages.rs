//! Typed views over raw protocol messages.
//!
//! Adapters parse lazily and report malformed input through the handler
//! error path; they never panic.

use std::collections::BTreeSet;
use std::fmt;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use tideway_core::{
    HandlerError, IncomingMessage, PROP_ACTIVE_ONLY, PROP_BATCH, PROP_CHANNELS, PROP_CLIENT,
    PROP_COMPRESS, PROP_CONTINUOUS, PROP_DELETED, PROP_DELTA_SRC, PROP_DIGEST, PROP_ERROR,
    PROP_FILTER, PROP_HISTORY, PROP_ID, PROP_NO_CONFLICTS, PROP_REASON, PROP_REV, PROP_SEQUENCE,
    PROP_SINCE,
};

use crate::db::{Database, SequenceId};

const DEFAULT_CHANGES_BATCH_SIZE: usize = 200;

/// Parsed `subChanges` subscription parameters.
#[derive(Debug, Clone)]
pub struct SubChangesParams {
    since: SequenceId,
    batch_size: usize,
    continuous: bool,
    active_only: bool,
    filter: Option<String>,
    channels: Option<String>,
    doc_ids: Vec<String>,
}

#[derive(Deserialize, Default)]
struct SubChangesBody {
    #[serde(rename = "docIDs", default)]
    doc_ids: Vec<String>,
}

impl SubChangesParams {
    /// # Errors
    ///
    /// Returns a client error for an unparseable `since`, `batch`, or body.
    pub fn parse<D: Database>(
        rq: &IncomingMessage,
        db: &D,
    ) -> Result<Self, Report<HandlerError>> {
        let since = match rq.property(PROP_SINCE) {
            Some(raw) => {
                // Clients send the value JSON-encoded, so a plain sequence
                // arrives wrapped in quotes.
                let raw = raw.trim_matches('"');
                db.parse_sequence_id(raw)
                    .change_context(HandlerError::bad_request("invalid since value"))?
            }
            None => db.zero_since(),
        };

        let batch_size = match rq.property(PROP_BATCH) {
            Some(raw) => raw
                .parse::<usize>()
                .change_context(HandlerError::bad_request("invalid batch value"))?
                .max(1),
            None => DEFAULT_CHANGES_BATCH_SIZE,
        };

        let body = if rq.body().is_empty() {
            SubChangesBody::default()
        } else {
            rq.read_json_body()?
        };

        Ok(Self {
            since,
            batch_size,
            continuous: rq.boolean_property(PROP_CONTINUOUS),
            active_only: rq.boolean_property(PROP_ACTIVE_ONLY),
            filter: rq.property(PROP_FILTER).map(str::to_string),
            channels: rq.property(PROP_CHANNELS).map(str::to_string),
            doc_ids: body.doc_ids,
        })
    }

    #[must_use]
    pub fn since(&self) -> SequenceId {
        self.since
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn continuous(&self) -> bool {
        self.continuous
    }

    #[must_use]
    pub fn active_only(&self) -> bool {
        self.active_only
    }

    #[must_use]
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    #[must_use]
    pub fn doc_ids(&self) -> &[String] {
        &self.doc_ids
    }

    /// The requested channel set, expanded from the comma-separated
    /// `channels` property. Empty when the property is missing or names no
    /// channels.
    #[must_use]
    pub fn expanded_channels(&self) -> BTreeSet<String> {
        self.channels
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Display for SubChangesParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "continuous:{} batch:{} since:{} activeOnly:{}",
            self.continuous, self.batch_size, self.since, self.active_only
        )?;
        if let Some(filter) = &self.filter {
            write!(f, " filter:{filter}")?;
        }
        if let Some(channels) = &self.channels {
            write!(f, " channels:{channels}")?;
        }
        if !self.doc_ids.is_empty() {
            write!(f, " docIDs:{}", self.doc_ids.len())?;
        }
        Ok(())
    }
}

/// Typed view over an inbound `rev` message.
pub struct RevMessage<'a>(&'a IncomingMessage);

impl<'a> RevMessage<'a> {
    #[must_use]
    pub fn new(rq: &'a IncomingMessage) -> Self {
        Self(rq)
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0.property(PROP_ID)
    }

    #[must_use]
    pub fn rev(&self) -> Option<&str> {
        self.0.property(PROP_REV)
    }

    #[must_use]
    pub fn deleted(&self) -> bool {
        self.0.boolean_property(PROP_DELETED)
    }

    #[must_use]
    pub fn delta_src(&self) -> Option<&str> {
        self.0.property(PROP_DELTA_SRC).filter(|v| !v.is_empty())
    }

    /// Ancestor revision IDs from the comma-separated `history` property,
    /// most recent first.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.0
            .property(PROP_HISTORY)
            .unwrap_or_default()
            .split(',')
            .filter(|rev| !rev.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn sequence(&self) -> Option<&str> {
        self.0.property(PROP_SEQUENCE)
    }

    /// # Errors
    ///
    /// Returns a client error when the property is present but not a bool.
    pub fn no_conflicts(&self) -> Result<bool, Report<HandlerError>> {
        match self.0.property(PROP_NO_CONFLICTS) {
            None => Ok(false),
            Some(raw) => raw
                .parse::<bool>()
                .change_context(HandlerError::bad_request("Invalid value for noconflicts")),
        }
    }
}

impl fmt::Display for RevMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "doc:{} rev:{}",
            self.id().unwrap_or("?"),
            self.rev().unwrap_or("?")
        )?;
        if self.deleted() {
            f.write_str(" deleted:true")?;
        }
        if let Some(src) = self.delta_src() {
            write!(f, " deltaSrc:{src}")?;
        }
        Ok(())
    }
}

/// Typed view over an inbound `getAttachment` message.
pub struct GetAttachmentParams<'a>(&'a IncomingMessage);

impl<'a> GetAttachmentParams<'a> {
    #[must_use]
    pub fn new(rq: &'a IncomingMessage) -> Self {
        Self(rq)
    }

    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.0.property(PROP_DIGEST).filter(|v| !v.is_empty())
    }

    #[must_use]
    pub fn compress(&self) -> bool {
        self.0.boolean_property(PROP_COMPRESS)
    }
}

impl fmt::Display for GetAttachmentParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "digest:{}", self.digest().unwrap_or("?"))
    }
}

/// Typed view over an inbound `norev` message.
pub struct NoRevMessage<'a>(&'a IncomingMessage);

impl<'a> NoRevMessage<'a> {
    #[must_use]
    pub fn new(rq: &'a IncomingMessage) -> Self {
        Self(rq)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.0.property(PROP_ID).unwrap_or_default()
    }

    #[must_use]
    pub fn rev(&self) -> &str {
        self.0.property(PROP_REV).unwrap_or_default()
    }

    #[must_use]
    pub fn error(&self) -> &str {
        self.0.property(PROP_ERROR).unwrap_or_default()
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        self.0.property(PROP_REASON).unwrap_or_default()
    }
}

/// Typed view over an inbound `setCheckpoint` message.
pub struct SetCheckpointMessage<'a>(&'a IncomingMessage);

impl<'a> SetCheckpointMessage<'a> {
    #[must_use]
    pub fn new(rq: &'a IncomingMessage) -> Self {
        Self(rq)
    }

    #[must_use]
    pub fn client(&self) -> &str {
        self.0.property(PROP_CLIENT).unwrap_or_default()
    }

    #[must_use]
    pub fn rev(&self) -> Option<&str> {
        self.0.property(PROP_REV).filter(|v| !v.is_empty())
    }
}

impl fmt::Display for SetCheckpointMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.client())?;
        if let Some(rev) = self.rev() {
            write!(f, " rev:{rev}")?;
        }
        Ok(())
    }
}
