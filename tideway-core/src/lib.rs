//! Wire-facing types shared by the gateway's replication handlers.

#![warn(clippy::pedantic)]

pub mod delta;
pub mod envelope;
pub mod error;
pub mod proof;

pub use envelope::{
    IncomingMessage, MessageSender, OutgoingMessage, Properties, Reply, ReplyHandle, Response,
    WireError,
};
pub use error::HandlerError;

/// A parsed JSON document body.
pub type Body = serde_json::Map<String, serde_json::Value>;

// Message profiles (verbs), bit-exact with the replication wire protocol.
pub const PROFILE_GET_CHECKPOINT: &str = "getCheckpoint";
pub const PROFILE_SET_CHECKPOINT: &str = "setCheckpoint";
pub const PROFILE_SUB_CHANGES: &str = "subChanges";
pub const PROFILE_CHANGES: &str = "changes";
pub const PROFILE_PROPOSE_CHANGES: &str = "proposeChanges";
pub const PROFILE_REV: &str = "rev";
pub const PROFILE_NO_REV: &str = "norev";
pub const PROFILE_GET_ATTACHMENT: &str = "getAttachment";
pub const PROFILE_PROVE_ATTACHMENT: &str = "proveAttachment";

// Message property keys.
pub const PROP_CLIENT: &str = "client";
pub const PROP_REV: &str = "rev";
pub const PROP_ID: &str = "id";
pub const PROP_SINCE: &str = "since";
pub const PROP_BATCH: &str = "batch";
pub const PROP_CONTINUOUS: &str = "continuous";
pub const PROP_ACTIVE_ONLY: &str = "active_only";
pub const PROP_FILTER: &str = "filter";
pub const PROP_CHANNELS: &str = "channels";
pub const PROP_DELETED: &str = "deleted";
pub const PROP_HISTORY: &str = "history";
pub const PROP_DELTA_SRC: &str = "deltaSrc";
pub const PROP_NO_CONFLICTS: &str = "noconflicts";
pub const PROP_SEQUENCE: &str = "sequence";
pub const PROP_DIGEST: &str = "digest";
pub const PROP_COMPRESS: &str = "compress";
pub const PROP_ERROR: &str = "error";
pub const PROP_REASON: &str = "reason";
pub const PROP_DELTAS: &str = "deltas";
pub const PROP_MAX_HISTORY: &str = "maxHistory";

// Testing-only acknowledgement pair used by the `norev` handler.
pub const PROP_SHOW_HANDLER: &str = "showHandler";
pub const PROP_HANDLER: &str = "handler";

/// The only supported change filter.
pub const BY_CHANNEL_FILTER: &str = "sync_gateway/bychannel";

// Reserved body keys, stripped from or injected into business bodies.
pub const BODY_ID: &str = "_id";
pub const BODY_REV: &str = "_rev";
pub const BODY_DELETED: &str = "_deleted";
pub const BODY_ATTACHMENTS: &str = "_attachments";
pub const BODY_EXPIRY: &str = "_exp";
