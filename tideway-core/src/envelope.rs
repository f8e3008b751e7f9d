//! Message envelopes over the multiplexed framed transport.
//!
//! The transport itself (framing, multiplexing, compression on the wire) is
//! an external collaborator; these types are the views the handlers operate
//! on, plus the [`MessageSender`] capability they write responses through.

use std::collections::HashMap;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::error::HandlerError;

/// String-keyed message properties.
pub type Properties = HashMap<String, String>;

/// Failure published onto a paired response. The transport owns the wire
/// encoding; the `HTTP` domain carries the status taxonomy of the handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub domain: String,
    pub code: u16,
    pub message: String,
}

impl WireError {
    #[must_use]
    pub fn http(code: u16, message: impl Into<String>) -> Self {
        Self {
            domain: "HTTP".to_string(),
            code,
            message: message.into(),
        }
    }
}

/// The paired response to an inbound request, filled in by its handler.
#[derive(Debug, Default)]
pub struct Response {
    pub properties: Properties,
    body: Bytes,
    compressed: bool,
    error: Option<WireError>,
}

impl Response {
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// # Errors
    ///
    /// Returns an internal error if the value cannot be serialized.
    pub fn set_json_body<T: Serialize>(&mut self, value: &T) -> Result<(), Report<HandlerError>> {
        let bytes = serde_json::to_vec(value)
            .change_context(HandlerError::internal("failed to encode JSON body"))?;
        self.body = Bytes::from(bytes);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a client error if the body is not valid JSON for `T`.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, Report<HandlerError>> {
        serde_json::from_slice(&self.body)
            .change_context(HandlerError::bad_request("invalid JSON body"))
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        self.compressed = compressed;
    }

    #[must_use]
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn set_error(&mut self, error: WireError) {
        self.error = Some(error);
    }

    #[must_use]
    pub fn error(&self) -> Option<&WireError> {
        self.error.as_ref()
    }
}

/// An inbound request delivered by the transport, owning the reply slot for
/// its paired response.
#[derive(Debug)]
pub struct IncomingMessage {
    profile: String,
    properties: Properties,
    body: Bytes,
    no_reply: bool,
    response: Option<Response>,
    reply_tx: Option<oneshot::Sender<Response>>,
}

impl IncomingMessage {
    /// A request expecting a paired response; the receiver resolves once the
    /// dispatcher finishes the exchange.
    #[must_use]
    pub fn request(
        profile: impl Into<String>,
        properties: Properties,
        body: impl Into<Bytes>,
    ) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let msg = Self {
            profile: profile.into(),
            properties,
            body: body.into(),
            no_reply: false,
            response: Some(Response::default()),
            reply_tx: Some(tx),
        };
        (msg, rx)
    }

    /// A request the peer marked `noReply`.
    #[must_use]
    pub fn no_reply_request(
        profile: impl Into<String>,
        properties: Properties,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            profile: profile.into(),
            properties,
            body: body.into(),
            no_reply: true,
            response: None,
            reply_tx: None,
        }
    }

    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// True iff the property is present and spelled `"true"`.
    #[must_use]
    pub fn boolean_property(&self, key: &str) -> bool {
        self.property(key) == Some("true")
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// # Errors
    ///
    /// Returns a client error if the body is not valid JSON for `T`.
    pub fn read_json_body<T: DeserializeOwned>(&self) -> Result<T, Report<HandlerError>> {
        serde_json::from_slice(&self.body)
            .change_context(HandlerError::bad_request("invalid JSON body"))
    }

    #[must_use]
    pub fn no_reply(&self) -> bool {
        self.no_reply
    }

    /// The paired response under construction; `None` when the peer set
    /// `noReply`.
    pub fn response(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    /// Completes the exchange by handing the response back to the transport.
    pub fn finish(mut self) {
        if let (Some(tx), Some(response)) = (self.reply_tx.take(), self.response.take()) {
            let _ = tx.send(response);
        }
    }
}

/// The peer's reply to an outbound request.
#[derive(Debug, Default)]
pub struct Reply {
    pub properties: Properties,
    pub body: Bytes,
    pub error: Option<WireError>,
}

impl Reply {
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            properties: Properties::new(),
            body: body.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The reply body, or the peer's error if it failed the request.
    ///
    /// # Errors
    ///
    /// Returns the peer's error as a protocol failure.
    pub fn into_body(self) -> Result<Bytes, Report<HandlerError>> {
        match self.error {
            Some(err) => Err(Report::new(HandlerError::new(err.code, err.message))),
            None => Ok(self.body),
        }
    }
}

/// Awaits the peer's reply to an outbound request. Resolves to
/// [`HandlerError::SenderClosed`] if the transport drops the slot.
#[derive(Debug)]
pub struct ReplyHandle(oneshot::Receiver<Reply>);

impl ReplyHandle {
    /// # Errors
    ///
    /// Returns [`HandlerError::SenderClosed`] when the transport closed
    /// before the peer replied.
    pub async fn reply(self) -> Result<Reply, Report<HandlerError>> {
        self.0
            .await
            .map_err(|_| Report::new(HandlerError::SenderClosed))
    }
}

/// An outbound request to the peer.
#[derive(Debug)]
pub struct OutgoingMessage {
    profile: String,
    pub properties: Properties,
    body: Bytes,
    compressed: bool,
    no_reply: bool,
    reply_tx: Option<oneshot::Sender<Reply>>,
}

impl OutgoingMessage {
    #[must_use]
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            properties: Properties::new(),
            body: Bytes::new(),
            compressed: false,
            no_reply: false,
            reply_tx: None,
        }
    }

    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// # Errors
    ///
    /// Returns an internal error if the value cannot be serialized.
    pub fn set_json_body<T: Serialize>(&mut self, value: &T) -> Result<(), Report<HandlerError>> {
        let bytes = serde_json::to_vec(value)
            .change_context(HandlerError::internal("failed to encode JSON body"))?;
        self.body = Bytes::from(bytes);
        Ok(())
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        self.compressed = compressed;
    }

    #[must_use]
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn set_no_reply(&mut self, no_reply: bool) {
        self.no_reply = no_reply;
    }

    #[must_use]
    pub fn no_reply(&self) -> bool {
        self.no_reply
    }

    /// Allocates the reply slot for this request. The transport fulfils it
    /// with the peer's response.
    pub fn expect_reply(&mut self) -> ReplyHandle {
        let (tx, rx) = oneshot::channel();
        self.reply_tx = Some(tx);
        ReplyHandle(rx)
    }

    /// Taken by the transport (or a test harness) to answer the request.
    pub fn take_reply_sender(&mut self) -> Option<oneshot::Sender<Reply>> {
        self.reply_tx.take()
    }
}

/// Outbound half of the transport. `send` returns `false` iff the transport
/// is closed, and returns immediately either way.
pub trait MessageSender: Send + Sync {
    fn send(&self, request: OutgoingMessage) -> bool;
}
