//! Attachment subprotocol: serving known blobs, verifying peer possession,
//! and requesting unknown blobs.

use error_stack::{Report, ResultExt};
use tracing::{debug, info, warn};

use tideway_core::{
    Body, HandlerError, IncomingMessage, OutgoingMessage, PROFILE_GET_ATTACHMENT,
    PROFILE_PROVE_ATTACHMENT, PROP_COMPRESS, PROP_DIGEST, proof,
};

use crate::db::{Database, StubAttachment, store_error};
use crate::dispatch::Handler;
use crate::messages::GetAttachmentParams;

impl<D: Database> Handler<D> {
    /// Serves an attachment the pull engine previously announced. Digests
    /// outside the allowed set are refused: the peer only gets blobs
    /// reachable through revisions it is being sent.
    pub(crate) async fn handle_get_attachment(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let params = GetAttachmentParams::new(rq);
        self.log_endpoint_entry(rq.profile(), &params.to_string());

        let Some(digest) = params.digest() else {
            return Err(Report::new(HandlerError::bad_request("Missing 'digest'")));
        };
        if !self.session.is_attachment_allowed(digest) {
            return Err(Report::new(HandlerError::forbidden(
                "Attachment's document not being synced",
            )));
        }

        let attachment = self.db.get_attachment(digest).await.map_err(store_error)?;
        debug!(digest, size = attachment.len(), "sending attachment");

        let compress = params.compress();
        if let Some(response) = rq.response() {
            response.set_compressed(compress);
            response.set_body(attachment.clone());
        }

        self.session.metrics().attachments_pulled_total.inc();
        self.session
            .metrics()
            .attachment_pull_bytes_total
            .inc_by(attachment.len() as u64);
        Ok(())
    }

    /// The peer asks us to prove we hold an attachment: it sends a nonce,
    /// we answer with the possession proof over our copy.
    pub(crate) async fn handle_prove_attachment(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let digest = rq
            .property(PROP_DIGEST)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Report::new(HandlerError::bad_request("Missing 'digest'")))?
            .to_string();
        self.log_endpoint_entry(rq.profile(), &format!("digest:{digest}"));

        let nonce = rq.body().clone();
        if nonce.is_empty() {
            return Err(Report::new(HandlerError::bad_request("Missing nonce")));
        }

        let data = self.db.get_attachment(&digest).await.map_err(|report| {
            report.change_context(HandlerError::not_found(format!(
                "no attachment with digest {digest}"
            )))
        })?;

        let computed = proof::prove(&nonce, &data);
        if let Some(response) = rq.response() {
            response.set_body(computed.into_bytes());
        }
        Ok(())
    }

    /// Resolves every stub attachment in a pushed revision body, blocking
    /// until all are settled. Known blobs are challenged for possession;
    /// unknown blobs are downloaded and verified against their digest.
    pub(crate) async fn download_or_verify_attachments(
        &mut self,
        body: &Body,
        min_revpos: u64,
        doc_id: &str,
    ) -> Result<(), Report<HandlerError>> {
        let stubs = self
            .db
            .stub_attachments(body, min_revpos)
            .await
            .map_err(store_error)?;

        for stub in stubs {
            match &stub.known_data {
                Some(known) => self.verify_attachment(&stub, known, doc_id).await?,
                None => {
                    let data = self.request_attachment(&stub, doc_id).await?;
                    self.db
                        .store_attachment(&stub.digest, data)
                        .await
                        .map_err(store_error)?;
                }
            }
        }
        Ok(())
    }

    /// We hold the bytes already, but the peer must prove it does too;
    /// otherwise knowing a digest would be enough to read the blob back
    /// out of a later pull.
    async fn verify_attachment(
        &mut self,
        stub: &StubAttachment,
        known: &[u8],
        doc_id: &str,
    ) -> Result<(), Report<HandlerError>> {
        debug!(name = %stub.name, doc = doc_id, digest = %stub.digest, "verifying attachment");

        let (nonce, expected_proof) = proof::generate_proof(known);
        let mut outrq = OutgoingMessage::new(PROFILE_PROVE_ATTACHMENT);
        outrq.set_property(PROP_DIGEST, &stub.digest);
        outrq.set_body(nonce.to_vec());
        let reply = outrq.expect_reply();
        if !self.session.send_message(outrq) {
            return Err(Report::new(HandlerError::SenderClosed));
        }

        let reply_body = reply
            .reply()
            .await?
            .into_body()
            .attach_with(|| format!("proveAttachment failed for doc {doc_id}"))?;
        if reply_body.as_ref() != expected_proof.as_bytes() {
            warn!(digest = %stub.digest, doc = doc_id, "incorrect attachment proof");
            return Err(Report::new(HandlerError::forbidden(format!(
                "Incorrect proof for attachment {}",
                stub.digest
            ))));
        }
        info!(digest = %stub.digest, doc = doc_id, "attachment possession proved");
        Ok(())
    }

    /// We do not hold the bytes; request them and verify length + digest
    /// before they are stored.
    async fn request_attachment(
        &mut self,
        stub: &StubAttachment,
        doc_id: &str,
    ) -> Result<bytes::Bytes, Report<HandlerError>> {
        debug!(name = %stub.name, doc = doc_id, digest = %stub.digest, "requesting attachment");

        let mut outrq = OutgoingMessage::new(PROFILE_GET_ATTACHMENT);
        outrq.set_property(PROP_DIGEST, &stub.digest);
        if is_compressible(stub) {
            outrq.set_property(PROP_COMPRESS, "true");
        }
        let reply = outrq.expect_reply();
        if !self.session.send_message(outrq) {
            return Err(Report::new(HandlerError::SenderClosed));
        }

        let data = reply.reply().await?.into_body()?;

        let length_ok = stub
            .length
            .is_some_and(|expected| data.len() as u64 == expected);
        if !length_ok || proof::digest_key(&data) != stub.digest {
            return Err(Report::new(HandlerError::bad_request(format!(
                "Incorrect data sent for attachment with digest: {}",
                stub.digest
            ))));
        }
        Ok(data)
    }
}

/// Whether transfer compression is worth requesting, by content type.
/// Already-compressed media formats are shipped as-is.
fn is_compressible(stub: &StubAttachment) -> bool {
    let Some(content_type) = stub.content_type.as_deref() else {
        return true;
    };
    let content_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if content_type == "image/svg+xml" {
        return true;
    }
    if let Some(prefix) = content_type.split('/').next()
        && matches!(prefix, "image" | "audio" | "video")
    {
        return false;
    }
    !matches!(
        content_type.as_str(),
        "application/zip"
            | "application/gzip"
            | "application/x-gzip"
            | "application/x-compressed"
            | "application/pdf"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(content_type: Option<&str>) -> StubAttachment {
        StubAttachment {
            name: "att".to_string(),
            digest: "sha1-xyz".to_string(),
            known_data: None,
            length: Some(4),
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn text_like_content_is_compressible() {
        assert!(is_compressible(&stub(None)));
        assert!(is_compressible(&stub(Some("text/plain"))));
        assert!(is_compressible(&stub(Some("application/json; charset=utf-8"))));
        assert!(is_compressible(&stub(Some("image/svg+xml"))));
    }

    #[test]
    fn compressed_media_is_not_recompressed() {
        assert!(!is_compressible(&stub(Some("image/jpeg"))));
        assert!(!is_compressible(&stub(Some("video/mp4"))));
        assert!(!is_compressible(&stub(Some("audio/mpeg"))));
        assert!(!is_compressible(&stub(Some("application/zip"))));
        assert!(!is_compressible(&stub(Some("application/pdf"))));
    }
}
