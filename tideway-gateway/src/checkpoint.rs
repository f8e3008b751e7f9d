//! Checkpoint handlers: per-client resume state in the non-replicated
//! `local` namespace.

use error_stack::Report;
use serde_json::Value;

use tideway_core::{
    BODY_ID, BODY_REV, Body, HandlerError, IncomingMessage, PROP_CLIENT, PROP_REV,
};

use crate::db::{Database, store_error};
use crate::dispatch::Handler;
use crate::messages::SetCheckpointMessage;

const CHECKPOINT_KIND: &str = "local";

fn checkpoint_doc_id(client: &str) -> String {
    format!("checkpoint/{client}")
}

impl<D: Database> Handler<D> {
    pub(crate) async fn handle_get_checkpoint(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let client = rq.property(PROP_CLIENT).unwrap_or_default().to_string();
        self.log_endpoint_entry(rq.profile(), &format!("client:{client}"));

        if rq.no_reply() {
            return Ok(());
        }

        let doc_id = checkpoint_doc_id(&client);
        let value = self
            .db
            .get_special(CHECKPOINT_KIND, &doc_id)
            .await
            .map_err(store_error)?;
        let Some(mut value) = value else {
            return Err(Report::new(HandlerError::not_found("Not Found")));
        };

        let rev = value
            .get(BODY_REV)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        value.remove(BODY_REV);
        value.remove(BODY_ID);

        let response = rq.response().expect("reply expected");
        response.properties.insert(PROP_REV.to_string(), rev);
        response.set_json_body(&value)?;
        Ok(())
    }

    pub(crate) async fn handle_set_checkpoint(
        &mut self,
        rq: &mut IncomingMessage,
    ) -> Result<(), Report<HandlerError>> {
        let message = SetCheckpointMessage::new(rq);
        self.log_endpoint_entry(rq.profile(), &message.to_string());

        let doc_id = checkpoint_doc_id(message.client());

        let mut checkpoint: Body = rq.read_json_body()?;
        if let Some(rev) = message.rev() {
            checkpoint.insert(BODY_REV.to_string(), Value::String(rev.to_string()));
        }

        let new_rev = self
            .db
            .put_special(CHECKPOINT_KIND, &doc_id, checkpoint)
            .await
            .map_err(store_error)?;

        if let Some(response) = rq.response() {
            response.properties.insert(PROP_REV.to_string(), new_rev);
        }
        Ok(())
    }
}
