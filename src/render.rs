//! Transforms a raw feed event into the emails it triggers.
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::db::ThreadStore;
use crate::events::{
    parse_body, EventKind, MinimalRevision, ParseError, Recipient, Revision, SecureRevision,
};
use crate::mail::OutgoingEmail;
use crate::mailbatch::{fan_out, MailBatch};
use crate::template::{TemplateError, TemplateStore};

/// Failure while turning an event into emails.
///
/// `Parse` and `Template` are event-data errors and feed the fallback path.
/// `Store` means the counter store itself failed and must propagate: it is
/// an operational fault, not a property of the event.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("thread store failure: {0}")]
    Store(anyhow::Error),
}

fn required<'a>(context: &'a Value, field: &'static str) -> Result<&'a Value, ParseError> {
    context.get(field).ok_or(ParseError::MissingField(field))
}

fn required_str<'a>(context: &'a Value, field: &'static str) -> Result<&'a str, ParseError> {
    required(context, field)?
        .as_str()
        .ok_or(ParseError::MissingField(field))
}

/// Renders events into outgoing emails, bumping the per-revision thread
/// counter exactly once per event regardless of recipient count.
pub struct Render<'a> {
    template_store: &'a dyn TemplateStore,
}

impl<'a> Render<'a> {
    pub fn new(template_store: &'a dyn TemplateStore) -> Self {
        Self { template_store }
    }

    /// Turn the full structured context into outgoing emails.
    pub async fn process_event_to_emails_with_full_context(
        &self,
        is_secure: bool,
        timestamp: i64,
        context: &Value,
        thread_store: &mut dyn ThreadStore,
    ) -> Result<Vec<OutgoingEmail>, RenderError> {
        let actor_name = required_str(context, "actorName")?;
        let kind_str = required_str(context, "eventKind")?;
        let raw_body = required(context, "body")?;
        let kind = EventKind::detect(kind_str, raw_body)?;

        let mut batch = MailBatch::new(self.template_store);
        let body = parse_body(kind, is_secure, raw_body)?;
        fan_out(&body, &mut batch);

        let raw_revision = required(context, "revision")?;
        if is_secure {
            let revision: SecureRevision = serde_json::from_value(raw_revision.clone())
                .map_err(ParseError::Invalid)?;
            let unique_number = thread_store
                .bump(revision.id)
                .await
                .map_err(RenderError::Store)?;
            Ok(batch.process_secure(&revision, actor_name, unique_number, timestamp, &body)?)
        } else {
            let revision: Revision = serde_json::from_value(raw_revision.clone())
                .map_err(ParseError::Invalid)?;
            let unique_number = thread_store
                .bump(revision.id)
                .await
                .map_err(RenderError::Store)?;
            Ok(batch.process(&revision, actor_name, unique_number, timestamp, &body)?)
        }
    }

    /// Turn the minimal fallback context into outgoing emails: one generic
    /// message per non-actor recipient, no author/reviewer distinction.
    pub async fn process_event_to_emails_with_minimal_context(
        &self,
        timestamp: i64,
        minimal_context: &Value,
        thread_store: &mut dyn ThreadStore,
    ) -> Result<Vec<OutgoingEmail>, RenderError> {
        let revision: MinimalRevision =
            serde_json::from_value(required(minimal_context, "revision")?.clone())
                .map_err(ParseError::Invalid)?;
        let recipients: Vec<Recipient> =
            serde_json::from_value(required(minimal_context, "recipients")?.clone())
                .map_err(ParseError::Invalid)?;

        let unique_number = thread_store
            .bump(revision.id)
            .await
            .map_err(RenderError::Store)?;

        let mut emails = Vec::new();
        for recipient in recipients {
            if recipient.is_actor {
                continue;
            }

            let mut params = Map::new();
            params.insert("revision".to_string(), json!(revision));
            params.insert(
                "recipient_username".to_string(),
                json!(recipient.username),
            );
            params.insert("unique_number".to_string(), json!(unique_number));
            params.insert("event".to_string(), minimal_context.clone());
            let rendered = self.template_store.render("minimal", &params)?;

            emails.push(OutgoingEmail {
                template_path: "minimal".to_string(),
                subject: format!("D{}", revision.id),
                to: recipient.email,
                timestamp,
                threading_key: format!("D{}", revision.id),
                html_body: rendered.html,
                text_body: rendered.text,
                actor: None,
            });
        }
        Ok(emails)
    }
}
