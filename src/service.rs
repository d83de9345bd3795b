//! The delivery engine: pulls feed pages and turns each event into sent
//! email, falling back to minimal notifications when the rich path fails.
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::db::{self, Pool, ThreadStore};
use crate::mail::{DeliveryOutcome, MailTransport, OutgoingEmail};
use crate::render::{Render, RenderError};
use crate::source::FeedSource;
use crate::template::TemplateStore;

/// Which minimal-fallback recipients are still owed an email.
enum FallbackScope {
    /// The rich rendering never produced messages; everyone falls back.
    Everyone,
    /// Rich messages were produced but these recipients' sends permanently
    /// failed; only they fall back.
    Recipients(HashSet<String>),
}

impl FallbackScope {
    fn includes(&self, email: &str) -> bool {
        match self {
            FallbackScope::Everyone => true,
            FallbackScope::Recipients(failed) => failed.contains(email),
        }
    }
}

/// The event's rich context, if it has one.
///
/// Events written before the minimal-context migration carry their context
/// fields at the top level and have no `minimalContext` key; the whole event
/// is the context for those.
// TODO: drop the top-level fallback once the feed migration is complete and
// re-seeded, then `context` alone decides.
fn full_context_of(event: &Value) -> Option<&Value> {
    match event.get("context") {
        Some(context) if !context.is_null() => Some(context),
        _ if event.get("minimalContext").is_none() => Some(event),
        _ => None,
    }
}

fn minimal_context_of(event: &Value) -> Option<&Value> {
    event.get("minimalContext").filter(|context| !context.is_null())
}

/// Fetches feed pages and sends the emails they imply.
///
/// `run` is one poll: it never fails for event-data reasons, only for
/// operational ones (a broken thread store). Feed communication errors leave
/// the position untouched so the next poll retries the same page.
pub struct Pipeline<'a> {
    source: &'a dyn FeedSource,
    render: Render<'a>,
    mail: &'a dyn MailTransport,
    retry_delay: Duration,
    is_dev: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        source: &'a dyn FeedSource,
        template_store: &'a dyn TemplateStore,
        mail: &'a dyn MailTransport,
        retry_delay: Duration,
        is_dev: bool,
    ) -> Self {
        Self {
            source,
            render: Render::new(template_store),
            mail,
            retry_delay,
            is_dev,
        }
    }

    /// Process one feed page starting after `from_key`, returning the new
    /// feed position.
    #[instrument(skip_all, fields(from_key))]
    pub async fn run(&self, thread_store: &mut dyn ThreadStore, from_key: i64) -> Result<i64> {
        let page = match self.source.fetch_next(from_key).await {
            Ok(page) => page,
            Err(err) => {
                error!(
                    error = %err,
                    "failed to fetch from the feed, will retry after the polling delay"
                );
                return Ok(from_key);
            }
        };

        if self.is_dev && page.data.story_errors > 0 {
            error!(
                count = page.data.story_errors,
                "server encountered errors while creating email events"
            );
        }

        let mut sent = 0;
        for event in &page.data.events {
            sent += self.process_event(event, thread_store).await?;
        }
        info!(events = page.data.events.len(), emails = sent, "processed feed page");
        Ok(page.cursor.after)
    }

    /// Turn one event into sent emails, returning how many were delivered.
    ///
    /// Render failures on the rich path fall back to the minimal context for
    /// everyone; permanent send failures fall back only for the recipients
    /// that failed. A failure on the minimal path is terminal and the
    /// messages are lost.
    pub async fn process_event(
        &self,
        event: &Value,
        thread_store: &mut dyn ThreadStore,
    ) -> Result<usize> {
        let Some(timestamp) = event.get("timestamp").and_then(Value::as_i64) else {
            error!("event carries no timestamp, skipping it");
            return Ok(0);
        };
        let is_secure = event
            .get("isSecure")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut sent = 0;
        let mut fallback = Some(FallbackScope::Everyone);

        if let Some(context) = full_context_of(event) {
            match self
                .render
                .process_event_to_emails_with_full_context(
                    is_secure,
                    timestamp,
                    context,
                    thread_store,
                )
                .await
            {
                Ok(emails) => {
                    let total = emails.len();
                    let failed = self.send_emails(&emails).await;
                    sent += total - failed.len();
                    fallback = if failed.is_empty() {
                        None
                    } else {
                        Some(FallbackScope::Recipients(failed.into_iter().collect()))
                    };
                }
                Err(RenderError::Store(err)) => return Err(err),
                Err(err) => {
                    error!(
                        error = %err,
                        "failed to render rich emails for an event, \
                         falling back to minimal notifications"
                    );
                }
            }
        }

        let Some(scope) = fallback else {
            return Ok(sent);
        };
        let Some(minimal_context) = minimal_context_of(event) else {
            warn!("event has no minimal context, nothing to fall back to");
            return Ok(sent);
        };

        match self
            .render
            .process_event_to_emails_with_minimal_context(
                timestamp,
                minimal_context,
                thread_store,
            )
            .await
        {
            Ok(emails) => {
                let emails: Vec<OutgoingEmail> = emails
                    .into_iter()
                    .filter(|email| scope.includes(&email.to))
                    .collect();
                let total = emails.len();
                let failed = self.send_emails(&emails).await;
                sent += total - failed.len();
                if !failed.is_empty() {
                    error!(
                        recipients = failed.len(),
                        "minimal fallback emails permanently failed to send, \
                         those recipients will not be notified"
                    );
                }
            }
            Err(RenderError::Store(err)) => return Err(err),
            Err(err) => {
                error!(
                    error = %err,
                    "failed to render minimal fallback emails, \
                     the event's notifications are lost"
                );
            }
        }
        Ok(sent)
    }

    /// Send each message, blocking on temporary failures until the transport
    /// recovers. Returns the recipients whose messages permanently failed.
    async fn send_emails(&self, emails: &[OutgoingEmail]) -> Vec<String> {
        let mut failed = Vec::new();
        for email in emails {
            loop {
                match self.mail.send(email).await {
                    DeliveryOutcome::Success => break,
                    DeliveryOutcome::TemporaryFailure(reason) => {
                        warn!(
                            to = %email.to,
                            %reason,
                            delay = ?self.retry_delay,
                            "temporary send failure, retrying after delay"
                        );
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    DeliveryOutcome::PermanentFailure(reason) => {
                        error!(
                            to = %email.to,
                            %reason,
                            "permanent send failure, giving up on this message"
                        );
                        failed.push(email.to.clone());
                        break;
                    }
                }
            }
        }
        failed
    }
}

/// Seed the feed position to the current end of the feed.
///
/// Must run exactly once before the worker starts. Refuses to reseed an
/// already-seeded database so a redeploy cannot silently skip events.
pub async fn prepare(pool: &Pool, source: &dyn FeedSource) -> Result<()> {
    let end = source
        .fetch_feed_end()
        .await
        .context("failed to fetch the current feed end")?;
    db::seed_position(pool, end).await?;
    info!(position = end, "seeded feed position");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryThreadStore;
    use crate::source::{FeedError, FeedPage};
    use crate::template::BuiltinTemplates;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every message it is told to send; outcomes can be scripted
    /// per recipient address.
    #[derive(Default)]
    struct RecordingMail {
        sent: Mutex<Vec<OutgoingEmail>>,
        permanent_failures: Vec<String>,
        rich_permanent_failures: Vec<String>,
        temporary_once: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailTransport for RecordingMail {
        async fn send(&self, email: &OutgoingEmail) -> DeliveryOutcome {
            if self.permanent_failures.contains(&email.to) {
                return DeliveryOutcome::PermanentFailure("scripted".to_string());
            }
            if email.template_path != "minimal"
                && self.rich_permanent_failures.contains(&email.to)
            {
                return DeliveryOutcome::PermanentFailure("scripted".to_string());
            }
            let mut temporary = self.temporary_once.lock().unwrap();
            if let Some(position) = temporary.iter().position(|to| to == &email.to) {
                temporary.remove(position);
                return DeliveryOutcome::TemporaryFailure("scripted".to_string());
            }
            drop(temporary);
            self.sent.lock().unwrap().push(email.clone());
            DeliveryOutcome::Success
        }
    }

    struct StaticSource {
        page: FeedPage,
    }

    #[async_trait]
    impl FeedSource for StaticSource {
        async fn fetch_feed_end(&self) -> Result<i64, FeedError> {
            Ok(0)
        }

        async fn fetch_next(&self, _after: i64) -> Result<FeedPage, FeedError> {
            Ok(self.page.clone())
        }
    }

    fn recipient(email: &str, is_actor: bool) -> Value {
        json!({
            "email": email,
            "username": email.split('@').next().unwrap(),
            "timezoneOffset": 0,
            "isActor": is_actor,
        })
    }

    fn commented_event() -> Value {
        json!({
            "isSecure": false,
            "timestamp": 10,
            "context": {
                "eventKind": "revision-commented",
                "actorName": "carol",
                "body": {
                    "author": recipient("author@mail", false),
                    "reviewers": [recipient("reviewer@mail", false)],
                    "subscribers": [],
                    "mainCommentMessage": { "asText": "hm", "asHtml": "<p>hm</p>" },
                    "inlineComments": [],
                    "transactionLink": "link",
                },
                "revision": {
                    "revisionId": 3,
                    "name": "fix the thing",
                    "link": "http://r/D3",
                },
            },
            "minimalContext": {
                "revision": { "revisionId": 3, "link": "http://r/D3" },
                "recipients": [
                    recipient("author@mail", false),
                    recipient("reviewer@mail", false),
                ],
            },
        })
    }

    fn pipeline<'a>(
        source: &'a StaticSource,
        templates: &'a BuiltinTemplates,
        mail: &'a RecordingMail,
    ) -> Pipeline<'a> {
        Pipeline::new(source, templates, mail, Duration::from_millis(1), false)
    }

    fn noop_source() -> StaticSource {
        StaticSource {
            page: FeedPage {
                data: crate::source::FeedData {
                    events: vec![],
                    story_errors: 0,
                },
                cursor: crate::source::Cursor { after: 0 },
            },
        }
    }

    #[tokio::test]
    async fn sends_rich_emails_when_everything_works() {
        let source = noop_source();
        let templates = BuiltinTemplates;
        let mail = RecordingMail::default();
        let pipeline = pipeline(&source, &templates, &mail);
        let mut store = MemoryThreadStore::new();

        let sent = pipeline
            .process_event(&commented_event(), &mut store)
            .await
            .unwrap();

        assert_eq!(sent, 2);
        let messages = mail.sent.lock().unwrap();
        assert!(messages.iter().all(|m| m.subject == "D3: fix the thing"));
    }

    #[tokio::test]
    async fn falls_back_to_minimal_when_rich_rendering_fails() {
        let source = noop_source();
        let templates = BuiltinTemplates;
        let mail = RecordingMail::default();
        let pipeline = pipeline(&source, &templates, &mail);
        let mut store = MemoryThreadStore::new();

        let mut event = commented_event();
        event["context"]["body"] = json!({ "broken": true });
        let sent = pipeline.process_event(&event, &mut store).await.unwrap();

        assert_eq!(sent, 2);
        let messages = mail.sent.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.template_path == "minimal"));
        assert!(messages.iter().all(|m| m.subject == "D3"));
    }

    #[tokio::test]
    async fn scopes_fallback_to_permanently_failed_recipients() {
        let source = noop_source();
        let templates = BuiltinTemplates;
        let mail = RecordingMail {
            rich_permanent_failures: vec!["author@mail".to_string()],
            ..Default::default()
        };
        let pipeline = pipeline(&source, &templates, &mail);
        let mut store = MemoryThreadStore::new();

        let sent = pipeline
            .process_event(&commented_event(), &mut store)
            .await
            .unwrap();

        // The reviewer got the rich email and must not get a second,
        // minimal one; only the author falls back.
        assert_eq!(sent, 2);
        let messages = mail.sent.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].to, "reviewer@mail");
        assert_eq!(messages[0].template_path, "public/commented");
        assert_eq!(messages[1].to, "author@mail");
        assert_eq!(messages[1].template_path, "minimal");
    }

    #[tokio::test]
    async fn retries_temporary_failures_until_success() {
        let source = noop_source();
        let templates = BuiltinTemplates;
        let mail = RecordingMail {
            temporary_once: Mutex::new(vec!["author@mail".to_string()]),
            ..Default::default()
        };
        let pipeline = pipeline(&source, &templates, &mail);
        let mut store = MemoryThreadStore::new();

        let sent = pipeline
            .process_event(&commented_event(), &mut store)
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(mail.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn event_without_any_context_sends_minimal_only() {
        let source = noop_source();
        let templates = BuiltinTemplates;
        let mail = RecordingMail::default();
        let pipeline = pipeline(&source, &templates, &mail);
        let mut store = MemoryThreadStore::new();

        let mut event = commented_event();
        event["context"] = Value::Null;
        let sent = pipeline.process_event(&event, &mut store).await.unwrap();

        assert_eq!(sent, 2);
        let messages = mail.sent.lock().unwrap();
        assert!(messages.iter().all(|m| m.template_path == "minimal"));
    }

    #[tokio::test]
    async fn legacy_event_without_minimal_context_is_skipped_when_broken() {
        let source = noop_source();
        let templates = BuiltinTemplates;
        let mail = RecordingMail::default();
        let pipeline = pipeline(&source, &templates, &mail);
        let mut store = MemoryThreadStore::new();

        // No minimalContext key: the event itself is treated as a rich
        // context, fails to parse, and there is nothing to fall back to.
        let event = json!({ "timestamp": 5 });
        let sent = pipeline.process_event(&event, &mut store).await.unwrap();

        assert_eq!(sent, 0);
        assert!(mail.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_returns_cursor_and_feed_errors_keep_position() {
        let templates = BuiltinTemplates;
        let mail = RecordingMail::default();
        let mut store = MemoryThreadStore::new();

        let source = StaticSource {
            page: FeedPage {
                data: crate::source::FeedData {
                    events: vec![],
                    story_errors: 0,
                },
                cursor: crate::source::Cursor { after: 20 },
            },
        };
        let pipeline = pipeline(&source, &templates, &mail);
        assert_eq!(pipeline.run(&mut store, 10).await.unwrap(), 20);

        struct FailingSource;
        #[async_trait]
        impl FeedSource for FailingSource {
            async fn fetch_feed_end(&self) -> Result<i64, FeedError> {
                Err(FeedError::Api {
                    code: "down".to_string(),
                    info: String::new(),
                })
            }
            async fn fetch_next(&self, _after: i64) -> Result<FeedPage, FeedError> {
                Err(FeedError::Api {
                    code: "down".to_string(),
                    info: String::new(),
                })
            }
        }
        let failing = FailingSource;
        let pipeline = Pipeline::new(
            &failing,
            &templates,
            &mail,
            Duration::from_millis(1),
            false,
        );
        assert_eq!(pipeline.run(&mut store, 10).await.unwrap(), 10);
    }
}
