use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;

use review_emails::db::MemoryThreadStore;
use review_emails::mail::{DeliveryOutcome, MailTransport, OutgoingEmail};
use review_emails::service::Pipeline;
use review_emails::source::{Cursor, FeedData, FeedError, FeedPage, FeedSource};
use review_emails::template::BuiltinTemplates;

#[derive(Default)]
struct RecordingMail {
    sent: Mutex<Vec<OutgoingEmail>>,
}

#[async_trait]
impl MailTransport for RecordingMail {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryOutcome {
        self.sent.lock().unwrap().push(email.clone());
        DeliveryOutcome::Success
    }
}

struct EmptySource;

#[async_trait]
impl FeedSource for EmptySource {
    async fn fetch_feed_end(&self) -> Result<i64, FeedError> {
        Ok(0)
    }

    async fn fetch_next(&self, after: i64) -> Result<FeedPage, FeedError> {
        Ok(FeedPage {
            data: FeedData {
                events: vec![],
                story_errors: 0,
            },
            cursor: Cursor { after },
        })
    }
}

fn recipient(email: &str, is_actor: bool) -> Value {
    json!({
        "email": email,
        "username": email.split('@').next().unwrap(),
        "timezoneOffset": -25200,
        "isActor": is_actor,
    })
}

fn reviewer(name: &str, status: &str, email: &str) -> Value {
    json!({
        "name": name,
        "isActionable": true,
        "status": status,
        "recipients": [recipient(email, false)],
    })
}

/// A secure "reclaimed" event with two individual reviewers, one of whom is
/// also subscribed.
fn secure_reclaimed_event() -> Value {
    json!({
        "isSecure": true,
        "timestamp": 1_600_000_000,
        "context": {
            "eventKind": "revision-reclaimed",
            "actorName": "eve",
            "body": {
                "reviewers": [
                    reviewer("alice", "accepted", "alice@mail"),
                    reviewer("bob", "requested-changes", "bob@mail"),
                ],
                "subscribers": [recipient("bob@mail", false)],
                "commentCount": 0,
                "transactionLink": "http://r/D1#1",
            },
            "revision": {
                "revisionId": 1,
                "link": "http://r/D1",
                "bug": { "bugId": 99, "link": "http://bug/99" },
            },
        },
        "minimalContext": {
            "revision": { "revisionId": 1, "link": "http://r/D1" },
            "recipients": [
                recipient("alice@mail", false),
                recipient("bob@mail", false),
            ],
        },
    })
}

#[tokio::test]
async fn secure_reclaimed_event_notifies_each_recipient_once() {
    let source = EmptySource;
    let templates = BuiltinTemplates;
    let mail = RecordingMail::default();
    let pipeline = Pipeline::new(
        &source,
        &templates,
        &mail,
        Duration::from_millis(1),
        false,
    );
    let mut store = MemoryThreadStore::new();

    let sent = pipeline
        .process_event(&secure_reclaimed_event(), &mut store)
        .await
        .unwrap();

    // Bob is both a reviewer and a subscriber but gets exactly one email.
    assert_eq!(sent, 2);
    let messages = mail.sent.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].to, "alice@mail");
    assert_eq!(messages[1].to, "bob@mail");
    for message in messages.iter() {
        assert_eq!(message.subject, "D1: (secure bug 99)");
        assert_eq!(message.threading_key, "D1");
    }
}

#[tokio::test]
async fn malformed_full_context_falls_back_to_minimal_for_everyone() {
    let source = EmptySource;
    let templates = BuiltinTemplates;
    let mail = RecordingMail::default();
    let pipeline = Pipeline::new(
        &source,
        &templates,
        &mail,
        Duration::from_millis(1),
        false,
    );
    let mut store = MemoryThreadStore::new();

    let mut event = secure_reclaimed_event();
    event["context"]["eventKind"] = json!("revision-imploded");
    let sent = pipeline.process_event(&event, &mut store).await.unwrap();

    assert_eq!(sent, 2);
    let messages = mail.sent.lock().unwrap();
    assert_eq!(messages.len(), 2);
    for message in messages.iter() {
        assert_eq!(message.template_path, "minimal");
        assert_eq!(message.subject, "D1");
        assert_eq!(message.actor, None);
    }
}

#[tokio::test]
async fn actor_never_receives_email_on_either_path() {
    let source = EmptySource;
    let templates = BuiltinTemplates;
    let mail = RecordingMail::default();
    let pipeline = Pipeline::new(
        &source,
        &templates,
        &mail,
        Duration::from_millis(1),
        false,
    );
    let mut store = MemoryThreadStore::new();

    let mut event = secure_reclaimed_event();
    event["context"]["body"]["subscribers"] = json!([recipient("eve@mail", true)]);
    event["minimalContext"]["recipients"] = json!([
        recipient("eve@mail", true),
        recipient("alice@mail", false),
    ]);

    pipeline.process_event(&event, &mut store).await.unwrap();
    let mut broken = secure_reclaimed_event();
    broken["context"] = Value::Null;
    broken["minimalContext"]["recipients"] = json!([recipient("eve@mail", true)]);
    pipeline.process_event(&broken, &mut store).await.unwrap();

    let messages = mail.sent.lock().unwrap();
    assert!(messages.iter().all(|m| m.to != "eve@mail"));
}
