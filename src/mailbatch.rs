//! Fan-out of a single feed event into per-recipient email targets.
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::events::{EventBody, ExistenceChange, Recipient, Reviewer};
use crate::mail::OutgoingEmail;
use crate::template::{TemplateError, TemplateStore};

const PUBLIC_TEMPLATE_PATH_PREFIX: &str = "public/";
const SECURE_TEMPLATE_PATH_PREFIX: &str = "secure/";

/// Parameters to create an email for a specific recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub template_path: String,
    pub recipient_email: String,
    pub recipient_username: String,
    pub params: Map<String, Value>,
}

/// Creates several outgoing emails from a single feed event.
///
/// Most events trigger multiple emails from the same source data. For
/// example, if a reviewer accepts a revision, the author and all the other
/// reviewers are notified. Different recipients may receive different
/// templates, but they are all parameterized by the same event.
///
/// Each email address is targeted at most once per batch: re-registering an
/// address overwrites its template and parameters but keeps the position of
/// the first registration, so iteration order is stable.
pub struct MailBatch<'a> {
    template_store: &'a dyn TemplateStore,
    targets: Vec<Target>,
    index: HashMap<String, usize>,
}

impl<'a> MailBatch<'a> {
    pub fn new(template_store: &'a dyn TemplateStore) -> Self {
        Self {
            template_store,
            targets: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register another email to be sent for the current event.
    ///
    /// No-op when the recipient is absent or is the event's actor: nobody is
    /// notified about their own action.
    pub fn target(
        &mut self,
        recipient: Option<&Recipient>,
        template_path: &str,
        mut params: Map<String, Value>,
    ) {
        let Some(recipient) = recipient else { return };
        if recipient.is_actor {
            return;
        }

        params.insert(
            "recipient_timezone".to_string(),
            json!(recipient.timezone().to_string()),
        );
        let target = Target {
            template_path: template_path.to_string(),
            recipient_email: recipient.email.clone(),
            recipient_username: recipient.username.clone(),
            params,
        };

        match self.index.get(&recipient.email) {
            Some(&position) => self.targets[position] = target,
            None => {
                self.index
                    .insert(recipient.email.clone(), self.targets.len());
                self.targets.push(target);
            }
        }
    }

    /// Register the same template for every provided recipient.
    pub fn target_many(
        &mut self,
        recipients: &[Recipient],
        template_path: &str,
        params: Map<String, Value>,
    ) {
        for recipient in recipients {
            self.target(Some(recipient), template_path, params.clone());
        }
    }

    fn render_target(
        &self,
        target: &Target,
        subject: &str,
        template_path: &str,
        threading_key: &str,
        actor_name: &str,
        unique_number: i64,
        timestamp: i64,
        revision: Value,
        event: &EventBody,
    ) -> Result<OutgoingEmail, TemplateError> {
        let mut params = Map::new();
        params.insert("revision".to_string(), revision);
        params.insert("actor_name".to_string(), json!(actor_name));
        params.insert(
            "recipient_username".to_string(),
            json!(target.recipient_username),
        );
        params.insert("unique_number".to_string(), json!(unique_number));
        params.insert("event".to_string(), json!(event));
        for (key, value) in &target.params {
            params.insert(key.clone(), value.clone());
        }

        let rendered = self.template_store.render(template_path, &params)?;
        Ok(OutgoingEmail {
            template_path: template_path.to_string(),
            subject: subject.to_string(),
            to: target.recipient_email.clone(),
            timestamp,
            threading_key: threading_key.to_string(),
            html_body: rendered.html,
            text_body: rendered.text,
            actor: Some(actor_name.to_string()),
        })
    }

    /// Render all targets with the provided public event parameters.
    pub fn process(
        &self,
        revision: &crate::events::Revision,
        actor_name: &str,
        unique_number: i64,
        timestamp: i64,
        event: &EventBody,
    ) -> Result<Vec<OutgoingEmail>, TemplateError> {
        // The subject identifies the revision by monogram: "D2: <name>".
        let subject = format!("D{}: {}", revision.id, revision.name);
        let threading_key = format!("D{}", revision.id);
        self.targets
            .iter()
            .map(|target| {
                self.render_target(
                    target,
                    &subject,
                    &format!("{PUBLIC_TEMPLATE_PATH_PREFIX}{}", target.template_path),
                    &threading_key,
                    actor_name,
                    unique_number,
                    timestamp,
                    json!(revision),
                    event,
                )
            })
            .collect()
    }

    /// Render all targets with the provided secure event parameters.
    pub fn process_secure(
        &self,
        revision: &crate::events::SecureRevision,
        actor_name: &str,
        unique_number: i64,
        timestamp: i64,
        event: &EventBody,
    ) -> Result<Vec<OutgoingEmail>, TemplateError> {
        // The revision name might identify the security issue, so the
        // subject only carries the bug ID.
        let subject = format!("D{}: (secure bug {})", revision.id, revision.bug.id);
        let threading_key = format!("D{}", revision.id);
        self.targets
            .iter()
            .map(|target| {
                self.render_target(
                    target,
                    &subject,
                    &format!("{SECURE_TEMPLATE_PATH_PREFIX}{}", target.template_path),
                    &threading_key,
                    actor_name,
                    unique_number,
                    timestamp,
                    json!(revision),
                    event,
                )
            })
            .collect()
    }

    #[cfg(test)]
    fn registered_targets(&self) -> &[Target] {
        &self.targets
    }
}

fn reviewer_params(reviewer: &Reviewer) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("reviewer".to_string(), json!(reviewer));
    params
}

/// Route a parsed event body onto its fan-out targets.
///
/// This is the single table deciding who is notified with which template
/// for every event kind.
pub fn fan_out(body: &EventBody, batch: &mut MailBatch<'_>) {
    match body {
        EventBody::Accepted(body) => {
            batch.target(body.author.as_ref(), "accepted-as-author", Map::new());
            batch.target_many(&body.reviewers, "accepted", Map::new());
            batch.target_many(&body.subscribers, "accepted", Map::new());
        }
        EventBody::SecureAccepted(body) => {
            batch.target(body.author.as_ref(), "accepted-as-author", Map::new());
            batch.target_many(&body.reviewers, "accepted", Map::new());
            batch.target_many(&body.subscribers, "accepted", Map::new());
        }
        EventBody::Commented(body) => {
            batch.target(body.author.as_ref(), "commented", Map::new());
            batch.target_many(&body.reviewers, "commented", Map::new());
            batch.target_many(&body.subscribers, "commented", Map::new());
        }
        EventBody::SecureCommented(body) => {
            batch.target(body.author.as_ref(), "commented", Map::new());
            batch.target_many(&body.reviewers, "commented", Map::new());
            batch.target_many(&body.subscribers, "commented", Map::new());
        }
        EventBody::Closed(body) => {
            batch.target(body.author.as_ref(), "closed", Map::new());
            batch.target_many(&body.reviewers, "closed", Map::new());
            batch.target_many(&body.subscribers, "closed", Map::new());
        }
        EventBody::SecureClosed(body) => {
            batch.target(body.author.as_ref(), "closed", Map::new());
            batch.target_many(&body.reviewers, "closed", Map::new());
            batch.target_many(&body.subscribers, "closed", Map::new());
        }
        EventBody::Landed(body) => {
            batch.target(body.author.as_ref(), "landed", Map::new());
            batch.target_many(&body.reviewers, "landed", Map::new());
            batch.target_many(&body.subscribers, "landed", Map::new());
        }
        EventBody::SecureLanded(body) => {
            batch.target(body.author.as_ref(), "landed", Map::new());
            batch.target_many(&body.reviewers, "landed", Map::new());
            batch.target_many(&body.subscribers, "landed", Map::new());
        }
        EventBody::CommentPinged(body) => {
            batch.target(Some(&body.recipient), "pinged", Map::new());
        }
        EventBody::SecureCommentPinged(body) => {
            batch.target(Some(&body.recipient), "pinged", Map::new());
        }
        EventBody::RequestedChanges(body) => {
            batch.target(
                body.author.as_ref(),
                "requested-changes-as-author",
                Map::new(),
            );
            batch.target_many(&body.reviewers, "requested-changes", Map::new());
            batch.target_many(&body.subscribers, "requested-changes", Map::new());
        }
        EventBody::SecureRequestedChanges(body) => {
            batch.target(
                body.author.as_ref(),
                "requested-changes-as-author",
                Map::new(),
            );
            batch.target_many(&body.reviewers, "requested-changes", Map::new());
            batch.target_many(&body.subscribers, "requested-changes", Map::new());
        }
        EventBody::RequestedReview(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "requested-review-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "requested-review", Map::new());
        }
        EventBody::SecureRequestedReview(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "requested-review-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "requested-review", Map::new());
        }
        EventBody::Updated(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "updated-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "updated", Map::new());
        }
        EventBody::SecureUpdated(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "updated-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "updated", Map::new());
        }
        EventBody::Abandoned(body) => {
            batch.target_many(&body.reviewers, "abandoned", Map::new());
            batch.target_many(&body.subscribers, "abandoned", Map::new());
        }
        EventBody::SecureAbandoned(body) => {
            batch.target_many(&body.reviewers, "abandoned", Map::new());
            batch.target_many(&body.subscribers, "abandoned", Map::new());
        }
        EventBody::Reclaimed(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "reclaimed-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "reclaimed", Map::new());
        }
        EventBody::SecureReclaimed(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "reclaimed-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "reclaimed", Map::new());
        }
        EventBody::Created(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "created-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "created", Map::new());
        }
        EventBody::SecureCreated(body) => {
            for reviewer in &body.reviewers {
                batch.target_many(
                    &reviewer.recipients,
                    "created-as-reviewer",
                    reviewer_params(reviewer),
                );
            }
            batch.target_many(&body.subscribers, "created", Map::new());
        }
        EventBody::MetadataEdited(body) => {
            batch.target(body.author.as_ref(), "edited-metadata", Map::new());
            for reviewer in &body.reviewers {
                let as_reviewer = Reviewer {
                    name: reviewer.name.clone(),
                    is_actionable: reviewer.is_actionable,
                    status: reviewer.status,
                    recipients: reviewer.recipients.clone(),
                };
                match reviewer.metadata_change {
                    ExistenceChange::Added => batch.target_many(
                        &reviewer.recipients,
                        "added-as-reviewer",
                        reviewer_params(&as_reviewer),
                    ),
                    ExistenceChange::Removed => {
                        batch.target_many(&reviewer.recipients, "removed-as-reviewer", Map::new())
                    }
                    ExistenceChange::NoChange => batch.target_many(
                        &reviewer.recipients,
                        "edited-metadata-as-reviewer",
                        reviewer_params(&as_reviewer),
                    ),
                }
            }
            batch.target_many(&body.subscribers, "edited-metadata", Map::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Revision, SecureBug, SecureRevision, SecureRevisionAbandoned};
    use crate::template::BuiltinTemplates;

    fn recipient(email: &str, is_actor: bool) -> Recipient {
        Recipient {
            email: email.to_string(),
            username: email.split('@').next().unwrap().to_string(),
            timezone_offset: 0,
            is_actor,
        }
    }

    fn sample_event() -> EventBody {
        EventBody::SecureAbandoned(SecureRevisionAbandoned {
            reviewers: vec![],
            subscribers: vec![],
            comment_count: 0,
            transaction_link: "link".into(),
        })
    }

    #[test]
    fn actor_is_never_targeted() {
        let templates = BuiltinTemplates;
        let mut batch = MailBatch::new(&templates);
        batch.target(Some(&recipient("actor@mail", true)), "commented", Map::new());
        batch.target(None, "commented", Map::new());
        assert!(batch.registered_targets().is_empty());
    }

    #[test]
    fn duplicate_email_is_deduplicated_keeping_first_position() {
        let templates = BuiltinTemplates;
        let mut batch = MailBatch::new(&templates);
        batch.target(Some(&recipient("a@mail", false)), "commented", Map::new());
        batch.target(Some(&recipient("b@mail", false)), "commented", Map::new());
        batch.target(Some(&recipient("a@mail", false)), "abandoned", Map::new());

        let targets = batch.registered_targets();
        assert_eq!(targets.len(), 2);
        // Position from the first registration, payload from the last.
        assert_eq!(targets[0].recipient_email, "a@mail");
        assert_eq!(targets[0].template_path, "abandoned");
        assert_eq!(targets[1].recipient_email, "b@mail");
    }

    #[test]
    fn output_count_matches_distinct_emails() {
        let templates = BuiltinTemplates;
        let mut batch = MailBatch::new(&templates);
        batch.target_many(
            &[
                recipient("a@mail", false),
                recipient("b@mail", false),
                recipient("a@mail", false),
            ],
            "abandoned",
            Map::new(),
        );
        let revision = Revision {
            id: 7,
            name: "my revision".into(),
            link: "http://r/D7".into(),
            bug: None,
        };
        let emails = batch
            .process(&revision, "eve", 1, 0, &sample_event())
            .unwrap();
        assert_eq!(emails.len(), 2);
        assert_eq!(emails[0].subject, "D7: my revision");
        assert_eq!(emails[0].template_path, "public/abandoned");
        assert_eq!(emails[0].threading_key, "D7");
    }

    #[test]
    fn secure_subject_redacts_revision_name() {
        let templates = BuiltinTemplates;
        let mut batch = MailBatch::new(&templates);
        batch.target(Some(&recipient("a@mail", false)), "abandoned", Map::new());
        let revision = SecureRevision {
            id: 9,
            link: "http://r/D9".into(),
            bug: SecureBug {
                id: 321,
                link: "http://bug/321".into(),
            },
        };
        let emails = batch
            .process_secure(&revision, "eve", 1, 0, &sample_event())
            .unwrap();
        assert_eq!(emails[0].subject, "D9: (secure bug 321)");
        assert_eq!(emails[0].template_path, "secure/abandoned");
    }

    #[test]
    fn fan_out_pinged_targets_only_the_pinged_recipient() {
        use crate::events::SecureRevisionCommentPinged;
        let templates = BuiltinTemplates;
        let mut batch = MailBatch::new(&templates);
        let body = EventBody::SecureCommentPinged(SecureRevisionCommentPinged {
            recipient: recipient("pinged@mail", false),
            transaction_link: "link".into(),
        });
        fan_out(&body, &mut batch);
        let targets = batch.registered_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].template_path, "pinged");
    }

    #[test]
    fn fan_out_metadata_edited_routes_by_change() {
        use crate::events::{MetadataEditedReviewer, ReviewerStatus, RevisionMetadataEdited};
        let templates = BuiltinTemplates;
        let mut batch = MailBatch::new(&templates);
        let reviewer = |email: &str, change: ExistenceChange| MetadataEditedReviewer {
            name: email.to_string(),
            is_actionable: false,
            status: ReviewerStatus::Unreviewed,
            metadata_change: change,
            recipients: vec![recipient(email, false)],
        };
        let body = EventBody::MetadataEdited(RevisionMetadataEdited {
            is_ready_to_land: false,
            is_title_changed: true,
            is_bug_changed: false,
            author: Some(recipient("author@mail", false)),
            reviewers: vec![
                reviewer("added@mail", ExistenceChange::Added),
                reviewer("removed@mail", ExistenceChange::Removed),
                reviewer("kept@mail", ExistenceChange::NoChange),
            ],
            subscribers: vec![recipient("sub@mail", false)],
        });
        fan_out(&body, &mut batch);

        let by_email: HashMap<_, _> = batch
            .registered_targets()
            .iter()
            .map(|t| (t.recipient_email.as_str(), t.template_path.as_str()))
            .collect();
        assert_eq!(by_email["author@mail"], "edited-metadata");
        assert_eq!(by_email["added@mail"], "added-as-reviewer");
        assert_eq!(by_email["removed@mail"], "removed-as-reviewer");
        assert_eq!(by_email["kept@mail"], "edited-metadata-as-reviewer");
        assert_eq!(by_email["sub@mail"], "edited-metadata");
    }
}
