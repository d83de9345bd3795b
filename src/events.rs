//! Typed representation of review-feed event bodies.
//!
//! Every event kind has a secure and a public variant with different field
//! sets: secure variants omit comment text and diff content, exposing only
//! counts and links, so that nothing about a secure revision leaks into a
//! notification. `metadata-edited` is the exception and has a single shape.
use chrono::{FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A validation error while parsing feed events.
///
/// Raised for event shapes we do not know how to handle (unknown kinds,
/// missing or mistyped fields). Anything else that goes wrong during
/// rendering is a bug and should propagate.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected revision event kind: {0}")]
    UnknownKind(String),
    #[error("malformed event body: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("event is missing the \"{0}\" field")]
    MissingField(&'static str),
}

/// A comment in both renderable forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentMessage {
    pub as_text: String,
    pub as_html: String,
}

/// Someone who may receive a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email: String,
    pub username: String,
    /// Seconds east of UTC, e.g. -25200 for UTC-7.
    pub timezone_offset: i32,
    pub is_actor: bool,
}

impl Recipient {
    /// The recipient's timezone; offsets outside the valid range fall back
    /// to UTC rather than failing the whole event.
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone_offset)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewerStatus {
    Accepted,
    RequestedChanges,
    Blocking,
    Unreviewed,
}

/// A reviewer assigned to a revision. May be a group (multiple recipients)
/// or an individual (one recipient); formatting distinguishes the two by
/// recipient count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reviewer {
    pub name: String,
    pub is_actionable: bool,
    pub status: ReviewerStatus,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExistenceChange {
    Added,
    Removed,
    NoChange,
}

/// Reviewer entry on a metadata-edited event, annotated with whether the
/// edit added or removed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEditedReviewer {
    pub name: String,
    pub is_actionable: bool,
    pub status: ReviewerStatus,
    pub metadata_change: ExistenceChange,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bug {
    #[serde(rename = "bugId")]
    pub id: i64,
    pub name: String,
    pub link: String,
}

/// The reviewed unit that owns a notification thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    #[serde(rename = "revisionId")]
    pub id: i64,
    pub name: String,
    pub link: String,
    #[serde(default)]
    pub bug: Option<Bug>,
}

/// Reduced revision reference carried by the minimal fallback context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalRevision {
    #[serde(rename = "revisionId")]
    pub id: i64,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureBug {
    #[serde(rename = "bugId")]
    pub id: i64,
    pub link: String,
}

/// A revision whose content must not leak into notifications: no name, only
/// a bug identifier and links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevision {
    #[serde(rename = "revisionId")]
    pub id: i64,
    pub link: String,
    pub bug: SecureBug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffLineType {
    Added,
    Removed,
    NoChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub line_number: i64,
    #[serde(rename = "type")]
    pub line_type: DiffLineType,
    pub raw_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeContext {
    pub diff: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyContext {
    pub other_author: String,
    pub other_date_utc: NaiveDateTime,
    pub other_comment_message: CommentMessage,
}

/// An inline comment is anchored either to code or to another comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "contextKind", content = "context", rename_all = "camelCase")]
pub enum InlineCommentContext {
    Code(CodeContext),
    Reply(ReplyContext),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineComment {
    pub file_context: String,
    pub link: String,
    pub message: CommentMessage,
    #[serde(flatten)]
    pub context: InlineCommentContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AffectedFileChange {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedFile {
    pub path: String,
    pub change: AffectedFileChange,
}

// Public event bodies. `subscribers` defaults to empty since older feed
// payloads omit the field.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionAccepted {
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    pub transaction_link: String,
    #[serde(default)]
    pub lando_link: Option<String>,
    pub is_ready_to_land: bool,
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionCommented {
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    pub transaction_link: String,
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionClosed {
    #[serde(default)]
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    // Legacy "landed" events reinterpreted as "closed" may not carry a
    // transaction link.
    #[serde(default)]
    pub transaction_link: Option<String>,
    #[serde(default)]
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionLanded {
    #[serde(default)]
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    #[serde(default)]
    pub transaction_link: Option<String>,
    #[serde(default)]
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionCommentPinged {
    pub recipient: Recipient,
    #[serde(default)]
    pub pinged_main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub pinged_inline_comments: Vec<InlineComment>,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRequestedChanges {
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    pub transaction_link: String,
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRequestedReview {
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    pub transaction_link: String,
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionUpdated {
    pub is_ready_to_land: bool,
    pub new_changes_link: String,
    pub affected_files: Vec<AffectedFile>,
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionAbandoned {
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    pub transaction_link: String,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionReclaimed {
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    pub transaction_link: String,
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionCreated {
    pub affected_files: Vec<AffectedFile>,
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionMetadataEdited {
    pub is_ready_to_land: bool,
    pub is_title_changed: bool,
    pub is_bug_changed: bool,
    pub author: Option<Recipient>,
    pub reviewers: Vec<MetadataEditedReviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

// Secure event bodies. Comment text and diffs are replaced by counts and
// links.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionAccepted {
    #[serde(default)]
    pub lando_link: Option<String>,
    pub is_ready_to_land: bool,
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    pub comment_count: i64,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionCommented {
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionClosed {
    #[serde(default)]
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub transaction_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionLanded {
    #[serde(default)]
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub transaction_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionCommentPinged {
    pub recipient: Recipient,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionRequestedChanges {
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    pub comment_count: i64,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionRequestedReview {
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    pub comment_count: i64,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionUpdated {
    pub is_ready_to_land: bool,
    pub new_changes_link: String,
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionAbandoned {
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    pub comment_count: i64,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionReclaimed {
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
    pub comment_count: i64,
    pub transaction_link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRevisionCreated {
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

/// The closed set of feed event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Accepted,
    Commented,
    RequestedChanges,
    RequestedReview,
    Abandoned,
    Reclaimed,
    Landed,
    Closed,
    CommentPinged,
    MetadataEdited,
}

/// True if the feed is providing legacy "revision landed" events.
///
/// The server is being migrated to represent "land" and "close" as distinct
/// events; the legacy behaviour represented them as one. After the
/// migration, "revision-closed" is identical to the old "revision-landed"
/// event, while "revision-landed" carries new landing context including the
/// transaction link. A "landed" event without a `transactionLink` field is
/// therefore the old shape and is handled as "closed".
///
/// TODO: remove once the server-side feed migration is complete (this is the
/// only place the shim lives).
fn is_legacy_landed(raw_body: &Value) -> bool {
    raw_body.get("transactionLink").is_none()
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "revision-created",
            EventKind::Updated => "revision-updated",
            EventKind::Accepted => "revision-accepted",
            EventKind::Commented => "revision-commented",
            EventKind::RequestedChanges => "revision-requested-changes",
            EventKind::RequestedReview => "revision-requested-review",
            EventKind::Abandoned => "revision-abandoned",
            EventKind::Reclaimed => "revision-reclaimed",
            EventKind::Landed => "revision-landed",
            EventKind::Closed => "revision-closed",
            EventKind::CommentPinged => "revision-comment-pinged",
            EventKind::MetadataEdited => "revision-metadata-edited",
        }
    }

    /// Resolve the raw kind string, consulting the legacy-landed shim once.
    pub fn detect(kind: &str, raw_body: &Value) -> Result<EventKind, ParseError> {
        Ok(match kind {
            "revision-created" => EventKind::Created,
            "revision-updated" => EventKind::Updated,
            "revision-accepted" => EventKind::Accepted,
            "revision-commented" => EventKind::Commented,
            "revision-requested-changes" => EventKind::RequestedChanges,
            "revision-requested-review" => EventKind::RequestedReview,
            "revision-abandoned" => EventKind::Abandoned,
            "revision-reclaimed" => EventKind::Reclaimed,
            "revision-landed" if is_legacy_landed(raw_body) => EventKind::Closed,
            "revision-landed" => EventKind::Landed,
            "revision-closed" => EventKind::Closed,
            "revision-comment-pinged" => EventKind::CommentPinged,
            "revision-metadata-edited" => EventKind::MetadataEdited,
            other => return Err(ParseError::UnknownKind(other.to_string())),
        })
    }
}

/// A fully parsed event body, one variant per (kind, secure-flag) pair.
///
/// `metadata-edited` has no secure variant and always parses to the public
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventBody {
    Accepted(RevisionAccepted),
    SecureAccepted(SecureRevisionAccepted),
    Commented(RevisionCommented),
    SecureCommented(SecureRevisionCommented),
    Closed(RevisionClosed),
    SecureClosed(SecureRevisionClosed),
    Landed(RevisionLanded),
    SecureLanded(SecureRevisionLanded),
    CommentPinged(RevisionCommentPinged),
    SecureCommentPinged(SecureRevisionCommentPinged),
    RequestedChanges(RevisionRequestedChanges),
    SecureRequestedChanges(SecureRevisionRequestedChanges),
    RequestedReview(RevisionRequestedReview),
    SecureRequestedReview(SecureRevisionRequestedReview),
    Updated(RevisionUpdated),
    SecureUpdated(SecureRevisionUpdated),
    Abandoned(RevisionAbandoned),
    SecureAbandoned(SecureRevisionAbandoned),
    Reclaimed(RevisionReclaimed),
    SecureReclaimed(SecureRevisionReclaimed),
    Created(RevisionCreated),
    SecureCreated(SecureRevisionCreated),
    MetadataEdited(RevisionMetadataEdited),
}

/// Parse a raw event body into its typed variant.
///
/// Fails with [`ParseError::UnknownKind`] for kinds outside the enumerated
/// set and [`ParseError::Invalid`] for bodies that do not match the kind's
/// expected shape.
pub fn parse_body(kind: EventKind, is_secure: bool, raw_body: &Value) -> Result<EventBody, ParseError> {
    let body = match (kind, is_secure) {
        (EventKind::Accepted, false) => EventBody::Accepted(from_raw(raw_body)?),
        (EventKind::Accepted, true) => EventBody::SecureAccepted(from_raw(raw_body)?),
        (EventKind::Commented, false) => EventBody::Commented(from_raw(raw_body)?),
        (EventKind::Commented, true) => EventBody::SecureCommented(from_raw(raw_body)?),
        (EventKind::Closed, false) => EventBody::Closed(from_raw(raw_body)?),
        (EventKind::Closed, true) => EventBody::SecureClosed(from_raw(raw_body)?),
        (EventKind::Landed, false) => EventBody::Landed(from_raw(raw_body)?),
        (EventKind::Landed, true) => EventBody::SecureLanded(from_raw(raw_body)?),
        (EventKind::CommentPinged, false) => EventBody::CommentPinged(from_raw(raw_body)?),
        (EventKind::CommentPinged, true) => EventBody::SecureCommentPinged(from_raw(raw_body)?),
        (EventKind::RequestedChanges, false) => EventBody::RequestedChanges(from_raw(raw_body)?),
        (EventKind::RequestedChanges, true) => {
            EventBody::SecureRequestedChanges(from_raw(raw_body)?)
        }
        (EventKind::RequestedReview, false) => EventBody::RequestedReview(from_raw(raw_body)?),
        (EventKind::RequestedReview, true) => {
            EventBody::SecureRequestedReview(from_raw(raw_body)?)
        }
        (EventKind::Updated, false) => EventBody::Updated(from_raw(raw_body)?),
        (EventKind::Updated, true) => EventBody::SecureUpdated(from_raw(raw_body)?),
        (EventKind::Abandoned, false) => EventBody::Abandoned(from_raw(raw_body)?),
        (EventKind::Abandoned, true) => EventBody::SecureAbandoned(from_raw(raw_body)?),
        (EventKind::Reclaimed, false) => EventBody::Reclaimed(from_raw(raw_body)?),
        (EventKind::Reclaimed, true) => EventBody::SecureReclaimed(from_raw(raw_body)?),
        (EventKind::Created, false) => EventBody::Created(from_raw(raw_body)?),
        (EventKind::Created, true) => EventBody::SecureCreated(from_raw(raw_body)?),
        // No secure/public distinction for metadata edits.
        (EventKind::MetadataEdited, _) => EventBody::MetadataEdited(from_raw(raw_body)?),
    };
    Ok(body)
}

fn from_raw<T: serde::de::DeserializeOwned>(raw_body: &Value) -> Result<T, ParseError> {
    Ok(serde_json::from_value(raw_body.clone())?)
}
