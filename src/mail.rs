//! Protocol-agnostic outgoing email and the transports that deliver it.
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, Message, MultiPart};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::debug;

/// An email ready for delivery, independent of transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub template_path: String,
    pub subject: String,
    pub to: String,
    /// Feed event timestamp, seconds since the epoch.
    pub timestamp: i64,
    /// Stable per-revision key rendered into References/In-Reply-To so
    /// clients group successive notifications into one thread.
    pub threading_key: String,
    pub html_body: String,
    pub text_body: String,
    /// Display name of the user whose action triggered the event. Absent on
    /// minimal-context fallback mail.
    pub actor: Option<String>,
}

impl OutgoingEmail {
    /// Build the MIME message for this email.
    ///
    /// `include_target_in_subject` prefixes the subject with the intended
    /// recipient, used when a `send_to` override funnels all mail into one
    /// debugging mailbox.
    pub fn to_mime_message(
        &self,
        from_address: &str,
        include_target_in_subject: bool,
        override_to: Option<&str>,
    ) -> Result<Message> {
        let from: Mailbox = from_address
            .parse()
            .with_context(|| format!("invalid from address: {from_address}"))?;
        let to_address = override_to.unwrap_or(&self.to);
        let to: Mailbox = to_address
            .parse()
            .with_context(|| format!("invalid recipient address: {to_address}"))?;
        let subject = if include_target_in_subject {
            format!("|{}| {}", self.to, self.subject)
        } else {
            self.subject.clone()
        };

        let date = if self.timestamp >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_secs(self.timestamp as u64)
        } else {
            SystemTime::UNIX_EPOCH
        };
        let thread_id = format!("<{}@review-emails>", self.threading_key);

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .date(date)
            .in_reply_to(thread_id.clone())
            .references(thread_id)
            .multipart(MultiPart::alternative_plain_html(
                self.text_body.clone(),
                self.html_body.clone(),
            ))
            .context("failed to assemble MIME message")
    }
}

/// Result of one transport send attempt. Temporary failures are retried,
/// permanent ones feed the minimal-content fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    TemporaryFailure(String),
    PermanentFailure(String),
}

/// Outbound mail transport. Implementations are interchangeable; the
/// delivery engine is agnostic to which one is configured.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryOutcome;
}

/// Writes emails to the file system.
///
/// Outputs the HTML body, the text body, and the entire MIME message (as an
/// EML file). Most useful for local development when iterating on templates.
pub struct FsMail {
    from_address: String,
    index: AtomicUsize,
    eml_path: PathBuf,
    html_path: PathBuf,
    text_path: PathBuf,
}

impl FsMail {
    pub fn new(from_address: &str, output_path: &Path) -> Result<Self> {
        let eml_path = output_path.join("eml");
        let html_path = output_path.join("html");
        let text_path = output_path.join("text");
        std::fs::create_dir_all(&eml_path)?;
        std::fs::create_dir_all(&html_path)?;
        std::fs::create_dir_all(&text_path)?;
        Ok(Self {
            from_address: from_address.to_string(),
            index: AtomicUsize::new(0),
            eml_path,
            html_path,
            text_path,
        })
    }

    async fn write(&self, email: &OutgoingEmail) -> Result<()> {
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        let basename = format!("{}-to-{}", index, email.to);
        let mime = email.to_mime_message(&self.from_address, false, None)?;
        fs::write(
            self.eml_path.join(format!("{basename}.eml")),
            mime.formatted(),
        )
        .await?;
        fs::write(
            self.html_path.join(format!("{basename}.html")),
            &email.html_body,
        )
        .await?;
        fs::write(
            self.text_path.join(format!("{basename}.text")),
            &email.text_body,
        )
        .await?;
        debug!(to = %email.to, template = %email.template_path, "recorded email to disk");
        Ok(())
    }
}

#[async_trait]
impl MailTransport for FsMail {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryOutcome {
        // A broken output directory will not heal by retrying.
        match self.write(email).await {
            Ok(()) => DeliveryOutcome::Success,
            Err(err) => DeliveryOutcome::PermanentFailure(err.to_string()),
        }
    }
}

/// Sends emails through an SMTP relay.
pub struct SmtpMail {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
    send_to: Option<String>,
}

impl SmtpMail {
    /// `send_to`, when set, redirects every message to the given address and
    /// tags the subject with the intended recipient. Debugging aid for
    /// testing many recipients with a single mailbox.
    pub fn new(host: &str, from_address: &str, send_to: Option<String>) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).build();
        Ok(Self {
            transport,
            from_address: from_address.to_string(),
            send_to,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMail {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryOutcome {
        debug!(
            to = %email.to,
            template = %email.template_path,
            subject = %email.subject,
            "sending email via smtp"
        );
        let message = match email.to_mime_message(
            &self.from_address,
            self.send_to.is_some(),
            self.send_to.as_deref(),
        ) {
            Ok(message) => message,
            // Unparseable addresses will not improve with retries.
            Err(err) => return DeliveryOutcome::PermanentFailure(err.to_string()),
        };

        match self.transport.send(message).await {
            Ok(_) => DeliveryOutcome::Success,
            Err(err) if err.is_permanent() => DeliveryOutcome::PermanentFailure(err.to_string()),
            Err(err) => DeliveryOutcome::TemporaryFailure(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_email() -> OutgoingEmail {
        OutgoingEmail {
            template_path: "public/accepted".into(),
            subject: "D1: sample revision".into(),
            to: "alice@mail.test".into(),
            timestamp: 1_600_000_000,
            threading_key: "D1".into(),
            html_body: "<p>hello</p>".into(),
            text_body: "hello".into(),
            actor: Some("bob".into()),
        }
    }

    #[test]
    fn mime_message_has_both_bodies_and_threading_headers() {
        let email = sample_email();
        let message = email
            .to_mime_message("noreply@mail.test", false, None)
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: D1: sample revision"));
        assert!(raw.contains("hello"));
        assert!(raw.contains("<p>hello</p>"));
        assert!(raw.contains("References: <D1@review-emails>"));
    }

    #[test]
    fn debug_override_tags_subject_and_rewrites_recipient() {
        let email = sample_email();
        let message = email
            .to_mime_message("noreply@mail.test", true, Some("dev@mail.test"))
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("|alice@mail.test| D1: sample revision"));
        assert!(raw.contains("To: dev@mail.test"));
    }

    #[test]
    fn bad_recipient_address_is_an_error() {
        let mut email = sample_email();
        email.to = "not an address".into();
        assert!(email.to_mime_message("noreply@mail.test", false, None).is_err());
    }

    #[tokio::test]
    async fn fs_mail_writes_all_three_files() {
        let td = tempdir().unwrap();
        let mail = FsMail::new("noreply@mail.test", td.path()).unwrap();
        let outcome = mail.send(&sample_email()).await;
        assert_eq!(outcome, DeliveryOutcome::Success);

        assert!(td.path().join("eml/0-to-alice@mail.test.eml").exists());
        assert!(td.path().join("html/0-to-alice@mail.test.html").exists());
        assert!(td.path().join("text/0-to-alice@mail.test.text").exists());

        // Index advances per message.
        mail.send(&sample_email()).await;
        assert!(td.path().join("eml/1-to-alice@mail.test.eml").exists());
    }
}
