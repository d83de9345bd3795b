//! Template rendering seam.
//!
//! The pipeline only depends on the narrow [`TemplateStore`] trait; the
//! built-in implementation renders small deterministic text/HTML bodies and
//! enforces a strict missing-parameter policy so that malformed event data
//! fails the rich rendering path instead of producing half-empty emails.
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("template \"{template}\" referenced undefined parameter \"{parameter}\"")]
    UndefinedParameter {
        template: String,
        parameter: &'static str,
    },
}

/// A rendered email body in both forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMail {
    pub html: String,
    pub text: String,
}

/// Renders a template path plus parameters into email bodies.
pub trait TemplateStore: Send + Sync {
    fn render(&self, template_path: &str, params: &Map<String, Value>)
        -> Result<RenderedMail, TemplateError>;
}

/// Built-in plain templates.
///
/// One summary line per template, parameterized by the event's actor and the
/// revision link. Secure templates receive the same phrasing; redaction
/// happens upstream in the event model, which never hands secure content to
/// the renderer.
#[derive(Debug, Default, Clone)]
pub struct BuiltinTemplates;

/// Summary phrase for a template leaf name. The leaf is the path with its
/// "public/" or "secure/" namespace stripped.
fn phrase(leaf: &str) -> Option<&'static str> {
    Some(match leaf {
        "accepted" => "accepted this revision",
        "accepted-as-author" => "accepted your revision",
        "commented" => "commented on this revision",
        "closed" => "closed this revision",
        "landed" => "landed this revision",
        "pinged" => "pinged you in a comment on this revision",
        "requested-changes" => "requested changes to this revision",
        "requested-changes-as-author" => "requested changes to your revision",
        "requested-review" => "requested review of this revision",
        "requested-review-as-reviewer" => "requested your review of this revision",
        "updated" => "updated this revision",
        "updated-as-reviewer" => "updated this revision that you are reviewing",
        "abandoned" => "abandoned this revision",
        "reclaimed" => "reclaimed this revision",
        "reclaimed-as-reviewer" => "reclaimed this revision that you are reviewing",
        "created" => "created this revision",
        "created-as-reviewer" => "created this revision and requested your review",
        "added-as-reviewer" => "added you as a reviewer",
        "removed-as-reviewer" => "removed you as a reviewer",
        "edited-metadata" => "edited the details of this revision",
        "edited-metadata-as-reviewer" => {
            "edited the details of this revision that you are reviewing"
        }
        _ => return None,
    })
}

fn str_param<'a>(
    template: &str,
    params: &'a Map<String, Value>,
    name: &'static str,
) -> Result<&'a str, TemplateError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| TemplateError::UndefinedParameter {
            template: template.to_string(),
            parameter: name,
        })
}

fn i64_param(
    template: &str,
    params: &Map<String, Value>,
    name: &'static str,
) -> Result<i64, TemplateError> {
    params
        .get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| TemplateError::UndefinedParameter {
            template: template.to_string(),
            parameter: name,
        })
}

fn revision_link(template: &str, params: &Map<String, Value>) -> Result<String, TemplateError> {
    let link = params
        .get("revision")
        .and_then(|revision| revision.get("link"))
        .and_then(Value::as_str)
        .ok_or_else(|| TemplateError::UndefinedParameter {
            template: template.to_string(),
            parameter: "revision",
        })?;
    Ok(link.to_string())
}

impl TemplateStore for BuiltinTemplates {
    fn render(
        &self,
        template_path: &str,
        params: &Map<String, Value>,
    ) -> Result<RenderedMail, TemplateError> {
        let recipient = str_param(template_path, params, "recipient_username")?;
        let unique_number = i64_param(template_path, params, "unique_number")?;

        if template_path == "minimal" {
            let link = revision_link(template_path, params)?;
            let line = "An (unknown) action occurred on this revision";
            return Ok(RenderedMail {
                text: format!("Hi {recipient},\n\n{line}.\n\n{link}\n\n#{unique_number}\n"),
                html: format!(
                    "<p>Hi {recipient},</p><p>{line}.</p>\
                     <p><a href=\"{link}\">{link}</a></p><p>#{unique_number}</p>"
                ),
            });
        }

        let leaf = template_path
            .strip_prefix("public/")
            .or_else(|| template_path.strip_prefix("secure/"))
            .ok_or_else(|| TemplateError::UnknownTemplate(template_path.to_string()))?;
        let line =
            phrase(leaf).ok_or_else(|| TemplateError::UnknownTemplate(template_path.to_string()))?;

        let actor = str_param(template_path, params, "actor_name")?;
        let link = revision_link(template_path, params)?;

        Ok(RenderedMail {
            text: format!("Hi {recipient},\n\n{actor} {line}.\n\n{link}\n\n#{unique_number}\n"),
            html: format!(
                "<p>Hi {recipient},</p><p><strong>{actor}</strong> {line}.</p>\
                 <p><a href=\"{link}\">{link}</a></p><p>#{unique_number}</p>"
            ),
        })
    }
}
