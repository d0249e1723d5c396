//! `send_email` — SMTP delivery with plain, HTML or markdown bodies.
//!
//! [`EmailSender`] is shared with `notify_human`.

use async_trait::async_trait;
use cortex_core::SmtpConfig;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

pub const NAME: &str = "send_email";

/// How the body text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Plain,
    Html,
    Markdown,
}

impl std::str::FromStr for BodyFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(Self::Plain),
            "html" => Ok(Self::Html),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(format!("Unknown body format: {other}")),
        }
    }
}

/// Render markdown to an HTML fragment.
pub fn markdown_to_html(markdown: &str) -> String {
    use pulldown_cmark::{Options, Parser, html};
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, Parser::new_ext(markdown, options));
    out
}

fn failed(tool: &str, reason: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool.into(),
        reason: reason.to_string(),
    }
}

/// Sends mail through one SMTP account.
#[derive(Clone)]
pub struct EmailSender {
    config: SmtpConfig,
}

impl EmailSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    pub fn build_message(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
        format: BodyFormat,
    ) -> Result<Message, ToolError> {
        if to.is_empty() {
            return Err(ToolError::InvalidArguments("No recipients".into()));
        }
        let from: Mailbox = self
            .config
            .sender()
            .parse()
            .map_err(|e| ToolError::InvalidArguments(format!("Invalid sender address: {e}")))?;
        let mut builder = Message::builder().from(from).subject(subject);
        for addr in to {
            let mailbox: Mailbox = addr
                .parse()
                .map_err(|e| ToolError::InvalidArguments(format!("Invalid recipient '{addr}': {e}")))?;
            builder = builder.to(mailbox);
        }

        let message = match format {
            BodyFormat::Plain => builder
                .header(ContentType::TEXT_PLAIN)
                .body(body.to_string()),
            BodyFormat::Html => builder
                .header(ContentType::TEXT_HTML)
                .body(body.to_string()),
            BodyFormat::Markdown => builder.multipart(MultiPart::alternative_plain_html(
                body.to_string(),
                markdown_to_html(body),
            )),
        };
        message.map_err(|e| failed(NAME, e))
    }

    pub async fn send(&self, to: &[String], subject: &str, body: &str, format: BodyFormat) -> Result<(), ToolError> {
        let message = self.build_message(to, subject, body, format)?;
        let relay = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
        }
        .map_err(|e| failed(NAME, e))?;
        let mailer = relay
            .port(self.config.port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ))
            .build();

        mailer
            .send(message)
            .await
            .map_err(|e| ToolError::Network(format!("SMTP {}:{}: {e}", self.config.host, self.config.port)))?;
        info!(host = %self.config.host, recipients = to.len(), "Email sent");
        Ok(())
    }
}

pub struct SendEmailTool {
    sender: EmailSender,
}

impl SendEmailTool {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            sender: EmailSender::new(config),
        }
    }
}

/// Accept `"a@b.c"`, `"a@b.c, d@e.f"` or `["a@b.c", "d@e.f"]`.
pub(crate) fn recipients(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::String(s) => s
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Send an email. The body may be plain text, HTML, or markdown (rendered to HTML)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "to": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Recipient addresses"
                },
                "subject": { "type": "string" },
                "body": { "type": "string" },
                "body_type": {
                    "type": "string",
                    "enum": ["plain", "html", "markdown"],
                    "description": "Default plain"
                }
            },
            "required": ["to", "subject", "body"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let to = recipients(&arguments["to"]);
        let subject = arguments["subject"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'subject' argument".into()))?;
        let body = arguments["body"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'body' argument".into()))?;
        let format = arguments["body_type"]
            .as_str()
            .map(str::parse::<BodyFormat>)
            .transpose()
            .map_err(ToolError::InvalidArguments)?
            .unwrap_or(BodyFormat::Plain);

        self.sender.send(&to, subject, body, format).await?;
        Ok(serde_json::json!({ "sent": true, "recipients": to }))
    }
}
