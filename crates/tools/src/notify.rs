//! `notify_role` and `notify_human`, each gated by an allow-set taken from
//! the role's tool configuration.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;
use cortex_core::{HumanNotification, RoleNotification, RoleNotifier, SmtpConfig};
use tracing::info;

use crate::email::{BodyFormat, EmailSender, recipients};

pub const NOTIFY_ROLE: &str = "notify_role";
pub const NOTIFY_HUMAN: &str = "notify_human";

fn describe(base: &str, rules: &[(String, String)]) -> String {
    let mut out = base.to_string();
    for (targets, condition) in rules {
        if condition.trim().is_empty() {
            out.push_str(&format!("\n- targets: {targets}"));
        } else {
            out.push_str(&format!("\n- targets: {targets}; when: {condition}"));
        }
    }
    out
}

/// Sends one message to another role and returns its answer.
pub struct NotifyRoleTool {
    user_id: String,
    allowed: BTreeSet<String>,
    notifier: Arc<dyn RoleNotifier>,
    description: String,
}

impl NotifyRoleTool {
    pub fn new(user_id: impl Into<String>, rules: &[RoleNotification], notifier: Arc<dyn RoleNotifier>) -> Self {
        let allowed = rules
            .iter()
            .flat_map(|r| r.target_role_ids.iter().cloned())
            .collect();
        let summary: Vec<(String, String)> = rules
            .iter()
            .map(|r| (r.target_role_ids.join(", "), r.condition.clone()))
            .collect();
        Self {
            user_id: user_id.into(),
            allowed,
            notifier,
            description: describe(
                "Send a message to another agent role and receive its reply. Allowed targets:",
                &summary,
            ),
        }
    }

    pub fn allowed(&self) -> &BTreeSet<String> {
        &self.allowed
    }
}

#[async_trait]
impl Tool for NotifyRoleTool {
    fn name(&self) -> &str {
        NOTIFY_ROLE
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "role_id": {
                    "type": "string",
                    "enum": self.allowed.iter().collect::<Vec<_>>(),
                    "description": "Target role id"
                },
                "message": { "type": "string" }
            },
            "required": ["role_id", "message"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let role_id = arguments["role_id"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'role_id' argument".into()))?;
        let message = arguments["message"]
            .as_str()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'message' argument".into()))?;
        if !self.allowed.contains(role_id) {
            return Err(ToolError::PermissionDenied {
                tool_name: NOTIFY_ROLE.into(),
                reason: format!("role '{role_id}' is not a permitted target"),
            });
        }

        info!(target_role = role_id, user_id = %self.user_id, "Notifying role");
        let reply = self
            .notifier
            .notify_role(&self.user_id, role_id, message)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: NOTIFY_ROLE.into(),
                reason: e.to_string(),
            })?;
        Ok(serde_json::json!({ "role_id": role_id, "response": reply }))
    }
}

/// Emails a permitted person.
pub struct NotifyHumanTool {
    allowed: BTreeSet<String>,
    sender: EmailSender,
    description: String,
}

impl NotifyHumanTool {
    pub fn new(rules: &[HumanNotification], smtp: SmtpConfig) -> Self {
        let allowed = rules
            .iter()
            .flat_map(|r| r.target_emails.iter().map(|e| e.trim().to_ascii_lowercase()))
            .collect();
        let summary: Vec<(String, String)> = rules
            .iter()
            .map(|r| (r.target_emails.join(", "), r.condition.clone()))
            .collect();
        Self {
            allowed,
            sender: EmailSender::new(smtp),
            description: describe("Notify a person by email. Allowed recipients:", &summary),
        }
    }

    fn check(&self, to: &[String]) -> Result<(), ToolError> {
        if to.is_empty() {
            return Err(ToolError::InvalidArguments("Missing 'to' argument".into()));
        }
        match to.iter().find(|addr| !self.allowed.contains(&addr.to_ascii_lowercase())) {
            Some(addr) => Err(ToolError::PermissionDenied {
                tool_name: NOTIFY_HUMAN.into(),
                reason: format!("'{addr}' is not a permitted recipient"),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Tool for NotifyHumanTool {
    fn name(&self) -> &str {
        NOTIFY_HUMAN
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "to": {
                    "type": "array",
                    "items": { "type": "string", "enum": self.allowed.iter().collect::<Vec<_>>() }
                },
                "subject": { "type": "string" },
                "message": { "type": "string", "description": "Markdown body" }
            },
            "required": ["to", "subject", "message"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let to = recipients(&arguments["to"]);
        self.check(&to)?;
        let subject = arguments["subject"].as_str().unwrap_or("Notification");
        let message = arguments["message"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'message' argument".into()))?;

        self.sender.send(&to, subject, message, BodyFormat::Markdown).await?;
        Ok(serde_json::json!({ "sent": true, "recipients": to }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl RoleNotifier for Recorder {
        async fn notify_role(&self, user_id: &str, target: &str, message: &str) -> cortex_core::Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((user_id.into(), target.into(), message.into()));
            Ok(format!("ack from {target}"))
        }
    }

    fn rules() -> Vec<RoleNotification> {
        vec![
            RoleNotification {
                target_role_ids: vec!["ops".into()],
                condition: "when a deploy fails".into(),
            },
            RoleNotification {
                target_role_ids: vec!["qa".into(), "ops".into()],
                condition: String::new(),
            },
        ]
    }

    #[tokio::test]
    async fn notify_role_uses_union_of_targets() {
        let recorder = Arc::new(Recorder::default());
        let tool = NotifyRoleTool::new("u1", &rules(), recorder.clone());
        assert_eq!(tool.allowed().len(), 2);
        assert!(tool.description().contains("when a deploy fails"));

        let out = tool
            .execute(serde_json::json!({"role_id": "qa", "message": "please verify"}))
            .await
            .unwrap();
        assert_eq!(out["response"], "ack from qa");
        assert_eq!(
            recorder.calls.lock().unwrap()[0],
            ("u1".to_string(), "qa".to_string(), "please verify".to_string())
        );
    }

    #[tokio::test]
    async fn notify_role_rejects_unlisted_target() {
        let recorder = Arc::new(Recorder::default());
        let tool = NotifyRoleTool::new("u1", &rules(), recorder.clone());
        let err = tool
            .execute(serde_json::json!({"role_id": "finance", "message": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn notify_human_allow_set_is_case_insensitive() {
        let tool = NotifyHumanTool::new(
            &[HumanNotification {
                target_emails: vec!["Oncall@Example.com".into()],
                condition: "on outage".into(),
            }],
            SmtpConfig {
                host: "localhost".into(),
                port: 2525,
                username: "bot@example.com".into(),
                password: "pw".into(),
                from: None,
                use_tls: false,
            },
        );
        assert!(tool.check(&["oncall@example.com".into()]).is_ok());
        assert!(matches!(
            tool.check(&["ceo@example.com".into()]),
            Err(ToolError::PermissionDenied { .. })
        ));
        assert!(tool.check(&[]).is_err());
    }
}
