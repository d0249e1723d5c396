//! System prompt composition for a role.

use cortex_core::{AgentRole, Experience};

const EXPERIENCE_GUIDANCE: &str = "\n\n## Experience\n\
You have access to experiences accumulated by this role. Before answering a \
question that may have come up before, call `fuzzy_search_experience` with a \
few keywords from the request and use what it returns. When you learn \
something worth keeping, record it with `create_experience`.";

/// `prompt`, then the principle, the experience guidance and the notification rules.
pub fn compose_system_prompt(role: &AgentRole, experiences: &[Experience]) -> String {
    let mut prompt = role.prompt.clone();

    if let Some(principle) = role.principle.as_deref().filter(|p| !p.trim().is_empty()) {
        prompt.push_str("\n\nPrinciple: ");
        prompt.push_str(principle);
    }

    if !experiences.is_empty() {
        prompt.push_str(EXPERIENCE_GUIDANCE);
        prompt.push_str(&format!("\n{} experience(s) are currently available.", experiences.len()));
    }

    let config = &role.tool_config;
    if !config.role_notifications.is_empty() {
        prompt.push_str("\n\n## Role notification rules\nUse `notify_role` to reach another role when:");
        for rule in &config.role_notifications {
            prompt.push_str(&format!(
                "\n- roles [{}]: {}",
                rule.target_role_ids.join(", "),
                condition_text(&rule.condition)
            ));
        }
    }
    if !config.human_notifications.is_empty() && config.email_config.is_some() {
        prompt.push_str("\n\n## Human notification rules\nUse `notify_human` to email a person when:");
        for rule in &config.human_notifications {
            prompt.push_str(&format!(
                "\n- recipients [{}]: {}",
                rule.target_emails.join(", "),
                condition_text(&rule.condition)
            ));
        }
    }

    prompt
}

fn condition_text(condition: &str) -> &str {
    match condition.trim() {
        "" => "whenever it helps the user",
        c => c,
    }
}
