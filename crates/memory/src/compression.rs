//! Summarize-old-turns compression shared by every backend.
//!
//! A backend snapshots its history, releases its lock, asks the LLM for a
//! summary of the old part, then re-acquires the lock and swaps in
//! `system ∪ [summary] ∪ recent` if the history has not been rewritten
//! meanwhile. Messages appended during the LLM call are kept after `recent`.

use cortex_core::error::MemoryError;
use cortex_core::message::{Message, Role};
use cortex_core::provider::LlmProvider;
use tracing::{debug, warn};

/// Content prefix of the synthetic summary message.
pub const SUMMARY_PREFIX: &str = "Previous conversation summary: ";

const SUMMARIZER_PROMPT: &str = "You are a conversation summarizer. Summarize the following \
conversation between a user and an assistant. Keep every fact, decision, name, number and open \
question that later turns may rely on. Write in the language of the conversation. Reply with the \
summary only.";

/// A history split for compression.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Leading system messages, kept verbatim
    pub system: Vec<Message>,
    /// Summarized away
    pub old: Vec<Message>,
    /// The newest `max_messages`
    pub recent: Vec<Message>,
}

/// Split `history`; `None` when it already fits or nothing would be summarized.
pub fn partition(history: &[Message], max_messages: usize) -> Option<Partition> {
    if history.len() <= max_messages {
        return None;
    }
    let lead = history.iter().take_while(|m| m.role == Role::System).count();
    let rest = &history[lead..];
    if rest.len() <= max_messages {
        return None;
    }
    let split = rest.len() - max_messages;
    Some(Partition {
        system: history[..lead].to_vec(),
        old: rest[..split].to_vec(),
        recent: rest[split..].to_vec(),
    })
}

/// One LLM call over the old turns.
pub async fn summarize(llm: &dyn LlmProvider, old: &[Message]) -> Result<String, MemoryError> {
    let transcript = old
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    debug!(messages = old.len(), provider = llm.name(), "Summarizing old conversation turns");

    let response = llm
        .chat(&[Message::system(SUMMARIZER_PROMPT), Message::user(transcript)])
        .await
        .map_err(|e| {
            warn!(error = %e, "Memory summarization failed");
            MemoryError::Compression(e.to_string())
        })?;

    Ok(response.message.content.trim().to_string())
}

/// `system ∪ [summary] ∪ tail`
pub fn build_replacement(system: &[Message], summary: &str, tail: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(system.len() + 1 + tail.len());
    out.extend_from_slice(system);
    out.push(Message::system(format!("{SUMMARY_PREFIX}{summary}")));
    out.extend_from_slice(tail);
    out
}

fn same_turn(a: &Message, b: &Message) -> bool {
    a.role == b.role && a.content == b.content
}

/// Re-check after the LLM call. Returns the replacement when `current` still
/// begins with the snapshot that was summarized, `None` otherwise.
pub fn reconcile(
    snapshot: &[Message],
    part: &Partition,
    summary: &str,
    current: &[Message],
    max_messages: usize,
) -> Option<Vec<Message>> {
    if current.len() <= max_messages || current.len() < snapshot.len() {
        return None;
    }
    if !snapshot.iter().zip(current).all(|(a, b)| same_turn(a, b)) {
        return None;
    }
    let summarized = part.system.len() + part.old.len();
    Some(build_replacement(&part.system, summary, &current[summarized..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("u{i}"))
                } else {
                    Message::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    #[test]
    fn partition_noop_when_fits() {
        assert!(partition(&seed(50), 50).is_none());
        let mut with_sys = vec![Message::system("s")];
        with_sys.extend(seed(50));
        assert!(partition(&with_sys, 50).is_none());
    }

    #[test]
    fn partition_splits_tail() {
        let mut history = vec![Message::system("s")];
        history.extend(seed(120));
        let part = partition(&history, 50).unwrap();
        assert_eq!(part.system.len(), 1);
        assert_eq!(part.old.len(), 70);
        assert_eq!(part.recent.len(), 50);
        assert_eq!(part.recent[0].content, "u70");
    }

    #[test]
    fn replacement_shape() {
        let history = seed(10);
        let part = partition(&history, 4).unwrap();
        let out = build_replacement(&part.system, "SUM", &part.recent);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].content, "Previous conversation summary: SUM");
        assert_eq!(out[1..], history[6..]);
    }

    #[test]
    fn reconcile_keeps_appended_and_rejects_rewrites() {
        let snapshot = seed(10);
        let part = partition(&snapshot, 4).unwrap();

        let mut grown = snapshot.clone();
        grown.push(Message::user("late"));
        let out = reconcile(&snapshot, &part, "S", &grown, 4).unwrap();
        assert_eq!(out.len(), 1 + 4 + 1);
        assert_eq!(out.last().unwrap().content, "late");

        let cleared: Vec<Message> = Vec::new();
        assert!(reconcile(&snapshot, &part, "S", &cleared, 4).is_none());

        let mut rewritten = snapshot.clone();
        rewritten[0].content = "changed".into();
        assert!(reconcile(&snapshot, &part, "S", &rewritten, 4).is_none());
    }
}
