//! Conversation history folding.
//!
//! The accumulator is a deterministic reducer over the ordered session stream:
//! user messages and sequenced server events go in, [`Message`] records come out.
//! It performs no I/O; persistence receives snapshots through [`ConversationStore`].

mod store;

use chrono::{DateTime, Utc};
use convoy_protocol::{
    ChartInfo, ContentFilterDetails, Conversation, EventPayload, Message, RetryInfo,
    ServerEvent, SessionStatus,
};
use uuid::Uuid;

pub use store::{ConversationStore, MemoryConversationStore};

/// Longest title derived from the opening user message, in characters.
const TITLE_MAX_CHARS: usize = 60;

/// One element of the stream the accumulator folds.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    /// The user's request that opened a turn.
    User {
        turn_id: u32,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// A sequenced server event.
    Event(ServerEvent),
}

/// Assistant message under construction for the current turn.
#[derive(Debug, Default)]
struct Draft {
    turn_id: u32,
    agents: Vec<String>,
    attachments: Vec<ChartInfo>,
    saw_agent_step: bool,
}

impl Draft {
    fn new(turn_id: u32) -> Self {
        Self {
            turn_id,
            ..Self::default()
        }
    }

    fn note_agent(&mut self, agent: &str) {
        if !self.agents.iter().any(|a| a == agent) {
            self.agents.push(agent.to_string());
        }
    }
}

/// Folds a session's stream into a [`Conversation`].
#[derive(Debug)]
pub struct ConversationAccumulator {
    conversation: Conversation,
    draft: Option<Draft>,
}

impl ConversationAccumulator {
    /// Start an empty conversation.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            conversation: Conversation::new(id, created_at),
            draft: None,
        }
    }

    /// Continue a stored conversation.
    pub fn resume(conversation: Conversation) -> Self {
        Self {
            conversation,
            draft: None,
        }
    }

    /// Fold a recorded stream from scratch.
    pub fn replay<'a>(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        entries: impl IntoIterator<Item = &'a HistoryEntry>,
    ) -> Conversation {
        let mut acc = Self::new(id, created_at);
        for entry in entries {
            acc.append(entry);
        }
        acc.conversation
    }

    pub fn id(&self) -> &str {
        &self.conversation.id
    }

    /// Read-only view of the folded conversation.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Owned copy for handing to persistence.
    pub fn snapshot(&self) -> Conversation {
        self.conversation.clone()
    }

    /// Fold one entry.
    pub fn append(&mut self, entry: &HistoryEntry) {
        match entry {
            HistoryEntry::User {
                turn_id,
                content,
                timestamp,
            } => {
                // A new turn never inherits an unfinished answer.
                self.draft = None;
                if self.conversation.title.is_none() {
                    self.conversation.title = Some(derive_title(content));
                }
                let id = self.next_id();
                self.push(Message::user(id, content.clone(), *timestamp));
                self.draft = Some(Draft::new(*turn_id));
            }
            HistoryEntry::Event(event) => self.fold_event(event),
        }
    }

    fn fold_event(&mut self, event: &ServerEvent) {
        // Session-level events (connection status, protocol errors) are not history.
        let Some(turn_id) = event.turn_id else {
            return;
        };
        let ts = event.timestamp;

        match &event.payload {
            EventPayload::AgentStep { agent, .. } => {
                let draft = self.draft_for(turn_id);
                draft.note_agent(agent);
                draft.saw_agent_step = true;
            }
            EventPayload::ToolCall { agent, .. } => {
                self.draft_for(turn_id).note_agent(agent);
            }
            EventPayload::ToolResult { agent, .. } => {
                if let Some(agent) = agent {
                    self.draft_for(turn_id).note_agent(agent);
                }
            }
            EventPayload::Chart {
                chart_id,
                url,
                symbol,
            } => {
                self.draft_for(turn_id).attachments.push(ChartInfo {
                    chart_id: chart_id.clone(),
                    url: url.clone(),
                    symbol: symbol.clone(),
                });
            }
            EventPayload::ContentFilterError {
                message,
                triggered_prompt,
                filter_type,
                filter_results,
            } => {
                let id = self.next_id();
                self.push(Message::content_filter_error(
                    id,
                    message.clone(),
                    ts,
                    ContentFilterDetails {
                        triggered_prompt: triggered_prompt.clone(),
                        filter_type: filter_type.clone(),
                        filter_results: filter_results.clone(),
                    },
                ));
            }
            EventPayload::RetryNotification {
                message,
                retry_count,
                max_retries,
                filter_type,
            } => {
                let id = self.next_id();
                self.push(Message::retry_notification(
                    id,
                    message.clone(),
                    ts,
                    RetryInfo {
                        retry_count: *retry_count,
                        max_retries: *max_retries,
                        filter_type: filter_type.clone(),
                    },
                ));
            }
            EventPayload::Result {
                content,
                agents_used,
                ..
            } => {
                let draft = self.take_draft(turn_id);
                let agents = if agents_used.is_empty() {
                    draft.agents
                } else {
                    agents_used.clone()
                };
                let id = self.next_id();
                let mut msg = Message::assistant(id, content.clone(), ts, agents, draft.attachments);
                msg.is_quick_result = !draft.saw_agent_step;
                self.push(msg);
            }
            EventPayload::Error {
                message,
                recoverable: false,
                ..
            } => {
                self.take_draft(turn_id);
                let id = self.next_id();
                self.push(Message::error(id, message.clone(), ts));
            }
            EventPayload::Status {
                status: SessionStatus::Cancelled,
                message,
            } => {
                self.take_draft(turn_id);
                let id = self.next_id();
                let text = message.clone().unwrap_or_else(|| "Turn cancelled".to_string());
                self.push(Message::system(id, text, ts));
            }
            EventPayload::Status {
                status: SessionStatus::Idle,
                ..
            } => {
                // Turn is over; drop whatever was never finalized.
                self.take_draft(turn_id);
            }
            EventPayload::Status { .. }
            | EventPayload::Progress { .. }
            | EventPayload::Error { .. }
            | EventPayload::Pong => {}
        }
    }

    fn draft_for(&mut self, turn_id: u32) -> &mut Draft {
        let stale = self
            .draft
            .as_ref()
            .is_some_and(|draft| draft.turn_id != turn_id);
        if stale {
            self.draft = None;
        }
        self.draft.get_or_insert_with(|| Draft::new(turn_id))
    }

    fn take_draft(&mut self, turn_id: u32) -> Draft {
        match self.draft.take() {
            Some(draft) if draft.turn_id == turn_id => draft,
            _ => Draft::new(turn_id),
        }
    }

    fn next_id(&self) -> String {
        let name = format!("{}:{}", self.conversation.id, self.conversation.messages.len());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    fn push(&mut self, message: Message) {
        debug_assert!(message.validate().is_ok());
        if message.timestamp > self.conversation.last_message_at {
            self.conversation.last_message_at = message.timestamp;
        }
        self.conversation.messages.push(message);
    }
}

fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    match trimmed.char_indices().nth(TITLE_MAX_CHARS) {
        Some((idx, _)) => format!("{}…", trimmed[..idx].trim_end()),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use convoy_protocol::{ResultFormat, Role, StepStatus};

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-02-05T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Builds a recorded stream with increasing seq/timestamps.
    struct Recorder {
        seq: u64,
        entries: Vec<HistoryEntry>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                seq: 0,
                entries: Vec::new(),
            }
        }

        fn ts(&self) -> DateTime<Utc> {
            base() + Duration::milliseconds(self.seq as i64 * 10)
        }

        fn user(&mut self, turn_id: u32, content: &str) -> &mut Self {
            self.seq += 1;
            let timestamp = self.ts();
            self.entries.push(HistoryEntry::User {
                turn_id,
                content: content.to_string(),
                timestamp,
            });
            self
        }

        fn event(&mut self, turn_id: Option<u32>, payload: EventPayload) -> &mut Self {
            self.seq += 1;
            let timestamp = self.ts();
            self.entries.push(HistoryEntry::Event(ServerEvent {
                seq: Some(self.seq),
                turn_id,
                timestamp,
                payload,
            }));
            self
        }

        fn step(&mut self, turn: u32, agent: &str, status: StepStatus) -> &mut Self {
            self.event(
                Some(turn),
                EventPayload::AgentStep {
                    agent: agent.to_string(),
                    emoji: "🤖".to_string(),
                    status,
                    message: None,
                },
            )
        }

        fn result(&mut self, turn: u32, content: &str, agents: &[&str]) -> &mut Self {
            self.event(
                Some(turn),
                EventPayload::Result {
                    content: content.to_string(),
                    format: ResultFormat::Markdown,
                    agents_used: agents.iter().map(|a| a.to_string()).collect(),
                },
            )
        }

        fn rejection(&mut self, turn: u32, retry: Option<u32>) -> &mut Self {
            self.event(
                Some(turn),
                EventPayload::ContentFilterError {
                    message: "Prompt rejected by content filter".to_string(),
                    triggered_prompt: "draw it".to_string(),
                    filter_type: Some("violence".to_string()),
                    filter_results: None,
                },
            );
            if let Some(retry_count) = retry {
                self.event(
                    Some(turn),
                    EventPayload::RetryNotification {
                        message: "Regenerating".to_string(),
                        retry_count,
                        max_retries: 3,
                        filter_type: Some("violence".to_string()),
                    },
                );
            }
            self
        }
    }

    fn fold(entries: &[HistoryEntry]) -> Conversation {
        ConversationAccumulator::replay("conv-1", base(), entries)
    }

    #[test]
    fn test_agent_activity_folds_into_one_assistant_message() {
        let mut rec = Recorder::new();
        rec.event(None, EventPayload::status(SessionStatus::Connected))
            .user(1, "BTC price?")
            .event(Some(1), EventPayload::status(SessionStatus::Processing))
            .step(1, "analyst", StepStatus::Working)
            .event(
                Some(1),
                EventPayload::ToolCall {
                    agent: "analyst".to_string(),
                    tool_name: "get_price".to_string(),
                    arguments: None,
                },
            )
            .event(
                Some(1),
                EventPayload::ToolResult {
                    tool_name: "get_price".to_string(),
                    success: true,
                    result_preview: Some("97000".to_string()),
                    agent: Some("analyst".to_string()),
                },
            )
            .event(
                Some(1),
                EventPayload::Chart {
                    chart_id: "c1".to_string(),
                    url: "/charts/c1.png".to_string(),
                    symbol: "BTC".to_string(),
                },
            )
            .step(1, "analyst", StepStatus::Completed)
            .result(1, "BTC is at 97k", &[])
            .event(Some(1), EventPayload::status(SessionStatus::Idle));

        let conv = fold(&rec.entries);
        assert_eq!(conv.title.as_deref(), Some("BTC price?"));
        assert_eq!(conv.messages.len(), 2);

        let user = &conv.messages[0];
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "BTC price?");

        let answer = &conv.messages[1];
        assert_eq!(answer.role, Role::Assistant);
        assert_eq!(answer.content, "BTC is at 97k");
        assert_eq!(answer.agents_used, Some(vec!["analyst".to_string()]));
        assert_eq!(answer.attachments.len(), 1);
        assert_eq!(answer.attachments[0].symbol, "BTC");
        assert!(!answer.is_quick_result);
        assert_eq!(conv.last_message_at, answer.timestamp);
    }

    #[test]
    fn test_result_without_agent_steps_is_quick() {
        let mut rec = Recorder::new();
        rec.user(1, "hello").result(1, "hi there", &[]);

        let conv = fold(&rec.entries);
        assert!(conv.messages[1].is_quick_result);
        assert_eq!(conv.messages[1].agents_used, Some(vec![]));
    }

    #[test]
    fn test_agents_used_preserves_first_seen_order() {
        let mut rec = Recorder::new();
        rec.user(1, "compare")
            .step(1, "researcher", StepStatus::Working)
            .step(1, "analyst", StepStatus::Working)
            .step(1, "researcher", StepStatus::Completed)
            .step(1, "analyst", StepStatus::Completed)
            .result(1, "done", &[]);

        let conv = fold(&rec.entries);
        assert_eq!(
            conv.messages[1].agents_used,
            Some(vec!["researcher".to_string(), "analyst".to_string()])
        );
    }

    #[test]
    fn test_single_filter_rejection_then_success() {
        let mut rec = Recorder::new();
        rec.user(1, "chart BTC")
            .step(1, "charter", StepStatus::Working)
            .rejection(1, Some(1))
            .step(1, "charter", StepStatus::Completed)
            .result(1, "here is your chart", &[]);

        let conv = fold(&rec.entries);
        let roles: Vec<Role> = conv.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::User,
                Role::ContentFilterError,
                Role::System,
                Role::Assistant
            ]
        );

        let filtered = &conv.messages[1];
        let details = filtered.content_filter_details.as_ref().unwrap();
        assert_eq!(details.triggered_prompt, "draw it");
        assert!(filtered.retry_info.is_none());

        let retry = &conv.messages[2];
        assert!(retry.is_retry_notification);
        assert_eq!(retry.retry_info.as_ref().unwrap().retry_count, 1);

        // The draft survives interleaved recovery messages.
        assert_eq!(
            conv.messages[3].agents_used,
            Some(vec!["charter".to_string()])
        );
        for msg in &conv.messages {
            msg.validate().unwrap();
        }
    }

    #[test]
    fn test_exhausted_retries_end_with_error_message() {
        let mut rec = Recorder::new();
        rec.user(1, "chart BTC")
            .rejection(1, Some(1))
            .rejection(1, Some(2))
            .rejection(1, Some(3))
            .rejection(1, None)
            .event(
                Some(1),
                EventPayload::error("Prompt rejected by the content filter 4 times", false),
            )
            .event(Some(1), EventPayload::status(SessionStatus::Idle));

        let conv = fold(&rec.entries);
        let last = conv.messages.last().unwrap();
        assert_eq!(last.role, Role::Error);
        let notifications = conv
            .messages
            .iter()
            .filter(|m| m.is_retry_notification)
            .count();
        assert_eq!(notifications, 3);
    }

    #[test]
    fn test_session_level_and_recoverable_errors_are_not_history() {
        let mut rec = Recorder::new();
        rec.user(1, "first")
            .event(
                None,
                EventPayload::error("a turn is already in progress", false),
            )
            .event(None, EventPayload::error("malformed message", true))
            .event(Some(1), EventPayload::error("cancellation incomplete", true))
            .result(1, "answer", &[]);

        let conv = fold(&rec.entries);
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].role, Role::Assistant);
    }

    #[test]
    fn test_cancelled_turn_discards_draft() {
        let mut rec = Recorder::new();
        rec.user(1, "slow question")
            .step(1, "analyst", StepStatus::Working)
            .event(Some(1), EventPayload::status(SessionStatus::Cancelled))
            .user(2, "next question")
            .result(2, "fast answer", &[]);

        let conv = fold(&rec.entries);
        let roles: Vec<Role> = conv.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::System, Role::User, Role::Assistant]
        );
        assert_eq!(conv.messages[1].content, "Turn cancelled");
        // Nothing from turn 1 leaks into turn 2's answer.
        assert!(conv.messages[3].is_quick_result);
        assert_eq!(conv.messages[3].agents_used, Some(vec![]));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut rec = Recorder::new();
        rec.user(1, "BTC price?")
            .step(1, "analyst", StepStatus::Working)
            .rejection(1, Some(1))
            .result(1, "97k", &["analyst"])
            .user(2, "and ETH?")
            .result(2, "3k", &[]);

        let first = fold(&rec.entries);
        let second = fold(&rec.entries);
        assert_eq!(first, second);

        // Incremental folding matches the batch replay.
        let mut acc = ConversationAccumulator::new("conv-1", base());
        for entry in &rec.entries {
            acc.append(entry);
        }
        assert_eq!(acc.snapshot(), first);
    }

    #[test]
    fn test_resume_continues_ids_and_history() {
        let mut rec = Recorder::new();
        rec.user(1, "first").result(1, "one", &[]);
        let stored = fold(&rec.entries);

        let mut acc = ConversationAccumulator::resume(stored.clone());
        acc.append(&HistoryEntry::User {
            turn_id: 1,
            content: "second".to_string(),
            timestamp: base() + Duration::seconds(60),
        });

        let conv = acc.conversation();
        assert_eq!(conv.messages.len(), 3);
        assert_eq!(conv.title.as_deref(), Some("first"));
        let ids: std::collections::HashSet<&str> =
            conv.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_derive_title_truncates_on_char_boundary() {
        let long = "é".repeat(80);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(title.ends_with('…'));
        assert_eq!(derive_title("  short  "), "short");
    }
}
