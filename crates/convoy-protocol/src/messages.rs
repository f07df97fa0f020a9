//! Conversation history types.
//!
//! Messages are the durable units of a conversation. They are folded from the
//! event stream by the session and handed to persistence; the client reads
//! them back when reopening a conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// A single history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,

    pub role: Role,

    pub content: String,

    pub timestamp: DateTime<Utc>,

    /// Agent that produced this message (role `agent`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    /// Agents that contributed to an assistant answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_used: Option<Vec<String>>,

    /// Charts generated while producing this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<ChartInfo>,

    /// Answer produced without any agent step.
    #[serde(default)]
    pub is_quick_result: bool,

    #[serde(default)]
    pub is_retry_notification: bool,

    /// Present iff `role` is `content_filter_error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_filter_details: Option<ContentFilterDetails>,

    /// Present iff `is_retry_notification`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_info: Option<RetryInfo>,
}

impl Message {
    fn base(id: String, role: Role, content: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            content,
            timestamp,
            agent_name: None,
            agents_used: None,
            attachments: Vec::new(),
            is_quick_result: false,
            is_retry_notification: false,
            content_filter_details: None,
            retry_info: None,
        }
    }

    pub fn user(id: String, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::base(id, Role::User, content.into(), timestamp)
    }

    pub fn assistant(
        id: String,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        agents_used: Vec<String>,
        attachments: Vec<ChartInfo>,
    ) -> Self {
        let mut msg = Self::base(id, Role::Assistant, content.into(), timestamp);
        msg.is_quick_result = agents_used.is_empty();
        msg.agents_used = Some(agents_used);
        msg.attachments = attachments;
        msg
    }

    pub fn system(id: String, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::base(id, Role::System, content.into(), timestamp)
    }

    pub fn error(id: String, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::base(id, Role::Error, content.into(), timestamp)
    }

    pub fn content_filter_error(
        id: String,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        details: ContentFilterDetails,
    ) -> Self {
        let mut msg = Self::base(id, Role::ContentFilterError, content.into(), timestamp);
        msg.content_filter_details = Some(details);
        msg
    }

    pub fn retry_notification(
        id: String,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        info: RetryInfo,
    ) -> Self {
        let mut msg = Self::base(id, Role::System, content.into(), timestamp);
        msg.is_retry_notification = true;
        msg.retry_info = Some(info);
        msg
    }

    /// Check the pairing invariants between role, flags and detail payloads.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let is_filter_error = self.role == Role::ContentFilterError;
        if is_filter_error != self.content_filter_details.is_some() {
            return Err(ProtocolError::InvalidMessage(format!(
                "message {}: contentFilterDetails must be present iff role is content_filter_error",
                self.id
            )));
        }
        if self.is_retry_notification != self.retry_info.is_some() {
            return Err(ProtocolError::InvalidMessage(format!(
                "message {}: retryInfo must be present iff isRetryNotification",
                self.id
            )));
        }
        Ok(())
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Agent,
    Error,
    ContentFilterError,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Agent => write!(f, "agent"),
            Self::Error => write!(f, "error"),
            Self::ContentFilterError => write!(f, "content_filter_error"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A generated chart, referenced by messages but owned by the chart service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartInfo {
    pub chart_id: String,
    pub url: String,
    pub symbol: String,
}

/// What the content filter rejected and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFilterDetails {
    pub triggered_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_results: Option<Value>,
}

/// Position of a retry within its bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_type: Option<String>,
}

/// An ordered, append-only message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: None,
            messages: Vec::new(),
            created_at,
            last_message_at: created_at,
        }
    }
}
