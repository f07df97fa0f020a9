//! Server -> client events.
//!
//! Every event the server emits for a session is wrapped in a [`ServerEvent`]
//! envelope. Sequenced events carry a strictly increasing `seq`; the
//! out-of-band `pong` carries none.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event envelope
// ============================================================================

/// An event with ordering metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Session-local position in the ordered stream. `None` for out-of-band events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    /// Turn this event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<u32>,

    /// ISO-8601 emission time, monotonic within a session.
    pub timestamp: DateTime<Utc>,

    /// The event payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ServerEvent {
    /// Out-of-band keepalive reply.
    pub fn pong() -> Self {
        Self {
            seq: None,
            turn_id: None,
            timestamp: Utc::now(),
            payload: EventPayload::Pong,
        }
    }

    /// The `type` discriminator of the payload.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// ============================================================================
// Event payloads
// ============================================================================

/// All possible event types, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Session lifecycle --
    /// Session status change.
    Status {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    // -- Agent activity --
    /// An agent started, finished or failed a step.
    AgentStep {
        agent: String,
        emoji: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// An agent invoked a tool.
    ToolCall {
        agent: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
    },

    /// A tool returned.
    ToolResult {
        tool_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_preview: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },

    /// A chart artifact was generated.
    Chart {
        chart_id: String,
        url: String,
        symbol: String,
    },

    /// Step budget consumption for the current turn.
    Progress {
        current_turn: u32,
        max_turns: u32,
        percentage: u8,
    },

    // -- Recovery --
    /// The upstream content filter rejected a generated prompt.
    ContentFilterError {
        message: String,
        triggered_prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter_results: Option<Value>,
    },

    /// A rejected step is being regenerated.
    RetryNotification {
        message: String,
        retry_count: u32,
        max_retries: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter_type: Option<String>,
    },

    // -- Turn terminals --
    /// Final answer for the turn.
    Result {
        content: String,
        format: ResultFormat,
        agents_used: Vec<String>,
    },

    /// Error report. `recoverable: false` terminates the turn.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        recoverable: bool,
    },

    // -- Keepalive --
    /// Reply to a client `ping`.
    Pong,
}

impl EventPayload {
    /// Status event without a message.
    pub fn status(status: SessionStatus) -> Self {
        Self::Status {
            status,
            message: None,
        }
    }

    /// Status event with an explanatory message.
    pub fn status_with(status: SessionStatus, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: Some(message.into()),
        }
    }

    /// Error event.
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Self::Error {
            message: message.into(),
            details: None,
            recoverable,
        }
    }

    /// Progress event, deriving the percentage from the counters.
    ///
    /// `current_turn` is clamped to `max_turns`.
    pub fn progress(current_turn: u32, max_turns: u32) -> Self {
        let current_turn = current_turn.min(max_turns);
        let percentage = if max_turns == 0 {
            100
        } else {
            ((u64::from(current_turn) * 100) / u64::from(max_turns)) as u8
        };
        Self::Progress {
            current_turn,
            max_turns,
            percentage,
        }
    }

    /// The `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::AgentStep { .. } => "agent_step",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Chart { .. } => "chart",
            Self::Progress { .. } => "progress",
            Self::ContentFilterError { .. } => "content_filter_error",
            Self::RetryNotification { .. } => "retry_notification",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }

    /// Intermediate activity that may be shed when a slow client falls behind.
    ///
    /// Lifecycle, recovery and terminal events are never shed.
    pub fn is_sheddable(&self) -> bool {
        matches!(
            self,
            Self::AgentStep { .. }
                | Self::ToolCall { .. }
                | Self::ToolResult { .. }
                | Self::Progress { .. }
        )
    }

    /// `result` or `error` events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. })
    }
}

// ============================================================================
// Supporting types
// ============================================================================

/// Session status values reported in `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Processing,
    Idle,
    Cancelled,
    Disconnecting,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Processing => write!(f, "processing"),
            Self::Idle => write!(f, "idle"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Agent step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Working,
    Completed,
    Error,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Working => write!(f, "working"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Rendering hint for a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    #[default]
    Markdown,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_status_event_serialization() {
        let event = ServerEvent {
            seq: Some(1),
            turn_id: None,
            timestamp: at("2025-02-05T10:00:00Z"),
            payload: EventPayload::status(SessionStatus::Connected),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "connected");
        assert_eq!(json["seq"], 1);
        assert!(json["timestamp"].as_str().unwrap().starts_with("2025-02-05T10:00:00"));
        // Optional fields are omitted, not null.
        assert!(json.get("message").is_none());
        assert!(json.get("turn_id").is_none());
    }

    #[test]
    fn test_agent_step_serialization() {
        let event = ServerEvent {
            seq: Some(4),
            turn_id: Some(1),
            timestamp: at("2025-02-05T10:00:01Z"),
            payload: EventPayload::AgentStep {
                agent: "analyst".to_string(),
                emoji: "📈".to_string(),
                status: StepStatus::Working,
                message: Some("Fetching market data".to_string()),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_step");
        assert_eq!(json["agent"], "analyst");
        assert_eq!(json["status"], "working");
        assert_eq!(json["turn_id"], 1);
    }

    #[test]
    fn test_result_event_parses_from_wire() {
        let wire = r#"{
            "seq": 9,
            "turn_id": 2,
            "timestamp": "2025-02-05T10:00:02Z",
            "type": "result",
            "content": "BTC is trading at 97k",
            "format": "markdown",
            "agents_used": ["analyst"]
        }"#;

        let event: ServerEvent = serde_json::from_str(wire).unwrap();
        assert_eq!(event.seq, Some(9));
        assert_eq!(
            event.payload,
            EventPayload::Result {
                content: "BTC is trading at 97k".to_string(),
                format: ResultFormat::Markdown,
                agents_used: vec!["analyst".to_string()],
            }
        );
    }

    #[test]
    fn test_pong_is_unsequenced() {
        let json = serde_json::to_value(ServerEvent::pong()).unwrap();
        assert_eq!(json["type"], "pong");
        assert!(json.get("seq").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(
            EventPayload::progress(3, 10),
            EventPayload::Progress {
                current_turn: 3,
                max_turns: 10,
                percentage: 30
            }
        );
        // Clamped to the budget.
        assert_eq!(
            EventPayload::progress(12, 10),
            EventPayload::Progress {
                current_turn: 10,
                max_turns: 10,
                percentage: 100
            }
        );
        assert_eq!(
            EventPayload::progress(0, 0),
            EventPayload::Progress {
                current_turn: 0,
                max_turns: 0,
                percentage: 100
            }
        );
    }

    #[test]
    fn test_sheddable_classification() {
        assert!(
            EventPayload::ToolCall {
                agent: "a".to_string(),
                tool_name: "t".to_string(),
                arguments: None,
            }
            .is_sheddable()
        );
        assert!(EventPayload::progress(1, 2).is_sheddable());
        assert!(!EventPayload::error("boom", false).is_sheddable());
        assert!(!EventPayload::status(SessionStatus::Idle).is_sheddable());
        assert!(
            !EventPayload::Result {
                content: String::new(),
                format: ResultFormat::Text,
                agents_used: vec![],
            }
            .is_sheddable()
        );
    }

    #[test]
    fn test_recovery_events_serialization() {
        let payload = EventPayload::RetryNotification {
            message: "Regenerating prompt".to_string(),
            retry_count: 1,
            max_retries: 3,
            filter_type: Some("violence".to_string()),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "retry_notification");
        assert_eq!(json["retry_count"], 1);

        let payload = EventPayload::ContentFilterError {
            message: "Prompt rejected".to_string(),
            triggered_prompt: "draw a chart".to_string(),
            filter_type: None,
            filter_results: Some(serde_json::json!({"hate": {"filtered": true}})),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "content_filter_error");
        assert_eq!(json["filter_results"]["hate"]["filtered"], true);
        assert!(json.get("filter_type").is_none());
    }
}
