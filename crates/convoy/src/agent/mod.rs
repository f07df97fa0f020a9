//! Collaborator boundary.
//!
//! The session core drives an [`Agent`] for each turn and screens generated
//! prompts through a [`ContentFilter`]. Both are external collaborators: the
//! core only cares about the events they emit and how their work ends.

mod builtin;
mod context;

use async_trait::async_trait;
use convoy_protocol::ResultFormat;
use serde_json::Value;
use thiserror::Error;

pub use builtin::{EchoAgent, KeywordFilter, PassthroughFilter};
pub use context::{
    AgentScope, EmitError, ProgressTracker, ToolCallScope, TurnContext, TurnEmitter, TurnScope,
};

/// What the agent is asked to do for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub prompt: String,
    /// Step budget for the whole turn, retries included.
    pub max_turns: u32,
}

/// The agent's final answer.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub content: String,
    pub format: ResultFormat,
}

impl AgentReply {
    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            format: ResultFormat::Markdown,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            format: ResultFormat::Text,
        }
    }
}

/// A prompt the content filter refused.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRejection {
    pub prompt: String,
    pub filter_type: Option<String>,
    pub filter_results: Option<Value>,
}

/// How an agent run ended without a reply.
#[derive(Debug, Clone, Error)]
pub enum AgentFault {
    #[error("prompt rejected by the content filter")]
    ContentFiltered(FilterRejection),

    #[error("turn cancelled")]
    Cancelled,

    #[error("{message}")]
    Failed {
        message: String,
        details: Option<String>,
    },
}

impl AgentFault {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: None,
        }
    }
}

impl From<EmitError> for AgentFault {
    fn from(_: EmitError) -> Self {
        // Both a cancelled token and a closed stream mean nobody is listening.
        Self::Cancelled
    }
}

/// Runs the multi-agent workflow for a turn.
///
/// Implementations must observe cancellation at every suspension point, either
/// through [`TurnContext::checkpoint`] or by racing [`TurnContext::cancelled`].
/// Every emit on a cancelled turn fails with [`EmitError::Cancelled`].
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, request: &TurnRequest, ctx: &TurnContext) -> Result<AgentReply, AgentFault>;
}

/// Verdict on a single prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterVerdict {
    pub rejected: bool,
    pub filter_type: Option<String>,
    pub filter_results: Option<Value>,
}

impl FilterVerdict {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn reject(filter_type: impl Into<String>) -> Self {
        Self {
            rejected: true,
            filter_type: Some(filter_type.into()),
            filter_results: None,
        }
    }
}

/// Upstream safety check applied to generated prompts.
#[async_trait]
pub trait ContentFilter: Send + Sync {
    async fn screen(&self, prompt: &str) -> anyhow::Result<FilterVerdict>;
}
