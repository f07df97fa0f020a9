//! Collaborators that ship with the server.

use async_trait::async_trait;
use serde_json::json;

use super::{Agent, AgentFault, AgentReply, ContentFilter, FilterVerdict, TurnContext, TurnRequest};

/// Development agent: screens the prompt and echoes it back.
///
/// A retry after a filter rejection replies with a neutral summary instead of
/// repeating the rejected text.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&self, request: &TurnRequest, ctx: &TurnContext) -> Result<AgentReply, AgentFault> {
        let assistant = ctx.agent("assistant", "🤖")?;

        let prompt = match ctx.previous_rejection() {
            None => request.prompt.clone(),
            Some(rejection) => format!(
                "A request of {} characters was withheld after a content filter rejection.",
                rejection.prompt.chars().count()
            ),
        };
        if let Err(fault) = ctx.screen_prompt(&prompt).await {
            if matches!(fault, AgentFault::ContentFiltered(_)) {
                assistant.fail("Prompt rejected by the content filter")?;
            }
            return Err(fault);
        }
        ctx.advance()?;

        assistant.complete(None)?;
        Ok(AgentReply::text(prompt))
    }
}

/// Filter that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFilter;

#[async_trait]
impl ContentFilter for PassthroughFilter {
    async fn screen(&self, _prompt: &str) -> anyhow::Result<FilterVerdict> {
        Ok(FilterVerdict::allow())
    }
}

/// Rejects prompts containing any configured term, case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    blocked_terms: Vec<String>,
}

impl KeywordFilter {
    pub fn new(blocked_terms: Vec<String>) -> Self {
        Self {
            blocked_terms: blocked_terms
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_terms.is_empty()
    }
}

#[async_trait]
impl ContentFilter for KeywordFilter {
    async fn screen(&self, prompt: &str) -> anyhow::Result<FilterVerdict> {
        let lowered = prompt.to_lowercase();
        let matched: Vec<&str> = self
            .blocked_terms
            .iter()
            .filter(|term| lowered.contains(term.as_str()))
            .map(String::as_str)
            .collect();
        if matched.is_empty() {
            return Ok(FilterVerdict::allow());
        }
        Ok(FilterVerdict {
            rejected: true,
            filter_type: Some("keyword".to_string()),
            filter_results: Some(json!({ "matched_terms": matched })),
        })
    }
}
