//! Per-turn handles given to collaborators.
//!
//! The emitter API is shaped so causal order holds by construction: a tool call
//! can only be made through the [`AgentScope`] whose `working` step was already
//! emitted, and the matching `tool_result` can only be emitted by finishing the
//! [`ToolCallScope`] that `tool_call` returned.

use std::sync::Arc;

use convoy_protocol::{ChartInfo, EventPayload, StepStatus};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{AgentFault, ContentFilter, FilterRejection};
use crate::session::{EventSequencer, Source, SubmitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("turn cancelled")]
    Cancelled,

    #[error("session closed")]
    Closed,
}

impl From<SubmitError> for EmitError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Closed => Self::Closed,
            SubmitError::TurnSealed(_) => Self::Cancelled,
        }
    }
}

/// Emits collaborator events for one turn.
#[derive(Clone)]
pub struct TurnEmitter {
    turn: u32,
    sequencer: EventSequencer,
    cancel: CancellationToken,
    agents: Arc<Mutex<Vec<String>>>,
}

impl TurnEmitter {
    pub fn new(turn: u32, sequencer: EventSequencer, cancel: CancellationToken) -> Self {
        Self {
            turn,
            sequencer,
            cancel,
            agents: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn turn_id(&self) -> u32 {
        self.turn
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Submit a raw payload for this turn.
    pub fn emit(&self, payload: EventPayload) -> Result<u64, EmitError> {
        if self.cancel.is_cancelled() {
            return Err(EmitError::Cancelled);
        }
        Ok(self
            .sequencer
            .submit(Source::Collaborator(self.turn), payload)?)
    }

    /// Announce that `name` started working and return its scope.
    pub fn agent(
        &self,
        name: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Result<AgentScope, EmitError> {
        let scope = AgentScope {
            emitter: self.clone(),
            name: name.into(),
            emoji: emoji.into(),
        };
        scope.step(StepStatus::Working, None)?;
        self.note_agent(&scope.name);
        Ok(scope)
    }

    pub fn chart(&self, chart: ChartInfo) -> Result<(), EmitError> {
        self.emit(EventPayload::Chart {
            chart_id: chart.chart_id,
            url: chart.url,
            symbol: chart.symbol,
        })?;
        Ok(())
    }

    /// Agents that emitted at least one step this turn, in first-seen order.
    pub fn agents_seen(&self) -> Vec<String> {
        self.agents.lock().clone()
    }

    fn note_agent(&self, name: &str) {
        let mut agents = self.agents.lock();
        if !agents.iter().any(|a| a == name) {
            agents.push(name.to_string());
        }
    }
}

/// An agent whose `working` step has been emitted.
pub struct AgentScope {
    emitter: TurnEmitter,
    name: String,
    emoji: String,
}

impl AgentScope {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Intermediate status update.
    pub fn working(&self, message: impl Into<String>) -> Result<(), EmitError> {
        self.step(StepStatus::Working, Some(message.into()))
    }

    /// Emit `tool_call`. The returned scope emits the matching `tool_result`.
    pub fn tool_call(
        &self,
        tool_name: impl Into<String>,
        arguments: Option<Value>,
    ) -> Result<ToolCallScope<'_>, EmitError> {
        let tool_name = tool_name.into();
        self.emitter.emit(EventPayload::ToolCall {
            agent: self.name.clone(),
            tool_name: tool_name.clone(),
            arguments,
        })?;
        Ok(ToolCallScope {
            agent: self,
            tool_name,
        })
    }

    pub fn complete(self, message: Option<String>) -> Result<(), EmitError> {
        self.step(StepStatus::Completed, message)
    }

    pub fn fail(self, message: impl Into<String>) -> Result<(), EmitError> {
        self.step(StepStatus::Error, Some(message.into()))
    }

    fn step(&self, status: StepStatus, message: Option<String>) -> Result<(), EmitError> {
        self.emitter.emit(EventPayload::AgentStep {
            agent: self.name.clone(),
            emoji: self.emoji.clone(),
            status,
            message,
        })?;
        Ok(())
    }
}

/// A tool call awaiting its result.
#[must_use = "a tool call must be finished to emit its tool_result"]
pub struct ToolCallScope<'a> {
    agent: &'a AgentScope,
    tool_name: String,
}

impl ToolCallScope<'_> {
    pub fn finish(self, success: bool, result_preview: Option<String>) -> Result<(), EmitError> {
        self.agent.emitter.emit(EventPayload::ToolResult {
            tool_name: self.tool_name,
            success,
            result_preview,
            agent: Some(self.agent.name.clone()),
        })?;
        Ok(())
    }
}

/// Step budget for one turn, shared by every attempt.
///
/// Each consumed step emits a `progress` event. The counter saturates at
/// `max_turns` and the emitted values never decrease.
#[derive(Clone)]
pub struct ProgressTracker {
    used: Arc<Mutex<u32>>,
    max_turns: u32,
    emitter: TurnEmitter,
}

impl ProgressTracker {
    pub fn new(max_turns: u32, emitter: TurnEmitter) -> Self {
        Self {
            used: Arc::new(Mutex::new(0)),
            max_turns,
            emitter,
        }
    }

    pub fn used(&self) -> u32 {
        *self.used.lock()
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn has_remaining(&self) -> bool {
        self.used() < self.max_turns
    }

    /// Consume one step. Returns `false` when the budget is already spent.
    pub fn advance(&self) -> Result<bool, EmitError> {
        // Held across the emit so concurrent advances publish in counter order.
        let mut used = self.used.lock();
        if *used >= self.max_turns {
            return Ok(false);
        }
        *used += 1;
        self.emitter
            .emit(EventPayload::progress(*used, self.max_turns))?;
        Ok(true)
    }
}

/// Everything a turn's attempts share.
#[derive(Clone)]
pub struct TurnScope {
    emitter: TurnEmitter,
    progress: ProgressTracker,
    filter: Arc<dyn ContentFilter>,
}

impl TurnScope {
    pub fn new(emitter: TurnEmitter, max_turns: u32, filter: Arc<dyn ContentFilter>) -> Self {
        let progress = ProgressTracker::new(max_turns, emitter.clone());
        Self {
            emitter,
            progress,
            filter,
        }
    }

    pub fn emitter(&self) -> &TurnEmitter {
        &self.emitter
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Context for one attempt.
    pub fn context(&self, attempt: u32, previous_rejection: Option<FilterRejection>) -> TurnContext {
        TurnContext {
            attempt,
            previous_rejection,
            emitter: self.emitter.clone(),
            progress: self.progress.clone(),
            filter: self.filter.clone(),
        }
    }
}

/// What an [`Agent`](super::Agent) sees during one attempt.
pub struct TurnContext {
    attempt: u32,
    previous_rejection: Option<FilterRejection>,
    emitter: TurnEmitter,
    progress: ProgressTracker,
    filter: Arc<dyn ContentFilter>,
}

impl TurnContext {
    pub fn turn_id(&self) -> u32 {
        self.emitter.turn_id()
    }

    /// 0 for the first attempt, then the retry count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The rejection that caused this retry, if any.
    pub fn previous_rejection(&self) -> Option<&FilterRejection> {
        self.previous_rejection.as_ref()
    }

    pub fn emitter(&self) -> &TurnEmitter {
        &self.emitter
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn is_cancelled(&self) -> bool {
        self.emitter.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.emitter.cancellation_token()
    }

    /// Resolves once the turn is cancelled.
    pub async fn cancelled(&self) {
        self.emitter.cancellation_token().cancelled().await
    }

    /// `Err(Cancelled)` if the turn was cancelled.
    pub fn checkpoint(&self) -> Result<(), AgentFault> {
        if self.is_cancelled() {
            Err(AgentFault::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `prompt` past the content filter, racing cancellation.
    pub async fn screen_prompt(&self, prompt: &str) -> Result<(), AgentFault> {
        self.checkpoint()?;
        let verdict = tokio::select! {
            verdict = self.filter.screen(prompt) => verdict,
            _ = self.cancelled() => return Err(AgentFault::Cancelled),
        };
        let verdict = verdict.map_err(|err| AgentFault::Failed {
            message: "content filter unavailable".to_string(),
            details: Some(err.to_string()),
        })?;
        if verdict.rejected {
            return Err(AgentFault::ContentFiltered(FilterRejection {
                prompt: prompt.to_string(),
                filter_type: verdict.filter_type,
                filter_results: verdict.filter_results,
            }));
        }
        Ok(())
    }

    pub fn agent(
        &self,
        name: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Result<AgentScope, AgentFault> {
        Ok(self.emitter.agent(name, emoji)?)
    }

    pub fn chart(&self, chart: ChartInfo) -> Result<(), AgentFault> {
        Ok(self.emitter.chart(chart)?)
    }

    /// Consume one budget step. `false` once the budget is spent.
    pub fn advance(&self) -> Result<bool, AgentFault> {
        Ok(self.progress.advance()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{FilterVerdict, KeywordFilter, PassthroughFilter};
    use crate::session::OutboundStream;
    use async_trait::async_trait;
    use convoy_protocol::ServerEvent;
    use std::time::Duration;

    fn turn_scope(filter: Arc<dyn ContentFilter>, max_turns: u32) -> (TurnScope, OutboundStream) {
        let (sequencer, stream) = EventSequencer::new(256);
        sequencer.open_turn(1);
        let emitter = TurnEmitter::new(1, sequencer, CancellationToken::new());
        (TurnScope::new(emitter, max_turns, filter), stream)
    }

    fn drain(stream: &mut OutboundStream) -> Vec<ServerEvent> {
        std::iter::from_fn(|| stream.try_next()).collect()
    }

    #[test]
    fn test_scoped_emission_order() {
        let (scope, mut stream) = turn_scope(Arc::new(PassthroughFilter), 10);
        let ctx = scope.context(0, None);

        let analyst = ctx.agent("analyst", "📈").unwrap();
        let call = analyst
            .tool_call("get_price", Some(serde_json::json!({"symbol": "BTC"})))
            .unwrap();
        call.finish(true, Some("97000".to_string())).unwrap();
        analyst.complete(None).unwrap();

        let events = drain(&mut stream);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["agent_step", "tool_call", "tool_result", "agent_step"]);
        match &events[2].payload {
            EventPayload::ToolResult { agent, tool_name, .. } => {
                assert_eq!(agent.as_deref(), Some("analyst"));
                assert_eq!(tool_name, "get_price");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(events.iter().all(|e| e.turn_id == Some(1)));
        assert_eq!(scope.emitter().agents_seen(), vec!["analyst".to_string()]);
    }

    #[test]
    fn test_emit_fails_after_cancel() {
        let (scope, mut stream) = turn_scope(Arc::new(PassthroughFilter), 10);
        let ctx = scope.context(0, None);
        let agent = ctx.agent("analyst", "📈").unwrap();

        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.checkpoint(), Err(AgentFault::Cancelled)));
        assert_eq!(agent.working("still going"), Err(EmitError::Cancelled));
        assert!(matches!(ctx.agent("late", "⏰"), Err(AgentFault::Cancelled)));

        assert_eq!(drain(&mut stream).len(), 1);
        assert_eq!(scope.emitter().agents_seen(), vec!["analyst".to_string()]);
    }

    #[test]
    fn test_progress_saturates_at_budget() {
        let (scope, mut stream) = turn_scope(Arc::new(PassthroughFilter), 2);
        let ctx = scope.context(0, None);

        assert!(ctx.advance().unwrap());
        assert!(ctx.advance().unwrap());
        assert!(!ctx.advance().unwrap());
        assert!(!scope.progress().has_remaining());

        let events = drain(&mut stream);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload, EventPayload::progress(2, 2));
    }

    #[tokio::test]
    async fn test_screen_prompt_reports_rejection() {
        let filter = Arc::new(KeywordFilter::new(vec!["forbidden".to_string()]));
        let (scope, _stream) = turn_scope(filter, 10);
        let ctx = scope.context(0, None);

        ctx.screen_prompt("a harmless prompt").await.unwrap();
        match ctx.screen_prompt("something Forbidden here").await {
            Err(AgentFault::ContentFiltered(rejection)) => {
                assert_eq!(rejection.prompt, "something Forbidden here");
                assert_eq!(rejection.filter_type.as_deref(), Some("keyword"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    struct StalledFilter;

    #[async_trait]
    impl ContentFilter for StalledFilter {
        async fn screen(&self, _prompt: &str) -> anyhow::Result<FilterVerdict> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(FilterVerdict::allow())
        }
    }

    #[tokio::test]
    async fn test_screen_prompt_observes_cancellation() {
        let (scope, _stream) = turn_scope(Arc::new(StalledFilter), 10);
        let ctx = scope.context(0, None);
        let token = ctx.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), ctx.screen_prompt("p"))
            .await
            .unwrap();
        assert!(matches!(result, Err(AgentFault::Cancelled)));
    }

    struct BrokenFilter;

    #[async_trait]
    impl ContentFilter for BrokenFilter {
        async fn screen(&self, _prompt: &str) -> anyhow::Result<FilterVerdict> {
            anyhow::bail!("upstream timeout")
        }
    }

    #[tokio::test]
    async fn test_filter_failure_is_agent_failure() {
        let (scope, _stream) = turn_scope(Arc::new(BrokenFilter), 10);
        let ctx = scope.context(0, None);
        match ctx.screen_prompt("p").await {
            Err(AgentFault::Failed { details, .. }) => {
                assert_eq!(details.as_deref(), Some("upstream timeout"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
