//! Bounded regeneration after content-filter rejections.

use convoy_protocol::{EventPayload, ResultFormat};
use tracing::{debug, info};

use crate::agent::{Agent, AgentFault, FilterRejection, TurnRequest, TurnScope};

/// Where a turn is in its retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Attempting,
    FilterRejected,
    Retrying,
    Succeeded,
    ExhaustedRetries,
}

/// How a turn's agent work ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        content: String,
        format: ResultFormat,
        agents_used: Vec<String>,
    },
    Failed {
        message: String,
        details: Option<String>,
    },
    Cancelled,
}

/// Drives an agent, regenerating rejected prompts up to `max_retries` times.
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    max_retries: u32,
}

impl RetryController {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run the turn to completion. At most `max_retries + 1` attempts are made.
    pub async fn drive(&self, agent: &dyn Agent, request: &TurnRequest, scope: &TurnScope) -> TurnOutcome {
        let turn = scope.emitter().turn_id();
        let mut retry_count = 0;
        let mut previous: Option<FilterRejection> = None;
        let mut phase = RetryPhase::Attempting;

        loop {
            debug!(turn, retry_count, ?phase, "starting attempt");
            let ctx = scope.context(retry_count, previous.take());

            let rejection = match agent.run(request, &ctx).await {
                Ok(reply) => {
                    phase = RetryPhase::Succeeded;
                    debug!(turn, retry_count, ?phase, "agent replied");
                    return TurnOutcome::Completed {
                        content: reply.content,
                        format: reply.format,
                        agents_used: scope.emitter().agents_seen(),
                    };
                }
                Err(AgentFault::Cancelled) => return TurnOutcome::Cancelled,
                Err(AgentFault::Failed { message, details }) => {
                    return TurnOutcome::Failed { message, details };
                }
                Err(AgentFault::ContentFiltered(rejection)) => rejection,
            };
            if scope.emitter().is_cancelled() {
                return TurnOutcome::Cancelled;
            }

            phase = RetryPhase::FilterRejected;
            info!(
                turn,
                retry_count,
                ?phase,
                filter_type = rejection.filter_type.as_deref().unwrap_or("unknown"),
                "prompt rejected by content filter"
            );
            let filter_type = rejection.filter_type.clone();
            let reported = scope.emitter().emit(EventPayload::ContentFilterError {
                message: "The generated prompt was rejected by the content filter".to_string(),
                triggered_prompt: rejection.prompt.clone(),
                filter_type: filter_type.clone(),
                filter_results: rejection.filter_results.clone(),
            });
            if reported.is_err() {
                return TurnOutcome::Cancelled;
            }

            if retry_count >= self.max_retries || !scope.progress().has_remaining() {
                phase = RetryPhase::ExhaustedRetries;
                debug!(turn, retry_count, ?phase, "giving up");
                let attempts = retry_count + 1;
                return TurnOutcome::Failed {
                    message: format!(
                        "The request was rejected by the content filter after {attempts} attempt{}",
                        if attempts == 1 { "" } else { "s" }
                    ),
                    details: filter_type.map(|t| format!("filter_type: {t}")),
                };
            }

            retry_count += 1;
            phase = RetryPhase::Retrying;
            let notified = scope.emitter().emit(EventPayload::RetryNotification {
                message: format!(
                    "Regenerating the request (attempt {} of {})",
                    retry_count, self.max_retries
                ),
                retry_count,
                max_retries: self.max_retries,
                filter_type,
            });
            if notified.is_err() || scope.progress().advance().is_err() {
                return TurnOutcome::Cancelled;
            }
            previous = Some(rejection);
        }
    }
}
