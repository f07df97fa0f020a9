//! Turn cancellation.
//!
//! Cancelling a turn is a broadcast plus a deadline. The turn's token is
//! cancelled so every collaborator task sees it at its next suspension point,
//! the sequencer gate is sealed so nothing the turn emits afterwards reaches the
//! client, and the actor waits up to the grace period for the task to wind down
//! before abandoning it.

use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::retry::TurnOutcome;
use super::sequencer::EventSequencer;

/// A spawned turn and its cancellation handle.
pub struct ActiveTurn {
    id: u32,
    token: CancellationToken,
    handle: JoinHandle<TurnOutcome>,
    deadline: Option<Instant>,
}

/// What the actor should react to next for the active turn.
#[derive(Debug)]
pub enum TurnSignal {
    Finished(Result<TurnOutcome, JoinError>),
    GraceExpired,
}

impl ActiveTurn {
    pub fn new(id: u32, token: CancellationToken, handle: JoinHandle<TurnOutcome>) -> Self {
        Self {
            id,
            token,
            handle,
            deadline: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_cancelling(&self) -> bool {
        self.deadline.is_some()
    }

    /// Wait for the task to finish or, once cancelling, for the grace period to lapse.
    pub async fn signal(&mut self) -> TurnSignal {
        match self.deadline {
            Some(deadline) => tokio::select! {
                result = &mut self.handle => TurnSignal::Finished(result),
                _ = tokio::time::sleep_until(deadline) => TurnSignal::GraceExpired,
            },
            None => TurnSignal::Finished((&mut self.handle).await),
        }
    }

    /// Stop any collaborator work still attached to a finished turn.
    pub fn release(self) {
        self.token.cancel();
    }
}

/// Applies the cancellation protocol with a fixed grace period.
#[derive(Debug, Clone, Copy)]
pub struct CancellationController {
    grace: Duration,
}

impl CancellationController {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Broadcast cancellation and start the grace timer.
    pub fn activate(&self, turn: &mut ActiveTurn, sequencer: &EventSequencer) {
        if turn.is_cancelling() {
            return;
        }
        sequencer.seal_turn(turn.id);
        turn.token.cancel();
        turn.deadline = Some(Instant::now() + self.grace);
        debug!(turn = turn.id, grace_ms = self.grace.as_millis() as u64, "cancellation requested");
    }

    /// Forcefully stop a turn whose grace period lapsed.
    pub fn force(&self, turn: ActiveTurn) {
        warn!(
            turn = turn.id,
            grace_ms = self.grace.as_millis() as u64,
            "turn did not stop within the grace period, aborting"
        );
        turn.token.cancel();
        turn.handle.abort();
    }

    /// Cancel a turn nobody will wait for. It is aborted if still running after the grace period.
    pub fn abandon(&self, turn: ActiveTurn, sequencer: &EventSequencer) {
        sequencer.seal_turn(turn.id);
        turn.token.cancel();
        if turn.handle.is_finished() {
            return;
        }
        let id = turn.id;
        let abort = turn.handle.abort_handle();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !abort.is_finished() {
                warn!(turn = id, "abandoned turn still running after grace period, aborting");
                abort.abort();
            }
        });
    }
}
