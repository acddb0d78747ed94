use std::fmt;

use tokio::time::Instant;
use tracing::trace;

use super::idle::{MonitorHandle, Watch};
use crate::error::{
    IDLE_TIMEOUT_TRIGGERED_BEFORE_INITIATING_INBOUND_RESPONSE,
    IDLE_TIMEOUT_TRIGGERED_WHILE_READING_INBOUND_RESPONSE_BODY,
    IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY,
};

/// The stage of an exchange's lifecycle.
///
/// Phases only move forward: `Connecting`, `WritingRequest`,
/// `AwaitingResponse`, `ReadingResponse`, then `Complete`. `Failed` can be
/// entered from any phase that is not already terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for a connection to carry the request.
    Connecting,
    /// The request head and body are being written.
    WritingRequest,
    /// The request is fully written; no response byte has arrived yet.
    AwaitingResponse,
    /// The response has started arriving.
    ReadingResponse,
    /// The response was fully received.
    Complete,
    /// The exchange failed.
    Failed,
}

impl Phase {
    /// Returns true for `Complete` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(*self, Phase::Complete | Phase::Failed)
    }

    /// Returns true if an exchange in this phase may move to `next`.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        use self::Phase::*;
        match (*self, next) {
            (Connecting, WritingRequest)
            | (WritingRequest, AwaitingResponse)
            | (AwaitingResponse, ReadingResponse)
            | (ReadingResponse, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// The message an idle timeout in this phase is reported with.
    ///
    /// Only the phases an idle timer watches have one.
    pub fn timeout_message(&self) -> Option<&'static str> {
        match *self {
            Phase::WritingRequest => Some(IDLE_TIMEOUT_TRIGGERED_WHILE_WRITING_OUTBOUND_REQUEST_BODY),
            Phase::AwaitingResponse => Some(IDLE_TIMEOUT_TRIGGERED_BEFORE_INITIATING_INBOUND_RESPONSE),
            Phase::ReadingResponse => Some(IDLE_TIMEOUT_TRIGGERED_WHILE_READING_INBOUND_RESPONSE_BODY),
            _ => None,
        }
    }

    fn is_watched(&self) -> bool {
        self.timeout_message().is_some()
    }

    fn index(&self) -> usize {
        match *self {
            Phase::Connecting => 0,
            Phase::WritingRequest => 1,
            Phase::AwaitingResponse => 2,
            Phase::ReadingResponse => 3,
            Phase::Complete => 4,
            Phase::Failed => 5,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Phase::Connecting => "CONNECTING",
            Phase::WritingRequest => "WRITING_REQUEST",
            Phase::AwaitingResponse => "AWAITING_RESPONSE",
            Phase::ReadingResponse => "READING_RESPONSE",
            Phase::Complete => "COMPLETE",
            Phase::Failed => "FAILED",
        })
    }
}

/// Records which phase one exchange is in, and keeps the bound idle
/// monitor watching the right one.
///
/// Callers serialize access; the exchange keeps its tracker under its lock.
pub(crate) struct PhaseTracker {
    phase: Phase,
    entered: [Option<Instant>; 6],
    monitor: Option<MonitorHandle>,
}

impl PhaseTracker {
    pub(crate) fn new() -> PhaseTracker {
        let mut entered = [None; 6];
        entered[Phase::Connecting.index()] = Some(Instant::now());
        PhaseTracker {
            phase: Phase::Connecting,
            entered,
            monitor: None,
        }
    }

    pub(crate) fn current(&self) -> Phase {
        self.phase
    }

    pub(crate) fn entered_at(&self, phase: Phase) -> Option<Instant> {
        self.entered[phase.index()]
    }

    pub(crate) fn monitor(&self) -> Option<&MonitorHandle> {
        self.monitor.as_ref()
    }

    /// Binds the monitor that governs this exchange's scope.
    ///
    /// If the tracker is already in a watched phase the monitor is armed
    /// right away.
    pub(crate) fn bind(&mut self, monitor: Option<MonitorHandle>) {
        if let Some(old) = self.monitor.take() {
            old.disarm();
        }
        self.monitor = monitor;
        if self.phase.is_watched() {
            if let Some(ref monitor) = self.monitor {
                monitor.arm(Watch::Phase(self.phase));
            }
        }
    }

    /// Moves to `next`, re-arming or disarming the monitor to match.
    ///
    /// Returns the phase that was left.
    pub(crate) fn advance(&mut self, next: Phase) -> Result<Phase, Refused> {
        let from = self.phase;
        if from.is_terminal() {
            return Err(Refused::Terminated(from));
        }
        if !from.can_advance_to(next) {
            return Err(Refused::Illegal { from, to: next });
        }

        trace!("phase {} -> {}", from, next);
        self.phase = next;
        self.entered[next.index()] = Some(Instant::now());

        if let Some(ref monitor) = self.monitor {
            if next.is_watched() {
                monitor.arm(Watch::Phase(next));
            } else if next.is_terminal() {
                monitor.disarm();
            }
        }
        Ok(from)
    }
}

impl fmt::Debug for PhaseTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseTracker")
            .field("phase", &self.phase)
            .field("monitored", &self.monitor.is_some())
            .finish()
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Refused {
    Terminated(Phase),
    Illegal { from: Phase, to: Phase },
}
