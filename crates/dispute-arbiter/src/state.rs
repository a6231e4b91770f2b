//! Run state machine: phases and per-node timing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of an arbitration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    /// Inputs accepted, nothing sent yet.
    Start,
    /// Distributor replied.
    Distributed,
    /// All four judges replied.
    Judged,
    /// Final arbiter produced a schema-valid verdict.
    Arbitrated,
    /// Terminal message re-validated and returned.
    Validated,
    /// Any failure. Terminal.
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Validated | Self::Failed)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [RunPhase] {
        match self {
            Self::Start => &[Self::Distributed, Self::Failed],
            Self::Distributed => &[Self::Judged, Self::Failed],
            Self::Judged => &[Self::Arbitrated, Self::Failed],
            Self::Arbitrated => &[Self::Validated, Self::Failed],
            Self::Validated | Self::Failed => &[],
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Distributed => write!(f, "distributed"),
            Self::Judged => write!(f, "judged"),
            Self::Arbitrated => write!(f, "arbitrated"),
            Self::Validated => write!(f, "validated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A phase transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: RunPhase,
    pub to: RunPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Timing for one completed graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: String,
    pub elapsed_ms: u64,
    /// Length of the appended reply, in bytes.
    pub reply_len: usize,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: RunPhase,
    pub to: RunPhase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} → {} (allowed: {:?})",
            self.from,
            self.to,
            self.from.valid_transitions()
        )
    }
}

impl std::error::Error for TransitionError {}

/// History of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrace {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub transitions: Vec<PhaseTransition>,
    pub nodes: Vec<NodeRecord>,
    pub started_at: DateTime<Utc>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            phase: RunPhase::Start,
            transitions: Vec::new(),
            nodes: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Transition to a new phase with a reason.
    pub fn transition(&mut self, to: RunPhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
        Ok(())
    }

    /// Mark the run failed unless it already ended.
    pub fn fail(&mut self, reason: &str) {
        if !self.phase.is_terminal() {
            // Failed is reachable from every non-terminal phase.
            let _ = self.transition(RunPhase::Failed, reason);
        }
    }

    pub fn record_node(&mut self, record: NodeRecord) {
        self.nodes.push(record);
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Phases visited so far, starting with `Start`.
    pub fn phases(&self) -> Vec<RunPhase> {
        let mut phases = vec![RunPhase::Start];
        phases.extend(self.transitions.iter().map(|t| t.to));
        phases
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    /// Compact status for logs.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] run={} nodes={} elapsed={}ms",
            self.phase,
            self.run_id,
            self.nodes.len(),
            self.elapsed_ms()
        )
    }
}

impl Default for RunTrace {
    fn default() -> Self {
        Self::new()
    }
}
