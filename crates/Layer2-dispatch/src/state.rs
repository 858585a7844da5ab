//! Lane state machine

use serde::{Deserialize, Serialize};

/// Lifecycle of one (key, lane) slot
///
/// ```text
/// Idle -> Starting -> Running -> Idle          (work finished, process persisted via handoff)
///                     Running -> Draining -> Terminated -> Idle
///         Starting -> Terminated -> Idle       (spawn failure)
/// ```
///
/// `Terminated` only returns to `Idle` once the unit of work that owned the
/// process has finished and the handle is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LanePhase {
    /// Nothing admitted
    #[default]
    Idle,

    /// Work admitted, process not registered yet
    Starting,

    /// Process registered and accepting live input
    Running,

    /// Close requested, waiting for the process to exit
    Draining,

    /// Process gone, owning work still finishing
    Terminated,
}

impl LanePhase {
    /// Occupies a global admission slot
    pub fn is_live(&self) -> bool {
        !matches!(self, LanePhase::Idle)
    }

    /// Can accept live input
    pub fn accepts_input(&self) -> bool {
        matches!(self, LanePhase::Running)
    }

    /// Check whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: LanePhase) -> bool {
        use LanePhase::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Terminated)
                | (Running, Draining)
                | (Running, Terminated)
                | (Draining, Terminated)
                | (Starting, Idle)
                | (Running, Idle)
                | (Draining, Idle)
                | (Terminated, Idle)
        )
    }

    /// Get display name for the phase
    pub fn display_name(&self) -> &'static str {
        match self {
            LanePhase::Idle => "Idle",
            LanePhase::Starting => "Starting",
            LanePhase::Running => "Running",
            LanePhase::Draining => "Draining",
            LanePhase::Terminated => "Terminated",
        }
    }

    /// Get a symbol for the phase
    pub fn symbol(&self) -> &'static str {
        match self {
            LanePhase::Idle => "◯",
            LanePhase::Starting => "◎",
            LanePhase::Running => "⟳",
            LanePhase::Draining => "⏷",
            LanePhase::Terminated => "⊘",
        }
    }
}

impl std::fmt::Display for LanePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
