//! Timeout supervisor - startup and idle deadlines for one process

use tokio::time::{Duration, Instant};

/// Which deadline elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No bytes of any kind arrived in time
    Startup,
    /// No block completed within the idle window
    Idle,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Startup => write!(f, "startup"),
            TimeoutKind::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    /// Nothing received yet; both deadlines armed
    AwaitingOutput { startup: Instant, idle: Instant },
    /// Output flowing; only the idle deadline is armed
    Active { idle: Instant },
    /// Fired once, never fires again
    Expired(TimeoutKind),
    /// Cleaned up
    Stopped,
}

/// Two-state timeout supervisor
///
/// Holds deadlines instead of timers: the owner sleeps until [`deadline`]
/// and then calls [`poll`]. A stopped or expired supervisor reports no
/// deadline, so a stale wakeup can never fire.
///
/// [`deadline`]: TimeoutSupervisor::deadline
/// [`poll`]: TimeoutSupervisor::poll
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    state: SupervisorState,
    idle_timeout: Duration,
}

impl TimeoutSupervisor {
    pub fn new(startup_timeout: Duration, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            state: SupervisorState::AwaitingOutput {
                startup: now + startup_timeout,
                idle: now + idle_timeout,
            },
            idle_timeout,
        }
    }

    /// Any bytes arrived on stdout or stderr
    pub fn on_bytes(&mut self) {
        if let SupervisorState::AwaitingOutput { idle, .. } = self.state {
            self.state = SupervisorState::Active { idle };
        }
    }

    /// A block completed; resets the idle window
    pub fn on_block(&mut self, now: Instant) {
        match self.state {
            SupervisorState::AwaitingOutput { .. } | SupervisorState::Active { .. } => {
                self.state = SupervisorState::Active {
                    idle: now + self.idle_timeout,
                };
            }
            SupervisorState::Expired(_) | SupervisorState::Stopped => {}
        }
    }

    /// Next instant at which [`poll`](Self::poll) may report a timeout
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SupervisorState::AwaitingOutput { startup, idle } => Some(startup.min(idle)),
            SupervisorState::Active { idle } => Some(idle),
            SupervisorState::Expired(_) | SupervisorState::Stopped => None,
        }
    }

    /// Report an elapsed deadline, at most once per supervisor
    pub fn poll(&mut self, now: Instant) -> Option<TimeoutKind> {
        let fired = match self.state {
            SupervisorState::AwaitingOutput { startup, idle } => {
                if now >= startup && startup <= idle {
                    Some(TimeoutKind::Startup)
                } else if now >= idle {
                    Some(TimeoutKind::Idle)
                } else if now >= startup {
                    Some(TimeoutKind::Startup)
                } else {
                    None
                }
            }
            SupervisorState::Active { idle } if now >= idle => Some(TimeoutKind::Idle),
            _ => None,
        };

        if let Some(kind) = fired {
            self.state = SupervisorState::Expired(kind);
        }
        fired
    }

    /// Disarm; idempotent
    pub fn stop(&mut self) {
        if !matches!(self.state, SupervisorState::Expired(_)) {
            self.state = SupervisorState::Stopped;
        }
    }

    pub fn expired(&self) -> Option<TimeoutKind> {
        match self.state {
            SupervisorState::Expired(kind) => Some(kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_startup_fires_without_bytes() {
        let t0 = Instant::now();
        let mut sup = TimeoutSupervisor::new(secs(5), secs(60), t0);

        assert_eq!(sup.deadline(), Some(t0 + secs(5)));
        assert_eq!(sup.poll(t0 + secs(4)), None);
        assert_eq!(sup.poll(t0 + secs(5)), Some(TimeoutKind::Startup));
        assert_eq!(sup.poll(t0 + secs(100)), None);
        assert_eq!(sup.expired(), Some(TimeoutKind::Startup));
    }

    #[test]
    fn test_bytes_disarm_startup() {
        let t0 = Instant::now();
        let mut sup = TimeoutSupervisor::new(secs(5), secs(60), t0);
        sup.on_bytes();

        assert_eq!(sup.poll(t0 + secs(10)), None);
        assert_eq!(sup.deadline(), Some(t0 + secs(60)));
        assert_eq!(sup.poll(t0 + secs(60)), Some(TimeoutKind::Idle));
    }

    #[test]
    fn test_block_resets_idle() {
        let t0 = Instant::now();
        let mut sup = TimeoutSupervisor::new(secs(5), secs(60), t0);
        sup.on_block(t0 + secs(50));

        assert_eq!(sup.poll(t0 + secs(100)), None);
        assert_eq!(sup.poll(t0 + secs(110)), Some(TimeoutKind::Idle));
    }

    #[test]
    fn test_stop_disarms() {
        let t0 = Instant::now();
        let mut sup = TimeoutSupervisor::new(secs(5), secs(60), t0);
        sup.stop();
        sup.stop();

        assert_eq!(sup.deadline(), None);
        assert_eq!(sup.poll(t0 + secs(1000)), None);
    }
}
