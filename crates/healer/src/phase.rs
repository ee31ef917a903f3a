//! Per-server, per-stage healing state machine.

use std::fmt;

use serde::Serialize;

/// Position of one server within one healing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealPhase {
    /// Nothing attempted yet
    Idle,
    /// Audio restart request sent
    AudioRestartInFlight,
    /// Audio restart rejected; container step is never attempted
    AudioFailed,
    /// Audio restarted, waiting for it to settle
    AudioVerifying,
    /// Container restart request sent
    ContainerRestartInFlight,
    /// Container restart rejected
    ContainerFailed,
    /// Both repairs accepted, waiting before the verification probe
    Verifying,
    /// Probe reported healthy
    VerifiedHealthy,
    /// Probe reported anything else
    VerifiedUnhealthy,
}

/// Inputs that drive [`HealPhase`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    AudioSucceeded,
    AudioFailed,
    Settled,
    ContainerSucceeded,
    ContainerFailed,
    Healthy,
    Unhealthy,
}

impl HealPhase {
    /// Apply an event. Returns `None` when the event is not valid here.
    #[must_use]
    pub fn advance(self, event: PhaseEvent) -> Option<Self> {
        use PhaseEvent as E;

        match (self, event) {
            (Self::Idle, E::Start) => Some(Self::AudioRestartInFlight),
            (Self::AudioRestartInFlight, E::AudioFailed) => Some(Self::AudioFailed),
            (Self::AudioRestartInFlight, E::AudioSucceeded) => Some(Self::AudioVerifying),
            (Self::AudioVerifying, E::Settled) => Some(Self::ContainerRestartInFlight),
            (Self::ContainerRestartInFlight, E::ContainerFailed) => Some(Self::ContainerFailed),
            (Self::ContainerRestartInFlight, E::ContainerSucceeded) => Some(Self::Verifying),
            (Self::Verifying, E::Healthy) => Some(Self::VerifiedHealthy),
            (Self::Verifying, E::Unhealthy) => Some(Self::VerifiedUnhealthy),
            _ => None,
        }
    }

    /// Check if this is a terminal phase.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AudioFailed
                | Self::ContainerFailed
                | Self::VerifiedHealthy
                | Self::VerifiedUnhealthy
        )
    }

    /// Whether the stage ended with the server healthy.
    #[must_use]
    pub fn is_healed(&self) -> bool {
        *self == Self::VerifiedHealthy
    }

    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::AudioRestartInFlight => "AudioRestartInFlight",
            Self::AudioFailed => "AudioFailed",
            Self::AudioVerifying => "AudioVerifying",
            Self::ContainerRestartInFlight => "ContainerRestartInFlight",
            Self::ContainerFailed => "ContainerFailed",
            Self::Verifying => "Verifying",
            Self::VerifiedHealthy => "VerifiedHealthy",
            Self::VerifiedUnhealthy => "VerifiedUnhealthy",
        }
    }
}

impl fmt::Display for HealPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
