//! Channel lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one channel.
///
/// # State Machine
///
/// ```text
///            upload             start
/// Idle ──────────────> Uploaded ──────> Running ──pause──> Paused
///  ▲ │  ▲   (replace)     │               │  ▲               │
///  │ │  └─────────────────┘               │  └────resume─────┘
///  │ │                                    │
///  │ └──start-manual──> ManualRunning     │
///  │                         │            │
///  └────stop / complete / fault / disconnect
/// ```
///
/// `Idle` is re-entered after every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChannelState {
    /// Nothing uploaded, nothing running
    #[default]
    Idle,
    /// A program is uploaded and ready to start
    Uploaded,
    /// The uploaded program is executing
    Running,
    /// The uploaded program is paused
    Paused,
    /// Direct setpoint control is active
    ManualRunning,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "Idle"),
            ChannelState::Uploaded => write!(f, "Uploaded"),
            ChannelState::Running => write!(f, "Running"),
            ChannelState::Paused => write!(f, "Paused"),
            ChannelState::ManualRunning => write!(f, "ManualRunning"),
        }
    }
}

impl ChannelState {
    /// True while a run (program or manual) occupies the channel.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ChannelState::Running | ChannelState::Paused | ChannelState::ManualRunning
        )
    }

    /// Check if the state allows uploading a program.
    pub fn can_upload(&self) -> bool {
        matches!(self, ChannelState::Idle | ChannelState::Uploaded)
    }

    /// Check if the state allows starting the uploaded program.
    pub fn can_start(&self) -> bool {
        matches!(self, ChannelState::Uploaded)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, ChannelState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, ChannelState::Paused)
    }

    /// Check if the state allows entering manual mode or idle sampling.
    pub fn can_start_manual(&self) -> bool {
        matches!(self, ChannelState::Idle)
    }

    /// Check if the state allows stopping.
    pub fn can_stop(&self) -> bool {
        self.is_busy()
    }

    /// Check if the state allows skipping the current step.
    pub fn can_skip(&self) -> bool {
        matches!(self, ChannelState::Running)
    }
}
