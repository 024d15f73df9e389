//! Playback admission gate
//!
//! While inactive, received frames still update loss and telemetry state
//! but nothing is written to the playback ring. The transitions are driven
//! from outside the protocol.

use std::sync::atomic::{AtomicU8, Ordering};

const INACTIVE: u8 = 0;
const ACTIVE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Inactive,
    Active,
}

/// Shared two-state gate
#[derive(Debug)]
pub struct StreamGate {
    state: AtomicU8,
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamGate {
    /// A new gate starts inactive
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(INACTIVE),
        }
    }

    /// Start admitting payload. Returns false if already active.
    pub fn activate(&self) -> bool {
        let changed = self.state.swap(ACTIVE, Ordering::AcqRel) != ACTIVE;
        if changed {
            tracing::info!("Stream gate opened");
        }
        changed
    }

    /// Stop admitting payload. Returns false if already inactive.
    pub fn deactivate(&self) -> bool {
        let changed = self.state.swap(INACTIVE, Ordering::AcqRel) != INACTIVE;
        if changed {
            tracing::info!("Stream gate closed");
        }
        changed
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    pub fn state(&self) -> StreamState {
        if self.is_active() {
            StreamState::Active
        } else {
            StreamState::Inactive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let gate = StreamGate::new();
        assert_eq!(gate.state(), StreamState::Inactive);

        assert!(gate.activate());
        assert!(!gate.activate());
        assert!(gate.is_active());

        assert!(gate.deactivate());
        assert!(!gate.deactivate());
        assert_eq!(gate.state(), StreamState::Inactive);
    }
}
