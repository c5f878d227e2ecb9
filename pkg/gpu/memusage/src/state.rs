// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    /// Constructed, never started.
    Idle,
    /// Background task is ticking.
    Running,
    /// Shutdown signalled, waiting for the current tick to finish.
    Stopping,
    /// Terminal. No further ticks.
    Stopped,
}

impl SamplerState {
    pub fn is_running(self) -> bool {
        self == SamplerState::Running
    }

    pub(crate) fn can_transition_to(self, next: SamplerState) -> bool {
        use SamplerState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Idle, Stopped) | (Running, Stopping) | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for SamplerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerState::Idle => write!(f, "idle"),
            SamplerState::Running => write!(f, "running"),
            SamplerState::Stopping => write!(f, "stopping"),
            SamplerState::Stopped => write!(f, "stopped"),
        }
    }
}
