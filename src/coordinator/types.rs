// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the supervisor.

/// Daemon lifecycle state.
///
/// Use [`super::Supervisor::state()`] to check the current state or
/// [`super::Supervisor::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Just created, not yet started
    Created,
    /// Connecting to Redis and the database
    Connecting,
    /// Verifying the database schema version
    CheckingSchema,
    /// Connected, waiting to be elected
    Standby,
    /// Elected; sync pipelines are running
    Responsible,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::CheckingSchema => write!(f, "CheckingSchema"),
            Self::Standby => write!(f, "Standby"),
            Self::Responsible => write!(f, "Responsible"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// How one responsible period ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeExit {
    /// Another replica took over or the producer went away.
    Handover(String),
    /// The daemon is stopping.
    Shutdown,
}
