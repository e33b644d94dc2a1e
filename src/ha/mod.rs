// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! High availability: one responsible replica per environment.
//!
//! The [`controller`] turns producer heartbeats ([`heartbeat`]) into an
//! election against the shared `icingadb_instance` table and signals
//! takeover and handover to the supervisor.

pub mod controller;
pub mod heartbeat;

pub use controller::{HaController, HaSignals, Handover, Takeover};
pub use heartbeat::Heartbeat;

use crate::types::UnixMilli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaState {
    #[default]
    Unresponsible,
    Responsible,
}

/// What telemetry reports about this replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HaStatus {
    pub responsible: bool,
    pub responsible_since: Option<UnixMilli>,
    pub last_other_responsible: Option<UnixMilli>,
    pub performance_data_enabled: bool,
}
