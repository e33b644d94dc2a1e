// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Config and state objects published by the producer under `icinga:<type>`.

use super::history::StateType;
use super::{Entity, FromFields, Initable};
use crate::define_entity;
use crate::types::{Binary, Bool, UnixMilli};

/// A config/state row that the delta and runtime engines can apply.
pub trait ConfigEntity: Entity + FromFields + Initable {
    /// Fill the id from the hash field and the checksum from the checksum
    /// listing when the body itself omits them.
    fn fill_identity(&mut self, id: &Binary, checksum: Option<&Binary>);
}

define_entity! {
    /// Columns shared by checksummed config objects.
    pub struct ChecksumMeta {
        pub id: Binary,
        pub environment_id: Binary,
        pub properties_checksum: Binary,
    }
}

define_entity! {
    /// Columns shared by relation rows without a checksum.
    pub struct IdMeta {
        pub id: Binary,
        pub environment_id: Binary,
    }
}

macro_rules! config_entity {
    ($t:ty, checksummed) => {
        impl Entity for $t {
            const CHECKSUMMED: bool = true;

            fn id(&self) -> &Binary {
                &self.meta.id
            }

            fn checksum(&self) -> Option<&Binary> {
                Some(&self.meta.properties_checksum)
            }
        }

        impl ConfigEntity for $t {
            fn fill_identity(&mut self, id: &Binary, checksum: Option<&Binary>) {
                if self.meta.id.is_empty() {
                    self.meta.id = id.clone();
                }
                if let Some(checksum) = checksum {
                    if self.meta.properties_checksum.is_empty() {
                        self.meta.properties_checksum = checksum.clone();
                    }
                }
                Initable::init(self);
            }
        }
    };
    ($t:ty) => {
        impl Entity for $t {
            fn id(&self) -> &Binary {
                &self.meta.id
            }
        }

        impl ConfigEntity for $t {
            fn fill_identity(&mut self, id: &Binary, _checksum: Option<&Binary>) {
                if self.meta.id.is_empty() {
                    self.meta.id = id.clone();
                }
                Initable::init(self);
            }
        }
    };
}

define_entity! {
    pub struct Endpoint {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub zone_id: Binary,
    }
}
config_entity!(Endpoint, checksummed);

define_entity! {
    pub struct Zone {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub is_global: Bool,
        pub parent_id: Binary,
        pub depth: u8,
    }
}
config_entity!(Zone, checksummed);

define_entity! {
    pub struct Host {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub display_name: String,
        pub address: String,
        pub address6: String,
        pub checkcommand_name: String,
        pub checkcommand_id: Binary,
        pub max_check_attempts: u32,
        pub check_timeperiod_name: String,
        pub check_timeperiod_id: Binary,
        pub check_timeout: Option<u32>,
        pub check_interval: u32,
        pub check_retry_interval: u32,
        pub active_checks_enabled: Bool,
        pub passive_checks_enabled: Bool,
        pub event_handler_enabled: Bool,
        pub notifications_enabled: Bool,
        pub flapping_enabled: Bool,
        pub perfdata_enabled: Bool,
        pub is_volatile: Bool,
        pub zone_name: String,
        pub zone_id: Binary,
        pub command_endpoint_name: String,
        pub command_endpoint_id: Binary,
        pub notes: String,
        pub icon_image_alt: String,
    }
}
config_entity!(Host, checksummed);

define_entity! {
    pub struct Service {
        pub meta: ChecksumMeta,
        pub host_id: Binary,
        pub name_checksum: Binary,
        pub name: String,
        pub display_name: String,
        pub checkcommand_name: String,
        pub checkcommand_id: Binary,
        pub max_check_attempts: u32,
        pub check_timeperiod_name: String,
        pub check_timeperiod_id: Binary,
        pub check_timeout: Option<u32>,
        pub check_interval: u32,
        pub check_retry_interval: u32,
        pub active_checks_enabled: Bool,
        pub passive_checks_enabled: Bool,
        pub event_handler_enabled: Bool,
        pub notifications_enabled: Bool,
        pub flapping_enabled: Bool,
        pub perfdata_enabled: Bool,
        pub is_volatile: Bool,
        pub zone_name: String,
        pub zone_id: Binary,
        pub command_endpoint_name: String,
        pub command_endpoint_id: Binary,
        pub notes: String,
    }
}
config_entity!(Service, checksummed);

define_entity! {
    pub struct Hostgroup {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub display_name: String,
        pub zone_id: Binary,
    }
}
config_entity!(Hostgroup, checksummed);

define_entity! {
    pub struct Servicegroup {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub display_name: String,
        pub zone_id: Binary,
    }
}
config_entity!(Servicegroup, checksummed);

define_entity! {
    pub struct HostgroupMember {
        pub meta: IdMeta,
        pub host_id: Binary,
        pub hostgroup_id: Binary,
    }
}
config_entity!(HostgroupMember);

define_entity! {
    pub struct ServicegroupMember {
        pub meta: IdMeta,
        pub service_id: Binary,
        pub servicegroup_id: Binary,
    }
}
config_entity!(ServicegroupMember);

define_entity! {
    pub struct Checkcommand {
        pub meta: ChecksumMeta,
        pub zone_id: Binary,
        pub name_checksum: Binary,
        pub name: String,
        pub command: String,
        pub timeout: u32,
    }
}
config_entity!(Checkcommand, checksummed);

define_entity! {
    pub struct Timeperiod {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub display_name: String,
        pub prefer_includes: Bool,
        pub zone_id: Binary,
    }
}
config_entity!(Timeperiod, checksummed);

define_entity! {
    pub struct User {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub display_name: String,
        pub email: String,
        pub pager: String,
        pub notifications_enabled: Bool,
        pub timeperiod_id: Binary,
        pub states: u8,
        pub types: u16,
        pub zone_id: Binary,
    }
}
config_entity!(User, checksummed);

define_entity! {
    pub struct Usergroup {
        pub meta: ChecksumMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub display_name: String,
        pub zone_id: Binary,
    }
}
config_entity!(Usergroup, checksummed);

define_entity! {
    pub struct Notification {
        pub meta: ChecksumMeta,
        pub host_id: Binary,
        pub service_id: Binary,
        pub notificationcommand_id: Binary,
        pub name_checksum: Binary,
        pub name: String,
        pub times_begin: Option<u32>,
        pub times_end: Option<u32>,
        pub notification_interval: u32,
        pub timeperiod_id: Binary,
        pub states: u8,
        pub types: u16,
        pub zone_id: Binary,
    }
}
config_entity!(Notification, checksummed);

define_entity! {
    pub struct Comment {
        pub meta: ChecksumMeta,
        pub object_type: String,
        pub host_id: Binary,
        pub service_id: Binary,
        pub name_checksum: Binary,
        pub name: String,
        pub author: String,
        pub text: String,
        pub entry_type: String,
        pub entry_time: UnixMilli,
        pub is_persistent: Bool,
        pub is_sticky: Bool,
        pub expire_time: UnixMilli,
        pub zone_id: Binary,
    }
}
config_entity!(Comment, checksummed);

define_entity! {
    pub struct Downtime {
        pub meta: ChecksumMeta,
        pub triggered_by_id: Binary,
        pub parent_id: Binary,
        pub object_type: String,
        pub host_id: Binary,
        pub service_id: Binary,
        pub name_checksum: Binary,
        pub name: String,
        pub author: String,
        pub comment: String,
        pub entry_time: UnixMilli,
        pub scheduled_start_time: UnixMilli,
        pub scheduled_end_time: UnixMilli,
        pub scheduled_duration: u64,
        pub is_flexible: Bool,
        pub flexible_duration: u64,
        pub is_in_effect: Bool,
        pub start_time: UnixMilli,
        pub end_time: UnixMilli,
        pub duration: u64,
        pub scheduled_by: Option<String>,
        pub zone_id: Binary,
    }
}
config_entity!(Downtime, checksummed);

define_entity! {
    pub struct Customvar {
        pub meta: IdMeta,
        pub name_checksum: Binary,
        pub name: String,
        pub value: String,
    }
}
config_entity!(Customvar);

define_entity! {
    /// One JSON leaf of a custom variable, derived locally.
    pub struct CustomvarFlat {
        pub meta: IdMeta,
        pub customvar_id: Binary,
        pub flatname_checksum: Binary,
        pub flatname: String,
        pub flatvalue: Option<String>,
    }
}
config_entity!(CustomvarFlat);

define_entity! {
    pub struct HostCustomvar {
        pub meta: IdMeta,
        pub host_id: Binary,
        pub customvar_id: Binary,
    }
}
config_entity!(HostCustomvar);

define_entity! {
    pub struct ServiceCustomvar {
        pub meta: IdMeta,
        pub service_id: Binary,
        pub customvar_id: Binary,
    }
}
config_entity!(ServiceCustomvar);

define_entity! {
    /// Columns shared by host and service state.
    pub struct StateMeta {
        pub state_type: StateType,
        pub soft_state: u8,
        pub hard_state: u8,
        pub previous_soft_state: u8,
        pub previous_hard_state: u8,
        pub check_attempt: u32,
        pub severity: u16,
        pub output: Option<String>,
        pub long_output: Option<String>,
        pub performance_data: Option<String>,
        pub check_commandline: Option<String>,
        pub is_problem: Bool,
        pub is_handled: Bool,
        pub is_reachable: Bool,
        pub is_flapping: Bool,
        pub is_overdue: Bool,
        pub is_acknowledged: String,
        pub acknowledgement_comment_id: Binary,
        pub in_downtime: Bool,
        pub execution_time: Option<u32>,
        pub latency: Option<u32>,
        pub check_timeout: Option<u32>,
        pub check_source: Option<String>,
        pub last_update: UnixMilli,
        pub last_state_change: UnixMilli,
        pub next_check: UnixMilli,
        pub next_update: UnixMilli,
    }
}

define_entity! {
    pub struct HostState {
        pub meta: ChecksumMeta,
        pub host_id: Binary,
        pub state: StateMeta,
    }
    init = HostState::default_host_id;
}
config_entity!(HostState, checksummed);

impl HostState {
    fn default_host_id(&mut self) {
        if self.host_id.is_empty() {
            self.host_id = self.meta.id.clone();
        }
    }
}

define_entity! {
    pub struct ServiceState {
        pub meta: ChecksumMeta,
        pub host_id: Binary,
        pub service_id: Binary,
        pub state: StateMeta,
    }
    init = ServiceState::default_service_id;
}
config_entity!(ServiceState, checksummed);

impl ServiceState {
    fn default_service_id(&mut self) {
        if self.service_id.is_empty() {
            self.service_id = self.meta.id.clone();
        }
    }
}

define_entity! {
    /// Environment row upserted by the responsible replica on takeover.
    pub struct Environment {
        pub id: Binary,
        pub name: String,
    }
}

impl Entity for Environment {
    fn id(&self) -> &Binary {
        &self.id
    }
}
