// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! History rows and the pure functions that derive their ids and event times
//! from the fields of a stream entry.

use std::fmt;

use super::{Entity, FieldMap, FromField, FromFields, StructifyError, ToSql, SqlValue};
use crate::define_entity;
use crate::types::objectpacker::{checksum, object_id, Packable};
use crate::types::{Binary, Bool, UnixMilli};

/// History stream kinds, one stream `icinga:history:stream:<kind>` each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    Notification,
    UserNotification,
    State,
    Downtime,
    Comment,
    Flapping,
    Acknowledgement,
}

impl HistoryKind {
    pub const ALL: [HistoryKind; 7] = [
        HistoryKind::Notification,
        HistoryKind::UserNotification,
        HistoryKind::State,
        HistoryKind::Downtime,
        HistoryKind::Comment,
        HistoryKind::Flapping,
        HistoryKind::Acknowledgement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Notification => "notification",
            HistoryKind::UserNotification => "usernotification",
            HistoryKind::State => "state",
            HistoryKind::Downtime => "downtime",
            HistoryKind::Comment => "comment",
            HistoryKind::Flapping => "flapping",
            HistoryKind::Acknowledgement => "acknowledgement",
        }
    }

    pub fn stream_key(&self) -> String {
        format!("icinga:history:stream:{}", self.as_str())
    }

    /// Objects of these kinds recur, so derived ids include a timestamp.
    fn time_scoped(&self) -> bool {
        matches!(
            self,
            HistoryKind::State
                | HistoryKind::Notification
                | HistoryKind::Flapping
                | HistoryKind::Acknowledgement
        )
    }

    /// Field carrying the row id, and the timestamp identifying one occurrence.
    fn row_id_source(&self) -> (&'static str, Option<&'static str>) {
        match self {
            HistoryKind::State => ("id", Some("event_time")),
            HistoryKind::Notification => ("id", Some("send_time")),
            HistoryKind::Flapping => ("id", Some("start_time")),
            HistoryKind::Acknowledgement => ("id", Some("set_time")),
            HistoryKind::Downtime => ("downtime_id", None),
            HistoryKind::Comment => ("comment_id", None),
            HistoryKind::UserNotification => ("id", None),
        }
    }

    /// Event type of an entry: fixed for state and notification, read from
    /// the `event_type` field otherwise.
    pub fn event_type<'a>(&self, fields: &'a FieldMap) -> Result<&'a str, StructifyError> {
        match self {
            HistoryKind::State => Ok("state_change"),
            HistoryKind::Notification => Ok("notification"),
            _ => fields.require("event_type"),
        }
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ENUM('soft', 'hard')`; producers send `0`/`1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateType {
    #[default]
    Soft,
    Hard,
}

impl FromField for StateType {
    fn from_field(raw: &str) -> Result<Self, String> {
        match raw {
            "0" | "soft" | "" => Ok(StateType::Soft),
            "1" | "hard" => Ok(StateType::Hard),
            other => Err(format!("unknown state type {other:?}")),
        }
    }
}

impl ToSql for StateType {
    fn to_sql(&self) -> SqlValue {
        SqlValue::Text(Some(
            match self {
                StateType::Soft => "soft",
                StateType::Hard => "hard",
            }
            .to_string(),
        ))
    }

    fn sql_null() -> SqlValue {
        SqlValue::Text(None)
    }
}

crate::entity::leaf_field!(StateType);

define_entity! {
    /// Columns every history row carries.
    pub struct HistoryMeta {
        pub environment_id: Binary,
        pub endpoint_id: Binary,
        pub object_type: String,
        pub host_id: Binary,
        pub service_id: Binary,
    }
}

define_entity! {
    pub struct StateHistory {
        pub id: Binary,
        pub meta: HistoryMeta,
        pub event_time: UnixMilli,
        pub state_type: StateType,
        pub soft_state: u8,
        pub hard_state: u8,
        pub previous_soft_state: u8,
        pub previous_hard_state: u8,
        pub check_attempt: u32,
        pub output: Option<String>,
        pub long_output: Option<String>,
        pub max_check_attempts: u32,
        pub check_source: Option<String>,
        pub scheduling_source: Option<String>,
    }
}

define_entity! {
    pub struct NotificationHistory {
        pub id: Binary,
        pub meta: HistoryMeta,
        pub notification_id: Binary,
        pub notification_type as "type": String,
        pub send_time: UnixMilli,
        pub state: u8,
        pub previous_hard_state: u8,
        pub author: String,
        pub text: String,
        pub users_notified: u16,
    }
}

define_entity! {
    pub struct UserNotificationHistory {
        pub id: Binary,
        pub environment_id: Binary,
        pub notification_history_id: Binary,
        pub user_id: Binary,
    }
}

define_entity! {
    pub struct DowntimeHistory {
        pub downtime_id: Binary,
        pub meta: HistoryMeta,
        pub triggered_by_id: Binary,
        pub parent_id: Binary,
        pub entry_time: UnixMilli,
        pub author: String,
        pub cancelled_by: Option<String>,
        pub comment: String,
        pub is_flexible: Bool,
        pub flexible_duration: u64,
        pub scheduled_start_time: UnixMilli,
        pub scheduled_end_time: UnixMilli,
        pub start_time: UnixMilli,
        pub end_time: UnixMilli,
        pub scheduled_by: Option<String>,
        pub has_been_cancelled: Bool,
        pub trigger_time: UnixMilli,
        pub cancel_time: UnixMilli,
    }
}

define_entity! {
    pub struct CommentHistory {
        pub comment_id: Binary,
        pub meta: HistoryMeta,
        pub entry_time: UnixMilli,
        pub author: String,
        pub removed_by: Option<String>,
        pub comment: String,
        pub entry_type: String,
        pub is_persistent: Bool,
        pub is_sticky: Bool,
        pub expire_time: UnixMilli,
        pub remove_time: UnixMilli,
        pub has_been_removed: Bool,
    }
}

define_entity! {
    pub struct FlappingHistory {
        pub id: Binary,
        pub meta: HistoryMeta,
        pub start_time: UnixMilli,
        pub end_time: UnixMilli,
        pub percent_state_change_start: Option<f64>,
        pub percent_state_change_end: Option<f64>,
        pub flapping_threshold_low: f32,
        pub flapping_threshold_high: f32,
    }
}

define_entity! {
    pub struct AcknowledgementHistory {
        pub id: Binary,
        pub meta: HistoryMeta,
        pub set_time: UnixMilli,
        pub clear_time: UnixMilli,
        pub author: Option<String>,
        pub cleared_by: Option<String>,
        pub comment: Option<String>,
        pub expire_time: UnixMilli,
        pub is_sticky: Bool,
        pub is_persistent: Bool,
    }
}

define_entity! {
    /// Umbrella row pointing at the kind-specific history row.
    pub struct History {
        pub id: Binary,
        pub meta: HistoryMeta,
        pub event_type: String,
        pub event_time: UnixMilli,
        pub state_history_id: Binary,
        pub notification_history_id: Binary,
        pub downtime_history_id: Binary,
        pub comment_history_id: Binary,
        pub flapping_history_id: Binary,
        pub acknowledgement_history_id: Binary,
    }
}

define_entity! {
    pub struct SlaHistoryState {
        pub id: Binary,
        pub meta: HistoryMeta,
        pub event_time: UnixMilli,
        pub hard_state: u8,
        pub previous_hard_state: u8,
    }
}

define_entity! {
    pub struct SlaHistoryDowntime {
        pub downtime_id: Binary,
        pub meta: HistoryMeta,
        pub downtime_start: UnixMilli,
        pub downtime_end: UnixMilli,
    }
}

macro_rules! history_entity {
    ($t:ty, $pk:ident, [$($upsert:literal),*]) => {
        impl Entity for $t {
            fn primary_key() -> &'static str {
                stringify!($pk)
            }

            fn id(&self) -> &Binary {
                &self.$pk
            }

            fn upsert_columns() -> Option<Vec<&'static str>> {
                Some(vec![$($upsert),*])
            }
        }
    };
}

history_entity!(StateHistory, id, []);
history_entity!(NotificationHistory, id, []);
history_entity!(UserNotificationHistory, id, []);
history_entity!(DowntimeHistory, downtime_id, ["cancelled_by", "has_been_cancelled", "cancel_time"]);
history_entity!(CommentHistory, comment_id, ["removed_by", "remove_time", "has_been_removed"]);
history_entity!(
    FlappingHistory,
    id,
    ["end_time", "percent_state_change_end", "flapping_threshold_low", "flapping_threshold_high"]
);
history_entity!(AcknowledgementHistory, id, ["cleared_by", "clear_time"]);
history_entity!(History, id, []);
history_entity!(SlaHistoryState, id, []);
history_entity!(SlaHistoryDowntime, downtime_id, ["downtime_end"]);

fn bool_field(fields: &FieldMap, name: &str) -> bool {
    fields.get(name).and_then(Bool::parse).map_or(false, |b| b.0)
}

fn time_field(fields: &FieldMap, name: &'static str) -> Result<UnixMilli, StructifyError> {
    match fields.get(name) {
        Some(raw) => UnixMilli::parse(raw).ok_or_else(|| StructifyError {
            field: name.to_string(),
            value: raw.to_string(),
            reason: "not a millisecond timestamp".into(),
        }),
        None => Ok(UnixMilli(0)),
    }
}

/// Field selected as the event time of the umbrella `history` row.
///
/// A missing field yields zero, which is written as `NULL`.
pub fn event_time(event_type: &str, fields: &FieldMap) -> Result<UnixMilli, StructifyError> {
    let source = match event_type {
        "state_change" => "event_time",
        "notification" => "send_time",
        "downtime_start" => "start_time",
        "downtime_end" if bool_field(fields, "has_been_cancelled") => "cancel_time",
        "downtime_end" => "end_time",
        "comment_add" => "entry_time",
        "comment_remove" if bool_field(fields, "has_been_removed") => "remove_time",
        "comment_remove" => "expire_time",
        "flapping_start" => "start_time",
        "flapping_end" => "end_time",
        "ack_set" => "set_time",
        "ack_clear" => "clear_time",
        other => {
            return Err(StructifyError {
                field: "event_type".into(),
                value: other.to_string(),
                reason: "unknown event type".into(),
            })
        }
    };
    time_field(fields, source)
}

fn environment(fields: &FieldMap) -> Result<Binary, StructifyError> {
    let raw = fields.require("environment_id")?;
    Binary::from_hex(raw).map_err(|e| StructifyError {
        field: "environment_id".into(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Object name used for id derivation: `name`, else `host!service` or `host`.
fn object_name(fields: &FieldMap) -> String {
    if let Some(name) = fields.get("name").filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match (fields.get("host_name"), fields.get("service_name")) {
        (Some(host), Some(service)) if !service.is_empty() => format!("{host}!{service}"),
        (Some(host), _) => host.to_string(),
        _ => String::new(),
    }
}

fn hex_field(fields: &FieldMap, name: &str) -> Result<Option<Binary>, StructifyError> {
    match fields.get(name).filter(|v| !v.is_empty()) {
        Some(raw) => Binary::from_hex(raw).map(Some).map_err(|e| StructifyError {
            field: name.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(None),
    }
}

/// Id of the kind-specific row: taken from the entry, else derived.
pub fn row_id(kind: HistoryKind, fields: &FieldMap) -> Result<Binary, StructifyError> {
    let (field, time_source) = kind.row_id_source();
    if let Some(id) = hex_field(fields, field)? {
        return Ok(id);
    }

    let env = environment(fields)?;
    let name = object_name(fields);
    match time_source {
        Some(source) => {
            let time = time_field(fields, source)?;
            let env_hex = env.to_hex();
            Ok(checksum(&Packable::Seq(vec![
                env_hex.as_str().into(),
                kind.as_str().into(),
                name.as_str().into(),
                (time.millis() as f64).into(),
            ])))
        }
        None => Ok(object_id(&env, &name)),
    }
}

/// Id of the umbrella `history` row: `event_id` from the entry, else
/// `sha1(pack([env, event_type, name]))`, with the event time appended for
/// kinds whose objects recur.
pub fn event_id(
    kind: HistoryKind,
    event_type: &str,
    event_time: UnixMilli,
    fields: &FieldMap,
) -> Result<Binary, StructifyError> {
    if let Some(id) = hex_field(fields, "event_id")? {
        return Ok(id);
    }

    let env_hex = environment(fields)?.to_hex();
    let name = object_name(fields);
    let mut parts: Vec<Packable<'_>> =
        vec![env_hex.as_str().into(), event_type.into(), name.as_str().into()];
    if kind.time_scoped() {
        parts.push((event_time.millis() as f64).into());
    }
    Ok(checksum(&Packable::Seq(parts)))
}

pub fn state_history(fields: &FieldMap) -> Result<Option<StateHistory>, StructifyError> {
    let mut row = StateHistory::from_fields(fields)?;
    row.id = row_id(HistoryKind::State, fields)?;
    Ok(Some(row))
}

/// SLA rows are only written for hard state changes.
pub fn sla_history_state(fields: &FieldMap) -> Result<Option<SlaHistoryState>, StructifyError> {
    let state_type = match fields.get("state_type") {
        Some(raw) => StateType::from_field(raw).map_err(|reason| StructifyError {
            field: "state_type".into(),
            value: raw.to_string(),
            reason,
        })?,
        None => StateType::Soft,
    };
    if state_type != StateType::Hard {
        return Ok(None);
    }
    let mut row = SlaHistoryState::from_fields(fields)?;
    row.id = row_id(HistoryKind::State, fields)?;
    Ok(Some(row))
}

pub fn notification_history(fields: &FieldMap) -> Result<Option<NotificationHistory>, StructifyError> {
    let mut row = NotificationHistory::from_fields(fields)?;
    row.id = row_id(HistoryKind::Notification, fields)?;
    Ok(Some(row))
}

pub fn user_notification_history(
    fields: &FieldMap,
) -> Result<Option<UserNotificationHistory>, StructifyError> {
    let mut row = UserNotificationHistory::from_fields(fields)?;
    if row.id.is_empty() {
        let env = row.environment_id.to_hex();
        let notification = row.notification_history_id.to_hex();
        let user = row.user_id.to_hex();
        row.id = checksum(&Packable::Seq(vec![
            env.as_str().into(),
            notification.as_str().into(),
            user.as_str().into(),
        ]));
    }
    Ok(Some(row))
}

pub fn downtime_history(fields: &FieldMap) -> Result<Option<DowntimeHistory>, StructifyError> {
    let mut row = DowntimeHistory::from_fields(fields)?;
    row.downtime_id = row_id(HistoryKind::Downtime, fields)?;
    Ok(Some(row))
}

pub fn sla_history_downtime(fields: &FieldMap) -> Result<Option<SlaHistoryDowntime>, StructifyError> {
    let event_type = HistoryKind::Downtime.event_type(fields)?;
    let mut row = SlaHistoryDowntime::from_fields(fields)?;
    row.downtime_id = row_id(HistoryKind::Downtime, fields)?;
    row.downtime_start = time_field(fields, "start_time")?;
    row.downtime_end = if event_type == "downtime_end" {
        event_time(event_type, fields)?
    } else {
        time_field(fields, "end_time")?
    };
    Ok(Some(row))
}

pub fn comment_history(fields: &FieldMap) -> Result<Option<CommentHistory>, StructifyError> {
    let mut row = CommentHistory::from_fields(fields)?;
    row.comment_id = row_id(HistoryKind::Comment, fields)?;
    Ok(Some(row))
}

pub fn flapping_history(fields: &FieldMap) -> Result<Option<FlappingHistory>, StructifyError> {
    let mut row = FlappingHistory::from_fields(fields)?;
    row.id = row_id(HistoryKind::Flapping, fields)?;
    Ok(Some(row))
}

pub fn acknowledgement_history(
    fields: &FieldMap,
) -> Result<Option<AcknowledgementHistory>, StructifyError> {
    let mut row = AcknowledgementHistory::from_fields(fields)?;
    row.id = row_id(HistoryKind::Acknowledgement, fields)?;
    Ok(Some(row))
}

/// Umbrella `history` row for an entry of `kind`.
pub fn history(kind: HistoryKind, fields: &FieldMap) -> Result<Option<History>, StructifyError> {
    if kind == HistoryKind::UserNotification {
        return Ok(None);
    }

    let event_type = kind.event_type(fields)?;
    let event_time = event_time(event_type, fields)?;
    let link = row_id(kind, fields)?;

    let mut row = History {
        id: event_id(kind, event_type, event_time, fields)?,
        meta: HistoryMeta::from_fields(fields)?,
        event_type: event_type.to_string(),
        event_time,
        ..Default::default()
    };
    match kind {
        HistoryKind::State => row.state_history_id = link,
        HistoryKind::Notification => row.notification_history_id = link,
        HistoryKind::Downtime => row.downtime_history_id = link,
        HistoryKind::Comment => row.comment_history_id = link,
        HistoryKind::Flapping => row.flapping_history_id = link,
        HistoryKind::Acknowledgement => row.acknowledgement_history_id = link,
        HistoryKind::UserNotification => {}
    }
    Ok(Some(row))
}
