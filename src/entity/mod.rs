// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity model: typed rows mirrored from the cache into SQL.
//!
//! Entities are declared with [`define_entity!`], which generates the column
//! list, SQL value binding and a structifier from [`FieldMap`]s. Per-type
//! statement plans are computed once and cached in a process-wide map.
//!
//! ```text
//! FieldMap ──FromFields──▶ T: Entity ──Columns──▶ Vec<SqlValue> ──▶ bulk executor
//! ```

mod fields;
pub mod config;
pub mod customvar;
pub mod history;

pub use fields::{FieldMap, FromField, StructifyError};

use dashmap::DashMap;
use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::Any;
use std::any::TypeId;
use std::sync::{Arc, OnceLock};

use crate::types::{Binary, Bool, UnixMilli};

/// A value ready to bind into a statement. `None` binds a typed `NULL`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(Option<i64>),
    Float(Option<f64>),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            SqlValue::Int(None) | SqlValue::Float(None) | SqlValue::Text(None) | SqlValue::Bytes(None)
        )
    }
}

/// Bind values in order onto an `Any` query.
pub fn bind_values<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    values: impl IntoIterator<Item = SqlValue>,
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Bytes(v) => query.bind(v),
        };
    }
    query
}

/// Leaf conversion into a bindable value.
pub trait ToSql {
    fn to_sql(&self) -> SqlValue;
    fn sql_null() -> SqlValue;
}

macro_rules! to_sql_int {
    ($($t:ty),*) => {
        $(
            impl ToSql for $t {
                fn to_sql(&self) -> SqlValue { SqlValue::Int(Some(*self as i64)) }
                fn sql_null() -> SqlValue { SqlValue::Int(None) }
            }
        )*
    };
}

to_sql_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl ToSql for f32 {
    fn to_sql(&self) -> SqlValue { SqlValue::Float(Some(f64::from(*self))) }
    fn sql_null() -> SqlValue { SqlValue::Float(None) }
}

impl ToSql for f64 {
    fn to_sql(&self) -> SqlValue { SqlValue::Float(Some(*self)) }
    fn sql_null() -> SqlValue { SqlValue::Float(None) }
}

impl ToSql for String {
    fn to_sql(&self) -> SqlValue { SqlValue::Text(Some(self.clone())) }
    fn sql_null() -> SqlValue { SqlValue::Text(None) }
}

impl ToSql for Binary {
    fn to_sql(&self) -> SqlValue {
        if self.is_empty() {
            SqlValue::Bytes(None)
        } else {
            SqlValue::Bytes(Some(self.as_bytes().to_vec()))
        }
    }
    fn sql_null() -> SqlValue { SqlValue::Bytes(None) }
}

impl ToSql for UnixMilli {
    fn to_sql(&self) -> SqlValue {
        if self.is_zero() { SqlValue::Int(None) } else { SqlValue::Int(Some(self.0)) }
    }
    fn sql_null() -> SqlValue { SqlValue::Int(None) }
}

impl ToSql for Bool {
    fn to_sql(&self) -> SqlValue { SqlValue::Text(Some(self.as_enum().to_string())) }
    fn sql_null() -> SqlValue { SqlValue::Text(None) }
}

/// A struct field: a leaf column, an optional leaf, or an inlined entity.
pub trait Field: Sized {
    fn push_columns(name: &'static str, out: &mut Vec<&'static str>);
    fn parse(name: &'static str, fields: &FieldMap) -> Result<Self, StructifyError>;
    fn push_values(&self, out: &mut Vec<SqlValue>);
}

pub(crate) fn parse_leaf<T: FromField>(name: &'static str, raw: &str) -> Result<T, StructifyError> {
    T::from_field(raw).map_err(|reason| StructifyError {
        field: name.to_string(),
        value: raw.to_string(),
        reason,
    })
}

/// Implement [`Field`] for leaf types that have [`FromField`] and [`ToSql`].
macro_rules! leaf_field {
    ($($t:ty),*) => {
        $(
            impl $crate::entity::Field for $t {
                fn push_columns(name: &'static str, out: &mut Vec<&'static str>) {
                    out.push(name);
                }

                fn parse(
                    name: &'static str,
                    fields: &$crate::entity::FieldMap,
                ) -> Result<Self, $crate::entity::StructifyError> {
                    match fields.get(name) {
                        Some(raw) => $crate::entity::parse_leaf(name, raw),
                        None => Ok(<$t>::default()),
                    }
                }

                fn push_values(&self, out: &mut Vec<$crate::entity::SqlValue>) {
                    out.push($crate::entity::ToSql::to_sql(self));
                }
            }
        )*
    };
}

pub(crate) use leaf_field;

leaf_field!(String, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, Binary, UnixMilli, Bool);

impl<T: FromField + ToSql> Field for Option<T> {
    fn push_columns(name: &'static str, out: &mut Vec<&'static str>) {
        out.push(name);
    }
    fn parse(name: &'static str, fields: &FieldMap) -> Result<Self, StructifyError> {
        fields.get(name).map(|raw| parse_leaf(name, raw)).transpose()
    }
    fn push_values(&self, out: &mut Vec<SqlValue>) {
        out.push(match self {
            Some(v) => v.to_sql(),
            None => T::sql_null(),
        });
    }
}

/// Ordered column names and values of a row.
pub trait Columns {
    fn push_columns(out: &mut Vec<&'static str>);
    fn push_values(&self, out: &mut Vec<SqlValue>);

    fn columns() -> Vec<&'static str> {
        let mut out = Vec::new();
        Self::push_columns(&mut out);
        out
    }

    fn values(&self) -> Vec<SqlValue> {
        let mut out = Vec::new();
        self.push_values(&mut out);
        out
    }
}

/// Build a value from a field map. Unknown fields are ignored, missing ones
/// leave the zero value.
pub trait FromFields: Sized {
    fn from_fields(fields: &FieldMap) -> Result<Self, StructifyError>;
}

/// Post-construction hook run by [`structify`].
pub trait Initable {
    fn init(&mut self) {}
}

/// Structify a field map and run the init hook.
pub fn structify<T: FromFields + Initable>(fields: &FieldMap) -> Result<T, StructifyError> {
    let mut value = T::from_fields(fields)?;
    value.init();
    Ok(value)
}

/// A row mirrored into the database.
pub trait Entity: Columns + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Overrides the table name derived from the type name.
    const TABLE: Option<&'static str> = None;
    /// Whether [`Entity::checksum`] is meaningful for delta comparison.
    const CHECKSUMMED: bool = false;

    fn table_name() -> String {
        Self::TABLE
            .map(str::to_string)
            .unwrap_or_else(|| table_name_from_type(std::any::type_name::<Self>()))
    }

    fn primary_key() -> &'static str {
        "id"
    }

    fn id(&self) -> &Binary;

    fn checksum(&self) -> Option<&Binary> {
        None
    }

    /// Columns overwritten on primary-key collision. `None` means every
    /// column except the primary key; an empty list means insert-ignore.
    fn upsert_columns() -> Option<Vec<&'static str>> {
        None
    }
}

/// `crate::entity::config::HostState` → `host_state`.
pub fn table_name_from_type(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let short = base.rsplit("::").next().unwrap_or(base);
    let mut out = String::with_capacity(short.len() + 4);
    for (i, c) in short.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Statement plan computed once per entity type.
#[derive(Debug, Clone)]
pub struct EntityPlan {
    pub table: String,
    pub columns: Vec<&'static str>,
    pub primary_key: &'static str,
    pub pk_index: Option<usize>,
    pub upsert_columns: Vec<&'static str>,
}

impl EntityPlan {
    fn build<T: Entity>() -> Self {
        let columns = T::columns();
        let primary_key = T::primary_key();
        let pk_index = columns.iter().position(|c| *c == primary_key);
        let upsert_columns = T::upsert_columns().unwrap_or_else(|| {
            columns.iter().copied().filter(|c| *c != primary_key).collect()
        });
        Self {
            table: T::table_name(),
            columns,
            primary_key,
            pk_index,
            upsert_columns,
        }
    }

    pub fn placeholders_per_row(&self) -> usize {
        self.columns.len()
    }
}

static PLANS: OnceLock<DashMap<TypeId, Arc<EntityPlan>>> = OnceLock::new();

/// Cached plan for `T`.
pub fn plan<T: Entity>() -> Arc<EntityPlan> {
    let plans = PLANS.get_or_init(DashMap::new);
    plans
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Arc::new(EntityPlan::build::<T>()))
        .clone()
}

/// Declare an entity struct with its column mapping and structifier.
///
/// Each field maps to the column of the same name, or to the literal given
/// with `as "column"`. A field whose type is itself declared with this macro
/// is inlined: its columns appear as siblings. An optional trailing
/// `init = path;` names the [`Initable`] hook.
///
/// ```ignore
/// define_entity! {
///     pub struct Zone {
///         pub meta: EntityMeta,
///         pub name: String,
///         pub parent_id: Binary,
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_entity {
    (@column $field:ident) => { stringify!($field) };
    (@column $field:ident $column:literal) => { $column };
    (@init $value:ident) => {};
    (@init $value:ident $init:path) => { $init($value) };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident $(as $column:literal)? : $fty:ty
            ),* $(,)?
        }
        $(init = $init:path;)?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $fty,
            )*
        }

        impl $crate::entity::Columns for $name {
            fn push_columns(out: &mut Vec<&'static str>) {
                $(
                    <$fty as $crate::entity::Field>::push_columns(
                        $crate::define_entity!(@column $field $($column)?),
                        out,
                    );
                )*
            }

            fn push_values(&self, out: &mut Vec<$crate::entity::SqlValue>) {
                $( $crate::entity::Field::push_values(&self.$field, out); )*
            }
        }

        impl $crate::entity::FromFields for $name {
            fn from_fields(
                fields: &$crate::entity::FieldMap,
            ) -> Result<Self, $crate::entity::StructifyError> {
                Ok(Self {
                    $(
                        $field: <$fty as $crate::entity::Field>::parse(
                            $crate::define_entity!(@column $field $($column)?),
                            fields,
                        )?,
                    )*
                })
            }
        }

        impl $crate::entity::Initable for $name {
            #[allow(unused_variables)]
            fn init(&mut self) {
                let value = self;
                $crate::define_entity!(@init value $($init)?);
            }
        }

        impl $crate::entity::Field for $name {
            fn push_columns(_name: &'static str, out: &mut Vec<&'static str>) {
                <Self as $crate::entity::Columns>::push_columns(out)
            }

            fn parse(
                _name: &'static str,
                fields: &$crate::entity::FieldMap,
            ) -> Result<Self, $crate::entity::StructifyError> {
                let mut value = <Self as $crate::entity::FromFields>::from_fields(fields)?;
                $crate::entity::Initable::init(&mut value);
                Ok(value)
            }

            fn push_values(&self, out: &mut Vec<$crate::entity::SqlValue>) {
                <Self as $crate::entity::Columns>::push_values(self, out)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bool;

    crate::define_entity! {
        pub struct Inner {
            pub environment_id: Binary,
            pub name_checksum as "checksum": Binary,
        }
    }

    crate::define_entity! {
        pub struct Outer {
            pub id: Binary,
            pub inner: Inner,
            pub name: String,
            pub check_interval: f64,
            pub active as "is_active": Bool,
            pub last_update: UnixMilli,
            pub note: Option<String>,
        }
        init = Outer::trim_name;
    }

    impl Outer {
        fn trim_name(&mut self) {
            self.name = self.name.trim().to_string();
        }
    }

    impl Entity for Outer {
        fn id(&self) -> &Binary {
            &self.id
        }
    }

    #[test]
    fn test_columns_inline_and_rename() {
        assert_eq!(
            Outer::columns(),
            vec![
                "id",
                "environment_id",
                "checksum",
                "name",
                "check_interval",
                "is_active",
                "last_update",
                "note"
            ]
        );
    }

    #[test]
    fn test_structify_ignores_unknown_and_runs_init() {
        let fields: FieldMap = [
            ("id", "0101"),
            ("environment_id", "ff"),
            ("checksum", "aa"),
            ("name", "  web01 "),
            ("check_interval", "60"),
            ("is_active", "1"),
            ("unrelated", "x"),
        ]
        .into_iter()
        .collect();

        let row: Outer = structify(&fields).unwrap();
        assert_eq!(row.id, Binary::new(vec![1, 1]));
        assert_eq!(row.inner.environment_id, Binary::new(vec![0xff]));
        assert_eq!(row.inner.name_checksum, Binary::new(vec![0xaa]));
        assert_eq!(row.name, "web01");
        assert_eq!(row.check_interval, 60.0);
        assert_eq!(row.active, Bool::TRUE);
        assert!(row.last_update.is_zero());
        assert_eq!(row.note, None);
    }

    #[test]
    fn test_structify_error_names_field() {
        let fields: FieldMap = [("check_interval", "often")].into_iter().collect();
        let err = structify::<Outer>(&fields).unwrap_err();
        assert_eq!(err.field, "check_interval");
        assert_eq!(err.value, "often");
    }

    #[test]
    fn test_values_map_zero_to_null() {
        let row = Outer {
            id: Binary::new(vec![1; 20]),
            name: "x".into(),
            ..Default::default()
        };
        let values = row.values();
        assert_eq!(values.len(), Outer::columns().len());
        assert!(values[1].is_null()); // environment_id
        assert_eq!(values[5], SqlValue::Text(Some("n".into())));
        assert!(values[6].is_null()); // last_update
        assert!(values[7].is_null()); // note
    }

    #[test]
    fn test_plan_is_cached_and_derived() {
        let plan = plan::<Outer>();
        assert_eq!(plan.table, "outer");
        assert_eq!(plan.pk_index, Some(0));
        assert!(!plan.upsert_columns.contains(&"id"));
        assert_eq!(plan.upsert_columns.len(), plan.columns.len() - 1);
        assert!(Arc::ptr_eq(&plan, &super::plan::<Outer>()));
    }

    #[test]
    fn test_table_name_from_type() {
        assert_eq!(table_name_from_type("a::b::HostState"), "host_state");
        assert_eq!(table_name_from_type("a::Tracked<a::b::Zone>"), "tracked");
        assert_eq!(table_name_from_type("CustomvarFlat"), "customvar_flat");
    }
}
