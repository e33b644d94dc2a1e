// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statement text for bulk writes, built from an [`EntityPlan`].
//!
//! All builders return rebound SQL for the given dialect.

use crate::entity::EntityPlan;

use super::sql::Dialect;

fn placeholders(columns: usize, rows: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(", "));
    vec![row.as_str(); rows].join(", ")
}

fn insert_head(dialect: Dialect, plan: &EntityPlan, rows: usize) -> String {
    let columns: Vec<String> = plan.columns.iter().map(|c| dialect.quote(c)).collect();
    format!(
        "INTO {} ({}) VALUES {}",
        dialect.quote(&plan.table),
        columns.join(", "),
        placeholders(plan.columns.len(), rows)
    )
}

/// Insert `rows` rows, silently dropping those whose key already exists.
pub fn insert_ignore(dialect: Dialect, plan: &EntityPlan, rows: usize) -> String {
    let head = insert_head(dialect, plan, rows);
    let sql = match dialect {
        Dialect::Mysql => format!("INSERT IGNORE {head}"),
        Dialect::Postgres | Dialect::Sqlite => format!("INSERT {head} ON CONFLICT DO NOTHING"),
    };
    dialect.rebind(&sql)
}

/// Insert `rows` rows, overwriting the plan's upsert columns on key
/// collision. Without upsert columns this is [`insert_ignore`].
pub fn upsert(dialect: Dialect, plan: &EntityPlan, rows: usize) -> String {
    if plan.upsert_columns.is_empty() {
        return insert_ignore(dialect, plan, rows);
    }

    let head = insert_head(dialect, plan, rows);
    let sql = match dialect {
        Dialect::Mysql => {
            let set: Vec<String> = plan
                .upsert_columns
                .iter()
                .map(|c| {
                    let c = dialect.quote(c);
                    format!("{c} = VALUES({c})")
                })
                .collect();
            format!("INSERT {head} ON DUPLICATE KEY UPDATE {}", set.join(", "))
        }
        Dialect::Postgres | Dialect::Sqlite => {
            let set: Vec<String> = plan
                .upsert_columns
                .iter()
                .map(|c| {
                    let c = dialect.quote(c);
                    format!("{c} = excluded.{c}")
                })
                .collect();
            format!(
                "INSERT {head} ON CONFLICT ({}) DO UPDATE SET {}",
                dialect.quote_list(plan.primary_key),
                set.join(", ")
            )
        }
    };
    dialect.rebind(&sql)
}

/// `UPDATE` of every non-key column. Bind the non-key values in column
/// order followed by the key.
pub fn update_by_id(dialect: Dialect, plan: &EntityPlan) -> String {
    let set: Vec<String> = plan
        .columns
        .iter()
        .filter(|c| **c != plan.primary_key)
        .map(|c| format!("{} = ?", dialect.quote(c)))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        dialect.quote(&plan.table),
        set.join(", "),
        dialect.quote(plan.primary_key)
    );
    dialect.rebind(&sql)
}

pub fn delete_in(dialect: Dialect, table: &str, key: &str, count: usize) -> String {
    let sql = format!(
        "DELETE FROM {} WHERE {} IN ({})",
        dialect.quote(table),
        dialect.quote(key),
        vec!["?"; count].join(", ")
    );
    dialect.rebind(&sql)
}

/// Listing of `(id, checksum)` for one environment. Non-checksummed tables
/// select only the id.
pub fn select_checksums(dialect: Dialect, table: &str, checksummed: bool) -> String {
    let columns = if checksummed {
        format!("{}, {}", dialect.quote("id"), dialect.quote("properties_checksum"))
    } else {
        dialect.quote("id")
    };
    let sql = format!(
        "SELECT {columns} FROM {} WHERE {} = ?",
        dialect.quote(table),
        dialect.quote("environment_id")
    );
    dialect.rebind(&sql)
}
