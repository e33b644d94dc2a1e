// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscriber setup for the daemon binary.
//!
//! Component names from `logging.options` map onto module targets so an
//! operator can raise one subsystem to `debug` without touching the rest.

use tracing_subscriber::EnvFilter;

use crate::config::{LogOutput, LoggingConfig};

const COMPONENTS: &[(&str, &str)] = &[
    ("database", "icingadb_sync::storage::sql"),
    ("redis", "icingadb_sync::storage::redis"),
    ("heartbeat", "icingadb_sync::ha::heartbeat"),
    ("high-availability", "icingadb_sync::ha::controller"),
    ("config-sync", "icingadb_sync::sync"),
    ("runtime-updates", "icingadb_sync::sync::runtime"),
    ("history-sync", "icingadb_sync::history"),
    ("retention", "icingadb_sync::retention"),
    ("telemetry", "icingadb_sync::telemetry"),
    ("dump-signals", "icingadb_sync::sync::dump"),
];

/// Module target for a component name.
pub fn component_target(component: &str) -> Option<&'static str> {
    COMPONENTS
        .iter()
        .find(|(name, _)| *name == component)
        .map(|(_, target)| *target)
}

fn directive_level(level: &str) -> &str {
    match level {
        "fatal" => "error",
        other => other,
    }
}

/// Build the filter: the global level plus one directive per component override.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let mut directives = directive_level(&config.level).to_string();
    for (component, level) in &config.options {
        if let Some(target) = component_target(component) {
            directives.push_str(&format!(",{}={}", target, directive_level(level)));
        }
    }
    EnvFilter::new(directives)
}

/// Resolve the output, preferring the journal when started by the service manager.
pub fn resolve_output(config: &LoggingConfig) -> LogOutput {
    config.output.unwrap_or_else(|| {
        if std::env::var_os("JOURNAL_STREAM").is_some() {
            LogOutput::Journal
        } else {
            LogOutput::Console
        }
    })
}

/// Install the global subscriber. Safe to call once per process.
pub fn init(config: &LoggingConfig) {
    let filter = env_filter(config);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match resolve_output(config) {
        // journald stamps every line itself
        LogOutput::Journal => builder.without_time().with_ansi(false).compact().try_init(),
        LogOutput::Console => builder.try_init(),
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {e}");
    }
}
