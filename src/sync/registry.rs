// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catalogue of config and state types, keyed by cache key.
//!
//! Each entry bundles the generic full-sync and runtime-worker code for one
//! Rust type behind the [`EntityType`] trait object, so the engines iterate
//! over heterogeneous types without `Any`-typed channels.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::entity::config::*;
use crate::entity::plan;
use crate::error::Result;
use crate::tasks::TaskGroup;

use super::config_sync::{sync_customvars, sync_type, SyncStats};
use super::runtime::{spawn_customvar_workers, spawn_workers, RuntimeSink};
use super::SyncContext;

/// How runtime updates of a type are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// One row at a time, acknowledged after commit.
    Fifo,
    /// Batched; distinct ids may reorder.
    Parallel,
}

#[async_trait]
pub trait EntityType: Send + Sync {
    /// Cache key, e.g. `host` or `host:state`.
    fn key(&self) -> &'static str;

    fn table(&self) -> String;

    fn mode(&self) -> RuntimeMode;

    fn is_state(&self) -> bool {
        self.key().ends_with(":state")
    }

    async fn full_sync(&self, ctx: &SyncContext, cancel: &CancellationToken) -> Result<SyncStats>;

    /// Spawn the upsert and delete workers into `group`.
    fn runtime_workers(&self, ctx: &SyncContext, group: &mut TaskGroup) -> RuntimeSink;
}

struct Typed<T> {
    key: &'static str,
    mode: RuntimeMode,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: ConfigEntity> EntityType for Typed<T> {
    fn key(&self) -> &'static str {
        self.key
    }

    fn table(&self) -> String {
        plan::<T>().table.clone()
    }

    fn mode(&self) -> RuntimeMode {
        self.mode
    }

    async fn full_sync(&self, ctx: &SyncContext, cancel: &CancellationToken) -> Result<SyncStats> {
        sync_type::<T>(ctx, cancel, self.key).await
    }

    fn runtime_workers(&self, ctx: &SyncContext, group: &mut TaskGroup) -> RuntimeSink {
        spawn_workers::<T>(&ctx.bulk, &ctx.stats, group, self.key, self.mode, self.is_state())
    }
}

/// `customvar` also maintains `customvar_flat`.
struct Customvars;

#[async_trait]
impl EntityType for Customvars {
    fn key(&self) -> &'static str {
        "customvar"
    }

    fn table(&self) -> String {
        plan::<Customvar>().table.clone()
    }

    fn mode(&self) -> RuntimeMode {
        RuntimeMode::Fifo
    }

    async fn full_sync(&self, ctx: &SyncContext, cancel: &CancellationToken) -> Result<SyncStats> {
        sync_customvars(ctx, cancel).await
    }

    fn runtime_workers(&self, ctx: &SyncContext, group: &mut TaskGroup) -> RuntimeSink {
        spawn_customvar_workers(&ctx.bulk, &ctx.stats, group)
    }
}

fn typed<T: ConfigEntity>(key: &'static str, mode: RuntimeMode) -> Arc<dyn EntityType> {
    Arc::new(Typed::<T> {
        key,
        mode,
        _marker: PhantomData,
    })
}

pub struct Registry {
    types: Vec<Arc<dyn EntityType>>,
}

impl Default for Registry {
    fn default() -> Self {
        use RuntimeMode::{Fifo, Parallel};

        Self {
            types: vec![
                typed::<Endpoint>("endpoint", Parallel),
                typed::<Zone>("zone", Parallel),
                typed::<Host>("host", Parallel),
                typed::<Service>("service", Parallel),
                typed::<Hostgroup>("hostgroup", Parallel),
                typed::<Servicegroup>("servicegroup", Parallel),
                typed::<HostgroupMember>("hostgroup:member", Fifo),
                typed::<ServicegroupMember>("servicegroup:member", Fifo),
                typed::<Checkcommand>("checkcommand", Parallel),
                typed::<Timeperiod>("timeperiod", Parallel),
                typed::<User>("user", Parallel),
                typed::<Usergroup>("usergroup", Parallel),
                typed::<Notification>("notification", Parallel),
                typed::<Comment>("comment", Parallel),
                typed::<Downtime>("downtime", Parallel),
                Arc::new(Customvars),
                typed::<HostCustomvar>("host:customvar", Fifo),
                typed::<ServiceCustomvar>("service:customvar", Fifo),
                typed::<HostState>("host:state", Parallel),
                typed::<ServiceState>("service:state", Parallel),
            ],
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn EntityType>> {
        self.types.iter().find(|t| t.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EntityType>> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
