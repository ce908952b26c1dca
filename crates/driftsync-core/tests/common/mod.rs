//! Shared test infrastructure for driftsync-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use driftsync_core::Config;
use driftsync_core::engine::SyncEngine;
use driftsync_core::kv::{KeyValueStore, MemoryStore};
use driftsync_core::record::Record;
use driftsync_core::simulation::{SimulatedAuth, SimulatedRemote};
use serde_json::json;

pub type Engine = SyncEngine<SimulatedRemote, SimulatedAuth>;

pub const OWNER: &str = "u1";

pub fn engine() -> Engine {
    engine_with(Config::default())
}

pub fn engine_with(config: Config) -> Engine {
    engine_on(config, Arc::new(MemoryStore::new()))
}

pub fn engine_on(config: Config, kv: Arc<dyn KeyValueStore>) -> Engine {
    SyncEngine::new(
        config,
        kv,
        SimulatedRemote::new(),
        SimulatedAuth::signed_in(OWNER),
    )
    .expect("engine should open")
}

pub fn rec(id: &str, v: i64) -> Record {
    Record::new(id, OWNER, json!({ "v": v }))
}

/// Let spawned tasks run; advances paused time by `ms`.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
