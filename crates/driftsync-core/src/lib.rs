//! driftsync-core: Core library for driftsync
//!
//! A local-first sync engine. Every mutation commits to durable local storage
//! immediately and is propagated to a remote store through a persistent
//! outbox, so work continues offline, on flaky links and across suspensions.
//!
//! # Architecture
//!
//! ```text
//! save() → Local Store ─┐
//!        → Outbox Queue ─┴→ Flush Orchestrator → Session Guard → Remote Store
//!                                 ↑
//!   lifecycle signals → Recovery Trigger
//!
//!   every component → Inspector (log ring + snapshot)
//! ```
//!
//! # Modules
//!
//! - `engine`: `SyncEngine`, the single instance callers use
//! - `local_store`: durable record map and the read-merge planner
//! - `outbox`: deduplicated, ordered queue of pending remote writes
//! - `flush`: single-flight drain loop with watchdog and retry policy
//! - `session`: auth provider trait and the session guard
//! - `recovery`: lifecycle signals, time-jump detection, recovery protocol
//! - `scheduler`: keyed coalescing scheduler
//! - `inspector`: structured event log and snapshot
//! - `remote`: remote store trait
//! - `kv`: durable key/value storage (memory, SQLite)
//! - `simulation`: fault-injecting remote and auth for tests and demos
//! - `config`: Configuration management
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod inspector;
pub mod kv;
pub mod local_store;
pub mod logging;
pub mod outbox;
pub mod record;
pub mod recovery;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod simulation;

pub use config::Config;
pub use engine::{ChangeEvent, Subscription, SyncEngine};
pub use error::{Error, Result, StorageError, SyncErrorKind};
pub use flush::{FlushHandle, FlushOutcome, FlushReport};
pub use inspector::{EventCode, LogEntry, Snapshot};
pub use record::Record;
pub use recovery::{LifecycleSignal, RecoveryHandle, RecoveryTrigger};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
