//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use driftsync_core::config::Config;
use driftsync_core::kv::{KeyValueStore, MemoryStore, SqliteStore};
use driftsync_core::local_store::LocalStore;
use driftsync_core::outbox::OutboxQueue;
use driftsync_core::record::Record;
use driftsync_core::recovery::{LifecycleSignal, RecoveryTrigger};
use driftsync_core::simulation::{SimulatedAuth, SimulatedRemote};
use driftsync_core::{FlushOutcome, SyncEngine};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::cli::SimulateArgs;

#[derive(Debug, Serialize)]
struct PendingRow {
    id: String,
    owner_id: String,
    attempts: u32,
    queued_at: u64,
    last_attempt_at: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    db: String,
    records: usize,
    pending: usize,
    last_merge_at: Option<u64>,
    items: Vec<PendingRow>,
}

fn open_db(path: &Path) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

pub fn status(path: &Path, as_json: bool) -> anyhow::Result<()> {
    let kv = open_db(path)?;
    let local = LocalStore::open(Arc::clone(&kv))?;
    let outbox = OutboxQueue::open(kv)?;

    let items: Vec<PendingRow> = outbox
        .peek_all()?
        .into_iter()
        .map(|item| PendingRow {
            id: item.id,
            owner_id: item.owner_id,
            attempts: item.attempts,
            queued_at: item.queued_at,
            last_attempt_at: item.last_attempt_at,
        })
        .collect();
    let baseline = local.baseline_at()?;
    let report = StatusReport {
        db: path.display().to_string(),
        records: local.len()?,
        pending: items.len(),
        last_merge_at: (baseline > 0).then_some(baseline),
        items,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("database:   {}", report.db);
    println!("records:    {}", report.records);
    println!("pending:    {}", report.pending);
    match report.last_merge_at {
        Some(at) => println!("last merge: {at}"),
        None => println!("last merge: never"),
    }
    for item in &report.items {
        println!(
            "  {:<24} owner={} attempts={} queued_at={}",
            item.id, item.owner_id, item.attempts, item.queued_at
        );
    }
    Ok(())
}

pub fn records(path: &Path, owner: Option<&str>) -> anyhow::Result<()> {
    let local = LocalStore::open(open_db(path)?)?;
    for record in local.get_all(owner)? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

pub fn show_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Save records offline, come back online through the recovery trigger and
/// run `cycles` manual flushes.
pub async fn simulate(config: Config, args: SimulateArgs) -> anyhow::Result<()> {
    let remote = SimulatedRemote::new();
    remote.set_upsert_mode(args.fail);
    let engine = SyncEngine::new(
        config.clone(),
        Arc::new(MemoryStore::new()),
        remote,
        SimulatedAuth::signed_in(&args.owner),
    )?;

    let trigger = RecoveryTrigger::new(engine.clone(), config.recovery.clone());
    let recovery = trigger.spawn();

    trigger.handle_signal(LifecycleSignal::Offline);
    for n in 0..args.records {
        let record = Record::new(format!("rec-{n}"), args.owner.as_str(), json!({ "n": n }));
        engine.save(record, &args.owner)?;
    }
    info!(queued = engine.queue_depth()?, "saved records offline");

    trigger.handle_signal(LifecycleSignal::Online);
    for cycle in 1..=args.cycles {
        let outcome = engine.request_flush(&args.owner).wait().await;
        match &outcome {
            FlushOutcome::Completed(report) => info!(
                cycle,
                session = report.session,
                succeeded = report.succeeded,
                failed = report.failed,
                dropped = report.dropped,
                "flush cycle finished"
            ),
            other => info!(cycle, outcome = ?other, "flush cycle ended early"),
        }
    }
    recovery.shutdown();

    println!("{}", engine.export_diagnostic_report()?);
    Ok(())
}
