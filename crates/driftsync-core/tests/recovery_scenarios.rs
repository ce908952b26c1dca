//! Recovery trigger behaviour: signal coalescing, suppression, time jumps and
//! the secondary retry.

mod common;

use std::sync::Arc;

use common::{Engine, OWNER, engine, rec, settle};
use driftsync_core::inspector::EventCode;
use driftsync_core::recovery::{LifecycleSignal, RecoveryTrigger};
use driftsync_core::simulation::{FaultMode, SimulatedAuth, SimulatedRemote};

type Trigger = Arc<RecoveryTrigger<SimulatedRemote, SimulatedAuth>>;

fn trigger(engine: &Engine) -> Trigger {
    RecoveryTrigger::new(engine.clone(), engine.config().recovery.clone())
}

/// Position of the first `code` at or after `from` in the log.
fn position_after(engine: &Engine, code: EventCode, from: usize) -> Option<usize> {
    engine
        .get_log()
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, entry)| entry.code == code)
        .map(|(idx, _)| idx)
}

#[tokio::test(start_paused = true)]
async fn online_then_visible_runs_once() {
    let engine = engine();
    let trigger = trigger(&engine);

    trigger.handle_signal(LifecycleSignal::Online);
    settle(300).await;
    trigger.handle_signal(LifecycleSignal::Visible);
    settle(10_000).await;

    assert_eq!(engine.inspector().count(EventCode::RecoveryTrigger), 1);
    assert_eq!(engine.inspector().count(EventCode::RecoverySuppressed), 0);
    assert!(engine.inspector().count(EventCode::TimerCancelled) >= 1);
}

#[tokio::test(start_paused = true)]
async fn visible_then_online_suppresses_second_run() {
    let engine = engine();
    let trigger = trigger(&engine);

    trigger.handle_signal(LifecycleSignal::Visible);
    settle(300).await;
    trigger.handle_signal(LifecycleSignal::Online);
    settle(10_000).await;

    assert_eq!(engine.inspector().count(EventCode::RecoveryTrigger), 1);
    assert_eq!(engine.inspector().count(EventCode::RecoverySuppressed), 1);
}

#[tokio::test(start_paused = true)]
async fn well_separated_signals_each_run() {
    let engine = engine();
    let trigger = trigger(&engine);

    trigger.handle_signal(LifecycleSignal::Visible);
    settle(5_000).await;
    trigger.handle_signal(LifecycleSignal::Visible);
    settle(5_000).await;

    assert_eq!(engine.inspector().count(EventCode::RecoveryTrigger), 2);
    assert_eq!(engine.get_snapshot().last_source.as_deref(), Some("recovery"));
}

#[tokio::test(start_paused = true)]
async fn hidden_and_offline_only_update_environment() {
    let engine = engine();
    let trigger = trigger(&engine);

    trigger.handle_signal(LifecycleSignal::Hidden);
    trigger.handle_signal(LifecycleSignal::Offline);
    settle(5_000).await;

    let snap = engine.get_snapshot();
    assert!(!snap.online);
    assert!(!snap.visible);
    assert_eq!(engine.inspector().count(EventCode::RecoveryTrigger), 0);
    assert_eq!(engine.inspector().count(EventCode::RecoverySignal), 2);
}

#[tokio::test(start_paused = true)]
async fn wall_clock_jump_triggers_recovery() {
    let engine = engine();
    let trigger = trigger(&engine);

    trigger.handle_signal(LifecycleSignal::Tick { now_ms: 1_000 });
    trigger.handle_signal(LifecycleSignal::Tick { now_ms: 6_000 });
    assert_eq!(engine.inspector().count(EventCode::TimeJump), 0);
    trigger.handle_signal(LifecycleSignal::Tick { now_ms: 100_000 });
    settle(10_000).await;

    assert_eq!(engine.inspector().count(EventCode::TimeJump), 1);
    assert_eq!(engine.inspector().count(EventCode::RecoveryTrigger), 1);
    // Ticks are not logged as signals.
    assert_eq!(engine.inspector().count(EventCode::RecoverySignal), 0);
}

#[tokio::test(start_paused = true)]
async fn secondary_retry_drains_what_the_first_pass_left() {
    let engine = engine();
    engine.set_online(false);
    engine.save(rec("a", 1), OWNER).unwrap();
    settle(10).await;

    engine.remote().fail_next_upserts(2, FaultMode::Abort);
    let trigger = trigger(&engine);
    trigger.handle_signal(LifecycleSignal::Online);
    settle(10_000).await;

    assert_eq!(engine.queue_depth().unwrap(), 0);
    assert_eq!(engine.remote().upsert_calls(), 3);
    assert_eq!(engine.inspector().count(EventCode::RecoveryTrigger), 1);
}

#[tokio::test(start_paused = true)]
async fn recovery_resets_before_flushing() {
    let engine = engine();
    engine.set_online(false);
    engine.save(rec("a", 1), OWNER).unwrap();
    settle(10).await;

    let trigger = trigger(&engine);
    trigger.handle_signal(LifecycleSignal::Online);
    settle(10_000).await;

    let fired = position_after(&engine, EventCode::RecoveryTrigger, 0).unwrap();
    let reset = position_after(&engine, EventCode::LockReset, fired).unwrap();
    let start = position_after(&engine, EventCode::FlushStart, reset).unwrap();
    assert!(fired < reset && reset < start);
    assert_eq!(engine.queue_depth().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn recovery_unsticks_a_hung_flush() {
    let engine = engine();
    engine.remote().set_upsert_mode(FaultMode::Hang);
    engine.save(rec("a", 1), OWNER).unwrap();
    settle(100).await;
    assert!(engine.is_flushing());

    engine.remote().set_upsert_mode(FaultMode::Ok);
    let trigger = trigger(&engine);
    trigger.handle_signal(LifecycleSignal::Visible);
    settle(5_000).await;

    assert_eq!(engine.queue_depth().unwrap(), 0);
    assert!(engine.remote().row("a").is_some());
}

#[tokio::test(start_paused = true)]
async fn spawned_listener_applies_signals() {
    let engine = engine();
    let trigger = trigger(&engine);
    let handle = trigger.spawn();

    assert!(handle.signal(LifecycleSignal::Offline).await);
    settle(10).await;
    assert!(!engine.is_online());

    let sender = handle.sender();
    sender.send(LifecycleSignal::Online).await.unwrap();
    settle(10_000).await;
    assert!(engine.is_online());
    assert_eq!(engine.inspector().count(EventCode::RecoveryTrigger), 1);

    handle.shutdown();
    settle(10).await;
    assert!(sender.send(LifecycleSignal::Visible).await.is_err());
}
