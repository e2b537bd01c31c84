mod common;

use std::sync::Arc;

use common::{World, run_for};
use overseek_sync_core::envelope::BusMessage;
use overseek_sync_runtime::bus::{BroadcastBus, UnsupportedBus};
use overseek_sync_runtime::identity::SequentialIdentity;
use overseek_sync_runtime::tab_leader::TabLeader;
use tokio_util::sync::CancellationToken;

fn leaders(tabs: &[Arc<TabLeader>]) -> Vec<String> {
    tabs.iter()
        .filter(|l| l.is_leader())
        .map(|l| l.tab_id().to_string())
        .collect()
}

// ── 1. single_leader_convergence ────────────────────────────────

#[tokio::test(start_paused = true)]
async fn single_leader_convergence() {
    let world = World::new();
    let tabs: Vec<_> = (0..5).map(|_| world.tab()).collect();
    let handles: Vec<_> = tabs.iter().map(|t| t.ctx.leader("polling-x")).collect();

    run_for(500).await;
    assert_eq!(leaders(&handles), vec!["tab-1"]);

    // Stays converged over many announce rounds.
    run_for(5_000).await;
    assert_eq!(leaders(&handles), vec!["tab-1"]);
}

// ── 2. oldest_claim_wins_over_id ────────────────────────────────

#[tokio::test(start_paused = true)]
async fn oldest_claim_wins_over_id() {
    let world = World::new();
    let early = world.tab_with(Arc::new(SequentialIdentity::new("zed")));
    let early_leader = early.ctx.leader("k");
    run_for(500).await;

    let late = world.tab();
    let late_leader = late.ctx.leader("k");
    run_for(500).await;

    assert!(early_leader.is_leader());
    assert!(!late_leader.is_leader(), "newer claim must defer");
}

// ── 3. keys_are_independent ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn keys_are_independent() {
    let world = World::new();
    let a = world.tab();
    let b = world.tab();
    let a_x = a.ctx.leader("x");
    let b_x = b.ctx.leader("x");
    run_for(300).await;
    let b_y = b.ctx.leader("y");
    run_for(300).await;

    assert!(a_x.is_leader());
    assert!(!b_x.is_leader());
    assert!(b_y.is_leader(), "only tab on key y");
}

// ── 4. handoff_on_unsubscribe ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn handoff_on_unsubscribe() {
    let world = World::new();
    let tabs: Vec<_> = (0..3).map(|_| world.tab()).collect();
    let mut handles: Vec<_> = tabs.iter().map(|t| t.ctx.leader("k")).collect();
    run_for(500).await;
    assert_eq!(leaders(&handles), vec!["tab-1"]);

    // Abdication lets the next claim take over well before the silence timeout.
    handles.remove(0);
    run_for(200).await;
    assert_eq!(leaders(&handles), vec!["tab-2"]);
}

// ── 5. handoff_after_silent_leader ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn handoff_after_silent_leader() {
    let world = World::new();
    let ghost = world.bus.open("k").expect("open");
    let tab = world.tab();
    let leader = tab.ctx.leader("k");
    // One announcement with the oldest possible claim, then silence.
    ghost
        .post(&BusMessage::LeaderAnnounce {
            tab_id: "ghost".into(),
            claimed_at: 0,
        })
        .expect("post");
    run_for(1_000).await;
    assert!(!leader.is_leader(), "ghost outranks");

    // Forgotten once the silence timeout passes.
    run_for(3_000).await;
    assert!(leader.is_leader());
}

// ── 6. no_bus_every_tab_leads ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn no_bus_every_tab_leads() {
    let config = common::config();
    let cancel = CancellationToken::new();
    let a = TabLeader::spawn(&UnsupportedBus, "k", "a", config.leader.clone(), cancel.clone());
    let b = TabLeader::spawn(&UnsupportedBus, "k", "b", config.leader, cancel);
    assert!(a.is_leader());
    assert!(b.is_leader());
}

// ── 7. session_shutdown_abdicates ───────────────────────────────

#[tokio::test(start_paused = true)]
async fn session_shutdown_abdicates() {
    let world = World::new();
    let a = world.tab();
    let b = world.tab();
    let a_leader = a.ctx.leader("k");
    let b_leader = b.ctx.leader("k");
    run_for(500).await;
    assert!(a_leader.is_leader());

    a.ctx.shutdown();
    run_for(200).await;
    assert!(!a_leader.is_leader());
    assert!(b_leader.is_leader());
}
