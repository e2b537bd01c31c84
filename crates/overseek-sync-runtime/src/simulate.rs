//! In-process simulations driven by the CLI.
//!
//! Several tabs share one [`LocalBus`] (and, for presence, one
//! [`LoopbackServer`]) inside the current tokio runtime. The reports are
//! serialized to JSON by the binary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use overseek_sync_core::SyncConfig;
use overseek_sync_core::SyncError;
use overseek_sync_core::types::{PresenceEntry, ResourceKind, UserIdentity};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::activity::{ActivitySignal, ManualActivity};
use crate::bus::{BroadcastBus, LocalBus};
use crate::identity::SequentialIdentity;
use crate::lock;
use crate::realtime::{LoopbackServer, RealtimeChannel};
use crate::session::{TabContext, TabDeps};

/// Payload produced by the simulated fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub count: u64,
}

// ─── Polling ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PollingReport {
    pub channel: String,
    pub tabs: usize,
    pub interval_ms: u64,
    /// Fetches performed across all tabs.
    pub fetches: u64,
    /// Payloads delivered to each tab's subscriber.
    pub payloads_per_tab: BTreeMap<String, usize>,
    pub leaders: Vec<String>,
    pub last_payload: Option<Tick>,
}

#[derive(Debug, Clone)]
pub struct PollingScenario {
    pub tabs: usize,
    pub ticks: u32,
    pub interval: Duration,
    pub channel: String,
}

pub async fn simulate_polling(
    scenario: &PollingScenario,
    config: &SyncConfig,
) -> Result<PollingReport, SyncError> {
    let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new());
    let deps = TabDeps {
        bus,
        identity: Arc::new(SequentialIdentity::new("tab")),
        config: config.clone(),
    };
    let counter = Arc::new(AtomicU64::new(0));

    let mut tabs = Vec::with_capacity(scenario.tabs);
    for _ in 0..scenario.tabs {
        let activity: Arc<dyn ActivitySignal> = Arc::new(ManualActivity::new(true));
        let tab = TabContext::new(deps.clone(), activity);
        let delivered = Arc::new(Mutex::new(0usize));
        let fetch_counter = Arc::clone(&counter);
        let sink = Arc::clone(&delivered);
        let subscription = tab.poll(
            &scenario.channel,
            Some(scenario.interval),
            move || {
                let count = fetch_counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, SyncError>(Tick { count }) }
            },
            move |_: &Tick| *lock(&sink) += 1,
        )?;
        tabs.push((tab, subscription, delivered));
    }

    let settle = Duration::from_millis(config.leader.settle_ms);
    let run_for = settle + scenario.interval * scenario.ticks + scenario.interval / 2;
    info!(
        tabs = scenario.tabs,
        channel = %scenario.channel,
        run_ms = run_for.as_millis() as u64,
        "simulate: polling"
    );
    tokio::time::sleep(run_for).await;

    let mut report = PollingReport {
        channel: scenario.channel.clone(),
        tabs: scenario.tabs,
        interval_ms: scenario.interval.as_millis() as u64,
        fetches: counter.load(Ordering::SeqCst),
        payloads_per_tab: BTreeMap::new(),
        leaders: Vec::new(),
        last_payload: None,
    };
    for (tab, subscription, delivered) in &tabs {
        report
            .payloads_per_tab
            .insert(tab.tab_id().to_string(), *lock(delivered));
        if subscription.is_leader() {
            report.leaders.push(tab.tab_id().to_string());
        }
    }
    report.last_payload = tabs
        .iter()
        .filter_map(|(_, subscription, _)| subscription.latest())
        .max_by_key(|tick| tick.count);
    for (tab, _, _) in &tabs {
        tab.shutdown();
    }
    Ok(report)
}

// ─── Presence ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ViewerSummary {
    pub user_id: String,
    pub connection_count: usize,
    pub other_viewers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceReport {
    pub document_id: String,
    pub server_roster: Vec<PresenceEntry>,
    pub views: Vec<ViewerSummary>,
}

pub async fn simulate_presence(
    users: &[String],
    document_id: &str,
    config: &SyncConfig,
) -> PresenceReport {
    let server = LoopbackServer::new(config.presence.ttl_ms);
    let cancel = CancellationToken::new();
    let sweeper = server.spawn_sweeper(
        Duration::from_millis(config.presence.sweep_interval_ms),
        cancel.clone(),
    );
    let deps = TabDeps {
        bus: Arc::new(LocalBus::new()),
        identity: Arc::new(SequentialIdentity::new("tab")),
        config: config.clone(),
    };

    let mut trackers = Vec::with_capacity(users.len());
    for user in users {
        let activity: Arc<dyn ActivitySignal> = Arc::new(ManualActivity::new(true));
        let tab = TabContext::new(deps.clone(), activity);
        let connection: Arc<dyn RealtimeChannel> = Arc::new(server.connect());
        let tracker = tab.presence(ResourceKind::Document, connection);
        tracker.set_user(Some(UserIdentity::new(user.as_str(), user.as_str())));
        tracker.set_resource(Some(document_id.to_string()));
        trackers.push((user.clone(), tab, tracker));
    }
    info!(users = users.len(), document_id = %document_id, "simulate: presence");

    // Let the last sync reach every tracker.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let views = trackers
        .iter()
        .map(|(user, _, tracker)| {
            let view = tracker.view();
            ViewerSummary {
                user_id: user.clone(),
                connection_count: view.roster.connection_count(),
                other_viewers: view
                    .other_viewers()
                    .into_iter()
                    .map(|e| e.user_id.clone())
                    .collect(),
            }
        })
        .collect();
    let report = PresenceReport {
        document_id: document_id.to_string(),
        server_roster: server.roster(ResourceKind::Document, document_id),
        views,
    };

    drop(trackers);
    cancel.cancel();
    let _ = sweeper.await;
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn polling_simulation_fetches_once_per_tick() {
        let scenario = PollingScenario {
            tabs: 3,
            ticks: 4,
            interval: Duration::from_millis(1_000),
            channel: "live-analytics".into(),
        };
        let report = simulate_polling(&scenario, &SyncConfig::default())
            .await
            .expect("simulate");
        assert_eq!(report.leaders, vec!["tab-1"]);
        assert!(report.fetches >= 4 && report.fetches <= 5, "{report:?}");
        for delivered in report.payloads_per_tab.values() {
            assert_eq!(*delivered as u64, report.fetches);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn presence_simulation_sees_everyone() {
        let users = vec!["ada".to_string(), "bob".to_string(), "cy".to_string()];
        let report = simulate_presence(&users, "doc-1", &SyncConfig::default()).await;
        assert_eq!(report.server_roster.len(), 3);
        let ada = &report.views[0];
        assert_eq!(ada.connection_count, 3);
        assert_eq!(ada.other_viewers, vec!["bob", "cy"]);
    }
}
