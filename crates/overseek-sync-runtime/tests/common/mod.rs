#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use overseek_sync_core::SyncConfig;
use overseek_sync_core::config::{LeaderConfig, PollingConfig, PresenceConfig};
use overseek_sync_runtime::activity::{ActivitySignal, ManualActivity};
use overseek_sync_runtime::bus::{BroadcastBus, LocalBus};
use overseek_sync_runtime::identity::{IdentityGenerator, SequentialIdentity};
use overseek_sync_runtime::session::{TabContext, TabDeps};

/// Advance paused time in 50ms steps, letting tasks run after each step.
pub async fn run_for(ms: u64) {
    for _ in 0..ms.div_ceil(50) {
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }
}

pub fn config() -> SyncConfig {
    SyncConfig {
        leader: LeaderConfig {
            announce_interval_ms: 1_000,
            silence_timeout_ms: 3_000,
            settle_ms: 100,
        },
        polling: PollingConfig {
            default_interval_ms: 1_000,
        },
        presence: PresenceConfig {
            heartbeat_interval_ms: 1_000,
            ttl_ms: 5_000,
            sweep_interval_ms: 500,
        },
    }
}

pub struct World {
    pub bus: Arc<LocalBus>,
    pub identity: Arc<dyn IdentityGenerator>,
    pub config: SyncConfig,
}

pub struct Tab {
    pub ctx: Arc<TabContext>,
    pub activity: Arc<ManualActivity>,
}

impl World {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(LocalBus::new()),
            identity: Arc::new(SequentialIdentity::new("tab")),
            config: config(),
        }
    }

    pub fn tab(&self) -> Tab {
        self.tab_with(Arc::clone(&self.identity))
    }

    pub fn tab_with(&self, identity: Arc<dyn IdentityGenerator>) -> Tab {
        let activity = Arc::new(ManualActivity::new(true));
        let signal: Arc<dyn ActivitySignal> = activity.clone();
        let bus: Arc<dyn BroadcastBus> = self.bus.clone();
        let ctx = TabContext::new(
            TabDeps {
                bus,
                identity,
                config: self.config.clone(),
            },
            signal,
        );
        Tab { ctx, activity }
    }
}

/// Shared call counter for fetch closures.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
