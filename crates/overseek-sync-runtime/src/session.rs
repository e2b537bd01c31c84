//! Per-tab context and the registry of live sessions.
//!
//! A [`TabContext`] is everything one tab needs to take part in
//! coordination: its id, the shared bus, its visibility signal and config.
//! Leaders and polls are shared per key inside a tab, so two consumers of
//! the same channel drive one election and one fetch loop.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use overseek_sync_core::SyncConfig;
use overseek_sync_core::SyncError;
use overseek_sync_core::types::{ResourceKind, polling_leader_key};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::activity::ActivitySignal;
use crate::bus::BroadcastBus;
use crate::coordinated_poll::{CoordinatedPoll, PollPayload, PollSubscription};
use crate::identity::IdentityGenerator;
use crate::lock;
use crate::presence_tracker::PresenceTracker;
use crate::realtime::RealtimeChannel;
use crate::tab_leader::TabLeader;

/// Environment shared by the tabs of one process.
#[derive(Clone)]
pub struct TabDeps {
    pub bus: Arc<dyn BroadcastBus>,
    pub identity: Arc<dyn IdentityGenerator>,
    pub config: SyncConfig,
}

impl fmt::Debug for TabDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabDeps")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

type AnyPoll = dyn Any + Send + Sync;

// ─── TabContext ───────────────────────────────────────────────────

pub struct TabContext {
    tab_id: String,
    deps: TabDeps,
    activity: Arc<dyn ActivitySignal>,
    cancel: CancellationToken,
    leaders: Mutex<HashMap<String, Weak<TabLeader>>>,
    polls: Mutex<HashMap<String, Weak<AnyPoll>>>,
}

impl fmt::Debug for TabContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabContext")
            .field("tab_id", &self.tab_id)
            .finish_non_exhaustive()
    }
}

impl TabContext {
    pub fn new(deps: TabDeps, activity: Arc<dyn ActivitySignal>) -> Arc<Self> {
        let tab_id = deps.identity.tab_id();
        debug!(tab_id = %tab_id, "tab: context created");
        Arc::new(Self {
            tab_id,
            deps,
            activity,
            cancel: CancellationToken::new(),
            leaders: Mutex::new(HashMap::new()),
            polls: Mutex::new(HashMap::new()),
        })
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.deps.config
    }

    pub fn activity(&self) -> &Arc<dyn ActivitySignal> {
        &self.activity
    }

    /// This tab's leader for `channel_key`, started on first use.
    pub fn leader(&self, channel_key: &str) -> Arc<TabLeader> {
        let mut leaders = lock(&self.leaders);
        if let Some(leader) = leaders.get(channel_key).and_then(Weak::upgrade) {
            return leader;
        }
        let leader = Arc::new(TabLeader::spawn(
            self.deps.bus.as_ref(),
            channel_key,
            &self.tab_id,
            self.deps.config.leader.clone(),
            self.cancel.clone(),
        ));
        leaders.retain(|_, weak| weak.strong_count() > 0);
        leaders.insert(channel_key.to_string(), Arc::downgrade(&leader));
        leader
    }

    /// Subscribe to `channel_name`, starting its poll if this tab has none.
    ///
    /// The first subscriber's `fetch` and interval win; later subscribers
    /// share that loop. `interval` defaults to the configured one.
    pub fn poll<T, F, Fut, E>(
        &self,
        channel_name: &str,
        interval: Option<Duration>,
        fetch: F,
        on_data: impl Fn(&T) + Send + Sync + 'static,
    ) -> Result<PollSubscription<T>, SyncError>
    where
        T: PollPayload,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let mut polls = lock(&self.polls);
        if let Some(existing) = polls.get(channel_name).and_then(Weak::upgrade) {
            let poll = existing
                .downcast::<CoordinatedPoll<T>>()
                .map_err(|_| SyncError::ChannelTypeMismatch {
                    channel: channel_name.to_string(),
                })?;
            return Ok(poll.subscribe(on_data));
        }

        let interval = interval.unwrap_or_else(|| {
            Duration::from_millis(self.deps.config.polling.default_interval_ms)
        });
        let poll = CoordinatedPoll::spawn(
            self.deps.bus.as_ref(),
            self.leader(&polling_leader_key(channel_name)),
            self.activity.as_ref(),
            channel_name,
            interval,
            fetch,
            self.cancel.clone(),
        );
        let erased: Arc<AnyPoll> = poll.clone();
        polls.retain(|_, weak| weak.strong_count() > 0);
        polls.insert(channel_name.to_string(), Arc::downgrade(&erased));
        Ok(poll.subscribe(on_data))
    }

    /// Track presence for `kind` rooms on `channel`.
    pub fn presence(&self, kind: ResourceKind, channel: Arc<dyn RealtimeChannel>) -> PresenceTracker {
        PresenceTracker::spawn(
            kind,
            channel,
            self.activity.as_ref(),
            self.deps.identity.colors(),
            &self.deps.config.presence,
            self.cancel.clone(),
        )
    }

    /// Stop every election, poll and tracker started from this tab.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!(tab_id = %self.tab_id, "tab: shutting down");
            self.cancel.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TabContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── SessionRegistry ──────────────────────────────────────────────

/// Live tabs keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<TabContext>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a tab for `session_id`. An existing tab under that id is shut
    /// down and replaced.
    pub fn start(
        &self,
        session_id: &str,
        deps: TabDeps,
        activity: Arc<dyn ActivitySignal>,
    ) -> Arc<TabContext> {
        let tab = TabContext::new(deps, activity);
        let previous = lock(&self.sessions).insert(session_id.to_string(), Arc::clone(&tab));
        if let Some(previous) = previous {
            previous.shutdown();
        }
        info!(session_id = %session_id, tab_id = %tab.tab_id(), "session: started");
        tab
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<TabContext>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// Shut down and forget `session_id`. Returns `false` if unknown.
    pub fn end(&self, session_id: &str) -> bool {
        let removed = lock(&self.sessions).remove(session_id);
        match removed {
            Some(tab) => {
                tab.shutdown();
                info!(session_id = %session_id, "session: ended");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every session.
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<TabContext>> = lock(&self.sessions).drain().map(|(_, tab)| tab).collect();
        for tab in drained {
            tab.shutdown();
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
