//! Tab visibility signal.

use tokio::sync::watch;

/// Whether the tab is visible. Drivers watch it to pause and resume.
pub trait ActivitySignal: Send + Sync {
    fn is_active(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Visibility set by hand: the host app forwards its own events here.
#[derive(Debug)]
pub struct ManualActivity {
    tx: watch::Sender<bool>,
}

impl Default for ManualActivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ManualActivity {
    pub fn new(active: bool) -> Self {
        Self {
            tx: watch::Sender::new(active),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
    }
}

impl ActivitySignal for ManualActivity {
    fn is_active(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
