//! Tab ids and presence colors.

use std::sync::atomic::{AtomicU64, Ordering};

use overseek_sync_core::types::ColorSource;
use uuid::Uuid;

pub trait IdentityGenerator: Send + Sync {
    /// A fresh id for a new tab.
    fn tab_id(&self) -> String;
    /// Color source for one presence tracker.
    fn colors(&self) -> Box<dyn ColorSource>;
}

/// uuid v4 tab ids and random hues.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdentity;

impl IdentityGenerator for RandomIdentity {
    fn tab_id(&self) -> String {
        format!("tab-{}", Uuid::new_v4().simple())
    }

    fn colors(&self) -> Box<dyn ColorSource> {
        Box::new(random_color)
    }
}

/// `hsl(<hue>, 70%, 50%)` with a random hue.
pub fn random_color() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let hue = u16::from_be_bytes([bytes[0], bytes[1]]) % 360;
    format!("hsl({hue}, 70%, 50%)")
}

/// Deterministic ids (`<prefix>-1`, `<prefix>-2`, ...) for simulations and tests.
#[derive(Debug)]
pub struct SequentialIdentity {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdentity {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdentityGenerator for SequentialIdentity {
    fn tab_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }

    fn colors(&self) -> Box<dyn ColorSource> {
        let mut n = 0u32;
        Box::new(move || {
            n += 1;
            format!("color-{n}")
        })
    }
}
