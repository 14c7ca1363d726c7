//! Host integration points
//!
//! The bridge does not prompt for permissions or manage process lifetime.
//! The host confirms what it was granted and may supply a keep-alive hook
//! (e.g. a foreground-service wrapper or a systemd watchdog).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Link permissions the host confirmed before `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub bluetooth: bool,
    pub network: bool,
}

impl Capabilities {
    pub fn granted() -> Self {
        Self { bluetooth: true, network: true }
    }

    /// Name of the first missing capability, if any.
    pub fn missing(&self) -> Option<&'static str> {
        if !self.bluetooth {
            Some("bluetooth")
        } else if !self.network {
            Some("network")
        } else {
            None
        }
    }
}

/// Keeps the host process alive while a link is Ready / Active.
pub trait KeepAlive: Send + Sync + 'static {
    fn hold(&self);
    fn release(&self);
}

/// Hook for hosts without lifecycle management.
pub struct NoopKeepAlive;

impl KeepAlive for NoopKeepAlive {
    fn hold(&self) {}
    fn release(&self) {}
}

/// Edge-triggers a [`KeepAlive`] hook so `hold`/`release` alternate.
pub struct KeepAliveLatch {
    hook: Arc<dyn KeepAlive>,
    held: AtomicBool,
}

impl KeepAliveLatch {
    pub fn new(hook: Arc<dyn KeepAlive>) -> Self {
        Self { hook, held: AtomicBool::new(false) }
    }

    pub fn set(&self, live: bool) {
        if live {
            if !self.held.swap(true, Ordering::AcqRel) {
                debug!("Keep-alive acquired");
                self.hook.hold();
            }
        } else if self.held.swap(false, Ordering::AcqRel) {
            debug!("Keep-alive released");
            self.hook.release();
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}
