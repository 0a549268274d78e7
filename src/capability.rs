//! In-process control surface for profiling sessions.

use std::sync::{Arc, Mutex, MutexGuard};

/// The capability a hosting application can expose so a session is driven by
/// direct in-process calls instead of protocol commands. All methods are
/// synchronous. `is_ready` reports whether the control surface inside the
/// profiled target is initialized; the runner signals "connected" before
/// that point.
pub trait ProfilerApi: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn save_data(&self);
    fn drop_data(&self);
    fn detach(&self);
    fn is_ready(&self) -> bool;
}

/// Preference for the control channel, fixed at attach for the session's
/// whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiMode {
    /// Use the in-process api when one is installed, otherwise fall back to
    /// protocol commands silently.
    #[default]
    Auto,
    /// Fail the attach with `ApiUnavailable` when no api is installed.
    Require,
    /// Always drive the session through protocol commands.
    Forbid,
}

/// Per-facade installation slot for a [`ProfilerApi`]. The implementation is
/// wired once at init time when the capability is truly present; sessions
/// read the slot once at attach and never probe again.
#[derive(Default, Clone)]
pub struct ApiBinding {
    slot: Arc<Mutex<Option<Arc<dyn ProfilerApi>>>>,
}

impl ApiBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, api: Arc<dyn ProfilerApi>) {
        *lock(&self.slot) = Some(api);
    }

    pub fn bound(&self) -> Option<Arc<dyn ProfilerApi>> {
        lock(&self.slot).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
