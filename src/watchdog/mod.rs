use crate::transport::TransportHandle;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Traffic timestamps for the current connection. `None` means nothing has
/// been seen since the last reset, which leaves the matching watchdog idle.
#[derive(Debug, Default)]
pub struct HealthClocks {
    inner: Mutex<Clocks>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Clocks {
    last_message: Option<Instant>,
    last_event: Option<Instant>,
}

impl HealthClocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.lock() = Clocks::default();
    }

    pub fn touch_message(&self) {
        self.lock().last_message = Some(Instant::now());
    }

    pub fn touch_event(&self) {
        let now = Instant::now();
        let mut clocks = self.lock();
        clocks.last_message = Some(now);
        clocks.last_event = Some(now);
    }

    pub fn last_message(&self) -> Option<Instant> {
        self.lock().last_message
    }

    pub fn last_event(&self) -> Option<Instant> {
        self.lock().last_event
    }

    fn lock(&self) -> MutexGuard<'_, Clocks> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    /// Any inbound traffic, pings included.
    Message,
    /// `EventObject` pushes only.
    Event,
}

impl WatchdogKind {
    fn last_seen(self, clocks: &HealthClocks) -> Option<Instant> {
        match self {
            Self::Message => clocks.last_message(),
            Self::Event => clocks.last_event(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Event => "event",
        }
    }
}

pub fn idle_beyond(last_seen: Option<Instant>, now: Instant, timeout: Duration) -> Option<Duration> {
    let idle = now.saturating_duration_since(last_seen?);
    (idle > timeout).then_some(idle)
}

/// Polls the clock every `check_interval` and closes the transport once it has
/// been idle for longer than `timeout`. Returns `true` if it fired.
pub async fn run_watchdog(
    kind: WatchdogKind,
    clocks: Arc<HealthClocks>,
    timeout: Duration,
    check_interval: Duration,
    transport: TransportHandle,
) -> bool {
    let start = Instant::now() + check_interval;
    let mut ticker = tokio::time::interval_at(start, check_interval);
    loop {
        ticker.tick().await;
        if transport.is_closed() {
            return false;
        }
        if let Some(idle) = idle_beyond(kind.last_seen(&clocks), Instant::now(), timeout) {
            tracing::warn!(
                watchdog = kind.label(),
                idle_secs = idle.as_secs(),
                "no traffic within timeout, forcing reconnect"
            );
            transport.close();
            return true;
        }
    }
}
