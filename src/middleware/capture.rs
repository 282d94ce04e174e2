//! Telemetry rate limiting: per-method debounce inside a global window budget

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{CAPTURE_LIMIT, CAPTURE_WINDOW};
use crate::middleware::method::Method;

/// Global telemetry budget for one middleware instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub window: Duration,
    pub limit: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            window: CAPTURE_WINDOW,
            limit: CAPTURE_LIMIT,
        }
    }
}

/// Rate-limiting state for telemetry capture.
///
/// `last_sent` is keyed by [`Method`], so it never holds more entries than
/// there are intercepted methods.
#[derive(Debug, Default)]
pub struct CaptureWindow {
    window_start: Option<Instant>,
    events_sent: usize,
    last_sent: HashMap<Method, Instant>,
}

impl CaptureWindow {
    /// Decides whether an event for `method` observed at `now` may be sent,
    /// and records it if so.
    pub fn admit(
        &mut self,
        method: Method,
        debounce: Duration,
        now: Instant,
        limits: CaptureLimits,
    ) -> bool {
        let expired = self
            .window_start
            .is_none_or(|start| now > start + limits.window);
        if expired {
            self.window_start = Some(now);
            self.events_sent = 0;
        }

        if self.events_sent >= limits.limit {
            return false;
        }

        let debounced = self
            .last_sent
            .get(&method)
            .is_some_and(|last| now.saturating_duration_since(*last) <= debounce);
        if debounced {
            return false;
        }

        self.events_sent += 1;
        self.last_sent.insert(method, now);
        true
    }

    pub fn events_sent(&self) -> usize {
        self.events_sent
    }
}
