//! Event log configuration.

use memkit_events::Delivery;

/// Environment variable toggling synchronous subscriber delivery.
pub const ENV_SYNC_SUBSCRIBERS: &str = "MEMKIT_SYNC_SUBSCRIBERS";

/// Environment variable toggling trace capture on append.
pub const ENV_CAPTURE_TRACES: &str = "MEMKIT_CAPTURE_TRACES";

/// Options of an [`EventLog`](super::EventLog).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogOptions {
    /// Deliver to subscribers before `append` returns (default `true`).
    pub synchronous_subscribers: bool,
    /// Attach a [`Trace`](memkit_events::Trace) to events on first append
    /// (default `true`). Frames are recorded whatever `RUST_BACKTRACE` says;
    /// turn this off on hot paths.
    pub capture_traces: bool,
}

impl Default for EventLogOptions {
    fn default() -> Self {
        Self {
            synchronous_subscribers: true,
            capture_traces: true,
        }
    }
}

impl EventLogOptions {
    /// Read options from `MEMKIT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read options through `lookup`; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |name: &str, default: bool| {
            lookup(name)
                .and_then(|v| v.trim().parse::<bool>().ok())
                .unwrap_or(default)
        };

        Self {
            synchronous_subscribers: flag(ENV_SYNC_SUBSCRIBERS, defaults.synchronous_subscribers),
            capture_traces: flag(ENV_CAPTURE_TRACES, defaults.capture_traces),
        }
    }

    pub fn with_synchronous_subscribers(mut self, enabled: bool) -> Self {
        self.synchronous_subscribers = enabled;
        self
    }

    pub fn with_capture_traces(mut self, enabled: bool) -> Self {
        self.capture_traces = enabled;
        self
    }

    pub(crate) fn delivery(&self) -> Delivery {
        if self.synchronous_subscribers {
            Delivery::Synchronous
        } else {
            Delivery::Asynchronous
        }
    }
}
