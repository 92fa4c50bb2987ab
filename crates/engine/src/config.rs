//! Engine configuration.

use kdisco_core::ObjectKind;

pub const DEFAULT_MAX_INFLIGHT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub kind: ObjectKind,
    /// Events only: deliver `Normal` events too (by default only warnings are interesting).
    pub include_normal_events: bool,
    /// Events only: skip events created before this unix timestamp.
    pub events_since: i64,
    /// Bound on concurrent owner-tree lookups; `None` spawns one task per update without limit.
    pub max_inflight_resolutions: Option<usize>,
}

impl EngineConfig {
    /// Defaults for `kind`. Events older than "now" are ignored.
    pub fn for_kind(kind: ObjectKind) -> Self {
        Self {
            kind,
            include_normal_events: false,
            events_since: chrono::Utc::now().timestamp(),
            max_inflight_resolutions: Some(DEFAULT_MAX_INFLIGHT),
        }
    }

    /// Defaults overridden by `KDISCO_INCLUDE_NORMAL_EVENTS` and `KDISCO_MAX_INFLIGHT` (`0` = unbounded).
    pub fn from_env(kind: ObjectKind) -> Self {
        let mut cfg = Self::for_kind(kind);
        if let Ok(v) = std::env::var("KDISCO_INCLUDE_NORMAL_EVENTS") {
            cfg.include_normal_events = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = std::env::var("KDISCO_MAX_INFLIGHT").ok().and_then(|s| s.parse::<usize>().ok()) {
            cfg.max_inflight_resolutions = if n == 0 { None } else { Some(n) };
        }
        cfg
    }

    pub fn with_events_since(mut self, ts: i64) -> Self {
        self.events_since = ts;
        self
    }

    pub fn with_normal_events(mut self, on: bool) -> Self {
        self.include_normal_events = on;
        self
    }

    pub fn with_max_inflight(mut self, n: Option<usize>) -> Self {
        self.max_inflight_resolutions = n;
        self
    }
}
