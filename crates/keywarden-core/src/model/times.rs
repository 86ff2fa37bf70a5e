//! Timestamp block shared by groups and entries.

use chrono::{DateTime, Timelike, Utc};

/// Current time truncated to whole seconds, so values survive the textual
/// container format without drift.
pub fn now() -> DateTime<Utc> {
    let t = Utc::now();
    t.with_nanosecond(0).unwrap_or(t)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub creation: DateTime<Utc>,
    pub last_modification: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: u64,
    pub location_changed: DateTime<Utc>,
}

impl Times {
    pub fn new() -> Self {
        let t = now();
        Self {
            creation: t,
            last_modification: t,
            last_access: t,
            expiry: t,
            expires: false,
            usage_count: 0,
            location_changed: t,
        }
    }

    /// The single place that keeps timestamp invariants consistent: access
    /// time always moves, modification time only when `modified`, and the
    /// usage counter ticks on every touch.
    pub fn touch(&mut self, modified: bool) {
        let t = now();
        self.last_access = t;
        if modified {
            self.last_modification = t;
        }
        self.usage_count = self.usage_count.saturating_add(1);
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires && self.expiry <= at
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::new()
    }
}
