//! Policy and decision value types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Window length used by stats queries when the caller gives none.
pub const DEFAULT_STATS_WINDOW_SECS: u64 = 60;

/// A caller-supplied limit: at most `max_requests` inside any trailing
/// `window_seconds` interval.
///
/// Policies are not stored by the limiter unless it runs in bound mode;
/// every call supplies one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum admitted requests inside the window
    pub max_requests: u64,
    /// Length of the sliding window in seconds
    pub window_seconds: u64,
}

impl Policy {
    /// Create a new policy.
    pub fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    /// Window length as fractional seconds.
    pub fn window(&self) -> f64 {
        self.window_seconds as f64
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.max_requests, self.window_seconds)
    }
}

/// The verdict for a single admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The request was admitted and recorded.
    Allowed {
        /// Occupancy including this request
        current_count: u64,
        limit: u64,
        remaining: u64,
        window_seconds: u64,
        /// Epoch second at which the oldest retained entry ages out
        reset_at: i64,
    },
    /// The request was refused; nothing was recorded.
    Denied {
        /// Occupancy at the time of the refusal
        current_count: u64,
        limit: u64,
        window_seconds: u64,
        /// Whole seconds to wait before retrying, never below 1
        retry_after: u64,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Window occupancy reported with the decision.
    pub fn current_count(&self) -> u64 {
        match self {
            Decision::Allowed { current_count, .. } | Decision::Denied { current_count, .. } => {
                *current_count
            }
        }
    }

    /// Remaining quota, present only when allowed.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            Decision::Allowed { remaining, .. } => Some(*remaining),
            Decision::Denied { .. } => None,
        }
    }

    /// Reset time, present only when allowed.
    pub fn reset_at(&self) -> Option<i64> {
        match self {
            Decision::Allowed { reset_at, .. } => Some(*reset_at),
            Decision::Denied { .. } => None,
        }
    }

    /// Retry-after in seconds, present only when denied.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Decision::Denied { retry_after, .. } => Some(*retry_after),
            Decision::Allowed { .. } => None,
        }
    }

    /// A human-readable explanation for denied requests.
    pub fn message(&self) -> Option<String> {
        self.retry_after()
            .map(|secs| format!("Rate limit exceeded. Try again in {}s", secs))
    }
}

/// Read-only occupancy report for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub total_requests: usize,
    pub first_request: Option<f64>,
    pub last_request: Option<f64>,
}

impl WindowStats {
    /// Stats for a key with nothing inside the window.
    pub fn empty() -> Self {
        Self::default()
    }
}
