//! Per-key window of recent request timestamps.

use std::collections::VecDeque;

use super::decision::{Policy, WindowStats};

/// The ordered timestamps admitted for one key.
///
/// Timestamps are appended in admission order, so the queue is always
/// sorted ascending and stale entries can only sit at the head.
#[derive(Debug, Default)]
pub struct WindowState {
    /// Admitted request times, oldest first
    timestamps: VecDeque<f64>,
    /// Policy fixed at first use when the limiter runs in bound mode
    bound: Option<Policy>,
}

impl WindowState {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an admitted request time.
    ///
    /// A timestamp older than the current tail (a clock step backwards) is
    /// clamped to the tail so the queue stays sorted. Returns the value
    /// actually stored.
    pub fn record(&mut self, timestamp: f64) -> f64 {
        let stored = match self.timestamps.back() {
            Some(&last) if last > timestamp => last,
            _ => timestamp,
        };
        self.timestamps.push_back(stored);
        stored
    }

    /// Drop every entry strictly older than `cutoff`.
    ///
    /// Returns how many entries were removed.
    pub fn evict_stale(&mut self, cutoff: f64) -> usize {
        let mut evicted = 0;
        while let Some(&front) = self.timestamps.front() {
            if front >= cutoff {
                break;
            }
            self.timestamps.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Report the entries at or after `cutoff` without mutating the window.
    pub fn snapshot(&self, cutoff: f64) -> WindowStats {
        let start = self.timestamps.partition_point(|&t| t < cutoff);
        let total_requests = self.timestamps.len() - start;
        if total_requests == 0 {
            return WindowStats::empty();
        }

        WindowStats {
            total_requests,
            first_request: self.timestamps.get(start).copied(),
            last_request: self.timestamps.back().copied(),
        }
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the window holds no entries.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// The oldest retained timestamp.
    pub fn oldest(&self) -> Option<f64> {
        self.timestamps.front().copied()
    }

    /// The newest retained timestamp.
    pub fn newest(&self) -> Option<f64> {
        self.timestamps.back().copied()
    }

    pub(crate) fn bound_policy(&self) -> Option<Policy> {
        self.bound
    }

    pub(crate) fn bind(&mut self, policy: Policy) {
        self.bound = Some(policy);
    }
}
