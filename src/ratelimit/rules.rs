//! Named rate limit policies loaded from configuration.
//!
//! The serving layer picks a policy per route or tenant class by scope name
//! and passes it to the limiter on every call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::decision::Policy;

/// Map of scope name to policy rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    rules: HashMap<String, PolicyRule>,
}

/// A configured limit for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Number of requests allowed inside the window
    pub max_requests: u64,
    /// The window length
    pub window: WindowSpec,
}

/// A window given either as whole seconds or as a named unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Seconds(u64),
    Unit(TimeUnit),
}

/// Named window units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of this unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }
}

impl WindowSpec {
    /// Window length in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            WindowSpec::Seconds(secs) => *secs,
            WindowSpec::Unit(unit) => unit.seconds(),
        }
    }
}

impl From<&PolicyRule> for Policy {
    fn from(rule: &PolicyRule) -> Self {
        Policy::new(rule.max_requests, rule.window.seconds())
    }
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the rule for a scope.
    pub fn insert(&mut self, scope: impl Into<String>, rule: PolicyRule) {
        self.rules.insert(scope.into(), rule);
    }

    /// Resolve the policy for a scope.
    pub fn get(&self, scope: &str) -> Option<Policy> {
        self.rules.get(scope).map(Policy::from)
    }

    /// Configured scope names, sorted.
    pub fn scopes(&self) -> Vec<&str> {
        let mut scopes: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        scopes.sort_unstable();
        scopes
    }

    /// Number of configured scopes.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no scopes are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
