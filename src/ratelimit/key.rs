//! Rate limit key composition.

use std::fmt;

use crate::error::{LimiterError, Result};

/// Separates the scope from the identity in a rendered key.
///
/// Scopes may not contain it, so every (scope, identity) pair renders to a
/// distinct key. Identities may.
pub const SCOPE_SEPARATOR: char = ':';

/// A key that partitions rate limit accounting.
///
/// The key is composed of a scope (which policy applies) and the caller
/// identity (user, tenant, or source address) so that the same caller is
/// counted separately under each scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// The policy scope this key is accounted under
    pub scope: String,
    /// The caller identity
    pub identity: String,
}

impl LimitKey {
    /// Create a new key from a scope and identity.
    ///
    /// Returns `InvalidKey` if the scope is empty or contains
    /// [`SCOPE_SEPARATOR`].
    pub fn new(scope: &str, identity: &str) -> Result<Self> {
        if scope.is_empty() || scope.contains(SCOPE_SEPARATOR) {
            return Err(LimiterError::InvalidKey(format!(
                "scope '{}' must be non-empty and must not contain '{}'",
                scope, SCOPE_SEPARATOR
            )));
        }

        Ok(Self {
            scope: scope.to_string(),
            identity: identity.to_string(),
        })
    }

    /// The opaque string the limiter accounts against.
    pub fn to_string_key(&self) -> String {
        format!("{}{}{}", self.scope, SCOPE_SEPARATOR, self.identity)
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_key_to_string() {
        let key = LimitKey::new("upload", "10.0.0.7").unwrap();
        assert_eq!(key.to_string_key(), "upload:10.0.0.7");
        assert_eq!(key.to_string(), "upload:10.0.0.7");
    }

    #[test]
    fn test_same_identity_differs_by_scope() {
        let chat = LimitKey::new("chat", "user-1").unwrap();
        let upload = LimitKey::new("upload", "user-1").unwrap();

        assert_ne!(chat, upload);
        assert_ne!(chat.to_string_key(), upload.to_string_key());
    }

    #[test]
    fn test_scope_with_separator_is_rejected() {
        // ("a:b", "c") would otherwise collide with ("a", "b:c").
        let err = LimitKey::new("a:b", "c").unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKey(_)));

        let key = LimitKey::new("a", "b:c").unwrap();
        assert_eq!(key.to_string_key(), "a:b:c");
    }

    #[test]
    fn test_empty_scope_is_rejected() {
        assert!(LimitKey::new("", "user-1").is_err());
    }
}
