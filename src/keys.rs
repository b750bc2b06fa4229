//! Key namespacing.
//!
//! Pure scoping functions built around an instance-configured
//! namespace rather than a fixed prefix constant.

use crate::error::{CacheError, CacheResult};

/// Prefix applied to every lock record, ahead of the scoped key
/// (`lock:<namespace>:<user_key>`).
const LOCK_PREFIX: &str = "lock";

/// Scopes and unscopes user-supplied keys under a shared namespace.
#[derive(Clone, Debug)]
pub struct KeyNamer {
    namespace: String,
}

impl KeyNamer {
    /// Create a namer scoped to `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The invalidation pub/sub channel for this namespace.
    pub fn invalidation_channel(&self) -> String {
        format!("{}:invalidate", self.namespace)
    }

    /// Scope a user key: `<namespace>:<key>`.
    ///
    /// Rejects empty or whitespace-only keys.
    pub fn scope(&self, user_key: &str) -> CacheResult<String> {
        let trimmed = user_key.trim();
        if trimmed.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        Ok(format!("{}:{}", self.namespace, trimmed))
    }

    /// Invert [`scope`](Self::scope): strip the leading namespace.
    ///
    /// Returns `None` if `scoped` is not under this namespace.
    pub fn unscope<'a>(&self, scoped: &'a str) -> Option<&'a str> {
        let prefix = format!("{}:", self.namespace);
        scoped.strip_prefix(prefix.as_str())
    }

    /// The Redis key under which a lock record for `scoped_key` lives:
    /// `lock:<namespace>:<user_key>`.
    pub fn lock_key(&self, scoped_key: &str) -> String {
        format!("{LOCK_PREFIX}:{scoped_key}")
    }

    /// Glob pattern matching every scoped key in this namespace.
    pub fn scoped_pattern(&self, user_pattern: &str) -> String {
        format!("{}:{}", self.namespace, user_pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_prefixes_namespace() {
        let namer = KeyNamer::new("app");
        assert_eq!(namer.scope("user:1").unwrap(), "app:user:1");
    }

    #[test]
    fn scope_rejects_empty_key() {
        let namer = KeyNamer::new("app");
        assert!(matches!(namer.scope(""), Err(CacheError::InvalidKey)));
        assert!(matches!(namer.scope("   "), Err(CacheError::InvalidKey)));
    }

    #[test]
    fn unscope_inverts_scope() {
        let namer = KeyNamer::new("app");
        let scoped = namer.scope("user:1").unwrap();
        assert_eq!(namer.unscope(&scoped), Some("user:1"));
    }

    #[test]
    fn unscope_rejects_foreign_namespace() {
        let namer = KeyNamer::new("app");
        assert_eq!(namer.unscope("other:user:1"), None);
    }

    #[test]
    fn lock_key_is_prefixed_ahead_of_scope() {
        let namer = KeyNamer::new("app");
        let scoped = namer.scope("user:1").unwrap();
        assert_eq!(namer.lock_key(&scoped), "lock:app:user:1");
    }

    #[test]
    fn invalidation_channel_is_namespaced() {
        let namer = KeyNamer::new("app");
        assert_eq!(namer.invalidation_channel(), "app:invalidate");
    }
}
