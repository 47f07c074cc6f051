//! Access control: `(operation, key) -> allow/deny` (spec §4.5).

use std::collections::HashSet;

use regex::Regex;

/// The four operations access control can gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
    Delete,
    Clear,
}

impl Operation {
    /// The name used in `CacheError::AccessDenied` and log events.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::Clear => "clear",
        }
    }
}

/// `(operation, key) -> allow/deny`.
///
/// Deny on `operation not in allowed_operations`, on `key in restricted_keys`,
/// or on any pattern in `restricted_patterns` matching `key`.
pub struct AccessController {
    allowed_operations: HashSet<String>,
    restricted_keys: HashSet<String>,
    restricted_patterns: Vec<Regex>,
}

impl std::fmt::Debug for AccessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessController")
            .field("allowed_operations", &self.allowed_operations)
            .field("restricted_keys", &self.restricted_keys)
            .field("restricted_patterns", &self.restricted_patterns.len())
            .finish()
    }
}

impl AccessController {
    /// Builds a controller from the config record's raw fields. Invalid
    /// regexes are dropped with the error in the returned `Vec`, matching
    /// the "tolerate and log" posture used for watcher registration.
    pub fn new(
        allowed_operations: impl IntoIterator<Item = String>,
        restricted_keys: impl IntoIterator<Item = String>,
        restricted_patterns: &[String],
    ) -> (Self, Vec<String>) {
        let mut compile_errors = Vec::new();
        let patterns = restricted_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    compile_errors.push(format!("invalid restricted pattern {p:?}: {e}"));
                    None
                }
            })
            .collect();
        let controller = AccessController {
            allowed_operations: allowed_operations.into_iter().collect(),
            restricted_keys: restricted_keys.into_iter().collect(),
            restricted_patterns: patterns,
        };
        (controller, compile_errors)
    }

    /// An "allow everything" controller, used when no config is supplied.
    pub fn permissive() -> Self {
        let (c, _) = Self::new(
            ["get", "set", "delete", "clear"].map(String::from),
            [],
            &[],
        );
        c
    }

    /// Returns `Ok(())` if `operation` on `key` is allowed, else the denial
    /// reason (the caller wraps this as `CacheError::AccessDenied`).
    pub fn check(&self, operation: Operation, key: &str) -> bool {
        if !self.allowed_operations.contains(operation.name()) {
            return false;
        }
        if self.restricted_keys.contains(key) {
            return false;
        }
        if self.restricted_patterns.iter().any(|re| re.is_match(key)) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_allows_everything() {
        let ac = AccessController::permissive();
        assert!(ac.check(Operation::Get, "anything"));
        assert!(ac.check(Operation::Clear, "anything"));
    }

    #[test]
    fn denies_disallowed_operation() {
        let (ac, errs) = AccessController::new(["get".to_string()], [], &[]);
        assert!(errs.is_empty());
        assert!(ac.check(Operation::Get, "k"));
        assert!(!ac.check(Operation::Set, "k"));
    }

    #[test]
    fn denies_restricted_key_and_pattern() {
        let (ac, _) = AccessController::new(
            ["get".to_string(), "set".to_string()],
            ["secret_key".to_string()],
            &["^admin_.*".to_string()],
        );
        assert!(!ac.check(Operation::Get, "secret_key"));
        assert!(!ac.check(Operation::Set, "admin_users"));
        assert!(ac.check(Operation::Get, "public_key"));
    }

    #[test]
    fn invalid_pattern_is_reported_not_fatal() {
        let (_, errs) = AccessController::new(["get".to_string()], [], &["(".to_string()]);
        assert_eq!(errs.len(), 1);
    }
}
