//! Process-wide settings.
//!
//! Two knobs affect every grammar and matcher in the process: the maximum
//! nesting depth accepted by the recursive-descent parsers (EBNF, regex,
//! JSON Schema, structural tags), and the serialization format version
//! stamped into every JSON artifact.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default maximum recursion depth for grammar parsing.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 10_000;

/// Version string written into, and required from, serialized artifacts.
pub const SERIALIZATION_VERSION: &str = "pie-grammar/v1";

static MAX_RECURSION_DEPTH: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_RECURSION_DEPTH);

/// Current maximum recursion depth.
pub fn max_recursion_depth() -> usize {
    MAX_RECURSION_DEPTH.load(Ordering::Relaxed)
}

/// Set the maximum recursion depth for all subsequent parses.
pub fn set_max_recursion_depth(depth: usize) {
    MAX_RECURSION_DEPTH.store(depth, Ordering::Relaxed);
}

pub fn serialization_version() -> &'static str {
    SERIALIZATION_VERSION
}

/// Nesting counter shared by the recursive-descent parsers.
///
/// The limit is read once at construction so a parse sees a consistent value
/// even if another thread changes the setting mid-parse.
#[derive(Debug)]
pub(crate) struct DepthGuard {
    depth: usize,
    max: usize,
}

impl DepthGuard {
    pub(crate) fn new() -> Self {
        Self {
            depth: 0,
            max: max_recursion_depth(),
        }
    }

    /// Enter one nesting level. Returns false once the limit is exceeded.
    pub(crate) fn enter(&mut self) -> bool {
        self.depth += 1;
        self.depth <= self.max
    }

    pub(crate) fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_guard_limit() {
        let mut guard = DepthGuard { depth: 0, max: 2 };
        assert!(guard.enter());
        assert!(guard.enter());
        assert!(!guard.enter());
        guard.exit();
        guard.exit();
        assert!(guard.enter());
    }

    #[test]
    fn test_serialization_version_is_stable() {
        assert_eq!(serialization_version(), SERIALIZATION_VERSION);
        assert!(!SERIALIZATION_VERSION.is_empty());
    }
}
