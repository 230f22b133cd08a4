//! Shared primitives used across Waypoint crates.

use core::fmt;

/// Result alias used across the workspace.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Error carried across crate boundaries.
///
/// `code` is a stable dotted identifier (`storage.*`, `net.*`, `channel.*`,
/// `rewrite.*`) that callers and tests match on; `message` is for humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyError {
    pub code: &'static str,
    pub message: String,
}

impl ProxyError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProxyError {}
