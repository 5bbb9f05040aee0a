//! Harness error taxonomy.
//!
//! Scenario code is expected to match on kinds: connect failures are fatal
//! to the session being constructed, [`HarnessError::ExpectationTimeout`]
//! is recoverable (an expected-negative outcome in many tests), and a
//! closed stream is a state (`recv` returning `None` with
//! `is_connected() == false`), not an error.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// TCP connect failed outright (refused, unreachable, resolution).
    #[error("connection to {addr} failed: {source}")]
    ConnectRefused {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect did not complete within the allowed window.
    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// A deadline-bounded wait elapsed with no matching message.
    ///
    /// `wanted` is the human-readable matcher description, `waited` the
    /// elapsed window, so the failure is diagnosable without traffic logs.
    #[error("no message matching {wanted} within {waited:?}")]
    ExpectationTimeout { wanted: String, waited: Duration },

    /// An operation was attempted on a connection that is already closed.
    #[error("not connected")]
    NotConnected,

    /// Pool lookup for a name that was never added.
    #[error("no client named {0:?}")]
    UnknownClient(String),

    /// Pool add for a name that already exists. Overwriting would leak the
    /// prior connection, so this is refused.
    #[error("client {0:?} already exists")]
    DuplicateClient(String),

    /// A matcher pattern failed to compile.
    #[error("invalid match pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// True for the recoverable "deadline elapsed" case.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::ExpectationTimeout { .. })
    }
}
