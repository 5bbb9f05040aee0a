//! Protocol-level test harness for IRC servers.
//!
//! This crate drives one or more client connections against a server under
//! test, injects protocol commands, and asserts on the responses with
//! pattern-based, deadline-bounded expectations. It does not implement a
//! server; it only needs a reachable host:port speaking line-oriented IRC.
//!
//! Layers, bottom up:
//! - [`message`] — parsing a wire line into a structured [`Message`]
//! - [`connection`] — one TCP stream with send/receive-with-timeout
//! - [`expect`] — "wait until a message matching M arrives, or fail"
//! - [`session`] — scripted exchanges (registration, CAP, SASL, JOIN, WHOIS)
//! - [`pool`] — a named set of sessions for multi-client scenarios

pub mod connection;
pub mod error;
pub mod expect;
pub mod message;
pub mod pool;
pub mod session;

pub use connection::Connection;
pub use error::{HarnessError, Result};
pub use expect::Matcher;
pub use message::{Message, TagValue};
pub use pool::ClientPool;
pub use session::{Session, SessionConfig};
