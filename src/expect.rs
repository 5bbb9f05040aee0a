//! Deadline-bounded expectations over a [`Connection`].
//!
//! Every wait computes one absolute deadline up front; each internal retry
//! measures the remaining time against it, never resetting. Non-matching
//! messages are **discarded, not buffered** — once `expect` has skipped a
//! message it is gone and will not show up in a later `recv_all` or
//! `expect`. Scenario code must either expect messages in the order it
//! cares about or drain unrelated noise first (`recv_all`). Issuing two
//! expectations in the wrong order silently eats the first answer; this is
//! a deliberate trade for deterministic, replay-free semantics.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::error::{HarnessError, Result};
use crate::message::Message;

/// What to match an incoming message against.
///
/// Two axes: the command token, or the full raw line. Each axis offers an
/// exact/substring form and a regex form. All matching is case-insensitive,
/// like the protocol itself.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Exact command token equality.
    Command(String),
    /// Regex over the command token.
    CommandRe(Regex),
    /// Substring of the raw line.
    Raw(String),
    /// Regex over the raw line.
    RawRe(Regex),
}

impl Matcher {
    /// Match an exact command token (verb or numeric), e.g. `"001"`.
    pub fn command(token: &str) -> Self {
        Matcher::Command(token.to_ascii_uppercase())
    }

    /// Match the command token against a regex.
    pub fn command_re(pattern: &str) -> Result<Self> {
        Ok(Matcher::CommandRe(Regex::new(&format!("(?i){pattern}"))?))
    }

    /// Match any raw line containing `needle`.
    pub fn raw(needle: &str) -> Self {
        Matcher::Raw(needle.to_string())
    }

    /// Match the raw line against a regex.
    pub fn raw_re(pattern: &str) -> Result<Self> {
        Ok(Matcher::RawRe(Regex::new(&format!("(?i){pattern}"))?))
    }

    pub fn matches(&self, msg: &Message) -> bool {
        match self {
            Matcher::Command(token) => msg.command.eq_ignore_ascii_case(token),
            Matcher::CommandRe(re) => re.is_match(&msg.command),
            Matcher::Raw(needle) => msg
                .raw
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            Matcher::RawRe(re) => re.is_match(&msg.raw),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Command(token) => write!(f, "command == {token:?}"),
            Matcher::CommandRe(re) => write!(f, "command ~ /{}/", re.as_str()),
            Matcher::Raw(needle) => write!(f, "raw contains {needle:?}"),
            Matcher::RawRe(re) => write!(f, "raw ~ /{}/", re.as_str()),
        }
    }
}

impl Connection {
    /// Drain whatever arrives within `window`. Best effort: stops at the
    /// first timeout or EOF, so it is "grab what arrived by now", not a
    /// guarantee that nothing more exists.
    pub async fn recv_all(&mut self, window: Duration) -> Result<Vec<Message>> {
        let deadline = Instant::now() + window;
        let mut messages = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv(remaining).await? {
                Some(msg) => messages.push(msg),
                None => break,
            }
        }
        Ok(messages)
    }

    /// Consume messages until one matches, discarding the rest.
    ///
    /// Messages arrive in stream order; the first match is returned
    /// immediately. Fails with [`HarnessError::ExpectationTimeout`] when
    /// the deadline passes — or as soon as the stream hits EOF, since
    /// nothing more can arrive.
    pub async fn expect(&mut self, matcher: &Matcher, wait: Duration) -> Result<Message> {
        let start = Instant::now();
        let deadline = start + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv(remaining).await? {
                Some(msg) if matcher.matches(&msg) => return Ok(msg),
                Some(_) => continue,
                None if !self.is_connected() => break,
                None => continue,
            }
        }
        Err(HarnessError::ExpectationTimeout {
            wanted: matcher.to_string(),
            waited: start.elapsed(),
        })
    }

    /// Like [`expect`](Self::expect), but the first message matching *any*
    /// of the matchers wins.
    pub async fn expect_any(&mut self, matchers: &[Matcher], wait: Duration) -> Result<Message> {
        let start = Instant::now();
        let deadline = start + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv(remaining).await? {
                Some(msg) if matchers.iter().any(|m| m.matches(&msg)) => return Ok(msg),
                Some(_) => continue,
                None if !self.is_connected() => break,
                None => continue,
            }
        }
        let wanted = matchers
            .iter()
            .map(Matcher::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(HarnessError::ExpectationTimeout {
            wanted,
            waited: start.elapsed(),
        })
    }

    /// Wait for an exact numeric reply, e.g. `"001"` or `"433"`.
    pub async fn expect_numeric(&mut self, code: &str, wait: Duration) -> Result<Message> {
        self.expect(&Matcher::command(code), wait).await
    }
}
