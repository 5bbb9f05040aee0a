//! One scripted client session against the server under test.
//!
//! A `Session` owns exactly one [`Connection`] and layers the protocol
//! handshakes on top of the expectation engine: registration, CAP
//! negotiation, SASL PLAIN, channel membership, WHOIS. Each helper is a
//! short scripted exchange with a fixed terminal condition.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crate::connection::Connection;
use crate::error::{HarnessError, Result};
use crate::expect::Matcher;
use crate::message::Message;

/// Timeout for the short CAP request/response exchanges.
const CAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet gap after which a WHOIS collection is considered finished even
/// without a terminal numeric.
const WHOIS_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    /// Default timeout for connects and expectations.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick: format!("test{}", unix_secs() % 10000),
            user: "test".to_string(),
            realname: "Test User".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A connected client plus its local protocol state.
pub struct Session {
    config: SessionConfig,
    conn: Connection,
    registered: bool,
    caps_available: HashSet<String>,
    caps_enabled: HashSet<String>,
}

impl Session {
    /// Connect a new session. Registration is a separate step.
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let conn = Connection::connect(&config.server_addr, config.timeout).await?;
        Ok(Self {
            config,
            conn,
            registered: false,
            caps_available: HashSet::new(),
            caps_enabled: HashSet::new(),
        })
    }

    pub fn nick(&self) -> &str {
        &self.config.nick
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Capabilities the server advertised in the last `CAP LS` exchange.
    pub fn caps_available(&self) -> &HashSet<String> {
        &self.caps_available
    }

    /// Capabilities this session has successfully requested.
    pub fn caps_enabled(&self) -> &HashSet<String> {
        &self.caps_enabled
    }

    /// Direct access to the underlying connection, for scenarios that need
    /// the raw receive primitives.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    // ── Wire primitives, forwarded with the session default timeout ──

    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.conn.send(line).await
    }

    pub async fn send_many(&mut self, lines: &[&str]) -> Result<()> {
        for line in lines {
            self.conn.send(line).await?;
        }
        Ok(())
    }

    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Message>> {
        self.conn.recv(wait).await
    }

    pub async fn recv_all(&mut self, window: Duration) -> Result<Vec<Message>> {
        self.conn.recv_all(window).await
    }

    pub async fn expect(&mut self, matcher: &Matcher) -> Result<Message> {
        self.conn.expect(matcher, self.config.timeout).await
    }

    pub async fn expect_within(&mut self, matcher: &Matcher, wait: Duration) -> Result<Message> {
        self.conn.expect(matcher, wait).await
    }

    pub async fn expect_any(&mut self, matchers: &[Matcher]) -> Result<Message> {
        self.conn.expect_any(matchers, self.config.timeout).await
    }

    pub async fn expect_any_within(
        &mut self,
        matchers: &[Matcher],
        wait: Duration,
    ) -> Result<Message> {
        self.conn.expect_any(matchers, wait).await
    }

    pub async fn expect_numeric(&mut self, code: &str) -> Result<Message> {
        self.conn.expect_numeric(code, self.config.timeout).await
    }

    pub async fn expect_numeric_within(&mut self, code: &str, wait: Duration) -> Result<Message> {
        self.conn.expect_numeric(code, wait).await
    }

    // ── Scripted handshakes ──

    /// Basic registration: optional `PASS`, then `NICK` + `USER`, then wait
    /// for the 001 welcome. Propagates the expectation timeout if the
    /// welcome never arrives.
    pub async fn register(&mut self, password: Option<&str>) -> Result<Message> {
        if let Some(pass) = password {
            self.send(&format!("PASS {pass}")).await?;
        }
        self.send(&format!("NICK {}", self.config.nick)).await?;
        self.send(&format!(
            "USER {} 0 * :{}",
            self.config.user, self.config.realname
        ))
        .await?;

        let welcome = self.expect_numeric("001").await?;
        self.registered = true;
        tracing::debug!(nick = %self.config.nick, "registered");
        Ok(welcome)
    }

    /// `CAP LS <version>`: accumulate the advertised capability set,
    /// following `CAP … LS * :…` continuation lines until the final one.
    pub async fn cap_ls(&mut self, version: u16) -> Result<HashSet<String>> {
        self.send(&format!("CAP LS {version}")).await?;

        let mut caps = HashSet::new();
        loop {
            let msg = self
                .conn
                .expect(&Matcher::command("CAP"), CAP_TIMEOUT)
                .await?;
            if msg.params.get(1).map(String::as_str) != Some("LS") {
                continue;
            }
            let cap_str = msg.params.last().map(String::as_str).unwrap_or("");
            for cap in cap_str.split_whitespace() {
                // `name=value` advertisements are stored by name.
                let name = cap.split_once('=').map_or(cap, |(name, _)| name);
                caps.insert(name.to_string());
            }
            // `CAP <nick> LS * :…` marks a continuation line.
            let more_coming = msg.params.len() >= 4 && msg.params[2] == "*";
            if !more_coming {
                break;
            }
        }

        tracing::debug!(?caps, "server capabilities");
        self.caps_available = caps.clone();
        Ok(caps)
    }

    /// `CAP REQ`: request capabilities, await a single ACK/NAK. Returns
    /// `Ok(false)` on NAK or on timeout — a refusal is a negotiation
    /// outcome, not a harness failure.
    pub async fn cap_req(&mut self, capabilities: &[&str]) -> Result<bool> {
        self.send(&format!("CAP REQ :{}", capabilities.join(" ")))
            .await?;

        let msg = match self
            .conn
            .expect(&Matcher::command("CAP"), CAP_TIMEOUT)
            .await
        {
            Ok(msg) => msg,
            Err(HarnessError::ExpectationTimeout { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        if msg.params.get(1).map(String::as_str) == Some("ACK") {
            self.caps_enabled
                .extend(capabilities.iter().map(|c| c.to_string()));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// End capability negotiation.
    pub async fn cap_end(&mut self) -> Result<()> {
        self.send("CAP END").await
    }

    /// Full negotiation: list the server's capabilities, then request the
    /// desired subset.
    pub async fn negotiate(&mut self, requested: &[&str]) -> Result<bool> {
        self.cap_ls(302).await?;
        self.cap_req(requested).await
    }

    /// SASL PLAIN authentication. Requests the `sasl` capability, selects
    /// the PLAIN mechanism, waits for the server's `AUTHENTICATE +`
    /// go-ahead, sends the base64 `\0user\0pass` blob, and reports whether
    /// the server answered with a success numeric.
    pub async fn authenticate_sasl_plain(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool> {
        if !self.cap_req(&["sasl"]).await? {
            return Ok(false);
        }

        self.send("AUTHENTICATE PLAIN").await?;
        match self
            .conn
            .expect(&Matcher::command("AUTHENTICATE"), CAP_TIMEOUT)
            .await
        {
            Ok(_) => {}
            Err(HarnessError::ExpectationTimeout { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }

        let blob = B64.encode(format!("\0{username}\0{password}"));
        self.send(&format!("AUTHENTICATE {blob}")).await?;

        let outcome = self
            .expect_any(&[
                Matcher::command("900"),
                Matcher::command("903"),
                Matcher::command("902"),
                Matcher::command("904"),
                Matcher::command("908"),
            ])
            .await?;
        let ok = matches!(outcome.command.as_str(), "900" | "903");
        tracing::debug!(username, ok, "sasl plain outcome");
        Ok(ok)
    }

    /// Join a channel and wait for the confirming JOIN. Matched loosely on
    /// the raw line because the confirmation carries our own prefix, whose
    /// exact user/host the scenario may not know yet.
    pub async fn join(&mut self, channel: &str, key: Option<&str>) -> Result<Message> {
        match key {
            Some(key) => self.send(&format!("JOIN {channel} {key}")).await?,
            None => self.send(&format!("JOIN {channel}")).await?,
        }
        let confirm = Matcher::raw_re(&format!("JOIN.*{}", regex::escape(channel)))?;
        self.expect(&confirm).await
    }

    /// Part a channel. Fire-and-forget.
    pub async fn part(&mut self, channel: &str, reason: Option<&str>) -> Result<()> {
        match reason {
            Some(reason) => self.send(&format!("PART {channel} :{reason}")).await,
            None => self.send(&format!("PART {channel}")).await,
        }
    }

    pub async fn privmsg(&mut self, target: &str, text: &str) -> Result<()> {
        self.send(&format!("PRIVMSG {target} :{text}")).await
    }

    pub async fn notice(&mut self, target: &str, text: &str) -> Result<()> {
        self.send(&format!("NOTICE {target} :{text}")).await
    }

    /// Send WHOIS and collect every reply up to the end-of-WHOIS (318) or
    /// no-such-nick (401) terminal, or a quiet gap. Callers filter by
    /// numeric themselves.
    pub async fn whois(&mut self, nick: &str) -> Result<Vec<Message>> {
        self.send(&format!("WHOIS {nick}")).await?;

        let mut messages = Vec::new();
        loop {
            match self.conn.recv(WHOIS_TIMEOUT).await? {
                Some(msg) => {
                    let terminal = matches!(msg.command.as_str(), "318" | "401");
                    messages.push(msg);
                    if terminal {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(messages)
    }

    /// Best-effort graceful shutdown: QUIT (errors swallowed), then close.
    /// Never fails, so teardown paths can always run it.
    pub async fn quit(&mut self, reason: &str) {
        let _ = self.conn.send(&format!("QUIT :{reason}")).await;
        self.disconnect().await;
    }

    /// Close the connection without the QUIT courtesy.
    pub async fn disconnect(&mut self) {
        self.conn.disconnect().await;
        self.registered = false;
    }
}
