//! Named pool of client sessions for multi-client scenarios.
//!
//! The pool is the only thing shared across sessions, and it is nothing
//! more than a name→session map: each session exclusively owns its
//! connection, so scenarios get per-stream ordering with no locking.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HarnessError, Result};
use crate::session::{Session, SessionConfig};

pub struct ClientPool {
    server_addr: String,
    clients: HashMap<String, Session>,
}

impl ClientPool {
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addr: server_addr.to_string(),
            clients: HashMap::new(),
        }
    }

    /// Connect and register a new named client. The nick is derived from
    /// the name plus a time-based suffix to avoid collisions across runs.
    pub async fn add_client(&mut self, name: &str) -> Result<&mut Session> {
        self.add_client_with(name, None, true).await
    }

    /// Full form: explicit nick and optional auto-registration. Fails with
    /// [`HarnessError::DuplicateClient`] if the name is taken — silently
    /// overwriting would leak the previous connection.
    pub async fn add_client_with(
        &mut self,
        name: &str,
        nick: Option<&str>,
        register: bool,
    ) -> Result<&mut Session> {
        if self.clients.contains_key(name) {
            return Err(HarnessError::DuplicateClient(name.to_string()));
        }

        let nick = match nick {
            Some(nick) => nick.to_string(),
            None => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis();
                format!("{name}{}", millis % 1000)
            }
        };

        let config = SessionConfig {
            server_addr: self.server_addr.clone(),
            nick,
            ..SessionConfig::default()
        };
        let mut session = Session::connect(config).await?;
        if register {
            session.register(None).await?;
        }

        Ok(self.clients.entry(name.to_string()).or_insert(session))
    }

    /// Look up a client by name.
    pub fn get(&mut self, name: &str) -> Result<&mut Session> {
        self.clients
            .get_mut(name)
            .ok_or_else(|| HarnessError::UnknownClient(name.to_string()))
    }

    /// Take a session out of the pool, e.g. so a scenario can await on two
    /// sessions concurrently. The caller becomes responsible for quitting.
    pub fn remove(&mut self, name: &str) -> Option<Session> {
        self.clients.remove(name)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Best-effort teardown of every managed session: QUIT then close,
    /// individual failures swallowed so one bad session cannot block the
    /// cleanup of the rest. Dropping the pool without calling this still
    /// closes the sockets, just without the graceful QUIT.
    pub async fn teardown(&mut self) {
        for (name, session) in self.clients.iter_mut() {
            tracing::debug!(%name, "tearing down client");
            session.quit("test teardown").await;
        }
        self.clients.clear();
    }
}
