//! In-process IRC server for harness integration tests.
//!
//! Implements just enough of the protocol to exercise the harness:
//! registration with nick-collision 433, CAP LS/REQ/END (with configurable
//! multi-line LS pages), SASL PLAIN against a static account map,
//! JOIN/PART/PRIVMSG/QUIT fan-out, WHOIS, and PING/PONG. Test-control
//! hooks allow injecting arbitrary raw lines to a connected client and
//! observing PONGs the server received.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use irc_testkit::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SERVER_NAME: &str = "test.irc.local";

/// Install a fmt subscriber once per process so `RUST_LOG=irc_testkit=trace`
/// shows the wire traffic of a failing test. No-op when already set.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Shared {
    /// CAP LS pages, each a space-separated capability list. More than one
    /// page makes the server answer with `*`-continued LS lines.
    cap_pages: Vec<String>,
    /// username -> password for SASL PLAIN.
    accounts: HashMap<String, String>,
    /// session id -> sender for lines to that client (terminator added by
    /// the writer task).
    connections: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    /// lowercased nick -> session id
    nicks: Mutex<HashMap<String, u64>>,
    /// channel name -> member session ids
    channels: Mutex<HashMap<String, HashSet<u64>>>,
    /// PONG tokens the server has received, for keepalive assertions.
    pongs: Mutex<Vec<String>>,
}

impl Shared {
    fn advertised_caps(&self) -> HashSet<String> {
        self.cap_pages
            .iter()
            .flat_map(|page| page.split_whitespace())
            .map(|cap| cap.split_once('=').map_or(cap, |(name, _)| name).to_string())
            .collect()
    }
}

pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    /// Start with a single-page capability set and one SASL account.
    pub async fn start() -> Result<Self> {
        Self::start_with(
            &["sasl message-tags server-time"],
            &[("testuser", "testpass")],
        )
        .await
    }

    pub async fn start_with(cap_pages: &[&str], accounts: &[(&str, &str)]) -> Result<Self> {
        init_tracing();
        let shared = Arc::new(Shared {
            cap_pages: cap_pages.iter().map(|p| p.to_string()).collect(),
            accounts: accounts
                .iter()
                .map(|(u, p)| (u.to_string(), p.to_string()))
                .collect(),
            connections: Mutex::new(HashMap::new()),
            nicks: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            pongs: Mutex::new(Vec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let accept_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            loop {
                let (stream, _) = listener.accept().await?;
                let id = COUNTER.fetch_add(1, Ordering::Relaxed);
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    let _ = handle_client(stream, id, shared).await;
                });
            }
        });

        Ok(Self {
            addr,
            shared,
            handle,
        })
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Inject a raw line into the stream of the client registered as
    /// `nick`. Panics if no such client is connected.
    pub async fn push_raw(&self, nick: &str, line: &str) {
        let id = self
            .shared
            .nicks
            .lock()
            .unwrap()
            .get(&nick.to_lowercase())
            .copied()
            .unwrap_or_else(|| panic!("no connected client with nick {nick:?}"));
        let tx = self
            .shared
            .connections
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("client has no writer");
        tx.send(line.to_string()).await.expect("client writer gone");
    }

    /// PONG tokens received so far.
    pub fn pongs(&self) -> Vec<String> {
        self.shared.pongs.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

struct Client {
    id: u64,
    nick: Option<String>,
    user: Option<String>,
    registered: bool,
    cap_negotiating: bool,
    sasl_blob_pending: bool,
}

impl Client {
    fn nick_or_star(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    fn hostmask(&self) -> String {
        format!(
            "{}!{}@host",
            self.nick.as_deref().unwrap_or("*"),
            self.user.as_deref().unwrap_or("~u")
        )
    }
}

async fn send_to(shared: &Shared, id: u64, line: String) {
    let tx = shared.connections.lock().unwrap().get(&id).cloned();
    if let Some(tx) = tx {
        let _ = tx.send(line).await;
    }
}

async fn broadcast(shared: &Shared, members: &HashSet<u64>, skip: Option<u64>, line: &str) {
    for &member in members {
        if Some(member) == skip {
            continue;
        }
        send_to(shared, member, line.to_string()).await;
    }
}

fn channel_members(shared: &Shared, channel: &str) -> HashSet<u64> {
    shared
        .channels
        .lock()
        .unwrap()
        .get(channel)
        .cloned()
        .unwrap_or_default()
}

async fn handle_client(stream: TcpStream, id: u64, shared: Arc<Shared>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (tx, mut rx) = mpsc::channel::<String>(64);
    shared.connections.lock().unwrap().insert(id, tx);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\r\n").await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut client = Client {
        id,
        nick: None,
        user: None,
        registered: false,
        cap_negotiating: false,
        sasl_blob_pending: false,
    };

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let msg = Message::parse(&line);
        if !dispatch(&shared, &mut client, &msg).await {
            break;
        }
    }

    // Cleanup: drop the writer sender, release the nick, leave channels.
    shared.connections.lock().unwrap().remove(&id);
    if let Some(ref nick) = client.nick {
        let mut nicks = shared.nicks.lock().unwrap();
        if nicks.get(&nick.to_lowercase()) == Some(&id) {
            nicks.remove(&nick.to_lowercase());
        }
    }
    for members in shared.channels.lock().unwrap().values_mut() {
        members.remove(&id);
    }

    writer.await.ok();
    Ok(())
}

/// Handle one inbound message. Returns false when the connection should
/// close.
async fn dispatch(shared: &Shared, client: &mut Client, msg: &Message) -> bool {
    match msg.command.as_str() {
        "CAP" => handle_cap(shared, client, msg).await,
        "AUTHENTICATE" => handle_authenticate(shared, client, msg).await,
        "NICK" => {
            let Some(want) = msg.params.first() else {
                return true;
            };
            let lower = want.to_lowercase();
            let taken = {
                let nicks = shared.nicks.lock().unwrap();
                nicks.get(&lower).is_some_and(|&owner| owner != client.id)
            };
            if taken {
                send_to(
                    shared,
                    client.id,
                    format!(":{SERVER_NAME} 433 * {want} :Nickname is already in use"),
                )
                .await;
                return true;
            }
            if let Some(ref old) = client.nick {
                shared.nicks.lock().unwrap().remove(&old.to_lowercase());
            }
            shared.nicks.lock().unwrap().insert(lower, client.id);
            client.nick = Some(want.clone());
            try_register(shared, client).await;
        }
        "USER" => {
            client.user = msg.params.first().cloned();
            try_register(shared, client).await;
        }
        "PING" => {
            let token = msg.params.first().map(String::as_str).unwrap_or("");
            send_to(shared, client.id, format!("PONG :{token}")).await;
        }
        "PONG" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            shared.pongs.lock().unwrap().push(token);
        }
        "JOIN" => {
            let Some(channel) = msg.params.first().cloned() else {
                return true;
            };
            shared
                .channels
                .lock()
                .unwrap()
                .entry(channel.clone())
                .or_default()
                .insert(client.id);
            let members = channel_members(shared, &channel);
            let join_line = format!(":{} JOIN {channel}", client.hostmask());
            broadcast(shared, &members, None, &join_line).await;

            let me = client.nick_or_star().to_string();
            send_to(
                shared,
                client.id,
                format!(":{SERVER_NAME} 353 {me} = {channel} :{me}"),
            )
            .await;
            send_to(
                shared,
                client.id,
                format!(":{SERVER_NAME} 366 {me} {channel} :End of /NAMES list"),
            )
            .await;
        }
        "PART" => {
            let Some(channel) = msg.params.first().cloned() else {
                return true;
            };
            let members = channel_members(shared, &channel);
            let part_line = format!(":{} PART {channel}", client.hostmask());
            broadcast(shared, &members, None, &part_line).await;
            if let Some(members) = shared.channels.lock().unwrap().get_mut(&channel) {
                members.remove(&client.id);
            }
        }
        "PRIVMSG" | "NOTICE" => {
            let (Some(target), Some(text)) = (msg.params.first(), msg.params.get(1)) else {
                return true;
            };
            let relay = format!(
                ":{} {} {target} :{text}",
                client.hostmask(),
                msg.command
            );
            if target.starts_with('#') {
                let members = channel_members(shared, target);
                broadcast(shared, &members, Some(client.id), &relay).await;
            } else {
                let dest = shared
                    .nicks
                    .lock()
                    .unwrap()
                    .get(&target.to_lowercase())
                    .copied();
                match dest {
                    Some(dest) => send_to(shared, dest, relay).await,
                    None => {
                        let me = client.nick_or_star().to_string();
                        send_to(
                            shared,
                            client.id,
                            format!(":{SERVER_NAME} 401 {me} {target} :No such nick"),
                        )
                        .await;
                    }
                }
            }
        }
        "WHOIS" => {
            let Some(target) = msg.params.first().cloned() else {
                return true;
            };
            let me = client.nick_or_star().to_string();
            let known = shared
                .nicks
                .lock()
                .unwrap()
                .contains_key(&target.to_lowercase());
            if known {
                send_to(
                    shared,
                    client.id,
                    format!(":{SERVER_NAME} 311 {me} {target} test host * :Test User"),
                )
                .await;
                send_to(
                    shared,
                    client.id,
                    format!(":{SERVER_NAME} 318 {me} {target} :End of /WHOIS list"),
                )
                .await;
            } else {
                send_to(
                    shared,
                    client.id,
                    format!(":{SERVER_NAME} 401 {me} {target} :No such nick"),
                )
                .await;
            }
        }
        "QUIT" => {
            let reason = msg.params.first().cloned().unwrap_or_default();
            let quit_line = format!(":{} QUIT :{reason}", client.hostmask());
            let channels: Vec<HashSet<u64>> = shared
                .channels
                .lock()
                .unwrap()
                .values()
                .filter(|members| members.contains(&client.id))
                .cloned()
                .collect();
            for members in channels {
                broadcast(shared, &members, Some(client.id), &quit_line).await;
            }
            send_to(shared, client.id, "ERROR :Closing link".to_string()).await;
            return false;
        }
        _ => {}
    }
    true
}

async fn handle_cap(shared: &Shared, client: &mut Client, msg: &Message) {
    let me = client.nick_or_star().to_string();
    match msg.params.first().map(String::as_str) {
        Some("LS") => {
            client.cap_negotiating = true;
            let pages = &shared.cap_pages;
            for (i, page) in pages.iter().enumerate() {
                let line = if i + 1 < pages.len() {
                    format!(":{SERVER_NAME} CAP {me} LS * :{page}")
                } else {
                    format!(":{SERVER_NAME} CAP {me} LS :{page}")
                };
                send_to(shared, client.id, line).await;
            }
        }
        Some("REQ") => {
            client.cap_negotiating = true;
            let requested = msg.params.get(1).map(String::as_str).unwrap_or("");
            let advertised = shared.advertised_caps();
            let all_known = requested
                .split_whitespace()
                .all(|cap| advertised.contains(cap));
            let verdict = if all_known { "ACK" } else { "NAK" };
            send_to(
                shared,
                client.id,
                format!(":{SERVER_NAME} CAP {me} {verdict} :{requested}"),
            )
            .await;
        }
        Some("END") => {
            client.cap_negotiating = false;
            try_register(shared, client).await;
        }
        _ => {}
    }
}

async fn handle_authenticate(shared: &Shared, client: &mut Client, msg: &Message) {
    let me = client.nick_or_star().to_string();
    let arg = msg.params.first().map(String::as_str).unwrap_or("");

    if arg.eq_ignore_ascii_case("PLAIN") {
        client.sasl_blob_pending = true;
        send_to(shared, client.id, "AUTHENTICATE +".to_string()).await;
        return;
    }

    if !client.sasl_blob_pending {
        return;
    }
    client.sasl_blob_pending = false;

    // PLAIN blob: authzid \0 authcid \0 password
    let ok = B64
        .decode(arg)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|blob| {
            let mut parts = blob.split('\0');
            let _authzid = parts.next()?;
            let user = parts.next()?.to_string();
            let pass = parts.next()?.to_string();
            Some((user, pass))
        })
        .is_some_and(|(user, pass)| shared.accounts.get(&user) == Some(&pass));

    if ok {
        send_to(
            shared,
            client.id,
            format!(":{SERVER_NAME} 900 {me} {me}!test@host account :You are now logged in"),
        )
        .await;
        send_to(
            shared,
            client.id,
            format!(":{SERVER_NAME} 903 {me} :SASL authentication successful"),
        )
        .await;
    } else {
        send_to(
            shared,
            client.id,
            format!(":{SERVER_NAME} 904 {me} :SASL authentication failed"),
        )
        .await;
    }
}

async fn try_register(shared: &Shared, client: &mut Client) {
    if client.registered || client.cap_negotiating {
        return;
    }
    let (Some(nick), Some(_)) = (client.nick.clone(), client.user.clone()) else {
        return;
    };
    client.registered = true;
    send_to(
        shared,
        client.id,
        format!(":{SERVER_NAME} 001 {nick} :Welcome to TestNet {nick}"),
    )
    .await;
    send_to(
        shared,
        client.id,
        format!(":{SERVER_NAME} 376 {nick} :End of /MOTD command"),
    )
    .await;
}
