//! One TCP connection to the server under test.
//!
//! A `Connection` is exclusively owned by one session: single reader,
//! single writer, no locks. It is created connected and dies once — EOF or
//! `disconnect` is terminal, a new connection must be constructed to
//! reconnect.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::error::{HarnessError, Result};
use crate::message::Message;

pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    connected: bool,
    /// Bytes of the line currently being assembled. Consumed input is
    /// moved here before every await, so a timed-out wait never loses a
    /// partially read line — the next `recv` resumes it.
    line_buf: Vec<u8>,
}

impl Connection {
    /// Establish a TCP connection, bounded by `connect_timeout`.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self> {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                tracing::debug!(%addr, "connected");
                let (read_half, write_half) = stream.into_split();
                Ok(Self {
                    reader: BufReader::new(read_half),
                    writer: write_half,
                    connected: true,
                    line_buf: Vec::new(),
                })
            }
            Ok(Err(source)) => Err(HarnessError::ConnectRefused {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(HarnessError::ConnectTimeout {
                addr: addr.to_string(),
                timeout: connect_timeout,
            }),
        }
    }

    /// True until EOF is observed or `disconnect` is called.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Send one line, appending `\r\n` if absent. Written with a single
    /// `write_all` so a line is never interleaved mid-way.
    pub async fn send(&mut self, line: &str) -> Result<()> {
        if !self.connected {
            return Err(HarnessError::NotConnected);
        }
        tracing::trace!(">> {}", line.trim_end());
        if line.ends_with("\r\n") {
            self.writer.write_all(line.as_bytes()).await?;
        } else {
            let wire = format!("{line}\r\n");
            self.writer.write_all(wire.as_bytes()).await?;
        }
        Ok(())
    }

    /// Receive the next message, waiting at most `recv_timeout`.
    ///
    /// Returns `Ok(None)` both on timer expiry and on EOF; EOF additionally
    /// flips `is_connected()` to false, which is how callers tell the two
    /// apart. An inbound `PING` is answered with `PONG` automatically and
    /// still returned to the caller.
    pub async fn recv(&mut self, recv_timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + recv_timeout;

        // Assemble one line through `fill_buf`, which is cancellation-safe:
        // bytes are copied into `line_buf` and consumed from the reader
        // before the next await, so a timer firing mid-line leaves the
        // partial intact for the following call. (`read_line` would not
        // survive cancellation: it takes the buffer into its future.)
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let available = match timeout(remaining, self.reader.fill_buf()).await {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            };

            if available.is_empty() {
                self.connected = false;
                if self.line_buf.is_empty() {
                    return Ok(None);
                }
                // EOF cut off an unterminated final line; surface it anyway.
                break;
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.line_buf.extend_from_slice(&available[..=pos]);
                    self.reader.consume(pos + 1);
                    break;
                }
                None => {
                    let taken = available.len();
                    self.line_buf.extend_from_slice(available);
                    self.reader.consume(taken);
                }
            }
        }

        let msg = Message::parse(&String::from_utf8_lossy(&self.line_buf));
        self.line_buf.clear();
        tracing::trace!("<< {}", msg.raw);

        if msg.command == "PING" && self.connected {
            let token = msg.params.first().map(String::as_str).unwrap_or("");
            self.send(&format!("PONG :{token}")).await?;
        }

        Ok(Some(msg))
    }

    /// Close the write half and mark the connection dead. Terminal.
    pub async fn disconnect(&mut self) {
        let _ = self.writer.shutdown().await;
        self.connected = false;
    }
}
