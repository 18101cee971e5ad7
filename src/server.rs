//! Single-connection framed transport server
//!
//! Accepts one client at a time and pumps its frames into the session.
//! Extra connection attempts are refused at accept time so they can never
//! disturb the active session. A dying connection resets session state and
//! the listener keeps running for the next client.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::events::EventBus;
use crate::framing::{read_frame, write_frame};
use crate::protocol::frame;
use crate::session::{Outbound, SyncSession};

/// While a sync is in flight the client must produce the next frame within
/// this window; a stalled exchange tears the connection down, which resets
/// all sync state. An idle connection may stay quiet indefinitely.
pub const SYNC_STALL_SECS: u64 = 30;

pub struct TransportServer {
    session: Arc<SyncSession>,
    events: Arc<EventBus>,
}

impl TransportServer {
    pub fn new(session: Arc<SyncSession>, events: Arc<EventBus>) -> Self {
        Self { session, events }
    }

    /// Bind and serve until the hosting task is cancelled or the listener
    /// itself fails. Connection-level errors are non-fatal.
    pub async fn serve(&self, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind).await.with_context(|| format!("bind {bind}"))?;
        self.session.set_running(true);
        self.events.running_changed(true);
        self.events.log(&format!("Listening on {bind}"));

        let result = self.accept_loop(&listener).await;

        self.session.set_running(false);
        self.events.running_changed(false);
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            if self.session.is_connected() {
                self.events.log(&format!(
                    "Refused connection from {peer}: a client is already connected"
                ));
                drop(stream);
                continue;
            }
            let _ = stream.set_nodelay(true);
            // Register the connection before the next accept so a second
            // client can never slip past the single-connection check
            let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
            self.session.connection_opened(tx);
            self.events.connection_changed(true, &peer.to_string());
            let session = Arc::clone(&self.session);
            let events = Arc::clone(&self.events);
            tokio::spawn(async move {
                handle_connection(session, events, stream, peer, rx).await;
            });
        }
    }
}

async fn handle_connection(
    session: Arc<SyncSession>,
    events: Arc<EventBus>,
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let peer = peer.to_string();
    let (mut rd, mut wr) = stream.into_split();

    // Writer task drains the session's outbound queue; the read loop below
    // keeps the connection's inbound side strictly sequential.
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let result = match out {
                Outbound::Text(text) => write_frame(&mut wr, frame::TEXT, text.as_bytes()).await,
                Outbound::Binary(bytes) => write_frame(&mut wr, frame::BINARY, &bytes).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    if let Err(e) = read_loop(&session, &events, &mut rd).await {
        let peer_closed = e
            .downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
            .unwrap_or(false);
        if peer_closed {
            events.log("Client closed the connection");
        } else {
            events.log(&format!("Connection error: {e:#}"));
        }
    }

    session.connection_closed();
    events.connection_changed(false, &peer);
    writer.abort();
}

async fn read_loop(
    session: &SyncSession,
    events: &EventBus,
    rd: &mut OwnedReadHalf,
) -> Result<()> {
    loop {
        let (typ, payload) = if session.is_syncing() {
            match timeout(Duration::from_secs(SYNC_STALL_SECS), read_frame(rd)).await {
                Ok(result) => result?,
                Err(_) => bail!("no frame from client for {SYNC_STALL_SECS}s during sync"),
            }
        } else {
            read_frame(rd).await?
        };
        match typ {
            frame::TEXT => match std::str::from_utf8(&payload) {
                Ok(text) => session.handle_text(text),
                Err(_) => events.log("Discarding text frame with invalid UTF-8"),
            },
            frame::BINARY => session.handle_binary(&payload),
            other => events.log(&format!("Discarding frame with unknown type {other}")),
        }
    }
}
