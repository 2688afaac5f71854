//! TCP link driver.
//!
//! The desktop transport: every mesh link is a TCP connection, the access
//! endpoint is a listener, and "scanning" reports the configured seed peers
//! as candidates (there is no radio to probe). Channels are notional over
//! TCP; a channel switch keeps the listener and only re-tags the driver.

use super::{ConnId, LinkDriver, LinkEvent, ScanCandidate, ScanScope};
use crate::types::CloseReason;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writer queue depth per connection. The core's own FIFO is the real
/// bound; this only absorbs scheduling jitter.
const WRITER_QUEUE: usize = 64;

const READ_BUF: usize = 2048;

/// A statically configured peer reported by scans.
#[derive(Debug, Clone)]
pub struct SeedPeer {
    /// `host:port` connect address.
    pub addr: String,
    /// Synthetic signal strength used for join ordering.
    pub rssi: i16,
    pub channel: u8,
    /// Advertised name; defaults to the mesh prefix when unknown.
    pub ssid: String,
}

#[derive(Debug, Clone)]
pub struct TcpLinkConfig {
    pub listen_port: u16,
    pub seeds: Vec<SeedPeer>,
    pub channel: u8,
}

struct ConnHandle {
    writer: mpsc::Sender<String>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

type ConnMap = Arc<Mutex<HashMap<ConnId, ConnHandle>>>;

/// Poison-tolerant lock: a panicked writer holds no invariant we rely on.
fn lock_conns(conns: &Mutex<HashMap<ConnId, ConnHandle>>) -> std::sync::MutexGuard<'_, HashMap<ConnId, ConnHandle>> {
    conns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TcpLinkDriver {
    cfg: TcpLinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    conns: ConnMap,
    next_conn: Arc<AtomicU64>,
    listener_task: Option<JoinHandle<()>>,
    channel: u8,
}

impl TcpLinkDriver {
    pub fn new(cfg: TcpLinkConfig) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = cfg.channel;
        (
            Self {
                cfg,
                events: tx,
                conns: Arc::new(Mutex::new(HashMap::new())),
                next_conn: Arc::new(AtomicU64::new(1)),
                listener_task: None,
                channel,
            },
            rx,
        )
    }

    /// Bind the listener and start accepting. Must run inside a tokio
    /// runtime.
    pub async fn start(&mut self) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.listen_port)).await?;
        debug!(port = self.cfg.listen_port, "tcp link listening");

        let events = self.events.clone();
        let conns = self.conns.clone();
        let next_conn = self.next_conn.clone();
        self.listener_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, conn, "inbound link accepted");
                        register_stream(stream, conn, &events, &conns);
                        let _ = events.send(LinkEvent::Accepted { conn });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
        let mut conns = lock_conns(&self.conns);
        for (_, handle) in conns.drain() {
            handle.reader_task.abort();
            handle.writer_task.abort();
        }
    }
}

/// Split a stream into reader/writer tasks wired to the event channel.
fn register_stream(
    stream: TcpStream,
    conn: ConnId,
    events: &mpsc::UnboundedSender<LinkEvent>,
    conns: &ConnMap,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let (wtx, mut wrx) = mpsc::channel::<String>(WRITER_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(line) = wrx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let reader_events = events.clone();
    let reader_conns = conns.clone();
    let reader_task = tokio::spawn(async move {
        let mut buf = [0u8; READ_BUF];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = reader_events.send(LinkEvent::Data {
                        conn,
                        bytes: buf[..n].to_vec(),
                    });
                }
            }
        }
        // Report only if the core has not already closed us locally.
        let still_tracked = lock_conns(&reader_conns).remove(&conn).is_some();
        if still_tracked {
            let _ = reader_events.send(LinkEvent::Closed {
                conn,
                reason: CloseReason::TransportError,
            });
        }
    });

    lock_conns(conns).insert(
        conn,
        ConnHandle { writer: wtx, reader_task, writer_task },
    );
}

impl LinkDriver for TcpLinkDriver {
    fn request_scan(&mut self, scope: ScanScope) {
        let candidates: Vec<ScanCandidate> = self
            .cfg
            .seeds
            .iter()
            .filter(|s| match scope {
                ScanScope::CurrentChannel(ch) => s.channel == ch,
                ScanScope::AllChannels => true,
            })
            .map(|s| ScanCandidate {
                ssid: s.ssid.clone(),
                rssi: s.rssi,
                channel: s.channel,
                target: s.addr.clone(),
            })
            .collect();
        let _ = self.events.send(LinkEvent::ScanComplete { scope, candidates });
    }

    fn restart_access_point(&mut self, channel: u8) {
        // No radio to retune; the listener keeps its port.
        self.channel = channel;
        let _ = self.events.send(LinkEvent::ApRestarted { channel });
    }

    fn connect(&mut self, candidate: &ScanCandidate) {
        let events = self.events.clone();
        let conns = self.conns.clone();
        let next_conn = self.next_conn.clone();
        let candidate = candidate.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&candidate.target).await {
                Ok(stream) => {
                    let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %candidate.target, conn, "outbound link up");
                    register_stream(stream, conn, &events, &conns);
                    let _ = events.send(LinkEvent::Connected { conn, candidate });
                }
                Err(e) => {
                    debug!(peer = %candidate.target, "connect failed: {e}");
                    let _ = events.send(LinkEvent::ConnectFailed {
                        target: candidate.target,
                    });
                }
            }
        });
    }

    fn send(&mut self, conn: ConnId, line: &str) -> bool {
        let conns = lock_conns(&self.conns);
        match conns.get(&conn) {
            Some(handle) => handle.writer.try_send(line.to_string()).is_ok(),
            None => false,
        }
    }

    fn close(&mut self, conn: ConnId, reason: CloseReason) {
        let removed = lock_conns(&self.conns).remove(&conn);
        if let Some(handle) = removed {
            debug!(conn, reason = reason.as_str(), "closing link");
            handle.reader_task.abort();
            handle.writer_task.abort();
        }
    }
}

impl Drop for TcpLinkDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
