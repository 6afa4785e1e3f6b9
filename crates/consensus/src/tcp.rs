//! TCP transport
//!
//! Frames are a little-endian `u32` length followed by a MessagePack
//! [`Envelope`]. Each peer gets a dedicated sender thread with a bounded
//! queue and a lazily (re)established connection; a full queue or a failed
//! write drops the message. Every accepted connection gets a reader thread
//! that forwards envelopes into the driver's inbox and remembers the
//! sender's endpoint, so replies reach peers that are not yet members.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use vdb_core::NodeId;

use crate::error::TransportError;
use crate::log::RaftMember;
use crate::message::Envelope;
use crate::transport::{Inbound, Transport};

/// Largest accepted frame
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const PEER_QUEUE_DEPTH: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Write one length-prefixed envelope
pub fn write_frame<W: Write>(w: &mut W, envelope: &Envelope) -> Result<(), TransportError> {
    let bytes = rmp_serde::to_vec(envelope).map_err(|e| TransportError::Encode(e.to_string()))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

/// Read one length-prefixed envelope
pub fn read_frame<R: Read>(r: &mut R) -> Result<Envelope, TransportError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    rmp_serde::from_slice(&buf).map_err(|e| TransportError::Decode(e.to_string()))
}

struct PeerLink {
    endpoint: String,
    tx: SyncSender<Envelope>,
}

struct Shared {
    id: NodeId,
    shutdown: AtomicBool,
    learned: RwLock<HashMap<NodeId, String>>,
    inbound_streams: Mutex<Vec<TcpStream>>,
}

/// Raft transport over plain TCP
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    links: Mutex<HashMap<NodeId, PeerLink>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Listen on `endpoint` and deliver inbound envelopes into `inbound`
    pub fn bind(
        id: NodeId,
        endpoint: &str,
        inbound: Sender<Inbound>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(endpoint)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            id,
            shutdown: AtomicBool::new(false),
            learned: RwLock::new(HashMap::new()),
            inbound_streams: Mutex::new(Vec::new()),
        });

        let acceptor_shared = Arc::clone(&shared);
        let acceptor = thread::Builder::new()
            .name(format!("vdb-raft-accept-{}", id))
            .spawn(move || accept_loop(listener, acceptor_shared, inbound))?;

        tracing::info!(target: "vdb::raft::tcp", node_id = id, %local_addr, "raft transport listening");
        Ok(TcpTransport {
            shared,
            local_addr,
            links: Mutex::new(HashMap::new()),
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// Bound address (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn link_for(&self, to: NodeId, endpoint: &str) -> Option<SyncSender<Envelope>> {
        let mut links = self.links.lock();
        if let Some(link) = links.get(&to) {
            if link.endpoint == endpoint {
                return Some(link.tx.clone());
            }
        }
        let (tx, rx) = mpsc::sync_channel::<Envelope>(PEER_QUEUE_DEPTH);
        let target = endpoint.to_string();
        let name = format!("vdb-raft-send-{}-{}", self.shared.id, to);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let mut conn: Option<TcpStream> = None;
            for envelope in rx {
                if conn.is_none() {
                    conn = connect(&target);
                }
                if let Some(stream) = conn.as_mut() {
                    match write_frame(stream, &envelope) {
                        Ok(()) => {}
                        // nothing was written, so the connection stays usable
                        Err(TransportError::FrameTooLarge(len)) => {
                            tracing::error!(
                                target: "vdb::raft::tcp",
                                peer = to,
                                kind = envelope.msg.kind(),
                                len,
                                max = MAX_FRAME_BYTES,
                                "message exceeds the frame limit and was dropped"
                            );
                        }
                        Err(e) => {
                            tracing::debug!(target: "vdb::raft::tcp", peer = to, error = %e, "send failed; reconnecting");
                            conn = None;
                        }
                    }
                }
            }
        });
        match spawned {
            Ok(_) => {
                links.insert(
                    to,
                    PeerLink {
                        endpoint: endpoint.to_string(),
                        tx: tx.clone(),
                    },
                );
                Some(tx)
            }
            Err(e) => {
                tracing::warn!(target: "vdb::raft::tcp", peer = to, error = %e, "failed to spawn sender");
                None
            }
        }
    }

    /// Stop accepting, close inbound connections and retire sender threads
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.links.lock().clear();
        for stream in self.shared.inbound_streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope) {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let to = envelope.to;
        let known = self.links.lock().get(&to).map(|l| l.endpoint.clone());
        let endpoint = match known.or_else(|| self.shared.learned.read().get(&to).cloned()) {
            Some(ep) => ep,
            None => {
                tracing::debug!(target: "vdb::raft::tcp", peer = to, "no endpoint for peer");
                return;
            }
        };
        let Some(tx) = self.link_for(to, &endpoint) else {
            return;
        };
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(target: "vdb::raft::tcp", peer = to, "peer queue full; dropping message");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.links.lock().remove(&to);
            }
        }
    }

    fn update_peers(&self, members: &[RaftMember]) {
        for member in members.iter().filter(|m| m.id != self.shared.id) {
            self.link_for(member.id, &member.endpoint);
        }
    }
}

fn connect(endpoint: &str) -> Option<TcpStream> {
    let addr = endpoint.to_socket_addrs().ok()?.next()?;
    match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            Some(stream)
        }
        Err(e) => {
            tracing::trace!(target: "vdb::raft::tcp", %endpoint, error = %e, "connect failed");
            None
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, inbound: Sender<Inbound>) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if let Err(e) = spawn_reader(stream, Arc::clone(&shared), inbound.clone()) {
                    tracing::warn!(target: "vdb::raft::tcp", %peer_addr, error = %e, "failed to start reader");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(target: "vdb::raft::tcp", error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn spawn_reader(stream: TcpStream, shared: Arc<Shared>, inbound: Sender<Inbound>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    shared.inbound_streams.lock().push(stream.try_clone()?);
    let name = format!("vdb-raft-recv-{}", shared.id);
    thread::Builder::new().name(name).spawn(move || {
        let mut reader = io::BufReader::new(stream);
        loop {
            match read_frame(&mut reader) {
                Ok(envelope) => {
                    shared
                        .learned
                        .write()
                        .insert(envelope.from, envelope.from_endpoint.clone());
                    if inbound.send(Inbound::Message(envelope)).is_err() {
                        break;
                    }
                }
                Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    if !shared.shutdown.load(Ordering::Relaxed) {
                        tracing::debug!(target: "vdb::raft::tcp", error = %e, "closing inbound connection");
                    }
                    break;
                }
            }
        }
    })?;
    Ok(())
}
