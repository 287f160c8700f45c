// src/p2p.rs - Wire protocol and TCP transport (length-prefixed bincode frames)

use crate::block::{serde_hash, BlockHash};
use crate::config::P2PConfig;
use anyhow::Result;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

pub type PeerId = SocketAddr;

/// A peer's announcement of its best known block. A zero `top_block` means
/// the peer has no chain yet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Intro {
    #[serde(with = "serde_hash")]
    pub top_block: BlockHash,
    pub top_height: u64,
}

/// The four protocol message kinds. Block payloads travel as opaque
/// serialized byte strings so the transport stays independent of the
/// application's block type.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
    Intro(Intro),
    Blocks(Vec<Vec<u8>>),
    RequestBlocks(Vec<[u8; 32]>),
    RequestHeights(Vec<u64>),
}

/// Connection lifecycle and inbound traffic, delivered to the sync task in
/// per-peer arrival order.
#[derive(Debug)]
pub enum SyncEvent {
    Connected(PeerId),
    Message(PeerId, Message),
    Disconnected(PeerId),
}

/// Live peer connections, usable from both the sync task and the miner
/// handoff path. Sends never block: each peer has an unbounded outbox
/// drained by its writer task.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Message>>>>,
}

impl PeerRegistry {
    pub fn register(&self, peer: PeerId, outbox: mpsc::UnboundedSender<Message>) {
        self.peers.lock().insert(peer, outbox);
    }

    pub fn unregister(&self, peer: &PeerId) {
        self.peers.lock().remove(peer);
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.lock().contains_key(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Sends to one peer; false if the peer is gone.
    pub fn send(&self, peer: &PeerId, message: Message) -> bool {
        match self.peers.lock().get(peer) {
            Some(outbox) => outbox.send(message).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, message: &Message) {
        for outbox in self.peers.lock().values() {
            let _ = outbox.send(message.clone());
        }
    }
}

pub async fn start_server(
    registry: PeerRegistry,
    events: mpsc::UnboundedSender<SyncEvent>,
    p2p_config: Arc<P2PConfig>,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener_addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&listener_addr).await?;
    info!("[P2P] listening on {}", listener_addr);

    loop {
        tokio::select! {
            res = listener.accept() => {
                if let Ok((socket, addr)) = res {
                    tokio::spawn(handle_connection(
                        socket, addr, registry.clone(), events.clone(), p2p_config.clone(),
                    ));
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    Ok(())
}

/// Dials the configured seed addresses, retrying disconnected ones on a
/// fixed delay.
pub async fn start_client(
    registry: PeerRegistry,
    events: mpsc::UnboundedSender<SyncEvent>,
    p2p_config: Arc<P2PConfig>,
    local_port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        for seed in &p2p_config.seed_nodes {
            let addr: SocketAddr = match seed.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("[P2P] unparseable seed address {}: {}", seed, e);
                    continue;
                }
            };
            if addr.port() == local_port || registry.contains(&addr) {
                continue;
            }
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    tokio::spawn(handle_connection(
                        socket, addr, registry.clone(), events.clone(), p2p_config.clone(),
                    ));
                }
                Err(e) => debug!("[P2P] dial {} failed: {}", addr, e),
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(p2p_config.reconnect_delay_secs)) => {}
            _ = shutdown_rx.recv() => break,
        }
    }
    Ok(())
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    registry: PeerRegistry,
    events: mpsc::UnboundedSender<SyncEvent>,
    p2p_config: Arc<P2PConfig>,
) {
    let (mut reader, mut writer) = tokio::io::split(socket);
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<Message>();

    registry.register(addr, peer_tx);
    if events.send(SyncEvent::Connected(addr)).is_err() {
        registry.unregister(&addr);
        return;
    }
    info!("[P2P] peer connected: {}", addr);

    let write_task = tokio::spawn(async move {
        while let Some(message) = peer_rx.recv().await {
            if let Ok(frame) = bincode::serialize(&message) {
                if writer.write_all(&(frame.len() as u32).to_be_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        }
    });

    let read_events = events.clone();
    let read_task = tokio::spawn(async move {
        loop {
            let mut size_buf = [0u8; 4];
            if reader.read_exact(&mut size_buf).await.is_err() {
                break;
            }
            let size = u32::from_be_bytes(size_buf) as usize;
            if size > p2p_config.max_message_size {
                warn!("[P2P] oversized frame ({} bytes) from {}", size, addr);
                break;
            }
            let mut buf = vec![0; size];
            if reader.read_exact(&mut buf).await.is_err() {
                break;
            }
            // Frames that fail to decode never reach the handlers; the
            // connection is dropped at the codec boundary.
            match bincode::deserialize::<Message>(&buf) {
                Ok(message) => {
                    if read_events.send(SyncEvent::Message(addr, message)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("[P2P] undecodable frame from {}: {}", addr, e);
                    break;
                }
            }
        }
    });

    tokio::select! { _ = write_task => {}, _ = read_task => {} }

    registry.unregister(&addr);
    let _ = events.send(SyncEvent::Disconnected(addr));
    info!("[P2P] peer disconnected: {}", addr);
}
