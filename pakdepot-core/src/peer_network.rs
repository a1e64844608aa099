//! Peer network: the P2P side of package distribution.
//!
//! Maintains the peer table and the package -> peer-set index, serves the
//! wire protocol to inbound connections (one task per connection) and runs
//! the stale-peer sweep and discovery duties. All externally visible state
//! is returned as owned snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::config::PeerConfig;
use crate::error::{DepotError, DepotResult};
use crate::protocol::{read_message, write_message, PeerMessage};
use crate::types::{PackageInfo, PeerNode};

/// Snapshot of the peer table for external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub total_peers: usize,
    pub active_peers: usize,
    pub shared_packages: usize,
    pub peer_list: Vec<PeerSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub address: String,
    pub capabilities: Vec<String>,
    pub shared_packages: usize,
    pub reputation: f64,
    pub last_seen: DateTime<Utc>,
}

pub struct PeerNetwork {
    local_id: String,
    config: PeerConfig,
    chunks: Arc<ChunkStore>,
    peers: RwLock<HashMap<String, PeerNode>>,
    /// share key (`manager:name`) -> ids of peers sharing it
    package_index: RwLock<HashMap<String, HashSet<String>>>,
}

impl PeerNetwork {
    pub fn new(config: PeerConfig, chunks: Arc<ChunkStore>) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            config,
            chunks,
            peers: RwLock::new(HashMap::new()),
            package_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Bind the peer server and spawn its accept loop. Returns the bound
    /// address so callers (and tests) can hand it to other peers.
    pub async fn start_listener(self: &Arc<Self>) -> DepotResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "peer server listening");

        let network = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let network = network.clone();
                        tokio::spawn(async move {
                            if let Err(e) = network.handle_connection(stream, remote).await {
                                debug!(remote = %remote, error = %e, "peer connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept peer connection");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    /// Inbound connection state machine: AWAIT_HANDSHAKE -> ACTIVE -> CLOSED.
    async fn handle_connection(&self, mut stream: TcpStream, remote: SocketAddr) -> DepotResult<()> {
        let first = timeout(self.config.socket_timeout, read_message(&mut stream))
            .await
            .map_err(|_| DepotError::Timeout {
                operation: format!("handshake from {}", remote),
                duration: self.config.socket_timeout,
            })??;

        let peer_id = match first {
            PeerMessage::Handshake {
                peer_id,
                port,
                capabilities,
                shared_packages,
                bandwidth,
                trusted,
                reputation,
            } => {
                self.register_peer(PeerNode {
                    id: peer_id.clone(),
                    address: remote.ip().to_string(),
                    port,
                    capabilities,
                    shared_packages: shared_packages.into_iter().collect(),
                    bandwidth_mbps: bandwidth,
                    last_seen: Utc::now(),
                    trusted,
                    reputation,
                })
                .await;

                write_message(
                    &mut stream,
                    &PeerMessage::HandshakeResponse {
                        peer_id: self.local_id.clone(),
                        capabilities: vec!["download".to_string(), "upload".to_string()],
                        shared_packages: self.chunks.shared_package_keys(),
                    },
                )
                .await?;
                peer_id
            }
            other => {
                return Err(DepotError::Protocol {
                    message: format!("expected handshake, got {}", other.kind()),
                })
            }
        };
        debug!(peer_id = %peer_id, remote = %remote, "peer handshake complete");

        loop {
            // Disconnect or a malformed frame ends only this connection.
            let message = read_message(&mut stream).await?;
            self.touch(&peer_id).await;

            if let Some(reply) = self.dispatch(&peer_id, message).await? {
                write_message(&mut stream, &reply).await?;
            }
        }
    }

    /// Produce the reply for one ACTIVE-state message.
    async fn dispatch(
        &self,
        peer_id: &str,
        message: PeerMessage,
    ) -> DepotResult<Option<PeerMessage>> {
        match message {
            PeerMessage::DownloadRequest { package } => {
                let chunks = self.chunks.chunk_ids(&package);
                Ok(Some(PeerMessage::DownloadResponse {
                    available: chunks.is_some(),
                    package,
                    chunks,
                }))
            }
            PeerMessage::UploadOffer { package } => {
                self.package_index
                    .write()
                    .await
                    .entry(package.clone())
                    .or_default()
                    .insert(peer_id.to_string());
                Ok(Some(PeerMessage::UploadResponse {
                    package,
                    accepted: true,
                }))
            }
            PeerMessage::ChunkRequest { package, chunk_id } => {
                let reply = match self.chunks.read_chunk(&package, &chunk_id) {
                    Ok(bytes) => PeerMessage::ChunkResponse {
                        package,
                        chunk_id,
                        data: Some(hex::encode(bytes)),
                        error: None,
                    },
                    Err(e) => PeerMessage::ChunkResponse {
                        package,
                        chunk_id,
                        data: None,
                        error: Some(e.to_string()),
                    },
                };
                Ok(Some(reply))
            }
            PeerMessage::Ping => Ok(Some(PeerMessage::Pong)),
            PeerMessage::Pong => Ok(None),
            other => Err(DepotError::Protocol {
                message: format!("unexpected {} in active state", other.kind()),
            }),
        }
    }

    /// Register or overwrite a peer and index its shared packages.
    async fn register_peer(&self, peer: PeerNode) {
        let peer_id = peer.id.clone();
        let shared = peer.shared_packages.clone();
        self.peers.write().await.insert(peer_id.clone(), peer);

        let mut index = self.package_index.write().await;
        for package in shared {
            index.entry(package).or_default().insert(peer_id.clone());
        }
    }

    async fn touch(&self, peer_id: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(peer_id) {
            peer.last_seen = Utc::now();
        }
    }

    /// Client-side connect and handshake. Registers the remote peer locally
    /// on success; returns `false` on any I/O or protocol error. No retries:
    /// the caller decides.
    pub async fn connect_to_peer(&self, address: &str, port: u16) -> bool {
        match self.try_connect(address, port).await {
            Ok(peer_id) => {
                debug!(peer_id = %peer_id, address, port, "connected to peer");
                true
            }
            Err(e) => {
                warn!(address, port, error = %e, "failed to connect to peer");
                false
            }
        }
    }

    async fn try_connect(&self, address: &str, port: u16) -> DepotResult<String> {
        let mut stream = timeout(
            self.config.socket_timeout,
            TcpStream::connect((address, port)),
        )
        .await
        .map_err(|_| DepotError::Connection {
            address: format!("{}:{}", address, port),
            details: "connect timed out".to_string(),
        })??;

        write_message(
            &mut stream,
            &PeerMessage::Handshake {
                peer_id: self.local_id.clone(),
                port: self.config.listen_port,
                capabilities: vec!["download".to_string(), "upload".to_string()],
                shared_packages: self.chunks.shared_package_keys(),
                bandwidth: self.config.advertised_bandwidth_mbps,
                trusted: false,
                reputation: 0.5,
            },
        )
        .await?;

        let response = timeout(self.config.socket_timeout, read_message(&mut stream))
            .await
            .map_err(|_| DepotError::Timeout {
                operation: format!("handshake with {}:{}", address, port),
                duration: self.config.socket_timeout,
            })??;

        match response {
            PeerMessage::HandshakeResponse {
                peer_id,
                capabilities,
                shared_packages,
            } => {
                self.register_peer(PeerNode {
                    id: peer_id.clone(),
                    address: address.to_string(),
                    port,
                    capabilities,
                    shared_packages: shared_packages.into_iter().collect(),
                    bandwidth_mbps: self.config.advertised_bandwidth_mbps,
                    last_seen: Utc::now(),
                    trusted: false,
                    reputation: 0.5,
                })
                .await;
                Ok(peer_id)
            }
            other => Err(DepotError::Protocol {
                message: format!("expected handshake_response, got {}", other.kind()),
            }),
        }
    }

    /// Download a whole package from one peer over a fresh connection:
    /// handshake, availability check, then chunk-by-chunk transfer in index
    /// order.
    pub async fn download_from_peer(
        &self,
        peer: &PeerNode,
        info: &PackageInfo,
    ) -> DepotResult<Vec<u8>> {
        let share_key = info.key().share_key();
        let address = format!("{}:{}", peer.address, peer.port);
        let mut stream = timeout(
            self.config.socket_timeout,
            TcpStream::connect((peer.address.as_str(), peer.port)),
        )
        .await
        .map_err(|_| DepotError::Connection {
            address: address.clone(),
            details: "connect timed out".to_string(),
        })??;

        write_message(
            &mut stream,
            &PeerMessage::Handshake {
                peer_id: self.local_id.clone(),
                port: self.config.listen_port,
                capabilities: vec!["download".to_string()],
                shared_packages: self.chunks.shared_package_keys(),
                bandwidth: self.config.advertised_bandwidth_mbps,
                trusted: false,
                reputation: 0.5,
            },
        )
        .await?;
        self.expect_reply(&mut stream, "handshake_response", |m| {
            matches!(m, PeerMessage::HandshakeResponse { .. })
        })
        .await?;

        write_message(
            &mut stream,
            &PeerMessage::DownloadRequest {
                package: share_key.clone(),
            },
        )
        .await?;
        let response = timeout(self.config.socket_timeout, read_message(&mut stream))
            .await
            .map_err(|_| DepotError::Timeout {
                operation: format!("download_response from {}", address),
                duration: self.config.socket_timeout,
            })??;

        let mut chunk_ids = match response {
            PeerMessage::DownloadResponse {
                available: true,
                chunks: Some(chunks),
                ..
            } => chunks,
            PeerMessage::DownloadResponse { .. } => {
                return Err(DepotError::NoPeers {
                    package: share_key,
                })
            }
            other => {
                return Err(DepotError::Protocol {
                    message: format!("expected download_response, got {}", other.kind()),
                })
            }
        };
        chunk_ids.sort_by_key(|id| ChunkStore::chunk_index(id).unwrap_or(usize::MAX));

        let mut payload = Vec::new();
        for chunk_id in chunk_ids {
            write_message(
                &mut stream,
                &PeerMessage::ChunkRequest {
                    package: share_key.clone(),
                    chunk_id: chunk_id.clone(),
                },
            )
            .await?;
            let reply = timeout(self.config.socket_timeout, read_message(&mut stream))
                .await
                .map_err(|_| DepotError::Timeout {
                    operation: format!("chunk {} from {}", chunk_id, address),
                    duration: self.config.socket_timeout,
                })??;

            match reply {
                PeerMessage::ChunkResponse {
                    data: Some(data), ..
                } => {
                    let bytes = hex::decode(&data).map_err(|e| DepotError::Protocol {
                        message: format!("chunk {} is not valid hex: {}", chunk_id, e),
                    })?;
                    payload.extend(bytes);
                }
                PeerMessage::ChunkResponse {
                    error: Some(error), ..
                } => {
                    return Err(DepotError::Protocol {
                        message: format!("peer failed to serve chunk {}: {}", chunk_id, error),
                    })
                }
                other => {
                    return Err(DepotError::Protocol {
                        message: format!("expected chunk_response, got {}", other.kind()),
                    })
                }
            }
        }
        Ok(payload)
    }

    async fn expect_reply(
        &self,
        stream: &mut TcpStream,
        expected: &str,
        check: impl Fn(&PeerMessage) -> bool,
    ) -> DepotResult<PeerMessage> {
        let reply = timeout(self.config.socket_timeout, read_message(stream))
            .await
            .map_err(|_| DepotError::Timeout {
                operation: format!("waiting for {}", expected),
                duration: self.config.socket_timeout,
            })??;
        if check(&reply) {
            Ok(reply)
        } else {
            Err(DepotError::Protocol {
                message: format!("expected {}, got {}", expected, reply.kind()),
            })
        }
    }

    /// Peers currently sharing `manager:name`, as owned snapshots.
    pub async fn peers_sharing(&self, manager: &str, name: &str) -> Vec<PeerNode> {
        let key = format!("{}:{}", manager, name);
        let ids: Vec<String> = match self.package_index.read().await.get(&key) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let peers = self.peers.read().await;
        ids.iter().filter_map(|id| peers.get(id).cloned()).collect()
    }

    /// Evict peers unseen past the timeout, removing them from every
    /// package's peer set. Returns how many were evicted.
    pub async fn evict_stale_peers(&self) -> usize {
        self.evict_stale_at(Utc::now()).await
    }

    async fn evict_stale_at(&self, now: DateTime<Utc>) -> usize {
        let timeout_secs = self.config.peer_timeout.as_secs() as i64;
        let stale: Vec<String> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| (now - p.last_seen).num_seconds() > timeout_secs)
            .map(|p| p.id.clone())
            .collect();

        if stale.is_empty() {
            return 0;
        }

        let mut peers = self.peers.write().await;
        let mut index = self.package_index.write().await;
        for peer_id in &stale {
            peers.remove(peer_id);
            for set in index.values_mut() {
                set.remove(peer_id);
            }
            info!(peer_id = %peer_id, "evicted stale peer");
        }
        index.retain(|_, set| !set.is_empty());
        stale.len()
    }

    /// Background stale-peer sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(network.config.cleanup_tick);
            loop {
                tick.tick().await;
                let evicted = network.evict_stale_peers().await;
                if evicted > 0 {
                    debug!(evicted, "peer cleanup pass complete");
                }
            }
        })
    }

    /// Background discovery duty. The minimum contract is "periodically try
    /// to keep the peer table warm": re-handshake with peers we have not
    /// heard from in a while so both sides refresh their tables.
    pub fn spawn_discovery(self: &Arc<Self>) -> JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(network.config.discovery_tick);
            loop {
                tick.tick().await;
                let now = Utc::now();
                let half_timeout = network.config.peer_timeout.as_secs() as i64 / 2;
                let quiet: Vec<(String, u16)> = network
                    .peers
                    .read()
                    .await
                    .values()
                    .filter(|p| (now - p.last_seen).num_seconds() > half_timeout)
                    .map(|p| (p.address.clone(), p.port))
                    .collect();

                for (address, port) in quiet {
                    if !network.connect_to_peer(&address, port).await {
                        debug!(address, port, "discovery re-handshake failed");
                    }
                }
            }
        })
    }

    pub async fn peer_stats(&self) -> PeerStats {
        let peers = self.peers.read().await;
        let index = self.package_index.read().await;
        let now = Utc::now();
        let timeout_secs = self.config.peer_timeout.as_secs() as i64;

        PeerStats {
            total_peers: peers.len(),
            active_peers: peers
                .values()
                .filter(|p| (now - p.last_seen).num_seconds() <= timeout_secs)
                .count(),
            shared_packages: index.len(),
            peer_list: peers
                .values()
                .map(|p| PeerSummary {
                    id: p.id.clone(),
                    address: format!("{}:{}", p.address, p.port),
                    capabilities: p.capabilities.clone(),
                    shared_packages: p.shared_packages.len(),
                    reputation: p.reputation,
                    last_seen: p.last_seen,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn test_network(listen_port: u16, chunks: Arc<ChunkStore>) -> Arc<PeerNetwork> {
        let config = PeerConfig {
            listen_port,
            ..PeerConfig::default()
        };
        Arc::new(PeerNetwork::new(config, chunks))
    }

    fn sample_peer(id: &str, last_seen: DateTime<Utc>) -> PeerNode {
        PeerNode {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 9000,
            capabilities: vec!["download".to_string()],
            shared_packages: ["apt:curl".to_string()].into_iter().collect(),
            bandwidth_mbps: 100,
            last_seen,
            trusted: false,
            reputation: 0.5,
        }
    }

    #[tokio::test]
    async fn handshake_registers_peer_on_both_sides() {
        let server_chunks = Arc::new(ChunkStore::new(1024));
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("curl.pkg");
        std::fs::write(&artifact, b"payload").unwrap();
        server_chunks.register_artifact("apt:curl", &artifact).unwrap();

        let server = test_network(0, server_chunks);
        let (addr, _handle) = server.start_listener().await.unwrap();

        let client = test_network(0, Arc::new(ChunkStore::new(1024)));
        assert!(client.connect_to_peer("127.0.0.1", addr.port()).await);

        // The client learned the server's shared packages from the
        // handshake response.
        let sharing = client.peers_sharing("apt", "curl").await;
        assert_eq!(sharing.len(), 1);
        assert_eq!(sharing[0].id, server.local_id());

        // Give the server's connection task a moment to register the client.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.peer_stats().await.total_peers, 1);
    }

    #[tokio::test]
    async fn download_from_peer_transfers_all_chunks() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let server_chunks = Arc::new(ChunkStore::new(1024));
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("curl.pkg");
        std::fs::write(&artifact, &payload).unwrap();
        server_chunks.register_artifact("apt:curl", &artifact).unwrap();

        let server = test_network(0, server_chunks);
        let (addr, _handle) = server.start_listener().await.unwrap();

        let client = test_network(0, Arc::new(ChunkStore::new(1024)));
        let peer = PeerNode {
            port: addr.port(),
            ..sample_peer("server", Utc::now())
        };
        let info = PackageInfo {
            name: "curl".to_string(),
            manager: "apt".to_string(),
            version: "1.0".to_string(),
            size: payload.len() as u64,
            checksum: None,
            mirrors: vec![],
            chunk_size: 1024,
            total_chunks: 5,
        };

        let received = client.download_from_peer(&peer, &info).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn download_of_unshared_package_fails() {
        let server = test_network(0, Arc::new(ChunkStore::new(1024)));
        let (addr, _handle) = server.start_listener().await.unwrap();

        let client = test_network(0, Arc::new(ChunkStore::new(1024)));
        let peer = PeerNode {
            port: addr.port(),
            ..sample_peer("server", Utc::now())
        };
        let info = PackageInfo {
            name: "missing".to_string(),
            manager: "apt".to_string(),
            version: "1.0".to_string(),
            size: 10,
            checksum: None,
            mirrors: vec![],
            chunk_size: 1024,
            total_chunks: 1,
        };

        let err = client.download_from_peer(&peer, &info).await.unwrap_err();
        assert!(matches!(err, DepotError::NoPeers { .. }));
    }

    #[tokio::test]
    async fn stale_peers_are_evicted_from_table_and_index() {
        let network = test_network(0, Arc::new(ChunkStore::new(1024)));
        let timeout_secs = network.config.peer_timeout.as_secs() as i64;

        let stale_at = Utc::now() - ChronoDuration::seconds(timeout_secs + 1);
        network.register_peer(sample_peer("stale", stale_at)).await;
        network.register_peer(sample_peer("fresh", Utc::now())).await;

        assert_eq!(network.evict_stale_peers().await, 1);
        assert_eq!(network.peer_stats().await.total_peers, 1);

        let sharing = network.peers_sharing("apt", "curl").await;
        assert_eq!(sharing.len(), 1);
        assert_eq!(sharing[0].id, "fresh");
    }

    #[tokio::test]
    async fn non_handshake_first_message_closes_connection() {
        let server = test_network(0, Arc::new(ChunkStore::new(1024)));
        let (addr, _handle) = server.start_listener().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &PeerMessage::Ping).await.unwrap();

        // The server drops the connection without registering a peer.
        let result = read_message(&mut stream).await;
        assert!(result.is_err());
        assert_eq!(server.peer_stats().await.total_peers, 0);
    }
}
