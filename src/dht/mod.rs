//! Kademlia DHT peer discovery (BEP 5).
//!
//! Generalizes `original_source/ccbt/dht.py`'s `AsyncDHTClient` (iterative
//! `find_node`/`get_peers` lookups, token-verified `announce_peer`,
//! periodic bucket refresh) into a Rust actor reached through a cloneable
//! [`DhtHandle`], the same shape as [`crate::disk::DiskHandle`] and
//! [`crate::peer::Sender`]: one owned task, a command channel, callers
//! await typed responses over oneshot channels.

pub(crate) mod routing_table;
pub(crate) mod rpc;

use std::{
    collections::{BTreeMap, HashMap},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::{Duration, Instant},
};

use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot};

use self::{
    routing_table::{Node, RoutingTable},
    rpc::{KrpcMessage, Rpc},
};
use crate::{bencode::Value, error::DhtError, event::EventSink, event::Event, Sha1Hash};

/// Parallelism factor for iterative lookups.
const ALPHA: usize = 3;
const LOOKUP_FANOUT: usize = 8;
const MAX_LOOKUP_ROUNDS: usize = 8;
/// How long an announced peer is kept before it's considered stale.
const PEER_TTL: Duration = Duration::from_secs(30 * 60);
/// How long a handed-out token remains valid for a subsequent announce.
const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

pub(crate) enum Command {
    FindPeers {
        info_hash: Sha1Hash,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    Announce {
        info_hash: Sha1Hash,
        port: u16,
    },
    AddNode {
        addr: SocketAddr,
    },
    Stop,
}

#[derive(Clone)]
pub(crate) struct DhtHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl DhtHandle {
    pub async fn find_peers(&self, info_hash: Sha1Hash) -> Result<Vec<SocketAddr>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::FindPeers {
                info_hash,
                reply: tx,
            })
            .await
            .map_err(|_| channel_closed())?;
        rx.await.map_err(|_| channel_closed())
    }

    pub async fn announce(&self, info_hash: Sha1Hash, port: u16) -> Result<(), DhtError> {
        self.cmd_tx
            .send(Command::Announce { info_hash, port })
            .await
            .map_err(|_| channel_closed())
    }

    pub async fn add_node(&self, addr: SocketAddr) -> Result<(), DhtError> {
        self.cmd_tx
            .send(Command::AddNode { addr })
            .await
            .map_err(|_| channel_closed())
    }

    pub async fn stop(&self) -> Result<(), DhtError> {
        self.cmd_tx.send(Command::Stop).await.map_err(|_| channel_closed())
    }
}

fn channel_closed() -> DhtError {
    DhtError::Remote("dht actor is no longer running".into())
}

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// The DHT node's own actor state: routing table, RPC transport, and the
/// peer-storage table we answer `get_peers`/`announce_peer` queries with
/// on behalf of other nodes in the swarm.
struct Dht {
    own_id: Sha1Hash,
    rpc: Rpc,
    routing: RoutingTable,
    query_timeout: Duration,
    token_secret: [u8; 20],
    storage: HashMap<Sha1Hash, Vec<AnnouncedPeer>>,
    cmd_rx: mpsc::Receiver<Command>,
    events: EventSink,
}

pub(crate) async fn spawn(
    bind_addr: SocketAddr,
    own_id: Sha1Hash,
    bootstrap_nodes: Vec<SocketAddr>,
    query_timeout: Duration,
    events: EventSink,
) -> Result<DhtHandle, DhtError> {
    let rpc = Rpc::bind(bind_addr).await?;
    let mut token_secret = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut token_secret);

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let mut dht = Dht {
        own_id,
        rpc,
        routing: RoutingTable::new(own_id),
        query_timeout,
        token_secret,
        storage: HashMap::new(),
        cmd_rx,
        events,
    };
    for addr in bootstrap_nodes {
        if let Ok(id) = dht.ping(addr).await {
            dht.routing.add_node(Node::new(id, addr));
        }
    }

    tokio::spawn(async move { dht.run().await });
    Ok(DhtHandle { cmd_tx })
}

impl Dht {
    async fn run(&mut self) {
        let mut refresh = tokio::time::interval(Duration::from_secs(15 * 60));
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::FindPeers { info_hash, reply }) => {
                            let peers = self.get_peers(info_hash).await;
                            let _ = reply.send(peers);
                        }
                        Some(Command::Announce { info_hash, port }) => {
                            self.announce(info_hash, port).await;
                        }
                        Some(Command::AddNode { addr }) => {
                            if let Ok(id) = self.ping(addr).await {
                                self.routing.add_node(Node::new(id, addr));
                            }
                        }
                        Some(Command::Stop) | None => break,
                    }
                }
                incoming = self.rpc.recv_query() => {
                    if let Some((message, from)) = incoming {
                        self.handle_query(message, from).await;
                    }
                }
                _ = refresh.tick() => {
                    self.cleanup_storage();
                }
            }
        }
    }

    fn cleanup_storage(&mut self) {
        for peers in self.storage.values_mut() {
            peers.retain(|p| p.announced_at.elapsed() < PEER_TTL);
        }
        self.storage.retain(|_, peers| !peers.is_empty());
    }

    fn token_for(&self, addr: SocketAddr) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(self.token_secret);
        hasher.update(addr.to_string().as_bytes());
        hasher.finalize().to_vec()
    }

    async fn handle_query(&mut self, message: KrpcMessage, from: SocketAddr) {
        let (tid, method, args) = match message {
            KrpcMessage::Query { tid, method, args } => (tid, method, args),
            _ => return,
        };
        if let Some(id) = args.get(&b"id"[..]).and_then(|v| v.as_bytes()) {
            if id.len() == 20 {
                let mut node_id = [0u8; 20];
                node_id.copy_from_slice(id);
                self.routing.add_node(Node::new(node_id, from));
            }
        }

        let mut reply = BTreeMap::new();
        reply.insert(b"id".to_vec(), Value::Bytes(self.own_id.to_vec()));

        match method.as_str() {
            "ping" => {}
            "find_node" => {
                if let Some(target) = args.get(&b"target"[..]).and_then(|v| v.as_bytes()) {
                    if target.len() == 20 {
                        let mut target_id = [0u8; 20];
                        target_id.copy_from_slice(target);
                        reply.insert(
                            b"nodes".to_vec(),
                            Value::Bytes(encode_compact_nodes(
                                &self.routing.closest_nodes(&target_id, LOOKUP_FANOUT),
                            )),
                        );
                    }
                }
            }
            "get_peers" => {
                if let Some(info_hash) = args.get(&b"info_hash"[..]).and_then(|v| v.as_bytes()) {
                    if info_hash.len() == 20 {
                        let mut ih = [0u8; 20];
                        ih.copy_from_slice(info_hash);
                        reply.insert(b"token".to_vec(), Value::Bytes(self.token_for(from)));
                        if let Some(peers) = self.storage.get(&ih) {
                            let values: Vec<Value> = peers
                                .iter()
                                .filter_map(|p| match p.addr {
                                    SocketAddr::V4(v4) => Some(Value::Bytes(encode_compact_peer(v4))),
                                    SocketAddr::V6(_) => None,
                                })
                                .collect();
                            reply.insert(b"values".to_vec(), Value::List(values));
                        } else {
                            reply.insert(
                                b"nodes".to_vec(),
                                Value::Bytes(encode_compact_nodes(
                                    &self.routing.closest_nodes(&ih, LOOKUP_FANOUT),
                                )),
                            );
                        }
                    }
                }
            }
            "announce_peer" => {
                let token_ok = args
                    .get(&b"token"[..])
                    .and_then(|v| v.as_bytes())
                    .map(|t| t == self.token_for(from).as_slice())
                    .unwrap_or(false);
                if token_ok {
                    if let Some(info_hash) = args.get(&b"info_hash"[..]).and_then(|v| v.as_bytes()) {
                        if info_hash.len() == 20 {
                            let mut ih = [0u8; 20];
                            ih.copy_from_slice(info_hash);
                            let port = args
                                .get(&b"implied_port"[..])
                                .and_then(|v| v.as_int())
                                .filter(|&v| v == 1)
                                .map(|_| from.port())
                                .or_else(|| args.get(&b"port"[..]).and_then(|v| v.as_int()).map(|p| p as u16))
                                .unwrap_or(from.port());
                            let addr = SocketAddr::new(from.ip(), port);
                            self.storage.entry(ih).or_default().push(AnnouncedPeer {
                                addr,
                                announced_at: Instant::now(),
                            });
                        }
                    }
                }
            }
            _ => {}
        }

        let _ = self.rpc.reply(from, tid, reply).await;
    }

    async fn ping(&self, addr: SocketAddr) -> Result<Sha1Hash, DhtError> {
        let mut args = BTreeMap::new();
        args.insert(b"id".to_vec(), Value::Bytes(self.own_id.to_vec()));
        let values = self.rpc.query(addr, "ping", args, self.query_timeout).await?;
        extract_id(&values)
    }

    async fn find_node(
        &self,
        addr: SocketAddr,
        target: Sha1Hash,
    ) -> Result<Vec<Node>, DhtError> {
        let mut args = BTreeMap::new();
        args.insert(b"id".to_vec(), Value::Bytes(self.own_id.to_vec()));
        args.insert(b"target".to_vec(), Value::Bytes(target.to_vec()));
        let values = self.rpc.query(addr, "find_node", args, self.query_timeout).await?;
        Ok(values
            .get(&b"nodes"[..])
            .and_then(|v| v.as_bytes())
            .map(decode_compact_nodes)
            .unwrap_or_default())
    }

    /// Single get_peers round trip, returning both any announced peers and
    /// any closer nodes returned in lieu of peers, plus the handed-out
    /// token (needed for a later `announce_peer`, not used by the
    /// iterative lookup itself).
    async fn get_peers_query(
        &self,
        addr: SocketAddr,
        info_hash: Sha1Hash,
    ) -> Result<(Vec<SocketAddr>, Vec<Node>), DhtError> {
        let mut args = BTreeMap::new();
        args.insert(b"id".to_vec(), Value::Bytes(self.own_id.to_vec()));
        args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
        let values = self
            .rpc
            .query(addr, "get_peers", args, self.query_timeout)
            .await?;

        let peers = values
            .get(&b"values"[..])
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter(|b| b.len() == 6)
                    .map(|b| SocketAddr::from(decode_compact_peer(b)))
                    .collect()
            })
            .unwrap_or_default();
        let nodes = values
            .get(&b"nodes"[..])
            .and_then(|v| v.as_bytes())
            .map(decode_compact_nodes)
            .unwrap_or_default();
        Ok((peers, nodes))
    }

    /// Iterative `get_peers` lookup: starts from the closest known nodes
    /// and keeps querying nodes closer to `info_hash` until a round
    /// yields nothing new, same termination condition as the Python
    /// original's `get_peers`.
    async fn get_peers(&mut self, info_hash: Sha1Hash) -> Vec<SocketAddr> {
        let mut queried = std::collections::HashSet::new();
        let mut frontier = self.routing.closest_nodes(&info_hash, LOOKUP_FANOUT);
        let mut found = Vec::new();

        for _ in 0..MAX_LOOKUP_ROUNDS {
            let to_query: Vec<Node> = frontier
                .iter()
                .filter(|n| !queried.contains(&n.id))
                .take(ALPHA)
                .cloned()
                .collect();
            if to_query.is_empty() {
                break;
            }
            let mut new_nodes = Vec::new();
            let mut progressed = false;
            for node in to_query {
                queried.insert(node.id);
                match self.get_peers_query(node.addr, info_hash).await {
                    Ok((peers, nodes)) => {
                        if !peers.is_empty() {
                            found.extend(peers);
                            progressed = true;
                        }
                        if !nodes.is_empty() {
                            progressed = true;
                        }
                        new_nodes.extend(nodes);
                        self.routing.mark_good(&node.id);
                    }
                    Err(_) => {
                        self.routing.mark_bad(&node.id);
                    }
                }
            }
            if !progressed {
                break;
            }
            for node in new_nodes {
                self.routing.add_node(node.clone());
                frontier.push(node);
            }
            frontier.sort_by_key(|n| routing_table::distance(&n.id, &info_hash));
            frontier.truncate(LOOKUP_FANOUT * 2);
        }

        if !found.is_empty() {
            self.events.emit(Event::DhtPeersFound {
                info_hash,
                count: found.len(),
            });
        }
        found.sort_by_key(|a| a.to_string());
        found.dedup();
        found
    }

    async fn announce(&mut self, info_hash: Sha1Hash, port: u16) {
        let nodes = self.routing.closest_nodes(&info_hash, LOOKUP_FANOUT);
        for node in nodes {
            if let Ok((_, _)) = self.get_peers_query(node.addr, info_hash).await {
                let mut args = BTreeMap::new();
                args.insert(b"id".to_vec(), Value::Bytes(self.own_id.to_vec()));
                args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
                args.insert(b"port".to_vec(), Value::Int(port as i64));
                args.insert(b"token".to_vec(), Value::Bytes(self.token_for(node.addr)));
                let _ = self
                    .rpc
                    .query(node.addr, "announce_peer", args, self.query_timeout)
                    .await;
            }
        }
    }
}

fn extract_id(values: &BTreeMap<Vec<u8>, Value>) -> Result<Sha1Hash, DhtError> {
    let id = values
        .get(&b"id"[..])
        .and_then(|v| v.as_bytes())
        .filter(|b| b.len() == 20)
        .ok_or_else(|| DhtError::Remote("response missing 20-byte id".into()))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(id);
    Ok(out)
}

fn encode_compact_peer(addr: SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn decode_compact_peer(bytes: &[u8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    SocketAddrV4::new(ip, port)
}

fn encode_compact_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let SocketAddr::V4(addr) = node.addr {
            out.extend_from_slice(&node.id);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

fn decode_compact_nodes(bytes: &[u8]) -> Vec<Node> {
    bytes
        .chunks_exact(26)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[..20]);
            let addr = decode_compact_peer(&chunk[20..26]);
            Node::new(id, SocketAddr::V4(addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_node_round_trips() {
        let node = Node::new([7u8; 20], "10.0.0.1:6881".parse().unwrap());
        let encoded = encode_compact_nodes(&[node.clone()]);
        let decoded = decode_compact_nodes(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, node.id);
        assert_eq!(decoded[0].addr, node.addr);
    }

    #[test]
    fn compact_peer_round_trips() {
        let addr: SocketAddrV4 = "10.0.0.1:6881".parse().unwrap();
        let encoded = encode_compact_peer(addr);
        assert_eq!(decode_compact_peer(&encoded), addr);
    }

    #[tokio::test]
    async fn spawn_and_stop_dht_actor() {
        let (events, _rx) = EventSink::new();
        let handle = spawn(
            "127.0.0.1:0".parse().unwrap(),
            [1u8; 20],
            Vec::new(),
            Duration::from_millis(100),
            events,
        )
        .await
        .unwrap();
        handle.stop().await.unwrap();
    }
}
