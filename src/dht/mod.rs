//! A minimal mainline DHT node (BEP-5).
//!
//! The node answers ping, find_node, get_peers and announce_peer queries,
//! maintains a binary-split routing table, and runs iterative get_peers
//! lookups whose results feed the engine's peer discovery.

pub(crate) mod krpc;
pub(crate) mod routing;
mod token;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::StreamExt;
use serde_bytes::ByteBuf;
use tokio::{
    net::{lookup_host, udp::SendHalf, UdpSocket},
    sync::{mpsc, oneshot},
    task,
    time,
};

use crate::{
    error::*,
    tracker::{encode_compact_peers, parse_compact_peers},
    Sha1Hash,
};
use krpc::{
    encode_compact_nodes, parse_compact_nodes, Args, KrpcMessage,
    ResponseBody, ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL, QUERY_ANNOUNCE_PEER,
    QUERY_FIND_NODE, QUERY_GET_PEERS, QUERY_PING,
};
use routing::{NodeId, RoutingTable, K};
use token::TokenStore;

/// Well known entry points used when no node list survived from an earlier
/// run and no bootstrap file is present.
const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// How many iterative rounds a lookup walks before giving up.
const LOOKUP_MAX_ROUNDS: usize = 4;
/// A lookup stops early once it discovered this many peers.
const LOOKUP_ENOUGH_PEERS: usize = 25;
/// How many bootstrap pings are started per maintenance tick.
const PINGS_PER_TICK: usize = 3;

/// Peers discovered for a torrent, forwarded to the engine.
#[derive(Debug)]
pub(crate) struct Discovery {
    pub info_hash: Sha1Hash,
    pub peers: Vec<SocketAddr>,
}

pub(crate) type DiscoverySender = mpsc::UnboundedSender<Discovery>;

type Sender = mpsc::UnboundedSender<Command>;
type Receiver = mpsc::UnboundedReceiver<Command>;

pub(crate) enum Command {
    /// A host that may run a DHT node (e.g. learned from a PORT message).
    /// It is pinged and inserted into the routing table on response.
    AddNode { addr: SocketAddr },
    /// Starts an iterative lookup for peers of the torrent, optionally
    /// announcing our own listen port to the closest nodes afterwards.
    FindPeers {
        info_hash: Sha1Hash,
        announce_port: Option<u16>,
    },
    Shutdown,

    // internal feedback from spawned ping/lookup tasks
    NodeResponded { id: NodeId, addr: SocketAddr },
    NodeFailed { id: NodeId },
    PeersFound {
        info_hash: Sha1Hash,
        peers: Vec<SocketAddr>,
    },
    LookupFinished { info_hash: Sha1Hash, found: usize },
}

/// The handle through which the engine talks to its DHT node.
#[derive(Clone)]
pub(crate) struct DhtHandle(Sender);

impl DhtHandle {
    pub fn add_node(&self, addr: SocketAddr) -> Result<()> {
        self.0.send(Command::AddNode { addr }).map_err(Error::from)
    }

    pub fn find_peers(
        &self,
        info_hash: Sha1Hash,
        announce_port: Option<u16>,
    ) -> Result<()> {
        self.0
            .send(Command::FindPeers {
                info_hash,
                announce_port,
            })
            .map_err(Error::from)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

/// Binds the DHT's UDP socket and spawns the node task. Returns the handle
/// and the actually bound address (relevant when asked to bind port 0).
pub(crate) async fn start(
    listen_addr: SocketAddr,
    data_dir: PathBuf,
    query_timeout: Duration,
    discovery_chan: DiscoverySender,
) -> Result<(task::JoinHandle<Result<()>>, DhtHandle, SocketAddr)> {
    let socket = UdpSocket::bind(listen_addr).await?;
    let local_addr = socket.local_addr()?;
    log::info!("DHT node listening on {}", local_addr);

    fs::create_dir_all(&data_dir)?;
    let local_id = load_node_id(&data_dir)?;
    log::info!("DHT node id {:?}", local_id);

    let (recv_half, send_half) = socket.split();
    let (out_chan, out_port) = mpsc::unbounded_channel();
    let (packet_chan, packet_port) = mpsc::unbounded_channel();
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

    task::spawn(run_reader(recv_half, packet_chan));
    task::spawn(run_writer(send_half, out_port));

    let client = KrpcClient {
        local_id,
        out_chan,
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_transaction: Arc::new(AtomicU16::new(0)),
        query_timeout,
    };

    let mut node = Dht {
        client,
        table: RoutingTable::new(local_id),
        tokens: TokenStore::new(),
        peer_store: HashMap::new(),
        pending_pings: VecDeque::new(),
        seen_hosts: HashSet::new(),
        lookups: VecDeque::new(),
        lookup_running: false,
        discovery_chan,
        cmd_chan: cmd_chan.clone(),
        data_dir,
    };
    node.load_saved_nodes();

    let join_handle =
        task::spawn(async move { node.run(cmd_port, packet_port).await });
    Ok((join_handle, DhtHandle(cmd_chan), local_addr))
}

async fn run_reader(
    mut socket: tokio::net::udp::RecvHalf,
    packet_chan: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                if packet_chan.send((buf[..len].to_vec(), addr)).is_err() {
                    // node task gone, we're shutting down
                    break;
                }
            }
            Err(e) => {
                log::debug!("DHT socket read error: {}", e);
            }
        }
    }
}

async fn run_writer(
    mut socket: SendHalf,
    mut out_port: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
) {
    while let Some((buf, addr)) = out_port.recv().await {
        if let Err(e) = socket.send_to(&buf, &addr).await {
            log::debug!("DHT socket write error to {}: {}", addr, e);
        }
    }
}

/// The query side of KRPC: sends queries and pairs up responses by
/// transaction id. Cloned into ping and lookup tasks.
#[derive(Clone)]
struct KrpcClient {
    local_id: NodeId,
    out_chan: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    pending: Arc<Mutex<HashMap<Vec<u8>, oneshot::Sender<KrpcMessage>>>>,
    next_transaction: Arc<AtomicU16>,
    query_timeout: Duration,
}

impl KrpcClient {
    fn send_message(&self, msg: &KrpcMessage, addr: SocketAddr) {
        match msg.encode() {
            Ok(buf) => {
                let _ = self.out_chan.send((buf, addr));
            }
            Err(e) => log::warn!("Cannot encode KRPC message: {}", e),
        }
    }

    /// Routes an incoming response or error message to the waiting query.
    fn dispatch_reply(&self, msg: KrpcMessage) {
        let transaction = msg.t.to_vec();
        let waiter = self.pending.lock().unwrap().remove(&transaction);
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => log::debug!("DHT reply with unknown transaction id"),
        }
    }

    async fn query(
        &self,
        addr: SocketAddr,
        name: &str,
        args: Args,
    ) -> Result<ResponseBody> {
        let transaction = self
            .next_transaction
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();
        let msg = KrpcMessage::query(transaction.clone(), name, args);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(transaction.clone(), tx);
        self.send_message(&msg, addr);

        match time::timeout(self.query_timeout, rx).await {
            Ok(Ok(reply)) => {
                if let Some((code, message)) = reply.e {
                    return Err(Error::Dht(format!(
                        "{} {}",
                        code, message
                    )));
                }
                reply
                    .r
                    .ok_or_else(|| Error::Dht("reply without body".into()))
            }
            Ok(Err(_)) => Err(Error::Channel),
            Err(_) => {
                self.pending.lock().unwrap().remove(&transaction);
                Err(Error::Timeout)
            }
        }
    }

    async fn ping(&self, addr: SocketAddr) -> Result<ResponseBody> {
        self.query(addr, QUERY_PING, Args::new(self.local_id)).await
    }

    async fn find_node(
        &self,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<ResponseBody> {
        let mut args = Args::new(self.local_id);
        args.target = Some(ByteBuf::from(target.0.to_vec()));
        self.query(addr, QUERY_FIND_NODE, args).await
    }

    async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: Sha1Hash,
    ) -> Result<ResponseBody> {
        let mut args = Args::new(self.local_id);
        args.info_hash = Some(ByteBuf::from(info_hash.to_vec()));
        self.query(addr, QUERY_GET_PEERS, args).await
    }

    async fn announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        port: u16,
        token: Vec<u8>,
    ) -> Result<ResponseBody> {
        let mut args = Args::new(self.local_id);
        args.info_hash = Some(ByteBuf::from(info_hash.to_vec()));
        args.port = Some(port);
        args.token = Some(ByteBuf::from(token));
        self.query(addr, QUERY_ANNOUNCE_PEER, args).await
    }
}

struct Dht {
    client: KrpcClient,
    table: RoutingTable,
    tokens: TokenStore,
    /// The peers other nodes announced to us, per torrent.
    peer_store: HashMap<Sha1Hash, HashSet<SocketAddr>>,
    /// Hosts waiting to be pinged before they may enter the routing table.
    pending_pings: VecDeque<SocketAddr>,
    /// Everything ever queued, to keep bootstrap traffic bounded.
    seen_hosts: HashSet<SocketAddr>,
    /// Torrents waiting for a lookup; one lookup runs at a time.
    lookups: VecDeque<(Sha1Hash, Option<u16>)>,
    lookup_running: bool,
    discovery_chan: DiscoverySender,
    cmd_chan: Sender,
    data_dir: PathBuf,
}

impl Dht {
    async fn run(
        &mut self,
        cmd_port: Receiver,
        packet_port: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    ) -> Result<()> {
        self.bootstrap_if_empty();

        let mut cmd_port = cmd_port.fuse();
        let mut packet_port = packet_port.fuse();
        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        loop {
            futures::select! {
                packet = packet_port.select_next_some() => {
                    let (buf, addr) = packet;
                    self.handle_packet(&buf, addr);
                }
                cmd = cmd_port.select_next_some() => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                _ = tick.select_next_some() => {
                    self.tick();
                }
            }
        }

        self.save_nodes();
        Ok(())
    }

    /// Returns false when the node should shut down.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::AddNode { addr } => self.enqueue_ping(addr),
            Command::FindPeers {
                info_hash,
                announce_port,
            } => {
                self.lookups.push_back((info_hash, announce_port));
            }
            Command::NodeResponded { id, addr } => {
                self.table.touch(id, addr);
            }
            Command::NodeFailed { id } => self.table.mark_fail(&id),
            Command::PeersFound { info_hash, peers } => {
                self.record_peers(info_hash, &peers);
            }
            Command::LookupFinished { info_hash, found } => {
                self.lookup_running = false;
                // a fruitless lookup is not retried here; the engine asks
                // again for torrents that still lack peers
                log::debug!(
                    "DHT lookup for {} finished with {} peers",
                    hex::encode(info_hash),
                    found
                );
            }
            Command::Shutdown => {
                log::info!("Shutting down DHT node");
                return false;
            }
        }
        true
    }

    fn tick(&mut self) {
        self.tokens.maybe_rotate();

        for _ in 0..PINGS_PER_TICK {
            match self.pending_pings.pop_front() {
                Some(addr) => self.spawn_ping(addr),
                None => break,
            }
        }

        if !self.lookup_running {
            if let Some((info_hash, announce_port)) =
                self.lookups.pop_front()
            {
                self.spawn_lookup(info_hash, announce_port);
            }
        }
    }

    fn enqueue_ping(&mut self, addr: SocketAddr) {
        if self.seen_hosts.insert(addr) {
            self.pending_pings.push_back(addr);
        }
    }

    fn spawn_ping(&self, addr: SocketAddr) {
        let client = self.client.clone();
        let cmd_chan = self.cmd_chan.clone();
        // while the table is small, ask fresh nodes for our own neighborhood
        let wants_neighbors = self.table.node_count() < 2 * K;
        task::spawn(async move {
            let body = match client.ping(addr).await {
                Ok(body) => body,
                Err(e) => {
                    log::debug!("DHT ping to {} failed: {}", addr, e);
                    return;
                }
            };
            let id = match node_id_from(&body.id) {
                Some(id) => id,
                None => return,
            };
            let _ = cmd_chan.send(Command::NodeResponded { id, addr });

            if wants_neighbors {
                if let Ok(reply) =
                    client.find_node(addr, client.local_id).await
                {
                    if let Some(nodes) = reply.nodes {
                        for (_, node_addr) in parse_compact_nodes(&nodes) {
                            let _ = cmd_chan
                                .send(Command::AddNode { addr: node_addr });
                        }
                    }
                }
            }
        });
    }

    /// The iterative closest-node walk on the info hash: each round queries
    /// the closest not yet queried nodes in parallel and merges whatever
    /// nodes they return, until peers were found or the rounds run out.
    fn spawn_lookup(
        &mut self,
        info_hash: Sha1Hash,
        announce_port: Option<u16>,
    ) {
        let target = NodeId(info_hash);
        let start: Vec<(NodeId, SocketAddr)> = self
            .table
            .find_closest(&target, 2 * K)
            .into_iter()
            .map(|node| (node.id, node.addr))
            .collect();
        if start.is_empty() {
            // defer while bootstrap pings are still outstanding, drop
            // otherwise; the engine re-requests periodically
            if !self.pending_pings.is_empty() {
                self.lookups.push_back((info_hash, announce_port));
            } else {
                log::debug!("DHT lookup without any known nodes, dropping");
            }
            return;
        }

        self.lookup_running = true;
        let client = self.client.clone();
        let cmd_chan = self.cmd_chan.clone();
        task::spawn(async move {
            let mut candidates = start;
            let mut queried: HashSet<NodeId> = HashSet::new();
            let mut peers: HashSet<SocketAddr> = HashSet::new();
            let mut token_holders: Vec<(NodeId, SocketAddr, Vec<u8>)> =
                Vec::new();

            for _ in 0..LOOKUP_MAX_ROUNDS {
                candidates.sort_by_key(|(id, _)| id.distance(&target));
                candidates.dedup_by_key(|(id, _)| *id);
                let batch: Vec<(NodeId, SocketAddr)> = candidates
                    .iter()
                    .filter(|(id, _)| !queried.contains(id))
                    .take(K)
                    .cloned()
                    .collect();
                if batch.is_empty() {
                    break;
                }

                let replies = futures::future::join_all(batch.into_iter().map(
                    |(id, addr)| {
                        let client = client.clone();
                        async move {
                            (id, addr, client.get_peers(addr, info_hash).await)
                        }
                    },
                ))
                .await;

                for (id, addr, reply) in replies {
                    queried.insert(id);
                    match reply {
                        Ok(body) => {
                            let _ = cmd_chan
                                .send(Command::NodeResponded { id, addr });
                            if let Some(token) = body.token {
                                token_holders.push((
                                    id,
                                    addr,
                                    token.into_vec(),
                                ));
                            }
                            if let Some(values) = body.values {
                                for value in values {
                                    peers.extend(parse_compact_peers(&value));
                                }
                            }
                            if let Some(nodes) = body.nodes {
                                candidates
                                    .extend(parse_compact_nodes(&nodes));
                            }
                        }
                        Err(_) => {
                            let _ =
                                cmd_chan.send(Command::NodeFailed { id });
                        }
                    }
                }

                if peers.len() >= LOOKUP_ENOUGH_PEERS {
                    break;
                }
            }

            let found = peers.len();
            if found > 0 {
                let _ = cmd_chan.send(Command::PeersFound {
                    info_hash,
                    peers: peers.into_iter().collect(),
                });
            }

            // announce to the closest nodes that handed us a token
            if let Some(port) = announce_port {
                token_holders
                    .sort_by_key(|(id, _, _)| id.distance(&target));
                for (_, addr, token) in token_holders.into_iter().take(K) {
                    if let Err(e) = client
                        .announce_peer(addr, info_hash, port, token)
                        .await
                    {
                        log::debug!(
                            "DHT announce to {} failed: {}",
                            addr,
                            e
                        );
                    }
                }
            }

            let _ = cmd_chan
                .send(Command::LookupFinished { info_hash, found });
        });
    }

    fn record_peers(&mut self, info_hash: Sha1Hash, peers: &[SocketAddr]) {
        self.peer_store
            .entry(info_hash)
            .or_insert_with(HashSet::new)
            .extend(peers.iter().copied());
        let _ = self.discovery_chan.send(Discovery {
            info_hash,
            peers: peers.to_vec(),
        });
    }

    fn handle_packet(&mut self, buf: &[u8], addr: SocketAddr) {
        let msg = match KrpcMessage::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Malformed DHT message from {}: {}", addr, e);
                return;
            }
        };
        match msg.y.as_str() {
            "q" => {
                let reply = self.handle_query(msg, addr);
                self.client.send_message(&reply, addr);
            }
            "r" | "e" => self.client.dispatch_reply(msg),
            other => {
                log::debug!(
                    "DHT message with unknown type {:?} from {}",
                    other,
                    addr
                );
            }
        }
    }

    fn handle_query(
        &mut self,
        msg: KrpcMessage,
        addr: SocketAddr,
    ) -> KrpcMessage {
        let transaction = msg.t.to_vec();
        let local_id = self.table.local_id();
        let args = match msg.a {
            Some(args) => args,
            None => {
                return KrpcMessage::error(
                    transaction,
                    ERROR_PROTOCOL,
                    "missing arguments",
                )
            }
        };

        // whoever queries us is a routing candidate, once it answers a ping
        if let Some(id) = node_id_from(&args.id) {
            if !self.table.contains(&id) {
                self.enqueue_ping(addr);
            }
        }

        match msg.q.as_deref() {
            Some(QUERY_PING) => {
                KrpcMessage::response(transaction, ResponseBody::new(local_id))
            }
            Some(QUERY_FIND_NODE) => {
                let target = match args
                    .target
                    .as_ref()
                    .and_then(|target| node_id_from(target))
                {
                    Some(target) => target,
                    None => {
                        return KrpcMessage::error(
                            transaction,
                            ERROR_PROTOCOL,
                            "missing target",
                        )
                    }
                };
                let mut body = ResponseBody::new(local_id);
                body.nodes = Some(ByteBuf::from(self.closest_compact(&target)));
                KrpcMessage::response(transaction, body)
            }
            Some(QUERY_GET_PEERS) => {
                let info_hash = match info_hash_from(args.info_hash.as_ref())
                {
                    Some(hash) => hash,
                    None => {
                        return KrpcMessage::error(
                            transaction,
                            ERROR_PROTOCOL,
                            "missing info_hash",
                        )
                    }
                };
                let mut body = ResponseBody::new(local_id);
                match self.peer_store.get(&info_hash) {
                    Some(peers) if !peers.is_empty() => {
                        body.values = Some(
                            peers
                                .iter()
                                .map(|peer| {
                                    ByteBuf::from(encode_compact_peers(
                                        std::slice::from_ref(peer),
                                    ))
                                })
                                .collect(),
                        );
                    }
                    _ => {
                        body.nodes = Some(ByteBuf::from(
                            self.closest_compact(&NodeId(info_hash)),
                        ));
                    }
                }
                body.token =
                    Some(ByteBuf::from(self.tokens.create(&addr.ip())));
                KrpcMessage::response(transaction, body)
            }
            Some(QUERY_ANNOUNCE_PEER) => {
                let empty = Vec::new();
                let token = args.token.as_deref().unwrap_or(&empty);
                if !self.tokens.verify(&addr.ip(), token) {
                    return KrpcMessage::error(
                        transaction,
                        ERROR_PROTOCOL,
                        "Bad Token",
                    );
                }
                let info_hash = match info_hash_from(args.info_hash.as_ref())
                {
                    Some(hash) => hash,
                    None => {
                        return KrpcMessage::error(
                            transaction,
                            ERROR_PROTOCOL,
                            "missing info_hash",
                        )
                    }
                };
                // with implied_port the UDP source port wins (NAT support)
                let port = if args.implied_port.unwrap_or(0) != 0 {
                    addr.port()
                } else {
                    match args.port {
                        Some(port) => port,
                        None => {
                            return KrpcMessage::error(
                                transaction,
                                ERROR_PROTOCOL,
                                "missing port",
                            )
                        }
                    }
                };
                let peer = SocketAddr::new(addr.ip(), port);
                log::info!(
                    "DHT peer {} announced for {}",
                    peer,
                    hex::encode(info_hash)
                );
                self.record_peers(info_hash, &[peer]);
                KrpcMessage::response(transaction, ResponseBody::new(local_id))
            }
            _ => KrpcMessage::error(
                transaction,
                ERROR_METHOD_UNKNOWN,
                "Method Unknown",
            ),
        }
    }

    fn closest_compact(&self, target: &NodeId) -> Vec<u8> {
        let closest: Vec<(NodeId, SocketAddr)> = self
            .table
            .find_closest(target, K)
            .into_iter()
            .map(|node| (node.id, node.addr))
            .collect();
        encode_compact_nodes(&closest)
    }

    /// Queues pings to saved nodes, or the bootstrap entry points when no
    /// node list survived.
    fn bootstrap_if_empty(&mut self) {
        if !self.pending_pings.is_empty() {
            return;
        }

        let bootstrap_path = self.data_dir.join("bootstrap");
        let hosts: Vec<String> = match fs::read_to_string(&bootstrap_path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => {
                BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect()
            }
        };

        let cmd_chan = self.cmd_chan.clone();
        task::spawn(async move {
            for host in hosts {
                match lookup_host(host.as_str()).await {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.next() {
                            let _ =
                                cmd_chan.send(Command::AddNode { addr });
                        }
                    }
                    Err(e) => {
                        log::debug!(
                            "Cannot resolve bootstrap node {}: {}",
                            host,
                            e
                        );
                    }
                }
            }
        });
    }

    fn load_saved_nodes(&mut self) {
        let path = self.nodes_path();
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(_) => return,
        };
        let nodes = parse_compact_nodes(&buf);
        log::info!("Loaded {} saved DHT nodes", nodes.len());
        for (_, addr) in nodes {
            self.enqueue_ping(addr);
        }
    }

    fn save_nodes(&self) {
        let nodes: Vec<(NodeId, SocketAddr)> = self
            .table
            .nodes()
            .map(|node| (node.id, node.addr))
            .collect();
        let buf = encode_compact_nodes(&nodes);
        if let Err(e) = fs::write(self.nodes_path(), buf) {
            log::warn!("Cannot save DHT nodes: {}", e);
        } else {
            log::info!("Saved {} DHT nodes", nodes.len());
        }
    }

    fn nodes_path(&self) -> PathBuf {
        self.data_dir.join("nodes")
    }
}

fn node_id_from(bytes: &[u8]) -> Option<NodeId> {
    if bytes.len() != routing::NODE_ID_LEN {
        return None;
    }
    let mut id = [0; routing::NODE_ID_LEN];
    id.copy_from_slice(bytes);
    Some(NodeId(id))
}

fn info_hash_from(bytes: Option<&ByteBuf>) -> Option<Sha1Hash> {
    let bytes = bytes?;
    if bytes.len() != 20 {
        return None;
    }
    let mut hash = [0; 20];
    hash.copy_from_slice(bytes);
    Some(hash)
}

/// Loads the node id persisted across runs, creating a random one on first
/// start.
fn load_node_id(data_dir: &Path) -> Result<NodeId> {
    let path = data_dir.join("node_id");
    match fs::read(&path) {
        Ok(buf) if buf.len() == routing::NODE_ID_LEN => {
            let mut id = [0; routing::NODE_ID_LEN];
            id.copy_from_slice(&buf);
            Ok(NodeId(id))
        }
        _ => {
            let id = NodeId::random();
            fs::write(&path, &id.0)?;
            Ok(id)
        }
    }
}
