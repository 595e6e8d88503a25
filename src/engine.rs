//! The engine: the top level object owning the torrent table, the disk and
//! DHT tasks, the peer listener, and the dial scheduler. Everything is
//! initialized here, torn down here, and reached through an
//! [`EngineHandle`].

use std::{
    collections::{HashMap, HashSet},
    fs,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use futures::{select, SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task, time,
};
use tokio_util::codec::Framed;

use crate::{
    conf::Conf,
    dht::{self, DhtHandle, Discovery},
    disk::{self, DiskHandle},
    error::*,
    event::Dispatcher,
    metainfo::{Magnet, Metainfo},
    peer::codec::{Handshake, HandshakeCodec, Reserved},
    peer_manager::PeerManager,
    resume::ResumeData,
    torrent::{self, SessionOutcome},
    PeerId, Sha1Hash, TorrentId,
};

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
type Receiver = mpsc::UnboundedReceiver<Command>;

/// The lifecycle stage of a torrent, as the engine tracks it for dial
/// eligibility.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum TorrentStatus {
    /// Disk allocation or hash validation is running; not dialable.
    Validating,
    Active {
        complete: bool,
    },
    /// Could not be set up; dormant.
    Failed,
}

pub(crate) enum Command {
    AddTorrentFile {
        path: PathBuf,
    },
    AddMagnet {
        uri: String,
    },
    /// An accepted connection with a completed handshake, ready to be
    /// routed to its torrent.
    InboundHandshaken {
        addr: SocketAddr,
        socket: TcpStream,
        read_buf: Vec<u8>,
        peer_id: PeerId,
        reserved: Reserved,
        info_hash: Sha1Hash,
    },
    /// A peer session (or dial attempt) ended; used for host accounting
    /// and capacity release.
    PeerSessionClosed {
        info_hash: Sha1Hash,
        addr: SocketAddr,
        outcome: SessionOutcome,
    },
    /// A tracker handed a torrent fresh peers.
    PeersDiscovered {
        info_hash: Sha1Hash,
        peers: Vec<SocketAddr>,
    },
    /// A peer advertised its DHT node.
    DhtPort {
        addr: SocketAddr,
    },
    TorrentStateChanged {
        id: TorrentId,
        info_hash: Sha1Hash,
        status: TorrentStatus,
    },
    Shutdown,
}

/// The handle through which the application drives the engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_chan: Sender,
}

impl EngineHandle {
    pub fn add_torrent_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.cmd_chan
            .send(Command::AddTorrentFile { path: path.into() })
            .map_err(Error::from)
    }

    pub fn add_magnet(&self, uri: impl Into<String>) -> Result<()> {
        self.cmd_chan
            .send(Command::AddMagnet { uri: uri.into() })
            .map_err(Error::from)
    }

    /// Initiates a clean shutdown: torrents announce `stopped` and persist
    /// their resume state. Await the join handle returned by [`start`] for
    /// completion.
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown).map_err(Error::from)
    }
}

/// The peer-candidate event fanned out on the engine's event dispatcher.
#[derive(Clone, Debug)]
struct PeerDiscovery {
    info_hash: Sha1Hash,
    peers: Vec<SocketAddr>,
}

/// Binds the engine's sockets, spawns its component tasks and the engine
/// task itself.
///
/// Errors from this function are startup IO failures (exit code 2
/// territory); configuration problems have been caught earlier.
pub async fn start(
    conf: Conf,
) -> Result<(task::JoinHandle<Result<()>>, EngineHandle)> {
    let conf = Arc::new(conf);
    for dir in [
        &conf.data_dir,
        &conf.active_dir,
        &conf.watch_dir,
        &conf.download_dir,
        &conf.trash_dir,
    ]
    .iter()
    {
        fs::create_dir_all(dir)?;
    }

    let listener =
        TcpListener::bind(("0.0.0.0", conf.listen_port)).await?;
    log::info!("Listening for peers on {}", listener.local_addr()?);

    let (disk_join, disk) =
        disk::spawn(conf.piece_cache_capacity, conf.piece_cache_ttl);

    let (discovery_chan, discovery_port) = mpsc::unbounded_channel();
    let (dht_join, dht, _) = dht::start(
        SocketAddr::from(([0, 0, 0, 0], conf.dht_port)),
        conf.data_dir.join("dht"),
        conf.dht_query_timeout,
        discovery_chan,
    )
    .await?;

    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let peer_manager = PeerManager::new(
        conf.max_connections,
        conf.host_cooldown,
        conf.max_fails,
    );

    let mut engine = Engine {
        conf,
        cmd_chan: cmd_chan.clone(),
        torrents: HashMap::new(),
        by_hash: HashMap::new(),
        status: HashMap::new(),
        known_torrents: Arc::new(RwLock::new(HashSet::new())),
        next_torrent_id: 0,
        peer_manager,
        disk,
        disk_join: Some(disk_join),
        dht,
        dht_join: Some(dht_join),
        dispatcher: Dispatcher::new(),
    };

    let join_handle = task::spawn(async move {
        engine.run(listener, cmd_port, discovery_port).await
    });
    Ok((join_handle, EngineHandle { cmd_chan }))
}

struct TorrentEntry {
    cmd_chan: torrent::Sender,
    join_handle: task::JoinHandle<()>,
    info_hash: Sha1Hash,
}

struct Engine {
    conf: Arc<Conf>,
    cmd_chan: Sender,
    torrents: HashMap<TorrentId, TorrentEntry>,
    by_hash: HashMap<Sha1Hash, TorrentId>,
    status: HashMap<TorrentId, TorrentStatus>,
    /// The torrents we serve, shared with the acceptor tasks so they can
    /// drop handshakes for unknown info hashes before replying.
    known_torrents: Arc<RwLock<HashSet<Sha1Hash>>>,
    next_torrent_id: TorrentId,
    peer_manager: PeerManager,
    disk: DiskHandle,
    disk_join: Option<task::JoinHandle<Result<()>>>,
    dht: DhtHandle,
    dht_join: Option<task::JoinHandle<Result<()>>>,
    dispatcher: Dispatcher<PeerDiscovery>,
}

impl Engine {
    async fn run(
        &mut self,
        mut listener: TcpListener,
        cmd_port: Receiver,
        discovery_port: mpsc::UnboundedReceiver<Discovery>,
    ) -> Result<()> {
        self.load_resume_torrents();

        // the engine's own candidate intake is just another subscriber of
        // the discovery events
        let (_scope, intake_port) = self.dispatcher.subscribe();
        let mut intake_port = intake_port.fuse();
        let mut discovery_port = discovery_port.fuse();
        let mut cmd_port = cmd_port.fuse();
        let mut incoming = listener.incoming().fuse();
        let mut tick = time::interval(Duration::from_secs(1)).fuse();
        let mut tick_count: u64 = 0;

        loop {
            select! {
                cmd = cmd_port.select_next_some() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                stream = incoming.select_next_some() => {
                    match stream {
                        Ok(socket) => self.accept_peer(socket),
                        Err(e) => log::debug!("Accept error: {}", e),
                    }
                }
                discovery = discovery_port.select_next_some() => {
                    // DHT lookups and announce_peer messages feed the same
                    // dispatcher as tracker responses
                    self.dispatcher.dispatch(PeerDiscovery {
                        info_hash: discovery.info_hash,
                        peers: discovery.peers,
                    });
                }
                discovery = intake_port.select_next_some() => {
                    self.peer_manager.add_candidates(
                        discovery.info_hash,
                        discovery.peers,
                    );
                }
                _ = tick.select_next_some() => {
                    tick_count += 1;
                    self.dial_tick();
                    if tick_count % 60 == 0 {
                        self.dht_tick();
                    }
                }
            }
        }

        self.shut_down().await;
        Ok(())
    }

    /// Returns false on shutdown.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::AddTorrentFile { path } => {
                if let Err(e) = self.add_torrent_file(&path) {
                    log::error!("Cannot add torrent {:?}: {}", path, e);
                }
            }
            Command::AddMagnet { uri } => {
                if let Err(e) = self.add_magnet(&uri) {
                    log::error!("Cannot add magnet: {}", e);
                }
            }
            Command::InboundHandshaken {
                addr,
                socket,
                read_buf,
                peer_id,
                reserved,
                info_hash,
            } => {
                self.route_inbound(
                    addr, socket, read_buf, peer_id, reserved, info_hash,
                );
            }
            Command::PeerSessionClosed {
                info_hash: _,
                addr,
                outcome,
            } => {
                match outcome {
                    SessionOutcome::DialFailure
                    | SessionOutcome::HandshakeFailure => {
                        self.peer_manager.mark_failed(&addr);
                    }
                    SessionOutcome::Disconnected => {
                        // the handshake once succeeded: the failure streak
                        // is over
                        self.peer_manager.mark_connected(&addr);
                    }
                }
                self.peer_manager.release(&addr);
            }
            Command::PeersDiscovered { info_hash, peers } => {
                self.dispatcher.dispatch(PeerDiscovery { info_hash, peers });
            }
            Command::DhtPort { addr } => {
                let _ = self.dht.add_node(addr);
            }
            Command::TorrentStateChanged {
                id,
                info_hash,
                status,
            } => {
                log::info!("Torrent {} is now {:?}", id, status);
                self.status.insert(id, status);
                if status == TorrentStatus::Failed {
                    self.known_torrents.write().unwrap().remove(&info_hash);
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn next_id(&mut self) -> TorrentId {
        let id = self.next_torrent_id;
        self.next_torrent_id += 1;
        id
    }

    fn add_torrent_file(&mut self, path: &PathBuf) -> Result<()> {
        let buf = fs::read(path)?;
        let metainfo = Metainfo::from_bytes(&buf)?;
        log::info!("Adding torrent {:?}", metainfo.name);
        let announce_list = metainfo.announce_list.clone();
        self.add_torrent(metainfo.info_hash, Some(metainfo), announce_list, None)
    }

    fn add_magnet(&mut self, uri: &str) -> Result<()> {
        let magnet = Magnet::parse(uri)?;
        log::info!(
            "Adding magnet {} ({})",
            magnet.name.as_deref().unwrap_or("?"),
            hex::encode(magnet.info_hash)
        );
        let announce_list = if magnet.trackers.is_empty() {
            Vec::new()
        } else {
            vec![magnet.trackers]
        };
        self.add_torrent(magnet.info_hash, None, announce_list, None)
    }

    fn load_resume_torrents(&mut self) {
        for path in torrent::resume_dir_entries(&self.conf.active_dir) {
            let resume = match ResumeData::load(&path) {
                Ok(resume) => resume,
                Err(e) => {
                    log::error!("Corrupt resume file {:?}: {}", path, e);
                    continue;
                }
            };
            let info_hash = match resume.info_hash() {
                Some(hash) => hash,
                None => continue,
            };
            let metainfo = match &resume.info {
                Some(info) => match Metainfo::from_info_bytes(
                    info.to_vec(),
                    resume.announce_list.clone(),
                ) {
                    Ok(metainfo) => Some(metainfo),
                    Err(e) => {
                        log::error!(
                            "Corrupt info dict in resume {:?}: {}",
                            path,
                            e
                        );
                        continue;
                    }
                },
                None => None,
            };
            let announce_list = resume.announce_list.clone();
            log::info!("Resuming torrent {}", hex::encode(info_hash));
            if let Err(e) = self.add_torrent(
                info_hash,
                metainfo,
                announce_list,
                Some(resume),
            ) {
                log::error!("Cannot resume torrent: {}", e);
            }
        }
    }

    fn add_torrent(
        &mut self,
        info_hash: Sha1Hash,
        metainfo: Option<Metainfo>,
        announce_list: Vec<Vec<String>>,
        resume: Option<ResumeData>,
    ) -> Result<()> {
        if self.by_hash.contains_key(&info_hash) {
            log::warn!(
                "Torrent {} is already added",
                hex::encode(info_hash)
            );
            return Ok(());
        }

        let id = self.next_id();
        let (cmd_chan, join_handle) = torrent::spawn(torrent::Params {
            id,
            info_hash,
            metainfo,
            announce_list,
            resume,
            conf: Arc::clone(&self.conf),
            disk: self.disk.clone(),
            engine_chan: self.cmd_chan.clone(),
        });
        self.torrents.insert(
            id,
            TorrentEntry {
                cmd_chan,
                join_handle,
                info_hash,
            },
        );
        self.by_hash.insert(info_hash, id);
        self.status.insert(id, TorrentStatus::Validating);
        self.known_torrents.write().unwrap().insert(info_hash);

        // ask the swarm for peers right away
        let _ = self
            .dht
            .find_peers(info_hash, Some(self.conf.listen_port));
        Ok(())
    }

    /// Accepts an inbound connection: the handshake is performed off the
    /// engine loop and routed back via `InboundHandshaken`.
    fn accept_peer(&mut self, socket: TcpStream) {
        if !self.peer_manager.has_capacity() {
            // reject silently; the socket just drops
            log::debug!("Inbound connection dropped: at capacity");
            return;
        }
        let known_torrents = Arc::clone(&self.known_torrents);
        let cmd_chan = self.cmd_chan.clone();
        let client_id = self.conf.client_id;
        let handshake_timeout = self.conf.handshake_timeout;
        task::spawn(async move {
            if let Err(e) = inbound_handshake(
                socket,
                known_torrents,
                cmd_chan,
                client_id,
                handshake_timeout,
            )
            .await
            {
                log::debug!("Inbound handshake failed: {}", e);
            }
        });
    }

    fn route_inbound(
        &mut self,
        addr: SocketAddr,
        socket: TcpStream,
        read_buf: Vec<u8>,
        peer_id: PeerId,
        reserved: Reserved,
        info_hash: Sha1Hash,
    ) {
        // re-check: the torrent may have been removed while the handshake
        // was in flight, and capacity may be gone
        if !self.peer_manager.has_capacity() {
            log::debug!("Inbound peer {} dropped: at capacity", addr);
            return;
        }
        let id = match self.by_hash.get(&info_hash).copied() {
            Some(id) => id,
            None => {
                log::info!(
                    "Inbound peer {} for unknown torrent {}, dropping",
                    addr,
                    hex::encode(info_hash)
                );
                return;
            }
        };
        let entry = match self.torrents.get(&id) {
            Some(entry) => entry,
            None => return,
        };
        self.peer_manager.session_started();
        self.peer_manager.mark_connected(&addr);
        let _ = entry.cmd_chan.send(torrent::Command::InboundPeer {
            addr,
            socket,
            read_buf,
            peer_id,
            reserved,
        });
    }

    /// Fills free connection slots with outbound dials.
    fn dial_tick(&mut self) {
        if !self.peer_manager.has_capacity() {
            return;
        }

        // outbound connections go to torrents that are neither validating
        // nor already complete
        let dialable: HashSet<Sha1Hash> = self
            .torrents
            .iter()
            .filter(|(id, _)| {
                matches!(
                    self.status.get(id),
                    Some(TorrentStatus::Active { complete: false })
                )
            })
            .map(|(_, entry)| entry.info_hash)
            .collect();
        if dialable.is_empty() {
            return;
        }

        let free_slots = self.conf.max_connections
            - self.peer_manager.connection_count();
        let candidates = self
            .peer_manager
            .dial_candidates(free_slots, |hash| dialable.contains(hash));
        for (addr, info_hash) in candidates {
            let id = self.by_hash.get(&info_hash).copied();
            let entry = match id {
                Some(id) => self.torrents.get(&id),
                None => None,
            };
            if let Some(entry) = entry {
                log::info!(
                    "Dialing peer {} for {}",
                    addr,
                    hex::encode(info_hash)
                );
                self.peer_manager.session_started();
                let _ = entry
                    .cmd_chan
                    .send(torrent::Command::DialPeer { addr });
            } else {
                self.peer_manager.release(&addr);
            }
        }
    }

    /// Periodically asks the DHT for more peers for torrents that still
    /// need downloading.
    fn dht_tick(&mut self) {
        for (id, entry) in self.torrents.iter() {
            if matches!(
                self.status.get(id),
                Some(TorrentStatus::Active { complete: false })
                    | Some(TorrentStatus::Validating)
            ) {
                let _ = self.dht.find_peers(
                    entry.info_hash,
                    Some(self.conf.listen_port),
                );
            }
        }
    }

    /// Tears the components down in reverse setup order: torrents (which
    /// announce `stopped` and persist resume state), then the DHT (which
    /// persists its node table), then the disk task.
    async fn shut_down(&mut self) {
        log::info!("Shutting down engine");
        for (_, entry) in self.torrents.drain() {
            let _ = entry.cmd_chan.send(torrent::Command::Stop);
            if let Err(e) = entry.join_handle.await {
                log::warn!("Torrent task panicked: {}", e);
            }
        }

        let _ = self.dht.shutdown();
        if let Some(join_handle) = self.dht_join.take() {
            let _ = join_handle.await;
        }

        let _ = self.disk.shutdown();
        if let Some(join_handle) = self.disk_join.take() {
            let _ = join_handle.await;
        }
        log::info!("Engine stopped");
    }
}

/// Performs the responder side of the wire handshake on a fresh inbound
/// connection. Connections for unknown torrents are dropped before any
/// reply, as are handshakes that don't arrive within the timeout.
async fn inbound_handshake(
    socket: TcpStream,
    known_torrents: Arc<RwLock<HashSet<Sha1Hash>>>,
    cmd_chan: Sender,
    client_id: PeerId,
    timeout: Duration,
) -> Result<()> {
    let addr = socket.peer_addr()?;
    let mut socket = Framed::new(socket, HandshakeCodec);

    let peer_handshake = time::timeout(timeout, socket.next())
        .await?
        .ok_or(Error::Protocol("connection closed during handshake"))??;

    let info_hash = peer_handshake.info_hash;
    if !known_torrents.read().unwrap().contains(&info_hash) {
        // not a torrent of ours; close without a reply
        return Err(Error::InvalidPeerInfoHash);
    }

    socket.send(Handshake::new(info_hash, client_id)).await?;

    let parts = socket.into_parts();
    let _ = cmd_chan.send(Command::InboundHandshaken {
        addr,
        socket: parts.io,
        read_buf: parts.read_buf.to_vec(),
        peer_id: peer_handshake.peer_id,
        reserved: peer_handshake.reserved,
        info_hash,
    });
    Ok(())
}
