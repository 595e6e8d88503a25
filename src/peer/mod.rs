//! A peer session: one task per live connection that drives the handshake,
//! the per-peer state machine (choke/interest/bitfield), the request
//! pipeline against the torrent's scheduler, and the serving of requests.

pub(crate) mod codec;
pub(crate) mod extension;

use {
    bytes::BytesMut,
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant},
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            oneshot,
        },
        task, time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        disk::error::ReadError,
        error::*,
        interest_set,
        torrent::{
            Command as TorrentCommand, MetadataState, SessionOutcome,
            TorrentContext,
        },
        Bitfield, BlockInfo, PeerId, PieceIndex,
    },
    codec::*,
    extension::*,
};

/// The channel on which the torrent sends commands to a peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive from its torrent.
#[derive(Clone, Debug)]
pub(crate) enum Command {
    /// We verified a new piece; tell the peer (and reconsider interest).
    Have { piece_index: PieceIndex },
    /// Send a CANCEL for the block (endgame duplicate resolution) and drop
    /// it from the local pipeline.
    Cancel(BlockInfo),
    /// The torrent's metadata became known; bitfields can now be
    /// interpreted and requests made.
    MetadataReady,
    /// Re-run the request pipeline (e.g. a piece was reset after a failed
    /// hash check).
    Wake,
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Spawns an outbound session: dial, handshake, then the message loop. The
/// session reports its fate to the torrent when it ends.
pub(crate) fn spawn_outbound(
    ctx: Arc<TorrentContext>,
    addr: SocketAddr,
) -> Sender {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut session = PeerSession::new(ctx, addr, cmd_port);
    task::spawn(async move {
        let result = session.start_outbound().await;
        session.finish(result).await;
    });
    cmd_chan
}

/// Spawns a session for an accepted connection whose handshake the
/// listener already completed.
pub(crate) fn spawn_inbound(
    ctx: Arc<TorrentContext>,
    addr: SocketAddr,
    socket: TcpStream,
    read_buf: Vec<u8>,
    peer_id: PeerId,
    reserved: Reserved,
) -> Sender {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut session = PeerSession::new(ctx, addr, cmd_port);
    task::spawn(async move {
        let result = session
            .start_inbound(socket, read_buf, peer_id, reserved)
            .await;
        session.finish(result).await;
    });
    cmd_chan
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The normal state of a peer session, in which any message may be
    /// exchanged.
    Connected,
}

/// The four standard flags of a connection.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// The capabilities both sides advertised.
    reserved: Reserved,
}

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

struct PeerSession {
    ctx: Arc<TorrentContext>,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    state: State,
    status: Status,
    peer_info: Option<PeerInfo>,

    /// The peer's pieces, once the torrent's piece count is known. Its
    /// availability is registered with the piece picker exactly while this
    /// is `Some`.
    pieces: Option<Bitfield>,
    /// A bitfield received before the metadata was known, reinterpreted
    /// later.
    raw_bitfield: Option<Vec<u8>>,
    /// HAVE announcements received before the metadata was known.
    raw_haves: Vec<PieceIndex>,
    /// A BITFIELD frame is only legal as the first frame of a connection.
    bitfield_allowed: bool,

    /// Our pending requests that we sent to peer. It represents the blocks
    /// that we are expecting; the scheduler owns the authoritative set.
    /// Emptied when we're choked, as we then don't expect the outstanding
    /// requests to be served.
    outgoing_requests: Vec<BlockInfo>,

    /// The id under which the remote wants ut_metadata messages, from its
    /// extended handshake.
    remote_ut_metadata: Option<u8>,
    /// The metadata piece currently requested from this peer.
    metadata_inflight: Option<u32>,
    /// The peer rejected a metadata request; don't ask it again.
    metadata_rejected: bool,

    last_inbound: Instant,
    last_outbound: Instant,
}

impl PeerSession {
    fn new(
        ctx: Arc<TorrentContext>,
        addr: SocketAddr,
        cmd_port: Receiver,
    ) -> Self {
        Self {
            ctx,
            cmd_port: cmd_port.fuse(),
            addr,
            state: State::Disconnected,
            status: Status::default(),
            peer_info: None,
            pieces: None,
            raw_bitfield: None,
            raw_haves: Vec::new(),
            bitfield_allowed: true,
            outgoing_requests: Vec::new(),
            remote_ut_metadata: None,
            metadata_inflight: None,
            metadata_rejected: false,
            last_inbound: Instant::now(),
            last_outbound: Instant::now(),
        }
    }

    /// Reports the session's fate to the torrent, after cleaning up its
    /// swarm state.
    async fn finish(&mut self, result: Result<()>) {
        if let Err(e) = &result {
            log::info!("Peer {} session ended: {}", self.addr, e);
        }
        let state_at_exit = self.state;
        self.disconnect().await;

        let outcome = match (result, state_at_exit) {
            (Ok(()), _) => SessionOutcome::Disconnected,
            (Err(_), State::Connecting) => SessionOutcome::DialFailure,
            (Err(_), State::Handshaking) => SessionOutcome::HandshakeFailure,
            (Err(_), _) => SessionOutcome::Disconnected,
        };
        let _ = self.ctx.cmd_chan.send(TorrentCommand::SessionClosed {
            addr: self.addr,
            outcome,
        });
    }

    /// Returns the peer's blocks to the scheduler and unregisters its
    /// availability.
    async fn disconnect(&mut self) {
        let mut swarm = self.ctx.swarm.write().await;
        if let Some(swarm) = swarm.as_mut() {
            swarm.scheduler.peer_gone(self.addr, self.pieces.as_ref());
        }
        self.state = State::Disconnected;
    }

    async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = time::timeout(
            self.ctx.conf.dial_timeout,
            TcpStream::connect(self.addr),
        )
        .await??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state = State::Handshaking;
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        socket.send(handshake).await?;

        // receive peer's handshake
        let peer_handshake = time::timeout(
            self.ctx.conf.handshake_timeout,
            socket.next(),
        )
        .await?
        .ok_or(Error::Protocol("connection closed during handshake"))??;
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.ctx.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }

        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            reserved: merge_reserved(
                local_reserved(),
                peer_handshake.reserved,
            ),
        });

        // now that we have the handshake, switch to the peer message codec
        // (keeping the read buffer, as it may already hold frames the peer
        // sent right after its handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.run(socket).await
    }

    async fn start_inbound(
        &mut self,
        socket: TcpStream,
        read_buf: Vec<u8>,
        peer_id: PeerId,
        reserved: Reserved,
    ) -> Result<()> {
        log::info!("Peer {} connected to us", self.addr);
        self.peer_info = Some(PeerInfo {
            peer_id,
            reserved: merge_reserved(local_reserved(), reserved),
        });

        let mut parts = FramedParts::new(socket, PeerCodec);
        parts.read_buf = BytesMut::from(&read_buf[..]);
        let socket = Framed::from_parts(parts);

        self.run(socket).await
    }

    /// The main session loop: exchange of messages, commands from the
    /// torrent, timeout logic.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        self.state = State::Connected;
        if let Some(info) = &self.peer_info {
            log::info!(
                "Peer {} connected, id {:?}",
                self.addr,
                String::from_utf8_lossy(&info.peer_id)
            );
        }

        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        self.send_initial_messages(&mut sink).await?;
        // for torrents with known metadata the remote bitfield can be
        // interpreted right away
        self.init_pieces(&mut sink).await?;

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg.map_err(into_peer_error)?;
                    self.last_inbound = Instant::now();
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    self.handle_msg(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(&mut sink, cmd).await? {
                        log::info!("Shutting down peer {} session", self.addr);
                        break;
                    }
                }
                _ = tick.select_next_some() => {
                    if self.last_inbound.elapsed() >= self.ctx.conf.frame_idle {
                        return Err(Error::Timeout);
                    }
                    if self.last_outbound.elapsed()
                        >= self.ctx.conf.keep_alive_interval
                    {
                        self.send_msg(&mut sink, Message::KeepAlive).await?;
                    }
                }
            }
        }

        Ok(())
    }

    fn reserved(&self) -> Reserved {
        self.peer_info
            .as_ref()
            .map(|info| info.reserved)
            .unwrap_or_default()
    }

    async fn send_msg(&mut self, sink: &mut Sink, msg: Message) -> Result<()> {
        self.last_outbound = Instant::now();
        sink.send(msg).await.map_err(Error::from)
    }

    /// Sends the messages that immediately follow the handshake: our
    /// bitfield (when non-empty), our DHT port and the extended handshake
    /// (when both sides support them).
    async fn send_initial_messages(&mut self, sink: &mut Sink) -> Result<()> {
        let own = {
            let swarm = self.ctx.swarm.read().await;
            swarm
                .as_ref()
                .map(|swarm| swarm.scheduler.own_pieces().clone())
        };
        if let Some(own) = own {
            if own.count_ones() > 0 {
                self.send_msg(sink, Message::Bitfield(own)).await?;
            }
        }

        let reserved = self.reserved();
        if supports_dht(&reserved) {
            self.send_msg(sink, Message::Port(self.ctx.conf.dht_port))
                .await?;
        }
        if supports_extension_protocol(&reserved) {
            let metadata_size = self.ctx.metadata.read().await.size();
            let payload = ExtendedHandshake::local(
                self.ctx.conf.listen_port,
                metadata_size,
            )
            .encode()?;
            self.send_msg(sink, Message::Extended { id: 0, payload })
                .await?;
        }
        Ok(())
    }

    async fn handle_cmd(
        &mut self,
        sink: &mut Sink,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Have { piece_index } => {
                self.send_msg(sink, Message::Have { piece_index }).await?;
                // gaining a piece may end our interest in this peer
                self.update_interest(sink).await?;
            }
            Command::Cancel(block) => {
                if let Some(pos) = self
                    .outgoing_requests
                    .iter()
                    .position(|b| *b == block)
                {
                    self.outgoing_requests.remove(pos);
                    self.send_msg(sink, Message::Cancel(block)).await?;
                }
            }
            Command::MetadataReady => {
                self.init_pieces(sink).await?;
            }
            Command::Wake => {
                self.make_requests(sink).await?;
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Interprets any buffered pre-metadata bitfield/HAVEs once the piece
    /// count is known, and registers the peer's availability.
    async fn init_pieces(&mut self, sink: &mut Sink) -> Result<()> {
        if self.pieces.is_some() {
            return Ok(());
        }
        let piece_count = {
            let swarm = self.ctx.swarm.read().await;
            match swarm.as_ref() {
                Some(swarm) => swarm.piece_count,
                // still waiting for metadata
                None => return Ok(()),
            }
        };

        let mut pieces = match self.raw_bitfield.take() {
            Some(raw) => parse_bitfield(raw, piece_count)?,
            None => Bitfield::repeat(false, piece_count),
        };
        for index in std::mem::take(&mut self.raw_haves) {
            if index >= piece_count {
                return Err(Error::Protocol("have index out of range"));
            }
            pieces.set(index, true);
        }

        {
            let mut swarm = self.ctx.swarm.write().await;
            if let Some(swarm) = swarm.as_mut() {
                swarm.scheduler.peer_announced(&pieces);
            }
        }
        self.pieces = Some(pieces);

        self.update_interest(sink).await?;
        self.make_requests(sink).await
    }

    /// Handles a single frame of the peer message stream.
    async fn handle_msg(
        &mut self,
        sink: &mut Sink,
        msg: Message,
    ) -> Result<()> {
        // a bitfield is only valid as the very first frame
        let bitfield_was_allowed = self.bitfield_allowed;
        if !matches!(msg, Message::KeepAlive) {
            self.bitfield_allowed = false;
        }

        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                if !bitfield_was_allowed {
                    return Err(Error::Protocol(
                        "bitfield not first message",
                    ));
                }
                self.handle_bitfield_msg(sink, bitfield).await?;
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(sink, piece_index).await?;
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // since we're choked we don't expect the outstanding
                    // requests to be served; they return to the queue
                    self.outgoing_requests.clear();
                    let mut swarm = self.ctx.swarm.write().await;
                    if let Some(swarm) = swarm.as_mut() {
                        swarm.scheduler.cancel_peer(self.addr);
                    }
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline if we're interested
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    // permissive choke policy: anyone interested gets
                    // unchoked
                    if self.status.is_peer_choked {
                        self.status.is_peer_choked = false;
                        self.send_msg(sink, Message::Unchoke).await?;
                    }
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                    if !self.status.is_peer_choked {
                        self.status.is_peer_choked = true;
                        self.send_msg(sink, Message::Choke).await?;
                    }
                }
            }
            Message::Request(block) => {
                self.handle_request_msg(sink, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data).await?;
                // we may be able to make more requests now that a block
                // has arrived
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                // requests are served immediately, so there is no queue to
                // remove the request from
                log::debug!(
                    "Peer {} canceled block {:?}",
                    self.addr,
                    block
                );
            }
            Message::Port(port) => {
                let _ = self.ctx.cmd_chan.send(TorrentCommand::DhtPort {
                    addr: SocketAddr::new(self.addr.ip(), port),
                });
            }
            Message::Extended { id, payload } => {
                self.handle_extended_msg(sink, id, payload).await?;
            }
        }

        Ok(())
    }

    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut Sink,
        bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("Handling peer {} bitfield message", self.addr);
        let raw = bitfield.into_vec();

        let piece_count = {
            let swarm = self.ctx.swarm.read().await;
            swarm.as_ref().map(|swarm| swarm.piece_count)
        };
        match piece_count {
            Some(piece_count) => {
                let pieces = parse_bitfield(raw, piece_count)?;
                {
                    let mut swarm = self.ctx.swarm.write().await;
                    if let Some(swarm) = swarm.as_mut() {
                        // the previously registered bitfield is necessarily
                        // all zero here, so re-registering doesn't skew the
                        // availability counts
                        swarm.scheduler.peer_announced(&pieces);
                    }
                }
                self.pieces = Some(pieces);
                self.update_interest(sink).await?;
                self.make_requests(sink).await?;
            }
            None => {
                // no metadata yet: remember the raw bits for later
                self.raw_bitfield = Some(raw);
            }
        }
        Ok(())
    }

    async fn handle_have_msg(
        &mut self,
        sink: &mut Sink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        match &mut self.pieces {
            Some(pieces) => {
                if piece_index >= pieces.len() {
                    return Err(Error::Protocol("have index out of range"));
                }
                if !pieces[piece_index] {
                    pieces.set(piece_index, true);
                    let mut swarm = self.ctx.swarm.write().await;
                    if let Some(swarm) = swarm.as_mut() {
                        swarm.scheduler.peer_have(piece_index);
                    }
                }
                self.update_interest(sink).await?;
                if !self.status.is_choked {
                    self.make_requests(sink).await?;
                }
            }
            None => self.raw_haves.push(piece_index),
        }
        Ok(())
    }

    /// Serves a REQUEST frame from the piece cache or disk.
    async fn handle_request_msg(
        &mut self,
        sink: &mut Sink,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::info!(
                "Peer {} requested block while choked, ignoring",
                self.addr
            );
            return Ok(());
        }
        if block.len > self.ctx.conf.max_served_block_len {
            // refused, but not fatal
            log::warn!(
                "Peer {} requested oversized block of {} bytes",
                self.addr,
                block.len
            );
            return Ok(());
        }

        let (result_chan, result_port) = oneshot::channel();
        self.ctx.disk.read_block(self.ctx.id, block, result_chan)?;
        match result_port.await? {
            Ok(data) => {
                self.send_msg(
                    sink,
                    Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    },
                )
                .await?;
                // upload accounting happens in exactly one place: here,
                // when the piece message has been sent
                self.ctx.stats.uploaded.add(u64::from(block.len));
            }
            Err(ReadError::InvalidBlock) => {
                return Err(Error::Protocol("request out of range"));
            }
            Err(e) => {
                log::warn!(
                    "Cannot serve block {:?} to {}: {}",
                    block,
                    self.addr,
                    e
                );
                return Err(Error::Protocol("unservable block requested"));
            }
        }
        Ok(())
    }

    /// Verifies that the block was requested, registers it with the
    /// scheduler and passes the bytes on to the disk task.
    async fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block_info = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };

        if let Some(pos) = self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            self.outgoing_requests.remove(pos);
        }

        let received = {
            let mut swarm = self.ctx.swarm.write().await;
            match swarm.as_mut() {
                Some(swarm) => {
                    swarm.scheduler.received(self.addr, block_info)
                }
                None => return Ok(()),
            }
        };

        match received {
            crate::scheduler::ReceivedBlock::Accepted { cancels } => {
                self.ctx.stats.downloaded.add(u64::from(block_info.len));
                self.ctx.disk.write_block(
                    self.ctx.id,
                    block_info,
                    data,
                )?;
                if !cancels.is_empty() {
                    let _ = self.ctx.cmd_chan.send(
                        TorrentCommand::CancelDuplicates {
                            block: block_info,
                            peers: cancels,
                        },
                    );
                }
            }
            crate::scheduler::ReceivedBlock::Ignored => {
                // late arrival of a canceled or duplicate block
                log::debug!(
                    "Peer {} sent block {:?} we no longer expect",
                    self.addr,
                    block_info
                );
            }
        }
        Ok(())
    }

    async fn handle_extended_msg(
        &mut self,
        sink: &mut Sink,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        if id == 0 {
            let handshake = ExtendedHandshake::decode(&payload)?;
            log::debug!(
                "Peer {} extended handshake: {:?}",
                self.addr,
                handshake
            );
            self.remote_ut_metadata = handshake.ut_metadata_id();
            if let Some(size) = handshake.metadata_size {
                let mut metadata = self.ctx.metadata.write().await;
                if let MetadataState::Incomplete(download) = &mut *metadata {
                    if !download.set_size(size) {
                        log::warn!(
                            "Peer {} advertised conflicting metadata size",
                            self.addr
                        );
                    }
                }
            }
            self.maybe_request_metadata(sink).await?;
        } else if id == LOCAL_UT_METADATA_ID {
            self.handle_metadata_msg(sink, &payload).await?;
        } else {
            // unknown extension ids are not fatal
            log::info!(
                "Peer {} sent message for unknown extension {}",
                self.addr,
                id
            );
        }
        Ok(())
    }

    async fn handle_metadata_msg(
        &mut self,
        sink: &mut Sink,
        payload: &[u8],
    ) -> Result<()> {
        match MetadataMessage::decode(payload)? {
            MetadataMessage::Request { piece } => {
                let reply = {
                    let metadata = self.ctx.metadata.read().await;
                    match (&*metadata, self.remote_ut_metadata) {
                        (MetadataState::Complete(info), Some(_)) => {
                            match metadata_piece(info, piece) {
                                Some(data) => MetadataMessage::Data {
                                    piece,
                                    total_size: info.len() as u32,
                                    data: data.to_vec(),
                                },
                                None => MetadataMessage::Reject { piece },
                            }
                        }
                        _ => MetadataMessage::Reject { piece },
                    }
                };
                self.send_metadata_msg(sink, &reply).await?;
            }
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => {
                self.metadata_inflight = None;
                let complete_info = {
                    let mut metadata = self.ctx.metadata.write().await;
                    match &mut *metadata {
                        MetadataState::Incomplete(download) => {
                            if !download.set_size(total_size) {
                                log::warn!(
                                    "Peer {} sent conflicting metadata size",
                                    self.addr
                                );
                                return Ok(());
                            }
                            download.add_piece(piece, data);
                            if download.is_complete() {
                                download.assemble(&self.ctx.info_hash)
                            } else {
                                None
                            }
                        }
                        MetadataState::Complete(_) => return Ok(()),
                    }
                };
                match complete_info {
                    Some(info) => {
                        let _ = self.ctx.cmd_chan.send(
                            TorrentCommand::MetadataComplete { info },
                        );
                    }
                    None => self.maybe_request_metadata(sink).await?,
                }
            }
            MetadataMessage::Reject { piece } => {
                log::info!(
                    "Peer {} rejected metadata piece {}",
                    self.addr,
                    piece
                );
                self.metadata_inflight = None;
                self.metadata_rejected = true;
            }
        }
        Ok(())
    }

    async fn send_metadata_msg(
        &mut self,
        sink: &mut Sink,
        msg: &MetadataMessage,
    ) -> Result<()> {
        let remote_id = match self.remote_ut_metadata {
            Some(id) => id,
            None => return Ok(()),
        };
        let payload = msg.encode()?;
        self.send_msg(
            sink,
            Message::Extended {
                id: remote_id,
                payload,
            },
        )
        .await
    }

    /// Requests the next missing metadata piece from this peer, one at
    /// a time.
    async fn maybe_request_metadata(&mut self, sink: &mut Sink) -> Result<()> {
        if self.remote_ut_metadata.is_none()
            || self.metadata_inflight.is_some()
            || self.metadata_rejected
        {
            return Ok(());
        }
        let piece = {
            let metadata = self.ctx.metadata.read().await;
            match &*metadata {
                MetadataState::Incomplete(download)
                    if download.size_known() =>
                {
                    download.next_missing()
                }
                _ => None,
            }
        };
        if let Some(piece) = piece {
            log::debug!(
                "Requesting metadata piece {} from {}",
                piece,
                self.addr
            );
            self.metadata_inflight = Some(piece);
            self.send_metadata_msg(sink, &MetadataMessage::Request { piece })
                .await?;
        }
        Ok(())
    }

    /// Recomputes our interest in the peer after a bitfield change on
    /// either side and announces transitions.
    async fn update_interest(&mut self, sink: &mut Sink) -> Result<()> {
        let pieces = match &self.pieces {
            Some(pieces) => pieces,
            None => return Ok(()),
        };
        let is_interested = {
            let swarm = self.ctx.swarm.read().await;
            match swarm.as_ref() {
                Some(swarm) => !interest_set(
                    swarm.scheduler.own_pieces(),
                    pieces,
                )
                .is_empty(),
                None => return Ok(()),
            }
        };

        if is_interested && !self.status.is_interested {
            log::info!("Interested in peer {}", self.addr);
            self.status.is_interested = true;
            self.send_msg(sink, Message::Interested).await?;
        } else if !is_interested && self.status.is_interested {
            log::info!("No longer interested in peer {}", self.addr);
            self.status.is_interested = false;
            self.send_msg(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests from the scheduler.
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        let blocks = {
            let pieces = match &self.pieces {
                Some(pieces) => pieces,
                None => return Ok(()),
            };
            let mut swarm = self.ctx.swarm.write().await;
            match swarm.as_mut() {
                Some(swarm) => {
                    swarm.scheduler.request_blocks(self.addr, pieces)
                }
                None => return Ok(()),
            }
        };

        log::debug!(
            "Requesting {} blocks from peer {}",
            blocks.len(),
            self.addr
        );
        for block in blocks {
            self.outgoing_requests.push(block);
            self.send_msg(sink, Message::Request(block)).await?;
        }
        Ok(())
    }
}

/// Interprets wire bitfield bytes at the torrent's piece count, rejecting
/// wrong lengths and set padding bits.
fn parse_bitfield(raw: Vec<u8>, piece_count: usize) -> Result<Bitfield> {
    if raw.len() != (piece_count + 7) / 8 {
        return Err(Error::Protocol("bitfield length mismatch"));
    }
    let mut bitfield = Bitfield::from_vec(raw);
    if bitfield[piece_count..].count_ones() > 0 {
        return Err(Error::Protocol("bitfield padding bits set"));
    }
    bitfield.resize(piece_count, false);
    Ok(bitfield)
}

/// Maps the codec's IO errors: frame decoding problems are protocol
/// violations, everything else is transport trouble.
fn into_peer_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::InvalidData {
        Error::Protocol("malformed frame")
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bitfield() {
        // 11 pieces: two bytes on the wire, three padding bits
        let parsed = parse_bitfield(vec![0b1000_0001, 0b1010_0000], 11)
            .unwrap();
        assert_eq!(parsed.len(), 11);
        assert!(parsed[0]);
        assert!(parsed[7]);
        assert!(parsed[8]);
        assert!(parsed[10]);
        assert_eq!(parsed.count_ones(), 4);

        // oversize and undersize are protocol errors
        assert!(parse_bitfield(vec![0; 3], 11).is_err());
        assert!(parse_bitfield(vec![0; 1], 11).is_err());
        // set padding bits are a protocol error
        assert!(parse_bitfield(vec![0, 0b0001_0000], 11).is_err());
    }
}
