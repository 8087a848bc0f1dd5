//! The peer connection: a byte-level protocol state machine over one stream
//! socket.
//!
//! A connection starts in the handshake phase, either as the plaintext
//! BitTorrent handshake or as the obfuscated MSE exchange, both driven
//! purely by received byte counts. Once the handshakes complete the
//! connection settles into the message phase: length-prefixed frames
//! dispatched through a handler table indexed by message id.
//!
//! Each connection runs as its own task. It receives commands from the
//! session (choke toggles, disk read results, shutdown) on an mpsc channel
//! and reports back on the session's event channel. All sends go through a
//! single send buffer that tracks payload byte ranges, so upload statistics
//! split protocol chatter from piece payload exactly, regardless of how the
//! socket fragments writes.

pub(crate) mod codec;
pub(crate) mod crypto;
pub(crate) mod extension;

use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    bytes::{Buf, BytesMut},
    futures::{pin_mut, select, stream::Fuse, FutureExt, StreamExt},
    rand::Rng,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time,
    },
    tokio_util::codec::{Decoder, Encoder},
};

use {
    crate::{
        cache::ReadBuf,
        conf::{EncPolicy, EncryptionConf, NetworkConf},
        disk::DiskHandle,
        error::{DisconnectReason, Error, Operation, Result},
        piece_picker::PieceDownload,
        torrent::TorrentCtx,
        Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
        BLOCK_LEN,
    },
    codec::{Handshake, HandshakeCodec, Message, MessageId, PeerCodec},
    extension::{ext_id, ExtendedHandshake, PeerExtensions},
};

pub(crate) use extension::Holepunch;

/// Identifies a live connection within the session.
pub(crate) type ConnectionId = usize;

/// The channel on which the session sends commands to a peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The channel on which peer session tasks report events to the session.
pub(crate) type EventSender = UnboundedSender<Event>;
pub(crate) type EventReceiver = UnboundedReceiver<Event>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// A block the disk task read for one of the peer's requests.
    Block { info: BlockInfo, data: ReadBuf },
    /// The disk couldn't serve the peer's request; reject it.
    RejectRequest(BlockInfo),
    /// Stop letting the peer download.
    Choke,
    /// Let the peer download.
    Unchoke,
    /// Announce a freshly verified piece to the peer.
    NewPiece(PieceIndex),
    /// Additional send allowance from the bandwidth manager.
    BandwidthGrant(usize),
    /// Relay a holepunch message to the peer.
    SendHolepunch(Holepunch),
    /// Disconnect with the given reason.
    Shutdown(DisconnectReason),
}

/// The events a peer session reports to the session.
#[derive(Debug)]
pub(crate) enum Event {
    /// The handshakes completed.
    Connected {
        conn_id: ConnectionId,
        torrent_id: TorrentId,
        addr: SocketAddr,
        peer_id: PeerId,
        /// Whether RC4 payload encryption was negotiated.
        encrypted: bool,
        /// Whether the peer advertised the hybrid v2 capability.
        v2: bool,
    },
    /// The peer's interest in downloading from us changed.
    Interest {
        conn_id: ConnectionId,
        is_peer_interested: bool,
    },
    /// Periodic status snapshot for the unchoke scheduler and counters.
    Status {
        conn_id: ConnectionId,
        snapshot: Box<StatusSnapshot>,
    },
    /// The peer told us our external address (a `yourip` vote).
    YourIp { conn_id: ConnectionId, ip: IpAddr },
    /// The peer asks to be introduced to the target peer.
    HolepunchRendezvous {
        conn_id: ConnectionId,
        target: SocketAddr,
    },
    /// A relay instructed us to connect to this endpoint.
    HolepunchConnect {
        conn_id: ConnectionId,
        addr: SocketAddr,
    },
    /// The peer needs more send allowance.
    BandwidthRequest {
        conn_id: ConnectionId,
        amount: usize,
    },
    /// The connection ended. Always the session task's last event.
    Disconnected {
        conn_id: ConnectionId,
        addr: SocketAddr,
        reason: DisconnectReason,
        op: Operation,
    },
}

/// One more than the highest message id.
pub(crate) const NUM_MESSAGE_IDS: usize = 24;

/// A per-tick snapshot of the fields the session needs from a connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StatusSnapshot {
    pub is_peer_interested: bool,
    pub is_peer_choked: bool,
    /// Payload bytes per second, averaged over the last tick.
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Whether the peer has every piece.
    pub is_seed: bool,
    /// Lifetime payload and protocol byte totals.
    pub downloaded_payload: u64,
    pub uploaded_payload: u64,
    pub downloaded_protocol: u64,
    pub uploaded_protocol: u64,
    /// Per message type receive and send counts, indexed by message id.
    pub msgs_received: [u64; NUM_MESSAGE_IDS],
    pub msgs_sent: [u64; NUM_MESSAGE_IDS],
}

/// Whether the connection was initiated by us or by the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

/// What the socket is backed by; i2p streams get a longer handshake grace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SocketKind {
    Tcp,
    I2p,
}

/// The wire read state. Transitions are driven by received byte counts,
/// never by time alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// The leading 20 bytes: length prefix plus protocol string.
    ReadProtocolId,
    /// The reserved bits and the info hash.
    ReadInfoHash,
    ReadPeerId,
    /// The peer's 96 byte DH public key.
    ReadPeDhkey,
    /// Responder: scanning for SHA1('req1', S).
    ReadPeSynchash,
    /// Responder: the obfuscated info hash and the verification constant.
    ReadPeSkeyVc,
    /// crypto_provide/select plus the pad length.
    ReadPeCryptofield,
    /// The pad (and, as responder, the initial-payload length after it).
    ReadPePad,
    /// Responder: the encrypted initial payload (the BT handshake).
    ReadPeIa,
    /// Initiator: scanning for the encrypted verification constant.
    ReadPeSyncVc,
    /// Message phase: waiting for a length prefix.
    ReadPacketSize,
    /// Message phase: waiting for the frame body.
    ReadPacket,
}

/// Transfer statistics and the four choke/interest flags.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// Peer doesn't let us download.
    is_choked: bool,
    /// We want to download from peer.
    is_interested: bool,
    /// We don't let the peer download.
    is_peer_choked: bool,
    /// Peer wants to download from us.
    is_peer_interested: bool,
    downloaded_payload: u64,
    uploaded_payload: u64,
    downloaded_protocol: u64,
    uploaded_protocol: u64,
    /// Rates over the previous tick.
    download_rate: u64,
    upload_rate: u64,
    prev_downloaded_payload: u64,
    prev_uploaded_payload: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            downloaded_payload: 0,
            uploaded_payload: 0,
            downloaded_protocol: 0,
            uploaded_protocol: 0,
            download_rate: 0,
            upload_rate: 0,
            prev_downloaded_payload: 0,
            prev_uploaded_payload: 0,
        }
    }
}

/// Information about the peer, set once the reserved bits arrive.
struct PeerInfo {
    peer_id: PeerId,
    pieces: Bitfield,
    supports_fast: bool,
    supports_extensions: bool,
    supports_dht: bool,
    supports_v2: bool,
    /// The peer's registered extension sub-ids.
    extensions: PeerExtensions,
    /// The peer's advertised DHT port, if it sent one.
    dht_port: Option<u16>,
    /// Whether the peer has announced itself a seed.
    is_seed: bool,
    /// Set once any piece-availability message arrived; a bitfield after
    /// that is a protocol error.
    availability_received: bool,
}

/// How the session exposes torrent resolution to inbound connections.
pub(crate) trait TorrentLookup: Send + Sync {
    /// Resolves a plaintext info hash.
    fn find(&self, info_hash: &Sha1Hash) -> Option<TorrentCtx>;
    /// Resolves SHA1('req2', info_hash), the MSE obfuscated form.
    fn find_obfuscated(&self, obfuscated: &Sha1Hash) -> Option<TorrentCtx>;
}

/// An empty lookup for outbound connections, which know their torrent up
/// front.
struct NoLookup;

impl TorrentLookup for NoLookup {
    fn find(&self, _: &Sha1Hash) -> Option<TorrentCtx> {
        None
    }
    fn find_obfuscated(&self, _: &Sha1Hash) -> Option<TorrentCtx> {
        None
    }
}

type MsgHandler = fn(&mut PeerSession, Message) -> Result<()>;

/// The handler table: one fixed-signature handler per message id. Holes are
/// ids the protocol never assigned.
const MESSAGE_HANDLERS: [Option<MsgHandler>; NUM_MESSAGE_IDS] = [
    Some(PeerSession::on_choke),          // 0
    Some(PeerSession::on_unchoke),        // 1
    Some(PeerSession::on_interested),     // 2
    Some(PeerSession::on_not_interested), // 3
    Some(PeerSession::on_have),           // 4
    Some(PeerSession::on_bitfield),       // 5
    Some(PeerSession::on_request),        // 6
    Some(PeerSession::on_piece),          // 7
    Some(PeerSession::on_cancel),         // 8
    Some(PeerSession::on_dht_port),       // 9
    None,                                 // 10
    None,                                 // 11
    None,                                 // 12
    Some(PeerSession::on_suggest),        // 13
    Some(PeerSession::on_have_all),       // 14
    Some(PeerSession::on_have_none),      // 15
    Some(PeerSession::on_reject_request), // 16
    Some(PeerSession::on_allowed_fast),   // 17
    None,                                 // 18
    None,                                 // 19
    Some(PeerSession::on_extended),       // 20
    Some(PeerSession::on_hash_request),   // 21
    Some(PeerSession::on_hashes),         // 22
    Some(PeerSession::on_hash_reject),    // 23
];

pub(crate) struct PeerSession {
    /// The torrent the connection belongs to. Inbound connections resolve
    /// it during the handshake.
    torrent: Option<TorrentCtx>,
    /// Resolves info hashes to torrents for inbound connections.
    lookup: Arc<dyn TorrentLookup>,
    disk: DiskHandle,
    events: EventSender,
    cmd_port: Fuse<Receiver>,
    /// A clone of our own command channel, handed to the disk task so read
    /// results come back to us.
    reply_chan: Sender,
    conn_id: ConnectionId,
    addr: SocketAddr,
    direction: Direction,
    socket_kind: SocketKind,
    encryption: EncryptionConf,
    network: NetworkConf,
    user_agent: String,
    /// Whether this outbound attempt starts with the obfuscated handshake.
    try_encrypted: bool,

    state: State,
    status: Status,
    peer_info: Option<PeerInfo>,
    is_disconnecting: bool,
    sent_handshake: bool,

    // buffers
    recv_buf: BytesMut,
    send_buf: BytesMut,
    /// Absolute stream offsets of payload bytes in the send buffer.
    payload_ranges: VecDeque<(u64, u64)>,
    /// Bytes ever queued into, and drained out of, the send buffer.
    queued_offset: u64,
    sent_offset: u64,
    /// Bytes we may currently write, granted by the bandwidth manager.
    send_quota: usize,
    bandwidth_requested: bool,

    // encryption
    dh: Option<crypto::DhKeyExchange>,
    secret: Option<[u8; crypto::DH_KEY_LEN]>,
    rc4: Option<crypto::Rc4Pair>,
    /// Incoming bytes are RC4 once the streams are synced.
    recv_encrypted: bool,
    /// The negotiated payload encryption.
    rc4_encrypted: bool,
    crypto_select: Option<u32>,
    pe_pad_len: usize,
    pe_ia_len: usize,

    // request pipeline
    /// Requests we sent, each with its monotonic sequence number.
    outgoing_requests: Vec<(u64, BlockInfo)>,
    next_request_seq: u64,
    /// Requests the peer sent us, not yet served.
    incoming_requests: VecDeque<BlockInfo>,
    /// The pieces the peer granted us via allowed_fast.
    allowed_fast_in: Vec<PieceIndex>,
    /// The pipeline depth towards this peer; lowered by the peer's `reqq`.
    request_queue_cap: usize,
    downloads: Vec<PieceDownload>,

    // timeouts and stats
    connected_at: Instant,
    last_send: Instant,
    last_recv: Instant,
    last_incoming_block: Instant,
    msgs_received: [u64; NUM_MESSAGE_IDS],
    msgs_sent: [u64; NUM_MESSAGE_IDS],
}

/// What woke the connection loop up.
enum Turn {
    Read(Result<usize>),
    Cmd(Option<Command>),
    Tick,
}

impl PeerSession {
    /// Creates a new outbound session towards the peer at the given
    /// address. `try_encrypted` reflects the outgoing encryption policy and
    /// the peer record's `pe_support` flag.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        torrent: TorrentCtx,
        disk: DiskHandle,
        events: EventSender,
        conn_id: ConnectionId,
        addr: SocketAddr,
        encryption: EncryptionConf,
        network: NetworkConf,
        user_agent: String,
        try_encrypted: bool,
    ) -> (Self, Sender) {
        Self::new(
            Some(torrent),
            Arc::new(NoLookup),
            disk,
            events,
            conn_id,
            addr,
            Direction::Outbound,
            encryption,
            network,
            user_agent,
            try_encrypted,
        )
    }

    /// Creates a session for an accepted socket. The torrent is resolved
    /// from the info hash (possibly obfuscated) the peer sends.
    #[allow(clippy::too_many_arguments)]
    pub fn inbound(
        lookup: Arc<dyn TorrentLookup>,
        disk: DiskHandle,
        events: EventSender,
        conn_id: ConnectionId,
        addr: SocketAddr,
        encryption: EncryptionConf,
        network: NetworkConf,
        user_agent: String,
    ) -> (Self, Sender) {
        Self::new(
            None,
            lookup,
            disk,
            events,
            conn_id,
            addr,
            Direction::Inbound,
            encryption,
            network,
            user_agent,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        torrent: Option<TorrentCtx>,
        lookup: Arc<dyn TorrentLookup>,
        disk: DiskHandle,
        events: EventSender,
        conn_id: ConnectionId,
        addr: SocketAddr,
        direction: Direction,
        encryption: EncryptionConf,
        network: NetworkConf,
        user_agent: String,
        try_encrypted: bool,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let now = Instant::now();
        let request_queue_cap = network.max_out_request_queue;
        let session = Self {
            torrent,
            lookup,
            disk,
            events,
            cmd_port: cmd_port.fuse(),
            reply_chan: cmd_chan.clone(),
            conn_id,
            addr,
            direction,
            socket_kind: SocketKind::Tcp,
            encryption,
            network,
            user_agent,
            try_encrypted,
            state: State::ReadProtocolId,
            status: Status::default(),
            peer_info: None,
            is_disconnecting: false,
            sent_handshake: false,
            recv_buf: BytesMut::with_capacity(4096),
            send_buf: BytesMut::with_capacity(4096),
            payload_ranges: VecDeque::new(),
            queued_offset: 0,
            sent_offset: 0,
            // enough to get the handshakes out before the first grant
            send_quota: 0x8000,
            bandwidth_requested: false,
            dh: None,
            secret: None,
            rc4: None,
            recv_encrypted: false,
            rc4_encrypted: false,
            crypto_select: None,
            pe_pad_len: 0,
            pe_ia_len: 0,
            outgoing_requests: Vec::new(),
            next_request_seq: 0,
            incoming_requests: VecDeque::new(),
            allowed_fast_in: Vec::new(),
            request_queue_cap,
            downloads: Vec::new(),
            connected_at: now,
            last_send: now,
            last_recv: now,
            last_incoming_block: now,
            msgs_received: [0; NUM_MESSAGE_IDS],
            msgs_sent: [0; NUM_MESSAGE_IDS],
        };
        (session, cmd_chan)
    }

    /// Starts an outbound session: connects, writes the opening volley and
    /// runs until disconnected.
    pub async fn start_outbound(&mut self) {
        log::info!("Connecting to peer {}", self.addr);
        let socket = match TcpStream::connect(self.addr).await {
            Ok(socket) => socket,
            Err(e) => {
                log::info!("Failed to connect to peer {}: {}", self.addr, e);
                self.send_disconnected(
                    DisconnectReason::PeerError,
                    Operation::Connect,
                );
                return;
            }
        };
        log::info!("Connected to peer {}", self.addr);
        self.connected_at = Instant::now();
        let result = self.run(socket).await;
        self.finish(result);
    }

    /// Starts a session on an accepted socket.
    pub async fn start_inbound(&mut self, socket: TcpStream) {
        log::info!("Accepted connection from peer {}", self.addr);
        self.connected_at = Instant::now();
        let result = self.run(socket).await;
        self.finish(result);
    }

    /// The main connection loop: write the opening volley, then interleave
    /// socket reads, command handling and the per-second tick until the
    /// connection ends.
    async fn run(&mut self, mut socket: TcpStream) -> Result<()> {
        match self.direction {
            Direction::Outbound => {
                if self.try_encrypted
                    && self.encryption.out_enc_policy != EncPolicy::Disabled
                {
                    self.write_pe1_2_dhkey();
                    self.state = State::ReadPeDhkey;
                } else {
                    self.write_handshake();
                    self.state = State::ReadProtocolId;
                }
            }
            Direction::Inbound => {
                self.state = State::ReadProtocolId;
            }
        }
        self.flush(&mut socket).await?;

        let mut tick = time::interval(Duration::from_secs(1)).fuse();
        loop {
            if self.is_disconnecting {
                return Ok(());
            }

            let turn = {
                let read_fut =
                    read_some(&mut socket, &mut self.recv_buf);
                pin_mut!(read_fut);
                let mut read_fut = read_fut.fuse();
                select! {
                    read = read_fut => Turn::Read(read),
                    cmd = self.cmd_port.next() => Turn::Cmd(cmd),
                    _ = tick.select_next_some() => Turn::Tick,
                }
            };

            match turn {
                Turn::Read(read) => {
                    let read = read?;
                    let read_start = self.recv_buf.len() - read;
                    self.on_receive(read_start)?;
                }
                Turn::Cmd(Some(cmd)) => self.handle_command(cmd)?,
                // every command sender is gone; nothing can drive us
                Turn::Cmd(None) => {
                    return Err(Error::disconnect(
                        DisconnectReason::TorrentRemoved,
                        Operation::Bittorrent,
                    ));
                }
                Turn::Tick => self.tick()?,
            }

            self.flush(&mut socket).await?;
        }
    }

    fn finish(&mut self, result: Result<()>) {
        // return any blocks we were still downloading to the picker
        if let Some(torrent) = &self.torrent {
            let mut picker = torrent
                .piece_picker
                .write()
                .expect("piece picker poisoned");
            for download in &self.downloads {
                picker.unpick_piece(download.piece_index());
            }
        }
        let (reason, op) = match result {
            Ok(()) => (DisconnectReason::PeerError, Operation::Receive),
            Err(Error::Disconnect { reason, op }) => (reason, op),
            Err(Error::Io(_)) => {
                (DisconnectReason::PeerError, Operation::Receive)
            }
            Err(_) => (DisconnectReason::PeerError, Operation::Bittorrent),
        };
        self.send_disconnected(reason, op);
    }

    fn send_disconnected(&self, reason: DisconnectReason, op: Operation) {
        log::info!(
            "Peer {} disconnected ({}) during {}",
            self.addr,
            reason,
            op
        );
        let _ = self.events.send(Event::Disconnected {
            conn_id: self.conn_id,
            addr: self.addr,
            reason,
            op,
        });
    }

    fn torrent(&self) -> TorrentCtx {
        self.torrent.clone().expect("torrent not resolved yet")
    }

    /// Marks the connection as backed by an i2p stream, which stretches the
    /// handshake timeout.
    #[allow(dead_code)]
    pub fn set_socket_kind(&mut self, kind: SocketKind) {
        self.socket_kind = kind;
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// Runs the wire state machine over whatever is buffered. `read_start`
    /// is the offset of the bytes that just arrived, so they can be
    /// decrypted in place when the incoming stream is RC4.
    fn on_receive(&mut self, read_start: usize) -> Result<()> {
        if self.recv_encrypted {
            if let Some(rc4) = &mut self.rc4 {
                rc4.incoming
                    .apply_keystream(&mut self.recv_buf[read_start..]);
            }
        }
        self.last_recv = Instant::now();

        loop {
            let before = (self.state, self.recv_buf.len());
            match self.state {
                State::ReadProtocolId => self.read_protocol_id()?,
                State::ReadInfoHash => self.read_info_hash()?,
                State::ReadPeerId => self.read_peer_id()?,
                State::ReadPeDhkey => self.read_pe_dhkey()?,
                State::ReadPeSynchash => self.read_pe_synchash()?,
                State::ReadPeSkeyVc => self.read_pe_skey_vc()?,
                State::ReadPeCryptofield => self.read_pe_cryptofield()?,
                State::ReadPePad => self.read_pe_pad()?,
                State::ReadPeIa => self.read_pe_ia()?,
                State::ReadPeSyncVc => self.read_pe_syncvc()?,
                State::ReadPacketSize | State::ReadPacket => {
                    self.read_messages()?
                }
            }
            // neither bytes consumed nor state advanced: wait for more
            if (self.state, self.recv_buf.len()) == before {
                return Ok(());
            }
        }
    }

    fn read_protocol_id(&mut self) -> Result<()> {
        if self.recv_buf.len() < 20 {
            return Ok(());
        }
        let is_plaintext = self.recv_buf[0] as usize
            == codec::PROTOCOL_STRING.len()
            && &self.recv_buf[1..20] == codec::PROTOCOL_STRING.as_bytes();

        if is_plaintext {
            if self.direction == Direction::Inbound
                && self.encryption.in_enc_policy == EncPolicy::Forced
                && !self.recv_encrypted
                && !self.rc4_encrypted
                && self.crypto_select.is_none()
            {
                return Err(Error::disconnect(
                    DisconnectReason::NoIncomingRegular,
                    Operation::Handshake,
                ));
            }
            self.recv_buf.advance(20);
            self.state = State::ReadInfoHash;
            return Ok(());
        }

        // not a BitTorrent handshake: if policy allows, assume these bytes
        // are the start of a DH public key and take the encrypted path
        if self.direction == Direction::Inbound
            && self.encryption.in_enc_policy != EncPolicy::Disabled
            && self.crypto_select.is_none()
        {
            self.state = State::ReadPeDhkey;
            return Ok(());
        }
        Err(Error::disconnect(
            DisconnectReason::InvalidMessage,
            Operation::Handshake,
        ))
    }

    fn read_info_hash(&mut self) -> Result<()> {
        // 8 reserved bytes and the 20 byte info hash
        if self.recv_buf.len() < 28 {
            return Ok(());
        }
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&self.recv_buf[..8]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&self.recv_buf[8..28]);
        self.recv_buf.advance(28);

        match &self.torrent {
            Some(torrent) => {
                // the peer must name the torrent this connection is for
                if info_hash != torrent.shared.info_hash {
                    return Err(Error::disconnect(
                        DisconnectReason::InvalidInfoHash,
                        Operation::Handshake,
                    ));
                }
            }
            None => {
                let torrent =
                    self.lookup.find(&info_hash).ok_or_else(|| {
                        Error::disconnect(
                            DisconnectReason::InvalidInfoHash,
                            Operation::Handshake,
                        )
                    })?;
                self.torrent = Some(torrent);
            }
        }
        // the responder replies once it knows the torrent
        if self.direction == Direction::Inbound && !self.sent_handshake {
            self.write_handshake();
        }

        self.init_peer_capabilities(reserved);
        self.state = State::ReadPeerId;
        Ok(())
    }

    fn init_peer_capabilities(&mut self, reserved: [u8; 8]) {
        let piece_count = self.torrent().shared.storage.piece_count;
        let mut pieces = Bitfield::with_capacity(piece_count);
        pieces.resize(piece_count, false);
        let supports_extensions = reserved[5] & 0x10 != 0;
        let supports_dht = reserved[7] & 0x01 != 0;
        let supports_fast = reserved[7] & 0x04 != 0;
        let supports_v2 = reserved[7] & 0x10 != 0;
        log::debug!(
            "Peer {} capabilities:{}{}{}{}",
            self.addr,
            if supports_fast { " fast" } else { "" },
            if supports_extensions { " extensions" } else { "" },
            if supports_dht { " dht" } else { "" },
            if supports_v2 { " v2" } else { "" },
        );
        self.peer_info = Some(PeerInfo {
            peer_id: [0; 20],
            pieces,
            supports_fast,
            supports_extensions,
            supports_dht,
            supports_v2,
            extensions: PeerExtensions::default(),
            dht_port: None,
            is_seed: false,
            availability_received: false,
        });
    }

    fn read_peer_id(&mut self) -> Result<()> {
        if self.recv_buf.len() < 20 {
            return Ok(());
        }
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&self.recv_buf[..20]);
        self.recv_buf.advance(20);

        if peer_id == self.torrent().shared.client_id {
            return Err(Error::disconnect(
                DisconnectReason::SelfConnection,
                Operation::Handshake,
            ));
        }
        let info = self.peer_info.as_mut().expect("peer info not set");
        info.peer_id = peer_id;

        log::info!("Peer {} handshake complete", self.addr);
        self.complete_handshake()
    }

    /// Runs once both handshakes are done: announces piece availability
    /// (exactly one of bitfield, have_all, have_none), negotiates
    /// extensions and enters the message phase.
    fn complete_handshake(&mut self) -> Result<()> {
        let torrent = self.torrent();
        let own_pieces = torrent
            .piece_picker
            .read()
            .expect("piece picker poisoned")
            .own_pieces()
            .clone();
        let info = self.peer_info.as_ref().unwrap();
        let supports_fast = info.supports_fast;
        let supports_extensions = info.supports_extensions;
        let supports_v2 = info.supports_v2;
        let peer_id = info.peer_id;

        if supports_fast {
            if own_pieces.all() {
                self.write_have_all();
            } else if own_pieces.not_any() {
                self.write_have_none();
            } else {
                self.write_bitfield(&own_pieces);
            }
        } else {
            self.write_bitfield(&own_pieces);
        }

        if supports_extensions {
            self.write_extensions();
        }

        let _ = self.events.send(Event::Connected {
            conn_id: self.conn_id,
            torrent_id: torrent.shared.id,
            addr: self.addr,
            peer_id,
            encrypted: self.rc4_encrypted,
            v2: supports_v2,
        });

        self.state = State::ReadPacketSize;
        Ok(())
    }

    // ------------------------------------------------------------------
    // the encrypted (MSE) handshake
    // ------------------------------------------------------------------

    /// Legs 1 and 2 are symmetric: a DH public key followed by random pad.
    fn write_pe1_2_dhkey(&mut self) {
        let mut rng = rand::thread_rng();
        let dh = crypto::DhKeyExchange::new(&mut rng);
        let mut msg =
            Vec::with_capacity(crypto::DH_KEY_LEN + crypto::MAX_PAD_LEN);
        msg.extend_from_slice(dh.public_key());
        let pad_len = rng.gen_range(0..crypto::MAX_PAD_LEN);
        let mut pad = vec![0u8; pad_len];
        rng.fill(&mut pad[..]);
        msg.extend_from_slice(&pad);
        self.dh = Some(dh);
        log::debug!("Peer {} starting DH key exchange", self.addr);
        self.write_raw(&msg);
    }

    fn read_pe_dhkey(&mut self) -> Result<()> {
        if self.recv_buf.len() < crypto::DH_KEY_LEN {
            return Ok(());
        }
        let dh = match self.dh.take() {
            Some(dh) => dh,
            // inbound: we only generate our pair once the initiator's key
            // arrived
            None => crypto::DhKeyExchange::new(&mut rand::thread_rng()),
        };
        let secret =
            dh.compute_secret(&self.recv_buf[..crypto::DH_KEY_LEN]);
        self.recv_buf.advance(crypto::DH_KEY_LEN);
        self.secret = Some(secret);

        match self.direction {
            Direction::Inbound => {
                let mut rng = rand::thread_rng();
                let mut msg = Vec::with_capacity(
                    crypto::DH_KEY_LEN + crypto::MAX_PAD_LEN,
                );
                msg.extend_from_slice(dh.public_key());
                let pad_len = rng.gen_range(0..crypto::MAX_PAD_LEN);
                let mut pad = vec![0u8; pad_len];
                rng.fill(&mut pad[..]);
                msg.extend_from_slice(&pad);
                self.write_raw(&msg);
                self.state = State::ReadPeSynchash;
            }
            Direction::Outbound => {
                self.write_pe3_sync();
                self.state = State::ReadPeSyncVc;
            }
        }
        Ok(())
    }

    /// Leg 3: sync hash, obfuscated info hash, and the encrypted crypto
    /// proposal plus the initial payload (our BT handshake).
    fn write_pe3_sync(&mut self) {
        let secret = self.secret.expect("no DH secret");
        let torrent = self.torrent();
        let info_hash = torrent.shared.info_hash;

        let mut rc4 = crypto::rc4_pair(&secret, &info_hash, true);
        let mut rng = rand::thread_rng();

        let mut msg = Vec::with_capacity(
            40 + 8 + 4 + 2 + crypto::MAX_PAD_LEN + 2 + codec::HANDSHAKE_LEN,
        );
        msg.extend_from_slice(&crypto::req1_hash(&secret));
        msg.extend_from_slice(&crypto::obfuscated_info_hash(
            &info_hash, &secret,
        ));

        let crypto_provide = match self.encryption.allowed_enc_level {
            crate::conf::EncLevel::Plaintext => crypto::CRYPTO_PLAINTEXT,
            crate::conf::EncLevel::Rc4 => crypto::CRYPTO_RC4,
            crate::conf::EncLevel::Both => {
                crypto::CRYPTO_PLAINTEXT | crypto::CRYPTO_RC4
            }
        };
        let pad_len = rng.gen_range(0..crypto::MAX_PAD_LEN);
        let mut tail = Vec::with_capacity(
            8 + 4 + 2 + pad_len + 2 + codec::HANDSHAKE_LEN,
        );
        tail.extend_from_slice(&crypto::VC);
        tail.extend_from_slice(&crypto_provide.to_be_bytes());
        tail.extend_from_slice(&(pad_len as u16).to_be_bytes());
        let mut pad = vec![0u8; pad_len];
        rng.fill(&mut pad[..]);
        tail.extend_from_slice(&pad);
        tail.extend_from_slice(&(codec::HANDSHAKE_LEN as u16).to_be_bytes());

        // the initial payload is our BT handshake
        let handshake =
            Handshake::new(info_hash, torrent.shared.client_id);
        let mut hs_buf = BytesMut::new();
        handshake.encode(&mut hs_buf);
        tail.extend_from_slice(&hs_buf);
        self.sent_handshake = true;

        rc4.outgoing.apply_keystream(&mut tail);
        msg.extend_from_slice(&tail);

        self.rc4 = Some(rc4);
        self.write_raw(&msg);
        log::debug!("Peer {} sent encrypted handshake", self.addr);
    }

    /// Responder: scan the raw stream for SHA1('req1', S).
    fn read_pe_synchash(&mut self) -> Result<()> {
        let secret = self.secret.expect("no DH secret");
        let hash = crypto::req1_hash(&secret);
        match crypto::find(&self.recv_buf, &hash) {
            Some(pos) => {
                self.recv_buf.advance(pos + hash.len());
                self.state = State::ReadPeSkeyVc;
                Ok(())
            }
            None if self.recv_buf.len()
                > crypto::MAX_PAD_LEN + hash.len() =>
            {
                Err(Error::disconnect(
                    DisconnectReason::UnsupportedEncryptionMode,
                    Operation::Encryption,
                ))
            }
            None => Ok(()),
        }
    }

    /// Responder: the obfuscated info hash identifies the torrent, then the
    /// verification constant proves key agreement.
    fn read_pe_skey_vc(&mut self) -> Result<()> {
        if self.recv_buf.len() < 28 {
            return Ok(());
        }
        let secret = self.secret.expect("no DH secret");

        let mut obfuscated = [0; 20];
        obfuscated.copy_from_slice(&self.recv_buf[..20]);
        // strip SHA1('req3', S) to recover SHA1('req2', info_hash)
        let req3 = crypto::req3_hash(&secret);
        for (b, r) in obfuscated.iter_mut().zip(req3.iter()) {
            *b ^= r;
        }
        let torrent =
            self.lookup.find_obfuscated(&obfuscated).ok_or_else(|| {
                Error::disconnect(
                    DisconnectReason::InvalidInfoHash,
                    Operation::Encryption,
                )
            })?;
        let info_hash = torrent.shared.info_hash;
        self.torrent = Some(torrent);
        self.recv_buf.advance(20);

        // the RC4 streams start right at the verification constant
        let mut rc4 = crypto::rc4_pair(&secret, &info_hash, false);
        let mut vc = [0; 8];
        vc.copy_from_slice(&self.recv_buf[..8]);
        rc4.incoming.apply_keystream(&mut vc);
        if vc != crypto::VC {
            return Err(Error::disconnect(
                DisconnectReason::UnsupportedEncryptionMode,
                Operation::Encryption,
            ));
        }
        self.recv_buf.advance(8);
        // decrypt whatever arrived beyond the vc, and everything after
        rc4.incoming.apply_keystream(&mut self.recv_buf[..]);
        self.rc4 = Some(rc4);
        self.recv_encrypted = true;
        self.state = State::ReadPeCryptofield;
        Ok(())
    }

    /// Both sides: crypto_provide (responder reading the initiator) or
    /// crypto_select (initiator reading the responder), plus the pad
    /// length.
    fn read_pe_cryptofield(&mut self) -> Result<()> {
        if self.recv_buf.len() < 6 {
            return Ok(());
        }
        let mut field = [0; 4];
        field.copy_from_slice(&self.recv_buf[..4]);
        let crypto_field = u32::from_be_bytes(field);
        let mut len = [0; 2];
        len.copy_from_slice(&self.recv_buf[4..6]);
        self.pe_pad_len = u16::from_be_bytes(len) as usize;
        self.recv_buf.advance(6);
        if self.pe_pad_len >= crypto::MAX_PAD_LEN {
            return Err(Error::disconnect(
                DisconnectReason::UnsupportedEncryptionMode,
                Operation::Encryption,
            ));
        }

        match self.direction {
            Direction::Inbound => {
                // the initiator's proposal; pick one and reply
                let select = crypto::select_crypto(
                    crypto_field,
                    self.encryption.allowed_enc_level,
                    self.encryption.prefer_rc4,
                )
                .ok_or_else(|| {
                    Error::disconnect(
                        DisconnectReason::UnsupportedEncryptionMode,
                        Operation::Encryption,
                    )
                })?;
                self.crypto_select = Some(select);
                self.write_pe4_sync(select);
            }
            Direction::Outbound => {
                // the responder's selection: exactly one bit, and one we
                // allow
                let acceptable = crypto::select_crypto(
                    crypto_field,
                    self.encryption.allowed_enc_level,
                    self.encryption.prefer_rc4,
                );
                if crypto_field.count_ones() != 1 || acceptable.is_none() {
                    return Err(Error::disconnect(
                        DisconnectReason::UnsupportedEncryptionMode,
                        Operation::Encryption,
                    ));
                }
                self.crypto_select = Some(crypto_field);
            }
        }
        self.state = State::ReadPePad;
        Ok(())
    }

    /// Responder leg 4: vc, crypto_select, pad, RC4 from the start of our
    /// outgoing stream.
    fn write_pe4_sync(&mut self, crypto_select: u32) {
        let mut rng = rand::thread_rng();
        let pad_len = rng.gen_range(0..crypto::MAX_PAD_LEN);
        let mut msg = Vec::with_capacity(8 + 4 + 2 + pad_len);
        msg.extend_from_slice(&crypto::VC);
        msg.extend_from_slice(&crypto_select.to_be_bytes());
        msg.extend_from_slice(&(pad_len as u16).to_be_bytes());
        let mut pad = vec![0u8; pad_len];
        rng.fill(&mut pad[..]);
        msg.extend_from_slice(&pad);

        if let Some(rc4) = &mut self.rc4 {
            rc4.outgoing.apply_keystream(&mut msg);
        }
        self.write_raw(&msg);
        log::debug!(
            "Peer {} crypto selected: {}",
            self.addr,
            if crypto_select == crypto::CRYPTO_RC4 {
                "rc4"
            } else {
                "plaintext"
            }
        );
    }

    fn read_pe_pad(&mut self) -> Result<()> {
        // the responder also reads the initial-payload length behind the
        // pad
        let needed = match self.direction {
            Direction::Inbound => self.pe_pad_len + 2,
            Direction::Outbound => self.pe_pad_len,
        };
        if self.recv_buf.len() < needed {
            return Ok(());
        }
        self.recv_buf.advance(self.pe_pad_len);

        match self.direction {
            Direction::Inbound => {
                let mut len = [0; 2];
                len.copy_from_slice(&self.recv_buf[..2]);
                self.pe_ia_len = u16::from_be_bytes(len) as usize;
                self.recv_buf.advance(2);
                self.state = State::ReadPeIa;
                // the initial payload may be empty
                if self.pe_ia_len == 0 {
                    self.enter_bt_handshake()?;
                }
            }
            Direction::Outbound => {
                self.enter_bt_handshake()?;
            }
        }
        Ok(())
    }

    /// Responder: wait for the initial payload (the initiator's BT
    /// handshake) to be buffered, then fall through to the plain handshake
    /// states.
    fn read_pe_ia(&mut self) -> Result<()> {
        if self.recv_buf.len() < self.pe_ia_len {
            return Ok(());
        }
        self.enter_bt_handshake()
    }

    /// The crypto negotiation is done: apply the selected payload
    /// encryption and continue with the plain handshake states over the
    /// (already decrypted) stream.
    fn enter_bt_handshake(&mut self) -> Result<()> {
        let select = self.crypto_select.expect("crypto not negotiated");
        self.rc4_encrypted = select == crypto::CRYPTO_RC4;
        if !self.rc4_encrypted {
            // payload continues in the clear; what's buffered is already
            // decrypted
            self.recv_encrypted = false;
        }
        log::info!(
            "Peer {} encrypted handshake done (payload: {})",
            self.addr,
            if self.rc4_encrypted { "rc4" } else { "plaintext" }
        );
        self.state = State::ReadProtocolId;
        Ok(())
    }

    /// Initiator: scan for the RC4-encrypted verification constant in the
    /// responder's reply.
    fn read_pe_syncvc(&mut self) -> Result<()> {
        let rc4 = self.rc4.as_ref().expect("rc4 keys not derived");
        // what the VC looks like on the wire: the first eight bytes of the
        // incoming keystream
        let mut expected = crypto::VC;
        let mut probe = rc4.incoming.clone();
        probe.apply_keystream(&mut expected);

        match crypto::find(&self.recv_buf, &expected) {
            Some(pos) => {
                self.recv_buf.advance(pos);
                self.recv_encrypted = true;
                if let Some(rc4) = &mut self.rc4 {
                    rc4.incoming.apply_keystream(&mut self.recv_buf[..]);
                }
                // the decrypted VC is zeroes by construction
                self.recv_buf.advance(8);
                self.state = State::ReadPeCryptofield;
                Ok(())
            }
            None if self.recv_buf.len()
                > crypto::MAX_PAD_LEN + expected.len() =>
            {
                Err(Error::disconnect(
                    DisconnectReason::UnsupportedEncryptionMode,
                    Operation::Encryption,
                ))
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // message phase
    // ------------------------------------------------------------------

    fn read_messages(&mut self) -> Result<()> {
        loop {
            let msg = PeerCodec.decode(&mut self.recv_buf).map_err(|e| {
                log::info!("Peer {} sent invalid message: {}", self.addr, e);
                Error::disconnect(
                    DisconnectReason::InvalidMessage,
                    Operation::Receive,
                )
            })?;
            let msg = match msg {
                Some(msg) => msg,
                None => {
                    self.state = if self.recv_buf.len() >= 4 {
                        State::ReadPacket
                    } else {
                        State::ReadPacketSize
                    };
                    return Ok(());
                }
            };
            self.state = State::ReadPacketSize;
            self.handle_msg(msg)?;
        }
    }

    fn handle_msg(&mut self, msg: Message) -> Result<()> {
        log::debug!("Peer {} sent {:?}", self.addr, msg.id());
        let id: MessageId = match msg.id() {
            // keep-alives only reset the timeout clocks
            None => {
                self.status.downloaded_protocol += 4;
                return Ok(());
            }
            Some(id) => id,
        };
        self.msgs_received[id as usize] += 1;
        let payload_len = msg.payload_len() as u64;
        self.status.downloaded_payload += payload_len;
        self.status.downloaded_protocol +=
            message_framed_len(&msg) as u64 - payload_len;

        let handler = MESSAGE_HANDLERS[id as usize].ok_or_else(|| {
            Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            )
        })?;
        handler(self, msg)
    }

    fn require_fast(&self) -> Result<()> {
        let supports_fast = self
            .peer_info
            .as_ref()
            .map(|i| i.supports_fast)
            .unwrap_or(false);
        if supports_fast {
            Ok(())
        } else {
            Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ))
        }
    }

    fn peer_supports_fast(&self) -> bool {
        self.peer_info
            .as_ref()
            .map(|i| i.supports_fast)
            .unwrap_or(false)
    }

    fn on_choke(&mut self, _: Message) -> Result<()> {
        if self.status.is_choked {
            return Ok(());
        }
        log::info!("Peer {} choked us", self.addr);
        self.status.is_choked = true;

        if !self.peer_supports_fast() {
            // a choke from a non-Fast peer implicitly rejects everything in
            // flight
            let outstanding: Vec<_> =
                self.outgoing_requests.iter().map(|(_, b)| *b).collect();
            for block in outstanding {
                self.reject_request_for(block);
            }
            debug_assert!(self.outgoing_requests.is_empty());
        }
        Ok(())
    }

    fn on_unchoke(&mut self, _: Message) -> Result<()> {
        if !self.status.is_choked {
            return Ok(());
        }
        log::info!("Peer {} unchoked us", self.addr);
        self.status.is_choked = false;
        self.make_requests()
    }

    fn on_interested(&mut self, _: Message) -> Result<()> {
        if !self.status.is_peer_interested {
            log::info!("Peer {} is interested", self.addr);
            self.status.is_peer_interested = true;
            let _ = self.events.send(Event::Interest {
                conn_id: self.conn_id,
                is_peer_interested: true,
            });
        }
        Ok(())
    }

    fn on_not_interested(&mut self, _: Message) -> Result<()> {
        if self.status.is_peer_interested {
            log::info!("Peer {} is not interested", self.addr);
            self.status.is_peer_interested = false;
            let _ = self.events.send(Event::Interest {
                conn_id: self.conn_id,
                is_peer_interested: false,
            });
        }
        Ok(())
    }

    fn on_have(&mut self, msg: Message) -> Result<()> {
        let piece_index = match msg {
            Message::Have { piece_index } => piece_index,
            _ => unreachable!(),
        };
        let torrent = self.torrent();
        if piece_index >= torrent.shared.storage.piece_count {
            return Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ));
        }
        let info = self.peer_info.as_mut().expect("have before handshake");
        // a bitfield arriving after this have would be a protocol error
        info.availability_received = true;
        if info.pieces[piece_index] {
            return Ok(());
        }
        info.pieces.set(piece_index, true);
        if info.pieces.all() {
            info.is_seed = true;
        }

        let interesting = torrent
            .piece_picker
            .write()
            .expect("piece picker poisoned")
            .register_piece_availability(piece_index);
        if interesting && !self.status.is_interested {
            self.write_interested();
            self.make_requests()?;
        }
        self.check_redundant_connection()
    }

    fn on_bitfield(&mut self, msg: Message) -> Result<()> {
        let mut bitfield = match msg {
            Message::Bitfield(bitfield) => bitfield,
            _ => unreachable!(),
        };
        let info =
            self.peer_info.as_ref().expect("bitfield before handshake");
        // a bitfield is only legal as the very first piece-availability
        // message
        if info.availability_received {
            return Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ));
        }

        let torrent = self.torrent();
        let piece_count = torrent.shared.storage.piece_count;
        // the wire bitfield is padded to a byte boundary and no further
        if bitfield.len() < piece_count
            || bitfield.len() >= piece_count + 8
            || bitfield[piece_count..].any()
        {
            return Err(Error::disconnect(
                DisconnectReason::InvalidBitfieldSize,
                Operation::Receive,
            ));
        }
        bitfield.resize(piece_count, false);

        let interesting = torrent
            .piece_picker
            .write()
            .expect("piece picker poisoned")
            .register_availability(&bitfield);

        let info = self.peer_info.as_mut().unwrap();
        info.is_seed = bitfield.all();
        info.pieces = bitfield;
        info.availability_received = true;

        if interesting && !self.status.is_interested {
            self.write_interested();
        }
        self.check_redundant_connection()
    }

    fn on_request(&mut self, msg: Message) -> Result<()> {
        let block = match msg {
            Message::Request(block) => block,
            _ => unreachable!(),
        };

        let torrent = self.torrent();
        let valid = block.len > 0
            && block.len <= BLOCK_LEN
            && torrent
                .shared
                .storage
                .piece_len(block.piece_index)
                .map(|len| block.offset + block.len <= len)
                .unwrap_or(false);
        if !valid {
            return Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ));
        }

        let have_piece = torrent
            .piece_picker
            .read()
            .expect("piece picker poisoned")
            .own_pieces()[block.piece_index];

        if self.status.is_peer_choked || !have_piece {
            if self.peer_supports_fast() {
                self.write_reject_request(block);
            } else {
                log::debug!(
                    "Peer {} requested {} while choked",
                    self.addr,
                    block
                );
            }
            return Ok(());
        }
        if self.incoming_requests.len()
            >= self.network.max_allowed_in_request_queue
        {
            if self.peer_supports_fast() {
                self.write_reject_request(block);
            } else {
                log::debug!("Peer {} overflowed its request queue", self.addr);
            }
            return Ok(());
        }

        self.incoming_requests.push_back(block);
        self.disk.read_block(
            torrent.shared.id,
            block,
            self.conn_id,
            self.reply_chan.clone(),
        );
        Ok(())
    }

    fn on_piece(&mut self, msg: Message) -> Result<()> {
        let (piece_index, offset, data) = match msg {
            Message::Piece {
                piece_index,
                offset,
                data,
            } => (piece_index, offset, data),
            _ => unreachable!(),
        };
        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        self.last_incoming_block = Instant::now();

        let pos = self
            .outgoing_requests
            .iter()
            .position(|(_, b)| *b == block);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                // an unsolicited block; drop it
                log::warn!(
                    "Peer {} sent block we didn't request: {}",
                    self.addr,
                    block
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(pos);

        if let Some(download_pos) = self
            .downloads
            .iter()
            .position(|d| d.piece_index() == block.piece_index)
        {
            let download = &mut self.downloads[download_pos];
            download.received_block(block);
            if download.count_missing_blocks() == 0 {
                log::info!(
                    "Piece {} fully downloaded from peer {}",
                    block.piece_index,
                    self.addr
                );
                // the disk task has the final say once the hash is checked
                self.downloads.remove(download_pos);
            }
        }

        let torrent = self.torrent();
        self.disk
            .write_block(torrent.shared.id, block, data, self.conn_id);
        self.make_requests()
    }

    fn on_cancel(&mut self, msg: Message) -> Result<()> {
        let block = match msg {
            Message::Cancel(block) => block,
            _ => unreachable!(),
        };
        if let Some(pos) =
            self.incoming_requests.iter().position(|b| *b == block)
        {
            self.incoming_requests.remove(pos);
        }
        Ok(())
    }

    fn on_dht_port(&mut self, msg: Message) -> Result<()> {
        let port = match msg {
            Message::DhtPort(port) => port,
            _ => unreachable!(),
        };
        if let Some(info) = self.peer_info.as_mut() {
            info.dht_port = Some(port);
        }
        log::debug!("Peer {} DHT port: {}", self.addr, port);
        Ok(())
    }

    fn on_suggest(&mut self, msg: Message) -> Result<()> {
        self.require_fast()?;
        let piece_index = match msg {
            Message::Suggest { piece_index } => piece_index,
            _ => unreachable!(),
        };
        if piece_index >= self.torrent().shared.storage.piece_count {
            return Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ));
        }
        log::debug!("Peer {} suggests piece {}", self.addr, piece_index);
        Ok(())
    }

    fn on_have_all(&mut self, _: Message) -> Result<()> {
        self.require_fast()?;
        let info =
            self.peer_info.as_mut().expect("have_all before handshake");
        if info.availability_received {
            return Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ));
        }
        info.pieces = Bitfield::repeat(true, info.pieces.len());
        info.is_seed = true;
        info.availability_received = true;
        let pieces = info.pieces.clone();

        let torrent = self.torrent();
        let interesting = torrent
            .piece_picker
            .write()
            .expect("piece picker poisoned")
            .register_availability(&pieces);
        if interesting && !self.status.is_interested {
            self.write_interested();
        }
        self.check_redundant_connection()
    }

    fn on_have_none(&mut self, _: Message) -> Result<()> {
        self.require_fast()?;
        let info =
            self.peer_info.as_mut().expect("have_none before handshake");
        if info.availability_received {
            return Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ));
        }
        info.pieces = Bitfield::repeat(false, info.pieces.len());
        info.is_seed = false;
        info.availability_received = true;
        Ok(())
    }

    fn on_reject_request(&mut self, msg: Message) -> Result<()> {
        self.require_fast()?;
        let block = match msg {
            Message::RejectRequest(block) => block,
            _ => unreachable!(),
        };
        self.reject_request_for(block);
        Ok(())
    }

    /// Withdraws one of our outstanding requests and returns its block to
    /// the download. Shared between rejects off the wire and the rejects a
    /// non-Fast peer's choke implies.
    fn reject_request_for(&mut self, block: BlockInfo) {
        let pos = self
            .outgoing_requests
            .iter()
            .position(|(_, b)| *b == block);
        if let Some(pos) = pos {
            self.outgoing_requests.remove(pos);
            if let Some(download) = self
                .downloads
                .iter_mut()
                .find(|d| d.piece_index() == block.piece_index)
            {
                download.return_block(block);
            }
        }
    }

    fn on_allowed_fast(&mut self, msg: Message) -> Result<()> {
        self.require_fast()?;
        let piece_index = match msg {
            Message::AllowedFast { piece_index } => piece_index,
            _ => unreachable!(),
        };
        if piece_index >= self.torrent().shared.storage.piece_count {
            return Err(Error::disconnect(
                DisconnectReason::InvalidMessage,
                Operation::Receive,
            ));
        }
        if !self.allowed_fast_in.contains(&piece_index) {
            self.allowed_fast_in.push(piece_index);
        }
        Ok(())
    }

    fn on_extended(&mut self, msg: Message) -> Result<()> {
        let (id, payload) = match msg {
            Message::Extended { id, payload } => (id, payload),
            _ => unreachable!(),
        };
        match id {
            ext_id::HANDSHAKE => self.on_extended_handshake(&payload),
            ext_id::UPLOAD_ONLY => {
                let upload_only = payload.first().copied().unwrap_or(0) != 0;
                if let Some(info) = self.peer_info.as_mut() {
                    info.is_seed = upload_only;
                }
                self.check_redundant_connection()
            }
            ext_id::HOLEPUNCH => self.on_holepunch(&payload),
            ext_id::DONT_HAVE => {
                if payload.len() != 4 {
                    return Err(Error::disconnect(
                        DisconnectReason::InvalidMessage,
                        Operation::Receive,
                    ));
                }
                let mut index = [0; 4];
                index.copy_from_slice(&payload);
                let piece_index = u32::from_be_bytes(index) as PieceIndex;
                if let Some(info) = self.peer_info.as_mut() {
                    if piece_index < info.pieces.len() {
                        info.pieces.set(piece_index, false);
                        info.is_seed = false;
                    }
                }
                Ok(())
            }
            ext_id::SHARE_MODE => Ok(()),
            // an extension we never registered; harmless
            _ => Ok(()),
        }
    }

    fn on_extended_handshake(&mut self, payload: &[u8]) -> Result<()> {
        let handshake =
            ExtendedHandshake::from_bytes(payload).map_err(|_| {
                Error::disconnect(
                    DisconnectReason::InvalidMessage,
                    Operation::Receive,
                )
            })?;
        log::debug!(
            "Peer {} extended handshake: v {:?} reqq {:?}",
            self.addr,
            handshake.v,
            handshake.reqq
        );

        if let Some(reqq) = handshake.reqq {
            if reqq > 0 {
                self.request_queue_cap =
                    (reqq as usize).min(self.network.max_out_request_queue);
            }
        }
        if let Some(ip) = handshake.your_ip() {
            let _ = self.events.send(Event::YourIp {
                conn_id: self.conn_id,
                ip,
            });
        }
        let is_upload_only = handshake.upload_only.unwrap_or(0) != 0;
        let exts = PeerExtensions::from_handshake(&handshake);
        if let Some(info) = self.peer_info.as_mut() {
            info.extensions = exts;
            if is_upload_only {
                info.is_seed = true;
            }
        }
        self.check_redundant_connection()
    }

    fn on_holepunch(&mut self, payload: &[u8]) -> Result<()> {
        let msg = Holepunch::decode(payload)?;
        match msg {
            Holepunch::Rendezvous { addr } => {
                // the session knows whether the target is connected and
                // relays connect (or failed) messages through us
                let _ = self.events.send(Event::HolepunchRendezvous {
                    conn_id: self.conn_id,
                    target: addr,
                });
            }
            Holepunch::Connect { addr } => {
                let _ = self.events.send(Event::HolepunchConnect {
                    conn_id: self.conn_id,
                    addr,
                });
            }
            Holepunch::Failed { addr, error } => {
                log::debug!(
                    "Peer {} holepunch to {} failed: {}",
                    self.addr,
                    addr,
                    error
                );
            }
        }
        Ok(())
    }

    fn on_hash_request(&mut self, msg: Message) -> Result<()> {
        let request = match msg {
            Message::HashRequest(request) => request,
            _ => unreachable!(),
        };
        // we don't serve merkle layers; reject so a v2 peer can move on
        self.write_hash_reject(request);
        Ok(())
    }

    fn on_hashes(&mut self, msg: Message) -> Result<()> {
        if let Message::Hashes { request, hashes } = msg {
            log::debug!(
                "Peer {} sent {} hashes for root {}",
                self.addr,
                hashes.len(),
                hex::encode(&request.pieces_root[..8])
            );
        }
        Ok(())
    }

    fn on_hash_reject(&mut self, msg: Message) -> Result<()> {
        if let Message::HashReject(request) = msg {
            log::debug!(
                "Peer {} rejected hash request for root {}",
                self.addr,
                hex::encode(&request.pieces_root[..8])
            );
        }
        Ok(())
    }

    /// With `close_redundant_connections`, a connection between two seeds
    /// serves nobody; it's refused like any other policy violation.
    fn check_redundant_connection(&mut self) -> Result<()> {
        if !self.network.close_redundant_connections {
            return Ok(());
        }
        let peer_is_seed = self
            .peer_info
            .as_ref()
            .map(|i| i.is_seed)
            .unwrap_or(false);
        if !peer_is_seed {
            return Ok(());
        }
        let we_are_seed = self
            .torrent()
            .piece_picker
            .read()
            .expect("piece picker poisoned")
            .is_seed();
        if we_are_seed {
            log::info!("Peer {} and we are both seeds, closing", self.addr);
            return Err(Error::disconnect(
                DisconnectReason::TooManyConnections,
                Operation::Bittorrent,
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // request pipeline
    // ------------------------------------------------------------------

    /// Fills the download pipeline up to the request queue cap.
    fn make_requests(&mut self) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        let peer_pieces = match self.peer_info.as_ref() {
            Some(info) => info.pieces.clone(),
            None => return Ok(()),
        };
        let torrent = self.torrent();

        let mut blocks = Vec::new();
        // continue existing downloads first, to finish pieces sooner
        for download in self.downloads.iter_mut() {
            let free = self
                .request_queue_cap
                .saturating_sub(self.outgoing_requests.len() + blocks.len());
            if free == 0 {
                break;
            }
            download.pick_blocks(free, &mut blocks);
        }

        loop {
            let free = self
                .request_queue_cap
                .saturating_sub(self.outgoing_requests.len() + blocks.len());
            if free == 0 {
                break;
            }
            let index = torrent
                .piece_picker
                .write()
                .expect("piece picker poisoned")
                .pick_piece(&peer_pieces);
            let index = match index {
                Some(index) => index,
                None => break,
            };
            log::debug!("Peer {} starting piece {}", self.addr, index);
            let piece_len = torrent
                .shared
                .storage
                .piece_len(index)
                .expect("picked piece out of bounds");
            let mut download = PieceDownload::new(index, piece_len);
            download.pick_blocks(free, &mut blocks);
            self.downloads.push(download);
        }

        for block in blocks {
            self.write_request(block);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // write primitives
    // ------------------------------------------------------------------

    fn write_msg(&mut self, msg: Message) {
        if let Some(id) = msg.id() {
            self.msgs_sent[id as usize] += 1;
        }
        let payload_len = msg.payload_len() as u64;
        let mut frame = BytesMut::new();
        PeerCodec.encode(msg, &mut frame).expect("encode failed");

        if payload_len > 0 {
            // the payload sits at the tail of the frame
            let payload_start =
                self.queued_offset + frame.len() as u64 - payload_len;
            self.payload_ranges.push_back((payload_start, payload_len));
        }
        let mut frame = frame.to_vec();
        if self.rc4_encrypted {
            if let Some(rc4) = &mut self.rc4 {
                rc4.outgoing.apply_keystream(&mut frame);
            }
        }
        self.queued_offset += frame.len() as u64;
        self.send_buf.extend_from_slice(&frame);
    }

    /// Appends handshake-phase bytes, already encrypted where called for.
    fn write_raw(&mut self, bytes: &[u8]) {
        self.queued_offset += bytes.len() as u64;
        self.send_buf.extend_from_slice(bytes);
    }

    fn write_handshake(&mut self) {
        let torrent = self.torrent();
        let handshake =
            Handshake::new(torrent.shared.info_hash, torrent.shared.client_id);
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(handshake, &mut buf)
            .expect("encode failed");
        let mut bytes = buf.to_vec();
        if self.rc4_encrypted {
            if let Some(rc4) = &mut self.rc4 {
                rc4.outgoing.apply_keystream(&mut bytes);
            }
        }
        log::info!("Sending handshake to peer {}", self.addr);
        self.sent_handshake = true;
        self.write_raw(&bytes);
    }

    fn write_choke(&mut self) {
        if self.status.is_peer_choked {
            return;
        }
        self.status.is_peer_choked = true;
        // everything the peer had queued is moot now
        self.incoming_requests.clear();
        self.write_msg(Message::Choke);
    }

    fn write_unchoke(&mut self) {
        if !self.status.is_peer_choked {
            return;
        }
        self.status.is_peer_choked = false;
        self.write_msg(Message::Unchoke);
    }

    fn write_interested(&mut self) {
        self.status.is_interested = true;
        log::info!("Interested in peer {}", self.addr);
        self.write_msg(Message::Interested);
    }

    fn write_not_interested(&mut self) {
        self.status.is_interested = false;
        self.write_msg(Message::NotInterested);
    }

    fn write_have(&mut self, piece_index: PieceIndex) {
        self.write_msg(Message::Have { piece_index });
    }

    fn write_bitfield(&mut self, pieces: &Bitfield) {
        self.write_msg(Message::Bitfield(pieces.clone()));
    }

    fn write_request(&mut self, block: BlockInfo) {
        let seq = self.next_request_seq;
        self.next_request_seq += 1;
        self.outgoing_requests.push((seq, block));
        self.write_msg(Message::Request(block));
    }

    fn write_piece(&mut self, info: BlockInfo, data: Vec<u8>) {
        self.write_msg(Message::Piece {
            piece_index: info.piece_index,
            offset: info.offset,
            data,
        });
    }

    fn write_cancel(&mut self, block: BlockInfo) {
        self.write_msg(Message::Cancel(block));
    }

    fn write_reject_request(&mut self, block: BlockInfo) {
        self.write_msg(Message::RejectRequest(block));
    }

    fn write_have_all(&mut self) {
        self.write_msg(Message::HaveAll);
    }

    fn write_have_none(&mut self) {
        self.write_msg(Message::HaveNone);
    }

    #[allow(dead_code)]
    fn write_allow_fast(&mut self, piece_index: PieceIndex) {
        self.write_msg(Message::AllowedFast { piece_index });
    }

    #[allow(dead_code)]
    fn write_suggest(&mut self, piece_index: PieceIndex) {
        self.write_msg(Message::Suggest { piece_index });
    }

    #[allow(dead_code)]
    fn write_dht_port(&mut self, port: u16) {
        let peer_supports_dht = self
            .peer_info
            .as_ref()
            .map(|i| i.supports_dht)
            .unwrap_or(false);
        if peer_supports_dht {
            self.write_msg(Message::DhtPort(port));
        }
    }

    fn write_extensions(&mut self) {
        let handshake = ExtendedHandshake::ours(
            &self.user_agent,
            None,
            self.network.max_out_request_queue as i64,
        );
        match handshake.to_bytes() {
            Ok(payload) => self.write_msg(Message::Extended {
                id: ext_id::HANDSHAKE,
                payload,
            }),
            Err(e) => {
                log::error!("Failed to encode extended handshake: {}", e)
            }
        }
    }

    #[allow(dead_code)]
    fn write_hash_request(&mut self, request: codec::HashRequest) {
        self.write_msg(Message::HashRequest(request));
    }

    #[allow(dead_code)]
    fn write_hashes(
        &mut self,
        request: codec::HashRequest,
        hashes: Vec<[u8; 32]>,
    ) {
        self.write_msg(Message::Hashes { request, hashes });
    }

    fn write_hash_reject(&mut self, request: codec::HashRequest) {
        self.write_msg(Message::HashReject(request));
    }

    #[allow(dead_code)]
    fn write_dont_have(&mut self, piece_index: PieceIndex) {
        if let Some(id) = self.peer_ext_id(|e| e.dont_have) {
            self.write_msg(Message::Extended {
                id,
                payload: (piece_index as u32).to_be_bytes().to_vec(),
            });
        }
    }

    fn write_upload_only(&mut self, upload_only: bool) {
        if let Some(id) = self.peer_ext_id(|e| e.upload_only) {
            self.write_msg(Message::Extended {
                id,
                payload: vec![upload_only as u8],
            });
        }
    }

    fn write_holepunch(&mut self, msg: Holepunch) {
        if let Some(id) = self.peer_ext_id(|e| e.holepunch) {
            self.write_msg(Message::Extended {
                id,
                payload: msg.encode(),
            });
        }
    }

    fn peer_ext_id(
        &self,
        f: impl Fn(&PeerExtensions) -> Option<u8>,
    ) -> Option<u8> {
        self.peer_info.as_ref().and_then(|i| f(&i.extensions))
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    /// Writes as much of the send buffer as the bandwidth allowance covers,
    /// crediting payload and protocol counters for what actually went out.
    async fn flush(&mut self, socket: &mut TcpStream) -> Result<()> {
        while !self.send_buf.is_empty() {
            if self.send_quota == 0 {
                if !self.bandwidth_requested {
                    self.bandwidth_requested = true;
                    let _ = self.events.send(Event::BandwidthRequest {
                        conn_id: self.conn_id,
                        amount: self.send_buf.len(),
                    });
                }
                return Ok(());
            }
            let n = self.send_quota.min(self.send_buf.len());
            let written = socket.write(&self.send_buf[..n]).await?;
            if written == 0 {
                return Err(Error::disconnect(
                    DisconnectReason::PeerError,
                    Operation::Send,
                ));
            }
            self.send_buf.advance(written);
            self.send_quota -= written;
            self.on_sent(written);
        }
        Ok(())
    }

    /// Splits `n` sent bytes into payload and protocol credit using the
    /// queued payload ranges.
    fn on_sent(&mut self, n: usize) {
        self.last_send = Instant::now();
        let start = self.sent_offset;
        let end = start + n as u64;
        self.sent_offset = end;

        let mut payload = 0;
        while let Some(&(range_start, range_len)) =
            self.payload_ranges.front()
        {
            let range_end = range_start + range_len;
            if range_start >= end {
                break;
            }
            let overlap_start = range_start.max(start);
            let overlap_end = range_end.min(end);
            if overlap_end > overlap_start {
                payload += overlap_end - overlap_start;
            }
            if range_end <= end {
                self.payload_ranges.pop_front();
            } else {
                break;
            }
        }
        self.status.uploaded_payload += payload;
        self.status.uploaded_protocol += n as u64 - payload;
    }

    // ------------------------------------------------------------------
    // commands and ticking
    // ------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Block { info, data } => {
                // the peer may have cancelled in the meantime
                let queued = self
                    .incoming_requests
                    .iter()
                    .position(|b| *b == info);
                if let Some(pos) = queued {
                    self.incoming_requests.remove(pos);
                    let mut payload = Vec::with_capacity(info.len as usize);
                    for chunk in data.chunks() {
                        payload.extend_from_slice(chunk);
                    }
                    payload.truncate(info.len as usize);
                    self.write_piece(info, payload);
                }
                self.disk.reclaim(data);
                Ok(())
            }
            Command::RejectRequest(info) => {
                if let Some(pos) =
                    self.incoming_requests.iter().position(|b| *b == info)
                {
                    self.incoming_requests.remove(pos);
                }
                if self.peer_supports_fast() {
                    self.write_reject_request(info);
                }
                Ok(())
            }
            Command::Choke => {
                self.write_choke();
                Ok(())
            }
            Command::Unchoke => {
                self.write_unchoke();
                Ok(())
            }
            Command::NewPiece(piece_index) => {
                // no point announcing to a peer that has it
                let peer_has = self
                    .peer_info
                    .as_ref()
                    .map(|i| i.pieces[piece_index])
                    .unwrap_or(false);
                if !peer_has {
                    self.write_have(piece_index);
                }
                // another session may have finished a piece we were still
                // requesting; withdraw those requests
                let obsolete: Vec<BlockInfo> = self
                    .outgoing_requests
                    .iter()
                    .map(|(_, b)| *b)
                    .filter(|b| b.piece_index == piece_index)
                    .collect();
                for block in obsolete {
                    self.write_cancel(block);
                    self.outgoing_requests.retain(|(_, b)| *b != block);
                }
                if let Some(pos) = self
                    .downloads
                    .iter()
                    .position(|d| d.piece_index() == piece_index)
                {
                    self.downloads.remove(pos);
                }
                // completing the torrent turns us into a pure uploader
                let is_seed = self
                    .torrent()
                    .piece_picker
                    .read()
                    .expect("piece picker poisoned")
                    .is_seed();
                if is_seed {
                    if self.status.is_interested {
                        self.write_not_interested();
                    }
                    self.write_upload_only(true);
                }
                Ok(())
            }
            Command::BandwidthGrant(n) => {
                self.send_quota += n;
                self.bandwidth_requested = false;
                Ok(())
            }
            Command::SendHolepunch(msg) => {
                self.write_holepunch(msg);
                Ok(())
            }
            Command::Shutdown(reason) => {
                self.is_disconnecting = true;
                Err(Error::disconnect(reason, Operation::Bittorrent))
            }
        }
    }

    /// The per-second housekeeping: timeouts, keep-alives and the status
    /// snapshot for the session.
    fn tick(&mut self) -> Result<()> {
        let now = Instant::now();

        // handshake timeout; i2p streams get four times the grace
        let in_message_phase = self.state == State::ReadPacketSize
            || self.state == State::ReadPacket;
        if self.peer_info.is_none() || !in_message_phase {
            let multiplier = match self.socket_kind {
                SocketKind::Tcp => 1,
                SocketKind::I2p => 4,
            };
            if now.duration_since(self.connected_at)
                > self.network.handshake_timeout * multiplier
            {
                return Err(Error::disconnect(
                    DisconnectReason::TimedOut,
                    Operation::Handshake,
                ));
            }
            return Ok(());
        }

        // a peer sitting on our requests for too long is dead weight
        if !self.outgoing_requests.is_empty()
            && now.duration_since(self.last_incoming_block)
                > Duration::from_secs(60)
        {
            return Err(Error::disconnect(
                DisconnectReason::TimedOut,
                Operation::Receive,
            ));
        }

        // even an idle peer has to keep-alive now and then
        if now.duration_since(self.last_recv)
            > 2 * self.network.keep_alive_interval
        {
            return Err(Error::disconnect(
                DisconnectReason::TimedOut,
                Operation::Receive,
            ));
        }

        if now.duration_since(self.last_send)
            >= self.network.keep_alive_interval
        {
            self.write_msg(Message::KeepAlive);
        }

        // rates over the last second
        self.status.download_rate = self.status.downloaded_payload
            - self.status.prev_downloaded_payload;
        self.status.upload_rate = self.status.uploaded_payload
            - self.status.prev_uploaded_payload;
        self.status.prev_downloaded_payload = self.status.downloaded_payload;
        self.status.prev_uploaded_payload = self.status.uploaded_payload;

        let snapshot = StatusSnapshot {
            is_peer_interested: self.status.is_peer_interested,
            is_peer_choked: self.status.is_peer_choked,
            download_rate: self.status.download_rate,
            upload_rate: self.status.upload_rate,
            is_seed: self
                .peer_info
                .as_ref()
                .map(|i| i.is_seed)
                .unwrap_or(false),
            downloaded_payload: self.status.downloaded_payload,
            uploaded_payload: self.status.uploaded_payload,
            downloaded_protocol: self.status.downloaded_protocol,
            uploaded_protocol: self.status.uploaded_protocol,
            msgs_received: self.msgs_received,
            msgs_sent: self.msgs_sent,
        };
        let _ = self.events.send(Event::Status {
            conn_id: self.conn_id,
            snapshot: Box::new(snapshot),
        });
        Ok(())
    }
}

/// Reads some bytes into the buffer, returning how many arrived. Zero means
/// the peer closed the connection.
async fn read_some(
    socket: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<usize> {
    let n = socket.read_buf(buf).await?;
    if n == 0 {
        return Err(Error::disconnect(
            DisconnectReason::PeerError,
            Operation::Receive,
        ));
    }
    Ok(n)
}

/// The total framed length of a message on the wire.
fn message_framed_len(msg: &Message) -> usize {
    match msg {
        Message::KeepAlive => 4,
        Message::Piece { data, .. } => 4 + 9 + data.len(),
        Message::Bitfield(bitfield) => 4 + 1 + bitfield.as_slice().len(),
        Message::Extended { payload, .. } => 4 + 2 + payload.len(),
        msg => {
            let mut buf = BytesMut::new();
            PeerCodec
                .encode(msg.clone(), &mut buf)
                .expect("encode failed");
            buf.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disk,
        piece_picker::PiecePicker,
        storage_info::StorageInfo,
        torrent::SharedStatus,
    };
    use std::sync::RwLock;

    const PIECE_COUNT: usize = 4;
    const PIECE_LEN: u32 = 2 * BLOCK_LEN;

    fn test_session() -> (PeerSession, Sender, EventReceiver) {
        let shared = SharedStatus {
            id: 0,
            storage_id: 0,
            info_hash: [0xaa; 20],
            client_id: *b"-rp0100-000000000000",
            storage: StorageInfo::new(
                PIECE_LEN,
                PIECE_COUNT as u64 * PIECE_LEN as u64,
                Vec::new(),
            ),
        };
        let ctx = TorrentCtx {
            shared: Arc::new(shared),
            piece_picker: Arc::new(RwLock::new(PiecePicker::new(PIECE_COUNT))),
        };
        let (events, event_port) = mpsc::unbounded_channel();
        let (mut session, cmd_chan) = PeerSession::outbound(
            ctx,
            disk::test_handle(),
            events,
            1,
            "1.2.3.4:6881".parse().unwrap(),
            EncryptionConf::default(),
            NetworkConf::default(),
            "riptorrent/0.1".to_string(),
            false,
        );
        // pretend the handshake completed with a Fast-less peer
        session.init_peer_capabilities([0; 8]);
        (session, cmd_chan, event_port)
    }

    fn enable_fast(session: &mut PeerSession) {
        let mut reserved = [0; 8];
        reserved[7] |= 0x04;
        session.init_peer_capabilities(reserved);
    }

    fn block(piece_index: usize, offset: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len: BLOCK_LEN,
        }
    }

    #[test]
    fn test_choke_synthesizes_rejects_without_fast() {
        let (mut session, _cmd, _events) = test_session();
        session.status.is_choked = false;
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut picked = Vec::new();
        download.pick_blocks(2, &mut picked);
        session.downloads.push(download);
        for (i, block) in picked.iter().enumerate() {
            session.outgoing_requests.push((i as u64, *block));
        }

        session.on_choke(Message::Choke).unwrap();
        // every outstanding request was synthetically rejected
        assert!(session.outgoing_requests.is_empty());
        assert!(session.status.is_choked);
        // the rejected blocks are pickable again
        let mut repicked = Vec::new();
        session.downloads[0].pick_blocks(2, &mut repicked);
        assert_eq!(repicked, picked);
    }

    #[test]
    fn test_choke_keeps_requests_with_fast() {
        let (mut session, _cmd, _events) = test_session();
        enable_fast(&mut session);
        session.status.is_choked = false;
        session.outgoing_requests.push((0, block(0, 0)));

        session.on_choke(Message::Choke).unwrap();
        // a Fast peer rejects explicitly, so the request stays pending
        assert_eq!(session.outgoing_requests.len(), 1);
    }

    #[test]
    fn test_fast_messages_require_fast_support() {
        let (mut session, _cmd, _events) = test_session();
        assert!(session.on_have_all(Message::HaveAll).is_err());
        assert!(session.on_have_none(Message::HaveNone).is_err());
        assert!(session
            .on_suggest(Message::Suggest { piece_index: 0 })
            .is_err());
        assert!(session
            .on_allowed_fast(Message::AllowedFast { piece_index: 0 })
            .is_err());
        assert!(session
            .on_reject_request(Message::RejectRequest(block(0, 0)))
            .is_err());
    }

    #[test]
    fn test_bitfield_after_have_is_error() {
        let (mut session, _cmd, _events) = test_session();
        session.on_have(Message::Have { piece_index: 0 }).unwrap();

        let mut bitfield = Bitfield::with_capacity(PIECE_COUNT);
        bitfield.resize(PIECE_COUNT, true);
        assert!(session.on_bitfield(Message::Bitfield(bitfield)).is_err());
    }

    #[test]
    fn test_bitfield_after_unrelated_messages_is_ok() {
        let (mut session, _cmd, _events) = test_session();
        // only the piece-availability family claims the bitfield slot;
        // other messages arriving first don't forfeit it
        session.on_unchoke(Message::Unchoke).unwrap();
        session.on_interested(Message::Interested).unwrap();
        session.on_dht_port(Message::DhtPort(6881)).unwrap();

        let bitfield = Bitfield::from_vec(vec![0b1111_0000]);
        assert!(session.on_bitfield(Message::Bitfield(bitfield)).is_ok());
        assert!(session.peer_info.as_ref().unwrap().is_seed);
    }

    #[test]
    fn test_bitfield_size_is_validated() {
        let (mut session, _cmd, _events) = test_session();
        // 4 pieces arrive as one byte on the wire; two bytes is one too
        // many
        let bitfield = Bitfield::from_vec(vec![0b1111_0000, 0]);
        assert!(matches!(
            session.on_bitfield(Message::Bitfield(bitfield)),
            Err(Error::Disconnect {
                reason: DisconnectReason::InvalidBitfieldSize,
                ..
            })
        ));
        // and set padding bits are a lie about the piece count
        let bitfield = Bitfield::from_vec(vec![0b1111_1000]);
        assert!(session.on_bitfield(Message::Bitfield(bitfield)).is_err());
    }

    #[test]
    fn test_bitfield_makes_us_interested() {
        let (mut session, _cmd, _events) = test_session();
        let bitfield = Bitfield::from_vec(vec![0b1111_0000]);
        session.on_bitfield(Message::Bitfield(bitfield)).unwrap();
        assert!(session.status.is_interested);
        let sent = session.msgs_sent[MessageId::Interested as usize];
        assert_eq!(sent, 1);
        // the peer has everything, so it's a seed
        assert!(session.peer_info.as_ref().unwrap().is_seed);
    }

    #[test]
    fn test_unchoke_fills_request_pipeline() {
        let (mut session, _cmd, _events) = test_session();
        let bitfield = Bitfield::from_vec(vec![0b1111_0000]);
        session.on_bitfield(Message::Bitfield(bitfield)).unwrap();
        assert!(session.status.is_interested);

        session.on_unchoke(Message::Unchoke).unwrap();
        assert!(!session.outgoing_requests.is_empty());
        // requests carry increasing sequence numbers
        let seqs: Vec<u64> =
            session.outgoing_requests.iter().map(|(s, _)| *s).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn test_request_while_choked_is_rejected_for_fast_peer() {
        let (mut session, _cmd, _events) = test_session();
        enable_fast(&mut session);
        // we have the piece but the peer is choked
        session
            .torrent()
            .piece_picker
            .write()
            .unwrap()
            .received_piece(0);

        session.on_request(Message::Request(block(0, 0))).unwrap();
        assert!(session.incoming_requests.is_empty());
        let rejects = session.msgs_sent[MessageId::RejectRequest as usize];
        assert_eq!(rejects, 1);
    }

    #[test]
    fn test_oversized_request_is_protocol_error() {
        let (mut session, _cmd, _events) = test_session();
        let bad = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN + 1,
        };
        assert!(session.on_request(Message::Request(bad)).is_err());
    }

    #[test]
    fn test_upload_accounting_splits_payload_and_protocol() {
        let (mut session, _cmd, _events) = test_session();
        session.write_msg(Message::Unchoke);
        let data = vec![0xab; BLOCK_LEN as usize];
        session.write_piece(block(0, 0), data);

        // everything hits the wire in two partial writes
        let total = session.send_buf.len();
        session.send_buf.advance(10);
        session.on_sent(10);
        session.send_buf.advance(total - 10);
        session.on_sent(total - 10);

        assert_eq!(session.status.uploaded_payload, BLOCK_LEN as u64);
        assert_eq!(
            session.status.uploaded_protocol,
            total as u64 - BLOCK_LEN as u64
        );
        assert!(session.payload_ranges.is_empty());
    }

    #[test]
    fn test_extended_handshake_negotiates_sub_ids() {
        let (mut session, _cmd, _events) = test_session();
        let mut handshake = ExtendedHandshake::default();
        handshake.m.insert("upload_only".to_string(), 3);
        handshake.m.insert("ut_holepunch".to_string(), 4);
        handshake.m.insert("lt_donthave".to_string(), 7);
        handshake.reqq = Some(100);
        let payload = handshake.to_bytes().unwrap();

        session
            .on_extended(Message::Extended { id: 0, payload })
            .unwrap();
        let info = session.peer_info.as_ref().unwrap();
        assert_eq!(
            info.extensions,
            PeerExtensions {
                upload_only: Some(3),
                holepunch: Some(4),
                dont_have: Some(7),
                share_mode: None,
            }
        );
        assert_eq!(session.request_queue_cap, 100);
    }

    #[test]
    fn test_dont_have_clears_piece_bit() {
        let (mut session, _cmd, _events) = test_session();
        let bitfield = Bitfield::from_vec(vec![0b1111_0000]);
        session.on_bitfield(Message::Bitfield(bitfield)).unwrap();

        session
            .on_extended(Message::Extended {
                id: ext_id::DONT_HAVE,
                payload: 1u32.to_be_bytes().to_vec(),
            })
            .unwrap();
        let info = session.peer_info.as_ref().unwrap();
        assert!(!info.pieces[1]);
        assert!(!info.is_seed);
    }

    #[test]
    fn test_dht_port_is_recorded() {
        let (mut session, _cmd, _events) = test_session();
        session.on_dht_port(Message::DhtPort(6881)).unwrap();
        assert_eq!(session.peer_info.as_ref().unwrap().dht_port, Some(6881));
    }

    #[test]
    fn test_unsolicited_piece_is_dropped() {
        let (mut session, _cmd, _events) = test_session();
        session
            .on_piece(Message::Piece {
                piece_index: 0,
                offset: 0,
                data: vec![0; BLOCK_LEN as usize],
            })
            .unwrap();
        assert!(session.outgoing_requests.is_empty());
    }
}
