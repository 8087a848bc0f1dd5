//! The session: the engine's top level object.
//!
//! The session owns the torrents, the live peer connections, the connection
//! queue, the unchoke scheduler, the bandwidth manager and the counters,
//! and it routes inbound sockets to the right torrent. Everything runs in
//! one event loop task; peer connections and the disk engine are separate
//! tasks that communicate with it over channels only, so no session state
//! is ever locked.
//!
//! Shutdown is two staged: stage one cancels the listener and the
//! connection queue and tells every peer to disconnect; stage two runs once
//! the last of those "undead" connections has reported back, at which point
//! the disk task is stopped and the shutdown-complete alert is emitted.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use {
    futures::{pin_mut, select, stream::Fuse, FutureExt, StreamExt},
    rand::Rng,
    sha1::{Digest, Sha1},
    tokio::{
        net::{TcpListener, TcpStream},
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        task, time,
    },
};

use crate::{
    alert::{Alert, AlertReceiver, AlertSender},
    bandwidth::{BandwidthManager, Channel, ClassId},
    conf::{Conf, EncPolicy},
    connection_queue::{ConnectionQueue, TicketId},
    counters::{Counter, Counters},
    disk::{self, DiskHandle},
    error::{DisconnectReason, Operation},
    peer::{
        self, Command, ConnectionId, Event, Holepunch, PeerSession,
        TorrentLookup, NUM_MESSAGE_IDS,
    },
    storage::Storage,
    torrent::{SharedStatus, Torrent, TorrentCtx},
    unchoke::{
        self, ChokeDecision, PeerSnapshot,
    },
    Bitfield, PeerId, Sha1Hash, StorageInfo, TorrentId,
};

/// Everything needed to add a torrent to the session. Metadata acquisition
/// (.torrent files, magnets) happens outside the engine; by the time a
/// torrent gets here its geometry and hashes are known.
pub struct TorrentParams {
    pub info_hash: Sha1Hash,
    /// The concatenation of the 20 byte piece hashes.
    pub piece_hashes: Vec<u8>,
    pub storage_info: StorageInfo,
    pub storage: Box<dyn Storage>,
    /// Pieces already present in storage (from resume data); `None` for a
    /// fresh download.
    pub own_pieces: Option<Bitfield>,
    /// Initial peers to connect to.
    pub peers: Vec<SocketAddr>,
}

/// The commands the embedding program can send the session.
pub enum UserCommand {
    AddTorrent(Box<TorrentParams>),
    RemoveTorrent(TorrentId),
    ConnectPeer {
        id: TorrentId,
        addr: SocketAddr,
    },
    Shutdown,
}

/// The embedder's handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_chan: UnboundedSender<UserCommand>,
    local_addr: Option<SocketAddr>,
}

impl SessionHandle {
    /// The address the session accepts peers on, if it's listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn add_torrent(&self, params: TorrentParams) {
        let _ = self
            .cmd_chan
            .send(UserCommand::AddTorrent(Box::new(params)));
    }

    pub fn remove_torrent(&self, id: TorrentId) {
        let _ = self.cmd_chan.send(UserCommand::RemoveTorrent(id));
    }

    pub fn connect_peer(&self, id: TorrentId, addr: SocketAddr) {
        let _ = self.cmd_chan.send(UserCommand::ConnectPeer { id, addr });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_chan.send(UserCommand::Shutdown);
    }
}

/// Starts a session task. `listen_addr` enables accepting inbound peers.
pub fn spawn(
    conf: Conf,
    listen_addr: Option<SocketAddr>,
) -> (task::JoinHandle<()>, SessionHandle, AlertReceiver) {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let (alert_chan, alert_port) = mpsc::unbounded_channel();
    let (event_chan, event_port) = mpsc::unbounded_channel();
    let (queue_chan, queue_port) = mpsc::unbounded_channel();
    let (_disk_join, disk, disk_alerts) = disk::spawn(&conf.cache);

    // bind synchronously so the caller can learn the port before the
    // session task runs
    let (std_listener, local_addr) = match listen_addr {
        Some(addr) => match std::net::TcpListener::bind(addr) {
            Ok(listener) => {
                listener
                    .set_nonblocking(true)
                    .expect("cannot set listener nonblocking");
                let local_addr = listener.local_addr().ok();
                (Some(listener), local_addr)
            }
            Err(e) => {
                log::error!("Failed to bind {}: {}", addr, e);
                (None, None)
            }
        },
        None => (None, None),
    };

    // peer id: the configured fingerprint up front, random after
    let mut client_id = conf.engine.client_id;
    client_id[..8].copy_from_slice(&conf.engine.peer_fingerprint);
    rand::thread_rng().fill(&mut client_id[8..]);

    let half_open_limit = conf.network.half_open_limit;
    let mut bandwidth = BandwidthManager::new();
    let global_class = bandwidth.add_class(
        conf.network.upload_rate_limit,
        conf.network.download_rate_limit,
    );

    let unchoke_countdown = conf.choker.unchoke_interval.as_secs().max(1);
    let optimistic_countdown =
        conf.choker.optimistic_unchoke_interval.as_secs().max(1);

    let mut session = Session {
        conf,
        client_id,
        counters: Counters::new(),
        torrents: HashMap::new(),
        registry: SharedRegistry::default(),
        conns: HashMap::new(),
        pending_sessions: HashMap::new(),
        queue_tickets: HashMap::new(),
        undead: HashSet::new(),
        next_torrent_id: 0,
        next_conn_id: 1,
        connect_queue: ConnectionQueue::new(half_open_limit),
        bandwidth,
        global_class,
        disk,
        disk_alerts: disk_alerts.fuse(),
        event_chan,
        event_port: event_port.fuse(),
        queue_chan,
        queue_port: queue_port.fuse(),
        alert_chan,
        cmd_port: cmd_port.fuse(),
        std_listener,
        listener: None,
        session_time: 0,
        unchoke_countdown,
        optimistic_countdown,
        external_ip_votes: HashMap::new(),
        departed_msgs_received: [0; NUM_MESSAGE_IDS],
        departed_msgs_sent: [0; NUM_MESSAGE_IDS],
        aborting: false,
        running: true,
    };

    let join_handle = task::spawn(async move { session.run().await });
    (
        join_handle,
        SessionHandle {
            cmd_chan,
            local_addr,
        },
        alert_port,
    )
}

/// The info-hash registry inbound connections resolve their torrent from.
#[derive(Default)]
struct Registry {
    by_info_hash: HashMap<Sha1Hash, TorrentCtx>,
    /// Maps SHA1('req2', info_hash) back to the info hash, for the MSE
    /// obfuscated lookup.
    by_obfuscated: HashMap<Sha1Hash, Sha1Hash>,
}

#[derive(Clone, Default)]
struct SharedRegistry(Arc<RwLock<Registry>>);

impl SharedRegistry {
    fn insert(&self, ctx: TorrentCtx) {
        let info_hash = ctx.shared.info_hash;
        let mut h = Sha1::new();
        h.update(b"req2");
        h.update(&info_hash);
        let obfuscated: Sha1Hash = h.finalize().into();
        let mut registry = self.0.write().expect("registry poisoned");
        registry.by_obfuscated.insert(obfuscated, info_hash);
        registry.by_info_hash.insert(info_hash, ctx);
    }

    fn remove(&self, info_hash: &Sha1Hash) {
        let mut registry = self.0.write().expect("registry poisoned");
        registry.by_info_hash.remove(info_hash);
        registry.by_obfuscated.retain(|_, v| v != info_hash);
    }
}

impl TorrentLookup for SharedRegistry {
    fn find(&self, info_hash: &Sha1Hash) -> Option<TorrentCtx> {
        self.0
            .read()
            .expect("registry poisoned")
            .by_info_hash
            .get(info_hash)
            .cloned()
    }

    fn find_obfuscated(&self, obfuscated: &Sha1Hash) -> Option<TorrentCtx> {
        let registry = self.0.read().expect("registry poisoned");
        let info_hash = registry.by_obfuscated.get(obfuscated)?;
        registry.by_info_hash.get(info_hash).cloned()
    }
}

/// Promotion and timeout notifications from the connection queue handlers.
enum QueueEvent {
    Connect {
        conn_id: ConnectionId,
        ticket: TicketId,
    },
    Aborted {
        conn_id: ConnectionId,
    },
    Timeout {
        conn_id: ConnectionId,
    },
}

/// The session's view of one live (or pending) connection.
struct ConnRecord {
    torrent_id: Option<TorrentId>,
    addr: SocketAddr,
    peer_id: Option<PeerId>,
    cmd: peer::Sender,
    is_outbound: bool,
    /// Set once the handshake completed.
    is_connected: bool,
    is_peer_interested: bool,
    /// Whether we choke the peer, from the session's point of view.
    is_peer_choked: bool,
    optimistically_unchoked: bool,
    download_rate: u64,
    is_seed: bool,
    msgs_received: [u64; NUM_MESSAGE_IDS],
    msgs_sent: [u64; NUM_MESSAGE_IDS],
    downloaded_payload: u64,
    uploaded_payload: u64,
    downloaded_protocol: u64,
    uploaded_protocol: u64,
}

impl ConnRecord {
    fn new(
        torrent_id: Option<TorrentId>,
        addr: SocketAddr,
        cmd: peer::Sender,
        is_outbound: bool,
    ) -> Self {
        Self {
            torrent_id,
            addr,
            peer_id: None,
            cmd,
            is_outbound,
            is_connected: false,
            is_peer_interested: false,
            is_peer_choked: true,
            optimistically_unchoked: false,
            download_rate: 0,
            is_seed: false,
            msgs_received: [0; NUM_MESSAGE_IDS],
            msgs_sent: [0; NUM_MESSAGE_IDS],
            downloaded_payload: 0,
            uploaded_payload: 0,
            downloaded_protocol: 0,
            uploaded_protocol: 0,
        }
    }
}

/// What woke the session loop up.
enum Turn {
    Cmd(Option<UserCommand>),
    PeerEvent(Event),
    QueueEvent(QueueEvent),
    DiskAlert(disk::Alert),
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    QueueDeadline,
    Tick,
}

struct Session {
    conf: Conf,
    client_id: PeerId,
    counters: Counters,
    torrents: HashMap<TorrentId, Torrent>,
    registry: SharedRegistry,
    conns: HashMap<ConnectionId, ConnRecord>,
    /// Outbound sessions waiting for a half-open slot.
    pending_sessions: HashMap<ConnectionId, PeerSession>,
    queue_tickets: HashMap<ConnectionId, TicketId>,
    /// Connections told to disconnect during shutdown, still unwinding.
    undead: HashSet<ConnectionId>,
    next_torrent_id: TorrentId,
    next_conn_id: ConnectionId,
    connect_queue: ConnectionQueue,
    bandwidth: BandwidthManager,
    global_class: ClassId,
    disk: DiskHandle,
    disk_alerts: Fuse<disk::AlertReceiver>,
    event_chan: peer::EventSender,
    event_port: Fuse<peer::EventReceiver>,
    queue_chan: UnboundedSender<QueueEvent>,
    queue_port: Fuse<UnboundedReceiver<QueueEvent>>,
    alert_chan: AlertSender,
    cmd_port: Fuse<UnboundedReceiver<UserCommand>>,
    /// The bound listener, converted into a tokio listener once the session
    /// task is on the runtime.
    std_listener: Option<std::net::TcpListener>,
    listener: Option<TcpListener>,
    /// Seconds since the session started; timestamps are in this clock.
    session_time: u64,
    unchoke_countdown: u64,
    optimistic_countdown: u64,
    /// Votes for our external address from peers' `yourip` fields.
    external_ip_votes: HashMap<IpAddr, usize>,
    /// Message counters of connections that have closed.
    departed_msgs_received: [u64; NUM_MESSAGE_IDS],
    departed_msgs_sent: [u64; NUM_MESSAGE_IDS],
    aborting: bool,
    running: bool,
}

impl Session {
    async fn run(&mut self) {
        if let Some(std_listener) = self.std_listener.take() {
            match TcpListener::from_std(std_listener) {
                Ok(listener) => {
                    log::info!(
                        "Listening on {:?}",
                        listener.local_addr().ok()
                    );
                    self.listener = Some(listener);
                }
                Err(e) => {
                    log::error!("Failed to register listener: {}", e);
                }
            }
        }

        let mut tick = time::interval(Duration::from_secs(1)).fuse();
        while self.running {
            let turn = {
                // the futures below borrow disjoint fields, so hoist the
                // references out of the async blocks
                let listener = &mut self.listener;
                let accept_fut = async move {
                    match listener {
                        Some(listener) => listener.accept().await,
                        None => futures::future::pending().await,
                    }
                };
                pin_mut!(accept_fut);
                let mut accept_fut = accept_fut.fuse();

                let next_deadline = self.connect_queue.next_deadline();
                let deadline_fut = async move {
                    match next_deadline {
                        Some(deadline) => {
                            time::delay_until(time::Instant::from_std(
                                deadline,
                            ))
                            .await
                        }
                        None => futures::future::pending().await,
                    }
                };
                pin_mut!(deadline_fut);
                let mut deadline_fut = deadline_fut.fuse();

                select! {
                    cmd = self.cmd_port.next() => Turn::Cmd(cmd),
                    event = self.event_port.select_next_some() => {
                        Turn::PeerEvent(event)
                    }
                    event = self.queue_port.select_next_some() => {
                        Turn::QueueEvent(event)
                    }
                    alert = self.disk_alerts.select_next_some() => {
                        Turn::DiskAlert(alert)
                    }
                    accepted = accept_fut => Turn::Accepted(accepted),
                    _ = deadline_fut => Turn::QueueDeadline,
                    _ = tick.select_next_some() => Turn::Tick,
                }
            };

            match turn {
                Turn::Cmd(Some(cmd)) => self.handle_user_command(cmd),
                Turn::Cmd(None) => self.begin_abort(),
                Turn::PeerEvent(event) => self.handle_peer_event(event),
                Turn::QueueEvent(event) => self.handle_queue_event(event),
                Turn::DiskAlert(alert) => self.handle_disk_alert(alert),
                Turn::Accepted(accepted) => self.handle_accept(accepted),
                Turn::QueueDeadline => {
                    let runnables =
                        self.connect_queue.tick(Instant::now());
                    for r in runnables {
                        r();
                    }
                }
                Turn::Tick => self.tick(),
            }
        }
        log::info!("Session loop ended");
    }

    // ------------------------------------------------------------------
    // user commands
    // ------------------------------------------------------------------

    fn handle_user_command(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::AddTorrent(params) => self.add_torrent(*params),
            UserCommand::RemoveTorrent(id) => self.remove_torrent(id),
            UserCommand::ConnectPeer { id, addr } => {
                self.connect_to_peer(id, addr, 0);
            }
            UserCommand::Shutdown => self.begin_abort(),
        }
    }

    fn add_torrent(&mut self, params: TorrentParams) {
        let id = self.next_torrent_id;
        self.next_torrent_id += 1;

        let shared = SharedStatus {
            id,
            storage_id: id,
            info_hash: params.info_hash,
            client_id: self.client_id,
            storage: params.storage_info.clone(),
        };
        let torrent = Torrent::new(shared);
        if let Some(own_pieces) = &params.own_pieces {
            let mut picker =
                torrent.piece_picker.write().expect("piece picker poisoned");
            for (index, have) in own_pieces.iter().enumerate() {
                if *have {
                    picker.received_piece(index);
                }
            }
        }
        self.registry.insert(torrent.ctx());
        self.disk.new_torrent(
            id,
            params.storage_info,
            params.piece_hashes,
            params.storage,
        );
        self.torrents.insert(id, torrent);
        log::info!("Added torrent {}", id);
        let _ = self.alert_chan.send(Alert::TorrentAdded { id });

        for addr in params.peers {
            self.connect_to_peer(id, addr, 0);
        }
    }

    fn remove_torrent(&mut self, id: TorrentId) {
        let torrent = match self.torrents.remove(&id) {
            Some(torrent) => torrent,
            None => return,
        };
        log::info!("Removing torrent {}", id);
        self.registry.remove(&torrent.shared.info_hash);
        for (conn_id, chan) in &torrent.connections {
            if self.pending_sessions.remove(conn_id).is_some() {
                // never promoted: no task to unwind, just free the ticket
                if let Some(ticket) = self.queue_tickets.remove(conn_id) {
                    self.connect_queue.done(ticket);
                }
                self.cleanup_connection(
                    *conn_id,
                    DisconnectReason::TorrentRemoved,
                    Operation::Connect,
                );
            } else {
                let _ = chan.send(Command::Shutdown(
                    DisconnectReason::TorrentRemoved,
                ));
            }
        }
        self.disk.remove_torrent(id);
        let _ = self.alert_chan.send(Alert::TorrentRemoved { id });
    }

    // ------------------------------------------------------------------
    // outbound connections and the half-open queue
    // ------------------------------------------------------------------

    fn connect_to_peer(
        &mut self,
        torrent_id: TorrentId,
        addr: SocketAddr,
        priority: u8,
    ) {
        if self.aborting
            || self.conns.len() >= self.conf.network.connections_limit
        {
            return;
        }
        let torrent = match self.torrents.get_mut(&torrent_id) {
            Some(torrent) => torrent,
            None => return,
        };
        if torrent.is_stopping {
            return;
        }
        // one connection per endpoint
        if self
            .conns
            .values()
            .any(|c| c.addr == addr && c.torrent_id == Some(torrent_id))
        {
            return;
        }

        let peer = torrent.add_peer(addr);
        if peer.flags.banned {
            return;
        }
        let try_encrypted = match self.conf.encryption.out_enc_policy {
            EncPolicy::Forced => true,
            EncPolicy::Enabled => {
                let try_encrypted = peer.flags.pe_support;
                // toggled back on when an encrypted handshake completes, so
                // a failed attempt falls back to plaintext on reconnect
                peer.flags.pe_support = false;
                try_encrypted
            }
            EncPolicy::Disabled => false,
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let ctx = torrent.ctx();
        let (session, cmd_chan) = PeerSession::outbound(
            ctx,
            self.disk.clone(),
            self.event_chan.clone(),
            conn_id,
            addr,
            self.conf.encryption.clone(),
            self.conf.network.clone(),
            self.conf.engine.user_agent.clone(),
            try_encrypted,
        );
        torrent.connections.insert(conn_id, cmd_chan.clone());
        self.conns.insert(
            conn_id,
            ConnRecord::new(Some(torrent_id), addr, cmd_chan, true),
        );
        self.pending_sessions.insert(conn_id, session);

        // admission goes through the half-open limiter
        let connect_chan = self.queue_chan.clone();
        let timeout_chan = self.queue_chan.clone();
        let ticket = self.connect_queue.enqueue(
            Box::new(move |ticket| {
                let event = match ticket {
                    Some(ticket) => QueueEvent::Connect { conn_id, ticket },
                    None => QueueEvent::Aborted { conn_id },
                };
                let _ = connect_chan.send(event);
            }),
            Box::new(move || {
                let _ = timeout_chan.send(QueueEvent::Timeout { conn_id });
            }),
            self.conf.network.connect_timeout,
            priority,
        );
        self.queue_tickets.insert(conn_id, ticket);

        let runnables = self.connect_queue.try_connect(Instant::now());
        for r in runnables {
            r();
        }
    }

    fn handle_queue_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Connect { conn_id, ticket } => {
                if let Some(mut session) =
                    self.pending_sessions.remove(&conn_id)
                {
                    debug_assert_eq!(
                        self.queue_tickets.get(&conn_id),
                        Some(&ticket)
                    );
                    task::spawn(async move {
                        session.start_outbound().await;
                    });
                } else {
                    // the attempt was dropped (torrent removed) before its
                    // slot came up; free the slot
                    if self.queue_tickets.remove(&conn_id).is_some() {
                        self.connect_queue.done(ticket);
                    }
                }
            }
            QueueEvent::Aborted { conn_id } => {
                self.pending_sessions.remove(&conn_id);
                self.queue_tickets.remove(&conn_id);
                self.cleanup_connection(
                    conn_id,
                    DisconnectReason::StoppingTorrent,
                    Operation::Connect,
                );
            }
            QueueEvent::Timeout { conn_id } => {
                self.queue_tickets.remove(&conn_id);
                if let Some(session) = self.pending_sessions.remove(&conn_id)
                {
                    // never even got a slot
                    drop(session);
                    self.cleanup_connection(
                        conn_id,
                        DisconnectReason::TimedOut,
                        Operation::Connect,
                    );
                } else if let Some(record) = self.conns.get(&conn_id) {
                    let _ = record
                        .cmd
                        .send(Command::Shutdown(DisconnectReason::TimedOut));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // inbound connections
    // ------------------------------------------------------------------

    fn handle_accept(
        &mut self,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
    ) {
        let (socket, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Accept error: {}", e);
                return;
            }
        };
        if self.aborting {
            return;
        }
        // the slack lets us accept over the cap and sort out which
        // connection to drop later
        let cap = self.conf.network.connections_limit
            + self.conf.network.connections_slack;
        if self.conns.len() >= cap {
            log::info!("Refusing peer {}: connection limit", addr);
            let _ = self.alert_chan.send(Alert::PeerBlocked {
                addr,
                reason: DisconnectReason::TooManyConnections,
            });
            return;
        }

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let (mut session, cmd_chan) = PeerSession::inbound(
            Arc::new(self.registry.clone()),
            self.disk.clone(),
            self.event_chan.clone(),
            conn_id,
            addr,
            self.conf.encryption.clone(),
            self.conf.network.clone(),
            self.conf.engine.user_agent.clone(),
        );
        self.conns
            .insert(conn_id, ConnRecord::new(None, addr, cmd_chan, false));
        task::spawn(async move {
            session.start_inbound(socket).await;
        });
    }

    // ------------------------------------------------------------------
    // peer events
    // ------------------------------------------------------------------

    fn handle_peer_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                conn_id,
                torrent_id,
                addr,
                peer_id,
                encrypted,
                v2,
            } => self.on_peer_connected(
                conn_id, torrent_id, addr, peer_id, encrypted, v2,
            ),
            Event::Interest {
                conn_id,
                is_peer_interested,
            } => {
                if let Some(record) = self.conns.get_mut(&conn_id) {
                    record.is_peer_interested = is_peer_interested;
                }
            }
            Event::Status { conn_id, snapshot } => {
                if let Some(record) = self.conns.get_mut(&conn_id) {
                    record.is_peer_interested = snapshot.is_peer_interested;
                    record.is_peer_choked = snapshot.is_peer_choked;
                    record.download_rate = snapshot.download_rate;
                    record.is_seed = snapshot.is_seed;
                    record.msgs_received = snapshot.msgs_received;
                    record.msgs_sent = snapshot.msgs_sent;
                    record.downloaded_payload = snapshot.downloaded_payload;
                    record.uploaded_payload = snapshot.uploaded_payload;
                    record.downloaded_protocol =
                        snapshot.downloaded_protocol;
                    record.uploaded_protocol = snapshot.uploaded_protocol;
                }
            }
            Event::YourIp { conn_id, ip } => {
                *self.external_ip_votes.entry(ip).or_insert(0) += 1;
                log::debug!(
                    "Peer {} says our address is {}",
                    conn_id,
                    ip
                );
            }
            Event::HolepunchRendezvous { conn_id, target } => {
                self.on_holepunch_rendezvous(conn_id, target);
            }
            Event::HolepunchConnect { conn_id, addr } => {
                // a relay introduced us: connect with queue priority
                if let Some(torrent_id) = self
                    .conns
                    .get(&conn_id)
                    .and_then(|record| record.torrent_id)
                {
                    self.connect_to_peer(torrent_id, addr, 1);
                }
            }
            Event::BandwidthRequest { conn_id, amount } => {
                let granted = self.bandwidth.request(
                    conn_id,
                    &[self.global_class],
                    Channel::Upload,
                    amount as u64,
                );
                if granted > 0 {
                    if let Some(record) = self.conns.get(&conn_id) {
                        let _ = record
                            .cmd
                            .send(Command::BandwidthGrant(granted as usize));
                    }
                }
            }
            Event::Disconnected {
                conn_id,
                addr: _,
                reason,
                op,
            } => {
                self.on_peer_disconnected(conn_id, reason, op);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_peer_connected(
        &mut self,
        conn_id: ConnectionId,
        torrent_id: TorrentId,
        addr: SocketAddr,
        peer_id: PeerId,
        encrypted: bool,
        v2: bool,
    ) {
        // an inbound connection resolved its torrent during the handshake
        let torrent = match self.torrents.get_mut(&torrent_id) {
            Some(torrent) => torrent,
            None => return,
        };

        // only one connection per peer id and torrent
        let duplicate = self.conns.iter().any(|(id, record)| {
            *id != conn_id
                && record.torrent_id == Some(torrent_id)
                && record.peer_id == Some(peer_id)
        });
        if duplicate {
            if let Some(record) = self.conns.get(&conn_id) {
                let _ = record.cmd.send(Command::Shutdown(
                    DisconnectReason::DuplicatePeerId,
                ));
            }
            return;
        }

        if let Some(record) = self.conns.get_mut(&conn_id) {
            record.torrent_id = Some(torrent_id);
            record.peer_id = Some(peer_id);
            record.is_connected = true;
            torrent.connections.insert(conn_id, record.cmd.clone());
        }

        let peer = torrent.add_peer(addr);
        peer.peer_id = Some(peer_id);
        peer.failcount = 0;
        peer.flags.protocol_v2 = v2;
        if encrypted {
            peer.flags.pe_support = true;
        }
        log::debug!(
            "Peer {} record: v2 {} utp {} pe {}",
            addr,
            peer.flags.protocol_v2,
            peer.flags.supports_utp,
            peer.flags.pe_support
        );

        // the connect attempt is no longer half open
        if let Some(ticket) = self.queue_tickets.remove(&conn_id) {
            self.connect_queue.done(ticket);
            let runnables = self.connect_queue.try_connect(Instant::now());
            for r in runnables {
                r();
            }
        }

        log::info!("Peer {} joined torrent {}", addr, torrent_id);
        let _ = self.alert_chan.send(Alert::PeerConnected {
            id: torrent_id,
            addr,
            peer_id,
            encrypted,
        });
    }

    fn on_peer_disconnected(
        &mut self,
        conn_id: ConnectionId,
        reason: DisconnectReason,
        op: Operation,
    ) {
        if let Some(ticket) = self.queue_tickets.remove(&conn_id) {
            self.connect_queue.done(ticket);
            let runnables = self.connect_queue.try_connect(Instant::now());
            for r in runnables {
                r();
            }
        }
        self.cleanup_connection(conn_id, reason, op);
    }

    fn cleanup_connection(
        &mut self,
        conn_id: ConnectionId,
        reason: DisconnectReason,
        op: Operation,
    ) {
        let record = match self.conns.remove(&conn_id) {
            Some(record) => record,
            None => return,
        };
        log::debug!(
            "Dropping {} connection {} to {} ({})",
            if record.is_outbound { "outbound" } else { "inbound" },
            conn_id,
            record.addr,
            reason
        );
        // the closed connection's message counters keep counting
        for i in 0..NUM_MESSAGE_IDS {
            self.departed_msgs_received[i] += record.msgs_received[i];
            self.departed_msgs_sent[i] += record.msgs_sent[i];
        }

        if let Some(torrent_id) = record.torrent_id {
            if let Some(torrent) = self.torrents.get_mut(&torrent_id) {
                torrent.connections.remove(&conn_id);
                let peer = torrent.add_peer(record.addr);
                peer.flags.seed = record.is_seed;
                peer.flags.optimistically_unchoked = false;
                if record.is_connected {
                    // an established connection that ends isn't a failure
                    // of the peer
                    if reason == DisconnectReason::PeerError {
                        peer.failcount += 1;
                    }
                } else {
                    peer.failcount += 1;
                }
                let _ = self.alert_chan.send(Alert::PeerDisconnected {
                    id: torrent_id,
                    addr: record.addr,
                    reason,
                    op,
                });
            }
        }

        self.undead.remove(&conn_id);
        if self.aborting && self.undead.is_empty() {
            self.finish_abort();
        }
    }

    fn on_holepunch_rendezvous(
        &mut self,
        conn_id: ConnectionId,
        target: SocketAddr,
    ) {
        let torrent_id = match self
            .conns
            .get(&conn_id)
            .and_then(|record| record.torrent_id)
        {
            Some(id) => id,
            None => return,
        };
        let source_addr = self.conns[&conn_id].addr;

        // the target has to be one of our connections in the same torrent
        let target_conn = self.conns.values().find(|record| {
            record.torrent_id == Some(torrent_id)
                && record.addr == target
                && record.is_connected
        });
        match target_conn {
            Some(target_record) => {
                // introduce both ends to each other
                let _ = target_record.cmd.send(Command::SendHolepunch(
                    Holepunch::Connect { addr: source_addr },
                ));
                let source = &self.conns[&conn_id];
                let _ = source.cmd.send(Command::SendHolepunch(
                    Holepunch::Connect { addr: target },
                ));
            }
            None => {
                // NOT_CONNECTED
                let source = &self.conns[&conn_id];
                let _ = source.cmd.send(Command::SendHolepunch(
                    Holepunch::Failed {
                        addr: target,
                        error: 1,
                    },
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // disk alerts
    // ------------------------------------------------------------------

    fn handle_disk_alert(&mut self, alert: disk::Alert) {
        match alert {
            disk::Alert::PieceCompletion {
                id,
                piece_index,
                is_valid,
            } => {
                let torrent = match self.torrents.get_mut(&id) {
                    Some(torrent) => torrent,
                    None => return,
                };
                if is_valid {
                    torrent
                        .piece_picker
                        .write()
                        .expect("piece picker poisoned")
                        .received_piece(piece_index);
                    // announce to everyone who might want it
                    for chan in torrent.connections.values() {
                        let _ = chan.send(Command::NewPiece(piece_index));
                    }
                    let _ = self.alert_chan.send(Alert::PieceFinished {
                        id,
                        piece_index,
                    });
                } else {
                    torrent
                        .piece_picker
                        .write()
                        .expect("piece picker poisoned")
                        .piece_failed(piece_index);
                    let _ = self
                        .alert_chan
                        .send(Alert::PieceFailed { id, piece_index });
                }
            }
            disk::Alert::StorageFailure {
                id,
                piece_index,
                error,
            } => {
                log::error!(
                    "Torrent {} storage failure on piece {:?}: {}",
                    id,
                    piece_index,
                    error
                );
                if let Some(piece_index) = piece_index {
                    if let Some(torrent) = self.torrents.get(&id) {
                        torrent
                            .piece_picker
                            .write()
                            .expect("piece picker poisoned")
                            .piece_failed(piece_index);
                    }
                }
                let _ = self
                    .alert_chan
                    .send(Alert::StorageFailure { id, error });
            }
            disk::Alert::Stats(cache_counters) => {
                self.counters.merge_from(
                    &cache_counters,
                    &[
                        Counter::WriteCacheBlocks,
                        Counter::ReadCacheBlocks,
                        Counter::PinnedBlocks,
                        Counter::ArcMruSize,
                        Counter::ArcMruGhostSize,
                        Counter::ArcMfuSize,
                        Counter::ArcMfuGhostSize,
                        Counter::ArcWriteSize,
                        Counter::ArcVolatileSize,
                    ],
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // the tick: timeouts, choking, bandwidth, accounting
    // ------------------------------------------------------------------

    fn tick(&mut self) {
        self.session_time += 1;

        // refill the rate limiters and resume parked writers
        let resumed = self.bandwidth.tick(Duration::from_secs(1));
        for (conn_id, granted) in resumed {
            if let Some(record) = self.conns.get(&conn_id) {
                let _ = record
                    .cmd
                    .send(Command::BandwidthGrant(granted as usize));
            }
        }

        self.disk.tick();
        self.disk.stats();

        if !self.aborting {
            self.unchoke_countdown =
                self.unchoke_countdown.saturating_sub(1);
            if self.unchoke_countdown == 0 {
                self.unchoke_countdown =
                    self.conf.choker.unchoke_interval.as_secs().max(1);
                self.recalculate_unchoke_slots();
            }
            self.optimistic_countdown =
                self.optimistic_countdown.saturating_sub(1);
            if self.optimistic_countdown == 0 {
                self.optimistic_countdown = self
                    .conf
                    .choker
                    .optimistic_unchoke_interval
                    .as_secs()
                    .max(1);
                self.recalculate_optimistic_unchoke_slots();
            }

            self.connect_more_peers();
        }

        self.update_transfer_counters();

        // the queue's deadline timer piggybacks on the tick as a backstop
        let runnables = self.connect_queue.tick(Instant::now());
        for r in runnables {
            r();
        }
    }

    fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        self.conns
            .iter()
            .filter(|(_, record)| record.torrent_id.is_some())
            .map(|(conn_id, record)| {
                let last_optimistic = record
                    .torrent_id
                    .and_then(|id| self.torrents.get(&id))
                    .and_then(|t| t.peers.get(&record.addr))
                    .map(|p| p.last_optimistically_unchoked)
                    .unwrap_or(0);
                PeerSnapshot {
                    id: *conn_id,
                    is_peer_interested: record.is_peer_interested,
                    is_choked: record.is_peer_choked,
                    is_connecting: !record.is_connected,
                    is_disconnecting: self.undead.contains(conn_id),
                    has_metadata: true,
                    ignore_unchoke_slots: false,
                    optimistically_unchoked: record.optimistically_unchoked,
                    last_optimistically_unchoked: last_optimistic,
                    priority: 0,
                    download_rate: record.download_rate,
                    time_of_last_unchoke: 0,
                }
            })
            .collect()
    }

    fn recalculate_unchoke_slots(&mut self) {
        let snapshots = self.peer_snapshots();
        let num_optimistic = self
            .counters
            .get(Counter::NumPeersUpUnchokedOptimistic)
            as usize;
        let decision = unchoke::recalculate_unchoke_slots(
            &snapshots,
            &self.conf.choker,
            num_optimistic,
        );
        self.apply_choke_decision(decision);
    }

    fn recalculate_optimistic_unchoke_slots(&mut self) {
        let snapshots = self.peer_snapshots();
        let allowed = self.counters.get(Counter::NumUnchokeSlots);
        let decision = unchoke::recalculate_optimistic_unchoke_slots(
            &snapshots,
            &self.conf.choker,
            if allowed == 0 {
                self.conf.choker.unchoke_slots_limit.max(0) as u64
            } else {
                allowed
            },
        );
        self.apply_choke_decision(decision);
    }

    fn apply_choke_decision(&mut self, decision: ChokeDecision) {
        self.counters
            .set(Counter::NumUnchokeSlots, decision.num_unchoke_slots);

        for conn_id in &decision.clear_optimistic {
            if let Some(record) = self.conns.get_mut(conn_id) {
                record.optimistically_unchoked = false;
            }
        }
        for conn_id in &decision.set_optimistic {
            if let Some(record) = self.conns.get_mut(conn_id) {
                record.optimistically_unchoked = true;
                let addr = record.addr;
                let session_time = self.session_time;
                if let Some(torrent) = record
                    .torrent_id
                    .and_then(|id| self.torrents.get_mut(&id))
                {
                    torrent.add_peer(addr).last_optimistically_unchoked =
                        session_time;
                    torrent.add_peer(addr).flags.optimistically_unchoked =
                        true;
                }
            }
        }
        for conn_id in &decision.unchoke {
            if let Some(record) = self.conns.get_mut(conn_id) {
                record.is_peer_choked = false;
                let _ = record.cmd.send(Command::Unchoke);
            }
        }
        for conn_id in &decision.choke {
            if let Some(record) = self.conns.get_mut(conn_id) {
                record.is_peer_choked = true;
                let _ = record.cmd.send(Command::Choke);
            }
        }

        let unchoked = self
            .conns
            .values()
            .filter(|record| !record.is_peer_choked)
            .count() as u64;
        let optimistic = self
            .conns
            .values()
            .filter(|record| record.optimistically_unchoked)
            .count() as u64;
        self.counters.set(
            Counter::NumPeersUpUnchoked,
            unchoked.saturating_sub(optimistic),
        );
        self.counters
            .set(Counter::NumPeersUpUnchokedOptimistic, optimistic);
        self.counters.set(Counter::NumPeersUpUnchokedAll, unchoked);

        if decision.force_optimistic_recalc {
            self.optimistic_countdown = 0;
        }
    }

    /// Tops up each torrent's connections from its known peers.
    fn connect_more_peers(&mut self) {
        let limit = self.conf.network.connections_limit;
        if self.conns.len() >= limit {
            return;
        }
        let mut candidates: Vec<(TorrentId, SocketAddr)> = Vec::new();
        for (id, torrent) in &self.torrents {
            if torrent.is_stopping {
                continue;
            }
            let we_are_seed = torrent.is_seed();
            for (addr, peer) in &torrent.peers {
                if peer.flags.banned || peer.failcount >= 5 {
                    continue;
                }
                // no point dialing a fellow seed just to hang up
                if we_are_seed
                    && peer.flags.seed
                    && self.conf.network.close_redundant_connections
                {
                    continue;
                }
                let connected = self.conns.values().any(|record| {
                    record.addr == *addr
                        && record.torrent_id == Some(*id)
                });
                if !connected {
                    candidates.push((*id, *addr));
                }
            }
        }
        for (id, addr) in candidates {
            if self.conns.len() >= limit {
                break;
            }
            self.connect_to_peer(id, addr, 0);
        }
    }

    /// Aggregates per-connection transfer and message counters into the
    /// session counters.
    fn update_transfer_counters(&mut self) {
        let mut received = self.departed_msgs_received;
        let mut sent = self.departed_msgs_sent;
        let mut payload_down = 0;
        let mut payload_up = 0;
        let mut protocol_down = 0;
        let mut protocol_up = 0;
        for record in self.conns.values() {
            for i in 0..NUM_MESSAGE_IDS {
                received[i] += record.msgs_received[i];
                sent[i] += record.msgs_sent[i];
            }
            payload_down += record.downloaded_payload;
            payload_up += record.uploaded_payload;
            protocol_down += record.downloaded_protocol;
            protocol_up += record.uploaded_protocol;
        }
        self.counters
            .set(Counter::TotalPayloadDownload, payload_down);
        self.counters.set(Counter::TotalPayloadUpload, payload_up);
        self.counters
            .set(Counter::TotalProtocolDownload, protocol_down);
        self.counters
            .set(Counter::TotalProtocolUpload, protocol_up);

        for (id, (in_counter, out_counter)) in message_counters() {
            self.counters.set(in_counter, received[id]);
            self.counters.set(out_counter, sent[id]);
        }
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    /// Stage one: stop listening and queuing, disconnect everyone, and wait
    /// for the undead list to drain.
    fn begin_abort(&mut self) {
        if self.aborting {
            return;
        }
        log::info!("Session abort: stage one");
        self.listener = None;

        let runnables = self.connect_queue.close();
        for r in runnables {
            r();
        }

        // attempts that never got a half-open slot have no task to unwind
        let pending: Vec<ConnectionId> =
            self.pending_sessions.keys().copied().collect();
        self.pending_sessions.clear();
        for conn_id in pending {
            self.queue_tickets.remove(&conn_id);
            self.cleanup_connection(
                conn_id,
                DisconnectReason::StoppingTorrent,
                Operation::Connect,
            );
        }

        self.aborting = true;
        self.undead = self.conns.keys().copied().collect();
        for record in self.conns.values() {
            let _ = record.cmd.send(Command::Shutdown(
                DisconnectReason::StoppingTorrent,
            ));
        }

        if self.undead.is_empty() {
            self.finish_abort();
        }
    }

    /// Stage two: every peer has unwound, so the rest can be torn down
    /// safely.
    fn finish_abort(&mut self) {
        log::info!("Session abort: stage two");
        self.disk.shutdown();
        let _ = self.alert_chan.send(Alert::ShutdownComplete);
        self.running = false;
    }
}

/// Maps a message id to its receive and send counters.
fn message_counters() -> Vec<(usize, (Counter, Counter))> {
    use Counter::*;
    vec![
        (0, (NumIncomingChoke, NumOutgoingChoke)),
        (1, (NumIncomingUnchoke, NumOutgoingUnchoke)),
        (2, (NumIncomingInterested, NumOutgoingInterested)),
        (3, (NumIncomingNotInterested, NumOutgoingNotInterested)),
        (4, (NumIncomingHave, NumOutgoingHave)),
        (5, (NumIncomingBitfield, NumOutgoingBitfield)),
        (6, (NumIncomingRequest, NumOutgoingRequest)),
        (7, (NumIncomingPiece, NumOutgoingPiece)),
        (8, (NumIncomingCancel, NumOutgoingCancel)),
        (9, (NumIncomingDhtPort, NumOutgoingDhtPort)),
        (13, (NumIncomingSuggest, NumOutgoingSuggest)),
        (14, (NumIncomingHaveAll, NumOutgoingHaveAll)),
        (15, (NumIncomingHaveNone, NumOutgoingHaveNone)),
        (16, (NumIncomingRejectRequest, NumOutgoingRejectRequest)),
        (17, (NumIncomingAllowedFast, NumOutgoingAllowedFast)),
        (20, (NumIncomingExtended, NumOutgoingExtended)),
        (21, (NumIncomingHashRequest, NumOutgoingHashRequest)),
        (22, (NumIncomingHashes, NumOutgoingHashes)),
        (23, (NumIncomingHashReject, NumOutgoingHashReject)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alert::Alert, storage::test_util::MemStorage, BLOCK_LEN};

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;
    const PIECE_COUNT: usize = 3;

    struct TorrentData {
        info_hash: Sha1Hash,
        pieces: Vec<Vec<u8>>,
        piece_hashes: Vec<u8>,
    }

    impl TorrentData {
        fn new() -> Self {
            let pieces: Vec<Vec<u8>> = (0..PIECE_COUNT)
                .map(|p| {
                    (0..PIECE_LEN).map(|b| ((b + p as u32) % 247) as u8).collect()
                })
                .collect();
            let mut piece_hashes = Vec::with_capacity(PIECE_COUNT * 20);
            for piece in &pieces {
                let hash: [u8; 20] = Sha1::digest(piece).into();
                piece_hashes.extend_from_slice(&hash);
            }
            Self {
                info_hash: [0x5e; 20],
                pieces,
                piece_hashes,
            }
        }

        fn params(
            &self,
            seeded: bool,
            peers: Vec<SocketAddr>,
        ) -> TorrentParams {
            let mut storage = MemStorage::new(PIECE_LEN);
            let mut own_pieces = None;
            if seeded {
                for (index, piece) in self.pieces.iter().enumerate() {
                    storage.pieces.insert(index, piece.clone());
                }
                let mut pieces = Bitfield::with_capacity(PIECE_COUNT);
                pieces.resize(PIECE_COUNT, true);
                own_pieces = Some(pieces);
            }
            TorrentParams {
                info_hash: self.info_hash,
                piece_hashes: self.piece_hashes.clone(),
                storage_info: StorageInfo::new(
                    PIECE_LEN,
                    PIECE_COUNT as u64 * PIECE_LEN as u64,
                    Vec::new(),
                ),
                storage: Box::new(storage),
                own_pieces,
                peers,
            }
        }
    }

    fn fast_conf() -> Conf {
        let mut conf = Conf::default();
        conf.choker.unchoke_interval = Duration::from_secs(1);
        conf.choker.optimistic_unchoke_interval = Duration::from_secs(2);
        // make the MSE negotiation land on RC4 so the whole payload path
        // runs encrypted
        conf.encryption.prefer_rc4 = true;
        conf
    }

    /// A seeding session and a downloading session talk to each other over
    /// localhost, through the full MSE handshake, until every piece has
    /// been downloaded and verified.
    #[tokio::test]
    async fn test_download_between_two_sessions() {
        let data = TorrentData::new();

        let (_seed_join, seed, mut seed_alerts) =
            spawn(fast_conf(), Some("127.0.0.1:0".parse().unwrap()));
        let seed_addr = seed.local_addr().expect("seed isn't listening");
        seed.add_torrent(data.params(true, Vec::new()));
        match seed_alerts.recv().await.unwrap() {
            Alert::TorrentAdded { .. } => {}
            alert => panic!("unexpected alert: {:?}", alert),
        }

        let (_dl_join, downloader, mut dl_alerts) = spawn(fast_conf(), None);
        downloader.add_torrent(data.params(false, vec![seed_addr]));

        let wait_for_download = async {
            let mut finished = 0;
            while finished < PIECE_COUNT {
                match dl_alerts.recv().await.expect("session died") {
                    Alert::PieceFinished { .. } => finished += 1,
                    Alert::PieceFailed { .. } => {
                        panic!("a piece failed its hash check")
                    }
                    Alert::PeerDisconnected { reason, .. } => {
                        panic!("peer disconnected: {}", reason)
                    }
                    alert => log::debug!("alert: {:?}", alert),
                }
            }
        };
        time::timeout(Duration::from_secs(60), wait_for_download)
            .await
            .expect("download timed out");

        downloader.shutdown();
        seed.shutdown();
    }

    #[tokio::test]
    async fn test_add_and_remove_torrent_alerts() {
        let data = TorrentData::new();
        let (_join, handle, mut alerts) = spawn(fast_conf(), None);

        handle.add_torrent(data.params(false, Vec::new()));
        match alerts.recv().await.unwrap() {
            Alert::TorrentAdded { id } => assert_eq!(id, 0),
            alert => panic!("unexpected alert: {:?}", alert),
        }

        handle.remove_torrent(0);
        match alerts.recv().await.unwrap() {
            Alert::TorrentRemoved { id } => assert_eq!(id, 0),
            alert => panic!("unexpected alert: {:?}", alert),
        }

        handle.shutdown();
        loop {
            match alerts.recv().await {
                Some(Alert::ShutdownComplete) | None => break,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_without_torrents_completes() {
        let (_join, handle, mut alerts) = spawn(Conf::default(), None);
        handle.shutdown();
        assert!(matches!(
            alerts.recv().await,
            Some(Alert::ShutdownComplete)
        ));
    }

}
