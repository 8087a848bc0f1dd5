//! Per-torrent state: the persistent peer list, the live connections, and
//! the status shared with the torrent's peer sessions.
//!
//! Ownership is deliberately one-way: the torrent owns the handles to its
//! connections (the channel senders), while each connection holds only the
//! shared status and reports back over its event channel. Disconnecting a
//! peer drops the torrent's handle; the session task unwinds on its own.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use crate::{
    peer, piece_picker::PiecePicker, storage_info::StorageInfo, PeerId,
    Sha1Hash, StorageId, TorrentId,
};

/// Immutable torrent information shared with every peer session of the
/// torrent.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    /// The id the block cache files this torrent's blocks under.
    pub storage_id: StorageId,
    pub info_hash: Sha1Hash,
    /// Our own peer id, presented in handshakes.
    pub client_id: PeerId,
    pub storage: StorageInfo,
}

/// The flags of a persistent peer record.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PeerFlags {
    pub banned: bool,
    pub seed: bool,
    pub supports_utp: bool,
    pub supports_extensions: bool,
    pub protocol_v2: bool,
    pub optimistically_unchoked: bool,
    /// Whether an encrypted outgoing handshake should be attempted; toggled
    /// off when an attempt starts and back on when one succeeds, so a
    /// failed encrypted attempt falls back to plaintext on reconnect.
    pub pe_support: bool,
}

/// A torrent-scope peer record. Lives across reconnects; the live
/// connection, if any, is tracked separately.
#[derive(Clone, Debug)]
pub(crate) struct TorrentPeer {
    pub addr: SocketAddr,
    /// The id the peer presented in its last completed handshake.
    pub peer_id: Option<PeerId>,
    /// Consecutive connection failures; cleared by a completed handshake.
    pub failcount: u32,
    pub flags: PeerFlags,
    /// Session time of the last optimistic unchoke, for rotation.
    pub last_optimistically_unchoked: u64,
}

impl TorrentPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
            failcount: 0,
            flags: PeerFlags {
                pe_support: true,
                ..PeerFlags::default()
            },
            last_optimistically_unchoked: 0,
        }
    }
}

/// The parts of a torrent shared with its peer session tasks: the
/// immutable status plus the piece picker.
#[derive(Clone)]
pub(crate) struct TorrentCtx {
    pub shared: Arc<SharedStatus>,
    pub piece_picker: Arc<RwLock<PiecePicker>>,
}

/// A torrent in the session.
pub(crate) struct Torrent {
    pub shared: Arc<SharedStatus>,
    /// Shared with the torrent's peer sessions.
    pub piece_picker: Arc<RwLock<PiecePicker>>,
    /// Known peers, connected or not.
    pub peers: HashMap<SocketAddr, TorrentPeer>,
    /// Command channels of the live connections, by connection id.
    pub connections: HashMap<usize, peer::Sender>,
    /// Set while the torrent is being stopped; new connections are refused.
    pub is_stopping: bool,
}

impl Torrent {
    pub fn new(shared: SharedStatus) -> Self {
        let piece_count = shared.storage.piece_count;
        Self {
            shared: Arc::new(shared),
            piece_picker: Arc::new(RwLock::new(PiecePicker::new(piece_count))),
            peers: HashMap::new(),
            connections: HashMap::new(),
            is_stopping: false,
        }
    }

    /// The context handed to this torrent's peer sessions.
    pub fn ctx(&self) -> TorrentCtx {
        TorrentCtx {
            shared: Arc::clone(&self.shared),
            piece_picker: Arc::clone(&self.piece_picker),
        }
    }

    /// Records a peer if it isn't known yet and returns its record.
    pub fn add_peer(&mut self, addr: SocketAddr) -> &mut TorrentPeer {
        self.peers.entry(addr).or_insert_with(|| TorrentPeer::new(addr))
    }

    /// Whether we have all pieces, in which case seed-to-seed connections
    /// are redundant.
    pub fn is_seed(&self) -> bool {
        self.piece_picker.read().expect("piece picker poisoned").is_seed()
    }
}
