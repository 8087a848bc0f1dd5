//! Alerts the engine surfaces to the embedding program.
//!
//! One flat tagged union instead of a class hierarchy: the session owns the
//! sending half of an unbounded channel and the embedder consumes the
//! receiving half at its leisure.

use std::net::SocketAddr;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    error::{DisconnectReason, Operation},
    storage::StorageError,
    PeerId, PieceIndex, TorrentId,
};

/// The channel on which the session emits alerts.
pub(crate) type AlertSender = UnboundedSender<Alert>;
/// The channel on which the embedding program receives alerts.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// An event worth telling the embedding program about.
#[derive(Debug)]
pub enum Alert {
    /// A torrent was added to the session.
    TorrentAdded { id: TorrentId },
    /// A torrent was removed; its peers have been disconnected.
    TorrentRemoved { id: TorrentId },
    /// A peer connection completed its handshake.
    PeerConnected {
        id: TorrentId,
        addr: SocketAddr,
        peer_id: PeerId,
        /// Whether the connection negotiated RC4 payload encryption.
        encrypted: bool,
    },
    /// A peer connection was torn down.
    PeerDisconnected {
        id: TorrentId,
        addr: SocketAddr,
        reason: DisconnectReason,
        op: Operation,
    },
    /// An inbound peer was refused before a connection was established.
    PeerBlocked {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    /// A piece was fully downloaded and passed its hash check.
    PieceFinished {
        id: TorrentId,
        piece_index: PieceIndex,
    },
    /// A piece failed its hash check and will be re-downloaded.
    PieceFailed {
        id: TorrentId,
        piece_index: PieceIndex,
    },
    /// Storage reported an error; the torrent may pause itself.
    StorageFailure {
        id: TorrentId,
        error: StorageError,
    },
    /// The session finished its two stage shutdown.
    ShutdownComplete,
}
