//! Crate-wide error types and the disconnect-reason taxonomy.

use std::fmt;

use tokio::sync::mpsc;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// An IO error ocurred on a socket or timer.
    Io(std::io::Error),
    /// A channel between two engine tasks was closed. This happens during
    /// shutdown and is not recoverable.
    ChannelClosed,
    /// A command referred to a torrent id the session doesn't know about.
    InvalidTorrentId,
    /// An attempt was made to add a torrent that is already in the session.
    TorrentAlreadyExists,
    /// The block buffer pool is exhausted. The operation should be retried
    /// once buffers have been freed.
    WouldBlock,
    /// A peer misbehaved or the connection had to be torn down; the reason
    /// says why and the operation says during what.
    Disconnect {
        reason: DisconnectReason,
        op: Operation,
    },
    /// Failed to encode or decode the bencoded extension handshake.
    Bencode(serde_bencode::Error),
}

impl Error {
    pub(crate) fn disconnect(reason: DisconnectReason, op: Operation) -> Self {
        Self::Disconnect { reason, op }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::TorrentAlreadyExists => write!(f, "torrent already exists"),
            Self::WouldBlock => write!(f, "buffer pool exhausted"),
            Self::Disconnect { reason, op } => {
                write!(f, "disconnected ({}) during {}", reason, op)
            }
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

/// The closed taxonomy of reasons a peer connection is torn down.
///
/// Every disconnect carries exactly one of these; anything that doesn't have
/// a more specific reason uses `InvalidMessage` (for parse violations) or
/// `PeerError` (for socket level failures).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A choke-family message arrived when it was not allowed.
    InvalidChoke,
    /// The peer's bitfield length doesn't match the torrent's piece count.
    InvalidBitfieldSize,
    /// The info hash in the peer's handshake isn't one of our torrents'.
    InvalidInfoHash,
    /// The remote peer id is our own: we connected to ourselves.
    SelfConnection,
    /// Another connection with the same peer id already exists.
    DuplicatePeerId,
    /// Plaintext connections are not accepted by the incoming encryption
    /// policy.
    NoIncomingRegular,
    /// The peer proposed or selected an encryption mode we don't allow.
    UnsupportedEncryptionMode,
    /// The session is at its connection limit.
    TooManyConnections,
    /// The torrent the peer belongs to was removed from the session.
    TorrentRemoved,
    /// The torrent the peer belongs to is shutting down.
    StoppingTorrent,
    /// The peer didn't complete a step within its allotted time.
    TimedOut,
    /// The socket failed underneath the connection.
    PeerError,
    /// Catch-all for protocol violations in a received message.
    InvalidMessage,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::InvalidChoke => "invalid choke message",
            Self::InvalidBitfieldSize => "invalid bitfield size",
            Self::InvalidInfoHash => "invalid info hash",
            Self::SelfConnection => "self connection",
            Self::DuplicatePeerId => "duplicate peer id",
            Self::NoIncomingRegular => "plaintext connections disabled",
            Self::UnsupportedEncryptionMode => "unsupported encryption mode",
            Self::TooManyConnections => "too many connections",
            Self::TorrentRemoved => "torrent removed",
            Self::StoppingTorrent => "stopping torrent",
            Self::TimedOut => "timed out",
            Self::PeerError => "peer error",
            Self::InvalidMessage => "invalid message",
        };
        f.write_str(s)
    }
}

/// The operation during which a connection failed. Purely diagnostic, it
/// shows up in logs and alerts next to the disconnect reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Handshake,
    Encryption,
    Receive,
    Send,
    Bittorrent,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Handshake => "handshake",
            Self::Encryption => "encryption",
            Self::Receive => "receive",
            Self::Send => "send",
            Self::Bittorrent => "bittorrent",
        };
        f.write_str(s)
    }
}
