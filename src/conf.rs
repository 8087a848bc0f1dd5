//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::PeerId;

/// The default riptorrent client id prefix. The remaining bytes are
/// randomized per session.
pub const RIPTORRENT_CLIENT_ID: &PeerId = b"-rp0100-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub cache: CacheConf,
    pub network: NetworkConf,
    pub choker: ChokerConf,
    pub encryption: EncryptionConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            engine: EngineConf::default(),
            cache: CacheConf::default(),
            network: NetworkConf::default(),
            choker: ChokerConf::default(),
            encryption: EncryptionConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to present to other peers. The session randomizes
    /// the trailing bytes on startup.
    pub client_id: PeerId,
    /// A string identifying the client and version in the extended handshake.
    pub user_agent: String,
    /// The Azureus-style fingerprint written into the leading bytes of
    /// generated peer ids; the rest is randomized per session.
    pub peer_fingerprint: [u8; 8],
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id: *RIPTORRENT_CLIENT_ID,
            user_agent: "riptorrent/0.1".to_string(),
            peer_fingerprint: *b"-rp0100-",
        }
    }
}

/// Configuration of the block cache.
#[derive(Clone, Debug)]
pub struct CacheConf {
    /// Upper bound on resident cached blocks, across the read and write
    /// caches.
    pub cache_size: usize,
    /// The unit by which the ARC balance parameter is nudged on a ghost hit,
    /// in blocks. It is further scaled by the ratio of the ghost list sizes.
    pub arc_balance_step: usize,
    /// Read-cache entries untouched for this long are evicted on tick.
    pub cache_expiry: Duration,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            // 16 MiB with the canonical 16 KiB blocks
            cache_size: 1024,
            arc_balance_step: 1,
            cache_expiry: Duration::from_secs(300),
        }
    }
}

/// Configuration of connection management: limits, queues, timeouts.
#[derive(Clone, Debug)]
pub struct NetworkConf {
    /// Hard cap on concurrent peer connections.
    pub connections_limit: usize,
    /// How many connections over the limit may be accepted temporarily, to
    /// give the session a chance to replace a worse connection with a better
    /// one.
    pub connections_slack: usize,
    /// At most this many outbound connection attempts may be half-open at
    /// a time. Zero means unlimited.
    pub half_open_limit: usize,
    /// How long a silent peer may sit between our handshake and its reply.
    pub handshake_timeout: Duration,
    /// The timeout given to each queued connection attempt.
    pub connect_timeout: Duration,
    /// The most block requests a peer may keep queued with us.
    pub max_allowed_in_request_queue: usize,
    /// The most block requests we keep outstanding towards a single peer,
    /// unless the peer advertises a different `reqq`.
    pub max_out_request_queue: usize,
    /// Whether to disconnect peers that can be of no use to each other, i.e.
    /// seed-to-seed connections.
    pub close_redundant_connections: bool,
    /// A keep-alive is written after this much send inactivity.
    pub keep_alive_interval: Duration,
    /// Session-wide upload rate cap in bytes per second; zero is unlimited.
    pub upload_rate_limit: u64,
    /// Session-wide download rate cap in bytes per second; zero is
    /// unlimited.
    pub download_rate_limit: u64,
}

impl Default for NetworkConf {
    fn default() -> Self {
        Self {
            connections_limit: 200,
            connections_slack: 10,
            half_open_limit: 0,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            max_allowed_in_request_queue: 500,
            max_out_request_queue: 500,
            close_redundant_connections: true,
            keep_alive_interval: Duration::from_secs(120),
            upload_rate_limit: 0,
            download_rate_limit: 0,
        }
    }
}

/// The algorithm deciding which interested peers get upload slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChokingAlgorithm {
    /// Round-robin between peers over a fixed number of slots.
    FixedSlots,
    /// Prefer the peers we download the fastest from.
    RateBased,
    /// The BitTyrant unchoker; not implemented, treated as `RateBased`.
    Bittyrant,
}

/// Configuration of the unchoke scheduler.
#[derive(Clone, Debug)]
pub struct ChokerConf {
    /// The number of regular upload slots. Negative means unlimited.
    pub unchoke_slots_limit: i32,
    /// The optimistic unchoke quota. Zero means `max(1, slots / 5)`.
    pub num_optimistic_unchoke_slots: usize,
    pub choking_algorithm: ChokingAlgorithm,
    /// How often the regular unchoke set is recomputed.
    pub unchoke_interval: Duration,
    /// How often the optimistic slots are rotated.
    pub optimistic_unchoke_interval: Duration,
}

impl Default for ChokerConf {
    fn default() -> Self {
        Self {
            unchoke_slots_limit: 8,
            num_optimistic_unchoke_slots: 0,
            choking_algorithm: ChokingAlgorithm::FixedSlots,
            unchoke_interval: Duration::from_secs(15),
            optimistic_unchoke_interval: Duration::from_secs(30),
        }
    }
}

/// Whether to require, allow or refuse the obfuscated handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncPolicy {
    /// Only encrypted connections are made or accepted.
    Forced,
    /// Encrypted connections are preferred but plaintext is accepted.
    Enabled,
    /// Only plaintext connections are made or accepted.
    Disabled,
}

/// Which payload encryption levels may be negotiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncLevel {
    Plaintext,
    Rc4,
    Both,
}

/// Configuration of Message Stream Encryption.
#[derive(Clone, Debug)]
pub struct EncryptionConf {
    pub in_enc_policy: EncPolicy,
    pub out_enc_policy: EncPolicy,
    pub allowed_enc_level: EncLevel,
    /// When both plaintext and RC4 are on the table, pick RC4.
    pub prefer_rc4: bool,
}

impl Default for EncryptionConf {
    fn default() -> Self {
        Self {
            in_enc_policy: EncPolicy::Enabled,
            out_enc_policy: EncPolicy::Enabled,
            allowed_enc_level: EncLevel::Both,
            prefer_rc4: false,
        }
    }
}
