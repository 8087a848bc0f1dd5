//! The disk task: the only place piece data meets storage.
//!
//! The task owns the block cache and the per-torrent storage backends and
//! executes all read and write jobs, so every cache mutation happens on one
//! task and the network side never blocks on IO. Peers and the session talk
//! to it through [`DiskHandle`]; read results go straight back to the
//! requesting peer's command channel, torrent-level outcomes (piece hashes,
//! storage failures) go to the session on the alert channel.
//!
//! Writes coalesce in the cache's write sub-class and are flushed as whole
//! pieces: once a piece has all its blocks, they are gathered into one
//! vectored write, and the piece is hashed when the flush lands. Writes for
//! a piece are submitted in block order, so storage sees them in order.

use std::collections::{HashMap, VecDeque};

use {
    nix::sys::uio::IoVec,
    sha1::{Digest, Sha1},
    tokio::{
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        task,
    },
};

use crate::{
    block_count, block_len,
    cache::{ArcList, BlockCache, CacheKey, ReadBuf, ReadJob, TryRead},
    conf::CacheConf,
    counters::Counters,
    peer,
    storage::{Storage, StorageError},
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, TorrentId,
};

/// Spawns the disk task and returns its join handle, the command handle and
/// the alert channel.
pub(crate) fn spawn(
    conf: &CacheConf,
) -> (task::JoinHandle<()>, DiskHandle, AlertReceiver) {
    log::info!("Spawning disk task");
    let (alert_chan, alert_port) = mpsc::unbounded_channel();
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut disk = Disk {
        torrents: HashMap::new(),
        cache: BlockCache::new(conf.cache_size, conf.arc_balance_step),
        cache_expiry: conf.cache_expiry,
        cmd_port,
        alert_chan,
        read_waiters: HashMap::new(),
        pending_writes: VecDeque::new(),
    };
    let join_handle = task::spawn(async move { disk.run().await });
    (join_handle, DiskHandle(cmd_chan), alert_port)
}

/// The handle on which the session and the peer tasks submit disk jobs.
///
/// Submission failures mean the disk task is gone, which only happens
/// during shutdown; they are logged and swallowed.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    pub fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        storage: Box<dyn Storage>,
    ) {
        self.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
            storage,
        });
    }

    pub fn remove_torrent(&self, id: TorrentId) {
        self.send(Command::RemoveTorrent { id });
    }

    /// Requests a block on behalf of a peer; the result arrives on `chan`
    /// as a `Block` or `RejectRequest` command.
    pub fn read_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
        requester: usize,
        chan: peer::Sender,
    ) {
        self.send(Command::ReadBlock {
            id,
            block,
            requester,
            chan,
        });
    }

    /// Queues a block a peer sent us for caching and eventual flush.
    pub fn write_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
        requester: usize,
    ) {
        self.send(Command::WriteBlock {
            id,
            block,
            data,
            requester,
        });
    }

    /// Returns a buffer obtained from a read, releasing its pins.
    pub fn reclaim(&self, buf: ReadBuf) {
        self.send(Command::Reclaim(buf));
    }

    /// Periodic housekeeping: expire stale cache entries and flush
    /// lingering dirty pieces.
    pub fn tick(&self) {
        self.send(Command::Tick);
    }

    /// Requests a cache gauge snapshot on the alert channel.
    pub fn stats(&self) {
        self.send(Command::Stats);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, cmd: Command) {
        if self.0.send(cmd).is_err() {
            log::error!("Disk task is gone");
        }
    }
}

/// A handle whose commands go nowhere, for peer tests that never touch the
/// disk.
#[cfg(test)]
pub(crate) fn test_handle() -> DiskHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    // keep the receiving half alive so sends keep succeeding
    std::mem::forget(rx);
    DiskHandle(tx)
}

type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

enum Command {
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        storage: Box<dyn Storage>,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    ReadBlock {
        id: TorrentId,
        block: BlockInfo,
        requester: usize,
        chan: peer::Sender,
    },
    WriteBlock {
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
        requester: usize,
    },
    Reclaim(ReadBuf),
    Tick,
    Stats,
    Shutdown,
}

type AlertSender = UnboundedSender<Alert>;
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// What the disk task reports back to the session.
#[derive(Debug)]
pub(crate) enum Alert {
    /// A piece was fully flushed and hashed.
    PieceCompletion {
        id: TorrentId,
        piece_index: PieceIndex,
        is_valid: bool,
    },
    /// A storage operation failed.
    StorageFailure {
        id: TorrentId,
        piece_index: Option<PieceIndex>,
        error: StorageError,
    },
    /// A cache gauge snapshot, in response to [`DiskHandle::stats`].
    Stats(Box<Counters>),
}

struct TorrentEntry {
    info: StorageInfo,
    /// The concatenation of all expected piece hashes, 20 bytes each.
    piece_hashes: Vec<u8>,
    storage: Box<dyn Storage>,
}

struct Disk {
    torrents: HashMap<TorrentId, TorrentEntry>,
    cache: BlockCache,
    cache_expiry: std::time::Duration,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
    /// The reply channels of reads waiting on a pending piece, parallel to
    /// the cache's coalesced read jobs.
    read_waiters: HashMap<CacheKey, Vec<(ReadJob, peer::Sender)>>,
    /// Writes that couldn't be admitted because the buffer pool was
    /// exhausted; retried whenever blocks are freed.
    pending_writes: VecDeque<(TorrentId, BlockInfo, Vec<u8>, usize)>,
}

impl Disk {
    async fn run(&mut self) {
        log::info!("Starting disk task");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    storage,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already has storage", id);
                        continue;
                    }
                    log::info!("Torrent {} storage attached", id);
                    self.torrents.insert(
                        id,
                        TorrentEntry {
                            info,
                            piece_hashes,
                            storage,
                        },
                    );
                }
                Command::RemoveTorrent { id } => self.remove_torrent(id),
                Command::ReadBlock {
                    id,
                    block,
                    requester,
                    chan,
                } => self.read_block(id, block, requester, chan),
                Command::WriteBlock {
                    id,
                    block,
                    data,
                    requester,
                } => {
                    self.write_block(id, block, data, requester);
                }
                Command::Reclaim(buf) => {
                    self.cache.reclaim_block(buf);
                    self.retry_pending_writes();
                }
                Command::Tick => self.tick(),
                Command::Stats => {
                    let mut counters = Counters::new();
                    self.cache.update_stats_counters(&mut counters);
                    let _ =
                        self.alert_chan.send(Alert::Stats(Box::new(counters)));
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk task");
                    self.flush_all();
                    break;
                }
            }
        }
    }

    fn key(id: TorrentId, piece: PieceIndex) -> CacheKey {
        // torrent ids double as storage ids
        CacheKey { storage: id, piece }
    }

    fn read_block(
        &mut self,
        id: TorrentId,
        block: BlockInfo,
        requester: usize,
        chan: peer::Sender,
    ) {
        let key = Self::key(id, block.piece_index);
        let piece_len = match self
            .torrents
            .get(&id)
            .and_then(|t| t.info.piece_len(block.piece_index))
        {
            Some(len) => len,
            None => {
                log::warn!("Read for unknown torrent {} or piece", id);
                let _ = chan.send(peer::Command::RejectRequest(block));
                return;
            }
        };

        match self.cache.try_read(key, block.offset, block.len, requester) {
            TryRead::Hit(data) => {
                log::trace!("Cache hit for {}", block);
                if let Err(e) =
                    chan.send(peer::Command::Block { info: block, data })
                {
                    // peer is gone; its pins must not leak
                    if let peer::Command::Block { data, .. } = e.0 {
                        self.cache.reclaim_block(data);
                    }
                }
            }
            TryRead::WouldBlock => {
                log::debug!("Buffer pool exhausted, rejecting {}", block);
                let _ = chan.send(peer::Command::RejectRequest(block));
            }
            TryRead::Miss => {
                self.read_miss(id, key, piece_len, block, requester, chan)
            }
        }
    }

    /// A cache miss: revive ghosts, coalesce with any pending read of the
    /// same piece, and read the whole piece in (the peer will likely want
    /// its other blocks next).
    fn read_miss(
        &mut self,
        id: TorrentId,
        key: CacheKey,
        piece_len: u32,
        block: BlockInfo,
        requester: usize,
        chan: peer::Sender,
    ) {
        if let Some(list) = self.cache.entry_list(key) {
            if matches!(list, ArcList::MruGhost | ArcList::MfuGhost) {
                self.cache.cache_hit(key, requester, false);
            }
        }
        let num_blocks = block_count(piece_len);
        self.cache.allocate_piece(key, num_blocks, ArcList::Mru);

        let job = ReadJob {
            requester,
            offset: block.offset,
            len: block.len,
        };
        let first = self.cache.attach_read_job(key, job);
        self.read_waiters.entry(key).or_default().push((job, chan));
        if !first {
            return;
        }

        let iovec = match self.cache.allocate_iovec(num_blocks) {
            Some(iovec) => iovec,
            None => {
                log::debug!("Buffer pool exhausted reading piece {}", key.piece);
                self.fail_waiters(key);
                return;
            }
        };

        let torrent = self.torrents.get_mut(&id).expect("checked above");
        let mut bufs = iovec;
        match torrent.storage.readv(&mut bufs, block.piece_index, 0) {
            Ok(_) => {
                self.cache.insert_blocks(key, 0, bufs, requester);
                self.serve_waiters(key);
            }
            Err(error) => {
                log::warn!(
                    "Torrent {} piece {} read failed: {}",
                    id,
                    block.piece_index,
                    error
                );
                // read errors bypass the cache: nothing is retained
                self.cache.free_iovec(bufs);
                self.fail_waiters(key);
                let _ = self.alert_chan.send(Alert::StorageFailure {
                    id,
                    piece_index: Some(block.piece_index),
                    error,
                });
            }
        }
    }

    /// Completes every read waiting on the piece out of the now populated
    /// cache.
    fn serve_waiters(&mut self, key: CacheKey) {
        let jobs = self.cache.take_read_jobs(key);
        let mut waiters = self.read_waiters.remove(&key).unwrap_or_default();
        debug_assert_eq!(jobs.len(), waiters.len());
        for (job, chan) in waiters.drain(..) {
            let block = BlockInfo {
                piece_index: key.piece,
                offset: job.offset,
                len: job.len,
            };
            match self.cache.try_read(key, job.offset, job.len, job.requester)
            {
                TryRead::Hit(data) => {
                    let _ =
                        chan.send(peer::Command::Block { info: block, data });
                }
                _ => {
                    let _ = chan.send(peer::Command::RejectRequest(block));
                }
            }
        }
    }

    fn fail_waiters(&mut self, key: CacheKey) {
        let _ = self.cache.take_read_jobs(key);
        if let Some(waiters) = self.read_waiters.remove(&key) {
            for (job, chan) in waiters {
                let block = BlockInfo {
                    piece_index: key.piece,
                    offset: job.offset,
                    len: job.len,
                };
                let _ = chan.send(peer::Command::RejectRequest(block));
            }
        }
    }

    fn write_block(
        &mut self,
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
        requester: usize,
    ) -> bool {
        let key = Self::key(id, block.piece_index);
        let piece_len = match self
            .torrents
            .get(&id)
            .and_then(|t| t.info.piece_len(block.piece_index))
        {
            Some(len) => len,
            None => {
                log::warn!("Write for unknown torrent {} or piece", id);
                return true;
            }
        };
        let num_blocks = block_count(piece_len);

        if let Err(data) = self.cache.add_dirty_block(
            key,
            num_blocks,
            block.index_in_piece(),
            data,
            requester,
        ) {
            // pool exhausted: park the write and retry once blocks free up
            log::debug!("Buffer pool exhausted, parking write {}", block);
            self.pending_writes.push_back((id, block, data, requester));
            return false;
        }

        if self.cache.dirty_blocks(key) == num_blocks {
            self.flush_piece(id, key);
        }
        true
    }

    /// Flushes the piece's dirty blocks as one gather write and, if the
    /// piece is fully resident afterwards, hashes it.
    fn flush_piece(&mut self, id: TorrentId, key: CacheKey) {
        let flush = self.cache.begin_flush(key);
        if flush.is_empty() {
            return;
        }
        let (piece_len, expected_hash) = {
            let torrent = match self.torrents.get(&id) {
                Some(t) => t,
                None => return,
            };
            let piece_len = torrent
                .info
                .piece_len(key.piece)
                .expect("flushing invalid piece");
            let hash_pos = key.piece * 20;
            let expected: Option<[u8; 20]> = torrent
                .piece_hashes
                .get(hash_pos..hash_pos + 20)
                .map(|s| {
                    let mut hash = [0; 20];
                    hash.copy_from_slice(s);
                    hash
                });
            (piece_len, expected)
        };

        // submit in block order, in contiguous runs
        let indices: Vec<usize> = flush.iter().map(|f| f.index).collect();
        let mut result = Ok(0);
        let mut run_start = 0;
        while run_start < flush.len() {
            let mut run_end = run_start + 1;
            while run_end < flush.len()
                && flush[run_end].index == flush[run_end - 1].index + 1
            {
                run_end += 1;
            }
            let run = &flush[run_start..run_end];
            let iovs: Vec<IoVec<&[u8]>> = run
                .iter()
                .map(|f| {
                    let len = block_len(piece_len, f.index) as usize;
                    IoVec::from_slice(&f.data[..len])
                })
                .collect();
            let offset = run[0].index as u32 * crate::BLOCK_LEN;
            let torrent =
                self.torrents.get_mut(&id).expect("flush without torrent");
            result = torrent.storage.writev(&iovs, key.piece, offset);
            if result.is_err() {
                break;
            }
            run_start = run_end;
        }

        match result {
            Ok(_) => {
                // hash before handing the blocks back to the cache: a full
                // flush carries the entire piece, and blocks_flushed may
                // shuffle a tight cache
                let full_flush = indices.len() == block_count(piece_len);
                self.cache.blocks_flushed(key, &indices);
                if full_flush {
                    self.verify_flushed_piece(
                        id,
                        key,
                        piece_len,
                        expected_hash,
                        &flush,
                    );
                } else {
                    self.verify_piece(id, key, piece_len, expected_hash);
                }
                self.retry_pending_writes();
            }
            Err(error) => {
                log::error!(
                    "Torrent {} piece {} flush failed: {}",
                    id,
                    key.piece,
                    error
                );
                // dirty blocks that can't be flushed are discarded
                self.cache.abort_dirty(key);
                let _ = self.alert_chan.send(Alert::StorageFailure {
                    id,
                    piece_index: Some(key.piece),
                    error,
                });
            }
        }
    }

    /// Hashes a piece whose flush carried all of its blocks.
    fn verify_flushed_piece(
        &mut self,
        id: TorrentId,
        key: CacheKey,
        piece_len: u32,
        expected_hash: Option<[u8; 20]>,
        flush: &[crate::cache::FlushBlock],
    ) {
        let data: Vec<&[u8]> = flush
            .iter()
            .map(|f| {
                let len = block_len(piece_len, f.index) as usize;
                &f.data[..len]
            })
            .collect();
        self.report_hash_verdict(id, key, expected_hash, &data);
    }

    /// Hashes the piece out of the cache, if every block is resident and
    /// clean. Used when the final flush only carried part of the piece.
    fn verify_piece(
        &mut self,
        id: TorrentId,
        key: CacheKey,
        piece_len: u32,
        expected_hash: Option<[u8; 20]>,
    ) {
        if self.cache.dirty_blocks(key) > 0 {
            return;
        }
        let blocks = match self.cache.piece_blocks(key) {
            Some(blocks) => blocks,
            None => return,
        };
        let mut remaining = piece_len as usize;
        let mut data: Vec<&[u8]> = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let n = remaining.min(block.len());
            data.push(&block[..n]);
            remaining -= n;
        }
        let blocks_ref = data;
        self.report_hash_verdict(id, key, expected_hash, &blocks_ref);
    }

    fn report_hash_verdict(
        &mut self,
        id: TorrentId,
        key: CacheKey,
        expected_hash: Option<[u8; 20]>,
        data: &[&[u8]],
    ) {
        let expected = match expected_hash {
            Some(hash) => hash,
            None => return,
        };
        let mut hasher = Sha1::new();
        for chunk in data {
            hasher.update(chunk);
        }
        let hash: [u8; 20] = hasher.finalize().into();
        let is_valid = hash == expected;
        if is_valid {
            log::debug!("Torrent {} piece {} is valid", id, key.piece);
        } else {
            log::warn!("Torrent {} piece {} failed its hash", id, key.piece);
            // the cached data is wrong; drop it so it can't serve reads
            let mut jobs = Vec::new();
            self.cache.evict_piece(key, &mut jobs, false);
            debug_assert!(jobs.is_empty());
        }
        let _ = self.alert_chan.send(Alert::PieceCompletion {
            id,
            piece_index: key.piece,
            is_valid,
        });
    }

    fn retry_pending_writes(&mut self) {
        while let Some((id, block, data, requester)) =
            self.pending_writes.pop_front()
        {
            if !self.write_block(id, block, data, requester) {
                // still no room; write_block parked it again at the back,
                // stop so we don't spin
                break;
            }
        }
    }

    /// Flushes every piece with dirty blocks, whole or not.
    fn flush_all(&mut self) {
        let ids: Vec<TorrentId> = self.torrents.keys().copied().collect();
        for id in ids {
            let piece_count = self.torrents[&id].info.piece_count;
            for piece in 0..piece_count {
                let key = Self::key(id, piece);
                if self.cache.dirty_blocks(key) > 0 {
                    self.flush_piece(id, key);
                }
            }
        }
    }

    fn remove_torrent(&mut self, id: TorrentId) {
        log::info!("Detaching torrent {} storage", id);
        let mut jobs = Vec::new();
        self.cache.evict_storage(id, &mut jobs);
        let keys: Vec<CacheKey> = self.read_waiters.keys().copied().collect();
        for key in keys {
            if key.storage == id {
                self.fail_waiters(key);
            }
        }
        self.torrents.remove(&id);
    }

    fn tick(&mut self) {
        let mut jobs = Vec::new();
        self.cache.expire(self.cache_expiry, &mut jobs);
        debug_assert!(jobs.is_empty());
        // nudge along pieces that never completed
        self.flush_all();
        self.retry_pending_writes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        counters::Counter, error::Result, storage::test_util::MemStorage,
        BLOCK_LEN,
    };
    use sha1::{Digest, Sha1};
    use tokio::sync::mpsc;

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;

    struct Env {
        disk: DiskHandle,
        alerts: AlertReceiver,
        pieces: Vec<Vec<u8>>,
    }

    impl Env {
        /// Attaches a two piece torrent backed by in-memory storage.
        fn new() -> Self {
            let conf = CacheConf::default();
            let (_join, disk, alerts) = spawn(&conf);

            let pieces: Vec<Vec<u8>> = vec![
                (0..PIECE_LEN).map(|b| (b % 251) as u8).collect(),
                (0..PIECE_LEN).map(|b| ((b + 1) % 251) as u8).collect(),
            ];
            let mut piece_hashes = Vec::with_capacity(pieces.len() * 20);
            for piece in &pieces {
                let hash: [u8; 20] = Sha1::digest(piece).into();
                piece_hashes.extend_from_slice(&hash);
            }

            let info = StorageInfo::new(
                PIECE_LEN,
                pieces.len() as u64 * PIECE_LEN as u64,
                Vec::new(),
            );
            disk.new_torrent(
                0,
                info,
                piece_hashes,
                Box::new(MemStorage::new(PIECE_LEN)),
            );
            Self {
                disk,
                alerts,
                pieces,
            }
        }

        fn write_piece(&self, index: PieceIndex) {
            for block_index in 0..block_count(PIECE_LEN) {
                let offset = block_index as u32 * BLOCK_LEN;
                let data = self.pieces[index]
                    [offset as usize..(offset + BLOCK_LEN) as usize]
                    .to_vec();
                self.disk.write_block(
                    0,
                    BlockInfo {
                        piece_index: index,
                        offset,
                        len: BLOCK_LEN,
                    },
                    data,
                    1,
                );
            }
        }
    }

    #[tokio::test]
    async fn test_write_piece_is_flushed_and_verified() {
        let mut env = Env::new();
        env.write_piece(0);

        match env.alerts.recv().await.unwrap() {
            Alert::PieceCompletion {
                id,
                piece_index,
                is_valid,
            } => {
                assert_eq!(id, 0);
                assert_eq!(piece_index, 0);
                assert!(is_valid);
            }
            alert => panic!("unexpected alert: {:?}", alert),
        }

        // after the flush the blocks are clean read-cache entries
        env.disk.stats();
        match env.alerts.recv().await.unwrap() {
            Alert::Stats(c) => {
                assert_eq!(c[Counter::WriteCacheBlocks], 0);
                assert_eq!(c[Counter::ReadCacheBlocks], 2);
                assert_eq!(c[Counter::ArcMruSize], 1);
                assert_eq!(c[Counter::ArcWriteSize], 0);
            }
            alert => panic!("unexpected alert: {:?}", alert),
        }
    }

    #[tokio::test]
    async fn test_corrupt_piece_fails_verification() {
        let mut env = Env::new();
        // write piece 1's data under piece 0's hash
        for block_index in 0..block_count(PIECE_LEN) {
            let offset = block_index as u32 * BLOCK_LEN;
            let data = env.pieces[1]
                [offset as usize..(offset + BLOCK_LEN) as usize]
                .to_vec();
            env.disk.write_block(
                0,
                BlockInfo {
                    piece_index: 0,
                    offset,
                    len: BLOCK_LEN,
                },
                data,
                1,
            );
        }

        match env.alerts.recv().await.unwrap() {
            Alert::PieceCompletion { is_valid, .. } => assert!(!is_valid),
            alert => panic!("unexpected alert: {:?}", alert),
        }

        // the bad data must not linger in the cache
        env.disk.stats();
        match env.alerts.recv().await.unwrap() {
            Alert::Stats(c) => {
                assert_eq!(c[Counter::ReadCacheBlocks], 0);
            }
            alert => panic!("unexpected alert: {:?}", alert),
        }
    }

    #[tokio::test]
    async fn test_read_block_round_trip() -> Result<()> {
        let mut env = Env::new();
        env.write_piece(0);
        // wait out the flush
        env.alerts.recv().await.unwrap();

        let (chan, mut port) = mpsc::unbounded_channel();
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        env.disk.read_block(0, block, 2, chan);

        match port.recv().await.unwrap() {
            peer::Command::Block { info, data } => {
                assert_eq!(info, block);
                let bytes: Vec<u8> =
                    data.chunks().concat();
                assert_eq!(&bytes[..], &env.pieces[0][..BLOCK_LEN as usize]);
                env.disk.reclaim(data);
            }
            _ => panic!("expected a block"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_read_unknown_piece_is_rejected() {
        let env = Env::new();
        let (chan, mut port) = mpsc::unbounded_channel();
        let block = BlockInfo {
            piece_index: 99,
            offset: 0,
            len: BLOCK_LEN,
        };
        env.disk.read_block(0, block, 2, chan);
        assert!(matches!(
            port.recv().await.unwrap(),
            peer::Command::RejectRequest(b) if b == block
        ));
    }

    #[tokio::test]
    async fn test_read_from_storage_populates_cache() {
        let mut env = Env::new();
        env.write_piece(0);
        env.alerts.recv().await.unwrap();

        // drop the cached piece, then read it back through storage
        env.disk.remove_torrent(0);
        let info = StorageInfo::new(
            PIECE_LEN,
            env.pieces.len() as u64 * PIECE_LEN as u64,
            Vec::new(),
        );
        let mut storage = MemStorage::new(PIECE_LEN);
        storage.pieces.insert(0, env.pieces[0].clone());
        let mut piece_hashes = Vec::new();
        for piece in &env.pieces {
            let hash: [u8; 20] = Sha1::digest(piece).into();
            piece_hashes.extend_from_slice(&hash);
        }
        env.disk.new_torrent(0, info, piece_hashes, Box::new(storage));

        let (chan, mut port) = mpsc::unbounded_channel();
        let block = BlockInfo {
            piece_index: 0,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        env.disk.read_block(0, block, 3, chan);
        match port.recv().await.unwrap() {
            peer::Command::Block { info, data } => {
                assert_eq!(info, block);
                let bytes: Vec<u8> = data.chunks().concat();
                assert_eq!(
                    &bytes[..],
                    &env.pieces[0][BLOCK_LEN as usize..]
                );
                env.disk.reclaim(data);
            }
            _ => panic!("expected a block"),
        }
    }
}
