//! The ARC block cache.
//!
//! The cache sits between peer connections and storage and holds piece data
//! as fixed 16 KiB blocks. Replacement is ARC (Adaptive Replacement Cache):
//! two resident LRU lists, one for pieces seen once (MRU) and one for pieces
//! referenced again by a different requester (MFU), shadowed by two ghost
//! lists of evicted metadata that steer the adaptive balance parameter `p`.
//! Dirty blocks written by peers live in a separate write sub-class so they
//! never displace the read working set, and a volatile sub-class holds
//! single-use reads that are first in line for eviction.
//!
//! All cache state is owned and mutated by the disk task; peers talk to it
//! through messages only. Buffers handed out by aligned read hits are pinned
//! until the caller reclaims them, and a piece with references held against
//! it is immune to eviction: the eviction is recorded and completes once the
//! last reference drops.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    buffer::{BlockBuf, BufferPool},
    counters::{Counter, Counters},
    PieceIndex, StorageId, BLOCK_LEN,
};

/// Identifies a peer (or other entity) issuing cache requests, for the
/// purposes of ARC's second-reference promotion rule.
pub(crate) type RequesterId = usize;

/// The cache addresses pieces by their torrent's storage and piece index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct CacheKey {
    pub storage: StorageId,
    pub piece: PieceIndex,
}

/// The list a cached piece entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArcList {
    /// Pieces referenced once (ARC T1).
    Mru = 0,
    /// Evicted MRU metadata (ARC B1).
    MruGhost = 1,
    /// Pieces referenced by more than one requester (ARC T2).
    Mfu = 2,
    /// Evicted MFU metadata (ARC B2).
    MfuGhost = 3,
    /// Pieces with dirty blocks awaiting flush.
    Write = 4,
    /// Single-use read pieces, evicted before anything else.
    Volatile = 5,
}

const NUM_LISTS: usize = 6;

impl ArcList {
    fn is_ghost(self) -> bool {
        matches!(self, Self::MruGhost | Self::MfuGhost)
    }
}

/// One block slot in a cached piece.
#[derive(Default)]
struct CachedBlock {
    /// The block data, absent until downloaded or read in. Shared so hits
    /// can be served by reference across the task boundary.
    buf: Option<Arc<Vec<u8>>>,
    /// Outstanding references: aligned-read pins plus an in-flight flush.
    refcount: u16,
    /// Written by a peer, not yet flushed.
    dirty: bool,
    /// A flush of this block is in flight to storage.
    flushing: bool,
}

/// A read waiting for the piece's data to arrive from storage. Concurrent
/// reads of the same absent piece each leave one of these on the entry and
/// share a single disk job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReadJob {
    pub requester: RequesterId,
    pub offset: u32,
    pub len: u32,
}

/// The cache's tracking record for one piece.
pub(crate) struct CachedPieceEntry {
    key: CacheKey,
    /// Block slots; drained (but not shrunk) while the entry is a ghost.
    blocks: Vec<CachedBlock>,
    list: ArcList,
    /// Insertion tick, used for LRU ordering and deterministic tie breaks.
    lru_clock: u64,
    /// References held against the whole piece (attached read jobs, pinned
    /// blocks, flushes). Non-zero blocks eviction.
    piece_refcount: usize,
    /// An eviction arrived while references were held; retried when the
    /// refcount drops to zero.
    marked_for_eviction: bool,
    evict_allow_ghost: bool,
    /// The requester of the most recent reference, for the second-reference
    /// promotion rule.
    last_requester: Option<RequesterId>,
    /// Single-use piece: dropped outright instead of becoming resident.
    is_volatile: bool,
    /// Reads waiting for this piece's pending disk job.
    read_jobs: Vec<ReadJob>,
    last_used: Instant,
    num_cached: usize,
    num_dirty: usize,
    num_flushing: usize,
}

impl CachedPieceEntry {
    fn is_evictable(&self) -> bool {
        self.piece_refcount == 0 && self.num_dirty == 0 && self.num_flushing == 0
    }
}

/// The result of a cache read attempt.
pub(crate) enum TryRead {
    /// The requested range was fully cached.
    Hit(ReadBuf),
    /// At least one block is absent; the caller must schedule a disk job
    /// (or attach to the one already pending).
    Miss,
    /// The copy buffer for an unaligned hit could not be allocated. The
    /// caller must back off until buffers are freed.
    WouldBlock,
}

/// A buffer returned by a read hit. Must be given back via
/// [`BlockCache::reclaim_block`] exactly once.
pub(crate) enum ReadBuf {
    /// An aligned hit served by reference; the underlying blocks stay pinned
    /// until reclaimed.
    Pinned {
        key: CacheKey,
        first_block: usize,
        blocks: Vec<Arc<Vec<u8>>>,
    },
    /// An unaligned hit copied into a freshly allocated buffer; the source
    /// blocks are not pinned.
    Copied { buf: Vec<u8> },
}

impl ReadBuf {
    /// The number of payload bytes the hit covers.
    pub fn len(&self) -> usize {
        match self {
            Self::Pinned { blocks, .. } => {
                blocks.iter().map(|b| b.len()).sum()
            }
            Self::Copied { buf } => buf.len(),
        }
    }

    /// The data as a sequence of byte slices, in stream order.
    pub fn chunks(&self) -> Vec<&[u8]> {
        match self {
            Self::Pinned { blocks, .. } => {
                blocks.iter().map(|b| b.as_slice()).collect()
            }
            Self::Copied { buf } => vec![buf.as_slice()],
        }
    }
}

/// A dirty block checked out for flushing by the disk task.
pub(crate) struct FlushBlock {
    pub index: usize,
    pub data: Arc<Vec<u8>>,
}

pub(crate) struct BlockCache {
    pieces: HashMap<CacheKey, CachedPieceEntry>,
    /// The six lists, ordered LRU first by `(lru_clock, key)`; the key in
    /// the ordering makes eviction ties resolve to the lower piece index.
    lists: [BTreeSet<(u64, CacheKey)>; NUM_LISTS],
    /// Resident blocks per list; only meaningful for the non-ghost lists.
    list_blocks: [usize; NUM_LISTS],
    /// The ARC balance: target size of the MRU list, in blocks. Saturates
    /// in `[0, cache_size]`.
    p: usize,
    clock: u64,
    pool: BufferPool,
    /// Upper bound on resident read-cache blocks.
    cache_size: usize,
    /// The unit of `p` adjustment on a ghost hit.
    balance_step: usize,
    read_cache_blocks: usize,
    write_cache_blocks: usize,
    pinned_blocks: usize,
}

impl BlockCache {
    pub fn new(cache_size: usize, balance_step: usize) -> Self {
        Self {
            pieces: HashMap::new(),
            lists: Default::default(),
            list_blocks: [0; NUM_LISTS],
            p: 0,
            clock: 0,
            // headroom over the read cache for dirty and in-flight blocks
            pool: BufferPool::new(cache_size * 2),
            cache_size,
            balance_step: balance_step.max(1),
            read_cache_blocks: 0,
            write_cache_blocks: 0,
            pinned_blocks: 0,
        }
    }

    /// The number of resident (non ghost) pieces.
    pub fn num_pieces(&self) -> usize {
        [ArcList::Mru, ArcList::Mfu, ArcList::Write, ArcList::Volatile]
            .iter()
            .map(|l| self.lists[*l as usize].len())
            .sum()
    }

    pub fn pinned_blocks(&self) -> usize {
        self.pinned_blocks
    }

    /// Which list the piece is on, if it's tracked at all.
    pub fn entry_list(&self, key: CacheKey) -> Option<ArcList> {
        self.pieces.get(&key).map(|e| e.list)
    }

    /// Finds the piece entry or creates one on the given list. A ghost entry
    /// is left as is; `cache_hit` is the operation that revives ghosts.
    pub fn allocate_piece(
        &mut self,
        key: CacheKey,
        num_blocks: usize,
        list: ArcList,
    ) {
        debug_assert!(!list.is_ghost());
        if self.pieces.contains_key(&key) {
            return;
        }
        self.clock += 1;
        let entry = CachedPieceEntry {
            key,
            blocks: (0..num_blocks).map(|_| CachedBlock::default()).collect(),
            list,
            lru_clock: self.clock,
            piece_refcount: 0,
            marked_for_eviction: false,
            evict_allow_ghost: false,
            last_requester: None,
            is_volatile: list == ArcList::Volatile,
            read_jobs: Vec::new(),
            last_used: Instant::now(),
            num_cached: 0,
            num_dirty: 0,
            num_flushing: 0,
        };
        self.lists[list as usize].insert((self.clock, key));
        self.pieces.insert(key, entry);
    }

    /// Adds a block written by a peer to the write cache. The piece entry is
    /// created on demand (in the write sub-class, so it doesn't displace the
    /// read working set). When the buffer pool is exhausted the cache is
    /// left untouched and the buffer is handed back; the caller must back
    /// off until blocks are freed.
    pub fn add_dirty_block(
        &mut self,
        key: CacheKey,
        num_blocks: usize,
        block_index: usize,
        data: Vec<u8>,
        requester: RequesterId,
    ) -> std::result::Result<(), Vec<u8>> {
        if !self.pool.adopt() {
            return Err(data);
        }

        self.allocate_piece(key, num_blocks, ArcList::Write);
        // a piece receiving writes belongs to the write sub-class even if it
        // previously only held clean read blocks
        if self.pieces[&key].list != ArcList::Write {
            self.move_to_list(key, ArcList::Write);
        }

        let entry = self.pieces.get_mut(&key).unwrap();
        debug_assert!(block_index < entry.blocks.len());
        let block = &mut entry.blocks[block_index];
        if block.buf.is_some() {
            // a duplicate block; keep the first copy
            log::warn!(
                "Duplicate dirty block {} in piece {}",
                block_index,
                key.piece
            );
            self.pool.release(1);
            return Ok(());
        }
        block.buf = Some(Arc::new(data));
        block.dirty = true;
        entry.num_cached += 1;
        entry.num_dirty += 1;
        entry.last_requester = Some(requester);
        entry.last_used = Instant::now();
        let list = entry.list;
        self.list_blocks[list as usize] += 1;
        self.write_cache_blocks += 1;
        Ok(())
    }

    /// Inserts blocks read in from storage, starting at `first_block`. The
    /// buffers must come from [`allocate_iovec`](Self::allocate_iovec) so
    /// the pool accounting is already charged.
    pub fn insert_blocks(
        &mut self,
        key: CacheKey,
        first_block: usize,
        iovec: Vec<BlockBuf>,
        requester: RequesterId,
    ) {
        let entry = match self.pieces.get_mut(&key) {
            Some(e) => e,
            None => {
                debug_assert!(false, "insert_blocks into unallocated piece");
                return;
            }
        };
        debug_assert!(!entry.list.is_ghost());
        let mut inserted = 0;
        for (i, buf) in iovec.into_iter().enumerate() {
            let block = &mut entry.blocks[first_block + i];
            if block.buf.is_some() {
                // lost the race against another read of the same piece
                self.pool.release(1);
                continue;
            }
            block.buf = Some(Arc::new(buf));
            inserted += 1;
        }
        entry.num_cached += inserted;
        entry.last_requester = Some(requester);
        entry.last_used = Instant::now();
        let list = entry.list;
        self.list_blocks[list as usize] += inserted;
        self.read_cache_blocks += inserted;

        self.ensure_read_capacity();
    }

    /// Attempts to serve a read out of the cache.
    ///
    /// An aligned hit pins the covered blocks and returns them by reference;
    /// an unaligned hit copies into a new buffer. Either way the returned
    /// [`ReadBuf`] must be passed to [`reclaim_block`](Self::reclaim_block)
    /// exactly once. A miss means the caller has to go to storage.
    pub fn try_read(
        &mut self,
        key: CacheKey,
        offset: u32,
        len: u32,
        requester: RequesterId,
    ) -> TryRead {
        debug_assert!(len > 0);
        let entry = match self.pieces.get(&key) {
            Some(e) if !e.list.is_ghost() => e,
            _ => return TryRead::Miss,
        };

        let first = (offset / BLOCK_LEN) as usize;
        let last = ((offset + len - 1) / BLOCK_LEN) as usize;
        if last >= entry.blocks.len() {
            return TryRead::Miss;
        }
        if entry.blocks[first..=last].iter().any(|b| b.buf.is_none()) {
            return TryRead::Miss;
        }

        let aligned = offset % BLOCK_LEN == 0
            && ((offset + len) % BLOCK_LEN == 0
                || last == entry.blocks.len() - 1);

        let result = if aligned {
            let entry = self.pieces.get_mut(&key).unwrap();
            let mut blocks = Vec::with_capacity(last - first + 1);
            for b in &mut entry.blocks[first..=last] {
                b.refcount += 1;
                blocks.push(Arc::clone(b.buf.as_ref().unwrap()));
            }
            entry.piece_refcount += blocks.len();
            self.pinned_blocks += blocks.len();
            ReadBuf::Pinned {
                key,
                first_block: first,
                blocks,
            }
        } else {
            // unaligned reads are copied so the source blocks stay unpinned;
            // they are bounded by the block length on the wire
            debug_assert!(len <= BLOCK_LEN);
            let mut buf = match self.pool.allocate() {
                Some(buf) => buf,
                None => return TryRead::WouldBlock,
            };
            buf.truncate(len as usize);
            let entry = &self.pieces[&key];
            let mut copied = 0;
            for (i, b) in entry.blocks[first..=last].iter().enumerate() {
                let src = b.buf.as_ref().unwrap();
                let block_start = (first + i) as u32 * BLOCK_LEN;
                let from = offset.max(block_start) - block_start;
                let to =
                    (offset + len - block_start).min(src.len() as u32);
                let n = (to - from) as usize;
                buf[copied..copied + n]
                    .copy_from_slice(&src[from as usize..to as usize]);
                copied += n;
            }
            debug_assert_eq!(copied, len as usize);
            ReadBuf::Copied { buf }
        };

        self.cache_hit(key, requester, false);
        TryRead::Hit(result)
    }

    /// Registers a reference to the piece: promotes between the ARC lists on
    /// repeat access by a different requester and revives ghost entries,
    /// nudging the balance parameter.
    pub fn cache_hit(
        &mut self,
        key: CacheKey,
        requester: RequesterId,
        is_volatile: bool,
    ) {
        let (list, last_requester) = match self.pieces.get_mut(&key) {
            Some(e) => {
                e.last_used = Instant::now();
                (e.list, e.last_requester)
            }
            None => return,
        };

        match list {
            ArcList::MruGhost | ArcList::MfuGhost => {
                // a ghost hit tells ARC it guessed wrong: bias the balance
                // towards the list the ghost came from, then revive the
                // entry so the upcoming read populates it
                let b1 = self.lists[ArcList::MruGhost as usize].len();
                let b2 = self.lists[ArcList::MfuGhost as usize].len();
                let step = self.balance_step;
                if list == ArcList::MruGhost {
                    let delta = step.max(step * b2 / b1.max(1));
                    self.p = (self.p + delta).min(self.cache_size);
                } else {
                    let delta = step.max(step * b1 / b2.max(1));
                    self.p = self.p.saturating_sub(delta);
                }
                self.move_to_list(key, ArcList::Mru);
            }
            ArcList::Mru | ArcList::Volatile => {
                let second_requester = match last_requester {
                    Some(last) => last != requester,
                    None => false,
                };
                if second_requester {
                    self.move_to_list(key, ArcList::Mfu);
                } else if !is_volatile && list == ArcList::Volatile {
                    self.move_to_list(key, ArcList::Mru);
                }
            }
            ArcList::Mfu => {
                // refresh recency within the MFU list
                self.move_to_list(key, ArcList::Mfu);
            }
            ArcList::Write => {}
        }
        let entry = self.pieces.get_mut(&key).unwrap();
        entry.last_requester = Some(requester);
    }

    /// Returns a buffer obtained from a read hit, releasing pins or the
    /// copy's pool charge. Completes a deferred eviction if this was the
    /// last reference to a piece marked for one.
    pub fn reclaim_block(&mut self, buf: ReadBuf) {
        match buf {
            ReadBuf::Pinned {
                key,
                first_block,
                blocks,
            } => {
                let n = blocks.len();
                drop(blocks);
                if let Some(entry) = self.pieces.get_mut(&key) {
                    for b in &mut entry.blocks[first_block..first_block + n] {
                        debug_assert!(b.refcount > 0);
                        b.refcount -= 1;
                    }
                    debug_assert!(entry.piece_refcount >= n);
                    entry.piece_refcount -= n;
                }
                debug_assert!(self.pinned_blocks >= n);
                self.pinned_blocks = self.pinned_blocks.saturating_sub(n);
                self.retry_deferred_eviction(key);
            }
            ReadBuf::Copied { buf } => {
                drop(buf);
                self.pool.release(1);
            }
        }
    }

    /// Allocates a scatter vector of `n` block buffers for a disk read, or
    /// `None` when the pool can't cover it (would-block).
    pub fn allocate_iovec(&mut self, n: usize) -> Option<Vec<BlockBuf>> {
        self.pool.allocate_iovec(n)
    }

    /// Returns an unused scatter vector to the pool (e.g. after a failed
    /// storage read; errors bypass the cache entirely).
    pub fn free_iovec(&mut self, iovec: Vec<BlockBuf>) {
        self.pool.release(iovec.len());
    }

    /// Checks out the piece's dirty blocks for writing, in block order, and
    /// marks them in flight. Each checked out block holds a reference on the
    /// block and the piece until `blocks_flushed` confirms it.
    pub fn begin_flush(&mut self, key: CacheKey) -> Vec<FlushBlock> {
        let entry = match self.pieces.get_mut(&key) {
            Some(e) => e,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        for (i, b) in entry.blocks.iter_mut().enumerate() {
            if b.dirty && !b.flushing {
                b.flushing = true;
                b.refcount += 1;
                entry.num_flushing += 1;
                entry.piece_refcount += 1;
                out.push(FlushBlock {
                    index: i,
                    data: Arc::clone(b.buf.as_ref().unwrap()),
                });
            }
        }
        out
    }

    /// Confirms that storage accepted the given blocks: their dirty and
    /// in-flight state is cleared and they become clean read-cache blocks.
    /// A fully flushed write piece moves to the MRU list, or is dropped if
    /// it was volatile.
    pub fn blocks_flushed(&mut self, key: CacheKey, indices: &[usize]) {
        let entry = match self.pieces.get_mut(&key) {
            Some(e) => e,
            None => return,
        };
        for &i in indices {
            let b = &mut entry.blocks[i];
            debug_assert!(b.flushing && b.dirty);
            b.flushing = false;
            b.dirty = false;
            b.refcount -= 1;
            entry.num_flushing -= 1;
            entry.num_dirty -= 1;
            entry.piece_refcount -= 1;
        }
        self.write_cache_blocks -= indices.len();
        self.read_cache_blocks += indices.len();

        let entry = &self.pieces[&key];
        if entry.num_dirty == 0 && entry.num_flushing == 0 {
            if entry.is_volatile {
                let mut jobs = Vec::new();
                self.evict_piece(key, &mut jobs, false);
                debug_assert!(jobs.is_empty());
            } else if entry.list == ArcList::Write {
                self.move_to_list(key, ArcList::Mru);
                self.ensure_read_capacity();
            }
        }
        self.retry_deferred_eviction(key);
    }

    /// Evicts the piece: frees its clean unreferenced blocks and, if nothing
    /// holds the piece, removes it: into the matching ghost list when
    /// `allow_ghost` is set, destroyed otherwise. A held piece keeps its
    /// list membership and the eviction is retried when released. Orphaned
    /// waiting reads are drained into `jobs_out`.
    ///
    /// Returns whether the entry was fully evicted.
    pub fn evict_piece(
        &mut self,
        key: CacheKey,
        jobs_out: &mut Vec<ReadJob>,
        allow_ghost: bool,
    ) -> bool {
        let entry = match self.pieces.get_mut(&key) {
            Some(e) => e,
            None => return true,
        };

        jobs_out.append(&mut entry.read_jobs);

        // free what can be freed regardless of whether the entry itself can
        // go: clean blocks nobody holds a reference to
        let mut freed = 0;
        for b in entry.blocks.iter_mut() {
            if b.buf.is_some() && !b.dirty && !b.flushing && b.refcount == 0 {
                b.buf = None;
                freed += 1;
            }
        }
        entry.num_cached -= freed;
        let list = entry.list;
        self.list_blocks[list as usize] -= freed;
        self.read_cache_blocks -= freed;
        self.pool.release(freed);

        let entry = self.pieces.get_mut(&key).unwrap();
        if !entry.is_evictable() {
            entry.marked_for_eviction = true;
            entry.evict_allow_ghost = allow_ghost;
            return false;
        }

        debug_assert_eq!(entry.num_cached, 0);
        let from = entry.list;
        if allow_ghost && matches!(from, ArcList::Mru | ArcList::Mfu) {
            let ghost = if from == ArcList::Mru {
                ArcList::MruGhost
            } else {
                ArcList::MfuGhost
            };
            let entry = self.pieces.get_mut(&key).unwrap();
            entry.blocks.iter_mut().for_each(|b| *b = CachedBlock::default());
            entry.marked_for_eviction = false;
            self.move_to_list(key, ghost);
            self.trim_ghosts();
        } else {
            self.unlink(key);
            self.pieces.remove(&key);
        }
        true
    }

    /// Requests eviction of the piece, now or as soon as its references are
    /// released.
    pub fn mark_for_eviction(&mut self, key: CacheKey, allow_ghost: bool) {
        let mut jobs = Vec::new();
        self.evict_piece(key, &mut jobs, allow_ghost);
        debug_assert!(jobs.is_empty() || self.pieces.get(&key).is_none());
    }

    /// Holds a reference on the piece, e.g. for the duration of a disk job.
    pub fn inc_piece_refcount(&mut self, key: CacheKey) {
        if let Some(e) = self.pieces.get_mut(&key) {
            e.piece_refcount += 1;
        }
    }

    pub fn dec_piece_refcount(&mut self, key: CacheKey) {
        if let Some(e) = self.pieces.get_mut(&key) {
            debug_assert!(e.piece_refcount > 0);
            e.piece_refcount -= 1;
        }
        self.retry_deferred_eviction(key);
    }

    /// Attaches a read to the piece's pending disk job. Returns true when
    /// this is the first waiter, i.e. the caller must schedule the job.
    /// The piece is referenced until the jobs are taken back.
    pub fn attach_read_job(&mut self, key: CacheKey, job: ReadJob) -> bool {
        let entry = match self.pieces.get_mut(&key) {
            Some(e) => e,
            None => {
                debug_assert!(false, "attach_read_job on unallocated piece");
                return false;
            }
        };
        let first = entry.read_jobs.is_empty();
        entry.read_jobs.push(job);
        if first {
            entry.piece_refcount += 1;
        }
        first
    }

    /// Takes the piece's waiting reads, to be completed against the just
    /// inserted blocks (or failed, on a storage error).
    pub fn take_read_jobs(&mut self, key: CacheKey) -> Vec<ReadJob> {
        let jobs = match self.pieces.get_mut(&key) {
            Some(e) => {
                let jobs = std::mem::take(&mut e.read_jobs);
                if !jobs.is_empty() {
                    e.piece_refcount -= 1;
                }
                jobs
            }
            None => Vec::new(),
        };
        self.retry_deferred_eviction(key);
        jobs
    }

    /// The number of dirty (unflushed) blocks of the piece.
    pub fn dirty_blocks(&self, key: CacheKey) -> usize {
        self.pieces.get(&key).map(|e| e.num_dirty).unwrap_or(0)
    }

    /// All of the piece's blocks, in order, if every one is resident. Used
    /// to hash a piece once its last flush lands.
    pub fn piece_blocks(&self, key: CacheKey) -> Option<Vec<Arc<Vec<u8>>>> {
        let entry = self.pieces.get(&key)?;
        if entry.num_cached != entry.blocks.len() {
            return None;
        }
        Some(
            entry
                .blocks
                .iter()
                .map(|b| Arc::clone(b.buf.as_ref().unwrap()))
                .collect(),
        )
    }

    /// Throws away the piece's dirty and in-flight blocks, e.g. after a
    /// storage write failure, and destroys the entry if that empties it.
    pub fn abort_dirty(&mut self, key: CacheKey) {
        let entry = match self.pieces.get_mut(&key) {
            Some(e) => e,
            None => return,
        };
        let mut freed = 0;
        for b in entry.blocks.iter_mut() {
            if b.flushing {
                b.flushing = false;
                b.refcount -= 1;
                entry.num_flushing -= 1;
                entry.piece_refcount -= 1;
            }
            if b.dirty {
                b.dirty = false;
                entry.num_dirty -= 1;
                self.write_cache_blocks -= 1;
                if b.buf.take().is_some() {
                    freed += 1;
                    entry.num_cached -= 1;
                }
            }
        }
        let list = entry.list;
        let empty = entry.num_cached == 0;
        self.list_blocks[list as usize] -= freed;
        self.pool.release(freed);
        if empty {
            let mut jobs = Vec::new();
            self.evict_piece(key, &mut jobs, false);
            debug_assert!(jobs.is_empty());
        }
    }

    /// Evicts every entry (resident and ghost) belonging to the storage,
    /// draining orphaned reads into `jobs_out`. Used on torrent removal.
    pub fn evict_storage(
        &mut self,
        storage: StorageId,
        jobs_out: &mut Vec<ReadJob>,
    ) {
        let keys: Vec<CacheKey> = self
            .pieces
            .keys()
            .filter(|k| k.storage == storage)
            .copied()
            .collect();
        for key in keys {
            self.abort_dirty(key);
            self.evict_piece(key, jobs_out, false);
        }
    }

    /// Evicts read-cache pieces untouched for longer than `max_age`.
    pub fn expire(&mut self, max_age: Duration, jobs_out: &mut Vec<ReadJob>) {
        let now = Instant::now();
        let expired: Vec<CacheKey> = self
            .pieces
            .values()
            .filter(|e| {
                !e.list.is_ghost()
                    && e.list != ArcList::Write
                    && e.is_evictable()
                    && now.duration_since(e.last_used) >= max_age
            })
            .map(|e| e.key)
            .collect();
        for key in expired {
            self.evict_piece(key, jobs_out, true);
        }
    }

    /// Publishes the cache gauges into a counter snapshot.
    pub fn update_stats_counters(&self, c: &mut Counters) {
        c.set(Counter::WriteCacheBlocks, self.write_cache_blocks as u64);
        c.set(Counter::ReadCacheBlocks, self.read_cache_blocks as u64);
        c.set(Counter::PinnedBlocks, self.pinned_blocks as u64);
        c.set(
            Counter::ArcMruSize,
            self.lists[ArcList::Mru as usize].len() as u64,
        );
        c.set(
            Counter::ArcMruGhostSize,
            self.lists[ArcList::MruGhost as usize].len() as u64,
        );
        c.set(
            Counter::ArcMfuSize,
            self.lists[ArcList::Mfu as usize].len() as u64,
        );
        c.set(
            Counter::ArcMfuGhostSize,
            self.lists[ArcList::MfuGhost as usize].len() as u64,
        );
        c.set(
            Counter::ArcWriteSize,
            self.lists[ArcList::Write as usize].len() as u64,
        );
        c.set(
            Counter::ArcVolatileSize,
            self.lists[ArcList::Volatile as usize].len() as u64,
        );
    }

    /// Drops everything, draining any waiting reads into `jobs_out`.
    pub fn clear(&mut self, jobs_out: &mut Vec<ReadJob>) {
        let mut freed = 0;
        for entry in self.pieces.values_mut() {
            jobs_out.append(&mut entry.read_jobs);
            freed += entry.num_cached;
        }
        self.pool.release(freed);
        self.pieces.clear();
        for list in self.lists.iter_mut() {
            list.clear();
        }
        self.list_blocks = [0; NUM_LISTS];
        self.read_cache_blocks = 0;
        self.write_cache_blocks = 0;
        // pinned_blocks is left alone: outstanding pins stay alive through
        // their Arcs and the gauge drops as they are reclaimed
    }

    fn retry_deferred_eviction(&mut self, key: CacheKey) {
        let (marked, allow_ghost) = match self.pieces.get(&key) {
            Some(e) if e.marked_for_eviction && e.is_evictable() => {
                (true, e.evict_allow_ghost)
            }
            _ => (false, false),
        };
        if marked {
            let mut jobs = Vec::new();
            self.evict_piece(key, &mut jobs, allow_ghost);
            debug_assert!(jobs.is_empty());
        }
    }

    /// Moves the entry to the tail (most recent end) of the given list.
    fn move_to_list(&mut self, key: CacheKey, to: ArcList) {
        let (clock, from, num_cached) = {
            let e = &self.pieces[&key];
            (e.lru_clock, e.list, e.num_cached)
        };
        self.lists[from as usize].remove(&(clock, key));
        self.list_blocks[from as usize] -= num_cached;
        self.clock += 1;
        self.lists[to as usize].insert((self.clock, key));
        self.list_blocks[to as usize] += num_cached;
        let e = self.pieces.get_mut(&key).unwrap();
        e.list = to;
        e.lru_clock = self.clock;
    }

    fn unlink(&mut self, key: CacheKey) {
        let (clock, list, num_cached) = {
            let e = &self.pieces[&key];
            (e.lru_clock, e.list, e.num_cached)
        };
        self.lists[list as usize].remove(&(clock, key));
        self.list_blocks[list as usize] -= num_cached;
    }

    /// Enforces the read-cache block budget: volatile pieces are shed first,
    /// then ARC picks between the MRU and MFU lists based on the balance
    /// parameter. Held pieces are skipped.
    fn ensure_read_capacity(&mut self) {
        loop {
            let resident = self.list_blocks[ArcList::Mru as usize]
                + self.list_blocks[ArcList::Mfu as usize]
                + self.list_blocks[ArcList::Volatile as usize];
            if resident <= self.cache_size {
                return;
            }

            let victim = self
                .first_evictable(ArcList::Volatile)
                .or_else(|| {
                    if self.list_blocks[ArcList::Mru as usize] > self.p {
                        self.first_evictable(ArcList::Mru)
                            .or_else(|| self.first_evictable(ArcList::Mfu))
                    } else {
                        self.first_evictable(ArcList::Mfu)
                            .or_else(|| self.first_evictable(ArcList::Mru))
                    }
                });
            let key = match victim {
                Some(key) => key,
                // everything is held; the pool's headroom absorbs the
                // overshoot until references drop
                None => return,
            };
            let mut jobs = Vec::new();
            let allow_ghost = self.pieces[&key].list != ArcList::Volatile;
            self.evict_piece(key, &mut jobs, allow_ghost);
            debug_assert!(jobs.is_empty());
        }
    }

    fn first_evictable(&self, list: ArcList) -> Option<CacheKey> {
        self.lists[list as usize]
            .iter()
            .map(|(_, key)| *key)
            .find(|key| {
                let e = &self.pieces[key];
                e.is_evictable() && e.num_cached > 0
            })
    }

    /// Keeps the ghost lists from growing without bound. Each ghost list is
    /// capped at the cache's block capacity worth of entries.
    fn trim_ghosts(&mut self) {
        for ghost in [ArcList::MruGhost, ArcList::MfuGhost].iter() {
            while self.lists[*ghost as usize].len() > self.cache_size {
                let (clock, key) =
                    *self.lists[*ghost as usize].iter().next().unwrap();
                self.lists[*ghost as usize].remove(&(clock, key));
                self.pieces.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUM_BLOCKS: usize = 2;

    fn key(piece: PieceIndex) -> CacheKey {
        CacheKey { storage: 0, piece }
    }

    fn cache() -> BlockCache {
        BlockCache::new(8, 1)
    }

    fn block_data(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_LEN as usize]
    }

    fn gauges(cache: &BlockCache) -> Counters {
        let mut c = Counters::new();
        cache.update_stats_counters(&mut c);
        c
    }

    // Inserts `piece`'s block 0 as a clean read block, the way the disk task
    // populates the cache after a storage read.
    fn insert(cache: &mut BlockCache, piece: PieceIndex, block: usize) {
        cache.allocate_piece(key(piece), NUM_BLOCKS, ArcList::Mru);
        let iov = cache.allocate_iovec(1).unwrap();
        cache.insert_blocks(key(piece), block, iov, 0);
    }

    #[test]
    fn test_write_then_read_hit() {
        let mut cache = cache();

        assert!(cache
            .add_dirty_block(key(0), NUM_BLOCKS, 0, block_data(0xab), 1)
            .is_ok());
        let c = gauges(&cache);
        assert_eq!(c[Counter::WriteCacheBlocks], 1);
        assert_eq!(c[Counter::ReadCacheBlocks], 0);
        assert_eq!(c[Counter::ArcWriteSize], 1);
        assert_eq!(c[Counter::ArcMruSize], 0);

        // reading the dirty block back is a hit that pins it
        let hit = match cache.try_read(key(0), 0, BLOCK_LEN, 2) {
            TryRead::Hit(buf) => buf,
            _ => panic!("expected cache hit"),
        };
        assert_eq!(hit.len(), BLOCK_LEN as usize);
        assert_eq!(cache.pinned_blocks(), 1);
        assert_eq!(gauges(&cache)[Counter::PinnedBlocks], 1);

        cache.reclaim_block(hit);
        assert_eq!(cache.pinned_blocks(), 0);
        assert_eq!(gauges(&cache)[Counter::PinnedBlocks], 0);

        // another piece is a miss
        assert!(matches!(
            cache.try_read(key(1), 0, BLOCK_LEN, 2),
            TryRead::Miss
        ));
    }

    #[test]
    fn test_insert() {
        let mut cache = cache();
        insert(&mut cache, 0, 0);

        let c = gauges(&cache);
        assert_eq!(c[Counter::WriteCacheBlocks], 0);
        assert_eq!(c[Counter::ReadCacheBlocks], 1);
        assert_eq!(c[Counter::PinnedBlocks], 0);
        assert_eq!(c[Counter::ArcMruSize], 1);
        assert_eq!(c[Counter::ArcMfuSize], 0);
    }

    #[test]
    fn test_arc_promote() {
        let mut cache = cache();
        insert(&mut cache, 0, 0);
        assert_eq!(gauges(&cache)[Counter::ArcMruSize], 1);

        // a hit from the requester that populated the entry doesn't promote
        let hit = match cache.try_read(key(0), 0, BLOCK_LEN, 0) {
            TryRead::Hit(buf) => buf,
            _ => panic!("expected cache hit"),
        };
        cache.reclaim_block(hit);
        let c = gauges(&cache);
        assert_eq!(c[Counter::ArcMruSize], 1);
        assert_eq!(c[Counter::ArcMfuSize], 0);

        // a hit from a different requester moves the piece to the MFU list
        let hit = match cache.try_read(key(0), 0, BLOCK_LEN, 1) {
            TryRead::Hit(buf) => buf,
            _ => panic!("expected cache hit"),
        };
        cache.reclaim_block(hit);
        let c = gauges(&cache);
        assert_eq!(c[Counter::ArcMruSize], 0);
        assert_eq!(c[Counter::ArcMfuSize], 1);
        assert_eq!(c[Counter::ReadCacheBlocks], 1);
    }

    #[test]
    fn test_evict_with_refcount_held() {
        let mut cache = cache();
        insert(&mut cache, 0, 0);

        let mut jobs = Vec::new();
        cache.inc_piece_refcount(key(0));
        // the buffers are freed but the entry can't leave its list
        assert!(!cache.evict_piece(key(0), &mut jobs, true));
        let c = gauges(&cache);
        assert_eq!(c[Counter::ReadCacheBlocks], 0);
        assert_eq!(c[Counter::ArcMruSize], 1);
        assert_eq!(c[Counter::ArcMruGhostSize], 0);

        // dropping the reference completes the recorded eviction
        cache.dec_piece_refcount(key(0));
        let c = gauges(&cache);
        assert_eq!(c[Counter::ArcMruSize], 0);
        assert_eq!(c[Counter::ArcMruGhostSize], 1);
    }

    #[test]
    fn test_arc_unghost() {
        let mut cache = cache();
        insert(&mut cache, 0, 0);

        let mut jobs = Vec::new();
        assert!(cache.evict_piece(key(0), &mut jobs, true));
        let c = gauges(&cache);
        assert_eq!(c[Counter::ReadCacheBlocks], 0);
        assert_eq!(c[Counter::ArcMruSize], 0);
        assert_eq!(c[Counter::ArcMruGhostSize], 1);

        // a hit on the ghost revives it into the MRU list; no blocks were
        // read in so the cache size stays zero
        cache.cache_hit(key(0), 0, false);
        let c = gauges(&cache);
        assert_eq!(c[Counter::ReadCacheBlocks], 0);
        assert_eq!(c[Counter::ArcMruSize], 1);
        assert_eq!(c[Counter::ArcMruGhostSize], 0);
    }

    #[test]
    fn test_unaligned_read() {
        let mut cache = cache();
        insert(&mut cache, 0, 0);
        insert(&mut cache, 0, 1);

        // a read straddling both blocks is served through a copy and pins
        // nothing
        let hit = match cache.try_read(key(0), 0x2000, BLOCK_LEN, 1) {
            TryRead::Hit(buf) => buf,
            _ => panic!("expected cache hit"),
        };
        assert_eq!(cache.pinned_blocks(), 0);
        assert_eq!(gauges(&cache)[Counter::PinnedBlocks], 0);
        match &hit {
            ReadBuf::Copied { buf } => assert_eq!(buf.len(), BLOCK_LEN as usize),
            _ => panic!("expected a copied buffer"),
        }
        cache.reclaim_block(hit);
    }

    #[test]
    fn test_unaligned_read_copies_right_bytes() {
        let mut cache = cache();
        cache.allocate_piece(key(0), NUM_BLOCKS, ArcList::Mru);
        let mut iov = cache.allocate_iovec(2).unwrap();
        iov[0].iter_mut().for_each(|b| *b = 1);
        iov[1].iter_mut().for_each(|b| *b = 2);
        cache.insert_blocks(key(0), 0, iov, 0);

        let hit = match cache.try_read(key(0), BLOCK_LEN - 4, 8, 1) {
            TryRead::Hit(buf) => buf,
            _ => panic!("expected cache hit"),
        };
        match &hit {
            ReadBuf::Copied { buf } => {
                assert_eq!(&buf[..], &[1, 1, 1, 1, 2, 2, 2, 2]);
            }
            _ => panic!("expected a copied buffer"),
        }
        cache.reclaim_block(hit);
    }

    #[test]
    fn test_flush_moves_piece_to_read_cache() {
        let mut cache = cache();
        assert!(cache
            .add_dirty_block(key(0), NUM_BLOCKS, 0, block_data(0xcd), 1)
            .is_ok());

        let flush = cache.begin_flush(key(0));
        assert_eq!(flush.len(), 1);
        assert_eq!(flush[0].index, 0);

        cache.blocks_flushed(key(0), &[0]);
        let c = gauges(&cache);
        assert_eq!(c[Counter::WriteCacheBlocks], 0);
        assert_eq!(c[Counter::ReadCacheBlocks], 1);
        assert_eq!(c[Counter::ArcWriteSize], 0);
        assert_eq!(c[Counter::ArcMruSize], 1);
    }

    #[test]
    fn test_evict_during_flush_is_deferred() {
        let mut cache = cache();
        assert!(cache
            .add_dirty_block(key(0), NUM_BLOCKS, 0, block_data(0xcd), 1)
            .is_ok());
        let flush = cache.begin_flush(key(0));
        assert_eq!(flush.len(), 1);

        // an in-flight flush holds the piece; the eviction is recorded
        let mut jobs = Vec::new();
        assert!(!cache.evict_piece(key(0), &mut jobs, true));
        assert_eq!(gauges(&cache)[Counter::ArcWriteSize], 1);

        // flush completion releases the hold and the recorded eviction runs
        cache.blocks_flushed(key(0), &[0]);
        let c = gauges(&cache);
        assert_eq!(c[Counter::WriteCacheBlocks], 0);
        assert_eq!(c[Counter::ReadCacheBlocks], 0);
        assert_eq!(c[Counter::ArcWriteSize], 0);
        assert_eq!(c[Counter::ArcMruGhostSize], 1);
    }

    #[test]
    fn test_mark_for_eviction_destroys() {
        let mut cache = cache();
        insert(&mut cache, 0, 0);
        assert_eq!(cache.num_pieces(), 1);

        cache.mark_for_eviction(key(0), false);
        assert_eq!(cache.num_pieces(), 0);
        assert_eq!(gauges(&cache)[Counter::ArcMruGhostSize], 0);
    }

    #[test]
    fn test_read_capacity_evicts_lru() {
        // room for two blocks only
        let mut cache = BlockCache::new(2, 1);
        insert(&mut cache, 0, 0);
        insert(&mut cache, 1, 0);
        insert(&mut cache, 2, 0);

        let c = gauges(&cache);
        assert_eq!(c[Counter::ReadCacheBlocks], 2);
        // the oldest piece was pushed out into the ghost list
        assert_eq!(c[Counter::ArcMruSize], 2);
        assert_eq!(c[Counter::ArcMruGhostSize], 1);
        assert!(matches!(
            cache.try_read(key(0), 0, BLOCK_LEN, 1),
            TryRead::Miss
        ));
    }

    #[test]
    fn test_coalesced_read_jobs() {
        let mut cache = cache();
        cache.allocate_piece(key(0), NUM_BLOCKS, ArcList::Mru);

        let a = ReadJob {
            requester: 1,
            offset: 0,
            len: BLOCK_LEN,
        };
        let b = ReadJob {
            requester: 2,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        // only the first waiter triggers a disk job
        assert!(cache.attach_read_job(key(0), a));
        assert!(!cache.attach_read_job(key(0), b));

        let iov = cache.allocate_iovec(NUM_BLOCKS).unwrap();
        cache.insert_blocks(key(0), 0, iov, 1);
        let jobs = cache.take_read_jobs(key(0));
        assert_eq!(jobs, vec![a, b]);
    }

    #[test]
    fn test_would_block_on_pool_exhaustion() {
        let mut cache = BlockCache::new(1, 1);
        // the pool has two blocks of headroom for a one block cache
        assert!(cache.add_dirty_block(key(0), 1, 0, block_data(1), 1).is_ok());
        assert!(cache.add_dirty_block(key(1), 1, 0, block_data(2), 1).is_ok());
        // pool spent
        assert!(cache.add_dirty_block(key(2), 1, 0, block_data(3), 1).is_err());

        // unaligned read of a dirty piece can't allocate its copy buffer
        assert!(matches!(
            cache.try_read(key(0), 4, 8, 2),
            TryRead::WouldBlock
        ));
    }

    #[test]
    fn test_ghost_hit_biases_balance() {
        let mut cache = BlockCache::new(2, 1);
        insert(&mut cache, 0, 0);
        insert(&mut cache, 1, 0);
        // pushes piece 0 to the ghost list
        insert(&mut cache, 2, 0);
        assert_eq!(cache.p, 0);

        cache.cache_hit(key(0), 7, false);
        // a recency-ghost hit grows the MRU target
        assert_eq!(cache.p, 1);
        assert_eq!(gauges(&cache)[Counter::ArcMruGhostSize], 0);
    }

    #[test]
    fn test_eviction_tie_breaks_by_piece_index() {
        let mut cache = BlockCache::new(2, 1);
        // two pieces inserted back to back; capacity forces one out when
        // a third arrives and the older insertion (lower clock) goes first
        insert(&mut cache, 3, 0);
        insert(&mut cache, 1, 0);
        insert(&mut cache, 2, 0);

        assert!(matches!(
            cache.try_read(key(3), 0, BLOCK_LEN, 1),
            TryRead::Miss
        ));
        let hit = match cache.try_read(key(1), 0, BLOCK_LEN, 1) {
            TryRead::Hit(buf) => buf,
            _ => panic!("expected cache hit"),
        };
        cache.reclaim_block(hit);
    }
}
