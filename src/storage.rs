//! The abstract storage interface the block cache flushes to and reads from.
//!
//! The engine never touches the file system itself: a torrent is attached to
//! an implementation of [`Storage`] and all piece data flows through the
//! vectored read/write calls below, issued from the disk task. The trait also
//! carries the handful of maintenance operations a torrent needs over its
//! lifetime (moving, renaming, deleting files, resume-data verification).
//!
//! Every failure is reported as a [`StorageError`] that pairs the underlying
//! IO error with the operation and, where known, the file it happened on.
//! The cache and the rest of the engine never interpret the code, they only
//! attach it to the failing job and report it.

use std::{fmt, io, path::Path};

use nix::sys::uio::IoVec;

use crate::{Bitfield, FileIndex, PieceIndex};

/// The operation a storage error happened during.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageOp {
    Read,
    Write,
    Stat,
    Move,
    Rename,
    Delete,
    Release,
    CheckResume,
    SetPriority,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Stat => "stat",
            Self::Move => "move",
            Self::Rename => "rename",
            Self::Delete => "delete",
            Self::Release => "release",
            Self::CheckResume => "check resume",
            Self::SetPriority => "set file priority",
        };
        f.write_str(s)
    }
}

/// A structured storage failure: what failed, during what, and in which file.
#[derive(Debug)]
pub struct StorageError {
    /// The underlying cause. Never interpreted by the engine.
    pub code: io::Error,
    /// The operation that failed.
    pub operation: StorageOp,
    /// The index of the file the operation failed on, if attributable.
    pub file_index: Option<FileIndex>,
}

impl StorageError {
    pub fn new(code: io::Error, operation: StorageOp) -> Self {
        Self {
            code,
            operation,
            file_index: None,
        }
    }

    pub fn in_file(mut self, file_index: FileIndex) -> Self {
        self.file_index = Some(file_index);
        self
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "storage {} error: {}", self.operation, self.code)?;
        if let Some(file) = self.file_index {
            write!(f, " (file {})", file)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {}

/// How `move_storage` treats files already present at the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveMode {
    AlwaysReplaceFiles,
    FailIfExist,
    DontReplace,
}

/// Resume metadata checked against storage contents on torrent add.
#[derive(Clone, Debug, Default)]
pub struct ResumeData {
    /// The pieces the resume data claims are on disk.
    pub pieces: Bitfield,
}

/// The operations a torrent's storage backend must provide.
///
/// Per-storage call serialization is the caller's (the disk task's)
/// responsibility; implementations may assume calls do not overlap.
pub trait Storage: Send {
    /// Fills the scatter vector with data from the given piece starting at
    /// the given offset. Returns the number of bytes read, which is the total
    /// size of `bufs` unless the piece data is truncated on disk.
    fn readv(
        &mut self,
        bufs: &mut [Vec<u8>],
        piece: PieceIndex,
        offset: u32,
    ) -> Result<usize, StorageError>;

    /// Writes the gather vector to the given piece at the given offset.
    /// Returns the number of bytes written.
    fn writev(
        &mut self,
        bufs: &[IoVec<&[u8]>],
        piece: PieceIndex,
        offset: u32,
    ) -> Result<usize, StorageError>;

    /// Whether any of the torrent's files exist on disk.
    fn has_any_file(&mut self) -> Result<bool, StorageError>;

    /// Moves the storage to a new location.
    fn move_storage(
        &mut self,
        new_path: &Path,
        mode: MoveMode,
    ) -> Result<(), StorageError>;

    /// Renames a single file.
    fn rename_file(
        &mut self,
        file: FileIndex,
        new_name: &str,
    ) -> Result<(), StorageError>;

    /// Deletes all files belonging to the torrent.
    fn delete_files(&mut self) -> Result<(), StorageError>;

    /// Closes all file handles, to be reopened lazily on the next access.
    fn release_files(&mut self) -> Result<(), StorageError>;

    /// Checks the given resume data against the storage contents. Returns
    /// whether the resume data can be trusted.
    fn verify_resume_data(
        &mut self,
        resume: &ResumeData,
    ) -> Result<bool, StorageError>;

    /// Applies per-file download priorities (zero meaning "don't store").
    fn set_file_priority(
        &mut self,
        priorities: &[u8],
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::collections::HashMap;

    /// An in-memory storage for exercising the cache and disk task: pieces
    /// are byte vectors in a map, reads of absent pieces yield zeroes.
    pub(crate) struct MemStorage {
        pub piece_len: u32,
        pub pieces: HashMap<PieceIndex, Vec<u8>>,
    }

    impl MemStorage {
        pub fn new(piece_len: u32) -> Self {
            Self {
                piece_len,
                pieces: HashMap::new(),
            }
        }
    }

    impl Storage for MemStorage {
        fn readv(
            &mut self,
            bufs: &mut [Vec<u8>],
            piece: PieceIndex,
            offset: u32,
        ) -> Result<usize, StorageError> {
            let mut read = 0;
            let mut pos = offset as usize;
            for buf in bufs.iter_mut() {
                if let Some(data) = self.pieces.get(&piece) {
                    let end = (pos + buf.len()).min(data.len());
                    if pos < end {
                        buf[..end - pos].copy_from_slice(&data[pos..end]);
                    }
                }
                read += buf.len();
                pos += buf.len();
            }
            Ok(read)
        }

        fn writev(
            &mut self,
            bufs: &[IoVec<&[u8]>],
            piece: PieceIndex,
            offset: u32,
        ) -> Result<usize, StorageError> {
            let piece_len = self.piece_len as usize;
            let data = self
                .pieces
                .entry(piece)
                .or_insert_with(|| vec![0; piece_len]);
            let mut pos = offset as usize;
            let mut written = 0;
            for buf in bufs {
                let src = buf.as_slice();
                if data.len() < pos + src.len() {
                    data.resize(pos + src.len(), 0);
                }
                data[pos..pos + src.len()].copy_from_slice(src);
                pos += src.len();
                written += src.len();
            }
            Ok(written)
        }

        fn has_any_file(&mut self) -> Result<bool, StorageError> {
            Ok(!self.pieces.is_empty())
        }

        fn move_storage(
            &mut self,
            _new_path: &Path,
            _mode: MoveMode,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        fn rename_file(
            &mut self,
            _file: FileIndex,
            _new_name: &str,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        fn delete_files(&mut self) -> Result<(), StorageError> {
            self.pieces.clear();
            Ok(())
        }

        fn release_files(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        fn verify_resume_data(
            &mut self,
            _resume: &ResumeData,
        ) -> Result<bool, StorageError> {
            Ok(true)
        }

        fn set_file_priority(
            &mut self,
            _priorities: &[u8],
        ) -> Result<(), StorageError> {
            Ok(())
        }
    }
}
