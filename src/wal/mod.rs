//! Write-Ahead Log (WAL)
//!
//! A durable, append-only, CRC-protected log of typed records. The catalog
//! journals every row mutation and every reconciliation commit here before
//! touching in-memory state.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header**: a [`WalHeader`] (magic, version, record size limit)
//!   followed by its CRC32.
//! - **Record**: a 4-byte little-endian length, the record encoded with
//!   [`crate::encoding`], and a CRC32 computed over `len || record_bytes`.
//!
//! # Guarantees
//!
//! - **Durability:** every `append()` is followed by `File::sync_all`.
//! - **Integrity:** header and record checksums are verified on replay.
//! - **Torn writes:** a record cut short by a crash surfaces as
//!   [`WalError::UnexpectedEof`]; every complete record before it is
//!   still yielded.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::encoding::{self, Decode, Decoder, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record could not be encoded or decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure: checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the maximum size recorded in the header.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// The log ends in the middle of a record.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// Header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Poisoned lock or other internal inconsistency.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every WAL file.
#[derive(Debug, Clone, PartialEq)]
pub struct WalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub max_record_size: u32,
}

impl WalHeader {
    /// Identifies journal files (`b"VJNL"`).
    pub const MAGIC: [u8; 4] = *b"VJNL";

    pub const VERSION: u32 = 1;

    /// Default record size limit (4 MiB).
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 4 * 1024 * 1024;

    /// Encoded size: magic + version + max_record_size.
    pub const ENCODED_LEN: usize = 12;

    pub fn new(max_record_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
        }
    }
}

impl Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)
    }
}

impl Decode for WalHeader {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            magic: <[u8; 4]>::decode(dec)?,
            version: u32::decode(dec)?,
            max_record_size: u32::decode(dec)?,
        })
    }
}

/// Record types that can be stored in a [`Wal`].
pub trait WalData: Encode + Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalData for T where T: Encode + Decode + std::fmt::Debug + Send + Sync {}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// A thread-safe, append-only log of `T` records.
#[derive(Debug)]
pub struct Wal<T: WalData> {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    header: WalHeader,
    _phantom: PhantomData<T>,
}

impl<T: WalData> Wal<T> {
    /// Opens the WAL at `path`, creating it with a fresh header if it is
    /// empty or missing. An existing header is validated.
    pub fn open(path: impl AsRef<Path>, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let header = if file.metadata()?.len() == 0 {
            let header =
                WalHeader::new(max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE));
            Self::write_header(&mut file, &header)?;
            info!(path = %path.display(), "created new WAL");
            header
        } else {
            let header = Self::read_header(&mut file)?;
            trace!(
                path = %path.display(),
                max_record_size = header.max_record_size,
                "loaded WAL header"
            );
            header
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_path_buf(),
            header,
            _phantom: PhantomData,
        })
    }

    fn write_header(file: &mut File, header: &WalHeader) -> Result<(), WalError> {
        let header_bytes = encoding::encode_to_vec(header)?;
        let mut hasher = Crc32::new();
        hasher.update(&header_bytes);
        file.write_all(&header_bytes)?;
        file.write_all(&hasher.finalize().to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_header(file: &mut File) -> Result<WalHeader, WalError> {
        file.seek(SeekFrom::Start(0))?;

        let mut header_bytes = [0u8; WalHeader::ENCODED_LEN];
        let mut checksum_bytes = [0u8; U32_SIZE];
        file.read_exact(&mut header_bytes)
            .and_then(|_| file.read_exact(&mut checksum_bytes))
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => WalError::InvalidHeader("header truncated".into()),
                _ => WalError::Io(e),
            })?;

        let mut hasher = Crc32::new();
        hasher.update(&header_bytes);
        if hasher.finalize() != u32::from_le_bytes(checksum_bytes) {
            return Err(WalError::InvalidHeader("header checksum mismatch".into()));
        }

        let header: WalHeader = encoding::decode_exact(&header_bytes)?;
        if header.magic != WalHeader::MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        if header.version != WalHeader::VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        Ok(header)
    }

    fn lock_file(&self) -> Result<std::sync::MutexGuard<'_, File>, WalError> {
        self.file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))
    }

    /// Appends one record as `[u32 len LE][record_bytes][u32 crc32 LE]`
    /// and fsyncs before returning.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        trace!(?record, "appending WAL record");

        let record_bytes = encoding::encode_to_vec(record)?;
        if record_bytes.len() > self.header.max_record_size as usize {
            return Err(WalError::RecordTooLarge(record_bytes.len()));
        }
        let record_len = record_bytes.len() as u32;

        let mut hasher = Crc32::new();
        hasher.update(&record_len.to_le_bytes());
        hasher.update(&record_bytes);
        let checksum = hasher.finalize();

        // One buffer, one write: a crash leaves at most one torn frame.
        let mut frame = Vec::with_capacity(record_bytes.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&record_len.to_le_bytes());
        frame.extend_from_slice(&record_bytes);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let mut guard = self.lock_file()?;
        guard.write_all(&frame)?;
        guard.sync_all()?;
        Ok(())
    }

    /// Returns an iterator that replays every record from the start.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        let reader = {
            let guard = self.lock_file()?;
            guard.try_clone()?
        };
        let mut reader = BufReader::new(reader);
        reader.seek(SeekFrom::Start((WalHeader::ENCODED_LEN + U32_SIZE) as u64))?;

        Ok(WalIter {
            reader,
            max_record_size: self.header.max_record_size as usize,
            done: false,
            _phantom: PhantomData,
        })
    }

    /// Clears every record, leaving only the header.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        let mut guard = self.lock_file()?;
        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        Self::write_header(&mut guard, &self.header)?;
        info!(path = %self.path.display(), "truncated WAL");
        Ok(())
    }

    /// Size of the WAL file in bytes, header included.
    pub fn len_bytes(&self) -> Result<u64, WalError> {
        Ok(self.lock_file()?.metadata()?.len())
    }
}

impl<T: WalData> Drop for Wal<T> {
    fn drop(&mut self) {
        match self.file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!("failed to sync WAL on drop: {e}");
                }
            }
            Err(poisoned) => {
                if let Err(e) = poisoned.into_inner().sync_all() {
                    error!("failed to sync WAL (poisoned) on drop: {e}");
                } else {
                    warn!("recovered and synced WAL after poisoned lock");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming replay iterator. Reads one record at a time from its own
/// file handle; iteration stops after the first error.
pub struct WalIter<T: WalData> {
    reader: BufReader<File>,
    max_record_size: usize,
    done: bool,
    _phantom: PhantomData<T>,
}

impl<T: WalData> WalIter<T> {
    fn read_frame(&mut self) -> Result<Option<T>, WalError> {
        let mut len_bytes = [0u8; U32_SIZE];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            // A clean end of log, or a length prefix cut short by a crash:
            // in both cases nothing beyond this point was acknowledged.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_len));
        }

        let mut record_bytes = vec![0u8; record_len];
        let mut checksum_bytes = [0u8; U32_SIZE];
        self.reader
            .read_exact(&mut record_bytes)
            .and_then(|_| self.reader.read_exact(&mut checksum_bytes))
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    error!(record_len, "truncated WAL record detected");
                    WalError::UnexpectedEof
                }
                _ => WalError::Io(e),
            })?;

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&record_bytes);
        if hasher.finalize() != u32::from_le_bytes(checksum_bytes) {
            error!(record_len, "WAL record checksum mismatch");
            return Err(WalError::ChecksumMismatch);
        }

        Ok(Some(encoding::decode_exact(&record_bytes)?))
    }
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
