//! # Catalog
//!
//! The durable home of the file registry, the row store and the tombstone
//! log. It lives under `<data_dir>/catalog/`:
//!
//! - `journal.log`: an append-only [`Wal`] of [`JournalEntry`] records. An
//!   entry is fsynced before the in-memory state changes.
//! - `CATALOG`: a checksummed snapshot of the whole [`CatalogState`],
//!   written atomically (`CATALOG.tmp`, fsync, rename, directory fsync).
//!
//! ## Data durability strategy
//!
//! 1. Every mutation is journaled, then applied with
//!    [`CatalogState::apply`].
//! 2. [`Catalog::checkpoint`] writes a snapshot and truncates the journal.
//!    The snapshot records the next journal sequence number, so entries
//!    left behind by a crash between the two steps are skipped on replay.
//! 3. On open, the snapshot is loaded and the journal replayed through the
//!    same `apply`, reproducing the live state exactly.
//!
//! ## Pass commits
//!
//! A pass journals [`CatalogOp::ReconcileCommit`] *before* renaming its
//! temporary file over the target. A failed rename is followed by
//! [`CatalogOp::ReconcileAbort`]. On replay, a commit whose temporary file
//! still exists had not been renamed yet: the rename is redone and the
//! commit applied. Each pass names its temporary file after the journal
//! sequence number current at its snapshot, so a later pass never writes
//! to a file an earlier commit refers to. Leftover temporary files are
//! removed.
//!
//! A torn final journal record ends replay with a warning; a checksum
//! mismatch fails the open.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction;
use crate::encoding::{self, Decode, Decoder, Encode, EncodingError};
use crate::rowstore::{LineId, Row, RowId, RowStore, RowStoreError, Tombstone};
use crate::validation::VariantFields;
use crate::wal::{Wal, WalError};

pub const CATALOG_DIR: &str = "catalog";
const SNAPSHOT_FILENAME: &str = "CATALOG";
const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const JOURNAL_FILENAME: &str = "journal.log";
const SNAPSHOT_FORMAT: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("journal error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("row store error: {0}")]
    RowStore(#[from] RowStoreError),

    #[error("snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    #[error("unsupported snapshot format {0}")]
    UnsupportedFormat(u32),

    /// A journaled commit refers to a file that is not registered.
    #[error("no file registered")]
    NoFile,
}

// ------------------------------------------------------------------------------------------------
// File record
// ------------------------------------------------------------------------------------------------

/// Identity and location of the managed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    /// Nanoseconds since the Unix epoch.
    pub created: u64,
    pub modified: u64,
}

impl Encode for FileRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.name.encode_to(buf)?;
        self.path.encode_to(buf)?;
        self.created.encode_to(buf)?;
        self.modified.encode_to(buf)
    }
}

impl Decode for FileRecord {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            id: u64::decode(dec)?,
            name: String::decode(dec)?,
            path: PathBuf::decode(dec)?,
            created: u64::decode(dec)?,
            modified: u64::decode(dec)?,
        })
    }
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

// ------------------------------------------------------------------------------------------------
// Journal records
// ------------------------------------------------------------------------------------------------

/// One state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOp {
    Insert {
        row_id: RowId,
        line_id: LineId,
        fields: VariantFields,
    },
    Update {
        row_id: RowId,
        fields: VariantFields,
    },
    Delete {
        row_id: RowId,
    },
    /// A pass is about to rename `temp` over `target`.
    ReconcileCommit {
        temp: PathBuf,
        target: PathBuf,
        /// `(row_id, version)` of every dirty row the pass wrote.
        cleaned: Vec<(RowId, u64)>,
        /// Tombstone positions the pass dropped.
        tombstones: Vec<LineId>,
        modified: u64,
    },
    /// The rename of the preceding commit with the same `temp` failed.
    ReconcileAbort {
        temp: PathBuf,
    },
}

/// A journal record: an op and its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    pub op: CatalogOp,
}

impl Encode for CatalogOp {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            CatalogOp::Insert {
                row_id,
                line_id,
                fields,
            } => {
                0u32.encode_to(buf)?;
                row_id.encode_to(buf)?;
                line_id.encode_to(buf)?;
                fields.encode_to(buf)
            }
            CatalogOp::Update { row_id, fields } => {
                1u32.encode_to(buf)?;
                row_id.encode_to(buf)?;
                fields.encode_to(buf)
            }
            CatalogOp::Delete { row_id } => {
                2u32.encode_to(buf)?;
                row_id.encode_to(buf)
            }
            CatalogOp::ReconcileCommit {
                temp,
                target,
                cleaned,
                tombstones,
                modified,
            } => {
                3u32.encode_to(buf)?;
                temp.encode_to(buf)?;
                target.encode_to(buf)?;
                encoding::encode_vec(cleaned, buf)?;
                encoding::encode_vec(tombstones, buf)?;
                modified.encode_to(buf)
            }
            CatalogOp::ReconcileAbort { temp } => {
                4u32.encode_to(buf)?;
                temp.encode_to(buf)
            }
        }
    }
}

impl Decode for CatalogOp {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        match u32::decode(dec)? {
            0 => Ok(CatalogOp::Insert {
                row_id: u64::decode(dec)?,
                line_id: u64::decode(dec)?,
                fields: VariantFields::decode(dec)?,
            }),
            1 => Ok(CatalogOp::Update {
                row_id: u64::decode(dec)?,
                fields: VariantFields::decode(dec)?,
            }),
            2 => Ok(CatalogOp::Delete {
                row_id: u64::decode(dec)?,
            }),
            3 => Ok(CatalogOp::ReconcileCommit {
                temp: PathBuf::decode(dec)?,
                target: PathBuf::decode(dec)?,
                cleaned: encoding::decode_vec(dec)?,
                tombstones: encoding::decode_vec(dec)?,
                modified: u64::decode(dec)?,
            }),
            4 => Ok(CatalogOp::ReconcileAbort {
                temp: PathBuf::decode(dec)?,
            }),
            tag => Err(EncodingError::InvalidTag {
                tag,
                type_name: "CatalogOp",
            }),
        }
    }
}

impl Encode for JournalEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        self.op.encode_to(buf)
    }
}

impl Decode for JournalEntry {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            seq: u64::decode(dec)?,
            op: CatalogOp::decode(dec)?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

/// Everything the catalog persists.
#[derive(Debug, Clone)]
pub struct CatalogState {
    pub file: Option<FileRecord>,
    pub rows: RowStore,
    pub next_file_id: u64,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            file: None,
            rows: RowStore::new(),
            next_file_id: 1,
        }
    }
}

impl CatalogState {
    /// Checks that `op` would apply, without changing anything.
    pub fn check(&self, op: &CatalogOp) -> Result<(), CatalogError> {
        match op {
            CatalogOp::Insert { row_id, line_id, .. } => {
                self.rows.check_insert(*row_id, *line_id)?;
            }
            CatalogOp::Update { row_id, .. } | CatalogOp::Delete { row_id } => {
                self.rows.check_exists(*row_id)?;
            }
            CatalogOp::ReconcileCommit { .. } => {
                if self.file.is_none() {
                    return Err(CatalogError::NoFile);
                }
            }
            CatalogOp::ReconcileAbort { .. } => {}
        }
        Ok(())
    }

    /// Applies one journaled change. Live mutations and replay share this.
    pub fn apply(&mut self, op: &CatalogOp) -> Result<(), CatalogError> {
        match op {
            CatalogOp::Insert {
                row_id,
                line_id,
                fields,
            } => {
                self.rows.apply_insert(*row_id, *line_id, fields.clone())?;
            }
            CatalogOp::Update { row_id, fields } => {
                self.rows.apply_update(*row_id, fields.clone())?;
            }
            CatalogOp::Delete { row_id } => {
                self.rows.apply_delete(*row_id)?;
            }
            CatalogOp::ReconcileCommit {
                target,
                cleaned,
                tombstones,
                modified,
                ..
            } => {
                let file = self.file.as_mut().ok_or(CatalogError::NoFile)?;
                file.path.clone_from(target);
                file.modified = *modified;
                self.rows.commit_pass(cleaned, tombstones);
            }
            CatalogOp::ReconcileAbort { .. } => {}
        }
        Ok(())
    }
}

/// Snapshot wire layout: `[format][next_seq][state...][crc32]`, the CRC
/// covering every byte before it.
struct SnapshotRef<'a> {
    next_seq: u64,
    state: &'a CatalogState,
}

impl Encode for SnapshotRef<'_> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        SNAPSHOT_FORMAT.encode_to(buf)?;
        self.next_seq.encode_to(buf)?;
        self.state.next_file_id.encode_to(buf)?;
        self.state.file.encode_to(buf)?;
        self.state.rows.next_row_id().encode_to(buf)?;
        let rows: Vec<Row> = self.state.rows.rows_in_order().cloned().collect();
        encoding::encode_vec(&rows, buf)?;
        let tombstones: Vec<Tombstone> = self.state.rows.tombstones().copied().collect();
        encoding::encode_vec(&tombstones, buf)
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery report
// ------------------------------------------------------------------------------------------------

/// What [`Catalog::open`] found and repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub snapshot_loaded: bool,
    pub replayed: usize,
    /// Entries older than the snapshot that were skipped.
    pub skipped: usize,
    /// Commits whose rename was redone.
    pub redone: usize,
    /// Commits cancelled by an abort record.
    pub aborted: usize,
    pub torn_tail: bool,
    pub temps_removed: usize,
}

// ------------------------------------------------------------------------------------------------
// Catalog
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    journal: Wal<JournalEntry>,
    next_seq: u64,
}

impl Catalog {
    /// Opens (or creates) the catalog under `<data_dir>/catalog` and
    /// recovers the last durable state.
    pub fn open(
        data_dir: impl AsRef<Path>,
    ) -> Result<(Self, CatalogState, RecoveryReport), CatalogError> {
        let dir = data_dir.as_ref().join(CATALOG_DIR);
        fs::create_dir_all(&dir)?;

        let mut report = RecoveryReport::default();
        let snapshot_path = dir.join(SNAPSHOT_FILENAME);
        let (mut state, snapshot_seq) = if snapshot_path.exists() {
            let loaded = read_snapshot(&snapshot_path)?;
            report.snapshot_loaded = true;
            info!(path = %snapshot_path.display(), next_seq = loaded.1, "catalog snapshot loaded");
            loaded
        } else {
            (CatalogState::default(), 1)
        };

        let journal = Wal::<JournalEntry>::open(dir.join(JOURNAL_FILENAME), None)?;

        let mut entries = Vec::new();
        for item in journal.replay_iter()? {
            match item {
                Ok(entry) if entry.seq < snapshot_seq => report.skipped += 1,
                Ok(entry) => entries.push(entry),
                Err(WalError::UnexpectedEof) => {
                    warn!("catalog journal ends with a torn record; ignoring it");
                    report.torn_tail = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let next_seq = entries.last().map_or(snapshot_seq, |e| e.seq + 1);
        replay(&mut state, &entries, &mut report)?;

        let mut catalog = Self {
            dir,
            journal,
            next_seq,
        };

        if let Some(file) = &state.file {
            let target = compaction::reconciled_path(&file.path);
            for temp in compaction::orphaned_temps(&target)? {
                warn!(path = %temp.display(), "removing orphaned reconcile output");
                fs::remove_file(&temp)?;
                report.temps_removed += 1;
            }
        }

        if !entries.is_empty() || report.torn_tail || report.skipped > 0 {
            catalog.checkpoint(&state)?;
        }

        info!(
            replayed = report.replayed,
            skipped = report.skipped,
            redone = report.redone,
            aborted = report.aborted,
            torn_tail = report.torn_tail,
            "catalog recovered"
        );

        Ok((catalog, state, report))
    }

    /// Sequence number the next journal record will carry. Strictly
    /// increases across records, checkpoints and reopens.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Journals `op` durably and returns its sequence number. The caller
    /// applies it to the state afterwards.
    pub fn log(&mut self, op: CatalogOp) -> Result<u64, CatalogError> {
        let seq = self.next_seq;
        self.journal.append(&JournalEntry { seq, op })?;
        self.next_seq = seq + 1;
        Ok(seq)
    }

    /// Journals and applies in one step. An op that would not apply is
    /// rejected before anything is written.
    pub fn commit(&mut self, state: &mut CatalogState, op: CatalogOp) -> Result<u64, CatalogError> {
        state.check(&op)?;
        let seq = self.next_seq;
        let entry = JournalEntry { seq, op };
        self.journal.append(&entry)?;
        self.next_seq = seq + 1;
        state.apply(&entry.op)?;
        Ok(seq)
    }

    /// Writes a snapshot of `state` and truncates the journal.
    pub fn checkpoint(&mut self, state: &CatalogState) -> Result<(), CatalogError> {
        let mut bytes = encoding::encode_to_vec(&SnapshotRef {
            next_seq: self.next_seq,
            state,
        })?;
        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());

        let tmp_path = self
            .dir
            .join(format!("{SNAPSHOT_FILENAME}{SNAPSHOT_TMP_SUFFIX}"));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }

        let final_path = self.dir.join(SNAPSHOT_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        self.journal.truncate()?;

        debug!(
            path = %final_path.display(),
            bytes = bytes.len(),
            rows = state.rows.len(),
            next_seq = self.next_seq,
            "catalog checkpoint written"
        );
        Ok(())
    }

    /// Journal size on disk, header included.
    pub fn journal_len(&self) -> Result<u64, CatalogError> {
        Ok(self.journal.len_bytes()?)
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn read_snapshot(path: &Path) -> Result<(CatalogState, u64), CatalogError> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;

    let body_len = buf
        .len()
        .checked_sub(4)
        .ok_or(CatalogError::SnapshotChecksumMismatch)?;
    let (body, stored) = buf.split_at(body_len);
    let mut hasher = Crc32::new();
    hasher.update(body);
    let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    if hasher.finalize() != stored {
        return Err(CatalogError::SnapshotChecksumMismatch);
    }

    let mut dec = Decoder::new(body);
    let format = u32::decode(&mut dec)?;
    if format != SNAPSHOT_FORMAT {
        return Err(CatalogError::UnsupportedFormat(format));
    }
    let next_seq = u64::decode(&mut dec)?;
    let next_file_id = u64::decode(&mut dec)?;
    let file = Option::<FileRecord>::decode(&mut dec)?;
    let next_row_id = u64::decode(&mut dec)?;
    let rows: Vec<Row> = encoding::decode_vec(&mut dec)?;
    let tombstones: Vec<Tombstone> = encoding::decode_vec(&mut dec)?;
    if dec.remaining() != 0 {
        return Err(EncodingError::TrailingBytes(dec.remaining()).into());
    }

    let state = CatalogState {
        file,
        rows: RowStore::restore(rows, tombstones, next_row_id)?,
        next_file_id,
    };
    Ok((state, next_seq))
}

/// Applies replayed entries, redoing interrupted renames.
fn replay(
    state: &mut CatalogState,
    entries: &[JournalEntry],
    report: &mut RecoveryReport,
) -> Result<(), CatalogError> {
    let mut iter = entries.iter().peekable();
    while let Some(entry) = iter.next() {
        if let CatalogOp::ReconcileCommit { temp, target, .. } = &entry.op {
            let aborted = matches!(
                iter.peek(),
                Some(JournalEntry { op: CatalogOp::ReconcileAbort { temp: t }, .. }) if t == temp
            );
            if aborted {
                iter.next();
                report.aborted += 1;
                report.replayed += 2;
                continue;
            }
            if temp.exists() {
                let source = state.file.as_ref().map(|f| f.path.clone());
                compaction::install(temp, target)?;
                if let Some(source) = source.filter(|s| s != target) {
                    remove_if_exists(&source)?;
                }
                warn!(target = %target.display(), "redid interrupted reconcile rename");
                report.redone += 1;
            }
        }
        state.apply(&entry.op)?;
        report.replayed += 1;
    }
    Ok(())
}

/// Removes a superseded source file.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
