//! # Compaction Module
//!
//! One reconciliation pass: a streaming, positional merge of the current
//! variant file with the pending row edits and tombstones.
//!
//! ## Merge
//!
//! The source is read one record at a time, counting positions from 1.
//! For each position:
//!
//! - a tombstone drops the record,
//! - an edit substitutes the row's CHROM/POS/ID/REF/ALT into the record,
//! - anything else is copied byte for byte.
//!
//! Edits positioned past the last source record are appended in ascending
//! position order, reusing the FORMAT and sample columns of the last source
//! record. Memory is bounded by the size of the edit set, never by the file.
//!
//! ## Atomicity
//!
//! 1. Merge into `<target>.<pass>.tmp` in the target's directory, where
//!    `pass` is unique to the pass.
//! 2. Flush and fsync the temporary file.
//! 3. [`install`] renames it over the target and fsyncs the directory.
//!
//! Step 3 is the only visible transition and the caller performs it after
//! journaling its intent. A failed merge removes its temporary file and
//! leaves the source untouched.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::validation::VariantFields;
use crate::vcf::{Record, VcfError, VcfReader, VcfWriter};

/// Suffix of the in-progress output file.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Extension of every reconciled file.
pub const VCF_EXTENSION: &str = "vcf";

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Everything one pass needs, captured from the row store under the
/// engine lock. The merge itself runs without the lock.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    /// Current on-disk file.
    pub source: PathBuf,
    /// Temporary output; see [`temp_path`].
    pub output: PathBuf,
    /// Dirty rows by position.
    pub edits: BTreeMap<u64, VariantFields>,
    /// Positions to drop.
    pub tombstones: BTreeSet<u64>,
}

/// Counters reported by a successful merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    pub source_records: u64,
    pub written: u64,
    pub rewritten: u64,
    pub dropped: u64,
    pub appended: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("VCF error: {0}")]
    Vcf(#[from] VcfError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Paths
// ------------------------------------------------------------------------------------------------

/// Where the reconciled file lives: `<stem>.vcf` next to `source`, where
/// the stem is the file name up to its first `.`.
pub fn reconciled_path(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    source.with_file_name(format!("{stem}.{VCF_EXTENSION}"))
}

/// The temporary output of pass `pass` for `target`:
/// `<target>.<pass>.tmp`. No two passes share one.
pub fn temp_path(target: &Path, pass: u64) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(format!(".{pass}{TEMP_SUFFIX}"));
    PathBuf::from(name)
}

/// Whether `candidate` names a temporary output of some pass for `target`.
pub fn is_temp_for(target: &Path, candidate: &Path) -> bool {
    let (Some(target_name), Some(name)) = (
        target.file_name().and_then(|n| n.to_str()),
        candidate.file_name().and_then(|n| n.to_str()),
    ) else {
        return false;
    };
    name.strip_prefix(target_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(TEMP_SUFFIX))
        .is_some_and(|pass| !pass.is_empty() && pass.bytes().all(|b| b.is_ascii_digit()))
}

/// Temporary outputs for `target` present in its directory, sorted.
pub fn orphaned_temps(target: &Path) -> io::Result<Vec<PathBuf>> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut found = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if is_temp_for(target, &path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

// ------------------------------------------------------------------------------------------------
// Merge
// ------------------------------------------------------------------------------------------------

/// Runs the merge described by `plan` into `plan.output` and fsyncs it.
///
/// On error the partial output is removed.
pub fn compact(plan: &CompactionPlan) -> Result<CompactionSummary, CompactionError> {
    debug!(
        source = %plan.source.display(),
        output = %plan.output.display(),
        edits = plan.edits.len(),
        tombstones = plan.tombstones.len(),
        "compaction: starting merge"
    );

    match merge(plan) {
        Ok(summary) => {
            info!(
                source = %plan.source.display(),
                source_records = summary.source_records,
                written = summary.written,
                rewritten = summary.rewritten,
                dropped = summary.dropped,
                appended = summary.appended,
                "compaction: merge complete"
            );
            Ok(summary)
        }
        Err(e) => {
            discard(&plan.output);
            Err(e)
        }
    }
}

fn merge(plan: &CompactionPlan) -> Result<CompactionSummary, CompactionError> {
    let reader = VcfReader::open(&plan.source)?;
    let mut writer = VcfWriter::create(&plan.output)?;
    writer.write_header(reader.header())?;

    let mut summary = CompactionSummary::default();
    let mut last: Option<Record> = None;

    for record in reader {
        let record = record?;
        summary.source_records += 1;
        let position = summary.source_records;

        if plan.tombstones.contains(&position) {
            summary.dropped += 1;
        } else if let Some(fields) = plan.edits.get(&position) {
            writer.write_record(&record.with_fields(fields))?;
            summary.rewritten += 1;
        } else {
            writer.write_record(&record)?;
        }
        last = Some(record);
    }

    for (position, fields) in plan.edits.range(summary.source_records + 1..) {
        debug!(position, "compaction: appending row");
        let appended = Record::appended(fields, last.as_ref(), writer.line_ending());
        writer.write_record(&appended)?;
        summary.appended += 1;
    }

    summary.written = writer.finish_sync()?;
    Ok(summary)
}

/// Removes a temporary output, logging rather than failing.
pub fn discard(output: &Path) {
    match fs::remove_file(output) {
        Ok(()) => debug!(path = %output.display(), "compaction: removed temporary output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %output.display(), %e, "compaction: failed to remove temporary output"),
    }
}

// ------------------------------------------------------------------------------------------------
// Install
// ------------------------------------------------------------------------------------------------

/// Atomically renames `output` over `target` and fsyncs the directory.
pub fn install(output: &Path, target: &Path) -> io::Result<()> {
    fs::rename(output, target)?;
    if let Some(dir) = target.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }
    debug!(
        output = %output.display(),
        target = %target.display(),
        "compaction: installed reconciled file"
    );
    Ok(())
}
