//! Buffered record writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::{Header, LineEnding, Record, VcfError};

/// Writes a header and records, restoring a missing line terminator only
/// when another line follows it.
///
/// A restored terminator matches the last one written.
#[derive(Debug)]
pub struct VcfWriter<W: Write> {
    out: BufWriter<W>,
    needs_newline: bool,
    terminator: LineEnding,
    records: u64,
}

impl VcfWriter<File> {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, VcfError> {
        Ok(Self::new(File::create(path)?))
    }

    /// Flushes buffered output and fsyncs the file.
    pub fn finish_sync(self) -> Result<u64, VcfError> {
        let records = self.records;
        let file = self.finish()?;
        file.sync_all()?;
        Ok(records)
    }
}

impl<W: Write> VcfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            out: BufWriter::new(inner),
            needs_newline: false,
            terminator: LineEnding::Lf,
            records: 0,
        }
    }

    pub fn write_header(&mut self, header: &Header) -> Result<(), VcfError> {
        let raw = header.as_str();
        self.out.write_all(raw.as_bytes())?;
        self.needs_newline = !raw.is_empty() && !raw.ends_with('\n');
        if raw.ends_with("\r\n") {
            self.terminator = LineEnding::CrLf;
        }
        Ok(())
    }

    pub fn write_record(&mut self, record: &Record) -> Result<(), VcfError> {
        if self.needs_newline {
            self.out.write_all(self.terminator.as_str().as_bytes())?;
        }
        self.out.write_all(record.text().as_bytes())?;
        self.out.write_all(record.ending().as_str().as_bytes())?;
        match record.ending() {
            LineEnding::None => self.needs_newline = true,
            ending => {
                self.needs_newline = false;
                self.terminator = ending;
            }
        }
        self.records += 1;
        Ok(())
    }

    /// The terminator of the last complete line written (`\n` before any).
    pub fn line_ending(&self) -> LineEnding {
        self.terminator
    }

    /// Records written so far.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(self) -> Result<W, VcfError> {
        self.out
            .into_inner()
            .map_err(|e| VcfError::Io(e.into_error()))
    }
}
