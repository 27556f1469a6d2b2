//! # VCF text format
//!
//! Line-oriented reading and writing of the managed variant file.
//!
//! A file is a header block followed by one record per line:
//!
//! ```text
//! ##fileformat=VCFv4.2
//! ##...meta lines...
//! #CHROM  POS  ID  REF  ALT  QUAL  FILTER  INFO  [FORMAT  SAMPLE...]
//! chr1    100  rs1 A    G    .     PASS    .     GT      0/1
//! ```
//!
//! The header is carried verbatim. Records keep their exact text and line
//! terminator, so a record that is neither edited nor dropped is copied byte
//! for byte. Only the first five columns (CHROM, POS, ID, REF, ALT) are ever
//! rewritten; see [`Record::with_fields`] and [`Record::appended`].
//!
//! Blank lines between records are skipped. Gzip-compressed input is
//! rejected up front with [`VcfError::Compressed`].

#[cfg(test)]
mod tests;

mod reader;
mod writer;

use std::io::{BufRead, Write};

use thiserror::Error;

use crate::validation::VariantFields;

pub use reader::VcfReader;
pub use writer::VcfWriter;

/// Minimum number of tab-separated columns in a record.
pub const FIXED_COLUMNS: usize = 8;

/// First bytes of a gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const MISSING: &str = ".";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum VcfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed header or record. `line` is the 1-based file line.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: u64, reason: String },

    #[error("compressed input is not supported (gzip magic found)")]
    Compressed,
}

impl VcfError {
    pub(crate) fn parse(line: u64, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// The header block, exactly as read (meta lines and the `#CHROM` line,
/// terminators included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    raw: String,
    lines: u64,
}

impl Header {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of physical lines the header spans.
    pub fn line_count(&self) -> u64 {
        self.lines
    }

    /// The `#CHROM ...` column line without its terminator.
    pub fn column_line(&self) -> &str {
        self.raw
            .trim_end_matches(['\r', '\n'])
            .rsplit('\n')
            .next()
            .unwrap_or_default()
    }
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// Line terminator of a record as it appeared in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
    /// Final line of a file without a trailing newline.
    None,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::None => "",
        }
    }

    /// Splits the terminator off `line`.
    pub(crate) fn split(line: &str) -> (&str, LineEnding) {
        if let Some(text) = line.strip_suffix("\r\n") {
            (text, LineEnding::CrLf)
        } else if let Some(text) = line.strip_suffix('\n') {
            (text, LineEnding::Lf)
        } else {
            (line, LineEnding::None)
        }
    }
}

/// One data line of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    text: String,
    ending: LineEnding,
    pos: u64,
}

impl Record {
    /// Parses a record line (terminator already removed). `line_no` is only
    /// used for error reporting.
    pub fn parse(text: &str, ending: LineEnding, line_no: u64) -> Result<Self, VcfError> {
        let columns = text.split('\t').count();
        if columns < FIXED_COLUMNS {
            return Err(VcfError::parse(
                line_no,
                format!("expected at least {FIXED_COLUMNS} tab-separated columns, found {columns}"),
            ));
        }
        let raw_pos = text.split('\t').nth(1).unwrap_or_default();
        let pos = raw_pos
            .parse::<u64>()
            .map_err(|_| VcfError::parse(line_no, format!("invalid POS value `{raw_pos}`")))?;
        Ok(Self {
            text: text.to_string(),
            ending,
            pos,
        })
    }

    /// The record's text without its terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn ending(&self) -> LineEnding {
        self.ending
    }

    pub fn column(&self, index: usize) -> Option<&str> {
        self.text.split('\t').nth(index)
    }

    pub fn chrom(&self) -> &str {
        self.column(0).unwrap_or_default()
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// The ID column; `.` reads as absent.
    pub fn id(&self) -> Option<&str> {
        self.column(2).filter(|v| *v != MISSING)
    }

    pub fn reference(&self) -> &str {
        self.column(3).unwrap_or_default()
    }

    /// The ALT column; `.` reads as absent.
    pub fn alt(&self) -> Option<&str> {
        self.column(4).filter(|v| *v != MISSING)
    }

    /// The five editable columns as row fields.
    pub fn fields(&self) -> VariantFields {
        VariantFields {
            chrom: self.chrom().to_string(),
            pos: self.pos,
            id: self.id().map(str::to_string),
            reference: self.reference().to_string(),
            alt: self.alt().map(str::to_string),
        }
    }

    /// Returns a copy with CHROM, POS, ID, REF and ALT replaced by `fields`.
    /// Every other column and the terminator are preserved.
    pub fn with_fields(&self, fields: &VariantFields) -> Record {
        let mut text = fields.to_columns();
        for rest in self.text.split('\t').skip(5) {
            text.push('\t');
            text.push_str(rest);
        }
        Record {
            text,
            ending: self.ending,
            pos: fields.pos,
        }
    }

    /// Builds a new record for a row appended past the end of the file.
    ///
    /// QUAL, FILTER and INFO are written as `.`; FORMAT and sample columns
    /// are taken from `template` (the last source record) when present.
    /// The line ends like the template, or with `fallback` when the
    /// template has no terminator or there is none.
    pub fn appended(
        fields: &VariantFields,
        template: Option<&Record>,
        fallback: LineEnding,
    ) -> Record {
        let mut text = fields.to_columns();
        text.push_str("\t.\t.\t.");
        if let Some(template) = template {
            for rest in template.text.split('\t').skip(FIXED_COLUMNS) {
                text.push('\t');
                text.push_str(rest);
            }
        }
        let ending = match template.map(Record::ending) {
            Some(ending @ (LineEnding::Lf | LineEnding::CrLf)) => ending,
            _ => fallback,
        };
        Record {
            text,
            ending,
            pos: fields.pos,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Dump
// ------------------------------------------------------------------------------------------------

/// Prints the five variant columns of up to `max_records` records.
///
/// Writes a `#CHROM POS ID REF ALT` heading, one line per record when
/// `verbose` is set, and always finishes with
/// `Final count of lines processed:N`, even when reading fails part-way.
/// Returns the number of records processed.
pub fn dump_records<R: BufRead, W: Write>(
    reader: VcfReader<R>,
    out: &mut W,
    max_records: Option<u64>,
    verbose: bool,
) -> Result<u64, VcfError> {
    writeln!(out, "#CHROM\tPOS\tID\tREF\tALT")?;

    let mut count = 0u64;
    let mut outcome = Ok(());
    for record in reader {
        if max_records == Some(0) {
            break;
        }
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        if verbose {
            let fields = record.fields();
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                fields.chrom,
                fields.pos,
                fields.id.as_deref().unwrap_or(MISSING),
                fields.reference,
                fields.alt.as_deref().unwrap_or(MISSING)
            )?;
        }
        count += 1;
        if max_records.is_some_and(|max| count >= max) {
            break;
        }
    }

    writeln!(out, "Final count of lines processed:{count}")?;
    outcome.map(|()| count)
}
