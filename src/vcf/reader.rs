//! Streaming record reader.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::trace;

use super::{GZIP_MAGIC, Header, LineEnding, Record, VcfError};

const FILEFORMAT_PREFIX: &str = "##fileformat=";
const COLUMN_LINE_PREFIX: &str = "#CHROM";

/// Lazy iterator over the records of a VCF stream.
///
/// The header is parsed eagerly by [`VcfReader::new`]; records are parsed
/// one line at a time as the iterator advances. After the first error the
/// iterator is fused.
#[derive(Debug)]
pub struct VcfReader<R> {
    input: R,
    header: Header,
    /// First record line read while looking for the end of the header.
    pending: Option<String>,
    line_no: u64,
    records: u64,
    done: bool,
}

impl VcfReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VcfError> {
        let path = path.as_ref();
        trace!(path = %path.display(), "opening VCF source");
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: BufRead> VcfReader<R> {
    pub fn new(mut input: R) -> Result<Self, VcfError> {
        if input.fill_buf()?.starts_with(&GZIP_MAGIC) {
            return Err(VcfError::Compressed);
        }

        let mut raw = String::new();
        let mut lines = 0u64;
        let mut last = String::new();
        let mut pending = None;

        loop {
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            if lines == 0 && !line.starts_with(FILEFORMAT_PREFIX) {
                return Err(VcfError::parse(
                    1,
                    "header must start with a ##fileformat= line",
                ));
            }
            if !line.starts_with('#') {
                pending = Some(line);
                break;
            }
            lines += 1;
            raw.push_str(&line);
            last = line;
        }

        if lines == 0 {
            return Err(VcfError::parse(1, "empty input, no header found"));
        }
        if !last.starts_with(COLUMN_LINE_PREFIX) {
            return Err(VcfError::parse(
                lines,
                "header must end with the #CHROM column line",
            ));
        }

        Ok(Self {
            input,
            header: Header { raw, lines },
            pending,
            line_no: lines,
            records: 0,
            done: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Records yielded so far.
    pub fn records_read(&self) -> u64 {
        self.records
    }

    fn next_line(&mut self) -> Result<Option<String>, VcfError> {
        if let Some(line) = self.pending.take() {
            self.line_no += 1;
            return Ok(Some(line));
        }
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some(line))
    }

    fn next_record(&mut self) -> Result<Option<Record>, VcfError> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            let (text, ending) = LineEnding::split(&line);
            if text.is_empty() {
                continue;
            }
            if text.starts_with('#') {
                return Err(VcfError::parse(
                    self.line_no,
                    "header line found after the first record",
                ));
            }
            let record = Record::parse(text, ending, self.line_no)?;
            self.records += 1;
            return Ok(Some(record));
        }
    }
}

impl<R: BufRead> Iterator for VcfReader<R> {
    type Item = Result<Record, VcfError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
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
