use crate::encoding::{Decode, Decoder, Encode, EncodingError};
use tracing_subscriber::EnvFilter;

/// Header bytes plus header CRC; records start at this offset.
pub const WAL_HDR_SIZE: u64 = 16;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small record shaped like a row edit.
#[derive(Debug, PartialEq, Clone)]
pub struct EditRecord {
    pub row_id: u64,
    pub chrom: String,
    pub note: Option<String>,
}

impl EditRecord {
    pub fn new(row_id: u64) -> Self {
        Self {
            row_id,
            chrom: format!("chr{}", row_id % 22 + 1),
            note: (row_id % 2 == 0).then(|| format!("note-{row_id}")),
        }
    }
}

impl Encode for EditRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.row_id.encode_to(buf)?;
        self.chrom.encode_to(buf)?;
        self.note.encode_to(buf)
    }
}

impl Decode for EditRecord {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            row_id: u64::decode(dec)?,
            chrom: String::decode(dec)?,
            note: Option::<String>::decode(dec)?,
        })
    }
}
