//! Field validation for row mutations.
//!
//! Every create and update runs its input through [`validate`] before the
//! row store is touched. Failures are collected per field, so a rejected
//! request never applies a subset of its fields.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::encoding::{Decode, Decoder, Encode, EncodingError};

static CHROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^chr(?:[1-9]|1[0-9]|2[0-2]|X|Y|M)$").expect("static chromosome pattern")
});

static VARIANT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^rs[0-9]+$").expect("static variant id pattern"));

const ALLELES: [&str; 5] = ["A", "C", "G", "T", "."];

pub const CHROM_MSG: &str = "CHROM name not valid! Please use a string prefixed with chr and \
                         followed by numbers 1 to 22 or one of letters X,Y,M [Case Sensitive]";
pub const POS_MSG: &str = "POS value not valid! Needs to be a positive integer";
pub const ID_MSG: &str = "ID value not valid! Needs to be a string starting with rs followed by \
                      an integer number i.e. rs314418";
pub const REF_MSG: &str = "REF value not valid! Needs to be A,C,G,T or .";
pub const ALT_MSG: &str = "ALT value not valid! Needs to be A,C,G,T or .";
pub const REQUIRED_MSG: &str = "This field is required.";

// ------------------------------------------------------------------------------------------------
// Payload types
// ------------------------------------------------------------------------------------------------

/// The five variant columns a row carries: CHROM, POS, ID, REF and ALT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantFields {
    pub chrom: String,
    pub pos: u64,
    /// Variant identifier(s); `None` is written as `.`.
    pub id: Option<String>,
    #[serde(rename = "ref")]
    pub reference: String,
    /// Alternate allele(s); `None` is written as `.`.
    pub alt: Option<String>,
}

impl VariantFields {
    /// Renders the fields as the first five tab-separated VCF columns.
    pub fn to_columns(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.chrom,
            self.pos,
            self.id.as_deref().unwrap_or("."),
            self.reference,
            self.alt.as_deref().unwrap_or(".")
        )
    }
}

impl Encode for VariantFields {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.chrom.encode_to(buf)?;
        self.pos.encode_to(buf)?;
        self.id.encode_to(buf)?;
        self.reference.encode_to(buf)?;
        self.alt.encode_to(buf)
    }
}

impl Decode for VariantFields {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            chrom: String::decode(dec)?,
            pos: u64::decode(dec)?,
            id: Option::<String>::decode(dec)?,
            reference: String::decode(dec)?,
            alt: Option::<String>::decode(dec)?,
        })
    }
}

/// Unvalidated mutation input, as it arrives from a caller.
///
/// Absent fields are left untouched by updates. `pos` is signed so that
/// out-of-range values reach validation instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowInput {
    #[serde(default)]
    pub chrom: Option<String>,
    #[serde(default)]
    pub pos: Option<i64>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
}

/// How strictly an input is checked for presence of fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// New row: `chrom`, `pos` and `ref` are required.
    Create,
    /// Full replacement (PUT): same requirements as create.
    Replace,
    /// Partial update (PATCH): every field is optional.
    Partial,
}

/// Input that passed validation. Applying it cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInput {
    chrom: Option<String>,
    pos: Option<u64>,
    id: Option<String>,
    reference: Option<String>,
    alt: Option<String>,
}

impl ValidatedInput {
    /// Overwrites the fields present in the input.
    pub fn apply_to(&self, fields: &mut VariantFields) {
        if let Some(chrom) = &self.chrom {
            fields.chrom.clone_from(chrom);
        }
        if let Some(pos) = self.pos {
            fields.pos = pos;
        }
        if let Some(id) = &self.id {
            fields.id = Some(id.clone());
        }
        if let Some(reference) = &self.reference {
            fields.reference.clone_from(reference);
        }
        if let Some(alt) = &self.alt {
            fields.alt = Some(alt.clone());
        }
    }

    /// Builds a complete row payload. Returns `None` for partial input
    /// that lacks a required field.
    pub fn into_fields(self) -> Option<VariantFields> {
        Some(VariantFields {
            chrom: self.chrom?,
            pos: self.pos?,
            id: self.id,
            reference: self.reference?,
            alt: self.alt,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Field name → rejection messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single non-field error under the `message` key.
    pub fn message(msg: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add("message", msg);
        errors
    }

    pub fn add(&mut self, field: &str, msg: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(msg.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Messages recorded for `field`.
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for msg in messages {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                write!(f, "{field}: {msg}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ------------------------------------------------------------------------------------------------
// Rules
// ------------------------------------------------------------------------------------------------

pub fn is_valid_chrom(value: &str) -> bool {
    CHROM_RE.is_match(value)
}

pub fn is_valid_variant_id(value: &str) -> bool {
    VARIANT_ID_RE.is_match(value)
}

pub fn is_valid_allele(value: &str) -> bool {
    ALLELES.contains(&value)
}

/// Validates `input` under `mode`, collecting every failure.
pub fn validate(input: &RowInput, mode: Mode) -> Result<ValidatedInput, ValidationErrors> {
    let mut errors = ValidationErrors::new();

    if mode != Mode::Partial {
        for (field, present) in [
            ("chrom", input.chrom.is_some()),
            ("pos", input.pos.is_some()),
            ("ref", input.reference.is_some()),
        ] {
            if !present {
                errors.add(field, REQUIRED_MSG);
            }
        }
    }

    if let Some(chrom) = &input.chrom
        && !is_valid_chrom(chrom)
    {
        errors.add("chrom", CHROM_MSG);
    }

    let pos = match input.pos {
        Some(pos) if pos >= 1 => Some(pos as u64),
        Some(_) => {
            errors.add("pos", POS_MSG);
            None
        }
        None => None,
    };

    if let Some(id) = &input.id
        && !is_valid_variant_id(id)
    {
        errors.add("id", ID_MSG);
    }

    if let Some(reference) = &input.reference
        && !is_valid_allele(reference)
    {
        errors.add("ref", REF_MSG);
    }

    if let Some(alt) = &input.alt
        && !is_valid_allele(alt)
    {
        errors.add("alt", ALT_MSG);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ValidatedInput {
        chrom: input.chrom.clone(),
        pos,
        id: input.id.clone(),
        reference: input.reference.clone(),
        alt: input.alt.clone(),
    })
}
