//! Query-string parsing for the list and retrieve endpoints.

use crate::rowstore::Row;

const ISNULL_KEY: &str = "id__isnull";

/// Exact-match filters over the five variant columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub chrom: Option<String>,
    /// Kept as text: a value that is not a number matches nothing.
    pub pos: Option<String>,
    pub id: Option<String>,
    pub reference: Option<String>,
    pub alt: Option<String>,
    pub id_is_null: Option<bool>,
}

impl RowFilter {
    pub fn matches(&self, row: &Row) -> bool {
        let f = &row.fields;
        if self.chrom.as_ref().is_some_and(|v| *v != f.chrom) {
            return false;
        }
        if self.pos.as_ref().is_some_and(|v| *v != f.pos.to_string()) {
            return false;
        }
        if self.id.as_ref().is_some_and(|v| Some(v) != f.id.as_ref()) {
            return false;
        }
        if self.reference.as_ref().is_some_and(|v| *v != f.reference) {
            return false;
        }
        if self.alt.as_ref().is_some_and(|v| Some(v) != f.alt.as_ref()) {
            return false;
        }
        if self.id_is_null.is_some_and(|null| null != f.id.is_none()) {
            return false;
        }
        true
    }
}

/// A parsed query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub filter: RowFilter,
    /// Raw `page` value; validated against the result set later.
    pub page: Option<String>,
    pub page_size: Option<usize>,
    /// Recognised `key=value` pairs in order, `page` excluded. Used to
    /// build pagination links.
    pub retained: Vec<(String, String)>,
}

impl Query {
    /// Parses `query` (without the leading `?`).
    ///
    /// The whole string is percent-decoded before splitting on `&`.
    /// Unknown keys and empty values are ignored.
    pub fn parse(query: &str) -> Self {
        let decoded = percent_decode(query.strip_prefix('?').unwrap_or(query));
        let mut parsed = Query::default();

        for part in decoded.split('&').map(str::trim) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let value = value.to_string();
            match key {
                "page" => {
                    parsed.page = Some(value);
                    continue;
                }
                "page_size" => match value.parse::<usize>() {
                    Ok(size) if size > 0 => parsed.page_size = Some(size),
                    _ => continue,
                },
                ISNULL_KEY => {
                    if value.eq_ignore_ascii_case("true") {
                        parsed.filter.id_is_null = Some(true);
                    } else if value.eq_ignore_ascii_case("false") {
                        parsed.filter.id_is_null = Some(false);
                    } else {
                        continue;
                    }
                }
                "chrom" => parsed.filter.chrom = Some(value.clone()),
                "pos" => parsed.filter.pos = Some(value.clone()),
                "id" => parsed.filter.id = Some(value.clone()),
                "ref" => parsed.filter.reference = Some(value.clone()),
                "alt" => parsed.filter.alt = Some(value.clone()),
                _ => continue,
            }
            parsed.retained.push((key.to_string(), value));
        }
        parsed
    }
}

/// Decodes `%XX` escapes. Malformed escapes are kept literally and
/// invalid UTF-8 is replaced.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2]))
        {
            out.push(hi << 4 | lo);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
