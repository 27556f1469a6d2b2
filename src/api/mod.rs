//! # Row API
//!
//! Transport-independent service behind the `/VcfRows` endpoints:
//!
//! | method | route | call |
//! |---|---|---|
//! | GET | `/VcfRows?filters` | [`RowService::list`] |
//! | POST | `/VcfRows` | [`RowService::create`] |
//! | GET | `/VcfRows/id=<id>` | [`RowService::retrieve`] |
//! | PUT | `/VcfRows/id=<id>` | [`RowService::update`] |
//! | PATCH | `/VcfRows/id=<id>` | [`RowService::partial_update`] |
//! | DELETE | `/VcfRows/id=<id>` | [`RowService::destroy`] |
//!
//! Reads are public. Mutations require the `Authorization` value to match
//! the configured secret. Detail routes address every row that carries the
//! variant identifier, so updates and deletes may touch several rows; they
//! are applied all or nothing.
//!
//! Each successful mutation has already requested reconciliation by the
//! time it returns.

#[cfg(test)]
mod tests;

pub mod query;

use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::engine::EngineError;
use crate::rowstore::Row;
use crate::validation::{Mode, RowInput, ValidationErrors, VariantFields};
use crate::{StoreError, VcfStore};

pub use query::{Query, RowFilter};

/// Environment variable holding the shared secret.
pub const SECRET_ENV: &str = "VCFSYNC_SECRET";

const NO_FILE: &str = "No Vcf File was initialised in the db!";

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Value mutating callers must present. Empty rejects every mutation.
    pub secret: String,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Path that pagination links point at.
    pub base_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            default_page_size: 100,
            max_page_size: 1000,
            base_path: "/VcfRows".into(),
        }
    }
}

impl ApiConfig {
    /// Defaults with the secret taken from `VCFSYNC_SECRET`.
    pub fn from_env() -> Self {
        let secret = std::env::var(SECRET_ENV).unwrap_or_default();
        if secret.is_empty() {
            warn!("{SECRET_ENV} is not set; all mutations will be rejected");
        }
        Self {
            secret,
            ..Self::default()
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("forbidden")]
    Forbidden,

    #[error("No results found.")]
    NotFound,

    #[error("Invalid page.")]
    InvalidPage,

    /// The caller's cached representation is current.
    #[error("not modified")]
    NotModified { etag: String },

    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Engine(EngineError::Validation(errors)) => ApiError::Validation(errors),
            StoreError::Engine(EngineError::NoFile) => {
                ApiError::Validation(ValidationErrors::message(NO_FILE))
            }
            StoreError::Engine(EngineError::RowNotFound(_)) => ApiError::NotFound,
            other => ApiError::Store(other),
        }
    }
}

impl ApiError {
    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Forbidden => 403,
            ApiError::NotFound | ApiError::InvalidPage => 404,
            ApiError::NotModified { .. } => 304,
            ApiError::Validation(_) => 400,
            ApiError::Store(_) => 500,
        }
    }

    /// JSON error body, if the status carries one.
    pub fn body(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::NotFound | ApiError::InvalidPage => {
                Some(serde_json::json!({ "detail": self.to_string() }))
            }
            ApiError::Validation(errors) => serde_json::to_value(errors).ok(),
            ApiError::Forbidden | ApiError::NotModified { .. } | ApiError::Store(_) => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Responses
// ------------------------------------------------------------------------------------------------

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub count: usize,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub total_pages: usize,
    pub results: Vec<T>,
}

/// A serialized page with its validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub page: Page<VariantFields>,
    /// The JSON body.
    pub body: String,
    /// Weak ETag over `body`.
    pub etag: String,
}

// ------------------------------------------------------------------------------------------------
// Service
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RowService {
    store: Arc<VcfStore>,
    config: ApiConfig,
}

impl RowService {
    pub fn new(store: Arc<VcfStore>, config: ApiConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Filtered, paginated rows in file order.
    pub fn list(&self, query: &str, if_none_match: Option<&str>) -> Result<Listing, ApiError> {
        let query = Query::parse(query);
        let rows: Vec<Row> = self
            .store
            .rows()?
            .into_iter()
            .filter(|row| query.filter.matches(row))
            .collect();
        self.respond(rows, &query, &self.config.base_path, if_none_match)
    }

    /// Every row whose ID equals `variant_id`, paginated by `page` and
    /// `page_size` in `query`.
    pub fn retrieve(
        &self,
        variant_id: &str,
        query: &str,
        if_none_match: Option<&str>,
    ) -> Result<Listing, ApiError> {
        let query = Query::parse(query);
        let rows = self.store.rows_with_variant_id(variant_id)?;
        let path = format!("{}/id={variant_id}", self.config.base_path);
        self.respond(rows, &query, &path, if_none_match)
    }

    /// Creates a row from a JSON body. Responds 201 with the stored fields.
    pub fn create(
        &self,
        authorization: Option<&str>,
        body: &str,
    ) -> Result<VariantFields, ApiError> {
        self.authorize(authorization)?;
        let input = parse_body(body)?;
        let row = self.store.create_row(&input)?;
        debug!(row_id = row.row_id, line_id = row.line_id, "api: row created");
        Ok(row.fields)
    }

    /// PUT: replaces every row carrying `variant_id`. Returns how many
    /// rows changed.
    pub fn update(
        &self,
        authorization: Option<&str>,
        variant_id: &str,
        body: &str,
    ) -> Result<usize, ApiError> {
        self.handle_update(authorization, variant_id, body, Mode::Replace)
    }

    /// PATCH: updates the fields present in `body` on every row carrying
    /// `variant_id`.
    pub fn partial_update(
        &self,
        authorization: Option<&str>,
        variant_id: &str,
        body: &str,
    ) -> Result<usize, ApiError> {
        self.handle_update(authorization, variant_id, body, Mode::Partial)
    }

    /// Deletes every row carrying `variant_id`. Responds 204.
    pub fn destroy(&self, authorization: Option<&str>, variant_id: &str) -> Result<usize, ApiError> {
        self.authorize(authorization)?;
        let ids = self.matching_ids(variant_id)?;
        self.store.delete_rows(&ids)?;
        debug!(variant_id, count = ids.len(), "api: rows deleted");
        Ok(ids.len())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn handle_update(
        &self,
        authorization: Option<&str>,
        variant_id: &str,
        body: &str,
        mode: Mode,
    ) -> Result<usize, ApiError> {
        self.authorize(authorization)?;
        let ids = self.matching_ids(variant_id)?;
        let input = parse_body(body)?;
        let rows = self.store.update_rows(&ids, &input, mode)?;
        debug!(variant_id, count = rows.len(), ?mode, "api: rows updated");
        Ok(rows.len())
    }

    fn matching_ids(&self, variant_id: &str) -> Result<Vec<u64>, ApiError> {
        let ids: Vec<u64> = self
            .store
            .rows_with_variant_id(variant_id)?
            .iter()
            .map(|r| r.row_id)
            .collect();
        if ids.is_empty() {
            return Err(ApiError::NotFound);
        }
        Ok(ids)
    }

    fn authorize(&self, authorization: Option<&str>) -> Result<(), ApiError> {
        let presented = authorization.unwrap_or_default();
        if self.config.secret.is_empty()
            || !constant_time_eq(presented.as_bytes(), self.config.secret.as_bytes())
        {
            warn!("api: rejected unauthorized mutation");
            return Err(ApiError::Forbidden);
        }
        Ok(())
    }

    fn respond(
        &self,
        rows: Vec<Row>,
        query: &Query,
        path: &str,
        if_none_match: Option<&str>,
    ) -> Result<Listing, ApiError> {
        if rows.is_empty() {
            return Err(ApiError::NotFound);
        }

        let page_size = query
            .page_size
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size.max(1));
        let count = rows.len();
        let total_pages = count.div_ceil(page_size);
        let number = match query.page.as_deref() {
            None => 1,
            Some("last") => total_pages,
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if (1..=total_pages).contains(&n) => n,
                _ => return Err(ApiError::InvalidPage),
            },
        };

        let results = rows
            .into_iter()
            .skip((number - 1) * page_size)
            .take(page_size)
            .map(|r| r.fields)
            .collect();
        let page = Page {
            count,
            next: (number < total_pages).then(|| page_link(path, query, Some(number + 1))),
            previous: (number > 1)
                .then(|| page_link(path, query, (number > 2).then_some(number - 1))),
            total_pages,
            results,
        };

        let body = serde_json::to_string(&page).map_err(|e| {
            error!(%e, "api: failed to serialize page");
            ApiError::Store(StoreError::Engine(EngineError::Internal(e.to_string())))
        })?;
        let etag = weak_etag(body.as_bytes());
        if if_none_match.is_some_and(|header| etag_matches(header, &etag)) {
            return Err(ApiError::NotModified { etag });
        }

        Ok(Listing { page, body, etag })
    }
}

/// Parses a JSON body into mutation input. Malformed JSON is reported
/// as a validation failure.
fn parse_body(body: &str) -> Result<RowInput, ApiError> {
    serde_json::from_str(body)
        .map_err(|e| ApiError::Validation(ValidationErrors::message(e.to_string())))
}

/// `path?retained&page=N`. Page 1 is expressed by omitting `page`.
fn page_link(path: &str, query: &Query, page: Option<usize>) -> String {
    let mut pairs: Vec<String> = query
        .retained
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if let Some(page) = page {
        pairs.push(format!("page={page}"));
    }
    if pairs.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", pairs.join("&"))
    }
}

pub fn weak_etag(body: &[u8]) -> String {
    let mut hasher = Crc32::new();
    hasher.update(body);
    format!("W/\"{:08x}\"", hasher.finalize())
}

/// `If-None-Match` comparison: `*` or any listed tag, weakly compared.
fn etag_matches(header: &str, etag: &str) -> bool {
    let opaque = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let ours = opaque(etag);
    header
        .split(',')
        .any(|candidate| candidate.trim() == "*" || opaque(candidate) == ours)
}

/// Compares without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
