//! # Row Store
//!
//! The authoritative in-memory table of variant rows, their positions in
//! the managed file, and the tombstones of deleted rows that the file still
//! contains.
//!
//! ## Addressing
//!
//! Every row has a stable `row_id` and a positional `line_id` (1-based).
//! The physical order is a separate index `line_id → row_id`, so a delete is
//! a single index edit plus a tombstone, and renumbering after a pass is one
//! O(n) rebuild of the index.
//!
//! ## Mutation protocol
//!
//! Mutations are split in two so the caller can journal them in between:
//! [`RowStore::next_insert`] reserves identifiers without changing state,
//! and the `apply_*` methods change state and cannot fail on valid input.
//! Journal replay calls the same `apply_*` methods, so recovery reproduces
//! the live state exactly.
//!
//! ## Versions
//!
//! Each row carries an edit counter. A pass records `(row_id, version)` for
//! every dirty row it writes; at commit a row is marked clean only if its
//! version is unchanged, so an edit that lands mid-pass stays dirty.


use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::encoding::{Decode, Decoder, Encode, EncodingError};
use crate::validation::VariantFields;

pub type RowId = u64;
pub type LineId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowStoreError {
    #[error("unknown row {0}")]
    UnknownRow(RowId),

    #[error("line {line_id} is already occupied by row {row_id}")]
    LineOccupied { line_id: LineId, row_id: RowId },

    #[error("row {0} already exists")]
    DuplicateRow(RowId),
}

// ------------------------------------------------------------------------------------------------
// Row and Tombstone
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub row_id: RowId,
    pub line_id: LineId,
    pub version: u64,
    pub dirty: bool,
    pub fields: VariantFields,
}

/// A deleted row whose record is still present in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub row_id: RowId,
    pub line_id: LineId,
}

impl Encode for Row {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.row_id.encode_to(buf)?;
        self.line_id.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.dirty.encode_to(buf)?;
        self.fields.encode_to(buf)
    }
}

impl Decode for Row {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            row_id: u64::decode(dec)?,
            line_id: u64::decode(dec)?,
            version: u64::decode(dec)?,
            dirty: bool::decode(dec)?,
            fields: VariantFields::decode(dec)?,
        })
    }
}

impl Encode for Tombstone {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.row_id.encode_to(buf)?;
        self.line_id.encode_to(buf)
    }
}

impl Decode for Tombstone {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            row_id: u64::decode(dec)?,
            line_id: u64::decode(dec)?,
        })
    }
}

/// A dirty row as captured at the start of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRow {
    pub row_id: RowId,
    pub line_id: LineId,
    pub version: u64,
    pub fields: VariantFields,
}

/// What a pass commit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub cleaned: usize,
    /// Rows written by the pass but edited again before the commit.
    pub superseded: usize,
    pub tombstones_removed: usize,
}

// ------------------------------------------------------------------------------------------------
// RowStore
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RowStore {
    rows: BTreeMap<RowId, Row>,
    order: BTreeMap<LineId, RowId>,
    tombstones: BTreeMap<LineId, Tombstone>,
    next_row_id: RowId,
}

impl RowStore {
    pub fn new() -> Self {
        Self {
            next_row_id: 1,
            ..Self::default()
        }
    }

    /// Builds a clean store from imported records, numbered in order.
    pub fn from_import(records: impl IntoIterator<Item = VariantFields>) -> Self {
        let mut store = Self::new();
        for (idx, fields) in records.into_iter().enumerate() {
            let row_id = idx as u64 + 1;
            store.rows.insert(
                row_id,
                Row {
                    row_id,
                    line_id: row_id,
                    version: 0,
                    dirty: false,
                    fields,
                },
            );
            store.order.insert(row_id, row_id);
            store.next_row_id = row_id + 1;
        }
        store
    }

    /// Rebuilds a store from snapshot contents.
    pub fn restore(
        rows: Vec<Row>,
        tombstones: Vec<Tombstone>,
        next_row_id: RowId,
    ) -> Result<Self, RowStoreError> {
        let mut store = Self {
            next_row_id: next_row_id.max(1),
            ..Self::default()
        };
        for row in rows {
            store.place(row)?;
        }
        for tombstone in tombstones {
            if let Some(row_id) = store.occupant(tombstone.line_id) {
                return Err(RowStoreError::LineOccupied {
                    line_id: tombstone.line_id,
                    row_id,
                });
            }
            store.tombstones.insert(tombstone.line_id, tombstone);
        }
        Ok(store)
    }

    fn occupant(&self, line_id: LineId) -> Option<RowId> {
        self.order
            .get(&line_id)
            .copied()
            .or_else(|| self.tombstones.get(&line_id).map(|t| t.row_id))
    }

    fn place(&mut self, row: Row) -> Result<(), RowStoreError> {
        self.check_insert(row.row_id, row.line_id)?;
        self.next_row_id = self.next_row_id.max(row.row_id + 1);
        self.order.insert(row.line_id, row.row_id);
        self.rows.insert(row.row_id, row);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    pub fn get(&self, row_id: RowId) -> Option<&Row> {
        self.rows.get(&row_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn next_row_id(&self) -> RowId {
        self.next_row_id
    }

    /// Highest position held by a row or a tombstone, 0 when empty.
    pub fn max_line(&self) -> LineId {
        let rows = self.order.last_key_value().map_or(0, |(l, _)| *l);
        let tombs = self.tombstones.last_key_value().map_or(0, |(l, _)| *l);
        rows.max(tombs)
    }

    /// Active rows in file order.
    pub fn rows_in_order(&self) -> impl Iterator<Item = &Row> {
        self.order.values().filter_map(|id| self.rows.get(id))
    }

    /// Rows with the given variant identifier, in file order.
    pub fn rows_with_variant_id<'a>(&'a self, variant_id: &'a str) -> impl Iterator<Item = &'a Row> {
        self.rows_in_order()
            .filter(move |row| row.fields.id.as_deref() == Some(variant_id))
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.values()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.rows.values().filter(|r| r.dirty).count()
    }

    /// True when some row is dirty or some tombstone is pending.
    pub fn has_pending(&self) -> bool {
        !self.tombstones.is_empty() || self.rows.values().any(|r| r.dirty)
    }

    /// Dirty rows and pending tombstone positions, as one pass sees them.
    pub fn pending_snapshot(&self) -> (Vec<DirtyRow>, Vec<LineId>) {
        let dirty = self
            .rows_in_order()
            .filter(|r| r.dirty)
            .map(|r| DirtyRow {
                row_id: r.row_id,
                line_id: r.line_id,
                version: r.version,
                fields: r.fields.clone(),
            })
            .collect();
        let tombstones = self.tombstones.keys().copied().collect();
        (dirty, tombstones)
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Identifiers the next insert will take: a fresh row id and the
    /// position after every row and tombstone.
    pub fn next_insert(&self) -> (RowId, LineId) {
        (self.next_row_id, self.max_line() + 1)
    }

    /// Fails exactly when [`RowStore::apply_insert`] would.
    pub fn check_insert(&self, row_id: RowId, line_id: LineId) -> Result<(), RowStoreError> {
        if self.rows.contains_key(&row_id) {
            return Err(RowStoreError::DuplicateRow(row_id));
        }
        if let Some(occupant) = self.occupant(line_id) {
            return Err(RowStoreError::LineOccupied {
                line_id,
                row_id: occupant,
            });
        }
        Ok(())
    }

    /// Fails exactly when [`RowStore::apply_update`] or
    /// [`RowStore::apply_delete`] would.
    pub fn check_exists(&self, row_id: RowId) -> Result<(), RowStoreError> {
        if self.rows.contains_key(&row_id) {
            Ok(())
        } else {
            Err(RowStoreError::UnknownRow(row_id))
        }
    }

    pub fn apply_insert(
        &mut self,
        row_id: RowId,
        line_id: LineId,
        fields: VariantFields,
    ) -> Result<&Row, RowStoreError> {
        self.place(Row {
            row_id,
            line_id,
            version: 1,
            dirty: true,
            fields,
        })?;
        self.rows
            .get(&row_id)
            .ok_or(RowStoreError::UnknownRow(row_id))
    }

    /// Replaces the row's fields and marks it dirty, even if nothing
    /// changed.
    pub fn apply_update(
        &mut self,
        row_id: RowId,
        fields: VariantFields,
    ) -> Result<&Row, RowStoreError> {
        let row = self
            .rows
            .get_mut(&row_id)
            .ok_or(RowStoreError::UnknownRow(row_id))?;
        row.fields = fields;
        row.version += 1;
        row.dirty = true;
        Ok(row)
    }

    /// Removes the row and leaves a tombstone at its position.
    pub fn apply_delete(&mut self, row_id: RowId) -> Result<Tombstone, RowStoreError> {
        let row = self
            .rows
            .remove(&row_id)
            .ok_or(RowStoreError::UnknownRow(row_id))?;
        self.order.remove(&row.line_id);
        let tombstone = Tombstone {
            row_id,
            line_id: row.line_id,
        };
        self.tombstones.insert(row.line_id, tombstone);
        Ok(tombstone)
    }

    /// Applies a completed pass.
    ///
    /// Rows in `written` whose version is unchanged become clean. The
    /// tombstones at `applied` are deleted, and every row and remaining
    /// tombstone is shifted down by the number of applied tombstones before
    /// it.
    pub fn commit_pass(&mut self, written: &[(RowId, u64)], applied: &[LineId]) -> CommitOutcome {
        let mut outcome = CommitOutcome::default();

        for (row_id, version) in written {
            match self.rows.get_mut(row_id) {
                Some(row) if row.version == *version => {
                    row.dirty = false;
                    outcome.cleaned += 1;
                }
                Some(_) => outcome.superseded += 1,
                None => {}
            }
        }

        let applied: BTreeSet<LineId> = applied.iter().copied().collect();
        if applied.is_empty() {
            return outcome;
        }
        let sorted: Vec<LineId> = applied.iter().copied().collect();
        let shift = |line: LineId| line - sorted.partition_point(|&t| t < line) as u64;

        let mut order = BTreeMap::new();
        for (line, row_id) in std::mem::take(&mut self.order) {
            let new_line = shift(line);
            if let Some(row) = self.rows.get_mut(&row_id) {
                row.line_id = new_line;
            }
            order.insert(new_line, row_id);
        }
        self.order = order;

        let mut tombstones = BTreeMap::new();
        for (line, mut tombstone) in std::mem::take(&mut self.tombstones) {
            if applied.contains(&line) {
                outcome.tombstones_removed += 1;
                continue;
            }
            tombstone.line_id = shift(line);
            tombstones.insert(tombstone.line_id, tombstone);
        }
        self.tombstones = tombstones;

        outcome
    }
}
