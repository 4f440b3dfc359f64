//! Per-stack flat assignment and Y offset.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::diagnostics::{Diagnostics, ScanIssue};
use crate::error::{Error, Result};
use crate::flat_catalog::{FlatCatalog, FlatFile};
use crate::position_index::{PositionIndex, StagePosition};

/// Converts a physical offset to whole pixels, rounding half away from zero.
#[inline]
pub fn microns_to_pixels(microns: f64, xy_voxel_size: f64) -> i64 {
    (microns / xy_voxel_size).round() as i64
}

/// Alignment of one stack.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRecord {
    pub position: StagePosition,
    /// Index into the session's [`FlatCatalog`]; `None` disables flat correction.
    pub flat: Option<usize>,
    /// Y offset of the flat profile relative to the stack, in microns.
    pub y_offset_microns: f64,
    /// Set by any user adjustment; frozen against automatic reassignment.
    pub manual: bool,
}

impl AlignmentRecord {
    pub fn y_offset_pixels(&self, xy_voxel_size: f64) -> i64 {
        microns_to_pixels(self.y_offset_microns, xy_voxel_size)
    }
}

/// Owns one [`AlignmentRecord`] per displayed stack.
///
/// Offsets are stored in microns, so changing the pixel size only changes
/// how they are rendered and compiled.
#[derive(Debug, Clone)]
pub struct AlignmentState {
    records: BTreeMap<StagePosition, AlignmentRecord>,
    catalog: Arc<FlatCatalog>,
    tolerance: f64,
}

impl AlignmentState {
    /// Assigns each stack its nearest flat within `tolerance` microns.
    /// Stacks without one are recorded as [`ScanIssue::UnmatchedFlat`].
    pub fn initialize(
        positions: &PositionIndex,
        flats: Arc<FlatCatalog>,
        tolerance: f64,
        diagnostics: &mut Diagnostics,
    ) -> Self {
        let mut state = Self {
            records: BTreeMap::new(),
            catalog: flats,
            tolerance,
        };

        for position in positions.positions() {
            let record = state.auto_record(position);
            if record.flat.is_none() {
                diagnostics.push(state.unmatched_issue(position));
            }
            state.records.insert(position, record);
        }

        tracing::info!(
            "Auto-assigned flats to {} of {} stacks (tolerance {} um)",
            state.records.values().filter(|r| r.flat.is_some()).count(),
            state.records.len(),
            tolerance
        );
        state
    }

    fn auto_record(&self, position: StagePosition) -> AlignmentRecord {
        let flat = self.catalog.nearest_within(position.y_pos, self.tolerance);
        let y_offset_microns = flat
            .and_then(|idx| self.catalog.get(idx))
            .map(|f| (position.y_pos - f.y_pos) as f64 / 10.0)
            .unwrap_or(0.0);
        AlignmentRecord {
            position,
            flat,
            y_offset_microns,
            manual: false,
        }
    }

    fn unmatched_issue(&self, position: StagePosition) -> ScanIssue {
        ScanIssue::UnmatchedFlat {
            position,
            nearest_microns: self
                .catalog
                .nearest(position.y_pos)
                .map(|idx| self.catalog.distance_microns(idx, position.y_pos)),
            tolerance_microns: self.tolerance,
        }
    }

    fn record_mut(&mut self, position: StagePosition) -> Result<&mut AlignmentRecord> {
        self.records
            .get_mut(&position)
            .ok_or(Error::UnknownStack { position })
    }

    /// Sets a manual offset in microns.
    pub fn set_offset(&mut self, position: StagePosition, y_offset_microns: f64) -> Result<()> {
        if !y_offset_microns.is_finite() {
            return Err(Error::InvalidOffset(y_offset_microns));
        }
        let record = self.record_mut(position)?;
        record.y_offset_microns = y_offset_microns;
        record.manual = true;
        tracing::debug!("Stack {position}: offset set to {y_offset_microns} um");
        Ok(())
    }

    /// Picks a flat by catalog index (or none) for a stack, keeping its offset.
    pub fn set_flat(&mut self, position: StagePosition, flat: Option<usize>) -> Result<()> {
        if let Some(index) = flat {
            if index >= self.catalog.len() {
                return Err(Error::UnknownFlat {
                    index,
                    len: self.catalog.len(),
                });
            }
        }
        let record = self.record_mut(position)?;
        record.flat = flat;
        record.manual = true;
        Ok(())
    }

    /// Drops manual changes and reruns automatic assignment for one stack.
    pub fn reset(&mut self, position: StagePosition) -> Result<()> {
        if !self.records.contains_key(&position) {
            return Err(Error::UnknownStack { position });
        }
        let record = self.auto_record(position);
        self.records.insert(position, record);
        Ok(())
    }

    pub fn record(&self, position: &StagePosition) -> Option<&AlignmentRecord> {
        self.records.get(position)
    }

    /// Records in (x, y) order.
    pub fn records(&self) -> impl Iterator<Item = &AlignmentRecord> + '_ {
        self.records.values()
    }

    /// The flat assigned to `position`, if any.
    pub fn flat_for(&self, position: &StagePosition) -> Option<&FlatFile> {
        self.records
            .get(position)
            .and_then(|r| r.flat)
            .and_then(|idx| self.catalog.get(idx))
    }

    pub fn catalog(&self) -> &FlatCatalog {
        &self.catalog
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
