// src/filter.rs
//
// Acceptance filtering for received frames.
//
// Three independent sub-filters:
//   - mask: hardware acceptance filter, pushed down to the adapter at open time
//   - range: inclusive id range, evaluated in software
//   - discrete: explicit id list, evaluated in software
//
// Enabled software sub-filters are alternatives: a frame passes if any of
// them matches. With neither enabled everything passes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::io::Frame;

// ============================================================================
// Types
// ============================================================================

/// Hardware acceptance filter: `(id & mask) == (code & mask)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskFilter {
    pub code: u32,
    pub mask: u32,
    pub extended: bool,
    pub enabled: bool,
}

/// Inclusive id range
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeFilter {
    pub start: u32,
    pub end: u32,
    pub enabled: bool,
}

impl RangeFilter {
    pub fn contains(&self, id: u32) -> bool {
        self.start <= id && id <= self.end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscreteFilter {
    pub ids: BTreeSet<u32>,
    pub enabled: bool,
}

impl DiscreteFilter {
    /// Parse a free-form list of hex ids separated by commas, semicolons or
    /// whitespace, e.g. `"100, 7DF 18FF0001"`.
    pub fn parse_ids(text: &str) -> Result<BTreeSet<u32>, FilterError> {
        text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| {
                let digits = s.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(digits, 16).map_err(|_| FilterError::InvalidId(s.to_string()))
            })
            .collect()
    }

    /// Enabled filter passing exactly the ids in `text`
    pub fn from_list(text: &str) -> Result<Self, FilterError> {
        let ids = Self::parse_ids(text)?;
        if ids.is_empty() {
            return Err(FilterError::EmptyList);
        }
        Ok(Self { ids, enabled: true })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid hex id '{0}'")]
    InvalidId(String),
    #[error("id list is empty")]
    EmptyList,
}

/// All three sub-filters, swapped as one unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSet {
    pub mask: MaskFilter,
    pub range: RangeFilter,
    pub discrete: DiscreteFilter,
}

impl FilterSet {
    /// True when software filtering would pass every frame
    pub fn is_pass_all(&self) -> bool {
        !self.range.enabled && !self.discrete.enabled
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Software filter decision for one frame. The mask sub-filter is ignored here.
pub fn passes(frame: &Frame, filters: &FilterSet) -> bool {
    if filters.is_pass_all() {
        return true;
    }
    let id = frame.id();
    (filters.range.enabled && filters.range.contains(id))
        || (filters.discrete.enabled && filters.discrete.ids.contains(&id))
}

// ============================================================================
// Tests
// ============================================================================
