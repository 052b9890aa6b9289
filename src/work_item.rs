// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::OnceLock;

use canonical_error::{CanonicalError, invalid_argument_error};
use regex::Regex;

pub const MAX_BINNING: u32 = 4;

fn filter_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{1,20}$").unwrap())
}

/// A filter wheel slot and the name of the filter in it. The name becomes
/// part of saved file names, so it is restricted to letters and digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilterSpec {
    slot: u32,  // 1-based.
    name: String,
}

impl FilterSpec {
    pub fn new(slot: u32, name: &str) -> Result<Self, CanonicalError> {
        if slot == 0 {
            return Err(invalid_argument_error(
                "Filter slot numbers start at 1."));
        }
        if !Self::valid_name(name) {
            return Err(invalid_argument_error(
                format!("Invalid filter name \"{}\".", name).as_str()));
        }
        Ok(FilterSpec{slot, name: name.to_string()})
    }

    pub fn valid_name(name: &str) -> bool {
        filter_name_regex().is_match(name)
    }

    pub fn slot(&self) -> u32 { self.slot }
    pub fn name(&self) -> &str { &self.name }

    // The filter wheel is addressed by zero-based index.
    pub fn wheel_index(&self) -> u32 {
        self.slot - 1
    }
}

// "2: Red"
impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.slot, self.name)
    }
}

/// One set of flat frames with identical characteristics, e.g. "16 flat
/// frames with filter 2, binned 1x1, target 25000 ADU within 10%".
#[derive(Clone, Debug, PartialEq)]
pub struct WorkItem {
    frame_count: u32,
    filter: FilterSpec,
    binning: u32,
    target_brightness: f64,
    tolerance: f64,
    frames_completed: u32,
}

impl WorkItem {
    pub fn new(frame_count: u32, filter: FilterSpec, binning: u32,
               target_brightness: f64, tolerance: f64)
               -> Result<Self, CanonicalError> {
        if binning == 0 || binning > MAX_BINNING {
            return Err(invalid_argument_error(
                format!("Binning {} outside of 1..={}.",
                        binning, MAX_BINNING).as_str()));
        }
        if !(target_brightness > 0.0) || !target_brightness.is_finite() {
            return Err(invalid_argument_error(
                format!("Target brightness must be positive, got {}.",
                        target_brightness).as_str()));
        }
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(invalid_argument_error(
                format!("Tolerance must be a fraction between 0 and 1, got {}.",
                        tolerance).as_str()));
        }
        Ok(WorkItem{frame_count, filter, binning, target_brightness,
                    tolerance, frames_completed: 0})
    }

    pub fn frame_count(&self) -> u32 { self.frame_count }
    pub fn filter(&self) -> &FilterSpec { &self.filter }
    pub fn binning(&self) -> u32 { self.binning }
    pub fn target_brightness(&self) -> f64 { self.target_brightness }
    pub fn tolerance(&self) -> f64 { self.tolerance }
    pub fn frames_completed(&self) -> u32 { self.frames_completed }

    pub fn is_complete(&self) -> bool {
        self.frames_completed >= self.frame_count
    }

    pub fn frames_remaining(&self) -> u32 {
        self.frame_count.saturating_sub(self.frames_completed)
    }

    /// Counts one more accepted frame. Returns the new completed count; the
    /// count saturates at `frame_count`.
    pub fn record_accepted_frame(&mut self) -> u32 {
        if self.frames_completed < self.frame_count {
            self.frames_completed += 1;
        }
        self.frames_completed
    }

    // Used when resuming a partially completed plan.
    pub fn set_frames_completed(&mut self, completed: u32) {
        self.frames_completed = completed.min(self.frame_count);
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} with {} at {}x{} to {} ADU",
               self.frame_count, self.filter.name(),
               self.binning, self.binning, self.target_brightness)
    }
}

// mod tests.
