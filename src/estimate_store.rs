// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Historical exposure estimates, one per (filter, binning) combination. A
// session seeds each work item's exposure search from here and writes back
// the refined exposure after every frame, so the next session starts close
// to the right answer.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, internal_error};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::work_item::FilterSpec;

/// Starting exposure, seconds, when we have no history.
pub const INITIAL_EXPOSURE_GUESS: f64 = 10.0;

pub trait ExposureEstimateStore {
    fn estimate(&self, filter: &FilterSpec, binning: u32) -> Option<f64>;

    fn record(&mut self, filter: &FilterSpec, binning: u32, exposure: f64)
              -> Result<(), CanonicalError>;

    fn estimate_or_default(&self, filter: &FilterSpec, binning: u32) -> f64 {
        self.estimate(filter, binning).unwrap_or(INITIAL_EXPOSURE_GUESS)
    }
}

fn estimate_key(filter: &FilterSpec, binning: u32) -> String {
    format!("{}/{}x{}", filter.name(), binning, binning)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Estimates {
    exposures: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
pub struct MemoryEstimateStore {
    estimates: Estimates,
}

impl MemoryEstimateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExposureEstimateStore for MemoryEstimateStore {
    fn estimate(&self, filter: &FilterSpec, binning: u32) -> Option<f64> {
        self.estimates.exposures.get(&estimate_key(filter, binning)).copied()
    }

    fn record(&mut self, filter: &FilterSpec, binning: u32, exposure: f64)
              -> Result<(), CanonicalError> {
        self.estimates.exposures.insert(estimate_key(filter, binning), exposure);
        Ok(())
    }
}

/// Estimates persisted as a JSON file, rewritten on every record().
#[derive(Debug)]
pub struct JsonFileEstimateStore {
    path: PathBuf,
    estimates: Estimates,
}

impl JsonFileEstimateStore {
    // A missing file starts an empty store; an unreadable one is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CanonicalError> {
        let path = path.as_ref().to_path_buf();
        let estimates = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| internal_error(
                format!("Error reading {}: {}", path.display(), e).as_str()))?;
            serde_json::from_str(&text).map_err(|e| internal_error(
                format!("Error parsing {}: {}", path.display(), e).as_str()))?
        } else {
            info!("No exposure history at {}, starting fresh", path.display());
            Estimates::default()
        };
        Ok(JsonFileEstimateStore{path, estimates})
    }

    fn save(&self) -> Result<(), CanonicalError> {
        let text = serde_json::to_string_pretty(&self.estimates).map_err(
            |e| internal_error(format!("Error encoding estimates: {}", e).as_str()))?;
        fs::write(&self.path, text).map_err(|e| {
            warn!("Could not write {}: {}", self.path.display(), e);
            internal_error(
                format!("Error writing {}: {}", self.path.display(), e).as_str())
        })
    }
}

impl ExposureEstimateStore for JsonFileEstimateStore {
    fn estimate(&self, filter: &FilterSpec, binning: u32) -> Option<f64> {
        self.estimates.exposures.get(&estimate_key(filter, binning)).copied()
    }

    fn record(&mut self, filter: &FilterSpec, binning: u32, exposure: f64)
              -> Result<(), CanonicalError> {
        self.estimates.exposures.insert(estimate_key(filter, binning), exposure);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let lum = FilterSpec::new(1, "Luminance").unwrap();
        let red = FilterSpec::new(2, "Red").unwrap();
        let mut store = MemoryEstimateStore::new();
        assert_eq!(store.estimate(&lum, 1), None);
        assert_eq!(store.estimate_or_default(&lum, 1), INITIAL_EXPOSURE_GUESS);

        store.record(&lum, 1, 3.5).unwrap();
        store.record(&red, 2, 1.25).unwrap();
        assert_eq!(store.estimate(&lum, 1), Some(3.5));
        assert_eq!(store.estimate(&lum, 2), None);
        assert_eq!(store.estimate_or_default(&red, 2), 1.25);
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estimates.json");
        let ha = FilterSpec::new(5, "Ha").unwrap();
        {
            let mut store = JsonFileEstimateStore::open(&path).unwrap();
            assert_eq!(store.estimate(&ha, 1), None);
            store.record(&ha, 1, 42.0).unwrap();
        }
        let store = JsonFileEstimateStore::open(&path).unwrap();
        assert_eq!(store.estimate(&ha, 1), Some(42.0));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"Ha/1x1\": 42.0"));
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estimates.json");
        fs::write(&path, "not json").unwrap();
        assert!(JsonFileEstimateStore::open(&path).is_err());
    }

}  // mod tests.
