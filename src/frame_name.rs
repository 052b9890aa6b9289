// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use chrono::{Local, NaiveDateTime};

/// File name for a saved flat frame. A session leaves many files in the
/// destination folder, so names sort by capture time and carry the frame's
/// characteristics, e.g. `20200129-200420-Flat-Luminance-3.2-1x1-7.fit`.
pub fn flat_frame_file_name(time: NaiveDateTime, filter_name: &str,
                            exposure_seconds: f64, binning: u32,
                            sequence: u32) -> String {
    format!("{}-Flat-{}-{:.1}-{}x{}-{}.fit",
            time.format("%Y%m%d-%H%M%S"), filter_name,
            exposure_seconds, binning, binning, sequence)
}

/// As above, stamped with the current local time.
pub fn flat_frame_file_name_now(filter_name: &str, exposure_seconds: f64,
                                binning: u32, sequence: u32) -> String {
    flat_frame_file_name(Local::now().naive_local(), filter_name,
                         exposure_seconds, binning, sequence)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use super::*;

    fn when() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 29).unwrap()
            .and_hms_opt(20, 4, 20).unwrap()
    }

    #[test]
    fn test_file_name() {
        assert_eq!(flat_frame_file_name(when(), "Luminance", 3.2, 1, 7),
                   "20200129-200420-Flat-Luminance-3.2-1x1-7.fit");
        assert_eq!(flat_frame_file_name(when(), "Ha", 12.0, 2, 16),
                   "20200129-200420-Flat-Ha-12.0-2x2-16.fit");
        assert_eq!(flat_frame_file_name(when(), "Red", 8.333333, 3, 1),
                   "20200129-200420-Flat-Red-8.3-3x3-1.fit");
        assert_eq!(flat_frame_file_name(when(), "Blue", 0.04, 4, 2),
                   "20200129-200420-Flat-Blue-0.0-4x4-2.fit");
    }

    #[test]
    fn test_file_name_now_shape() {
        let name = flat_frame_file_name_now("Green", 1.25, 2, 3);
        assert!(name.ends_with("-Flat-Green-1.2-2x2-3.fit")
                || name.ends_with("-Flat-Green-1.3-2x2-3.fit"));
        assert_eq!(name.len(), "YYYYMMDD-HHMMSS".len()
                   + "-Flat-Green-1.2-2x2-3.fit".len());
    }

}  // mod tests.
