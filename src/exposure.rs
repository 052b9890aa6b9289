// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Exposure search for flat frames. A trial exposure is taken, the server
// reports its average ADU level, and we compute the next trial exposure.
// The first one or two frames of a set may be rejected while the search
// settles; after that refinement keeps tracking slow changes in the
// illumination (brightening sky, an adjusted light panel).

use std::fmt;
use std::str::FromStr;

use canonical_error::{CanonicalError, invalid_argument_error};
use log::{debug, warn};

// When a frame reports no signal at all there is no miss factor to apply;
// grow the exposure by this much instead.
const NO_SIGNAL_GROWTH: f64 = 4.0;

/// Returns true if `measured` is within `tolerance` (a fraction) of `target`.
pub fn within_tolerance(measured: f64, target: f64, tolerance: f64) -> bool {
    (measured - target).abs() / target <= tolerance
}

/// Bounds applied to every exposure we request, seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExposureLimits {
    pub min_seconds: f64,
    pub max_seconds: f64,
}

impl Default for ExposureLimits {
    fn default() -> Self {
        ExposureLimits{min_seconds: 0.001, max_seconds: 60.0}
    }
}

impl ExposureLimits {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if !(self.min_seconds > 0.0) || !(self.max_seconds >= self.min_seconds) {
            return Err(invalid_argument_error(
                format!("Invalid exposure limits {}..{} seconds.",
                        self.min_seconds, self.max_seconds).as_str()));
        }
        Ok(())
    }

    pub fn contains(&self, exposure: f64) -> bool {
        (self.min_seconds..=self.max_seconds).contains(&exposure)
    }

    pub fn clamp(&self, exposure: f64) -> f64 {
        if exposure.is_nan() {
            return self.min_seconds;
        }
        exposure.clamp(self.min_seconds, self.max_seconds)
    }
}

/// Computes the next trial exposure from the outcome of the previous one.
pub trait ExposureRefiner {
    // `tried` Exposure, seconds, that produced `measured`.
    // `measured` Average ADU level of the frame.
    // `target` Desired average ADU level.
    fn next_exposure(&mut self, tried: f64, measured: f64, target: f64) -> f64;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefinementStrategy {
    // Scale the exposure by the ADU miss factor. Flat-field illumination is
    // close to linear in exposure time near the working point.
    #[default]
    Linear,
    // Binary search between bounds that are narrowed by each frame.
    Bracket,
}

impl FromStr for RefinementStrategy {
    type Err = CanonicalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(RefinementStrategy::Linear),
            "bracket" => Ok(RefinementStrategy::Bracket),
            _ => Err(invalid_argument_error(
                format!("Unknown refinement strategy \"{}\".", s).as_str())),
        }
    }
}

impl fmt::Display for RefinementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefinementStrategy::Linear => write!(f, "linear"),
            RefinementStrategy::Bracket => write!(f, "bracket"),
        }
    }
}

/// Makes a fresh refiner for one work item.
pub fn make_refiner(strategy: RefinementStrategy, limits: ExposureLimits)
                    -> Box<dyn ExposureRefiner + Send> {
    match strategy {
        RefinementStrategy::Linear => Box::new(LinearRefiner::new(limits)),
        RefinementStrategy::Bracket => Box::new(BracketRefiner::new(limits)),
    }
}

pub struct LinearRefiner {
    limits: ExposureLimits,
}

impl LinearRefiner {
    pub fn new(limits: ExposureLimits) -> Self {
        LinearRefiner{limits}
    }
}

impl ExposureRefiner for LinearRefiner {
    fn next_exposure(&mut self, tried: f64, measured: f64, target: f64) -> f64 {
        if !(measured > 0.0) || !measured.is_finite() {
            debug!("No usable signal ({}) at {:.3}s", measured, tried);
            return self.limits.clamp(tried * NO_SIGNAL_GROWTH);
        }
        // >1 if the frame was too bright; <1 if too dim.
        let miss_factor = measured / target;
        let wanted = tried / miss_factor;
        if !self.limits.contains(wanted) {
            warn!("Exposure {:.3}s is outside the limits {}..{}s; the target \
                   ADU level may be unreachable",
                  wanted, self.limits.min_seconds, self.limits.max_seconds);
        }
        self.limits.clamp(wanted)
    }
}

pub struct BracketRefiner {
    limits: ExposureLimits,
    low: f64,
    high: f64,
}

impl BracketRefiner {
    pub fn new(limits: ExposureLimits) -> Self {
        BracketRefiner{limits, low: limits.min_seconds, high: limits.max_seconds}
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.low, self.high)
    }
}

impl ExposureRefiner for BracketRefiner {
    fn next_exposure(&mut self, tried: f64, measured: f64, target: f64) -> f64 {
        if measured > target {
            self.high = tried;
        } else {
            self.low = tried;
        }
        if self.low > self.high {
            // The illumination changed under us; reopen the search.
            self.low = self.limits.min_seconds;
            self.high = self.limits.max_seconds;
        }
        self.limits.clamp((self.low + self.high) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_within_tolerance() {
        assert!(within_tolerance(25000.0, 25000.0, 0.0));
        assert!(within_tolerance(26000.0, 25000.0, 0.05));
        assert!(within_tolerance(23750.0, 25000.0, 0.05));
        assert!(!within_tolerance(30000.0, 25000.0, 0.05));
        assert!(!within_tolerance(20000.0, 25000.0, 0.1));
    }

    #[test]
    fn test_linear_refinement() {
        let mut refiner = LinearRefiner::new(ExposureLimits::default());
        // 20% too bright.
        assert_abs_diff_eq!(refiner.next_exposure(10.0, 30000.0, 25000.0),
                            8.3333, epsilon = 0.0001);
        assert!(!within_tolerance(30000.0, 25000.0, 0.05));
        // Half as bright as wanted.
        assert_abs_diff_eq!(refiner.next_exposure(2.0, 12500.0, 25000.0),
                            4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_fixed_point() {
        let mut refiner = LinearRefiner::new(ExposureLimits::default());
        for tried in [0.5, 3.7, 10.0, 42.0] {
            assert_eq!(refiner.next_exposure(tried, 25000.0, 25000.0), tried);
        }
    }

    #[test]
    fn test_linear_no_signal() {
        let mut refiner = LinearRefiner::new(ExposureLimits::default());
        assert_eq!(refiner.next_exposure(2.0, 0.0, 25000.0), 8.0);
        assert_eq!(refiner.next_exposure(2.0, -5.0, 25000.0), 8.0);
        assert_eq!(refiner.next_exposure(30.0, 0.0, 25000.0), 60.0);
    }

    #[test]
    fn test_linear_clamped() {
        let limits = ExposureLimits{min_seconds: 0.1, max_seconds: 20.0};
        let mut refiner = LinearRefiner::new(limits);
        // Wants 100s.
        assert!(!limits.contains(10.0 / (2500.0 / 25000.0)));
        assert_eq!(refiner.next_exposure(10.0, 2500.0, 25000.0), 20.0);
        assert_eq!(refiner.next_exposure(0.2, 65000.0, 2000.0), 0.1);
    }

    #[test]
    fn test_bracket_refinement() {
        let limits = ExposureLimits{min_seconds: 0.0, max_seconds: 16.0};
        let mut refiner = BracketRefiner::new(limits);
        // Too bright at 8s: search below.
        assert_eq!(refiner.next_exposure(8.0, 40000.0, 25000.0), 4.0);
        assert_eq!(refiner.bounds(), (0.0, 8.0));
        // Too dim at 4s: search above.
        assert_eq!(refiner.next_exposure(4.0, 12000.0, 25000.0), 6.0);
        assert_eq!(refiner.bounds(), (4.0, 8.0));
    }

    #[test]
    fn test_bracket_reopens() {
        let limits = ExposureLimits{min_seconds: 1.0, max_seconds: 9.0};
        let mut refiner = BracketRefiner::new(limits);
        assert_eq!(refiner.next_exposure(5.0, 30000.0, 25000.0), 3.0);
        // Dim at 7s, beyond the established upper bound of 5s.
        assert_eq!(refiner.next_exposure(7.0, 20000.0, 25000.0), 5.0);
        assert_eq!(refiner.bounds(), (1.0, 9.0));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("linear".parse::<RefinementStrategy>().unwrap(),
                   RefinementStrategy::Linear);
        assert_eq!("Bracket".parse::<RefinementStrategy>().unwrap(),
                   RefinementStrategy::Bracket);
        assert!("newton".parse::<RefinementStrategy>().is_err());
        assert_eq!(RefinementStrategy::default().to_string(), "linear");
    }

    #[test]
    fn test_limits() {
        assert!(ExposureLimits::default().validate().is_ok());
        assert!(ExposureLimits{min_seconds: 0.0, max_seconds: 1.0}.validate().is_err());
        assert!(ExposureLimits{min_seconds: 2.0, max_seconds: 1.0}.validate().is_err());
        assert_eq!(ExposureLimits::default().clamp(f64::NAN), 0.001);
        assert!(ExposureLimits::default().contains(60.0));
        assert!(!ExposureLimits::default().contains(60.5));
        assert!(!ExposureLimits::default().contains(f64::NAN));
    }

}  // mod tests.
