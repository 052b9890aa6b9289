// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Dithering of flat frames. Successive frames of a set are taken at slightly
// different telescope positions so that they are not pixel-for-pixel
// identical:
//
// * The first frame after a reset is taken on the origin (no move).
// * Then 8 frames are taken around a ring of `step_radius` about the origin.
// * Each subsequent ring is one `step_radius` further out and has double the
//   number of positions (16, 32, ...).
// * Once a ring would exceed `max_radius`, we start over at the first ring.
//
// All offsets are computed about zero in radians, then converted to degrees
// and added to the origin's altitude/azimuth.

use std::f64::consts::PI;
use std::fmt;

const ARCSEC_PER_DEGREE: f64 = 3600.0;

// Number of positions on the innermost ring.
const FIRST_RING_STEPS: u32 = 8;

/// Instructions for positioning the telescope for the next frame. When
/// `move_scope` is false the position is the origin and no slew is needed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DitherStep {
    pub move_scope: bool,
    pub alt: f64,  // Degrees.
    pub az: f64,  // Degrees.
}

#[derive(Clone, Debug)]
pub struct Ditherer {
    origin_alt: f64,  // Degrees.
    origin_az: f64,  // Degrees.
    step_radius_arcsec: f64,
    max_radius_arcsec: f64,
    step_radius: f64,  // Radians.
    max_radius: f64,  // Radians.

    // Spiral progress; see reset().
    frames_since_reset: u32,
    angle: f64,
    ring_step_count: u32,
    current_radius: f64,
}

impl Ditherer {
    // `origin_alt`, `origin_az` Position of the light source, degrees.
    // `step_radius_arcsec` Spacing between rings.
    // `max_radius_arcsec` Largest ring radius before starting over.
    pub fn new(origin_alt: f64, origin_az: f64,
               step_radius_arcsec: f64, max_radius_arcsec: f64) -> Self {
        let mut ditherer = Ditherer{
            origin_alt,
            origin_az,
            step_radius_arcsec,
            max_radius_arcsec,
            step_radius: (step_radius_arcsec / ARCSEC_PER_DEGREE).to_radians(),
            max_radius: (max_radius_arcsec / ARCSEC_PER_DEGREE).to_radians(),
            frames_since_reset: 0,
            angle: 0.0,
            ring_step_count: 0,
            current_radius: 0.0,
        };
        ditherer.reset();
        ditherer
    }

    /// Returns to the origin. The next call to next_frame() reports no move,
    /// and the one after that begins the first ring.
    pub fn reset(&mut self) {
        self.frames_since_reset = 0;
        // Anything past a full turn makes the next offset start a new ring;
        // doubling 4 gives the first ring its 8 steps.
        self.angle = 3.0 * PI;
        self.ring_step_count = FIRST_RING_STEPS / 2;
        self.current_radius = 0.0;
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.origin_alt, self.origin_az)
    }

    pub fn ring_step_count(&self) -> u32 {
        self.ring_step_count
    }

    // Radians.
    pub fn current_radius(&self) -> f64 {
        self.current_radius
    }

    /// Advances the pattern by one frame.
    pub fn next_frame(&mut self) -> DitherStep {
        self.frames_since_reset += 1;
        if self.frames_since_reset == 1 {
            return DitherStep{move_scope: false,
                              alt: self.origin_alt, az: self.origin_az};
        }
        let (x_offset, y_offset) = self.next_offset();
        DitherStep{
            move_scope: true,
            alt: self.origin_alt + x_offset.to_degrees(),
            az: self.origin_az + y_offset.to_degrees(),
        }
    }

    // Offset from the origin, radians, for the next dithered frame.
    fn next_offset(&mut self) -> (f64, f64) {
        if self.angle > 2.0 * PI {
            // Finished this ring, move out to the next one.
            self.angle = 0.0;
            self.ring_step_count *= 2;
            self.current_radius += self.step_radius;
            if self.current_radius > self.max_radius {
                self.ring_step_count = FIRST_RING_STEPS;
                self.current_radius = self.step_radius;
            }
        } else {
            self.angle += 2.0 * PI / self.ring_step_count as f64;
        }
        (self.angle.cos() * self.current_radius,
         self.angle.sin() * self.current_radius)
    }
}

impl fmt::Display for Ditherer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "from ({:.4}, {:.4}), radius {}'' to {}''",
               self.origin_alt, self.origin_az,
               self.step_radius_arcsec, self.max_radius_arcsec)
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    fn distance_from_origin(d: &Ditherer, step: &DitherStep) -> f64 {
        let (alt, az) = d.origin();
        let d_alt = (step.alt - alt).to_radians();
        let d_az = (step.az - az).to_radians();
        (d_alt * d_alt + d_az * d_az).sqrt()
    }

    #[test]
    fn test_first_frame_does_not_move() {
        let mut d = Ditherer::new(45.0, 120.0, 10.0, 60.0);
        let step = d.next_frame();
        assert_eq!(step, DitherStep{move_scope: false, alt: 45.0, az: 120.0});
    }

    #[test]
    fn test_first_ring_at_step_radius() {
        let mut d = Ditherer::new(45.0, 120.0, 10.0, 60.0);
        let step_radius = (10.0_f64 / 3600.0).to_radians();
        d.next_frame();
        for _ in 2..=9 {
            let step = d.next_frame();
            assert!(step.move_scope);
            assert_abs_diff_eq!(distance_from_origin(&d, &step), step_radius,
                                epsilon = 1e-12);
            assert_eq!(d.ring_step_count(), 8);
        }
        // Second frame sits at angle zero: pure altitude offset.
        let mut d = Ditherer::new(45.0, 120.0, 10.0, 60.0);
        d.next_frame();
        let step = d.next_frame();
        assert_abs_diff_eq!(step.alt, 45.0 + 10.0 / 3600.0, epsilon = 1e-12);
        assert_abs_diff_eq!(step.az, 120.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rings_double_then_wrap() {
        // Radius budget allows three rings.
        let mut d = Ditherer::new(0.0, 0.0, 10.0, 35.0);
        let step_radius = (10.0_f64 / 3600.0).to_radians();
        d.next_frame();

        let mut seen_rings = Vec::<(u32, f64)>::new();
        for _ in 0..200 {
            d.next_frame();
            let ring = (d.ring_step_count(), d.current_radius());
            if seen_rings.last().map(|r| r.0) != Some(ring.0) {
                seen_rings.push(ring);
            }
            assert!(d.current_radius() <= (35.0_f64 / 3600.0).to_radians() + step_radius);
        }
        assert_eq!(seen_rings[0].0, 8);
        assert_eq!(seen_rings[1].0, 16);
        assert_eq!(seen_rings[2].0, 32);
        // Fourth ring would exceed the max radius; start over.
        assert_eq!(seen_rings[3].0, 8);
        assert_abs_diff_eq!(seen_rings[3].1, step_radius, epsilon = 1e-15);
        assert_abs_diff_eq!(seen_rings[1].1, 2.0 * step_radius, epsilon = 1e-15);
    }

    #[test]
    fn test_reset_returns_to_origin() {
        let mut d = Ditherer::new(30.0, 200.0, 5.0, 20.0);
        for _ in 0..12 {
            d.next_frame();
        }
        d.reset();
        let step = d.next_frame();
        assert!(!step.move_scope);
        assert_eq!((step.alt, step.az), (30.0, 200.0));
        let step = d.next_frame();
        assert!(step.move_scope);
        assert_eq!(d.ring_step_count(), 8);
    }

    #[test]
    fn test_display() {
        let d = Ditherer::new(30.0, 200.0, 5.0, 20.0);
        assert_eq!(d.to_string(), "from (30.0000, 200.0000), radius 5'' to 20''");
    }

}  // mod tests.
