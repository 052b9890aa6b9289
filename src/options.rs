// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};
use regex::Regex;

use crate::exposure::{ExposureLimits, RefinementStrategy};
use crate::skyx_client::DEFAULT_PORT;

/// Where accepted frames are saved.
#[derive(Clone, Debug, PartialEq)]
pub enum SaveDestination {
    // A directory on the machine running the server.
    Local(PathBuf),
    // The camera's autosave directory as configured in the server.
    Autosave,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MountOptions {
    // When false none of the other fields apply and the mount is untouched.
    pub control_mount: bool,
    pub home_mount: bool,

    // Altitude/azimuth of the flat light source, degrees. When set the
    // mount slews there before capture starts, and dithering is about it.
    pub source_alt_az: Option<(f64, f64)>,

    pub tracking_off: bool,
    pub park_when_done: bool,
    pub disconnect_when_done: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DitherOptions {
    pub enabled: bool,
    pub step_radius_arcsec: f64,
    pub max_radius_arcsec: f64,
}

impl Default for DitherOptions {
    fn default() -> Self {
        DitherOptions{enabled: false, step_radius_arcsec: 5.0,
                      max_radius_arcsec: 30.0}
    }
}

/// Waits and polling cadences used by the session engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineTimings {
    // Granularity of cancellable waits.
    pub wait_increment: Duration,
    // After the expected exposure+download time, how long we keep asking
    // the camera whether the image is done.
    pub resync_timeout: Duration,
    pub resync_interval: Duration,
    pub slew_poll_interval: Duration,
    pub slew_max_wait: Duration,
    // Pause before reporting the session finished, so the last console
    // lines are seen.
    pub finish_delay: Duration,
    pub max_rejections_in_a_row: u32,
}

impl Default for EngineTimings {
    fn default() -> Self {
        EngineTimings{
            wait_increment: Duration::from_millis(500),
            resync_timeout: Duration::from_secs(120),
            resync_interval: Duration::from_millis(500),
            slew_poll_interval: Duration::from_millis(500),
            slew_max_wait: Duration::from_secs(180),
            finish_delay: Duration::from_secs(2),
            max_rejections_in_a_row: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,

    // Defaults for work items built from the command line.
    pub target_adu: f64,
    pub tolerance: f64,  // Fraction of target_adu.

    pub save_destination: SaveDestination,
    pub use_filter_wheel: bool,
    pub mount: MountOptions,
    pub dither: DitherOptions,

    // Turn off camera cooling at the end of an uncancelled session.
    pub warm_when_done: bool,

    pub strategy: RefinementStrategy,
    pub exposure_limits: ExposureLimits,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions{
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            target_adu: 25000.0,
            tolerance: 0.10,
            save_destination: SaveDestination::Autosave,
            use_filter_wheel: true,
            mount: MountOptions::default(),
            dither: DitherOptions::default(),
            warm_when_done: false,
            strategy: RefinementStrategy::default(),
            exposure_limits: ExposureLimits::default(),
        }
    }
}

impl SessionOptions {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if !valid_server_address(&self.host) {
            return Err(invalid_argument_error(
                format!("Invalid server address \"{}\".", self.host).as_str()));
        }
        if self.port == 0 {
            return Err(invalid_argument_error("Port number must be nonzero."));
        }
        if !(self.target_adu > 0.0) || !self.target_adu.is_finite() {
            return Err(invalid_argument_error(
                format!("Target ADU must be positive, got {}.",
                        self.target_adu).as_str()));
        }
        if !(0.0..=1.0).contains(&self.tolerance) {
            return Err(invalid_argument_error(
                format!("Tolerance must be a fraction between 0 and 1, got {}.",
                        self.tolerance).as_str()));
        }
        self.exposure_limits.validate()?;
        if self.dither.enabled {
            if !self.mount.control_mount {
                return Err(invalid_argument_error(
                    "Dithering moves the mount; enable mount control to dither."));
            }
            let d = &self.dither;
            if !(d.step_radius_arcsec > 0.0)
                || !(d.max_radius_arcsec >= d.step_radius_arcsec)
            {
                return Err(invalid_argument_error(
                    format!("Invalid dither radii {}'' and {}''.",
                            d.step_radius_arcsec, d.max_radius_arcsec).as_str()));
            }
        }
        if let Some((alt, az)) = self.mount.source_alt_az {
            if !(-90.0..=90.0).contains(&alt) || !(0.0..=360.0).contains(&az) {
                return Err(invalid_argument_error(
                    format!("Invalid light source position {}/{}.",
                            alt, az).as_str()));
            }
        }
        Ok(())
    }
}

fn host_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{0,62}$").unwrap())
}

/// Returns true for a dotted IPv4 address or a syntactically valid host name.
pub fn valid_server_address(address: &str) -> bool {
    if address.parse::<Ipv4Addr>().is_ok() {
        return true;
    }
    valid_host_name(address)
}

pub fn valid_host_name(name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| host_label_regex().is_match(label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addresses() {
        assert!(valid_server_address("localhost"));
        assert!(valid_server_address("192.168.1.20"));
        assert!(valid_server_address("observatory-pc.local"));
        assert!(valid_server_address("10.0.0.300"));  // Legal host name.
        assert!(!valid_server_address(""));
        assert!(!valid_server_address("-bad.example"));
        assert!(!valid_server_address("two..dots"));
        assert!(!valid_server_address("under_score"));
        assert!(!valid_server_address(&"a".repeat(64)));
    }

    #[test]
    fn test_default_options_valid() {
        let options = SessionOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.port, 3040);
        assert_eq!(options.target_adu, 25000.0);
        assert_eq!(options.tolerance, 0.10);
    }

    #[test]
    fn test_invalid_options() {
        let mut options = SessionOptions{tolerance: 1.5, ..Default::default()};
        assert!(options.validate().is_err());

        options = SessionOptions{target_adu: 0.0, ..Default::default()};
        assert!(options.validate().is_err());

        options = SessionOptions{host: "no way".to_string(), ..Default::default()};
        assert!(options.validate().is_err());

        options = SessionOptions::default();
        options.mount.control_mount = true;
        options.dither = DitherOptions{enabled: true, step_radius_arcsec: 10.0,
                                       max_radius_arcsec: 5.0};
        assert!(options.validate().is_err());
        // Radii are not checked when dithering is off.
        options.dither.enabled = false;
        assert!(options.validate().is_ok());

        options.mount.source_alt_az = Some((95.0, 10.0));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_dither_requires_mount_control() {
        let mut options = SessionOptions{
            dither: DitherOptions{enabled: true, ..Default::default()},
            ..Default::default()
        };
        assert!(options.validate().is_err());
        options.mount.control_mount = true;
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_default_timings() {
        let t = EngineTimings::default();
        assert_eq!(t.wait_increment, Duration::from_millis(500));
        assert_eq!(t.resync_timeout, Duration::from_secs(120));
        assert_eq!(t.slew_max_wait, Duration::from_secs(180));
        assert_eq!(t.finish_delay, Duration::from_secs(2));
        assert_eq!(t.max_rejections_in_a_row, 10);
    }

}  // mod tests.
