// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Runs a flat frame acquisition session: an ordered list of work items, each
// a number of flat frames with one filter and binning. For every frame we
// take a trial exposure, measure its average ADU level, keep the frame if it
// is close enough to the target, and refine the exposure either way. The
// first one or two frames of an item may be rejected while the exposure
// search settles.
//
// The session is cancelled cooperatively: the SessionController is checked
// at every wait and poll boundary, never in the middle of a server request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, aborted_error, deadline_exceeded_error,
                      resource_exhausted_error};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::dither::{DitherStep, Ditherer};
use crate::estimate_store::ExposureEstimateStore;
use crate::exposure::{make_refiner, within_tolerance};
use crate::frame_name::flat_frame_file_name_now;
use crate::options::{EngineTimings, SessionOptions};
use crate::progress::{EventSink, SessionEvent, SessionOutcome, SessionState};
use crate::session_control::SessionController;
use crate::skyx_client::ImagingServer;
use crate::work_item::{FilterSpec, WorkItem};

const TOO_MANY_REJECTIONS: &str = "Too many rejected frames, stopping session.";

pub struct SessionEngine {
    server: Arc<dyn ImagingServer + Send + Sync>,
    options: SessionOptions,
    timings: EngineTimings,
    controller: SessionController,
    events: EventSink,
    estimates: Box<dyn ExposureEstimateStore + Send + Sync>,

    state: SessionState,

    // Measured at session start by timing a bias frame for each binning
    // used. Added to the exposure time when waiting for a frame.
    download_times: HashMap<u32, Duration>,

    // Some filter wheels move even when asked for the filter they are
    // already on, disturbing registration; we only select on change.
    last_filter_slot: Option<u32>,

    // Built before the first item's first frame and reset at the start of
    // each item, so every item's pattern is about the same origin.
    ditherer: Option<Ditherer>,
    // True once a dither slew has moved the scope away from the origin.
    dithered_off_origin: bool,
}

impl SessionEngine {
    pub fn new(server: Arc<dyn ImagingServer + Send + Sync>,
               options: SessionOptions,
               controller: SessionController,
               events: EventSink,
               estimates: Box<dyn ExposureEstimateStore + Send + Sync>) -> Self {
        SessionEngine{
            server,
            options,
            timings: EngineTimings::default(),
            controller,
            events,
            estimates,
            state: SessionState::Idle,
            download_times: HashMap::new(),
            last_filter_slot: None,
            ditherer: None,
            dithered_off_origin: false,
        }
    }

    pub fn with_timings(mut self, timings: EngineTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn state(&self) -> SessionState { self.state }

    pub fn download_times(&self) -> &HashMap<u32, Duration> {
        &self.download_times
    }

    pub fn estimates(&self) -> &(dyn ExposureEstimateStore + Send + Sync) {
        self.estimates.as_ref()
    }

    /// Runs the session on its own task. The work items, with their
    /// updated completion counts, are handed back along with the outcome.
    pub fn spawn(mut self, mut work_items: Vec<WorkItem>)
                 -> JoinHandle<(SessionOutcome, Vec<WorkItem>)> {
        tokio::spawn(async move {
            let outcome = self.run(&mut work_items).await;
            (outcome, work_items)
        })
    }

    /// Processes `work_items` in order until all are complete, one fails, or
    /// the session is cancelled. Completion counts are updated in place.
    pub async fn run(&mut self, work_items: &mut [WorkItem]) -> SessionOutcome {
        info!("Session started at {}:{} with {} work items",
              self.options.host, self.options.port, work_items.len());
        self.events.console(format!("Session Started at server {}:{}",
                                    self.options.host, self.options.port), 1);

        let result = self.run_phases(work_items).await;
        let cancelled = self.controller.is_cancel_requested();
        let outcome = match result {
            _ if cancelled => SessionOutcome::Cancelled,
            Ok(()) => SessionOutcome::Completed,
            Err(e) => {
                error!("Session failed: {}", e.message);
                SessionOutcome::Failed{message: e.message}
            }
        };
        if !cancelled {
            self.set_state(SessionState::Completing);
            self.finish_up().await;
        }

        info!("{}", outcome);
        self.events.console(outcome.to_string(), 1);
        sleep(self.timings.finish_delay).await;
        self.set_state(if cancelled { SessionState::Cancelled }
                       else { SessionState::Finished });
        self.events.send(SessionEvent::Finished(outcome.clone()));
        self.controller.mark_stopped();
        outcome
    }

    async fn run_phases(&mut self, work_items: &mut [WorkItem])
                        -> Result<(), CanonicalError> {
        self.set_state(SessionState::Preparing);
        let slewing = self.prepare_mount().await?;

        // Download timing proceeds while the mount slews.
        self.set_state(SessionState::Calibrating);
        self.measure_download_times(work_items).await?;
        if slewing {
            self.events.console("Waiting for slew to finish", 1);
            match self.wait_for_slew().await {
                Ok(()) => self.events.console("Slew Complete", 2),
                Err(e) => return Err(self.console_error("Slew failed", e)),
            }
        }
        if self.options.mount.control_mount && self.options.mount.tracking_off {
            self.events.console("Turning off mount tracking", 1);
            self.server.set_tracking(false).await.map_err(
                |e| self.console_error("Error turning off tracking", e))?;
        }

        self.set_state(SessionState::ProcessingWorkItems);
        for (index, item) in work_items.iter_mut().enumerate() {
            self.check_cancel()?;
            self.process_work_item(index, item).await?;
        }
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("Session state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.events.state(state);
    }

    fn check_cancel(&self) -> Result<(), CanonicalError> {
        if self.controller.is_running() {
            Ok(())
        } else {
            Err(aborted_error("Session cancelled"))
        }
    }

    // Shows a failure on the console and passes it along.
    fn console_error(&self, context: &str, e: CanonicalError) -> CanonicalError {
        warn!("{}: {}", context, e.message);
        self.events.console(format!("** {}: {}", context, e.message), 2);
        e
    }

    // Returns true if a slew to the light source was started.
    async fn prepare_mount(&mut self) -> Result<bool, CanonicalError> {
        let mount = self.options.mount.clone();
        if !mount.control_mount {
            return Ok(false);
        }
        self.server.connect_telescope().await.map_err(
            |e| self.console_error("Error connecting to telescope", e))?;
        if mount.home_mount {
            self.events.console("Homing mount", 1);
            self.server.home_mount().await.map_err(
                |e| self.console_error("Error homing mount", e))?;
        }
        if let Some((alt, az)) = mount.source_alt_az {
            self.server.start_slew_to(alt, az).await.map_err(
                |e| self.console_error("Error starting slew", e))?;
            self.events.console("Slewing to light source", 1);
            return Ok(true);
        }
        Ok(false)
    }

    // Polls until the mount reports the current slew complete. A cancelled
    // slew is aborted.
    async fn wait_for_slew(&self) -> Result<(), CanonicalError> {
        let mut waited = Duration::ZERO;
        loop {
            if !self.controller.is_running() {
                if let Err(e) = self.server.abort_slew().await {
                    debug!("Abort slew: {}", e.message);
                }
                return Err(aborted_error("Slew cancelled"));
            }
            sleep(self.timings.slew_poll_interval).await;
            waited += self.timings.slew_poll_interval;
            if self.server.slew_is_complete().await? {
                return Ok(());
            }
            if waited > self.timings.slew_max_wait {
                return Err(deadline_exceeded_error("Slew Timed Out"));
            }
        }
    }

    async fn measure_download_times(&mut self, work_items: &[WorkItem])
                                    -> Result<(), CanonicalError> {
        self.events.console("Measuring download times", 1);
        for item in work_items.iter().filter(|i| !i.is_complete()) {
            let binning = item.binning();
            if self.download_times.contains_key(&binning) {
                continue;
            }
            self.check_cancel()?;
            let start = Instant::now();
            let download_time = match self.server.take_bias_frame(binning, false).await {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    self.events.console(
                        format!("Binned {} x {}: {:.1} seconds",
                                binning, binning, elapsed.as_secs_f64()), 2);
                    elapsed
                }
                Err(e) => {
                    warn!("Could not time {}x{} download: {}",
                          binning, binning, e.message);
                    self.events.console(
                        format!("Error timing download: {}", e.message), 2);
                    Duration::ZERO
                }
            };
            self.download_times.insert(binning, download_time);
        }
        Ok(())
    }

    async fn process_work_item(&mut self, index: usize, item: &mut WorkItem)
                               -> Result<(), CanonicalError> {
        if item.is_complete() {
            debug!("Skipping completed work item {}", index);
            return Ok(());
        }
        self.events.send(SessionEvent::WorkItemStarted{index});
        let filter_phrase = if self.options.use_filter_wheel {
            format!(" with filter {}", item.filter())
        } else {
            String::new()
        };
        info!("Work item {}: {}", index, item);
        self.events.console(
            format!("Capture {} flats{} binned {} x {}", item.frame_count(),
                    filter_phrase, item.binning(), item.binning()), 1);

        let result = self.acquire_work_item(index, item).await;
        if self.controller.is_cancel_requested() {
            self.clean_up_from_cancel().await;
        }
        result
    }

    async fn acquire_work_item(&mut self, index: usize, item: &mut WorkItem)
                               -> Result<(), CanonicalError> {
        self.server.connect_camera().await.map_err(
            |e| self.console_error("Error connecting to camera", e))?;
        if self.options.use_filter_wheel {
            self.server.connect_filter_wheel().await.map_err(
                |e| self.console_error("Error connecting to filter wheel", e))?;
            self.select_filter(item.filter()).await?;
        }
        self.events.send(SessionEvent::ProgressStarted{maximum: item.frame_count()});
        let result = self.acquire_frames(index, item).await;
        self.events.send(SessionEvent::ProgressFinished);
        result
    }

    async fn select_filter(&mut self, filter: &FilterSpec) -> Result<(), CanonicalError> {
        if self.last_filter_slot == Some(filter.slot()) {
            return Ok(());
        }
        self.server.select_filter(filter.wheel_index()).await.map_err(
            |e| self.console_error(
                format!("Error selecting filter {}", filter.slot()).as_str(), e))?;
        self.last_filter_slot = Some(filter.slot());
        Ok(())
    }

    async fn acquire_frames(&mut self, index: usize, item: &mut WorkItem)
                            -> Result<(), CanonicalError> {
        let filter = item.filter().clone();
        let binning = item.binning();
        let target = item.target_brightness();
        let limits = self.options.exposure_limits;
        let mut refiner = make_refiner(self.options.strategy, limits);
        let mut exposure = limits.clamp(self.estimates.estimate_or_default(&filter, binning));
        self.reset_ditherer().await?;
        let mut rejected_in_a_row = 0;
        // Set after a rejected frame, so the retry is taken at the same
        // dither position.
        let mut retrying = false;

        self.events.console(
            format!("Acquiring {} frames starting with {:.2} second exposure.",
                    item.frames_remaining(), exposure), 2);
        while !item.is_complete() {
            self.check_cancel()?;
            if !retrying {
                if let Some(step) = self.ditherer.as_mut().map(Ditherer::next_frame) {
                    self.dither_to(step).await?;
                }
            }
            self.events.console(
                format!("Exposing frame {} for {:.2} seconds.",
                        item.frames_completed() + 1, exposure), 2);
            let adu = self.take_one_flat_frame(exposure, binning).await?;

            if within_tolerance(adu, target, item.tolerance()) {
                self.events.console(
                    format!("{} ADUs: Close enough, keeping this frame.",
                            format_adu(adu)), 3);
                let file_name = flat_frame_file_name_now(
                    filter.name(), exposure, binning, item.frames_completed() + 1);
                self.server.save_last_image(&self.options.save_destination, &file_name)
                    .await.map_err(|e| self.console_error("Error saving image file", e))?;
                debug!("Saved {}", file_name);
                let completed = item.record_accepted_frame();
                rejected_in_a_row = 0;
                retrying = false;
                self.events.send(SessionEvent::ProgressUpdated{value: completed});
                self.events.send(SessionEvent::FramesCompleted{index, completed});
            } else {
                rejected_in_a_row += 1;
                retrying = true;
                self.events.console(
                    format!("{} ADUs: Too far from target, adjusting exposure.",
                            format_adu(adu)), 3);
                if rejected_in_a_row > self.timings.max_rejections_in_a_row {
                    self.events.console(TOO_MANY_REJECTIONS, 2);
                    return Err(resource_exhausted_error(TOO_MANY_REJECTIONS));
                }
            }

            exposure = refiner.next_exposure(exposure, adu, target);
            if let Err(e) = self.estimates.record(&filter, binning, exposure) {
                warn!("Could not record exposure estimate: {}", e.message);
            }
        }
        Ok(())
    }

    // Restarts the dither pattern at the origin, creating the ditherer on
    // first use.
    async fn reset_ditherer(&mut self) -> Result<(), CanonicalError> {
        if let Some(ditherer) = self.ditherer.as_mut() {
            ditherer.reset();
            return Ok(());
        }
        self.ditherer = self.make_ditherer().await?;
        Ok(())
    }

    // None when dithering is off. The origin is the light source if we know
    // where it is, otherwise wherever the scope is pointing before the first
    // dithered frame.
    async fn make_ditherer(&self) -> Result<Option<Ditherer>, CanonicalError> {
        let dither = &self.options.dither;
        if !dither.enabled {
            return Ok(None);
        }
        let (alt, az) = match self.options.mount.source_alt_az {
            Some(position) => position,
            None => {
                self.server.connect_telescope().await.map_err(
                    |e| self.console_error("Error connecting to telescope", e))?;
                self.server.scope_alt_az().await.map_err(
                    |e| self.console_error("Error reading scope position", e))?
            }
        };
        let ditherer = Ditherer::new(alt, az, dither.step_radius_arcsec,
                                     dither.max_radius_arcsec);
        self.events.console(format!("Dithering {}", ditherer), 2);
        Ok(Some(ditherer))
    }

    // A step onto the origin needs a slew only if an earlier item left the
    // scope on one of its rings.
    async fn dither_to(&mut self, step: DitherStep) -> Result<(), CanonicalError> {
        if !step.move_scope && !self.dithered_off_origin {
            return Ok(());
        }
        if step.move_scope {
            debug!("Dither to alt {:.5} az {:.5}", step.alt, step.az);
        } else {
            self.events.console("Returning to dither origin", 2);
        }
        self.server.slew_to(step.alt, step.az).await.map_err(
            |e| self.console_error("Error dithering", e))?;
        self.dithered_off_origin = step.move_scope;
        self.wait_for_slew().await.map_err(|e| self.console_error("Error dithering", e))
    }

    // Starts an exposure, waits for it and its download, and returns the
    // frame's average ADU level.
    async fn take_one_flat_frame(&self, exposure: f64, binning: u32)
                                 -> Result<f64, CanonicalError> {
        self.server.start_flat_exposure(exposure, binning).await.map_err(
            |e| self.console_error("Error taking frame", e))?;
        let download_time = match self.download_times.get(&binning) {
            Some(t) => *t,
            None => {
                warn!("No download time for binning {}", binning);
                Duration::ZERO
            }
        };
        self.cancellable_wait(Duration::from_secs_f64(exposure) + download_time).await?;
        self.wait_for_camera_to_finish().await?;
        self.server.average_adu().await.map_err(
            |e| self.console_error("Error taking frame", e))
    }

    async fn cancellable_wait(&self, duration: Duration) -> Result<(), CanonicalError> {
        let mut waited = Duration::ZERO;
        while waited < duration {
            self.check_cancel()?;
            let increment = self.timings.wait_increment.min(duration - waited);
            sleep(increment).await;
            waited += increment;
        }
        self.check_cancel()
    }

    // Having waited the expected time for the exposure and download, resync
    // with the camera by polling until it reports the exposure complete.
    async fn wait_for_camera_to_finish(&self) -> Result<(), CanonicalError> {
        let mut waited = Duration::ZERO;
        loop {
            let complete = self.server.exposure_is_complete().await.map_err(
                |e| self.console_error("Error waiting for camera", e))?;
            if complete {
                return Ok(());
            }
            if waited >= self.timings.resync_timeout {
                self.events.console("Timed out waiting for camera to finish", 2);
                return Err(deadline_exceeded_error(
                    "Timed out waiting for camera to finish"));
            }
            self.check_cancel()?;
            sleep(self.timings.resync_interval).await;
            waited += self.timings.resync_interval;
        }
    }

    // Aborts the exposure in progress, if any. Errors are ignored; we are
    // stopping regardless.
    async fn clean_up_from_cancel(&self) {
        match self.server.exposure_is_complete().await {
            Ok(true) => (),
            Ok(false) | Err(_) => {
                info!("Aborting exposure in progress");
                if let Err(e) = self.server.abort_exposure().await {
                    debug!("Abort exposure: {}", e.message);
                }
            }
        }
    }

    // End-of-session chores. Failures are reported but do not change the
    // session outcome.
    async fn finish_up(&self) {
        if self.options.warm_when_done {
            self.events.console("Turning off camera cooling as requested", 1);
            if let Err(e) = self.server.set_camera_cooling(false, 0.0).await {
                self.console_error("Error turning off cooling", e);
            }
        }
        let mount = &self.options.mount;
        if !mount.control_mount {
            return;
        }
        if mount.park_when_done {
            self.events.console("Parking mount", 1);
            if let Err(e) = self.server.park_mount().await {
                self.console_error("Error parking mount", e);
            }
        }
        if mount.disconnect_when_done {
            self.events.console("Disconnecting mount", 1);
            if let Err(e) = self.server.disconnect_telescope().await {
                self.console_error("Error disconnecting mount", e);
            }
        }
    }
}

// 24312.6 -> "24,313".
fn format_adu(adu: f64) -> String {
    let rounded = adu.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if rounded < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

// mod tests.
