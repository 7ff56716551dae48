//! Scan orchestration: configuration sequences, line execution, and the
//! drain loop over the handoff channel.
//!
//! Every session ends through [`ScanOrchestrator::terminate`], which closes
//! the handoff before the terminal `finish_scan` call. No other code path
//! issues that call.

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SpmError;
use crate::handoff::{Handoff, HandoffChannel, SessionSink};
use crate::remote::{resolve_signals, NotificationSink, Registration, RemoteSpm};
use crate::session::{
    Pass, ProbeState, ScanImage, ScanOutcome, ScanPlan, ScanReport, ScanSession, SessionState,
    StopSignal,
};
use crate::types::{AxisId, SampleBuffer, ScanMotion, ScanVariant, ServerEvent};

/// How lines are executed on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStyle {
    /// One asynchronous execute call per line, samples arrive as notifications
    Streamed,
    /// Synchronous execute-point calls, each returning the previous point
    Pipelined,
}

impl ExecutionStyle {
    pub fn for_plan(plan: &ScanPlan) -> Self {
        match (plan.mode.motion, &plan.mode.variant) {
            (ScanMotion::Line, _) => ExecutionStyle::Streamed,
            // Execute-point does no triggering
            (ScanMotion::Point, ScanVariant::SinglePass { .. }) if plan.triggering => {
                ExecutionStyle::Streamed
            }
            (ScanMotion::Point, _) => ExecutionStyle::Pipelined,
        }
    }
}

/// Result of a finished session
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub report: ScanReport,
    pub image: ScanImage,
    /// Generic server events received while the session was active
    pub events: Vec<ServerEvent>,
}

enum LineEnd {
    Finished,
    Stopped,
}

struct ActiveScan {
    session: ScanSession,
    sink: Arc<SessionSink>,
    registration: Option<Registration>,
    events: Receiver<ServerEvent>,
}

impl ActiveScan {
    fn handoff(&self) -> &HandoffChannel {
        self.sink.handoff()
    }

    /// Account for a restart still flagged once line `line` has completed.
    /// The line's data is kept; the restart is logged and counted.
    fn settle_stale_restart(&mut self, line: usize) -> bool {
        if !self.handoff().take_restart() {
            return false;
        }
        self.session.restarts += 1;
        warn!("Restart arrived after line {line} completed; keeping its data");
        true
    }
}

pub struct ScanOrchestrator<'a, R: RemoteSpm + ?Sized> {
    remote: &'a mut R,
    stop: StopSignal,
    diagnostic_interval: Option<Duration>,
}

impl<'a, R: RemoteSpm + ?Sized> ScanOrchestrator<'a, R> {
    pub fn new(remote: &'a mut R, stop: StopSignal) -> Self {
        Self {
            remote,
            stop,
            diagnostic_interval: None,
        }
    }

    /// Warn every `interval` while waiting for data from the server
    pub fn with_diagnostic_interval(mut self, interval: Duration) -> Self {
        self.diagnostic_interval = Some(interval);
        self
    }

    /// Run one scan session to completion, cancellation, or failure
    pub fn run(&mut self, plan: ScanPlan) -> Result<ScanResult, SpmError> {
        plan.validate()?;
        let mut session = ScanSession::new(plan);
        session.advance(SessionState::Configuring)?;
        info!(
            "Starting {} {:?} scan: {} lines x {} points, signals {:?}",
            session.plan.mode.variant.name(),
            session.plan.mode.motion,
            session.plan.geometry.lines,
            session.plan.geometry.points_per_line,
            session.plan.signals
        );

        if let Err(e) = self.configure(&mut session) {
            error!("Scan configuration failed: {e}");
            session.advance(SessionState::Aborted)?;
            session.advance(SessionState::Idle)?;
            return Err(e);
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut scan = ActiveScan {
            session,
            sink: Arc::new(SessionSink::new(tx)),
            registration: None,
            events: rx,
        };

        let style = ExecutionStyle::for_plan(&scan.session.plan);
        debug!("Execution style {style:?}");
        let outcome = match style {
            ExecutionStyle::Streamed => self.run_streamed(&mut scan),
            ExecutionStyle::Pipelined => self.run_pipelined(&mut scan),
        };
        self.terminate(scan, outcome)
    }

    fn configure(&mut self, session: &mut ScanSession) -> Result<(), SpmError> {
        let catalogue = self.remote.signals_list()?;
        let signals = resolve_signals(&catalogue, &session.plan.signals)?;
        session.plan.signals = signals.clone();
        session.image.signals = signals.clone();

        let variant = session.plan.mode.variant.clone();
        let (fast, slow) = variant.plane().axes();
        let mut axes = vec![fast, slow];
        if matches!(variant, ScanVariant::PlaneCompensated { .. }) {
            axes.push(AxisId::Z);
        }
        for axis in axes {
            let range = self.remote.axis_range(axis)?;
            if range.is_nan() || range <= 0.0 {
                return Err(SpmError::Configuration(format!(
                    "Axis {axis} has no usable range"
                )));
            }
        }

        let points = session.plan.geometry.points_per_line;
        let motion = session.plan.mode.motion;
        match &variant {
            ScanVariant::SinglePass { plane, .. } => {
                self.remote
                    .setup_scan_common(*plane, points, motion, &signals)?;
                self.remote.set_triggering(session.plan.triggering)?;
            }
            ScanVariant::TwoPass(setup) => {
                self.remote
                    .setup_two_pass_scan(points, motion, &signals, setup.pass1_signals)?;
                self.remote.set_two_pass_lift(setup.lift)?;
                self.remote
                    .set_two_pass_triggering(setup.trigger_pass1, setup.trigger_pass2)?;
                session.progress.pass = Some(Pass::First);
            }
            ScanVariant::PlaneCompensated { setup, .. } => {
                self.remote.setup_plane_scan(points, motion, &signals)?;
                self.remote.set_plane_points(&setup.points)?;
                self.remote.set_plane_lift(setup.lift)?;
                self.remote.set_triggering(session.plan.triggering)?;
            }
        }
        Ok(())
    }

    /// Per-line setup. Registers notifications and lifts the probe for plane
    /// scans on the first line, before any execution call.
    fn arm_line(&mut self, scan: &mut ActiveScan) -> Result<(), SpmError> {
        let line = scan.session.progress.line;
        let endpoints = scan.session.plan.geometry.line_endpoints(line);
        let variant = scan.session.plan.mode.variant.clone();
        debug!("Arming line {line}: {endpoints:?}");

        match &variant {
            ScanVariant::SinglePass { timing, .. } | ScanVariant::PlaneCompensated { timing, .. } => {
                self.remote.setup_scan_line(endpoints, *timing)?
            }
            ScanVariant::TwoPass(setup) => self.remote.setup_two_pass_line(endpoints, setup.timing)?,
        }

        if scan.registration.is_none() {
            let sink: Arc<dyn NotificationSink> = scan.sink.clone();
            scan.registration = Some(self.remote.register_notifications(sink)?);
        }

        if let ScanVariant::PlaneCompensated { setup, .. } = &variant {
            if !scan.session.progress.probe.is_lifted() {
                if !self.remote.probe_lift(setup.lift.lift_nm, 0.0)? {
                    warn!("Probe was neither on the surface nor lifted before plane scan");
                }
                scan.session.progress.probe = scan.session.progress.probe.lifted_by(setup.lift.lift_nm);
            }
        }
        Ok(())
    }

    /// Arm the current line and start streaming it, retrying failed
    /// execution calls up to the plan's limit
    fn start_streamed_line(&mut self, scan: &mut ActiveScan) -> Result<LineEnd, SpmError> {
        let dwell = match scan.session.plan.mode.motion {
            ScanMotion::Point => scan.session.plan.dwell_s,
            ScanMotion::Line => 0.0,
        };
        let mut attempts = 0;
        loop {
            scan.session.advance(SessionState::LineArmed)?;
            scan.session.rewind_line();
            self.arm_line(scan)?;
            match self.remote.exec_scan_line(dwell) {
                Ok(()) => {
                    scan.session.advance(SessionState::Streaming)?;
                    return Ok(LineEnd::Finished);
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts > scan.session.plan.max_line_retries {
                        error!("Line {} failed {attempts} times: {e}", scan.session.progress.line);
                        return Err(e);
                    }
                    if self.stop.is_requested() {
                        return Ok(LineEnd::Stopped);
                    }
                    scan.session.retries += 1;
                    warn!(
                        "Retrying line {} ({attempts}/{}): {e}",
                        scan.session.progress.line, scan.session.plan.max_line_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn acquire(&self, handoff: &HandoffChannel) -> Result<Handoff, SpmError> {
        match self.diagnostic_interval {
            Some(interval) => handoff.acquire_with_diagnostics(interval),
            None => handoff.acquire(),
        }
    }

    /// Drain loop for scans whose samples arrive as notifications
    fn run_streamed(&mut self, scan: &mut ActiveScan) -> Result<ScanOutcome, SpmError> {
        if let LineEnd::Stopped = self.start_streamed_line(scan)? {
            return Ok(ScanOutcome::Cancelled);
        }

        loop {
            match self.acquire(scan.handoff())? {
                Handoff::Samples(buffer) if !buffer.is_terminator() => {
                    scan.session.record_chunk(buffer.values())?;
                    if self.stop.is_requested() {
                        info!("Stop requested during line {}", scan.session.progress.line);
                        return Ok(ScanOutcome::Cancelled);
                    }
                    scan.handoff().release()?;
                }
                Handoff::Samples(_) => {
                    let line = scan.session.progress.line;
                    let geometry = scan.session.plan.geometry;
                    if scan.session.progress.point < geometry.points_per_line {
                        warn!(
                            "Line {line} ended after {} of {} points",
                            scan.session.progress.point, geometry.points_per_line
                        );
                    }
                    scan.session.advance(SessionState::LineComplete)?;
                    scan.session.lines_completed += 1;
                    debug!("Line {line} complete");

                    if line + 1 >= geometry.lines {
                        scan.settle_stale_restart(line);
                        return Ok(ScanOutcome::Completed);
                    }
                    if self.stop.is_requested() {
                        info!("Stop requested after line {line}");
                        scan.settle_stale_restart(line);
                        return Ok(ScanOutcome::Cancelled);
                    }

                    scan.handoff().release()?;
                    scan.settle_stale_restart(line);
                    scan.session.progress.line += 1;
                    if let LineEnd::Stopped = self.start_streamed_line(scan)? {
                        return Ok(ScanOutcome::Cancelled);
                    }
                }
                Handoff::Restart => {
                    scan.handoff().take_restart();
                    scan.session.restarts += 1;
                    warn!("Server restarted line {}", scan.session.progress.line);
                    if self.stop.is_requested() {
                        return Ok(ScanOutcome::Cancelled);
                    }
                    if let LineEnd::Stopped = self.start_streamed_line(scan)? {
                        return Ok(ScanOutcome::Cancelled);
                    }
                }
                Handoff::Closed => {
                    return Err(SpmError::ProtocolViolation(
                        "Handoff closed while the scan was streaming".to_string(),
                    ))
                }
            }
        }
    }

    /// Line loop for point scans driven by synchronous execute-point calls
    fn run_pipelined(&mut self, scan: &mut ActiveScan) -> Result<ScanOutcome, SpmError> {
        loop {
            if let LineEnd::Stopped = self.scan_point_line(scan)? {
                return Ok(ScanOutcome::Cancelled);
            }
            let line = scan.session.progress.line;
            scan.session.advance(SessionState::LineComplete)?;
            scan.session.lines_completed += 1;
            debug!("Line {line} complete");

            if line + 1 >= scan.session.plan.geometry.lines {
                return Ok(ScanOutcome::Completed);
            }
            scan.session.progress.line += 1;
        }
    }

    /// One point line. Call `k` moves to point `k` and returns point `k - 1`,
    /// so a line needs one call more than it has samples.
    fn scan_point_line(&mut self, scan: &mut ActiveScan) -> Result<LineEnd, SpmError> {
        let points = scan.session.plan.geometry.points_per_line;
        let samples = match scan.session.plan.pass1_signals() {
            Some(_) => 2 * points,
            None => points,
        };
        let mut attempts = 0;

        'attempt: loop {
            scan.session.advance(SessionState::LineArmed)?;
            scan.session.rewind_line();
            self.arm_line(scan)?;
            scan.session.advance(SessionState::Streaming)?;

            for call in 0..=samples {
                let buffer = match self.remote.exec_scan_point() {
                    Ok(buffer) => buffer,
                    Err(e) if e.is_retryable() => {
                        attempts += 1;
                        if attempts > scan.session.plan.max_line_retries {
                            error!(
                                "Line {} failed {attempts} times: {e}",
                                scan.session.progress.line
                            );
                            return Err(e);
                        }
                        if self.stop.is_requested() {
                            return Ok(LineEnd::Stopped);
                        }
                        scan.session.retries += 1;
                        warn!(
                            "Retrying line {} after point call {call} ({attempts}/{}): {e}",
                            scan.session.progress.line, scan.session.plan.max_line_retries
                        );
                        continue 'attempt;
                    }
                    Err(e) => return Err(e),
                };

                if call == 0 {
                    if !buffer.is_empty() {
                        debug!("Ignoring {} values from the first point call", buffer.len());
                    }
                } else {
                    Self::store_point(&mut scan.session, call - 1, &buffer)?;
                }

                if self.stop.is_requested() {
                    info!(
                        "Stop requested at line {} point {}",
                        scan.session.progress.line, scan.session.progress.point
                    );
                    return Ok(LineEnd::Stopped);
                }
            }
            return Ok(LineEnd::Finished);
        }
    }

    /// Place sample `sample` of the current line into the image.
    ///
    /// Two-pass lines return pass 1 points in ascending order, then pass 2
    /// points in descending order.
    fn store_point(
        session: &mut ScanSession,
        sample: usize,
        buffer: &SampleBuffer,
    ) -> Result<(), SpmError> {
        let points = session.plan.geometry.points_per_line;
        let total = session.plan.signals.len();
        let line = session.progress.line;

        let (point, first_signal, expected, pass) = match session.plan.pass1_signals() {
            None => (sample, 0, total, None),
            Some(pass1) if sample < points => (sample, 0, pass1, Some(Pass::First)),
            Some(pass1) => (2 * points - 1 - sample, pass1, total - pass1, Some(Pass::Second)),
        };

        if buffer.len() != expected {
            return Err(SpmError::ProtocolViolation(format!(
                "Point {point} of line {line} has {} values, expected {expected}",
                buffer.len()
            )));
        }
        session
            .image
            .put_point(line, point, first_signal, buffer.values())?;
        session.progress.point = point + 1;
        session.progress.pass = pass;
        Ok(())
    }

    /// Close the handoff, then issue the terminal call exactly once
    fn terminate(
        &mut self,
        mut scan: ActiveScan,
        outcome: Result<ScanOutcome, SpmError>,
    ) -> Result<ScanResult, SpmError> {
        scan.handoff().release_and_close();

        let finished = self.remote.finish_scan();
        if let Err(e) = &finished {
            error!("finish_scan failed: {e}");
        }

        if scan.session.progress.probe.is_lifted() {
            match self.remote.probe_land() {
                Ok(_) => scan.session.progress.probe = ProbeState::Landed,
                Err(e) => warn!("Landing after plane scan failed: {e}"),
            }
        }
        if let Some(registration) = scan.registration.take() {
            if let Err(e) = self.remote.unregister_notifications(registration) {
                warn!("Unregistering notifications failed: {e}");
            }
        }

        let events: Vec<ServerEvent> = scan.events.try_iter().collect();
        for event in &events {
            debug!("Server event during scan: {event:?}");
        }

        let outcome = outcome.and_then(|o| finished.map(|_| o));
        let session = &mut scan.session;
        let outcome = match outcome {
            Ok(ScanOutcome::Completed) => {
                session.advance(SessionState::Completed)?;
                info!(
                    "Scan complete: {} lines, {} restarts, {} retries",
                    session.lines_completed, session.restarts, session.retries
                );
                ScanOutcome::Completed
            }
            Ok(ScanOutcome::Cancelled) => {
                session.progress.stop_requested = true;
                session.advance(SessionState::Aborted)?;
                info!("Scan cancelled after {} lines", session.lines_completed);
                ScanOutcome::Cancelled
            }
            Err(e) => {
                error!("Scan aborted at line {}: {e}", session.progress.line);
                if let Err(t) = session
                    .advance(SessionState::Aborted)
                    .and_then(|_| session.advance(SessionState::Idle))
                {
                    debug!("{t}");
                }
                return Err(e);
            }
        };
        session.advance(SessionState::Idle)?;

        Ok(ScanResult {
            report: scan.session.report(outcome),
            image: scan.session.image,
            events,
        })
    }
}
