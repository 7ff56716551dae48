//! In-process stand-in for the SPM server.
//!
//! Produces deterministic synthetic data and delivers notifications from a
//! thread of its own, so callers see the same two-context behaviour as with
//! the real server.

use log::{debug, info, trace};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::SpmError;
use crate::handoff::PostOutcome;
use crate::remote::{
    NotificationRouter, NotificationSink, Registration, RemoteSpm, INTERFACE_VERSION,
};
use crate::types::{
    AxisId, LiftPair, LineEndpoints, PlaneId, SampleBuffer, ScanMotion, ServerEvent, SignalInfo,
    SurfacePoint, SweepParams, TraceTiming, TwoPassTiming,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Usable range of every axis, µm
    pub axis_range_um: f32,
    /// Points per streamed buffer
    pub chunk_points: usize,
    /// Pause between streamed buffers
    pub chunk_delay: Duration,
    /// Restart every n-th line once. The re-arm that follows a restart is
    /// not counted and always completes.
    pub restart_every: Option<usize>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            axis_range_um: 100.0,
            chunk_points: 8,
            chunk_delay: Duration::ZERO,
            restart_every: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ScanSetup {
    points_per_line: usize,
    signals: Vec<String>,
    pass1: Option<usize>,
}

/// Deterministic [`RemoteSpm`] implementation
pub struct SimulatedSpm {
    config: SimulatorConfig,
    connected: bool,
    router: NotificationRouter,
    catalogue: Vec<SignalInfo>,
    positions: HashMap<AxisId, f32>,
    scan: Option<ScanSetup>,
    line: Option<LineEndpoints>,
    calls_since_setup: usize,
    line_executions: usize,
    rearm_after_restart: bool,
    triggering: bool,
    lift_nm: Option<f32>,
    streamer: Option<thread::JoinHandle<()>>,
}

impl Default for SimulatedSpm {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimulatedSpm {
    pub fn new(config: SimulatorConfig) -> Self {
        let catalogue = [
            ("Height", "nm"),
            ("Mag", "V"),
            ("Phase", "deg"),
            ("Nf", "Hz"),
            ("Iprobe", "nA"),
            ("SenX", "um"),
            ("SenY", "um"),
            ("SenZ", "um"),
        ]
        .iter()
        .map(|(name, unit)| SignalInfo::new(*name, *unit))
        .collect();

        Self {
            config,
            connected: false,
            router: NotificationRouter::new(),
            catalogue,
            positions: HashMap::new(),
            scan: None,
            line: None,
            calls_since_setup: 0,
            line_executions: 0,
            rearm_after_restart: false,
            triggering: false,
            lift_nm: None,
            streamer: None,
        }
    }

    /// Synthetic value of `signal` at `(x, y)` µm with the probe `z` nm above
    /// the surface
    pub fn signal_value(signal: &str, x: f32, y: f32, z: f32) -> f32 {
        let topography = 20.0 * (x / 3.0).sin() * (y / 3.0).cos();
        match signal.to_ascii_lowercase().as_str() {
            "height" => topography,
            "mag" => 1.0 / (1.0 + (z.max(0.0) / 50.0)),
            "phase" => 90.0 - 0.05 * topography - 0.01 * z,
            "nf" => -5.0 * (-z.max(0.0) / 10.0).exp(),
            "iprobe" => 0.5 * (-z.max(0.0) / 0.1).exp(),
            "senx" => x,
            "seny" => y,
            "senz" => topography / 1000.0 + z / 1000.0,
            _ => 0.0,
        }
    }

    fn ensure_connected(&self) -> Result<(), SpmError> {
        if self.connected {
            Ok(())
        } else {
            Err(SpmError::Connection("Simulator not connected".to_string()))
        }
    }

    fn ensure_range(&self, axis: AxisId, value: f32) -> Result<(), SpmError> {
        if value < 0.0 || value > self.config.axis_range_um {
            return Err(SpmError::Execution(format!(
                "{axis} target {value} outside 0..{}",
                self.config.axis_range_um
            )));
        }
        Ok(())
    }

    fn check_line(&self, line: &LineEndpoints) -> Result<(), SpmError> {
        self.ensure_range(AxisId::X, line.x0)?;
        self.ensure_range(AxisId::X, line.x1)?;
        self.ensure_range(AxisId::Y, line.y0)?;
        self.ensure_range(AxisId::Y, line.y1)?;
        Ok(())
    }

    fn setup(&self) -> Result<&ScanSetup, SpmError> {
        self.scan
            .as_ref()
            .ok_or_else(|| SpmError::Execution("No scan configured".to_string()))
    }

    fn armed_line(&self) -> Result<LineEndpoints, SpmError> {
        self.line
            .ok_or_else(|| SpmError::Execution("No scan line configured".to_string()))
    }

    fn point_xy(line: &LineEndpoints, point: usize, points: usize) -> (f32, f32) {
        let t = if points > 1 {
            point as f32 / (points - 1) as f32
        } else {
            0.0
        };
        (line.x0 + (line.x1 - line.x0) * t, line.y0 + (line.y1 - line.y0) * t)
    }

    fn point_values(&self, signals: &[String], x: f32, y: f32, z: f32) -> Vec<f32> {
        signals
            .iter()
            .map(|s| Self::signal_value(s, x, y, z))
            .collect()
    }

    fn join_streamer(&mut self) {
        if let Some(handle) = self.streamer.take() {
            if handle.join().is_err() {
                debug!("Simulator streaming thread panicked");
            }
        }
    }

    /// Deliver `buffers` from a separate thread; restart after the first
    /// buffer when `restart` is set
    fn stream(&mut self, buffers: Vec<SampleBuffer>, restart: bool) -> Result<(), SpmError> {
        self.join_streamer();
        let sink = self
            .router
            .sink()
            .ok_or_else(|| SpmError::Execution("No notification sink registered".to_string()))?;
        let delay = self.config.chunk_delay;

        let handle = thread::Builder::new()
            .name("spm-simulator".to_string())
            .spawn(move || deliver(sink, buffers, restart, delay))
            .map_err(|e| SpmError::Io {
                source: e,
                context: "Spawning simulator stream".to_string(),
            })?;
        self.streamer = Some(handle);
        Ok(())
    }

    fn move_to(&mut self, axis: AxisId, value: f32) -> Result<(), SpmError> {
        self.ensure_range(axis, value)?;
        self.positions.insert(axis, value);
        let event = if axis.is_secondary() {
            ServerEvent::SecondaryScannerMoved
        } else {
            ServerEvent::PrimaryScannerMoved
        };
        self.router.dispatch_event(event);
        Ok(())
    }
}

fn deliver(
    sink: Arc<dyn NotificationSink>,
    buffers: Vec<SampleBuffer>,
    restart: bool,
    delay: Duration,
) {
    for (index, buffer) in buffers.into_iter().enumerate() {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if sink.on_samples(buffer) == PostOutcome::Discarded {
            trace!("Simulator stream stopped by consumer");
            return;
        }
        if restart && index == 0 {
            debug!("Simulator restarting line");
            sink.on_restart_line();
            return;
        }
    }
}

impl RemoteSpm for SimulatedSpm {
    fn connect(&mut self) -> Result<(), SpmError> {
        self.connected = true;
        info!("Connected to simulated SPM");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SpmError> {
        self.join_streamer();
        self.connected = false;
        Ok(())
    }

    fn is_connected(&mut self) -> Result<bool, SpmError> {
        Ok(self.connected)
    }

    fn server_interface_version(&mut self) -> Result<i32, SpmError> {
        Ok(INTERFACE_VERSION)
    }

    fn is_server_compatible(&mut self) -> Result<bool, SpmError> {
        Ok(true)
    }

    fn register_notifications(
        &mut self,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Registration, SpmError> {
        self.ensure_connected()?;
        Ok(self.router.install(sink))
    }

    fn unregister_notifications(&mut self, registration: Registration) -> Result<(), SpmError> {
        self.router.remove(&registration);
        Ok(())
    }

    fn axis_range(&mut self, _axis: AxisId) -> Result<f32, SpmError> {
        self.ensure_connected()?;
        Ok(self.config.axis_range_um)
    }

    fn axis_position(&mut self, axis: AxisId) -> Result<f32, SpmError> {
        self.ensure_connected()?;
        Ok(self.positions.get(&axis).copied().unwrap_or(0.0))
    }

    fn axis_setpoint(&mut self, axis: AxisId) -> Result<f32, SpmError> {
        self.axis_position(axis)
    }

    fn set_axis_position(
        &mut self,
        axis: AxisId,
        value_um: f32,
        _sweep_time_s: f32,
    ) -> Result<(), SpmError> {
        self.ensure_connected()?;
        self.move_to(axis, value_um)
    }

    fn set_axes_positions(
        &mut self,
        targets: &[(AxisId, f32)],
        _sweep_time_s: f32,
    ) -> Result<(), SpmError> {
        self.ensure_connected()?;
        for (axis, value) in targets {
            self.ensure_range(*axis, *value)?;
        }
        for (axis, value) in targets {
            self.move_to(*axis, *value)?;
        }
        Ok(())
    }

    fn signals_list(&mut self) -> Result<Vec<SignalInfo>, SpmError> {
        self.ensure_connected()?;
        Ok(self.catalogue.clone())
    }

    fn setup_scan_common(
        &mut self,
        _plane: PlaneId,
        points_per_line: usize,
        _motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError> {
        self.ensure_connected()?;
        if points_per_line == 0 || signals.is_empty() {
            return Err(SpmError::Configuration("Empty scan setup".to_string()));
        }
        self.scan = Some(ScanSetup {
            points_per_line,
            signals: signals.to_vec(),
            pass1: None,
        });
        Ok(())
    }

    fn setup_scan_line(
        &mut self,
        line: LineEndpoints,
        _timing: TraceTiming,
    ) -> Result<(), SpmError> {
        self.setup()?;
        self.check_line(&line).map_err(|e| SpmError::Configuration(e.to_string()))?;
        self.line = Some(line);
        self.calls_since_setup = 0;
        Ok(())
    }

    fn exec_scan_point(&mut self) -> Result<SampleBuffer, SpmError> {
        let setup = self.setup()?.clone();
        let line = self.armed_line()?;
        let k = self.calls_since_setup;
        let points = setup.points_per_line;
        let samples = if setup.pass1.is_some() { 2 * points } else { points };
        if k > samples {
            return Err(SpmError::Execution("Line already finished".to_string()));
        }
        self.calls_since_setup += 1;
        if k == 0 {
            return Ok(SampleBuffer::terminator());
        }

        let sample = k - 1;
        let lift = self.lift_nm.unwrap_or(0.0);
        let values = match setup.pass1 {
            None => {
                let (x, y) = Self::point_xy(&line, sample, points);
                self.point_values(&setup.signals, x, y, lift)
            }
            Some(pass1) if sample < points => {
                let (x, y) = Self::point_xy(&line, sample, points);
                self.point_values(&setup.signals[..pass1], x, y, lift)
            }
            Some(pass1) => {
                let (x, y) = Self::point_xy(&line, 2 * points - 1 - sample, points);
                self.point_values(&setup.signals[pass1..], x, y, lift + 50.0)
            }
        };
        Ok(SampleBuffer::new(values))
    }

    fn exec_scan_line(&mut self, _dwell_s: f32) -> Result<(), SpmError> {
        let setup = self.setup()?.clone();
        let line = self.armed_line()?;
        let points = setup.points_per_line;
        let lift = self.lift_nm.unwrap_or(0.0);

        let mut buffers = Vec::new();
        let mut chunk = Vec::new();
        for point in 0..points {
            let (x, y) = Self::point_xy(&line, point, points);
            match setup.pass1 {
                None => chunk.extend(self.point_values(&setup.signals, x, y, lift)),
                Some(pass1) => {
                    chunk.extend(self.point_values(&setup.signals[..pass1], x, y, lift));
                    chunk.extend(self.point_values(&setup.signals[pass1..], x, y, lift + 50.0));
                }
            }
            if (point + 1) % self.config.chunk_points.max(1) == 0 {
                buffers.push(SampleBuffer::new(std::mem::take(&mut chunk)));
            }
        }
        if !chunk.is_empty() {
            buffers.push(SampleBuffer::new(chunk));
        }
        buffers.push(SampleBuffer::terminator());

        let restart = if std::mem::take(&mut self.rearm_after_restart) {
            false
        } else {
            self.line_executions += 1;
            self.config
                .restart_every
                .is_some_and(|n| n > 0 && self.line_executions % n == 0)
        };
        self.rearm_after_restart = restart;
        trace!(
            "Streaming line {:?} in {} buffers (triggering {})",
            line,
            buffers.len(),
            self.triggering
        );
        self.stream(buffers, restart)
    }

    fn finish_scan(&mut self) -> Result<(), SpmError> {
        // Delivery must have been released by the consumer before this point
        self.join_streamer();
        self.line = None;
        self.calls_since_setup = 0;
        self.rearm_after_restart = false;
        debug!("Simulated scan finished");
        Ok(())
    }

    fn set_triggering(&mut self, enable: bool) -> Result<(), SpmError> {
        self.triggering = enable;
        Ok(())
    }

    fn setup_plane_scan(
        &mut self,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError> {
        self.setup_scan_common(PlaneId::XY, points_per_line, motion, signals)
    }

    fn set_plane_points(&mut self, points: &[SurfacePoint]) -> Result<(), SpmError> {
        if points.len() < 3 {
            return Err(SpmError::Configuration(
                "At least 3 plane points required".to_string(),
            ));
        }
        Ok(())
    }

    fn set_plane_lift(&mut self, _lift: LiftPair) -> Result<(), SpmError> {
        Ok(())
    }

    fn setup_two_pass_scan(
        &mut self,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
        pass1_signals: usize,
    ) -> Result<(), SpmError> {
        if pass1_signals == 0 || pass1_signals >= signals.len() {
            return Err(SpmError::Configuration(format!(
                "Invalid pass 1 signal count {pass1_signals}"
            )));
        }
        self.setup_scan_common(PlaneId::XY, points_per_line, motion, signals)?;
        if let Some(scan) = self.scan.as_mut() {
            scan.pass1 = Some(pass1_signals);
        }
        Ok(())
    }

    fn setup_two_pass_line(
        &mut self,
        line: LineEndpoints,
        _timing: TwoPassTiming,
    ) -> Result<(), SpmError> {
        self.setup_scan_line(line, TraceTiming::default())
    }

    fn set_two_pass_lift(&mut self, _lift: LiftPair) -> Result<(), SpmError> {
        Ok(())
    }

    fn set_two_pass_triggering(&mut self, pass1: bool, pass2: bool) -> Result<(), SpmError> {
        self.triggering = pass1 || pass2;
        Ok(())
    }

    fn probe_sweep_z(&mut self, sweep: &SweepParams) -> Result<bool, SpmError> {
        self.ensure_connected()?;
        let x = self.positions.get(&AxisId::X).copied().unwrap_or(0.0);
        let y = self.positions.get(&AxisId::Y).copied().unwrap_or(0.0);
        let base = self.lift_nm.unwrap_or(0.0);

        let mut buffers: Vec<SampleBuffer> = (0..sweep.points)
            .map(|i| {
                let t = if sweep.points > 1 {
                    i as f32 / (sweep.points - 1) as f32
                } else {
                    0.0
                };
                let z = base + sweep.from_nm + (sweep.to_nm - sweep.from_nm) * t;
                SampleBuffer::new(self.point_values(&sweep.signals, x, y, z))
            })
            .collect();
        if sweep.signals.is_empty() {
            buffers.clear();
        }
        buffers.push(SampleBuffer::terminator());

        self.stream(buffers, false)?;
        Ok(self.lift_nm.is_none())
    }

    fn break_probe_sweep_z(&mut self) -> Result<(), SpmError> {
        self.join_streamer();
        debug!("Simulated sweep broken");
        Ok(())
    }

    fn probe_lift(&mut self, lift_nm: f32, _trigger_time_s: f32) -> Result<bool, SpmError> {
        self.ensure_connected()?;
        self.lift_nm = Some(self.lift_nm.unwrap_or(0.0) + lift_nm);
        Ok(true)
    }

    fn probe_land(&mut self) -> Result<bool, SpmError> {
        self.ensure_connected()?;
        Ok(self.lift_nm.take().is_some())
    }

    fn probe_land2(&mut self) -> Result<bool, SpmError> {
        self.probe_land()
    }
}

impl Drop for SimulatedSpm {
    fn drop(&mut self) {
        self.join_streamer();
    }
}
