//! Scripted remote endpoint for unit tests.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::error::SpmError;
use crate::handoff::PostOutcome;
use crate::remote::{NotificationRouter, NotificationSink, Registration, RemoteSpm};
use crate::session::StopSignal;
use crate::types::{
    AxisId, LiftPair, LineEndpoints, PlaneId, SampleBuffer, ScanMotion, ServerEvent, SignalInfo,
    SurfacePoint, SweepParams, TraceTiming, TwoPassTiming,
};

/// One step performed by the scripted server after an execution call
#[derive(Debug, Clone)]
pub enum Delivery {
    Samples(Vec<f32>),
    /// Restart delivered on the streaming thread
    Restart,
    /// Restart delivered synchronously from inside the execution call
    RestartNow,
    Event(i32),
    /// Request a stop on the control side
    Stop(StopSignal),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub at: Instant,
}

pub struct ScriptedSpm {
    pub calls: Vec<Call>,
    pub ranges: Vec<(AxisId, f32)>,
    pub catalogue: Vec<SignalInfo>,
    /// Consumed by successive `exec_scan_line` / `probe_sweep_z` calls
    pub line_scripts: VecDeque<Vec<Delivery>>,
    /// Global `exec_scan_point` call indices that fail
    pub point_failures: HashSet<usize>,
    /// Global `exec_scan_line` call indices that fail
    pub line_failures: HashSet<usize>,
    pub lift_verdict: bool,
    pub land_verdict: bool,
    pub sweep_verdict: bool,
    pub reject_setup_line: bool,
    /// Outcomes of every post made by the streaming threads
    pub post_outcomes: Arc<Mutex<Vec<PostOutcome>>>,
    router: NotificationRouter,
    points_per_line: usize,
    signal_count: usize,
    pass1: Option<usize>,
    calls_since_setup: usize,
    point_calls: usize,
    line_calls: usize,
    streamer: Option<thread::JoinHandle<()>>,
}

impl Default for ScriptedSpm {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            ranges: Vec::new(),
            catalogue: ["Height", "Mag", "Phase", "Nf"]
                .iter()
                .map(|name| SignalInfo::new(*name, "V"))
                .collect(),
            line_scripts: VecDeque::new(),
            point_failures: HashSet::new(),
            line_failures: HashSet::new(),
            lift_verdict: true,
            land_verdict: true,
            sweep_verdict: true,
            reject_setup_line: false,
            post_outcomes: Arc::new(Mutex::new(Vec::new())),
            router: NotificationRouter::new(),
            points_per_line: 0,
            signal_count: 0,
            pass1: None,
            calls_since_setup: 0,
            point_calls: 0,
            line_calls: 0,
            streamer: None,
        }
    }
}

impl ScriptedSpm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<&str> {
        self.calls.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| c.name == name).count()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.calls.iter().position(|c| c.name == name)
    }

    /// Calls recorded after the last call named `name`
    pub fn after_last(&self, name: &str) -> Vec<&str> {
        let names = self.names();
        match names.iter().rposition(|n| *n == name) {
            Some(i) => names[i + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    fn record(&mut self, name: &str) {
        self.calls.push(Call {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Wait for the streaming thread, as a server finishing delivery would
    fn join_streamer(&mut self) {
        if let Some(handle) = self.streamer.take() {
            let _ = handle.join();
        }
    }

    /// Default stream for one line: one buffer per point, then the terminator
    fn default_line(&self) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> = (0..self.points_per_line)
            .map(|p| Delivery::Samples(vec![p as f32; self.signal_count]))
            .collect();
        deliveries.push(Delivery::Samples(Vec::new()));
        deliveries
    }

    fn start_stream(&mut self, script: Vec<Delivery>) -> Result<(), SpmError> {
        self.join_streamer();
        let sink = self
            .router
            .sink()
            .ok_or_else(|| SpmError::Execution("No notification sink registered".to_string()))?;

        let mut deferred = Vec::new();
        for delivery in script {
            match delivery {
                Delivery::RestartNow => sink.on_restart_line(),
                other => deferred.push(other),
            }
        }

        let outcomes = self.post_outcomes.clone();
        self.streamer = Some(thread::spawn(move || {
            for delivery in deferred {
                match delivery {
                    Delivery::Samples(values) => {
                        let outcome = sink.on_samples(SampleBuffer::new(values));
                        outcomes.lock().push(outcome);
                        if outcome == PostOutcome::Discarded {
                            break;
                        }
                    }
                    Delivery::Restart => sink.on_restart_line(),
                    Delivery::Event(code) => sink.on_event(ServerEvent::from(code)),
                    Delivery::Stop(stop) => stop.request(),
                    Delivery::RestartNow => {}
                }
            }
        }));
        Ok(())
    }

    fn point_len(&self, sample: usize) -> usize {
        match self.pass1 {
            None => self.signal_count,
            Some(p1) if sample < self.points_per_line => p1,
            Some(p1) => self.signal_count - p1,
        }
    }
}

impl RemoteSpm for ScriptedSpm {
    fn connect(&mut self) -> Result<(), SpmError> {
        self.record("connect");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SpmError> {
        self.record("disconnect");
        Ok(())
    }

    fn is_connected(&mut self) -> Result<bool, SpmError> {
        Ok(true)
    }

    fn server_interface_version(&mut self) -> Result<i32, SpmError> {
        Ok(crate::remote::INTERFACE_VERSION)
    }

    fn is_server_compatible(&mut self) -> Result<bool, SpmError> {
        Ok(true)
    }

    fn register_notifications(
        &mut self,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Registration, SpmError> {
        self.record("register_notifications");
        Ok(self.router.install(sink))
    }

    fn unregister_notifications(&mut self, registration: Registration) -> Result<(), SpmError> {
        self.record("unregister_notifications");
        self.router.remove(&registration);
        Ok(())
    }

    fn axis_range(&mut self, axis: AxisId) -> Result<f32, SpmError> {
        self.record("axis_range");
        Ok(self
            .ranges
            .iter()
            .find(|(a, _)| *a == axis)
            .map(|(_, r)| *r)
            .unwrap_or(100.0))
    }

    fn axis_position(&mut self, _axis: AxisId) -> Result<f32, SpmError> {
        self.record("axis_position");
        Ok(0.0)
    }

    fn axis_setpoint(&mut self, _axis: AxisId) -> Result<f32, SpmError> {
        self.record("axis_setpoint");
        Ok(0.0)
    }

    fn set_axis_position(&mut self, _: AxisId, _: f32, _: f32) -> Result<(), SpmError> {
        self.record("set_axis_position");
        Ok(())
    }

    fn set_axes_positions(&mut self, _: &[(AxisId, f32)], _: f32) -> Result<(), SpmError> {
        self.record("set_axes_positions");
        Ok(())
    }

    fn signals_list(&mut self) -> Result<Vec<SignalInfo>, SpmError> {
        self.record("signals_list");
        Ok(self.catalogue.clone())
    }

    fn setup_scan_common(
        &mut self,
        _plane: PlaneId,
        points_per_line: usize,
        _motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError> {
        self.record("setup_scan_common");
        self.points_per_line = points_per_line;
        self.signal_count = signals.len();
        self.pass1 = None;
        Ok(())
    }

    fn setup_scan_line(&mut self, _: LineEndpoints, _: TraceTiming) -> Result<(), SpmError> {
        self.record("setup_scan_line");
        if self.reject_setup_line {
            return Err(SpmError::Configuration("line rejected".to_string()));
        }
        self.calls_since_setup = 0;
        Ok(())
    }

    fn exec_scan_point(&mut self) -> Result<SampleBuffer, SpmError> {
        self.record("exec_scan_point");
        let call = self.point_calls;
        self.point_calls += 1;
        if self.point_failures.contains(&call) {
            return Err(SpmError::Execution(format!("point call {call} failed")));
        }
        let k = self.calls_since_setup;
        self.calls_since_setup += 1;
        if k == 0 {
            return Ok(SampleBuffer::terminator());
        }
        let sample = k - 1;
        Ok(SampleBuffer::new(vec![sample as f32; self.point_len(sample)]))
    }

    fn exec_scan_line(&mut self, _dwell_s: f32) -> Result<(), SpmError> {
        self.record("exec_scan_line");
        let call = self.line_calls;
        self.line_calls += 1;
        if self.line_failures.contains(&call) {
            return Err(SpmError::Execution(format!("line call {call} failed")));
        }
        let script = match self.line_scripts.pop_front() {
            Some(script) => script,
            None => self.default_line(),
        };
        self.start_stream(script)
    }

    fn finish_scan(&mut self) -> Result<(), SpmError> {
        self.record("finish_scan");
        self.join_streamer();
        Ok(())
    }

    fn set_triggering(&mut self, _enable: bool) -> Result<(), SpmError> {
        self.record("set_triggering");
        Ok(())
    }

    fn setup_plane_scan(
        &mut self,
        points_per_line: usize,
        _motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError> {
        self.record("setup_plane_scan");
        self.points_per_line = points_per_line;
        self.signal_count = signals.len();
        self.pass1 = None;
        Ok(())
    }

    fn set_plane_points(&mut self, _: &[SurfacePoint]) -> Result<(), SpmError> {
        self.record("set_plane_points");
        Ok(())
    }

    fn set_plane_lift(&mut self, _: LiftPair) -> Result<(), SpmError> {
        self.record("set_plane_lift");
        Ok(())
    }

    fn setup_two_pass_scan(
        &mut self,
        points_per_line: usize,
        _motion: ScanMotion,
        signals: &[String],
        pass1_signals: usize,
    ) -> Result<(), SpmError> {
        self.record("setup_two_pass_scan");
        self.points_per_line = points_per_line;
        self.signal_count = signals.len();
        self.pass1 = Some(pass1_signals);
        Ok(())
    }

    fn setup_two_pass_line(&mut self, _: LineEndpoints, _: TwoPassTiming) -> Result<(), SpmError> {
        self.record("setup_two_pass_line");
        self.calls_since_setup = 0;
        Ok(())
    }

    fn set_two_pass_lift(&mut self, _: LiftPair) -> Result<(), SpmError> {
        self.record("set_two_pass_lift");
        Ok(())
    }

    fn set_two_pass_triggering(&mut self, _: bool, _: bool) -> Result<(), SpmError> {
        self.record("set_two_pass_triggering");
        Ok(())
    }

    fn probe_sweep_z(&mut self, sweep: &SweepParams) -> Result<bool, SpmError> {
        self.record("probe_sweep_z");
        let script = match self.line_scripts.pop_front() {
            Some(script) => script,
            None => {
                let mut deliveries: Vec<Delivery> = (0..sweep.points)
                    .map(|p| Delivery::Samples(vec![p as f32; sweep.signals.len()]))
                    .collect();
                deliveries.push(Delivery::Samples(Vec::new()));
                deliveries
            }
        };
        self.start_stream(script)?;
        Ok(self.sweep_verdict)
    }

    fn break_probe_sweep_z(&mut self) -> Result<(), SpmError> {
        self.record("break_probe_sweep_z");
        self.join_streamer();
        Ok(())
    }

    fn probe_lift(&mut self, _lift_nm: f32, _trigger_time_s: f32) -> Result<bool, SpmError> {
        self.record("probe_lift");
        Ok(self.lift_verdict)
    }

    fn probe_land(&mut self) -> Result<bool, SpmError> {
        self.record("probe_land");
        Ok(self.land_verdict)
    }

    fn probe_land2(&mut self) -> Result<bool, SpmError> {
        self.record("probe_land2");
        Ok(self.land_verdict)
    }
}
