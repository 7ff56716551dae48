use chrono::{DateTime, Utc};
use log::trace;
use ndarray::{s, Array3};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::SpmError;
use crate::types::{ScanGeometry, ScanMode, ScanMotion, ScanVariant};

/// Lifecycle of one scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Configuring,
    LineArmed,
    Streaming,
    LineComplete,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Configuring)
                | (Configuring, LineArmed)
                | (Configuring, Aborted)
                // Re-arm after a restart or a failed execution
                | (LineArmed, LineArmed)
                | (LineArmed, Streaming)
                | (LineArmed, Aborted)
                | (Streaming, LineArmed)
                | (Streaming, LineComplete)
                | (Streaming, Aborted)
                | (LineComplete, LineArmed)
                | (LineComplete, Completed)
                | (LineComplete, Aborted)
                | (Completed, Idle)
                | (Aborted, Idle)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(self, next: SessionState) -> Result<SessionState, SpmError> {
        if self.can_transition_to(next) {
            trace!("Session {self:?} -> {next:?}");
            Ok(next)
        } else {
            Err(SpmError::ProtocolViolation(format!(
                "Illegal session transition {self:?} -> {next:?}"
            )))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

/// Whether the probe sits on the surface or was lifted off it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub enum ProbeState {
    #[default]
    Landed,
    /// Accumulated lift above the surface, nm
    Lifted { total_nm: f32 },
}

impl ProbeState {
    pub fn is_lifted(&self) -> bool {
        matches!(self, ProbeState::Lifted { .. })
    }

    /// State after an additional lift of `lift_nm`
    pub fn lifted_by(self, lift_nm: f32) -> ProbeState {
        match self {
            ProbeState::Landed => ProbeState::Lifted { total_nm: lift_nm },
            ProbeState::Lifted { total_nm } => ProbeState::Lifted {
                total_nm: total_nm + lift_nm,
            },
        }
    }
}

/// Pass of a two-pass scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pass {
    First,
    Second,
}

/// Position of the session inside the raster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct SessionProgress {
    pub line: usize,
    pub point: usize,
    /// Only set for two-pass scans
    pub pass: Option<Pass>,
    pub stop_requested: bool,
    pub probe: ProbeState,
}

/// Stop request shared between the control side and the orchestrator.
///
/// Cloned handles refer to the same flag. The orchestrator samples it once
/// per handoff cycle.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag, e.g. one set by a Ctrl+C handler
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything needed to run one scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPlan {
    pub geometry: ScanGeometry,
    pub mode: ScanMode,
    pub signals: Vec<String>,
    /// Dwell per point for streamed point scans, seconds
    pub dwell_s: f32,
    pub triggering: bool,
    /// Re-arm attempts per line after failed execution calls
    pub max_line_retries: u32,
}

impl ScanPlan {
    pub fn validate(&self) -> Result<(), SpmError> {
        self.geometry.validate()?;
        if self.signals.is_empty() {
            return Err(SpmError::Configuration(
                "Scan needs at least one signal".to_string(),
            ));
        }
        match &self.mode.variant {
            ScanVariant::TwoPass(setup) => {
                if setup.pass1_signals == 0 || setup.pass1_signals >= self.signals.len() {
                    return Err(SpmError::Configuration(format!(
                        "Pass 1 signal count {} must be in 1..{}",
                        setup.pass1_signals,
                        self.signals.len()
                    )));
                }
            }
            ScanVariant::PlaneCompensated { setup, .. } => setup.validate()?,
            ScanVariant::SinglePass { .. } => {}
        }
        if self.mode.motion == ScanMotion::Point && !(self.dwell_s.is_finite() && self.dwell_s >= 0.0)
        {
            return Err(SpmError::Configuration(format!(
                "Invalid dwell time {}",
                self.dwell_s
            )));
        }
        Ok(())
    }

    /// Number of leading signals measured in pass 1, if two-pass
    pub fn pass1_signals(&self) -> Option<usize> {
        match &self.mode.variant {
            ScanVariant::TwoPass(setup) => Some(setup.pass1_signals),
            _ => None,
        }
    }
}

/// Samples of one session, indexed `[signal, line, point]`
#[derive(Debug, Clone, PartialEq)]
pub struct ScanImage {
    pub signals: Vec<String>,
    pub data: Array3<f32>,
}

impl ScanImage {
    pub fn new(signals: Vec<String>, lines: usize, points_per_line: usize) -> Self {
        let data = Array3::from_elem((signals.len(), lines, points_per_line), f32::NAN);
        Self { signals, data }
    }

    pub fn signal_count(&self) -> usize {
        self.data.dim().0
    }

    /// Store values for signals `first_signal..` of one point
    pub fn put_point(
        &mut self,
        line: usize,
        point: usize,
        first_signal: usize,
        values: &[f32],
    ) -> Result<(), SpmError> {
        let (signals, lines, points) = self.data.dim();
        if line >= lines || point >= points || first_signal + values.len() > signals {
            return Err(SpmError::ProtocolViolation(format!(
                "Point ({line}, {point}) with {} values starting at signal {first_signal} is outside a {signals}x{lines}x{points} image",
                values.len()
            )));
        }
        for (offset, value) in values.iter().enumerate() {
            self.data[[first_signal + offset, line, point]] = *value;
        }
        Ok(())
    }

    /// Forget everything recorded for `line`
    pub fn clear_line(&mut self, line: usize) {
        if line < self.data.dim().1 {
            self.data.slice_mut(s![.., line, ..]).fill(f32::NAN);
        }
    }

    /// One signal as a `lines x points` view
    pub fn channel(&self, name: &str) -> Option<ndarray::ArrayView2<'_, f32>> {
        let index = self
            .signals
            .iter()
            .position(|s| s.eq_ignore_ascii_case(name))?;
        Some(self.data.slice(s![index, .., ..]))
    }
}

/// How a session ended for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub variant: String,
    pub motion: ScanMotion,
    pub lines_completed: usize,
    pub points_per_line: usize,
    pub restarts: u32,
    pub retries: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Mutable state of the active session. Owned by the orchestrator thread.
#[derive(Debug)]
pub struct ScanSession {
    pub plan: ScanPlan,
    state: SessionState,
    pub progress: SessionProgress,
    pub image: ScanImage,
    pub lines_completed: usize,
    pub restarts: u32,
    pub retries: u32,
    pub started_at: DateTime<Utc>,
}

impl ScanSession {
    pub fn new(plan: ScanPlan) -> Self {
        let image = ScanImage::new(
            plan.signals.clone(),
            plan.geometry.lines,
            plan.geometry.points_per_line,
        );
        Self {
            plan,
            state: SessionState::Idle,
            progress: SessionProgress::default(),
            image,
            lines_completed: 0,
            restarts: 0,
            retries: 0,
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), SpmError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    /// Discard partial data of the current line and rewind its point index
    pub fn rewind_line(&mut self) {
        self.image.clear_line(self.progress.line);
        self.progress.point = 0;
        if self.progress.pass.is_some() {
            self.progress.pass = Some(Pass::First);
        }
    }

    /// Record one chunk of whole points streamed for the current line
    pub fn record_chunk(&mut self, values: &[f32]) -> Result<(), SpmError> {
        let signal_count = self.image.signal_count();
        let points = values.len() / signal_count.max(1);
        if signal_count == 0 || values.len() % signal_count != 0 {
            return Err(SpmError::ProtocolViolation(format!(
                "Buffer of {} values is not a multiple of {signal_count} signals",
                values.len()
            )));
        }
        if self.progress.point + points > self.plan.geometry.points_per_line {
            return Err(SpmError::ProtocolViolation(format!(
                "Line {} received {} points, expected {}",
                self.progress.line,
                self.progress.point + points,
                self.plan.geometry.points_per_line
            )));
        }
        for chunk in values.chunks(signal_count) {
            self.image
                .put_point(self.progress.line, self.progress.point, 0, chunk)?;
            self.progress.point += 1;
        }
        Ok(())
    }

    pub fn report(&self, outcome: ScanOutcome) -> ScanReport {
        ScanReport {
            outcome,
            variant: self.plan.mode.variant.name().to_string(),
            motion: self.plan.mode.motion,
            lines_completed: self.lines_completed,
            points_per_line: self.plan.geometry.points_per_line,
            restarts: self.restarts,
            retries: self.retries,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LiftPair, TraceTiming, TwoPassSetup, TwoPassTiming};

    fn plan(variant: ScanVariant, signals: &[&str]) -> ScanPlan {
        ScanPlan {
            geometry: ScanGeometry {
                x0: 0.0,
                y0: 0.0,
                width: 10.0,
                height: 10.0,
                points_per_line: 3,
                lines: 2,
            },
            mode: ScanMode {
                motion: ScanMotion::Line,
                variant,
            },
            signals: signals.iter().map(|s| s.to_string()).collect(),
            dwell_s: 0.01,
            triggering: false,
            max_line_retries: 3,
        }
    }

    fn single_pass() -> ScanVariant {
        ScanVariant::SinglePass {
            plane: crate::types::PlaneId::XY,
            timing: TraceTiming::default(),
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let state = SessionState::Idle
            .transition(SessionState::Configuring)
            .and_then(|s| s.transition(SessionState::LineArmed))
            .and_then(|s| s.transition(SessionState::Streaming))
            .and_then(|s| s.transition(SessionState::LineComplete))
            .and_then(|s| s.transition(SessionState::Completed))
            .unwrap();
        assert!(state.is_terminal());
        assert_eq!(state.transition(SessionState::Idle).unwrap(), SessionState::Idle);
    }

    #[test]
    fn test_illegal_transition_is_protocol_violation() {
        assert!(matches!(
            SessionState::Idle.transition(SessionState::Streaming),
            Err(SpmError::ProtocolViolation(_))
        ));
        assert!(SessionState::Completed
            .transition(SessionState::LineArmed)
            .is_err());
        assert!(SessionState::Aborted.transition(SessionState::Aborted).is_err());
    }

    #[test]
    fn test_probe_lifts_accumulate() {
        let state = ProbeState::Landed.lifted_by(200.0).lifted_by(50.0);
        assert_eq!(state, ProbeState::Lifted { total_nm: 250.0 });
        assert!(state.is_lifted());
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let handle = stop.clone();
        handle.request();
        assert!(stop.is_requested());
        stop.clear();
        assert!(!handle.is_requested());
    }

    #[test]
    fn test_plan_validation() {
        assert!(plan(single_pass(), &["Height"]).validate().is_ok());
        assert!(plan(single_pass(), &[]).validate().is_err());

        let two_pass = |pass1_signals| {
            ScanVariant::TwoPass(TwoPassSetup {
                pass1_signals,
                lift: LiftPair::default(),
                trigger_pass1: false,
                trigger_pass2: false,
                timing: TwoPassTiming::default(),
            })
        };
        assert!(plan(two_pass(1), &["Height", "Mag"]).validate().is_ok());
        assert!(plan(two_pass(2), &["Height", "Mag"]).validate().is_err());
        assert!(plan(two_pass(0), &["Height", "Mag"]).validate().is_err());
    }

    #[test]
    fn test_record_chunk_fills_image_and_detects_overflow() {
        let mut session = ScanSession::new(plan(single_pass(), &["Height", "Mag"]));
        session.record_chunk(&[1.0, 10.0, 2.0, 20.0]).unwrap();
        session.record_chunk(&[3.0, 30.0]).unwrap();
        assert_eq!(session.progress.point, 3);
        let height = session.image.channel("height").unwrap();
        assert_eq!(height[[0, 2]], 3.0);

        assert!(matches!(
            session.record_chunk(&[4.0, 40.0]),
            Err(SpmError::ProtocolViolation(_))
        ));
        assert!(matches!(
            session.record_chunk(&[4.0]),
            Err(SpmError::ProtocolViolation(_))
        ));

        session.rewind_line();
        assert_eq!(session.progress.point, 0);
        assert!(session.image.data[[0, 0, 0]].is_nan());
    }
}
