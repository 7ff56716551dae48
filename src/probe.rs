use log::{debug, info, warn};
use ndarray::Array2;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SpmError;
use crate::handoff::{Handoff, HandoffChannel, SessionSink};
use crate::remote::{resolve_signals, NotificationSink, Registration, RemoteSpm};
use crate::session::{ProbeState, StopSignal};
use crate::types::{SampleBuffer, SweepParams};

/// Result of a land request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LandOutcome {
    /// The probe was lifted and is now back on the surface
    Landed,
    /// Nothing to do, the probe was not lifted
    AlreadyLanded,
}

/// Samples of one Z sweep, one row per sweep point
#[derive(Debug, Clone, PartialEq)]
pub struct SweepData {
    pub signals: Vec<String>,
    pub rows: Array2<f32>,
    /// Z feedback was on when the sweep started
    pub feedback_was_on: bool,
    pub cancelled: bool,
}

/// Lift, land and Z sweeps of the probe.
///
/// Tracks whether the probe is lifted so that landing an already landed
/// probe never reaches the server.
pub struct ProbeController<'a, R: RemoteSpm + ?Sized> {
    remote: &'a mut R,
    state: ProbeState,
    diagnostic_interval: Option<Duration>,
}

impl<'a, R: RemoteSpm + ?Sized> ProbeController<'a, R> {
    pub fn new(remote: &'a mut R) -> Self {
        Self::with_state(remote, ProbeState::Landed)
    }

    /// Start from a known probe state, e.g. one reported by an earlier run
    pub fn with_state(remote: &'a mut R, state: ProbeState) -> Self {
        Self {
            remote,
            state,
            diagnostic_interval: None,
        }
    }

    pub fn with_diagnostic_interval(mut self, interval: Duration) -> Self {
        self.diagnostic_interval = Some(interval);
        self
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Lift the probe by `lift_nm` on top of any previous lift.
    ///
    /// Returns the server's verdict: `false` means the probe was neither on
    /// the surface nor lifted, and the state is left unchanged.
    pub fn lift(&mut self, lift_nm: f32, trigger_time_s: f32) -> Result<bool, SpmError> {
        if !lift_nm.is_finite() {
            return Err(SpmError::Configuration(format!("Invalid lift {lift_nm}")));
        }
        let accepted = self.remote.probe_lift(lift_nm, trigger_time_s)?;
        if accepted {
            self.state = self.state.lifted_by(lift_nm);
            info!("Probe lifted by {lift_nm} nm, now {:?}", self.state);
        } else {
            warn!("Lift of {lift_nm} nm refused by server");
        }
        Ok(accepted)
    }

    /// Land a lifted probe. A probe that is not lifted is left alone.
    pub fn land(&mut self) -> Result<LandOutcome, SpmError> {
        if !self.state.is_lifted() {
            debug!("Land requested while not lifted, nothing to do");
            return Ok(LandOutcome::AlreadyLanded);
        }
        let was_lifted = self.remote.probe_land()?;
        self.state = ProbeState::Landed;
        Ok(Self::land_outcome(was_lifted))
    }

    /// Constant-rate landing, usable from large lifts. Always forwarded; a
    /// probe that was not lifted reports success.
    pub fn land2(&mut self) -> Result<LandOutcome, SpmError> {
        let tracked_lift = self.state.is_lifted();
        let was_lifted = self.remote.probe_land2()?;
        self.state = ProbeState::Landed;
        if tracked_lift {
            Ok(Self::land_outcome(was_lifted))
        } else {
            Ok(LandOutcome::AlreadyLanded)
        }
    }

    fn land_outcome(server_was_lifted: bool) -> LandOutcome {
        if server_was_lifted {
            info!("Probe landed");
            LandOutcome::Landed
        } else {
            warn!("Server reports the probe was not lifted");
            LandOutcome::AlreadyLanded
        }
    }

    /// Start a Z sweep and hand back the run that drains it
    pub fn begin_sweep(&mut self, params: &SweepParams) -> Result<SweepRun<'_, R>, SpmError> {
        params.validate()?;
        let mut params = params.clone();
        if !params.signals.is_empty() {
            let catalogue = self.remote.signals_list()?;
            params.signals = resolve_signals(&catalogue, &params.signals)?;
        }

        let (tx, _rx) = crossbeam_channel::unbounded();
        let sink = Arc::new(SessionSink::new(tx));
        let dyn_sink: Arc<dyn NotificationSink> = sink.clone();
        let registration = self.remote.register_notifications(dyn_sink)?;

        info!(
            "Z sweep {} -> {} nm, {} points in {} s",
            params.from_nm, params.to_nm, params.points, params.sweep_time_s
        );
        let feedback_was_on = match self.remote.probe_sweep_z(&params) {
            Ok(on) => on,
            Err(e) => {
                if let Err(u) = self.remote.unregister_notifications(registration) {
                    debug!("Unregister after failed sweep start: {u}");
                }
                return Err(e);
            }
        };

        Ok(SweepRun {
            remote: &mut *self.remote,
            sink,
            registration: Some(registration),
            signals: params.signals,
            feedback_was_on,
            finished: false,
            diagnostic_interval: self.diagnostic_interval,
        })
    }

    /// Run a full sweep, cancelling it when `stop` is requested
    pub fn sweep_z(&mut self, params: &SweepParams, stop: &StopSignal) -> Result<SweepData, SpmError> {
        let mut run = self.begin_sweep(params)?;
        let signal_count = run.signals.len();
        let mut values = Vec::with_capacity(params.points * signal_count);
        let mut cancelled = false;

        while let Some(buffer) = run.next_chunk()? {
            buffer.point_count(signal_count)?;
            values.extend_from_slice(buffer.values());
            if stop.is_requested() {
                run.release()?;
                run.cancel()?;
                cancelled = true;
                break;
            }
        }

        let rows = values.len() / signal_count.max(1);
        let rows = Array2::from_shape_vec((rows, signal_count), values)
            .map_err(|e| SpmError::ProtocolViolation(format!("Sweep data shape: {e}")))?;
        info!("Z sweep {} with {} points", if cancelled { "cancelled" } else { "finished" }, rows.nrows());

        Ok(SweepData {
            signals: run.signals.clone(),
            rows,
            feedback_was_on: run.feedback_was_on,
            cancelled,
        })
    }
}

/// Sweep in progress.
///
/// Buffers are handed out by [`next_chunk`](Self::next_chunk) and stay held
/// until released. The server only accepts a break while no data buffer is
/// held, so [`cancel`](Self::cancel) refuses in that case without contacting
/// it. Dropping an unfinished run cancels it.
pub struct SweepRun<'a, R: RemoteSpm + ?Sized> {
    remote: &'a mut R,
    sink: Arc<SessionSink>,
    registration: Option<Registration>,
    pub signals: Vec<String>,
    pub feedback_was_on: bool,
    finished: bool,
    diagnostic_interval: Option<Duration>,
}

impl<R: RemoteSpm + ?Sized> SweepRun<'_, R> {
    fn handoff(&self) -> &HandoffChannel {
        self.sink.handoff()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next data buffer, or `None` once the sweep ended. Releases the
    /// previously returned buffer first.
    pub fn next_chunk(&mut self) -> Result<Option<SampleBuffer>, SpmError> {
        if self.finished {
            return Ok(None);
        }
        if self.handoff().holds_samples() {
            self.handoff().release()?;
        }
        loop {
            let handoff = match self.diagnostic_interval {
                Some(interval) => self.handoff().acquire_with_diagnostics(interval)?,
                None => self.handoff().acquire()?,
            };
            match handoff {
                Handoff::Samples(buffer) if buffer.is_terminator() => {
                    self.handoff().release_and_close();
                    self.finish();
                    return Ok(None);
                }
                Handoff::Samples(buffer) => return Ok(Some(buffer)),
                Handoff::Restart => {
                    self.handoff().take_restart();
                    debug!("Ignoring restart notification during sweep");
                }
                Handoff::Closed => {
                    self.finish();
                    return Ok(None);
                }
            }
        }
    }

    /// Give the held buffer back to the server
    pub fn release(&mut self) -> Result<(), SpmError> {
        self.handoff().release()
    }

    /// Break the sweep. Rejected while a data buffer is still held.
    pub fn cancel(&mut self) -> Result<(), SpmError> {
        if self.finished {
            return Ok(());
        }
        if self.handoff().holds_samples() {
            return Err(SpmError::Precondition(
                "Release the current sweep buffer before breaking the sweep".to_string(),
            ));
        }
        self.handoff().release_and_close();
        info!("Breaking Z sweep");
        let result = self.remote.break_probe_sweep_z();
        self.finish();
        result
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(registration) = self.registration.take() {
            if let Err(e) = self.remote.unregister_notifications(registration) {
                warn!("Unregistering sweep notifications failed: {e}");
            }
        }
    }
}

impl<R: RemoteSpm + ?Sized> Drop for SweepRun<'_, R> {
    fn drop(&mut self) {
        if !self.finished {
            self.handoff().release_and_close();
            if let Err(e) = self.remote.break_probe_sweep_z() {
                warn!("Breaking abandoned sweep failed: {e}");
            }
            self.finish();
        }
    }
}
