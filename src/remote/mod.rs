//! Boundary to the vendor SPM server.
//!
//! [`RemoteSpm`] is the synchronous call surface. Asynchronous notifications
//! (generic events, streamed samples, line restarts) are delivered by the
//! server's own callback context to a [`NotificationSink`] registered for one
//! session; registration hands back a [`Registration`] token that is the only
//! way to remove that sink again.

pub mod client;
pub mod event_stream;
pub mod protocol;

use log::{debug, warn};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SpmError;
use crate::handoff::PostOutcome;
use crate::types::{
    AxisId, LiftPair, LineEndpoints, PlaneId, SampleBuffer, ScanMotion, ServerEvent, SignalInfo,
    SurfacePoint, SweepParams, TraceTiming, TwoPassTiming,
};

pub use client::{ConnectionConfig, RemoteSpmClient, RemoteSpmClientBuilder};

/// Version of the remote interface this client speaks
pub const INTERFACE_VERSION: i32 = 11;
/// Longest signal name accepted by the server
pub const MAX_SIG_NAME_LEN: usize = 40;
/// Longest axis id accepted by the server
pub const MAX_AXIS_ID_LEN: usize = 8;

/// Handler for notifications coming from the server's callback context.
///
/// All methods are invoked on a thread this crate does not own.
/// `on_samples` may block; the server must not deliver the next buffer
/// before it returns.
pub trait NotificationSink: Send + Sync {
    fn on_event(&self, event: ServerEvent);
    fn on_samples(&self, samples: SampleBuffer) -> PostOutcome;
    fn on_restart_line(&self);
}

/// Capability token for one installed notification sink
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    id: u64,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Routes notifications to the sink of the currently registered session.
///
/// Shared between a remote endpoint implementation and the thread that
/// delivers its notifications.
#[derive(Clone, Default)]
pub struct NotificationRouter {
    route: Arc<RwLock<Option<(u64, Arc<dyn NotificationSink>)>>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.route.read().as_ref().map(|(id, _)| *id);
        f.debug_struct("NotificationRouter")
            .field("registration", &current)
            .finish()
    }
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `sink`, replacing any previous session's sink
    pub fn install(&self, sink: Arc<dyn NotificationSink>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut route = self.route.write();
        if let Some((old, _)) = route.as_ref() {
            warn!("Replacing notification registration {old} with {id}");
        }
        *route = Some((id, sink));
        debug!("Installed notification registration {id}");
        Registration { id }
    }

    /// Remove the sink belonging to `registration`. Stale tokens are ignored.
    pub fn remove(&self, registration: &Registration) -> bool {
        let mut route = self.route.write();
        match route.as_ref() {
            Some((id, _)) if *id == registration.id => {
                *route = None;
                debug!("Removed notification registration {}", registration.id);
                true
            }
            _ => false,
        }
    }

    pub fn sink(&self) -> Option<Arc<dyn NotificationSink>> {
        self.route.read().as_ref().map(|(_, sink)| sink.clone())
    }

    pub fn is_registered(&self) -> bool {
        self.route.read().is_some()
    }

    pub fn dispatch_event(&self, event: ServerEvent) {
        match self.sink() {
            Some(sink) => sink.on_event(event),
            None => debug!("Event {event:?} without registered session"),
        }
    }

    /// Deliver samples and block until the session consumed them
    pub fn dispatch_samples(&self, samples: SampleBuffer) -> PostOutcome {
        match self.sink() {
            Some(sink) => sink.on_samples(samples),
            None => {
                debug!("{} samples without registered session", samples.len());
                PostOutcome::Discarded
            }
        }
    }

    pub fn dispatch_restart(&self) {
        match self.sink() {
            Some(sink) => sink.on_restart_line(),
            None => warn!("Restart notification without registered session"),
        }
    }
}

/// Synchronous call surface of the remote SPM server.
///
/// Setup calls that the server rejects are reported as
/// [`SpmError::Configuration`], rejected execution calls as
/// [`SpmError::Execution`].
pub trait RemoteSpm: Send {
    // === Connection ===

    fn connect(&mut self) -> Result<(), SpmError>;
    fn disconnect(&mut self) -> Result<(), SpmError>;
    fn is_connected(&mut self) -> Result<bool, SpmError>;

    fn client_interface_version(&self) -> i32 {
        INTERFACE_VERSION
    }
    fn server_interface_version(&mut self) -> Result<i32, SpmError>;
    fn is_server_compatible(&mut self) -> Result<bool, SpmError>;

    // === Notifications ===

    fn register_notifications(
        &mut self,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Registration, SpmError>;
    fn unregister_notifications(&mut self, registration: Registration) -> Result<(), SpmError>;

    // === Axes and signals ===

    /// Usable range in µm; zero means the axis is unusable
    fn axis_range(&mut self, axis: AxisId) -> Result<f32, SpmError>;
    fn axis_position(&mut self, axis: AxisId) -> Result<f32, SpmError>;
    /// Position the axis will have when the running procedure ends
    fn axis_setpoint(&mut self, axis: AxisId) -> Result<f32, SpmError>;
    fn set_axis_position(
        &mut self,
        axis: AxisId,
        value_um: f32,
        sweep_time_s: f32,
    ) -> Result<(), SpmError>;
    fn set_axes_positions(
        &mut self,
        targets: &[(AxisId, f32)],
        sweep_time_s: f32,
    ) -> Result<(), SpmError>;
    fn signals_list(&mut self) -> Result<Vec<SignalInfo>, SpmError>;

    // === Scanning ===

    fn setup_scan_common(
        &mut self,
        plane: PlaneId,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError>;
    fn setup_scan_line(&mut self, line: LineEndpoints, timing: TraceTiming)
        -> Result<(), SpmError>;
    /// Move to the next point and return the data of the previous one
    fn exec_scan_point(&mut self) -> Result<SampleBuffer, SpmError>;
    /// Start streaming one line; returns before the line is done
    fn exec_scan_line(&mut self, dwell_s: f32) -> Result<(), SpmError>;
    fn finish_scan(&mut self) -> Result<(), SpmError>;
    fn set_triggering(&mut self, enable: bool) -> Result<(), SpmError>;

    fn setup_plane_scan(
        &mut self,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError>;
    fn set_plane_points(&mut self, points: &[SurfacePoint]) -> Result<(), SpmError>;
    fn set_plane_lift(&mut self, lift: LiftPair) -> Result<(), SpmError>;

    fn setup_two_pass_scan(
        &mut self,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
        pass1_signals: usize,
    ) -> Result<(), SpmError>;
    fn setup_two_pass_line(
        &mut self,
        line: LineEndpoints,
        timing: TwoPassTiming,
    ) -> Result<(), SpmError>;
    fn set_two_pass_lift(&mut self, lift: LiftPair) -> Result<(), SpmError>;
    fn set_two_pass_triggering(&mut self, pass1: bool, pass2: bool) -> Result<(), SpmError>;

    // === Probe ===

    /// Returns `true` when Z feedback was on (probe on the surface)
    fn probe_sweep_z(&mut self, sweep: &SweepParams) -> Result<bool, SpmError>;
    fn break_probe_sweep_z(&mut self) -> Result<(), SpmError>;
    /// Lift is added to previous lifts. Returns `true` when the probe was
    /// on the surface or already lifted.
    fn probe_lift(&mut self, lift_nm: f32, trigger_time_s: f32) -> Result<bool, SpmError>;
    /// Returns `true` when the probe had been lifted before
    fn probe_land(&mut self) -> Result<bool, SpmError>;
    /// Landing with a constant rate, usable from large gaps
    fn probe_land2(&mut self) -> Result<bool, SpmError>;
}

/// Check that every requested signal exists in the server's catalogue.
/// Returns the names in the server's spelling.
pub fn resolve_signals(
    catalogue: &[SignalInfo],
    requested: &[String],
) -> Result<Vec<String>, SpmError> {
    if requested.is_empty() {
        return Err(SpmError::Configuration("Signal list is empty".to_string()));
    }
    requested
        .iter()
        .map(|name| {
            if name.len() >= MAX_SIG_NAME_LEN {
                return Err(SpmError::Configuration(format!(
                    "Signal name too long: {name}"
                )));
            }
            catalogue
                .iter()
                .find(|info| info.matches(name))
                .map(|info| info.name.clone())
                .ok_or_else(|| SpmError::Configuration(format!("Unknown signal: {name}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingSink {
        events: Mutex<Vec<ServerEvent>>,
        samples: Mutex<usize>,
        restarts: Mutex<usize>,
    }

    impl NotificationSink for CountingSink {
        fn on_event(&self, event: ServerEvent) {
            self.events.lock().push(event);
        }

        fn on_samples(&self, samples: SampleBuffer) -> PostOutcome {
            *self.samples.lock() += samples.len();
            PostOutcome::Consumed
        }

        fn on_restart_line(&self) {
            *self.restarts.lock() += 1;
        }
    }

    #[test]
    fn test_router_delivers_to_registered_sink_only() {
        let router = NotificationRouter::new();
        assert_eq!(
            router.dispatch_samples(SampleBuffer::new(vec![1.0])),
            PostOutcome::Discarded
        );

        let sink = Arc::new(CountingSink::default());
        let registration = router.install(sink.clone());
        router.dispatch_event(ServerEvent::PrimaryScannerMoved);
        assert_eq!(
            router.dispatch_samples(SampleBuffer::new(vec![1.0, 2.0])),
            PostOutcome::Consumed
        );
        router.dispatch_restart();

        assert_eq!(sink.events.lock().len(), 1);
        assert_eq!(*sink.samples.lock(), 2);
        assert_eq!(*sink.restarts.lock(), 1);

        assert!(router.remove(&registration));
        assert!(!router.is_registered());
        router.dispatch_restart();
        assert_eq!(*sink.restarts.lock(), 1);
    }

    #[test]
    fn test_stale_registration_cannot_remove_newer_sink() {
        let router = NotificationRouter::new();
        let first = router.install(Arc::new(CountingSink::default()));
        let second = router.install(Arc::new(CountingSink::default()));
        assert_ne!(first, second);
        assert!(!router.remove(&first));
        assert!(router.is_registered());
        assert!(router.remove(&second));
    }

    #[test]
    fn test_resolve_signals_is_case_insensitive() {
        let catalogue = vec![
            SignalInfo::new("SenX", "um"),
            SignalInfo::new("Nf", "V"),
            SignalInfo::new("Height(Sen)", "nm"),
        ];
        let resolved =
            resolve_signals(&catalogue, &["senx".to_string(), "NF".to_string()]).unwrap();
        assert_eq!(resolved, vec!["SenX".to_string(), "Nf".to_string()]);

        assert!(matches!(
            resolve_signals(&catalogue, &["Mag".to_string()]),
            Err(SpmError::Configuration(_))
        ));
        assert!(resolve_signals(&catalogue, &[]).is_err());
    }
}
