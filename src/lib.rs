pub mod config;
pub mod error;
pub mod handoff;
pub mod orchestrator;
pub mod probe;
pub mod remote;
pub mod session;
pub mod simulator;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::{load_config, load_config_or_default, AppConfig};
pub use error::SpmError;
pub use handoff::{Handoff, HandoffChannel, PostOutcome, SessionSink};
pub use orchestrator::{ExecutionStyle, ScanOrchestrator, ScanResult};
pub use probe::{LandOutcome, ProbeController, SweepData, SweepRun};
pub use remote::{
    ConnectionConfig, NotificationRouter, NotificationSink, Registration, RemoteSpm,
    RemoteSpmClient, RemoteSpmClientBuilder,
};
pub use session::{
    ProbeState, ScanImage, ScanOutcome, ScanPlan, ScanReport, ScanSession, SessionState,
    StopSignal,
};
pub use simulator::{SimulatedSpm, SimulatorConfig};
pub use types::{
    AxisId, LiftPair, LineEndpoints, PlaneId, PlaneSetup, SampleBuffer, ScanGeometry, ScanMode,
    ScanMotion, ScanVariant, ServerEvent, SignalInfo, SurfacePoint, SweepParams, TraceTiming,
    TwoPassSetup, TwoPassTiming,
};
