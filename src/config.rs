use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::remote::ConnectionConfig;
use crate::session::ScanPlan;
use crate::simulator::SimulatorConfig;
use crate::types::{
    LiftPair, PlaneId, PlaneSetup, ScanGeometry, ScanMode, ScanMotion, ScanVariant,
    SurfacePoint, SweepParams, TraceTiming, TwoPassSetup, TwoPassTiming,
};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub connection: ConnectionSettings,
    pub scan: ScanConfig,
    pub handoff: HandoffConfig,
    pub sweep: SweepConfig,
    pub simulator: SimulatorSettings,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.validate()?;
        self.sweep
            .to_params()
            .validate()
            .map_err(|e| ConfigError::Message(format!("Invalid sweep: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    /// Notification port of the bridge, defaults to `port + 1`
    pub event_port: Option<u16>,
    pub connect_timeout_s: u64,
    pub read_timeout_s: u64,
    pub write_timeout_s: u64,
}

impl ConnectionSettings {
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_s),
            read_timeout: Duration::from_secs(self.read_timeout_s),
            write_timeout: Duration::from_secs(self.write_timeout_s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    #[default]
    SinglePass,
    TwoPass,
    PlaneCompensated,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanConfig {
    pub variant: VariantKind,
    /// Scan plane of single-pass scans. Other variants always scan XY.
    pub plane: PlaneId,
    pub motion: ScanMotion,
    pub points_per_line: usize,
    pub lines: usize,
    /// Scan area origin, µm
    pub origin: [f32; 2],
    /// Scan area size, µm
    pub extent: [f32; 2],
    pub timing: TraceTiming,
    pub two_pass_timing: TwoPassTiming,
    /// Dwell time per point for triggered point scans, s
    pub dwell_s: f32,
    pub signals: Vec<String>,
    pub triggering: bool,
    pub max_line_retries: u32,

    /// Leading signals measured during pass 1
    pub pass1_signals: usize,
    pub trigger_pass1: bool,
    pub trigger_pass2: bool,
    pub lift: LiftPair,
    /// Surface points `[x, y, z]` defining the compensation plane
    pub plane_points: Vec<[f32; 3]>,
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.points_per_line == 0 || self.lines == 0 {
            return Err(ConfigError::Message(format!(
                "Scan needs points and lines, got {}x{}",
                self.points_per_line, self.lines
            )));
        }
        if self.signals.is_empty() {
            return Err(ConfigError::Message(
                "Scan signal list is empty".to_string(),
            ));
        }
        if self.variant == VariantKind::TwoPass
            && !(1..self.signals.len()).contains(&self.pass1_signals)
        {
            return Err(ConfigError::Message(format!(
                "pass1_signals must be in 1..{}, got {}",
                self.signals.len(),
                self.pass1_signals
            )));
        }
        if self.variant == VariantKind::PlaneCompensated {
            self.plane_setup()
                .validate()
                .map_err(|e| ConfigError::Message(e.to_string()))?;
        }
        Ok(())
    }

    fn plane_setup(&self) -> PlaneSetup {
        PlaneSetup {
            points: self
                .plane_points
                .iter()
                .map(|[x, y, z]| SurfacePoint::new(*x, *y, *z))
                .collect(),
            lift: self.lift,
        }
    }

    pub fn variant(&self) -> ScanVariant {
        match self.variant {
            VariantKind::SinglePass => ScanVariant::SinglePass {
                plane: self.plane,
                timing: self.timing,
            },
            VariantKind::TwoPass => ScanVariant::TwoPass(TwoPassSetup {
                pass1_signals: self.pass1_signals,
                lift: self.lift,
                trigger_pass1: self.trigger_pass1,
                trigger_pass2: self.trigger_pass2,
                timing: self.two_pass_timing,
            }),
            VariantKind::PlaneCompensated => ScanVariant::PlaneCompensated {
                setup: self.plane_setup(),
                timing: self.timing,
            },
        }
    }

    pub fn to_plan(&self) -> Result<ScanPlan, ConfigError> {
        self.validate()?;
        Ok(ScanPlan {
            geometry: ScanGeometry {
                x0: self.origin[0],
                y0: self.origin[1],
                width: self.extent[0],
                height: self.extent[1],
                points_per_line: self.points_per_line,
                lines: self.lines,
            },
            mode: ScanMode {
                motion: self.motion,
                variant: self.variant(),
            },
            signals: self.signals.clone(),
            dwell_s: self.dwell_s,
            triggering: self.triggering,
            max_line_retries: self.max_line_retries,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HandoffConfig {
    /// Warn after this many seconds without data. Zero disables the warning.
    pub diagnostic_interval_s: f32,
}

impl HandoffConfig {
    pub fn diagnostic_interval(&self) -> Option<Duration> {
        (self.diagnostic_interval_s > 0.0)
            .then(|| Duration::from_secs_f32(self.diagnostic_interval_s))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepConfig {
    pub from_nm: f32,
    pub to_nm: f32,
    pub points: usize,
    pub sweep_time_s: f32,
    pub idle_speed_factor: f32,
    pub signals: Vec<String>,
}

impl SweepConfig {
    pub fn to_params(&self) -> SweepParams {
        SweepParams {
            from_nm: self.from_nm,
            to_nm: self.to_nm,
            points: self.points,
            sweep_time_s: self.sweep_time_s,
            idle_speed_factor: self.idle_speed_factor,
            signals: self.signals.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SimulatorSettings {
    pub chunk_points: usize,
    pub chunk_delay_ms: u64,
    /// Inject a line restart on every n-th line execution, 0 disables
    pub restart_every: usize,
}

impl SimulatorSettings {
    pub fn to_simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            chunk_points: self.chunk_points,
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
            restart_every: (self.restart_every > 0).then_some(self.restart_every),
            ..SimulatorConfig::default()
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6601,
            event_port: None,
            connect_timeout_s: 5,
            read_timeout_s: 30,
            write_timeout_s: 5,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            variant: VariantKind::SinglePass,
            plane: PlaneId::XY,
            motion: ScanMotion::Line,
            points_per_line: 128,
            lines: 128,
            origin: [0.0, 0.0],
            extent: [10.0, 10.0],
            timing: TraceTiming::default(),
            two_pass_timing: TwoPassTiming::default(),
            dwell_s: 0.01,
            signals: vec!["Height".to_string(), "Mag".to_string()],
            triggering: false,
            max_line_retries: 2,
            pass1_signals: 1,
            trigger_pass1: false,
            trigger_pass2: false,
            lift: LiftPair::default(),
            plane_points: Vec::new(),
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            diagnostic_interval_s: 5.0,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            from_nm: 200.0,
            to_nm: 0.0,
            points: 100,
            sweep_time_s: 2.0,
            idle_speed_factor: 4.0,
            signals: vec!["Mag".to_string(), "Phase".to_string()],
        }
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            chunk_points: 16,
            chunk_delay_ms: 0,
            restart_every: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Load configuration from file with layered fallbacks
///
/// Defaults, then the TOML file, then `RUSTY_PROBE_<SECTION>__<KEY>`
/// environment variables.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["rusty_probe.toml", "config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("RUSTY_PROBE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("scan.signals")
            .with_list_parse_key("sweep.signals"),
    );

    let config = builder.build()?.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
