use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SpmError;

/// Scanner axis identifier. Parsing is case-insensitive and accepts the
/// `X1`/`Y1`/`Z1` aliases for the primary scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AxisId {
    X,
    Y,
    Z,
    X2,
    Y2,
    Z2,
}

impl AxisId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AxisId::X => "X",
            AxisId::Y => "Y",
            AxisId::Z => "Z",
            AxisId::X2 => "X2",
            AxisId::Y2 => "Y2",
            AxisId::Z2 => "Z2",
        }
    }

    /// Axes of the second (objective) scanner
    pub fn is_secondary(&self) -> bool {
        matches!(self, AxisId::X2 | AxisId::Y2 | AxisId::Z2)
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AxisId {
    type Err = SpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" | "X1" => Ok(AxisId::X),
            "Y" | "Y1" => Ok(AxisId::Y),
            "Z" | "Z1" => Ok(AxisId::Z),
            "X2" => Ok(AxisId::X2),
            "Y2" => Ok(AxisId::Y2),
            "Z2" => Ok(AxisId::Z2),
            other => Err(SpmError::Type(format!("Unknown axis id: {other}"))),
        }
    }
}

impl TryFrom<String> for AxisId {
    type Error = SpmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AxisId> for String {
    fn from(axis: AxisId) -> Self {
        axis.as_str().to_string()
    }
}

/// Scan plane spanned by two scanner axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PlaneId {
    XY,
    XZ,
    YZ,
    X2Y2,
    X2Z2,
    Y2Z2,
}

impl PlaneId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaneId::XY => "XY",
            PlaneId::XZ => "XZ",
            PlaneId::YZ => "YZ",
            PlaneId::X2Y2 => "X2Y2",
            PlaneId::X2Z2 => "X2Z2",
            PlaneId::Y2Z2 => "Y2Z2",
        }
    }

    /// Fast (line) axis and slow (frame) axis of the plane
    pub fn axes(&self) -> (AxisId, AxisId) {
        match self {
            PlaneId::XY => (AxisId::X, AxisId::Y),
            PlaneId::XZ => (AxisId::X, AxisId::Z),
            PlaneId::YZ => (AxisId::Y, AxisId::Z),
            PlaneId::X2Y2 => (AxisId::X2, AxisId::Y2),
            PlaneId::X2Z2 => (AxisId::X2, AxisId::Z2),
            PlaneId::Y2Z2 => (AxisId::Y2, AxisId::Z2),
        }
    }
}

impl fmt::Display for PlaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaneId {
    type Err = SpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "XY" => Ok(PlaneId::XY),
            "XZ" => Ok(PlaneId::XZ),
            "YZ" => Ok(PlaneId::YZ),
            "X2Y2" => Ok(PlaneId::X2Y2),
            "X2Z2" => Ok(PlaneId::X2Z2),
            "Y2Z2" => Ok(PlaneId::Y2Z2),
            other => Err(SpmError::Type(format!("Unknown plane id: {other}"))),
        }
    }
}

impl TryFrom<String> for PlaneId {
    type Error = SpmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlaneId> for String {
    fn from(plane: PlaneId) -> Self {
        plane.as_str().to_string()
    }
}

/// One entry of the server's signal catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub name: String,
    pub unit: String,
}

impl SignalInfo {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.trim())
    }
}

/// Motion style of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMotion {
    /// Continuous movement with simultaneous measurement
    Line,
    /// Probe stops at every point before measuring
    Point,
}

impl From<ScanMotion> for i32 {
    fn from(motion: ScanMotion) -> Self {
        match motion {
            ScanMotion::Line => 0,
            ScanMotion::Point => 1,
        }
    }
}

/// Forward/back timing of a single-pass line, seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceTiming {
    pub forward_s: f32,
    pub back_s: f32,
}

impl Default for TraceTiming {
    fn default() -> Self {
        Self {
            forward_s: 3.0,
            back_s: 0.3,
        }
    }
}

/// Timing of a two-pass line, seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwoPassTiming {
    pub pass1_s: f32,
    pub pass2_s: f32,
    /// Time for the two lifted retrace moves
    pub pass2_back_s: f32,
}

impl Default for TwoPassTiming {
    fn default() -> Self {
        Self {
            pass1_s: 1.0,
            pass2_s: 2.0,
            pass2_back_s: 0.5,
        }
    }
}

/// Lift over the surface and additional lift during back movement, nm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiftPair {
    pub lift_nm: f32,
    pub liftback_nm: f32,
}

impl Default for LiftPair {
    fn default() -> Self {
        Self {
            lift_nm: 500.0,
            liftback_nm: 500.0,
        }
    }
}

/// Surface point used to define the compensation plane, µm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfacePoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl SurfacePoint {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoPassSetup {
    /// Number of leading signals measured during the first pass
    pub pass1_signals: usize,
    pub lift: LiftPair,
    pub trigger_pass1: bool,
    pub trigger_pass2: bool,
    pub timing: TwoPassTiming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaneSetup {
    pub points: Vec<SurfacePoint>,
    pub lift: LiftPair,
}

impl PlaneSetup {
    /// At least three points, not all on one line in XY
    pub fn validate(&self) -> Result<(), SpmError> {
        if self.points.len() < 3 {
            return Err(SpmError::Configuration(format!(
                "Plane needs at least 3 surface points, got {}",
                self.points.len()
            )));
        }
        let p0 = self.points[0];
        let spans_area = self.points.iter().skip(1).any(|a| {
            self.points.iter().skip(1).any(|b| {
                let cross = (a.x - p0.x) * (b.y - p0.y) - (a.y - p0.y) * (b.x - p0.x);
                cross.abs() > f32::EPSILON
            })
        });
        if !spans_area {
            return Err(SpmError::Configuration(
                "Plane surface points are collinear".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pass structure of a scan, carrying the setup each variant needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanVariant {
    SinglePass { plane: PlaneId, timing: TraceTiming },
    TwoPass(TwoPassSetup),
    PlaneCompensated { setup: PlaneSetup, timing: TraceTiming },
}

impl ScanVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ScanVariant::SinglePass { .. } => "single-pass",
            ScanVariant::TwoPass(_) => "two-pass",
            ScanVariant::PlaneCompensated { .. } => "plane-compensated",
        }
    }

    /// Plane whose axes carry the scan lines
    pub fn plane(&self) -> PlaneId {
        match self {
            ScanVariant::SinglePass { plane, .. } => *plane,
            ScanVariant::TwoPass(_) | ScanVariant::PlaneCompensated { .. } => PlaneId::XY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMode {
    pub motion: ScanMotion,
    pub variant: ScanVariant,
}

/// Endpoints of one scan line, µm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineEndpoints {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// Scan area and raster. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanGeometry {
    pub x0: f32,
    pub y0: f32,
    pub width: f32,
    pub height: f32,
    pub points_per_line: usize,
    pub lines: usize,
}

impl ScanGeometry {
    /// Geometry expressed as fractions of the usable axis ranges
    pub fn from_range_fractions(
        range_fast: f32,
        range_slow: f32,
        origin: (f32, f32),
        extent: (f32, f32),
        points_per_line: usize,
        lines: usize,
    ) -> Self {
        Self {
            x0: origin.0 * range_fast,
            y0: origin.1 * range_slow,
            width: extent.0 * range_fast,
            height: extent.1 * range_slow,
            points_per_line,
            lines,
        }
    }

    pub fn validate(&self) -> Result<(), SpmError> {
        if self.points_per_line == 0 || self.lines == 0 {
            return Err(SpmError::Configuration(format!(
                "Scan raster must be non-empty, got {}x{}",
                self.points_per_line, self.lines
            )));
        }
        let values = [self.x0, self.y0, self.width, self.height];
        if values.iter().any(|v| !v.is_finite()) || self.width < 0.0 || self.height < 0.0 {
            return Err(SpmError::Configuration(format!(
                "Invalid scan area: origin ({}, {}), extent ({}, {})",
                self.x0, self.y0, self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn step_y(&self) -> f32 {
        if self.lines > 1 {
            self.height / (self.lines - 1) as f32
        } else {
            0.0
        }
    }

    pub fn line_endpoints(&self, line: usize) -> LineEndpoints {
        let y = self.y0 + self.step_y() * line as f32;
        LineEndpoints {
            x0: self.x0,
            y0: y,
            x1: self.x0 + self.width,
            y1: y,
        }
    }
}

/// One streamed measurement event. An empty buffer is the end-of-line
/// (or end-of-sweep) sentinel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBuffer(Vec<f32>);

impl SampleBuffer {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn terminator() -> Self {
        Self(Vec::new())
    }

    pub fn is_terminator(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn into_values(self) -> Vec<f32> {
        self.0
    }

    /// Number of whole points for the given signal count
    pub fn point_count(&self, signal_count: usize) -> Result<usize, SpmError> {
        if signal_count == 0 || self.0.len() % signal_count != 0 {
            return Err(SpmError::ProtocolViolation(format!(
                "Buffer of {} values is not a multiple of {} signals",
                self.0.len(),
                signal_count
            )));
        }
        Ok(self.0.len() / signal_count)
    }
}

impl From<Vec<f32>> for SampleBuffer {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Out-of-band notification from the server's generic event callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Primary scanner XYZ position changed in the SPM software
    PrimaryScannerMoved,
    /// Secondary (objective) scanner position changed
    SecondaryScannerMoved,
    Other(i32),
}

impl From<i32> for ServerEvent {
    fn from(code: i32) -> Self {
        match code {
            1 => ServerEvent::PrimaryScannerMoved,
            2 => ServerEvent::SecondaryScannerMoved,
            other => ServerEvent::Other(other),
        }
    }
}

impl ServerEvent {
    /// Axes whose set-points should be re-read after the event
    pub fn affected_axes(&self) -> &'static [AxisId] {
        match self {
            ServerEvent::PrimaryScannerMoved => &[AxisId::X, AxisId::Y, AxisId::Z],
            ServerEvent::SecondaryScannerMoved => &[AxisId::X2, AxisId::Y2, AxisId::Z2],
            ServerEvent::Other(_) => &[],
        }
    }
}

/// Parameters of a Z sweep relative to the probe's current height
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParams {
    /// Start displacement, nm. Positive values move away from the surface.
    pub from_nm: f32,
    pub to_nm: f32,
    pub points: usize,
    pub sweep_time_s: f32,
    /// Speed-up factor for the idle moves to `from` and back from `to`
    pub idle_speed_factor: f32,
    pub signals: Vec<String>,
}

impl SweepParams {
    pub fn validate(&self) -> Result<(), SpmError> {
        if self.points == 0 {
            return Err(SpmError::Configuration(
                "Z sweep needs at least one point".to_string(),
            ));
        }
        if !(self.sweep_time_s.is_finite() && self.sweep_time_s > 0.0) {
            return Err(SpmError::Configuration(format!(
                "Invalid sweep time {}",
                self.sweep_time_s
            )));
        }
        if !(self.idle_speed_factor.is_finite() && self.idle_speed_factor > 0.0) {
            return Err(SpmError::Configuration(format!(
                "Invalid idle speed factor {}",
                self.idle_speed_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_ids_are_case_insensitive() {
        assert_eq!("x".parse::<AxisId>().unwrap(), AxisId::X);
        assert_eq!("z1".parse::<AxisId>().unwrap(), AxisId::Z);
        assert_eq!(" y2 ".parse::<AxisId>().unwrap(), AxisId::Y2);
        assert!("W".parse::<AxisId>().is_err());
        assert!(AxisId::Z2.is_secondary());
    }

    #[test]
    fn test_plane_axes() {
        assert_eq!("x2z2".parse::<PlaneId>().unwrap().axes(), (AxisId::X2, AxisId::Z2));
        assert_eq!(PlaneId::YZ.axes(), (AxisId::Y, AxisId::Z));
    }

    #[test]
    fn test_line_endpoints_step_down_the_frame() {
        let geometry = ScanGeometry {
            x0: 10.0,
            y0: 5.0,
            width: 4.0,
            height: 30.0,
            points_per_line: 6,
            lines: 4,
        };
        let line = geometry.line_endpoints(3);
        assert_eq!(line.x0, 10.0);
        assert_eq!(line.x1, 14.0);
        assert_eq!(line.y0, 35.0);
        assert_eq!(line.y1, 35.0);

        let single = ScanGeometry { lines: 1, ..geometry };
        assert_eq!(single.line_endpoints(0).y0, 5.0);
    }

    #[test]
    fn test_geometry_validation() {
        let geometry = ScanGeometry::from_range_fractions(100.0, 100.0, (0.45, 0.25), (0.1, 0.5), 0, 4);
        assert!(matches!(geometry.validate(), Err(SpmError::Configuration(_))));
        let geometry = ScanGeometry { points_per_line: 6, ..geometry };
        assert!(geometry.validate().is_ok());
        assert!((geometry.x0 - 45.0).abs() < 1e-4);
    }

    #[test]
    fn test_sample_buffer_framing() {
        let buffer = SampleBuffer::new(vec![1.0; 6]);
        assert_eq!(buffer.point_count(3).unwrap(), 2);
        assert!(matches!(buffer.point_count(4), Err(SpmError::ProtocolViolation(_))));
        assert!(SampleBuffer::terminator().is_terminator());
        assert_eq!(SampleBuffer::terminator().point_count(5).unwrap(), 0);
    }

    #[test]
    fn test_plane_points_must_span_an_area() {
        let collinear = PlaneSetup {
            points: vec![
                SurfacePoint::new(0.0, 0.0, 1.0),
                SurfacePoint::new(1.0, 1.0, 1.0),
                SurfacePoint::new(2.0, 2.0, 1.0),
            ],
            lift: LiftPair::default(),
        };
        assert!(collinear.validate().is_err());

        let square = PlaneSetup {
            points: vec![
                SurfacePoint::new(0.0, 0.0, 1.0),
                SurfacePoint::new(0.0, 1.0, 1.5),
                SurfacePoint::new(1.0, 0.0, 1.5),
                SurfacePoint::new(1.0, 1.0, 1.8),
            ],
            lift: LiftPair::default(),
        };
        assert!(square.validate().is_ok());
    }

    #[test]
    fn test_server_event_codes() {
        assert_eq!(ServerEvent::from(1), ServerEvent::PrimaryScannerMoved);
        assert_eq!(ServerEvent::from(2).affected_axes()[0], AxisId::X2);
        assert_eq!(ServerEvent::from(7), ServerEvent::Other(7));
    }
}
