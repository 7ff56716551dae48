use crate::error::SpmError;
use crate::remote::event_stream::{EventStream, EventStreamHandle};
use crate::remote::protocol::{Protocol, WireValue, HEADER_SIZE};
use crate::remote::{
    NotificationRouter, NotificationSink, Registration, RemoteSpm, INTERFACE_VERSION,
    MAX_AXIS_ID_LEN,
};
use crate::types::{
    AxisId, LiftPair, LineEndpoints, PlaneId, SampleBuffer, ScanMotion, SignalInfo, SurfacePoint,
    SweepParams, TraceTiming, TwoPassTiming,
};
use log::{debug, info, trace, warn};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Connection configuration for the bridge client.
///
/// Timeouts apply to the control port only. The event port waits without
/// limit, since notifications arrive whenever the server produces them.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// How a rejected command is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Query,
    Setup,
    Exec,
}

/// Reply still owed by the bridge after a read timed out. It is read off the
/// control socket before the next command goes out.
#[derive(Debug)]
struct PendingReply {
    command: String,
    header: [u8; HEADER_SIZE],
    header_read: usize,
    body: Option<Vec<u8>>,
    body_read: usize,
}

impl PendingReply {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            header: [0u8; HEADER_SIZE],
            header_read: 0,
            body: None,
            body_read: 0,
        }
    }

    /// Continue reading where the last attempt stopped and return the body
    fn read_from<S: Read>(&mut self, stream: &mut S) -> Result<Vec<u8>, SpmError> {
        fill(stream, &mut self.header, &mut self.header_read, &self.command)?;
        if self.body.is_none() {
            let size = Protocol::validate_response_header(&self.header, &self.command)?;
            self.body = Some(vec![0u8; Protocol::checked_payload_len(size)?]);
        }
        let body = self.body.get_or_insert_with(Vec::new);
        fill(stream, body, &mut self.body_read, &self.command)?;
        Ok(std::mem::take(body))
    }
}

fn fill<S: Read>(
    stream: &mut S,
    buf: &mut [u8],
    filled: &mut usize,
    command: &str,
) -> Result<(), SpmError> {
    while *filled < buf.len() {
        match stream.read(&mut buf[*filled..]) {
            Ok(0) => {
                warn!(
                    "Incomplete response to {command}: got {} bytes, expected {}",
                    *filled,
                    buf.len()
                );
                return Err(SpmError::Io {
                    source: std::io::ErrorKind::UnexpectedEof.into(),
                    context: format!("Truncated response to {command}"),
                });
            }
            Ok(n) => *filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(RemoteSpmClient::transfer_error(e, command)),
        }
    }
    Ok(())
}

/// Builder for [`RemoteSpmClient`].
///
/// ```no_run
/// use rusty_probe::remote::{RemoteSpm, RemoteSpmClient};
///
/// let mut client = RemoteSpmClient::builder()
///     .address("127.0.0.1")
///     .port(6601)
///     .event_port(6602)
///     .build()?;
/// client.connect()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct RemoteSpmClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    event_port: Option<u16>,
    config: ConnectionConfig,
    debug: bool,
}

impl RemoteSpmClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Notification port; defaults to the control port + 1
    pub fn event_port(mut self, port: u16) -> Self {
        self.event_port = Some(port);
        self
    }

    /// Enable or disable debug logging of responses
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Validate the address. No socket is opened until [`RemoteSpm::connect`].
    pub fn build(self) -> Result<RemoteSpmClient, SpmError> {
        let address = self
            .address
            .ok_or_else(|| SpmError::Connection("Address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| SpmError::Connection("Port must be specified".to_string()))?;
        let event_port = match self.event_port {
            Some(p) => p,
            None => port
                .checked_add(1)
                .ok_or_else(|| SpmError::Connection(format!("No event port after {port}")))?,
        };

        let socket_addr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| SpmError::InvalidAddress(address.clone()))?;

        Ok(RemoteSpmClient {
            address,
            socket_addr,
            event_port,
            config: self.config,
            debug: self.debug,
            stream: None,
            pending: None,
            events: None,
            router: NotificationRouter::new(),
        })
    }
}

/// [`RemoteSpm`] implementation talking to a bridge process that hosts the
/// vendor library.
///
/// Commands go over the control port, one request and one response at a
/// time. Notifications arrive on the event port and are delivered by a
/// background reader thread.
pub struct RemoteSpmClient {
    address: String,
    socket_addr: SocketAddr,
    event_port: u16,
    config: ConnectionConfig,
    debug: bool,
    stream: Option<TcpStream>,
    pending: Option<PendingReply>,
    events: Option<EventStreamHandle>,
    router: NotificationRouter,
}

impl RemoteSpmClient {
    /// Build and connect with default timeouts
    pub fn new(addr: &str, port: u16) -> Result<Self, SpmError> {
        let mut client = Self::builder().address(addr).port(port).build()?;
        client.connect()?;
        Ok(client)
    }

    pub fn builder() -> RemoteSpmClientBuilder {
        RemoteSpmClientBuilder::default()
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Send a command and parse the response values
    fn quick_send(
        &mut self,
        command: &str,
        kind: CallKind,
        body: &[WireValue],
        body_types: &[&str],
        response_types: &[&str],
    ) -> Result<Vec<WireValue>, SpmError> {
        if body.len() != body_types.len() {
            return Err(SpmError::Protocol(format!(
                "Body length ({}) doesn't match body types length ({})",
                body.len(),
                body_types.len()
            )));
        }

        let response = self.send(command, body, body_types)?;
        let (values, error) = Protocol::parse_response(&response, response_types)?;
        if self.debug {
            debug!("{command} -> {values:?}");
        }

        if error.status != 0 {
            debug!("{command} failed with status {}: {}", error.status, error.message);
            let message = format!("{command}: {} (status {})", error.message, error.status);
            return Err(match kind {
                CallKind::Setup => SpmError::Configuration(message),
                CallKind::Exec => SpmError::Execution(message),
                CallKind::Query => SpmError::ServerError {
                    code: error.status,
                    message: error.message,
                },
            });
        }
        Ok(values)
    }

    fn send(
        &mut self,
        command: &str,
        body: &[WireValue],
        body_types: &[&str],
    ) -> Result<Vec<u8>, SpmError> {
        let debug_enabled = self.debug;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SpmError::Connection("Not connected".to_string()))?;

        let mut body_part = Vec::new();
        for (value, body_type) in body.iter().zip(body_types) {
            Protocol::serialize_value(value, body_type, &mut body_part)?;
        }

        let mut message = Protocol::create_command_header(command, body_part.len() as u32);
        message.extend_from_slice(&body_part);

        if debug_enabled {
            trace!("Send message: {message:?}");
        }

        // A late reply to a timed-out command would otherwise be taken for
        // the answer to this one
        if let Some(mut stale) = self.pending.take() {
            match stale.read_from(stream) {
                Ok(_) => debug!("Discarded late reply to {}", stale.command),
                Err(SpmError::Timeout) => {
                    self.pending = Some(stale);
                    return Err(SpmError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }

        stream.write_all(&message).map_err(|e| Self::transfer_error(e, command))?;
        stream.flush().map_err(|e| Self::transfer_error(e, command))?;

        let mut reply = PendingReply::new(command);
        match reply.read_from(stream) {
            Err(SpmError::Timeout) => {
                warn!("No reply to {command} within {:?}", self.config.read_timeout);
                self.pending = Some(reply);
                Err(SpmError::Timeout)
            }
            result => result,
        }
    }

    fn transfer_error(e: std::io::Error, command: &str) -> SpmError {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => SpmError::Timeout,
            _ => SpmError::Io {
                source: e,
                context: format!("Sending {command}"),
            },
        }
    }

    /// Send a command whose only answer is the server's bool verdict
    fn checked(
        &mut self,
        command: &str,
        kind: CallKind,
        body: &[WireValue],
        body_types: &[&str],
    ) -> Result<(), SpmError> {
        let accepted = self.bool_call(command, kind, body, body_types)?;
        if accepted {
            Ok(())
        } else {
            let message = format!("{command} rejected by server");
            Err(match kind {
                CallKind::Exec => SpmError::Execution(message),
                _ => SpmError::Configuration(message),
            })
        }
    }

    fn bool_call(
        &mut self,
        command: &str,
        kind: CallKind,
        body: &[WireValue],
        body_types: &[&str],
    ) -> Result<bool, SpmError> {
        let result = self.quick_send(command, kind, body, body_types, &["B"])?;
        match result.first() {
            Some(value) => value.as_bool(),
            None => Err(SpmError::Protocol(format!("{command} returned no verdict"))),
        }
    }

    fn f32_call(&mut self, command: &str, body: &[WireValue], body_types: &[&str]) -> Result<f32, SpmError> {
        let result = self.quick_send(command, CallKind::Query, body, body_types, &["f"])?;
        match result.first() {
            Some(value) => value.as_f32(),
            None => Err(SpmError::Protocol(format!("{command} returned no value"))),
        }
    }

    fn axis_value(axis: AxisId) -> Result<WireValue, SpmError> {
        let id = axis.as_str();
        if id.len() >= MAX_AXIS_ID_LEN {
            return Err(SpmError::Type(format!("Axis id too long: {id}")));
        }
        Ok(WireValue::String(id.to_string()))
    }

    fn endpoints(line: LineEndpoints) -> [WireValue; 4] {
        [
            WireValue::F32(line.x0),
            WireValue::F32(line.y0),
            WireValue::F32(line.x1),
            WireValue::F32(line.y1),
        ]
    }

    fn signal_values(signals: &[String]) -> WireValue {
        WireValue::ArrayString(signals.to_vec())
    }
}

impl RemoteSpm for RemoteSpmClient {
    fn connect(&mut self) -> Result<(), SpmError> {
        if self.stream.is_some() {
            return Ok(());
        }
        debug!("Connecting to SPM bridge at {}", self.socket_addr);

        let stream = TcpStream::connect_timeout(&self.socket_addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {}: {e}", self.socket_addr);
                if e.kind() == std::io::ErrorKind::TimedOut {
                    SpmError::Timeout
                } else {
                    SpmError::Connection(format!("{}: {e}", self.socket_addr))
                }
            })?;
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        self.stream = Some(stream);
        self.pending = None;

        let attached = self.bool_call("SPM.Connect", CallKind::Query, &[], &[])?;
        if !attached {
            self.stream = None;
            self.pending = None;
            return Err(SpmError::Connection(
                "Bridge could not attach to the SPM software".to_string(),
            ));
        }

        if !self.is_server_compatible()? {
            let server = self.server_interface_version()?;
            self.stream = None;
            self.pending = None;
            return Err(SpmError::Connection(format!(
                "Server interface version {server} is incompatible with client version {INTERFACE_VERSION}"
            )));
        }

        let events = EventStream::new(&self.address, self.event_port, self.config.connect_timeout)?;
        self.events = Some(events.spawn_background_reader(self.router.clone())?);

        info!("Connected to SPM bridge at {}", self.socket_addr);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SpmError> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = self.quick_send("SPM.Disconnect", CallKind::Query, &[], &[], &[]);
        self.stream = None;
        self.pending = None;
        if let Some(events) = self.events.take() {
            events.shutdown();
        }
        info!("Disconnected from SPM bridge");
        result.map(|_| ())
    }

    fn is_connected(&mut self) -> Result<bool, SpmError> {
        if self.stream.is_none() {
            return Ok(false);
        }
        self.bool_call("SPM.IsConnected", CallKind::Query, &[], &[])
    }

    fn server_interface_version(&mut self) -> Result<i32, SpmError> {
        let result = self.quick_send("SPM.ServerVersion", CallKind::Query, &[], &[], &["i"])?;
        match result.first() {
            Some(value) => value.as_i32(),
            None => Err(SpmError::Protocol("No server version returned".to_string())),
        }
    }

    fn is_server_compatible(&mut self) -> Result<bool, SpmError> {
        self.bool_call(
            "SPM.IsCompatible",
            CallKind::Query,
            &[WireValue::I32(INTERFACE_VERSION)],
            &["i"],
        )
    }

    fn register_notifications(
        &mut self,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Registration, SpmError> {
        let registration = self.router.install(sink);
        if let Err(e) = self.quick_send("Events.Register", CallKind::Setup, &[], &[], &[]) {
            self.router.remove(&registration);
            return Err(e);
        }
        Ok(registration)
    }

    fn unregister_notifications(&mut self, registration: Registration) -> Result<(), SpmError> {
        if !self.router.remove(&registration) {
            debug!("Registration {} was already replaced", registration.id());
            return Ok(());
        }
        self.quick_send("Events.Unregister", CallKind::Query, &[], &[], &[])?;
        Ok(())
    }

    fn axis_range(&mut self, axis: AxisId) -> Result<f32, SpmError> {
        self.f32_call("Axis.Range", &[Self::axis_value(axis)?], &["+*c"])
    }

    fn axis_position(&mut self, axis: AxisId) -> Result<f32, SpmError> {
        self.f32_call("Axis.Position", &[Self::axis_value(axis)?], &["+*c"])
    }

    fn axis_setpoint(&mut self, axis: AxisId) -> Result<f32, SpmError> {
        self.f32_call("Axis.Setpoint", &[Self::axis_value(axis)?], &["+*c"])
    }

    fn set_axis_position(
        &mut self,
        axis: AxisId,
        value_um: f32,
        sweep_time_s: f32,
    ) -> Result<(), SpmError> {
        self.checked(
            "Axis.SetPosition",
            CallKind::Exec,
            &[
                Self::axis_value(axis)?,
                WireValue::F32(value_um),
                WireValue::F32(sweep_time_s),
            ],
            &["+*c", "f", "f"],
        )
    }

    fn set_axes_positions(
        &mut self,
        targets: &[(AxisId, f32)],
        sweep_time_s: f32,
    ) -> Result<(), SpmError> {
        let axes = targets
            .iter()
            .map(|(axis, _)| axis.as_str().to_string())
            .collect();
        let values = targets.iter().map(|(_, v)| *v).collect();
        self.checked(
            "Axis.SetPositions",
            CallKind::Exec,
            &[
                WireValue::ArrayString(axes),
                WireValue::ArrayF32(values),
                WireValue::F32(sweep_time_s),
            ],
            &["+*s", "+*f", "f"],
        )
    }

    fn signals_list(&mut self) -> Result<Vec<SignalInfo>, SpmError> {
        let result =
            self.quick_send("Signals.List", CallKind::Query, &[], &[], &["+*s", "+*s"])?;
        let (names, units) = match (result.first(), result.get(1)) {
            (Some(names), Some(units)) => (names.as_string_array()?, units.as_string_array()?),
            _ => return Err(SpmError::Protocol("No signal list returned".to_string())),
        };
        if names.len() != units.len() {
            return Err(SpmError::Protocol(format!(
                "{} signal names but {} units",
                names.len(),
                units.len()
            )));
        }
        Ok(names
            .iter()
            .zip(units)
            .map(|(name, unit)| SignalInfo::new(name.clone(), unit.clone()))
            .collect())
    }

    fn setup_scan_common(
        &mut self,
        plane: PlaneId,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError> {
        self.checked(
            "Scan.SetupCommon",
            CallKind::Setup,
            &[
                WireValue::String(plane.as_str().to_string()),
                WireValue::I32(points_per_line as i32),
                WireValue::I32(motion.into()),
                Self::signal_values(signals),
            ],
            &["+*c", "i", "i", "+*s"],
        )
    }

    fn setup_scan_line(
        &mut self,
        line: LineEndpoints,
        timing: TraceTiming,
    ) -> Result<(), SpmError> {
        let [x0, y0, x1, y1] = Self::endpoints(line);
        self.checked(
            "Scan.SetupLine",
            CallKind::Setup,
            &[
                x0,
                y0,
                x1,
                y1,
                WireValue::F32(timing.forward_s),
                WireValue::F32(timing.back_s),
            ],
            &["f", "f", "f", "f", "f", "f"],
        )
    }

    fn exec_scan_point(&mut self) -> Result<SampleBuffer, SpmError> {
        let result = self.quick_send("Scan.ExecPoint", CallKind::Exec, &[], &[], &["B", "+*f"])?;
        match (result.first(), result.get(1)) {
            (Some(ok), Some(values)) => {
                if !ok.as_bool()? {
                    return Err(SpmError::Execution("Scan.ExecPoint failed".to_string()));
                }
                Ok(SampleBuffer::new(values.as_f32_array()?.to_vec()))
            }
            _ => Err(SpmError::Protocol("No point data returned".to_string())),
        }
    }

    fn exec_scan_line(&mut self, dwell_s: f32) -> Result<(), SpmError> {
        self.checked(
            "Scan.ExecLine",
            CallKind::Exec,
            &[WireValue::F32(dwell_s)],
            &["f"],
        )
    }

    fn finish_scan(&mut self) -> Result<(), SpmError> {
        self.quick_send("Scan.Finish", CallKind::Query, &[], &[], &[])?;
        Ok(())
    }

    fn set_triggering(&mut self, enable: bool) -> Result<(), SpmError> {
        self.quick_send(
            "Scan.SetTriggering",
            CallKind::Setup,
            &[WireValue::Bool(enable)],
            &["B"],
            &[],
        )?;
        Ok(())
    }

    fn setup_plane_scan(
        &mut self,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
    ) -> Result<(), SpmError> {
        self.checked(
            "Plane.Setup",
            CallKind::Setup,
            &[
                WireValue::I32(points_per_line as i32),
                WireValue::I32(motion.into()),
                Self::signal_values(signals),
            ],
            &["i", "i", "+*s"],
        )
    }

    fn set_plane_points(&mut self, points: &[SurfacePoint]) -> Result<(), SpmError> {
        let xs = points.iter().map(|p| p.x).collect();
        let ys = points.iter().map(|p| p.y).collect();
        let zs = points.iter().map(|p| p.z).collect();
        self.checked(
            "Plane.SetPoints",
            CallKind::Setup,
            &[
                WireValue::ArrayF32(xs),
                WireValue::ArrayF32(ys),
                WireValue::ArrayF32(zs),
            ],
            &["+*f", "+*f", "+*f"],
        )
    }

    fn set_plane_lift(&mut self, lift: LiftPair) -> Result<(), SpmError> {
        self.checked(
            "Plane.SetLift",
            CallKind::Setup,
            &[WireValue::F32(lift.lift_nm), WireValue::F32(lift.liftback_nm)],
            &["f", "f"],
        )
    }

    fn setup_two_pass_scan(
        &mut self,
        points_per_line: usize,
        motion: ScanMotion,
        signals: &[String],
        pass1_signals: usize,
    ) -> Result<(), SpmError> {
        self.checked(
            "TwoPass.Setup",
            CallKind::Setup,
            &[
                WireValue::I32(points_per_line as i32),
                WireValue::I32(motion.into()),
                Self::signal_values(signals),
                WireValue::I32(pass1_signals as i32),
            ],
            &["i", "i", "+*s", "i"],
        )
    }

    fn setup_two_pass_line(
        &mut self,
        line: LineEndpoints,
        timing: TwoPassTiming,
    ) -> Result<(), SpmError> {
        let [x0, y0, x1, y1] = Self::endpoints(line);
        self.checked(
            "TwoPass.SetupLine",
            CallKind::Setup,
            &[
                x0,
                y0,
                x1,
                y1,
                WireValue::F32(timing.pass1_s),
                WireValue::F32(timing.pass2_s),
                WireValue::F32(timing.pass2_back_s),
            ],
            &["f", "f", "f", "f", "f", "f", "f"],
        )
    }

    fn set_two_pass_lift(&mut self, lift: LiftPair) -> Result<(), SpmError> {
        self.checked(
            "TwoPass.SetLift",
            CallKind::Setup,
            &[WireValue::F32(lift.lift_nm), WireValue::F32(lift.liftback_nm)],
            &["f", "f"],
        )
    }

    fn set_two_pass_triggering(&mut self, pass1: bool, pass2: bool) -> Result<(), SpmError> {
        self.quick_send(
            "TwoPass.SetTriggering",
            CallKind::Setup,
            &[WireValue::Bool(pass1), WireValue::Bool(pass2)],
            &["B", "B"],
            &[],
        )?;
        Ok(())
    }

    fn probe_sweep_z(&mut self, sweep: &SweepParams) -> Result<bool, SpmError> {
        self.bool_call(
            "Probe.SweepZ",
            CallKind::Exec,
            &[
                WireValue::F32(sweep.from_nm),
                WireValue::F32(sweep.to_nm),
                WireValue::I32(sweep.points as i32),
                WireValue::F32(sweep.sweep_time_s),
                WireValue::F32(sweep.idle_speed_factor),
                Self::signal_values(&sweep.signals),
            ],
            &["f", "f", "i", "f", "f", "+*s"],
        )
    }

    fn break_probe_sweep_z(&mut self) -> Result<(), SpmError> {
        self.quick_send("Probe.BreakSweepZ", CallKind::Query, &[], &[], &[])?;
        Ok(())
    }

    fn probe_lift(&mut self, lift_nm: f32, trigger_time_s: f32) -> Result<bool, SpmError> {
        self.bool_call(
            "Probe.Lift",
            CallKind::Exec,
            &[WireValue::F32(lift_nm), WireValue::F32(trigger_time_s)],
            &["f", "f"],
        )
    }

    fn probe_land(&mut self) -> Result<bool, SpmError> {
        self.bool_call("Probe.Land", CallKind::Exec, &[], &[])
    }

    fn probe_land2(&mut self) -> Result<bool, SpmError> {
        self.bool_call("Probe.Land2", CallKind::Exec, &[], &[])
    }
}

impl Drop for RemoteSpmClient {
    fn drop(&mut self) {
        if self.stream.is_some() {
            if let Err(e) = self.disconnect() {
                debug!("Disconnect on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::protocol::COMMAND_SIZE;
    use std::net::TcpListener;
    use std::thread;

    /// Reply to each incoming command with `responses[i]` (body without error
    /// section) and the given error status
    fn fake_bridge(responses: Vec<(Vec<u8>, i32)>) -> (u16, thread::JoinHandle<Vec<String>>) {
        fake_bridge_delayed(
            responses
                .into_iter()
                .map(|(body, status)| (body, status, Duration::ZERO))
                .collect(),
        )
    }

    /// Like [`fake_bridge`], holding each reply back for the given delay
    fn fake_bridge_delayed(
        responses: Vec<(Vec<u8>, i32, Duration)>,
    ) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut commands = Vec::new();
            for (body, status, delay) in responses {
                let mut header = [0u8; HEADER_SIZE];
                socket.read_exact(&mut header).unwrap();
                let size = u32::from_be_bytes([header[32], header[33], header[34], header[35]]);
                let mut request = vec![0u8; size as usize];
                socket.read_exact(&mut request).unwrap();
                let command = String::from_utf8_lossy(&header[..COMMAND_SIZE])
                    .trim_end_matches('\0')
                    .to_string();

                thread::sleep(delay);
                let message: &[u8] = if status == 0 { b"" } else { b"rejected" };
                let mut reply = body;
                reply.extend_from_slice(&status.to_be_bytes());
                reply.extend_from_slice(&(message.len() as i32).to_be_bytes());
                reply.extend_from_slice(message);

                let mut response = Protocol::create_command_header(&command, reply.len() as u32);
                response.extend_from_slice(&reply);
                socket.write_all(&response).unwrap();
                commands.push(command);
            }
            commands
        });
        (port, handle)
    }

    fn connected_client(port: u16) -> RemoteSpmClient {
        let mut client = RemoteSpmClient::builder()
            .address("127.0.0.1")
            .port(port)
            .build()
            .unwrap();
        // Skip the handshake; commands only need the control socket
        client.stream = Some(TcpStream::connect(("127.0.0.1", port)).unwrap());
        client
    }

    #[test]
    fn test_builder_requires_address_and_port() {
        assert!(RemoteSpmClient::builder().port(1).build().is_err());
        assert!(RemoteSpmClient::builder().address("127.0.0.1").build().is_err());
        assert!(matches!(
            RemoteSpmClient::builder().address("not an ip").port(1).build(),
            Err(SpmError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_commands_without_connection_fail() {
        let mut client = RemoteSpmClient::builder()
            .address("127.0.0.1")
            .port(6601)
            .build()
            .unwrap();
        assert!(!client.is_connected().unwrap());
        assert!(matches!(client.finish_scan(), Err(SpmError::Connection(_))));
    }

    #[test]
    fn test_axis_range_round_trip() {
        let (port, bridge) = fake_bridge(vec![(100.0f32.to_be_bytes().to_vec(), 0)]);
        let mut client = connected_client(port);
        assert_eq!(client.axis_range(AxisId::X).unwrap(), 100.0);
        client.stream = None;
        assert_eq!(bridge.join().unwrap(), vec!["Axis.Range".to_string()]);
    }

    #[test]
    fn test_rejections_map_to_call_kind() {
        let (port, bridge) = fake_bridge(vec![
            (0u32.to_be_bytes().to_vec(), 0),
            (0u32.to_be_bytes().to_vec(), 5),
        ]);
        let mut client = connected_client(port);
        assert!(matches!(
            client.setup_scan_line(
                LineEndpoints { x0: 0.0, y0: 0.0, x1: 1.0, y1: 0.0 },
                TraceTiming::default()
            ),
            Err(SpmError::Configuration(_))
        ));
        assert!(matches!(
            client.exec_scan_line(0.01),
            Err(SpmError::Execution(_))
        ));
        client.stream = None;
        assert_eq!(
            bridge.join().unwrap(),
            vec!["Scan.SetupLine".to_string(), "Scan.ExecLine".to_string()]
        );
    }

    #[test]
    fn test_late_reply_is_drained_before_next_command() {
        let mut point = 1u32.to_be_bytes().to_vec();
        point.extend_from_slice(&1u32.to_be_bytes());
        point.extend_from_slice(&0.5f32.to_be_bytes());
        let (port, bridge) = fake_bridge_delayed(vec![
            (point, 0, Duration::from_millis(300)),
            (1u32.to_be_bytes().to_vec(), 0, Duration::ZERO),
            (Vec::new(), 0, Duration::ZERO),
        ]);
        let mut client = connected_client(port);
        client
            .stream
            .as_ref()
            .unwrap()
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let err = client.exec_scan_point().unwrap_err();
        assert!(matches!(err, SpmError::Timeout));
        assert!(err.is_retryable());

        // The retry re-arms the line and gets its own answer
        let line = LineEndpoints { x0: 0.0, y0: 0.0, x1: 1.0, y1: 0.0 };
        client.setup_scan_line(line, TraceTiming::default()).unwrap();
        assert!(client.pending.is_none());
        assert!(client.set_triggering(true).is_ok());

        client.stream = None;
        assert_eq!(
            bridge.join().unwrap(),
            vec![
                "Scan.ExecPoint".to_string(),
                "Scan.SetupLine".to_string(),
                "Scan.SetTriggering".to_string(),
            ]
        );
    }
}
