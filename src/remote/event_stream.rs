use crate::error::SpmError;
use crate::remote::protocol::{EventFrame, Protocol};
use crate::remote::NotificationRouter;
use crate::handoff::PostOutcome;
use crate::types::{SampleBuffer, ServerEvent};
use log::{debug, trace, warn};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

/// Notification stream from the bridge's event port.
///
/// The reader thread plays the part of the server's callback context: it
/// blocks inside the session sink while a sample buffer is being consumed and
/// only then acknowledges the frame, so the bridge cannot run ahead.
pub struct EventStream {
    stream: TcpStream,
}

/// Handle to a running reader thread
pub struct EventStreamHandle {
    control: TcpStream,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventStream {
    /// Connect to the notification port only
    pub fn new(addr: &str, event_port: u16, connect_timeout: Duration) -> Result<Self, SpmError> {
        let socket_addr: SocketAddr = format!("{addr}:{event_port}")
            .parse()
            .map_err(|_| SpmError::InvalidAddress(addr.to_string()))?;

        let stream =
            TcpStream::connect_timeout(&socket_addr, connect_timeout).map_err(|e| SpmError::Io {
                source: e,
                context: format!("Failed to connect to event stream at {socket_addr}"),
            })?;

        // Waits for notifications are unbounded
        stream.set_read_timeout(None).map_err(|e| SpmError::Io {
            source: e,
            context: "Clearing event stream read timeout".to_string(),
        })?;

        Ok(Self { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Spawn the background reader delivering into `router`.
    ///
    /// The thread exits when the socket is closed, either by the bridge or by
    /// [`EventStreamHandle::shutdown`].
    pub fn spawn_background_reader(
        self,
        router: NotificationRouter,
    ) -> Result<EventStreamHandle, SpmError> {
        let control = self.stream.try_clone().map_err(|e| SpmError::Io {
            source: e,
            context: "Cloning event stream handle".to_string(),
        })?;
        let mut stream = self.stream;

        let thread = thread::Builder::new()
            .name("spm-events".to_string())
            .spawn(move || {
                if let Err(e) = pump(&mut stream, &router) {
                    debug!("Event stream closed: {e}");
                }
            })
            .map_err(|e| SpmError::Io {
                source: e,
                context: "Spawning event reader thread".to_string(),
            })?;

        Ok(EventStreamHandle {
            control,
            thread: Some(thread),
        })
    }
}

impl EventStreamHandle {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            trace!("Event stream shutdown: {e}");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Event reader thread panicked");
            }
        }
    }
}

impl Drop for EventStreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read frames until the stream fails, dispatching each one
pub fn pump<S: Read + Write>(stream: &mut S, router: &NotificationRouter) -> Result<(), SpmError> {
    loop {
        match Protocol::read_event_frame(stream)? {
            EventFrame::Event(code) => router.dispatch_event(ServerEvent::from(code)),
            EventFrame::Restart => router.dispatch_restart(),
            EventFrame::Samples(values) => {
                trace!("Sample frame with {} values", values.len());
                let outcome = router.dispatch_samples(SampleBuffer::new(values));
                stream.write_all(&Protocol::ack_frame(outcome == PostOutcome::Consumed))?;
                stream.flush()?;
            }
        }
    }
}
