//! Single-slot blocking handoff between the server's callback context and the
//! control thread.
//!
//! The callback context calls [`HandoffChannel::post`] and stays blocked until
//! the control thread has both taken the buffer ([`HandoffChannel::acquire`])
//! and given it back ([`HandoffChannel::release`]). At most one buffer is ever
//! in transit, so buffers are consumed strictly in post order and the poster
//! can never overwrite data that is still being read.
//!
//! Restart notifications travel beside the slot as a sticky flag: they wake a
//! waiting consumer, coalesce when several arrive before the consumer looks,
//! and are never lost while the channel is open.
//!
//! Closing the channel turns every further post into an immediate discard.
//! The consumer closes the channel in the same step as its final release,
//! before it issues a terminal call, so no post can be left blocked while the
//! server processes that call.

use crossbeam_channel::Sender;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::SpmError;
use crate::remote::NotificationSink;
use crate::types::{SampleBuffer, ServerEvent};

/// State of the single transfer slot
#[derive(Debug)]
enum Slot {
    Empty,
    Filled(SampleBuffer),
    /// Buffer handed to the consumer and not yet released
    InFlight { terminator: bool },
}

#[derive(Debug)]
struct Inner {
    slot: Slot,
    /// Tickets handed out to posters
    posted: u64,
    /// Tickets whose buffer was released by the consumer
    released: u64,
    restart_pending: bool,
    closed: bool,
}

/// How a post ended, seen from the callback context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// The consumer took and released the buffer
    Consumed,
    /// The channel was closed; the buffer was dropped without blocking
    Discarded,
}

/// What the consumer woke up for
#[derive(Debug, PartialEq)]
pub enum Handoff {
    Samples(SampleBuffer),
    Restart,
    Closed,
}

#[derive(Debug)]
pub struct HandoffChannel {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for HandoffChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::Empty,
                posted: 0,
                released: 0,
                restart_pending: false,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Hand one buffer to the consumer and block until it was released.
    ///
    /// Called from the callback context only. Waits first for the previous
    /// buffer to be consumed, then for this one.
    pub fn post(&self, buffer: SampleBuffer) -> PostOutcome {
        let mut inner = self.inner.lock();

        while !inner.closed && !matches!(inner.slot, Slot::Empty) {
            self.changed.wait(&mut inner);
        }
        if inner.closed {
            trace!("Dropping {} values posted to closed channel", buffer.len());
            return PostOutcome::Discarded;
        }

        inner.posted += 1;
        let ticket = inner.posted;
        trace!("Posting ticket {ticket} ({} values)", buffer.len());
        inner.slot = Slot::Filled(buffer);
        self.changed.notify_all();

        while !inner.closed && inner.released < ticket {
            self.changed.wait(&mut inner);
        }

        if inner.released >= ticket {
            PostOutcome::Consumed
        } else {
            // Closed before the consumer took it
            if matches!(inner.slot, Slot::Filled(_)) {
                inner.slot = Slot::Empty;
            }
            PostOutcome::Discarded
        }
    }

    /// Record a restart request and wake the consumer.
    ///
    /// Returns `false` when the request coalesced with one already pending or
    /// the channel is closed.
    pub fn notify_restart(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            debug!("Ignoring restart notification on closed channel");
            return false;
        }
        let fresh = !inner.restart_pending;
        inner.restart_pending = true;
        self.changed.notify_all();
        fresh
    }

    /// Take the pending restart request, if any
    pub fn take_restart(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.restart_pending, false)
    }

    /// Block until a buffer is posted, a restart is pending, or the channel
    /// is closed. A posted buffer is returned before a pending restart.
    pub fn acquire(&self) -> Result<Handoff, SpmError> {
        self.acquire_inner(None)
    }

    /// Like [`acquire`](Self::acquire), logging a warning every `interval`
    /// without progress. The wait itself stays unbounded.
    pub fn acquire_with_diagnostics(&self, interval: Duration) -> Result<Handoff, SpmError> {
        self.acquire_inner(Some(interval))
    }

    fn acquire_inner(&self, interval: Option<Duration>) -> Result<Handoff, SpmError> {
        let started = Instant::now();
        let mut inner = self.inner.lock();

        if let Slot::InFlight { .. } = inner.slot {
            return Err(SpmError::Precondition(
                "acquire called while the previous buffer is still held".to_string(),
            ));
        }

        loop {
            if let Slot::Filled(_) = inner.slot {
                let taken = std::mem::replace(&mut inner.slot, Slot::Empty);
                if let Slot::Filled(buffer) = taken {
                    inner.slot = Slot::InFlight {
                        terminator: buffer.is_terminator(),
                    };
                    return Ok(Handoff::Samples(buffer));
                }
            }
            if inner.restart_pending {
                return Ok(Handoff::Restart);
            }
            if inner.closed {
                return Ok(Handoff::Closed);
            }

            match interval {
                Some(interval) => {
                    if self.changed.wait_for(&mut inner, interval).timed_out() {
                        warn!(
                            "No data from server for {:.1}s, still waiting",
                            started.elapsed().as_secs_f32()
                        );
                    }
                }
                None => self.changed.wait(&mut inner),
            }
        }
    }

    /// Give the held buffer back, unblocking its poster
    pub fn release(&self) -> Result<(), SpmError> {
        let mut inner = self.inner.lock();
        Self::release_locked(&mut inner)?;
        self.changed.notify_all();
        Ok(())
    }

    /// Release the held buffer (if any) and close the channel in one step.
    ///
    /// After this returns no poster is blocked and every later post is
    /// discarded immediately, so a terminal call can be issued safely.
    pub fn release_and_close(&self) {
        let mut inner = self.inner.lock();
        if let Slot::InFlight { .. } = inner.slot {
            // Cannot fail: the slot is in flight
            let _ = Self::release_locked(&mut inner);
        }
        inner.closed = true;
        inner.restart_pending = false;
        self.changed.notify_all();
    }

    fn release_locked(inner: &mut Inner) -> Result<(), SpmError> {
        match inner.slot {
            Slot::InFlight { .. } => {
                inner.slot = Slot::Empty;
                inner.released += 1;
                trace!("Released ticket {}", inner.released);
                Ok(())
            }
            _ => Err(SpmError::Precondition(
                "release called without a held buffer".to_string(),
            )),
        }
    }

    /// `true` while the consumer holds a non-terminator buffer
    pub fn holds_samples(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::InFlight { terminator: false })
    }

    /// `true` while a poster is parked on an unconsumed buffer
    pub fn has_pending_post(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Filled(_))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Per-session notification handler registered with the remote endpoint.
///
/// Sample notifications go through the handoff slot, restart notifications
/// set the slot's restart flag, generic events are forwarded to the control
/// side over a channel.
#[derive(Debug)]
pub struct SessionSink {
    handoff: HandoffChannel,
    events: Sender<ServerEvent>,
}

impl SessionSink {
    pub fn new(events: Sender<ServerEvent>) -> Self {
        Self {
            handoff: HandoffChannel::new(),
            events,
        }
    }

    pub fn handoff(&self) -> &HandoffChannel {
        &self.handoff
    }
}

impl NotificationSink for SessionSink {
    fn on_event(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("Event {event:?} dropped, no listener");
        }
    }

    fn on_samples(&self, samples: SampleBuffer) -> PostOutcome {
        self.handoff.post(samples)
    }

    fn on_restart_line(&self) {
        if !self.handoff.notify_restart() {
            debug!("Restart notification coalesced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn spawn_poster(
        channel: Arc<HandoffChannel>,
        buffers: Vec<SampleBuffer>,
    ) -> thread::JoinHandle<Vec<(PostOutcome, Instant)>> {
        thread::spawn(move || {
            buffers
                .into_iter()
                .map(|b| {
                    let outcome = channel.post(b);
                    (outcome, Instant::now())
                })
                .collect()
        })
    }

    #[test]
    fn test_buffers_consumed_in_post_order() {
        let channel = Arc::new(HandoffChannel::new());
        let buffers = vec![
            SampleBuffer::new(vec![1.0, 1.5]),
            SampleBuffer::new(vec![2.0, 2.5]),
            SampleBuffer::new(vec![3.0, 3.5]),
            SampleBuffer::terminator(),
        ];
        let poster = spawn_poster(channel.clone(), buffers.clone());

        let mut received = Vec::new();
        let mut completions = 0;
        loop {
            match channel.acquire().unwrap() {
                Handoff::Samples(buffer) => {
                    let done = buffer.is_terminator();
                    received.push(buffer);
                    channel.release().unwrap();
                    if done {
                        completions += 1;
                        break;
                    }
                }
                other => panic!("unexpected handoff {other:?}"),
            }
        }

        assert_eq!(received, buffers);
        assert_eq!(completions, 1);
        let outcomes = poster.join().unwrap();
        assert!(outcomes.iter().all(|(o, _)| *o == PostOutcome::Consumed));
    }

    #[test]
    fn test_post_blocks_until_release() {
        let channel = Arc::new(HandoffChannel::new());
        let poster = spawn_poster(
            channel.clone(),
            vec![SampleBuffer::new(vec![1.0]), SampleBuffer::new(vec![2.0])],
        );

        let Handoff::Samples(first) = channel.acquire().unwrap() else {
            panic!("expected samples");
        };
        assert_eq!(first.values(), &[1.0]);
        thread::sleep(Duration::from_millis(50));
        // Second buffer cannot be visible while the first is held
        assert!(!channel.has_pending_post());
        let released_at = Instant::now();
        channel.release().unwrap();

        let Handoff::Samples(second) = channel.acquire().unwrap() else {
            panic!("expected samples");
        };
        assert_eq!(second.values(), &[2.0]);
        channel.release().unwrap();

        let outcomes = poster.join().unwrap();
        assert!(outcomes[0].1 >= released_at);
        assert!(outcomes[1].1 >= outcomes[0].1);
    }

    #[test]
    fn test_release_and_close_unblocks_poster_and_discards_later_posts() {
        let channel = Arc::new(HandoffChannel::new());
        let poster = spawn_poster(
            channel.clone(),
            vec![SampleBuffer::new(vec![1.0]), SampleBuffer::new(vec![2.0])],
        );

        let Handoff::Samples(_) = channel.acquire().unwrap() else {
            panic!("expected samples");
        };
        channel.release_and_close();

        let outcomes = poster.join().unwrap();
        assert_eq!(outcomes[0].0, PostOutcome::Consumed);
        assert_eq!(outcomes[1].0, PostOutcome::Discarded);
        assert_eq!(channel.acquire().unwrap(), Handoff::Closed);
    }

    #[test]
    fn test_restart_coalesces_and_wakes_consumer() {
        let channel = Arc::new(HandoffChannel::new());
        assert!(channel.notify_restart());
        assert!(!channel.notify_restart());
        assert_eq!(channel.acquire().unwrap(), Handoff::Restart);
        assert!(channel.take_restart());
        assert!(!channel.take_restart());

        let notifier = {
            let channel = channel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                channel.notify_restart();
            })
        };
        assert_eq!(channel.acquire().unwrap(), Handoff::Restart);
        notifier.join().unwrap();
    }

    #[test]
    fn test_restart_during_in_flight_handoff_is_kept() {
        let channel = Arc::new(HandoffChannel::new());
        let poster = spawn_poster(channel.clone(), vec![SampleBuffer::new(vec![4.0])]);

        let Handoff::Samples(_) = channel.acquire().unwrap() else {
            panic!("expected samples");
        };
        assert!(channel.holds_samples());
        channel.notify_restart();
        channel.release().unwrap();
        poster.join().unwrap();

        assert!(channel.take_restart());
    }

    #[test]
    fn test_release_without_held_buffer_is_rejected() {
        let channel = HandoffChannel::new();
        assert!(matches!(channel.release(), Err(SpmError::Precondition(_))));
    }

    #[test]
    fn test_diagnostic_wait_keeps_waiting() {
        let channel = Arc::new(HandoffChannel::new());
        let poster = {
            let channel = channel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                channel.post(SampleBuffer::terminator())
            })
        };
        let handoff = channel
            .acquire_with_diagnostics(Duration::from_millis(10))
            .unwrap();
        assert_eq!(handoff, Handoff::Samples(SampleBuffer::terminator()));
        channel.release().unwrap();
        assert_eq!(poster.join().unwrap(), PostOutcome::Consumed);
    }

    #[test]
    fn test_session_sink_forwards_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = SessionSink::new(tx);
        sink.on_event(ServerEvent::from(2));
        sink.on_restart_line();
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::SecondaryScannerMoved);
        assert!(sink.handoff().take_restart());
    }
}
