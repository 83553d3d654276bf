//! Per-driver observability handle.
//!
//! A driver owns exactly one [`Observability`] for its lifetime. It carries the
//! tracing span every protocol task runs under, the sinks that receive published
//! frames and driver events, and a few counters that are logged when the handle is
//! closed. Nothing here is global; two drivers in one process never share counters.

use crate::chunker::Frame;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, info_span, Span};

/// Notification raised by the protocol core.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// The protocol state machine moved between states.
    StateChange {
        /// Previous state
        from: String,
        /// New state
        to: String,
    },
    /// A transaction deadline elapsed.
    Timeout {
        /// What was awaited
        expected: String,
        /// What the receive path had seen instead
        observed: String,
    },
    /// The byte source closed or failed.
    ConnectionLost {
        /// Reader-side description of the failure
        reason: String,
    },
    /// The instrument rejected a command.
    MalformedResponse {
        /// Offending command
        command: String,
        /// Reported reason
        reason: String,
    },
    /// Raw instrument output received during a direct access session.
    DirectAccessData(Bytes),
}

/// Receives frames that no pending transaction consumed.
pub trait FrameSink: Send + Sync {
    /// Publishes one frame.
    fn publish(&self, frame: Frame);
}

/// Receives driver events.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn notify(&self, event: DriverEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn publish(&self, _frame: Frame) {}
}

impl EventSink for NullSink {
    fn notify(&self, _event: DriverEvent) {}
}

/// Sink that forwards frames and events over unbounded channels.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    frames: UnboundedSender<Frame>,
    events: UnboundedSender<DriverEvent>,
}

impl ChannelSink {
    /// Creates the sink plus the receiving ends for frames and events.
    pub fn new() -> (Self, UnboundedReceiver<Frame>, UnboundedReceiver<DriverEvent>) {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        (Self { frames, events }, frames_rx, events_rx)
    }
}

impl FrameSink for ChannelSink {
    fn publish(&self, frame: Frame) {
        // A dropped receiver only means nobody is listening any more
        let _ = self.frames.send(frame);
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Bytes read from the instrument
    pub bytes_received: u64,
    /// Frames handed to the frame sink
    pub frames_published: u64,
    /// Direct access echoes dropped
    pub echoes_suppressed: u64,
    /// Transaction timeouts
    pub timeouts: u64,
    /// Rejected responses
    pub malformed_responses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_received: AtomicU64,
    frames_published: AtomicU64,
    echoes_suppressed: AtomicU64,
    timeouts: AtomicU64,
    malformed_responses: AtomicU64,
}

/// Observability handle for one driver instance.
pub struct Observability {
    instrument: Arc<str>,
    span: Span,
    frames: Arc<dyn FrameSink>,
    events: Arc<dyn EventSink>,
    counters: Counters,
    closed: AtomicBool,
}

impl Observability {
    /// Creates the handle for `instrument`.
    pub fn new(
        instrument: impl Into<Arc<str>>,
        frames: Arc<dyn FrameSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let instrument = instrument.into();
        let span = info_span!("instrument", id = %instrument);
        debug!(parent: &span, "Observability handle created");
        Self {
            instrument,
            span,
            frames,
            events,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Handle whose sinks discard everything, for auxiliary connections.
    pub fn detached(instrument: impl Into<Arc<str>>) -> Self {
        Self::new(instrument, Arc::new(NullSink), Arc::new(NullSink))
    }

    /// Both sinks backed by one [`ChannelSink`].
    pub fn with_channel(instrument: impl Into<Arc<str>>, sink: ChannelSink) -> Self {
        let sink = Arc::new(sink);
        Self::new(instrument, sink.clone(), sink)
    }

    /// Instrument id.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Span protocol tasks should run under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Publishes a frame to the frame sink.
    pub fn publish_frame(&self, frame: Frame) {
        self.counters.frames_published.fetch_add(1, Ordering::Relaxed);
        self.frames.publish(frame);
    }

    /// Delivers an event to the event sink.
    pub fn notify(&self, event: DriverEvent) {
        match &event {
            DriverEvent::Timeout { .. } => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            DriverEvent::MalformedResponse { .. } => {
                self.counters.malformed_responses.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.events.notify(event);
    }

    /// Counts bytes read from the instrument.
    pub fn record_received(&self, bytes: usize) {
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts a suppressed direct access echo.
    pub fn record_echo_suppressed(&self) {
        self.counters.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            frames_published: self.counters.frames_published.load(Ordering::Relaxed),
            echoes_suppressed: self.counters.echoes_suppressed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            malformed_responses: self.counters.malformed_responses.load(Ordering::Relaxed),
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases the handle, logging final counters. Later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stats = self.snapshot();
        info!(
            parent: &self.span,
            bytes_received = stats.bytes_received,
            frames_published = stats.frames_published,
            echoes_suppressed = stats.echoes_suppressed,
            timeouts = stats.timeouts,
            malformed_responses = stats.malformed_responses,
            "Driver observability closed"
        );
    }
}

impl Drop for Observability {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Observability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observability")
            .field("instrument", &self.instrument)
            .field("counters", &self.snapshot())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::FrameKind;
    use chrono::Utc;
    use tracing_test::traced_test;

    fn frame() -> Frame {
        Frame {
            kind: FrameKind::Sample,
            label: "ctd_sample".into(),
            bytes: Bytes::from_static(b"#0A1B2C\r\n"),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn channel_sink_delivers_frames_and_events() {
        let (sink, mut frames, mut events) = ChannelSink::new();
        let obs = Observability::with_channel("sbe43", sink);

        obs.publish_frame(frame());
        obs.notify(DriverEvent::Timeout {
            expected: "prompt".into(),
            observed: "unknown".into(),
        });

        assert_eq!(&*frames.recv().await.unwrap().label, "ctd_sample");
        assert!(matches!(
            events.recv().await.unwrap(),
            DriverEvent::Timeout { .. }
        ));
        let stats = obs.snapshot();
        assert_eq!(stats.frames_published, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    fn counters_accumulate() {
        let obs = Observability::detached("adcp");
        obs.record_received(10);
        obs.record_received(5);
        obs.record_echo_suppressed();
        obs.notify(DriverEvent::MalformedResponse {
            command: "sampleinterval=-1".into(),
            reason: "out of range".into(),
        });
        let stats = obs.snapshot();
        assert_eq!(stats.bytes_received, 15);
        assert_eq!(stats.echoes_suppressed, 1);
        assert_eq!(stats.malformed_responses, 1);
    }

    #[test]
    #[traced_test]
    fn close_logs_once() {
        let obs = Observability::detached("flort");
        obs.close();
        obs.close();
        assert!(obs.is_closed());
        logs_assert(|lines: &[&str]| {
            let closed = lines
                .iter()
                .filter(|line| line.contains("Driver observability closed"))
                .count();
            if closed == 1 {
                Ok(())
            } else {
                Err(format!("expected one close log, saw {closed}"))
            }
        });
    }
}
