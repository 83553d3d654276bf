//! Receive path.
//!
//! One reader task per connection drains the byte stream, feeds the
//! [`FrameBuffer`], and routes every extracted frame. It is the only writer of
//! [`ReceiveState`]; callers waiting on a transaction only read it.
//!
//! ```text
//!   stream ──► Receiver::ingest ──► FrameBuffer ──► route(frame)
//!                     │                               │
//!                     │                 Sample ───────┼──► FrameSink
//!                     │                 Prompt/Response/Error
//!                     ▼                               ▼
//!               last_activity ──────────────► ReceiveState ──watch──► waiters
//! ```
//!
//! Waiters are woken through a `tokio::sync::watch` generation counter rather than
//! polling. The deadline they wait for is `last_activity + timeout`, recomputed on
//! every wake-up, so any received byte pushes it out.

use crate::direct_access::EchoFilter;
use bytes::Bytes;
use chrono::Utc;
use mi_core::chunker::{Frame, FrameBuffer, FrameKind};
use mi_core::observability::{DriverEvent, Observability};
use mi_core::{ProtocolError, ProtocolResult};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn, Instrument};

/// Lines kept while nobody is waiting for them.
const MAX_CAPTURED_LINES: usize = 512;

const READ_CHUNK: usize = 4096;

/// What the receive path has most recently seen from the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing recognized since the last reset
    Unknown,
    /// A prompt was observed
    Prompt,
    /// Sample frames are arriving
    CollectingData,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::Unknown => "unknown",
            LinkState::Prompt => "prompt",
            LinkState::CollectingData => "collecting data",
        };
        f.write_str(label)
    }
}

/// Per-exchange bookkeeping shared between the reader and waiters.
#[derive(Debug)]
pub struct Exchange {
    pub(crate) link: LinkState,
    /// Prompt observed since the last reset
    pub(crate) prompt: Option<String>,
    pub(crate) lines: Vec<String>,
    partial: String,
    /// Unframed text still held by the chunker
    tail: String,
    /// Response frames consumed by the pending transaction
    pub(crate) frames: Vec<Frame>,
    /// First error frame seen while a transaction was pending
    pub(crate) error: Option<Frame>,
    pub(crate) pending: Option<String>,
    pub(crate) last_activity: Instant,
    pub(crate) last_sample: Option<Instant>,
    pub(crate) latest_label: Option<String>,
    pub(crate) latest: Option<Frame>,
    pub(crate) closed: Option<String>,
    passthrough: Option<Arc<EchoFilter>>,
}

impl Exchange {
    fn new() -> Self {
        Self {
            link: LinkState::Unknown,
            prompt: None,
            lines: Vec::new(),
            partial: String::new(),
            tail: String::new(),
            frames: Vec::new(),
            error: None,
            pending: None,
            last_activity: Instant::now(),
            last_sample: None,
            latest_label: None,
            latest: None,
            closed: None,
            passthrough: None,
        }
    }

    /// Lines captured so far, including an unterminated trailing line.
    pub fn captured_lines(&self) -> Vec<String> {
        let mut lines = self.lines.clone();
        if !self.partial.trim().is_empty() {
            lines.push(self.partial.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Captured lines plus any unframed text, for diagnostics.
    fn diagnostic_lines(&self) -> Vec<String> {
        let mut lines = self.captured_lines();
        lines.extend(
            self.tail
                .lines()
                .map(|l| l.trim_end_matches('\r'))
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
        lines
    }

    fn capture_text(&mut self, bytes: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.partial.find('\n') {
            let line = self.partial[..pos].trim_end_matches('\r').to_string();
            self.partial.drain(..=pos);
            self.lines.push(line);
        }
        if self.lines.len() > MAX_CAPTURED_LINES {
            let excess = self.lines.len() - MAX_CAPTURED_LINES;
            self.lines.drain(..excess);
        }
    }

    fn flush_partial(&mut self) {
        if !self.partial.trim().is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.lines.push(line.trim_end_matches('\r').to_string());
        }
        self.partial.clear();
    }

    /// Updates the exchange with `frame`; returns it when it should be published.
    fn route(&mut self, frame: Frame, now: Instant) -> Option<Frame> {
        match frame.kind {
            FrameKind::Sample => {
                self.link = LinkState::CollectingData;
                self.last_sample = Some(now);
                if self.latest_label.as_deref() == Some(&*frame.label) {
                    self.latest = Some(frame.clone());
                }
                Some(frame)
            }
            FrameKind::Prompt => {
                self.flush_partial();
                self.link = LinkState::Prompt;
                self.prompt = Some(frame.text());
                None
            }
            FrameKind::Response => {
                self.capture_text(&frame.bytes);
                if self.pending.is_some() {
                    self.frames.push(frame);
                    None
                } else {
                    Some(frame)
                }
            }
            FrameKind::Error => {
                self.capture_text(&frame.bytes);
                if self.pending.is_some() {
                    if self.error.is_none() {
                        self.error = Some(frame);
                    }
                    None
                } else {
                    Some(frame)
                }
            }
        }
    }
}

/// State shared by the reader task and callers waiting on it.
#[derive(Debug)]
pub struct ReceiveState {
    inner: Mutex<Exchange>,
    changed: watch::Sender<u64>,
}

impl Default for ReceiveState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveState {
    /// Fresh state with no activity recorded.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Exchange::new()),
            changed,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Exchange> {
        self.inner.lock()
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Most recently observed link state.
    pub fn link_state(&self) -> LinkState {
        self.inner.lock().link
    }

    /// Time of the last received byte (or of the last reset).
    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Why the reader stopped, if it has.
    pub fn closed_reason(&self) -> Option<String> {
        self.inner.lock().closed.clone()
    }

    /// Whether a sample frame arrived within `window` of now.
    pub fn sampled_within(&self, window: Duration) -> bool {
        self.inner
            .lock()
            .last_sample
            .is_some_and(|t| t.elapsed() <= window)
    }

    /// Whether a sample frame arrived after `since`.
    pub fn sampled_since(&self, since: Instant) -> bool {
        self.inner.lock().last_sample.is_some_and(|t| t > since)
    }

    /// Lines captured in the current exchange.
    pub fn captured_lines(&self) -> Vec<String> {
        self.inner.lock().captured_lines()
    }

    /// Clears per-exchange bookkeeping so stale output cannot satisfy a new wait.
    pub(crate) fn reset_exchange(&self) {
        let mut ex = self.inner.lock();
        ex.link = LinkState::Unknown;
        ex.prompt = None;
        ex.lines.clear();
        ex.partial.clear();
        ex.tail.clear();
        ex.frames.clear();
        ex.error = None;
        ex.last_activity = Instant::now();
    }

    /// Marks a transaction as outstanding until the returned guard drops.
    pub(crate) fn begin_transaction(&self, command: &str) -> ProtocolResult<PendingGuard<'_>> {
        let mut ex = self.inner.lock();
        if let Some(existing) = &ex.pending {
            return Err(ProtocolError::TransactionInProgress(existing.clone()));
        }
        ex.pending = Some(command.to_string());
        Ok(PendingGuard { state: self })
    }

    /// Empties the latest-artifact slot and starts capturing frames labelled `label`.
    pub(crate) fn arm_latest(&self, label: &str) {
        let mut ex = self.inner.lock();
        ex.latest = None;
        ex.latest_label = Some(label.to_string());
    }

    pub(crate) fn set_passthrough(&self, filter: Option<Arc<EchoFilter>>) {
        self.inner.lock().passthrough = filter;
        self.bump();
    }

    pub(crate) fn mark_closed(&self, reason: String) {
        {
            let mut ex = self.inner.lock();
            if ex.closed.is_none() {
                ex.closed = Some(reason);
            }
        }
        self.bump();
    }

    /// Waits until `check` yields an outcome, the connection closes, or no byte has
    /// arrived for `timeout`.
    ///
    /// `check` runs under the lock each time the reader publishes progress.
    pub async fn wait_for<T, F>(&self, timeout: Duration, expected: &str, mut check: F) -> ProtocolResult<T>
    where
        F: FnMut(&mut Exchange) -> Option<ProtocolResult<T>>,
    {
        let mut changes = self.changed.subscribe();
        loop {
            let deadline = {
                let mut ex = self.inner.lock();
                if let Some(outcome) = check(&mut ex) {
                    return outcome;
                }
                if let Some(reason) = &ex.closed {
                    return Err(ProtocolError::ConnectionLost(reason.clone()));
                }
                let deadline = ex.last_activity + timeout;
                if Instant::now() >= deadline {
                    return Err(ProtocolError::Timeout {
                        expected: expected.to_string(),
                        observed: ex.link.to_string(),
                        timeout,
                        lines: ex.diagnostic_lines(),
                    });
                }
                deadline
            };

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(ProtocolError::ConnectionLost("receive state dropped".into()));
                    }
                }
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Waits, without a deadline, for a sample frame newer than `since`.
    pub async fn wait_for_sample_after(&self, since: Instant) -> ProtocolResult<()> {
        let mut changes = self.changed.subscribe();
        loop {
            {
                let ex = self.inner.lock();
                if ex.last_sample.is_some_and(|t| t > since) {
                    return Ok(());
                }
                if let Some(reason) = &ex.closed {
                    return Err(ProtocolError::ConnectionLost(reason.clone()));
                }
            }
            if changes.changed().await.is_err() {
                return Err(ProtocolError::ConnectionLost("receive state dropped".into()));
            }
        }
    }
}

/// Clears the pending transaction (and any latest-artifact request) on drop.
#[derive(Debug)]
pub(crate) struct PendingGuard<'a> {
    state: &'a ReceiveState,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut ex = self.state.inner.lock();
        ex.pending = None;
        ex.latest_label = None;
    }
}

/// Reader side of a connection.
#[derive(Debug)]
pub struct Receiver {
    state: Arc<ReceiveState>,
    chunker: FrameBuffer,
    obs: Arc<Observability>,
    passthrough_active: bool,
}

impl Receiver {
    /// Receiver feeding `state` through `chunker`.
    pub fn new(state: Arc<ReceiveState>, chunker: FrameBuffer, obs: Arc<Observability>) -> Self {
        Self {
            state,
            chunker,
            obs,
            passthrough_active: false,
        }
    }

    /// Processes one read's worth of bytes.
    pub fn ingest(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let now = Instant::now();
        self.obs.record_received(data.len());

        let passthrough = {
            let mut ex = self.state.lock();
            ex.last_activity = now;
            ex.passthrough.clone()
        };

        if let Some(filter) = passthrough {
            if !self.passthrough_active {
                self.chunker.clear();
                self.passthrough_active = true;
            }
            let forwarded = match filter.strip_echo(data) {
                Some(rest) => {
                    trace!(echo = data.len() - rest.len(), "Suppressed direct access echo");
                    self.obs.record_echo_suppressed();
                    rest
                }
                None => data,
            };
            if !forwarded.is_empty() {
                self.obs
                    .notify(DriverEvent::DirectAccessData(Bytes::copy_from_slice(forwarded)));
            }
            self.state.bump();
            return;
        }
        if self.passthrough_active {
            self.chunker.clear();
            self.passthrough_active = false;
        }

        self.chunker.add_data(data, Utc::now());
        let mut published = Vec::new();
        {
            let mut ex = self.state.lock();
            loop {
                if let Some((noise, _)) = self.chunker.get_next_non_data() {
                    ex.capture_text(&noise);
                    continue;
                }
                let Some((frame, _)) = self.chunker.get_next_data() else {
                    break;
                };
                trace!(kind = %frame.kind, label = %frame.label, bytes = frame.bytes.len(), "Frame");
                if let Some(frame) = ex.route(frame, now) {
                    published.push(frame);
                }
            }
            ex.tail = String::from_utf8_lossy(self.chunker.pending()).into_owned();
        }
        for frame in published {
            self.obs.publish_frame(frame);
        }
        self.state.bump();
    }

    /// Drains `reader` until end of stream or an I/O error.
    pub async fn run<R: AsyncRead + Unpin>(mut self, mut reader: R) {
        let mut buf = vec![0u8; READ_CHUNK];
        let reason = loop {
            match reader.read(&mut buf).await {
                Ok(0) => break "end of stream".to_string(),
                Ok(n) => self.ingest(&buf[..n]),
                Err(e) => break format!("read failed: {e}"),
            }
        };
        warn!(reason = %reason, "Instrument connection lost");
        self.state.mark_closed(reason.clone());
        self.obs.notify(DriverEvent::ConnectionLost { reason });
    }

    /// Spawns [`run`](Self::run) under the driver span.
    pub fn spawn<R>(self, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let span = self.obs.span().clone();
        debug!(parent: &span, "Starting reader task");
        tokio::spawn(self.run(reader).instrument(span))
    }
}
