//! Command/response transactions.
//!
//! [`TransactionEngine`] owns the write half of the instrument connection and the
//! reader task feeding [`ReceiveState`]. A transaction is: wait the configured
//! pre-send delay, reset the exchange bookkeeping, write the command, then wait
//! for an [`Expect`] outcome. The wait deadline slides with received activity, so
//! a slow instrument that keeps talking is never cut off mid-response.
//!
//! Only one transaction may be outstanding per connection; a second concurrent
//! caller gets [`ProtocolError::TransactionInProgress`].

use crate::config::ProtocolConfig;
use crate::receiver::{Exchange, ReceiveState, Receiver};
use mi_core::chunker::{Frame, FrameBuffer};
use mi_core::error_recovery::{retry, RetryPolicy};
use mi_core::observability::{DriverEvent, Observability};
use mi_core::serial::DynStream;
use mi_core::{ProtocolError, ProtocolResult};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Outcome a transaction waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Any recognized prompt
    AnyPrompt,
    /// A prompt with exactly this text
    Prompt(String),
    /// A response frame with this label
    Frame(String),
}

impl Expect {
    fn is_met(&self, ex: &Exchange) -> bool {
        match self {
            Expect::AnyPrompt => ex.prompt.is_some(),
            Expect::Prompt(text) => ex.prompt.as_deref().map(str::trim) == Some(text.trim()),
            Expect::Frame(label) => ex.frames.iter().any(|f| &*f.label == label.as_str()),
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::AnyPrompt => f.write_str("any prompt"),
            Expect::Prompt(text) => write!(f, "prompt '{text}'"),
            Expect::Frame(label) => write!(f, "frame '{label}'"),
        }
    }
}

/// Per-connection transaction settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Appended to every command
    pub newline: String,
    /// Quiet time before each command
    pub pre_send_delay: Duration,
    /// Command used to elicit a prompt
    pub wakeup: String,
    /// Marks an in-band error inside otherwise normal output
    pub error_tag: Option<Regex>,
    /// Pattern the reply to a given command must match
    pub responses: HashMap<String, Regex>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            newline: "\r\n".to_string(),
            pre_send_delay: Duration::ZERO,
            wakeup: String::new(),
            error_tag: None,
            responses: HashMap::new(),
        }
    }
}

impl EngineSettings {
    /// Settings from the `[instrument]`, `[timing]`, `[commands]` and `[errors]` sections.
    pub fn from_config(config: &ProtocolConfig) -> ProtocolResult<Self> {
        Ok(Self {
            newline: config.instrument.newline.clone(),
            pre_send_delay: config.timing.pre_send_delay(),
            wakeup: config.commands.wakeup.clone(),
            error_tag: config.error_tag()?,
            responses: config.response_rules()?,
        })
    }
}

/// Sends commands and waits for their outcome.
pub struct TransactionEngine {
    writer: Mutex<Writer>,
    state: Arc<ReceiveState>,
    obs: Arc<Observability>,
    settings: EngineSettings,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("instrument", &self.obs.instrument())
            .field("settings", &self.settings)
            .field("link", &self.state.link_state())
            .finish_non_exhaustive()
    }
}

impl TransactionEngine {
    /// Splits `stream` and starts the reader task.
    pub fn spawn(
        stream: DynStream,
        chunker: FrameBuffer,
        settings: EngineSettings,
        obs: Arc<Observability>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let state = Arc::new(ReceiveState::new());
        let reader = Receiver::new(state.clone(), chunker, obs.clone()).spawn(read_half);
        Self {
            writer: Mutex::new(Box::new(write_half)),
            state,
            obs,
            settings,
            reader: parking_lot::Mutex::new(Some(reader)),
        }
    }

    /// Shared receive state.
    pub fn receive_state(&self) -> &Arc<ReceiveState> {
        &self.state
    }

    /// Settings in effect.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Observability handle.
    pub fn observability(&self) -> &Arc<Observability> {
        &self.obs
    }

    fn ensure_open(&self) -> ProtocolResult<()> {
        match self.state.closed_reason() {
            Some(reason) => Err(ProtocolError::ConnectionLost(reason)),
            None => Ok(()),
        }
    }

    async fn write(&self, data: &[u8]) -> ProtocolResult<()> {
        let mut writer = self.writer.lock().await;
        let outcome = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;
        outcome.map_err(|e| {
            warn!(error = %e, "Write to instrument failed");
            ProtocolError::ConnectionLost(format!("write failed: {e}"))
        })
    }

    /// Writes `command` plus the newline after the pre-send delay.
    ///
    /// Exchange bookkeeping is reset immediately before the write, so nothing
    /// received earlier can satisfy a later wait.
    pub async fn send(&self, command: &str) -> ProtocolResult<()> {
        self.ensure_open()?;
        if !self.settings.pre_send_delay.is_zero() {
            tokio::time::sleep(self.settings.pre_send_delay).await;
        }
        self.state.reset_exchange();
        let command = command.trim_end();
        debug!(command, "Sending command");
        let line = format!("{command}{}", self.settings.newline);
        self.write(line.as_bytes()).await
    }

    /// Writes `data` verbatim with no delay, newline or bookkeeping.
    pub async fn send_raw(&self, data: &[u8]) -> ProtocolResult<usize> {
        self.ensure_open()?;
        self.write(data).await?;
        Ok(data.len())
    }

    /// Sends `command` and waits for `expect`; returns the captured lines.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Timeout`] when nothing arrives for `timeout`
    /// - [`ProtocolError::MalformedResponse`] on an error frame or error tag
    /// - [`ProtocolError::TransactionInProgress`] if another transaction is pending
    /// - [`ProtocolError::ConnectionLost`] if the reader stops
    pub async fn send_and_expect(
        &self,
        command: &str,
        expect: &Expect,
        timeout: Duration,
    ) -> ProtocolResult<Vec<String>> {
        let _pending = self.state.begin_transaction(command)?;
        self.send(command).await?;

        let waited = self
            .state
            .wait_for(timeout, &expect.to_string(), |ex| {
                if let Some(frame) = ex.error.take() {
                    return Some(Err(self.malformed(command, &frame.text())));
                }
                expect.is_met(ex).then(|| Ok(ex.captured_lines()))
            })
            .await;

        let lines = match waited {
            Ok(lines) => lines,
            Err(e) => return Err(self.report(e)),
        };
        if let Some(err) = self.check_error_tag(command, &lines) {
            return Err(self.report(err));
        }
        if let Some(rule) = self.settings.responses.get(command.trim()) {
            let joined = lines.join("\n");
            if !rule.is_match(&joined) {
                let reason = format!("reply does not match '{}'", rule.as_str());
                return Err(self.reject(command, reason, joined));
            }
        }
        Ok(lines)
    }

    /// Sends `command` and waits for any prompt.
    pub async fn send_and_expect_prompt(&self, command: &str, timeout: Duration) -> ProtocolResult<Vec<String>> {
        self.send_and_expect(command, &Expect::AnyPrompt, timeout).await
    }

    /// Sends the wake-up command until a prompt appears.
    ///
    /// Each attempt waits `timeout`. If every attempt times out, the last timeout
    /// is returned with its captured lines.
    pub async fn discover_state(&self, max_attempts: u32, timeout: Duration) -> ProtocolResult<Vec<String>> {
        let policy = RetryPolicy::attempts_only(max_attempts);
        let wakeup = self.settings.wakeup.as_str();
        retry(&policy, |attempt| {
            debug!(attempt, "Wake-up probe");
            self.send_and_expect_prompt(wakeup, timeout)
        })
        .await
    }

    /// Sends `command` and waits for a fresh sample frame labelled `label`.
    ///
    /// The latest-artifact slot is emptied before the send; if several matching
    /// frames arrive, the newest one observed when the waiter wakes is returned.
    pub async fn request_latest(&self, command: &str, label: &str, timeout: Duration) -> ProtocolResult<Frame> {
        let _pending = self.state.begin_transaction(command)?;
        self.state.arm_latest(label);
        self.send(command).await?;

        self.state
            .wait_for(timeout, &format!("frame '{label}'"), |ex| ex.latest.take().map(Ok))
            .await
            .map_err(|e| self.report(e))
    }

    fn malformed(&self, command: &str, response: &str) -> ProtocolError {
        let reason = self
            .settings
            .error_tag
            .as_ref()
            .and_then(|tag| tag.captures(response))
            .and_then(|caps| caps.name("msg").or_else(|| caps.get(0)))
            .map_or_else(|| response.trim().to_string(), |m| m.as_str().to_string());
        ProtocolError::MalformedResponse {
            command: command.to_string(),
            reason,
            response: response.to_string(),
        }
    }

    /// Fails `command` with [`ProtocolError::MalformedResponse`] and reports it.
    ///
    /// For checks made above the engine, such as a set whose echoed value differs.
    pub fn reject(&self, command: &str, reason: impl Into<String>, response: impl Into<String>) -> ProtocolError {
        self.report(ProtocolError::MalformedResponse {
            command: command.to_string(),
            reason: reason.into(),
            response: response.into(),
        })
    }

    fn check_error_tag(&self, command: &str, lines: &[String]) -> Option<ProtocolError> {
        let tag = self.settings.error_tag.as_ref()?;
        let joined = lines.join("\n");
        tag.is_match(&joined).then(|| self.malformed(command, &joined))
    }

    /// Emits the driver event for `err` and hands it back.
    fn report(&self, err: ProtocolError) -> ProtocolError {
        match &err {
            ProtocolError::Timeout { expected, observed, .. } => {
                warn!(expected = %expected, observed = %observed, "Transaction timed out");
                self.obs.notify(DriverEvent::Timeout {
                    expected: expected.clone(),
                    observed: observed.clone(),
                });
            }
            ProtocolError::MalformedResponse { command, reason, .. } => {
                warn!(command = %command, reason = %reason, "Instrument reported an error");
                self.obs.notify(DriverEvent::MalformedResponse {
                    command: command.clone(),
                    reason: reason.clone(),
                });
            }
            _ => {}
        }
        err
    }

    /// Stops the reader task and shuts down the write half.
    pub async fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Writer shutdown failed");
        }
    }
}

impl Drop for TransactionEngine {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::{self, MockDeviceHarness};
    use mi_core::chunker::{FrameKind, Recognizer};
    use mi_core::observability::ChannelSink;
    use mi_core::DriverEvent;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    const WAIT: Duration = Duration::from_millis(500);

    fn engine(pre_send_delay: Duration) -> (TransactionEngine, MockDeviceHarness, UnboundedReceiver<DriverEvent>) {
        engine_with(HashMap::new(), pre_send_delay)
    }

    fn engine_with(
        responses: HashMap<String, Regex>,
        pre_send_delay: Duration,
    ) -> (TransactionEngine, MockDeviceHarness, UnboundedReceiver<DriverEvent>) {
        let (port, harness) = mock_serial::new();
        let recognizers = vec![
            Recognizer::regex(FrameKind::Sample, "ctd_sample", r"#(?:[0-9A-F]{6}){3}(?:[0-9A-F]{4}){2}\r\n").unwrap(),
            Recognizer::delimited(FrameKind::Response, "status", "<StatusData", "</StatusData>\r\n").unwrap(),
            Recognizer::literal(FrameKind::Prompt, "prompt", "S>"),
        ];
        let settings = EngineSettings {
            pre_send_delay,
            wakeup: String::new(),
            error_tag: Some(Regex::new(r"<ERROR type='(?P<kind>[^']*)' msg='(?P<msg>[^']*)'\s*/>").unwrap()),
            responses,
            ..EngineSettings::default()
        };
        let (sink, _frames, events) = ChannelSink::new();
        let obs = Arc::new(Observability::with_channel("sbe43", sink));
        let engine = TransactionEngine::spawn(Box::new(port), FrameBuffer::new(recognizers), settings, obs);
        (engine, harness, events)
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_completes_transaction() {
        let (engine, mut harness, _events) = engine(Duration::ZERO);
        let instrument = async {
            harness.expect_write(b"ds\r\n").await;
            harness.send_response(b"SBE 43 V 1.0\r\nvbatt = 13.2\r\nS>").unwrap();
        };
        let (lines, ()) = tokio::join!(engine.send_and_expect_prompt("ds", WAIT), instrument);
        assert_eq!(lines.unwrap(), vec!["SBE 43 V 1.0", "vbatt = 13.2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_send_delay_precedes_write() {
        let (engine, mut harness, _events) = engine(Duration::from_millis(200));
        let start = Instant::now();
        let instrument = async {
            harness.expect_write(b"ts\r\n").await;
            let written = start.elapsed();
            harness.send_response(b"S>").unwrap();
            written
        };
        let (lines, written) = tokio::join!(engine.send_and_expect_prompt("ts", WAIT), instrument);
        lines.unwrap();
        assert!(written >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_prompt_does_not_satisfy_new_wait() {
        let (engine, mut harness, _events) = engine(Duration::from_millis(50));
        harness.send_response(b"S>").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = tokio::join!(engine.send_and_expect_prompt("ds", WAIT), harness.expect_write(b"ds\r\n"))
            .0
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_instrument_times_out_and_notifies() {
        let (engine, mut harness, mut events) = engine(Duration::ZERO);
        let start = Instant::now();
        let (result, ()) = tokio::join!(engine.send_and_expect_prompt("ds", WAIT), harness.expect_write(b"ds\r\n"));
        let elapsed = start.elapsed();
        assert!(elapsed >= WAIT && elapsed < WAIT + Duration::from_millis(10), "{elapsed:?}");
        match result.unwrap_err() {
            ProtocolError::Timeout { expected, observed, .. } => {
                assert_eq!(expected, "any prompt");
                assert_eq!(observed, "unknown");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), DriverEvent::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn error_tag_raises_malformed_response() {
        let (engine, mut harness, _events) = engine(Duration::ZERO);
        let instrument = async {
            harness.expect_write(b"sampleinterval=-1\r\n").await;
            harness
                .send_response(b"<ERROR type='INVALID ARGUMENT' msg='out of range'/>\r\nS>")
                .unwrap();
        };
        let (result, ()) = tokio::join!(engine.send_and_expect_prompt("sampleinterval=-1", WAIT), instrument);
        match result.unwrap_err() {
            ProtocolError::MalformedResponse { command, reason, .. } => {
                assert_eq!(command, "sampleinterval=-1");
                assert_eq!(reason, "out of range");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(logs_contain("Instrument reported an error"));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_must_match_command_pattern() {
        let rules = HashMap::from([("GetSD".to_string(), Regex::new(r"<StatusData\b").unwrap())]);
        let (engine, mut harness, mut events) = engine_with(rules, Duration::ZERO);

        let (result, ()) = tokio::join!(
            engine.send_and_expect_prompt("GetSD", WAIT),
            harness.expect_and_respond(b"GetSD\r\n", b"?CMD\r\nS>"),
        );
        match result.unwrap_err() {
            ProtocolError::MalformedResponse { command, reason, response } => {
                assert_eq!(command, "GetSD");
                assert!(reason.contains("<StatusData"), "{reason}");
                assert_eq!(response, "?CMD");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), DriverEvent::MalformedResponse { .. }));

        let (lines, ()) = tokio::join!(
            engine.send_and_expect_prompt("GetSD", WAIT),
            harness.expect_and_respond(b"GetSD\r\n", b"<StatusData DeviceType='SBE43'>\r\n</StatusData>\r\nS>"),
        );
        assert_eq!(lines.unwrap().len(), 2);

        // commands without a rule are not checked
        let (lines, ()) = tokio::join!(
            engine.send_and_expect_prompt("ds", WAIT),
            harness.expect_and_respond(b"ds\r\n", b"?CMD\r\nS>"),
        );
        assert_eq!(lines.unwrap(), vec!["?CMD"]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_labelled_frame() {
        let (engine, mut harness, _events) = engine(Duration::ZERO);
        let instrument = async {
            harness.expect_write(b"GetSD\r\n").await;
            harness.send_response(b"<StatusData DeviceType='SBE43'>\r\n").unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            harness.send_response(b"<vbatt>13.2</vbatt>\r\n</StatusData>\r\n").unwrap();
        };
        let expect = Expect::Frame("status".into());
        let (lines, ()) = tokio::join!(engine.send_and_expect("GetSD", &expect, WAIT), instrument);
        let lines = lines.unwrap();
        assert_eq!(lines.first().map(String::as_str), Some("<StatusData DeviceType='SBE43'>"));
        assert_eq!(lines.last().map(String::as_str), Some("</StatusData>"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_transaction_is_rejected() {
        let (engine, mut harness, _events) = engine(Duration::from_millis(100));
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let err = engine.send_and_expect_prompt("ts", WAIT).await.unwrap_err();
            assert!(matches!(err, ProtocolError::TransactionInProgress(ref cmd) if cmd == "ds"));
            harness.expect_write(b"ds\r\n").await;
            harness.send_response(b"S>").unwrap();
        };
        let (first, ()) = tokio::join!(engine.send_and_expect_prompt("ds", WAIT), second);
        first.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn discover_surfaces_last_timeout() {
        let (engine, mut harness, _events) = engine(Duration::ZERO);
        let start = Instant::now();
        let instrument = async {
            for _ in 0..3 {
                harness.expect_write(b"\r\n").await;
            }
        };
        let (result, ()) = tokio::join!(engine.discover_state(3, WAIT), instrument);
        assert!(matches!(result.unwrap_err(), ProtocolError::Timeout { .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= WAIT * 3 && elapsed < WAIT * 3 + Duration::from_millis(10), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn request_latest_returns_fresh_sample() {
        let (engine, mut harness, _events) = engine(Duration::ZERO);
        harness.send_response(b"#000001000001000001FFFF0000\r\n").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let instrument = async {
            harness.expect_write(b"TS\r\n").await;
            harness.send_response(b"#000002000002000002FFFF0000\r\nS>").unwrap();
        };
        let (frame, ()) = tokio::join!(engine.request_latest("TS", "ctd_sample", WAIT), instrument);
        assert!(frame.unwrap().text().starts_with("#000002"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_fails_pending_wait() {
        let (engine, mut harness, _events) = engine(Duration::ZERO);
        let instrument = async move {
            harness.expect_write(b"ds\r\n").await;
            harness.disconnect();
        };
        let (result, ()) = tokio::join!(engine.send_and_expect_prompt("ds", WAIT), instrument);
        assert!(matches!(result.unwrap_err(), ProtocolError::ConnectionLost(_)));
        assert!(matches!(
            engine.send("ds").await.unwrap_err(),
            ProtocolError::ConnectionLost(_)
        ));
    }
}
