//! Startup mode discovery.
//!
//! An instrument that is already streaming samples will usually not answer a
//! wake-up the way an idle one does, so the probe listens before it talks:
//!
//! 1. a sample seen within the autosample window means `Autosample`
//! 2. otherwise wait up to the window for one to arrive
//! 3. otherwise wake the instrument; a prompt means `Command`
//!
//! If every wake-up attempt times out the last timeout is returned, unless
//! samples started arriving meanwhile.

use crate::config::TimingConfig;
use crate::transaction::TransactionEngine;
use mi_core::ProtocolResult;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Mode the instrument was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveredMode {
    /// Idle at a prompt
    Command,
    /// Streaming samples
    Autosample,
}

impl fmt::Display for DiscoveredMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveredMode::Command => f.write_str("command"),
            DiscoveredMode::Autosample => f.write_str("autosample"),
        }
    }
}

/// Determines whether the instrument is idle or streaming.
#[derive(Debug)]
pub struct StateProbe<'a> {
    engine: &'a TransactionEngine,
    attempts: u32,
    timeout: Duration,
    window: Duration,
}

impl<'a> StateProbe<'a> {
    /// Probe with explicit limits.
    pub fn new(engine: &'a TransactionEngine, attempts: u32, timeout: Duration, window: Duration) -> Self {
        Self {
            engine,
            attempts,
            timeout,
            window,
        }
    }

    /// Probe using the `[timing]` discovery settings.
    pub fn from_timing(engine: &'a TransactionEngine, timing: &TimingConfig) -> Self {
        Self::new(
            engine,
            timing.discover_attempts,
            timing.discover_timeout(),
            timing.autosample_window(),
        )
    }

    /// Runs the probe.
    pub async fn probe(&self) -> ProtocolResult<DiscoveredMode> {
        let state = self.engine.receive_state();
        let started = Instant::now();

        if state.sampled_within(self.window) {
            debug!("Recent sample seen, instrument is streaming");
            return Ok(DiscoveredMode::Autosample);
        }

        if !self.window.is_zero() {
            if let Ok(heard) = tokio::time::timeout(self.window, state.wait_for_sample_after(started)).await {
                heard?;
                info!("Sample arrived while listening, instrument is streaming");
                return Ok(DiscoveredMode::Autosample);
            }
        }

        match self.engine.discover_state(self.attempts, self.timeout).await {
            Ok(_) => {
                info!("Prompt received, instrument is idle");
                Ok(DiscoveredMode::Command)
            }
            Err(err) if state.sampled_since(started) => {
                debug!(error = %err, "Wake-up failed but samples are arriving");
                Ok(DiscoveredMode::Autosample)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::{self, MockDeviceHarness};
    use crate::transaction::EngineSettings;
    use mi_core::chunker::{FrameBuffer, FrameKind, Recognizer};
    use mi_core::observability::Observability;
    use mi_core::ProtocolError;
    use std::sync::Arc;

    const SAMPLE: &[u8] = b"#04570F0A1E910000ED8C0A4C\r\n";

    fn engine() -> (TransactionEngine, MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let recognizers = vec![
            Recognizer::regex(FrameKind::Sample, "ctd_sample", r"#(?:[0-9A-F]{6}){3}(?:[0-9A-F]{4}){2}\r\n").unwrap(),
            Recognizer::literal(FrameKind::Prompt, "prompt", "S>"),
        ];
        let engine = TransactionEngine::spawn(
            Box::new(port),
            FrameBuffer::new(recognizers),
            EngineSettings::default(),
            Arc::new(Observability::detached("sbe43")),
        );
        (engine, harness)
    }

    fn probe(engine: &TransactionEngine) -> StateProbe<'_> {
        StateProbe::new(engine, 3, Duration::from_millis(500), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_instrument_is_autosample() {
        let (engine, harness) = engine();
        let instrument = async {
            tokio::time::sleep(Duration::from_millis(700)).await;
            harness.send_response(SAMPLE).unwrap();
        };
        let probe = probe(&engine);
        let (mode, ()) = tokio::join!(probe.probe(), instrument);
        assert_eq!(mode.unwrap(), DiscoveredMode::Autosample);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_sample_short_circuits() {
        let (engine, harness) = engine();
        harness.send_response(SAMPLE).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let start = Instant::now();
        assert_eq!(probe(&engine).probe().await.unwrap(), DiscoveredMode::Autosample);
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_instrument_is_command() {
        let (engine, mut harness) = engine();
        let instrument = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            harness.expect_write(b"\r\n").await;
            harness.send_response(b"S>").unwrap();
        };
        let probe = probe(&engine);
        let (mode, ()) = tokio::join!(probe.probe(), instrument);
        assert_eq!(mode.unwrap(), DiscoveredMode::Command);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_instrument_surfaces_timeout() {
        let (engine, mut harness) = engine();
        let instrument = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            for _ in 0..3 {
                harness.expect_write(b"\r\n").await;
            }
        };
        let probe = probe(&engine);
        let (mode, ()) = tokio::join!(probe.probe(), instrument);
        assert!(matches!(mode.unwrap_err(), ProtocolError::Timeout { .. }));
    }
}
