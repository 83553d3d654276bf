//! Out-of-band break.
//!
//! Some instruments only leave autosample on a serial break, which a TCP terminal
//! server cannot pass through the data port. Those servers expose a second,
//! control connection that accepts a `break <ms>` directive and acknowledges it
//! with a fixed line of text. [`BreakSignal`] opens that connection for each
//! break, retries unacknowledged directives, and always closes it afterwards.

use crate::config::BreakConfig;
use crate::transaction::{EngineSettings, Expect, TransactionEngine};
use mi_core::chunker::{FrameBuffer, FrameKind, Recognizer};
use mi_core::error_recovery::{retry, RetryPolicy};
use mi_core::observability::Observability;
use mi_core::serial::{Connector, TcpConnector};
use mi_core::ProtocolResult;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ACK_LABEL: &str = "break_ack";

/// Largest unacknowledged chatter kept on the control connection.
const CONTROL_BUFFER: usize = 4096;

/// Sends a break over a secondary connection.
pub struct BreakSignal {
    connector: Arc<dyn Connector>,
    config: BreakConfig,
    newline: String,
}

impl fmt::Debug for BreakSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakSignal")
            .field("endpoint", &self.connector.describe())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BreakSignal {
    /// Break sender using `connector` for the control connection.
    pub fn new(connector: Arc<dyn Connector>, config: BreakConfig, newline: impl Into<String>) -> Self {
        Self {
            connector,
            config,
            newline: newline.into(),
        }
    }

    /// Break sender for the TCP control port in `config.address`.
    pub fn tcp(config: BreakConfig, newline: impl Into<String>) -> Self {
        let connector = Arc::new(TcpConnector::new(config.address.clone()));
        Self::new(connector, config, newline)
    }

    /// Break settings.
    pub fn config(&self) -> &BreakConfig {
        &self.config
    }

    /// Opens the control connection and sends the break until it is acknowledged.
    ///
    /// Each attempt first waits the settle interval, so consecutive breaks are
    /// spaced out. The last timeout is returned if no attempt is acknowledged.
    pub async fn send(&self) -> ProtocolResult<()> {
        let endpoint = self.connector.describe();
        let stream = self.connector.connect().await?;
        debug!(endpoint = %endpoint, "Break control connection opened");

        let ack = Recognizer::literal(FrameKind::Response, ACK_LABEL, &self.config.ack);
        let settings = EngineSettings {
            newline: self.newline.clone(),
            ..EngineSettings::default()
        };
        let channel = TransactionEngine::spawn(
            stream,
            FrameBuffer::new(vec![ack]).with_max_len(CONTROL_BUFFER),
            settings,
            Arc::new(Observability::detached(format!("break:{endpoint}"))),
        );

        let policy = RetryPolicy::attempts_only(self.config.attempts);
        let directive = self.config.directive();
        let expect = Expect::Frame(ACK_LABEL.to_string());
        let settle = self.config.settle();
        let ack_timeout = self.config.ack_timeout();
        let channel_ref = &channel;
        let outcome = retry(&policy, |attempt| {
            let directive = directive.as_str();
            let expect = &expect;
            async move {
                tokio::time::sleep(settle).await;
                debug!(attempt, directive, "Sending break");
                channel_ref.send_and_expect(directive, expect, ack_timeout).await
            }
        })
        .await;

        channel.shutdown().await;
        match outcome {
            Ok(_) => {
                info!(endpoint = %endpoint, duration_ms = self.config.duration_ms, "Break acknowledged");
                Ok(())
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "Break was not acknowledged");
                Err(err)
            }
        }
    }
}
