//! Scriptable instrument double.
//!
//! [`MockSerialPort`] implements `AsyncRead` and `AsyncWrite` and is handed to the
//! protocol as its [`DynStream`]. The paired [`MockDeviceHarness`] stays in the
//! test and plays the instrument: it asserts on what the driver wrote and feeds
//! bytes back, in whatever fragments the test chooses.
//!
//! # Architecture
//!
//! Two unbounded channels carry the traffic:
//! - `MockSerialPort` (given to the driver): implements AsyncRead/AsyncWrite
//! - `MockDeviceHarness` (kept in the test): scripts instrument behavior
//!
//! Dropping the harness (or calling [`MockDeviceHarness::disconnect`]) ends the
//! read side, which the driver observes as a lost connection.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let protocol = ProtocolBuilder::new(config).connect(Box::new(port)).await?;
//!
//! let request = tokio::spawn(async move { protocol.acquire_status().await });
//! harness.expect_write(b"GetSD\r\n").await;
//! harness.send_response(b"<StatusData/>\r\nS>").unwrap();
//! ```

#![allow(clippy::panic, clippy::expect_used)]

use async_trait::async_trait;
use mi_core::serial::{Connector, DynStream};
use mi_core::ProtocolResult;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Generous bound for harness expectations.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Driver-facing side of the mock.
#[derive(Debug)]
pub struct MockSerialPort {
    /// Written data, to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Data from the harness, to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Received from the harness but not yet read
    read_buffer: VecDeque<u8>,
}

/// Test-facing side of the mock.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Written by the driver but not yet asserted
    write_buffer: Vec<u8>,
}

/// Creates a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness gone: end of file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Sends bytes to the driver as if the instrument had transmitted them.
    ///
    /// # Errors
    /// Returns an error if the driver side has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Waits for the driver to write `expected`, buffering partial writes.
    ///
    /// # Panics
    /// Panics if the data does not arrive within two seconds or does not match.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected `{:?}` ({} bytes), but only received `{:?}` ({} bytes).",
                    String::from_utf8_lossy(expected),
                    expected.len(),
                    String::from_utf8_lossy(&self.write_buffer),
                    self.write_buffer.len()
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write, then answers it.
    ///
    /// # Panics
    /// Same as [`expect_write`](Self::expect_write), or if the port was dropped.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response).expect("Failed to send response");
    }

    /// Next chunk written by the driver, or `None` if nothing arrives within `wait`.
    pub async fn next_write(&mut self, wait: Duration) -> Option<Vec<u8>> {
        if !self.write_buffer.is_empty() {
            return Some(std::mem::take(&mut self.write_buffer));
        }
        tokio::time::timeout(wait, self.writes_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Discards pending writes.
    pub async fn drain_writes(&mut self) {
        let short_timeout = Duration::from_millis(50);
        while let Ok(Some(chunk)) = tokio::time::timeout(short_timeout, self.writes_rx.recv()).await {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }

    /// Resolves once the driver has dropped its port, both read and write halves.
    pub async fn closed(&self) {
        self.reads_tx.closed().await;
    }

    /// Whether the driver has dropped its port.
    pub fn is_closed(&self) -> bool {
        self.reads_tx.is_closed()
    }

    /// Closes the instrument side; the driver reads end of file.
    pub fn disconnect(self) {
        drop(self);
    }
}

/// [`Connector`] that opens mock ports and hands each harness to the test.
#[derive(Debug)]
pub struct MockConnector {
    harnesses: UnboundedSender<MockDeviceHarness>,
}

impl MockConnector {
    /// Connector plus the stream of harnesses for the connections it opens.
    pub fn new() -> (Self, UnboundedReceiver<MockDeviceHarness>) {
        let (harnesses, rx) = mpsc::unbounded_channel();
        (Self { harnesses }, rx)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> ProtocolResult<DynStream> {
        let (port, harness) = new();
        self.harnesses.send(harness).map_err(|_| {
            mi_core::ProtocolError::ConnectionLost("mock connector has no listener".into())
        })?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        "mock://break".to_string()
    }
}
