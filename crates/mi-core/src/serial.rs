//! Byte stream abstractions shared by the protocol crates.
//!
//! The protocol core never opens connections itself. It is handed a [`DynStream`]
//! (serial port, TCP socket, or a test double) and splits it into the reader task
//! and the command path. Auxiliary connections, such as the out-of-band channel used
//! to send a break, are opened on demand through a [`Connector`].
//!
//! # Feature Flag
//!
//! [`open_serial_async`] requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! mi-core = { path = "../mi-core", features = ["serial"] }
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

// =============================================================================
// Stream Trait
// =============================================================================

/// Trait alias for an async bidirectional byte stream.
///
/// Implemented by `tokio_serial::SerialStream`, `tokio::net::TcpStream`,
/// `tokio::io::DuplexStream` and the mock port used in tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Type-erased boxed byte stream.
pub type DynStream = Box<dyn ByteStream>;

// =============================================================================
// Connectors
// =============================================================================

/// Opens fresh connections to an instrument endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new stream.
    async fn connect(&self) -> ProtocolResult<DynStream>;

    /// Human-readable endpoint, used in logs.
    fn describe(&self) -> String;
}

/// Connector for a TCP endpoint such as a terminal server port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    /// Connector for `host:port`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> ProtocolResult<DynStream> {
        debug!(address = %self.address, "Opening TCP connection");
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            ProtocolError::ConnectionLost(format!("connect to {} failed: {e}", self.address))
        })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Opens a serial port on a blocking thread with 8N1, no flow control.
///
/// # Errors
///
/// Returns [`ProtocolError::Io`] if the port cannot be opened.
#[cfg(feature = "serial")]
pub async fn open_serial_async(port_path: &str, baud_rate: u32) -> ProtocolResult<DynStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let port = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(std::io::Error::from)
    })
    .await
    .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))??;

    debug!(port = port_path, baud_rate, "Serial port opened");
    Ok(Box::new(port))
}

/// Connector for a local serial port.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    /// Connector for `path` at `baud_rate`.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> ProtocolResult<DynStream> {
        open_serial_async(&self.path, self.baud_rate).await
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn duplex_is_a_byte_stream() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut stream: DynStream = Box::new(device);

        host.write_all(b"S>").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"S>");
    }

    #[tokio::test]
    async fn tcp_connector_opens_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Sending Serial Break\r\n").await.unwrap();
        });

        let connector = TcpConnector::new(address.clone());
        assert_eq!(connector.describe(), format!("tcp://{address}"));
        let mut stream = connector.connect().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"Sending Serial Break\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_connector_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = match TcpConnector::new(address).connect().await {
            Err(e) => e,
            Ok(_) => panic!("connection to a closed port succeeded"),
        };
        assert!(matches!(err, ProtocolError::ConnectionLost(_)));
    }
}
