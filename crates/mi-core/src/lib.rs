//! `mi-core`
//!
//! Instrument-independent machinery for talking to line-oriented scientific
//! instruments (CTDs, ADCPs, optical sensors) over serial or TCP.
//!
//! ## Components
//!
//! - [`fsm`]: table-driven state machine with Enter/Exit semantics
//! - [`chunker`]: frame buffer that cuts complete frames out of a noisy byte stream
//! - [`error`]: the [`ProtocolError`] taxonomy and recovery classification
//! - [`error_recovery`]: bounded retry that surfaces the last concrete error
//! - [`observability`]: per-driver span, counters, frame and event sinks
//! - [`serial`]: byte stream aliases and connectors
//! - [`logging`]: tracing subscriber setup for binaries
//!
//! The transaction engine and the driver-level protocol live in `mi-protocol`.

pub mod chunker;
pub mod error;
pub mod error_recovery;
pub mod fsm;
pub mod logging;
pub mod observability;
pub mod serial;

pub use chunker::{Frame, FrameBuffer, FrameKind, Recognizer};
pub use error::{ErrorKind, ProtocolError, ProtocolResult, RecoveryAction};
pub use fsm::{Fsm, Handler, HandlerFuture, Transition};
pub use observability::{ChannelSink, DriverEvent, EventSink, FrameSink, NullSink, Observability};
pub use serial::{ByteStream, Connector, DynStream, TcpConnector};
