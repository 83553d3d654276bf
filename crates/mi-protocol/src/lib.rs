//! `mi-protocol`
//!
//! Generic protocol for command/response instruments built on `mi-core`.
//!
//! ## Modules
//!
//! - [`config`]: Figment-backed [`ProtocolConfig`] describing one instrument
//! - [`receiver`]: reader task and shared receive state
//! - [`transaction`]: [`TransactionEngine`] with activity-extended deadlines
//! - [`discovery`]: [`StateProbe`] deciding between command and autosample
//! - [`break_signal`]: out-of-band break over a control connection
//! - [`direct_access`]: passthrough with echo suppression
//! - [`protocol`]: the state table and [`InstrumentProtocol`]
//! - `mock_serial`: scriptable instrument double for tests (feature `mock`)
//!
//! ## Quick start
//!
//! ```no_run
//! use mi_protocol::{ProtocolBuilder, ProtocolConfig};
//! use mi_core::serial::{Connector, TcpConnector};
//!
//! # async fn run() -> mi_core::ProtocolResult<()> {
//! let config = ProtocolConfig::load("config/sbe43.toml")?;
//! let stream = TcpConnector::new("10.0.0.5:4001").connect().await?;
//! let protocol = ProtocolBuilder::new(config).connect(stream).await?;
//!
//! let state = protocol.discover().await?;
//! println!("instrument is in {state}");
//! # Ok(())
//! # }
//! ```

pub mod break_signal;
pub mod config;
pub mod direct_access;
pub mod discovery;
#[cfg(any(test, feature = "mock"))]
pub mod mock_serial;
pub mod protocol;
pub mod receiver;
pub mod transaction;

pub use break_signal::BreakSignal;
pub use config::ProtocolConfig;
pub use direct_access::{DirectAccess, EchoFilter};
pub use discovery::{DiscoveredMode, StateProbe};
pub use protocol::{
    standard_table, EventArgs, EventResult, InstrumentProtocol, ProtocolBuilder, ProtocolContext,
    ProtocolEvent, ProtocolState,
};
pub use receiver::{LinkState, ReceiveState};
pub use transaction::{EngineSettings, Expect, TransactionEngine};
