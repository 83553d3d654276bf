//! Direct access passthrough.
//!
//! While the protocol is in `DirectAccess`, operator bytes go straight to the
//! instrument and everything the instrument sends is forwarded as
//! [`DriverEvent::DirectAccessData`](mi_core::DriverEvent::DirectAccessData)
//! without framing. Many instruments echo their input, so each sent chunk is
//! remembered and a received chunk that starts with one of them, followed by a
//! line end or nothing, has that echo removed. Over TCP the echo and the reply
//! usually arrive in the same read.

use crate::receiver::ReceiveState;
use crate::transaction::TransactionEngine;
use mi_core::ProtocolResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Bounded history of recently sent passthrough chunks.
#[derive(Debug)]
pub struct EchoFilter {
    sent: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

fn trim_line_end(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n'))
        .map_or(0, |i| i + 1);
    &data[..end]
}

fn skip_line_end(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\r' | b'\n'))
        .unwrap_or(data.len());
    &data[start..]
}

impl EchoFilter {
    /// Filter remembering the last `capacity` sends.
    pub fn new(capacity: usize) -> Self {
        Self {
            sent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Remembers `data` as sent.
    pub fn record(&self, data: &[u8]) {
        let entry = trim_line_end(data);
        if entry.is_empty() {
            return;
        }
        let mut sent = self.sent.lock();
        if sent.len() == self.capacity {
            sent.pop_front();
        }
        sent.push_back(entry.to_vec());
    }

    /// Removes a leading echo of a remembered send from `received`.
    ///
    /// Returns what follows the echo and its line end (possibly nothing), or
    /// `None` if `received` does not start with an echo. A match is consumed.
    pub fn strip_echo<'a>(&self, received: &'a [u8]) -> Option<&'a [u8]> {
        if trim_line_end(received).is_empty() {
            return None;
        }
        let mut sent = self.sent.lock();
        let (index, rest) = sent.iter().enumerate().find_map(|(index, entry)| {
            let after = received.strip_prefix(entry.as_slice())?;
            let rest = skip_line_end(after);
            // "ds" must not match the start of "dsx"
            (after.is_empty() || rest.len() < after.len()).then_some((index, rest))
        })?;
        sent.remove(index);
        Some(rest)
    }

    /// Whether `received` is nothing but an echo. A match is consumed.
    pub fn is_echo(&self, received: &[u8]) -> bool {
        self.strip_echo(received).is_some_and(<[u8]>::is_empty)
    }

    /// Forgets all remembered sends.
    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Number of remembered sends.
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

/// Passthrough session bound to one receive path.
#[derive(Debug)]
pub struct DirectAccess {
    filter: Arc<EchoFilter>,
}

impl DirectAccess {
    /// Session with an echo history of `history` sends.
    pub fn new(history: usize) -> Self {
        Self {
            filter: Arc::new(EchoFilter::new(history)),
        }
    }

    /// Switches the receive path to raw forwarding.
    pub fn open(&self, state: &ReceiveState) {
        self.filter.clear();
        state.set_passthrough(Some(self.filter.clone()));
        debug!("Direct access opened");
    }

    /// Sends `data` verbatim and remembers it for echo suppression.
    pub async fn execute(&self, engine: &TransactionEngine, data: &[u8]) -> ProtocolResult<usize> {
        self.filter.record(data);
        engine.send_raw(data).await
    }

    /// Restores framed receive and forgets the echo history.
    pub fn close(&self, state: &ReceiveState) {
        state.set_passthrough(None);
        self.filter.clear();
        debug!("Direct access closed");
    }

    /// Echo history.
    pub fn filter(&self) -> &Arc<EchoFilter> {
        &self.filter
    }
}
