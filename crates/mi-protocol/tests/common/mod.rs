//! Shared fixtures for protocol integration tests.

#![allow(dead_code)]

use mi_core::chunker::Frame;
use mi_core::observability::{ChannelSink, DriverEvent};
use mi_protocol::mock_serial::{self, MockDeviceHarness};
use mi_protocol::{InstrumentProtocol, ProtocolBuilder, ProtocolConfig};
use tokio::sync::mpsc::UnboundedReceiver;

/// SBE 43 style profile with zero pre-send delay and short discovery limits.
pub const SBE43: &str = r#"
prompts = ["S>"]

[instrument]
id = "ctdpf-sbe43"

[timing]
pre_send_delay_ms = 0
response_timeout_ms = 1000
discover_attempts = 3
discover_timeout_ms = 500
autosample_window_ms = 100

[[recognizers]]
label = "ctd_sample"
kind = "sample"
pattern = '#? *(?:[0-9A-F]{6}){3}(?:[0-9A-F]{4}){2}\r\n'

[[recognizers]]
label = "status"
kind = "response"
pattern = '(?s)<StatusData.*?</StatusData>\r\n'

[errors]
pattern = "<ERROR type='(?P<kind>[^']*)' msg='(?P<msg>[^']*)'\\s*/>"

[commands]
acquire_sample = "TS"
acquire_status = ["GetSD", "GetCD"]
start_autosample = "StartNow"
stop_autosample = "Stop"
set_template = "{name}={value}"
get = "DS"
run_test = ["TS"]
latest_sample = "TS"
latest_sample_label = "ctd_sample"
"#;

pub const SAMPLE: &[u8] = b"#04570F0A1E910000ED8C0A4C\r\n";

/// Receiving ends of the protocol's channel sink.
pub struct Sinks {
    pub frames: UnboundedReceiver<Frame>,
    pub events: UnboundedReceiver<DriverEvent>,
}

impl Sinks {
    /// Events delivered so far.
    pub fn drain_events(&mut self) -> Vec<DriverEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Frames delivered so far.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

pub fn config() -> ProtocolConfig {
    ProtocolConfig::from_toml_str(SBE43).unwrap()
}

/// Builder wired to a channel sink.
pub fn builder(config: ProtocolConfig) -> (ProtocolBuilder, Sinks) {
    let (sink, frames, events) = ChannelSink::new();
    (
        ProtocolBuilder::new(config).with_channel_sink(sink),
        Sinks { frames, events },
    )
}

/// Connects `builder` to a fresh mock instrument.
pub async fn connect(builder: ProtocolBuilder) -> (InstrumentProtocol, MockDeviceHarness) {
    let (port, harness) = mock_serial::new();
    let protocol = builder.connect(Box::new(port)).await.unwrap();
    (protocol, harness)
}

/// Runs discovery against an idle instrument.
pub async fn discover_idle(protocol: &InstrumentProtocol, harness: &mut MockDeviceHarness) {
    let instrument = async {
        harness.expect_write(b"\r\n").await;
        harness.send_response(b"S>").unwrap();
    };
    let (state, ()) = tokio::join!(protocol.discover(), instrument);
    assert_eq!(state.unwrap(), mi_protocol::ProtocolState::Command);
}

/// Protocol already in `Command`.
pub async fn in_command() -> (InstrumentProtocol, MockDeviceHarness, Sinks) {
    let (builder, mut sinks) = builder(config());
    let (protocol, mut harness) = connect(builder).await;
    discover_idle(&protocol, &mut harness).await;
    sinks.drain_events();
    (protocol, harness, sinks)
}
