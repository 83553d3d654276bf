//! Protocol configuration using Figment.
//!
//! Everything instrument-specific that the generic protocol needs (line terminator,
//! prompt literals, frame recognizers, command strings, timing, break channel) is
//! data. Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `MI_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use mi_protocol::config::ProtocolConfig;
//!
//! let config = ProtocolConfig::load("config/sbe43.toml")?;
//! println!("Instrument: {}", config.instrument.id);
//! # Ok::<(), mi_core::ProtocolError>(())
//! ```
//!
//! `MI_TIMING__RESPONSE_TIMEOUT_MS=10000` overrides `[timing] response_timeout_ms`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use mi_core::chunker::{FrameKind, Recognizer};
use mi_core::logging::{parse_log_level, LoggingConfig};
use mi_core::{ProtocolError, ProtocolResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Top-level protocol configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Instrument identity and line terminator
    #[serde(default)]
    pub instrument: InstrumentSection,
    /// Delays and deadlines
    #[serde(default)]
    pub timing: TimingConfig,
    /// Prompt literals, any of which means "ready for a command"
    #[serde(default)]
    pub prompts: Vec<String>,
    /// Additional frame recognizers
    #[serde(default)]
    pub recognizers: Vec<RecognizerConfig>,
    /// Error tag detection
    #[serde(default)]
    pub errors: ErrorTagConfig,
    /// Expected reply per command text, as a regex the captured lines must match
    #[serde(default)]
    pub responses: BTreeMap<String, String>,
    /// Command strings
    #[serde(default)]
    pub commands: CommandSet,
    /// Out-of-band break channel, absent when the instrument has none
    #[serde(default)]
    pub break_signal: Option<BreakConfig>,
    /// Direct access passthrough
    #[serde(default)]
    pub direct_access: DirectAccessConfig,
    /// Frame buffer limits
    #[serde(default)]
    pub chunker: ChunkerConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Primary connection, used by the console
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// `[instrument]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSection {
    /// Identifier used in logs and events
    #[serde(default = "default_id")]
    pub id: String,
    /// Appended to every command
    #[serde(default = "default_newline")]
    pub newline: String,
}

impl Default for InstrumentSection {
    fn default() -> Self {
        Self {
            id: default_id(),
            newline: default_newline(),
        }
    }
}

/// `[timing]` section. All values in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Settle time before each write
    #[serde(default = "default_pre_send_delay")]
    pub pre_send_delay_ms: u64,
    /// Inactivity window for command responses
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Wake-up attempts during discovery
    #[serde(default = "default_discover_attempts")]
    pub discover_attempts: u32,
    /// Inactivity window for each wake-up attempt
    #[serde(default = "default_discover_timeout")]
    pub discover_timeout_ms: u64,
    /// How long to listen for samples before concluding the instrument is idle
    #[serde(default = "default_autosample_window")]
    pub autosample_window_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pre_send_delay_ms: default_pre_send_delay(),
            response_timeout_ms: default_response_timeout(),
            discover_attempts: default_discover_attempts(),
            discover_timeout_ms: default_discover_timeout(),
            autosample_window_ms: default_autosample_window(),
        }
    }
}

impl TimingConfig {
    /// Settle time before each write.
    pub fn pre_send_delay(&self) -> Duration {
        Duration::from_millis(self.pre_send_delay_ms)
    }

    /// Inactivity window for command responses.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Inactivity window for each wake-up attempt.
    pub fn discover_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_timeout_ms)
    }

    /// Passive sample listening window.
    pub fn autosample_window(&self) -> Duration {
        Duration::from_millis(self.autosample_window_ms)
    }
}

/// One `[[recognizers]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Frame label, e.g. `"status"`
    pub label: String,
    /// sample, response, prompt or error
    pub kind: FrameKind,
    /// Regex over raw bytes; must end at the frame terminator
    pub pattern: String,
}

/// `[errors]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTagConfig {
    /// Regex locating an error reply in response text. Must have a `msg` group and
    /// may have a `kind` group.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// `[commands]` section. Absent commands disable the matching protocol event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    /// Sent (with the newline) to wake the instrument; empty means a bare newline
    #[serde(default)]
    pub wakeup: String,
    /// Polled sample
    #[serde(default)]
    pub acquire_sample: Option<String>,
    /// Status and metadata queries, run in order
    #[serde(default)]
    pub acquire_status: Vec<String>,
    /// Enters autosample
    #[serde(default)]
    pub start_autosample: Option<String>,
    /// Leaves autosample when no break channel is configured
    #[serde(default)]
    pub stop_autosample: Option<String>,
    /// Parameter set, with `{name}` and `{value}` placeholders
    #[serde(default)]
    pub set_template: Option<String>,
    /// Text the instrument echoes after applying a set, same placeholders.
    /// When present, a reply without it is rejected.
    #[serde(default)]
    pub set_echo: Option<String>,
    /// Parameter readback
    #[serde(default)]
    pub get: Option<String>,
    /// Self tests, run in order in the Test state
    #[serde(default)]
    pub run_test: Vec<String>,
    /// Requests the latest asynchronously delivered frame
    #[serde(default)]
    pub latest_sample: Option<String>,
    /// Recognizer label of the frame `latest_sample` produces
    #[serde(default)]
    pub latest_sample_label: Option<String>,
}

/// `[break_signal]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakConfig {
    /// `host:port` of the out-of-band channel
    pub address: String,
    /// Break length in milliseconds, sent as `break <duration>`
    #[serde(default = "default_break_duration")]
    pub duration_ms: u64,
    /// Attempts before giving up
    #[serde(default = "default_break_attempts")]
    pub attempts: u32,
    /// Text the channel echoes once the break was sent
    #[serde(default = "default_break_ack")]
    pub ack: String,
    /// Inactivity window for the acknowledgment
    #[serde(default = "default_break_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Pause before each attempt
    #[serde(default = "default_break_settle")]
    pub settle_ms: u64,
}

impl BreakConfig {
    /// Break directive sent on the secondary channel.
    pub fn directive(&self) -> String {
        format!("break {}", self.duration_ms)
    }

    /// Inactivity window for the acknowledgment.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Pause before each attempt.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// `[direct_access]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectAccessConfig {
    /// Sent commands remembered for echo filtering
    #[serde(default = "default_history")]
    pub history: usize,
}

impl Default for DirectAccessConfig {
    fn default() -> Self {
        Self {
            history: default_history(),
        }
    }
}

/// `[chunker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Upper bound on unframed bytes held in the frame buffer
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_buffer: default_max_buffer(),
        }
    }
}

/// `[connection]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// `host:port` of a terminal server
    #[serde(default)]
    pub tcp: Option<String>,
    /// Local serial device path
    #[serde(default)]
    pub serial: Option<String>,
    /// Serial baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tcp: None,
            serial: None,
            baud: default_baud(),
        }
    }
}

// Default value functions
fn default_id() -> String {
    "instrument".to_string()
}

fn default_newline() -> String {
    "\r\n".to_string()
}

fn default_pre_send_delay() -> u64 {
    200
}

fn default_response_timeout() -> u64 {
    5000
}

fn default_discover_attempts() -> u32 {
    5
}

fn default_discover_timeout() -> u64 {
    1000
}

fn default_autosample_window() -> u64 {
    2000
}

fn default_break_duration() -> u64 {
    1000
}

fn default_break_attempts() -> u32 {
    3
}

fn default_break_ack() -> String {
    "Sending Serial Break".to_string()
}

fn default_break_ack_timeout() -> u64 {
    2000
}

fn default_break_settle() -> u64 {
    1000
}

fn default_history() -> usize {
    32
}

fn default_max_buffer() -> usize {
    64 * 1024
}

fn default_baud() -> u32 {
    9600
}

impl ProtocolConfig {
    /// Loads `path`, applies `MI_` environment overrides, and validates.
    pub fn load<P: AsRef<Path>>(path: P) -> ProtocolResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ProtocolError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        Self::extract(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed("MI_").split("__")),
        )
    }

    /// Parses TOML text without environment overrides, and validates.
    pub fn from_toml_str(toml: &str) -> ProtocolResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> ProtocolResult<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| ProtocolError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot.
    pub fn validate(&self) -> ProtocolResult<()> {
        let invalid = |msg: String| Err(ProtocolError::Configuration(msg));

        if self.instrument.id.trim().is_empty() {
            return invalid("instrument.id must not be empty".into());
        }
        if self.instrument.newline.is_empty() {
            return invalid("instrument.newline must not be empty".into());
        }
        if self.prompts.iter().all(|p| p.is_empty()) {
            return invalid("at least one non-empty prompt is required".into());
        }

        let timing = &self.timing;
        if timing.response_timeout_ms == 0 || timing.discover_timeout_ms == 0 {
            return invalid("timing timeouts must be greater than zero".into());
        }
        if timing.discover_attempts == 0 {
            return invalid("timing.discover_attempts must be at least 1".into());
        }

        for recognizer in &self.recognizers {
            if let Err(e) = regex::bytes::Regex::new(&recognizer.pattern) {
                return invalid(format!("recognizer '{}': {e}", recognizer.label));
            }
        }
        if let Some(pattern) = &self.errors.pattern {
            let re = Regex::new(pattern)
                .map_err(|e| ProtocolError::Configuration(format!("errors.pattern: {e}")))?;
            if !re.capture_names().any(|name| name == Some("msg")) {
                return invalid("errors.pattern must define a 'msg' capture group".into());
            }
        }

        if let Some(template) = &self.commands.set_template {
            if !template.contains("{name}") || !template.contains("{value}") {
                return invalid(format!(
                    "commands.set_template '{template}' must contain {{name}} and {{value}}"
                ));
            }
        }
        if let Some(echo) = &self.commands.set_echo {
            if self.commands.set_template.is_none() || !echo.contains("{value}") {
                return invalid(format!(
                    "commands.set_echo '{echo}' needs set_template and a {{value}} placeholder"
                ));
            }
        }
        for (command, pattern) in &self.responses {
            if let Err(e) = Regex::new(pattern) {
                return invalid(format!("responses.{command}: {e}"));
            }
        }
        if self.commands.latest_sample.is_some() != self.commands.latest_sample_label.is_some() {
            return invalid(
                "commands.latest_sample and commands.latest_sample_label go together".into(),
            );
        }
        if let Some(label) = &self.commands.latest_sample_label {
            if !self.recognizers.iter().any(|r| &r.label == label) {
                return invalid(format!("commands.latest_sample_label '{label}' has no recognizer"));
            }
        }

        if let Some(brk) = &self.break_signal {
            if brk.attempts == 0 || brk.ack.is_empty() || brk.ack_timeout_ms == 0 {
                return invalid("break_signal needs attempts, ack and ack_timeout_ms".into());
            }
        }
        if self.direct_access.history == 0 {
            return invalid("direct_access.history must be at least 1".into());
        }
        if self.chunker.max_buffer == 0 {
            return invalid("chunker.max_buffer must be at least 1".into());
        }

        parse_log_level(&self.logging.level)?;
        Ok(())
    }

    /// Recognizers in priority order: configured entries first, then one literal
    /// recognizer per prompt.
    pub fn build_recognizers(&self) -> ProtocolResult<Vec<Recognizer>> {
        let mut recognizers = self
            .recognizers
            .iter()
            .map(|r| Recognizer::regex(r.kind, r.label.as_str(), &r.pattern))
            .collect::<ProtocolResult<Vec<_>>>()?;
        recognizers.extend(
            self.prompts
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| Recognizer::literal(FrameKind::Prompt, "prompt", p)),
        );
        Ok(recognizers)
    }

    /// Compiled error tag pattern, if configured.
    pub fn error_tag(&self) -> ProtocolResult<Option<Regex>> {
        self.errors
            .pattern
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| ProtocolError::Configuration(format!("errors.pattern: {e}")))
            })
            .transpose()
    }

    /// Compiled `[responses]` rules keyed by command text.
    pub fn response_rules(&self) -> ProtocolResult<HashMap<String, Regex>> {
        self.responses
            .iter()
            .map(|(command, pattern)| {
                Regex::new(pattern)
                    .map(|re| (command.trim().to_string(), re))
                    .map_err(|e| ProtocolError::Configuration(format!("responses.{command}: {e}")))
            })
            .collect()
    }

    /// Renders the set command for `name = value`.
    ///
    /// Line terminators in either argument are rejected, since they would
    /// smuggle a second command onto the wire.
    pub fn set_command(&self, name: &str, value: &str) -> ProtocolResult<String> {
        if [name, value].iter().any(|arg| arg.contains(['\r', '\n'])) {
            return Err(ProtocolError::InvalidArgument(format!(
                "set arguments must not contain line terminators: {name:?} = {value:?}"
            )));
        }
        let template = self
            .commands
            .set_template
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidArgument("no set_template configured".into()))?;
        Ok(render(template, name, value))
    }

    /// Echo expected after setting `name = value`, if configured.
    pub fn set_echo(&self, name: &str, value: &str) -> Option<String> {
        self.commands
            .set_echo
            .as_ref()
            .map(|template| render(template, name, value))
    }
}

fn render(template: &str, name: &str, value: &str) -> String {
    template.replace("{name}", name).replace("{value}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SBE43: &str = r#"
prompts = ["S>"]

[instrument]
id = "ctdpf-sbe43"

[timing]
pre_send_delay_ms = 0

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
acquire_status = ["GetSD", "GetCD"]
set_template = "{name}={value}"
"#;

    #[test]
    fn parses_instrument_profile() {
        let config = ProtocolConfig::from_toml_str(SBE43).unwrap();
        assert_eq!(config.instrument.id, "ctdpf-sbe43");
        assert_eq!(config.instrument.newline, "\r\n");
        assert_eq!(config.timing.pre_send_delay(), Duration::ZERO);
        assert_eq!(config.timing.discover_attempts, 5);
        assert_eq!(config.recognizers[0].kind, FrameKind::Sample);
        assert_eq!(config.commands.acquire_status, vec!["GetSD", "GetCD"]);
        assert!(config.break_signal.is_none());

        let recognizers = config.build_recognizers().unwrap();
        let labels: Vec<&str> = recognizers.iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec!["ctd_sample", "status", "prompt"]);
    }

    #[test]
    fn renders_set_command() {
        let config = ProtocolConfig::from_toml_str(SBE43).unwrap();
        assert_eq!(config.set_command("sampleinterval", "5").unwrap(), "sampleinterval=5");
        assert!(config.set_echo("sampleinterval", "5").is_none());
    }

    #[test]
    fn set_arguments_cannot_carry_line_terminators() {
        let config = ProtocolConfig::from_toml_str(SBE43).unwrap();
        for (name, value) in [("sampleinterval", "5\r\nStartNow"), ("a\nb", "1"), ("x", "1\r")] {
            assert!(matches!(
                config.set_command(name, value),
                Err(ProtocolError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn response_rules_compile_and_validate() {
        let toml = format!("{SBE43}\n[responses]\nGetSD = '<StatusData'\n");
        let config = ProtocolConfig::from_toml_str(&toml).unwrap();
        let rules = config.response_rules().unwrap();
        assert!(rules["GetSD"].is_match("<StatusData DeviceType='SBE43'>"));

        let bad = format!("{SBE43}\n[responses]\nGetSD = '(unclosed'\n");
        let err = ProtocolConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("responses.GetSD"));
    }

    #[test]
    fn set_echo_needs_value_placeholder() {
        let toml = "prompts = [\">\"]\n[commands]\nset_template = \"{name}={value}\"\nset_echo = \"ok\"\n";
        assert!(ProtocolConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn error_tag_captures_reason() {
        let config = ProtocolConfig::from_toml_str(SBE43).unwrap();
        let re = config.error_tag().unwrap().unwrap();
        let caps = re
            .captures("<ERROR type='INVALID ARGUMENT' msg='out of range'/>")
            .unwrap();
        assert_eq!(&caps["kind"], "INVALID ARGUMENT");
        assert_eq!(&caps["msg"], "out of range");
    }

    #[test]
    fn rejects_missing_prompt() {
        let err = ProtocolConfig::from_toml_str("[instrument]\nid = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn rejects_bad_recognizer_pattern() {
        let toml = "prompts = [\">\"]\n[[recognizers]]\nlabel = \"bad\"\nkind = \"sample\"\npattern = \"(unclosed\"\n";
        let err = ProtocolConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("recognizer 'bad'"));
    }

    #[test]
    fn rejects_set_template_without_placeholders() {
        let toml = "prompts = [\">\"]\n[commands]\nset_template = \"SET\"\n";
        assert!(ProtocolConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_latest_sample_without_recognizer() {
        let toml = "prompts = [\">\"]\n[commands]\nlatest_sample = \"CE\"\nlatest_sample_label = \"pd0\"\n";
        let err = ProtocolConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("pd0"));
    }

    #[test]
    fn break_defaults_follow_terminal_server() {
        let toml = "prompts = [\">\"]\n[break_signal]\naddress = \"10.0.0.5:2102\"\n";
        let config = ProtocolConfig::from_toml_str(toml).unwrap();
        let brk = config.break_signal.unwrap();
        assert_eq!(brk.directive(), "break 1000");
        assert_eq!(brk.attempts, 3);
        assert_eq!(brk.ack, "Sending Serial Break");
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SBE43.as_bytes()).unwrap();
        let config = ProtocolConfig::load(file.path()).unwrap();
        assert_eq!(config.prompts, vec!["S>"]);
    }

    #[test]
    fn shipped_example_profile_is_valid() {
        let example = include_str!("../../../config/sbe43.example.toml");
        let config = ProtocolConfig::from_toml_str(example).unwrap();
        assert_eq!(config.connection.tcp.as_deref(), Some("10.0.0.5:4001"));
        assert_eq!(config.commands.acquire_status.len(), 5);
        assert!(config.break_signal.is_none());
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = ProtocolConfig::load("/nonexistent/mi.toml").unwrap_err();
        assert!(matches!(err, ProtocolError::Configuration(_)));
    }
}
