//! Driver-level protocol.
//!
//! [`InstrumentProtocol`] ties the pieces together: a [`TransactionEngine`] on the
//! instrument connection, an optional [`BreakSignal`], a [`DirectAccess`] session,
//! and an [`Fsm`] whose table is built from the configured command set.
//!
//! ```text
//!            Discover                StartAutosample
//!   Unknown ──────────► Command ◄────────────────────► Autosample
//!      │                  │  ▲       StopAutosample        │
//!      └──► Autosample    │  │                             │
//!                RunTest  ▼  │ ExecuteTest      StartDirect│
//!                        Test                              ▼
//!                  Command/Autosample ◄──StopDirect── DirectAccess
//! ```
//!
//! Only operations whose commands are configured get a table entry, so
//! [`InstrumentProtocol::capabilities`] reflects what this instrument can do in
//! its current state. Individual entries can be replaced through
//! [`ProtocolBuilder::with_handler`].

use crate::break_signal::BreakSignal;
use crate::config::ProtocolConfig;
use crate::direct_access::DirectAccess;
use crate::discovery::{DiscoveredMode, StateProbe};
use crate::transaction::{EngineSettings, TransactionEngine};
use bytes::Bytes;
use mi_core::chunker::{Frame, FrameBuffer, Recognizer};
use mi_core::fsm::{Fsm, Handler, HandlerFuture, Transition};
use mi_core::observability::{ChannelSink, DriverEvent, EventSink, FrameSink, NullSink, Observability};
use mi_core::serial::{Connector, DynStream};
use mi_core::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};

/// Protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// Mode not yet determined
    Unknown,
    /// Idle at a prompt, accepting commands
    Command,
    /// Streaming samples
    Autosample,
    /// Operator passthrough
    DirectAccess,
    /// Running the self-test sequence
    Test,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolState::Unknown => "unknown",
            ProtocolState::Command => "command",
            ProtocolState::Autosample => "autosample",
            ProtocolState::DirectAccess => "direct_access",
            ProtocolState::Test => "test",
        };
        f.write_str(label)
    }
}

/// Protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Fired on entering a state
    Enter,
    /// Fired on leaving a state
    Exit,
    /// Determine whether the instrument is idle or streaming
    Discover,
    /// Take one sample
    AcquireSample,
    /// Run the status commands
    AcquireStatus,
    /// Begin streaming
    StartAutosample,
    /// Stop streaming and return to a prompt
    StopAutosample,
    /// Read parameters
    Get,
    /// Assign a parameter
    Set,
    /// Request a fresh sample frame
    GetLatestSample,
    /// Enter the test state
    RunTest,
    /// Run the self-test commands and leave the test state
    ExecuteTest,
    /// Hand the connection to an operator
    StartDirect,
    /// Return to the mode direct access was entered from
    StopDirect,
    /// Send operator bytes verbatim
    ExecuteDirect,
}

/// Arguments carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventArgs {
    /// No arguments
    #[default]
    None,
    /// Parameter assignment for [`ProtocolEvent::Set`]
    Set {
        /// Parameter name
        name: String,
        /// Value to assign
        value: String,
    },
    /// Raw bytes for [`ProtocolEvent::ExecuteDirect`]
    Direct(Bytes),
}

/// Value an event hands back to its caller.
#[derive(Debug)]
pub enum EventResult {
    /// Nothing to report
    None,
    /// Captured response lines
    Lines(Vec<String>),
    /// A sample frame
    Sample(Frame),
    /// Bytes written in direct access
    Sent(usize),
    /// Outcome of the self-test; the protocol is back in `Command` either way
    TestOutcome(ProtocolResult<Vec<String>>),
}

impl EventResult {
    /// Captured lines, empty for non-line results.
    pub fn into_lines(self) -> Vec<String> {
        match self {
            EventResult::Lines(lines) => lines,
            _ => Vec::new(),
        }
    }
}

/// Everything a handler may touch.
#[derive(Debug)]
pub struct ProtocolContext {
    config: ProtocolConfig,
    engine: TransactionEngine,
    obs: Arc<Observability>,
    breaker: Option<BreakSignal>,
    direct: DirectAccess,
    resume: parking_lot::Mutex<Option<ProtocolState>>,
}

impl ProtocolContext {
    /// Configuration in effect.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Transaction engine on the instrument connection.
    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    /// Observability handle.
    pub fn observability(&self) -> &Arc<Observability> {
        &self.obs
    }

    /// Out-of-band break, if configured.
    pub fn break_signal(&self) -> Option<&BreakSignal> {
        self.breaker.as_ref()
    }

    fn response_timeout(&self) -> Duration {
        self.config.timing.response_timeout()
    }

    async fn wake(&self) -> ProtocolResult<Vec<String>> {
        self.engine
            .discover_state(self.config.timing.discover_attempts, self.config.timing.discover_timeout())
            .await
    }

    async fn run_each(&self, commands: &[String]) -> ProtocolResult<Vec<String>> {
        let mut lines = Vec::new();
        for command in commands {
            lines.extend(
                self.engine
                    .send_and_expect_prompt(command, self.response_timeout())
                    .await?,
            );
        }
        Ok(lines)
    }
}

/// Shared handler context.
pub type Ctx = Arc<ProtocolContext>;

/// State machine type used by the protocol.
pub type ProtocolFsm = Fsm<ProtocolState, ProtocolEvent, Ctx, EventArgs, EventResult>;

/// Handler signature for custom table entries.
pub type ProtocolHandler = Handler<ProtocolState, Ctx, EventArgs, EventResult>;

type Outcome = HandlerFuture<ProtocolState, EventResult>;

fn required<'a>(command: &'a Option<String>, what: &str) -> ProtocolResult<&'a str> {
    command
        .as_deref()
        .ok_or_else(|| ProtocolError::InvalidArgument(format!("no {what} command configured")))
}

// =============================================================================
// Handlers
// =============================================================================

fn noop(_ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async { Ok(Transition::stay(EventResult::None)) })
}

fn discover(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let mode = StateProbe::from_timing(&ctx.engine, &ctx.config.timing).probe().await?;
        let next = match mode {
            DiscoveredMode::Command => ProtocolState::Command,
            DiscoveredMode::Autosample => ProtocolState::Autosample,
        };
        Ok(Transition::to(next, EventResult::None))
    })
}

fn acquire_sample(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let command = required(&ctx.config.commands.acquire_sample, "acquire_sample")?;
        let lines = ctx
            .engine
            .send_and_expect_prompt(command, ctx.response_timeout())
            .await?;
        Ok(Transition::stay(EventResult::Lines(lines)))
    })
}

fn acquire_status(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let lines = ctx.run_each(&ctx.config.commands.acquire_status).await?;
        Ok(Transition::stay(EventResult::Lines(lines)))
    })
}

fn acquire_status_streaming(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        ctx.wake().await?;
        let lines = ctx.run_each(&ctx.config.commands.acquire_status).await?;
        Ok(Transition::stay(EventResult::Lines(lines)))
    })
}

fn start_autosample(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let command = required(&ctx.config.commands.start_autosample, "start_autosample")?;
        let lines = ctx
            .engine
            .send_and_expect_prompt(command, ctx.response_timeout())
            .await?;
        Ok(Transition::to(ProtocolState::Autosample, EventResult::Lines(lines)))
    })
}

fn stop_autosample(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        // A break alone ends autosample; the stop command is the fallback.
        let lines = match (&ctx.breaker, &ctx.config.commands.stop_autosample) {
            (Some(breaker), _) => {
                breaker.send().await?;
                ctx.wake().await?
            }
            (None, Some(stop)) => {
                ctx.wake().await?;
                ctx.engine.send_and_expect_prompt(stop, ctx.response_timeout()).await?
            }
            (None, None) => {
                return Err(ProtocolError::InvalidArgument("no stop_autosample command configured".into()))
            }
        };
        Ok(Transition::to(ProtocolState::Command, EventResult::Lines(lines)))
    })
}

fn get(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let command = required(&ctx.config.commands.get, "get")?;
        let lines = ctx
            .engine
            .send_and_expect_prompt(command, ctx.response_timeout())
            .await?;
        Ok(Transition::stay(EventResult::Lines(lines)))
    })
}

fn set(ctx: Ctx, args: EventArgs) -> Outcome {
    Box::pin(async move {
        let EventArgs::Set { name, value } = args else {
            return Err(ProtocolError::InvalidArgument("Set requires a name and value".into()));
        };
        let command = ctx.config.set_command(&name, &value)?;
        let lines = ctx
            .engine
            .send_and_expect_prompt(&command, ctx.response_timeout())
            .await?;
        if let Some(echo) = ctx.config.set_echo(&name, &value) {
            if !lines.iter().any(|line| line.trim().eq_ignore_ascii_case(echo.trim())) {
                let reason = format!("expected echo '{echo}'");
                return Err(ctx.engine.reject(&command, reason, lines.join("\n")));
            }
        }
        Ok(Transition::stay(EventResult::Lines(lines)))
    })
}

fn get_latest_sample(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let commands = &ctx.config.commands;
        let command = required(&commands.latest_sample, "latest_sample")?;
        let label = required(&commands.latest_sample_label, "latest_sample_label")?;
        let frame = ctx
            .engine
            .request_latest(command, label, ctx.response_timeout())
            .await?;
        Ok(Transition::stay(EventResult::Sample(frame)))
    })
}

fn run_test(_ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async { Ok(Transition::to(ProtocolState::Test, EventResult::None)) })
}

fn execute_test(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let outcome = ctx.run_each(&ctx.config.commands.run_test).await;
        if let Err(e) = &outcome {
            info!(error = %e, "Self-test failed");
        }
        Ok(Transition::to(ProtocolState::Command, EventResult::TestOutcome(outcome)))
    })
}

fn start_direct(from: ProtocolState) -> impl Fn(Ctx, EventArgs) -> Outcome + Send + Sync + 'static {
    move |ctx: Ctx, _args: EventArgs| -> Outcome {
        Box::pin(async move {
            *ctx.resume.lock() = Some(from);
            Ok(Transition::to(ProtocolState::DirectAccess, EventResult::None))
        })
    }
}

fn stop_direct(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        let back = ctx.resume.lock().take().unwrap_or(ProtocolState::Command);
        Ok(Transition::to(back, EventResult::None))
    })
}

fn execute_direct(ctx: Ctx, args: EventArgs) -> Outcome {
    Box::pin(async move {
        let EventArgs::Direct(data) = args else {
            return Err(ProtocolError::InvalidArgument("ExecuteDirect requires data".into()));
        };
        let sent = ctx.direct.execute(&ctx.engine, &data).await?;
        Ok(Transition::stay(EventResult::Sent(sent)))
    })
}

fn enter_direct(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        ctx.direct.open(ctx.engine.receive_state());
        Ok(Transition::stay(EventResult::None))
    })
}

fn exit_direct(ctx: Ctx, _args: EventArgs) -> Outcome {
    Box::pin(async move {
        ctx.direct.close(ctx.engine.receive_state());
        Ok(Transition::stay(EventResult::None))
    })
}

/// Builds the transition table for `config`.
///
/// `has_break` registers `StopAutosample` even without a stop command, since the
/// break itself ends autosample.
pub fn standard_table(config: &ProtocolConfig, has_break: bool) -> ProtocolFsm {
    use ProtocolEvent as E;
    use ProtocolState as S;

    let commands = &config.commands;
    let mut fsm = ProtocolFsm::new(E::Enter, E::Exit);

    for state in [S::Unknown, S::Command, S::Autosample, S::Test] {
        fsm.add_handler(state, E::Enter, noop);
        fsm.add_handler(state, E::Exit, noop);
    }
    fsm.add_handler(S::DirectAccess, E::Enter, enter_direct);
    fsm.add_handler(S::DirectAccess, E::Exit, exit_direct);

    fsm.add_handler(S::Unknown, E::Discover, discover);

    if commands.acquire_sample.is_some() {
        fsm.add_handler(S::Command, E::AcquireSample, acquire_sample);
    }
    if !commands.acquire_status.is_empty() {
        fsm.add_handler(S::Command, E::AcquireStatus, acquire_status);
        fsm.add_handler(S::Autosample, E::AcquireStatus, acquire_status_streaming);
    }
    if commands.start_autosample.is_some() {
        fsm.add_handler(S::Command, E::StartAutosample, start_autosample);
    }
    if has_break || commands.stop_autosample.is_some() {
        fsm.add_handler(S::Autosample, E::StopAutosample, stop_autosample);
    }
    if commands.get.is_some() {
        fsm.add_handler(S::Command, E::Get, get);
    }
    if commands.set_template.is_some() {
        fsm.add_handler(S::Command, E::Set, set);
    }
    if commands.latest_sample.is_some() && commands.latest_sample_label.is_some() {
        fsm.add_handler(S::Command, E::GetLatestSample, get_latest_sample);
    }
    if !commands.run_test.is_empty() {
        fsm.add_handler(S::Command, E::RunTest, run_test);
        fsm.add_handler(S::Test, E::ExecuteTest, execute_test);
    }

    fsm.add_handler(S::Command, E::StartDirect, start_direct(S::Command));
    fsm.add_handler(S::Autosample, E::StartDirect, start_direct(S::Autosample));
    fsm.add_handler(S::DirectAccess, E::ExecuteDirect, execute_direct);
    fsm.add_handler(S::DirectAccess, E::StopDirect, stop_direct);

    fsm
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles an [`InstrumentProtocol`].
pub struct ProtocolBuilder {
    config: ProtocolConfig,
    frames: Arc<dyn FrameSink>,
    events: Arc<dyn EventSink>,
    break_connector: Option<Arc<dyn Connector>>,
    recognizers: Vec<Recognizer>,
    overrides: Vec<(ProtocolState, ProtocolEvent, ProtocolHandler)>,
}

impl fmt::Debug for ProtocolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolBuilder")
            .field("instrument", &self.config.instrument.id)
            .field("extra_recognizers", &self.recognizers.len())
            .field("overrides", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

impl ProtocolBuilder {
    /// Builder with sinks that discard everything.
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            frames: Arc::new(NullSink),
            events: Arc::new(NullSink),
            break_connector: None,
            recognizers: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// Publishes frames and events to these sinks.
    pub fn with_sinks(mut self, frames: Arc<dyn FrameSink>, events: Arc<dyn EventSink>) -> Self {
        self.frames = frames;
        self.events = events;
        self
    }

    /// Publishes frames and events over `sink`'s channels.
    pub fn with_channel_sink(self, sink: ChannelSink) -> Self {
        let sink = Arc::new(sink);
        self.with_sinks(sink.clone(), sink)
    }

    /// Opens the break channel through `connector` instead of TCP.
    pub fn with_break_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.break_connector = Some(connector);
        self
    }

    /// Adds a recognizer after the configured ones.
    pub fn with_recognizer(mut self, recognizer: Recognizer) -> Self {
        self.recognizers.push(recognizer);
        self
    }

    /// Replaces or adds the table entry for `(state, event)`.
    pub fn with_handler<F>(mut self, state: ProtocolState, event: ProtocolEvent, handler: F) -> Self
    where
        F: Fn(Ctx, EventArgs) -> HandlerFuture<ProtocolState, EventResult> + Send + Sync + 'static,
    {
        self.overrides.push((state, event, Arc::new(handler)));
        self
    }

    /// Starts the protocol on `stream` in `Unknown`.
    pub async fn connect(self, stream: DynStream) -> ProtocolResult<InstrumentProtocol> {
        let config = self.config;
        config.validate()?;

        let obs = Arc::new(Observability::new(
            config.instrument.id.clone(),
            self.frames,
            self.events,
        ));

        let mut recognizers = config.build_recognizers()?;
        recognizers.extend(self.recognizers);
        let chunker = FrameBuffer::new(recognizers).with_max_len(config.chunker.max_buffer);
        let engine = TransactionEngine::spawn(stream, chunker, EngineSettings::from_config(&config)?, obs.clone());

        let breaker = config.break_signal.clone().map(|break_config| {
            let newline = config.instrument.newline.clone();
            match &self.break_connector {
                Some(connector) => BreakSignal::new(connector.clone(), break_config, newline),
                None => BreakSignal::tcp(break_config, newline),
            }
        });

        let mut fsm = standard_table(&config, breaker.is_some());
        for (state, event, handler) in self.overrides {
            fsm.add_shared_handler(state, event, handler);
        }

        let ctx = Arc::new(ProtocolContext {
            direct: DirectAccess::new(config.direct_access.history),
            config,
            engine,
            obs: obs.clone(),
            breaker,
            resume: parking_lot::Mutex::new(None),
        });

        fsm.start(ctx.clone(), ProtocolState::Unknown)
            .instrument(obs.span().clone())
            .await?;
        info!(parent: obs.span(), "Protocol started");

        Ok(InstrumentProtocol {
            fsm: Mutex::new(fsm),
            ctx,
        })
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// A running instrument protocol.
///
/// Events are processed one at a time; a second caller waits for the first
/// event to finish.
#[derive(Debug)]
pub struct InstrumentProtocol {
    fsm: Mutex<ProtocolFsm>,
    ctx: Ctx,
}

impl InstrumentProtocol {
    /// Dispatches `event` with `args` in the current state.
    pub async fn handle(&self, event: ProtocolEvent, args: EventArgs) -> ProtocolResult<EventResult> {
        let mut fsm = self.fsm.lock().await;
        self.dispatch(&mut fsm, event, args).await
    }

    async fn dispatch(
        &self,
        fsm: &mut ProtocolFsm,
        event: ProtocolEvent,
        args: EventArgs,
    ) -> ProtocolResult<EventResult> {
        let span = self.ctx.obs.span().clone();
        let from = fsm.current_state();
        let outcome = fsm
            .on_event(self.ctx.clone(), event, args)
            .instrument(span)
            .await;
        let to = fsm.current_state();

        if let (Some(from), Some(to)) = (from, to) {
            if from != to {
                info!(parent: self.ctx.obs.span(), %from, %to, ?event, "Protocol state changed");
                self.ctx.obs.notify(DriverEvent::StateChange {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
        if let Err(e) = &outcome {
            debug!(parent: self.ctx.obs.span(), ?event, error = %e, "Event failed");
        }
        outcome
    }

    /// Current state.
    pub async fn current_state(&self) -> ProtocolState {
        self.fsm
            .lock()
            .await
            .current_state()
            .unwrap_or(ProtocolState::Unknown)
    }

    /// Events accepted in the current state, excluding Enter/Exit.
    pub async fn capabilities(&self) -> Vec<ProtocolEvent> {
        let fsm = self.fsm.lock().await;
        let state = fsm.current_state().unwrap_or(ProtocolState::Unknown);
        fsm.events_for(state)
    }

    /// Handler context.
    pub fn context(&self) -> &Ctx {
        &self.ctx
    }

    /// Observability handle.
    pub fn observability(&self) -> &Arc<Observability> {
        &self.ctx.obs
    }

    /// Determines whether the instrument is idle or streaming; returns the new state.
    pub async fn discover(&self) -> ProtocolResult<ProtocolState> {
        let mut fsm = self.fsm.lock().await;
        self.dispatch(&mut fsm, ProtocolEvent::Discover, EventArgs::None)
            .await?;
        Ok(fsm.current_state().unwrap_or(ProtocolState::Unknown))
    }

    /// Takes a single sample; returns the response lines.
    pub async fn acquire_sample(&self) -> ProtocolResult<Vec<String>> {
        Ok(self
            .handle(ProtocolEvent::AcquireSample, EventArgs::None)
            .await?
            .into_lines())
    }

    /// Runs the status commands; returns their combined lines.
    pub async fn acquire_status(&self) -> ProtocolResult<Vec<String>> {
        Ok(self
            .handle(ProtocolEvent::AcquireStatus, EventArgs::None)
            .await?
            .into_lines())
    }

    /// Starts streaming.
    pub async fn start_autosample(&self) -> ProtocolResult<Vec<String>> {
        Ok(self
            .handle(ProtocolEvent::StartAutosample, EventArgs::None)
            .await?
            .into_lines())
    }

    /// Stops streaming.
    pub async fn stop_autosample(&self) -> ProtocolResult<Vec<String>> {
        Ok(self
            .handle(ProtocolEvent::StopAutosample, EventArgs::None)
            .await?
            .into_lines())
    }

    /// Reads the instrument's parameters.
    pub async fn get(&self) -> ProtocolResult<Vec<String>> {
        Ok(self.handle(ProtocolEvent::Get, EventArgs::None).await?.into_lines())
    }

    /// Assigns `name = value` on the instrument.
    pub async fn set(&self, name: &str, value: &str) -> ProtocolResult<Vec<String>> {
        let args = EventArgs::Set {
            name: name.to_string(),
            value: value.to_string(),
        };
        Ok(self.handle(ProtocolEvent::Set, args).await?.into_lines())
    }

    /// Requests a fresh sample and returns its frame.
    pub async fn latest_sample(&self) -> ProtocolResult<Frame> {
        match self
            .handle(ProtocolEvent::GetLatestSample, EventArgs::None)
            .await?
        {
            EventResult::Sample(frame) => Ok(frame),
            other => Err(ProtocolError::InvalidArgument(format!(
                "GetLatestSample handler returned {other:?}"
            ))),
        }
    }

    /// Enters `Test`, runs the self-test commands, and returns to `Command`.
    pub async fn run_test(&self) -> ProtocolResult<Vec<String>> {
        let mut fsm = self.fsm.lock().await;
        self.dispatch(&mut fsm, ProtocolEvent::RunTest, EventArgs::None)
            .await?;
        match self
            .dispatch(&mut fsm, ProtocolEvent::ExecuteTest, EventArgs::None)
            .await?
        {
            EventResult::TestOutcome(outcome) => outcome,
            other => Ok(other.into_lines()),
        }
    }

    /// Enters direct access.
    pub async fn start_direct(&self) -> ProtocolResult<()> {
        self.handle(ProtocolEvent::StartDirect, EventArgs::None)
            .await
            .map(|_| ())
    }

    /// Sends operator bytes verbatim; returns the number written.
    pub async fn execute_direct(&self, data: impl Into<Bytes>) -> ProtocolResult<usize> {
        match self
            .handle(ProtocolEvent::ExecuteDirect, EventArgs::Direct(data.into()))
            .await?
        {
            EventResult::Sent(n) => Ok(n),
            _ => Ok(0),
        }
    }

    /// Leaves direct access, returning to the state it was entered from.
    pub async fn stop_direct(&self) -> ProtocolResult<()> {
        self.handle(ProtocolEvent::StopDirect, EventArgs::None)
            .await
            .map(|_| ())
    }

    /// Stops the reader, closes the connection, and releases observability.
    pub async fn shutdown(self) {
        self.ctx.engine.shutdown().await;
        self.ctx.obs.close();
    }
}
