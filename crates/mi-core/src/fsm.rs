//! Table-driven finite state machine.
//!
//! An [`Fsm`] maps `(state, event)` pairs to async handlers. Dispatching an event
//! that has no entry for the current state is an error
//! ([`ProtocolError::UnhandledEvent`]) and leaves the state untouched; the caller
//! decides whether that is fatal.
//!
//! ```text
//!   on_event(E) ──► handler(state, E) ──► Transition { next_state, result }
//!                                              │
//!                       next_state == Some(S') && S' != state
//!                                              │
//!                     Exit(state) ──► state = S' ──► Enter(S')
//! ```
//!
//! Handlers receive a clone of the machine's context value (usually an `Arc`) and
//! never the machine itself, so a handler cannot dispatch into the machine that is
//! running it. Registration is last-write-wins, which lets an instrument profile
//! override individual entries of a standard table.

use crate::error::{ProtocolError, ProtocolResult};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outcome of a handler: an optional next state plus the value returned to the
/// caller of [`Fsm::on_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, R> {
    /// `None` means "handled, no transition".
    pub next_state: Option<S>,
    /// Value handed back to the dispatcher.
    pub result: R,
}

impl<S, R> Transition<S, R> {
    /// Handled without changing state.
    pub fn stay(result: R) -> Self {
        Self {
            next_state: None,
            result,
        }
    }

    /// Handled, move to `state`.
    pub fn to(state: S, result: R) -> Self {
        Self {
            next_state: Some(state),
            result,
        }
    }
}

/// Future returned by a handler.
pub type HandlerFuture<S, R> = BoxFuture<'static, ProtocolResult<Transition<S, R>>>;

/// Boxed handler for one `(state, event)` entry.
pub type Handler<S, C, A, R> = Arc<dyn Fn(C, A) -> HandlerFuture<S, R> + Send + Sync>;

/// Generic state machine over states `S`, events `E`, context `C`, event
/// arguments `A` and handler results `R`.
pub struct Fsm<S, E, C, A, R> {
    current: Option<S>,
    enter: E,
    exit: E,
    handlers: BTreeMap<(S, E), Handler<S, C, A, R>>,
}

impl<S, E, C, A, R> Fsm<S, E, C, A, R>
where
    S: Copy + Ord + Debug + Send + Sync + 'static,
    E: Copy + Ord + Debug + Send + Sync + 'static,
    C: Clone + Send + 'static,
    A: Default + Send + 'static,
    R: Send + 'static,
{
    /// Creates an unstarted machine. `enter` and `exit` are the event ids fired on
    /// transitions.
    pub fn new(enter: E, exit: E) -> Self {
        Self {
            current: None,
            enter,
            exit,
            handlers: BTreeMap::new(),
        }
    }

    /// Registers `handler` for `(state, event)`, replacing any previous handler.
    pub fn add_handler<F>(&mut self, state: S, event: E, handler: F)
    where
        F: Fn(C, A) -> HandlerFuture<S, R> + Send + Sync + 'static,
    {
        self.add_shared_handler(state, event, Arc::new(handler));
    }

    /// Same as [`add_handler`](Self::add_handler) for an already shared handler.
    pub fn add_shared_handler(&mut self, state: S, event: E, handler: Handler<S, C, A, R>) {
        if self.handlers.insert((state, event), handler).is_some() {
            trace!(?state, ?event, "Replaced transition handler");
        }
    }

    /// Current state, `None` until [`start`](Self::start) has run.
    pub fn current_state(&self) -> Option<S> {
        self.current
    }

    /// Events with a handler in `state`, excluding Enter/Exit.
    pub fn events_for(&self, state: S) -> Vec<E> {
        self.handlers
            .keys()
            .filter(|(s, e)| *s == state && *e != self.enter && *e != self.exit)
            .map(|(_, e)| *e)
            .collect()
    }

    /// Whether `(state, event)` has a handler.
    pub fn handles(&self, state: S, event: E) -> bool {
        self.handlers.contains_key(&(state, event))
    }

    /// Sets the initial state and fires its Enter handler.
    pub async fn start(&mut self, ctx: C, initial: S) -> ProtocolResult<()> {
        debug!(state = ?initial, "Starting state machine");
        self.current = Some(initial);
        self.fire(ctx, initial, self.enter).await
    }

    /// Dispatches `event` to the handler for the current state.
    ///
    /// On a transition, Exit(old) runs before the state is updated and Enter(new)
    /// runs after. A failing Exit leaves the state unchanged; a failing Enter is
    /// reported after the state has already moved.
    pub async fn on_event(&mut self, ctx: C, event: E, args: A) -> ProtocolResult<R> {
        let state = self.current.ok_or_else(|| ProtocolError::UnhandledEvent {
            state: "not started".to_string(),
            event: format!("{event:?}"),
        })?;

        let handler = self
            .handlers
            .get(&(state, event))
            .cloned()
            .ok_or_else(|| ProtocolError::UnhandledEvent {
                state: format!("{state:?}"),
                event: format!("{event:?}"),
            })?;

        let Transition { next_state, result } = handler(ctx.clone(), args).await?;

        if let Some(next) = next_state {
            if next != state {
                self.fire(ctx.clone(), state, self.exit).await?;
                debug!(from = ?state, to = ?next, ?event, "State transition");
                self.current = Some(next);
                self.fire(ctx, next, self.enter).await?;
            }
        }

        Ok(result)
    }

    async fn fire(&self, ctx: C, state: S, event: E) -> ProtocolResult<()> {
        let Some(handler) = self.handlers.get(&(state, event)).cloned() else {
            return Ok(());
        };
        let transition = handler(ctx, A::default()).await?;
        if let Some(next) = transition.next_state {
            warn!(?state, ?event, ignored = ?next, "Enter/Exit handler requested a transition");
        }
        Ok(())
    }
}

impl<S: Debug, E: Debug, C, A, R> Debug for Fsm<S, E, C, A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("current", &self.current)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
