//! Generic asynchronous finite-state-machine engine.
//!
//! A [`Flow`] is built from a declarative transition table (enum-keyed, with
//! optional wildcard sources) and driven by [`Flow::fire`]. Each transition
//! runs a fixed hook protocol supplied by the caller through [`FlowHooks`]:
//!
//! 1. `before_event` — may veto the transition before any state change
//! 2. `leave_state` — failure here leaves the current state untouched
//! 3. the state changes (point of no return for observers)
//! 4. `change_state` — the canonical place to persist and publish
//! 5. `enter_state` — may return a follow-up event to chain
//! 6. `after_event`
//!
//! Hook failures after step 3 surface to the caller but the state keeps its
//! new value; forward progress wins over re-entrant rollback once side
//! effects may have started.
//!
//! A per-machine guard rejects concurrent transitions: while one event is in
//! flight, firing another fails fast with [`FlowError::TransitionInFlight`]
//! instead of interleaving hooks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::trace;

/// Boxed future returned by hook methods, so [`FlowHooks`] stays dyn-safe.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by [`Flow::fire`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError<S, E> {
    /// The event has no transition from the current state.
    #[error("event {event:?} inappropriate in current state {state:?}")]
    InvalidTransition { event: E, state: S },
    /// Another transition on this machine is still running.
    #[error("transition already in flight, event {event:?} rejected")]
    TransitionInFlight { event: E },
    /// The before-event hook returned false.
    #[error("event {event:?} vetoed by before-event hook")]
    Vetoed { event: E },
    /// A hook failed; `stage` names which one.
    #[error("{stage} hook failed during {event:?}: {message}")]
    Hook {
        stage: HookStage,
        event: E,
        message: String,
    },
}

impl<S, E> FlowError<S, E> {
    /// Wraps an arbitrary hook failure.
    pub fn hook(stage: HookStage, event: E, err: impl fmt::Display) -> Self {
        FlowError::Hook {
            stage,
            event,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeEvent,
    LeaveState,
    ChangeState,
    EnterState,
    AfterEvent,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookStage::BeforeEvent => "before-event",
            HookStage::LeaveState => "leave-state",
            HookStage::ChangeState => "change-state",
            HookStage::EnterState => "enter-state",
            HookStage::AfterEvent => "after-event",
        };
        f.write_str(name)
    }
}

/// One attempted transition, handed to every hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub event: E,
    pub from: S,
    pub to: S,
}

/// Lifecycle hooks run during a transition.
///
/// All methods have no-op defaults; implementors override the ones they
/// care about. Methods return boxed futures so the trait stays usable as a
/// trait object across protocol implementations.
pub trait FlowHooks<S, E>: Send + Sync
where
    S: Copy + fmt::Debug + Send + Sync + 'static,
    E: Copy + fmt::Debug + Send + Sync + 'static,
{
    /// Runs before any state change; returning `Ok(false)` vetoes the
    /// transition and `fire` reports [`FlowError::Vetoed`].
    fn before_event(&self, t: Transition<S, E>) -> HookFuture<'_, Result<bool, FlowError<S, E>>> {
        let _ = t;
        Box::pin(async { Ok(true) })
    }

    /// Runs while still in the source state; failure aborts the transition
    /// with the state unchanged.
    fn leave_state(&self, t: Transition<S, E>) -> HookFuture<'_, Result<(), FlowError<S, E>>> {
        let _ = t;
        Box::pin(async { Ok(()) })
    }

    /// Runs immediately after the state change; the canonical place to
    /// persist the new state and publish a lifecycle event.
    fn change_state(&self, t: Transition<S, E>) -> HookFuture<'_, Result<(), FlowError<S, E>>> {
        let _ = t;
        Box::pin(async { Ok(()) })
    }

    /// Runs in the destination state. May return a follow-up event which
    /// `fire` chains after this transition fully completes.
    fn enter_state(&self, t: Transition<S, E>) -> HookFuture<'_, Result<Option<E>, FlowError<S, E>>> {
        let _ = t;
        Box::pin(async { Ok(None) })
    }

    fn after_event(&self, t: Transition<S, E>) -> HookFuture<'_, Result<(), FlowError<S, E>>> {
        let _ = t;
        Box::pin(async { Ok(()) })
    }
}

struct RuleSet<S> {
    /// Source state -> destination.
    sources: HashMap<S, S>,
    /// Destination for the wildcard source, if declared.
    wildcard: Option<S>,
}

/// Builder for a [`Flow`] transition table.
pub struct FlowBuilder<S, E> {
    initial: S,
    rules: HashMap<E, RuleSet<S>>,
}

impl<S, E> FlowBuilder<S, E>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            rules: HashMap::new(),
        }
    }

    /// Declares `event` as valid from each state in `sources`, moving to `to`.
    pub fn on(mut self, event: E, sources: &[S], to: S) -> Self {
        let set = self.rules.entry(event).or_insert_with(|| RuleSet {
            sources: HashMap::new(),
            wildcard: None,
        });
        for s in sources {
            set.sources.insert(*s, to);
        }
        self
    }

    /// Declares `event` as valid from any state, moving to `to`.
    pub fn on_any(mut self, event: E, to: S) -> Self {
        let set = self.rules.entry(event).or_insert_with(|| RuleSet {
            sources: HashMap::new(),
            wildcard: None,
        });
        set.wildcard = Some(to);
        self
    }

    pub fn build(self) -> Flow<S, E> {
        Flow {
            rules: self.rules,
            current: Mutex::new(self.initial),
            in_flight: AtomicBool::new(false),
        }
    }
}

/// An asynchronous state machine instance.
pub struct Flow<S, E> {
    rules: HashMap<E, RuleSet<S>>,
    current: Mutex<S>,
    in_flight: AtomicBool,
}

/// Releases the in-flight guard when a transition step ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S, E> Flow<S, E>
where
    S: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    E: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn current(&self) -> S {
        *self.current.lock().unwrap()
    }

    /// True if `event` has a transition from the current state.
    pub fn can(&self, event: E) -> bool {
        self.destination(event, self.current()).is_some()
    }

    fn destination(&self, event: E, from: S) -> Option<S> {
        let set = self.rules.get(&event)?;
        set.sources.get(&from).copied().or(set.wildcard)
    }

    /// Fires `event`, running the full hook protocol, then chains any
    /// follow-up events returned by enter-state hooks.
    pub async fn fire(
        &self,
        event: E,
        hooks: &dyn FlowHooks<S, E>,
    ) -> Result<(), FlowError<S, E>> {
        let mut next = Some(event);
        while let Some(ev) = next.take() {
            next = self.step(ev, hooks).await?;
        }
        Ok(())
    }

    async fn step(
        &self,
        event: E,
        hooks: &dyn FlowHooks<S, E>,
    ) -> Result<Option<E>, FlowError<S, E>> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(FlowError::TransitionInFlight { event });
        }
        let _guard = InFlight(&self.in_flight);

        let from = self.current();
        let to = self
            .destination(event, from)
            .ok_or(FlowError::InvalidTransition { event, state: from })?;
        let t = Transition { event, from, to };
        trace!(?event, ?from, ?to, "transition");

        if !hooks.before_event(t).await? {
            return Err(FlowError::Vetoed { event });
        }

        // State is still `from` here, so a leave-state failure needs no
        // explicit rollback.
        hooks.leave_state(t).await?;

        *self.current.lock().unwrap() = to;

        hooks.change_state(t).await?;
        let follow_up = hooks.enter_state(t).await?;
        hooks.after_event(t).await?;

        Ok(follow_up)
    }
}
