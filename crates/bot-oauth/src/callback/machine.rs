//! Callback state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The listener executes the I/O implied by each action.
//!
//! ```text
//! Idle -> AwaitingCallback -> Validating -> Exchanging -> Done
//!               |                 |              |
//!               +-----------------+--------------+-------> Failed
//! ```
//!
//! Only `AwaitingCallback` accepts a callback. Once the machine has left it,
//! every further callback is answered with `RejectDuplicate`, so an
//! authorization code is exchanged at most once per run.

use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::error::Error;

/// Query parameters of the provider's redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug)]
pub enum CallbackState {
    /// Created, listener not yet accepting
    Idle { expected_state: String },
    /// Listener bound, waiting for the browser redirect
    AwaitingCallback { expected_state: String },
    /// A callback arrived and is being checked
    Validating,
    /// Code accepted, token request in flight
    Exchanging,
    /// Tokens obtained and persisted. Terminal.
    Done,
    /// Attempt aborted. Terminal.
    Failed,
}

impl CallbackState {
    pub fn new(expected_state: impl Into<String>) -> Self {
        CallbackState::Idle {
            expected_state: expected_state.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallbackState::Done | CallbackState::Failed)
    }

    /// Label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            CallbackState::Idle { .. } => "idle",
            CallbackState::AwaitingCallback { .. } => "awaiting_callback",
            CallbackState::Validating => "validating",
            CallbackState::Exchanging => "exchanging",
            CallbackState::Done => "done",
            CallbackState::Failed => "failed",
        }
    }

    /// Apply an event in place and return the action to execute.
    pub fn apply(&mut self, event: CallbackEvent) -> CallbackAction {
        let current = std::mem::replace(self, CallbackState::Failed);
        let (next, action) = handle_event(current, event);
        *self = next;
        action
    }
}

#[derive(Debug)]
pub enum CallbackEvent {
    /// Listener socket is bound and serving
    ListenerBound,
    /// Request hit the callback path
    CallbackReceived(CallbackParams),
    /// Outcome of [`validate`]
    Validated(Result<String, Error>),
    /// Token endpoint returned tokens and they were persisted
    ExchangeSucceeded,
    /// Token endpoint or persistence failed
    ExchangeFailed(Error),
    /// Overall wait window elapsed
    TimedOut(std::time::Duration),
}

#[derive(Debug)]
pub enum CallbackAction {
    /// Keep waiting for the redirect
    AwaitCallback,
    /// Check the parameters against the expected state
    Validate {
        params: CallbackParams,
        expected_state: String,
    },
    /// Exchange the code for tokens
    Exchange { code: String },
    /// Report success to the browser and stop
    Complete,
    /// Report failure to the browser and stop
    Fail(Error),
    /// Callback arrived outside `AwaitingCallback`; answer without side effects
    RejectDuplicate,
    /// No-op
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: CallbackState, event: CallbackEvent) -> (CallbackState, CallbackAction) {
    match (state, event) {
        // --- Idle ---
        (CallbackState::Idle { expected_state }, CallbackEvent::ListenerBound) => (
            CallbackState::AwaitingCallback { expected_state },
            CallbackAction::AwaitCallback,
        ),

        // --- AwaitingCallback ---
        (CallbackState::AwaitingCallback { expected_state }, CallbackEvent::CallbackReceived(params)) => (
            CallbackState::Validating,
            CallbackAction::Validate {
                params,
                expected_state,
            },
        ),

        (CallbackState::AwaitingCallback { .. }, CallbackEvent::TimedOut(window)) => {
            (CallbackState::Failed, CallbackAction::Fail(Error::Timeout(window)))
        }

        // --- Validating ---
        (CallbackState::Validating, CallbackEvent::Validated(Ok(code))) => {
            (CallbackState::Exchanging, CallbackAction::Exchange { code })
        }

        (CallbackState::Validating, CallbackEvent::Validated(Err(e))) => {
            (CallbackState::Failed, CallbackAction::Fail(e))
        }

        // --- Exchanging ---
        (CallbackState::Exchanging, CallbackEvent::ExchangeSucceeded) => {
            (CallbackState::Done, CallbackAction::Complete)
        }

        (CallbackState::Exchanging, CallbackEvent::ExchangeFailed(e)) => {
            (CallbackState::Failed, CallbackAction::Fail(e))
        }

        // --- Duplicate or late callbacks ---
        (state, CallbackEvent::CallbackReceived(_)) => (state, CallbackAction::RejectDuplicate),

        // Anything else leaves the state untouched
        (state, _) => (state, CallbackAction::None),
    }
}

/// Validate a callback against the state embedded in the authorization request.
///
/// The state check runs first so that a forged request cannot elicit any
/// other outcome. Comparison is constant-time.
pub fn validate(params: &CallbackParams, expected_state: &str) -> Result<String, Error> {
    let state = params.state.as_deref().ok_or(Error::InvalidState)?;
    if !bool::from(state.as_bytes().ct_eq(expected_state.as_bytes())) {
        return Err(Error::InvalidState);
    }

    if let Some(error) = &params.error {
        return Err(Error::ProviderDenied {
            error: error.clone(),
            description: params.error_description.clone(),
        });
    }

    params
        .code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .ok_or(Error::MissingCode)
}
