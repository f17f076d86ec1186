//! Local redirect handling: the pure [`machine`] and the axum [`listener`]
//! that drives it.

pub mod listener;
pub mod machine;

pub use listener::{CallbackListener, ListenerOptions, PendingAuthorization};
pub use machine::{CallbackAction, CallbackEvent, CallbackParams, CallbackState, handle_event, validate};
