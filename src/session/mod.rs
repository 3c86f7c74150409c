//! Voice session lifecycle: the transition table and the actor that runs it.

pub mod controller;
pub mod state;

pub use controller::{SessionController, StatusSnapshot};
pub use state::{Action, SessionEvent, SessionStateMachine, Status};
