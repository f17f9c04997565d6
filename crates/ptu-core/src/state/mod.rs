//! Device state machine.

pub mod handlers;
pub mod machine;

pub use handlers::{HandlerContext, PollPlan, TransitionSettings, determine_state, set_state};
pub use machine::{DeviceState, FlashLoader, StateContext};
