// Handlers module - one handler per instruction variant.

pub mod delegated_handler;
pub mod exit_handler;
pub mod file_handler;
pub mod handler;
pub mod script_handler;

pub use handler::{Handler, HandlerRegistry, StepContext, StepOutcome};
