//! Supervisor module for child process lifecycle and line-streamed output.

mod error;
mod lines;
mod runner;
mod shutdown;
mod spawn;
mod state;

pub use error::*;
pub use lines::*;
pub use runner::*;
pub use state::*;
