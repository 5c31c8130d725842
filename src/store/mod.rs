//! The store: operation engine, sessions, and the checkpoint state machine.

mod contexts;
mod engine;
mod functions;
mod pending_io;
mod phases;
mod session;
mod state;

pub use contexts::CompletedOp;
pub use engine::TideKv;
pub use functions::{StoreFunctions, U64AddFunctions};
pub use session::Session;
pub use state::{Action, Phase, SystemState};
