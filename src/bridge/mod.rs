//! Event bridge from update messages to application store commands

mod commands;
mod events;

pub use commands::*;
pub use events::*;
