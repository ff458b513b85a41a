//! Message dispatch module
//!
//! Fans inbound server messages out to registered handlers, and provides the
//! listener lists the connection manager uses for its lifecycle hooks.

mod dispatcher;
mod listeners;

pub use dispatcher::*;
pub use listeners::*;
