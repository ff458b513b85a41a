//! Wire protocol module
//!
//! Message envelope and close codes shared with the election-updates server.

mod close;
mod message;

pub use close::*;
pub use message::*;
