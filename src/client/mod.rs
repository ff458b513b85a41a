//! Reconnecting WebSocket client

mod endpoint;
mod error;
mod manager;
mod metrics;
mod token;
mod transport;

pub use endpoint::*;
pub use error::*;
pub use manager::*;
pub use metrics::*;
pub use token::*;
pub use transport::*;

#[cfg(test)]
pub(crate) use transport::mock;
