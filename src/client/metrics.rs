//! Connection metrics and health snapshots

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::ConnectionState;

/// Connection counters
///
/// Values handed out by the manager are copies; mutating one changes nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    /// Reconnects scheduled since the last successful open
    pub reconnect_count: u32,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Point-in-time health report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub is_connected: bool,
    pub state: ConnectionState,
    /// Time since the last inbound frame; `None` before the first one
    #[serde(rename = "last_message_age_ms", serialize_with = "as_millis")]
    pub last_message_age: Option<Duration>,
    pub metrics: ConnectionMetrics,
}

impl HealthStatus {
    /// Healthy means connected and not silent for longer than `stale_after`
    pub fn evaluate(
        state: ConnectionState,
        last_message_age: Option<Duration>,
        stale_after: Duration,
        metrics: ConnectionMetrics,
    ) -> Self {
        let is_connected = state == ConnectionState::Open;
        let fresh = last_message_age.map_or(true, |age| age < stale_after);
        Self {
            is_healthy: is_connected && fresh,
            is_connected,
            state,
            last_message_age,
            metrics,
        }
    }
}

fn as_millis<S: Serializer>(age: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match age {
        Some(age) => serializer.serialize_some(&(age.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}
