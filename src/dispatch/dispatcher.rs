//! Inbound message dispatcher
//!
//! Routes parsed server messages to the listeners registered for their type,
//! followed by the wildcard listeners. Heartbeat acknowledgements stop here.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::{Listener, Listeners, Subscription};
use crate::protocol::{Message, MessageType, ProtocolResult};

/// Wire name of the wildcard topic
pub const WILDCARD: &str = "*";

/// What a handler subscribes to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Messages of exactly this type
    Type(MessageType),
    /// Every dispatched message
    Any,
}

impl From<MessageType> for Topic {
    fn from(kind: MessageType) -> Self {
        Topic::Type(kind)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        if name == WILDCARD {
            Topic::Any
        } else {
            Topic::Type(MessageType::from(name))
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Type(kind) => write!(f, "{}", kind),
            Topic::Any => f.write_str(WILDCARD),
        }
    }
}

/// Result of dispatching one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Heartbeat acknowledgement, consumed without reaching any handler
    Pong,
    /// Delivered to this many handlers
    Delivered(usize),
}

/// Routes messages to handlers by type
#[derive(Clone, Default)]
pub struct Dispatcher {
    routes: Arc<Mutex<HashMap<Topic, Listeners<Message>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic
    pub fn on<F>(&self, topic: impl Into<Topic>, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let handler: Listener<Message> = Arc::new(handler);
        self.route(topic.into()).add(handler)
    }

    /// Number of handlers currently registered for a topic
    pub fn handler_count(&self, topic: impl Into<Topic>) -> usize {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.get(&topic.into()).map_or(0, Listeners::len)
    }

    /// Parse a text frame and dispatch it
    ///
    /// Malformed frames are returned as errors and reach no handler.
    pub fn dispatch_text(&self, text: &str) -> ProtocolResult<Dispatched> {
        let message = Message::from_json(text)?;
        Ok(self.dispatch(&message))
    }

    /// Dispatch an already parsed message
    pub fn dispatch(&self, message: &Message) -> Dispatched {
        if message.is_pong() {
            debug!("Heartbeat acknowledged");
            return Dispatched::Pong;
        }

        let (exact, wildcard) = {
            let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            (
                routes.get(&Topic::Type(message.kind.clone())).cloned(),
                routes.get(&Topic::Any).cloned(),
            )
        };

        let mut delivered = 0;
        for listeners in [exact, wildcard].into_iter().flatten() {
            delivered += listeners.emit(message);
        }

        debug!("Dispatched {} to {} handler(s)", message.kind, delivered);
        Dispatched::Delivered(delivered)
    }

    fn route(&self, topic: Topic) -> Listeners<Message> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.entry(topic).or_default().clone()
    }
}
