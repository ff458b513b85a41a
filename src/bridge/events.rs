//! Event bridge
//!
//! Wires a [`ConnectionManager`] to a [`CommandSink`]: domain update messages
//! become store refreshes and notifications, lifecycle hooks become connection
//! status updates. Dropping the bridge tears everything down.

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    commands_for, commands_for_connect, commands_for_disconnect, commands_for_error, CommandSink,
    StoreCommand,
};
use crate::client::ConnectionManager;
use crate::dispatch::Subscription;
use crate::protocol::MessageType;

/// Message types the bridge turns into store commands
pub const BRIDGED_TYPES: [MessageType; 4] = [
    MessageType::GuaranteeUpdate,
    MessageType::AttendanceUpdate,
    MessageType::VotingUpdate,
    MessageType::DashboardUpdate,
];

pub struct EventBridge {
    manager: ConnectionManager,
    subscriptions: Vec<Subscription>,
    shut_down: bool,
}

impl EventBridge {
    /// Register the bridge handlers without connecting
    pub fn attach(manager: ConnectionManager, sink: Arc<dyn CommandSink>) -> Self {
        let mut subscriptions = Vec::with_capacity(BRIDGED_TYPES.len() + 3);

        for kind in BRIDGED_TYPES {
            let sink = Arc::clone(&sink);
            subscriptions.push(manager.on(kind, move |message| {
                debug!("Bridging {} message", message.kind);
                forward(sink.as_ref(), commands_for(message));
            }));
        }

        let on_connect = Arc::clone(&sink);
        subscriptions.push(manager.on_connect(move || {
            forward(on_connect.as_ref(), commands_for_connect());
        }));

        let on_disconnect = Arc::clone(&sink);
        subscriptions.push(manager.on_disconnect(move |close| {
            forward(on_disconnect.as_ref(), commands_for_disconnect(close));
        }));

        let on_error = sink;
        subscriptions.push(manager.on_error(move |_| {
            forward(on_error.as_ref(), commands_for_error());
        }));

        Self {
            manager,
            subscriptions,
            shut_down: false,
        }
    }

    /// Register the bridge handlers and connect with the manager's token provider
    pub async fn start(manager: ConnectionManager, sink: Arc<dyn CommandSink>) -> Self {
        let bridge = Self::attach(manager, sink);
        bridge.manager.connect(None).await;
        bridge
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Remove every handler and close the connection
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.manager.disconnect();
        info!("Event bridge shut down");
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward(sink: &dyn CommandSink, commands: Vec<StoreCommand>) {
    for command in commands {
        sink.dispatch(command);
    }
}
