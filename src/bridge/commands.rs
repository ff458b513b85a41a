//! Store commands derived from server updates
//!
//! The bridge never touches application state directly. Each update message
//! becomes a list of [`StoreCommand`]s handed to a [`CommandSink`], which the
//! embedding application implements against its own store.

use serde::Serialize;

use crate::protocol::{CloseInfo, Message, MessageType, UpdateAction, CLOSE_NORMAL};

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// Action the application store should take
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StoreCommand {
    FetchGuarantees,
    FetchGuaranteeStatistics,
    FetchAttendances,
    FetchAttendanceStatistics { committee_code: String },
    FetchVoteCounts { election_id: Option<String> },
    FetchElectionStatistics { election_id: Option<String> },
    FetchDashboard { dashboard_type: Option<String> },
    SetConnectionStatus { connected: bool },
    Notify(Notification),
}

impl StoreCommand {
    fn notify(message: &str, severity: Severity) -> Self {
        StoreCommand::Notify(Notification::new(message, severity))
    }
}

/// Receiver of store commands
///
/// Called from the connection's event task; implementations should hand the
/// command off rather than block.
pub trait CommandSink: Send + Sync {
    fn dispatch(&self, command: StoreCommand);
}

impl<F> CommandSink for F
where
    F: Fn(StoreCommand) + Send + Sync,
{
    fn dispatch(&self, command: StoreCommand) {
        self(command)
    }
}

/// Voting `action_type`s that mean fresh results were computed
const RESULT_ACTIONS: [&str; 2] = ["results_generated", "results_updated"];

/// Map an update message to store commands
///
/// Messages of any other type map to nothing.
pub fn commands_for(message: &Message) -> Vec<StoreCommand> {
    match &message.kind {
        MessageType::GuaranteeUpdate => guarantee_commands(message),
        MessageType::AttendanceUpdate => attendance_commands(message),
        MessageType::VotingUpdate => voting_commands(message),
        MessageType::DashboardUpdate => dashboard_commands(message),
        _ => Vec::new(),
    }
}

fn guarantee_commands(message: &Message) -> Vec<StoreCommand> {
    let notice = match message.action {
        Some(UpdateAction::Created) => StoreCommand::notify("New guarantee added", Severity::Success),
        Some(UpdateAction::Updated) => StoreCommand::notify("Guarantee updated", Severity::Info),
        Some(UpdateAction::Deleted) => StoreCommand::notify("Guarantee removed", Severity::Warning),
        _ => StoreCommand::notify("Guarantees changed", Severity::Info),
    };
    vec![
        StoreCommand::FetchGuarantees,
        StoreCommand::FetchGuaranteeStatistics,
        notice,
    ]
}

fn attendance_commands(message: &Message) -> Vec<StoreCommand> {
    let mut commands = vec![StoreCommand::FetchAttendances];
    if let Some(committee_code) = message.data_id("committee_code") {
        commands.push(StoreCommand::FetchAttendanceStatistics { committee_code });
    }
    commands.push(match message.action {
        Some(UpdateAction::Created) => StoreCommand::notify("Attendance recorded", Severity::Success),
        Some(UpdateAction::Deleted) => {
            StoreCommand::notify("Attendance record removed", Severity::Warning)
        }
        _ => StoreCommand::notify("Attendance updated", Severity::Info),
    });
    commands
}

fn voting_commands(message: &Message) -> Vec<StoreCommand> {
    let election_id = message.data_id("election_id");
    let results = message
        .data_field("action_type")
        .and_then(|value| value.as_str())
        .is_some_and(|action| RESULT_ACTIONS.contains(&action));

    let fetches = |election_id: Option<String>| {
        vec![
            StoreCommand::FetchVoteCounts {
                election_id: election_id.clone(),
            },
            StoreCommand::FetchElectionStatistics { election_id },
        ]
    };

    if results {
        let mut commands = fetches(election_id);
        commands.push(StoreCommand::notify("Election results updated", Severity::Success));
        return commands;
    }

    let mut commands = match election_id {
        Some(id) => fetches(Some(id)),
        None => Vec::new(),
    };
    commands.push(match message.action {
        Some(UpdateAction::Created) => StoreCommand::notify("New vote recorded", Severity::Success),
        Some(UpdateAction::Deleted) => StoreCommand::notify("Vote record removed", Severity::Warning),
        _ => StoreCommand::notify("Vote counts updated", Severity::Info),
    });
    commands
}

fn dashboard_commands(message: &Message) -> Vec<StoreCommand> {
    let dashboard_type = message
        .dashboard_type
        .clone()
        .or_else(|| message.data_id("dashboard_type"));
    vec![
        StoreCommand::FetchDashboard { dashboard_type },
        StoreCommand::notify("Dashboard updated", Severity::Info),
    ]
}

/// Commands for a connection that just opened
pub fn commands_for_connect() -> Vec<StoreCommand> {
    vec![StoreCommand::SetConnectionStatus { connected: true }]
}

/// Commands for a connection that just closed
pub fn commands_for_disconnect(close: &CloseInfo) -> Vec<StoreCommand> {
    let mut commands = vec![StoreCommand::SetConnectionStatus { connected: false }];
    if close.code != CLOSE_NORMAL {
        commands.push(StoreCommand::notify("Real-time connection lost", Severity::Warning));
    }
    commands
}

/// Commands for a connection error
pub fn commands_for_error() -> Vec<StoreCommand> {
    vec![StoreCommand::notify("Real-time connection error", Severity::Error)]
}
