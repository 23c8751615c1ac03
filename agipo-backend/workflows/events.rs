use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    /// Node ids of the chain the event belongs to, if any.
    pub chain: Option<Vec<String>>,
    pub event_type: RunEventType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    ChainStarted,
    Output,
    ChainCompleted,
    ChainFailed,
    RunCompleted,
    InstallStarted,
    InstallCompleted,
    InstallFailed,
}
