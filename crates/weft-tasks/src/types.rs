use serde::{Deserialize, Serialize};
use std::fmt;

use weft_core::types::{ChannelTag, ChatId, Role, TaskId, UserId};

/// Task record schema version. A stored record with a different version is
/// treated as unreadable and the task is re-created on the next incoming
/// message.
pub const TASK_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingTool,
    AwaitingConfirmation,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingTool => "awaiting_tool",
            TaskStatus::AwaitingConfirmation => "awaiting_confirmation",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "awaiting_tool" => Ok(TaskStatus::AwaitingTool),
            "awaiting_confirmation" => Ok(TaskStatus::AwaitingConfirmation),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// One role-tagged fragment of the short-term conversation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    pub role: Role,
    pub text: String,
}

/// A unit of work triggered by one incoming message.
///
/// Mutated only by the orchestrator that owns the claim; all other workers
/// read but never write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub v: u32,
    pub id: TaskId,
    pub user_id: UserId,
    pub channel: ChannelTag,
    pub chat_id: ChatId,
    pub origin_message_id: String,
    pub status: TaskStatus,
    pub iterations: u32,
    pub window: Vec<WindowEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn new(
        id: TaskId,
        user_id: UserId,
        channel: ChannelTag,
        chat_id: ChatId,
        origin_message_id: String,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            v: TASK_SCHEMA_VERSION,
            id,
            user_id,
            channel,
            chat_id,
            origin_message_id,
            status: TaskStatus::Pending,
            iterations: 0,
            window: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::AwaitingTool,
            TaskStatus::AwaitingConfirmation,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            let parsed: TaskStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::AwaitingTool.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
