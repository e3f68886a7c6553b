use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Submitted,
    Approved,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
        }
    }

    /// `pending|rejected → submitted → approved|rejected`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!((self, next), (Pending, Submitted) | (Rejected, Submitted) | (Submitted, Approved) | (Submitted, Rejected))
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "submitted" => Ok(TaskStatus::Submitted),
            "approved" => Ok(TaskStatus::Approved),
            "rejected" => Ok(TaskStatus::Rejected),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

// Backend ids may be serial integers or uuids
fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid task id: {}", other))),
    }
}

/// One `master_tasks` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub task_description: String,
    /// Assignee username.
    pub name: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub given_by: Option<String>,
    #[serde(default)]
    pub planned_date: Option<NaiveDate>,
    #[serde(default)]
    pub actual_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub proof_url: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

/// Fields accepted when an assigner creates a task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub task_description: String,
    pub name: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub planned_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub assignee: Option<String>,
    pub status: Option<TaskStatus>,
    pub department: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, t: &Task) -> bool {
        self.assignee.as_ref().map_or(true, |a| &t.name == a)
            && self.status.map_or(true, |s| t.status == s)
            && self.department.as_ref().map_or(true, |d| t.department.as_ref() == Some(d))
    }
}
