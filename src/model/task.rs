//! Tasks and the status workflow they move through.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ParseEnumError;

/// Position of a task on the delivery board.
///
/// The happy path is
/// `INBOX -> READY -> IN_PROGRESS -> DONE -> QA_TESTING -> QA_PASSED -> (REVIEWING -> REVIEWED) -> SHIPPED`,
/// with `QA_FAILED` looping back to development.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Inbox,
    Ready,
    InProgress,
    Done,
    QaTesting,
    QaPassed,
    QaFailed,
    Reviewing,
    Reviewed,
    Shipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Inbox,
        TaskStatus::Ready,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::QaTesting,
        TaskStatus::QaPassed,
        TaskStatus::QaFailed,
        TaskStatus::Reviewing,
        TaskStatus::Reviewed,
        TaskStatus::Shipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Inbox => "INBOX",
            TaskStatus::Ready => "READY",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::QaTesting => "QA_TESTING",
            TaskStatus::QaPassed => "QA_PASSED",
            TaskStatus::QaFailed => "QA_FAILED",
            TaskStatus::Reviewing => "REVIEWING",
            TaskStatus::Reviewed => "REVIEWED",
            TaskStatus::Shipped => "SHIPPED",
        }
    }

    /// Whether the checked workflow allows moving from `self` to `next`.
    ///
    /// The unchecked status override on the HTTP surface bypasses this.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Inbox, Ready)
                | (Ready, InProgress)
                | (QaFailed, InProgress)
                | (InProgress, Done)
                | (Done, QaTesting)
                | (QaTesting, QaPassed)
                | (QaTesting, QaFailed)
                | (QaPassed, Reviewing)
                | (Reviewing, Reviewed)
                | (Reviewing, QaFailed)
                | (QaPassed, Shipped)
                | (Reviewed, Shipped)
        )
    }

    /// Whether a task in this status may be claimed by a developer.
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::QaFailed)
    }

    /// One-line hint telling an agent where this task sits in the workflow.
    pub fn workflow_hint(self) -> &'static str {
        match self {
            TaskStatus::Inbox => {
                "This task is new and needs to be triaged into actionable work."
            }
            TaskStatus::Ready => {
                "This task is ready for development. Claim it and implement the requirements."
            }
            TaskStatus::InProgress => {
                "This task is being worked on. Continue or complete the implementation."
            }
            TaskStatus::Done => "Development is complete. This task needs QA testing.",
            TaskStatus::QaTesting => "QA is actively testing this task.",
            TaskStatus::QaPassed => {
                "QA has verified this task. It may need code review or can be shipped."
            }
            TaskStatus::QaFailed => {
                "QA found issues. Review the feedback and fix the problems."
            }
            TaskStatus::Reviewing => "This task is under code review.",
            TaskStatus::Reviewed => "Code review passed. This task is ready to ship.",
            TaskStatus::Shipped => "This task has been deployed to production.",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("task status", s))
    }
}

/// Task priority, `P0` being the most urgent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }

    /// Sort rank, lower sorts first.
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Priority::P0),
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

/// T-shirt size estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Size {
    S,
    #[default]
    M,
    L,
    XL,
}

impl Size {
    pub fn as_str(self) -> &'static str {
        match self {
            Size::S => "S",
            Size::M => "M",
            Size::L => "L",
            Size::XL => "XL",
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Size {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S" => Ok(Size::S),
            "M" => Ok(Size::M),
            "L" => Ok(Size::L),
            "XL" => Ok(Size::XL),
            other => Err(ParseEnumError::new("size", other)),
        }
    }
}

/// A unit of work on the board.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub size: Size,
    pub assigned_to: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub value_statement: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub context: Option<String>,
    pub files_changed: Vec<String>,
    pub summary: Option<String>,
    pub review_required: bool,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
}

/// Input for creating a task. Only `title` is required.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub size: Option<Size>,
    pub value_statement: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub context: Option<String>,
    pub review_required: bool,
    pub sort_order: Option<i64>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Partial update of a task's editable fields. `None` leaves a field alone.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub size: Option<Size>,
    pub value_statement: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub context: Option<String>,
    pub review_required: Option<bool>,
    pub sort_order: Option<i64>,
    pub assigned_to: Option<String>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.size.is_none()
            && self.value_statement.is_none()
            && self.acceptance_criteria.is_none()
            && self.context.is_none()
            && self.review_required.is_none()
            && self.sort_order.is_none()
            && self.assigned_to.is_none()
    }
}

/// Filter for listing tasks. Empty `statuses` means any status.
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub assigned_to: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
