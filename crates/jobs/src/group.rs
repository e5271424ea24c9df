//! Aggregate status of a job group.
//!
//! Read-only: group membership never changes how a member moves through its own
//! lifecycle.

use serde::{Deserialize, Serialize};

use crate::types::{Job, JobStatus};

/// Aggregate state of every job sharing a group id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    InProgress,
    /// Every member Completed.
    Completed,
    /// At least one member Failed.
    Failed,
    /// Every member terminal, none Failed, at least one Cancelled.
    Cancelled,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GroupStatus::InProgress)
    }
}

/// Per-status member counts of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProgress {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl GroupProgress {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut p = GroupProgress::default();
        for status in statuses {
            p.total += 1;
            match status {
                JobStatus::Queued => p.queued += 1,
                JobStatus::Running => p.running += 1,
                JobStatus::Completed => p.completed += 1,
                JobStatus::Failed => p.failed += 1,
                JobStatus::Cancelled => p.cancelled += 1,
            }
        }
        p
    }

    pub fn from_jobs<'a, I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a Job>,
    {
        Self::from_statuses(jobs.into_iter().map(|j| j.status))
    }

    pub fn status(&self) -> GroupStatus {
        if self.failed > 0 {
            GroupStatus::Failed
        } else if self.completed == self.total {
            GroupStatus::Completed
        } else if self.queued + self.running == 0 {
            GroupStatus::Cancelled
        } else {
            GroupStatus::InProgress
        }
    }
}
