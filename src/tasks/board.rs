use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::model::{NewTask, Task, TaskFilter, TaskStatus};
use super::repository::TaskRepository;
use crate::error::{AppError, AppResult};
use crate::identity::Role;

/// Task submission and review workflow over a repository.
#[derive(Clone)]
pub struct TaskBoard {
    repo: Arc<dyn TaskRepository>,
}

impl TaskBoard {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self { Self { repo } }

    /// Admins see every task; users only their own.
    pub async fn list_for(&self, username: &str, role: Role, status: Option<TaskStatus>) -> AppResult<Vec<Task>> {
        let filter = TaskFilter {
            assignee: (!role.is_admin()).then(|| username.to_string()),
            status,
            department: None,
        };
        Ok(self.repo.list(&filter).await?)
    }

    pub async fn pending_review(&self) -> AppResult<Vec<Task>> {
        let filter = TaskFilter { status: Some(TaskStatus::Submitted), ..Default::default() };
        Ok(self.repo.list(&filter).await?)
    }

    pub async fn assign(&self, given_by: &str, new: NewTask) -> AppResult<Task> {
        if new.task_description.trim().is_empty() {
            return Err(AppError::user("task_description_required", "task description is required"));
        }
        if new.name.trim().is_empty() {
            return Err(AppError::user("assignee_required", "assignee is required"));
        }
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_description: new.task_description.trim().to_string(),
            name: new.name.trim().to_string(),
            department: new.department,
            given_by: Some(given_by.to_string()),
            planned_date: new.planned_date,
            actual_date: None,
            status: TaskStatus::Pending,
            proof_url: None,
            remarks: None,
        };
        let saved = self.repo.insert(&task).await?;
        info!(target: "tasks", id = %saved.id, assignee = %saved.name, by = %given_by, "task assigned");
        Ok(saved)
    }

    /// Assignee submits completion proof.
    pub async fn submit(&self, username: &str, id: &str, proof_url: &str) -> AppResult<Task> {
        if proof_url.trim().is_empty() {
            return Err(AppError::user("proof_required", "completion proof is required"));
        }
        let mut task = self.load(id).await?;
        if task.name != username {
            return Err(AppError::forbidden("not_assignee", "task is assigned to another user"));
        }
        let prev = Self::transition(&mut task, TaskStatus::Submitted)?;
        task.proof_url = Some(proof_url.trim().to_string());
        task.actual_date = Some(Utc::now());
        let saved = self.store(&task, prev).await?;
        info!(target: "tasks", id = %saved.id, user = %username, "proof submitted");
        Ok(saved)
    }

    pub async fn approve(&self, reviewer: &str, id: &str, remarks: Option<String>) -> AppResult<Task> {
        self.review(reviewer, id, TaskStatus::Approved, remarks).await
    }

    pub async fn reject(&self, reviewer: &str, id: &str, remarks: Option<String>) -> AppResult<Task> {
        self.review(reviewer, id, TaskStatus::Rejected, remarks).await
    }

    async fn review(&self, reviewer: &str, id: &str, next: TaskStatus, remarks: Option<String>) -> AppResult<Task> {
        let mut task = self.load(id).await?;
        let prev = Self::transition(&mut task, next)?;
        if let Some(r) = remarks.filter(|r| !r.trim().is_empty()) {
            task.remarks = Some(r);
        }
        let saved = self.store(&task, prev).await?;
        info!(target: "tasks", id = %saved.id, reviewer = %reviewer, status = %saved.status, "task reviewed");
        Ok(saved)
    }

    async fn load(&self, id: &str) -> AppResult<Task> {
        self.repo.get(id).await?
            .ok_or_else(|| AppError::not_found("task_not_found".to_string(), format!("task {} not found", id)))
    }

    /// Returns the status the task left.
    fn transition(task: &mut Task, next: TaskStatus) -> AppResult<TaskStatus> {
        if !task.status.can_transition_to(next) {
            return Err(AppError::conflict(
                "invalid_transition".to_string(),
                format!("task {} is {} and cannot become {}", task.id, task.status, next),
            ));
        }
        Ok(std::mem::replace(&mut task.status, next))
    }

    // The write only lands if nobody moved the task off `prev` since it was read.
    async fn store(&self, task: &Task, prev: TaskStatus) -> AppResult<Task> {
        self.repo.update(task, prev).await?.ok_or_else(|| {
            AppError::conflict(
                "invalid_transition".to_string(),
                format!("task {} changed while it was being updated", task.id),
            )
        })
    }
}
