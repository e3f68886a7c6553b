use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::model::{Task, TaskFilter, TaskStatus};
use crate::backend::BackendClient;

const TASKS_TABLE: &str = "master_tasks";

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;
    async fn get(&self, id: &str) -> Result<Option<Task>>;
    async fn insert(&self, task: &Task) -> Result<Task>;
    /// Replace the stored row with the same id, provided its status is still
    /// `expected`. `Ok(None)` when no row matched.
    async fn update(&self, task: &Task, expected: TaskStatus) -> Result<Option<Task>>;
}

pub struct RestTaskRepository {
    client: BackendClient,
}

impl RestTaskRepository {
    pub fn new(client: BackendClient) -> Self { Self { client } }
}

fn first(mut rows: Vec<Task>, what: &str) -> Result<Task> {
    if rows.is_empty() { return Err(anyhow!("{} returned no row", what)); }
    Ok(rows.remove(0))
}

#[async_trait]
impl TaskRepository for RestTaskRepository {
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut q = Vec::new();
        if let Some(a) = &filter.assignee { q.push(BackendClient::eq("name", a)); }
        if let Some(s) = filter.status { q.push(BackendClient::eq("status", s.as_str())); }
        if let Some(d) = &filter.department { q.push(BackendClient::eq("department", d)); }
        self.client.select(TASKS_TABLE, &q).await
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let mut rows: Vec<Task> = self.client.select(TASKS_TABLE, &[BackendClient::eq("id", id)]).await?;
        if rows.len() > 1 { return Err(anyhow!("{} rows for task {}", rows.len(), id)); }
        Ok(rows.pop())
    }

    async fn insert(&self, task: &Task) -> Result<Task> {
        let rows: Vec<Task> = self.client.insert(TASKS_TABLE, task).await?;
        first(rows, "task insert")
    }

    async fn update(&self, task: &Task, expected: TaskStatus) -> Result<Option<Task>> {
        let filters = [BackendClient::eq("id", &task.id), BackendClient::eq("status", expected.as_str())];
        let mut rows: Vec<Task> = self.client.update(TASKS_TABLE, &filters, task).await?;
        if rows.len() > 1 { return Err(anyhow!("task update matched {} rows for {}", rows.len(), task.id)); }
        Ok(rows.pop())
    }
}

/// In-process task table, ordered by id.
#[derive(Default)]
pub struct MemoryTaskRepository {
    rows: RwLock<BTreeMap<String, Task>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self { Self::default() }

    pub fn from_tasks<I: IntoIterator<Item = Task>>(tasks: I) -> Self {
        let r = Self::new();
        {
            let mut m = r.rows.write();
            for t in tasks { m.insert(t.id.clone(), t); }
        }
        r
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.rows.read().values().filter(|t| filter.matches(t)).cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.rows.read().get(id).cloned())
    }

    async fn insert(&self, task: &Task) -> Result<Task> {
        let mut m = self.rows.write();
        if m.contains_key(&task.id) { return Err(anyhow!("task {} already exists", task.id)); }
        m.insert(task.id.clone(), task.clone());
        Ok(task.clone())
    }

    async fn update(&self, task: &Task, expected: TaskStatus) -> Result<Option<Task>> {
        let mut m = self.rows.write();
        match m.get_mut(&task.id) {
            Some(slot) if slot.status == expected => {
                *slot = task.clone();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(id: &str) -> Task {
        Task {
            id: id.into(), task_description: "Check fire exits".into(), name: "bob".into(),
            department: None, given_by: None, planned_date: None, actual_date: None,
            status: TaskStatus::Submitted, proof_url: Some("p".into()), remarks: None,
        }
    }

    #[tokio::test]
    async fn memory_update_is_conditional_on_status() {
        let repo = MemoryTaskRepository::from_tasks([submitted("7")]);
        let approved = Task { status: TaskStatus::Approved, ..submitted("7") };
        let rejected = Task { status: TaskStatus::Rejected, ..submitted("7") };
        assert!(repo.update(&approved, TaskStatus::Submitted).await.unwrap().is_some());
        // a second reviewer working from the same read loses
        assert!(repo.update(&rejected, TaskStatus::Submitted).await.unwrap().is_none());
        assert_eq!(repo.get("7").await.unwrap().unwrap().status, TaskStatus::Approved);
        assert!(repo.update(&submitted("8"), TaskStatus::Pending).await.unwrap().is_none());
    }
}
