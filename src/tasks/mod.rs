//! Checklist tasks: assignment, completion proof and admin review.

mod model;
mod repository;
mod board;

pub use model::{NewTask, Task, TaskFilter, TaskStatus};
pub use repository::{MemoryTaskRepository, RestTaskRepository, TaskRepository};
pub use board::TaskBoard;
