//! Events broadcast to observers.

use serde::Serialize;
use uuid::Uuid;

use crate::tasks::{Task, TaskStatus};

/// Capacity of the observer broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something an observer (UI, log tail) may want to show.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OrchestratorEvent {
    /// A new task was created.
    TaskCreated { task: Task },
    /// A task changed status.
    TaskUpdated {
        task_id: Uuid,
        title: String,
        status: TaskStatus,
    },
    /// Text the manager wants the user to see.
    ManagerReply { text: String },
    /// A cron job fired.
    CronFired { job_id: Uuid, name: String },
}

impl OrchestratorEvent {
    pub fn task_updated(task: &Task) -> Self {
        Self::TaskUpdated {
            task_id: task.id,
            title: task.title.clone(),
            status: task.status,
        }
    }
}
