//! Task model and lifecycle store.

pub mod model;
pub mod store;

pub use model::{
    CancelInfo, CancelSource, NewTask, NextCondition, NextTask, Profile, Task, TaskResult,
    TaskSource, TaskStatus, Usage,
};
pub use store::{CompletionPatch, EnqueueOutcome, TaskStore, resolve_next_tasks};
