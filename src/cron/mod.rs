//! Cron jobs and the loop that fires them.

pub mod job;
pub mod ticker;

pub use job::{CronAction, CronJob, CronSchedule, TaskTemplate, next_cron_fire, parse_cron};
pub use ticker::{fire_due_jobs, spawn_cron_loop};
