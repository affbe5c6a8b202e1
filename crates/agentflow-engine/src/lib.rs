pub mod runner;
pub mod scheduler;

pub use runner::{ArtifactEnvMapping, RunLayout, StepRunner};
pub use scheduler::{RunOutcome, Scheduler, SchedulerError, SchedulerOptions};

pub type AppResult<T> = eyre::Result<T>;
