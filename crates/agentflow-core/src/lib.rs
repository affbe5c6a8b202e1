pub mod config;
pub mod gates;
pub mod loop_expand;
pub mod notify;
pub mod report;
pub mod store;
pub mod types;
pub mod workflow;

pub use config::Config;
pub use gates::GateEvaluator;
pub use notify::{NotificationDispatcher, NotificationEvent, NotificationPayload, NotificationSink};
pub use types::{
    Id, LoopItemSource, LoopSpec, ReportStatus, RunReport, RunState, Step, StepRuntime,
    StepStatus, Workflow,
};
pub use workflow::{load_workflow, load_workflow_str};
