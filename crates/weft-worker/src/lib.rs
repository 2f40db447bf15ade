// Weft worker: consumes the job queue, stages I/O, dispatches steps to
// runners and publishes results.

pub mod dispatch;
pub mod execute;
pub mod notify;
pub mod runner;
pub mod staging;
pub mod status_doc;
pub mod worker;

pub use execute::JobExecutor;
pub use runner::{RunnerKind, RunnerRegistry, StepContext, StepOutputs, StepRunner};
pub use worker::{Worker, WorkerConfig};
