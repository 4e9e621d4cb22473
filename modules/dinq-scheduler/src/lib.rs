pub mod handler;
pub mod scheduler;

pub use handler::{CardHandler, CardResult, ExecutionContext, HandlerRegistry, NullProgressSink, ProgressSink, ProgressUpdate, StreamSpec};
pub use scheduler::{Scheduler, SchedulerHandle};
