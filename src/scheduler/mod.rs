mod next_run;
mod service;

pub use next_run::compute_next_run;
pub use service::{RetentionReport, SchedulerService, SchedulerSettings};
