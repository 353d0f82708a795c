mod context;
mod trending_batch;

pub use context::JobWorkerContext;
pub use trending_batch::{TrendingBatchJob, process_trending_batch_job, trending_batch_schedule};
