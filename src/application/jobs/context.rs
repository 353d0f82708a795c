use std::sync::Arc;

use crate::application::snapshot::TrendingBatchService;

/// Shared context passed to job workers so they can reach the batch service.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub batch: Arc<TrendingBatchService>,
}
