use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::pipeline::Pipeline;

/// In-memory map of running pipelines. Membership means the pipeline is
/// starting or running; removal is the stop commit-point.
#[derive(Default)]
pub struct Registry {
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, id: String, pipeline: Arc<Pipeline>) {
        self.pipelines.write().await.insert(id, pipeline);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.write().await.remove(id)
    }

    /// Snapshot of the current membership, not a live view.
    pub async fn list(&self) -> Vec<(String, Arc<Pipeline>)> {
        self.pipelines
            .read()
            .await
            .iter()
            .map(|(id, pipeline)| (id.clone(), Arc::clone(pipeline)))
            .collect()
    }
}
