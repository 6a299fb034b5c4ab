use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use super::{ResultStore, SessionSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub artifact_id: String,
    pub owner_id: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Process-local store, used by the daemon and tests.
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<Vec<(String, SessionSummary)>>,
    artifacts: Mutex<Vec<StoredArtifact>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<(String, SessionSummary)> {
        lock(&self.results).clone()
    }

    pub fn results_for(&self, session_id: &str) -> Vec<SessionSummary> {
        lock(&self.results)
            .iter()
            .filter(|(_, summary)| summary.session_id == session_id)
            .map(|(_, summary)| summary.clone())
            .collect()
    }

    pub fn artifacts(&self) -> Vec<StoredArtifact> {
        lock(&self.artifacts).clone()
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn submit_result(&self, summary: &SessionSummary) -> Result<String> {
        let result_id = self.next("result");
        lock(&self.results).push((result_id.clone(), summary.clone()));
        Ok(result_id)
    }

    async fn create_artifact(&self, owner_id: &str, bytes: Bytes, mime_type: &str) -> Result<String> {
        let artifact_id = self.next("artifact");
        lock(&self.artifacts).push(StoredArtifact {
            artifact_id: artifact_id.clone(),
            owner_id: owner_id.to_string(),
            mime_type: mime_type.to_string(),
            bytes,
        });
        Ok(artifact_id)
    }
}
