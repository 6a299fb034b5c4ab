//! Result persistence: the store collaborator, a serialising actor in front
//! of it, and the bundled stores.

mod memory;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;

pub use memory::{MemoryResultStore, StoredArtifact};

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::evaluation::ExamScores;

const TARGET: &str = "persistence";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Oral,
    Reading,
    Writing,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Oral => "oral",
            SessionKind::Reading => "reading",
            SessionKind::Writing => "writing",
        }
    }

    pub fn is_timed(&self) -> bool {
        !matches!(self, SessionKind::Oral)
    }
}

/// What a finished attempt hands to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub candidate_id: String,
    pub paper_id: String,
    pub kind: SessionKind,
    pub outcome: String,
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
    pub answers: usize,
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    #[serde(default)]
    pub task_card: Option<String>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub scores: Option<ExamScores>,
    #[serde(default)]
    pub written_answers: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SessionSummary {
    pub fn duration_ms(&self) -> i64 {
        (self.completed_at_ms - self.started_at_ms).max(0)
    }
}

/// Persistent store collaborator.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn submit_result(&self, summary: &SessionSummary) -> Result<String>;

    async fn create_artifact(&self, owner_id: &str, bytes: Bytes, mime_type: &str) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence actor is not running")]
    ActorGone,
    #[error("store rejected request: {0:#}")]
    Store(anyhow::Error),
}

pub enum PersistenceCommand {
    SubmitResult {
        summary: Box<SessionSummary>,
        reply: oneshot::Sender<Result<String, PersistenceError>>,
    },
    CreateArtifact {
        owner_id: String,
        bytes: Bytes,
        mime_type: String,
        reply: oneshot::Sender<Result<String, PersistenceError>>,
    },
}

/// Serialises every store call behind one command channel.
pub struct PersistenceActor {
    store: Arc<dyn ResultStore>,
    rx: mpsc::Receiver<PersistenceCommand>,
}

impl PersistenceActor {
    pub fn new(store: Arc<dyn ResultStore>, rx: mpsc::Receiver<PersistenceCommand>) -> Self {
        Self { store, rx }
    }

    pub fn spawn(store: Arc<dyn ResultStore>, capacity: usize) -> (PersistenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(Self::new(store, rx).run());
        (PersistenceHandle::new(tx), task)
    }

    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                PersistenceCommand::SubmitResult { summary, reply } => {
                    let result = self
                        .store
                        .submit_result(&summary)
                        .await
                        .map_err(PersistenceError::Store);
                    match &result {
                        Ok(result_id) => info!(
                            target: TARGET,
                            session_id = %summary.session_id,
                            %result_id,
                            "result stored"
                        ),
                        Err(err) => warn!(
                            target: TARGET,
                            session_id = %summary.session_id,
                            %err,
                            "failed to store result"
                        ),
                    }
                    let _ = reply.send(result);
                }
                PersistenceCommand::CreateArtifact {
                    owner_id,
                    bytes,
                    mime_type,
                    reply,
                } => {
                    let size = bytes.len();
                    let result = self
                        .store
                        .create_artifact(&owner_id, bytes, &mime_type)
                        .await
                        .map_err(PersistenceError::Store);
                    if let Err(err) = &result {
                        warn!(target: TARGET, %owner_id, %err, "failed to store artifact");
                    } else {
                        debug!(target: TARGET, %owner_id, size, %mime_type, "artifact stored");
                    }
                    let _ = reply.send(result);
                }
            }
        }
        info!(target: TARGET, "persistence actor stopped");
    }
}

#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistenceCommand>,
}

impl PersistenceHandle {
    pub fn new(tx: mpsc::Sender<PersistenceCommand>) -> Self {
        Self { tx }
    }

    pub async fn submit(&self, summary: SessionSummary) -> Result<String, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PersistenceCommand::SubmitResult {
                summary: Box::new(summary),
                reply,
            })
            .await
            .map_err(|_| PersistenceError::ActorGone)?;
        rx.await.map_err(|_| PersistenceError::ActorGone)?
    }

    pub async fn artifact(
        &self,
        owner_id: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<String, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PersistenceCommand::CreateArtifact {
                owner_id: owner_id.to_string(),
                bytes,
                mime_type: mime_type.to_string(),
                reply,
            })
            .await
            .map_err(|_| PersistenceError::ActorGone)?;
        rx.await.map_err(|_| PersistenceError::ActorGone)?
    }
}

#[async_trait]
impl ResultStore for PersistenceHandle {
    async fn submit_result(&self, summary: &SessionSummary) -> Result<String> {
        Ok(self.submit(summary.clone()).await?)
    }

    async fn create_artifact(&self, owner_id: &str, bytes: Bytes, mime_type: &str) -> Result<String> {
        Ok(self.artifact(owner_id, bytes, mime_type).await?)
    }
}

#[cfg(test)]
mod tests;
