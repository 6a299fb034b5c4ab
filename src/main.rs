use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, warn};

use speaking_exam_core::orchestrator::{ConversationFactory, ConversationalAi, EngineConfig};
use speaking_exam_core::persistence::{MemoryResultStore, PersistenceActor};
use speaking_exam_core::session::{MonotonicClock, RegistryCollaborators, SessionRegistry};
use speaking_exam_core::synthesis::HttpSpeechSynthesizer;
use speaking_exam_core::telemetry::init_tracing;

const PERSISTENCE_CAPACITY: usize = 64;
const PERSISTENCE_DRAIN: Duration = Duration::from_secs(5);

/// Rejects oral sessions until an examiner model integration is linked in.
struct UnconfiguredConversations;

#[async_trait]
impl ConversationFactory for UnconfiguredConversations {
    async fn open(&self, session_id: &str) -> Result<Arc<dyn ConversationalAi>> {
        Err(anyhow!("no examiner model configured for session {session_id}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_tracing();
    let config = EngineConfig::load()?;

    let store = Arc::new(MemoryResultStore::new());
    let (persistence, persistence_task) = PersistenceActor::spawn(store, PERSISTENCE_CAPACITY);
    let collaborators = RegistryCollaborators {
        conversations: Arc::new(UnconfiguredConversations),
        synthesizer: Arc::new(HttpSpeechSynthesizer::new(&config.synthesis)),
        assessor: None,
    };
    let registry = SessionRegistry::new(config, collaborators, persistence, Arc::new(MonotonicClock));
    let sweeper = registry.spawn_sweeper();
    info!(target: "daemon", "speaking exam engine running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!(target: "daemon", "shutdown requested");

    sweeper.stop().await;
    registry.shutdown().await;
    drop(registry);
    if timeout(PERSISTENCE_DRAIN, persistence_task).await.is_err() {
        warn!(target: "daemon", "persistence actor still busy at exit");
    }
    Ok(())
}
