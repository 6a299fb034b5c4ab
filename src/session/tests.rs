use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::timeout;

use super::*;
use crate::orchestrator::tests::support::{fast_config, paper, RuleAi, ToneSynthesizer};
use crate::orchestrator::traits::{ConversationalAi, PronunciationReport};
use crate::persistence::{MemoryResultStore, PersistenceActor};
use crate::room::{LoopbackProvider, RoomProvider};

const BASE_UNIX_MS: i64 = 1_700_000_000_000;

struct RuleFactory {
    ai: Arc<RuleAi>,
    opened: AtomicUsize,
}

#[async_trait]
impl ConversationFactory for RuleFactory {
    async fn open(&self, _session_id: &str) -> Result<Arc<dyn ConversationalAi>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.ai) as Arc<dyn ConversationalAi>)
    }
}

struct FlatAssessor;

#[async_trait]
impl PronunciationAssessor for FlatAssessor {
    async fn assess(&self, _wav: Bytes) -> Result<PronunciationReport> {
        Ok(PronunciationReport {
            transcript: "answer".into(),
            phonemes: Vec::new(),
            score: 75.0,
        })
    }
}

struct Fixture {
    registry: Arc<SessionRegistry>,
    store: Arc<MemoryResultStore>,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    fixture_with(fast_config())
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let store = Arc::new(MemoryResultStore::new());
    let (persistence, _actor) = PersistenceActor::spawn(store.clone(), 8);
    let clock = Arc::new(ManualClock::new(BASE_UNIX_MS));
    let collaborators = RegistryCollaborators {
        conversations: Arc::new(RuleFactory {
            ai: Arc::new(RuleAi::new(config.exam.prompts.clone())),
            opened: AtomicUsize::new(0),
        }),
        synthesizer: Arc::new(ToneSynthesizer),
        assessor: Some(Arc::new(FlatAssessor)),
    };
    let registry = SessionRegistry::new(config, collaborators, persistence, clock.clone());
    Fixture {
        registry,
        store,
        clock,
    }
}

fn writing(candidate_id: &str, minutes: u64) -> TimedSessionRequest {
    TimedSessionRequest {
        candidate_id: candidate_id.into(),
        paper_id: "paper-7".into(),
        kind: SessionKind::Writing,
        duration: Duration::from_secs(minutes * 60),
    }
}

async fn next_phase(
    rx: &mut broadcast::Receiver<SessionLifecycleUpdate>,
    session_id: &str,
    wanted: SessionLifecyclePhase,
) -> SessionLifecycleUpdate {
    timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Ok(update) if update.session_id == session_id && update.phase == wanted => {
                    return update
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("lifecycle channel closed"),
            }
        }
    })
    .await
    .expect("lifecycle update in time")
}

#[tokio::test]
async fn finalize_twice_persists_one_record() {
    let fx = fixture();
    let mut lifecycle = fx.registry.subscribe_lifecycle();

    let info = fx.registry.create_timed(writing("cand-1", 30)).expect("created");
    assert_eq!(info.status, SessionStatus::Active);
    assert_eq!(info.deadline_ms, Some(BASE_UNIX_MS + 30 * 60 * 1_000));

    let mut answers = BTreeMap::new();
    answers.insert("task1".to_string(), "Dear Sir or Madam".to_string());
    let updated = fx
        .registry
        .update_answers(&info.session_id, answers)
        .expect("updated");
    assert_eq!(updated.answers, 1);

    let first = fx.registry.finalize(&info.session_id).await.expect("finalized");
    let FinalizeOutcome::Finalized { result_id } = first else {
        panic!("first finalize must persist, got {first:?}");
    };
    let second = fx.registry.finalize(&info.session_id).await.expect("idempotent");
    assert_eq!(
        second,
        FinalizeOutcome::AlreadyFinalized {
            result_id: Some(result_id)
        }
    );

    let stored = fx.store.results_for(&info.session_id);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].outcome, "completed");
    assert_eq!(stored[0].written_answers["task1"], "Dear Sir or Madam");
    assert_eq!(
        fx.registry.get(&info.session_id).expect("still known").status,
        SessionStatus::Completed
    );
    assert!(fx.registry.list().is_empty());

    let mut phases = Vec::new();
    while let Ok(update) = lifecycle.try_recv() {
        phases.push(update.phase);
    }
    assert_eq!(
        phases,
        vec![
            SessionLifecyclePhase::Created,
            SessionLifecyclePhase::Running,
            SessionLifecyclePhase::Finalizing,
            SessionLifecyclePhase::Completed,
        ]
    );

    assert!(matches!(
        fx.registry.update_answers(&info.session_id, BTreeMap::new()),
        Err(RegistryError::Finalized(_))
    ));
}

#[tokio::test]
async fn sweep_expires_sessions_past_deadline() {
    let fx = fixture();
    let reading = fx
        .registry
        .create_timed(TimedSessionRequest {
            kind: SessionKind::Reading,
            ..writing("cand-1", 30)
        })
        .expect("reading created");
    let writing_session = fx.registry.create_timed(writing("cand-2", 60)).expect("writing created");

    assert_eq!(fx.registry.sweep().await, 0);

    fx.clock.advance(Duration::from_secs(31 * 60));
    assert!(matches!(
        fx.registry.update_answers(&reading.session_id, BTreeMap::new()),
        Err(RegistryError::Expired(_))
    ));
    assert!(fx.registry.ongoing("cand-1").is_none());

    assert_eq!(fx.registry.sweep().await, 1);
    assert_eq!(fx.registry.sweep().await, 0);

    let expired = fx.registry.get(&reading.session_id).expect("known");
    assert_eq!(expired.status, SessionStatus::Expired);
    let stored = fx.store.results_for(&reading.session_id);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].outcome, "expired");
    assert_eq!(stored[0].kind, SessionKind::Reading);

    let listed: Vec<String> = fx.registry.list().into_iter().map(|info| info.session_id).collect();
    assert_eq!(listed, vec![writing_session.session_id]);
}

#[tokio::test]
async fn sweeper_task_expires_in_background() {
    let mut config = fast_config();
    config.registry.sweep_interval = Duration::from_millis(20);
    let store = Arc::new(MemoryResultStore::new());
    let (persistence, _actor) = PersistenceActor::spawn(store.clone(), 8);
    let clock = Arc::new(ManualClock::new(BASE_UNIX_MS));
    let collaborators = RegistryCollaborators {
        conversations: Arc::new(RuleFactory {
            ai: Arc::new(RuleAi::new(config.exam.prompts.clone())),
            opened: AtomicUsize::new(0),
        }),
        synthesizer: Arc::new(ToneSynthesizer),
        assessor: None,
    };
    let registry = SessionRegistry::new(config, collaborators, persistence, clock.clone());
    let mut lifecycle = registry.subscribe_lifecycle();

    let info = registry.create_timed(writing("cand-1", 1)).expect("created");
    let sweeper = registry.spawn_sweeper();
    clock.advance(Duration::from_secs(61));

    let update = next_phase(&mut lifecycle, &info.session_id, SessionLifecyclePhase::Expired).await;
    assert!(matches!(update.payload, SessionLifecyclePayload::Completed(_)));
    sweeper.stop().await;
    assert_eq!(store.results_for(&info.session_id).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sweep_and_finalize_persist_once() {
    let fx = fixture();
    for round in 0..16 {
        let info = fx
            .registry
            .create_timed(writing(&format!("cand-{round}"), 1))
            .expect("created");
        fx.clock.advance(Duration::from_secs(61));

        let sweeper = {
            let registry = Arc::clone(&fx.registry);
            tokio::spawn(async move { registry.sweep().await })
        };
        let finalizer = {
            let registry = Arc::clone(&fx.registry);
            let session_id = info.session_id.clone();
            tokio::spawn(async move { registry.finalize(&session_id).await })
        };
        let swept = timeout(Duration::from_secs(5), sweeper)
            .await
            .expect("sweep in time")
            .expect("sweep task");
        let outcome = timeout(Duration::from_secs(5), finalizer)
            .await
            .expect("finalize in time")
            .expect("finalize task")
            .expect("finalized");

        assert!(swept <= 1);
        assert!(matches!(
            outcome,
            FinalizeOutcome::Finalized { .. } | FinalizeOutcome::AlreadyFinalized { .. }
        ));
        let stored = fx.store.results_for(&info.session_id);
        assert_eq!(stored.len(), 1, "round {round}");
        assert_eq!(stored[0].outcome, "expired");
    }
}

#[tokio::test]
async fn finalized_sessions_are_forgotten_beyond_retention() {
    let mut config = fast_config();
    config.registry.finalized_retention = 2;
    let fx = fixture_with(config);

    let mut ids = Vec::new();
    for candidate in ["cand-1", "cand-2", "cand-3"] {
        let info = fx.registry.create_timed(writing(candidate, 30)).expect("created");
        fx.registry.finalize(&info.session_id).await.expect("finalized");
        ids.push(info.session_id);
    }

    assert!(matches!(fx.registry.get(&ids[0]), Err(RegistryError::NotFound(_))));
    assert_eq!(
        fx.registry.get(&ids[1]).expect("retained").status,
        SessionStatus::Completed
    );
    assert!(matches!(
        fx.registry.finalize(&ids[2]).await.expect("idempotent"),
        FinalizeOutcome::AlreadyFinalized { result_id: Some(_) }
    ));
    assert_eq!(fx.store.results_for(&ids[0]).len(), 1);
}

#[tokio::test]
async fn ongoing_lookup_rejects_second_session() {
    let fx = fixture();
    let info = fx.registry.create_timed(writing("cand-1", 30)).expect("created");

    let ongoing = fx.registry.ongoing("cand-1").expect("ongoing");
    assert_eq!(ongoing.session_id, info.session_id);
    assert!(fx.registry.ongoing("cand-2").is_none());

    match fx.registry.create_timed(writing("cand-1", 30)) {
        Err(RegistryError::AlreadyActive { session_id, .. }) => assert_eq!(session_id, info.session_id),
        other => panic!("expected AlreadyActive, got {other:?}"),
    }

    fx.registry.finalize(&info.session_id).await.expect("finalized");
    assert!(fx.registry.ongoing("cand-1").is_none());
    fx.registry.create_timed(writing("cand-1", 30)).expect("new attempt allowed");
}

#[tokio::test]
async fn timed_requests_reject_oral_kind_and_unknown_ids() {
    let fx = fixture();
    assert!(matches!(
        fx.registry.create_timed(TimedSessionRequest {
            kind: SessionKind::Oral,
            ..writing("cand-1", 30)
        }),
        Err(RegistryError::InvalidKind { kind: SessionKind::Oral, .. })
    ));
    assert!(matches!(fx.registry.get("missing"), Err(RegistryError::NotFound(_))));
    assert!(matches!(
        fx.registry.finalize("missing").await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn oral_session_is_evaluated_and_persisted_once() {
    let fx = fixture();
    let provider = LoopbackProvider::new();
    let room = provider.join("room-1", "token").await.expect("joined");
    let mut lifecycle = fx.registry.subscribe_lifecycle();

    let handle = fx
        .registry
        .start_oral(OralSessionRequest {
            candidate_id: "cand-1".into(),
            paper: paper(),
            room,
            candidate: Some(CandidateScript {
                answer_duration: Duration::from_millis(100),
                ..CandidateScript::default()
            }),
        })
        .await
        .expect("session started");
    let session_id = handle.session_id().to_string();
    assert_eq!(
        fx.registry.ongoing("cand-1").map(|info| info.kind),
        Some(SessionKind::Oral)
    );

    let done = next_phase(&mut lifecycle, &session_id, SessionLifecyclePhase::Completed).await;
    let SessionLifecyclePayload::Completed(completion) = done.payload else {
        panic!("completion payload missing");
    };

    let stored = fx.store.results_for(&session_id);
    assert_eq!(stored.len(), 1);
    let summary = &stored[0];
    assert_eq!(summary.outcome, "completed");
    assert_eq!(summary.answers, 9);
    assert_eq!(summary.artifact_ids.len(), 9);
    assert_eq!(summary.scores.map(|scores| scores.overall), Some(75.0));
    assert!(summary.feedback.is_some());
    assert_eq!(fx.store.artifacts().len(), 9);

    assert!(provider.room("room-1").expect("room").is_disconnected());
    assert!(fx.registry.supervisors().is_empty());
    assert!(fx.registry.ongoing("cand-1").is_none());
    assert_eq!(
        fx.registry.finalize(&session_id).await.expect("idempotent"),
        FinalizeOutcome::AlreadyFinalized {
            result_id: Some(completion.result_id)
        }
    );
    assert_eq!(fx.store.results_for(&session_id).len(), 1);
}

#[tokio::test]
async fn explicit_finalize_cancels_running_oral_session() {
    let fx = fixture();
    let provider = LoopbackProvider::new();
    let room = provider.join("room-2", "token").await.expect("joined");

    let handle = fx
        .registry
        .start_oral(OralSessionRequest {
            candidate_id: "cand-9".into(),
            paper: paper(),
            room,
            candidate: None,
        })
        .await
        .expect("session started");
    let session_id = handle.session_id().to_string();

    let outcome = timeout(Duration::from_secs(10), fx.registry.finalize(&session_id))
        .await
        .expect("finalized in time")
        .expect("finalized");
    assert!(matches!(outcome, FinalizeOutcome::Finalized { .. }));
    assert!(!handle.is_active());

    let stored = fx.store.results_for(&session_id);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].outcome, "cancelled");
    assert_eq!(stored[0].answers, 0);
    assert_eq!(
        fx.registry.get(&session_id).expect("known").phase,
        Some(ExamPhase::Terminated)
    );

    fx.registry.shutdown().await;
}
