//! Session registry: owns every active attempt, supervises oral sessions,
//! expires timed ones, and hands finished attempts to persistence once.

pub mod clock;
pub mod lifecycle;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use lifecycle::{SessionLifecyclePayload, SessionLifecyclePhase, SessionLifecycleUpdate};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::evaluation::evaluate_exam;
use crate::orchestrator::candidate::CandidateScript;
use crate::orchestrator::config::EngineConfig;
use crate::orchestrator::traits::{ConversationFactory, PronunciationAssessor, SpeechSynthesizer};
use crate::orchestrator::types::{ExamPaper, ExamPhase, TerminationReason};
use crate::orchestrator::{spawn_session, ExamRecord, ExamSessionHandle, SessionWiring};
use crate::persistence::{PersistenceHandle, SessionKind, SessionSummary};
use crate::room::RoomSession;
use crate::telemetry::events::{outcome_label, record_session_finalized};

const TARGET: &str = "session_registry";
const SUPERVISOR_GRACE: Duration = Duration::from_secs(10);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("candidate {candidate_id} already has ongoing session {session_id}")]
    AlreadyActive {
        candidate_id: String,
        session_id: String,
    },
    #[error("session {0} is past its deadline")]
    Expired(String),
    #[error("session {0} is already finalized")]
    Finalized(String),
    #[error("operation not supported for {kind:?} session {session_id}")]
    InvalidKind {
        session_id: String,
        kind: SessionKind,
    },
    #[error("failed to open examiner conversation: {0:#}")]
    Conversation(anyhow::Error),
    #[error("finalizing session {session_id} failed: {error}")]
    FinalizeFailed { session_id: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Finalizing,
    Completed,
    Expired,
    Failed,
}

/// Point-in-time view of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub candidate_id: String,
    pub paper_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub started_at_ms: i64,
    pub deadline_ms: Option<i64>,
    /// Oral sessions only.
    pub phase: Option<ExamPhase>,
    pub answers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized { result_id: String },
    AlreadyFinalized { result_id: Option<String> },
}

pub struct OralSessionRequest {
    pub candidate_id: String,
    pub paper: ExamPaper,
    pub room: RoomSession,
    pub candidate: Option<CandidateScript>,
}

#[derive(Debug, Clone)]
pub struct TimedSessionRequest {
    pub candidate_id: String,
    pub paper_id: String,
    pub kind: SessionKind,
    pub duration: Duration,
}

/// External services every oral session is bound to.
#[derive(Clone)]
pub struct RegistryCollaborators {
    pub conversations: Arc<dyn ConversationFactory>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub assessor: Option<Arc<dyn PronunciationAssessor>>,
}

enum SessionEntry {
    Oral {
        info: SessionInfo,
        handle: Arc<ExamSessionHandle>,
    },
    Timed {
        info: SessionInfo,
        deadline: Instant,
        answers: BTreeMap<String, String>,
    },
}

impl SessionEntry {
    fn info(&self) -> &SessionInfo {
        match self {
            SessionEntry::Oral { info, .. } | SessionEntry::Timed { info, .. } => info,
        }
    }

    fn snapshot(&self) -> SessionInfo {
        match self {
            SessionEntry::Oral { info, handle } => {
                let progress = handle.progress();
                SessionInfo {
                    phase: Some(progress.phase),
                    answers: progress.answers_captured,
                    ..info.clone()
                }
            }
            SessionEntry::Timed { info, answers, .. } => SessionInfo {
                answers: answers.len(),
                ..info.clone()
            },
        }
    }

    fn is_past_deadline(&self, now: Instant) -> bool {
        matches!(self, SessionEntry::Timed { deadline, .. } if *deadline <= now)
    }
}

#[derive(Debug, Clone)]
struct FinalizedSession {
    info: SessionInfo,
    result_id: Option<String>,
    error: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<String, SessionEntry>,
    finalizing: HashMap<String, SessionInfo>,
    finalized: HashMap<String, FinalizedSession>,
    finalized_order: VecDeque<String>,
}

impl RegistryState {
    /// Moves an active entry into the finalizing set. Only the caller that
    /// gets `Some` persists the session.
    fn claim(&mut self, session_id: &str) -> Option<SessionEntry> {
        let entry = self.active.remove(session_id)?;
        let info = SessionInfo {
            status: SessionStatus::Finalizing,
            ..entry.snapshot()
        };
        self.finalizing.insert(session_id.to_string(), info);
        Some(entry)
    }

    /// Records a finished session, forgetting the oldest beyond `retention`.
    fn remember(&mut self, session_id: String, finalized: FinalizedSession, retention: usize) {
        self.finalizing.remove(&session_id);
        if self.finalized.insert(session_id.clone(), finalized).is_none() {
            self.finalized_order.push_back(session_id);
        }
        while self.finalized_order.len() > retention.max(1) {
            if let Some(oldest) = self.finalized_order.pop_front() {
                self.finalized.remove(&oldest);
            }
        }
    }
}

enum FinalizeClaim {
    Owned(SessionEntry),
    Oral(Arc<ExamSessionHandle>),
    InFlight,
    Done(FinalizedSession),
}

pub struct SessionRegistry {
    config: EngineConfig,
    collaborators: RegistryCollaborators,
    persistence: PersistenceHandle,
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
    supervisors: Mutex<HashMap<String, JoinHandle<()>>>,
    lifecycle_tx: broadcast::Sender<SessionLifecycleUpdate>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        config: EngineConfig,
        collaborators: RegistryCollaborators,
        persistence: PersistenceHandle,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (lifecycle_tx, _) = broadcast::channel(config.registry.lifecycle_capacity.max(1));
        Arc::new(Self {
            config,
            collaborators,
            persistence,
            clock,
            state: Mutex::new(RegistryState::default()),
            supervisors: Mutex::new(HashMap::new()),
            lifecycle_tx,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<SessionLifecycleUpdate> {
        self.lifecycle_tx.subscribe()
    }

    /// Opens the examiner conversation, wires the session and starts it.
    pub async fn start_oral(
        self: &Arc<Self>,
        request: OralSessionRequest,
    ) -> Result<Arc<ExamSessionHandle>, RegistryError> {
        let OralSessionRequest {
            candidate_id,
            paper,
            room,
            candidate,
        } = request;
        self.ensure_no_ongoing(&candidate_id)?;

        let session_id = self.allocate_id(SessionKind::Oral);
        let ai = self
            .collaborators
            .conversations
            .open(&session_id)
            .await
            .map_err(RegistryError::Conversation)?;

        let info = SessionInfo {
            session_id: session_id.clone(),
            candidate_id: candidate_id.clone(),
            paper_id: paper.paper_id.clone(),
            kind: SessionKind::Oral,
            status: SessionStatus::Active,
            started_at_ms: self.clock.unix_ms(),
            deadline_ms: None,
            phase: Some(ExamPhase::AwaitingConnection),
            answers: 0,
        };

        let (handle, tasks) = {
            let mut state = self.state();
            if let Some(existing) = ongoing_in(&state, &candidate_id, self.clock.now()) {
                return Err(RegistryError::AlreadyActive {
                    candidate_id,
                    session_id: existing.info().session_id.clone(),
                });
            }
            let wiring = SessionWiring {
                session_id: session_id.clone(),
                paper,
                ai,
                synthesizer: Arc::clone(&self.collaborators.synthesizer),
                connection: room.connection,
                events: Some(room.events),
                candidate,
            };
            let (handle, tasks) = spawn_session(&self.config, wiring);
            state.active.insert(
                session_id.clone(),
                SessionEntry::Oral {
                    info,
                    handle: Arc::clone(&handle),
                },
            );
            (handle, tasks)
        };

        self.broadcast(SessionLifecycleUpdate::created(
            session_id.clone(),
            &candidate_id,
            SessionKind::Oral,
        ));
        info!(target: TARGET, %session_id, %candidate_id, "oral session created");

        let registry = Arc::clone(self);
        let supervised_id = session_id.clone();
        {
            // Registered before the supervisor can reach `finalize_oral`.
            let mut supervisors = self.supervisors();
            let supervisor = tokio::spawn(async move {
                let record = match tasks.join().await {
                    Ok(record) => record,
                    Err(err) => ExamRecord::faulted(TerminationReason::Fault, err.to_string()),
                };
                registry.finalize_oral(&supervised_id, record).await;
            });
            supervisors.insert(session_id.clone(), supervisor);
        }

        handle.begin();
        self.broadcast(SessionLifecycleUpdate::new(
            session_id,
            SessionLifecyclePhase::Running,
        ));
        Ok(handle)
    }

    pub fn create_timed(&self, request: TimedSessionRequest) -> Result<SessionInfo, RegistryError> {
        let session_id = self.allocate_id(request.kind);
        if !request.kind.is_timed() {
            return Err(RegistryError::InvalidKind {
                session_id,
                kind: request.kind,
            });
        }

        let now = self.clock.now();
        let started_at_ms = self.clock.unix_ms();
        let info = SessionInfo {
            session_id: session_id.clone(),
            candidate_id: request.candidate_id.clone(),
            paper_id: request.paper_id,
            kind: request.kind,
            status: SessionStatus::Active,
            started_at_ms,
            deadline_ms: Some(started_at_ms + request.duration.as_millis() as i64),
            phase: None,
            answers: 0,
        };

        {
            let mut state = self.state();
            if let Some(existing) = ongoing_in(&state, &request.candidate_id, now) {
                return Err(RegistryError::AlreadyActive {
                    candidate_id: request.candidate_id,
                    session_id: existing.info().session_id.clone(),
                });
            }
            state.active.insert(
                session_id.clone(),
                SessionEntry::Timed {
                    info: info.clone(),
                    deadline: now + request.duration,
                    answers: BTreeMap::new(),
                },
            );
        }

        self.broadcast(SessionLifecycleUpdate::created(
            session_id.clone(),
            &info.candidate_id,
            info.kind,
        ));
        self.broadcast(SessionLifecycleUpdate::new(
            session_id.clone(),
            SessionLifecyclePhase::Running,
        ));
        info!(
            target: TARGET,
            %session_id,
            candidate_id = %info.candidate_id,
            kind = info.kind.as_str(),
            duration_ms = request.duration.as_millis() as u64,
            "timed session created"
        );
        Ok(info)
    }

    /// Merges answers into a timed session that is still within its deadline.
    pub fn update_answers(
        &self,
        session_id: &str,
        updates: BTreeMap<String, String>,
    ) -> Result<SessionInfo, RegistryError> {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.active.contains_key(session_id) {
            let finished = state.finalizing.contains_key(session_id)
                || state.finalized.contains_key(session_id);
            return Err(if finished {
                RegistryError::Finalized(session_id.to_string())
            } else {
                RegistryError::NotFound(session_id.to_string())
            });
        }
        let Some(entry) = state.active.get_mut(session_id) else {
            return Err(RegistryError::NotFound(session_id.to_string()));
        };
        if entry.is_past_deadline(now) {
            return Err(RegistryError::Expired(session_id.to_string()));
        }
        match entry {
            SessionEntry::Timed { answers, .. } => answers.extend(updates),
            SessionEntry::Oral { info, .. } => {
                return Err(RegistryError::InvalidKind {
                    session_id: session_id.to_string(),
                    kind: info.kind,
                })
            }
        }
        let info = entry.snapshot();
        debug!(target: TARGET, session_id, answers = info.answers, "answers updated");
        Ok(info)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionInfo, RegistryError> {
        let state = self.state();
        if let Some(entry) = state.active.get(session_id) {
            return Ok(entry.snapshot());
        }
        if let Some(info) = state.finalizing.get(session_id) {
            return Ok(info.clone());
        }
        state
            .finalized
            .get(session_id)
            .map(|finalized| finalized.info.clone())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))
    }

    /// Sessions not yet finalized, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let state = self.state();
        let mut sessions: Vec<SessionInfo> = state
            .active
            .values()
            .map(SessionEntry::snapshot)
            .chain(state.finalizing.values().cloned())
            .collect();
        sessions.sort_by(|a, b| {
            a.started_at_ms
                .cmp(&b.started_at_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// The candidate's single active session that is not past its deadline.
    pub fn ongoing(&self, candidate_id: &str) -> Option<SessionInfo> {
        let state = self.state();
        ongoing_in(&state, candidate_id, self.clock.now()).map(SessionEntry::snapshot)
    }

    /// Ends an oral session early. The supervisor finalizes it.
    pub fn terminate(&self, session_id: &str, reason: TerminationReason) -> Result<bool, RegistryError> {
        let state = self.state();
        match state.active.get(session_id) {
            Some(SessionEntry::Oral { handle, .. }) => Ok(handle.terminate(reason)),
            Some(SessionEntry::Timed { info, .. }) => Err(RegistryError::InvalidKind {
                session_id: session_id.to_string(),
                kind: info.kind,
            }),
            None => Err(RegistryError::NotFound(session_id.to_string())),
        }
    }

    /// Persists the session exactly once. Later calls report the stored
    /// result; an oral session is terminated and finalized by its supervisor.
    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeOutcome, RegistryError> {
        let lifecycle = self.lifecycle_tx.subscribe();
        let claim = {
            let mut state = self.state();
            if let Some(done) = state.finalized.get(session_id) {
                FinalizeClaim::Done(done.clone())
            } else if state.finalizing.contains_key(session_id) {
                FinalizeClaim::InFlight
            } else {
                let oral = match state.active.get(session_id) {
                    Some(SessionEntry::Oral { handle, .. }) => Some(Arc::clone(handle)),
                    Some(SessionEntry::Timed { .. }) => None,
                    None => return Err(RegistryError::NotFound(session_id.to_string())),
                };
                match oral {
                    Some(handle) => FinalizeClaim::Oral(handle),
                    None => state
                        .claim(session_id)
                        .map_or(FinalizeClaim::InFlight, FinalizeClaim::Owned),
                }
            }
        };

        match claim {
            FinalizeClaim::Done(done) => Ok(FinalizeOutcome::AlreadyFinalized {
                result_id: done.result_id,
            }),
            FinalizeClaim::Owned(entry) => {
                let expired = entry.is_past_deadline(self.clock.now());
                into_outcome(self.complete_timed(entry, expired).await)
            }
            FinalizeClaim::Oral(handle) => {
                handle.terminate(TerminationReason::Cancelled);
                into_outcome(self.await_finalized(session_id, lifecycle).await?)
            }
            FinalizeClaim::InFlight => into_outcome(self.await_finalized(session_id, lifecycle).await?),
        }
    }

    /// Expires and persists every timed session past its deadline.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<SessionEntry> = {
            let mut state = self.state();
            let ids: Vec<String> = state
                .active
                .iter()
                .filter(|(_, entry)| entry.is_past_deadline(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| state.claim(id)).collect()
        };

        let count = expired.len();
        for entry in expired {
            self.complete_timed(entry, true).await;
        }
        if count > 0 {
            info!(target: TARGET, expired = count, "sweep expired sessions");
        }
        count
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let registry = Arc::clone(self);
        let period = self.config.registry.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
            debug!(target: TARGET, "sweeper stopped");
        });

        info!(target: TARGET, interval_ms = period.as_millis() as u64, "sweeper started");
        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Cancels every oral session and waits for their finalization.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<ExamSessionHandle>> = self
            .state()
            .active
            .values()
            .filter_map(|entry| match entry {
                SessionEntry::Oral { handle, .. } => Some(Arc::clone(handle)),
                SessionEntry::Timed { .. } => None,
            })
            .collect();
        for handle in &handles {
            handle.terminate(TerminationReason::Cancelled);
        }

        let supervisors: Vec<(String, JoinHandle<()>)> = self.supervisors().drain().collect();
        for (session_id, mut supervisor) in supervisors {
            if timeout(SUPERVISOR_GRACE, &mut supervisor).await.is_err() {
                warn!(target: TARGET, %session_id, "session supervisor did not stop in time, aborting");
                supervisor.abort();
            }
        }
        info!(target: TARGET, cancelled = handles.len(), "registry shut down");
    }

    async fn finalize_oral(&self, session_id: &str, record: ExamRecord) {
        let claimed = self.state().claim(session_id);
        self.supervisors().remove(session_id);
        let Some(SessionEntry::Oral { info, .. }) = claimed else {
            warn!(target: TARGET, session_id, "oral session already finalized");
            return;
        };

        self.broadcast(SessionLifecycleUpdate::finalizing(
            session_id,
            record.termination,
            record.answer_count(),
        ));
        let report = evaluate_exam(
            session_id,
            &record,
            &self.persistence,
            self.collaborators.assessor.as_deref(),
        )
        .await;

        let outcome = outcome_label(record.termination);
        let summary = SessionSummary {
            session_id: session_id.to_string(),
            candidate_id: info.candidate_id.clone(),
            paper_id: info.paper_id.clone(),
            kind: SessionKind::Oral,
            outcome: outcome.to_string(),
            started_at_ms: info.started_at_ms,
            completed_at_ms: self.clock.unix_ms(),
            answers: record.answer_count(),
            artifact_ids: report.artifact_ids(),
            task_card: Some(record.part2.task_card.clone()).filter(|card| !card.is_empty()),
            feedback: record.feedback.clone(),
            scores: Some(report.scores),
            written_answers: BTreeMap::new(),
            error: record.error.clone(),
        };
        let info = SessionInfo {
            phase: Some(ExamPhase::Terminated),
            answers: record.answer_count(),
            ..info
        };
        self.persist(info, summary, outcome, false).await;
    }

    async fn complete_timed(&self, entry: SessionEntry, expired: bool) -> FinalizedSession {
        let info = entry.snapshot();
        let written_answers = match entry {
            SessionEntry::Timed { answers, .. } => answers,
            SessionEntry::Oral { .. } => BTreeMap::new(),
        };
        self.broadcast(SessionLifecycleUpdate::finalizing(
            info.session_id.clone(),
            None,
            written_answers.len(),
        ));

        let outcome = if expired { "expired" } else { "completed" };
        let summary = SessionSummary {
            session_id: info.session_id.clone(),
            candidate_id: info.candidate_id.clone(),
            paper_id: info.paper_id.clone(),
            kind: info.kind,
            outcome: outcome.to_string(),
            started_at_ms: info.started_at_ms,
            completed_at_ms: self.clock.unix_ms(),
            answers: written_answers.len(),
            artifact_ids: Vec::new(),
            task_card: None,
            feedback: None,
            scores: None,
            written_answers,
            error: None,
        };
        self.persist(info, summary, outcome, expired).await
    }

    async fn persist(
        &self,
        info: SessionInfo,
        summary: SessionSummary,
        outcome: &'static str,
        expired: bool,
    ) -> FinalizedSession {
        let session_id = info.session_id.clone();
        let answers = summary.answers;
        let (finalized, update) = match self.persistence.submit(summary).await {
            Ok(result_id) => {
                let status = if expired {
                    SessionStatus::Expired
                } else {
                    SessionStatus::Completed
                };
                (
                    FinalizedSession {
                        info: SessionInfo { status, ..info },
                        result_id: Some(result_id.clone()),
                        error: None,
                    },
                    SessionLifecycleUpdate::completed(session_id.clone(), result_id, expired),
                )
            }
            Err(err) => {
                warn!(target: TARGET, %session_id, %err, "session result not persisted");
                (
                    FinalizedSession {
                        info: SessionInfo {
                            status: SessionStatus::Failed,
                            ..info
                        },
                        result_id: None,
                        error: Some(err.to_string()),
                    },
                    SessionLifecycleUpdate::failed(session_id.clone(), err.to_string()),
                )
            }
        };

        record_session_finalized(
            &session_id,
            finalized.info.kind.as_str(),
            outcome,
            answers,
            finalized.result_id.as_deref(),
        );
        self.state().remember(
            session_id,
            finalized.clone(),
            self.config.registry.finalized_retention,
        );
        self.broadcast(update);
        finalized
    }

    async fn await_finalized(
        &self,
        session_id: &str,
        mut lifecycle: broadcast::Receiver<SessionLifecycleUpdate>,
    ) -> Result<FinalizedSession, RegistryError> {
        loop {
            if let Some(done) = self.state().finalized.get(session_id) {
                return Ok(done.clone());
            }
            match lifecycle.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(RegistryError::NotFound(session_id.to_string()))
                }
            }
        }
    }

    fn ensure_no_ongoing(&self, candidate_id: &str) -> Result<(), RegistryError> {
        match self.ongoing(candidate_id) {
            Some(existing) => Err(RegistryError::AlreadyActive {
                candidate_id: candidate_id.to_string(),
                session_id: existing.session_id,
            }),
            None => Ok(()),
        }
    }

    fn allocate_id(&self, kind: SessionKind) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{id}", kind.as_str(), self.clock.unix_ms())
    }

    fn broadcast(&self, update: SessionLifecycleUpdate) {
        if self.lifecycle_tx.send(update).is_err() {
            debug!(target: TARGET, "no lifecycle subscribers");
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn supervisors(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.supervisors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ongoing_in<'a>(state: &'a RegistryState, candidate_id: &str, now: Instant) -> Option<&'a SessionEntry> {
    state
        .active
        .values()
        .filter(|entry| entry.info().candidate_id == candidate_id)
        .find(|entry| !entry.is_past_deadline(now))
}

fn into_outcome(finalized: FinalizedSession) -> Result<FinalizeOutcome, RegistryError> {
    match (finalized.result_id, finalized.error) {
        (Some(result_id), _) => Ok(FinalizeOutcome::Finalized { result_id }),
        (None, error) => Err(RegistryError::FinalizeFailed {
            session_id: finalized.info.session_id,
            error: error.unwrap_or_default(),
        }),
    }
}

/// Stops the periodic sweep.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if timeout(SUPERVISOR_GRACE, &mut self.task).await.is_err() {
            warn!(target: TARGET, "sweeper did not stop in time, aborting");
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests;
