use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::audio::{
    Answer, AudioFrame, AudioFrameIngest, IngestOutcome, LevelReading, TurnSubmission,
};
use crate::orchestrator::types::{ControlEvent, ExamProgress, TerminationReason};

use super::state::SessionSignal;

const TARGET: &str = "exam_state_machine";

/// Caller-side view of one running oral session.
pub struct ExamSessionHandle {
    session_id: String,
    ingest: Arc<AudioFrameIngest>,
    signal: Arc<SessionSignal>,
    start_tx: Mutex<Option<oneshot::Sender<()>>>,
    answer_tx: mpsc::Sender<Answer>,
    control_tx: broadcast::Sender<ControlEvent>,
    progress_rx: watch::Receiver<ExamProgress>,
}

impl ExamSessionHandle {
    pub(super) fn new(
        session_id: String,
        ingest: Arc<AudioFrameIngest>,
        signal: Arc<SessionSignal>,
        start_tx: oneshot::Sender<()>,
        answer_tx: mpsc::Sender<Answer>,
        control_tx: broadcast::Sender<ControlEvent>,
        progress_rx: watch::Receiver<ExamProgress>,
    ) -> Self {
        Self {
            session_id,
            ingest,
            signal,
            start_tx: Mutex::new(Some(start_tx)),
            answer_tx,
            control_tx,
            progress_rx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Leaves AWAITING_CONNECTION. Only the first call has an effect.
    pub fn begin(&self) -> bool {
        let start = self
            .start_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match start {
            Some(start) => {
                let started = start.send(()).is_ok();
                info!(target: TARGET, session_id = %self.session_id, started, "exam start requested");
                started
            }
            None => false,
        }
    }

    pub fn push_frame(&self, frame: &AudioFrame) -> IngestOutcome {
        if !self.signal.is_active() {
            return IngestOutcome::Discarded;
        }
        self.ingest.push_frame(frame)
    }

    /// Manual submit: the current turn becomes an answer now.
    pub fn submit_turn(&self) -> TurnSubmission {
        if !self.signal.is_active() {
            return TurnSubmission::NotAccepting;
        }
        let outcome = self.ingest.submit_turn(&self.answer_tx);
        if outcome == TurnSubmission::NotAccepting {
            debug!(
                target: TARGET,
                session_id = %self.session_id,
                "manual submit ignored outside an answer phase"
            );
        }
        outcome
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlEvent> {
        self.control_tx.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelReading> {
        self.ingest.subscribe_levels()
    }

    pub fn progress(&self) -> ExamProgress {
        *self.progress_rx.borrow()
    }

    pub fn watch_progress(&self) -> watch::Receiver<ExamProgress> {
        self.progress_rx.clone()
    }

    pub fn buffered_samples(&self) -> usize {
        self.ingest.buffered_samples()
    }

    /// Returns `true` if this call ended the session.
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        let ended = self.signal.terminate(reason);
        if ended {
            warn!(
                target: TARGET,
                session_id = %self.session_id,
                reason = reason.as_str(),
                "session termination requested"
            );
        }
        ended
    }

    pub fn is_active(&self) -> bool {
        self.signal.is_active()
    }

    pub(crate) fn signal(&self) -> Arc<SessionSignal> {
        Arc::clone(&self.signal)
    }
}
