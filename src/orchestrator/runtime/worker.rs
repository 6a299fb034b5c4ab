use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::audio::{Answer, AudioFrameIngest};
use crate::orchestrator::config::ExamConfig;
use crate::orchestrator::constants::AI_RETRY_BACKOFF;
use crate::orchestrator::error::ExamError;
use crate::orchestrator::extract::{parse_response, ParsedResponse};
use crate::orchestrator::traits::{ChatPart, ConversationalAi};
use crate::orchestrator::types::{
    ControlEvent, ExamPaper, ExamPhase, ExamProgress, RoundCounters, TerminationReason,
};
use crate::synthesis::SpeechSink;
use crate::telemetry::events::{record_ai_exchange, record_phase_transition};

use super::state::{ExamRecord, SessionSignal};

const TARGET: &str = "exam_state_machine";

enum AiRequest {
    Initiate(String),
    Chat(Vec<ChatPart>),
}

impl AiRequest {
    fn kind(&self) -> &'static str {
        match self {
            AiRequest::Initiate(_) => "initiate",
            AiRequest::Chat(_) => "chat",
        }
    }
}

pub(crate) struct MachineChannels {
    pub(crate) start_rx: oneshot::Receiver<()>,
    pub(crate) answer_rx: mpsc::Receiver<Answer>,
    pub(crate) control_tx: broadcast::Sender<ControlEvent>,
    pub(crate) progress_tx: watch::Sender<ExamProgress>,
}

/// Drives one oral attempt through its phases, strictly one at a time.
pub(crate) struct ExamPhaseStateMachine {
    session_id: String,
    config: ExamConfig,
    paper: ExamPaper,
    ai: Arc<dyn ConversationalAi>,
    speech: Arc<dyn SpeechSink>,
    ingest: Arc<AudioFrameIngest>,
    signal: Arc<SessionSignal>,
    start_rx: Option<oneshot::Receiver<()>>,
    answer_rx: mpsc::Receiver<Answer>,
    control_tx: broadcast::Sender<ControlEvent>,
    progress_tx: watch::Sender<ExamProgress>,
    phase: ExamPhase,
    rounds: RoundCounters,
    record: ExamRecord,
    consecutive_failures: u32,
    final_answer: Option<Answer>,
    started_at: Instant,
}

impl ExamPhaseStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: String,
        mut config: ExamConfig,
        paper: ExamPaper,
        ai: Arc<dyn ConversationalAi>,
        speech: Arc<dyn SpeechSink>,
        ingest: Arc<AudioFrameIngest>,
        signal: Arc<SessionSignal>,
        channels: MachineChannels,
    ) -> Self {
        config.part1_rounds = config.part1_rounds.max(1);
        config.followup_rounds = config.followup_rounds.max(1);
        config.discussion_rounds = config.discussion_rounds.max(1);
        config.ai_retry_cap = config.ai_retry_cap.max(1);

        Self {
            session_id,
            config,
            paper,
            ai,
            speech,
            ingest,
            signal,
            start_rx: Some(channels.start_rx),
            answer_rx: channels.answer_rx,
            control_tx: channels.control_tx,
            progress_tx: channels.progress_tx,
            phase: ExamPhase::AwaitingConnection,
            rounds: RoundCounters::default(),
            record: ExamRecord::default(),
            consecutive_failures: 0,
            final_answer: None,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<ExamRecord> {
        tokio::spawn(self.run())
    }

    pub(crate) async fn run(mut self) -> ExamRecord {
        let outcome = self.drive().await;
        let reason = match outcome {
            Ok(()) => TerminationReason::Completed,
            Err(ExamError::Cancelled) => self
                .signal
                .reason()
                .unwrap_or(TerminationReason::Cancelled),
            Err(err) => {
                warn!(
                    target: TARGET,
                    session_id = %self.session_id,
                    phase = ?self.phase,
                    %err,
                    "exam session aborted"
                );
                self.record.error = Some(err.to_string());
                self.emit(ControlEvent::Error {
                    message: err.to_string(),
                });
                match err {
                    ExamError::AiUnavailable { .. } => TerminationReason::AiUnavailable,
                    _ => TerminationReason::Fault,
                }
            }
        };
        self.finish(reason)
    }

    async fn drive(&mut self) -> Result<(), ExamError> {
        loop {
            if !self.signal.is_active() {
                return Err(ExamError::Cancelled);
            }

            match self.phase {
                ExamPhase::AwaitingConnection => self.await_connection().await?,
                ExamPhase::Part1Init => self.open_part1().await?,
                ExamPhase::Part1Conversation => self.part1_round().await?,
                ExamPhase::Part2AwaitPrep => self.open_part2().await?,
                ExamPhase::Part2Preparation => self.prepare().await?,
                ExamPhase::Part2Statement => self.statement().await?,
                ExamPhase::Part2Followup => self.followup_round().await?,
                ExamPhase::Part3Discussion => self.discussion_round().await?,
                ExamPhase::Evaluating => self.evaluate().await?,
                ExamPhase::Terminated => return Ok(()),
            }
        }
    }

    async fn await_connection(&mut self) -> Result<(), ExamError> {
        let Some(start_rx) = self.start_rx.take() else {
            return Err(ExamError::StartAborted);
        };
        tokio::select! {
            biased;
            _ = self.signal.cancelled() => return Err(ExamError::Cancelled),
            started = start_rx => started.map_err(|_| ExamError::StartAborted)?,
        }
        self.transition(ExamPhase::Part1Init);
        Ok(())
    }

    async fn open_part1(&mut self) -> Result<(), ExamError> {
        let prompt = self.config.prompts.part1(&self.paper.warm_up_topics);
        let Some(response) = self.call_ai(AiRequest::Initiate(prompt)).await? else {
            return self.backoff().await;
        };

        let parsed = self.parse(&response);
        self.record.part1.questions.push(parsed.spoken.clone());
        self.speak(&parsed.spoken);
        self.transition(ExamPhase::Part1Conversation);
        self.emit(ControlEvent::NextState {
            phase: ExamPhase::Part1Conversation,
            task_card: None,
        });
        Ok(())
    }

    async fn part1_round(&mut self) -> Result<(), ExamError> {
        let answer = self.next_answer().await?;
        let last = self.rounds.part1 + 1 >= self.config.part1_rounds;

        let mut parts = vec![ChatPart::answer(&answer)];
        if last {
            parts.push(ChatPart::Text(self.config.prompts.last_turn.clone()));
        }
        let Some(response) = self.call_ai(AiRequest::Chat(parts)).await? else {
            self.retry_turn();
            return Ok(());
        };

        self.rounds.part1 += 1;
        self.record.part1.answers.push(answer);
        let parsed = self.parse(&response);
        self.speak(&parsed.spoken);

        if !last {
            self.record.part1.questions.push(parsed.spoken);
            self.reopen_turn();
            self.emit(ControlEvent::ResumeRecording {
                phase: ExamPhase::Part1Conversation,
            });
            return Ok(());
        }

        self.record.part1_closing_signal = parsed.closing_signal;
        if !parsed.closing_signal {
            warn!(
                target: TARGET,
                session_id = %self.session_id,
                "closing signal missing from last part one response"
            );
        }
        self.transition(ExamPhase::Part2AwaitPrep);
        self.emit(ControlEvent::NextState {
            phase: ExamPhase::Part2AwaitPrep,
            task_card: None,
        });
        Ok(())
    }

    async fn open_part2(&mut self) -> Result<(), ExamError> {
        let prompt = self.config.prompts.part2(&self.paper.part2_topic);
        let Some(response) = self.call_ai(AiRequest::Initiate(prompt)).await? else {
            return self.backoff().await;
        };

        let parsed = self.parse(&response);
        let task_card = parsed.task_card.clone().unwrap_or_else(|| {
            warn!(target: TARGET, session_id = %self.session_id, "task card block missing");
            String::new()
        });
        let hand_off = match parsed.hand_off.clone() {
            Some(hand_off) => hand_off,
            None => {
                warn!(
                    target: TARGET,
                    session_id = %self.session_id,
                    "hand-off block missing, speaking response body"
                );
                parsed.spoken.clone()
            }
        };

        self.speak(&hand_off);
        self.record.part2.task_card = task_card.clone();
        self.record.part2.hand_off = hand_off;
        self.transition(ExamPhase::Part2Preparation);
        self.emit(ControlEvent::NextState {
            phase: ExamPhase::Part2Preparation,
            task_card: Some(task_card),
        });
        self.emit(ControlEvent::TimerStarted {
            phase: ExamPhase::Part2Preparation,
            duration: self.config.preparation_duration,
        });
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), ExamError> {
        match self.timed_answer(self.config.preparation_duration).await? {
            Some(_) => info!(
                target: TARGET,
                session_id = %self.session_id,
                "candidate ended preparation early"
            ),
            None => {
                self.ingest.close_turn();
                self.drain_stale_answers();
            }
        }

        self.transition(ExamPhase::Part2Statement);
        self.emit(ControlEvent::NextState {
            phase: ExamPhase::Part2Statement,
            task_card: None,
        });
        self.emit(ControlEvent::TimerStarted {
            phase: ExamPhase::Part2Statement,
            duration: self.config.statement_duration,
        });
        Ok(())
    }

    async fn statement(&mut self) -> Result<(), ExamError> {
        let answer = match self.timed_answer(self.config.statement_duration).await? {
            Some(answer) => answer,
            None => {
                let answer = self.ingest.close_turn();
                self.drain_stale_answers();
                info!(
                    target: TARGET,
                    session_id = %self.session_id,
                    samples = answer.samples.len(),
                    "statement time elapsed, flushing live buffer"
                );
                answer
            }
        };

        let parts = vec![
            ChatPart::answer(&answer),
            ChatPart::Text(self.config.prompts.time_up.clone()),
        ];
        self.record.part2.statement = Some(answer);
        let Some(response) = self.call_ai(AiRequest::Chat(parts)).await? else {
            self.retry_turn();
            self.emit(ControlEvent::TimerStarted {
                phase: ExamPhase::Part2Statement,
                duration: self.config.statement_duration,
            });
            return Ok(());
        };

        let parsed = self.parse(&response);
        self.speak(&parsed.spoken);
        self.record.part2.followup_questions.push(parsed.spoken);
        self.transition(ExamPhase::Part2Followup);
        self.emit(ControlEvent::NextState {
            phase: ExamPhase::Part2Followup,
            task_card: None,
        });
        Ok(())
    }

    async fn followup_round(&mut self) -> Result<(), ExamError> {
        let answer = self.next_answer().await?;
        let last = self.rounds.followup + 1 >= self.config.followup_rounds;

        let mut parts = vec![ChatPart::answer(&answer)];
        if last {
            parts.push(ChatPart::Text(self.config.prompts.part3_opening.clone()));
        }
        let Some(response) = self.call_ai(AiRequest::Chat(parts)).await? else {
            self.retry_turn();
            return Ok(());
        };

        self.rounds.followup += 1;
        self.record.part2.followup_answers.push(answer);
        let parsed = self.parse(&response);
        self.speak(&parsed.spoken);

        if last {
            self.record.part3.questions.push(parsed.spoken);
            self.transition(ExamPhase::Part3Discussion);
            self.emit(ControlEvent::NextState {
                phase: ExamPhase::Part3Discussion,
                task_card: None,
            });
        } else {
            self.record.part2.followup_questions.push(parsed.spoken);
            self.reopen_turn();
            self.emit(ControlEvent::ResumeRecording {
                phase: ExamPhase::Part2Followup,
            });
        }
        Ok(())
    }

    async fn discussion_round(&mut self) -> Result<(), ExamError> {
        let answer = self.next_answer().await?;

        if self.rounds.discussion + 1 >= self.config.discussion_rounds {
            self.rounds.discussion += 1;
            self.record.part3.answers.push(answer.clone());
            self.final_answer = Some(answer);
            self.transition(ExamPhase::Evaluating);
            self.emit(ControlEvent::AwaitingAnalysis);
            return Ok(());
        }

        let parts = vec![ChatPart::answer(&answer)];
        let Some(response) = self.call_ai(AiRequest::Chat(parts)).await? else {
            self.retry_turn();
            return Ok(());
        };

        self.rounds.discussion += 1;
        self.record.part3.answers.push(answer);
        let parsed = self.parse(&response);
        self.speak(&parsed.spoken);
        self.record.part3.questions.push(parsed.spoken);
        self.reopen_turn();
        self.emit(ControlEvent::ResumeRecording {
            phase: ExamPhase::Part3Discussion,
        });
        Ok(())
    }

    async fn evaluate(&mut self) -> Result<(), ExamError> {
        let mut parts = Vec::with_capacity(2);
        if let Some(answer) = self.final_answer.as_ref() {
            parts.push(ChatPart::answer(answer));
        }
        parts.push(ChatPart::Text(self.config.prompts.analysis.clone()));

        let Some(response) = self.call_ai(AiRequest::Chat(parts)).await? else {
            return self.backoff().await;
        };

        let parsed = self.parse(&response);
        let feedback = parsed.feedback.unwrap_or_else(|| {
            warn!(target: TARGET, session_id = %self.session_id, "feedback block missing");
            String::new()
        });
        self.record.feedback = Some(feedback.clone());
        self.emit(ControlEvent::Feedback { text: feedback });
        self.transition(ExamPhase::Terminated);
        Ok(())
    }

    /// Issues one AI call. `Ok(None)` is a tolerated failure that must not
    /// advance the round; the cap turns repeated failures into an error.
    async fn call_ai(&mut self, request: AiRequest) -> Result<Option<String>, ExamError> {
        let kind = request.kind();
        let ai = Arc::clone(&self.ai);
        let call = async move {
            match request {
                AiRequest::Initiate(prompt) => ai.initiate(&prompt).await,
                AiRequest::Chat(parts) => ai.chat(parts).await,
            }
        };

        let started = Instant::now();
        let outcome = self.cancellable(timeout(self.config.ai_timeout, call)).await?;
        let latency = started.elapsed();

        let failure = match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                self.consecutive_failures = 0;
                record_ai_exchange(&self.session_id, self.phase, kind, latency, true);
                return Ok(Some(text));
            }
            Ok(Ok(_)) => "empty response".to_string(),
            Ok(Err(err)) => format!("{err:#}"),
            Err(_) => format!("timed out after {:?}", self.config.ai_timeout),
        };

        self.consecutive_failures += 1;
        record_ai_exchange(&self.session_id, self.phase, kind, latency, false);
        warn!(
            target: TARGET,
            session_id = %self.session_id,
            phase = ?self.phase,
            kind,
            attempt = self.consecutive_failures,
            reason = %failure,
            "conversational AI call failed"
        );

        if self.consecutive_failures >= self.config.ai_retry_cap {
            return Err(ExamError::AiUnavailable {
                phase: self.phase,
                attempts: self.consecutive_failures,
            });
        }
        Ok(None)
    }

    async fn backoff(&self) -> Result<(), ExamError> {
        self.cancellable(sleep(AI_RETRY_BACKOFF)).await
    }

    async fn cancellable<F: Future>(&self, future: F) -> Result<F::Output, ExamError> {
        tokio::select! {
            biased;
            _ = self.signal.cancelled() => Err(ExamError::Cancelled),
            output = future => Ok(output),
        }
    }

    async fn next_answer(&mut self) -> Result<Answer, ExamError> {
        tokio::select! {
            biased;
            _ = self.signal.cancelled() => Err(ExamError::Cancelled),
            answer = self.answer_rx.recv() => answer.ok_or(ExamError::AnswerChannelClosed),
        }
    }

    /// Earliest of a submitted turn or `limit`; `None` on timeout.
    async fn timed_answer(&mut self, limit: Duration) -> Result<Option<Answer>, ExamError> {
        tokio::select! {
            biased;
            _ = self.signal.cancelled() => Err(ExamError::Cancelled),
            answer = self.answer_rx.recv() => {
                answer.map(Some).ok_or(ExamError::AnswerChannelClosed)
            }
            _ = sleep(limit) => Ok(None),
        }
    }

    fn drain_stale_answers(&mut self) {
        while let Ok(stale) = self.answer_rx.try_recv() {
            debug!(
                target: TARGET,
                sequence = stale.sequence,
                "discarding answer submitted after turn closed"
            );
        }
    }

    fn parse(&self, response: &str) -> ParsedResponse {
        parse_response(response, &self.config.markers)
    }

    fn speak(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if self.speech.speak(text).is_none() {
            warn!(
                target: TARGET,
                session_id = %self.session_id,
                "examiner speech not queued"
            );
        }
    }

    fn transition(&mut self, next: ExamPhase) {
        let previous = self.phase;
        self.phase = next;
        self.consecutive_failures = 0;
        self.apply_gate();
        self.publish_progress();
        record_phase_transition(
            &self.session_id,
            previous,
            next,
            self.rounds,
            self.started_at.elapsed(),
        );
    }

    fn reopen_turn(&mut self) {
        self.apply_gate();
        self.publish_progress();
    }

    fn retry_turn(&mut self) {
        self.reopen_turn();
        self.emit(ControlEvent::ResumeRecording { phase: self.phase });
    }

    fn apply_gate(&self) {
        let gate = self.ingest.gate();
        if self.phase.accepts_turn_end() {
            gate.open(self.phase.is_listening());
        } else {
            gate.close();
        }
    }

    fn publish_progress(&self) {
        self.progress_tx.send_replace(ExamProgress {
            phase: self.phase,
            rounds: self.rounds,
            answers_captured: self.record.answer_count(),
        });
    }

    fn emit(&self, event: ControlEvent) {
        debug!(
            target: TARGET,
            session_id = %self.session_id,
            event = event.name(),
            "control event"
        );
        // Control events are fire-and-forget.
        let _ = self.control_tx.send(event);
    }

    fn finish(mut self, reason: TerminationReason) -> ExamRecord {
        if self.phase != ExamPhase::Terminated {
            self.transition(ExamPhase::Terminated);
        }
        self.ingest.gate().close();
        self.signal.terminate(reason);

        self.record.rounds = self.rounds;
        self.record.termination = Some(reason);
        self.record.elapsed = self.started_at.elapsed();
        self.emit(ControlEvent::SessionEnded { reason });
        info!(
            target: TARGET,
            session_id = %self.session_id,
            reason = reason.as_str(),
            answers = self.record.answer_count(),
            "exam session terminated"
        );
        self.record
    }
}
