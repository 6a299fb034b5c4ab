mod handle;
mod state;
mod worker;

pub use handle::ExamSessionHandle;
pub use state::{ConversationRecord, ExamRecord, SessionSignal, TaskCardRecord};

use std::fmt::Debug;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::audio::{AudioFrameIngest, AudioOutputLoop, LevelReading, MixerStats, OutputMixer};
use crate::orchestrator::candidate::{CandidateScript, ScriptedCandidate};
use crate::orchestrator::config::{EngineConfig, TopicConfig};
use crate::orchestrator::constants::{
    ANSWER_CHANNEL_CAPACITY, CONTROL_CHANNEL_CAPACITY, TASK_JOIN_GRACE,
};
use crate::orchestrator::traits::{ConversationalAi, SpeechSynthesizer};
use crate::orchestrator::types::{ControlEvent, ExamPaper, ExamProgress, TerminationReason};
use crate::room::{Dispatch, RoomConnection, RoomError, RoomEvent, RoomEventRouter, RouterExit};
use crate::synthesis::{QueueStats, UtteranceSynthesisQueue};

use self::worker::{ExamPhaseStateMachine, MachineChannels};

const TARGET: &str = "exam_state_machine";

/// Collaborators and inputs bound to one oral session.
pub struct SessionWiring {
    pub session_id: String,
    pub paper: ExamPaper,
    pub ai: Arc<dyn ConversationalAi>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub connection: Arc<dyn RoomConnection>,
    /// Inbound room events; `None` when frames are pushed through the handle.
    pub events: Option<mpsc::Receiver<RoomEvent>>,
    /// Replaces live audio with scripted answers.
    pub candidate: Option<CandidateScript>,
}

/// The per-session tasks, joined once the state machine returns.
pub struct SessionTasks {
    session_id: String,
    signal: Arc<SessionSignal>,
    connection: Arc<dyn RoomConnection>,
    machine: JoinHandle<ExamRecord>,
    output: JoinHandle<MixerStats>,
    synthesis: JoinHandle<QueueStats>,
    router: Option<JoinHandle<RouterExit>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl SessionTasks {
    /// Waits for the state machine, stops the remaining loops, and closes the
    /// room. A panicked state machine is reported as the error.
    pub async fn join(self) -> Result<ExamRecord, JoinError> {
        let record = self.machine.await;
        if let Err(err) = &record {
            warn!(target: TARGET, session_id = %self.session_id, %err, "state machine task failed");
            self.signal.terminate(TerminationReason::Fault);
        }

        settle("auxiliary", self.forwarders).await;
        settle_one("output_loop", self.output).await;
        settle_one("synthesis_queue", self.synthesis).await;
        if let Some(router) = self.router {
            settle_one("room_router", router).await;
        }

        match self.connection.disconnect().await {
            Ok(()) | Err(RoomError::Closed) => {}
            Err(err) => warn!(target: TARGET, session_id = %self.session_id, %err, "room disconnect failed"),
        }
        info!(target: TARGET, session_id = %self.session_id, "session tasks joined");
        record
    }
}

async fn settle(name: &'static str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        settle_one(name, handle).await;
    }
}

async fn settle_one<T: Debug>(name: &'static str, mut handle: JoinHandle<T>) -> Option<T> {
    match timeout(TASK_JOIN_GRACE, &mut handle).await {
        Ok(Ok(output)) => {
            debug!(target: TARGET, task = name, ?output, "session task finished");
            Some(output)
        }
        Ok(Err(err)) => {
            warn!(target: TARGET, task = name, %err, "session task failed");
            None
        }
        Err(_) => {
            warn!(target: TARGET, task = name, "session task did not stop in time, aborting");
            handle.abort();
            None
        }
    }
}

/// Wires ingest, synthesis, playback, room dispatch and the phase state
/// machine for one oral session. The machine waits in AWAITING_CONNECTION
/// until [`ExamSessionHandle::begin`].
pub fn spawn_session(
    config: &EngineConfig,
    wiring: SessionWiring,
) -> (Arc<ExamSessionHandle>, SessionTasks) {
    let SessionWiring {
        session_id,
        paper,
        ai,
        synthesizer,
        connection,
        events,
        candidate,
    } = wiring;

    let signal = Arc::new(SessionSignal::new());
    let ingest = Arc::new(AudioFrameIngest::new(config.ingest.clone()));
    let (start_tx, start_rx) = oneshot::channel();
    let (answer_tx, answer_rx) = mpsc::channel(ANSWER_CHANNEL_CAPACITY);
    let (control_tx, _) = broadcast::channel(CONTROL_CHANNEL_CAPACITY);
    let (progress_tx, progress_rx) = watch::channel(ExamProgress::default());
    let (ready_tx, ready_rx) = mpsc::channel(config.output.queue_capacity.max(1));

    let handle = Arc::new(ExamSessionHandle::new(
        session_id.clone(),
        Arc::clone(&ingest),
        Arc::clone(&signal),
        start_tx,
        answer_tx,
        control_tx.clone(),
        progress_rx,
    ));

    let mut forwarders = vec![
        spawn_control_forwarder(
            control_tx.subscribe(),
            Arc::clone(&connection),
            config.topics.control.clone(),
        ),
        spawn_level_forwarder(
            ingest.subscribe_levels(),
            Arc::clone(&connection),
            config.topics.audio_level.clone(),
            Arc::clone(&signal),
        ),
    ];

    let (queue, speech) = UtteranceSynthesisQueue::new(
        config.synthesis.clone(),
        synthesizer,
        ready_tx,
        Arc::clone(&signal),
    );
    let synthesis = queue.spawn();

    let drain_ingest = Arc::clone(&ingest);
    let mixer = OutputMixer::new(config.output.clone(), ready_rx).with_drain_callback(Arc::new(
        move |block| {
            debug!(target: TARGET, block, "examiner block played, clearing turn buffer");
            drain_ingest.clear();
        },
    ));
    let output = AudioOutputLoop::new(mixer, Arc::clone(&connection), Arc::clone(&signal)).spawn();

    let router = events.map(|events| {
        spawn_router(
            build_router(&handle, &config.topics),
            events,
            Arc::clone(&handle),
        )
    });

    if let Some(script) = candidate {
        forwarders.push(ScriptedCandidate::new(Arc::clone(&handle), script).spawn());
    }

    let machine = ExamPhaseStateMachine::new(
        session_id.clone(),
        config.exam.clone(),
        paper,
        ai,
        Arc::new(speech),
        ingest,
        Arc::clone(&signal),
        MachineChannels {
            start_rx,
            answer_rx,
            control_tx,
            progress_tx,
        },
    )
    .spawn();

    let tasks = SessionTasks {
        session_id,
        signal,
        connection,
        machine,
        output,
        synthesis,
        router,
        forwarders,
    };
    (handle, tasks)
}

fn build_router(handle: &Arc<ExamSessionHandle>, topics: &TopicConfig) -> RoomEventRouter {
    let frames = Arc::clone(handle);
    let departures = Arc::clone(handle);
    let mut router = RoomEventRouter::new()
        .on(RoomEvent::FRAME_RECEIVED, move |event| {
            if let RoomEvent::FrameReceived(frame) = event {
                frames.push_frame(&frame);
            }
            Dispatch::Continue
        })
        .on(RoomEvent::PARTICIPANT_DISCONNECTED, move |event| {
            if let RoomEvent::ParticipantDisconnected { identity } = event {
                info!(target: TARGET, %identity, "candidate left the room");
            }
            departures.terminate(TerminationReason::Disconnected);
            Dispatch::Stop
        });

    for topic in &topics.manual_submit {
        let submitter = Arc::clone(handle);
        router = router.on_topic(topic.clone(), move |_payload| {
            let outcome = submitter.submit_turn();
            debug!(target: TARGET, ?outcome, "manual submit received");
            Dispatch::Continue
        });
    }
    router
}

fn spawn_router(
    router: RoomEventRouter,
    events: mpsc::Receiver<RoomEvent>,
    handle: Arc<ExamSessionHandle>,
) -> JoinHandle<RouterExit> {
    tokio::spawn(async move {
        let exit = router.run(events, handle.signal()).await;
        if exit == RouterExit::StreamClosed {
            handle.terminate(TerminationReason::Disconnected);
        }
        exit
    })
}

fn spawn_control_forwarder(
    mut control: broadcast::Receiver<ControlEvent>,
    connection: Arc<dyn RoomConnection>,
    topic: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match control.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: TARGET, skipped, "control forwarder lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let last = matches!(event, ControlEvent::SessionEnded { .. });

            match event.encode() {
                Ok(payload) => match connection.send_data(&topic, payload) {
                    Ok(()) => {}
                    Err(RoomError::Closed) => break,
                    Err(err) => warn!(target: TARGET, %err, event = event.name(), "failed to send control event"),
                },
                Err(err) => warn!(target: TARGET, %err, event = event.name(), "failed to encode control event"),
            }
            if last {
                break;
            }
        }
    })
}

fn spawn_level_forwarder(
    mut levels: broadcast::Receiver<LevelReading>,
    connection: Arc<dyn RoomConnection>,
    topic: String,
    signal: Arc<SessionSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reading = tokio::select! {
                reading = levels.recv() => reading,
                _ = signal.cancelled() => break,
            };
            let reading = match reading {
                Ok(reading) => reading,
                // Stale loudness is worthless; skip ahead.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let payload = json!({
                "dbfs": reading.dbfs,
                "listening": reading.listening,
            });
            match serde_json::to_vec(&payload) {
                Ok(bytes) => {
                    if let Err(RoomError::Closed) = connection.send_data(&topic, bytes.into()) {
                        break;
                    }
                }
                Err(err) => warn!(target: TARGET, %err, "failed to encode audio level"),
            }
        }
    })
}
