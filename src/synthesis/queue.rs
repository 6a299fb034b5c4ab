use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::audio::{decode_clip, PcmLayout, PlaybackItem, SynthesizedClip};
use crate::orchestrator::config::SynthesisConfig;
use crate::orchestrator::traits::SpeechSynthesizer;
use crate::orchestrator::SessionSignal;
use crate::telemetry::events::record_utterance_synthesized;

use super::{split_utterances, SynthesisError};

const TARGET: &str = "synthesis_queue";

/// Where the state machine hands examiner text to be spoken.
pub trait SpeechSink: Send + Sync {
    /// Queues one text block, returning its block id, or `None` when the
    /// producer is gone.
    fn speak(&self, text: &str) -> Option<u64>;
}

#[derive(Debug)]
struct TextBlock {
    block: u64,
    text: String,
}

pub struct SynthesisHandle {
    block_tx: mpsc::Sender<TextBlock>,
    next_block: AtomicU64,
}

impl SpeechSink for SynthesisHandle {
    fn speak(&self, text: &str) -> Option<u64> {
        let block = self.next_block.fetch_add(1, Ordering::SeqCst);
        match self.block_tx.try_send(TextBlock {
            block,
            text: text.to_string(),
        }) {
            Ok(()) => Some(block),
            Err(err) => {
                warn!(target: TARGET, block, %err, "dropping examiner text block");
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub blocks: u64,
    pub utterances_synthesized: u64,
    pub utterances_failed: u64,
}

/// Sequential producer: one utterance at a time, in block order, into the
/// playback ready-queue.
pub struct UtteranceSynthesisQueue {
    config: SynthesisConfig,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    block_rx: mpsc::Receiver<TextBlock>,
    ready_tx: mpsc::Sender<PlaybackItem>,
    signal: Arc<SessionSignal>,
    next_sequence: u64,
    stats: QueueStats,
}

impl UtteranceSynthesisQueue {
    pub fn new(
        config: SynthesisConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        ready_tx: mpsc::Sender<PlaybackItem>,
        signal: Arc<SessionSignal>,
    ) -> (Self, SynthesisHandle) {
        let (block_tx, block_rx) = mpsc::channel(config.block_capacity.max(1));
        let queue = Self {
            config,
            synthesizer,
            block_rx,
            ready_tx,
            signal,
            next_sequence: 0,
            stats: QueueStats::default(),
        };
        let handle = SynthesisHandle {
            block_tx,
            next_block: AtomicU64::new(0),
        };
        (queue, handle)
    }

    pub fn spawn(self) -> JoinHandle<QueueStats> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> QueueStats {
        loop {
            let block = tokio::select! {
                block = self.block_rx.recv() => block,
                _ = self.signal.cancelled() => break,
            };
            let Some(block) = block else {
                break;
            };
            if !self.process(block).await {
                break;
            }
        }

        info!(
            target: TARGET,
            blocks = self.stats.blocks,
            synthesized = self.stats.utterances_synthesized,
            failed = self.stats.utterances_failed,
            "synthesis producer stopped"
        );
        self.stats
    }

    /// Returns `false` once playback or the session is gone.
    async fn process(&mut self, block: TextBlock) -> bool {
        self.stats.blocks += 1;
        let utterances = split_utterances(&block.text);
        debug!(
            target: TARGET,
            block = block.block,
            utterances = utterances.len(),
            "synthesizing examiner block"
        );

        for text in utterances {
            if !self.signal.is_active() {
                return false;
            }

            let started = Instant::now();
            match self.render(&text).await {
                Ok(clip) => {
                    let sequence = self.next_sequence;
                    self.next_sequence += 1;
                    self.stats.utterances_synthesized += 1;
                    record_utterance_synthesized(
                        block.block,
                        sequence,
                        text.chars().count(),
                        started.elapsed(),
                        true,
                    );
                    let item = PlaybackItem::Clip {
                        sequence,
                        text,
                        clip,
                    };
                    if !self.deliver(item).await {
                        return false;
                    }
                }
                Err(err) => {
                    self.stats.utterances_failed += 1;
                    record_utterance_synthesized(
                        block.block,
                        self.next_sequence,
                        text.chars().count(),
                        started.elapsed(),
                        false,
                    );
                    warn!(target: TARGET, block = block.block, %err, %text, "skipping utterance");
                }
            }
        }

        self.deliver(PlaybackItem::BlockDrained { block: block.block })
            .await
    }

    async fn render(&self, text: &str) -> Result<SynthesizedClip, SynthesisError> {
        let request = self.synthesizer.synthesize(text, &self.config.voice);
        let audio = timeout(self.config.request_timeout, request)
            .await
            .map_err(|_| SynthesisError::Timeout(self.config.request_timeout))?
            .map_err(SynthesisError::Request)?;
        let layout = PcmLayout {
            sample_rate: self.config.voice.raw_sample_rate,
            channels: self.config.voice.raw_channels,
        };
        Ok(decode_clip(&audio.bytes, &audio.mime_type, layout)?)
    }

    async fn deliver(&self, item: PlaybackItem) -> bool {
        tokio::select! {
            sent = self.ready_tx.send(item) => match sent {
                Ok(()) => true,
                Err(_) => {
                    warn!(target: TARGET, "playback queue closed");
                    false
                }
            },
            _ = self.signal.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::audio::{encode_wav, ClipFrame};
    use crate::orchestrator::config::VoiceProfile;
    use crate::orchestrator::traits::SynthesizedAudio;

    struct DelayedSynthesizer {
        delays: HashMap<&'static str, u64>,
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl SpeechSynthesizer for DelayedSynthesizer {
        async fn synthesize(&self, text: &str, _voice: &VoiceProfile) -> Result<SynthesizedAudio> {
            let delay = self.delays.get(text).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.failing.iter().any(|failing| *failing == text) {
                return Err(anyhow!("voice server rejected `{text}`"));
            }
            let marker = text.as_bytes()[0] as i16;
            let wav = encode_wav(&[marker; 160], 16_000)?;
            Ok(SynthesizedAudio {
                bytes: Bytes::from(wav),
                mime_type: "audio/wav".into(),
            })
        }
    }

    fn queue_with(
        synthesizer: DelayedSynthesizer,
    ) -> (
        SynthesisHandle,
        mpsc::Receiver<PlaybackItem>,
        JoinHandle<QueueStats>,
        Arc<SessionSignal>,
    ) {
        let (ready_tx, ready_rx) = mpsc::channel(16);
        let signal = Arc::new(SessionSignal::new());
        let (queue, handle) = UtteranceSynthesisQueue::new(
            SynthesisConfig::default(),
            Arc::new(synthesizer),
            ready_tx,
            Arc::clone(&signal),
        );
        (handle, ready_rx, queue.spawn(), signal)
    }

    async fn next_item(rx: &mut mpsc::Receiver<PlaybackItem>) -> PlaybackItem {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("item in time")
            .expect("queue open")
    }

    #[tokio::test]
    async fn clips_arrive_in_text_order_despite_latency() {
        let (handle, mut rx, task, signal) = queue_with(DelayedSynthesizer {
            delays: HashMap::from([("A.", 60), ("B.", 1), ("C.", 20)]),
            failing: Vec::new(),
        });

        assert_eq!(handle.speak("A. B. C."), Some(0));

        let mut order = Vec::new();
        for _ in 0..3 {
            match next_item(&mut rx).await {
                PlaybackItem::Clip {
                    sequence,
                    text,
                    clip,
                } => {
                    assert_eq!(sequence as usize, order.len());
                    assert!(matches!(clip.frames[0], ClipFrame::Pcm(_)));
                    order.push(text);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(order, vec!["A.", "B.", "C."]);
        assert!(matches!(
            next_item(&mut rx).await,
            PlaybackItem::BlockDrained { block: 0 }
        ));

        signal.deactivate();
        let stats = task.await.expect("join");
        assert_eq!(stats.utterances_synthesized, 3);
    }

    #[tokio::test]
    async fn failed_utterance_is_skipped_and_block_still_drains() {
        let (handle, mut rx, task, signal) = queue_with(DelayedSynthesizer {
            delays: HashMap::new(),
            failing: vec!["B."],
        });

        handle.speak("A. B. C.");
        handle.speak("D.");

        let mut texts = Vec::new();
        let mut drained = Vec::new();
        while drained.len() < 2 {
            match next_item(&mut rx).await {
                PlaybackItem::Clip { text, .. } => texts.push(text),
                PlaybackItem::BlockDrained { block } => drained.push(block),
            }
        }
        assert_eq!(texts, vec!["A.", "C.", "D."]);
        assert_eq!(drained, vec![0, 1]);

        signal.deactivate();
        let stats = task.await.expect("join");
        assert_eq!(stats.utterances_failed, 1);
        assert_eq!(stats.blocks, 2);
    }
}
