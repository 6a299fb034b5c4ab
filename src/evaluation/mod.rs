//! Post-session scoring: every captured answer is archived as WAV and sent
//! to the pronunciation assessor, outside the real-time path.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::audio::{encode_wav, Answer};
use crate::orchestrator::traits::{PronunciationAssessor, PronunciationReport};
use crate::orchestrator::ExamRecord;
use crate::persistence::ResultStore;

const TARGET: &str = "evaluation";
const WAV_MIME: &str = "audio/wav";
const ASSESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamPart {
    Part1,
    Part2,
    Part3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerAssessment {
    pub part: ExamPart,
    pub sequence: u64,
    pub artifact_id: Option<String>,
    pub report: PronunciationReport,
    /// `false` when the assessor failed and the report is the empty default.
    pub assessed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExamScores {
    pub part1: f32,
    pub part2: f32,
    pub part3: f32,
    pub overall: f32,
}

impl ExamScores {
    /// Part means; overall is the mean of the three part means.
    pub fn from_assessments(assessments: &[AnswerAssessment]) -> Self {
        let part1 = mean_for(assessments, ExamPart::Part1);
        let part2 = mean_for(assessments, ExamPart::Part2);
        let part3 = mean_for(assessments, ExamPart::Part3);
        Self {
            part1,
            part2,
            part3,
            overall: (part1 + part2 + part3) / 3.0,
        }
    }
}

fn mean_for(assessments: &[AnswerAssessment], part: ExamPart) -> f32 {
    let scores: Vec<f32> = assessments
        .iter()
        .filter(|assessment| assessment.part == part)
        .map(|assessment| assessment.report.score)
        .collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub assessments: Vec<AnswerAssessment>,
    pub scores: ExamScores,
}

impl EvaluationReport {
    pub fn artifact_ids(&self) -> Vec<String> {
        self.assessments
            .iter()
            .filter_map(|assessment| assessment.artifact_id.clone())
            .collect()
    }
}

/// Answers of one record grouped by part: part two is the statement
/// followed by the follow-up answers.
pub fn answers_by_part(record: &ExamRecord) -> Vec<(ExamPart, &Answer)> {
    let part1 = record.part1.answers.iter().map(|answer| (ExamPart::Part1, answer));
    let part2 = record
        .part2
        .statement
        .iter()
        .chain(record.part2.followup_answers.iter())
        .map(|answer| (ExamPart::Part2, answer));
    let part3 = record.part3.answers.iter().map(|answer| (ExamPart::Part3, answer));
    part1.chain(part2).chain(part3).collect()
}

/// Archives and scores every answer of `record`. Store and assessor failures
/// degrade to a missing artifact or an empty zero-score report.
pub async fn evaluate_exam(
    owner_id: &str,
    record: &ExamRecord,
    store: &dyn ResultStore,
    assessor: Option<&dyn PronunciationAssessor>,
) -> EvaluationReport {
    let started = Instant::now();
    let mut assessments = Vec::new();

    for (part, answer) in answers_by_part(record) {
        let wav = match encode_wav(&answer.samples, answer.sample_rate) {
            Ok(wav) => Bytes::from(wav),
            Err(err) => {
                warn!(target: TARGET, owner_id, sequence = answer.sequence, %err, "failed to encode answer");
                assessments.push(AnswerAssessment {
                    part,
                    sequence: answer.sequence,
                    artifact_id: None,
                    report: PronunciationReport::default(),
                    assessed: false,
                });
                continue;
            }
        };

        let artifact_id = match store.create_artifact(owner_id, wav.clone(), WAV_MIME).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(target: TARGET, owner_id, sequence = answer.sequence, error = %format!("{err:#}"), "answer artifact not stored");
                None
            }
        };

        let (report, assessed) = match assessor {
            Some(assessor) => assess_one(assessor, wav, owner_id, answer.sequence).await,
            None => (PronunciationReport::default(), false),
        };
        assessments.push(AnswerAssessment {
            part,
            sequence: answer.sequence,
            artifact_id,
            report,
            assessed,
        });
    }

    let scores = ExamScores::from_assessments(&assessments);
    info!(
        target: TARGET,
        owner_id,
        answers = assessments.len(),
        overall = f64::from(scores.overall),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "exam evaluated"
    );
    EvaluationReport {
        assessments,
        scores,
    }
}

async fn assess_one(
    assessor: &dyn PronunciationAssessor,
    wav: Bytes,
    owner_id: &str,
    sequence: u64,
) -> (PronunciationReport, bool) {
    match timeout(ASSESS_TIMEOUT, assessor.assess(wav)).await {
        Ok(Ok(report)) => (report, true),
        Ok(Err(err)) => {
            warn!(target: TARGET, owner_id, sequence, error = %format!("{err:#}"), "assessment failed");
            (PronunciationReport::default(), false)
        }
        Err(_) => {
            warn!(target: TARGET, owner_id, sequence, "assessment timed out");
            (PronunciationReport::default(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use crate::orchestrator::traits::PhonemeScore;
    use crate::persistence::MemoryResultStore;

    fn answer(sequence: u64) -> Answer {
        Answer {
            sequence,
            sample_rate: 16_000,
            samples: vec![100_i16; 160].into(),
        }
    }

    fn record() -> ExamRecord {
        let mut record = ExamRecord::default();
        record.part1.answers = vec![answer(0), answer(1)];
        record.part2.statement = Some(answer(2));
        record.part2.followup_answers = vec![answer(3)];
        record.part3.answers = vec![answer(4), answer(5), answer(6)];
        record
    }

    /// Scores 60, 80, 100, ... in call order; fails the third call.
    struct SteppedAssessor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PronunciationAssessor for SteppedAssessor {
        async fn assess(&self, wav: Bytes) -> Result<PronunciationReport> {
            assert_eq!(&wav[..4], b"RIFF");
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 2 {
                return Err(anyhow!("assessor overloaded"));
            }
            Ok(PronunciationReport {
                transcript: format!("answer {call}"),
                phonemes: vec![PhonemeScore {
                    phoneme: "ae".into(),
                    score: 90.0,
                }],
                score: 60.0 + 20.0 * (call % 3) as f32,
            })
        }
    }

    #[tokio::test]
    async fn archives_every_answer_and_averages_by_part() {
        let store = MemoryResultStore::new();
        let assessor = SteppedAssessor {
            calls: AtomicUsize::new(0),
        };

        let report = evaluate_exam("session-1", &record(), &store, Some(&assessor)).await;

        assert_eq!(report.assessments.len(), 7);
        assert_eq!(store.artifacts().len(), 7);
        assert!(store.artifacts().iter().all(|artifact| artifact.mime_type == "audio/wav"));
        assert_eq!(report.artifact_ids().len(), 7);

        // Scores by call: 60, 80, failed, 60, 80, 100, 60.
        let failed: Vec<u64> = report
            .assessments
            .iter()
            .filter(|assessment| !assessment.assessed)
            .map(|assessment| assessment.sequence)
            .collect();
        assert_eq!(failed, vec![2]);
        assert_eq!(report.scores.part1, 70.0);
        assert_eq!(report.scores.part2, 30.0);
        assert_eq!(report.scores.part3, 80.0);
        assert_eq!(report.scores.overall, 60.0);
    }

    #[tokio::test]
    async fn missing_assessor_yields_zero_scores_but_keeps_artifacts() {
        let store = Arc::new(MemoryResultStore::new());
        let report = evaluate_exam("session-2", &record(), store.as_ref(), None).await;

        assert_eq!(store.artifacts().len(), 7);
        assert_eq!(report.scores, ExamScores::default());
        assert!(report.assessments.iter().all(|assessment| !assessment.assessed));
    }

    #[test]
    fn empty_parts_average_to_zero() {
        let scores = ExamScores::from_assessments(&[]);
        assert_eq!(scores, ExamScores::default());
    }
}
