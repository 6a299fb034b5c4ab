use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use super::*;
use crate::evaluation::ExamScores;

fn summary(session_id: &str) -> SessionSummary {
    SessionSummary {
        session_id: session_id.into(),
        candidate_id: "cand-1".into(),
        paper_id: "paper-7".into(),
        kind: SessionKind::Oral,
        outcome: "completed".into(),
        started_at_ms: 1_000,
        completed_at_ms: 61_000,
        answers: 9,
        artifact_ids: vec!["artifact-1".into()],
        task_card: Some("Describe a memorable trip.".into()),
        feedback: Some("Fluent.".into()),
        scores: Some(ExamScores {
            part1: 80.0,
            part2: 70.0,
            part3: 90.0,
            overall: 80.0,
        }),
        written_answers: BTreeMap::new(),
        error: None,
    }
}

#[tokio::test]
async fn actor_serialises_calls_into_the_store() {
    let store = Arc::new(MemoryResultStore::new());
    let (handle, task) = PersistenceActor::spawn(store.clone(), 8);

    let artifact = handle
        .artifact("session-1", Bytes::from_static(b"RIFF"), "audio/wav")
        .await
        .expect("artifact stored");
    let result = handle.submit(summary("session-1")).await.expect("result stored");

    assert_eq!(artifact, "artifact-1");
    assert_eq!(result, "result-2");
    assert_eq!(store.results_for("session-1").len(), 1);
    assert_eq!(store.artifacts()[0].mime_type, "audio/wav");

    drop(handle);
    timeout(Duration::from_secs(1), task)
        .await
        .expect("actor stops once handles drop")
        .expect("join");
}

#[tokio::test]
async fn handle_reports_stopped_actor() {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    drop(rx);
    let handle = PersistenceHandle::new(tx);
    let err = handle.submit(summary("gone")).await.expect_err("actor gone");
    assert!(matches!(err, PersistenceError::ActorGone));
}

#[test]
fn summary_round_trips_through_json_with_defaults() {
    let encoded = r#"{
        "session_id": "s-2",
        "candidate_id": "c",
        "paper_id": "p",
        "kind": "reading",
        "outcome": "expired",
        "started_at_ms": 10,
        "completed_at_ms": 5,
        "answers": 0
    }"#;
    let decoded: SessionSummary = serde_json::from_str(encoded).expect("decode");
    assert_eq!(decoded.kind, SessionKind::Reading);
    assert!(decoded.written_answers.is_empty());
    assert_eq!(decoded.duration_ms(), 0);
}

#[cfg(feature = "sqlite-persistence")]
mod sqlite_store {
    use super::*;
    use crate::persistence::sqlite::{SqliteConfig, SqliteResultStore};
    use tempfile::NamedTempFile;

    #[test]
    fn bootstrap_runs_idempotent_migrations() {
        let store = SqliteResultStore::bootstrap(SqliteConfig::memory()).expect("bootstrap");
        let mut conn = store.connection().expect("connection");
        SqliteResultStore::run_migrations_for_tests(&mut conn).expect("rerun migrations");

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'exam_%'",
                [],
                |row| row.get(0),
            )
            .expect("introspect");
        assert_eq!(tables, 2);
    }

    #[tokio::test]
    async fn stores_results_and_artifacts_on_disk() {
        let file = NamedTempFile::new().expect("temp file");
        let store = SqliteResultStore::bootstrap(SqliteConfig::file(file.path())).expect("bootstrap");
        assert_eq!(store.database_path(), Some(file.path()));

        let artifact_id = store
            .create_artifact("session-9", Bytes::from_static(b"wave"), "audio/wav")
            .await
            .expect("artifact");
        let result_id = store
            .submit_result(&summary("session-9"))
            .await
            .expect("result");
        assert!(result_id.starts_with("result-"));

        let loaded = store
            .load_result("session-9")
            .expect("query")
            .expect("row present");
        assert_eq!(loaded, summary("session-9"));
        assert_eq!(store.count_results("session-9").expect("count"), 1);

        let (mime, content) = store
            .load_artifact(&artifact_id)
            .expect("query")
            .expect("artifact present");
        assert_eq!(mime, "audio/wav");
        assert_eq!(content, b"wave");
        assert!(store.load_artifact("bogus").expect("query").is_none());
    }
}
