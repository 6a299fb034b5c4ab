use std::time::Duration;

/// Pause before re-issuing an AI call that has no candidate answer to wait on.
pub(crate) const AI_RETRY_BACKOFF: Duration = Duration::from_millis(500);
pub(crate) const ANSWER_CHANNEL_CAPACITY: usize = 4;
pub(crate) const CONTROL_CHANNEL_CAPACITY: usize = 64;
/// How long `SessionTasks::join` waits for each auxiliary task after the
/// state machine returns.
pub(crate) const TASK_JOIN_GRACE: Duration = Duration::from_secs(2);
