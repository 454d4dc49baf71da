use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub base_url: String,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_delay: Duration,
    pub stop_on_complete: bool,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub iteration_budget: Option<u32>,
}

/// Retry policy applied when building each remote call.
///
/// The default is retry-free: a failed call is reported once and the loop
/// moves on to its next cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// One unit of server-side analysis work, as returned inside a status snapshot.
///
/// Append-only from the server's perspective; the client only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

/// Complete point-in-time view of a session as returned by one status fetch.
///
/// Each successful poll replaces the previous snapshot wholesale; there is no
/// incremental merge and a shrinking iteration sequence is accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: String,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
}

impl SessionSnapshot {
    /// Status tags after which the server will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "complete" | "completed" | "done" | "failed"
        )
    }
}

/// Events emitted by the driver and consumed by the TUI / text-mode layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SessionStarted { session_id: String },
    StartFailed { error: String },
    Snapshot(SessionSnapshot),
    PollFailed { error: String },
    IterationFailed { error: String },
    SessionComplete { session_id: String },
    Info(String),
}
