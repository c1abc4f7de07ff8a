//! Alert dispatch seam.
//!
//! The engine reports lifecycle events through this trait; concrete sinks
//! (webhooks, chat notifications) live outside the core. Dispatch is
//! best-effort: failures are logged and never fail the task.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{info, warn};

/// Kind of lifecycle alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    HeartbeatTimeout,
    WatchdogKill,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskTimeout => "task_timeout",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::WatchdogKill => "watchdog_kill",
        }
    }
}

/// One structured alert event.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub task_id: String,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Destination for alert events.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, event: AlertEvent) -> anyhow::Result<()>;
}

/// Default sink: structured log lines only.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, event: AlertEvent) -> anyhow::Result<()> {
        match event.kind {
            AlertKind::TaskCompleted => {
                info!(task_id = %event.task_id, kind = event.kind.as_str(), "{}", event.message)
            }
            _ => {
                warn!(task_id = %event.task_id, kind = event.kind.as_str(), "{}", event.message)
            }
        }
        Ok(())
    }
}
