use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Events emitted during a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        targets: usize,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    UnitStarted {
        run_id: RunId,
        unit: String,
        timestamp: DateTime<Utc>,
    },
    UnitCompleted {
        run_id: RunId,
        unit: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A unit whose fingerprint matched its last successful record
    UnitSkipped {
        run_id: RunId,
        unit: String,
        timestamp: DateTime<Utc>,
    },
    UnitFailed {
        run_id: RunId,
        unit: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    PatternExpanded {
        run_id: RunId,
        pattern: String,
        branches: usize,
        timestamp: DateTime<Utc>,
    },
    TaskEvent {
        run_id: RunId,
        unit: String,
        event: TaskEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events a running task can emit through its context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum TaskEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to tasks for real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    unit: String,
    sender: broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, unit: String, sender: broadcast::Sender<RunEvent>) -> Self {
        Self {
            run_id,
            unit,
            sender,
        }
    }

    /// Emitter that drops everything, for contexts without a bus
    pub fn disconnected(unit: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            run_id: RunId::nil(),
            unit: unit.into(),
            sender,
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        let _ = self.sender.send(RunEvent::TaskEvent {
            run_id: self.run_id,
            unit: self.unit.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(TaskEvent::Progress { percent, message });
    }
}

/// Broadcast bus for run events
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, run_id: RunId, unit: impl Into<String>) -> EventEmitter {
        EventEmitter::new(run_id, unit.into(), self.sender.clone())
    }
}
