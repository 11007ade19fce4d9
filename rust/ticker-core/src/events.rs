//! Observer events broadcast by a running scheduler.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::{JobKind, JobStatus};

const CHANNEL_CAPACITY: usize = 1024;

/// Scheduler event for streaming updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// This node won the claim on a due entity.
    Claimed { kind: JobKind, id: Uuid },
    /// Handler invocation started.
    Started { kind: JobKind, id: Uuid, attempt: u32 },
    /// Entity reached a terminal status.
    Completed {
        kind: JobKind,
        id: Uuid,
        status: JobStatus,
    },
    /// A failed attempt was re-armed.
    RetryScheduled {
        kind: JobKind,
        id: Uuid,
        attempt: u32,
        at: DateTime<Utc>,
    },
    /// A child job was released for dispatch.
    ChildReleased { parent_id: Uuid, child_id: Uuid },
    /// Locks held by a dead node were released.
    LocksReleased { node_id: String, count: u64 },
    /// The generator created a new occurrence.
    OccurrenceMaterialized {
        cron_id: Uuid,
        occurrence_id: Uuid,
        at: DateTime<Utc>,
    },
}

/// Fan-out for [`SchedulerEvent`]s. Sending never blocks and never fails.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn emit(&self, event: SchedulerEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}
