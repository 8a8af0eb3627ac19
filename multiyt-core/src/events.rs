use tokio::sync::mpsc;
use uuid::Uuid;

use crate::fetch::FetchProgress;
use crate::install::DependencyKind;
use crate::jobs::{Job, JobStatus};
use crate::store::StoreDelta;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum JobUpdate {
    Title(String),
    Status(JobStatus),
    Progress(String),
}

/// Messages flowing from background work to the consumer (the controller
/// task, and onward to the UI adapter).
#[derive(Debug, Clone)]
pub enum Event {
    AddJob(Job),
    UpdateJob { id: Uuid, update: JobUpdate },
    /// Terminal transition; the last event ever emitted for `id`.
    Done { id: Uuid, status: JobStatus },
    UrlProcessingDone,
    DependencyProgress {
        kind: DependencyKind,
        progress: FetchProgress,
    },
    DependencyDone {
        kind: DependencyKind,
        success: bool,
        detail: String,
    },
    /// Ask the UI to offer installing a missing dependency.
    DependencyPrompt(DependencyKind),
    DependencyVersion {
        kind: DependencyKind,
        version: String,
    },
    NewVersionAvailable { version: String, url: String },
    CriticalError(String),
    StoreChanged(StoreDelta),
}

/// One-writer-to-one-reader stream of typed events. Bounded; lifecycle
/// emissions block briefly under back-pressure, progress ticks are dropped
/// instead.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

impl EventBus {
    pub fn channel() -> (EventBus, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (EventBus { tx }, rx)
    }

    pub async fn emit(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("event consumer is gone; dropping event");
        }
    }

    /// Non-blocking emission for high-frequency progress ticks; the next tick
    /// supersedes a dropped one.
    pub fn emit_lossy(&self, event: Event) {
        let _ = self.tx.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lossy_emission_drops_when_full() {
        let (bus, mut rx) = EventBus::channel();
        for _ in 0..EVENT_CHANNEL_CAPACITY {
            bus.emit_lossy(Event::UrlProcessingDone);
        }
        // channel is full; this one is silently discarded
        bus.emit_lossy(Event::CriticalError("overflow".into()));

        let mut received = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, Event::UrlProcessingDone));
            received += 1;
        }
        assert_eq!(received, EVENT_CHANNEL_CAPACITY);
    }
}
