//! Error sink for pipeline events that must be surfaced but never halt the
//! pipeline (`SampleDropped`, `SampleRejected`, `DeliveryAbandoned`,
//! `StorageFull`).

use tokio::sync::mpsc;

use crate::storage::{DurableBuffer, Event, EventSeverity};

/// Receives pipeline events. Implementations must not block.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, event: Event);
}

/// Logs events through `tracing` only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, event: Event) {
        log_event(&event);
    }
}

/// Logs events and persists them to the `events` table.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    buffer: DurableBuffer,
}

impl EventRecorder {
    pub fn new(buffer: DurableBuffer) -> Self {
        Self { buffer }
    }
}

impl ErrorSink for EventRecorder {
    fn report(&self, event: Event) {
        log_event(&event);
        // record_event already warns when the channel is full
        let _ = self.buffer.record_event(event);
    }
}

/// Forwards events to an unbounded channel. Useful to observe the pipeline
/// from tests or another task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorSink for ChannelSink {
    fn report(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

fn log_event(event: &Event) {
    let kind = event.kind.as_ref();
    let source = event.source.as_ref();
    match event.severity {
        EventSeverity::Debug => {
            tracing::debug!(kind, source, payload = %event.payload, "{}", event.message)
        }
        EventSeverity::Info => {
            tracing::info!(kind, source, payload = %event.payload, "{}", event.message)
        }
        EventSeverity::Warn => {
            tracing::warn!(kind, source, payload = %event.payload, "{}", event.message)
        }
        EventSeverity::Error | EventSeverity::Critical => {
            tracing::error!(kind, source, payload = %event.payload, "{}", event.message)
        }
    }
}
