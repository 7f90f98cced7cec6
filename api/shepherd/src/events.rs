//! Events attached to device records, such as failures the operator should see.
//!
//! Handlers hand events to an [`EventRecorder`], which queues them on a bounded channel without
//! waiting.  When the queue is full the event is dropped and counted.  Whatever consumes the
//! other end publishes them; [`log_events`] just writes them to the log.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use models::Device;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

impl EventType {
    /// Parses the type a device reports; anything unrecognized is treated as normal.
    pub fn from_reported(s: &str) -> Self {
        if s.eq_ignore_ascii_case("warn") || s.eq_ignore_ascii_case("warning") {
            EventType::Warning
        } else {
            EventType::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub namespace: String,
    pub device: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventRecorder {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventRecorder {
    /// Creates a recorder and the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn record<S1, S2>(&self, device: &Device, event_type: EventType, reason: S1, message: S2)
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        let event = Event {
            namespace: device.metadata.namespace.clone(),
            device: device.metadata.name.clone(),
            event_type,
            reason: reason.into(),
            message: message.into(),
            time: Utc::now(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Event queue full, dropping event '{}' for device '{}'",
                    event.reason, event.device
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn warning<S1, S2>(&self, device: &Device, reason: S1, message: S2)
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.record(device, EventType::Warning, reason, message)
    }

    /// Number of events dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumes the queue, logging each event, until every recorder is gone.
pub async fn log_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        match event.event_type {
            EventType::Warning => warn!(
                "Event for device '{}/{}': {}: {}",
                event.namespace, event.device, event.reason, event.message
            ),
            EventType::Normal => info!(
                "Event for device '{}/{}': {}: {}",
                event.namespace, event.device, event.reason, event.message
            ),
        }
    }
}
