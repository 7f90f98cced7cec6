//! Process-wide registration counters.  Increment-only; reads may race with increments.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    successful_registrations: AtomicU64,
    failed_registrations: AtomicU64,
    unregistrations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub successful_registrations: u64,
    pub failed_registrations: u64,
    pub unregistrations: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn inc_successful_registration(&self) {
        self.successful_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_registration(&self) {
        self.failed_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unregistration(&self) {
        self.unregistrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            successful_registrations: self.successful_registrations.load(Ordering::Relaxed),
            failed_registrations: self.failed_registrations.load(Ordering::Relaxed),
            unregistrations: self.unregistrations.load(Ordering::Relaxed),
        }
    }
}
