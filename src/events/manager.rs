//! Log event buffering, flushing and retention cleanup.
//!
//! # Data Flow
//! ```text
//! ingest(event) ──▶ buffer (parking_lot::Mutex<Vec>)
//!                       │ flush(): mem::take under the lock
//!                       ▼
//!                 pending batches (failed batches stay here, oldest first)
//!                       │ insert_batch per batch
//!                       ▼
//!                   EventStore ◀── cleanup(): delete_older_than in bounded batches
//! ```
//!
//! # Design Decisions
//! - `ingest` never awaits and never touches the store
//! - Every `flush_batch_size` buffered events, `ingest` asks the scheduler for an early flush
//! - One flush at a time; a second caller waits for the first
//! - A failed batch is retried on later flushes, then dropped after `max_flush_retries`
//! - The buffer is bounded; events beyond `max_buffered` are dropped with a warning

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::EventsConfig;
use crate::error::PersistenceError;
use crate::events::store::EventStore;
use crate::events::types::LogEvent;
use crate::lifecycle::scheduler::{Scheduler, SchedulerError, TaskError, TaskTrigger};
use crate::observability::{metrics, Logged};

pub const FLUSH_TASK: &str = "log_events.flush";
pub const CLEANUP_TASK: &str = "log_events.cleanup";

#[derive(Debug, Clone)]
pub struct EventManagerSettings {
    pub flush_interval: Duration,
    pub flush_batch_size: usize,
    pub max_flush_retries: u32,
    pub max_buffered: usize,
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_batch_size: usize,
}

impl From<&EventsConfig> for EventManagerSettings {
    fn from(config: &EventsConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            flush_batch_size: config.flush_batch_size.max(1),
            max_flush_retries: config.max_flush_retries,
            max_buffered: config.max_buffered,
            retention: config.retention(),
            cleanup_interval: config.cleanup_interval(),
            cleanup_batch_size: config.cleanup_batch_size.max(1),
        }
    }
}

impl Default for EventManagerSettings {
    fn default() -> Self {
        Self::from(&EventsConfig::default())
    }
}

#[derive(Debug)]
struct PendingBatch {
    events: Vec<LogEvent>,
    failures: u32,
}

/// Counters exposed through the admin API.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EventStats {
    pub buffered: usize,
    pub retrying: usize,
    pub ingested: u64,
    pub flushed: u64,
    pub dropped: u64,
    pub deleted: u64,
}

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct LogEventManager {
    store: Arc<dyn EventStore>,
    settings: EventManagerSettings,
    buffer: Mutex<Vec<LogEvent>>,
    flush_trigger: OnceLock<TaskTrigger>,
    pending: tokio::sync::Mutex<VecDeque<PendingBatch>>,
    retrying: AtomicUsize,
    ingested: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
    deleted: AtomicU64,
}

impl LogEventManager {
    pub fn new(store: Arc<dyn EventStore>, settings: EventManagerSettings) -> Self {
        Self {
            store,
            settings,
            buffer: Mutex::new(Vec::new()),
            flush_trigger: OnceLock::new(),
            pending: tokio::sync::Mutex::new(VecDeque::new()),
            retrying: AtomicUsize::new(0),
            ingested: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Queue `event` for the next flush. Returns `false` if the buffer is full.
    pub fn ingest(&self, event: LogEvent) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.settings.max_buffered {
            drop(buffer);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_events_dropped("buffer_full", 1);
            tracing::warn!(
                event_type = %event.event_type,
                max_buffered = self.settings.max_buffered,
                "Event buffer full, dropping event"
            );
            return false;
        }
        buffer.push(event);
        let size = buffer.len();
        drop(buffer);

        self.ingested.fetch_add(1, Ordering::Relaxed);
        metrics::record_events_ingested(1);
        metrics::record_event_buffer_size(size);

        if size % self.settings.flush_batch_size == 0 {
            if let Some(trigger) = self.flush_trigger.get() {
                if trigger.fire() {
                    tracing::trace!(buffered = size, "Batch size reached, early flush requested");
                }
            }
        }
        true
    }

    /// Persist everything buffered so far, plus batches left over from failed flushes.
    ///
    /// Returns the last store error if any batch failed; failed batches are
    /// kept for the next cycle unless they ran out of retries.
    pub async fn flush(&self) -> Result<FlushReport, PersistenceError> {
        let mut pending = self.pending.lock().await;

        let fresh = std::mem::take(&mut *self.buffer.lock());
        metrics::record_event_buffer_size(0);
        if !fresh.is_empty() {
            pending.push_back(PendingBatch {
                events: fresh,
                failures: 0,
            });
        }

        let mut report = FlushReport::default();
        let mut last_error = None;
        let mut kept = VecDeque::with_capacity(pending.len());

        while let Some(mut batch) = pending.pop_front() {
            match self.store.insert_batch(&batch.events).await {
                Ok(_) => {
                    report.persisted += batch.events.len();
                    self.flushed.fetch_add(batch.events.len() as u64, Ordering::Relaxed);
                    metrics::record_events_flushed(batch.events.len());
                }
                Err(e) => {
                    batch.failures += 1;
                    if batch.failures > self.settings.max_flush_retries {
                        report.dropped += batch.events.len();
                        self.dropped.fetch_add(batch.events.len() as u64, Ordering::Relaxed);
                        metrics::record_events_dropped("retries_exhausted", batch.events.len());
                        tracing::error!(
                            events = batch.events.len(),
                            attempts = batch.failures,
                            error = %e,
                            "Dropping event batch after repeated flush failures"
                        );
                    } else {
                        report.requeued += batch.events.len();
                        tracing::warn!(
                            events = batch.events.len(),
                            attempt = batch.failures,
                            max_retries = self.settings.max_flush_retries,
                            error = %e,
                            "Event flush failed, batch re-queued"
                        );
                        kept.push_back(batch);
                    }
                    last_error = Some(e);
                }
            }
        }

        *pending = kept;
        self.retrying
            .store(pending.iter().map(|b| b.events.len()).sum(), Ordering::Relaxed);

        if report.persisted > 0 {
            tracing::debug!(persisted = report.persisted, "Event batch flushed");
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Delete events older than the retention window. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize, PersistenceError> {
        // A retention window past the representable range expires nothing.
        let Some(cutoff) = chrono::Duration::from_std(self.settings.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };

        let batch_size = self.settings.cleanup_batch_size;
        let mut total = 0;
        loop {
            let deleted = self.store.delete_older_than(cutoff, batch_size).await?;
            total += deleted;
            if deleted < batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        if total > 0 {
            self.deleted.fetch_add(total as u64, Ordering::Relaxed);
            metrics::record_events_deleted(total);
            tracing::info!(deleted = total, cutoff = %cutoff, "Expired events removed");
        }
        Ok(total)
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            buffered: self.buffer.lock().len(),
            retrying: self.retrying.load(Ordering::Relaxed),
            ingested: self.ingested.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }

    /// Final flush. Anything still failing is reported as lost.
    pub async fn shutdown(&self) -> Result<FlushReport, PersistenceError> {
        let result = self.flush().await;
        let lost = self.retrying.load(Ordering::Relaxed);
        if lost > 0 {
            tracing::error!(events = lost, "Events not persisted before shutdown");
        }
        result
    }

    /// Register the flush and cleanup tasks on `scheduler` and arm the batch-size trigger.
    pub fn schedule(manager: &Arc<Logged<Self>>, scheduler: &Scheduler) -> Result<(), SchedulerError> {
        let m = Arc::clone(manager);
        scheduler.every(FLUSH_TASK, manager.settings.flush_interval, move || {
            let m = Arc::clone(&m);
            async move {
                m.call("flush", |inner| inner.flush())
                    .await
                    .map(|_| ())
                    .map_err(TaskError::from)
            }
        })?;

        let m = Arc::clone(manager);
        scheduler.every(CLEANUP_TASK, manager.settings.cleanup_interval, move || {
            let m = Arc::clone(&m);
            async move {
                m.call("cleanup", |inner| inner.cleanup())
                    .await
                    .map(|_| ())
                    .map_err(TaskError::from)
            }
        })?;

        if manager.flush_trigger.set(scheduler.trigger(FLUSH_TASK)?).is_err() {
            tracing::warn!("Log event manager already scheduled, keeping the first flush trigger");
        }
        Ok(())
    }
}
