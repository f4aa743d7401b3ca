//! Watch processor: bounded, backpressured change streams.
//!
//! The processor multiplexes task and job change notifications to an
//! arbitrary number of subscribers. Each subscriber owns a bounded event
//! queue and a single-slot signal channel; the notify path never blocks on a
//! consumer:
//!
//! - a client whose queue is full at notify time is **overflow-evicted**
//!   (signal [`StopSignal::Overflow`], registry removal)
//! - stopping a client normally delivers [`StopSignal::Cancel`]
//! - at most `max_client` clients per kind are admitted; the next
//!   registration fails with a resource-exhausted error
//!
//! Notifications to a single client are FIFO; there is no cross-client
//! ordering.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use echelon_core::{JobId, PodId};

use crate::cached::RuntimeListener;
use crate::config::WatchConfig;
use crate::error::{Error, Result};
use crate::job::JobState;
use crate::metrics::JobmgrMetrics;
use crate::task::TaskState;

/// Terminal reason delivered on a watch client's signal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    /// No terminal signal has been delivered (the zero value, used by tests).
    #[default]
    Unknown,
    /// The client was stopped through the API.
    Cancel,
    /// The client's event queue overflowed and it was evicted.
    Overflow,
}

/// Condensed view of a task change, delivered to task watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    /// The owning job.
    pub job_id: JobId,
    /// The slot within the job.
    pub instance_id: u32,
    /// The current run.
    pub pod_id: PodId,
    /// Observed state after the change.
    pub state: TaskState,
    /// Goal state after the change.
    pub goal_state: TaskState,
    /// Placement host, if placed.
    pub host: Option<String>,
    /// Note from the transition.
    pub message: String,
}

/// Condensed view of a job change, delivered to job watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// The job that changed.
    pub job_id: JobId,
    /// Observed state after the change.
    pub state: JobState,
    /// Goal state after the change.
    pub goal_state: JobState,
}

/// The consumer half of a watch subscription.
#[derive(Debug)]
pub struct WatchClient<T> {
    /// Bounded queue of change events.
    pub events: mpsc::Receiver<T>,
    /// Single-slot channel carrying the terminal reason.
    pub signal: mpsc::Receiver<StopSignal>,
}

impl<T> WatchClient<T> {
    /// Returns the terminal signal if one has been delivered.
    ///
    /// [`StopSignal::Unknown`] means the subscription is still live.
    pub fn try_signal(&mut self) -> StopSignal {
        self.signal.try_recv().unwrap_or_default()
    }
}

/// The producer half of a subscription, held in the registry.
#[derive(Debug)]
struct ClientHandle<T> {
    events: mpsc::Sender<T>,
    signal: mpsc::Sender<StopSignal>,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("watch registry lock poisoned")
}

/// Multiplexes change notifications to bounded per-client buffers.
///
/// One instance is created at startup and shared process-wide; the cached
/// entity factory feeds it through the [`RuntimeListener`] impl.
#[derive(Debug)]
pub struct WatchProcessor {
    config: WatchConfig,
    task_clients: RwLock<HashMap<Uuid, ClientHandle<PodSummary>>>,
    job_clients: RwLock<HashMap<Uuid, ClientHandle<JobSummary>>>,
    metrics: JobmgrMetrics,
}

impl WatchProcessor {
    /// Creates a processor with the given buffer and client limits.
    #[must_use]
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            task_clients: RwLock::new(HashMap::new()),
            job_clients: RwLock::new(HashMap::new()),
            metrics: JobmgrMetrics::new(),
        }
    }

    /// Registers a new task watcher.
    ///
    /// # Errors
    ///
    /// Fails with a resource-exhausted error when `max_client` task watchers
    /// are already registered.
    pub fn new_task_client(&self) -> Result<(Uuid, WatchClient<PodSummary>)> {
        let result = Self::register(&self.task_clients, self.config);
        if let Ok((id, _)) = &result {
            tracing::debug!(watch_id = %id, "registered task watch client");
            self.update_client_gauges();
        }
        result
    }

    /// Registers a new job watcher.
    ///
    /// # Errors
    ///
    /// Fails with a resource-exhausted error when `max_client` job watchers
    /// are already registered.
    pub fn new_job_client(&self) -> Result<(Uuid, WatchClient<JobSummary>)> {
        let result = Self::register(&self.job_clients, self.config);
        if let Ok((id, _)) = &result {
            tracing::debug!(watch_id = %id, "registered job watch client");
            self.update_client_gauges();
        }
        result
    }

    /// Stops a task watcher, delivering [`StopSignal::Cancel`].
    ///
    /// # Errors
    ///
    /// Fails with a not-found error when the id is unknown.
    pub fn stop_task_client(&self, watch_id: &Uuid) -> Result<()> {
        Self::deregister(&self.task_clients, watch_id)?;
        self.update_client_gauges();
        Ok(())
    }

    /// Stops a job watcher, delivering [`StopSignal::Cancel`].
    ///
    /// # Errors
    ///
    /// Fails with a not-found error when the id is unknown.
    pub fn stop_job_client(&self, watch_id: &Uuid) -> Result<()> {
        Self::deregister(&self.job_clients, watch_id)?;
        self.update_client_gauges();
        Ok(())
    }

    /// Fans a task change out to every task watcher.
    ///
    /// Runs on the caller's thread; a full client queue evicts that client
    /// rather than blocking the producer.
    pub fn notify_task_change(&self, summary: PodSummary) {
        let evicted = Self::fan_out(&self.task_clients, &summary, &self.metrics, "task");
        if evicted > 0 {
            self.update_client_gauges();
        }
    }

    /// Fans a job change out to every job watcher.
    pub fn notify_job_change(&self, summary: JobSummary) {
        let evicted = Self::fan_out(&self.job_clients, &summary, &self.metrics, "job");
        if evicted > 0 {
            self.update_client_gauges();
        }
    }

    /// Number of currently registered task watchers.
    #[must_use]
    pub fn task_client_count(&self) -> usize {
        self.task_clients.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of currently registered job watchers.
    #[must_use]
    pub fn job_client_count(&self) -> usize {
        self.job_clients.read().map(|c| c.len()).unwrap_or(0)
    }

    fn register<T>(
        registry: &RwLock<HashMap<Uuid, ClientHandle<T>>>,
        config: WatchConfig,
    ) -> Result<(Uuid, WatchClient<T>)> {
        let mut clients = registry.write().map_err(poison_err)?;
        if clients.len() >= config.max_client {
            return Err(Error::resource_exhausted(format!(
                "max watch client reached: {}",
                config.max_client
            )));
        }

        let (event_tx, event_rx) = mpsc::channel(config.buffer_size);
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let watch_id = Uuid::new_v4();
        clients.insert(
            watch_id,
            ClientHandle {
                events: event_tx,
                signal: signal_tx,
            },
        );

        Ok((
            watch_id,
            WatchClient {
                events: event_rx,
                signal: signal_rx,
            },
        ))
    }

    fn deregister<T>(
        registry: &RwLock<HashMap<Uuid, ClientHandle<T>>>,
        watch_id: &Uuid,
    ) -> Result<()> {
        let handle = {
            let mut clients = registry.write().map_err(poison_err)?;
            clients
                .remove(watch_id)
                .ok_or_else(|| Error::not_found("watch client", watch_id.to_string()))?
        };
        // Best effort: the consumer may already be gone.
        let _ = handle.signal.try_send(StopSignal::Cancel);
        Ok(())
    }

    /// Delivers `summary` to every client in `registry`; returns the number
    /// of clients evicted for overflow.
    fn fan_out<T: Clone>(
        registry: &RwLock<HashMap<Uuid, ClientHandle<T>>>,
        summary: &T,
        metrics: &JobmgrMetrics,
        kind: &'static str,
    ) -> usize {
        let mut overflowed = Vec::new();
        {
            let Ok(clients) = registry.read() else {
                tracing::error!(kind, "watch registry lock poisoned, dropping notification");
                return 0;
            };
            for (watch_id, handle) in clients.iter() {
                match handle.events.try_send(summary.clone()) {
                    Ok(()) => metrics.record_watch_event(kind, "delivered"),
                    Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                        overflowed.push(*watch_id);
                    }
                }
            }
        }

        if overflowed.is_empty() {
            return 0;
        }

        let Ok(mut clients) = registry.write() else {
            return 0;
        };
        for watch_id in &overflowed {
            if let Some(handle) = clients.remove(watch_id) {
                tracing::warn!(watch_id = %watch_id, kind, "watch client overflowed, evicting");
                metrics.record_watch_event(kind, "overflow");
                let _ = handle.signal.try_send(StopSignal::Overflow);
            }
        }
        overflowed.len()
    }

    fn update_client_gauges(&self) {
        self.metrics
            .set_watch_clients("task", self.task_client_count());
        self.metrics
            .set_watch_clients("job", self.job_client_count());
    }
}

impl RuntimeListener for WatchProcessor {
    fn on_task_runtime_changed(&self, summary: PodSummary) {
        self.notify_task_change(summary);
    }

    fn on_job_runtime_changed(&self, summary: JobSummary) {
        self.notify_job_change(summary);
    }
}
