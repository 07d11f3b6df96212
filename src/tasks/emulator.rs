//! In-process stand-in for the hosted queue service.
//!
//! Each named queue gets one worker that runs its tasks one at a time, in
//! scheduled order. Queues run concurrently with each other. On shutdown the
//! pending tasks can be written to a JSON snapshot that the next start
//! picks up again.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::TaskBackend;
use super::error::{DeferError, TaskError};
use super::options::TaskOptions;
use crate::BoxFuture;
use crate::config::EmulatorSettings;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("the emulator must be started inside a Tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("snapshot {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {} is not valid: {source}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One pending delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub payload: Vec<u8>,
    pub queue_name: String,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

/// Receives tasks once their scheduled time has passed.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: ScheduledTask) -> BoxFuture<'_, Result<(), TaskError>>;
}

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub persistence: bool,
    pub snapshot_path: PathBuf,
    pub poll_interval: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        (&EmulatorSettings::default()).into()
    }
}

impl From<&EmulatorSettings> for EmulatorConfig {
    fn from(settings: &EmulatorSettings) -> Self {
        Self {
            persistence: settings.persistence,
            snapshot_path: settings.snapshot_path.clone(),
            poll_interval: settings.poll_interval(),
        }
    }
}

type Queues = BTreeMap<String, VecDeque<ScheduledTask>>;

struct Inner {
    config: EmulatorConfig,
    handler: Arc<dyn TaskHandler>,
    runtime: Handle,
    queues: Mutex<Queues>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pops the head of `queue_name` if it is due.
    fn next_due(&self, queue_name: &str, now: DateTime<Utc>) -> Option<ScheduledTask> {
        let mut queues = self.queues();
        let queue = queues.get_mut(queue_name)?;
        if queue.front().is_some_and(|task| task.scheduled_for <= now) {
            queue.pop_front()
        } else {
            None
        }
    }
}

/// Handle to a running emulator. Cheap to clone.
#[derive(Clone)]
pub struct Emulator {
    inner: Arc<Inner>,
}

impl Emulator {
    /// Starts the emulator on the current Tokio runtime.
    ///
    /// With persistence enabled, the snapshot left by a previous run is
    /// loaded and its queues resume. The snapshot file is removed either
    /// way, so stale tasks never come back after a run without persistence.
    pub fn start(config: EmulatorConfig, handler: Arc<dyn TaskHandler>) -> Result<Self, EmulatorError> {
        let runtime = Handle::try_current()?;

        let queues = if config.persistence {
            load_snapshot(&config.snapshot_path)
        } else {
            Queues::new()
        };
        remove_snapshot(&config.snapshot_path);

        let restored: usize = queues.values().map(VecDeque::len).sum();
        let names: Vec<String> = queues.keys().cloned().collect();

        let emulator = Self {
            inner: Arc::new(Inner {
                config,
                handler,
                runtime,
                queues: Mutex::new(queues),
                workers: Mutex::new(HashMap::new()),
            }),
        };
        for name in names {
            emulator.ensure_worker(&name);
        }

        info!(
            restored,
            persistence = emulator.inner.config.persistence,
            "task queue emulator started"
        );
        Ok(emulator)
    }

    /// Adds a task to `queue_name`, creating the queue (and its worker) on
    /// first use. `None` schedules it for right now.
    ///
    /// Tasks with equal scheduled times keep their insertion order.
    pub fn create_task(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
        scheduled_for: Option<DateTime<Utc>>,
        task_name: Option<String>,
    ) {
        let task = ScheduledTask {
            payload,
            queue_name: queue_name.to_owned(),
            scheduled_for: scheduled_for.unwrap_or_else(Utc::now),
            task_name,
        };

        {
            let mut queues = self.inner.queues();
            let queue = queues.entry(queue_name.to_owned()).or_default();
            let index = queue.partition_point(|queued| queued.scheduled_for <= task.scheduled_for);
            queue.insert(index, task);
        }
        self.ensure_worker(queue_name);
    }

    fn ensure_worker(&self, queue_name: &str) {
        let mut workers = self.inner.workers();
        if workers.get(queue_name).is_some_and(|worker| !worker.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let name = queue_name.to_owned();
        let worker = self.inner.runtime.spawn(process_queue(inner, name));
        workers.insert(queue_name.to_owned(), worker);
        debug!(queue = queue_name, "queue worker started");
    }

    /// Tasks waiting across all queues.
    pub fn total_enqueued(&self) -> usize {
        self.inner.queues().values().map(VecDeque::len).sum()
    }

    /// Copy of the tasks waiting in `queue_name`, in delivery order.
    pub fn pending(&self, queue_name: &str) -> Vec<ScheduledTask> {
        self.inner
            .queues()
            .get(queue_name)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.queues().keys().cloned().collect()
    }

    /// Writes pending tasks to the snapshot file, returning how many were
    /// saved. Does nothing when persistence is off or nothing is pending.
    pub fn hibernate(&self) -> Result<usize, EmulatorError> {
        if !self.inner.config.persistence {
            return Ok(0);
        }

        let path = &self.inner.config.snapshot_path;
        let (json, count) = {
            let queues = self.inner.queues();
            let count: usize = queues.values().map(VecDeque::len).sum();
            if count == 0 {
                return Ok(0);
            }
            let json = serde_json::to_vec_pretty(&*queues).map_err(|source| EmulatorError::Format {
                path: path.clone(),
                source,
            })?;
            (json, count)
        };

        std::fs::write(path, json).map_err(|source| EmulatorError::Io {
            path: path.clone(),
            source,
        })?;
        info!(count, path = %path.display(), "pending tasks written to snapshot");
        Ok(count)
    }

    /// Stops every queue worker, then hibernates.
    ///
    /// A task whose handler is mid-flight when its worker stops is not
    /// redelivered.
    pub async fn shutdown(&self) -> Result<usize, EmulatorError> {
        let workers: Vec<_> = self.inner.workers().drain().collect();
        for (queue, worker) in workers {
            worker.abort();
            if let Err(err) = worker.await {
                if !err.is_cancelled() {
                    warn!(queue = %queue, error = %err, "queue worker ended abnormally");
                }
            }
        }
        self.hibernate()
    }
}

async fn process_queue(inner: Arc<Inner>, queue_name: String) {
    loop {
        let Some(task) = inner.next_due(&queue_name, Utc::now()) else {
            tokio::time::sleep(inner.config.poll_interval).await;
            continue;
        };

        debug!(queue = %queue_name, task = task.task_name.as_deref().unwrap_or("-"), "delivering task");
        let handler = Arc::clone(&inner.handler);
        let delivery = inner.runtime.spawn(async move { handler.handle(task).await });

        // Emulated deliveries are not retried.
        match delivery.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(queue = %queue_name, error = %err, "emulated task failed"),
            Err(err) => error!(queue = %queue_name, error = %err, "emulated task panicked"),
        }
    }
}

fn load_snapshot(path: &Path) -> Queues {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Queues::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read task snapshot");
            return Queues::new();
        }
    };

    match serde_json::from_slice(&data) {
        Ok(queues) => queues,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring corrupt task snapshot");
            Queues::new()
        }
    }
}

fn remove_snapshot(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "task snapshot removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove task snapshot"),
    }
}

/// [`TaskBackend`] that enqueues into an [`Emulator`].
pub struct EmulatorBackend {
    emulator: Emulator,
}

impl EmulatorBackend {
    pub fn new(emulator: Emulator) -> Self {
        Self { emulator }
    }

    pub fn emulator(&self) -> &Emulator {
        &self.emulator
    }
}

impl TaskBackend for EmulatorBackend {
    fn submit<'a>(
        &'a self,
        payload: Bytes,
        options: &'a TaskOptions,
    ) -> BoxFuture<'a, Result<(), DeferError>> {
        let scheduled_for = options.schedule_time_at(Utc::now());
        debug!(
            task = options.name(),
            queue = options.queue(),
            size = payload.len(),
            "task enqueued in emulator"
        );
        self.emulator.create_task(
            options.queue(),
            payload.to_vec(),
            scheduled_for,
            options.name().map(str::to_owned),
        );
        Box::pin(async { Ok(()) })
    }
}
