//! Wiring: settings in, a ready deferrer and delivery router out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{error, info};

use super::backend::TaskBackend;
use super::delivery::deferred_handler;
use super::dispatcher::{Deferrer, DispatchDefaults};
use super::emulator::{Emulator, EmulatorBackend, EmulatorError};
use super::error::DeferError;
use super::executor::Executor;
use super::options::TaskOptions;
use super::payload::{DeferredTask, TaskRegistry};
use super::remote::{QueueTransport, RemoteBackend};
use crate::config::{BackendKind, Settings};
use crate::context::Extensions;
use crate::database::{Connections, MemoryOverflowStore, OverflowStore, TransactionalHost};
use crate::middleware::{LoggerMiddleware, TaskEnvironmentMiddleware};
use crate::{Method, Router};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("the remote backend needs a queue transport")]
    MissingTransport,

    #[error("the remote backend needs a cloud project id")]
    MissingProject,

    #[error(transparent)]
    Emulator(#[from] EmulatorError),
}

/// Collects the collaborators of a [`TaskSystem`].
///
/// Anything not supplied falls back to an in-memory implementation.
#[must_use]
pub struct TaskSystemBuilder {
    settings: Settings,
    registry: TaskRegistry,
    host: Option<Arc<dyn TransactionalHost>>,
    overflow: Option<Arc<dyn OverflowStore>>,
    transport: Option<Arc<dyn QueueTransport>>,
    extensions: Extensions,
}

impl TaskSystemBuilder {
    /// Makes `T` deferrable and runnable.
    pub fn register<T: DeferredTask>(mut self) -> Self {
        self.registry.register::<T>();
        self
    }

    pub fn host(mut self, host: Arc<dyn TransactionalHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn overflow_store(mut self, store: Arc<dyn OverflowStore>) -> Self {
        self.overflow = Some(store);
        self
    }

    /// Required when the settings select the remote backend.
    pub fn transport(mut self, transport: Arc<dyn QueueTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Application state reachable from running tasks through
    /// [`ExecutionContext::extensions`](super::ExecutionContext::extensions).
    pub fn extension<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    /// Chooses the backend named in the settings. With the emulator this
    /// must run inside a Tokio runtime.
    pub fn build(self) -> Result<TaskSystem, SystemError> {
        let settings = self.settings;
        let registry = Arc::new(self.registry);
        let host: Arc<dyn TransactionalHost> = match self.host {
            Some(host) => host,
            None => Arc::new(Connections::default()),
        };
        let overflow: Arc<dyn OverflowStore> = match self.overflow {
            Some(store) => store,
            None => Arc::new(MemoryOverflowStore::new()),
        };

        let executor = Arc::new(Executor::new(
            Arc::clone(&registry),
            Arc::clone(&overflow),
            Arc::new(self.extensions),
        ));

        let (backend, emulator): (Arc<dyn TaskBackend>, Option<Emulator>) = match settings.backend {
            BackendKind::Emulator => {
                let emulator = Emulator::start((&settings.emulator).into(), executor.clone())?;
                let backend: Arc<dyn TaskBackend> = Arc::new(EmulatorBackend::new(emulator.clone()));
                (backend, Some(emulator))
            }
            BackendKind::Remote => {
                let transport = self.transport.ok_or(SystemError::MissingTransport)?;
                if settings.project.is_none() {
                    return Err(SystemError::MissingProject);
                }
                let backend: Arc<dyn TaskBackend> =
                    Arc::new(RemoteBackend::from_settings(transport, overflow, &settings));
                (backend, None)
            }
        };

        let deferrer = Deferrer::new(
            registry,
            host,
            backend,
            DispatchDefaults {
                handler_url: settings.handler_url.clone(),
                version: settings.version.clone(),
            },
        );
        executor.bind(deferrer.clone());

        info!(backend = ?settings.backend, handler = %settings.handler_url, "task system ready");
        Ok(TaskSystem {
            settings,
            deferrer,
            executor,
            emulator,
            closed: AtomicBool::new(false),
        })
    }
}

/// A configured deferred-task subsystem.
///
/// Call [`shutdown`](Self::shutdown) on the way out. A system dropped
/// without it still writes the emulator snapshot, but its queue workers keep
/// running until the runtime stops.
pub struct TaskSystem {
    settings: Settings,
    deferrer: Deferrer,
    executor: Arc<Executor>,
    emulator: Option<Emulator>,
    closed: AtomicBool,
}

impl TaskSystem {
    pub fn builder(settings: Settings) -> TaskSystemBuilder {
        TaskSystemBuilder {
            settings,
            registry: TaskRegistry::new(),
            host: None,
            overflow: None,
            transport: None,
            extensions: Extensions::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn deferrer(&self) -> &Deferrer {
        &self.deferrer
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// The running emulator, when that backend was selected.
    pub fn emulator(&self) -> Option<&Emulator> {
        self.emulator.as_ref()
    }

    /// Shorthand for [`Deferrer::defer`].
    pub async fn defer<T: DeferredTask>(
        &self,
        task: &T,
        options: Option<TaskOptions>,
    ) -> Result<(), DeferError> {
        self.deferrer.defer(task, options).await
    }

    /// A router with request logging, task environment extraction, and the
    /// delivery endpoint mounted at the configured handler URL.
    pub fn router(&self) -> Router {
        let mut router = Router::new();
        router.layer(Arc::new(LoggerMiddleware));
        router.layer(Arc::new(TaskEnvironmentMiddleware));
        router.add_route(
            Method::Post,
            &self.settings.handler_url,
            deferred_handler(Arc::clone(&self.executor)),
        );
        router
    }

    /// Stops the emulator (snapshotting its queues) if one is running.
    pub async fn shutdown(&self) -> Result<(), SystemError> {
        if let Some(emulator) = &self.emulator {
            emulator.shutdown().await?;
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(emulator) = &self.emulator {
            if let Err(err) = emulator.hibernate() {
                error!(error = %err, "failed to snapshot emulator queues on drop");
            }
        }
    }
}
