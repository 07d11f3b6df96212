//! Decoding and running delivered payloads.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::{error, info, warn};

use super::dispatcher::Deferrer;
use super::emulator::{ScheduledTask, TaskHandler};
use super::environment::TaskEnvironment;
use super::error::TaskError;
use super::payload::TaskRegistry;
use crate::BoxFuture;
use crate::context::Extensions;
use crate::database::OverflowStore;

/// Everything a running task may reach: the delivery's environment and the
/// process's task services.
pub struct ExecutionContext {
    env: TaskEnvironment,
    registry: Arc<TaskRegistry>,
    overflow: Arc<dyn OverflowStore>,
    extensions: Arc<Extensions>,
    deferrer: Option<Deferrer>,
}

impl ExecutionContext {
    pub fn env(&self) -> &TaskEnvironment {
        &self.env
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn overflow(&self) -> &dyn OverflowStore {
        self.overflow.as_ref()
    }

    /// Application state registered on the
    /// [`TaskSystemBuilder`](super::TaskSystemBuilder).
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Lets a task defer follow-up work.
    pub fn deferrer(&self) -> Option<&Deferrer> {
        self.deferrer.as_ref()
    }
}

/// Runs payloads against a [`TaskRegistry`].
///
/// Shared by the delivery endpoint and the emulator.
pub struct Executor {
    registry: Arc<TaskRegistry>,
    overflow: Arc<dyn OverflowStore>,
    extensions: Arc<Extensions>,
    deferrer: OnceLock<Deferrer>,
}

impl Executor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        overflow: Arc<dyn OverflowStore>,
        extensions: Arc<Extensions>,
    ) -> Self {
        Self {
            registry,
            overflow,
            extensions,
            deferrer: OnceLock::new(),
        }
    }

    /// Makes `deferrer` available to running tasks. Only the first call has
    /// an effect.
    pub fn bind(&self, deferrer: Deferrer) {
        if self.deferrer.set(deferrer).is_err() {
            warn!("executor already bound to a deferrer");
        }
    }

    pub fn context(&self, env: TaskEnvironment) -> ExecutionContext {
        ExecutionContext {
            env,
            registry: Arc::clone(&self.registry),
            overflow: Arc::clone(&self.overflow),
            extensions: Arc::clone(&self.extensions),
            deferrer: self.deferrer.get().cloned(),
        }
    }

    /// Decodes `payload` and runs it once.
    pub async fn execute(&self, payload: &[u8], env: TaskEnvironment) -> Result<(), TaskError> {
        let decoded = match self.registry.decode(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(
                    task = env.task_name.as_deref().unwrap_or("-"),
                    error = %err,
                    "undecodable task payload"
                );
                return Err(err.into());
            }
        };

        let ctx = self.context(env);
        let started = Instant::now();
        let result = decoded.task.run(&ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let task = ctx.env.task_name.as_deref().unwrap_or("-");
        let queue = ctx.env.queue_name.as_deref().unwrap_or("-");

        match &result {
            Ok(()) => info!(kind = %decoded.kind, task, queue, elapsed_ms, "task completed"),
            Err(TaskError::Permanent(reason)) => error!(
                kind = %decoded.kind, task, queue, elapsed_ms, reason = %reason,
                "task failed permanently"
            ),
            Err(TaskError::Transient(reason)) => warn!(
                kind = %decoded.kind, task, queue, elapsed_ms, retry = ctx.env.retry_count, reason = %reason,
                "task failed, leaving it for redelivery"
            ),
        }
        result
    }
}

impl TaskHandler for Executor {
    fn handle(&self, task: ScheduledTask) -> BoxFuture<'_, Result<(), TaskError>> {
        Box::pin(async move {
            let env = TaskEnvironment::emulated(task.task_name, task.queue_name);
            self.execute(&task.payload, env).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryOverflowStore;
    use crate::tasks::payload::tests::{NOTES, Note};
    use crate::tasks::payload::{DeferredTask, Runnable, encode};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Flaky {
        permanent: bool,
    }

    impl Runnable for Flaky {
        fn run<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<(), TaskError>> {
            Box::pin(async move {
                let attempt = ctx.env().retry_count.unwrap_or_default();
                if self.permanent {
                    Err(TaskError::permanent(format!("gave up on attempt {attempt}")))
                } else {
                    Err(TaskError::transient("database busy"))
                }
            })
        }
    }

    impl DeferredTask for Flaky {
        const TASK_TYPE: &'static str = "tests.Flaky";
    }

    fn executor() -> Executor {
        let registry = TaskRegistry::new().with::<Note>().with::<Flaky>();
        Executor::new(
            Arc::new(registry),
            Arc::new(MemoryOverflowStore::new()),
            Arc::new(Extensions::new()),
        )
    }

    #[tokio::test]
    async fn runs_decoded_task() {
        let payload = encode(&Note { text: "executor ran".into() }).unwrap();
        executor()
            .execute(&payload, TaskEnvironment::default())
            .await
            .unwrap();
        assert!(NOTES.lock().unwrap().iter().any(|n| n == "executor ran"));
    }

    #[tokio::test]
    async fn reports_failure_kinds() {
        let executor = executor();
        let env = TaskEnvironment {
            retry_count: Some(4),
            ..TaskEnvironment::default()
        };

        let payload = encode(&Flaky { permanent: true }).unwrap();
        assert_eq!(
            executor.execute(&payload, env.clone()).await,
            Err(TaskError::Permanent("gave up on attempt 4".into()))
        );

        let payload = encode(&Flaky { permanent: false }).unwrap();
        assert!(matches!(
            executor.execute(&payload, env).await,
            Err(TaskError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let err = executor()
            .execute(b"{}", TaskEnvironment::default())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
