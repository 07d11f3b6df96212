//! The indirection task queued in place of a spilled payload.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::TaskError;
use super::executor::ExecutionContext;
use super::payload::{DeferredTask, Runnable};
use crate::BoxFuture;
use crate::database::RecordId;

/// Loads a payload from the overflow store and runs it in the current
/// delivery.
///
/// The record is deleted once the inner task succeeds or fails permanently,
/// and kept for redelivery on a transient failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFromStore {
    pub record_id: RecordId,
}

impl DeferredTask for RunFromStore {
    const TASK_TYPE: &'static str = "tasks.run_from_store";
}

impl Runnable for RunFromStore {
    fn run<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async move {
            let store = ctx.overflow();
            let record = store.load(self.record_id).await?;
            debug!(record = %self.record_id, bytes = record.data.len(), "running spilled task");

            let outcome = match ctx.registry().decode(&record.data) {
                Ok(decoded) => decoded.task.run(ctx).await,
                Err(err) => Err(err.into()),
            };

            match outcome {
                Ok(()) => {
                    store.delete(self.record_id).await?;
                    Ok(())
                }
                Err(err) if err.is_permanent() => {
                    if let Err(delete_err) = store.delete(self.record_id).await {
                        warn!(record = %self.record_id, error = %delete_err, "failed to delete overflow record");
                    }
                    Err(err)
                }
                Err(err) => Err(err),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::context::Extensions;
    use crate::database::{MemoryOverflowStore, OverflowStore};
    use crate::tasks::TaskEnvironment;
    use crate::tasks::executor::Executor;
    use crate::tasks::payload::tests::{NOTES, Note};
    use crate::tasks::payload::{TaskRegistry, encode};

    fn executor(store: Arc<MemoryOverflowStore>) -> Executor {
        Executor::new(
            Arc::new(TaskRegistry::new().with::<Note>()),
            store,
            Arc::new(Extensions::new()),
        )
    }

    #[tokio::test]
    async fn runs_then_deletes_record() {
        let store = Arc::new(MemoryOverflowStore::new());
        let inner = encode(&Note { text: "from the store".into() }).unwrap();
        let record_id = store.store(inner).await.unwrap();

        let outer = encode(&RunFromStore { record_id }).unwrap();
        executor(store.clone())
            .execute(&outer, TaskEnvironment::default())
            .await
            .unwrap();

        assert!(NOTES.lock().unwrap().iter().any(|n| n == "from the store"));
        assert!(store.is_empty());
    }

    #[derive(Serialize, Deserialize)]
    struct Busy;

    impl Runnable for Busy {
        fn run<'a>(&'a self, _ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<(), TaskError>> {
            Box::pin(async { Err(TaskError::transient("lock timeout")) })
        }
    }

    impl DeferredTask for Busy {
        const TASK_TYPE: &'static str = "tests.Busy";
    }

    #[tokio::test]
    async fn transient_failure_keeps_record() {
        let store = Arc::new(MemoryOverflowStore::new());
        let record_id = store.store(encode(&Busy).unwrap()).await.unwrap();
        let executor = Executor::new(
            Arc::new(TaskRegistry::new().with::<Busy>()),
            store.clone(),
            Arc::new(Extensions::new()),
        );

        let outer = encode(&RunFromStore { record_id }).unwrap();
        let err = executor
            .execute(&outer, TaskEnvironment::default())
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
        assert!(store.contains(record_id));
    }

    #[tokio::test]
    async fn missing_record_is_permanent() {
        let store = Arc::new(MemoryOverflowStore::new());
        let outer = encode(&RunFromStore { record_id: RecordId::new() }).unwrap();

        let err = executor(store)
            .execute(&outer, TaskEnvironment::default())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn undecodable_record_is_dropped() {
        let store = Arc::new(MemoryOverflowStore::new());
        let record_id = store.store(Bytes::from_static(b"garbage")).await.unwrap();
        let outer = encode(&RunFromStore { record_id }).unwrap();

        let err = executor(store.clone())
            .execute(&outer, TaskEnvironment::default())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(!store.contains(record_id));
    }
}
