//! Submission to the hosted queue service, with overflow spill.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::backend::TaskBackend;
use super::error::{DeferError, TransportError};
use super::options::{RoutingOptions, TaskOptions};
use super::overflow::RunFromStore;
use super::payload;
use crate::BoxFuture;
use crate::config::Settings;
use crate::database::OverflowStore;
use crate::http::Headers;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// The HTTP request the queue service will make to deliver a task.
#[derive(Debug, Clone, PartialEq)]
pub struct AppEngineHttpRequest {
    pub http_method: String,
    pub relative_uri: String,
    pub body: Bytes,
    pub headers: Headers,
    pub app_engine_routing: Option<RoutingOptions>,
}

/// A create-task request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueTask {
    /// `{queue path}/tasks/{task name}`.
    pub name: String,
    pub create_time: DateTime<Utc>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub app_engine_http_request: AppEngineHttpRequest,
}

impl QueueTask {
    /// Builds the request for `payload` as submitted at `now`.
    pub fn new(parent: &str, payload: Bytes, options: &TaskOptions, now: DateTime<Utc>) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", DEFAULT_CONTENT_TYPE);
        headers.merge(options.extra_headers());

        Self {
            name: format!("{parent}/tasks/{}", options.name().unwrap_or_default()),
            create_time: options.created_at().unwrap_or(now),
            schedule_time: options.schedule_time_at(now),
            app_engine_http_request: AppEngineHttpRequest {
                http_method: "POST".to_owned(),
                relative_uri: options.handler_url().to_owned(),
                body: payload,
                headers,
                app_engine_routing: options.routing().cloned(),
            },
        }
    }
}

/// Client side of the queue service's create-task call.
pub trait QueueTransport: Send + Sync {
    fn create_task<'a>(
        &'a self,
        parent: &'a str,
        task: &'a QueueTask,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// [`TaskBackend`] for the hosted queue service.
///
/// When the transport refuses a payload as too large, the payload is stored
/// in the [`OverflowStore`] and a [`RunFromStore`] task carrying the record
/// id is submitted in its place.
pub struct RemoteBackend {
    transport: Arc<dyn QueueTransport>,
    overflow: Arc<dyn OverflowStore>,
    project: String,
    location: String,
}

impl RemoteBackend {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        overflow: Arc<dyn OverflowStore>,
        project: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            overflow,
            project: project.into(),
            location: location.into(),
        }
    }

    pub fn from_settings(
        transport: Arc<dyn QueueTransport>,
        overflow: Arc<dyn OverflowStore>,
        settings: &Settings,
    ) -> Self {
        Self::new(
            transport,
            overflow,
            settings.project.clone().unwrap_or_default(),
            settings.location().unwrap_or_default(),
        )
    }

    pub fn queue_path(&self, queue: &str) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project, self.location, queue
        )
    }

    async fn spill(
        &self,
        parent: &str,
        mut task: QueueTask,
        reason: &str,
    ) -> Result<(), DeferError> {
        let data = task.app_engine_http_request.body.clone();
        let size = data.len();
        let record_id = self.overflow.store(data).await?;
        info!(task = %task.name, size, record = %record_id, reason, "payload spilled to overflow store");

        let indirection = payload::encode(&RunFromStore { record_id }).map_err(DeferError::Serialization);
        let result = match indirection {
            Ok(body) => {
                task.app_engine_http_request.body = body;
                self.transport
                    .create_task(parent, &task)
                    .await
                    .map_err(DeferError::from)
            }
            Err(err) => Err(err),
        };

        if result.is_err() {
            if let Err(err) = self.overflow.delete(record_id).await {
                warn!(record = %record_id, error = %err, "failed to clean up overflow record");
            }
        }
        result
    }
}

impl TaskBackend for RemoteBackend {
    fn submit<'a>(
        &'a self,
        payload: Bytes,
        options: &'a TaskOptions,
    ) -> BoxFuture<'a, Result<(), DeferError>> {
        Box::pin(async move {
            let parent = self.queue_path(options.queue());
            let size = payload.len();
            let task = QueueTask::new(&parent, payload, options, Utc::now());

            match self.transport.create_task(&parent, &task).await {
                Ok(()) => {
                    info!(task = %task.name, size, "task submitted");
                    Ok(())
                }
                Err(TransportError::PayloadTooLarge(_)) if options.small_task_only() => {
                    Err(DeferError::PayloadTooLarge { size })
                }
                Err(TransportError::PayloadTooLarge(reason)) => {
                    self.spill(&parent, task, &reason).await
                }
                Err(err) => Err(err.into()),
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::testing::RecordingTransport;
    use super::*;
    use crate::database::{Connections, MemoryOverflowStore, OverflowRecord, RecordId, StoreError};
    use crate::tasks::payload::{DeferredTask, TaskRegistry};

    /// Refuses every write.
    struct ReadOnlyStore;

    impl OverflowStore for ReadOnlyStore {
        fn store(&self, _data: Bytes) -> BoxFuture<'_, Result<RecordId, StoreError>> {
            Box::pin(async { Err(StoreError::Backend("read-only replica".into())) })
        }

        fn load(&self, id: RecordId) -> BoxFuture<'_, Result<OverflowRecord, StoreError>> {
            Box::pin(async move { Err(StoreError::NotFound(id)) })
        }

        fn delete(&self, _id: RecordId) -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn backend(transport: Arc<RecordingTransport>, store: Arc<MemoryOverflowStore>) -> RemoteBackend {
        RemoteBackend::new(transport, store, "acme", "us-central1")
    }

    fn options(small_task_only: bool) -> TaskOptions {
        let mut options = TaskOptions::builder()
            .name("job-1")
            .queue("mail")
            .header("X-Trace", "abc")
            .small_task_only(small_task_only)
            .build(&Connections::default())
            .unwrap();
        options.created_at = Some(Utc::now());
        options
    }

    #[test]
    fn builds_create_task_request() {
        let now = Utc::now();
        let options = TaskOptions::builder()
            .name("n")
            .countdown(60)
            .header("content-type", "application/json")
            .build(&Connections::default())
            .unwrap();

        let task = QueueTask::new("projects/p/locations/l/queues/q", Bytes::from_static(b"x"), &options, now);
        assert_eq!(task.name, "projects/p/locations/l/queues/q/tasks/n");
        assert_eq!(task.schedule_time, Some(now + Duration::seconds(60)));
        assert_eq!(task.create_time, now);

        let request = &task.app_engine_http_request;
        assert_eq!(request.http_method, "POST");
        assert_eq!(request.relative_uri, "/_tasks/deferred");
        assert_eq!(request.headers.get("Content-Type"), Some("application/json"));
        assert_eq!(request.headers.len(), 1);
    }

    #[tokio::test]
    async fn small_payload_goes_straight_through() {
        let transport = Arc::new(RecordingTransport::new(1024));
        let store = Arc::new(MemoryOverflowStore::new());

        backend(transport.clone(), store.clone())
            .submit(Bytes::from_static(b"small"), &options(false))
            .await
            .unwrap();

        let created = transport.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "projects/acme/locations/us-central1/queues/mail");
        assert_eq!(&created[0].1.app_engine_http_request.body[..], b"small");
        assert_eq!(
            created[0].1.app_engine_http_request.headers.get("X-Trace"),
            Some("abc")
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_spills_once() {
        let transport = Arc::new(RecordingTransport::new(256));
        let store = Arc::new(MemoryOverflowStore::new());
        let big = Bytes::from(vec![b'x'; 4096]);

        backend(transport.clone(), store.clone())
            .submit(big.clone(), &options(false))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let created = transport.created();
        assert_eq!(created.len(), 1);

        let decoded = TaskRegistry::new()
            .decode(&created[0].1.app_engine_http_request.body)
            .unwrap();
        assert_eq!(decoded.kind, RunFromStore::TASK_TYPE);
        assert_eq!(created[0].1.name, "projects/acme/locations/us-central1/queues/mail/tasks/job-1");
    }

    #[tokio::test]
    async fn small_task_only_refuses_to_spill() {
        let transport = Arc::new(RecordingTransport::new(64));
        let store = Arc::new(MemoryOverflowStore::new());

        let err = backend(transport.clone(), store.clone())
            .submit(Bytes::from(vec![0; 128]), &options(true))
            .await
            .unwrap_err();

        assert!(matches!(err, DeferError::PayloadTooLarge { size: 128 }));
        assert!(store.is_empty());
        assert!(transport.created().is_empty());
    }

    #[tokio::test]
    async fn failed_resubmission_removes_the_record() {
        let mut transport = RecordingTransport::new(256);
        transport.reject_accepted = true;
        let transport = Arc::new(transport);
        let store = Arc::new(MemoryOverflowStore::new());

        let err = backend(transport, store.clone())
            .submit(Bytes::from(vec![0; 512]), &options(false))
            .await
            .unwrap_err();

        assert!(matches!(err, DeferError::Transport(TransportError::Rejected(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn oversized_indirection_is_reported() {
        let transport = Arc::new(RecordingTransport::new(64));
        let store = Arc::new(MemoryOverflowStore::new());

        let err = backend(transport.clone(), store.clone())
            .submit(Bytes::from(vec![0; 128]), &options(false))
            .await
            .unwrap_err();

        assert!(matches!(err, DeferError::Transport(TransportError::PayloadTooLarge(_))));
        assert!(store.is_empty());
        assert!(transport.created().is_empty());
    }

    #[tokio::test]
    async fn store_failure_propagates_without_resubmitting() {
        let transport = Arc::new(RecordingTransport::new(256));

        let err = RemoteBackend::new(transport.clone(), Arc::new(ReadOnlyStore), "acme", "us-central1")
            .submit(Bytes::from(vec![0; 512]), &options(false))
            .await
            .unwrap_err();

        assert!(matches!(err, DeferError::Store(StoreError::Backend(_))));
        assert!(transport.created().is_empty());
    }

    #[tokio::test]
    async fn other_transport_errors_leave_the_store_alone() {
        let mut transport = RecordingTransport::new(1024);
        transport.reject_accepted = true;
        let store = Arc::new(MemoryOverflowStore::new());

        let err = backend(Arc::new(transport), store.clone())
            .submit(Bytes::from_static(b"small"), &options(false))
            .await
            .unwrap_err();

        assert!(matches!(err, DeferError::Transport(TransportError::Rejected(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn queue_path_from_settings() {
        let settings = Settings {
            project: Some("acme".into()),
            application_id: "e~acme".into(),
            ..Settings::default()
        };
        let backend = RemoteBackend::from_settings(
            Arc::new(RecordingTransport::new(1)),
            Arc::new(MemoryOverflowStore::new()),
            &settings,
        );
        assert_eq!(
            backend.queue_path("default"),
            "projects/acme/locations/europe-west1/queues/default"
        );
    }
}
