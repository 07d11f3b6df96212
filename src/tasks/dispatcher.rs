//! `defer`: turn a task value into a queued delivery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use super::backend::TaskBackend;
use super::error::DeferError;
use super::options::{DEFAULT_HANDLER_URL, TaskOptions};
use super::payload::{self, DeferredTask, TaskRegistry};
use crate::BoxFuture;
use crate::database::TransactionalHost;

/// Values applied to options the caller left unset.
#[derive(Debug, Clone)]
pub struct DispatchDefaults {
    pub handler_url: String,
    /// Routing version used when routing is given without one.
    pub version: Option<String>,
}

impl Default for DispatchDefaults {
    fn default() -> Self {
        Self {
            handler_url: DEFAULT_HANDLER_URL.to_owned(),
            version: None,
        }
    }
}

/// Entry point for deferring work. Cheap to clone.
#[derive(Clone)]
pub struct Deferrer {
    registry: Arc<TaskRegistry>,
    host: Arc<dyn TransactionalHost>,
    backend: Arc<dyn TaskBackend>,
    defaults: Arc<DispatchDefaults>,
}

impl Deferrer {
    pub fn new(
        registry: Arc<TaskRegistry>,
        host: Arc<dyn TransactionalHost>,
        backend: Arc<dyn TaskBackend>,
        defaults: DispatchDefaults,
    ) -> Self {
        Self {
            registry,
            host,
            backend,
            defaults: Arc::new(defaults),
        }
    }

    pub fn host(&self) -> &dyn TransactionalHost {
        self.host.as_ref()
    }

    /// Schedules `task` for execution in a later request.
    ///
    /// With `options` left as `None` the task goes to the `default` queue,
    /// as soon as possible, with a generated name. When the submission is
    /// transactional (explicitly, or because an atomic block is open on the
    /// chosen connection) it is held until that block commits and discarded
    /// if it rolls back; in that case this returns `Ok` without contacting
    /// the backend, and later submission failures are only logged.
    pub async fn defer<T: DeferredTask>(
        &self,
        task: &T,
        options: Option<TaskOptions>,
    ) -> Result<(), DeferError> {
        if !self.registry.contains(T::TASK_TYPE) {
            return Err(DeferError::ContractViolation(T::TASK_TYPE));
        }

        let options = self.complete(T::TASK_TYPE, options.unwrap_or_default());
        let payload = payload::encode(task).map_err(DeferError::Serialization)?;

        if options.transactional == Some(true) {
            debug!(
                task = options.name(),
                queue = options.queue(),
                connection = options.using(),
                "task submission waits for commit"
            );
            let backend = Arc::clone(&self.backend);
            let alias = options.using.clone();
            self.host.on_commit(
                &alias,
                Box::new(move || -> BoxFuture<'static, ()> {
                    Box::pin(async move {
                        if let Err(err) = backend.submit(payload, &options).await {
                            error!(
                                task = options.name(),
                                queue = options.queue(),
                                error = %err,
                                "post-commit task submission failed"
                            );
                        }
                    })
                }),
            );
            return Ok(());
        }

        self.backend.submit(payload, &options).await
    }

    fn complete(&self, kind: &str, mut options: TaskOptions) -> TaskOptions {
        let created_at = *options.created_at.get_or_insert_with(Utc::now);
        if options.name.is_none() {
            options.name = Some(task_name(kind, created_at));
        }
        if options.handler_url.is_none() {
            options.handler_url = Some(self.defaults.handler_url.clone());
        }
        if let Some(routing) = options.routing.as_mut() {
            if routing.version.is_none() {
                routing.version = self.defaults.version.clone();
            }
        }
        if options.transactional.is_none() {
            options.transactional = Some(self.host.in_atomic_block(&options.using));
        }
        options
    }
}

/// `{kind}.{timestamp}-{suffix}` when the type id is dotted, otherwise
/// `{kind}:{timestamp}-{suffix}`; the suffix is 8 random hex digits.
pub(crate) fn task_name(kind: &str, created_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let timestamp = created_at.format("%Y%m%dT%H%M%S%6fZ");
    let separator = if kind.contains('.') { '.' } else { ':' };
    format!("{kind}{separator}{timestamp}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Connections;
    use crate::tasks::backend::testing::RecordingBackend;
    use crate::tasks::options::RoutingOptions;
    use crate::tasks::payload::tests::Note;

    fn deferrer(host: Connections, backend: Arc<RecordingBackend>) -> Deferrer {
        Deferrer::new(
            Arc::new(TaskRegistry::new().with::<Note>()),
            Arc::new(host),
            backend,
            DispatchDefaults {
                handler_url: "/_tasks/deferred".into(),
                version: Some("v3".into()),
            },
        )
    }

    fn note() -> Note {
        Note { text: "hello".into() }
    }

    #[tokio::test]
    async fn defaults_are_filled_in() {
        let backend = Arc::new(RecordingBackend::default());
        let deferrer = deferrer(Connections::default(), backend.clone());

        deferrer.defer(&note(), None).await.unwrap();

        let submitted = backend.submitted();
        assert_eq!(submitted.len(), 1);
        let (payload, options) = &submitted[0];
        assert_eq!(options.queue(), "default");
        assert!(options.name().unwrap().starts_with("tests.Note."));
        assert!(options.created_at().is_some());
        assert_eq!(options.transactional(), Some(false));
        assert!(options.schedule_time_at(Utc::now()).is_none());
        assert!(options.routing().is_none());
        assert_eq!(&payload[..], &payload::encode(&note()).unwrap()[..]);
    }

    #[tokio::test]
    async fn caller_options_are_kept() {
        let backend = Arc::new(RecordingBackend::default());
        let deferrer = deferrer(Connections::default(), backend.clone());
        let options = TaskOptions::builder()
            .name("fixed")
            .queue("mail")
            .routing(RoutingOptions {
                service: Some("worker".into()),
                ..RoutingOptions::default()
            })
            .build(deferrer.host())
            .unwrap();

        deferrer.defer(&note(), Some(options)).await.unwrap();

        let (_, options) = &backend.submitted()[0];
        assert_eq!(options.name(), Some("fixed"));
        assert_eq!(options.queue(), "mail");
        let routing = options.routing().unwrap();
        assert_eq!(routing.service.as_deref(), Some("worker"));
        assert_eq!(routing.version.as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn unregistered_types_are_rejected() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Stranger;

        impl crate::tasks::Runnable for Stranger {
            fn run<'a>(
                &'a self,
                _ctx: &'a crate::tasks::ExecutionContext,
            ) -> BoxFuture<'a, Result<(), crate::tasks::TaskError>> {
                Box::pin(async { Ok(()) })
            }
        }

        impl DeferredTask for Stranger {
            const TASK_TYPE: &'static str = "tests.Stranger";
        }

        let backend = Arc::new(RecordingBackend::default());
        let err = deferrer(Connections::default(), backend.clone())
            .defer(&Stranger, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeferError::ContractViolation("tests.Stranger")));
        assert!(backend.submitted().is_empty());
    }

    #[tokio::test]
    async fn serialization_failure_submits_nothing() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct PairKeyed {
            counts: std::collections::HashMap<(u8, u8), u8>,
        }

        impl crate::tasks::Runnable for PairKeyed {
            fn run<'a>(
                &'a self,
                _ctx: &'a crate::tasks::ExecutionContext,
            ) -> BoxFuture<'a, Result<(), crate::tasks::TaskError>> {
                Box::pin(async { Ok(()) })
            }
        }

        impl DeferredTask for PairKeyed {
            const TASK_TYPE: &'static str = "tests.PairKeyed";
        }

        let host = Connections::default();
        let backend = Arc::new(RecordingBackend::default());
        let deferrer = Deferrer::new(
            Arc::new(TaskRegistry::new().with::<PairKeyed>()),
            Arc::new(host.clone()),
            backend.clone(),
            DispatchDefaults::default(),
        );
        let task = PairKeyed {
            counts: [((1, 2), 3)].into_iter().collect(),
        };

        let err = deferrer.defer(&task, None).await.unwrap_err();
        assert!(matches!(err, DeferError::Serialization(_)));

        let tx = host.begin("default").unwrap();
        let err = deferrer.defer(&task, None).await.unwrap_err();
        assert!(matches!(err, DeferError::Serialization(_)));
        tx.commit().await;

        assert!(backend.submitted().is_empty());
    }

    #[tokio::test]
    async fn transactional_submission_waits_for_commit() {
        let host = Connections::default();
        let backend = Arc::new(RecordingBackend::default());
        let deferrer = deferrer(host.clone(), backend.clone());

        let tx = host.begin("default").unwrap();
        deferrer.defer(&note(), None).await.unwrap();
        assert!(backend.submitted().is_empty());

        tx.commit().await;
        let submitted = backend.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1.transactional(), Some(true));
    }

    #[tokio::test]
    async fn rollback_discards_submission() {
        let host = Connections::default();
        let backend = Arc::new(RecordingBackend::default());
        let deferrer = deferrer(host.clone(), backend.clone());

        let tx = host.begin("default").unwrap();
        deferrer.defer(&note(), None).await.unwrap();
        tx.rollback();

        assert!(backend.submitted().is_empty());
    }

    #[tokio::test]
    async fn forced_non_transactional_inside_a_block() {
        let host = Connections::default();
        let backend = Arc::new(RecordingBackend::default());
        let deferrer = deferrer(host.clone(), backend.clone());
        let options = TaskOptions::builder()
            .transactional(false)
            .build(&host)
            .unwrap();

        let tx = host.begin("default").unwrap();
        deferrer.defer(&note(), Some(options)).await.unwrap();
        assert_eq!(backend.submitted().len(), 1);
        tx.rollback();
        assert_eq!(backend.submitted().len(), 1);
    }

    #[test]
    fn name_format() {
        let created = DateTime::parse_from_rfc3339("2024-03-05T06:07:08.123456Z")
            .unwrap()
            .with_timezone(&Utc);

        let name = task_name("mail.Send", created);
        assert!(name.starts_with("mail.Send.20240305T060708123456Z-"), "{name}");
        assert_eq!(name.len(), "mail.Send.20240305T060708123456Z-".len() + 8);

        let name = task_name("Cleanup", created);
        assert!(name.starts_with("Cleanup:20240305T060708123456Z-"), "{name}");
        assert_ne!(task_name("Cleanup", created), task_name("Cleanup", created));
    }
}
