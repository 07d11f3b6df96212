use bytes::Bytes;

use super::error::DeferError;
use super::options::TaskOptions;
use crate::BoxFuture;

/// Where deferred payloads go.
///
/// One implementation is chosen when the [`TaskSystem`](super::TaskSystem)
/// is built: [`RemoteBackend`](super::RemoteBackend) for the hosted queue,
/// [`EmulatorBackend`](super::EmulatorBackend) for local runs.
pub trait TaskBackend: Send + Sync {
    /// Hands one payload to the queue. `options` arrive fully populated by
    /// the [`Deferrer`](super::Deferrer).
    fn submit<'a>(
        &'a self,
        payload: Bytes,
        options: &'a TaskOptions,
    ) -> BoxFuture<'a, Result<(), DeferError>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// A backend that only remembers what it was given.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        submitted: Mutex<Vec<(Bytes, TaskOptions)>>,
    }

    impl RecordingBackend {
        pub(crate) fn submitted(&self) -> Vec<(Bytes, TaskOptions)> {
            self.submitted.lock().unwrap().clone()
        }
    }

    impl TaskBackend for RecordingBackend {
        fn submit<'a>(
            &'a self,
            payload: Bytes,
            options: &'a TaskOptions,
        ) -> BoxFuture<'a, Result<(), DeferError>> {
            self.submitted.lock().unwrap().push((payload, options.clone()));
            Box::pin(async { Ok(()) })
        }
    }
}
