//! How a deferred task should be delivered.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::error::OptionsError;
use crate::database::{DEFAULT_CONNECTION, TransactionalHost};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_HANDLER_URL: &str = "/_tasks/deferred";

/// Service/version/instance the queue should deliver to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingOptions {
    pub service: Option<String>,
    /// Defaults to the running version when left unset.
    pub version: Option<String>,
    pub instance: Option<String>,
}

/// Delivery options for one deferred task.
///
/// Build with [`TaskOptions::builder`]. The dispatcher fills in the name,
/// creation time, and transactional flag when the caller leaves them unset;
/// after that the options are only ever read.
///
/// ```
/// use rtask::database::Connections;
/// use rtask::tasks::TaskOptions;
///
/// let options = TaskOptions::builder()
///     .queue("mail")
///     .countdown(30)
///     .header("X-Priority", "high")
///     .build(&Connections::default())
///     .unwrap();
/// assert_eq!(options.queue(), "mail");
/// assert_eq!(options.countdown(), Some(30));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub(crate) name: Option<String>,
    pub(crate) created_at: Option<DateTime<Utc>>,
    pub(crate) small_task_only: bool,
    pub(crate) using: String,
    pub(crate) transactional: Option<bool>,
    pub(crate) countdown: Option<u32>,
    pub(crate) schedule_time: Option<DateTime<Utc>>,
    pub(crate) routing: Option<RoutingOptions>,
    pub(crate) handler_url: Option<String>,
    pub(crate) extra_headers: BTreeMap<String, String>,
    pub(crate) queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: None,
            created_at: None,
            small_task_only: false,
            using: DEFAULT_CONNECTION.to_owned(),
            transactional: None,
            countdown: None,
            schedule_time: None,
            routing: None,
            handler_url: None,
            extra_headers: BTreeMap::new(),
            queue: DEFAULT_QUEUE.to_owned(),
        }
    }
}

impl TaskOptions {
    pub fn builder() -> TaskOptionsBuilder {
        TaskOptionsBuilder::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// When set, an oversized payload fails instead of spilling to the
    /// overflow store.
    pub fn small_task_only(&self) -> bool {
        self.small_task_only
    }

    /// Connection alias whose transaction the submission is tied to.
    pub fn using(&self) -> &str {
        &self.using
    }

    pub fn transactional(&self) -> Option<bool> {
        self.transactional
    }

    pub fn countdown(&self) -> Option<u32> {
        self.countdown
    }

    pub fn schedule_time(&self) -> Option<DateTime<Utc>> {
        self.schedule_time
    }

    pub fn routing(&self) -> Option<&RoutingOptions> {
        self.routing.as_ref()
    }

    pub fn handler_url(&self) -> &str {
        self.handler_url.as_deref().unwrap_or(DEFAULT_HANDLER_URL)
    }

    pub fn extra_headers(&self) -> &BTreeMap<String, String> {
        &self.extra_headers
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Effective delivery instant for a submission happening at `now`.
    ///
    /// A countdown counts from `now` and takes precedence over an absolute
    /// schedule time. `None` means "as soon as possible".
    pub fn schedule_time_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.countdown {
            Some(seconds) => Some(now + Duration::seconds(i64::from(seconds))),
            None => self.schedule_time,
        }
    }
}

/// Builder for [`TaskOptions`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct TaskOptionsBuilder {
    options: TaskOptions,
}

impl TaskOptionsBuilder {
    /// Explicit task name. Names are unique per queue.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.options.created_at = Some(created_at);
        self
    }

    pub fn small_task_only(mut self, small_task_only: bool) -> Self {
        self.options.small_task_only = small_task_only;
        self
    }

    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.options.using = alias.into();
        self
    }

    /// Force (or forbid) post-commit submission instead of inheriting the
    /// connection's current transaction state.
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.options.transactional = Some(transactional);
        self
    }

    /// Deliver no earlier than `seconds` after submission.
    pub fn countdown(mut self, seconds: u32) -> Self {
        self.options.countdown = Some(seconds);
        self
    }

    /// Deliver no earlier than `at`.
    pub fn schedule_time(mut self, at: DateTime<Utc>) -> Self {
        self.options.schedule_time = Some(at);
        self
    }

    pub fn routing(mut self, routing: RoutingOptions) -> Self {
        self.options.routing = Some(routing);
        self
    }

    pub fn handler_url(mut self, url: impl Into<String>) -> Self {
        self.options.handler_url = Some(url.into());
        self
    }

    /// Extra delivery header; overrides a default header of the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.extra_headers.insert(name.into(), value.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = queue.into();
        self
    }

    /// Validates against the connections `host` knows about.
    pub fn build(self, host: &dyn TransactionalHost) -> Result<TaskOptions, OptionsError> {
        let options = self.options;

        if !host.contains(&options.using) {
            return Err(OptionsError::UnknownConnection {
                alias: options.using,
                known: host.aliases(),
            });
        }
        if options.countdown == Some(0) {
            return Err(OptionsError::InvalidCountdown);
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Connections;

    #[test]
    fn defaults() {
        let options = TaskOptions::default();
        assert_eq!(options.queue(), "default");
        assert_eq!(options.using(), "default");
        assert_eq!(options.handler_url(), DEFAULT_HANDLER_URL);
        assert_eq!(options.transactional(), None);
        assert!(!options.small_task_only());
        assert!(options.schedule_time_at(Utc::now()).is_none());
    }

    #[test]
    fn unknown_connection_rejected_at_build() {
        let host = Connections::new(["replica"]);
        assert!(TaskOptions::builder().using("replica").build(&host).is_ok());

        let err = TaskOptions::builder().using("analytics").build(&host).unwrap_err();
        assert_eq!(
            err,
            OptionsError::UnknownConnection {
                alias: "analytics".into(),
                known: vec!["default".into(), "replica".into()],
            }
        );
    }

    #[test]
    fn zero_countdown_rejected() {
        let err = TaskOptions::builder()
            .countdown(0)
            .build(&Connections::default())
            .unwrap_err();
        assert_eq!(err, OptionsError::InvalidCountdown);
    }

    #[test]
    fn countdown_counts_from_submission() {
        let options = TaskOptions::builder()
            .countdown(90)
            .build(&Connections::default())
            .unwrap();
        let now = Utc::now();
        assert_eq!(options.schedule_time_at(now), Some(now + Duration::seconds(90)));
    }

    #[test]
    fn countdown_beats_schedule_time() {
        let eta = Utc::now() + Duration::hours(5);
        let options = TaskOptions::builder()
            .schedule_time(eta)
            .build(&Connections::default())
            .unwrap();
        assert_eq!(options.schedule_time_at(Utc::now()), Some(eta));

        let options = TaskOptions::builder()
            .schedule_time(eta)
            .countdown(1)
            .build(&Connections::default())
            .unwrap();
        let now = Utc::now();
        assert_eq!(options.schedule_time_at(now), Some(now + Duration::seconds(1)));
    }
}
