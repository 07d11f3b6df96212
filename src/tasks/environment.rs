use crate::http::Headers;

pub const TASK_NAME_HEADER: &str = "X-AppEngine-TaskName";
pub const QUEUE_NAME_HEADER: &str = "X-AppEngine-QueueName";
pub const RETRY_COUNT_HEADER: &str = "X-AppEngine-TaskRetryCount";
pub const EXECUTION_COUNT_HEADER: &str = "X-AppEngine-TaskExecutionCount";
pub const CRON_HEADER: &str = "X-Appengine-Cron";

/// What the queue service told us about the delivery being handled.
///
/// Passed explicitly to every task run through the
/// [`ExecutionContext`](super::ExecutionContext).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskEnvironment {
    pub task_name: Option<String>,
    pub queue_name: Option<String>,
    /// Zero on the first attempt.
    pub retry_count: Option<u32>,
    pub execution_count: Option<u32>,
    pub is_cron: bool,
}

impl TaskEnvironment {
    /// Reads the task headers, or `None` when the request carries none of
    /// them.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let count = |name| headers.get(name).and_then(|v| v.trim().parse::<u32>().ok());

        let env = Self {
            task_name: headers.get(TASK_NAME_HEADER).map(str::to_owned),
            queue_name: headers.get(QUEUE_NAME_HEADER).map(str::to_owned),
            retry_count: count(RETRY_COUNT_HEADER),
            execution_count: count(EXECUTION_COUNT_HEADER),
            is_cron: headers
                .get(CRON_HEADER)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
        };

        (env.is_task() || env.is_cron).then_some(env)
    }

    /// `true` when this is a queue delivery (as opposed to cron or a plain
    /// request).
    pub fn is_task(&self) -> bool {
        self.task_name.is_some() || self.queue_name.is_some()
    }

    /// Environment for a delivery made by the in-process emulator, which
    /// runs each task exactly once.
    pub fn emulated(task_name: Option<String>, queue_name: impl Into<String>) -> Self {
        Self {
            task_name,
            queue_name: Some(queue_name.into()),
            retry_count: Some(0),
            execution_count: Some(0),
            is_cron: false,
        }
    }
}
