//! The HTTP endpoint the queue service delivers deferred tasks to.
//!
//! | outcome                         | status |
//! |---------------------------------|--------|
//! | caller is not the task system   | 403    |
//! | task ran                        | 200    |
//! | permanent failure (dropped)     | 200    |
//! | transient failure (retried)     | 500    |

use std::sync::Arc;

use super::environment::TaskEnvironment;
use super::error::TaskError;
use super::executor::Executor;
use crate::context::Context;
use crate::router::Handler;
use crate::security::task_only;
use crate::{Response, StatusCode};

/// Builds the delivery handler. Requests must pass through
/// [`TaskEnvironmentMiddleware`](crate::middleware::TaskEnvironmentMiddleware)
/// to be admitted.
pub fn deferred_handler(executor: Arc<Executor>) -> Handler {
    task_only(move |ctx: Context| {
        let executor = Arc::clone(&executor);
        async move { deliver(&executor, ctx).await }
    })
}

async fn deliver(executor: &Executor, ctx: Context) -> Response {
    let env = ctx
        .extensions()
        .get::<TaskEnvironment>()
        .cloned()
        .unwrap_or_default();

    match executor.execute(ctx.request().body(), env).await {
        Ok(()) => Response::new(StatusCode::Ok).body("OK"),
        // Acknowledged so the queue stops redelivering.
        Err(TaskError::Permanent(reason)) => Response::new(StatusCode::Ok).body(format!("Permanent failure: {reason}")),
        Err(TaskError::Transient(reason)) => {
            Response::new(StatusCode::InternalServerError).body(format!("Task failed: {reason}"))
        }
    }
}
