//! Middleware pipeline: composable before/after request handler logic.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`LoggerMiddleware`]: request/response logger.
//! - [`TaskEnvironmentMiddleware`]: records the queue service's task headers
//!   as a [`TaskEnvironment`] extension on the request context.

use std::sync::Arc;
use tokio::time::Instant;

use crate::router::Handler;
use crate::tasks::TaskEnvironment;
use crate::{BoxFuture, Response, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// Once every middleware has run, the route's endpoint handler (if any) is
/// invoked. A chain that ends without an endpoint answers `500`.
///
/// # Examples
///
/// ```rust,no_run
/// use rtask::{BoxFuture, Response, context::Context, middleware::{Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'static, Response> {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Option<Handler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler =
    Arc<dyn Fn(Context, Next) -> BoxFuture<'static, Response> + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a chain of `middlewares` with no endpoint behind it.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares: middlewares.into(),
            endpoint: None,
            index: 0,
        }
    }

    /// Creates a chain of `middlewares` that finishes in `endpoint`.
    pub fn with_endpoint(middlewares: Arc<[MiddlewareHandler]>, endpoint: Handler) -> Self {
        Self {
            middlewares,
            endpoint: Some(endpoint),
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain, or the endpoint once the
    /// middlewares are exhausted, and returns its response.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            return handler(ctx, self).await;
        }

        match self.endpoint.take() {
            Some(endpoint) => endpoint(ctx).await,
            None => Response::new(crate::StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit by
/// returning a [`Response`] directly, or decorate the downstream response.
/// Implementations are shared across Tokio tasks and must not hold `&mut`
/// references to shared state across an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'static, Response>;
}

/// Logs each request's method, path, status, and duration after the
/// downstream handler completes.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                duration = ?start.elapsed(),
                "request handled"
            );

            response
        })
    }
}

/// Reads the task headers set by the queue service and stores the resulting
/// [`TaskEnvironment`] in the context extensions.
///
/// Requests without any task or cron header get no extension, which is what
/// the [`security`](crate::security) guards key on.
pub struct TaskEnvironmentMiddleware;

impl Middleware for TaskEnvironmentMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            if let Some(env) = TaskEnvironment::from_headers(ctx.request().headers()) {
                tracing::debug!(
                    task = env.task_name.as_deref().unwrap_or("-"),
                    queue = env.queue_name.as_deref().unwrap_or("-"),
                    retry = env.retry_count,
                    cron = env.is_cron,
                    "request carries task environment"
                );
                ctx.extensions_mut().insert(env);
            }
            next.run(ctx).await
        })
    }
}
