//! Trust boundary for task and cron endpoints.
//!
//! The queue service identifies itself through the `X-AppEngine-*` task
//! headers (the hosting platform strips them from external traffic), and the
//! cron scheduler through `X-Appengine-Cron`. [`TaskEnvironmentMiddleware`]
//! turns those headers into a [`TaskEnvironment`] extension; the guards here
//! only look at that extension, never at the raw headers.
//!
//! Rejected callers get a plain `403 Access denied.`.
//!
//! [`TaskEnvironmentMiddleware`]: crate::middleware::TaskEnvironmentMiddleware

use std::sync::Arc;

use crate::context::Context;
use crate::router::{Handler, IntoHandler, into_handler};
use crate::tasks::TaskEnvironment;
use crate::{BoxFuture, Response, StatusCode};

/// An authenticated end user, attached to the request context by whatever
/// authentication layer the application runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub is_authenticated: bool,
    pub is_superuser: bool,
}

impl Principal {
    fn is_superuser(&self) -> bool {
        self.is_authenticated && self.is_superuser
    }
}

fn is_task_system(ctx: &Context) -> bool {
    ctx.extensions()
        .get::<TaskEnvironment>()
        .is_some_and(|env| env.is_task() || env.is_cron)
}

fn is_superuser(ctx: &Context) -> bool {
    ctx.extensions()
        .get::<Principal>()
        .is_some_and(Principal::is_superuser)
}

fn access_denied() -> Response {
    Response::new(StatusCode::Forbidden).body("Access denied.")
}

fn guarded(handler: impl IntoHandler, allow: fn(&Context) -> bool) -> Handler {
    let inner = into_handler(handler);
    Arc::new(move |ctx: Context| -> BoxFuture<'static, Response> {
        if !allow(&ctx) {
            tracing::warn!(path = %ctx.request().path(), "rejected caller outside the task system");
            return Box::pin(async { access_denied() });
        }
        inner(ctx)
    })
}

/// Restrict `handler` to requests issued by the task queue or the cron scheduler.
pub fn task_only(handler: impl IntoHandler) -> Handler {
    guarded(handler, is_task_system)
}

/// Restrict `handler` to the task queue, the cron scheduler, and superusers.
pub fn task_or_superuser_only(handler: impl IntoHandler) -> Handler {
    guarded(handler, |ctx| is_task_system(ctx) || is_superuser(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;

    fn ctx_with(env: Option<TaskEnvironment>, principal: Option<Principal>) -> Context {
        let (req, _) = Request::parse(b"POST /_tasks/deferred HTTP/1.1\r\n\r\n").unwrap();
        let mut ctx = Context::new(req);
        if let Some(env) = env {
            ctx.extensions_mut().insert(env);
        }
        if let Some(principal) = principal {
            ctx.extensions_mut().insert(principal);
        }
        ctx
    }

    fn ok_handler(_ctx: Context) -> impl Future<Output = Response> + Send {
        async { Response::new(StatusCode::Ok).body("OK") }
    }

    fn task_env() -> TaskEnvironment {
        TaskEnvironment {
            task_name: Some("t-1".to_owned()),
            ..TaskEnvironment::default()
        }
    }

    fn cron_env() -> TaskEnvironment {
        TaskEnvironment {
            is_cron: true,
            ..TaskEnvironment::default()
        }
    }

    fn superuser() -> Principal {
        Principal {
            username: "admin".to_owned(),
            is_authenticated: true,
            is_superuser: true,
        }
    }

    #[tokio::test]
    async fn task_only_admits_tasks_and_crons() {
        let guard = task_only(ok_handler);
        assert_eq!(guard(ctx_with(Some(task_env()), None)).await.status(), StatusCode::Ok);
        assert_eq!(guard(ctx_with(Some(cron_env()), None)).await.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn task_only_rejects_everyone_else() {
        let guard = task_only(ok_handler);
        let res = guard(ctx_with(None, Some(superuser()))).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
        assert_eq!(res.body_text(), "Access denied.");

        let res = guard(ctx_with(Some(TaskEnvironment::default()), None)).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn superuser_guard() {
        let guard = task_or_superuser_only(ok_handler);
        assert_eq!(guard(ctx_with(None, Some(superuser()))).await.status(), StatusCode::Ok);
        assert_eq!(guard(ctx_with(Some(task_env()), None)).await.status(), StatusCode::Ok);

        let anonymous_admin = Principal {
            is_authenticated: false,
            ..superuser()
        };
        let res = guard(ctx_with(None, Some(anonymous_admin))).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }
}
