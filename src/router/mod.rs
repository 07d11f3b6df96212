//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! | Pattern               | Example match                    | Captured params     |
//! |-----------------------|----------------------------------|---------------------|
//! | `/_tasks/deferred`    | `/_tasks/deferred`               | *(none)*            |
//! | `/cron-tasks/:name`   | `/cron-tasks/sync-pokemon`       | `name → "sync-pokemon"` |
//! | `/static/*`           | `/static/app.css`                | `wildcard → "/app.css"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths. Routes
//! are matched in registration order. Middleware added with [`Router::layer`]
//! wraps every route, in the order it was added.

use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::{BoxFuture, Method, Request, Response, StatusCode};

/// Type-erased async handler that processes a [`Context`] and returns a [`Response`].
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture<'static, Response> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> BoxFuture<'static, Response>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, Response> {
        Box::pin((self)(ctx))
    }
}

/// Erases the concrete type of `handler`.
pub fn into_handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| handler.call(ctx))
}

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();
            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_string())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => {
                            params.insert(name.clone(), path_seg.to_string());
                        }
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => path.strip_prefix(prefix.as_str()).map(|suffix| {
                let mut params = PathParams::new();
                params.insert("wildcard".to_string(), suffix.to_string());
                params
            }),
        }
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// HTTP request router.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rtask::{Context, Router, Response, StatusCode};
/// use rtask::middleware::LoggerMiddleware;
///
/// let mut router = Router::new();
/// router.layer(Arc::new(LoggerMiddleware));
/// router.get("/cron-tasks/:name", |ctx: Context| async move {
///     let name = ctx.params().get("name").unwrap_or("unknown").to_owned();
///     Response::new(StatusCode::Ok).body(name)
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    layers: Vec<MiddlewareHandler>,
}

impl Router {
    /// Create a new, empty `Router`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, into_handler(handler));
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, into_handler(handler));
    }

    /// Register an already type-erased handler for `method` and `path`.
    pub fn add_route(&mut self, method: Method, path: &str, handler: Handler) {
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    /// Wrap every route in `middleware`. Layers run in the order they were added.
    pub fn layer<M>(&mut self, middleware: Arc<M>)
    where
        M: Middleware + 'static,
    {
        self.layers.push(from_middleware(middleware));
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `request` through the layers to the first matching route.
    ///
    /// A path registered under another method answers `405`; an unknown
    /// path answers `404`. Neither runs the middleware layers.
    pub async fn route(&self, request: Request) -> Response {
        let mut path_known = false;

        for route in &self.routes {
            let Some(params) = route.pattern.matches(request.path()) else {
                continue;
            };
            if &route.method != request.method() {
                path_known = true;
                continue;
            }

            let ctx = Context::with_params(request, params);
            let layers: Arc<[MiddlewareHandler]> = self.layers.clone().into();
            return Next::with_endpoint(layers, route.handler.clone())
                .run(ctx)
                .await;
        }

        if path_known {
            Response::new(StatusCode::MethodNotAllowed)
        } else {
            Response::new(StatusCode::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::TaskEnvironmentMiddleware;
    use crate::tasks::TaskEnvironment;

    fn make_request(method: &str, path: &str, extra_headers: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    #[test]
    fn pattern_trailing_slash_normalized() {
        let pat = Pattern::parse("/cron-tasks/dummy-task/");
        assert!(pat.matches("/cron-tasks/dummy-task").is_some());
        assert!(pat.matches("/cron-tasks/dummy-task/").is_some());
        assert!(pat.matches("/cron-tasks").is_none());
    }

    #[test]
    fn pattern_param_extracts_value() {
        let pat = Pattern::parse("/cron-tasks/:name");
        let params = pat.matches("/cron-tasks/sync-pokemon").unwrap();
        assert_eq!(params.get("name"), Some("sync-pokemon"));
        assert!(pat.matches("/cron-tasks/a/b").is_none());
        assert!(pat.matches("/other/a").is_none());
    }

    #[test]
    fn pattern_wildcard() {
        let pat = Pattern::parse("/static/*");
        let params = pat.matches("/static/css/app.css").unwrap();
        assert_eq!(params.get("wildcard"), Some("/css/app.css"));
        assert!(pat.matches("/assets/app.css").is_none());
    }

    #[tokio::test]
    async fn unknown_path_is_404_and_wrong_method_is_405() {
        let mut router = Router::new();
        router.post("/_tasks/deferred", |_ctx| async { Response::new(StatusCode::Ok) });

        let res = router.route(make_request("GET", "/nope", "")).await;
        assert_eq!(res.status(), StatusCode::NotFound);

        let res = router.route(make_request("GET", "/_tasks/deferred", "")).await;
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);

        let res = router.route(make_request("POST", "/_tasks/deferred", "")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/path", |_ctx| async { Response::new(StatusCode::Ok) });
        router.get("/path", |_ctx| async { Response::new(StatusCode::Accepted) });
        assert_eq!(router.len(), 2);

        let res = router.route(make_request("GET", "/path", "")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn layers_wrap_routes() {
        let mut router = Router::new();
        router.layer(Arc::new(TaskEnvironmentMiddleware));
        router.post("/t", |ctx: Context| async move {
            let queue = ctx
                .extensions()
                .get::<TaskEnvironment>()
                .and_then(|env| env.queue_name.clone())
                .unwrap_or_default();
            Response::new(StatusCode::Ok).body(queue)
        });

        let res = router
            .route(make_request("POST", "/t", "X-AppEngine-QueueName: mail\r\n"))
            .await;
        assert_eq!(res.body_text(), "mail");
    }
}
