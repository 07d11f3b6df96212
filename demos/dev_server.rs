//! Local development server.
//!
//! Runs the delivery endpoint on top of the in-process emulator plus two
//! cron endpoints. Try it with:
//!
//! ```sh
//! cargo run --example dev_server
//! curl -X GET -H 'X-Appengine-Cron: true' http://127.0.0.1:8080/cron-tasks/dummy-defer-task/
//! ```
//!
//! Pass a TOML settings file as the first argument to override defaults.
//! Stop with Ctrl-C; pending emulator tasks are snapshotted and picked up by
//! the next run.

use std::path::PathBuf;

use rtask::config::{LogFormat, Settings};
use rtask::security::task_or_superuser_only;
use rtask::tasks::{DeferredTask, Deferrer, ExecutionContext, Runnable, TaskError, TaskSystem};
use rtask::{BoxFuture, Context, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Serialize, Deserialize)]
struct DummyBackgroundTask {
    some_param: i64,
}

impl Runnable for DummyBackgroundTask {
    fn run<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async move {
            info!(
                some_param = self.some_param,
                task = ctx.env().task_name.as_deref().unwrap_or("-"),
                "Hello world! (from background task)"
            );
            Ok(())
        })
    }
}

impl DeferredTask for DummyBackgroundTask {
    const TASK_TYPE: &'static str = "core.DummyBackgroundTask";
}

fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()?,
    }
    Ok(())
}

async fn dummy_task(_ctx: Context) -> Response {
    info!("Hello world!");
    Response::new(StatusCode::Ok).body("OK")
}

async fn dummy_defer_task(deferrer: Deferrer) -> Response {
    info!("Hello world!");
    match deferrer.defer(&DummyBackgroundTask { some_param: 1 }, None).await {
        Ok(()) => Response::new(StatusCode::Ok).body("OK"),
        Err(err) => {
            error!(error = %err, "failed to defer dummy task");
            Response::new(StatusCode::InternalServerError).body("Failed to defer task")
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(path.as_deref())?;
    init_logging(settings.log_format)?;

    let system = TaskSystem::builder(settings.clone())
        .register::<DummyBackgroundTask>()
        .build()?;

    let mut router = system.router();
    router.add_route(
        rtask::Method::Get,
        "/cron-tasks/dummy-task/",
        task_or_superuser_only(dummy_task),
    );
    let deferrer = system.deferrer().clone();
    router.add_route(
        rtask::Method::Get,
        "/cron-tasks/dummy-defer-task/",
        task_or_superuser_only(move |_ctx: Context| dummy_defer_task(deferrer.clone())),
    );

    let server = Server::bind(&settings.bind_addr).await?;
    info!(addr = %server.local_addr(), backend = ?settings.backend, "dev server listening");

    tokio::select! {
        result = server.serve(router) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    system.shutdown().await?;
    Ok(())
}
