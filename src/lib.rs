//! # rtask
//!
//! Deferred background tasks for an async web backend.
//!
//! A unit of work is any serializable type implementing
//! [`tasks::Runnable`]. [`tasks::Deferrer::defer`] turns it into a versioned
//! payload and hands it to a [`tasks::TaskBackend`]: either the hosted queue
//! service ([`tasks::RemoteBackend`]) or the in-process
//! [`tasks::Emulator`] used for local development and tests. Payloads the
//! queue transport refuses as too large are spilled to an
//! [`database::OverflowStore`] and replaced by a small indirection task.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtask::config::Settings;
//! use rtask::server::Server;
//! use rtask::tasks::TaskSystem;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load(None)?;
//!     let system = TaskSystem::builder(settings.clone()).build()?;
//!
//!     let server = Server::bind(&settings.bind_addr).await?;
//!     server.serve(system.router()).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

// ── HTTP surface for task delivery ────────────────────────────────────────────
pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

// ── Task subsystem and its collaborators ─────────────────────────────────────
pub mod config;
pub mod database;
pub mod tasks;

/// A heap-allocated, `Send` future: the return type of every async seam
/// (backends, transports, stores, runnables) so they stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
pub use tasks::{DeferError, Deferrer, TaskError, TaskOptions, TaskSystem};
