//! Deferred tasks.
//!
//! ```rust,no_run
//! use rtask::tasks::{DeferredTask, ExecutionContext, Runnable, TaskError, TaskOptions, TaskSystem};
//! use rtask::BoxFuture;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendReceipt {
//!     order_id: u64,
//! }
//!
//! impl Runnable for SendReceipt {
//!     fn run<'a>(&'a self, _ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<(), TaskError>> {
//!         Box::pin(async move {
//!             println!("receipt for order {}", self.order_id);
//!             Ok(())
//!         })
//!     }
//! }
//!
//! impl DeferredTask for SendReceipt {
//!     const TASK_TYPE: &'static str = "shop.SendReceipt";
//! }
//!
//! # async fn demo(system: TaskSystem) -> Result<(), Box<dyn std::error::Error>> {
//! let options = TaskOptions::builder()
//!     .queue("mail")
//!     .countdown(30)
//!     .build(system.deferrer().host())?;
//! system.defer(&SendReceipt { order_id: 42 }, Some(options)).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod delivery;
mod dispatcher;
mod emulator;
mod environment;
mod error;
mod executor;
mod options;
mod overflow;
mod payload;
mod remote;
mod system;

pub use backend::TaskBackend;
pub use delivery::deferred_handler;
pub use dispatcher::{Deferrer, DispatchDefaults};
pub use emulator::{Emulator, EmulatorBackend, EmulatorConfig, EmulatorError, ScheduledTask, TaskHandler};
pub use environment::{
    CRON_HEADER, EXECUTION_COUNT_HEADER, QUEUE_NAME_HEADER, RETRY_COUNT_HEADER, TASK_NAME_HEADER,
    TaskEnvironment,
};
pub use error::{DecodeError, DeferError, OptionsError, TaskError, TransportError};
pub use executor::{ExecutionContext, Executor};
pub use options::{DEFAULT_HANDLER_URL, DEFAULT_QUEUE, RoutingOptions, TaskOptions, TaskOptionsBuilder};
pub use overflow::RunFromStore;
pub use payload::{DecodedTask, DeferredTask, PAYLOAD_VERSION, Runnable, TaskRegistry, encode};
pub use remote::{AppEngineHttpRequest, QueueTask, QueueTransport, RemoteBackend};
pub use system::{SystemError, TaskSystem, TaskSystemBuilder};
