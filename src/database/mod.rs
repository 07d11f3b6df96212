//! Database collaborators of the task subsystem.
//!
//! The task code never talks to a database driver. It needs two narrow
//! capabilities, each behind a trait so an ORM integration can provide them:
//!
//! - [`TransactionalHost`]: "is a transaction open on connection X?" and
//!   "run this after the outermost transaction on X commits".
//! - [`OverflowStore`]: create/read/delete blob rows for task payloads too
//!   large for the queue transport.
//!
//! [`Connections`] and [`MemoryOverflowStore`] are the in-process
//! implementations used by the emulator setup and the test suite.

pub mod connections;
pub mod overflow;

pub use connections::{Atomic, CommitCallback, Connections, DatabaseError, TransactionalHost};
pub use overflow::{MemoryOverflowStore, OverflowRecord, OverflowStore, RecordId, StoreError};

/// Alias of the connection every host provides.
pub const DEFAULT_CONNECTION: &str = "default";
