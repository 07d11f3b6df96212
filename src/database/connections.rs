//! Named connections with nested atomic blocks and post-commit hooks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

use super::DEFAULT_CONNECTION;
use crate::BoxFuture;

/// Work to run once the outermost transaction on a connection has committed.
pub type CommitCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("unknown database connection `{alias}`")]
    UnknownConnection { alias: String },
}

/// The transactional resource deferred tasks can be tied to.
pub trait TransactionalHost: Send + Sync {
    /// Every connection alias this host recognizes.
    fn aliases(&self) -> Vec<String>;

    fn contains(&self, alias: &str) -> bool {
        self.aliases().iter().any(|a| a == alias)
    }

    /// Returns `true` while an atomic block is open on `alias`.
    fn in_atomic_block(&self, alias: &str) -> bool;

    /// Schedule `callback` to run strictly after the outermost atomic block
    /// on `alias` commits. It is dropped unrun if that block rolls back.
    /// Outside any atomic block the callback starts right away.
    fn on_commit(&self, alias: &str, callback: CommitCallback);
}

#[derive(Default)]
struct ConnectionState {
    // Length of `pending` when each open (possibly nested) block began.
    savepoints: Vec<usize>,
    pending: Vec<CommitCallback>,
}

/// In-process [`TransactionalHost`].
///
/// Cloning is cheap; clones share the same connections.
///
/// ```
/// use rtask::database::{Connections, TransactionalHost};
///
/// # async fn demo() {
/// let connections = Connections::new(["replica"]);
/// assert!(connections.contains("default"));
///
/// let tx = connections.begin("default").unwrap();
/// assert!(connections.in_atomic_block("default"));
/// tx.commit().await;
/// assert!(!connections.in_atomic_block("default"));
/// # }
/// ```
#[derive(Clone)]
pub struct Connections {
    inner: Arc<Mutex<BTreeMap<String, ConnectionState>>>,
}

impl Default for Connections {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl Connections {
    /// Creates a host with the `default` connection plus `extra` aliases.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = BTreeMap::new();
        map.insert(DEFAULT_CONNECTION.to_owned(), ConnectionState::default());
        for alias in extra {
            map.entry(alias.into()).or_default();
        }
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ConnectionState>> {
        // A poisoned map only means a panic elsewhere mid-update; the
        // savepoint bookkeeping itself is always left consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens an atomic block on `alias`. Blocks nest; only the outermost
    /// commit releases the post-commit callbacks.
    ///
    /// Dropping the returned [`Atomic`] without committing rolls it back.
    pub fn begin(&self, alias: &str) -> Result<Atomic, DatabaseError> {
        let mut map = self.lock();
        let state = map
            .get_mut(alias)
            .ok_or_else(|| DatabaseError::UnknownConnection {
                alias: alias.to_owned(),
            })?;
        state.savepoints.push(state.pending.len());
        debug!(connection = alias, depth = state.savepoints.len(), "atomic block opened");

        Ok(Atomic {
            connections: self.clone(),
            alias: alias.to_owned(),
            finished: false,
        })
    }

    /// Closes the innermost block on `alias`, returning the callbacks that
    /// are now due (only non-empty when the outermost block committed).
    fn close(&self, alias: &str, commit: bool) -> Vec<CommitCallback> {
        let mut map = self.lock();
        let Some(state) = map.get_mut(alias) else {
            return Vec::new();
        };
        let Some(mark) = state.savepoints.pop() else {
            return Vec::new();
        };

        if !commit {
            let discarded = state.pending.len() - mark;
            state.pending.truncate(mark);
            debug!(connection = alias, discarded, "atomic block rolled back");
            return Vec::new();
        }

        if state.savepoints.is_empty() {
            debug!(connection = alias, callbacks = state.pending.len(), "transaction committed");
            std::mem::take(&mut state.pending)
        } else {
            Vec::new()
        }
    }
}

impl TransactionalHost for Connections {
    fn aliases(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn contains(&self, alias: &str) -> bool {
        self.lock().contains_key(alias)
    }

    fn in_atomic_block(&self, alias: &str) -> bool {
        self.lock()
            .get(alias)
            .is_some_and(|state| !state.savepoints.is_empty())
    }

    fn on_commit(&self, alias: &str, callback: CommitCallback) {
        {
            let mut map = self.lock();
            if let Some(state) = map.get_mut(alias) {
                if !state.savepoints.is_empty() {
                    state.pending.push(callback);
                    return;
                }
            }
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(callback());
            }
            Err(_) => warn!(
                connection = alias,
                "no Tokio runtime to run a post-commit callback outside a transaction; dropped"
            ),
        }
    }
}

/// An open atomic block. Finish it with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); dropping it rolls back.
#[must_use = "dropping an atomic block rolls it back"]
pub struct Atomic {
    connections: Connections,
    alias: String,
    finished: bool,
}

impl Atomic {
    /// Commits the block. If it is the outermost one, every callback
    /// registered inside it runs now, in registration order.
    pub async fn commit(mut self) {
        self.finished = true;
        let due = self.connections.close(&self.alias, true);
        for callback in due {
            callback().await;
        }
    }

    /// Rolls the block back, discarding the callbacks registered inside it.
    pub fn rollback(mut self) {
        self.finished = true;
        self.connections.close(&self.alias, false);
    }
}

impl Drop for Atomic {
    fn drop(&mut self) {
        if !self.finished {
            self.connections.close(&self.alias, false);
        }
    }
}
