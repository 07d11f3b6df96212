//! Wire form of deferred tasks.
//!
//! A payload is a versioned JSON envelope naming the task type and carrying
//! its fields:
//!
//! ```json
//! {"v":1,"type":"mail.SendReceipt","fields":{"order_id":42}}
//! ```
//!
//! Consumers can only decode types present in their [`TaskRegistry`], so
//! producer and consumer must run compatible builds.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{DecodeError, TaskError};
use super::executor::ExecutionContext;
use super::overflow::RunFromStore;
use crate::BoxFuture;

pub const PAYLOAD_VERSION: u32 = 1;

/// A unit of work that can run in a later request.
pub trait Runnable: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<(), TaskError>>;
}

/// A [`Runnable`] with a stable wire identity.
///
/// `TASK_TYPE` must stay the same across deployments for tasks already
/// sitting in a queue to remain runnable.
pub trait DeferredTask: Runnable + Serialize + DeserializeOwned + 'static {
    const TASK_TYPE: &'static str;
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    #[serde(rename = "type")]
    kind: String,
    fields: serde_json::Value,
}

/// Serializes `task` into a payload.
pub fn encode<T: DeferredTask>(task: &T) -> Result<Bytes, serde_json::Error> {
    let envelope = Envelope {
        v: PAYLOAD_VERSION,
        kind: T::TASK_TYPE.to_owned(),
        fields: serde_json::to_value(task)?,
    };
    serde_json::to_vec(&envelope).map(Bytes::from)
}

/// A payload turned back into something runnable.
pub struct DecodedTask {
    pub kind: String,
    pub task: Box<dyn Runnable>,
}

impl fmt::Debug for DecodedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedTask")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

type DecodeFn = fn(serde_json::Value) -> Result<Box<dyn Runnable>, serde_json::Error>;

fn decode_as<T: DeferredTask>(
    fields: serde_json::Value,
) -> Result<Box<dyn Runnable>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<T>(fields)?))
}

/// Task types this process knows how to run.
///
/// The overflow indirection is always registered.
pub struct TaskRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        registry.register::<RunFromStore>();
        registry
    }

    pub fn register<T: DeferredTask>(&mut self) -> &mut Self {
        self.decoders.insert(T::TASK_TYPE, decode_as::<T>);
        self
    }

    #[must_use]
    pub fn with<T: DeferredTask>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn decode(&self, payload: &[u8]) -> Result<DecodedTask, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(payload).map_err(DecodeError::Malformed)?;
        if envelope.v != PAYLOAD_VERSION {
            return Err(DecodeError::UnsupportedVersion { found: envelope.v });
        }

        let decode = self
            .decoders
            .get(envelope.kind.as_str())
            .ok_or_else(|| DecodeError::UnknownType(envelope.kind.clone()))?;
        let task = decode(envelope.fields).map_err(|source| DecodeError::InvalidFields {
            kind: envelope.kind.clone(),
            source,
        })?;

        Ok(DecodedTask {
            kind: envelope.kind,
            task,
        })
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("TaskRegistry").field("types", &kinds).finish()
    }
}
