//! Runtime-variables store.
//!
//! # Responsibilities
//! - Hold the latest runtime-vars snapshot (a JSON object)
//! - Deliver `(old, new)` pairs to subscribers on every publish
//! - Unregister subscribers when their handle drops
//!
//! # Design Decisions
//! - Callbacks run synchronously on the publisher's thread; subscribers own
//!   their error handling and must never panic back into the publisher
//! - A handle is the only way to unsubscribe, so teardown order is explicit

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeVarsError {
    #[error("runtime vars payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("runtime vars payload is not a JSON object")]
    NotAnObject,
}

/// One immutable snapshot of runtime variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeVarsData {
    vars: serde_json::Map<String, Value>,
}

impl RuntimeVarsData {
    pub fn empty() -> Self {
        Self {
            vars: serde_json::Map::new(),
        }
    }

    pub fn from_json(input: &str) -> Result<Self, RuntimeVarsError> {
        let value: Value = serde_json::from_str(input)?;
        match value {
            Value::Object(vars) => Ok(Self { vars }),
            _ => Err(RuntimeVarsError::NotAnObject),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

type UpdateCallback =
    Box<dyn Fn(Option<&Arc<RuntimeVarsData>>, &Arc<RuntimeVarsData>) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    callbacks: Mutex<HashMap<u64, UpdateCallback>>,
}

/// Publish/subscribe cell over [`RuntimeVarsData`].
pub struct ObservableRuntimeVars {
    data: RwLock<Arc<RuntimeVarsData>>,
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
}

impl ObservableRuntimeVars {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Arc::new(RuntimeVarsData::empty())),
            subscribers: Arc::new(Subscribers::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> Arc<RuntimeVarsData> {
        Arc::clone(&self.data.read().expect("runtime vars lock poisoned"))
    }

    /// Register `callback` and immediately deliver the current snapshot as
    /// `(None, current)`. The returned handle unsubscribes on drop.
    pub fn subscribe_and_call<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Option<&Arc<RuntimeVarsData>>, &Arc<RuntimeVarsData>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        callback(None, &self.current());
        self.subscribers
            .callbacks
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, Box::new(callback));
        SubscriptionHandle {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Swap in a new snapshot and notify every subscriber with the
    /// `(old, new)` pair.
    pub fn publish(&self, new: RuntimeVarsData) {
        let new = Arc::new(new);
        let old = {
            let mut guard = self.data.write().expect("runtime vars lock poisoned");
            std::mem::replace(&mut *guard, Arc::clone(&new))
        };
        let callbacks = self
            .subscribers
            .callbacks
            .lock()
            .expect("subscriber lock poisoned");
        for callback in callbacks.values() {
            callback(Some(&old), &new);
        }
    }

    pub fn publish_json(&self, input: &str) -> Result<(), RuntimeVarsError> {
        let data = RuntimeVarsData::from_json(input)?;
        self.publish(data);
        Ok(())
    }
}

impl Default for ObservableRuntimeVars {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII subscription. Dropping it guarantees no further deliveries.
pub struct SubscriptionHandle {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .callbacks
                .lock()
                .expect("subscriber lock poisoned")
                .remove(&self.id);
        }
    }
}
