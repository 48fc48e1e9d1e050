//! Call-chain context.
//!
//! A [`Context`] is passed by value (cloned) down a call chain. It carries an
//! optional deadline and a set of values keyed by an opaque [`ContextKey`].
//! Deriving a child never mutates the parent, so a value attached deep in a
//! call chain is only visible to that chain.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Key under which a value is stored: the value's type plus an instance tag.
///
/// Two values of the same type only collide if they also share the instance
/// tag, so several owners (e.g. several databases) can attach values of the
/// same type side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey {
    type_id: TypeId,
    instance: u128,
}

impl ContextKey {
    fn of<V: Any>(instance: u128) -> Self {
        Self {
            type_id: TypeId::of::<V>(),
            instance,
        }
    }
}

#[derive(Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    values: Arc<HashMap<ContextKey, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    /// An empty context with no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// The instant after which operations run under this context are abandoned.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Derive a child that expires `timeout` from now (or earlier, if the
    /// parent already expires sooner).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child with the given deadline, never extending the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            values: Arc::clone(&self.values),
        }
    }

    /// Derive a child carrying `value` under its type.
    pub fn with_value<V: Any + Send + Sync>(&self, value: V) -> Self {
        self.with_keyed_value(0, value)
    }

    /// Derive a child carrying `value` under its type and `instance` tag.
    pub fn with_keyed_value<V: Any + Send + Sync>(&self, instance: u128, value: V) -> Self {
        let mut values = (*self.values).clone();
        values.insert(ContextKey::of::<V>(instance), Arc::new(value));
        Self {
            deadline: self.deadline,
            values: Arc::new(values),
        }
    }

    /// Look up a value stored with [`Context::with_value`].
    pub fn value<V: Any + Send + Sync>(&self) -> Option<&V> {
        self.keyed_value(0)
    }

    /// Look up a value stored with [`Context::with_keyed_value`].
    pub fn keyed_value<V: Any + Send + Sync>(&self, instance: u128) -> Option<&V> {
        self.values
            .get(&ContextKey::of::<V>(instance))
            .and_then(|v| v.downcast_ref::<V>())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("values", &self.values.len())
            .finish()
    }
}
