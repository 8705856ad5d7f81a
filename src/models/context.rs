//! Scratch-pad shared between the advices of one session.

use std::collections::BTreeMap;

use crate::models::value::{SerializableValue, Value};
use crate::{BandsawError, Result};

/// Key/value state that advices use to talk to each other.
///
/// Entries may hold any [`Value`], including tuples, errors and
/// self-describing objects; they travel with the session when it is saved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    attributes: BTreeMap<String, Value>,
}

impl Context {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Mutable access to an entry.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.attributes.get_mut(key)
    }

    /// Store an entry, returning the value it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(key.into(), value.into())
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Whether an entry exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// Append `item` to the list stored under `key`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` if `key` holds something other
    /// than a list.
    pub fn push(&mut self, key: &str, item: impl Into<Value>) -> Result<()> {
        let entry = self
            .attributes
            .entry(key.to_owned())
            .or_insert_with(|| Value::List(Vec::new()));
        match entry {
            Value::List(items) => {
                items.push(item.into());
                Ok(())
            }
            other => Err(BandsawError::IllegalState(format!(
                "context entry '{key}' is a {}, not a list",
                other.kind()
            ))),
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the context has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.attributes.iter()
    }
}

impl SerializableValue for Context {
    const TYPE_NAME: &'static str = "Context";
    const MODULE: &'static str = "bandsaw.context";

    fn serialized(&self) -> Value {
        Value::Map(self.attributes.clone())
    }

    fn deserialize(value: Value) -> Result<Self> {
        match value {
            Value::Map(attributes) => Ok(Self { attributes }),
            other => Err(BandsawError::Serialization(format!(
                "context must be a map, found {}",
                other.kind()
            ))),
        }
    }
}
