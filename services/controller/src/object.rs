//! Remote objects as the controller sees them.
//!
//! The controller core only cares about an object's key and labels. Everything
//! else lives in the opaque `state` blob, which only the predicate interprets.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label set of an object.
pub type Labels = BTreeMap<String, String>;

/// A key could not be derived for an object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The object has no name.
    #[error("object has no name (namespace: {namespace:?})")]
    MissingName { namespace: Option<String> },
}

/// A remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Object name, unique within its namespace.
    pub name: String,

    /// Namespace, absent for cluster-scoped objects such as nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Version of the object as reported by the remote store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Labels, the only field the controller patches.
    #[serde(default)]
    pub labels: Labels,

    /// Opaque state, interpreted by the predicate.
    #[serde(default)]
    pub state: serde_json::Value,
}

impl Object {
    /// Create a cluster-scoped object with no labels.
    pub fn new(name: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            resource_version: None,
            labels: Labels::new(),
            state,
        }
    }

    /// Builder: set a label.
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Builder: set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Builder: set the resource version.
    pub fn with_resource_version(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }

    /// Stable key: `namespace/name`, or just `name` when cluster-scoped.
    pub fn key(&self) -> Result<String, KeyError> {
        if self.name.is_empty() {
            return Err(KeyError::MissingName {
                namespace: self.namespace.clone(),
            });
        }

        match self.namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => Ok(format!("{namespace}/{}", self.name)),
            _ => Ok(self.name.clone()),
        }
    }
}

/// Split a key into its namespace (if any) and name.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, key),
    }
}

/// Kind of change carried by a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single notification from the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// An object was added, modified or deleted.
    Changed(ChangeKind, Object),

    /// No object changed; the stream is up to date as of this version.
    Bookmark(String),
}

/// Result of a full enumeration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList {
    /// Every object in the collection.
    pub items: Vec<Object>,

    /// Collection version to start watching from.
    pub resource_version: Option<String>,
}
