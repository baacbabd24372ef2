//! Remote store capability.
//!
//! The controller needs three things from the remote store: enumerate every
//! object, stream changes from a known version, and set a single label.
//! [`crate::client::KubeClient`] implements this against the Kubernetes API;
//! tests substitute a fake.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use thiserror::Error;

use crate::object::{ObjectList, WatchEvent};

/// Errors returned by a remote store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("request failed (status={status}): {body}")]
    Status { status: u16, body: String },

    /// The requested resource version is too old; a full relist is needed.
    #[error("resource version expired: {0}")]
    Gone(String),

    /// A response could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The watch stream reported an error.
    #[error("watch stream error: {0}")]
    Stream(String),
}

impl StoreError {
    /// Returns true if the watcher must relist before watching again.
    pub fn needs_relist(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

/// Stream of watch notifications.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send>>;

/// Remote object store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Enumerate every object.
    async fn list_all(&self) -> Result<ObjectList, StoreError>;

    /// Stream changes that happened after `resource_version`.
    async fn watch(&self, resource_version: Option<&str>) -> Result<WatchStream, StoreError>;

    /// Set label `label` to `value` on the object identified by `key`.
    async fn patch_label(&self, key: &str, label: &str, value: &str) -> Result<(), StoreError>;
}
