//! Node labeling controller.
//!
//! Keeps a label on every node whose OS image matches a pattern. By default
//! nodes running Container Linux get `kubermatic.io/uses-container-linux=true`.
//!
//! ## Architecture
//!
//! ```text
//! RemoteStore ──list/watch──> Watcher ──upsert──> Store (cache)
//!                                │                   │
//!                                └──add key──> WorkQueue ──> Reconciler x N ──patch──> RemoteStore
//! ```
//!
//! The controller is level-triggered: workers look up the current cached
//! object for each key and never act on the notification that queued it.
//!
//! ## Modules
//!
//! - `object`: object model, keys and watch notifications
//! - `store`: the remote store capability and its errors
//! - `client`: Kubernetes API implementation of the remote store
//! - `predicate`: label rules
//! - `watcher`: keeps the cache and queue in step with the remote store
//! - `reconciler`: the worker loop
//! - `controller`: lifecycle and worker supervision

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod object;
pub mod predicate;
pub mod reconciler;
pub mod store;
pub mod watcher;

pub use client::{ClusterConfig, KubeClient};
pub use controller::{Controller, ControllerConfig, LifecycleState};
pub use error::{ControllerError, ReconcileError};
pub use object::{ChangeKind, KeyError, Labels, Object, ObjectList, WatchEvent};
pub use predicate::{ContainerLinuxPredicate, LabelPatch, Predicate};
pub use reconciler::{ErrorHandler, LogErrorHandler, Outcome, Reconciler};
pub use store::{RemoteStore, StoreError, WatchStream};
pub use watcher::Watcher;
