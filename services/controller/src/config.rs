//! Configuration for the node labeler.
//!
//! Every flag can also be set through the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use nodelabel_reconcile::{DEFAULT_MAX_RETRIES, DEFAULT_SYNC_TIMEOUT};

use crate::controller::ControllerConfig;
use crate::predicate::{DEFAULT_LABEL, DEFAULT_LABEL_VALUE, DEFAULT_OS_IMAGE_PATTERN};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable lines.
    Text,
}

/// node-labeler - labels nodes whose OS image matches a pattern.
#[derive(Debug, Clone, Parser)]
#[command(name = "node-labeler")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long, env = "NODE_LABELER_MASTER")]
    pub master: Option<String>,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(
        long,
        env = "NODE_LABELER_WORKERS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub workers: u16,

    /// Retries before a failing node is dropped from the queue.
    #[arg(long, env = "NODE_LABELER_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Seconds to wait for the initial cache sync.
    #[arg(
        long,
        env = "NODE_LABELER_SYNC_TIMEOUT_SECS",
        default_value_t = DEFAULT_SYNC_TIMEOUT.as_secs()
    )]
    pub sync_timeout_secs: u64,

    /// Label set on matching nodes.
    #[arg(long, env = "NODE_LABELER_LABEL", default_value = DEFAULT_LABEL)]
    pub label: String,

    /// Value of the label.
    #[arg(long, env = "NODE_LABELER_LABEL_VALUE", default_value = DEFAULT_LABEL_VALUE)]
    pub label_value: String,

    /// Regex matched against the node OS image.
    #[arg(long, env = "NODE_LABELER_OS_IMAGE_PATTERN", default_value = DEFAULT_OS_IMAGE_PATTERN)]
    pub os_image_pattern: String,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "NODE_LABELER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "NODE_LABELER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    /// Controller settings derived from the flags.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: usize::from(self.workers),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            max_retries: self.max_retries,
            ..ControllerConfig::default()
        }
    }
}
