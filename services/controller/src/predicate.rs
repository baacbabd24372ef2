//! Domain predicate deciding which label an object should carry.
//!
//! A predicate is a pure function of an object's state and labels. It must
//! not perform I/O or retry; the worker loop owns both.

use regex::Regex;
use serde_json::Value;

use crate::object::Labels;

/// Default label set on matching nodes.
pub const DEFAULT_LABEL: &str = "kubermatic.io/uses-container-linux";

/// Default value of the label.
pub const DEFAULT_LABEL_VALUE: &str = "true";

/// Default pattern matched against the node OS image.
pub const DEFAULT_OS_IMAGE_PATTERN: &str = "Container Linux by CoreOS";

/// A single label assignment to apply to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPatch {
    pub label: String,
    pub value: String,
}

/// Decides whether an object needs a label patch.
pub trait Predicate: Send + Sync {
    /// Returns the patch to apply, or `None` if the object is already in the
    /// desired state or not subject to the rule.
    fn needs_patch(&self, state: &Value, labels: &Labels) -> Option<LabelPatch>;
}

impl<F> Predicate for F
where
    F: Fn(&Value, &Labels) -> Option<LabelPatch> + Send + Sync,
{
    fn needs_patch(&self, state: &Value, labels: &Labels) -> Option<LabelPatch> {
        self(state, labels)
    }
}

/// Labels nodes whose OS image matches a pattern.
#[derive(Debug, Clone)]
pub struct ContainerLinuxPredicate {
    pattern: Regex,
    label: String,
    value: String,
}

impl ContainerLinuxPredicate {
    /// Create a predicate from a regex pattern and the label to set.
    pub fn new(
        pattern: &str,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            label: label.into(),
            value: value.into(),
        })
    }

    /// The default rule: label Container Linux nodes with `kubermatic.io/uses-container-linux=true`.
    pub fn container_linux() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_OS_IMAGE_PATTERN, DEFAULT_LABEL, DEFAULT_LABEL_VALUE)
    }

    /// Label this predicate manages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// OS image carried by the state.
    ///
    /// Accepts either a node status (`nodeInfo.osImage`) or a bare string.
    fn os_image(state: &Value) -> Option<&str> {
        match state {
            Value::String(image) => Some(image),
            _ => state.pointer("/nodeInfo/osImage").and_then(Value::as_str),
        }
    }
}

impl Predicate for ContainerLinuxPredicate {
    fn needs_patch(&self, state: &Value, labels: &Labels) -> Option<LabelPatch> {
        let image = Self::os_image(state)?;
        if !self.pattern.is_match(image) {
            return None;
        }

        if labels.get(&self.label) == Some(&self.value) {
            return None;
        }

        Some(LabelPatch {
            label: self.label.clone(),
            value: self.value.clone(),
        })
    }
}
