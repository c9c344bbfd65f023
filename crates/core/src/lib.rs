//! Skiff core types: function specs, manifests, outcomes, errors and the
//! cluster traits the reconciliation engine runs against.

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod manifest;
pub mod mock;
pub mod spec;

pub use client::{Cluster, InstanceSource, ResourceClient, WorkloadInstance};
pub use error::{ClientError, DeployError, SpecError};
pub use manifest::FunctionManifest;
pub use spec::{Event, EventSpec, FunctionSpec, ProviderDefaults, Quantity};

use serde::{Deserialize, Serialize};

/// Label every generated object carries to correlate workloads, services and
/// routing backends with the function that owns them.
pub const FUNCTION_LABEL: &str = "function";

/// Service port used by every function backend unless overridden.
pub const DEFAULT_PORT: u16 = 8080;

/// Default function timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 180;

/// Result of the decide+apply step for one function.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// No resource existed; it was created and rolled out.
    Created,
    /// Resource existed with a different spec and force was requested.
    Updated,
    /// Live spec already equals the target spec; nothing written.
    Unchanged,
    /// Resource exists with a different spec and force was not requested
    /// (or a concurrent create won the race). Nothing written.
    AlreadyExists,
}

impl Outcome {
    /// Whether the function now serves the target spec. Only these get
    /// routes planned from their declared events; the others keep their live routes.
    pub fn is_deployed(self) -> bool {
        !matches!(self, Outcome::AlreadyExists)
    }
}
