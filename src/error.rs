//! Error types.
//!
//! `MapError` is returned by every parsing, mapping and remote-call operation. Collaborators
//! (memory, enumeration, threads, privileged service) report failures as `TargetError`, which
//! the engine wraps together with the process and module it was working on.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::target::RemoteAddress;

/// Failure reported by a target-process collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// The collaborator refused the request (access denied, privilege missing).
    #[error("{operation} was denied")]
    Denied { operation: &'static str },

    /// The request was attempted and failed.
    #[error("{operation} failed: {reason}")]
    Failed {
        operation: &'static str,
        reason: String,
    },
}

impl TargetError {
    pub fn failed(operation: &'static str, reason: impl Into<String>) -> Self {
        TargetError::Failed {
            operation,
            reason: reason.into(),
        }
    }
}

/// Module names from the root of a mapping request down to the module that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyChain(pub Vec<String>);

impl fmt::Display for DependencyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        f.write_str(&self.0.join(" -> "))
    }
}

/// Every failure the mapping engine can surface.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("malformed image {module}: {reason}")]
    MalformedImage { module: String, reason: String },

    #[error("unsupported architecture in {module}: image is {found}, target is {expected}")]
    UnsupportedArchitecture {
        module: String,
        found: String,
        expected: String,
    },

    #[error("{module} cannot be relocated and its preferred base {preferred} is unavailable in pid {pid}")]
    UnrelocatableImage {
        module: String,
        preferred: RemoteAddress,
        pid: u32,
    },

    #[error("unsupported relocation type {kind} at rva {rva:#x} in {module}")]
    UnsupportedRelocation { module: String, kind: u16, rva: u32 },

    #[error("unresolved symbol {symbol} in {provider} (chain: {chain})")]
    UnresolvedSymbol {
        symbol: String,
        provider: String,
        chain: DependencyChain,
    },

    #[error("failed to allocate {size:#x} bytes for {module} in pid {pid}")]
    RemoteAllocationFailed {
        module: String,
        size: usize,
        pid: u32,
        #[source]
        source: TargetError,
    },

    #[error("remote call to {target} in pid {pid} timed out after {timeout:?}")]
    RemoteCallTimeout {
        target: RemoteAddress,
        pid: u32,
        timeout: Duration,
    },

    #[error("privileged operation {operation} denied for pid {pid}")]
    PrivilegedOperationDenied { operation: &'static str, pid: u32 },

    #[error("{module} already loaded in pid {pid} is incompatible: {reason}")]
    IncompatibleModule {
        module: String,
        pid: u32,
        reason: String,
    },

    #[error("dependency {module} could not be found (chain: {chain})")]
    ModuleNotFound {
        module: String,
        chain: DependencyChain,
    },

    #[error("initialization of {module} failed: {reason}")]
    InitializationFailed { module: String, reason: String },

    #[error("invalid remote call: {reason}")]
    InvalidCall { reason: String },

    #[error("access of {len:#x} bytes at {address} is outside region {region_base}+{region_size:#x}")]
    OutOfBounds {
        address: RemoteAddress,
        len: usize,
        region_base: RemoteAddress,
        region_size: usize,
    },

    #[error("pid {pid}")]
    Target {
        pid: u32,
        #[source]
        source: TargetError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MapError {
    pub fn malformed(module: &str, reason: impl fmt::Display) -> Self {
        MapError::MalformedImage {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Lifts a collaborator failure, turning a denial into `PrivilegedOperationDenied`.
    pub fn from_target(pid: u32, source: TargetError) -> Self {
        match source {
            TargetError::Denied { operation } => {
                MapError::PrivilegedOperationDenied { operation, pid }
            }
            source => MapError::Target { pid, source },
        }
    }

    /// Whether the caller may reasonably issue the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MapError::RemoteCallTimeout { .. })
    }
}

/// Extension for attaching a pid to collaborator results.
pub trait TargetResultExt<T> {
    fn in_pid(self, pid: u32) -> Result<T, MapError>;
}

impl<T> TargetResultExt<T> for Result<T, TargetError> {
    fn in_pid(self, pid: u32) -> Result<T, MapError> {
        self.map_err(|e| MapError::from_target(pid, e))
    }
}
