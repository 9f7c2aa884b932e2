//! Privileged bookkeeping requests.
//!
//! `Privileged` binds a `PrivilegedService` to one process and lifts its answers into
//! `MapError`, so a refusal surfaces as `PrivilegedOperationDenied` with the pid attached.

use crate::error::{MapError, TargetResultExt};
use crate::target::{PrivilegedService, RemoteHandle, RemoteRegion};

/// Privileged requests against a single process.
#[derive(Clone, Copy)]
pub struct Privileged<'p> {
    service: &'p dyn PrivilegedService,
    pid: u32,
}

impl<'p> Privileged<'p> {
    pub fn new(service: &'p dyn PrivilegedService, pid: u32) -> Self {
        Self { service, pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Detaches `region` from address-space enumeration. The memory stays allocated.
    pub fn hide(&self, region: RemoteRegion) -> Result<(), MapError> {
        tracing::debug!("hiding {}+{:#x} in pid {}", region.base(), region.size(), self.pid);
        self.service.hide_region(self.pid, region).in_pid(self.pid)
    }

    pub fn show(&self, region: RemoteRegion) -> Result<(), MapError> {
        tracing::debug!("restoring {}+{:#x} in pid {}", region.base(), region.size(), self.pid);
        self.service.show_region(self.pid, region).in_pid(self.pid)
    }

    pub fn grant_access(&self, handle: RemoteHandle, access: u32) -> Result<(), MapError> {
        tracing::debug!("granting {:#x} on handle {:#x} in pid {}", access, handle.0, self.pid);
        self.service.grant_access(self.pid, handle, access).in_pid(self.pid)
    }

    pub fn set_protection(&self, enabled: bool) -> Result<(), MapError> {
        tracing::debug!("setting protection of pid {} to {}", self.pid, enabled);
        self.service.set_protection(self.pid, enabled).in_pid(self.pid)
    }

    pub fn disable_dep(&self) -> Result<(), MapError> {
        tracing::debug!("disabling DEP for pid {}", self.pid);
        self.service.disable_dep(self.pid).in_pid(self.pid)
    }
}
