//! Target process collaborators.
//!
//! The engine never touches OS handles. Everything it needs from the target process goes
//! through the traits in this module: raw memory access, module/thread enumeration, thread and
//! event primitives, and the privileged bookkeeping service. A backend for a live OS
//! implements these; the test suite implements them over an in-memory fake.

use std::fmt;
use std::time::Duration;

use crate::arch::Machine;
use crate::error::{MapError, TargetError};
use crate::symbol::ExportDirectory;

/// An address inside the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RemoteAddress(pub u64);

impl RemoteAddress {
    pub const NULL: RemoteAddress = RemoteAddress(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, by: u64) -> RemoteAddress {
        RemoteAddress(self.0.wrapping_add(by))
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A contiguous allocation in the target. Accesses into it are bounds-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    base: RemoteAddress,
    size: usize,
}

impl RemoteRegion {
    pub fn new(base: RemoteAddress, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> RemoteAddress {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> RemoteAddress {
        self.base.offset(self.size as u64)
    }

    pub fn contains(&self, address: RemoteAddress) -> bool {
        address >= self.base && address < self.end()
    }

    /// Address of `offset` inside the region, checked so `len` bytes starting there fit.
    pub fn at(&self, offset: u64, len: usize) -> Result<RemoteAddress, MapError> {
        let fits = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.size as u64);
        if !fits {
            return Err(MapError::OutOfBounds {
                address: self.base.offset(offset),
                len,
                region_base: self.base,
                region_size: self.size,
            });
        }
        Ok(self.base.offset(offset))
    }

    /// Sub-region starting at `offset`.
    pub fn slice(&self, offset: u64, len: usize) -> Result<RemoteRegion, MapError> {
        Ok(RemoteRegion::new(self.at(offset, len)?, len))
    }
}

/// Page protection requested from the memory collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
}

impl Protection {
    /// Derives the protection a section should receive from its characteristics.
    pub fn from_characteristics(characteristics: u32) -> Self {
        use object::pe::{IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE};
        let r = characteristics & IMAGE_SCN_MEM_READ != 0;
        let w = characteristics & IMAGE_SCN_MEM_WRITE != 0;
        let x = characteristics & IMAGE_SCN_MEM_EXECUTE != 0;
        match (x, w, r) {
            (true, true, _) => Protection::ExecuteReadWrite,
            (true, false, true) => Protection::ExecuteRead,
            (true, false, false) => Protection::Execute,
            (false, true, _) => Protection::ReadWrite,
            (false, false, true) => Protection::ReadOnly,
            (false, false, false) => Protection::NoAccess,
        }
    }

    /// The Windows `PAGE_*` constant for this protection.
    pub fn page_flags(self) -> u32 {
        match self {
            Protection::NoAccess => 0x01,
            Protection::ReadOnly => 0x02,
            Protection::ReadWrite => 0x04,
            Protection::Execute => 0x10,
            Protection::ExecuteRead => 0x20,
            Protection::ExecuteReadWrite => 0x40,
        }
    }
}

/// A kernel object handle valid inside the target (event, thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteHandle(pub u64);

/// A module the target's own loader already knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    pub base: RemoteAddress,
    pub size: usize,
    pub machine: Machine,
}

/// A thread of the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: u32,
    /// Creation time in 100ns ticks.
    pub start_time: u64,
    /// Accumulated kernel + user time in 100ns ticks.
    pub exec_time: u64,
}

/// Raw memory access.
pub trait RemoteMemory {
    fn read(&self, address: RemoteAddress, len: usize) -> Result<Vec<u8>, TargetError>;

    fn write(&self, address: RemoteAddress, bytes: &[u8]) -> Result<(), TargetError>;

    /// Allocates at least `size` bytes, at exactly `preferred` when given.
    fn allocate(
        &self,
        size: usize,
        preferred: Option<RemoteAddress>,
        protection: Protection,
    ) -> Result<RemoteAddress, TargetError>;

    fn free(&self, address: RemoteAddress) -> Result<(), TargetError>;

    /// Changes protection and returns the previous one.
    fn protect(
        &self,
        address: RemoteAddress,
        len: usize,
        protection: Protection,
    ) -> Result<Protection, TargetError>;
}

/// Module and loader-state enumeration.
pub trait ModuleEnumerator {
    fn modules(&self) -> Result<Vec<LoadedModule>, TargetError>;

    fn exports(&self, module: &LoadedModule) -> Result<ExportDirectory, TargetError>;

    /// Address of the process environment block of the target's native bitness.
    fn peb_address(&self) -> Result<RemoteAddress, TargetError>;
}

/// Thread creation and the event primitives a worker parks on.
///
/// Events are auto-reset: a successful wait consumes the signal.
pub trait ThreadControl {
    fn create_thread(&self, entry: RemoteAddress, argument: RemoteAddress)
        -> Result<u32, TargetError>;

    fn terminate_thread(&self, id: u32) -> Result<(), TargetError>;

    fn threads(&self) -> Result<Vec<ThreadInfo>, TargetError>;

    fn create_event(&self) -> Result<RemoteHandle, TargetError>;

    fn close_event(&self, event: RemoteHandle) -> Result<(), TargetError>;

    fn signal_event(&self, event: RemoteHandle) -> Result<(), TargetError>;

    /// Returns `false` when the timeout elapsed before the event was signaled.
    fn wait_event(&self, event: RemoteHandle, timeout: Duration) -> Result<bool, TargetError>;
}

/// A process the engine can map into.
pub trait Target: RemoteMemory + ModuleEnumerator + ThreadControl + Send + Sync {
    fn pid(&self) -> u32;

    fn machine(&self) -> Machine;
}

/// Out-of-ring service that edits address-space and handle bookkeeping.
pub trait PrivilegedService {
    /// Detaches the region from generic memory enumeration without freeing it.
    fn hide_region(&self, pid: u32, region: RemoteRegion) -> Result<(), TargetError>;

    fn show_region(&self, pid: u32, region: RemoteRegion) -> Result<(), TargetError>;

    fn grant_access(&self, pid: u32, handle: RemoteHandle, access: u32)
        -> Result<(), TargetError>;

    fn set_protection(&self, pid: u32, enabled: bool) -> Result<(), TargetError>;

    /// Turns off data execution prevention; no effect on native 64-bit processes.
    fn disable_dep(&self, pid: u32) -> Result<(), TargetError>;
}
