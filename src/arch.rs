//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates everything that differs
//! between 32-bit and 64-bit targets: which base relocation types are valid and how they patch
//! the image, and the machine code of the remote worker loop and its per-call thunks.

use std::fmt;

pub mod x86;
pub mod x86_64;

/// Layout of the control frame shared by the worker stub, the call thunks and the host side.
///
/// Header fields are 8-byte slots on both machines so the layout is identical; 32-bit code
/// reads the low dword. Argument slots are pointer-sized.
pub mod frame {
    pub const REQUEST_EVENT: u32 = 0x00;
    pub const DONE_EVENT: u32 = 0x08;
    pub const WAIT_ROUTINE: u32 = 0x10;
    pub const SIGNAL_ROUTINE: u32 = 0x18;
    pub const THUNK: u32 = 0x20;
    pub const RESULT: u32 = 0x28;
    pub const CALL_TARGET: u32 = 0x30;
    pub const SLOT_COUNT: u32 = 0x38;
    pub const SLOTS: u32 = 0x40;
    pub const SLOTS_SIZE: u32 = 0x80;
    pub const SIZE: u32 = SLOTS + SLOTS_SIZE;
}

/// Machine types the engine can map for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    X86,
    X64,
}

impl Machine {
    pub fn from_coff(machine: u16) -> Option<Self> {
        match machine {
            object::pe::IMAGE_FILE_MACHINE_I386 => Some(Machine::X86),
            object::pe::IMAGE_FILE_MACHINE_AMD64 => Some(Machine::X64),
            _ => None,
        }
    }

    pub fn is_64(self) -> bool {
        self == Machine::X64
    }

    pub fn pointer_size(self) -> usize {
        match self {
            Machine::X86 => 4,
            Machine::X64 => 8,
        }
    }

    /// Number of pointer-sized argument slots a single remote call can carry.
    pub fn max_slots(self) -> usize {
        frame::SLOTS_SIZE as usize / self.pointer_size()
    }

    pub fn backend(self) -> &'static dyn Architecture {
        match self {
            Machine::X86 => &x86::X86,
            Machine::X64 => &x86_64::X86_64,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::X86 => f.write_str("x86"),
            Machine::X64 => f.write_str("x86_64"),
        }
    }
}

/// How a remote call passes its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// Microsoft x64: rcx, rdx, r8, r9, then stack above 32 bytes of shadow space.
    Win64,
    /// Caller cleans the stack.
    Cdecl,
    /// Callee cleans the stack.
    Stdcall,
    /// First argument in ecx, callee cleans.
    Thiscall,
    /// First two arguments in ecx and edx, callee cleans.
    Fastcall,
}

/// Why a relocation could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationFault {
    Unsupported,
    OutOfBounds,
}

/// A target architecture (x86 or x86_64).
pub trait Architecture: Send + Sync {
    fn machine(&self) -> Machine;

    /// The convention a module entry point uses on this machine.
    fn default_convention(&self) -> CallingConvention;

    fn supports(&self, convention: CallingConvention) -> bool;

    /// Applies one base relocation.
    ///
    /// # Arguments
    /// * `kind` - The `IMAGE_REL_BASED_*` type of the entry.
    /// * `offset` - Offset of the patched field within `data` (its RVA).
    /// * `delta` - Actual base minus preferred base, two's complement.
    /// * `data` - The locally laid-out image.
    fn apply_relocation(
        &self,
        kind: u16,
        offset: usize,
        delta: u64,
        data: &mut [u8],
    ) -> Result<(), RelocationFault>;

    /// Machine code of the worker loop. Entered as a thread start routine with the control
    /// frame as its argument; never returns.
    fn worker_stub(&self) -> Vec<u8>;

    /// Machine code called by the worker loop for one request: loads `slots` argument slots
    /// from the frame per `convention`, calls the frame's target and returns with the result
    /// in the accumulator.
    fn call_thunk(&self, convention: CallingConvention, slots: usize) -> Vec<u8>;
}

fn patch<const N: usize>(
    data: &mut [u8],
    offset: usize,
    update: impl FnOnce([u8; N]) -> [u8; N],
) -> Result<(), RelocationFault> {
    let end = offset.checked_add(N).ok_or(RelocationFault::OutOfBounds)?;
    let field = data.get_mut(offset..end).ok_or(RelocationFault::OutOfBounds)?;
    let mut current = [0u8; N];
    current.copy_from_slice(field);
    field.copy_from_slice(&update(current));
    Ok(())
}

/// IMAGE_REL_BASED_HIGHLOW: 32-bit field gets the low 32 bits of the delta.
pub(crate) fn rel_highlow(data: &mut [u8], offset: usize, delta: u64) -> Result<(), RelocationFault> {
    patch::<4>(data, offset, |v| {
        u32::from_le_bytes(v).wrapping_add(delta as u32).to_le_bytes()
    })
}

/// IMAGE_REL_BASED_DIR64: 64-bit field gets the full delta.
pub(crate) fn rel_dir64(data: &mut [u8], offset: usize, delta: u64) -> Result<(), RelocationFault> {
    patch::<8>(data, offset, |v| u64::from_le_bytes(v).wrapping_add(delta).to_le_bytes())
}

/// IMAGE_REL_BASED_HIGH: 16-bit field holds the high half of a 32-bit address.
pub(crate) fn rel_high(data: &mut [u8], offset: usize, delta: u64) -> Result<(), RelocationFault> {
    patch::<2>(data, offset, |v| {
        let full = (u32::from(u16::from_le_bytes(v)) << 16).wrapping_add(delta as u32);
        ((full >> 16) as u16).to_le_bytes()
    })
}

/// IMAGE_REL_BASED_LOW: 16-bit field holds the low half of a 32-bit address.
pub(crate) fn rel_low(data: &mut [u8], offset: usize, delta: u64) -> Result<(), RelocationFault> {
    patch::<2>(data, offset, |v| {
        u16::from_le_bytes(v).wrapping_add(delta as u16).to_le_bytes()
    })
}

/// Emits a short backwards `jmp` to `target` at the end of `code`.
pub(crate) fn jmp_back(code: &mut Vec<u8>, target: usize) {
    let rel = target as isize - (code.len() as isize + 2);
    code.push(0xEB);
    code.push(rel as i8 as u8);
}
