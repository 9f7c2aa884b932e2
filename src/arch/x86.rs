//! x86 Architecture backend.
//!
//! Implements the `Architecture` trait for 32-bit Windows targets (PE32), including the
//! register-passing conventions used by C++ member functions and `__fastcall`.

use super::{frame, jmp_back, rel_high, rel_highlow, rel_low, Architecture, CallingConvention, Machine, RelocationFault};
use object::pe::{
    IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_HIGH, IMAGE_REL_BASED_HIGHLOW, IMAGE_REL_BASED_LOW,
};

/// The x86 architecture backend.
pub struct X86;

impl X86 {
    fn register_slots(convention: CallingConvention) -> usize {
        match convention {
            CallingConvention::Thiscall => 1,
            CallingConvention::Fastcall => 2,
            _ => 0,
        }
    }
}

impl Architecture for X86 {
    fn machine(&self) -> Machine {
        Machine::X86
    }

    fn default_convention(&self) -> CallingConvention {
        CallingConvention::Stdcall
    }

    fn supports(&self, convention: CallingConvention) -> bool {
        convention != CallingConvention::Win64
    }

    fn apply_relocation(
        &self,
        kind: u16,
        offset: usize,
        delta: u64,
        data: &mut [u8],
    ) -> Result<(), RelocationFault> {
        match kind {
            IMAGE_REL_BASED_ABSOLUTE => Ok(()),
            IMAGE_REL_BASED_HIGH => rel_high(data, offset, delta),
            IMAGE_REL_BASED_LOW => rel_low(data, offset, delta),
            IMAGE_REL_BASED_HIGHLOW => rel_highlow(data, offset, delta),
            _ => Err(RelocationFault::Unsupported),
        }
    }

    fn worker_stub(&self) -> Vec<u8> {
        let mut code = Vec::with_capacity(40);
        code.push(0x53); // push ebx
        code.extend_from_slice(&[0x8B, 0x5C, 0x24, 0x08]); // mov ebx, [esp+8]
        let top = code.len();
        code.extend_from_slice(&[0x6A, 0xFF]); // push INFINITE
        code.extend_from_slice(&[0xFF, 0x33]); // push [ebx+REQUEST_EVENT]
        code.extend_from_slice(&[0xFF, 0x53, frame::WAIT_ROUTINE as u8]); // call [ebx+WAIT]
        code.extend_from_slice(&[0xFF, 0x53, frame::THUNK as u8]); // call [ebx+THUNK]
        code.extend_from_slice(&[0x89, 0x43, frame::RESULT as u8]); // mov [ebx+RESULT], eax
        code.extend_from_slice(&[0x89, 0x53, frame::RESULT as u8 + 4]); // mov [ebx+RESULT+4], edx
        code.extend_from_slice(&[0xFF, 0x73, frame::DONE_EVENT as u8]); // push [ebx+DONE]
        code.extend_from_slice(&[0xFF, 0x53, frame::SIGNAL_ROUTINE as u8]); // call [ebx+SIGNAL]
        jmp_back(&mut code, top);
        code
    }

    fn call_thunk(&self, convention: CallingConvention, slots: usize) -> Vec<u8> {
        let in_registers = Self::register_slots(convention).min(slots);

        let mut code = Vec::new();
        code.push(0x56); // push esi
        code.extend_from_slice(&[0x8B, 0xF4]); // mov esi, esp
        for i in (in_registers..slots).rev() {
            code.extend_from_slice(&[0xFF, 0xB3]); // push [ebx+slot]
            code.extend_from_slice(&(frame::SLOTS + 4 * i as u32).to_le_bytes());
        }
        if in_registers >= 1 {
            code.extend_from_slice(&[0x8B, 0x8B]); // mov ecx, [ebx+slot0]
            code.extend_from_slice(&frame::SLOTS.to_le_bytes());
        }
        if in_registers >= 2 {
            code.extend_from_slice(&[0x8B, 0x93]); // mov edx, [ebx+slot1]
            code.extend_from_slice(&(frame::SLOTS + 4).to_le_bytes());
        }
        code.extend_from_slice(&[0xFF, 0x93]); // call [ebx+CALL_TARGET]
        code.extend_from_slice(&frame::CALL_TARGET.to_le_bytes());
        // Restoring esp covers both caller- and callee-cleaned conventions.
        code.extend_from_slice(&[0x8B, 0xE6]); // mov esp, esi
        code.push(0x5E); // pop esi
        code.push(0xC3); // ret
        code
    }
}
