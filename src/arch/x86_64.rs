//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit Windows targets (PE32+).

use super::{frame, jmp_back, rel_dir64, rel_highlow, Architecture, CallingConvention, Machine, RelocationFault};
use crate::utils::align_up;
use object::pe::{IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW};

/// Argument registers in Win64 order, as `mov reg, [rbx+disp32]` prefixes.
const ARG_LOADS: [[u8; 3]; 4] = [
    [0x48, 0x8B, 0x8B], // mov rcx, [rbx+disp32]
    [0x48, 0x8B, 0x93], // mov rdx, [rbx+disp32]
    [0x4C, 0x8B, 0x83], // mov r8,  [rbx+disp32]
    [0x4C, 0x8B, 0x8B], // mov r9,  [rbx+disp32]
];

const SHADOW_SPACE: u64 = 0x20;

/// The x86_64 architecture backend.
pub struct X86_64;

impl Architecture for X86_64 {
    fn machine(&self) -> Machine {
        Machine::X64
    }

    fn default_convention(&self) -> CallingConvention {
        CallingConvention::Win64
    }

    fn supports(&self, _convention: CallingConvention) -> bool {
        // x64 compilers ignore cdecl/stdcall/thiscall/fastcall and use Win64 for all of them.
        true
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
            IMAGE_REL_BASED_DIR64 => rel_dir64(data, offset, delta),
            IMAGE_REL_BASED_HIGHLOW => rel_highlow(data, offset, delta),
            _ => Err(RelocationFault::Unsupported),
        }
    }

    fn worker_stub(&self) -> Vec<u8> {
        let mut code = Vec::with_capacity(48);
        code.push(0x53); // push rbx
        code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 0x20
        code.extend_from_slice(&[0x48, 0x89, 0xCB]); // mov rbx, rcx
        let top = code.len();
        code.extend_from_slice(&[0x48, 0x8B, 0x0B]); // mov rcx, [rbx+REQUEST_EVENT]
        code.extend_from_slice(&[0xBA, 0xFF, 0xFF, 0xFF, 0xFF]); // mov edx, INFINITE
        code.extend_from_slice(&[0xFF, 0x53, frame::WAIT_ROUTINE as u8]); // call [rbx+WAIT]
        code.extend_from_slice(&[0xFF, 0x53, frame::THUNK as u8]); // call [rbx+THUNK]
        code.extend_from_slice(&[0x48, 0x89, 0x43, frame::RESULT as u8]); // mov [rbx+RESULT], rax
        code.extend_from_slice(&[0x48, 0x8B, 0x4B, frame::DONE_EVENT as u8]); // mov rcx, [rbx+DONE]
        code.extend_from_slice(&[0xFF, 0x53, frame::SIGNAL_ROUTINE as u8]); // call [rbx+SIGNAL]
        jmp_back(&mut code, top);
        code
    }

    fn call_thunk(&self, _convention: CallingConvention, slots: usize) -> Vec<u8> {
        let stack_slots = slots.saturating_sub(ARG_LOADS.len()) as u64;
        // Entered with rsp = 8 mod 16; keep the call site 16-byte aligned.
        let reserve = (align_up(SHADOW_SPACE + 8 * stack_slots, 16) + 8) as u32;

        let mut code = Vec::new();
        code.extend_from_slice(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
        code.extend_from_slice(&reserve.to_le_bytes());

        for i in ARG_LOADS.len()..slots {
            let slot = frame::SLOTS + 8 * i as u32;
            let home = SHADOW_SPACE as u32 + 8 * (i - ARG_LOADS.len()) as u32;
            code.extend_from_slice(&[0x48, 0x8B, 0x83]); // mov rax, [rbx+slot]
            code.extend_from_slice(&slot.to_le_bytes());
            code.extend_from_slice(&[0x48, 0x89, 0x84, 0x24]); // mov [rsp+home], rax
            code.extend_from_slice(&home.to_le_bytes());
        }
        for (i, load) in ARG_LOADS.iter().enumerate().take(slots) {
            code.extend_from_slice(load);
            code.extend_from_slice(&(frame::SLOTS + 8 * i as u32).to_le_bytes());
        }

        code.extend_from_slice(&[0xFF, 0x93]); // call [rbx+CALL_TARGET]
        code.extend_from_slice(&frame::CALL_TARGET.to_le_bytes());
        code.extend_from_slice(&[0x48, 0x81, 0xC4]); // add rsp, imm32
        code.extend_from_slice(&reserve.to_le_bytes());
        code.push(0xC3); // ret
        code
    }
}
