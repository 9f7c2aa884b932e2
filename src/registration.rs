//! Loader registration.
//!
//! Links a mapped module into the target's own loader bookkeeping: a loader data table entry
//! is allocated in the target and appended to the three module lists hanging off
//! `PEB.Ldr` (load order, memory order, initialization order), so enumeration through the
//! loader sees the module. Unlinking reverses that.

use crate::arch::Machine;
use crate::error::{MapError, TargetError, TargetResultExt};
use crate::target::{Protection, RemoteAddress, Target};
use crate::utils::{read_pointer, read_u16, utf16z, write_pointer};

/// `LDRP_IMAGE_DLL | LDRP_ENTRY_PROCESSED`.
const ENTRY_FLAGS: u32 = 0x0000_4004;

/// Field offsets of `PEB_LDR_DATA` and `LDR_DATA_TABLE_ENTRY` for one bitness.
#[derive(Debug, Clone, Copy)]
struct LdrLayout {
    width: usize,
    peb_ldr: u64,
    /// List heads inside `PEB_LDR_DATA`, in link order.
    heads: [u64; 3],
    /// Links inside the entry, matching `heads`.
    links: [u64; 3],
    dll_base: usize,
    entry_point: usize,
    size_of_image: usize,
    full_name: usize,
    base_name: usize,
    flags: usize,
    load_count: usize,
    entry_size: usize,
}

impl LdrLayout {
    fn for_machine(machine: Machine) -> Self {
        match machine {
            Machine::X64 => LdrLayout {
                width: 8,
                peb_ldr: 0x18,
                heads: [0x10, 0x20, 0x30],
                links: [0x00, 0x10, 0x20],
                dll_base: 0x30,
                entry_point: 0x38,
                size_of_image: 0x40,
                full_name: 0x48,
                base_name: 0x58,
                flags: 0x68,
                load_count: 0x6C,
                entry_size: 0x120,
            },
            Machine::X86 => LdrLayout {
                width: 4,
                peb_ldr: 0x0C,
                heads: [0x0C, 0x14, 0x1C],
                links: [0x00, 0x08, 0x10],
                dll_base: 0x18,
                entry_point: 0x1C,
                size_of_image: 0x20,
                full_name: 0x24,
                base_name: 0x2C,
                flags: 0x34,
                load_count: 0x38,
                entry_size: 0xA8,
            },
        }
    }

    /// `UNICODE_STRING` is `{ u16 Length; u16 MaximumLength; PWSTR Buffer }`, pointer aligned.
    fn write_unicode(&self, entry: &mut [u8], at: usize, len: usize, buffer: u64) {
        let length = (len - 2) as u16;
        entry[at..at + 2].copy_from_slice(&length.to_le_bytes());
        entry[at + 2..at + 4].copy_from_slice(&(len as u16).to_le_bytes());
        write_pointer(entry, at + self.width, self.width, buffer);
    }
}

/// What the loader entry describes.
#[derive(Debug, Clone)]
pub struct ModuleRecord<'a> {
    pub base_name: &'a str,
    pub full_name: &'a str,
    pub base: RemoteAddress,
    pub size: usize,
    pub entry_point: RemoteAddress,
}

fn read_ptr(target: &dyn Target, address: RemoteAddress, width: usize) -> Result<RemoteAddress, MapError> {
    let pid = target.pid();
    let bytes = target.read(address, width).in_pid(pid)?;
    read_pointer(&bytes, 0, width)
        .map(RemoteAddress)
        .ok_or_else(|| MapError::Target {
            pid,
            source: TargetError::failed("read", format!("short read of {width} bytes at {address}")),
        })
}

fn write_ptr(target: &dyn Target, address: RemoteAddress, width: usize, value: RemoteAddress) -> Result<(), MapError> {
    let bytes = value.get().to_le_bytes();
    target.write(address, &bytes[..width]).in_pid(target.pid())
}

/// Allocates a loader entry for `record` and appends it to every loader list.
/// Returns the entry's address.
pub fn link_module(target: &dyn Target, record: &ModuleRecord<'_>) -> Result<RemoteAddress, MapError> {
    let pid = target.pid();
    let layout = LdrLayout::for_machine(target.machine());
    let peb = target.peb_address().in_pid(pid)?;
    let ldr = read_ptr(target, peb.offset(layout.peb_ldr), layout.width)?;
    if ldr.is_null() {
        return Err(MapError::InitializationFailed {
            module: record.base_name.to_string(),
            reason: format!("loader data of pid {pid} is not initialized"),
        });
    }

    let full = utf16z(record.full_name);
    let base_name = utf16z(record.base_name);
    let total = layout.entry_size + full.len() + base_name.len();
    let entry = target
        .allocate(total, None, Protection::ReadWrite)
        .map_err(|source| MapError::RemoteAllocationFailed {
            module: record.base_name.to_string(),
            size: total,
            pid,
            source,
        })?;

    let result = fill_and_link(target, &layout, ldr, entry, record, &full, &base_name);
    if let Err(e) = result {
        if let Err(free) = target.free(entry) {
            tracing::warn!("failed to free loader entry {}: {}", entry, free);
        }
        return Err(e);
    }
    tracing::debug!(
        "registered {} at {} with loader entry {}",
        record.base_name,
        record.base,
        entry
    );
    Ok(entry)
}

fn fill_and_link(
    target: &dyn Target,
    layout: &LdrLayout,
    ldr: RemoteAddress,
    entry: RemoteAddress,
    record: &ModuleRecord<'_>,
    full: &[u8],
    base_name: &[u8],
) -> Result<(), MapError> {
    let w = layout.width;
    let full_at = entry.offset(layout.entry_size as u64);
    let base_at = full_at.offset(full.len() as u64);

    let mut bytes = vec![0u8; layout.entry_size];
    write_pointer(&mut bytes, layout.dll_base, w, record.base.get());
    write_pointer(&mut bytes, layout.entry_point, w, record.entry_point.get());
    write_pointer(&mut bytes, layout.size_of_image, w, record.size as u64);
    layout.write_unicode(&mut bytes, layout.full_name, full.len(), full_at.get());
    layout.write_unicode(&mut bytes, layout.base_name, base_name.len(), base_at.get());
    bytes[layout.flags..layout.flags + 4].copy_from_slice(&ENTRY_FLAGS.to_le_bytes());
    bytes[layout.load_count..layout.load_count + 2].copy_from_slice(&u16::MAX.to_le_bytes());

    // Tail insert: entry.Flink = head, entry.Blink = tail.
    let mut tails = [RemoteAddress::NULL; 3];
    for (i, (&head, &link)) in layout.heads.iter().zip(&layout.links).enumerate() {
        let head = ldr.offset(head);
        let tail = read_ptr(target, head.offset(w as u64), w)?;
        tails[i] = tail;
        write_pointer(&mut bytes, link as usize, w, head.get());
        write_pointer(&mut bytes, link as usize + w, w, tail.get());
    }

    let mut image = bytes;
    image.extend_from_slice(full);
    image.extend_from_slice(base_name);
    target.write(entry, &image).in_pid(target.pid())?;

    for (i, (&head, &link)) in layout.heads.iter().zip(&layout.links).enumerate() {
        let head = ldr.offset(head);
        let node = entry.offset(link);
        write_ptr(target, tails[i], w, node)?;
        write_ptr(target, head.offset(w as u64), w, node)?;
    }
    Ok(())
}

/// Removes a loader entry from every list and frees it.
pub fn unlink_module(target: &dyn Target, entry: RemoteAddress) -> Result<(), MapError> {
    let layout = LdrLayout::for_machine(target.machine());
    let w = layout.width;
    for &link in &layout.links {
        let node = entry.offset(link);
        let flink = read_ptr(target, node, w)?;
        let blink = read_ptr(target, node.offset(w as u64), w)?;
        write_ptr(target, blink, w, flink)?;
        write_ptr(target, flink.offset(w as u64), w, blink)?;
    }
    target.free(entry).in_pid(target.pid())?;
    tracing::debug!("unlinked loader entry {}", entry);
    Ok(())
}

/// Walks the load-order list and returns `(DllBase, BaseDllName)` for every entry.
pub fn loader_modules(target: &dyn Target) -> Result<Vec<(RemoteAddress, String)>, MapError> {
    let pid = target.pid();
    let layout = LdrLayout::for_machine(target.machine());
    let w = layout.width;
    let peb = target.peb_address().in_pid(pid)?;
    let ldr = read_ptr(target, peb.offset(layout.peb_ldr), w)?;
    let head = ldr.offset(layout.heads[0]);

    let mut modules = Vec::new();
    let mut node = read_ptr(target, head, w)?;
    while node != head && !node.is_null() {
        // Load-order links sit at offset zero, so the node is the entry.
        let bytes = target.read(node, layout.entry_size).in_pid(pid)?;
        let base = read_pointer(&bytes, layout.dll_base, w).unwrap_or(0);
        let len = read_u16(&bytes, layout.base_name).unwrap_or(0) as usize;
        let buffer = read_pointer(&bytes, layout.base_name + w, w).unwrap_or(0);
        let raw = target.read(RemoteAddress(buffer), len).in_pid(pid)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        modules.push((RemoteAddress(base), String::from_utf16_lossy(&units)));
        node = read_ptr(target, node, w)?;
        if modules.len() > 4096 {
            return Err(MapError::Target {
                pid,
                source: TargetError::failed("loader list walk", "list does not terminate"),
            });
        }
    }
    Ok(modules)
}
