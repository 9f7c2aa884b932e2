//! Fixup engine.
//!
//! Rewrites a local `Layout` so it behaves as if the OS loader had placed it at its actual
//! base with its actual dependency set: base relocations, the `ImageBase` header field, and
//! import address table slots. The TLS and exception steps need the target, so this module
//! only prepares what they consume; the mapping session performs the remote calls.

use crate::arch::RelocationFault;
use crate::error::MapError;
use crate::image::ImageDescriptor;
use crate::layout::Layout;
use crate::symbol::ImportSymbol;
use crate::target::RemoteAddress;
use crate::utils::{read_u32, write_pointer};

/// Offset of `ImageBase` inside the optional header.
const IMAGE_BASE_OFFSET_32: usize = 28;
const IMAGE_BASE_OFFSET_64: usize = 24;

/// Applies every base relocation so `layout` is valid at `base`, and rewrites the header's
/// `ImageBase`. Returns the delta that was applied.
///
/// Every entry is checked even when the delta is zero, so an image carrying a relocation kind
/// the machine cannot apply is rejected wherever it lands.
pub fn relocate(
    module: &str,
    image: &ImageDescriptor,
    layout: &mut Layout,
    base: u64,
) -> Result<u64, MapError> {
    let delta = base.wrapping_sub(layout.base());

    let arch = image.machine.backend();
    let mut applied = 0usize;
    for (rva, kind) in image.relocations.iter() {
        arch.apply_relocation(kind, rva as usize, delta, layout.data_mut())
            .map_err(|fault| match fault {
                RelocationFault::Unsupported => MapError::UnsupportedRelocation {
                    module: module.to_string(),
                    kind,
                    rva,
                },
                RelocationFault::OutOfBounds => {
                    MapError::malformed(module, format!("relocation at {rva:#x} outside image"))
                }
            })?;
        applied += 1;
    }

    let width = image.machine.pointer_size();
    let field = image_base_offset(layout.data(), width)
        .ok_or_else(|| MapError::malformed(module, "optional header outside headers"))?;
    if !write_pointer(layout.data_mut(), field, width, base) {
        return Err(MapError::malformed(module, "optional header outside headers"));
    }

    layout.set_base(base);
    tracing::debug!(
        "relocated {} by {:#x} ({} fixups)",
        module,
        delta,
        applied
    );
    Ok(delta)
}

fn image_base_offset(headers: &[u8], width: usize) -> Option<usize> {
    let nt = read_u32(headers, 0x3C)? as usize;
    let optional = nt.checked_add(24)?;
    Some(optional + if width == 8 { IMAGE_BASE_OFFSET_64 } else { IMAGE_BASE_OFFSET_32 })
}

/// One resolved import address table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundImport {
    pub module: String,
    pub symbol: ImportSymbol,
    pub slot_rva: u32,
    pub address: RemoteAddress,
}

/// Resolves every import with `resolve` and writes the address into its IAT slot.
///
/// `resolve` receives the providing module's normalized name and the symbol; its errors abort
/// the binding unchanged.
pub fn bind_imports(
    module: &str,
    image: &ImageDescriptor,
    layout: &mut Layout,
    mut resolve: impl FnMut(&str, &ImportSymbol) -> Result<RemoteAddress, MapError>,
) -> Result<Vec<BoundImport>, MapError> {
    let width = image.machine.pointer_size();
    let mut bound = Vec::with_capacity(image.imports.slot_count());
    for provider in &image.imports.modules {
        for entry in &provider.entries {
            let address = resolve(&provider.name, &entry.symbol)?;
            if !write_pointer(layout.data_mut(), entry.slot_rva as usize, width, address.get()) {
                return Err(MapError::malformed(
                    module,
                    format!("import slot {:#x} outside image", entry.slot_rva),
                ));
            }
            tracing::trace!("{}!{} -> {}", provider.name, entry.symbol, address);
            bound.push(BoundImport {
                module: provider.name.clone(),
                symbol: entry.symbol.clone(),
                slot_rva: entry.slot_rva,
                address,
            });
        }
    }
    Ok(bound)
}

/// Initial contents of one thread's TLS block: the template as laid out (relocated), then the
/// zero fill.
pub fn tls_block(image: &ImageDescriptor, layout: &Layout) -> Option<Vec<u8>> {
    let tls = image.tls.as_ref()?;
    let start = tls.template_start as usize;
    let mut block = layout.data().get(start..start + tls.template_len())?.to_vec();
    block.resize(tls.block_len(), 0);
    Some(block)
}

/// Arguments of `RtlAddFunctionTable`: table address, entry count, base address.
pub fn function_table(image: &ImageDescriptor, base: RemoteAddress) -> Option<(RemoteAddress, u32)> {
    if image.exceptions.is_empty() {
        return None;
    }
    Some((
        base.offset(u64::from(image.exceptions.table_rva)),
        image.exceptions.functions.len() as u32,
    ))
}
