//! Layout management.
//!
//! Plans where an image lives: the local flat copy the fixup engine patches, the remote
//! reservation that copy is written into, and the page protections each range receives once
//! the bytes are in place.

use crate::error::{MapError, TargetResultExt};
use crate::image::{ImageDescriptor, PAGE_SIZE};
use crate::target::{Protection, RemoteAddress, RemoteRegion, Target};
use crate::utils::align_up;

/// A fully laid-out local copy of an image: headers and every section's raw data placed at
/// their RVAs, zero everywhere else.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Address the contents are currently fixed up for.
    base: u64,
    data: Vec<u8>,
}

impl Layout {
    /// Lays out `image` for its preferred base.
    pub fn new(image: &ImageDescriptor) -> Self {
        let mut data = vec![0u8; image.span()];
        data[..image.headers.len()].copy_from_slice(&image.headers);
        for section in &image.sections {
            let start = section.virtual_address as usize;
            data[start..start + section.data.len()].copy_from_slice(&section.data);
        }
        Self {
            base: image.preferred_base,
            data,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub(crate) fn set_base(&mut self, base: u64) {
        self.base = base;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The flat mapped view, as it appears in the target.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Reserves remote memory for `image`.
///
/// Relocatable images go wherever the allocator puts them, falling back to the preferred base
/// when that fails. Images whose relocations were stripped must land exactly on their
/// preferred base.
pub fn reserve(target: &dyn Target, module: &str, image: &ImageDescriptor) -> Result<RemoteRegion, MapError> {
    let span = image.span();
    let preferred = RemoteAddress(image.preferred_base);
    let pid = target.pid();

    if image.requires_fixed_base() {
        return match target.allocate(span, Some(preferred), Protection::ExecuteReadWrite) {
            Ok(base) if base == preferred => Ok(RemoteRegion::new(base, span)),
            Ok(base) => {
                target.free(base).in_pid(pid)?;
                Err(MapError::UnrelocatableImage {
                    module: module.to_string(),
                    preferred,
                    pid,
                })
            }
            Err(e) => {
                tracing::debug!("fixed-base allocation for {} failed: {}", module, e);
                Err(MapError::UnrelocatableImage {
                    module: module.to_string(),
                    preferred,
                    pid,
                })
            }
        };
    }

    let first = match target.allocate(span, None, Protection::ExecuteReadWrite) {
        Ok(base) => {
            tracing::debug!("reserved {:#x} bytes for {} at {}", span, module, base);
            return Ok(RemoteRegion::new(base, span));
        }
        Err(e) => e,
    };
    tracing::warn!(
        "allocation of {:#x} bytes for {} failed ({}), retrying at preferred base {}",
        span,
        module,
        first,
        preferred
    );
    match target.allocate(span, Some(preferred), Protection::ExecuteReadWrite) {
        Ok(base) => Ok(RemoteRegion::new(base, span)),
        Err(_) => Err(MapError::RemoteAllocationFailed {
            module: module.to_string(),
            size: span,
            pid,
            source: first,
        }),
    }
}

/// A range of the mapped image and the protection it should end up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedRange {
    pub rva: u32,
    pub len: usize,
    pub protection: Protection,
}

/// Final page protections: read-only headers, then each section per its characteristics.
pub fn section_protections(image: &ImageDescriptor) -> Vec<ProtectedRange> {
    let alignment = u64::from(image.section_alignment).max(PAGE_SIZE);
    let span = image.span() as u64;
    let mut ranges = vec![ProtectedRange {
        rva: 0,
        len: align_up(u64::from(image.size_of_headers), alignment).min(span) as usize,
        protection: Protection::ReadOnly,
    }];
    for section in &image.sections {
        let start = u64::from(section.virtual_address);
        let end = align_up(start + u64::from(section.mapped_size()), alignment).min(span);
        if end <= start {
            continue;
        }
        ranges.push(ProtectedRange {
            rva: section.virtual_address,
            len: (end - start) as usize,
            protection: Protection::from_characteristics(section.characteristics),
        });
    }
    ranges
}
