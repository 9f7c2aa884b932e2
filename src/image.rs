//! Image parser.
//!
//! Turns the raw bytes of a PE32 or PE32+ image into an `ImageDescriptor`. Headers, the
//! section table, and the import and export tables are read through the `object` crate's PE
//! reader; the relocation, TLS and exception directories are decoded here from section data.
//!
//! Parsing is pure: the only input is the byte buffer and nothing is written anywhere.

use std::collections::BTreeMap;

use object::pe;
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, Import, PeFile};
use object::{FileKind, LittleEndian as LE};

use crate::arch::Machine;
use crate::error::MapError;
use crate::resolver::normalize_module_name;
use crate::symbol::{
    parse_forwarder, ExportDirectory, ExportTarget, ImportDirectory, ImportEntry, ImportModule,
    ImportSymbol,
};
use crate::utils::{align_up, read_pointer, read_u16, read_u32, write_pointer};

pub const PAGE_SIZE: u64 = 0x1000;

const SECTION_HEADER_SIZE: usize = 40;
const MAX_TLS_CALLBACKS: usize = 256;

/// One section of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    /// Raw data, truncated to what fits inside `SizeOfImage`.
    pub data: Vec<u8>,
    pub characteristics: u32,
}

impl Section {
    /// Bytes the section occupies once mapped, before alignment.
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.data.len() as u32
        } else {
            self.virtual_size
        }
    }
}

/// A base relocation entry inside a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Offset of the patched field from the start of the page.
    pub offset: u16,
    /// `IMAGE_REL_BASED_*` type.
    pub kind: u16,
}

/// Base relocations grouped by page RVA. Padding (`ABSOLUTE`) entries are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationDirectory {
    pub pages: BTreeMap<u32, Vec<RelocationEntry>>,
}

impl RelocationDirectory {
    pub fn is_empty(&self) -> bool {
        self.pages.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.pages.values().map(Vec::len).sum()
    }

    /// Every entry as `(rva, kind)`, in page order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.pages.iter().flat_map(|(page, entries)| {
            entries
                .iter()
                .map(move |e| (page.wrapping_add(u32::from(e.offset)), e.kind))
        })
    }
}

/// Thread-local storage metadata, with every address converted to an RVA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsDirectory {
    pub template_start: u32,
    pub template_end: u32,
    pub zero_fill: u32,
    /// RVA of the `u32` that receives the allocated TLS index.
    pub index_rva: Option<u32>,
    pub callbacks: Vec<u32>,
    pub characteristics: u32,
}

impl TlsDirectory {
    pub fn template_len(&self) -> usize {
        (self.template_end - self.template_start) as usize
    }

    /// Size of the per-thread block: initialized template plus zero fill.
    pub fn block_len(&self) -> usize {
        self.template_len() + self.zero_fill as usize
    }
}

/// One `RUNTIME_FUNCTION` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind: u32,
}

/// The x64 function table (`.pdata`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionDirectory {
    pub table_rva: u32,
    pub functions: Vec<RuntimeFunction>,
}

impl ExceptionDirectory {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Immutable parse result of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub machine: Machine,
    pub preferred_base: u64,
    /// RVA of the entry point, zero when the image has none.
    pub entry_point: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub section_alignment: u32,
    pub characteristics: u16,
    pub dll_characteristics: u16,
    /// Headers as they appear in a mapped view: each section's raw pointer equals its RVA.
    pub headers: Vec<u8>,
    pub sections: Vec<Section>,
    pub imports: ImportDirectory,
    pub exports: ExportDirectory,
    pub relocations: RelocationDirectory,
    pub tls: Option<TlsDirectory>,
    pub exceptions: ExceptionDirectory,
}

impl ImageDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, MapError> {
        Self::parse_named("<image>", data)
    }

    /// Parses an image, naming it `module` in any error.
    pub fn parse_named(module: &str, data: &[u8]) -> Result<Self, MapError> {
        match FileKind::parse(data) {
            Ok(FileKind::Pe32) => parse_pe::<pe::ImageNtHeaders32>(module, data),
            Ok(FileKind::Pe64) => parse_pe::<pe::ImageNtHeaders64>(module, data),
            Ok(kind) => Err(MapError::malformed(
                module,
                format!("not a PE image ({kind:?})"),
            )),
            Err(e) => Err(MapError::malformed(module, e)),
        }
    }

    /// Parses an image and rejects it unless it matches the target's machine.
    pub fn parse_for(module: &str, data: &[u8], machine: Machine) -> Result<Self, MapError> {
        let image = Self::parse_named(module, data)?;
        if image.machine != machine {
            return Err(MapError::UnsupportedArchitecture {
                module: module.to_string(),
                found: image.machine.to_string(),
                expected: machine.to_string(),
            });
        }
        Ok(image)
    }

    pub fn is_dll(&self) -> bool {
        self.characteristics & pe::IMAGE_FILE_DLL != 0
    }

    /// Whether the image must be placed at its preferred base.
    pub fn requires_fixed_base(&self) -> bool {
        self.characteristics & pe::IMAGE_FILE_RELOCS_STRIPPED != 0
    }

    pub fn entry_point(&self) -> Option<u32> {
        (self.entry_point != 0).then_some(self.entry_point)
    }

    /// Bytes to reserve in the target.
    pub fn span(&self) -> usize {
        let alignment = u64::from(self.section_alignment).max(PAGE_SIZE);
        align_up(u64::from(self.size_of_image), alignment) as usize
    }

    /// `len` bytes at `rva`, from the headers or the raw data of a single section.
    pub fn read_rva(&self, rva: u32, len: usize) -> Option<&[u8]> {
        rva_slice(&self.headers, &self.sections, rva, len)
    }

    pub fn section_containing(&self, rva: u32) -> Option<&Section> {
        self.sections.iter().find(|s| {
            rva >= s.virtual_address && rva - s.virtual_address < s.mapped_size()
        })
    }
}

fn rva_slice<'a>(headers: &'a [u8], sections: &'a [Section], rva: u32, len: usize) -> Option<&'a [u8]> {
    let rva = rva as usize;
    let end = rva.checked_add(len)?;
    if end <= headers.len() {
        return headers.get(rva..end);
    }
    sections.iter().find_map(|s| {
        let start = rva.checked_sub(s.virtual_address as usize)?;
        s.data.get(start..start + len)
    })
}

fn parse_pe<Pe: ImageNtHeaders>(module: &str, data: &[u8]) -> Result<ImageDescriptor, MapError> {
    let malformed = |e: object::read::Error| MapError::malformed(module, e);
    let file = PeFile::<Pe>::parse(data).map_err(malformed)?;
    let nt = file.nt_headers();
    let file_header = nt.file_header();
    let optional = nt.optional_header();

    let coff_machine = file_header.machine.get(LE);
    let machine = Machine::from_coff(coff_machine).ok_or_else(|| {
        MapError::UnsupportedArchitecture {
            module: module.to_string(),
            found: format!("machine {coff_machine:#06x}"),
            expected: "x86 or x86_64".to_string(),
        }
    })?;
    if machine.is_64() != nt.is_type_64() {
        return Err(MapError::malformed(
            module,
            format!("{machine} machine with mismatched optional header"),
        ));
    }

    let size_of_image = optional.size_of_image();
    let size_of_headers = optional.size_of_headers();
    if size_of_headers as usize > data.len() || size_of_headers > size_of_image {
        return Err(MapError::malformed(module, "headers exceed file or image"));
    }

    let mut sections = Vec::new();
    for header in file.section_table().iter() {
        let virtual_address = header.virtual_address.get(LE);
        let room = size_of_image
            .checked_sub(virtual_address)
            .filter(|_| virtual_address >= size_of_headers)
            .ok_or_else(|| {
                MapError::malformed(module, format!("section at {virtual_address:#x} outside image"))
            })?;
        let raw = header.pe_data(data).map_err(malformed)?;
        let kept = raw.len().min(room as usize);
        sections.push(Section {
            name: String::from_utf8_lossy(header.raw_name()).into_owned(),
            virtual_address,
            virtual_size: header.virtual_size.get(LE),
            data: raw[..kept].to_vec(),
            characteristics: header.characteristics.get(LE),
        });
    }

    for index in [
        pe::IMAGE_DIRECTORY_ENTRY_EXPORT,
        pe::IMAGE_DIRECTORY_ENTRY_IMPORT,
        pe::IMAGE_DIRECTORY_ENTRY_EXCEPTION,
        pe::IMAGE_DIRECTORY_ENTRY_BASERELOC,
        pe::IMAGE_DIRECTORY_ENTRY_TLS,
    ] {
        let (va, size) = directory_range(&file, index);
        if va != 0 && u64::from(va) + u64::from(size) > u64::from(size_of_image) {
            return Err(MapError::malformed(
                module,
                format!("data directory {index} at {va:#x}+{size:#x} outside image"),
            ));
        }
    }

    let table_offset = section_table_offset(data, file_header.size_of_optional_header.get(LE))
        .ok_or_else(|| MapError::malformed(module, "section table offset"))?;
    let headers = normalize_headers(&data[..size_of_headers as usize], table_offset, &sections)
        .ok_or_else(|| MapError::malformed(module, "section table outside headers"))?;

    let preferred_base = optional.image_base();
    let imports = parse_imports::<Pe>(module, &file)?;
    let exports = parse_exports(module, &file)?;
    let relocations = parse_relocations(module, &file, &headers, &sections)?;
    let tls = parse_tls(module, &file, machine, preferred_base, size_of_image, &headers, &sections)?;
    let exceptions = if machine.is_64() {
        parse_exceptions(module, &file, size_of_image, &headers, &sections)?
    } else {
        ExceptionDirectory::default()
    };

    let descriptor = ImageDescriptor {
        machine,
        preferred_base,
        entry_point: optional.address_of_entry_point(),
        size_of_image,
        size_of_headers,
        section_alignment: optional.section_alignment(),
        characteristics: file_header.characteristics.get(LE),
        dll_characteristics: optional.dll_characteristics(),
        headers,
        sections,
        imports,
        exports,
        relocations,
        tls,
        exceptions,
    };
    tracing::debug!(
        "parsed {}: {} sections, {} import modules, {} exports, {} relocations",
        module,
        descriptor.sections.len(),
        descriptor.imports.modules.len(),
        descriptor.exports.len(),
        descriptor.relocations.len()
    );
    Ok(descriptor)
}

fn directory_range<Pe: ImageNtHeaders>(file: &PeFile<'_, Pe>, index: usize) -> (u32, u32) {
    file.data_directory(index)
        .map(|d| (d.virtual_address.get(LE), d.size.get(LE)))
        .unwrap_or((0, 0))
}

fn section_table_offset(data: &[u8], size_of_optional_header: u16) -> Option<usize> {
    let nt_offset = read_u32(data, 0x3C)? as usize;
    // Signature (4) + IMAGE_FILE_HEADER (20).
    nt_offset.checked_add(24 + usize::from(size_of_optional_header))
}

/// Rewrites each section header so raw data sits at its RVA, the way it does once mapped.
fn normalize_headers(headers: &[u8], table_offset: usize, sections: &[Section]) -> Option<Vec<u8>> {
    let mut headers = headers.to_vec();
    for (i, section) in sections.iter().enumerate() {
        let entry = table_offset + i * SECTION_HEADER_SIZE;
        let (size, pointer) = if section.data.is_empty() {
            (0, 0)
        } else {
            (section.data.len() as u64, u64::from(section.virtual_address))
        };
        if !write_pointer(&mut headers, entry + 16, 4, size)
            || !write_pointer(&mut headers, entry + 20, 4, pointer)
        {
            return None;
        }
    }
    Some(headers)
}

fn parse_imports<Pe: ImageNtHeaders>(
    module: &str,
    file: &PeFile<'_, Pe>,
) -> Result<ImportDirectory, MapError> {
    let malformed = |e: object::read::Error| MapError::malformed(module, e);
    let mut directory = ImportDirectory::default();
    let Some(table) = file.import_table().map_err(malformed)? else {
        return Ok(directory);
    };
    let pointer_size = if file.nt_headers().is_type_64() { 8 } else { 4 };

    let mut descriptors = table.descriptors().map_err(malformed)?;
    while let Some(descriptor) = descriptors.next().map_err(malformed)? {
        let name = table.name(descriptor.name.get(LE)).map_err(malformed)?;
        let first_thunk = descriptor.first_thunk.get(LE);
        let lookup = match descriptor.original_first_thunk.get(LE) {
            0 => first_thunk,
            rva => rva,
        };

        let mut entries = Vec::new();
        let mut thunks = table.thunks(lookup).map_err(malformed)?;
        while let Some(thunk) = thunks.next::<Pe>().map_err(malformed)? {
            let symbol = match table.import::<Pe>(thunk).map_err(malformed)? {
                Import::Ordinal(ordinal) => ImportSymbol::Ordinal(ordinal),
                Import::Name(_hint, name) => {
                    ImportSymbol::Name(String::from_utf8_lossy(name).into_owned())
                }
            };
            let slot_rva = first_thunk + (entries.len() * pointer_size) as u32;
            entries.push(ImportEntry { symbol, slot_rva });
        }

        directory.modules.push(ImportModule {
            name: normalize_module_name(&String::from_utf8_lossy(name)),
            entries,
        });
    }
    Ok(directory)
}

fn parse_exports<Pe: ImageNtHeaders>(
    module: &str,
    file: &PeFile<'_, Pe>,
) -> Result<ExportDirectory, MapError> {
    use object::read::pe::ExportTarget as PeTarget;

    let malformed = |e: object::read::Error| MapError::malformed(module, e);
    let mut directory = ExportDirectory::new();
    let Some(table) = file.export_table().map_err(malformed)? else {
        return Ok(directory);
    };
    for export in table.exports().map_err(malformed)? {
        let target = match export.target {
            PeTarget::Address(rva) => ExportTarget::Rva(rva),
            PeTarget::ForwardByName(library, name) => parse_forwarder(library, name),
            PeTarget::ForwardByOrdinal(library, ordinal) => {
                parse_forwarder(library, format!("#{ordinal}").as_bytes())
            }
        };
        let name = export
            .name
            .map(|n| String::from_utf8_lossy(n).into_owned());
        directory.insert(export.ordinal, name, target);
    }
    Ok(directory)
}

fn parse_relocations<Pe: ImageNtHeaders>(
    module: &str,
    file: &PeFile<'_, Pe>,
    headers: &[u8],
    sections: &[Section],
) -> Result<RelocationDirectory, MapError> {
    let mut relocs = RelocationDirectory::default();
    let (va, size) = directory_range(file, pe::IMAGE_DIRECTORY_ENTRY_BASERELOC);
    if va == 0 || size == 0 {
        return Ok(relocs);
    }
    let data = rva_slice(headers, sections, va, size as usize)
        .ok_or_else(|| MapError::malformed(module, "relocation directory not backed by data"))?;

    let mut offset = 0;
    while offset + 8 <= data.len() {
        let page = read_u32(data, offset).unwrap_or(0);
        let block = read_u32(data, offset + 4).unwrap_or(0) as usize;
        if block == 0 {
            break;
        }
        if block < 8 || block % 2 != 0 || offset + block > data.len() {
            return Err(MapError::malformed(
                module,
                format!("relocation block at {page:#x} has size {block:#x}"),
            ));
        }
        let entries = relocs.pages.entry(page).or_default();
        for at in (offset + 8..offset + block).step_by(2) {
            let raw = read_u16(data, at).unwrap_or(0);
            let kind = raw >> 12;
            if kind == pe::IMAGE_REL_BASED_ABSOLUTE {
                continue;
            }
            entries.push(RelocationEntry {
                offset: raw & 0x0FFF,
                kind,
            });
        }
        offset += block;
    }
    relocs.pages.retain(|_, entries| !entries.is_empty());
    Ok(relocs)
}

fn parse_tls<Pe: ImageNtHeaders>(
    module: &str,
    file: &PeFile<'_, Pe>,
    machine: Machine,
    preferred_base: u64,
    size_of_image: u32,
    headers: &[u8],
    sections: &[Section],
) -> Result<Option<TlsDirectory>, MapError> {
    let (va, _) = directory_range(file, pe::IMAGE_DIRECTORY_ENTRY_TLS);
    if va == 0 {
        return Ok(None);
    }
    let width = machine.pointer_size();
    let len = 4 * width + 8;
    let raw = rva_slice(headers, sections, va, len)
        .ok_or_else(|| MapError::malformed(module, "TLS directory not backed by data"))?;

    let to_rva = |address: u64| -> Result<Option<u32>, MapError> {
        if address == 0 {
            return Ok(None);
        }
        address
            .checked_sub(preferred_base)
            .filter(|rva| *rva < u64::from(size_of_image))
            .map(|rva| Some(rva as u32))
            .ok_or_else(|| {
                MapError::malformed(module, format!("TLS address {address:#x} outside image"))
            })
    };
    let field = |i: usize| read_pointer(raw, i * width, width).unwrap_or(0);

    let template_start = to_rva(field(0))?.unwrap_or(0);
    let template_end = to_rva(field(1))?.unwrap_or(template_start);
    if template_end < template_start {
        return Err(MapError::malformed(module, "TLS template ends before it starts"));
    }
    let index_rva = to_rva(field(2))?;

    let mut callbacks = Vec::new();
    if let Some(array) = to_rva(field(3))? {
        loop {
            if callbacks.len() == MAX_TLS_CALLBACKS {
                return Err(MapError::malformed(module, "unterminated TLS callback array"));
            }
            let at = array + (callbacks.len() * width) as u32;
            let entry = rva_slice(headers, sections, at, width)
                .and_then(|b| read_pointer(b, 0, width))
                .ok_or_else(|| MapError::malformed(module, "TLS callback array truncated"))?;
            match to_rva(entry)? {
                Some(rva) => callbacks.push(rva),
                None => break,
            }
        }
    }

    Ok(Some(TlsDirectory {
        template_start,
        template_end,
        zero_fill: read_u32(raw, 4 * width).unwrap_or(0),
        index_rva,
        callbacks,
        characteristics: read_u32(raw, 4 * width + 4).unwrap_or(0),
    }))
}

fn parse_exceptions<Pe: ImageNtHeaders>(
    module: &str,
    file: &PeFile<'_, Pe>,
    size_of_image: u32,
    headers: &[u8],
    sections: &[Section],
) -> Result<ExceptionDirectory, MapError> {
    let (va, size) = directory_range(file, pe::IMAGE_DIRECTORY_ENTRY_EXCEPTION);
    if va == 0 || size == 0 {
        return Ok(ExceptionDirectory::default());
    }
    let count = size as usize / 12;
    let raw = rva_slice(headers, sections, va, count * 12)
        .ok_or_else(|| MapError::malformed(module, "exception directory not backed by data"))?;

    let mut functions = Vec::with_capacity(count);
    for i in 0..count {
        let entry = RuntimeFunction {
            begin: read_u32(raw, i * 12).unwrap_or(0),
            end: read_u32(raw, i * 12 + 4).unwrap_or(0),
            unwind: read_u32(raw, i * 12 + 8).unwrap_or(0),
        };
        if entry.begin >= entry.end || entry.end > size_of_image || entry.unwind >= size_of_image {
            return Err(MapError::malformed(
                module,
                format!("runtime function {i} ({:#x}..{:#x}) outside image", entry.begin, entry.end),
            ));
        }
        functions.push(entry);
    }
    Ok(ExceptionDirectory {
        table_rva: va,
        functions,
    })
}
