//! Builds small but complete PE32/PE32+ images for the integration tests.
//!
//! Every image has the same fixed section layout so tests can name RVAs directly:
//!
//! | section | rva    | contents                                        |
//! |---------|--------|-------------------------------------------------|
//! | .text   | 0x1000 | `ret` bytes; entry point and TLS callbacks      |
//! | .rdata  | 0x2000 | import descriptors, 0x2800 exports, 0x2F00 unwind |
//! | .data   | 0x3000 | absolute pointers, 0x3100 TLS directory         |
//! | .pdata  | 0x4000 | runtime functions                               |
//! | .reloc  | 0x5000 | base relocation blocks                          |

use manmap::arch::Machine;
use manmap::symbol::ImportSymbol;

pub const TEXT_RVA: u32 = 0x1000;
pub const RDATA_RVA: u32 = 0x2000;
pub const DATA_RVA: u32 = 0x3000;
pub const PDATA_RVA: u32 = 0x4000;
pub const RELOC_RVA: u32 = 0x5000;
pub const SIZE_OF_IMAGE: u32 = 0x6000;

pub const EXPORT_RVA: u32 = 0x2800;
pub const UNWIND_RVA: u32 = 0x2F00;
pub const TLS_DIR_RVA: u32 = 0x3100;
pub const TLS_INDEX_RVA: u32 = 0x3180;
pub const TLS_CALLBACKS_RVA: u32 = 0x3190;
pub const TLS_TEMPLATE_RVA: u32 = 0x3200;
pub const TLS_TEMPLATE_LEN: u32 = 0x10;
pub const TLS_ZERO_FILL: u32 = 0x10;

pub const PREFERRED_BASE_64: u64 = 0x1_8000_0000;
pub const PREFERRED_BASE_32: u64 = 0x1000_0000;

const HEADERS_SIZE: usize = 0x400;
const NT_OFFSET: usize = 0x80;

/// name, rva, size (raw and virtual), file offset, characteristics
const SECTIONS: [(&[u8; 8], u32, u32, u32, u32); 5] = [
    (b".text\0\0\0", TEXT_RVA, 0x200, 0x400, 0x6000_0020),
    (b".rdata\0\0", RDATA_RVA, 0x1000, 0x600, 0x4000_0040),
    (b".data\0\0\0", DATA_RVA, 0x400, 0x1600, 0xC000_0040),
    (b".pdata\0\0", PDATA_RVA, 0x200, 0x1A00, 0x4000_0040),
    (b".reloc\0\0", RELOC_RVA, 0x200, 0x1C00, 0x4200_0040),
];
const FILE_SIZE: usize = 0x1E00;

#[derive(Debug, Clone)]
enum ExportSpec {
    Rva(u32),
    Forward(String),
}

#[derive(Debug, Clone)]
pub struct PeBuilder {
    machine: Machine,
    name: String,
    dll: bool,
    image_base: u64,
    entry: Option<u32>,
    imports: Vec<(String, Vec<ImportSymbol>)>,
    exports: Vec<(String, ExportSpec)>,
    pointers: Vec<u32>,
    relocs_stripped: bool,
    extra_relocs: Vec<(u32, u16)>,
    tls_callbacks: Option<Vec<u32>>,
    runtime_functions: Vec<(u32, u32)>,
}

impl PeBuilder {
    pub fn dll(machine: Machine, name: &str) -> Self {
        Self {
            machine,
            name: name.to_string(),
            dll: true,
            image_base: match machine {
                Machine::X64 => PREFERRED_BASE_64,
                Machine::X86 => PREFERRED_BASE_32,
            },
            entry: Some(TEXT_RVA),
            imports: Vec::new(),
            exports: Vec::new(),
            pointers: Vec::new(),
            relocs_stripped: false,
            extra_relocs: Vec::new(),
            tls_callbacks: None,
            runtime_functions: Vec::new(),
        }
    }

    pub fn exe(machine: Machine, name: &str) -> Self {
        Self {
            dll: false,
            ..Self::dll(machine, name)
        }
    }

    pub fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub fn entry(mut self, entry: Option<u32>) -> Self {
        self.entry = entry;
        self
    }

    pub fn import(mut self, module: &str, symbols: &[&str]) -> Self {
        let symbols = symbols
            .iter()
            .map(|s| ImportSymbol::Name(s.to_string()))
            .collect();
        self.imports.push((module.to_string(), symbols));
        self
    }

    pub fn import_ordinal(mut self, module: &str, ordinal: u16) -> Self {
        self.imports
            .push((module.to_string(), vec![ImportSymbol::Ordinal(ordinal)]));
        self
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((name.to_string(), ExportSpec::Rva(rva)));
        self
    }

    /// Forwarded export, `target` spelled like `NTDLL.RtlFoo`.
    pub fn forward(mut self, name: &str, target: &str) -> Self {
        self.exports
            .push((name.to_string(), ExportSpec::Forward(target.to_string())));
        self
    }

    /// Adds an absolute pointer to `target_rva` in .data, with a base relocation.
    pub fn pointer(mut self, target_rva: u32) -> Self {
        self.pointers.push(target_rva);
        self
    }

    /// Marks relocations stripped and omits the relocation directory.
    pub fn strip_relocations(mut self) -> Self {
        self.relocs_stripped = true;
        self
    }

    pub fn extra_relocation(mut self, rva: u32, kind: u16) -> Self {
        self.extra_relocs.push((rva, kind));
        self
    }

    pub fn tls(mut self, callbacks: &[u32]) -> Self {
        self.tls_callbacks = Some(callbacks.to_vec());
        self
    }

    pub fn runtime_function(mut self, begin: u32, end: u32) -> Self {
        self.runtime_functions.push((begin, end));
        self
    }

    pub fn preferred_base(&self) -> u64 {
        self.image_base
    }

    fn width(&self) -> usize {
        self.machine.pointer_size()
    }

    /// RVA of the `index`th pointer added with `pointer`.
    pub fn pointer_rva(&self, index: usize) -> u32 {
        DATA_RVA + (index * self.width()) as u32
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = Image::new(self.width());
        let w = self.width();
        let pointer_kind = if w == 8 { 10 } else { 3 };
        let mut relocs: Vec<(u32, u16)> = Vec::new();

        for rva in TEXT_RVA..TEXT_RVA + 0x200 {
            image.mem[rva as usize] = 0xC3;
        }

        for (i, target) in self.pointers.iter().enumerate() {
            let at = self.pointer_rva(i);
            image.ptr(at, self.image_base + u64::from(*target));
            relocs.push((at, pointer_kind));
        }

        let import_size = self.write_imports(&mut image);
        let export_size = self.write_exports(&mut image);

        if !self.runtime_functions.is_empty() {
            image.mem[UNWIND_RVA as usize] = 1;
            for (i, (begin, end)) in self.runtime_functions.iter().enumerate() {
                let at = PDATA_RVA + 12 * i as u32;
                image.u32(at, *begin);
                image.u32(at + 4, *end);
                image.u32(at + 8, UNWIND_RVA);
            }
        }

        if let Some(callbacks) = &self.tls_callbacks {
            let base = self.image_base;
            let fields = [
                base + u64::from(TLS_TEMPLATE_RVA),
                base + u64::from(TLS_TEMPLATE_RVA + TLS_TEMPLATE_LEN),
                base + u64::from(TLS_INDEX_RVA),
                if callbacks.is_empty() { 0 } else { base + u64::from(TLS_CALLBACKS_RVA) },
            ];
            for (i, value) in fields.iter().enumerate() {
                let at = TLS_DIR_RVA + (i * w) as u32;
                image.ptr(at, *value);
                if *value != 0 {
                    relocs.push((at, pointer_kind));
                }
            }
            image.u32(TLS_DIR_RVA + 4 * w as u32, TLS_ZERO_FILL);
            for (i, callback) in callbacks.iter().enumerate() {
                let at = TLS_CALLBACKS_RVA + (i * w) as u32;
                image.ptr(at, base + u64::from(*callback));
                relocs.push((at, pointer_kind));
            }
            for i in 0..TLS_TEMPLATE_LEN {
                image.mem[(TLS_TEMPLATE_RVA + i) as usize] = 0xA0 + i as u8;
            }
        }

        relocs.extend(self.extra_relocs.iter().copied());
        let reloc_size = if self.relocs_stripped {
            0
        } else {
            write_relocations(&mut image, &relocs)
        };

        let tls_size = if self.tls_callbacks.is_some() { 4 * w as u32 + 8 } else { 0 };
        let directories = [
            (0, EXPORT_RVA, export_size),
            (1, RDATA_RVA, import_size),
            (3, PDATA_RVA, 12 * self.runtime_functions.len() as u32),
            (5, RELOC_RVA, reloc_size),
            (9, TLS_DIR_RVA, tls_size),
        ];
        self.write_headers(&mut image, &directories);

        let mut file = vec![0u8; FILE_SIZE];
        file[..HEADERS_SIZE].copy_from_slice(&image.mem[..HEADERS_SIZE]);
        for (_, rva, size, offset, _) in SECTIONS {
            let (rva, size, offset) = (rva as usize, size as usize, offset as usize);
            file[offset..offset + size].copy_from_slice(&image.mem[rva..rva + size]);
        }
        file
    }

    fn write_imports(&self, image: &mut Image) -> u32 {
        if self.imports.is_empty() {
            return 0;
        }
        let w = self.width();
        let ordinal_flag = if w == 8 { 1u64 << 63 } else { 1u64 << 31 };
        let descriptors = 20 * (self.imports.len() as u32 + 1);
        let mut cursor = RDATA_RVA + descriptors;

        for (i, (module, symbols)) in self.imports.iter().enumerate() {
            let thunks = ((symbols.len() + 1) * w) as u32;
            let ilt = (cursor + w as u32 - 1) & !(w as u32 - 1);
            let iat = ilt + thunks;
            cursor = iat + thunks;
            let name = cursor;
            cursor = image.string(cursor, module);

            for (j, symbol) in symbols.iter().enumerate() {
                let value = match symbol {
                    ImportSymbol::Ordinal(ordinal) => ordinal_flag | u64::from(*ordinal),
                    ImportSymbol::Name(symbol) => {
                        let hint_name = cursor;
                        cursor = image.string(cursor + 2, symbol);
                        u64::from(hint_name)
                    }
                };
                image.ptr(ilt + (j * w) as u32, value);
                image.ptr(iat + (j * w) as u32, value);
            }

            let descriptor = RDATA_RVA + 20 * i as u32;
            image.u32(descriptor, ilt);
            image.u32(descriptor + 12, name);
            image.u32(descriptor + 16, iat);
        }
        assert!(cursor < EXPORT_RVA, "import data overflows into exports");
        descriptors
    }

    fn write_exports(&self, image: &mut Image) -> u32 {
        if self.exports.is_empty() {
            return 0;
        }
        let mut exports = self.exports.clone();
        exports.sort_by(|a, b| a.0.cmp(&b.0));
        let n = exports.len() as u32;

        let functions = EXPORT_RVA + 40;
        let names = functions + 4 * n;
        let ordinals = names + 4 * n;
        let mut cursor = ordinals + 2 * n;

        let dll_name = cursor;
        cursor = image.string(cursor, &self.name);
        for (i, (name, spec)) in exports.iter().enumerate() {
            let i = i as u32;
            image.u32(names + 4 * i, cursor);
            cursor = image.string(cursor, name);
            image.u16(ordinals + 2 * i, i as u16);
            match spec {
                ExportSpec::Rva(rva) => image.u32(functions + 4 * i, *rva),
                ExportSpec::Forward(target) => {
                    image.u32(functions + 4 * i, cursor);
                    cursor = image.string(cursor, target);
                }
            }
        }

        image.u32(EXPORT_RVA + 12, dll_name);
        image.u32(EXPORT_RVA + 16, 1);
        image.u32(EXPORT_RVA + 20, n);
        image.u32(EXPORT_RVA + 24, n);
        image.u32(EXPORT_RVA + 28, functions);
        image.u32(EXPORT_RVA + 32, names);
        image.u32(EXPORT_RVA + 36, ordinals);
        assert!(cursor < UNWIND_RVA, "export data overflows");
        cursor - EXPORT_RVA
    }

    fn write_headers(&self, image: &mut Image, directories: &[(usize, u32, u32)]) {
        let is_64 = self.machine.is_64();
        image.mem[0] = b'M';
        image.mem[1] = b'Z';
        image.u32(0x3C, NT_OFFSET as u32);
        image.mem[NT_OFFSET..NT_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let file_header = (NT_OFFSET + 4) as u32;
        let optional_size: u16 = if is_64 { 0xF0 } else { 0xE0 };
        let mut characteristics: u16 = 0x0002;
        if self.dll {
            characteristics |= 0x2000;
        }
        if self.relocs_stripped {
            characteristics |= 0x0001;
        }
        characteristics |= if is_64 { 0x0020 } else { 0x0100 };
        image.u16(file_header, if is_64 { 0x8664 } else { 0x014C });
        image.u16(file_header + 2, SECTIONS.len() as u16);
        image.u16(file_header + 16, optional_size);
        image.u16(file_header + 18, characteristics);

        let optional = file_header + 20;
        image.u16(optional, if is_64 { 0x20B } else { 0x10B });
        image.u32(optional + 4, 0x200);
        image.u32(optional + 16, self.entry.unwrap_or(0));
        image.u32(optional + 20, TEXT_RVA);
        if is_64 {
            image.u64(optional + 24, self.image_base);
        } else {
            image.u32(optional + 24, RDATA_RVA);
            image.u32(optional + 28, self.image_base as u32);
        }
        image.u32(optional + 32, 0x1000);
        image.u32(optional + 36, 0x200);
        image.u16(optional + 40, 6);
        image.u16(optional + 48, 6);
        image.u32(optional + 56, SIZE_OF_IMAGE);
        image.u32(optional + 60, HEADERS_SIZE as u32);
        image.u16(optional + 68, if self.dll { 2 } else { 3 });
        image.u16(optional + 70, if self.relocs_stripped { 0 } else { 0x0140 });

        let (sizes, count_at) = if is_64 { (optional + 72, optional + 108) } else { (optional + 72, optional + 92) };
        let stack = [0x10_0000u64, 0x1000, 0x10_0000, 0x1000];
        for (i, value) in stack.iter().enumerate() {
            if is_64 {
                image.u64(sizes + 8 * i as u32, *value);
            } else {
                image.u32(sizes + 4 * i as u32, *value as u32);
            }
        }
        image.u32(count_at, 16);
        let data_directories = count_at + 4;
        for &(index, rva, size) in directories {
            if size == 0 {
                continue;
            }
            let at = data_directories + 8 * index as u32;
            image.u32(at, rva);
            image.u32(at + 4, size);
        }

        let table = optional + u32::from(optional_size);
        for (i, (name, rva, size, offset, flags)) in SECTIONS.iter().enumerate() {
            let at = table + 40 * i as u32;
            image.mem[at as usize..at as usize + 8].copy_from_slice(*name);
            image.u32(at + 8, *size);
            image.u32(at + 12, *rva);
            image.u32(at + 16, *size);
            image.u32(at + 20, *offset);
            image.u32(at + 36, *flags);
        }
    }
}

fn write_relocations(image: &mut Image, relocs: &[(u32, u16)]) -> u32 {
    let mut pages: std::collections::BTreeMap<u32, Vec<u16>> = Default::default();
    for &(rva, kind) in relocs {
        pages
            .entry(rva & !0xFFF)
            .or_default()
            .push((kind << 12) | (rva & 0xFFF) as u16);
    }
    let mut cursor = RELOC_RVA;
    for (page, mut entries) in pages {
        if entries.len() % 2 == 1 {
            entries.push(0);
        }
        let size = 8 + 2 * entries.len() as u32;
        image.u32(cursor, page);
        image.u32(cursor + 4, size);
        for (i, entry) in entries.iter().enumerate() {
            image.u16(cursor + 8 + 2 * i as u32, *entry);
        }
        cursor += size;
    }
    cursor - RELOC_RVA
}

/// The image in RVA space while it is being assembled.
struct Image {
    mem: Vec<u8>,
    width: usize,
}

impl Image {
    fn new(width: usize) -> Self {
        Self {
            mem: vec![0; SIZE_OF_IMAGE as usize],
            width,
        }
    }

    fn u16(&mut self, rva: u32, value: u16) {
        let at = rva as usize;
        self.mem[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, rva: u32, value: u32) {
        let at = rva as usize;
        self.mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, rva: u32, value: u64) {
        let at = rva as usize;
        self.mem[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn ptr(&mut self, rva: u32, value: u64) {
        if self.width == 8 {
            self.u64(rva, value);
        } else {
            self.u32(rva, value as u32);
        }
    }

    /// Writes a NUL-terminated string and returns the next 2-aligned RVA.
    fn string(&mut self, rva: u32, s: &str) -> u32 {
        let at = rva as usize;
        self.mem[at..at + s.len()].copy_from_slice(s.as_bytes());
        self.mem[at + s.len()] = 0;
        (rva + s.len() as u32 + 2) & !1
    }
}
