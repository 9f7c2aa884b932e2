//! Symbol tables.
//!
//! Import and export directories as the engine sees them, and lookup of an imported symbol in
//! an export directory. Addresses are kept as RVAs; the mapping session adds module bases.

use std::collections::BTreeMap;
use std::fmt;

use crate::resolver::normalize_module_name;

/// How an import names the symbol it wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImportSymbol {
    Name(String),
    Ordinal(u16),
}

impl fmt::Display for ImportSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportSymbol::Name(name) => f.write_str(name),
            ImportSymbol::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// One import address table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub symbol: ImportSymbol,
    /// RVA of the IAT slot that receives the resolved address.
    pub slot_rva: u32,
}

/// All imports taken from one module, in descriptor order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportModule {
    /// Normalized module name.
    pub name: String,
    pub entries: Vec<ImportEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportDirectory {
    pub modules: Vec<ImportModule>,
}

impl ImportDirectory {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Names of the modules this image depends on, in import order, without duplicates.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for module in &self.modules {
            if !names.contains(&module.name.as_str()) {
                names.push(&module.name);
            }
        }
        names
    }

    pub fn slot_count(&self) -> usize {
        self.modules.iter().map(|m| m.entries.len()).sum()
    }
}

/// Where an export points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    /// Code or data inside the exporting module.
    Rva(u32),
    /// Re-export of a symbol from another module (`NTDLL.RtlFoo` or `MOD.#12`).
    Forward {
        module: String,
        symbol: ImportSymbol,
    },
}

/// Exports by ordinal, with a name index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportDirectory {
    by_ordinal: BTreeMap<u32, ExportTarget>,
    by_name: BTreeMap<String, u32>,
}

impl ExportDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ordinal: u32, name: Option<String>, target: ExportTarget) {
        if let Some(name) = name {
            self.by_name.insert(name, ordinal);
        }
        self.by_ordinal.insert(ordinal, target);
    }

    /// Convenience for exports that point into the module itself.
    pub fn insert_rva(&mut self, ordinal: u32, name: &str, rva: u32) {
        self.insert(ordinal, Some(name.to_string()), ExportTarget::Rva(rva));
    }

    pub fn lookup(&self, symbol: &ImportSymbol) -> Option<&ExportTarget> {
        let ordinal = match symbol {
            ImportSymbol::Name(name) => *self.by_name.get(name)?,
            ImportSymbol::Ordinal(ordinal) => u32::from(*ordinal),
        };
        self.by_ordinal.get(&ordinal)
    }

    pub fn len(&self) -> usize {
        self.by_ordinal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ordinal.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = (&str, u32)> {
        self.by_name.iter().map(|(name, ordinal)| (name.as_str(), *ordinal))
    }
}

/// Parses a forwarder string (`NTDLL.RtlAllocateHeap`, `api.#12`) into its target.
pub fn parse_forwarder(module: &[u8], symbol: &[u8]) -> ExportTarget {
    let module = normalize_module_name(&String::from_utf8_lossy(module));
    let symbol = String::from_utf8_lossy(symbol);
    let symbol = match symbol.strip_prefix('#').and_then(|s| s.parse::<u16>().ok()) {
        Some(ordinal) => ImportSymbol::Ordinal(ordinal),
        None => ImportSymbol::Name(symbol.into_owned()),
    };
    ExportTarget::Forward { module, symbol }
}
