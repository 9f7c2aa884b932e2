//! Mapping sessions.
//!
//! A `MappingSession` maps images into one target process. It keeps an arena of
//! `MappedModule`s keyed by normalized name plus the chain of modules currently being mapped;
//! a module on that chain counts as present, which is how import cycles terminate.
//!
//! Mapping one module:
//! 1. parse and check the machine,
//! 2. reserve remote memory,
//! 3. make sure every dependency is present (already loaded by the target, already in the
//!    session, or mapped now from the `ImageSource`),
//! 4. relocate and bind imports on a local layout, write it in one go and apply section
//!    protections,
//! 5. register exception data, set up TLS, run TLS callbacks and the entry point through the
//!    remote executor,
//! 6. hide the region, wipe the headers and link the module into the loader lists if asked.
//!
//! A module that imports from a module still on the chain is part of a cycle. It stops after
//! step 4 and waits for the first module of its cycle to write its bytes; the whole group then
//! runs steps 5 and 6 in the order the members were written.
//!
//! Any failure removes the failing module's group from the arena, detaches members already
//! initialized and frees their memory. Modules outside the group stay mapped. A timed-out
//! remote call may still be running, so after one the group stays in the arena with its memory
//! intact until the caller unmaps or rolls back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::arch::CallingConvention;
use crate::error::{DependencyChain, MapError, TargetResultExt};
use crate::fixup::{self, BoundImport};
use crate::image::{ImageDescriptor, TlsDirectory};
use crate::layout::{self, Layout};
use crate::privileged::Privileged;
use crate::registration::{self, ModuleRecord};
use crate::remote::{self, Arg, RemoteCall, RemoteExecutor, ReturnWidth};
use crate::resolver::{normalize_module_name, read_image, ImageSource};
use crate::symbol::{ExportDirectory, ExportTarget, ImportSymbol};
use crate::target::{LoadedModule, PrivilegedService, Protection, RemoteAddress, RemoteRegion, Target};

/// Forwarded exports are followed at most this many times.
pub const MAX_FORWARDER_HOPS: usize = 16;

const DLL_PROCESS_DETACH: u32 = 0;
const DLL_PROCESS_ATTACH: u32 = 1;
const TLS_OUT_OF_INDEXES: u64 = 0xFFFF_FFFF;

/// How a mapped module relates to the target's own bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Registration {
    /// Linked into the loader's module lists.
    Registered,
    /// Unregistered, and the region is detached from memory enumeration.
    Hidden,
    #[default]
    Unregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Memory reserved, dependencies still being resolved.
    InProgress,
    /// Bytes written and fixed up, initializer not run.
    Mapped,
    Initialized,
}

/// Knobs for a mapping session.
#[derive(Debug, Clone)]
pub struct MapOptions {
    pub registration: Registration,
    /// Apply per-section page protections; otherwise the whole image stays RWX.
    pub protect_sections: bool,
    /// Zero the PE headers after initialization.
    pub wipe_headers: bool,
    pub tls: bool,
    pub exceptions: bool,
    /// Run TLS callbacks and the entry point.
    pub initialize: bool,
    pub call_timeout: Duration,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            registration: Registration::Unregistered,
            protect_sections: true,
            wipe_headers: false,
            tls: true,
            exceptions: true,
            initialize: true,
            call_timeout: remote::DEFAULT_TIMEOUT,
        }
    }
}

/// One image mapped by the session.
#[derive(Debug, Clone)]
pub struct MappedModule {
    pub name: String,
    pub region: RemoteRegion,
    pub image: Arc<ImageDescriptor>,
    /// Import address table contents as written.
    pub imports: Vec<BoundImport>,
    pub state: ModuleState,
    pub registration: Registration,
    pub tls_index: Option<u32>,
    pub tls_block: Option<RemoteAddress>,
    /// Address passed to `RtlAddFunctionTable`.
    pub function_table: Option<RemoteAddress>,
    pub loader_entry: Option<RemoteAddress>,
}

impl MappedModule {
    pub fn base(&self) -> RemoteAddress {
        self.region.base()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn entry_point(&self) -> Option<RemoteAddress> {
        self.image
            .entry_point()
            .map(|rva| self.base().offset(u64::from(rva)))
    }
}

/// A module the target loaded itself, used in place of mapping a copy.
struct PresentModule {
    module: LoadedModule,
    exports: ExportDirectory,
}

/// One "map images into process P" operation.
pub struct MappingSession<'t> {
    target: &'t dyn Target,
    source: &'t dyn ImageSource,
    privileged: Option<Privileged<'t>>,
    options: MapOptions,
    modules: HashMap<String, MappedModule>,
    /// Completion order, used for listing and rollback.
    order: Vec<String>,
    in_progress: Vec<String>,
    /// Written modules waiting on a cycle member further up the chain, with the lowest chain
    /// position they wait on.
    deferred: Vec<(String, usize)>,
    /// TLS templates of written modules not yet initialized.
    pending_tls: HashMap<String, Vec<u8>>,
    loaded: Option<Vec<LoadedModule>>,
    present: HashMap<String, PresentModule>,
    routines: HashMap<&'static str, RemoteAddress>,
    executor: Option<RemoteExecutor<'t>>,
}

impl<'t> MappingSession<'t> {
    pub fn new(target: &'t dyn Target, source: &'t dyn ImageSource) -> Self {
        Self {
            target,
            source,
            privileged: None,
            options: MapOptions::default(),
            modules: HashMap::new(),
            order: Vec::new(),
            in_progress: Vec::new(),
            deferred: Vec::new(),
            pending_tls: HashMap::new(),
            loaded: None,
            present: HashMap::new(),
            routines: HashMap::new(),
            executor: None,
        }
    }

    pub fn with_options(mut self, options: MapOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_privileged(mut self, service: &'t dyn PrivilegedService) -> Self {
        self.privileged = Some(Privileged::new(service, self.target.pid()));
        self
    }

    pub fn options(&self) -> &MapOptions {
        &self.options
    }

    pub fn pid(&self) -> u32 {
        self.target.pid()
    }

    pub fn privileged(&self) -> Option<Privileged<'t>> {
        self.privileged
    }

    pub fn module(&self, name: &str) -> Option<&MappedModule> {
        self.modules.get(&normalize_module_name(name))
    }

    /// Mapped modules in the order they finished mapping, dependencies before dependents.
    pub fn modules(&self) -> impl Iterator<Item = &MappedModule> {
        self.order.iter().filter_map(|name| self.modules.get(name))
    }

    /// Maps `bytes` under `name` together with any dependency the target lacks.
    /// Mapping a name the session already holds returns the existing module.
    pub fn map(&mut self, name: &str, bytes: &[u8]) -> Result<&MappedModule, MapError> {
        let name = normalize_module_name(name);
        self.map_module(&name, bytes)?;
        self.modules.get(&name).ok_or(MapError::ModuleNotFound {
            module: name,
            chain: DependencyChain::default(),
        })
    }

    pub fn map_file(&mut self, path: &Path) -> Result<&MappedModule, MapError> {
        let bytes = read_image(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.map(&name, &bytes)
    }

    /// Address of `symbol` (a name, or `#n` for an ordinal) exported by `module`, which is
    /// made present first if needed.
    pub fn resolve_export(&mut self, module: &str, symbol: &str) -> Result<RemoteAddress, MapError> {
        let symbol = match symbol.strip_prefix('#').and_then(|s| s.parse().ok()) {
            Some(ordinal) => ImportSymbol::Ordinal(ordinal),
            None => ImportSymbol::Name(symbol.to_string()),
        };
        self.resolve_symbol(&normalize_module_name(module), &symbol)
            .map(|(address, _)| address)
    }

    /// The session's remote executor, started on first use.
    pub fn executor(&mut self) -> Result<&mut RemoteExecutor<'t>, MapError> {
        let executor = match self.executor.take() {
            Some(executor) => executor,
            None => RemoteExecutor::new(self.target, self.options.call_timeout)?,
        };
        Ok(self.executor.insert(executor))
    }

    pub fn call(&mut self, call: &RemoteCall) -> Result<u64, MapError> {
        self.executor()?.call(call)
    }

    /// Runs detach notifications and frees everything the session set up for `name`.
    pub fn unmap(&mut self, name: &str) -> Result<(), MapError> {
        let name = normalize_module_name(name);
        let module = self.take_module(&name).ok_or_else(|| MapError::ModuleNotFound {
            module: name.clone(),
            chain: DependencyChain::default(),
        })?;
        tracing::info!("unmapping {} from pid {}", name, self.pid());
        self.release(module, true)
    }

    /// Unmaps every module of the session, dependents before their dependencies.
    pub fn rollback(&mut self) -> Result<(), MapError> {
        let mut first_error = None;
        for name in self.order.clone().into_iter().rev() {
            if let Err(e) = self.unmap(&name) {
                tracing::warn!("rollback of {} failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops the remote workers. Mapped modules stay in the target.
    pub fn teardown(mut self) -> Result<(), MapError> {
        match self.executor.take() {
            Some(executor) => executor.shutdown(),
            None => Ok(()),
        }
    }

    fn map_module(&mut self, name: &str, bytes: &[u8]) -> Result<(), MapError> {
        if self.modules.contains_key(name) {
            return Ok(());
        }
        if self.options.registration == Registration::Hidden && self.privileged.is_none() {
            return Err(MapError::PrivilegedOperationDenied {
                operation: "hide_region",
                pid: self.pid(),
            });
        }
        let image = Arc::new(ImageDescriptor::parse_for(name, bytes, self.target.machine())?);
        let region = layout::reserve(self.target, name, &image)?;
        tracing::info!("mapping {} into pid {} at {}", name, self.pid(), region.base());

        self.modules.insert(
            name.to_string(),
            MappedModule {
                name: name.to_string(),
                region,
                image: Arc::clone(&image),
                imports: Vec::new(),
                state: ModuleState::InProgress,
                registration: Registration::Unregistered,
                tls_index: None,
                tls_block: None,
                function_table: None,
                loader_entry: None,
            },
        );
        let mark = self.deferred.len();
        self.in_progress.push(name.to_string());
        let result = self
            .load_module(name, &image, region, mark)
            .and_then(|low| self.settle(name, low, mark));
        self.in_progress.pop();

        let Err(e) = result else {
            return Ok(());
        };
        tracing::warn!("mapping {} failed: {}", name, e);
        let mut group: Vec<String> = self.deferred.drain(mark..).map(|(member, _)| member).collect();
        group.push(name.to_string());

        if let MapError::RemoteCallTimeout { .. } = e {
            for member in group {
                tracing::warn!("keeping {} mapped while a timed-out call may still run", member);
                self.pending_tls.remove(&member);
                if !self.order.contains(&member) {
                    self.order.push(member);
                }
            }
            return Err(e);
        }
        group.reverse();
        // Detach notifications run while every member of the group is still mapped.
        group.sort_by_key(|member| {
            self.modules
                .get(member)
                .map_or(true, |m| m.state != ModuleState::Initialized)
        });
        for member in &group {
            if let Some(module) = self.take_module(member) {
                if let Err(cleanup) = self.release(module, true) {
                    tracing::warn!("cleanup of {} failed: {}", member, cleanup);
                }
            }
        }
        Err(e)
    }

    /// Writes `name` into its region and returns the lowest chain position it, or any module
    /// written beneath it, still waits on.
    fn load_module(
        &mut self,
        name: &str,
        image: &ImageDescriptor,
        region: RemoteRegion,
        mark: usize,
    ) -> Result<usize, MapError> {
        let pid = self.pid();
        let mut links: Vec<String> = Vec::new();
        for dependency in image.imports.dependencies() {
            self.ensure_dependency(dependency)?;
            links.push(dependency.to_string());
        }

        let mut layout = Layout::new(image);
        fixup::relocate(name, image, &mut layout, region.base().get())?;
        let imports = fixup::bind_imports(name, image, &mut layout, |module, symbol| {
            let (address, provider) = self.resolve_symbol(module, symbol)?;
            links.push(provider);
            Ok(address)
        })?;
        let tls_block = fixup::tls_block(image, &layout);

        self.target
            .write(region.at(0, layout.len())?, layout.data())
            .in_pid(pid)?;
        if self.options.protect_sections {
            for range in layout::section_protections(image) {
                let at = region.at(u64::from(range.rva), range.len)?;
                self.target.protect(at, range.len, range.protection).in_pid(pid)?;
            }
        }
        {
            let module = self.module_mut(name)?;
            module.imports = imports;
            module.state = ModuleState::Mapped;
        }
        if let Some(block) = tls_block {
            self.pending_tls.insert(name.to_string(), block);
        }
        Ok(self.lowest_link(name, &links, mark))
    }

    fn lowest_link(&self, name: &str, links: &[String], mark: usize) -> usize {
        let depth = self.in_progress.len().saturating_sub(1);
        let waits = links
            .iter()
            .filter(|link| link.as_str() != name)
            .filter_map(|link| {
                self.in_progress.iter().position(|n| n == link).or_else(|| {
                    self.deferred
                        .iter()
                        .find(|(n, _)| n == link)
                        .map(|(_, low)| *low)
                })
            });
        let beneath = self.deferred[mark..].iter().map(|(_, low)| *low);
        waits.chain(beneath).fold(depth, usize::min)
    }

    /// Finishes `name` together with the modules deferred beneath it, unless `name` itself
    /// waits on a module further up the chain.
    fn settle(&mut self, name: &str, low: usize, mark: usize) -> Result<(), MapError> {
        self.order.push(name.to_string());
        let depth = self.in_progress.len().saturating_sub(1);
        if low < depth {
            tracing::debug!("{} waits for {} before initializing", name, self.in_progress[low]);
            self.deferred.push((name.to_string(), low));
            return Ok(());
        }

        let mut group: Vec<String> = self.deferred.drain(mark..).map(|(member, _)| member).collect();
        group.push(name.to_string());
        if group.len() > 1 {
            tracing::debug!("finishing import cycle {}", group.join(" -> "));
        }
        let result = group.iter().try_for_each(|member| self.finalize(member));
        if result.is_err() {
            group.pop();
            self.deferred.extend(group.into_iter().map(|member| (member, depth)));
        }
        result
    }

    fn finalize(&mut self, name: &str) -> Result<(), MapError> {
        let (image, region) = {
            let module = self.module_mut(name)?;
            (Arc::clone(&module.image), module.region)
        };
        let tls_block = self.pending_tls.remove(name);
        if self.options.initialize {
            self.initialize(name, &image, region, tls_block)?;
        }

        if self.options.registration == Registration::Hidden {
            let privileged = self.privileged.ok_or(MapError::PrivilegedOperationDenied {
                operation: "hide_region",
                pid: self.pid(),
            })?;
            privileged.hide(region)?;
            self.module_mut(name)?.registration = Registration::Hidden;
        }
        if self.options.wipe_headers {
            self.wipe_headers(&image, region)?;
        }

        if self.options.registration == Registration::Registered {
            let entry_point = image
                .entry_point()
                .map_or(RemoteAddress::NULL, |rva| region.base().offset(u64::from(rva)));
            let entry = registration::link_module(
                self.target,
                &ModuleRecord {
                    base_name: name,
                    full_name: name,
                    base: region.base(),
                    size: region.size(),
                    entry_point,
                },
            )?;
            let module = self.module_mut(name)?;
            module.loader_entry = Some(entry);
            module.registration = Registration::Registered;
        }
        tracing::info!("mapped {} at {}", name, region.base());
        Ok(())
    }

    fn initialize(
        &mut self,
        name: &str,
        image: &ImageDescriptor,
        region: RemoteRegion,
        tls_block: Option<Vec<u8>>,
    ) -> Result<(), MapError> {
        let base = region.base();
        let convention = self.convention();
        let failed = |reason: &str| MapError::InitializationFailed {
            module: name.to_string(),
            reason: reason.to_string(),
        };

        if self.options.exceptions && image.machine.is_64() {
            if let Some((table, count)) = fixup::function_table(image, base) {
                let add = self.system_routine("ntdll.dll", "RtlAddFunctionTable")?;
                let call = RemoteCall::new(add, convention)
                    .arg(Arg::Ptr(table))
                    .arg(Arg::U32(count))
                    .arg(Arg::U64(base.get()))
                    .returns(ReturnWidth::U32);
                if self.call(&call)? == 0 {
                    return Err(failed("RtlAddFunctionTable rejected the function table"));
                }
                self.module_mut(name)?.function_table = Some(table);
                tracing::debug!("registered {} runtime functions for {}", count, name);
            }
        }

        if self.options.tls {
            if let Some(tls) = &image.tls {
                self.install_tls(name, tls, region, tls_block)?;
                for &callback in &tls.callbacks {
                    let call = RemoteCall::new(base.offset(u64::from(callback)), convention)
                        .arg(Arg::Ptr(base))
                        .arg(Arg::U32(DLL_PROCESS_ATTACH))
                        .arg(Arg::Ptr(RemoteAddress::NULL))
                        .returns(ReturnWidth::Void);
                    self.call(&call)?;
                }
            }
        }

        if let Some(entry) = image.entry_point() {
            let entry = base.offset(u64::from(entry));
            if image.is_dll() {
                let call = RemoteCall::new(entry, convention)
                    .arg(Arg::Ptr(base))
                    .arg(Arg::U32(DLL_PROCESS_ATTACH))
                    .arg(Arg::Ptr(RemoteAddress::NULL))
                    .returns(ReturnWidth::U32);
                if self.call(&call)? == 0 {
                    return Err(failed("DllMain returned FALSE"));
                }
            } else {
                let thread = self
                    .target
                    .create_thread(entry, RemoteAddress::NULL)
                    .in_pid(self.pid())?;
                tracing::debug!("started {} entry point on thread {}", name, thread);
            }
        }

        self.module_mut(name)?.state = ModuleState::Initialized;
        tracing::debug!("initialized {}", name);
        Ok(())
    }

    fn install_tls(
        &mut self,
        name: &str,
        tls: &TlsDirectory,
        region: RemoteRegion,
        block: Option<Vec<u8>>,
    ) -> Result<(), MapError> {
        let Some(index_rva) = tls.index_rva else {
            return Ok(());
        };
        let pid = self.pid();
        let convention = self.convention();
        let failed = |reason: &str| MapError::InitializationFailed {
            module: name.to_string(),
            reason: reason.to_string(),
        };

        let alloc = self.system_routine("kernel32.dll", "TlsAlloc")?;
        let index = self.call(&RemoteCall::new(alloc, convention).returns(ReturnWidth::U32))?;
        if index == TLS_OUT_OF_INDEXES {
            return Err(failed("no TLS index available"));
        }
        let index = index as u32;
        self.module_mut(name)?.tls_index = Some(index);
        self.target
            .write(region.at(u64::from(index_rva), 4)?, &index.to_le_bytes())
            .in_pid(pid)?;

        if let Some(block) = block.filter(|b| !b.is_empty()) {
            let address = self
                .target
                .allocate(block.len(), None, Protection::ReadWrite)
                .map_err(|source| MapError::RemoteAllocationFailed {
                    module: name.to_string(),
                    size: block.len(),
                    pid,
                    source,
                })?;
            self.module_mut(name)?.tls_block = Some(address);
            self.target.write(address, &block).in_pid(pid)?;

            let set = self.system_routine("kernel32.dll", "TlsSetValue")?;
            let call = RemoteCall::new(set, convention)
                .arg(Arg::U32(index))
                .arg(Arg::Ptr(address))
                .returns(ReturnWidth::U32);
            if self.call(&call)? == 0 {
                return Err(failed("TlsSetValue failed"));
            }
        }
        tracing::debug!("{} uses TLS index {}", name, index);
        Ok(())
    }

    fn wipe_headers(&mut self, image: &ImageDescriptor, region: RemoteRegion) -> Result<(), MapError> {
        let pid = self.pid();
        let len = image.size_of_headers as usize;
        let at = region.at(0, len)?;
        if self.options.protect_sections {
            self.target.protect(at, len, Protection::ReadWrite).in_pid(pid)?;
        }
        self.target.write(at, &vec![0u8; len]).in_pid(pid)?;
        if self.options.protect_sections {
            self.target.protect(at, len, Protection::ReadOnly).in_pid(pid)?;
        }
        Ok(())
    }

    /// Makes `name` present: mapped or in progress in this session, or already loaded by the
    /// target, or mapped now from the image source.
    fn ensure_dependency(&mut self, name: &str) -> Result<(), MapError> {
        if self.modules.contains_key(name) || self.present.contains_key(name) {
            return Ok(());
        }
        let pid = self.pid();
        if let Some(loaded) = self.find_loaded(name)? {
            if loaded.machine != self.target.machine() {
                return Err(MapError::IncompatibleModule {
                    module: name.to_string(),
                    pid,
                    reason: format!(
                        "loaded module is {}, process is {}",
                        loaded.machine,
                        self.target.machine()
                    ),
                });
            }
            let exports = self.target.exports(&loaded).in_pid(pid)?;
            tracing::debug!("using {} already loaded at {}", name, loaded.base);
            self.present.insert(
                name.to_string(),
                PresentModule {
                    module: loaded,
                    exports,
                },
            );
            return Ok(());
        }

        let Some(bytes) = self.source.load(name)? else {
            return Err(MapError::ModuleNotFound {
                module: name.to_string(),
                chain: self.chain(Some(name)),
            });
        };
        tracing::debug!("{} is not loaded in pid {}, mapping it", name, pid);
        self.map_module(name, &bytes)
    }

    fn find_loaded(&mut self, name: &str) -> Result<Option<LoadedModule>, MapError> {
        if self.loaded.is_none() {
            self.loaded = Some(self.target.modules().in_pid(self.pid())?);
        }
        Ok(self
            .loaded
            .iter()
            .flatten()
            .find(|m| normalize_module_name(&m.name) == name)
            .cloned())
    }

    /// Address of `symbol` and the name of the module that finally provides it.
    fn resolve_symbol(
        &mut self,
        module: &str,
        symbol: &ImportSymbol,
    ) -> Result<(RemoteAddress, String), MapError> {
        let mut module = module.to_string();
        let mut symbol = symbol.clone();
        for _ in 0..=MAX_FORWARDER_HOPS {
            self.ensure_dependency(&module)?;
            let (base, target) = if let Some(mapped) = self.modules.get(&module) {
                (mapped.base(), mapped.image.exports.lookup(&symbol).cloned())
            } else if let Some(present) = self.present.get(&module) {
                (present.module.base, present.exports.lookup(&symbol).cloned())
            } else {
                return Err(MapError::ModuleNotFound {
                    chain: self.chain(Some(&module)),
                    module,
                });
            };
            match target {
                Some(ExportTarget::Rva(rva)) => return Ok((base.offset(u64::from(rva)), module)),
                Some(ExportTarget::Forward {
                    module: next,
                    symbol: next_symbol,
                }) => {
                    tracing::trace!("{}!{} forwards to {}!{}", module, symbol, next, next_symbol);
                    module = next;
                    symbol = next_symbol;
                }
                None => break,
            }
        }
        Err(MapError::UnresolvedSymbol {
            symbol: symbol.to_string(),
            provider: module,
            chain: self.chain(None),
        })
    }

    fn system_routine(&mut self, module: &'static str, symbol: &'static str) -> Result<RemoteAddress, MapError> {
        if let Some(address) = self.routines.get(symbol) {
            return Ok(*address);
        }
        let address = remote::system_routine(self.target, module, symbol)?;
        self.routines.insert(symbol, address);
        Ok(address)
    }

    fn convention(&self) -> CallingConvention {
        self.target.machine().backend().default_convention()
    }

    fn chain(&self, leaf: Option<&str>) -> DependencyChain {
        let mut chain = self.in_progress.clone();
        chain.extend(leaf.map(str::to_string));
        DependencyChain(chain)
    }

    fn module_mut(&mut self, name: &str) -> Result<&mut MappedModule, MapError> {
        self.modules.get_mut(name).ok_or_else(|| MapError::ModuleNotFound {
            module: name.to_string(),
            chain: DependencyChain::default(),
        })
    }

    fn take_module(&mut self, name: &str) -> Option<MappedModule> {
        self.order.retain(|n| n != name);
        self.deferred.retain(|(n, _)| n != name);
        self.pending_tls.remove(name);
        self.modules.remove(name)
    }

    /// Undoes everything recorded on `module` and frees its region. Every step is attempted;
    /// the first failure is returned.
    fn release(&mut self, module: MappedModule, detach: bool) -> Result<(), MapError> {
        let pid = self.pid();
        let base = module.base();
        let convention = self.convention();
        let mut first_error: Option<MapError> = None;
        let mut note = |step: &str, result: Result<(), MapError>| {
            if let Err(e) = result {
                tracing::warn!("{} of {} failed: {}", step, module.name, e);
                first_error.get_or_insert(e);
            }
        };

        if detach && module.state == ModuleState::Initialized && module.image.is_dll() {
            if let Some(entry) = module.entry_point() {
                let call = RemoteCall::new(entry, convention)
                    .arg(Arg::Ptr(base))
                    .arg(Arg::U32(DLL_PROCESS_DETACH))
                    .arg(Arg::Ptr(RemoteAddress::NULL))
                    .returns(ReturnWidth::Void);
                note("detach notification", self.call(&call).map(drop));
            }
        }
        if let Some(table) = module.function_table {
            let result = self
                .system_routine("ntdll.dll", "RtlDeleteFunctionTable")
                .and_then(|delete| {
                    let call = RemoteCall::new(delete, convention)
                        .arg(Arg::Ptr(table))
                        .returns(ReturnWidth::U32);
                    self.call(&call)
                })
                .map(drop);
            note("function table removal", result);
        }
        if let Some(index) = module.tls_index {
            let result = self
                .system_routine("kernel32.dll", "TlsFree")
                .and_then(|free| {
                    let call = RemoteCall::new(free, convention)
                        .arg(Arg::U32(index))
                        .returns(ReturnWidth::U32);
                    self.call(&call)
                })
                .map(drop);
            note("TLS index release", result);
        }
        if let Some(block) = module.tls_block {
            note("TLS block release", self.target.free(block).in_pid(pid));
        }
        if let Some(entry) = module.loader_entry {
            note("loader unlink", registration::unlink_module(self.target, entry));
        }
        if module.registration == Registration::Hidden {
            if let Some(privileged) = self.privileged {
                note("region restore", privileged.show(module.region));
            }
        }
        note("region release", self.target.free(base).in_pid(pid));

        first_error.map_or(Ok(()), Err)
    }
}
