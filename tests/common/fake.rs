//! An in-memory target process.
//!
//! Memory is a map of allocations. Worker threads are emulated: when a thread is created on
//! a control frame whose wait routine is the fake `WaitForSingleObject`, a host thread plays
//! the worker loop, reading the call target and argument slots straight from the frame and
//! dispatching them to registered handlers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use manmap::arch::{frame, Machine};
use manmap::symbol::{parse_forwarder, ExportDirectory};
use manmap::target::{
    LoadedModule, ModuleEnumerator, PrivilegedService, Protection, RemoteAddress, RemoteHandle,
    RemoteMemory, RemoteRegion, Target, ThreadControl, ThreadInfo,
};
use manmap::TargetError;

pub const PID: u32 = 4242;
pub const KERNEL32_BASE: u64 = 0x7000_0000;
pub const NTDLL_BASE: u64 = 0x7100_0000;
pub const PEB_BASE: u64 = 0x7FF0_0000;
pub const LDR_BASE: u64 = PEB_BASE + 0x800;
pub const ALLOCATION_START: u64 = 0x2000_0000;
const ALLOCATION_GRANULARITY: u64 = 0x10000;

const KERNEL32: &[(&str, u32)] = &[
    ("WaitForSingleObject", 0x1000),
    ("SetEvent", 0x1010),
    ("TlsAlloc", 0x1020),
    ("TlsSetValue", 0x1030),
    ("TlsFree", 0x1040),
];
const NTDLL: &[(&str, u32)] = &[
    ("RtlAddFunctionTable", 0x1000),
    ("RtlDeleteFunctionTable", 0x1010),
    ("RtlAllocateHeap", 0x1020),
];

/// First TLS index handed out by the fake `TlsAlloc`.
pub const FIRST_TLS_INDEX: u64 = 7;

pub type Handler = Arc<dyn Fn(&[u64]) -> u64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub target: u64,
    pub args: Vec<u64>,
}

#[derive(Default)]
struct Memory {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
    blocked: HashSet<u64>,
    protections: Vec<(u64, usize, Protection)>,
}

impl Memory {
    fn find(&self, address: u64, len: usize) -> Option<(u64, usize)> {
        let (&base, bytes) = self.regions.range(..=address).next_back()?;
        let offset = (address - base) as usize;
        (offset + len <= bytes.len()).then_some((base, offset))
    }

    fn overlaps(&self, start: u64, len: usize) -> bool {
        let end = start + len as u64;
        self.regions
            .iter()
            .any(|(&base, bytes)| base < end && start < base + bytes.len() as u64)
    }
}

#[derive(Default)]
struct Events {
    signaled: HashMap<u64, bool>,
    next: u64,
    stopped: HashSet<u32>,
}

struct Inner {
    machine: Machine,
    memory: Mutex<Memory>,
    events: Mutex<Events>,
    events_changed: Condvar,
    handlers: Mutex<HashMap<u64, Handler>>,
    returns: Mutex<HashMap<u64, u64>>,
    calls: Mutex<Vec<CallRecord>>,
    started: Mutex<Vec<(u64, u64)>>,
    threads: Mutex<Vec<ThreadInfo>>,
    next_thread: AtomicU32,
    modules: Mutex<Vec<(LoadedModule, ExportDirectory)>>,
    fail_unconstrained: AtomicBool,
    fail_threads: AtomicBool,
}

#[derive(Clone)]
pub struct FakeProcess {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FakeProcess {
    pub fn new(machine: Machine) -> Self {
        let fake = Self {
            inner: Arc::new(Inner {
                machine,
                memory: Mutex::new(Memory {
                    next: ALLOCATION_START,
                    ..Memory::default()
                }),
                events: Mutex::new(Events {
                    next: 0x100,
                    ..Events::default()
                }),
                events_changed: Condvar::new(),
                handlers: Mutex::new(HashMap::new()),
                returns: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                started: Mutex::new(Vec::new()),
                threads: Mutex::new(vec![
                    ThreadInfo { id: 100, start_time: 10, exec_time: 500 },
                    ThreadInfo { id: 101, start_time: 20, exec_time: 5 },
                    ThreadInfo { id: 102, start_time: 30, exec_time: 50 },
                ]),
                next_thread: AtomicU32::new(1000),
                modules: Mutex::new(Vec::new()),
                fail_unconstrained: AtomicBool::new(false),
                fail_threads: AtomicBool::new(false),
            }),
        };

        let mut kernel32 = export_table(KERNEL32);
        kernel32.insert(
            100,
            Some("HeapAlloc".to_string()),
            parse_forwarder(b"NTDLL", b"RtlAllocateHeap"),
        );
        fake.add_module("kernel32.dll", KERNEL32_BASE, machine, kernel32);
        fake.add_module("ntdll.dll", NTDLL_BASE, machine, export_table(NTDLL));

        let tls_index = Arc::new(AtomicU64::new(FIRST_TLS_INDEX));
        fake.on_call(
            fake.routine("TlsAlloc"),
            Arc::new(move |_| tls_index.fetch_add(1, Ordering::SeqCst)),
        );
        fake.init_peb();
        fake
    }

    fn init_peb(&self) {
        let (width, peb_ldr, heads): (usize, u64, [u64; 3]) = match self.inner.machine {
            Machine::X64 => (8, 0x18, [0x10, 0x20, 0x30]),
            Machine::X86 => (4, 0x0C, [0x0C, 0x14, 0x1C]),
        };
        lock(&self.inner.memory)
            .regions
            .insert(PEB_BASE, vec![0; 0x1000]);
        let put = |address: u64, value: u64| {
            self.poke(address, &value.to_le_bytes()[..width]);
        };
        put(PEB_BASE + peb_ldr, LDR_BASE);
        for head in heads {
            let head = LDR_BASE + head;
            put(head, head);
            put(head + width as u64, head);
        }
    }

    pub fn machine(&self) -> Machine {
        self.inner.machine
    }

    /// Address of a fake kernel32/ntdll routine.
    pub fn routine(&self, name: &str) -> u64 {
        KERNEL32
            .iter()
            .map(|&(n, rva)| (n, KERNEL32_BASE + u64::from(rva)))
            .chain(NTDLL.iter().map(|&(n, rva)| (n, NTDLL_BASE + u64::from(rva))))
            .find(|(n, _)| *n == name)
            .map(|(_, address)| address)
            .unwrap_or_else(|| panic!("no fake routine {name}"))
    }

    pub fn add_module(&self, name: &str, base: u64, machine: Machine, exports: ExportDirectory) {
        let module = LoadedModule {
            name: name.to_string(),
            base: RemoteAddress(base),
            size: 0x10000,
            machine,
        };
        lock(&self.inner.modules).push((module, exports));
    }

    pub fn on_call(&self, target: u64, handler: Handler) {
        lock(&self.inner.handlers).insert(target, handler);
    }

    /// Return value for calls to `target` that have no handler. The default is 1.
    pub fn set_return(&self, target: u64, value: u64) {
        lock(&self.inner.returns).insert(target, value);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.inner.calls).clone()
    }

    pub fn calls_to(&self, target: u64) -> Vec<Vec<u64>> {
        self.calls()
            .into_iter()
            .filter(|c| c.target == target)
            .map(|c| c.args)
            .collect()
    }

    /// Threads created on anything but the worker loop, as `(entry, argument)`.
    pub fn started_threads(&self) -> Vec<(u64, u64)> {
        lock(&self.inner.started).clone()
    }

    pub fn set_threads(&self, threads: Vec<ThreadInfo>) {
        *lock(&self.inner.threads) = threads;
    }

    pub fn protections(&self) -> Vec<(u64, usize, Protection)> {
        lock(&self.inner.memory).protections.clone()
    }

    /// Makes allocations at exactly `address` fail.
    pub fn block(&self, address: u64) {
        lock(&self.inner.memory).blocked.insert(address);
    }

    /// Makes allocations without a preferred address fail.
    pub fn fail_unconstrained(&self) {
        self.inner.fail_unconstrained.store(true, Ordering::SeqCst);
    }

    /// Makes `create_thread` fail.
    pub fn fail_threads(&self) {
        self.inner.fail_threads.store(true, Ordering::SeqCst);
    }

    pub fn open_events(&self) -> usize {
        lock(&self.inner.events).signaled.len()
    }

    pub fn is_allocated(&self, base: u64) -> bool {
        lock(&self.inner.memory).regions.contains_key(&base)
    }

    pub fn allocation_count(&self) -> usize {
        lock(&self.inner.memory).regions.len()
    }

    pub fn read_bytes(&self, address: u64, len: usize) -> Vec<u8> {
        self.read(RemoteAddress(address), len)
            .unwrap_or_else(|e| panic!("read of {address:#x}: {e}"))
    }

    pub fn read_u32(&self, address: u64) -> u32 {
        let bytes = self.read_bytes(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn read_u64(&self, address: u64) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.read_bytes(address, 8));
        u64::from_le_bytes(bytes)
    }

    /// Reads a pointer of the process's width.
    pub fn read_ptr(&self, address: u64) -> u64 {
        match self.inner.machine {
            Machine::X64 => self.read_u64(address),
            Machine::X86 => u64::from(self.read_u32(address)),
        }
    }

    fn poke(&self, address: u64, bytes: &[u8]) {
        self.write(RemoteAddress(address), bytes)
            .unwrap_or_else(|e| panic!("write of {address:#x}: {e}"));
    }

    fn dispatch(&self, target: u64, args: Vec<u64>) -> u64 {
        lock(&self.inner.calls).push(CallRecord {
            target,
            args: args.clone(),
        });
        let handler = lock(&self.inner.handlers).get(&target).cloned();
        match handler {
            Some(handler) => handler(&args),
            None => lock(&self.inner.returns).get(&target).copied().unwrap_or(1),
        }
    }

    /// Parks worker `id` on `event`. Returns `false` once the thread was terminated.
    fn park(&self, id: u32, event: u64) -> bool {
        let mut events = lock(&self.inner.events);
        loop {
            if events.stopped.contains(&id) {
                return false;
            }
            match events.signaled.get_mut(&event) {
                None => return false,
                Some(signaled) if *signaled => {
                    *signaled = false;
                    return true;
                }
                Some(_) => {}
            }
            events = self
                .inner
                .events_changed
                .wait_timeout(events, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn run_worker(self, id: u32, frame_base: u64) {
        let width = self.inner.machine.pointer_size();
        let field = |offset: u32| frame_base + u64::from(offset);
        loop {
            let Ok(request) = self.read(RemoteAddress(field(frame::REQUEST_EVENT)), 8) else {
                return;
            };
            if !self.park(id, le_u64(&request)) {
                return;
            }
            let target = self.read_u64(field(frame::CALL_TARGET));
            let count = self.read_u64(field(frame::SLOT_COUNT)) as usize;
            let args = self
                .read_bytes(field(frame::SLOTS), count * width)
                .chunks(width)
                .map(le_u64)
                .collect();
            let result = self.dispatch(target, args);
            self.poke(field(frame::RESULT), &result.to_le_bytes());
            let done = self.read_u64(field(frame::DONE_EVENT));
            if self.signal_event(RemoteHandle(done)).is_err() {
                return;
            }
        }
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Export directory with ordinals starting at 1.
pub fn export_table(exports: &[(&str, u32)]) -> ExportDirectory {
    let mut directory = ExportDirectory::new();
    for (i, &(name, rva)) in exports.iter().enumerate() {
        directory.insert_rva(i as u32 + 1, name, rva);
    }
    directory
}

impl RemoteMemory for FakeProcess {
    fn read(&self, address: RemoteAddress, len: usize) -> Result<Vec<u8>, TargetError> {
        let memory = lock(&self.inner.memory);
        let (base, offset) = memory
            .find(address.get(), len)
            .ok_or_else(|| TargetError::failed("read", format!("{len:#x} bytes at {address} not mapped")))?;
        Ok(memory.regions[&base][offset..offset + len].to_vec())
    }

    fn write(&self, address: RemoteAddress, bytes: &[u8]) -> Result<(), TargetError> {
        let mut memory = lock(&self.inner.memory);
        let (base, offset) = memory.find(address.get(), bytes.len()).ok_or_else(|| {
            TargetError::failed("write", format!("{:#x} bytes at {address} not mapped", bytes.len()))
        })?;
        let region = memory
            .regions
            .get_mut(&base)
            .ok_or_else(|| TargetError::failed("write", "region vanished"))?;
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn allocate(
        &self,
        size: usize,
        preferred: Option<RemoteAddress>,
        _protection: Protection,
    ) -> Result<RemoteAddress, TargetError> {
        let size = (size + 0xFFF) & !0xFFF;
        let mut memory = lock(&self.inner.memory);
        let base = match preferred {
            Some(address) => {
                let address = address.get();
                if memory.blocked.contains(&address) || memory.overlaps(address, size) {
                    return Err(TargetError::failed("allocate", format!("{address:#x} is in use")));
                }
                address
            }
            None => {
                if self.inner.fail_unconstrained.load(Ordering::SeqCst) {
                    return Err(TargetError::failed("allocate", "out of address space"));
                }
                let base = memory.next;
                let step = (size as u64).div_ceil(ALLOCATION_GRANULARITY) * ALLOCATION_GRANULARITY;
                memory.next += step + ALLOCATION_GRANULARITY;
                base
            }
        };
        memory.regions.insert(base, vec![0; size]);
        Ok(RemoteAddress(base))
    }

    fn free(&self, address: RemoteAddress) -> Result<(), TargetError> {
        lock(&self.inner.memory)
            .regions
            .remove(&address.get())
            .map(drop)
            .ok_or_else(|| TargetError::failed("free", format!("{address} is not an allocation")))
    }

    fn protect(
        &self,
        address: RemoteAddress,
        len: usize,
        protection: Protection,
    ) -> Result<Protection, TargetError> {
        let mut memory = lock(&self.inner.memory);
        if memory.find(address.get(), len).is_none() {
            return Err(TargetError::failed("protect", format!("{address} not mapped")));
        }
        memory.protections.push((address.get(), len, protection));
        Ok(Protection::ExecuteReadWrite)
    }
}

impl ModuleEnumerator for FakeProcess {
    fn modules(&self) -> Result<Vec<LoadedModule>, TargetError> {
        Ok(lock(&self.inner.modules).iter().map(|(m, _)| m.clone()).collect())
    }

    fn exports(&self, module: &LoadedModule) -> Result<ExportDirectory, TargetError> {
        lock(&self.inner.modules)
            .iter()
            .find(|(m, _)| m == module)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| TargetError::failed("exports", format!("{} is not loaded", module.name)))
    }

    fn peb_address(&self) -> Result<RemoteAddress, TargetError> {
        Ok(RemoteAddress(PEB_BASE))
    }
}

impl ThreadControl for FakeProcess {
    fn create_thread(&self, entry: RemoteAddress, argument: RemoteAddress) -> Result<u32, TargetError> {
        if self.inner.fail_threads.load(Ordering::SeqCst) {
            return Err(TargetError::failed("create_thread", "thread creation disabled"));
        }
        let id = self.inner.next_thread.fetch_add(1, Ordering::SeqCst);
        let wait_routine = self
            .read(argument.offset(u64::from(frame::WAIT_ROUTINE)), 8)
            .map(|b| le_u64(&b))
            .ok();
        if wait_routine == Some(self.routine("WaitForSingleObject")) {
            let worker = self.clone();
            let frame_base = argument.get();
            std::thread::spawn(move || worker.run_worker(id, frame_base));
        } else {
            lock(&self.inner.started).push((entry.get(), argument.get()));
        }
        Ok(id)
    }

    fn terminate_thread(&self, id: u32) -> Result<(), TargetError> {
        lock(&self.inner.events).stopped.insert(id);
        self.inner.events_changed.notify_all();
        Ok(())
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>, TargetError> {
        Ok(lock(&self.inner.threads).clone())
    }

    fn create_event(&self) -> Result<RemoteHandle, TargetError> {
        let mut events = lock(&self.inner.events);
        let handle = events.next;
        events.next += 4;
        events.signaled.insert(handle, false);
        Ok(RemoteHandle(handle))
    }

    fn close_event(&self, event: RemoteHandle) -> Result<(), TargetError> {
        let removed = lock(&self.inner.events).signaled.remove(&event.0);
        self.inner.events_changed.notify_all();
        removed
            .map(drop)
            .ok_or_else(|| TargetError::failed("close_event", format!("unknown handle {:#x}", event.0)))
    }

    fn signal_event(&self, event: RemoteHandle) -> Result<(), TargetError> {
        let mut events = lock(&self.inner.events);
        let signaled = events
            .signaled
            .get_mut(&event.0)
            .ok_or_else(|| TargetError::failed("signal_event", format!("unknown handle {:#x}", event.0)))?;
        *signaled = true;
        drop(events);
        self.inner.events_changed.notify_all();
        Ok(())
    }

    fn wait_event(&self, event: RemoteHandle, timeout: Duration) -> Result<bool, TargetError> {
        let deadline = Instant::now() + timeout;
        let mut events = lock(&self.inner.events);
        loop {
            match events.signaled.get_mut(&event.0) {
                None => {
                    return Err(TargetError::failed("wait_event", format!("unknown handle {:#x}", event.0)))
                }
                Some(signaled) if *signaled => {
                    *signaled = false;
                    return Ok(true);
                }
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            events = self
                .inner
                .events_changed
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

impl Target for FakeProcess {
    fn pid(&self) -> u32 {
        PID
    }

    fn machine(&self) -> Machine {
        self.inner.machine
    }
}

/// Privileged service that records what it was asked to do.
#[derive(Default)]
pub struct FakePrivileged {
    deny: bool,
    hidden: Mutex<Vec<RemoteRegion>>,
    shown: Mutex<Vec<RemoteRegion>>,
    requests: Mutex<Vec<String>>,
}

impl FakePrivileged {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn hidden(&self) -> Vec<RemoteRegion> {
        lock(&self.hidden).clone()
    }

    pub fn shown(&self) -> Vec<RemoteRegion> {
        lock(&self.shown).clone()
    }

    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }

    fn check(&self, operation: &'static str) -> Result<(), TargetError> {
        if self.deny {
            return Err(TargetError::Denied { operation });
        }
        lock(&self.requests).push(operation.to_string());
        Ok(())
    }
}

impl PrivilegedService for FakePrivileged {
    fn hide_region(&self, _pid: u32, region: RemoteRegion) -> Result<(), TargetError> {
        self.check("hide_region")?;
        lock(&self.hidden).push(region);
        Ok(())
    }

    fn show_region(&self, _pid: u32, region: RemoteRegion) -> Result<(), TargetError> {
        self.check("show_region")?;
        lock(&self.shown).push(region);
        Ok(())
    }

    fn grant_access(&self, _pid: u32, _handle: RemoteHandle, _access: u32) -> Result<(), TargetError> {
        self.check("grant_access")
    }

    fn set_protection(&self, _pid: u32, _enabled: bool) -> Result<(), TargetError> {
        self.check("set_protection")
    }

    fn disable_dep(&self, _pid: u32) -> Result<(), TargetError> {
        self.check("disable_dep")
    }
}
