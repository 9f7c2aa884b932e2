//! Remote execution engine.
//!
//! A persistent call gateway into the target. Each `Worker` is one remote thread running the
//! architecture's worker loop over a control frame (see `arch::frame`); it parks on a request
//! event, runs the per-call thunk, stores the result and signals a done event. Calls through
//! one worker are serialized; an executor may own several workers.
//!
//! Worker region layout:
//!
//! | offset  | contents                         |
//! |---------|----------------------------------|
//! | 0x000   | worker loop stub                 |
//! | 0x100   | control frame                    |
//! | 0x200   | call thunk, rewritten per call   |
//! | 0x400   | argument data area               |

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::arch::{frame, CallingConvention, Machine};
use crate::error::{DependencyChain, MapError, TargetResultExt};
use crate::resolver::normalize_module_name;
use crate::symbol::{ExportTarget, ImportSymbol};
use crate::target::{Protection, RemoteAddress, RemoteHandle, RemoteRegion, Target};
use crate::utils::{align_up, utf16z};

const STUB_OFFSET: u64 = 0x000;
const STUB_SIZE: usize = 0x100;
pub const FRAME_OFFSET: u64 = 0x100;
const THUNK_OFFSET: u64 = 0x200;
const THUNK_SIZE: usize = 0x200;
const DATA_OFFSET: u64 = 0x400;
pub const WORKER_REGION_SIZE: usize = 0x2000;

const MAX_FORWARDER_HOPS: usize = 16;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One argument of a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    U32(u32),
    /// Takes two slots on x86 (low dword first).
    U64(u64),
    Ptr(RemoteAddress),
    /// Copied into the worker's data area; the callee receives its address.
    Bytes(Vec<u8>),
}

impl Arg {
    /// NUL-terminated narrow string, passed by pointer.
    pub fn c_str(s: &str) -> Arg {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        Arg::Bytes(bytes)
    }

    /// NUL-terminated UTF-16 string, passed by pointer.
    pub fn wide_str(s: &str) -> Arg {
        Arg::Bytes(utf16z(s))
    }
}

/// How much of the raw result the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnWidth {
    Void,
    U32,
    U64,
    Ptr,
}

/// One invocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub target: RemoteAddress,
    pub convention: CallingConvention,
    pub args: Vec<Arg>,
    pub returns: ReturnWidth,
}

impl RemoteCall {
    pub fn new(target: RemoteAddress, convention: CallingConvention) -> Self {
        Self {
            target,
            convention,
            args: Vec::new(),
            returns: ReturnWidth::Ptr,
        }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn returns(mut self, width: ReturnWidth) -> Self {
        self.returns = width;
        self
    }
}

/// Argument slots and data-area contents produced by marshaling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Marshaled {
    slots: Vec<u64>,
    data: Vec<u8>,
}

fn marshal(machine: Machine, data_base: RemoteAddress, call: &RemoteCall) -> Result<Marshaled, MapError> {
    let invalid = |reason: String| MapError::InvalidCall { reason };
    if !machine.backend().supports(call.convention) {
        return Err(invalid(format!("{:?} is not available on {machine}", call.convention)));
    }

    let data_capacity = WORKER_REGION_SIZE - DATA_OFFSET as usize;
    let mut out = Marshaled::default();
    for arg in &call.args {
        match arg {
            Arg::U32(v) => out.slots.push(u64::from(*v)),
            Arg::U64(v) if machine.is_64() => out.slots.push(*v),
            Arg::U64(v) => {
                out.slots.push(*v & 0xFFFF_FFFF);
                out.slots.push(*v >> 32);
            }
            Arg::Ptr(p) => {
                if !machine.is_64() && p.get() > u64::from(u32::MAX) {
                    return Err(invalid(format!("pointer {p} does not fit a 32-bit target")));
                }
                out.slots.push(p.get());
            }
            Arg::Bytes(bytes) => {
                let at = align_up(out.data.len() as u64, 16) as usize;
                if at + bytes.len() > data_capacity {
                    return Err(invalid(format!(
                        "{} bytes of buffer arguments exceed the {:#x}-byte data area",
                        at + bytes.len(),
                        data_capacity
                    )));
                }
                out.data.resize(at, 0);
                out.data.extend_from_slice(bytes);
                out.slots.push(data_base.offset(at as u64).get());
            }
        }
    }
    if out.slots.len() > machine.max_slots() {
        return Err(invalid(format!(
            "{} argument slots, at most {} fit",
            out.slots.len(),
            machine.max_slots()
        )));
    }
    Ok(out)
}

fn truncate_result(machine: Machine, raw: u64, width: ReturnWidth) -> u64 {
    match width {
        ReturnWidth::Void => 0,
        ReturnWidth::U32 => raw & 0xFFFF_FFFF,
        ReturnWidth::U64 => raw,
        ReturnWidth::Ptr if machine.is_64() => raw,
        ReturnWidth::Ptr => raw & 0xFFFF_FFFF,
    }
}

/// A persistent remote thread and its event pair.
#[derive(Debug)]
struct Worker {
    region: RemoteRegion,
    request: RemoteHandle,
    done: RemoteHandle,
    thread: u32,
    /// Target of a call that timed out and may still be running.
    pending: Option<RemoteAddress>,
}

impl Worker {
    fn frame(&self, field: u32, len: usize) -> Result<RemoteAddress, MapError> {
        self.region.at(FRAME_OFFSET + u64::from(field), len)
    }
}

/// Runs functions inside the target through one or more workers.
pub struct RemoteExecutor<'t> {
    target: &'t dyn Target,
    machine: Machine,
    timeout: Duration,
    wait_routine: RemoteAddress,
    signal_routine: RemoteAddress,
    workers: Vec<Mutex<Worker>>,
    next: AtomicUsize,
}

impl<'t> RemoteExecutor<'t> {
    /// Resolves the wait/signal routines the worker loop needs and starts the first worker.
    pub fn new(target: &'t dyn Target, timeout: Duration) -> Result<Self, MapError> {
        let wait_routine = system_routine(target, "kernel32.dll", "WaitForSingleObject")?;
        let signal_routine = system_routine(target, "kernel32.dll", "SetEvent")?;
        let mut executor = Self {
            target,
            machine: target.machine(),
            timeout,
            wait_routine,
            signal_routine,
            workers: Vec::new(),
            next: AtomicUsize::new(0),
        };
        executor.spawn_worker()?;
        Ok(executor)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Starts another worker so independent calls can run concurrently. Returns its index.
    pub fn spawn_worker(&mut self) -> Result<usize, MapError> {
        let pid = self.target.pid();
        let base = self
            .target
            .allocate(WORKER_REGION_SIZE, None, Protection::ExecuteReadWrite)
            .map_err(|source| MapError::RemoteAllocationFailed {
                module: "<worker>".to_string(),
                size: WORKER_REGION_SIZE,
                pid,
                source,
            })?;
        let region = RemoteRegion::new(base, WORKER_REGION_SIZE);

        match self.start_worker(region) {
            Ok(worker) => {
                tracing::debug!(
                    "worker {} started in pid {} (thread {}, frame {})",
                    self.workers.len(),
                    pid,
                    worker.thread,
                    region.base().offset(FRAME_OFFSET)
                );
                self.workers.push(Mutex::new(worker));
                Ok(self.workers.len() - 1)
            }
            Err(e) => {
                if let Err(free) = self.target.free(base) {
                    tracing::warn!("failed to free worker region {}: {}", base, free);
                }
                Err(e)
            }
        }
    }

    fn start_worker(&self, region: RemoteRegion) -> Result<Worker, MapError> {
        let pid = self.target.pid();
        let backend = self.machine.backend();

        let stub = backend.worker_stub();
        debug_assert!(stub.len() <= STUB_SIZE);
        self.target
            .write(region.at(STUB_OFFSET, stub.len())?, &stub)
            .in_pid(pid)?;

        let request = self.target.create_event().in_pid(pid)?;
        let done = match self.target.create_event().in_pid(pid) {
            Ok(done) => done,
            Err(e) => {
                self.close_quietly(request);
                return Err(e);
            }
        };

        let mut header = vec![0u8; frame::SLOTS as usize];
        let mut put = |field: u32, value: u64| {
            let at = field as usize;
            header[at..at + 8].copy_from_slice(&value.to_le_bytes());
        };
        put(frame::REQUEST_EVENT, request.0);
        put(frame::DONE_EVENT, done.0);
        put(frame::WAIT_ROUTINE, self.wait_routine.get());
        put(frame::SIGNAL_ROUTINE, self.signal_routine.get());
        put(frame::THUNK, region.base().offset(THUNK_OFFSET).get());

        let started = self
            .target
            .write(region.at(FRAME_OFFSET, header.len())?, &header)
            .in_pid(pid)
            .and_then(|()| {
                self.target
                    .create_thread(region.base().offset(STUB_OFFSET), region.base().offset(FRAME_OFFSET))
                    .in_pid(pid)
            });
        match started {
            Ok(thread) => Ok(Worker {
                region,
                request,
                done,
                thread,
                pending: None,
            }),
            Err(e) => {
                self.close_quietly(request);
                self.close_quietly(done);
                Err(e)
            }
        }
    }

    /// Closes an event on a failure path, where the original error is the one reported.
    fn close_quietly(&self, event: RemoteHandle) {
        if let Err(e) = self.target.close_event(event) {
            tracing::warn!(
                "failed to close event {:#x} in pid {}: {}",
                event.0,
                self.target.pid(),
                e
            );
        }
    }

    /// Calls `call.target` inside the target and returns the result truncated to
    /// `call.returns`.
    ///
    /// On `RemoteCallTimeout` the worker stays usable; the next call through it first waits
    /// for the timed-out one to finish.
    pub fn call(&self, call: &RemoteCall) -> Result<u64, MapError> {
        let worker = self.acquire();
        let mut worker = worker.lock().unwrap_or_else(PoisonError::into_inner);
        self.call_on(&mut worker, call)
    }

    fn acquire(&self) -> &Mutex<Worker> {
        for worker in &self.workers {
            if let Ok(guard) = worker.try_lock() {
                drop(guard);
                return worker;
            }
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    fn call_on(&self, worker: &mut Worker, call: &RemoteCall) -> Result<u64, MapError> {
        let pid = self.target.pid();
        let data_base = worker.region.base().offset(DATA_OFFSET);
        let marshaled = marshal(self.machine, data_base, call)?;

        if let Some(stale) = worker.pending {
            tracing::debug!("waiting for timed-out call to {} to finish", stale);
            if !self.target.wait_event(worker.done, self.timeout).in_pid(pid)? {
                return Err(MapError::RemoteCallTimeout {
                    target: stale,
                    pid,
                    timeout: self.timeout,
                });
            }
            worker.pending = None;
        }

        let thunk = self.machine.backend().call_thunk(call.convention, marshaled.slots.len());
        debug_assert!(thunk.len() <= THUNK_SIZE);
        self.target
            .write(worker.region.at(THUNK_OFFSET, thunk.len())?, &thunk)
            .in_pid(pid)?;
        if !marshaled.data.is_empty() {
            self.target
                .write(worker.region.at(DATA_OFFSET, marshaled.data.len())?, &marshaled.data)
                .in_pid(pid)?;
        }

        // RESULT, CALL_TARGET, SLOT_COUNT, then the slots.
        let width = self.machine.pointer_size();
        let mut request = vec![0u8; (frame::SLOTS - frame::RESULT) as usize + marshaled.slots.len() * width];
        let rel = |field: u32| (field - frame::RESULT) as usize;
        request[rel(frame::CALL_TARGET)..rel(frame::CALL_TARGET) + 8]
            .copy_from_slice(&call.target.get().to_le_bytes());
        request[rel(frame::SLOT_COUNT)..rel(frame::SLOT_COUNT) + 8]
            .copy_from_slice(&(marshaled.slots.len() as u64).to_le_bytes());
        for (i, slot) in marshaled.slots.iter().enumerate() {
            let at = rel(frame::SLOTS) + i * width;
            request[at..at + width].copy_from_slice(&slot.to_le_bytes()[..width]);
        }
        self.target
            .write(worker.frame(frame::RESULT, request.len())?, &request)
            .in_pid(pid)?;

        tracing::trace!(
            "calling {} ({:?}, {} slots) on thread {}",
            call.target,
            call.convention,
            marshaled.slots.len(),
            worker.thread
        );
        self.target.signal_event(worker.request).in_pid(pid)?;
        if !self.target.wait_event(worker.done, self.timeout).in_pid(pid)? {
            tracing::warn!("call to {} in pid {} timed out after {:?}", call.target, pid, self.timeout);
            worker.pending = Some(call.target);
            return Err(MapError::RemoteCallTimeout {
                target: call.target,
                pid,
                timeout: self.timeout,
            });
        }

        let raw = self
            .target
            .read(worker.frame(frame::RESULT, 8)?, 8)
            .in_pid(pid)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[..8.min(raw.len())]);
        Ok(truncate_result(self.machine, u64::from_le_bytes(bytes), call.returns))
    }

    /// Stops every worker and releases its thread, events and region.
    pub fn shutdown(self) -> Result<(), MapError> {
        let pid = self.target.pid();
        let mut first_error = None;
        for worker in self.workers {
            let worker = worker.into_inner().unwrap_or_else(PoisonError::into_inner);
            let steps = [
                self.target.terminate_thread(worker.thread),
                self.target.close_event(worker.request),
                self.target.close_event(worker.done),
                self.target.free(worker.region.base()),
            ];
            for result in steps {
                if let Err(e) = result {
                    tracing::warn!("worker cleanup in pid {} failed: {}", pid, e);
                    first_error.get_or_insert(MapError::from_target(pid, e));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Address of an export of a module the target's own loader already has, following
/// forwarders between loaded modules.
pub fn system_routine(target: &dyn Target, module: &str, symbol: &str) -> Result<RemoteAddress, MapError> {
    let pid = target.pid();
    let loaded = target.modules().in_pid(pid)?;
    let mut module = normalize_module_name(module);
    let mut symbol = ImportSymbol::Name(symbol.to_string());
    let unresolved = |module: &str, symbol: &ImportSymbol| MapError::UnresolvedSymbol {
        symbol: symbol.to_string(),
        provider: module.to_string(),
        chain: DependencyChain::default(),
    };

    for _ in 0..MAX_FORWARDER_HOPS {
        let Some(found) = loaded
            .iter()
            .find(|m| normalize_module_name(&m.name) == module)
        else {
            return Err(MapError::ModuleNotFound {
                module,
                chain: DependencyChain::default(),
            });
        };
        let exports = target.exports(found).in_pid(pid)?;
        match exports.lookup(&symbol) {
            Some(ExportTarget::Rva(rva)) => return Ok(found.base.offset(u64::from(*rva))),
            Some(ExportTarget::Forward { module: next, symbol: next_symbol }) => {
                module = next.clone();
                symbol = next_symbol.clone();
            }
            None => return Err(unresolved(&module, &symbol)),
        }
    }
    Err(unresolved(&module, &symbol))
}
