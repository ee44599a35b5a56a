//! # Mock Kernel
//!
//! An in-memory [`Kernel`] for exercising the engine without a live target:
//! regions with backing bytes, threads with suspend counts and register state,
//! an exception inbox, and per-operation failure injection.
//!
//! `MockKernel` is a cheap handle around shared state, so a test can hand a
//! clone to [`Task::with_kernel`](crate::Task::with_kernel) and keep another
//! to script and inspect the target.
//!
//! ## Example
//!
//! ```rust
//! use mdb_core::mock::MockKernel;
//! use mdb_core::kernel::Protection;
//! use mdb_core::{MemoryRange, ProcessId, Task};
//!
//! let kernel = MockKernel::new().with_region(0x1000, Protection::READ, b"hello".to_vec());
//! let mut task = Task::with_kernel(ProcessId::from(1), kernel.clone());
//! task.attach()?;
//! let region = task.find_region(0)?.expect("mapped");
//! assert_eq!(region.read_all()?, b"hello");
//! # Ok::<(), mdb_core::MdbError>(())
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::kern_return::{
    KernReturn, KernelError, KERN_FAILURE, KERN_INVALID_ADDRESS, KERN_INVALID_ARGUMENT, KERN_INVALID_NAME,
    KERN_PROTECTION_FAILURE, MACH_RCV_INVALID_NAME, MACH_RCV_TIMED_OUT, MACH_RCV_TOO_LARGE,
};
use crate::kernel::{
    ExceptionBehavior, ExceptionMask, KernResult, Kernel, MessageBuffer, PortName, Protection, RegionInfo,
    MESSAGE_BUFFER_SIZE, PORT_NULL,
};
use crate::message::ExceptionRequest;
use crate::types::{ProcessId, TaskBasicInfo, ThreadStateFlavor, X86ThreadState32, X86ThreadState64};

/// Task port handed out by `task_for_pid` unless overridden.
pub const DEFAULT_TASK_PORT: PortName = 7;

const FIRST_DYNAMIC_PORT: PortName = 0x1003;

/// Kernel primitive, used to inject failures and inspect the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op
{
    TaskForPid,
    TaskBasicInfo,
    TaskThreads,
    AllocateReceivePort,
    InsertSendRight,
    SetExceptionPorts,
    DestroyPort,
    DeallocatePort,
    Region,
    ReadOverwrite,
    Write,
    ThreadSuspend,
    ThreadResume,
    ThreadAbortSafely,
    ThreadGetState,
    ThreadSetState,
    ReceiveMessage,
    SendMessage,
}

/// One recorded kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call
{
    pub op: Op,
    /// Port argument, if the primitive takes one
    pub port: PortName,
    /// Flavor, address or mask argument, depending on `op`
    pub arg: u64,
}

/// Current exception-port registration of the mock task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRegistration
{
    pub mask: ExceptionMask,
    pub port: PortName,
    pub behavior: ExceptionBehavior,
    pub flavor: i32,
}

#[derive(Debug, Clone)]
struct MockRegion
{
    info: RegionInfo,
    bytes: Vec<u8>,
}

impl MockRegion
{
    fn end(&self) -> u64
    {
        self.info.address.saturating_add(self.info.size)
    }

    fn contains(&self, address: u64) -> bool
    {
        address >= self.info.address && address < self.end()
    }
}

#[derive(Debug, Clone, Default)]
struct MockThread
{
    suspend_count: i32,
    aborts: u32,
    wide: Option<X86ThreadState64>,
    narrow: Option<X86ThreadState32>,
}

#[derive(Debug, Clone, Copy)]
struct Failure
{
    code: KernReturn,
    remaining: Option<usize>,
}

#[derive(Debug)]
struct MockState
{
    task_port: PortName,
    next_port: PortName,
    basic_info: TaskBasicInfo,
    regions: Vec<MockRegion>,
    threads: BTreeMap<PortName, MockThread>,
    read_limit: Option<usize>,
    failures: HashMap<Op, Failure>,
    calls: Vec<Call>,
    released: Vec<PortName>,
    receive_ports: BTreeSet<PortName>,
    send_rights: BTreeSet<PortName>,
    registration: Option<ExceptionRegistration>,
    inbox: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

impl Default for MockState
{
    fn default() -> Self
    {
        Self {
            task_port: DEFAULT_TASK_PORT,
            next_port: FIRST_DYNAMIC_PORT,
            basic_info: TaskBasicInfo {
                virtual_size: 4096,
                resident_size: 4096,
                ..TaskBasicInfo::default()
            },
            regions: Vec::new(),
            threads: BTreeMap::new(),
            read_limit: None,
            failures: HashMap::new(),
            calls: Vec::new(),
            released: Vec::new(),
            receive_ports: BTreeSet::new(),
            send_rights: BTreeSet::new(),
            registration: None,
            inbox: VecDeque::new(),
            sent: Vec::new(),
        }
    }
}

impl MockState
{
    /// Log the call and apply any injected failure for it.
    fn enter(&mut self, op: Op, port: PortName, arg: u64) -> KernResult<()>
    {
        self.calls.push(Call { op, port, arg });
        let Some(failure) = self.failures.get(&op).copied() else {
            return Ok(());
        };
        match failure.remaining {
            Some(remaining) if remaining <= 1 => {
                self.failures.remove(&op);
            }
            Some(remaining) => {
                self.failures.insert(
                    op,
                    Failure {
                        remaining: Some(remaining - 1),
                        ..failure
                    },
                );
            }
            None => {}
        }
        Err(KernelError::new(failure.code))
    }

    fn allocate_name(&mut self) -> PortName
    {
        let port = self.next_port;
        self.next_port += 0x100;
        port
    }

    fn check_task(&self, task: PortName) -> KernResult<()>
    {
        if task == self.task_port {
            Ok(())
        } else {
            Err(KernelError::new(KERN_INVALID_ARGUMENT))
        }
    }

    fn thread(&mut self, thread: PortName) -> KernResult<&mut MockThread>
    {
        self.threads
            .get_mut(&thread)
            .ok_or_else(|| KernelError::new(KERN_INVALID_ARGUMENT))
    }

    fn region_at(&mut self, address: u64) -> KernResult<&mut MockRegion>
    {
        self.regions
            .iter_mut()
            .find(|region| region.contains(address))
            .ok_or_else(|| KernelError::new(KERN_INVALID_ADDRESS))
    }
}

/// Scriptable in-memory Mach target.
#[derive(Debug, Clone, Default)]
pub struct MockKernel
{
    state: Arc<Mutex<MockState>>,
}

impl MockKernel
{
    /// Empty target: task port 7, no regions, no threads.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_task_port(self, port: PortName) -> Self
    {
        self.state().task_port = port;
        self
    }

    #[must_use]
    pub fn with_basic_info(self, info: TaskBasicInfo) -> Self
    {
        self.state().basic_info = info;
        self
    }

    /// Map `bytes` at `address` with `protection`.
    #[must_use]
    pub fn with_region(self, address: u64, protection: Protection, bytes: Vec<u8>) -> Self
    {
        let info = RegionInfo {
            address,
            size: bytes.len() as u64,
            protection,
            max_protection: Protection::all(),
            ..RegionInfo::default()
        };
        self.with_region_info(info, bytes)
    }

    /// Map a region with explicit attributes. `bytes` is zero-padded or cut to `info.size`.
    #[must_use]
    pub fn with_region_info(self, info: RegionInfo, mut bytes: Vec<u8>) -> Self
    {
        bytes.resize(usize::try_from(info.size).unwrap_or(usize::MAX), 0);
        {
            let mut state = self.state();
            state.regions.push(MockRegion { info, bytes });
            state.regions.sort_by_key(|region| region.info.address);
        }
        self
    }

    /// Thread that fails every state query.
    #[must_use]
    pub fn with_thread(self, handle: PortName) -> Self
    {
        self.state().threads.insert(handle, MockThread::default());
        self
    }

    /// Thread that answers `x86_THREAD_STATE64`.
    #[must_use]
    pub fn with_wide_thread(self, handle: PortName, state: X86ThreadState64) -> Self
    {
        self.state().threads.insert(
            handle,
            MockThread {
                wide: Some(state),
                ..MockThread::default()
            },
        );
        self
    }

    /// Thread that answers only `x86_THREAD_STATE32`.
    #[must_use]
    pub fn with_narrow_thread(self, handle: PortName, state: X86ThreadState32) -> Self
    {
        self.state().threads.insert(
            handle,
            MockThread {
                narrow: Some(state),
                ..MockThread::default()
            },
        );
        self
    }

    /// Cap the bytes a single `read_overwrite` transfers.
    #[must_use]
    pub fn with_read_limit(self, limit: usize) -> Self
    {
        self.state().read_limit = Some(limit);
        self
    }

    /// Fail every future call of `op` with `code`.
    pub fn fail(&self, op: Op, code: KernReturn)
    {
        self.state().failures.insert(op, Failure { code, remaining: None });
    }

    /// Fail only the next call of `op` with `code`.
    pub fn fail_once(&self, op: Op, code: KernReturn)
    {
        self.state().failures.insert(
            op,
            Failure {
                code,
                remaining: Some(1),
            },
        );
    }

    pub fn clear_failure(&self, op: Op)
    {
        self.state().failures.remove(&op);
    }

    /// Queue a `mach_exception_raise` from `thread` on the registered exception port.
    ///
    /// The kernel would hand the handler a fresh send right for the thread and
    /// the task plus a send-once reply right; the mock records those names so
    /// tests can check they are released.
    pub fn raise_exception(&self, thread: PortName, exception: i32, codes: [i64; 2])
    {
        let mut state = self.state();
        let exception_port = state.registration.map_or(PORT_NULL, |registration| registration.port);
        let reply_port = state.allocate_name();
        let task = state.task_port;
        let request = ExceptionRequest {
            exception,
            codes,
            ..ExceptionRequest::new(exception_port, reply_port, thread, task)
        };
        let mut bytes = vec![0_u8; crate::message::REQUEST_SIZE];
        request.encode(&mut bytes);
        state.inbox.push_back(bytes);
    }

    /// Queue raw message bytes.
    pub fn push_message(&self, bytes: Vec<u8>)
    {
        self.state().inbox.push_back(bytes);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call>
    {
        self.state().calls.clone()
    }

    /// Number of recorded calls of `op`.
    #[must_use]
    pub fn count(&self, op: Op) -> usize
    {
        self.state().calls.iter().filter(|call| call.op == op).count()
    }

    /// Ports passed to `destroy_port` or `deallocate_port`, in order.
    #[must_use]
    pub fn released_ports(&self) -> Vec<PortName>
    {
        self.state().released.clone()
    }

    /// Receive rights currently held.
    #[must_use]
    pub fn receive_ports(&self) -> Vec<PortName>
    {
        self.state().receive_ports.iter().copied().collect()
    }

    #[must_use]
    pub fn exception_registration(&self) -> Option<ExceptionRegistration>
    {
        self.state().registration
    }

    /// Encoded replies passed to `send_message`.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<Vec<u8>>
    {
        self.state().sent.clone()
    }

    /// Messages still waiting to be received.
    #[must_use]
    pub fn pending_messages(&self) -> usize
    {
        self.state().inbox.len()
    }

    #[must_use]
    pub fn suspend_count(&self, thread: PortName) -> Option<i32>
    {
        self.state().threads.get(&thread).map(|t| t.suspend_count)
    }

    #[must_use]
    pub fn abort_count(&self, thread: PortName) -> Option<u32>
    {
        self.state().threads.get(&thread).map(|t| t.aborts)
    }

    #[must_use]
    pub fn wide_state(&self, thread: PortName) -> Option<X86ThreadState64>
    {
        self.state().threads.get(&thread).and_then(|t| t.wide)
    }

    #[must_use]
    pub fn narrow_state(&self, thread: PortName) -> Option<X86ThreadState32>
    {
        self.state().threads.get(&thread).and_then(|t| t.narrow)
    }

    /// Backing bytes of the region mapped exactly at `address`.
    #[must_use]
    pub fn region_bytes(&self, address: u64) -> Option<Vec<u8>>
    {
        self.state()
            .regions
            .iter()
            .find(|region| region.info.address == address)
            .map(|region| region.bytes.clone())
    }
}

impl Kernel for MockKernel
{
    fn task_for_pid(&self, pid: ProcessId) -> KernResult<PortName>
    {
        let mut state = self.state();
        state.enter(Op::TaskForPid, PORT_NULL, u64::from(pid.0))?;
        let port = state.task_port;
        state.send_rights.insert(port);
        Ok(port)
    }

    fn task_basic_info(&self, task: PortName) -> KernResult<TaskBasicInfo>
    {
        let mut state = self.state();
        state.enter(Op::TaskBasicInfo, task, 0)?;
        state.check_task(task)?;
        Ok(state.basic_info)
    }

    fn task_threads(&self, task: PortName) -> KernResult<Vec<PortName>>
    {
        let mut state = self.state();
        state.enter(Op::TaskThreads, task, 0)?;
        state.check_task(task)?;
        Ok(state.threads.keys().copied().collect())
    }

    fn allocate_receive_port(&self) -> KernResult<PortName>
    {
        let mut state = self.state();
        state.enter(Op::AllocateReceivePort, PORT_NULL, 0)?;
        let port = state.allocate_name();
        state.receive_ports.insert(port);
        Ok(port)
    }

    fn insert_send_right(&self, port: PortName) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::InsertSendRight, port, 0)?;
        if !state.receive_ports.contains(&port) {
            return Err(KernelError::new(KERN_INVALID_NAME));
        }
        state.send_rights.insert(port);
        Ok(())
    }

    fn set_exception_ports(
        &self,
        task: PortName,
        mask: ExceptionMask,
        port: PortName,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::SetExceptionPorts, task, u64::from(mask.bits()))?;
        state.check_task(task)?;
        state.registration = (port != PORT_NULL).then_some(ExceptionRegistration {
            mask,
            port,
            behavior,
            flavor,
        });
        Ok(())
    }

    fn destroy_port(&self, port: PortName) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::DestroyPort, port, 0)?;
        state.released.push(port);
        let had_receive = state.receive_ports.remove(&port);
        let had_send = state.send_rights.remove(&port);
        if had_receive || had_send {
            Ok(())
        } else {
            Err(KernelError::new(KERN_INVALID_NAME))
        }
    }

    fn deallocate_port(&self, port: PortName) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::DeallocatePort, port, 0)?;
        state.released.push(port);
        state.send_rights.remove(&port);
        Ok(())
    }

    fn region(&self, task: PortName, address: u64) -> KernResult<RegionInfo>
    {
        let mut state = self.state();
        state.enter(Op::Region, task, address)?;
        state.check_task(task)?;
        state
            .regions
            .iter()
            .find(|region| region.end() > address)
            .map(|region| region.info)
            .ok_or_else(|| KernelError::new(KERN_INVALID_ADDRESS))
    }

    fn read_overwrite(&self, task: PortName, address: u64, buffer: &mut [u8]) -> KernResult<usize>
    {
        let mut state = self.state();
        state.enter(Op::ReadOverwrite, task, address)?;
        state.check_task(task)?;
        let limit = state.read_limit.unwrap_or(usize::MAX);
        let region = state.region_at(address)?;
        if !region.info.protection.contains(Protection::READ) {
            return Err(KernelError::new(KERN_PROTECTION_FAILURE));
        }
        let start = usize::try_from(address - region.info.address).unwrap_or(usize::MAX);
        let available = region.bytes.len().saturating_sub(start);
        let count = buffer.len().min(available).min(limit);
        buffer[..count].copy_from_slice(&region.bytes[start..start + count]);
        Ok(count)
    }

    fn write(&self, task: PortName, address: u64, data: &[u8]) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::Write, task, address)?;
        state.check_task(task)?;
        let region = state.region_at(address)?;
        let start = usize::try_from(address - region.info.address).unwrap_or(usize::MAX);
        if start + data.len() > region.bytes.len() {
            return Err(KernelError::new(KERN_INVALID_ADDRESS));
        }
        if !region.info.protection.contains(Protection::WRITE) {
            return Err(KernelError::new(KERN_PROTECTION_FAILURE));
        }
        region.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn thread_suspend(&self, thread: PortName) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::ThreadSuspend, thread, 0)?;
        state.thread(thread)?.suspend_count += 1;
        Ok(())
    }

    fn thread_resume(&self, thread: PortName) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::ThreadResume, thread, 0)?;
        let thread = state.thread(thread)?;
        if thread.suspend_count == 0 {
            return Err(KernelError::new(KERN_FAILURE));
        }
        thread.suspend_count -= 1;
        Ok(())
    }

    fn thread_abort_safely(&self, thread: PortName) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::ThreadAbortSafely, thread, 0)?;
        state.thread(thread)?.aborts += 1;
        Ok(())
    }

    fn thread_get_state(&self, thread: PortName, flavor: i32, out: &mut [u32]) -> KernResult<usize>
    {
        let mut state = self.state();
        state.enter(Op::ThreadGetState, thread, u64::from(flavor.unsigned_abs()))?;
        let thread = state.thread(thread)?;
        let words = match flavor {
            X86ThreadState64::FLAVOR => thread.wide.map(|s| s.to_words()),
            X86ThreadState32::FLAVOR => thread.narrow.map(|s| s.to_words()),
            _ => None,
        }
        .ok_or_else(|| KernelError::new(KERN_INVALID_ARGUMENT))?;
        if out.len() < words.len() {
            return Err(KernelError::new(KERN_INVALID_ARGUMENT));
        }
        out[..words.len()].copy_from_slice(&words);
        Ok(words.len())
    }

    fn thread_set_state(&self, thread: PortName, flavor: i32, words: &[u32]) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::ThreadSetState, thread, u64::from(flavor.unsigned_abs()))?;
        let thread = state.thread(thread)?;
        match flavor {
            X86ThreadState64::FLAVOR if thread.wide.is_some() && words.len() == X86ThreadState64::WORD_COUNT => {
                thread.wide = Some(X86ThreadState64::from_words(words));
            }
            X86ThreadState32::FLAVOR if thread.narrow.is_some() && words.len() == X86ThreadState32::WORD_COUNT => {
                thread.narrow = Some(X86ThreadState32::from_words(words));
            }
            _ => return Err(KernelError::new(KERN_INVALID_ARGUMENT)),
        }
        Ok(())
    }

    fn receive_message(&self, port: PortName, buffer: &mut MessageBuffer, timeout_ms: u32) -> KernResult<usize>
    {
        let mut state = self.state();
        state.enter(Op::ReceiveMessage, port, u64::from(timeout_ms))?;
        if !state.receive_ports.contains(&port) {
            return Err(KernelError::new(MACH_RCV_INVALID_NAME));
        }
        let Some(message) = state.inbox.pop_front() else {
            return Err(KernelError::new(MACH_RCV_TIMED_OUT));
        };
        if message.len() > MESSAGE_BUFFER_SIZE {
            return Err(KernelError::new(MACH_RCV_TOO_LARGE));
        }
        buffer.as_bytes_mut()[..message.len()].copy_from_slice(&message);
        Ok(message.len())
    }

    fn send_message(&self, buffer: &mut MessageBuffer, len: usize, timeout_ms: u32) -> KernResult<()>
    {
        let mut state = self.state();
        state.enter(Op::SendMessage, PORT_NULL, u64::from(timeout_ms))?;
        let len = len.min(MESSAGE_BUFFER_SIZE);
        state.sent.push(buffer.as_bytes()[..len].to_vec());
        Ok(())
    }
}
