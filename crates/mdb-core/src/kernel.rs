//! # Kernel Seam
//!
//! [`Kernel`] is the set of Mach primitives the engine is built on. Everything
//! above it (attach lifecycle, clamping, architecture probing, the exception
//! monitor) is platform-independent.
//!
//! Two implementations ship with the crate:
//!
//! - **`MachKernel`** (macOS only): calls the real Mach traps
//! - **[`MockKernel`](crate::mock::MockKernel)**: scriptable in-memory target
//!
//! ## Port Names
//!
//! Ports are plain `mach_port_name_t` values ([`PortName`]). Ownership of the
//! rights behind them is tracked by the types above this seam, not here.

use bitflags::bitflags;

use crate::kern_return::KernelError;
use crate::types::{ProcessId, TaskBasicInfo};

/// A Mach port name in the caller's IPC space.
pub type PortName = u32;

/// `MACH_PORT_NULL`
pub const PORT_NULL: PortName = 0;

/// Result of a single kernel primitive.
pub type KernResult<T> = Result<T, KernelError>;

/// Size of the exception receive buffer.
pub const MESSAGE_BUFFER_SIZE: usize = 1024;

/// `THREAD_STATE_NONE` for the host architecture.
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
pub const THREAD_STATE_NONE: i32 = 13;
/// `THREAD_STATE_NONE` for the host architecture.
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
pub const THREAD_STATE_NONE: i32 = 5;

bitflags! {
    /// Exception classes a port can be registered for (`EXC_MASK_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionMask: u32 {
        const BAD_ACCESS = 1 << 1;
        const BAD_INSTRUCTION = 1 << 2;
        const ARITHMETIC = 1 << 3;
        const EMULATION = 1 << 4;
        const SOFTWARE = 1 << 5;
        const BREAKPOINT = 1 << 6;
        const SYSCALL = 1 << 7;
        const MACH_SYSCALL = 1 << 8;
        const RPC_ALERT = 1 << 9;
    }
}

impl ExceptionMask
{
    /// Classes the exception port is registered for on attach.
    pub const ATTACH: Self = Self::BAD_ACCESS
        .union(Self::BAD_INSTRUCTION)
        .union(Self::ARITHMETIC)
        .union(Self::SOFTWARE)
        .union(Self::BREAKPOINT)
        .union(Self::SYSCALL);
}

bitflags! {
    /// Exception delivery behavior (`EXCEPTION_*` plus `MACH_EXCEPTION_CODES`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionBehavior: u32 {
        /// `EXCEPTION_DEFAULT`: deliver thread and task identity only.
        const DEFAULT = 1;
        /// Deliver 64-bit exception codes (`mach_exception_raise`).
        const MACH_EXCEPTION_CODES = 0x8000_0000;
    }
}

impl ExceptionBehavior
{
    pub const ATTACH: Self = Self::DEFAULT.union(Self::MACH_EXCEPTION_CODES);
}

bitflags! {
    /// VM protection bits (`VM_PROT_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: i32 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
    }
}

impl Protection
{
    /// `rwx` style rendering, `-` for missing bits.
    #[must_use]
    pub fn to_rwx(self) -> String
    {
        let mut out = String::with_capacity(3);
        out.push(if self.contains(Self::READ) { 'r' } else { '-' });
        out.push(if self.contains(Self::WRITE) { 'w' } else { '-' });
        out.push(if self.contains(Self::EXECUTE) { 'x' } else { '-' });
        out
    }
}

/// Attributes returned by `mach_vm_region` with `VM_REGION_BASIC_INFO_64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionInfo
{
    pub address: u64,
    pub size: u64,
    pub protection: Protection,
    pub max_protection: Protection,
    pub inheritance: u32,
    pub shared: bool,
    pub reserved: bool,
    pub behavior: i32,
}

/// Aligned byte buffer a Mach message is received into or sent from.
#[repr(C, align(8))]
pub struct MessageBuffer
{
    bytes: [u8; MESSAGE_BUFFER_SIZE],
}

impl MessageBuffer
{
    #[must_use]
    pub const fn new() -> Self
    {
        Self {
            bytes: [0; MESSAGE_BUFFER_SIZE],
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8]
    {
        &mut self.bytes
    }
}

impl Default for MessageBuffer
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// The Mach primitives the engine needs.
///
/// Every method is one kernel call (or a short fixed sequence, such as
/// `task_threads` followed by releasing the returned array). Implementations
/// never retry and never interpret the result beyond mapping it to
/// [`KernelError`].
///
/// The trait is `Send` but not `Sync`: a [`Task`](crate::Task) can move between
/// threads but is never shared, so exception polling is single-consumer.
pub trait Kernel: Send
{
    /// `task_for_pid`: send right to the target task.
    fn task_for_pid(&self, pid: ProcessId) -> KernResult<PortName>;

    /// `task_info(MACH_TASK_BASIC_INFO)`
    fn task_basic_info(&self, task: PortName) -> KernResult<TaskBasicInfo>;

    /// `task_threads`: one send right per thread, owned by the caller.
    fn task_threads(&self, task: PortName) -> KernResult<Vec<PortName>>;

    /// `mach_port_allocate(MACH_PORT_RIGHT_RECEIVE)`
    fn allocate_receive_port(&self) -> KernResult<PortName>;

    /// `mach_port_insert_right(MACH_MSG_TYPE_MAKE_SEND)` on a receive right we hold.
    fn insert_send_right(&self, port: PortName) -> KernResult<()>;

    /// `task_set_exception_ports`. A null `port` clears the registration.
    fn set_exception_ports(
        &self,
        task: PortName,
        mask: ExceptionMask,
        port: PortName,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> KernResult<()>;

    /// Destroy every right we hold under `port` (`mach_port_destroy`).
    fn destroy_port(&self, port: PortName) -> KernResult<()>;

    /// Drop one user reference on a send right (`mach_port_deallocate`).
    fn deallocate_port(&self, port: PortName) -> KernResult<()>;

    /// `mach_vm_region`: first region at or above `address`.
    fn region(&self, task: PortName, address: u64) -> KernResult<RegionInfo>;

    /// `mach_vm_read_overwrite` into `buffer`; returns the bytes transferred.
    fn read_overwrite(&self, task: PortName, address: u64, buffer: &mut [u8]) -> KernResult<usize>;

    /// `mach_vm_write` of the whole of `data`.
    fn write(&self, task: PortName, address: u64, data: &[u8]) -> KernResult<()>;

    fn thread_suspend(&self, thread: PortName) -> KernResult<()>;

    fn thread_resume(&self, thread: PortName) -> KernResult<()>;

    fn thread_abort_safely(&self, thread: PortName) -> KernResult<()>;

    /// `thread_get_state` into `state`; returns the word count the kernel filled.
    fn thread_get_state(&self, thread: PortName, flavor: i32, state: &mut [u32]) -> KernResult<usize>;

    fn thread_set_state(&self, thread: PortName, flavor: i32, state: &[u32]) -> KernResult<()>;

    /// Bounded `mach_msg(MACH_RCV_MSG)` on `port`; returns the received size.
    ///
    /// A timeout surfaces as `MACH_RCV_TIMED_OUT`.
    fn receive_message(&self, port: PortName, buffer: &mut MessageBuffer, timeout_ms: u32) -> KernResult<usize>;

    /// Bounded `mach_msg(MACH_SEND_MSG)` of the first `len` bytes of `buffer`.
    fn send_message(&self, buffer: &mut MessageBuffer, len: usize, timeout_ms: u32) -> KernResult<()>;
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn attach_mask_matches_mach_bits()
    {
        assert_eq!(ExceptionMask::ATTACH.bits(), 0x2 | 0x4 | 0x8 | 0x20 | 0x40 | 0x80);
        assert!(!ExceptionMask::ATTACH.contains(ExceptionMask::EMULATION));
    }

    #[test]
    fn attach_behavior_requests_mach_codes()
    {
        assert_eq!(ExceptionBehavior::ATTACH.bits(), 0x8000_0001);
    }

    #[test]
    fn protection_renders_rwx()
    {
        assert_eq!((Protection::READ | Protection::EXECUTE).to_rwx(), "r-x");
        assert_eq!(Protection::empty().to_rwx(), "---");
    }
}
