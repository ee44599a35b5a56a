//! # Task
//!
//! Root object of the engine: owns the attach lifecycle, the task send right
//! and the exception port, and hands out borrowed [`Region`], [`Memory`] and
//! [`Thread`] views.
//!
//! ## Lifecycle
//!
//! 1. Create: `Task::new(pid)` or `Task::with_kernel(pid, kernel)` (detached)
//! 2. Attach: `attach()` resolves the task port and registers the exception port
//! 3. Use: `find_region()`, `threads()`, `poll()`, ...
//! 4. Detach: `detach()`, or drop the task
//!
//! Views borrow the task, so the borrow checker keeps it attached for as long
//! as any of them is alive.
//!
//! ## Thread Safety
//!
//! `Task` is `Send` but not `Sync`. Exception polling is therefore always
//! single-consumer for a given task.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{MdbError, MdbResult};
use crate::guards::PortGuard;
use crate::kern_return::KERN_INVALID_ADDRESS;
use crate::kernel::{ExceptionBehavior, ExceptionMask, Kernel, PortName, PORT_NULL, THREAD_STATE_NONE};
use crate::region::{Memory, MemoryRange, Region};
use crate::thread::Thread;
use crate::types::{ProcessId, TaskBasicInfo};

/// Kernel resources held while attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Attachment
{
    pub task: PortName,
    pub exception_port: PortName,
}

/// A target process, attached or not.
pub struct Task
{
    pid: ProcessId,
    kernel: Box<dyn Kernel>,
    attachment: Option<Attachment>,
}

impl Task
{
    /// Detached task backed by the host's Mach kernel.
    ///
    /// ## Errors
    ///
    /// `UnsupportedPlatform` on anything but macOS.
    #[cfg(target_os = "macos")]
    pub fn new(pid: ProcessId) -> MdbResult<Self>
    {
        Ok(Self::with_kernel(pid, crate::platform::macos::MachKernel::new()))
    }

    /// Detached task backed by the host's Mach kernel.
    ///
    /// ## Errors
    ///
    /// `UnsupportedPlatform` on anything but macOS.
    #[cfg(not(target_os = "macos"))]
    pub fn new(_pid: ProcessId) -> MdbResult<Self>
    {
        Err(MdbError::UnsupportedPlatform)
    }

    /// Detached task talking through `kernel`.
    pub fn with_kernel<K>(pid: ProcessId, kernel: K) -> Self
    where
        K: Kernel + 'static,
    {
        Self {
            pid,
            kernel: Box::new(kernel),
            attachment: None,
        }
    }

    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    #[must_use]
    pub fn is_attached(&self) -> bool
    {
        self.attachment.is_some()
    }

    /// Task send right, while attached.
    #[must_use]
    pub fn task_port(&self) -> Option<PortName>
    {
        self.attachment.map(|a| a.task)
    }

    /// Exception receive port, while attached.
    #[must_use]
    pub fn exception_port(&self) -> Option<PortName>
    {
        self.attachment.map(|a| a.exception_port)
    }

    pub(crate) fn kernel(&self) -> &dyn Kernel
    {
        self.kernel.as_ref()
    }

    pub(crate) fn attachment(&self) -> MdbResult<Attachment>
    {
        self.attachment.ok_or(MdbError::NotAttached)
    }

    /// Attach to the target.
    ///
    /// Resolves the task port, allocates an exception port, gives it a send
    /// right and registers it for [`ExceptionMask::ATTACH`] with
    /// [`ExceptionBehavior::ATTACH`]. If any step fails, every right acquired
    /// by earlier steps is released before the error is returned.
    ///
    /// ## Errors
    ///
    /// - `AlreadyAttached`: the task is already attached (nothing changes)
    /// - `Kernel`: `task_for_pid` (commonly `KERN_FAILURE` without debugging
    ///   entitlements) or any port call failed
    pub fn attach(&mut self) -> MdbResult<()>
    {
        if self.attachment.is_some() {
            return Err(MdbError::AlreadyAttached);
        }

        let kernel = self.kernel.as_ref();
        debug!(pid = %self.pid, "Attaching to task");

        let task = PortGuard::deallocate(kernel, kernel.task_for_pid(self.pid)?);
        let exception_port = PortGuard::destroy(kernel, kernel.allocate_receive_port()?);
        kernel.insert_send_right(exception_port.port())?;
        kernel.set_exception_ports(
            task.port(),
            ExceptionMask::ATTACH,
            exception_port.port(),
            ExceptionBehavior::ATTACH,
            THREAD_STATE_NONE,
        )?;

        let attachment = Attachment {
            task: task.disarm(),
            exception_port: exception_port.disarm(),
        };
        debug!(
            pid = %self.pid,
            task = attachment.task,
            exception_port = attachment.exception_port,
            "Attached"
        );
        self.attachment = Some(attachment);
        Ok(())
    }

    /// Detach from the target.
    ///
    /// Clears the exception-port registration, destroys the exception port and
    /// releases the task right. Every step runs even if an earlier one fails;
    /// the task is detached afterwards either way.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `Kernel`: the first failing release step
    pub fn detach(&mut self) -> MdbResult<()>
    {
        let attachment = self.attachment.take().ok_or(MdbError::NotAttached)?;
        let kernel = self.kernel.as_ref();
        debug!(pid = %self.pid, "Detaching from task");

        let cleared = kernel.set_exception_ports(
            attachment.task,
            ExceptionMask::ATTACH,
            PORT_NULL,
            ExceptionBehavior::ATTACH,
            THREAD_STATE_NONE,
        );
        let destroyed = kernel.destroy_port(attachment.exception_port);
        let released = kernel.deallocate_port(attachment.task);

        cleared.and(destroyed).and(released)?;
        Ok(())
    }

    /// First region at or above `address`.
    ///
    /// Returns `Ok(None)` when no region lies at or beyond `address`.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `Kernel`: any failure other than `KERN_INVALID_ADDRESS`
    pub fn find_region(&self, address: u64) -> MdbResult<Option<Region<'_>>>
    {
        let attachment = self.attachment()?;
        match self.kernel.region(attachment.task, address) {
            Ok(info) => Ok(Some(Region::new(self, info))),
            Err(err) if err.code() == KERN_INVALID_ADDRESS => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Iterate every region in ascending address order.
    ///
    /// The iterator stops after the last region, after the address space
    /// wraps, or after yielding an error.
    pub fn regions(&self) -> Regions<'_>
    {
        Regions {
            task: self,
            next: Some(0),
        }
    }

    /// Accessor for `size` bytes at `address`, not tied to a region.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `InvalidArgument`: the range wraps past the end of the address space
    pub fn memory(&self, address: u64, size: u64) -> MdbResult<Memory<'_>>
    {
        self.attachment()?;
        if address.checked_add(size).is_none() {
            return Err(MdbError::InvalidArgument(format!(
                "memory range 0x{address:x}+0x{size:x} overflows the address space"
            )));
        }
        Ok(Memory::new(self, address, size))
    }

    /// Every thread of the task, each `Unknown` and not paused.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `Kernel`: `task_threads` failed
    pub fn threads(&self) -> MdbResult<Vec<Thread<'_>>>
    {
        let attachment = self.attachment()?;
        let handles = self.kernel.task_threads(attachment.task)?;
        debug!(pid = %self.pid, count = handles.len(), "Enumerated threads");
        Ok(handles.into_iter().map(|handle| Thread::new(self, handle)).collect())
    }

    /// Accounting snapshot (`MACH_TASK_BASIC_INFO`).
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `Kernel`: `task_info` failed
    pub fn basic_info(&self) -> MdbResult<TaskBasicInfo>
    {
        let attachment = self.attachment()?;
        Ok(self.kernel.task_basic_info(attachment.task)?)
    }
}

impl fmt::Debug for Task
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("attachment", &self.attachment)
            .finish_non_exhaustive()
    }
}

impl Drop for Task
{
    fn drop(&mut self)
    {
        if self.attachment.is_some() {
            if let Err(err) = self.detach() {
                warn!(pid = %self.pid, "Failed to detach while dropping task: {err}");
            }
        }
    }
}

/// Iterator over a task's regions, from [`Task::regions`].
pub struct Regions<'t>
{
    task: &'t Task,
    next: Option<u64>,
}

impl<'t> Iterator for Regions<'t>
{
    type Item = MdbResult<Region<'t>>;

    fn next(&mut self) -> Option<Self::Item>
    {
        let address = self.next.take()?;
        match self.task.find_region(address) {
            Ok(Some(region)) => {
                self.next = region.address().checked_add(region.size()).filter(|end| *end > address);
                Some(Ok(region))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
