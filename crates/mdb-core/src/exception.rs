//! # Exception Monitor
//!
//! Receives exception notifications on the task's exception port and turns
//! them into [`ExceptionEvent`]s. There is no background thread: delivery only
//! progresses when the caller invokes [`Task::poll`].
//!
//! ## One poll cycle
//!
//! 1. Bounded receive on the exception port (timeout: `Ok(None)`)
//! 2. Dispatch on the message id:
//!    - `mach_exception_raise`: release the task right, suspend the thread
//!    - `mach_exception_raise_state[_identity]`: unsupported, `KERN_FAILURE`
//!    - anything else: `MIG_BAD_ID`
//! 3. Bounded send of the reply carrying the dispatch result
//! 4. Return the event, or the dispatch failure
//!
//! If the reply cannot be sent, the thread suspended in step 2 is resumed
//! and its right released before the error is returned.
//!
//! ## References
//!
//! - [`mach_exc.defs`](https://github.com/apple-oss-distributions/xnu/blob/main/osfmk/mach/mach_exc.defs)
//! - [`exception_types.h`](https://github.com/apple-oss-distributions/xnu/blob/main/osfmk/mach/exception_types.h)

use std::fmt;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::MdbResult;
use crate::guards::{PortGuard, SuspendGuard};
use crate::kern_return::{KernReturn, KernelError, KERN_FAILURE, KERN_SUCCESS, MIG_BAD_ARGUMENTS, MIG_BAD_ID};
use crate::kernel::{Kernel, MessageBuffer, PortName};
use crate::message::{
    carried_ports, ExceptionReply, ExceptionRequest, MessageHeader, MACH_EXCEPTION_RAISE, MACH_EXCEPTION_RAISE_STATE,
    MACH_EXCEPTION_RAISE_STATE_IDENTITY,
};
use crate::task::Task;
use crate::thread::Thread;

/// Exception class reported by the kernel (`EXC_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind
{
    /// `EXC_BAD_ACCESS`: invalid memory access
    BadAccess,
    /// `EXC_BAD_INSTRUCTION`: illegal or undefined instruction
    BadInstruction,
    /// `EXC_ARITHMETIC`: divide by zero, overflow, ...
    Arithmetic,
    /// `EXC_EMULATION`
    Emulation,
    /// `EXC_SOFTWARE`: software generated, including Unix signals
    Software,
    /// `EXC_BREAKPOINT`: trace or breakpoint trap
    Breakpoint,
    /// `EXC_SYSCALL`
    Syscall,
    /// `EXC_MACH_SYSCALL`
    MachSyscall,
    /// `EXC_RPC_ALERT`
    RpcAlert,
    /// Any other code
    Unknown,
}

impl ExceptionKind
{
    #[must_use]
    pub const fn from_raw(exception: i32) -> Self
    {
        match exception {
            1 => Self::BadAccess,
            2 => Self::BadInstruction,
            3 => Self::Arithmetic,
            4 => Self::Emulation,
            5 => Self::Software,
            6 => Self::Breakpoint,
            7 => Self::Syscall,
            8 => Self::MachSyscall,
            9 => Self::RpcAlert,
            _ => Self::Unknown,
        }
    }

    /// Name surfaced to callers (`"BAD_ACCESS"`, ..., `"UNKNOWN"`).
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self {
            Self::BadAccess => "BAD_ACCESS",
            Self::BadInstruction => "BAD_INSTRUCTION",
            Self::Arithmetic => "ARITHMETIC",
            Self::Emulation => "EMULATION",
            Self::Software => "SOFTWARE",
            Self::Breakpoint => "BREAKPOINT",
            Self::Syscall => "SYSCALL",
            Self::MachSyscall => "MACH_SYSCALL",
            Self::RpcAlert => "RPC_ALERT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ExceptionKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

/// One exception raised by a thread of the target.
///
/// The thread is suspended and marked paused; call [`Thread::resume`] to let
/// it continue.
#[derive(Debug)]
pub struct ExceptionEvent<'t>
{
    pub thread: Thread<'t>,
    pub kind: ExceptionKind,
    /// Raw `exception_type_t`
    pub exception: i32,
    /// `mach_exception_data_type_t code[2]`
    pub codes: [i64; 2],
}

/// Outcome of handling one request.
enum Dispatch<'k>
{
    Raised
    {
        // Field order is drop order: resume before releasing the right.
        suspension: SuspendGuard<'k>,
        thread: PortGuard<'k>,
        exception: i32,
        codes: [i64; 2],
    },
    Rejected(KernReturn),
}

impl Dispatch<'_>
{
    fn ret_code(&self) -> KernReturn
    {
        match self {
            Dispatch::Raised { .. } => KERN_SUCCESS,
            Dispatch::Rejected(code) => *code,
        }
    }
}

fn release_all(kernel: &dyn Kernel, ports: &[PortName])
{
    for &port in ports {
        if let Err(err) = kernel.deallocate_port(port) {
            warn!(port, "Failed to release right carried by exception message: {err}");
        }
    }
}

fn dispatch<'k>(kernel: &'k dyn Kernel, header: &MessageHeader, bytes: &[u8]) -> Dispatch<'k>
{
    match header.id {
        MACH_EXCEPTION_RAISE => match ExceptionRequest::decode(bytes) {
            Ok(request) => raise(kernel, &request),
            Err(err) => {
                warn!("Malformed mach_exception_raise: {err}");
                release_all(kernel, &carried_ports(header, bytes));
                Dispatch::Rejected(MIG_BAD_ARGUMENTS)
            }
        },
        MACH_EXCEPTION_RAISE_STATE | MACH_EXCEPTION_RAISE_STATE_IDENTITY => {
            debug!(id = header.id, "State-carrying exception delivery is not supported");
            release_all(kernel, &carried_ports(header, bytes));
            Dispatch::Rejected(KERN_FAILURE)
        }
        id => {
            debug!(id, "Unexpected message on exception port");
            release_all(kernel, &carried_ports(header, bytes));
            Dispatch::Rejected(MIG_BAD_ID)
        }
    }
}

fn raise<'k>(kernel: &'k dyn Kernel, request: &ExceptionRequest) -> Dispatch<'k>
{
    let thread = PortGuard::deallocate(kernel, request.thread);
    drop(PortGuard::deallocate(kernel, request.task));

    match SuspendGuard::new(kernel, request.thread) {
        Ok(suspension) => Dispatch::Raised {
            suspension,
            thread,
            exception: request.exception,
            codes: request.codes,
        },
        Err(err) => {
            warn!(thread = request.thread, "Failed to suspend faulting thread: {err}");
            Dispatch::Rejected(err.code())
        }
    }
}

/// Clamp a timeout to whole milliseconds in `mach_msg_timeout_t`.
fn timeout_millis(timeout: Duration) -> u32
{
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

impl Task
{
    /// Run one receive/dispatch/reply cycle on the exception port.
    ///
    /// Returns `Ok(None)` when nothing arrives within `timeout`. The receive
    /// and the reply are each bounded by `timeout`; nothing else blocks.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `Kernel`: receive failed (other than timing out), the message was
    ///   rejected (`KERN_FAILURE`, `MIG_BAD_ID`, `MIG_BAD_ARGUMENTS`, or the
    ///   `thread_suspend` failure), or the reply could not be sent
    ///
    /// ## Example
    ///
    /// ```rust
    /// use std::time::Duration;
    ///
    /// use mdb_core::exception::ExceptionKind;
    /// use mdb_core::mock::MockKernel;
    /// use mdb_core::{ProcessId, Task};
    ///
    /// let kernel = MockKernel::new().with_thread(0x603);
    /// let mut task = Task::with_kernel(ProcessId::from(1), kernel.clone());
    /// task.attach()?;
    ///
    /// assert!(task.poll(Duration::from_millis(10))?.is_none());
    ///
    /// kernel.raise_exception(0x603, 6, [1, 0]);
    /// let event = task.poll(Duration::from_millis(10))?.expect("event");
    /// assert_eq!(event.kind, ExceptionKind::Breakpoint);
    /// assert!(event.thread.is_paused());
    /// # Ok::<(), mdb_core::MdbError>(())
    /// ```
    pub fn poll(&self, timeout: Duration) -> MdbResult<Option<ExceptionEvent<'_>>>
    {
        let attachment = self.attachment()?;
        let kernel = self.kernel();
        let timeout_ms = timeout_millis(timeout);

        let mut buffer = MessageBuffer::new();
        let received = match kernel.receive_message(attachment.exception_port, &mut buffer, timeout_ms) {
            Ok(received) => received,
            Err(err) if err.is_timeout() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let bytes = &buffer.as_bytes()[..received.min(buffer.as_bytes().len())];
        let header = MessageHeader::decode(bytes).map_err(|err| {
            warn!("Dropping undecodable message on exception port: {err}");
            KernelError::new(MIG_BAD_ARGUMENTS)
        })?;
        trace!(id = header.id, size = received, "Received exception message");

        let outcome = dispatch(kernel, &header, bytes);

        let mut reply = MessageBuffer::new();
        let len = ExceptionReply::to(&header, outcome.ret_code()).encode(reply.as_bytes_mut());
        kernel.send_message(&mut reply, len, timeout_ms)?;

        match outcome {
            Dispatch::Raised {
                suspension,
                thread,
                exception,
                codes,
            } => {
                suspension.keep();
                let handle = thread.disarm();
                let kind = ExceptionKind::from_raw(exception);
                debug!(thread = handle, %kind, code = codes[0], subcode = codes[1], "Exception raised");
                Ok(Some(ExceptionEvent {
                    thread: Thread::from_exception(self, handle),
                    kind,
                    exception,
                    codes,
                }))
            }
            Dispatch::Rejected(code) => Err(KernelError::new(code).into()),
        }
    }
}
