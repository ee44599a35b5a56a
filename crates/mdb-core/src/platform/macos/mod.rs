//! # macOS Backend
//!
//! [`MachKernel`] implements the [`Kernel`](crate::kernel::Kernel) seam with
//! real Mach calls.
//!
//! ## Dependencies
//!
//! - **mach2**: `mach_task_self`, `task_threads`, `mach_vm_read_overwrite`,
//!   `mach_msg` and the message option constants
//! - **libc**: Mach type definitions (`mach_port_t`, `thread_act_t`, ...)
//! - **`extern "C"`** ([`ffi`]): everything else, notably `task_for_pid`,
//!   `task_set_exception_ports` and `thread_abort_safely`
//!
//! `task_for_pid` only succeeds for root or a binary signed with the
//! `com.apple.security.cs.debugger` entitlement.

pub mod ffi;
mod kernel;

pub use kernel::MachKernel;
