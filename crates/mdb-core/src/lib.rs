//! # mdb-core
//!
//! Attach to a running macOS process through its Mach task and inspect it:
//! memory regions, raw memory, threads and their registers, and exceptions
//! raised by its threads.
//!
//! ## Layout
//!
//! - [`task`]: attach/detach lifecycle, region lookup, thread enumeration
//! - [`region`]: clamped reads and writes over regions and arbitrary ranges
//! - [`thread`]: pause/resume, register get/set with architecture detection
//! - [`exception`]: single-consumer polling of the task's exception port
//! - [`kernel`]: the seam every operation above goes through, implemented by
//!   `MachKernel` on macOS and [`mock::MockKernel`] everywhere
//!
//! ## Example
//!
//! ```rust
//! use mdb_core::kernel::Protection;
//! use mdb_core::mock::MockKernel;
//! use mdb_core::{MemoryRange, ProcessId, Task};
//!
//! let kernel = MockKernel::new().with_region(0x1000, Protection::READ, b"hello".to_vec());
//! let mut task = Task::with_kernel(ProcessId::from(42), kernel);
//! task.attach()?;
//!
//! let region = task.find_region(0x1000)?.expect("mapped");
//! assert_eq!(region.read(1, Some(3))?, b"ell");
//! # Ok::<(), mdb_core::MdbError>(())
//! ```
//!
//! ## Why unsafe code is needed
//!
//! The macOS backend calls Mach traps directly. The unsafe blocks are confined
//! to `platform::macos`; everything above [`kernel::Kernel`] is safe code.

#![allow(unsafe_code)]

pub mod error;
pub mod exception;
pub mod guards;
pub mod kern_return;
pub mod kernel;
pub mod message;
pub mod mock;
pub mod platform;
pub mod prelude;
pub mod region;
pub mod scan;
pub mod task;
pub mod thread;
pub mod types;

pub use error::{MdbError, MdbResult};
pub use exception::{ExceptionEvent, ExceptionKind};
pub use kern_return::KernelError;
#[cfg(target_os = "macos")]
pub use platform::macos::MachKernel;
pub use region::{Memory, MemoryRange, Region};
pub use task::Task;
pub use thread::Thread;
pub use types::{ProcessId, RegisterState};
