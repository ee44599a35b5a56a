//! # Types
//!
//! Plain data carried across the [`Kernel`](crate::kernel::Kernel) seam and
//! handed back to callers: process identifiers, task accounting info, and
//! register-state layouts.

pub mod process;
pub mod registers;
pub mod task_info;

pub use process::ProcessId;
pub use registers::{RegisterState, ThreadArchitecture, ThreadStateFlavor, X86ThreadState32, X86ThreadState64};
pub use task_info::{TaskBasicInfo, TimeValue};
