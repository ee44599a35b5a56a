//! # Error Types
//!
//! Errors surfaced by task, memory, thread and exception operations.
//!
//! Kernel failures are carried verbatim in [`MdbError::Kernel`]; nothing is
//! retried. State errors (`AlreadyAttached`, `NotPaused`, ...) leave the object
//! exactly as it was before the call.

use thiserror::Error;

use crate::kern_return::KernelError;

/// Main error type for mdb operations
///
/// ## Error Categories
///
/// 1. **Lifecycle errors**: `AlreadyAttached`, `NotAttached`
/// 2. **Thread state errors**: `AlreadyPaused`, `NotPaused`
/// 3. **Kernel errors**: `Kernel` (code plus static diagnostic)
/// 4. **Caller errors**: `InvalidArgument`
/// 5. **Platform errors**: `UnsupportedPlatform`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MdbError
{
    /// `attach()` was called on a task that is already attached.
    ///
    /// The existing task handle and exception port are left untouched.
    #[error("Task is already attached")]
    AlreadyAttached,

    /// Operation requires an attached task
    ///
    /// ## Solution
    ///
    /// Call `Task::attach()` first.
    #[error("Task is not attached")]
    NotAttached,

    /// `pause()` was called on a thread that is already paused.
    #[error("Thread is already paused")]
    AlreadyPaused,

    /// `resume()` was called on a thread that is not paused.
    #[error("Thread is not paused")]
    NotPaused,

    /// A kernel primitive returned a non-success status.
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// Malformed call parameters
    ///
    /// Examples:
    /// - Read offset past the end of a region
    /// - Register value wider than the thread's pinned architecture
    /// - Unknown register name passed to `set_state_strict`
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No kernel backend exists for the host platform.
    ///
    /// Only macOS has a Mach kernel; elsewhere use `Task::with_kernel` with a
    /// custom [`Kernel`](crate::kernel::Kernel).
    #[error("Mach tasks are not supported on this platform")]
    UnsupportedPlatform,
}

impl MdbError
{
    /// Raw kernel status when this is a [`MdbError::Kernel`].
    #[must_use]
    pub const fn kernel_code(&self) -> Option<i32>
    {
        match self {
            Self::Kernel(err) => Some(err.code()),
            _ => None,
        }
    }
}

/// Result type alias for mdb operations
pub type MdbResult<T> = std::result::Result<T, MdbError>;
