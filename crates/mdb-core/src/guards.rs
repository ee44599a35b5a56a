//! # RAII Guards
//!
//! Scoped acquisition with rollback for multi-step kernel sequences.
//!
//! ## Guards
//!
//! - **PortGuard**: releases a port right on drop unless disarmed
//! - **SuspendGuard**: suspends a thread and resumes it on drop unless kept
//!
//! Both follow the same shape: the guard is created right after the resource
//! is acquired, and a later step failing with `?` unwinds every guard created
//! so far in reverse order. Rollback failures are logged, never surfaced; the
//! error from the step that failed is the one the caller sees.

use tracing::warn;

use crate::kernel::{KernResult, Kernel, PortName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release
{
    /// One user reference on a send right
    Deallocate,
    /// Every right under the name, including a receive right
    Destroy,
}

/// Releases a port right when dropped.
///
/// ## Example
///
/// ```rust
/// use mdb_core::guards::PortGuard;
/// use mdb_core::kernel::Kernel;
/// use mdb_core::mock::MockKernel;
///
/// let kernel = MockKernel::new();
/// let port = kernel.allocate_receive_port()?;
/// {
///     let _guard = PortGuard::destroy(&kernel, port);
///     // an early return here would destroy the port
/// }
/// assert!(kernel.released_ports().contains(&port));
/// # Ok::<(), mdb_core::kern_return::KernelError>(())
/// ```
pub struct PortGuard<'k>
{
    kernel: &'k dyn Kernel,
    port: PortName,
    release: Release,
    active: bool,
}

impl<'k> PortGuard<'k>
{
    /// Guard a send right; drop calls `mach_port_deallocate`.
    pub fn deallocate(kernel: &'k dyn Kernel, port: PortName) -> Self
    {
        Self {
            kernel,
            port,
            release: Release::Deallocate,
            active: true,
        }
    }

    /// Guard a receive right; drop calls `mach_port_destroy`.
    pub fn destroy(kernel: &'k dyn Kernel, port: PortName) -> Self
    {
        Self {
            kernel,
            port,
            release: Release::Destroy,
            active: true,
        }
    }

    #[must_use]
    pub fn port(&self) -> PortName
    {
        self.port
    }

    /// Keep the right; dropping the guard becomes a no-op.
    pub fn disarm(mut self) -> PortName
    {
        self.active = false;
        self.port
    }
}

impl Drop for PortGuard<'_>
{
    fn drop(&mut self)
    {
        if !self.active {
            return;
        }
        let result = match self.release {
            Release::Deallocate => self.kernel.deallocate_port(self.port),
            Release::Destroy => self.kernel.destroy_port(self.port),
        };
        if let Err(err) = result {
            warn!(port = self.port, "Failed to release port during rollback: {err}");
        }
    }
}

/// Suspends a thread and resumes it when dropped.
///
/// Call [`SuspendGuard::keep`] once the suspension should outlive the guard.
pub struct SuspendGuard<'k>
{
    kernel: &'k dyn Kernel,
    thread: PortName,
    active: bool,
}

impl<'k> SuspendGuard<'k>
{
    /// Suspend `thread`.
    ///
    /// ## Errors
    ///
    /// Returns the `thread_suspend` failure; nothing is rolled back since
    /// nothing was acquired.
    pub fn new(kernel: &'k dyn Kernel, thread: PortName) -> KernResult<Self>
    {
        kernel.thread_suspend(thread)?;
        Ok(Self {
            kernel,
            thread,
            active: true,
        })
    }

    /// Leave the thread suspended.
    pub fn keep(mut self)
    {
        self.active = false;
    }

    /// Resume now and report the result.
    ///
    /// ## Errors
    ///
    /// Returns the `thread_resume` failure.
    pub fn resume(mut self) -> KernResult<()>
    {
        self.active = false;
        self.kernel.thread_resume(self.thread)
    }
}

impl Drop for SuspendGuard<'_>
{
    fn drop(&mut self)
    {
        if self.active {
            if let Err(err) = self.kernel.thread_resume(self.thread) {
                warn!(thread = self.thread, "Failed to resume thread during rollback: {err}");
            }
        }
    }
}
