//! # Threads
//!
//! A [`Thread`] wraps one send right to a kernel thread of an attached task.
//! It tracks two pieces of state:
//!
//! - **paused**: set by [`Thread::pause`] or when the thread came from an
//!   exception event, cleared by [`Thread::resume`]
//! - **architecture**: pinned by the first successful register read
//!
//! ## Architecture detection
//!
//! ```text
//! Unknown --x86_THREAD_STATE64 ok--> Wide
//!    |
//!    +--64 fails, x86_THREAD_STATE32 ok--> Narrow
//! ```
//!
//! A pinned thread only ever queries its own flavor. A failure at the pinned
//! width is surfaced and the pin stays.

use std::fmt;

use tracing::{debug, trace};

use crate::error::{MdbError, MdbResult};
use crate::guards::SuspendGuard;
use crate::kernel::PortName;
use crate::task::Task;
use crate::types::{RegisterState, ThreadArchitecture, ThreadStateFlavor, X86ThreadState32, X86ThreadState64};

/// One thread of an attached task.
///
/// Dropping the thread releases its send right. Dropping a paused thread
/// does *not* resume it.
pub struct Thread<'t>
{
    task: &'t Task,
    handle: PortName,
    architecture: ThreadArchitecture,
    paused: bool,
}

impl<'t> Thread<'t>
{
    /// Thread from `task_threads`.
    pub(crate) fn new(task: &'t Task, handle: PortName) -> Self
    {
        Self {
            task,
            handle,
            architecture: ThreadArchitecture::Unknown,
            paused: false,
        }
    }

    /// Thread suspended by the exception handler.
    pub(crate) fn from_exception(task: &'t Task, handle: PortName) -> Self
    {
        Self {
            paused: true,
            ..Self::new(task, handle)
        }
    }

    /// Kernel thread port.
    #[must_use]
    pub fn handle(&self) -> PortName
    {
        self.handle
    }

    #[must_use]
    pub fn architecture(&self) -> ThreadArchitecture
    {
        self.architecture
    }

    #[must_use]
    pub fn is_paused(&self) -> bool
    {
        self.paused
    }

    #[must_use]
    pub fn task(&self) -> &'t Task
    {
        self.task
    }

    /// Suspend the thread and abort any interruptible kernel call it is in.
    ///
    /// If the abort fails, the thread is resumed again before the error is
    /// returned, so a failed `pause()` leaves the thread running.
    ///
    /// ## Errors
    ///
    /// - `AlreadyPaused`
    /// - `NotAttached`
    /// - `Kernel`: `thread_suspend` or `thread_abort_safely` failed
    pub fn pause(&mut self) -> MdbResult<()>
    {
        if self.paused {
            return Err(MdbError::AlreadyPaused);
        }
        self.task.attachment()?;
        let kernel = self.task.kernel();

        let suspension = SuspendGuard::new(kernel, self.handle)?;
        kernel.thread_abort_safely(self.handle)?;
        suspension.keep();

        self.paused = true;
        debug!(thread = self.handle, "Paused thread");
        Ok(())
    }

    /// Resume a paused thread.
    ///
    /// ## Errors
    ///
    /// - `NotPaused`
    /// - `NotAttached`
    /// - `Kernel`: `thread_resume` failed (the thread stays paused)
    pub fn resume(&mut self) -> MdbResult<()>
    {
        if !self.paused {
            return Err(MdbError::NotPaused);
        }
        self.task.attachment()?;
        self.task.kernel().thread_resume(self.handle)?;
        self.paused = false;
        debug!(thread = self.handle, "Resumed thread");
        Ok(())
    }

    /// Current register values, pinning the architecture on first use.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `Kernel`: no flavor could be read (last failure is returned)
    pub fn get_state(&mut self) -> MdbResult<RegisterState>
    {
        self.task.attachment()?;
        match self.architecture {
            ThreadArchitecture::Wide => Ok(RegisterState::Wide(self.read_flavor()?)),
            ThreadArchitecture::Narrow => Ok(RegisterState::Narrow(self.read_flavor()?)),
            ThreadArchitecture::Unknown => match self.read_flavor::<X86ThreadState64>() {
                Ok(state) => {
                    self.pin(ThreadArchitecture::Wide);
                    Ok(RegisterState::Wide(state))
                }
                Err(wide) => {
                    trace!(thread = self.handle, "x86_THREAD_STATE64 unavailable ({wide}), trying x86_THREAD_STATE32");
                    let state = self.read_flavor::<X86ThreadState32>()?;
                    self.pin(ThreadArchitecture::Narrow);
                    Ok(RegisterState::Narrow(state))
                }
            },
        }
    }

    /// Overwrite the named registers, leaving the rest as they are now.
    ///
    /// The full state is re-read first and written back in one call.
    /// Names that do not belong to the thread's architecture are ignored;
    /// use [`Thread::set_state_strict`] to reject them.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `InvalidArgument`: a value does not fit the register width
    /// - `Kernel`: reading or writing the state failed
    ///
    /// ## Example
    ///
    /// ```rust
    /// use mdb_core::mock::MockKernel;
    /// use mdb_core::types::X86ThreadState64;
    /// use mdb_core::{ProcessId, Task};
    ///
    /// let kernel = MockKernel::new().with_wide_thread(0x503, X86ThreadState64::default());
    /// let mut task = Task::with_kernel(ProcessId::from(1), kernel.clone());
    /// task.attach()?;
    /// let mut thread = task.threads()?.remove(0);
    /// thread.set_state([("rip", 0x1000_u64), ("bogus", 1)])?;
    /// assert_eq!(thread.get_state()?.get("rip"), Some(0x1000));
    /// # Ok::<(), mdb_core::MdbError>(())
    /// ```
    pub fn set_state<I, K>(&mut self, values: I) -> MdbResult<()>
    where
        I: IntoIterator<Item = (K, u64)>,
        K: AsRef<str>,
    {
        self.apply(values, false)
    }

    /// Like [`Thread::set_state`], but unknown register names are an error.
    ///
    /// ## Errors
    ///
    /// As [`Thread::set_state`], plus `InvalidArgument` for an unknown name.
    /// Nothing is written when any name or value is rejected.
    pub fn set_state_strict<I, K>(&mut self, values: I) -> MdbResult<()>
    where
        I: IntoIterator<Item = (K, u64)>,
        K: AsRef<str>,
    {
        self.apply(values, true)
    }

    fn apply<I, K>(&mut self, values: I, strict: bool) -> MdbResult<()>
    where
        I: IntoIterator<Item = (K, u64)>,
        K: AsRef<str>,
    {
        match self.get_state()? {
            RegisterState::Wide(mut state) => {
                overlay(&mut state, values, strict)?;
                self.write_flavor(&state)
            }
            RegisterState::Narrow(mut state) => {
                overlay(&mut state, values, strict)?;
                self.write_flavor(&state)
            }
        }
    }

    fn pin(&mut self, architecture: ThreadArchitecture)
    {
        debug!(thread = self.handle, %architecture, "Pinned thread architecture");
        self.architecture = architecture;
    }

    fn read_flavor<S: ThreadStateFlavor>(&self) -> MdbResult<S>
    {
        let mut words = vec![0_u32; S::WORD_COUNT];
        let count = self.task.kernel().thread_get_state(self.handle, S::FLAVOR, &mut words)?;
        words.truncate(count);
        Ok(S::from_words(&words))
    }

    fn write_flavor<S: ThreadStateFlavor>(&self, state: &S) -> MdbResult<()>
    {
        self.task.kernel().thread_set_state(self.handle, S::FLAVOR, &state.to_words())?;
        trace!(thread = self.handle, flavor = S::FLAVOR, "Wrote thread state");
        Ok(())
    }
}

/// Apply `values` onto `state`, validating everything before touching it.
fn overlay<S, I, K>(state: &mut S, values: I, strict: bool) -> MdbResult<()>
where
    S: ThreadStateFlavor + Copy,
    I: IntoIterator<Item = (K, u64)>,
    K: AsRef<str>,
{
    let mut merged = *state;
    for (name, value) in values {
        let name = name.as_ref();
        match merged.set(name, value) {
            Ok(true) => {}
            Ok(false) if strict => {
                return Err(MdbError::InvalidArgument(format!("unknown register {name:?}")));
            }
            Ok(false) => trace!(register = name, "Ignoring unknown register"),
            Err(value) => {
                return Err(MdbError::InvalidArgument(format!(
                    "value 0x{value:x} does not fit register {name:?}"
                )));
            }
        }
    }
    *state = merged;
    Ok(())
}

impl fmt::Debug for Thread<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Thread")
            .field("handle", &self.handle)
            .field("architecture", &self.architecture)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl Drop for Thread<'_>
{
    fn drop(&mut self)
    {
        if let Err(err) = self.task.kernel().deallocate_port(self.handle) {
            trace!(thread = self.handle, "Failed to release thread port: {err}");
        }
    }
}
