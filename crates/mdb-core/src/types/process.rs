//! Process identifier.

use std::fmt;

/// Process identifier (PID) of the target.
///
/// `task_for_pid()` takes a signed `pid_t`; see [`ProcessId::as_raw`].
///
/// ## Example
///
/// ```rust
/// use mdb_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(pid.to_string(), "4242");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    /// The PID as a C `pid_t`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_raw(self) -> libc::pid_t
    {
        self.0 as libc::pid_t
    }
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}
