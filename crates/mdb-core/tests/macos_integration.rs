//! Integration tests against the live Mach kernel.
//!
//! These only run on macOS. Attaching to a real process needs root or the
//! debugger entitlement, so only failure paths are checked here.

#[cfg(target_os = "macos")]
use mdb_core::{MdbError, ProcessId, Task};

#[cfg(target_os = "macos")]
#[test]
fn test_task_new()
{
    let task = Task::new(ProcessId::from(1)).unwrap();
    assert!(!task.is_attached());
}

#[cfg(target_os = "macos")]
#[test]
fn test_attach_invalid_pid()
{
    let mut task = Task::new(ProcessId::from(u32::MAX >> 1)).unwrap();

    let err = task.attach().unwrap_err();
    assert!(err.kernel_code().is_some(), "expected a kernel error, got {err:?}");
    assert!(!task.is_attached());
}

#[cfg(target_os = "macos")]
#[test]
fn test_not_attached_operations()
{
    let task = Task::new(ProcessId::from(1)).unwrap();

    assert_eq!(task.threads().unwrap_err(), MdbError::NotAttached);
    assert_eq!(task.basic_info().unwrap_err(), MdbError::NotAttached);
}

#[cfg(not(target_os = "macos"))]
#[test]
fn test_task_new_is_unsupported()
{
    let result = mdb_core::Task::new(mdb_core::ProcessId::from(1));
    assert_eq!(result.unwrap_err(), mdb_core::MdbError::UnsupportedPlatform);
}
