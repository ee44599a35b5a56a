//! Tests for error handling

use mdb_core::error::{MdbError, MdbResult};
use mdb_core::kern_return::{describe, KernelError, GENERIC_MESSAGE, KERN_FAILURE, KERN_INVALID_ADDRESS, MIG_BAD_ID};

#[test]
fn test_mdb_error_display()
{
    assert_eq!(MdbError::AlreadyAttached.to_string(), "Task is already attached");
    assert_eq!(MdbError::NotAttached.to_string(), "Task is not attached");
    assert_eq!(MdbError::AlreadyPaused.to_string(), "Thread is already paused");
    assert_eq!(MdbError::NotPaused.to_string(), "Thread is not paused");

    let error = MdbError::InvalidArgument("offset 0x20 is past the end".to_string());
    assert!(error.to_string().contains("offset 0x20"));
}

#[test]
fn test_kernel_error_carries_code_and_message()
{
    let error: MdbError = KernelError::new(KERN_INVALID_ADDRESS).into();
    assert_eq!(error.kernel_code(), Some(KERN_INVALID_ADDRESS));

    let message = error.to_string();
    assert!(message.contains("Specified address is not currently valid."));
    assert!(message.contains("0x1"));
}

#[test]
fn test_kernel_code_absent_for_state_errors()
{
    assert_eq!(MdbError::NotAttached.kernel_code(), None);
    assert_eq!(MdbError::UnsupportedPlatform.kernel_code(), None);
}

#[test]
fn test_message_table()
{
    assert_eq!(describe(KERN_FAILURE), "The function could not be performed. A catch-all.");
    assert_eq!(describe(MIG_BAD_ID), "The message id is not handled by this server.");
    assert_eq!(describe(1000), GENERIC_MESSAGE);
}

#[test]
fn test_result_type()
{
    fn fails() -> MdbResult<()>
    {
        Err(KernelError::from(KERN_FAILURE))?;
        Ok(())
    }

    assert_eq!(fails().unwrap_err().kernel_code(), Some(KERN_FAILURE));
}
