//! # Kernel Status Codes
//!
//! Every Mach call returns a `kern_return_t`. This module maps those codes (and
//! the `mach_msg` return codes the exception monitor can observe) to a static
//! human-readable diagnostic, and wraps a failing code in [`KernelError`].
//!
//! Unrecognized codes fall back to the generic message `"Kernel error."`.
//!
//! ## References
//!
//! - `<mach/kern_return.h>`
//! - `<mach/message.h>` (`MACH_SEND_*` / `MACH_RCV_*`)
//! - `<mach/mig_errors.h>` (`MIG_BAD_ID`)

use thiserror::Error;

/// Raw Mach status code (`kern_return_t` / `mach_msg_return_t`).
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_NO_SPACE: KernReturn = 3;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_FAILURE: KernReturn = 5;
pub const KERN_RESOURCE_SHORTAGE: KernReturn = 6;
pub const KERN_INVALID_NAME: KernReturn = 15;
pub const KERN_INVALID_TASK: KernReturn = 16;
pub const KERN_INVALID_RIGHT: KernReturn = 17;
pub const KERN_INVALID_VALUE: KernReturn = 18;
pub const KERN_TERMINATED: KernReturn = 37;
pub const KERN_NOT_SUPPORTED: KernReturn = 46;
pub const KERN_OPERATION_TIMED_OUT: KernReturn = 49;
pub const KERN_CODESIGN_ERROR: KernReturn = 50;

pub const MACH_SEND_INVALID_DEST: KernReturn = 0x1000_0003;
pub const MACH_SEND_TIMED_OUT: KernReturn = 0x1000_0004;
pub const MACH_SEND_INTERRUPTED: KernReturn = 0x1000_0007;
pub const MACH_RCV_INVALID_NAME: KernReturn = 0x1000_4002;
pub const MACH_RCV_TIMED_OUT: KernReturn = 0x1000_4003;
pub const MACH_RCV_TOO_LARGE: KernReturn = 0x1000_4004;
pub const MACH_RCV_INTERRUPTED: KernReturn = 0x1000_4005;
pub const MACH_RCV_PORT_DIED: KernReturn = 0x1000_4009;

/// MIG reply code for a message id the server does not implement.
pub const MIG_BAD_ID: KernReturn = -303;

/// MIG reply code for a request whose body could not be parsed.
pub const MIG_BAD_ARGUMENTS: KernReturn = -304;

/// Fallback diagnostic for codes missing from the table.
pub const GENERIC_MESSAGE: &str = "Kernel error.";

/// A non-success status returned by a kernel primitive.
///
/// Carries the raw code and the diagnostic from [`describe`].
///
/// ## Example
///
/// ```rust
/// use mdb_core::kern_return::{KernelError, KERN_INVALID_ADDRESS};
///
/// let err = KernelError::new(KERN_INVALID_ADDRESS);
/// assert_eq!(err.message(), "Specified address is not currently valid.");
/// assert!(err.to_string().contains("Specified address"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{message} (kern_return {code:#x})")]
pub struct KernelError
{
    code: KernReturn,
    message: &'static str,
}

impl KernelError
{
    /// Wrap a raw code, looking up its diagnostic.
    #[must_use]
    pub fn new(code: KernReturn) -> Self
    {
        Self {
            code,
            message: describe(code),
        }
    }

    /// Raw kernel status code.
    #[must_use]
    pub const fn code(&self) -> KernReturn
    {
        self.code
    }

    /// Diagnostic text from the static table.
    #[must_use]
    pub const fn message(&self) -> &'static str
    {
        self.message
    }

    /// True when a bounded receive or send ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool
    {
        matches!(self.code, MACH_RCV_TIMED_OUT | MACH_SEND_TIMED_OUT)
    }
}

impl From<KernReturn> for KernelError
{
    fn from(code: KernReturn) -> Self
    {
        Self::new(code)
    }
}

/// Convert a raw status into a `Result`.
///
/// ## Errors
///
/// Returns [`KernelError`] for anything other than `KERN_SUCCESS`.
pub fn check(code: KernReturn) -> Result<(), KernelError>
{
    if code == KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernelError::new(code))
    }
}

/// Diagnostic text for a kernel status code.
#[must_use]
pub const fn describe(code: KernReturn) -> &'static str
{
    match code {
        KERN_SUCCESS => "The operation succeeded.",
        KERN_INVALID_ADDRESS => "Specified address is not currently valid.",
        KERN_PROTECTION_FAILURE => "Specified memory is valid, but does not permit the required forms of access.",
        KERN_NO_SPACE => {
            "The address range specified is already in use, or no address range of the size specified could be found."
        }
        KERN_INVALID_ARGUMENT => {
            "The function requested was not applicable to this type of argument, or an argument is invalid."
        }
        KERN_FAILURE => "The function could not be performed. A catch-all.",
        KERN_RESOURCE_SHORTAGE => {
            "A system resource could not be allocated to fulfill this request. This failure may not be permanent."
        }
        7 => "The task in question does not hold receive rights for the port argument.",
        8 => "Bogus access restriction.",
        9 => {
            "During a page fault, the target address refers to a memory object that has been destroyed. This failure \
             is permanent."
        }
        10 => {
            "During a page fault, the memory object indicated that the data could not be returned. This failure may \
             be temporary; future attempts to access this same data may succeed, as defined by the memory object."
        }
        11 => "The receive right is already a member of the portset.",
        12 => "The receive right is not a member of a port set.",
        13 => "The name already denotes a right in the task.",
        14 => "The operation was aborted. Ipc code will catch this and reflect it as a message error.",
        KERN_INVALID_NAME => "The name doesn't denote a right in the task.",
        KERN_INVALID_TASK => "Target task isn't an active task.",
        KERN_INVALID_RIGHT => "The name denotes a right, but not an appropriate right.",
        KERN_INVALID_VALUE => "A blatant range error.",
        19 => "Operation would overflow limit on user-references.",
        20 => "The supplied (port) capability is improper.",
        21 => "The task already has send or receive rights for the port under another name.",
        22 => "Target host isn't actually a host.",
        23 => "An attempt was made to supply 'precious' data for memory that is already present in a memory object.",
        24 => {
            "A page was requested of a memory manager for a copy of an object, and the page was pushed into a copy \
             of the object while the kernel was walking the shadow chain. It will not be seen by users."
        }
        25 => {
            "A strategic copy was attempted of an object upon which a quicker copy is now possible. This error code \
             is seen only by the kernel."
        }
        26 => "An argument applied to assert processor set privilege was not a processor set control port.",
        27 => "The specified scheduling attributes exceed the thread's limits.",
        28 => "The specified scheduling policy is not currently enabled for the processor set.",
        29 => "The external memory manager failed to initialize the memory object.",
        30 => "A thread is attempting to wait for an event for which there is already a waiting thread.",
        31 => "An attempt was made to destroy the default processor set.",
        32 => {
            "An attempt was made to fetch an exception port that is protected, or to abort a thread while processing \
             a protected exception."
        }
        33 => "A ledger was required but not supplied.",
        34 => "The port was not a memory cache control port.",
        35 => "An argument supplied to assert security privilege was not a host security port.",
        36 => "thread_depress_abort was called on a thread which was not currently depressed.",
        KERN_TERMINATED => "Object has been terminated and is no longer available.",
        38 => "Lock set has been destroyed and is no longer available.",
        39 => "The thread holding the lock terminated before releasing the lock.",
        40 => "The lock is already owned by another thread.",
        41 => "The lock is already owned by the calling thread.",
        42 => "Semaphore has been destroyed and is no longer available.",
        43 => "Return from RPC indicating the target server was terminated before it successfully replied.",
        44 => "Terminate an orphaned activation.",
        45 => "Allow an orphaned activation to continue executing.",
        KERN_NOT_SUPPORTED => "Empty thread activation (No thread linked to it).",
        47 => "Remote node down or inaccessible.",
        48 => "A signalled thread was not actually waiting.",
        KERN_OPERATION_TIMED_OUT => "Some thread-oriented operation (semaphore_wait) timed out.",
        KERN_CODESIGN_ERROR => {
            "During a page fault, indicates that the page was rejected as a result of a signature check."
        }
        MACH_SEND_INVALID_DEST => "The reply destination port is invalid.",
        MACH_SEND_TIMED_OUT => "Timed out sending the exception reply.",
        MACH_SEND_INTERRUPTED => "Sending the exception reply was interrupted.",
        MACH_RCV_INVALID_NAME => "The exception port is not a valid receive right.",
        MACH_RCV_TIMED_OUT => "Timed out waiting for an exception message.",
        MACH_RCV_TOO_LARGE => "The exception message was larger than the receive buffer.",
        MACH_RCV_INTERRUPTED => "Receiving an exception message was interrupted.",
        MACH_RCV_PORT_DIED => "The exception port was destroyed while receiving.",
        MIG_BAD_ID => "The message id is not handled by this server.",
        MIG_BAD_ARGUMENTS => "The message body could not be decoded.",
        _ => GENERIC_MESSAGE,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn every_kern_code_has_a_specific_message()
    {
        for code in 1..=50 {
            assert_ne!(describe(code), GENERIC_MESSAGE, "code {code} fell through to the generic message");
        }
    }

    #[test]
    fn unknown_codes_use_generic_message()
    {
        assert_eq!(describe(51), GENERIC_MESSAGE);
        assert_eq!(describe(-1), GENERIC_MESSAGE);
        assert_eq!(KernelError::new(0x7777).message(), GENERIC_MESSAGE);
    }

    #[test]
    fn check_maps_success_to_ok()
    {
        assert!(check(KERN_SUCCESS).is_ok());
        assert_eq!(check(KERN_FAILURE).unwrap_err().code(), KERN_FAILURE);
    }

    #[test]
    fn timeouts_are_recognized()
    {
        assert!(KernelError::new(MACH_RCV_TIMED_OUT).is_timeout());
        assert!(KernelError::new(MACH_SEND_TIMED_OUT).is_timeout());
        assert!(!KernelError::new(KERN_OPERATION_TIMED_OUT).is_timeout());
    }
}
