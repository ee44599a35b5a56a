//! # Regions and Memory
//!
//! Two views of target memory share one read algorithm ([`MemoryRange`]):
//!
//! - **[`Region`]**: snapshot of a `mach_vm_region` result, read-only
//! - **[`Memory`]**: arbitrary `address`/`size` range, readable and writable
//!
//! ## Clamping
//!
//! A transfer at `offset` of `size` bytes is clamped to the declared size:
//! `size = min(size, declared - offset)`. An `offset` past the declared size
//! is rejected. Reads return exactly the bytes the kernel reports
//! transferred, which may be fewer than requested.

use std::fmt;

use tracing::trace;

use crate::error::{MdbError, MdbResult};
use crate::kernel::{Protection, RegionInfo};
use crate::task::Task;

/// Clamp `size` (default: everything) at `offset` into a range of `declared` bytes.
fn clamp(declared: u64, offset: u64, size: Option<u64>) -> MdbResult<u64>
{
    if offset > declared {
        return Err(MdbError::InvalidArgument(format!(
            "offset 0x{offset:x} is past the end of a 0x{declared:x} byte range"
        )));
    }
    let available = declared - offset;
    Ok(size.map_or(available, |size| size.min(available)))
}

/// Target address `offset` bytes past `base`.
fn offset_address(base: u64, offset: u64) -> MdbResult<u64>
{
    base.checked_add(offset).ok_or_else(|| {
        MdbError::InvalidArgument(format!("0x{base:x} + 0x{offset:x} overflows the address space"))
    })
}

fn byte_count(size: u64) -> MdbResult<usize>
{
    usize::try_from(size).map_err(|_| MdbError::InvalidArgument(format!("0x{size:x} bytes do not fit in memory")))
}

/// A readable range of target memory.
///
/// ## Example
///
/// ```rust
/// use mdb_core::kernel::Protection;
/// use mdb_core::mock::MockKernel;
/// use mdb_core::{MemoryRange, ProcessId, Task};
///
/// let kernel = MockKernel::new().with_region(0x4000, Protection::READ, b"abcdef".to_vec());
/// let mut task = Task::with_kernel(ProcessId::from(1), kernel);
/// task.attach()?;
/// let region = task.find_region(0x4000)?.expect("mapped");
/// assert_eq!(region.read(2, Some(100))?, b"cdef");
/// # Ok::<(), mdb_core::MdbError>(())
/// ```
pub trait MemoryRange
{
    /// Task the range belongs to.
    fn task(&self) -> &Task;

    /// Start address in the target.
    fn address(&self) -> u64;

    /// Declared size in bytes.
    fn size(&self) -> u64;

    /// Read up to `size` bytes (default: to the end) starting `offset` bytes in.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `InvalidArgument`: `offset` is past the declared size
    /// - `Kernel`: `mach_vm_read_overwrite` failed
    fn read(&self, offset: u64, size: Option<u64>) -> MdbResult<Vec<u8>>
    {
        let task = self.task();
        let attachment = task.attachment()?;
        let size = clamp(self.size(), offset, size)?;
        let mut buffer = vec![0_u8; byte_count(size)?];
        if buffer.is_empty() {
            return Ok(buffer);
        }
        let address = offset_address(self.address(), offset)?;
        let transferred = task.kernel().read_overwrite(attachment.task, address, &mut buffer)?;
        trace!(address, requested = buffer.len(), transferred, "Read target memory");
        buffer.truncate(transferred);
        Ok(buffer)
    }

    /// Read the whole range.
    ///
    /// ## Errors
    ///
    /// See [`MemoryRange::read`].
    fn read_all(&self) -> MdbResult<Vec<u8>>
    {
        self.read(0, None)
    }
}

/// Snapshot of one VM region, from [`Task::find_region`] or [`Task::regions`].
#[derive(Clone, Copy)]
pub struct Region<'t>
{
    task: &'t Task,
    info: RegionInfo,
}

impl<'t> Region<'t>
{
    pub(crate) fn new(task: &'t Task, info: RegionInfo) -> Self
    {
        Self { task, info }
    }

    #[must_use]
    pub fn info(&self) -> RegionInfo
    {
        self.info
    }

    #[must_use]
    pub fn protection(&self) -> Protection
    {
        self.info.protection
    }

    #[must_use]
    pub fn max_protection(&self) -> Protection
    {
        self.info.max_protection
    }

    #[must_use]
    pub fn inheritance(&self) -> u32
    {
        self.info.inheritance
    }

    #[must_use]
    pub fn is_shared(&self) -> bool
    {
        self.info.shared
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool
    {
        self.info.reserved
    }

    #[must_use]
    pub fn behavior(&self) -> i32
    {
        self.info.behavior
    }

    /// End address (exclusive), saturating at `u64::MAX`.
    #[must_use]
    pub fn end(&self) -> u64
    {
        self.info.address.saturating_add(self.info.size)
    }

    #[must_use]
    pub fn contains(&self, address: u64) -> bool
    {
        address >= self.info.address && address < self.end()
    }

    /// Writable accessor over the same range.
    #[must_use]
    pub fn memory(&self) -> Memory<'t>
    {
        Memory::new(self.task, self.info.address, self.info.size)
    }
}

impl MemoryRange for Region<'_>
{
    fn task(&self) -> &Task
    {
        self.task
    }

    fn address(&self) -> u64
    {
        self.info.address
    }

    fn size(&self) -> u64
    {
        self.info.size
    }
}

impl fmt::Debug for Region<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Region").field("pid", &self.task.pid()).field("info", &self.info).finish()
    }
}

impl fmt::Display for Region<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "0x{:016x}-0x{:016x} {}/{}{}",
            self.info.address,
            self.end(),
            self.info.protection.to_rwx(),
            self.info.max_protection.to_rwx(),
            if self.info.shared { " shared" } else { "" }
        )
    }
}

/// Arbitrary `address`/`size` range, from [`Task::memory`] or [`Region::memory`].
#[derive(Clone, Copy)]
pub struct Memory<'t>
{
    task: &'t Task,
    address: u64,
    size: u64,
}

impl<'t> Memory<'t>
{
    pub(crate) fn new(task: &'t Task, address: u64, size: u64) -> Self
    {
        Self { task, address, size }
    }

    /// Write `data` starting `offset` bytes in, trimmed to the declared size.
    ///
    /// The clamped buffer goes out in a single `mach_vm_write`; there is no
    /// partial-write reporting.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `InvalidArgument`: `offset` is past the declared size
    /// - `Kernel`: `mach_vm_write` failed (commonly `KERN_PROTECTION_FAILURE`)
    pub fn write(&self, data: &[u8], offset: u64) -> MdbResult<()>
    {
        let attachment = self.task.attachment()?;
        let size = clamp(self.size, offset, Some(data.len() as u64))?;
        let data = &data[..byte_count(size)?];
        if data.is_empty() {
            return Ok(());
        }
        let address = offset_address(self.address, offset)?;
        self.task.kernel().write(attachment.task, address, data)?;
        trace!(address, len = data.len(), "Wrote target memory");
        Ok(())
    }
}

impl MemoryRange for Memory<'_>
{
    fn task(&self) -> &Task
    {
        self.task
    }

    fn address(&self) -> u64
    {
        self.address
    }

    fn size(&self) -> u64
    {
        self.size
    }
}

impl fmt::Debug for Memory<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Memory")
            .field("pid", &self.task.pid())
            .field("address", &format_args!("0x{:x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn clamp_trims_to_declared_size()
    {
        assert_eq!(clamp(16, 0, None).unwrap(), 16);
        assert_eq!(clamp(16, 4, None).unwrap(), 12);
        assert_eq!(clamp(16, 4, Some(100)).unwrap(), 12);
        assert_eq!(clamp(16, 4, Some(3)).unwrap(), 3);
        assert_eq!(clamp(16, 16, None).unwrap(), 0);
    }

    #[test]
    fn clamp_rejects_offset_past_end()
    {
        assert!(matches!(clamp(16, 17, None), Err(MdbError::InvalidArgument(_))));
    }

    #[test]
    fn offset_address_rejects_overflow()
    {
        assert_eq!(offset_address(0x1000, 0x10).unwrap(), 0x1010);
        assert!(matches!(offset_address(u64::MAX - 1, 2), Err(MdbError::InvalidArgument(_))));
    }
}
