//! Common module for library exports

pub use crate::error::{MdbError, MdbResult};
pub use crate::exception::{ExceptionEvent, ExceptionKind};
pub use crate::kern_return::KernelError;
pub use crate::kernel::{Kernel, PortName, Protection, RegionInfo};
pub use crate::region::{Memory, MemoryRange, Region};
pub use crate::scan::{search, SearchHit};
pub use crate::task::Task;
pub use crate::thread::Thread;
pub use crate::types::{ProcessId, RegisterState, TaskBasicInfo, ThreadArchitecture};
