//! # Mach FFI Declarations
//!
//! `extern "C"` declarations for the Mach calls `mach2` does not bind (or binds
//! with signatures that don't match how we call them), plus the `#[repr(C)]`
//! structures they fill in.
//!
//! Everything here is unsafe and only called from
//! [`MachKernel`](super::MachKernel).
//!
//! ## References
//!
//! - [XNU `osfmk/mach`](https://github.com/apple-oss-distributions/xnu/tree/main/osfmk/mach)

use libc::{c_int, kern_return_t, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t, vm_map_t};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

pub const MACH_PORT_RIGHT_RECEIVE: u32 = 1;
pub const MACH_MSG_TYPE_MAKE_SEND: u32 = 20;

/// `MACH_TASK_BASIC_INFO`
pub const MACH_TASK_BASIC_INFO: u32 = 20;
/// `MACH_TASK_BASIC_INFO_COUNT`
pub const MACH_TASK_BASIC_INFO_COUNT: mach_msg_type_number_t = 12;

/// `VM_REGION_BASIC_INFO_64`
pub const VM_REGION_BASIC_INFO_64: c_int = 9;
/// `VM_REGION_BASIC_INFO_COUNT_64`
pub const VM_REGION_BASIC_INFO_COUNT_64: mach_msg_type_number_t = 9;

/// `time_value_t`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeValue
{
    pub seconds: c_int,
    pub microseconds: c_int,
}

/// `mach_task_basic_info_data_t`
#[repr(C, packed(4))]
#[derive(Debug, Default, Clone, Copy)]
pub struct MachTaskBasicInfo
{
    pub virtual_size: u64,
    pub resident_size: u64,
    pub resident_size_max: u64,
    pub user_time: TimeValue,
    pub system_time: TimeValue,
    pub policy: c_int,
    pub suspend_count: c_int,
}

/// `vm_region_basic_info_data_64_t`
#[repr(C, packed(4))]
#[derive(Debug, Default, Clone, Copy)]
pub struct VmRegionBasicInfo64
{
    pub protection: c_int,
    pub max_protection: c_int,
    pub inheritance: u32,
    pub shared: u32,
    pub reserved: u32,
    pub offset: u64,
    pub behavior: c_int,
    pub user_wired_count: u16,
}

// Tasks and ports
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Send right to the task of `pid`. Needs root or the debugger entitlement.
    pub fn task_for_pid(target_tport: mach_port_t, pid: c_int, task: *mut mach_port_t) -> kern_return_t;

    pub fn task_info(
        target_task: mach_port_t,
        flavor: u32,
        task_info_out: *mut c_int,
        task_info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    pub fn task_set_exception_ports(
        task: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: c_int,
        new_flavor: c_int,
    ) -> kern_return_t;

    pub fn mach_port_allocate(task: mach_port_t, right: u32, name: *mut mach_port_t) -> kern_return_t;

    pub fn mach_port_insert_right(
        task: mach_port_t,
        name: mach_port_t,
        right: mach_port_t,
        right_type: u32,
    ) -> kern_return_t;

    pub fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;

    pub fn mach_port_destroy(task: mach_port_t, name: mach_port_t) -> kern_return_t;
}

// Threads
#[link(name = "c", kind = "dylib")]
extern "C" {
    pub fn thread_get_state(
        target_act: thread_act_t,
        flavor: c_int,
        old_state: *mut natural_t,
        old_state_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    pub fn thread_set_state(
        target_act: thread_act_t,
        flavor: c_int,
        new_state: *const natural_t,
        new_state_count: mach_msg_type_number_t,
    ) -> kern_return_t;

    pub fn thread_suspend(target_act: thread_act_t) -> kern_return_t;

    pub fn thread_resume(target_act: thread_act_t) -> kern_return_t;

    /// Abort an interruptible kernel call so the thread can be safely restarted.
    pub fn thread_abort_safely(target_act: thread_act_t) -> kern_return_t;
}

// Virtual memory
#[link(name = "c", kind = "dylib")]
extern "C" {
    pub fn mach_vm_region(
        target_task: vm_map_t,
        address: *mut mach_vm_address_t,
        size: *mut mach_vm_size_t,
        flavor: c_int,
        info: *mut c_int,
        info_count: *mut mach_msg_type_number_t,
        object_name: *mut mach_port_t,
    ) -> kern_return_t;

    pub fn mach_vm_write(
        target_task: vm_map_t,
        address: mach_vm_address_t,
        data: usize,
        data_count: mach_msg_type_number_t,
    ) -> kern_return_t;

    pub fn mach_vm_deallocate(target: vm_map_t, address: mach_vm_address_t, size: mach_vm_size_t) -> kern_return_t;
}
