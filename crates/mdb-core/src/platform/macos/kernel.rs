//! [`Kernel`] over the real Mach traps.
//!
//! Each method is one unsafe call (or a short fixed sequence) checked with
//! [`kern_return::check`]. Nothing here retries or interprets results.

use std::mem;

use libc::{c_int, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t};
use mach2::message::{
    mach_msg, mach_msg_header_t, MACH_MSG_SUCCESS, MACH_RCV_MSG, MACH_RCV_TIMEOUT, MACH_SEND_MSG, MACH_SEND_TIMEOUT,
};
use mach2::port::MACH_PORT_NULL;
use mach2::task::task_threads;
use mach2::traps::mach_task_self;
use mach2::vm::mach_vm_read_overwrite;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use tracing::trace;

use super::ffi;
use crate::kern_return::{self, KernelError, KERN_INVALID_ARGUMENT, MACH_RCV_TOO_LARGE};
use crate::kernel::{
    ExceptionBehavior, ExceptionMask, KernResult, Kernel, MessageBuffer, PortName, Protection, RegionInfo,
    MESSAGE_BUFFER_SIZE,
};
use crate::message::MessageHeader;
use crate::types::{ProcessId, TaskBasicInfo, TimeValue};

/// The live Mach kernel of this host.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachKernel;

impl MachKernel
{
    #[must_use]
    pub const fn new() -> Self
    {
        Self
    }
}

fn word_count(len: usize) -> KernResult<mach_msg_type_number_t>
{
    mach_msg_type_number_t::try_from(len).map_err(|_| KernelError::new(KERN_INVALID_ARGUMENT))
}

impl Kernel for MachKernel
{
    fn task_for_pid(&self, pid: ProcessId) -> KernResult<PortName>
    {
        let mut task: mach_port_t = MACH_PORT_NULL;
        let result = unsafe { ffi::task_for_pid(mach_task_self(), pid.as_raw(), &mut task) };
        kern_return::check(result)?;
        trace!(%pid, task, "task_for_pid");
        Ok(task)
    }

    fn task_basic_info(&self, task: PortName) -> KernResult<TaskBasicInfo>
    {
        let mut info = ffi::MachTaskBasicInfo::default();
        let mut count = ffi::MACH_TASK_BASIC_INFO_COUNT;
        let result = unsafe {
            ffi::task_info(
                task,
                ffi::MACH_TASK_BASIC_INFO,
                std::ptr::addr_of_mut!(info).cast::<c_int>(),
                &mut count,
            )
        };
        kern_return::check(result)?;

        let ffi::MachTaskBasicInfo {
            virtual_size,
            resident_size,
            user_time,
            system_time,
            suspend_count,
            ..
        } = info;
        Ok(TaskBasicInfo {
            suspend_count,
            virtual_size,
            resident_size,
            user_time: TimeValue::new(user_time.seconds, user_time.microseconds),
            system_time: TimeValue::new(system_time.seconds, system_time.microseconds),
        })
    }

    fn task_threads(&self, task: PortName) -> KernResult<Vec<PortName>>
    {
        let mut threads: *mut thread_act_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        kern_return::check(unsafe { task_threads(task, &mut threads, &mut count) })?;

        if threads.is_null() || count == 0 {
            return Ok(Vec::new());
        }
        let handles = unsafe { std::slice::from_raw_parts(threads, count as usize) }.to_vec();

        // The array is out-of-line memory owned by us now.
        let size = (count as usize * mem::size_of::<thread_act_t>()) as mach_vm_size_t;
        let result = unsafe { ffi::mach_vm_deallocate(mach_task_self(), threads as mach_vm_address_t, size) };
        if let Err(err) = kern_return::check(result) {
            trace!("Failed to release task_threads array: {err}");
        }
        Ok(handles)
    }

    fn allocate_receive_port(&self) -> KernResult<PortName>
    {
        let mut port: mach_port_t = MACH_PORT_NULL;
        let result = unsafe { ffi::mach_port_allocate(mach_task_self(), ffi::MACH_PORT_RIGHT_RECEIVE, &mut port) };
        kern_return::check(result)?;
        Ok(port)
    }

    fn insert_send_right(&self, port: PortName) -> KernResult<()>
    {
        let result =
            unsafe { ffi::mach_port_insert_right(mach_task_self(), port, port, ffi::MACH_MSG_TYPE_MAKE_SEND) };
        kern_return::check(result)
    }

    fn set_exception_ports(
        &self,
        task: PortName,
        mask: ExceptionMask,
        port: PortName,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> KernResult<()>
    {
        // exception_behavior_t is an int; MACH_EXCEPTION_CODES sets the sign bit.
        #[allow(clippy::cast_possible_wrap)]
        let behavior = behavior.bits() as c_int;
        let result = unsafe { ffi::task_set_exception_ports(task, mask.bits(), port, behavior, flavor) };
        kern_return::check(result)
    }

    fn destroy_port(&self, port: PortName) -> KernResult<()>
    {
        kern_return::check(unsafe { ffi::mach_port_destroy(mach_task_self(), port) })
    }

    fn deallocate_port(&self, port: PortName) -> KernResult<()>
    {
        kern_return::check(unsafe { ffi::mach_port_deallocate(mach_task_self(), port) })
    }

    fn region(&self, task: PortName, address: u64) -> KernResult<RegionInfo>
    {
        let mut start: mach_vm_address_t = address;
        let mut size: mach_vm_size_t = 0;
        let mut info = ffi::VmRegionBasicInfo64::default();
        let mut count = ffi::VM_REGION_BASIC_INFO_COUNT_64;
        let mut object_name: mach_port_t = MACH_PORT_NULL;

        let result = unsafe {
            ffi::mach_vm_region(
                task,
                &mut start,
                &mut size,
                ffi::VM_REGION_BASIC_INFO_64,
                std::ptr::addr_of_mut!(info).cast::<c_int>(),
                &mut count,
                &mut object_name,
            )
        };
        kern_return::check(result)?;

        let ffi::VmRegionBasicInfo64 {
            protection,
            max_protection,
            inheritance,
            shared,
            reserved,
            behavior,
            ..
        } = info;
        Ok(RegionInfo {
            address: start,
            size,
            protection: Protection::from_bits_truncate(protection),
            max_protection: Protection::from_bits_truncate(max_protection),
            inheritance,
            shared: shared != 0,
            reserved: reserved != 0,
            behavior,
        })
    }

    fn read_overwrite(&self, task: PortName, address: u64, buffer: &mut [u8]) -> KernResult<usize>
    {
        let mut transferred: mach_vm_size_t = 0;
        let result = unsafe {
            mach_vm_read_overwrite(
                task,
                address,
                buffer.len() as mach_vm_size_t,
                buffer.as_mut_ptr() as mach_vm_address_t,
                &mut transferred,
            )
        };
        kern_return::check(result)?;
        Ok(usize::try_from(transferred).map_or(buffer.len(), |n| n.min(buffer.len())))
    }

    fn write(&self, task: PortName, address: u64, data: &[u8]) -> KernResult<()>
    {
        let count = word_count(data.len())?;
        let result = unsafe { ffi::mach_vm_write(task, address, data.as_ptr() as usize, count) };
        kern_return::check(result)
    }

    fn thread_suspend(&self, thread: PortName) -> KernResult<()>
    {
        kern_return::check(unsafe { ffi::thread_suspend(thread) })
    }

    fn thread_resume(&self, thread: PortName) -> KernResult<()>
    {
        kern_return::check(unsafe { ffi::thread_resume(thread) })
    }

    fn thread_abort_safely(&self, thread: PortName) -> KernResult<()>
    {
        kern_return::check(unsafe { ffi::thread_abort_safely(thread) })
    }

    fn thread_get_state(&self, thread: PortName, flavor: i32, state: &mut [u32]) -> KernResult<usize>
    {
        let mut count = word_count(state.len())?;
        let result = unsafe { ffi::thread_get_state(thread, flavor, state.as_mut_ptr().cast::<natural_t>(), &mut count) };
        kern_return::check(result)?;
        Ok((count as usize).min(state.len()))
    }

    fn thread_set_state(&self, thread: PortName, flavor: i32, state: &[u32]) -> KernResult<()>
    {
        let count = word_count(state.len())?;
        let result = unsafe { ffi::thread_set_state(thread, flavor, state.as_ptr().cast::<natural_t>(), count) };
        kern_return::check(result)
    }

    fn receive_message(&self, port: PortName, buffer: &mut MessageBuffer, timeout_ms: u32) -> KernResult<usize>
    {
        let header = buffer.as_bytes_mut().as_mut_ptr().cast::<mach_msg_header_t>();
        let result = unsafe {
            mach_msg(
                header,
                MACH_RCV_MSG | MACH_RCV_TIMEOUT,
                0,
                MESSAGE_BUFFER_SIZE as u32,
                port,
                timeout_ms,
                MACH_PORT_NULL,
            )
        };
        if result != MACH_MSG_SUCCESS {
            return Err(KernelError::new(result));
        }
        let header = MessageHeader::decode(buffer.as_bytes()).map_err(|_| KernelError::new(MACH_RCV_TOO_LARGE))?;
        Ok((header.size as usize).min(MESSAGE_BUFFER_SIZE))
    }

    fn send_message(&self, buffer: &mut MessageBuffer, len: usize, timeout_ms: u32) -> KernResult<()>
    {
        let len = word_count(len.min(MESSAGE_BUFFER_SIZE))?;
        let header = buffer.as_bytes_mut().as_mut_ptr().cast::<mach_msg_header_t>();
        let result = unsafe {
            mach_msg(
                header,
                MACH_SEND_MSG | MACH_SEND_TIMEOUT,
                len,
                0,
                MACH_PORT_NULL,
                timeout_ms,
                MACH_PORT_NULL,
            )
        };
        kern_return::check(result)
    }
}
