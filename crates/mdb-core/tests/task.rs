//! Attach lifecycle, regions and thread enumeration against the mock kernel.

use mdb_core::kern_return::{KERN_FAILURE, KERN_INVALID_TASK, KERN_NO_SPACE, KERN_RESOURCE_SHORTAGE};
use mdb_core::kernel::{ExceptionBehavior, ExceptionMask, Protection, THREAD_STATE_NONE};
use mdb_core::mock::{MockKernel, Op, DEFAULT_TASK_PORT};
use mdb_core::types::ThreadArchitecture;
use mdb_core::{MdbError, MemoryRange, ProcessId, Task};

fn attached(kernel: &MockKernel) -> Task
{
    let mut task = Task::with_kernel(ProcessId::from(4242), kernel.clone());
    task.attach().expect("attach");
    task
}

#[test]
fn test_attach_registers_exception_port()
{
    let kernel = MockKernel::new();
    let task = attached(&kernel);

    assert!(task.is_attached());
    assert_eq!(task.task_port(), Some(DEFAULT_TASK_PORT));

    let exception_port = task.exception_port().expect("exception port");
    assert_eq!(kernel.receive_ports(), [exception_port]);

    let registration = kernel.exception_registration().expect("registered");
    assert_eq!(registration.port, exception_port);
    assert_eq!(registration.mask, ExceptionMask::ATTACH);
    assert_eq!(registration.mask.bits(), 0xEE);
    assert_eq!(registration.behavior, ExceptionBehavior::ATTACH);
    assert_eq!(registration.flavor, THREAD_STATE_NONE);
}

#[test]
fn test_basic_info_of_empty_target()
{
    let kernel = MockKernel::new().with_thread(0x203).with_thread(0x303);
    let task = attached(&kernel);

    let info = task.basic_info().unwrap();
    assert_eq!(info.suspend_count, 0);
    assert_eq!(info.virtual_size, 4096);
    assert_eq!(info.resident_size, 4096);

    assert!(task.find_region(0).unwrap().is_none());

    let threads = task.threads().unwrap();
    assert_eq!(threads.len(), 2);
    for thread in &threads {
        assert_eq!(thread.architecture(), ThreadArchitecture::Unknown);
        assert!(!thread.is_paused());
    }
}

#[test]
fn test_attach_twice_is_rejected()
{
    let kernel = MockKernel::new();
    let mut task = attached(&kernel);
    let before = (task.task_port(), task.exception_port());
    let calls = kernel.calls().len();

    assert_eq!(task.attach(), Err(MdbError::AlreadyAttached));
    assert_eq!((task.task_port(), task.exception_port()), before);
    assert_eq!(kernel.calls().len(), calls);
}

#[test]
fn test_attach_failure_at_task_for_pid_holds_nothing()
{
    let kernel = MockKernel::new();
    kernel.fail(Op::TaskForPid, KERN_FAILURE);
    let mut task = Task::with_kernel(ProcessId::from(1), kernel.clone());

    let err = task.attach().unwrap_err();
    assert_eq!(err.kernel_code(), Some(KERN_FAILURE));
    assert!(!task.is_attached());
    assert!(kernel.released_ports().is_empty());
    assert_eq!(kernel.count(Op::AllocateReceivePort), 0);
}

#[test]
fn test_attach_failure_at_port_allocation_releases_task()
{
    let kernel = MockKernel::new();
    kernel.fail(Op::AllocateReceivePort, KERN_RESOURCE_SHORTAGE);
    let mut task = Task::with_kernel(ProcessId::from(1), kernel.clone());

    assert_eq!(task.attach().unwrap_err().kernel_code(), Some(KERN_RESOURCE_SHORTAGE));
    assert_eq!(kernel.released_ports(), [DEFAULT_TASK_PORT]);
    assert!(!task.is_attached());
}

#[test]
fn test_attach_failure_after_allocation_releases_both_rights()
{
    for op in [Op::InsertSendRight, Op::SetExceptionPorts] {
        let kernel = MockKernel::new();
        kernel.fail(op, KERN_NO_SPACE);
        let mut task = Task::with_kernel(ProcessId::from(1), kernel.clone());

        assert_eq!(task.attach().unwrap_err().kernel_code(), Some(KERN_NO_SPACE), "{op:?}");
        assert!(!task.is_attached());
        assert!(kernel.receive_ports().is_empty(), "{op:?} leaked the exception port");

        let released = kernel.released_ports();
        assert_eq!(released.len(), 2, "{op:?}");
        assert!(released.contains(&DEFAULT_TASK_PORT));
        assert_eq!(kernel.count(Op::DestroyPort), 1);
        assert!(kernel.exception_registration().is_none());
    }
}

#[test]
fn test_attach_can_be_retried_after_failure()
{
    let kernel = MockKernel::new();
    kernel.fail_once(Op::SetExceptionPorts, KERN_FAILURE);
    let mut task = Task::with_kernel(ProcessId::from(1), kernel.clone());

    assert!(task.attach().is_err());
    task.attach().unwrap();
    assert!(task.is_attached());
}

#[test]
fn test_detach_releases_everything()
{
    let kernel = MockKernel::new();
    let mut task = attached(&kernel);
    let exception_port = task.exception_port().unwrap();

    task.detach().unwrap();

    assert!(!task.is_attached());
    assert_eq!(task.task_port(), None);
    assert!(kernel.exception_registration().is_none());
    assert!(kernel.receive_ports().is_empty());
    assert_eq!(kernel.released_ports(), [exception_port, DEFAULT_TASK_PORT]);

    assert_eq!(task.detach(), Err(MdbError::NotAttached));
}

#[test]
fn test_detach_runs_every_step_on_failure()
{
    let kernel = MockKernel::new();
    let mut task = attached(&kernel);
    kernel.fail(Op::SetExceptionPorts, KERN_INVALID_TASK);

    assert_eq!(task.detach().unwrap_err().kernel_code(), Some(KERN_INVALID_TASK));
    assert!(!task.is_attached());
    assert_eq!(kernel.count(Op::DestroyPort), 1);
    assert!(kernel.released_ports().contains(&DEFAULT_TASK_PORT));
}

#[test]
fn test_drop_detaches()
{
    let kernel = MockKernel::new();
    let exception_port = {
        let task = attached(&kernel);
        task.exception_port().unwrap()
    };

    assert_eq!(kernel.released_ports(), [exception_port, DEFAULT_TASK_PORT]);
    assert!(kernel.exception_registration().is_none());
}

#[test]
fn test_operations_require_attachment()
{
    let kernel = MockKernel::new().with_region(0x1000, Protection::READ, vec![0; 16]);
    let task = Task::with_kernel(ProcessId::from(1), kernel.clone());

    assert_eq!(task.find_region(0).unwrap_err(), MdbError::NotAttached);
    assert_eq!(task.memory(0x1000, 4).unwrap_err(), MdbError::NotAttached);
    assert_eq!(task.threads().unwrap_err(), MdbError::NotAttached);
    assert_eq!(task.basic_info().unwrap_err(), MdbError::NotAttached);
    assert!(matches!(task.regions().next(), Some(Err(MdbError::NotAttached))));
    assert!(kernel.calls().is_empty());
}

#[test]
fn test_find_region_returns_first_region_at_or_above()
{
    let kernel = MockKernel::new()
        .with_region(0x1000, Protection::READ, vec![1; 0x100])
        .with_region(0x8000, Protection::READ | Protection::WRITE, vec![2; 0x200]);
    let task = attached(&kernel);

    let region = task.find_region(0x1080).unwrap().expect("inside first");
    assert_eq!(region.address(), 0x1000);
    assert!(region.contains(0x1080));

    let region = task.find_region(0x2000).unwrap().expect("gap");
    assert_eq!((region.address(), region.size()), (0x8000, 0x200));
    assert_eq!(region.protection(), Protection::READ | Protection::WRITE);
    assert_eq!(region.end(), 0x8200);

    assert!(task.find_region(0x8200).unwrap().is_none());
}

#[test]
fn test_regions_iterate_in_order()
{
    let kernel = MockKernel::new()
        .with_region(0x9000, Protection::READ, vec![0; 0x10])
        .with_region(0x1000, Protection::empty(), vec![0; 0x10])
        .with_region(0x4000, Protection::all(), vec![0; 0x10]);
    let task = attached(&kernel);

    let starts: Vec<u64> = task.regions().map(|region| region.unwrap().address()).collect();
    assert_eq!(starts, [0x1000, 0x4000, 0x9000]);
}

#[test]
fn test_regions_stop_after_error()
{
    let kernel = MockKernel::new().with_region(0x1000, Protection::READ, vec![0; 0x10]);
    let task = attached(&kernel);
    kernel.fail(Op::Region, KERN_FAILURE);

    let mut regions = task.regions();
    assert_eq!(regions.next().unwrap().unwrap_err().kernel_code(), Some(KERN_FAILURE));
    assert!(regions.next().is_none());
}

#[test]
fn test_threads_release_their_ports()
{
    let kernel = MockKernel::new().with_thread(0x503).with_thread(0x603);
    let task = attached(&kernel);

    drop(task.threads().unwrap());

    let released = kernel.released_ports();
    assert!(released.contains(&0x503));
    assert!(released.contains(&0x603));
}
