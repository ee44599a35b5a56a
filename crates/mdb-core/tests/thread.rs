//! Thread pause/resume and register access.

use std::time::Duration;

use mdb_core::kern_return::{KERN_FAILURE, KERN_INVALID_ARGUMENT, KERN_TERMINATED};
use mdb_core::mock::{MockKernel, Op};
use mdb_core::types::{RegisterState, ThreadArchitecture, X86ThreadState32, X86ThreadState64};
use mdb_core::{MdbError, ProcessId, Task};

const WIDE: u32 = 0x1503;
const NARROW: u32 = 0x1603;
const STATELESS: u32 = 0x1703;

fn wide_state() -> X86ThreadState64
{
    X86ThreadState64 {
        rax: 1,
        rsp: 0x7ff7_bfef_f000,
        rip: 0x1_0000_3f20,
        rflags: 0x246,
        ..X86ThreadState64::default()
    }
}

fn narrow_state() -> X86ThreadState32
{
    X86ThreadState32 {
        eax: 7,
        esp: 0xbfff_f000,
        eip: 0x1f20,
        ..X86ThreadState32::default()
    }
}

fn target() -> (MockKernel, Task)
{
    let kernel = MockKernel::new()
        .with_wide_thread(WIDE, wide_state())
        .with_narrow_thread(NARROW, narrow_state())
        .with_thread(STATELESS);
    let mut task = Task::with_kernel(ProcessId::from(77), kernel.clone());
    task.attach().unwrap();
    (kernel, task)
}

fn thread(task: &Task, handle: u32) -> mdb_core::Thread<'_>
{
    task.threads()
        .unwrap()
        .into_iter()
        .find(|thread| thread.handle() == handle)
        .expect("thread exists")
}

#[test]
fn test_pause_and_resume()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);

    thread.pause().unwrap();
    assert!(thread.is_paused());
    assert_eq!(kernel.suspend_count(WIDE), Some(1));
    assert_eq!(kernel.abort_count(WIDE), Some(1));

    assert_eq!(thread.pause(), Err(MdbError::AlreadyPaused));
    assert_eq!(kernel.suspend_count(WIDE), Some(1));

    thread.resume().unwrap();
    assert!(!thread.is_paused());
    assert_eq!(kernel.suspend_count(WIDE), Some(0));

    assert_eq!(thread.resume(), Err(MdbError::NotPaused));
}

#[test]
fn test_event_thread_is_already_paused()
{
    let (kernel, task) = target();
    kernel.raise_exception(WIDE, 6, [1, 0]);

    let mut event = task.poll(Duration::from_millis(25)).unwrap().expect("event");
    assert!(event.thread.is_paused());

    assert_eq!(event.thread.pause().unwrap_err(), MdbError::AlreadyPaused);
    assert_eq!(kernel.suspend_count(WIDE), Some(1));
    assert!(event.thread.is_paused());
}

#[test]
fn test_failed_abort_resumes_thread()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);
    kernel.fail_once(Op::ThreadAbortSafely, KERN_TERMINATED);

    assert_eq!(thread.pause().unwrap_err().kernel_code(), Some(KERN_TERMINATED));
    assert!(!thread.is_paused());
    assert_eq!(kernel.suspend_count(WIDE), Some(0));
    assert_eq!(kernel.count(Op::ThreadResume), 1);
}

#[test]
fn test_failed_suspend_leaves_thread_running()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);
    kernel.fail_once(Op::ThreadSuspend, KERN_FAILURE);

    assert_eq!(thread.pause().unwrap_err().kernel_code(), Some(KERN_FAILURE));
    assert!(!thread.is_paused());
    assert_eq!(kernel.count(Op::ThreadAbortSafely), 0);
}

#[test]
fn test_failed_resume_keeps_thread_paused()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);
    thread.pause().unwrap();
    kernel.fail_once(Op::ThreadResume, KERN_FAILURE);

    assert!(thread.resume().is_err());
    assert!(thread.is_paused());
    thread.resume().unwrap();
}

#[test]
fn test_wide_thread_is_detected_and_pinned()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);

    let state = thread.get_state().unwrap();
    assert_eq!(thread.architecture(), ThreadArchitecture::Wide);
    assert_eq!(state.architecture(), ThreadArchitecture::Wide);
    assert_eq!(state.get("rip"), Some(0x1_0000_3f20));
    assert_eq!(state.get("rflags"), Some(0x246));
    assert_eq!(state.instruction_pointer(), 0x1_0000_3f20);
    assert_eq!(state.stack_pointer(), 0x7ff7_bfef_f000);
    assert_eq!(state.get("eip"), None);
    assert_eq!(state.registers().len(), 21);

    thread.get_state().unwrap();
    assert_eq!(kernel.count(Op::ThreadGetState), 2);
}

#[test]
fn test_narrow_thread_falls_back_and_pins()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, NARROW);

    let state = thread.get_state().unwrap();
    assert_eq!(thread.architecture(), ThreadArchitecture::Narrow);
    assert!(matches!(state, RegisterState::Narrow(_)));
    assert_eq!(state.get("eax"), Some(7));
    assert_eq!(state.instruction_pointer(), 0x1f20);
    assert_eq!(kernel.count(Op::ThreadGetState), 2);

    // Pinned: only the 32-bit flavor is queried from now on.
    thread.get_state().unwrap();
    assert_eq!(kernel.count(Op::ThreadGetState), 3);
}

#[test]
fn test_unreadable_thread_stays_unknown()
{
    let (_kernel, task) = target();
    let mut thread = thread(&task, STATELESS);

    assert_eq!(thread.get_state().unwrap_err().kernel_code(), Some(KERN_INVALID_ARGUMENT));
    assert_eq!(thread.architecture(), ThreadArchitecture::Unknown);
}

#[test]
fn test_pinned_failure_keeps_pin()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);
    thread.get_state().unwrap();

    kernel.fail_once(Op::ThreadGetState, KERN_TERMINATED);
    assert_eq!(thread.get_state().unwrap_err().kernel_code(), Some(KERN_TERMINATED));
    assert_eq!(thread.architecture(), ThreadArchitecture::Wide);
    assert_eq!(kernel.count(Op::ThreadGetState), 2);
}

#[test]
fn test_set_state_overlays_named_registers()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);

    thread.set_state([("rip", 0x2000_u64), ("rax", 0xdead_beef), ("bogus", 5)]).unwrap();

    let written = kernel.wide_state(WIDE).unwrap();
    assert_eq!(written.rip, 0x2000);
    assert_eq!(written.rax, 0xdead_beef);
    assert_eq!(written.rsp, wide_state().rsp);
    assert_eq!(kernel.count(Op::ThreadSetState), 1);

    assert_eq!(thread.get_state().unwrap().get("rip"), Some(0x2000));
}

#[test]
fn test_state_round_trip_leaves_registers_unchanged()
{
    let wide = X86ThreadState64 {
        rax: 0x1111,
        rbx: 0x2222,
        r8: 0x8888_0000_0000_0008,
        r15: u64::MAX,
        rip: 0x1_0000_3f20,
        rflags: 0x0000_0000_0020_0a97,
        cs: 0x2b,
        fs: 0x7ff8_0000_1000,
        gs: 0x33,
        ..X86ThreadState64::default()
    };
    let narrow = X86ThreadState32 {
        eax: 0xffff_ffff,
        edi: 0x8000_0000,
        ss: 0x23,
        eflags: 0x0000_0a97,
        eip: 0x1f20,
        cs: 0x1b,
        ds: 0x23,
        es: 0x23,
        fs: 0x0f,
        gs: 0x37,
        ..X86ThreadState32::default()
    };
    let kernel = MockKernel::new().with_wide_thread(WIDE, wide).with_narrow_thread(NARROW, narrow);
    let mut task = Task::with_kernel(ProcessId::from(77), kernel.clone());
    task.attach().unwrap();

    let mut wide_thread = thread(&task, WIDE);
    let registers = wide_thread.get_state().unwrap().registers();
    wide_thread.set_state(registers).unwrap();
    assert_eq!(kernel.wide_state(WIDE), Some(wide));
    wide_thread.set_state([("bogus", 5_u64)]).unwrap();
    assert_eq!(kernel.wide_state(WIDE), Some(wide));

    let mut narrow_thread = thread(&task, NARROW);
    let registers = narrow_thread.get_state().unwrap().registers();
    narrow_thread.set_state(registers).unwrap();
    assert_eq!(kernel.narrow_state(NARROW), Some(narrow));
    narrow_thread.set_state([("bogus", 5_u64)]).unwrap();
    assert_eq!(kernel.narrow_state(NARROW), Some(narrow));
}

#[test]
fn test_set_state_strict_rejects_unknown_names()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, WIDE);

    let err = thread.set_state_strict([("rip", 0x2000_u64), ("bogus", 5)]).unwrap_err();
    assert!(matches!(err, MdbError::InvalidArgument(_)));
    assert_eq!(kernel.count(Op::ThreadSetState), 0);
    assert_eq!(kernel.wide_state(WIDE), Some(wide_state()));

    thread.set_state_strict([("rip".to_string(), 0x3000)]).unwrap();
    assert_eq!(kernel.wide_state(WIDE).unwrap().rip, 0x3000);
}

#[test]
fn test_narrow_values_must_fit()
{
    let (kernel, task) = target();
    let mut thread = thread(&task, NARROW);

    let err = thread.set_state([("eip", 0x1_0000_0000_u64)]).unwrap_err();
    assert!(matches!(err, MdbError::InvalidArgument(_)));
    assert_eq!(kernel.narrow_state(NARROW), Some(narrow_state()));

    thread.set_state([("eip", 0xffff_ffff_u64), ("rip", 1)]).unwrap();
    assert_eq!(kernel.narrow_state(NARROW).unwrap().eip, 0xffff_ffff);
}

#[test]
fn test_thread_operations_after_detach()
{
    let kernel = MockKernel::new().with_wide_thread(WIDE, wide_state());
    let mut task = Task::with_kernel(ProcessId::from(77), kernel.clone());
    task.attach().unwrap();
    let handles: Vec<u32> = task.threads().unwrap().iter().map(mdb_core::Thread::handle).collect();
    assert_eq!(handles, [WIDE]);

    task.detach().unwrap();
    assert_eq!(task.threads().unwrap_err(), MdbError::NotAttached);
}
