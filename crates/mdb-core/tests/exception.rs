//! Exception port polling: dispatch, replies and cleanup.

use std::time::Duration;

use mdb_core::kern_return::{
    KERN_FAILURE, KERN_SUCCESS, KERN_TERMINATED, MACH_SEND_INVALID_DEST, MIG_BAD_ARGUMENTS, MIG_BAD_ID,
};
use mdb_core::message::{
    ExceptionReply, ExceptionRequest, MessageHeader, MACH_EXCEPTION_RAISE_STATE, MACH_EXCEPTION_RAISE_STATE_IDENTITY,
    MACH_MSG_TYPE_MOVE_SEND_ONCE, REQUEST_SIZE,
};
use mdb_core::mock::{MockKernel, Op, DEFAULT_TASK_PORT};
use mdb_core::types::X86ThreadState64;
use mdb_core::{ExceptionKind, MdbError, ProcessId, Task};

const THREAD: u32 = 0x2503;
const TIMEOUT: Duration = Duration::from_millis(25);

fn target() -> (MockKernel, Task)
{
    let kernel = MockKernel::new().with_wide_thread(
        THREAD,
        X86ThreadState64 {
            rip: 0x1000,
            ..X86ThreadState64::default()
        },
    );
    let mut task = Task::with_kernel(ProcessId::from(300), kernel.clone());
    task.attach().unwrap();
    (kernel, task)
}

fn only_reply(kernel: &MockKernel) -> ExceptionReply
{
    let sent = kernel.sent_messages();
    assert_eq!(sent.len(), 1, "expected exactly one reply");
    ExceptionReply::decode(&sent[0]).unwrap()
}

fn request_with_id(task: &Task, id: i32) -> Vec<u8>
{
    let mut request = ExceptionRequest::new(task.exception_port().unwrap(), 0x9003, THREAD, DEFAULT_TASK_PORT);
    request.header.id = id;
    let mut bytes = vec![0; REQUEST_SIZE];
    request.encode(&mut bytes);
    bytes
}

#[test]
fn test_poll_times_out_with_none()
{
    let (kernel, task) = target();

    assert!(task.poll(TIMEOUT).unwrap().is_none());
    assert!(kernel.sent_messages().is_empty());

    let receive = kernel.calls().into_iter().rfind(|call| call.op == Op::ReceiveMessage).unwrap();
    assert_eq!(receive.port, task.exception_port().unwrap());
    assert_eq!(receive.arg, 25);
}

#[test]
fn test_poll_requires_attachment()
{
    let kernel = MockKernel::new();
    let task = Task::with_kernel(ProcessId::from(1), kernel);

    assert_eq!(task.poll(TIMEOUT).unwrap_err(), MdbError::NotAttached);
}

#[test]
fn test_breakpoint_event()
{
    let (kernel, task) = target();
    kernel.raise_exception(THREAD, 6, [1, 0]);

    let mut event = task.poll(TIMEOUT).unwrap().expect("event");
    assert_eq!(event.kind, ExceptionKind::Breakpoint);
    assert_eq!(event.exception, 6);
    assert_eq!(event.codes, [1, 0]);
    assert_eq!(event.thread.handle(), THREAD);
    assert!(event.thread.is_paused());
    assert_eq!(kernel.suspend_count(THREAD), Some(1));

    // The task right carried by the message is released immediately.
    assert!(kernel.released_ports().contains(&DEFAULT_TASK_PORT));
    assert!(!kernel.released_ports().contains(&THREAD));

    let reply = only_reply(&kernel);
    assert_eq!(reply.header.id, 2505);
    assert_eq!(reply.header.remote_port, 0x1103);
    assert_eq!(reply.header.bits, u32::from(MACH_MSG_TYPE_MOVE_SEND_ONCE));
    assert_eq!(reply.ret_code, KERN_SUCCESS);

    assert_eq!(event.thread.get_state().unwrap().instruction_pointer(), 0x1000);
    event.thread.resume().unwrap();
    assert_eq!(kernel.suspend_count(THREAD), Some(0));

    drop(event);
    assert!(kernel.released_ports().contains(&THREAD));
}

#[test]
fn test_events_are_delivered_in_order()
{
    let (kernel, task) = target();
    kernel.raise_exception(THREAD, 1, [2, 0xdead]);
    kernel.raise_exception(THREAD, 42, [0, 0]);

    let first = task.poll(TIMEOUT).unwrap().unwrap();
    assert_eq!(first.kind, ExceptionKind::BadAccess);
    assert_eq!(first.codes, [2, 0xdead]);

    let second = task.poll(TIMEOUT).unwrap().unwrap();
    assert_eq!(second.kind, ExceptionKind::Unknown);
    assert_eq!(second.kind.name(), "UNKNOWN");

    assert_eq!(kernel.pending_messages(), 0);
    assert_eq!(kernel.suspend_count(THREAD), Some(2));
}

#[test]
fn test_state_requests_are_rejected()
{
    for id in [MACH_EXCEPTION_RAISE_STATE, MACH_EXCEPTION_RAISE_STATE_IDENTITY] {
        let (kernel, task) = target();
        kernel.push_message(request_with_id(&task, id));

        assert_eq!(task.poll(TIMEOUT).unwrap_err().kernel_code(), Some(KERN_FAILURE));

        let reply = only_reply(&kernel);
        assert_eq!(reply.header.id, id + 100);
        assert_eq!(reply.header.remote_port, 0x9003);
        assert_eq!(reply.ret_code, KERN_FAILURE);

        let released = kernel.released_ports();
        assert!(released.contains(&THREAD));
        assert!(released.contains(&DEFAULT_TASK_PORT));
        assert_eq!(kernel.suspend_count(THREAD), Some(0));
    }
}

#[test]
fn test_unknown_message_id_gets_mig_bad_id()
{
    let (kernel, task) = target();
    let header = MessageHeader {
        bits: u32::from(MACH_MSG_TYPE_MOVE_SEND_ONCE),
        size: 24,
        remote_port: 0x9003,
        local_port: task.exception_port().unwrap(),
        voucher_port: 0,
        id: 9999,
    };
    let mut bytes = vec![0; 24];
    header.encode(&mut bytes);
    kernel.push_message(bytes);

    assert_eq!(task.poll(TIMEOUT).unwrap_err().kernel_code(), Some(MIG_BAD_ID));

    let reply = only_reply(&kernel);
    assert_eq!(reply.header.id, 10099);
    assert_eq!(reply.ret_code, MIG_BAD_ID);
}

#[test]
fn test_maximum_message_id_gets_mig_bad_id()
{
    let (kernel, task) = target();
    let header = MessageHeader {
        bits: u32::from(MACH_MSG_TYPE_MOVE_SEND_ONCE),
        size: 24,
        remote_port: 0x9003,
        local_port: task.exception_port().unwrap(),
        voucher_port: 0,
        id: i32::MAX,
    };
    let mut bytes = vec![0; 24];
    header.encode(&mut bytes);
    kernel.push_message(bytes);

    assert_eq!(task.poll(TIMEOUT).unwrap_err().kernel_code(), Some(MIG_BAD_ID));

    let reply = only_reply(&kernel);
    assert_eq!(reply.header.id, i32::MAX.wrapping_add(100));
    assert_eq!(reply.header.remote_port, 0x9003);
    assert_eq!(reply.ret_code, MIG_BAD_ID);
}

#[test]
fn test_truncated_raise_gets_bad_arguments()
{
    let (kernel, task) = target();
    let mut bytes = request_with_id(&task, 2405);
    bytes.truncate(40);
    kernel.push_message(bytes);

    assert_eq!(task.poll(TIMEOUT).unwrap_err().kernel_code(), Some(MIG_BAD_ARGUMENTS));
    assert_eq!(only_reply(&kernel).ret_code, MIG_BAD_ARGUMENTS);
    assert_eq!(kernel.suspend_count(THREAD), Some(0));
}

#[test]
fn test_suspend_failure_is_reported_in_reply()
{
    let (kernel, task) = target();
    kernel.fail_once(Op::ThreadSuspend, KERN_TERMINATED);
    kernel.raise_exception(THREAD, 6, [1, 0]);

    assert_eq!(task.poll(TIMEOUT).unwrap_err().kernel_code(), Some(KERN_TERMINATED));
    assert_eq!(only_reply(&kernel).ret_code, KERN_TERMINATED);

    let released = kernel.released_ports();
    assert!(released.contains(&THREAD));
    assert!(released.contains(&DEFAULT_TASK_PORT));
}

#[test]
fn test_send_failure_resumes_thread()
{
    let (kernel, task) = target();
    kernel.fail_once(Op::SendMessage, MACH_SEND_INVALID_DEST);
    kernel.raise_exception(THREAD, 6, [1, 0]);

    assert_eq!(task.poll(TIMEOUT).unwrap_err().kernel_code(), Some(MACH_SEND_INVALID_DEST));
    assert_eq!(kernel.suspend_count(THREAD), Some(0));
    assert_eq!(kernel.count(Op::ThreadResume), 1);
    assert!(kernel.released_ports().contains(&THREAD));

    // The monitor keeps working afterwards.
    kernel.raise_exception(THREAD, 3, [0, 0]);
    let event = task.poll(TIMEOUT).unwrap().unwrap();
    assert_eq!(event.kind, ExceptionKind::Arithmetic);
}

#[test]
fn test_receive_failure_is_surfaced()
{
    let (kernel, task) = target();
    kernel.fail_once(Op::ReceiveMessage, KERN_FAILURE);

    assert_eq!(task.poll(TIMEOUT).unwrap_err().kernel_code(), Some(KERN_FAILURE));
    assert!(kernel.sent_messages().is_empty());
}
