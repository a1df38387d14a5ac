//! Tests for per-thread execution control against a scripted backend

mod common;

use common::{addr, Call, Runtime, Script, ScriptedStop, MAIN};
use mantle_core::breakpoints::builder::BreakpointBuilder;
use mantle_core::error::MantleError;
use mantle_core::events::DebuggerEvent;
use mantle_core::session::Session;
use mantle_core::target::ResumeMode;
use mantle_core::thread::{StepMode, ThreadServant, ThreadState};
use mantle_core::types::{FrameStatus, StopReason, ThreadId};

struct Fixture
{
    runtime: Runtime,
    session: Session,
    script: Script,
}

/// Main and Helper compiled; the main thread stopped at `pc`.
fn stopped_at(offset: u64) -> Fixture
{
    let mut runtime = Runtime::new();
    let main = runtime.main_method();
    runtime.compile(&main);
    let helper = runtime.helper_method();
    runtime.compile(&helper);
    let (session, script) = runtime.session(&[(MAIN, runtime.code + offset, runtime.stack)]);
    Fixture {
        runtime,
        session,
        script,
    }
}

fn assert_invalid_state<T: std::fmt::Debug>(result: Result<T, MantleError>)
{
    match result {
        Err(MantleError::InvalidState { expected, .. }) => assert_eq!(expected, "stopped"),
        other => panic!("Expected InvalidState, got {other:?}"),
    }
}

#[test]
fn test_initial_state()
{
    let f = stopped_at(0x10);
    assert_eq!(f.session.threads().unwrap(), vec![MAIN]);
    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();

    assert_eq!(thread.id(), MAIN);
    assert_eq!(thread.state(), ThreadState::Stopped);
    assert_eq!(thread.step_mode(), StepMode::Run);
    assert_eq!(thread.registers().unwrap().pc, f.runtime.code + 0x10);

    let frame = thread.current_frame().unwrap();
    assert_eq!(frame.method_name.as_deref(), Some("Main"));
    assert_eq!(frame.source.map(|s| s.line), Some(11));
    assert_eq!(frame.status, FrameStatus::Registers);
    assert!(f.session.thread(ThreadId(9)).is_err());
}

#[test]
fn test_continue_to_breakpoint()
{
    let f = stopped_at(0x10);
    let id = f
        .session
        .create_breakpoint(BreakpointBuilder::method("App", "Main").at_line(12).build())
        .unwrap();
    f.script.hit(MAIN, f.runtime.code + 0x20);
    let events = f.session.subscribe();

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.continue_execution().unwrap();

    assert_eq!(stop.reason, StopReason::Breakpoint(f.runtime.code + 0x20));
    assert_eq!(stop.breakpoints, vec![id]);
    let frame = stop.frame.unwrap();
    assert_eq!(frame.pc, addr(f.runtime.code + 0x20));
    assert_eq!(frame.source.map(|s| s.line), Some(12));
    assert_eq!(thread.state(), ThreadState::Stopped);
    assert_eq!(f.script.resumes(), vec![ResumeMode::Continue]);
    assert_eq!(f.session.breakpoints().get(id).unwrap().hit_count, 1);
    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![
            DebuggerEvent::TargetResumed { thread: MAIN },
            DebuggerEvent::TargetStopped {
                reason: StopReason::Breakpoint(f.runtime.code + 0x20),
                thread: Some(MAIN),
                breakpoints: vec![id],
            },
        ]
    );
}

#[test]
fn test_notifications_resume_silently()
{
    let mut runtime = Runtime::new();
    let main = runtime.main_method();
    runtime.compile(&main);
    let helper = runtime.helper_method();
    let helper = runtime.descriptor(&helper);
    let (session, script) = runtime.session(&[(MAIN, runtime.code + 0x10, runtime.stack)]);
    let id = session
        .create_breakpoint(BreakpointBuilder::method("App", "Helper").build())
        .unwrap();

    script.notify(MAIN, runtime.hook, 8, 0, 77);
    script.notify(MAIN, runtime.hook, 6, helper, 0);
    script.hit(MAIN, runtime.code + 0x100);

    let servant = session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.continue_execution().unwrap();

    assert_eq!(stop.breakpoints, vec![id]);
    assert_eq!(stop.frame.unwrap().method_name.as_deref(), Some("Helper"));
    assert_eq!(script.resumes().len(), 3);
    assert_eq!(script.pending_stops(), 0);
    assert_eq!(session.threads().unwrap(), vec![MAIN, ThreadId(77)]);
}

#[test]
fn test_ignored_hits_resume_silently()
{
    let f = stopped_at(0x10);
    let id = f
        .session
        .create_breakpoint(BreakpointBuilder::method("App", "Main").at_line(12).with_hit_count(2).build())
        .unwrap();
    f.script.hit(MAIN, f.runtime.code + 0x20);
    f.script.hit(MAIN, f.runtime.code + 0x20);

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().continue_execution().unwrap();

    assert_eq!(stop.breakpoints, vec![id]);
    assert_eq!(f.script.resumes(), vec![ResumeMode::Continue, ResumeMode::Continue]);
}

#[test]
fn test_foreign_trap_and_signal_are_reported()
{
    let f = stopped_at(0x10);
    f.script.hit(MAIN, f.runtime.code + 0x30);
    f.script
        .push(ScriptedStop::new(MAIN, StopReason::Signal(11)).at(f.runtime.code + 0x34));

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();

    let trap = thread.continue_execution().unwrap();
    assert_eq!(trap.reason, StopReason::Breakpoint(f.runtime.code + 0x30));
    assert!(trap.breakpoints.is_empty());

    let signal = thread.continue_execution().unwrap();
    assert_eq!(signal.reason, StopReason::Signal(11));
    assert_eq!(signal.frame.unwrap().pc, addr(f.runtime.code + 0x34));
}

#[test]
fn test_step_instruction()
{
    let f = stopped_at(0x10);
    f.script.step_to(MAIN, f.runtime.code + 0x14);

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.step_instruction(false).unwrap();

    assert_eq!(stop.reason, StopReason::Step);
    assert!(stop.breakpoints.is_empty());
    assert_eq!(stop.frame.unwrap().pc, addr(f.runtime.code + 0x14));
    assert_eq!(thread.step_mode(), StepMode::StepInstruction { over_calls: false });
    assert_eq!(f.script.resumes(), vec![ResumeMode::SingleStep]);
}

#[test]
fn test_step_line_runs_until_line_changes()
{
    let f = stopped_at(0x10);
    for offset in [0x14, 0x18, 0x1c, 0x20] {
        f.script.step_to(MAIN, f.runtime.code + offset);
    }

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.step_line(false).unwrap();

    assert_eq!(stop.reason, StopReason::Step);
    let frame = stop.frame.unwrap();
    assert_eq!(frame.pc, addr(f.runtime.code + 0x20));
    assert_eq!(frame.source.map(|s| s.line), Some(12));
    assert_eq!(f.script.resumes().len(), 4);
    assert_eq!(f.script.pending_stops(), 0);
}

#[test]
fn test_step_line_stops_at_breakpoint()
{
    let f = stopped_at(0x10);
    let id = f
        .session
        .create_breakpoint(BreakpointBuilder::address(f.runtime.code + 0x18).build())
        .unwrap();
    f.script.step_to(MAIN, f.runtime.code + 0x14);
    f.script.hit(MAIN, f.runtime.code + 0x18);
    f.script.step_to(MAIN, f.runtime.code + 0x20);

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().step_line(false).unwrap();

    assert_eq!(stop.breakpoints, vec![id]);
    assert_eq!(f.script.pending_stops(), 1);
}

#[test]
fn test_step_line_without_line_information()
{
    let f = stopped_at(0x80);
    f.script.step_to(MAIN, f.runtime.code + 0x84);
    f.script.step_to(MAIN, f.runtime.code + 0x88);

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().step_line(false).unwrap();

    assert_eq!(stop.reason, StopReason::Step);
    let frame = stop.frame.unwrap();
    assert_eq!(frame.pc, addr(f.runtime.code + 0x84));
    assert_eq!(frame.method, None);
    assert_eq!(f.script.resumes().len(), 1);
}

// A single step from `code + 0x10` that lands at Helper's entry with the
// return address `code + 0x15` pushed.
fn queue_call(f: &Fixture)
{
    let sp = f.runtime.stack - 8;
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Step)
            .at(f.runtime.code + 0x100)
            .with_sp(sp)
            .writing(sp, (f.runtime.code + 0x15).to_le_bytes().to_vec()),
    );
}

#[test]
fn test_step_into_call()
{
    let f = stopped_at(0x10);
    queue_call(&f);

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().step_instruction(false).unwrap();

    assert_eq!(stop.frame.unwrap().method_name.as_deref(), Some("Helper"));
    assert_eq!(f.script.resumes(), vec![ResumeMode::SingleStep]);
}

#[test]
fn test_step_over_call()
{
    let f = stopped_at(0x10);
    queue_call(&f);
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Breakpoint(f.runtime.code + 0x15)).with_sp(f.runtime.stack),
    );

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().step_instruction(true).unwrap();

    assert_eq!(stop.reason, StopReason::Step);
    let frame = stop.frame.unwrap();
    assert_eq!(frame.pc, addr(f.runtime.code + 0x15));
    assert_eq!(frame.method_name.as_deref(), Some("Main"));
    assert_eq!(
        f.script.calls(),
        vec![
            Call::Insert(f.runtime.hook),
            Call::Resume(MAIN, ResumeMode::SingleStep),
            Call::Insert(f.runtime.code + 0x15),
            Call::Resume(MAIN, ResumeMode::Continue),
            Call::Remove(f.runtime.code + 0x15),
        ]
    );
}

#[test]
fn test_step_over_recursive_call()
{
    let f = stopped_at(0x10);
    queue_call(&f);
    // A deeper activation returns through the same address first.
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Breakpoint(f.runtime.code + 0x15)).with_sp(f.runtime.stack - 0x40),
    );
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Breakpoint(f.runtime.code + 0x15)).with_sp(f.runtime.stack),
    );

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().step_instruction(true).unwrap();

    assert_eq!(stop.frame.unwrap().sp, f.runtime.stack);
    assert_eq!(
        f.script.resumes(),
        vec![ResumeMode::SingleStep, ResumeMode::Continue, ResumeMode::Continue]
    );
    assert_eq!(f.script.inserted(), vec![f.runtime.hook]);
}

#[test]
fn test_step_over_stops_at_client_breakpoint_inside_call()
{
    let f = stopped_at(0x10);
    let id = f
        .session
        .create_breakpoint(BreakpointBuilder::method("App", "Helper").at_line(31).build())
        .unwrap();
    queue_call(&f);
    f.script.hit(MAIN, f.runtime.code + 0x110);

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().step_line(true).unwrap();

    assert_eq!(stop.breakpoints, vec![id]);
    // The temporary breakpoint at the return address is gone again.
    assert!(!f.script.inserted().contains(&(f.runtime.code + 0x15)));
}

#[test]
fn test_finish_at_method_entry()
{
    let f = stopped_at(0x100);
    f.script.write_u64(f.runtime.stack, f.runtime.code + 0x15);
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Breakpoint(f.runtime.code + 0x15)).with_sp(f.runtime.stack + 8),
    );

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.finish().unwrap();

    assert_eq!(stop.reason, StopReason::Step);
    let frame = stop.frame.unwrap();
    assert_eq!(frame.method_name.as_deref(), Some("Main"));
    assert_eq!(frame.source.map(|s| s.line), Some(11));
    assert_eq!(thread.step_mode(), StepMode::Finish);
}

// Frame record at `stack + 0x40` returning to `code + 0x15` with an
// outer record at `stack + 0x80` that ends the chain.
fn frame_chain(f: &Fixture) -> u64
{
    let fp = f.runtime.stack + 0x40;
    f.script.write_u64(fp, f.runtime.stack + 0x80);
    f.script.write_u64(fp + 8, f.runtime.code + 0x15);
    let mut registers = f.script.registers(MAIN);
    registers.fp = fp;
    f.script.set_registers(MAIN, registers);
    fp
}

#[test]
fn test_finish_through_frame_pointer()
{
    let f = stopped_at(0x108);
    let fp = frame_chain(&f);
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Breakpoint(f.runtime.code + 0x15)).with_sp(fp + 16),
    );

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().finish().unwrap();

    assert_eq!(stop.frame.unwrap().pc, addr(f.runtime.code + 0x15));
    assert!(f.script.calls().contains(&Call::Insert(f.runtime.code + 0x15)));
    assert!(f.script.calls().contains(&Call::Remove(f.runtime.code + 0x15)));
}

#[test]
fn test_finish_counts_client_breakpoint_at_return_address()
{
    let f = stopped_at(0x108);
    let fp = frame_chain(&f);
    let id = f
        .session
        .create_breakpoint(BreakpointBuilder::address(f.runtime.code + 0x15).build())
        .unwrap();
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Breakpoint(f.runtime.code + 0x15)).with_sp(fp + 16),
    );

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().finish().unwrap();

    assert_eq!(stop.reason, StopReason::Breakpoint(f.runtime.code + 0x15));
    assert_eq!(stop.breakpoints, vec![id]);
    assert_eq!(f.session.breakpoints().get(id).unwrap().hit_count, 1);
}

#[test]
fn test_finish_applies_ignore_count_at_return_address()
{
    let f = stopped_at(0x108);
    let fp = frame_chain(&f);
    let id = f
        .session
        .create_breakpoint(BreakpointBuilder::address(f.runtime.code + 0x15).with_hit_count(2).build())
        .unwrap();
    f.script.push(
        ScriptedStop::new(MAIN, StopReason::Breakpoint(f.runtime.code + 0x15)).with_sp(fp + 16),
    );

    let servant = f.session.thread(MAIN).unwrap();
    let stop = servant.lock().unwrap().finish().unwrap();

    // The ignored hit still ends the finish, as a plain step.
    assert_eq!(stop.reason, StopReason::Step);
    assert!(stop.breakpoints.is_empty());
    assert_eq!(stop.frame.unwrap().pc, addr(f.runtime.code + 0x15));
    assert_eq!(f.session.breakpoints().get(id).unwrap().hit_count, 1);
}

#[test]
fn test_finish_without_caller_fails()
{
    let f = stopped_at(0x108);
    let servant = f.session.thread(MAIN).unwrap();
    let result = servant.lock().unwrap().finish();
    match result {
        Err(MantleError::LocationInvalid(_)) => {}
        other => panic!("Expected LocationInvalid, got {other:?}"),
    }
    assert!(f.script.resumes().is_empty());
}

#[test]
fn test_backtrace()
{
    let f = stopped_at(0x108);
    let fp = frame_chain(&f);

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let frames = thread.backtrace(16).unwrap();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].method_name.as_deref(), Some("Helper"));
    assert_eq!(frames[0].source.map(|s| s.line), Some(30));
    assert_eq!(frames[1].index, 1);
    assert_eq!(frames[1].pc, addr(f.runtime.code + 0x15));
    assert_eq!(frames[1].method_name.as_deref(), Some("Main"));
    assert_eq!(frames[1].source.map(|s| s.line), Some(11));
    assert_eq!(frames[1].status, FrameStatus::FramePointer);
    assert_eq!(frames[1].sp, fp + 16);
    assert_eq!(frames[1].fp, f.runtime.stack + 0x80);

    assert_eq!(thread.backtrace(1).unwrap().len(), 1);
}

#[test]
fn test_background_until_address()
{
    let f = stopped_at(0x10);
    f.script.hit(MAIN, f.runtime.code + 0x20);
    let until = addr(f.runtime.code + 0x20);

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.background(Some(until.clone())).unwrap();

    assert_eq!(stop.reason, StopReason::Step);
    assert_eq!(thread.step_mode(), StepMode::Background { until: Some(until) });
    assert_eq!(f.script.inserted(), vec![f.runtime.hook]);
}

#[test]
fn test_process_exit()
{
    let f = stopped_at(0x10);
    f.script.exit(MAIN, 3);
    let events = f.session.subscribe();

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.continue_execution().unwrap();

    assert_eq!(stop.reason, StopReason::Exited(3));
    assert_eq!(stop.frame, None);
    assert_eq!(thread.state(), ThreadState::Exited);
    assert_eq!(f.session.target().exit_status().unwrap(), Some(StopReason::Exited(3)));
    assert!(events
        .try_iter()
        .any(|e| e == DebuggerEvent::TargetExited { reason: StopReason::Exited(3) }));

    assert_invalid_state(thread.continue_execution());
    assert_invalid_state(thread.step_instruction(false));
    assert_invalid_state(thread.step_line(true));
    assert_invalid_state(thread.finish());
    assert_invalid_state(thread.registers());
    assert_invalid_state(thread.current_frame());
    assert_invalid_state(thread.call_method(&addr(f.runtime.code), &[]));
}

#[test]
fn test_thread_exit_keeps_process()
{
    let f = stopped_at(0x10);
    f.script.push(ScriptedStop::new(MAIN, StopReason::Exited(0)));
    let events = f.session.subscribe();

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.continue_execution().unwrap();

    assert_eq!(stop.reason, StopReason::Exited(0));
    assert_eq!(thread.state(), ThreadState::Exited);
    assert_eq!(f.session.target().exit_status().unwrap(), None);
    assert!(events
        .try_iter()
        .any(|e| e == DebuggerEvent::ThreadExited { thread: MAIN }));
}

#[test]
fn test_call_method()
{
    let f = stopped_at(0x10);
    f.script.set_call_result(42);

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let result = thread.call_method(&addr(f.runtime.code + 0x100), &[1, 2]).unwrap();

    assert_eq!(result, 42);
    assert_eq!(
        f.script.calls().last(),
        Some(&Call::CallFunction(f.runtime.code + 0x100, vec![1, 2]))
    );
    assert_eq!(thread.state(), ThreadState::Stopped);
}

#[test]
fn test_stop_interrupts_running_command()
{
    let f = stopped_at(0x10);
    f.script.push(ScriptedStop::new(MAIN, StopReason::Interrupted));

    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    thread.stop().unwrap();
    assert!(f.session.target().interrupt_requested());
    assert!(f.script.calls().contains(&Call::Interrupt));

    let stop = thread.continue_execution().unwrap();
    assert_eq!(stop.reason, StopReason::Interrupted);
    assert!(!f.session.target().interrupt_requested());
}

#[test]
fn test_set_registers_invalidates_frame()
{
    let f = stopped_at(0x10);
    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    assert_eq!(thread.current_frame().unwrap().source.map(|s| s.line), Some(11));

    let mut registers = thread.registers().unwrap();
    registers.pc = f.runtime.code + 0x24;
    thread.set_registers(&registers).unwrap();

    assert_eq!(thread.current_frame().unwrap().source.map(|s| s.line), Some(12));
}

#[test]
fn test_thread_memory_access()
{
    let f = stopped_at(0x10);
    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let at = addr(f.runtime.stack + 0x100);

    thread.write_memory(&at, &[1, 2, 3, 4]).unwrap();
    assert_eq!(thread.read_memory(&at, 4).unwrap().as_bytes(), &[1, 2, 3, 4]);
}

#[test]
fn test_resume_error_leaves_thread_stopped()
{
    let f = stopped_at(0x10);
    let servant = f.session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();

    // Nothing is scripted, so the backend refuses to resume.
    assert!(thread.step_instruction(false).is_err());
    assert_eq!(thread.state(), ThreadState::Stopped);
}

#[test]
fn test_departed_thread_events_are_dropped()
{
    let mut runtime = Runtime::new();
    let main = runtime.main_method();
    runtime.compile(&main);
    let worker = ThreadId(2);
    let (session, script) = runtime.session(&[
        (MAIN, runtime.code + 0x10, runtime.stack),
        (worker, runtime.code + 0x10, runtime.stack + 0x100),
    ]);
    assert!(session.thread(worker).is_ok());

    // The worker stops on its own, then the runtime reports it gone.
    script.raise(worker, StopReason::Signal(10));
    script.notify(MAIN, runtime.hook, 9, 0, 2);
    script.hit(MAIN, runtime.code + 0x20);
    let events = session.subscribe();

    let servant = session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.continue_execution().unwrap();

    assert_eq!(stop.reason, StopReason::Breakpoint(runtime.code + 0x20));
    assert!(events
        .try_iter()
        .any(|e| e == DebuggerEvent::ThreadExited { thread: worker }));
    assert!(session.target().threads_with_pending_events().unwrap().is_empty());
}

#[test]
fn test_exited_thread_mailbox_is_dropped()
{
    let mut runtime = Runtime::new();
    let main = runtime.main_method();
    runtime.compile(&main);
    let worker = ThreadId(2);
    let (session, script) = runtime.session(&[
        (MAIN, runtime.code + 0x10, runtime.stack),
        (worker, runtime.code + 0x10, runtime.stack + 0x100),
    ]);

    // Main exits while the worker is being waited on; a stray event follows.
    script.raise(MAIN, StopReason::Exited(0));
    script.raise(MAIN, StopReason::Signal(10));
    script.hit(worker, runtime.code + 0x20);
    {
        let servant = session.thread(worker).unwrap();
        let mut thread = servant.lock().unwrap();
        thread.continue_execution().unwrap();
    }
    assert_eq!(session.target().threads_with_pending_events().unwrap(), vec![MAIN]);

    let servant = session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();
    let stop = thread.continue_execution().unwrap();

    assert_eq!(stop.reason, StopReason::Exited(0));
    assert_eq!(thread.state(), ThreadState::Exited);
    assert!(session.target().threads_with_pending_events().unwrap().is_empty());
}
