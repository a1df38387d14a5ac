//! Inspecting a frozen runtime through a session

mod common;

use common::{Runtime, BASE, MAIN};
use mantle_core::error::MantleError;
use mantle_core::memory::{MemoryAccessor, ProcessSnapshot};
use mantle_core::session::{RuntimeHooks, Session, SessionConfig};
use mantle_core::thread::{StepMode, ThreadServant, ThreadState};
use mantle_core::types::{Architecture, FrameStatus, Registers};

// Helper running at line 30, called from Main line 11.
fn frozen() -> (Runtime, Session)
{
    let mut runtime = Runtime::new();
    let main = runtime.main_method();
    runtime.compile(&main);
    let helper = runtime.helper_method();
    runtime.compile(&helper);

    let fp = runtime.stack + 0x40;
    runtime.image.put_u64(fp, runtime.stack + 0x80);
    runtime.image.put_u64(fp + 8, runtime.code + 0x15);

    let mut registers = Registers::for_arch(Architecture::X86_64);
    registers.pc = runtime.code + 0x108;
    registers.sp = runtime.stack;
    registers.fp = fp;

    let snapshot = ProcessSnapshot::new(Architecture::X86_64)
        .with_region(BASE, runtime.image.bytes().to_vec(), "rwxp")
        .with_thread(MAIN, registers);
    let session = Session::open_snapshot(snapshot, SessionConfig::default()).unwrap();
    session
        .initialize_runtime(&RuntimeHooks {
            notification_address: runtime.hook,
            symbol_table: Some(runtime.header),
        })
        .unwrap();
    (runtime, session)
}

fn assert_read_only<T: std::fmt::Debug>(result: Result<T, MantleError>)
{
    match result {
        Err(MantleError::ReadOnly { .. }) => {}
        other => panic!("Expected ReadOnly, got {other:?}"),
    }
}

#[test]
fn test_snapshot_symbols_are_read()
{
    let (runtime, session) = frozen();
    let info = session.target().memory_info();
    let store = session.symbols().lock().unwrap();

    let module = store.find_module("App").unwrap();
    assert_eq!(store.module(module).unwrap().name(), "/opt/app/App.exe");
    let helper = store.lookup_method(&info.address(runtime.code + 0x104)).unwrap();
    assert_eq!(helper.name(), "Helper");
    assert_eq!(helper.start(), &info.address(runtime.code + 0x100));
    assert_eq!(store.data_table(1).unwrap().domain(), 1);
}

#[test]
fn test_snapshot_thread_frames()
{
    let (runtime, session) = frozen();
    assert_eq!(session.threads().unwrap(), vec![MAIN]);
    let servant = session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();

    assert_eq!(thread.state(), ThreadState::Stopped);
    assert_eq!(thread.step_mode(), StepMode::Run);
    assert_eq!(thread.registers().unwrap().pc, runtime.code + 0x108);

    let frame = thread.current_frame().unwrap();
    assert_eq!(frame.method_name.as_deref(), Some("Helper"));
    assert_eq!(frame.source.map(|s| s.line), Some(30));

    let frames = thread.backtrace(8).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].method_name.as_deref(), Some("Main"));
    assert_eq!(frames[1].source.map(|s| s.line), Some(11));
    assert_eq!(frames[1].status, FrameStatus::FramePointer);
}

#[test]
fn test_snapshot_thread_cannot_run()
{
    let (runtime, session) = frozen();
    let info = session.target().memory_info();
    let servant = session.thread(MAIN).unwrap();
    let mut thread = servant.lock().unwrap();

    assert_read_only(thread.continue_execution());
    assert_read_only(thread.step_instruction(false));
    assert_read_only(thread.step_line(true));
    assert_read_only(thread.finish());
    assert_read_only(thread.background(None));
    assert_read_only(thread.call_method(&info.address(runtime.code), &[]));
    assert_read_only(thread.write_memory(&info.address(runtime.stack), &[0]));
    let registers = thread.registers().unwrap();
    assert_read_only(thread.set_registers(&registers));

    thread.stop().unwrap();
    assert_eq!(thread.state(), ThreadState::Stopped);
}

#[test]
fn test_snapshot_memory_reads()
{
    let (runtime, session) = frozen();
    let info = session.target().memory_info();
    let servant = session.thread(MAIN).unwrap();
    let thread = servant.lock().unwrap();

    let blob = thread.read_memory(&info.address(runtime.stack + 0x48), 8).unwrap();
    assert_eq!(blob.as_bytes(), &(runtime.code + 0x15).to_le_bytes());
    let pointer = session
        .target()
        .read_address(&info.address(runtime.stack + 0x40))
        .unwrap();
    assert_eq!(pointer.value(), runtime.stack + 0x80);
    assert!(!session.target().can_write());
}

#[test]
fn test_snapshot_refresh_and_detach()
{
    let (_, session) = frozen();
    assert!(session.refresh().unwrap().is_empty());
    session.detach().unwrap();
}

#[test]
fn test_snapshot_cannot_be_killed()
{
    let (_, session) = frozen();
    assert_read_only(session.kill());
}
