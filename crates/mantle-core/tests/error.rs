//! Tests for error handling

use mantle_core::error::{MantleError, MantleResult};

#[test]
fn test_memory_access_display()
{
    let error = MantleError::memory(0x1000, 8, "unmapped");
    assert_eq!(format!("{error}"), "Cannot access 8 bytes at 0x1000: unmapped");
}

#[test]
fn test_process_not_found_display()
{
    let error = MantleError::ProcessNotFound(12345);
    let message = format!("{}", error);
    assert_eq!(message, "Process not found: PID 12345");
}

#[test]
fn test_permission_denied_display()
{
    let error = MantleError::PermissionDenied("ptrace_scope".to_string());
    assert_eq!(format!("{error}"), "Permission denied: ptrace_scope");
}

#[test]
fn test_invalid_state_display()
{
    let error = MantleError::InvalidState {
        expected: "stopped",
        actual: "running".to_string(),
    };
    assert_eq!(format!("{error}"), "Invalid state: expected stopped, thread is running");
}

#[test]
fn test_breakpoint_id_not_found_display()
{
    let error = MantleError::BreakpointIdNotFound(7);
    assert_eq!(format!("{error}"), "No breakpoint with id 7");
}

#[test]
fn test_only_internal_errors_are_fatal()
{
    assert!(MantleError::Internal("broken".to_string()).is_fatal());
    assert!(MantleError::invariant("broken").is_fatal());
    assert!(!MantleError::memory(0, 1, "null pointer").is_fatal());
    assert!(!MantleError::DebugInfoMalformed("bad magic".to_string()).is_fatal());
    assert!(!MantleError::NotAttached.is_fatal());
}

#[test]
fn test_recoverable_errors()
{
    assert!(MantleError::memory(0x10, 4, "unmapped").is_recoverable());
    assert!(MantleError::LocationInvalid("module 3 is not loaded".to_string()).is_recoverable());
    assert!(MantleError::DebugInfoMalformed("bad magic".to_string()).is_recoverable());
    assert!(MantleError::Decode("short".to_string()).is_recoverable());

    assert!(!MantleError::InvalidArgument("x".to_string()).is_recoverable());
    assert!(!MantleError::ReadOnly { address: 0 }.is_recoverable());
    assert!(!MantleError::Internal("x".to_string()).is_recoverable());
}

#[test]
fn test_read_only_classification()
{
    let error = MantleError::ReadOnly { address: 0x2000 };
    assert!(error.is_read_only());
    assert!(format!("{error}").contains("0x2000"));
    assert!(!MantleError::NotAttached.is_read_only());
}

#[test]
fn test_io_error_conversion()
{
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "core missing");
    let error: MantleError = io.into();
    match error {
        MantleError::Io(_) => {}
        other => panic!("Expected Io variant, got {other:?}"),
    }
}

#[test]
fn test_poisoned_lock_is_fatal()
{
    let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
    let clone = std::sync::Arc::clone(&lock);
    let _ = std::thread::spawn(move || {
        let _guard = clone.lock().unwrap();
        panic!("poison");
    })
    .join();

    let error: MantleError = lock.lock().unwrap_err().into();
    assert!(error.is_fatal());
}

#[test]
fn test_result_type_alias()
{
    fn returns_ok() -> MantleResult<u32>
    {
        Ok(42)
    }

    fn returns_err() -> MantleResult<u32>
    {
        Err(MantleError::NotAttached)
    }

    assert_eq!(returns_ok().unwrap(), 42);
    assert!(returns_err().is_err());
}
