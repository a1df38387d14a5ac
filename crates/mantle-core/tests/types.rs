//! Tests for platform-agnostic types

use std::cmp::Ordering;

use mantle_core::error::MantleError;
use mantle_core::types::{
    AddressDomain, Architecture, MemoryRegion, ModuleHandle, ProcessId, RegisterId, Registers, SourceAddress,
    StopReason, TargetAddress, ThreadId, X86_64Register,
};

#[test]
fn test_process_id_round_trip()
{
    let pid = ProcessId::from(54321);
    let value: u32 = pid.into();
    assert_eq!(value, 54321);
    assert_eq!(pid.to_string(), "54321");
}

#[test]
fn test_thread_id_ordering()
{
    let mut threads = vec![ThreadId::from(30), ThreadId::from(10), ThreadId::from(20)];
    threads.sort();
    assert_eq!(threads, vec![ThreadId(10), ThreadId(20), ThreadId(30)]);
}

#[test]
fn test_address_arithmetic_keeps_domain()
{
    let domain = AddressDomain::fresh("frame");
    let base = TargetAddress::new(domain.clone(), 0x1000);
    let moved = &base + 0x20;
    assert_eq!(moved.domain(), &domain);
    assert_eq!(moved.offset(), 0x1020);
    assert_eq!((moved - 0x20).offset(), 0x1000);
}

#[test]
fn test_address_compare_within_domain()
{
    let a = TargetAddress::global(0x1000);
    let b = TargetAddress::global(0x1008);
    assert_eq!(a.checked_compare(&b).unwrap(), Ordering::Less);
    assert_eq!(b.checked_sub(&a).unwrap(), 8);
    assert!(TargetAddress::global(0x1004).is_within(&a, &b).unwrap());
    assert!(!b.is_within(&a, &b).unwrap());
}

#[test]
fn test_address_compare_across_domains_fails()
{
    let live = TargetAddress::global(0x1000);
    let snapshot = TargetAddress::new(AddressDomain::fresh("snapshot"), 0x1000);

    assert_ne!(live, snapshot);
    match live.checked_compare(&snapshot) {
        Err(MantleError::DomainMismatch { .. }) => {}
        other => panic!("Expected DomainMismatch, got {other:?}"),
    }
    assert!(live.checked_sub(&snapshot).is_err());
    assert!(snapshot.is_within(&live, &(&live + 0x10)).is_err());
}

#[test]
fn test_fresh_domains_are_distinct()
{
    let first = AddressDomain::fresh("snapshot");
    let second = AddressDomain::fresh("snapshot");
    assert_ne!(first, second);
    assert!(!first.is_global());
    assert!(AddressDomain::GLOBAL.is_global());
    assert!(!AddressDomain::new("global", 3).is_global());
}

#[test]
fn test_null_address()
{
    assert!(TargetAddress::NULL.is_null());
    assert!(TargetAddress::global(0).is_null());
    assert!(!TargetAddress::global(1).is_null());
    assert_eq!(TargetAddress::NULL.to_string(), "null");
}

#[test]
fn test_address_display()
{
    assert_eq!(TargetAddress::global(0x1234).to_string(), "0x0000000000001234");
    let frame = TargetAddress::new(AddressDomain::new("frame", 9), 0x10);
    assert_eq!(frame.to_string(), "frame#9:0x0000000000000010");
}

#[test]
fn test_in_domain_retags()
{
    let domain = AddressDomain::new("regs", 4);
    let address = TargetAddress::global(0x40).in_domain(&domain);
    assert_eq!(address.domain(), &domain);
    assert_eq!(address.value(), 0x40);
}

#[test]
fn test_registers_for_x86_64()
{
    let mut regs = Registers::for_arch(Architecture::X86_64);
    assert_eq!(regs.general.len(), 14);
    regs.set_argument(0, 1);
    regs.set_argument(1, 2);
    regs.set_argument(2, 3);
    assert_eq!(regs.get(RegisterId::X86_64(X86_64Register::Rdi)), Some(1));
    assert_eq!(regs.get(RegisterId::X86_64(X86_64Register::Rsi)), Some(2));
    assert_eq!(regs.get(RegisterId::X86_64(X86_64Register::Rdx)), Some(3));
    assert_eq!(regs.argument(6), None);
    assert_eq!(regs.link_register(), None);
}

#[test]
fn test_registers_for_arm64()
{
    let mut regs = Registers::for_arch(Architecture::Arm64);
    assert_eq!(regs.general.len(), 31);
    regs.set_argument(3, 0xdead);
    assert_eq!(regs.argument(3), Some(0xdead));
    assert!(regs.get(RegisterId::X86_64(X86_64Register::Rax)).is_none());
}

#[test]
fn test_registers_default_is_empty()
{
    let regs = Registers::default();
    assert_eq!(regs.pc, 0);
    assert_eq!(regs.sp, 0);
    assert_eq!(regs.general.len(), 0);
    assert_eq!(regs.argument(0), None);
    assert_eq!(regs.return_value(), None);
}

#[test]
fn test_memory_region_queries()
{
    let region = MemoryRegion::new(0x1000, 0x3000, "rw-p", Some("[heap]".to_string()));
    assert_eq!(region.size(), 0x2000);
    assert!(region.is_readable());
    assert!(region.is_writable());
    assert!(!region.is_executable());
    assert!(region.contains(0x1000));
    assert!(!region.contains(0x3000));
}

#[test]
fn test_stop_reason_terminal()
{
    assert!(StopReason::Exited(0).is_terminal());
    assert!(StopReason::Killed(9).is_terminal());
    assert!(!StopReason::Step.is_terminal());
    assert!(!StopReason::Breakpoint(0x1000).is_terminal());
    assert!(!StopReason::Interrupted.is_terminal());
}

#[test]
fn test_source_address_line_bounds()
{
    let source = SourceAddress {
        line: 12,
        offset: 4,
        range: 10,
    };
    assert_eq!(source.line_start(0x1004), 0x1000);
    assert_eq!(source.line_end(0x1004), 0x100a);
    assert_eq!(source.to_string(), "line 12+0x4");
}

#[test]
fn test_module_handle_generations_differ()
{
    let first = ModuleHandle::new(2, 1);
    let reload = ModuleHandle::new(2, 5);
    assert_eq!(first.index(), reload.index());
    assert_ne!(first, reload);
    assert_eq!(first.to_string(), "module 2@1");
}
