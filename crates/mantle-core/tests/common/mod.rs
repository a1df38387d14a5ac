//! Shared fixtures for integration tests
//!
//! - [`Image`]: a little-endian memory image (64-bit unless built with
//!   [`Image::with_pointer_size`]) with helpers that lay out the runtime's
//!   debug structures (symbol table, modules, methods, data tables)
//! - [`ScriptedProcess`]: a [`ProcessControl`] backend whose stops are queued
//!   up front by the test through a [`Script`] handle
//! - [`Runtime`]: an image in which the runtime has published one module, a
//!   data table and the notification function, ready to open a session on

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mantle_core::error::{MantleError, MantleResult};
use mantle_core::memory::{MemoryAccessor, TargetMemoryInfo};
use mantle_core::session::{RuntimeHooks, Session, SessionConfig};
use mantle_core::symbols::abi::{
    chunk_header_size, MethodDescriptor, SymbolTableHeader, RECORD_KIND_METHOD, RECORD_KIND_TYPE, SYMBOL_TABLE_MAGIC,
};
use mantle_core::target::{BackendBreakpointId, ProcessControl, ResumeMode, TargetEvent};
use mantle_core::types::{Architecture, MemoryRegion, ProcessId, Registers, StopReason, TargetAddress, ThreadId};

/// Start of every test image.
pub const BASE: u64 = 0x10_0000;
/// Size of every test image.
pub const IMAGE_SIZE: usize = 0x2_0000;
/// Default pointer width of test images.
pub const P: usize = 8;

/// Main thread of scripted processes.
pub const MAIN: ThreadId = ThreadId(1);

/// Little-endian memory image with a bump allocator.
#[derive(Debug, Clone)]
pub struct Image
{
    bytes: Vec<u8>,
    next: usize,
    pointer: usize,
}

impl Default for Image
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Image
{
    pub fn new() -> Self
    {
        Self::with_pointer_size(P)
    }

    /// Image of a target with `pointer`-byte pointers.
    pub fn with_pointer_size(pointer: usize) -> Self
    {
        assert!(pointer == 4 || pointer == 8, "unsupported pointer width {pointer}");
        Self {
            bytes: vec![0; IMAGE_SIZE],
            // Keep offset 0 unused so no structure lives at BASE.
            next: 0x100,
            pointer,
        }
    }

    pub const fn pointer_size(&self) -> usize
    {
        self.pointer
    }

    pub fn info(&self) -> TargetMemoryInfo
    {
        TargetMemoryInfo::little_endian(self.pointer as u8)
    }

    /// Reserve `size` zeroed, 16-byte aligned bytes.
    pub fn alloc(&mut self, size: usize) -> u64
    {
        let at = self.next;
        self.next = (at + size + 15) & !15;
        assert!(self.next <= IMAGE_SIZE, "test image full");
        BASE + at as u64
    }

    fn offset(&self, address: u64) -> usize
    {
        (address - BASE) as usize
    }

    pub fn put_bytes(&mut self, address: u64, data: &[u8])
    {
        let at = self.offset(address);
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }

    pub fn put_u32(&mut self, address: u64, value: u32)
    {
        self.put_bytes(address, &value.to_le_bytes());
    }

    pub fn put_i32(&mut self, address: u64, value: i32)
    {
        self.put_bytes(address, &value.to_le_bytes());
    }

    pub fn put_u64(&mut self, address: u64, value: u64)
    {
        self.put_bytes(address, &value.to_le_bytes());
    }

    /// Store a target pointer.
    pub fn put_ptr(&mut self, address: u64, value: u64)
    {
        if self.pointer == 4 {
            self.put_u32(address, u32::try_from(value).expect("pointer fits in 32 bits"));
        } else {
            self.put_u64(address, value);
        }
    }

    pub fn u32_at(&self, address: u64) -> u32
    {
        let at = self.offset(address);
        u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap())
    }

    /// Store a NUL-terminated string and return its address.
    pub fn cstring(&mut self, text: &str) -> u64
    {
        let address = self.alloc(text.len() + 1);
        self.put_bytes(address, text.as_bytes());
        address
    }

    /// `{next, payload}` list over `payloads`, returning the head.
    pub fn pointer_list(&mut self, payloads: &[u64]) -> u64
    {
        let p = self.pointer;
        let mut head = 0;
        for payload in payloads.iter().rev() {
            let node = self.alloc(2 * p);
            self.put_ptr(node, head);
            self.put_ptr(node + p as u64, *payload);
            head = node;
        }
        head
    }

    /// Module descriptor declaring `methods` as `(token, name)`.
    pub fn module(&mut self, index: i32, name: &str, image: u64, methods: &[(u32, &str)]) -> u64
    {
        let p = self.pointer as u64;
        let name = self.cstring(name);
        let table = if methods.is_empty() {
            0
        } else {
            let entry_size = 8 + p;
            let table = self.alloc(methods.len() * entry_size as usize);
            for (slot, (token, method)) in methods.iter().enumerate() {
                let method = self.cstring(method);
                let entry = table + slot as u64 * entry_size;
                self.put_u32(entry, *token);
                self.put_u32(entry + 4, 0);
                self.put_ptr(entry + 8, method);
            }
            table
        };
        let descriptor = self.alloc(8 + 4 * p as usize);
        self.put_i32(descriptor, index);
        self.put_u32(descriptor + 4, 0);
        self.put_ptr(descriptor + 8, image);
        self.put_ptr(descriptor + 8 + p, name);
        self.put_ptr(descriptor + 8 + 2 * p, table);
        self.put_i32(descriptor + 8 + 3 * p, methods.len() as i32);
        descriptor
    }

    /// Offset of `method_count` in a module descriptor.
    pub fn method_count_offset(&self) -> u64
    {
        8 + 3 * self.pointer as u64
    }

    /// Compiled-method descriptor with `rows` as `(line, offset)`.
    pub fn method(&mut self, spec: &MethodSpec) -> u64
    {
        let p = self.pointer as u64;
        let header = MethodDescriptor::header_size(&self.info());
        let size = header + 8 * spec.rows.len();
        let name = spec.name.map_or(0, |name| self.cstring(name));
        let descriptor = self.alloc(size);
        self.put_u32(descriptor, size as u32);
        self.put_i32(descriptor + 4, spec.module);
        self.put_u32(descriptor + 8, spec.token);
        self.put_u32(descriptor + 12, 0);
        self.put_ptr(descriptor + 16, spec.start);
        self.put_ptr(descriptor + 16 + p, spec.end);
        self.put_ptr(descriptor + 16 + 2 * p, spec.body_start);
        self.put_ptr(descriptor + 16 + 3 * p, 0);
        self.put_ptr(descriptor + 16 + 4 * p, name);
        self.put_i32(descriptor + self.line_count_offset(), spec.rows.len() as i32);
        for (n, (line, offset)) in spec.rows.iter().enumerate() {
            let row = descriptor + (header + 8 * n) as u64;
            self.put_u32(row, *line);
            self.put_u32(row + 4, *offset);
        }
        descriptor
    }

    /// Offset of `line_count` in a method descriptor.
    pub fn line_count_offset(&self) -> u64
    {
        16 + 5 * self.pointer as u64
    }

    /// Data table of `domain` with one empty chunk of `capacity` bytes.
    pub fn data_table(&mut self, domain: i32, capacity: u32) -> DataTable
    {
        let chunk = self.chunk(capacity);
        let descriptor = self.alloc(8 + self.pointer);
        self.put_i32(descriptor, domain);
        self.put_ptr(descriptor + 8, chunk);
        DataTable {
            descriptor,
            chunk,
            write: 0,
        }
    }

    fn chunk(&mut self, capacity: u32) -> u64
    {
        let header = chunk_header_size(&self.info());
        let chunk = self.alloc(header + capacity as usize);
        self.put_u32(chunk, (header as u32) + capacity);
        self.put_u32(chunk + 4, capacity);
        self.put_u32(chunk + 8, 0);
        chunk
    }

    fn pointer_bytes(&self, value: u64) -> Vec<u8>
    {
        value.to_le_bytes()[..self.pointer].to_vec()
    }

    /// Append a method-compiled record and publish it.
    pub fn append_method_record(&mut self, table: &mut DataTable, module: i32, descriptor: u64)
    {
        let size = 12 + self.pointer as u32;
        let mut record = Vec::new();
        record.extend_from_slice(&size.to_le_bytes());
        record.extend_from_slice(&RECORD_KIND_METHOD.to_le_bytes());
        record.extend_from_slice(&module.to_le_bytes());
        record.extend_from_slice(&self.pointer_bytes(descriptor));
        self.append_record(table, &record);
    }

    /// Append a type-initialised record and publish it.
    pub fn append_type_record(&mut self, table: &mut DataTable, module: i32, token: u32, class: u64, name: u64)
    {
        let size = 16 + 2 * self.pointer as u32;
        let mut record = Vec::new();
        record.extend_from_slice(&size.to_le_bytes());
        record.extend_from_slice(&RECORD_KIND_TYPE.to_le_bytes());
        record.extend_from_slice(&module.to_le_bytes());
        record.extend_from_slice(&token.to_le_bytes());
        record.extend_from_slice(&self.pointer_bytes(class));
        record.extend_from_slice(&self.pointer_bytes(name));
        self.append_record(table, &record);
    }

    /// Append raw record bytes and advance `consumed` past them.
    pub fn append_record(&mut self, table: &mut DataTable, record: &[u8])
    {
        let data = table.chunk + chunk_header_size(&self.info()) as u64;
        self.put_bytes(data + u64::from(table.write), record);
        table.write += record.len() as u32;
        self.put_u32(table.chunk + 8, table.write);
    }

    /// Close the current chunk and continue in a fresh one.
    pub fn next_chunk(&mut self, table: &mut DataTable, capacity: u32)
    {
        // A full chunk: allocated shrinks to what was written.
        self.put_u32(table.chunk + 4, table.write);
        let next = self.chunk(capacity);
        self.put_ptr(table.chunk + 16, next);
        table.chunk = next;
        table.write = 0;
    }

    /// Symbol-table header.
    pub fn symbol_table(&mut self, corlib: u64, data_tables: &[u64], modules: &[u64]) -> u64
    {
        let p = self.pointer as u64;
        let size = SymbolTableHeader::size(&self.info());
        let tables = self.pointer_list(data_tables);
        let modules = self.pointer_list(modules);
        let header = self.alloc(size);
        self.put_u64(header, SYMBOL_TABLE_MAGIC);
        self.put_u32(header + 8, 2);
        self.put_u32(header + 12, size as u32);
        self.put_ptr(header + 16, corlib);
        self.put_ptr(header + 16 + p, tables);
        self.put_ptr(header + 16 + 2 * p, 0);
        self.put_ptr(header + 16 + 3 * p, modules);
        header
    }

    /// Point the header's type table at `descriptor`.
    pub fn set_type_table(&mut self, header: u64, descriptor: u64)
    {
        let at = header + 16 + 2 * self.pointer as u64;
        self.put_ptr(at, descriptor);
    }

    /// Entry-method descriptor whose class points at `image`.
    pub fn entry_method(&mut self, token: u32, image: u64) -> u64
    {
        let class = self.alloc(self.pointer);
        self.put_ptr(class, image);
        let entry = self.alloc(8 + self.pointer);
        self.put_u32(entry + 4, token);
        self.put_ptr(entry + 8, class);
        entry
    }

    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }
}

/// Layout of a compiled method for [`Image::method`].
#[derive(Debug, Clone)]
pub struct MethodSpec
{
    pub module: i32,
    pub token: u32,
    pub name: Option<&'static str>,
    pub start: u64,
    pub end: u64,
    pub body_start: u64,
    pub rows: Vec<(u32, u32)>,
}

/// Writer position in a data table built by [`Image::data_table`].
#[derive(Debug, Clone, Copy)]
pub struct DataTable
{
    pub descriptor: u64,
    pub chunk: u64,
    pub write: u32,
}

/// Backend calls recorded by [`ScriptedProcess`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call
{
    Resume(ThreadId, ResumeMode),
    Insert(u64),
    Remove(u64),
    Interrupt,
    CallFunction(u64, Vec<u64>),
    Detach,
    Kill,
}

/// One stop the backend will report on the next resume.
#[derive(Debug, Clone)]
pub struct ScriptedStop
{
    pub thread: ThreadId,
    pub reason: StopReason,
    pub pc: Option<u64>,
    pub sp: Option<u64>,
    pub arguments: Vec<u64>,
    pub memory: Vec<(u64, Vec<u8>)>,
    pub process_exit: bool,
}

impl ScriptedStop
{
    pub fn new(thread: ThreadId, reason: StopReason) -> Self
    {
        let pc = match reason {
            StopReason::Breakpoint(address) => Some(address),
            _ => None,
        };
        Self {
            thread,
            reason,
            pc,
            sp: None,
            arguments: Vec::new(),
            memory: Vec::new(),
            process_exit: false,
        }
    }

    pub fn at(mut self, pc: u64) -> Self
    {
        self.pc = Some(pc);
        self
    }

    pub fn with_sp(mut self, sp: u64) -> Self
    {
        self.sp = Some(sp);
        self
    }

    pub fn with_arguments(mut self, arguments: &[u64]) -> Self
    {
        self.arguments = arguments.to_vec();
        self
    }

    /// Write memory as the stop is delivered (the runtime running on).
    pub fn writing(mut self, address: u64, data: Vec<u8>) -> Self
    {
        self.memory.push((address, data));
        self
    }
}

#[derive(Debug)]
struct ScriptState
{
    memory: Vec<u8>,
    registers: BTreeMap<ThreadId, Registers>,
    stops: VecDeque<ScriptedStop>,
    events: VecDeque<TargetEvent>,
    breakpoints: BTreeMap<u64, u64>,
    next_breakpoint: u64,
    calls: Vec<Call>,
    call_result: u64,
    exited: bool,
}

/// Test-side handle to a [`ScriptedProcess`].
#[derive(Debug, Clone)]
pub struct Script(Arc<Mutex<ScriptState>>);

impl Script
{
    fn state(&self) -> MutexGuard<'_, ScriptState>
    {
        self.0.lock().unwrap()
    }

    /// Queue a stop.
    pub fn push(&self, stop: ScriptedStop)
    {
        self.state().stops.push_back(stop);
    }

    /// Queue a completed single step landing at `pc`.
    pub fn step_to(&self, thread: ThreadId, pc: u64)
    {
        self.push(ScriptedStop::new(thread, StopReason::Step).at(pc));
    }

    /// Queue a breakpoint hit at `address`.
    pub fn hit(&self, thread: ThreadId, address: u64)
    {
        self.push(ScriptedStop::new(thread, StopReason::Breakpoint(address)));
    }

    /// Queue a call of the runtime's notification function at `hook`.
    pub fn notify(&self, thread: ThreadId, hook: u64, kind: u64, data: u64, arg: u64)
    {
        self.push(ScriptedStop::new(thread, StopReason::Breakpoint(hook)).with_arguments(&[kind, data, arg]));
    }

    /// Report an event for `thread` without any resume, as a thread
    /// running on its own would.
    pub fn raise(&self, thread: ThreadId, reason: StopReason)
    {
        self.state().events.push_back(TargetEvent::new(thread, reason));
    }

    /// Queue the exit of the whole process.
    pub fn exit(&self, thread: ThreadId, code: i32)
    {
        let mut stop = ScriptedStop::new(thread, StopReason::Exited(code));
        stop.process_exit = true;
        self.push(stop);
    }

    pub fn pending_stops(&self) -> usize
    {
        self.state().stops.len()
    }

    pub fn set_registers(&self, thread: ThreadId, registers: Registers)
    {
        self.state().registers.insert(thread, registers);
    }

    pub fn registers(&self, thread: ThreadId) -> Registers
    {
        self.state().registers[&thread].clone()
    }

    pub fn set_call_result(&self, value: u64)
    {
        self.state().call_result = value;
    }

    pub fn write(&self, address: u64, data: &[u8])
    {
        let mut state = self.state();
        let at = (address - BASE) as usize;
        state.memory[at..at + data.len()].copy_from_slice(data);
    }

    pub fn write_u64(&self, address: u64, value: u64)
    {
        self.write(address, &value.to_le_bytes());
    }

    /// Replace the whole memory with `image`, as if the runtime had run on.
    pub fn load(&self, image: &Image)
    {
        self.state().memory.copy_from_slice(image.bytes());
    }

    /// Addresses with an inserted breakpoint, one entry per insertion.
    pub fn inserted(&self) -> Vec<u64>
    {
        self.state().breakpoints.values().copied().collect()
    }

    pub fn calls(&self) -> Vec<Call>
    {
        self.state().calls.clone()
    }

    pub fn resumes(&self) -> Vec<ResumeMode>
    {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Resume(_, mode) => Some(*mode),
                _ => None,
            })
            .collect()
    }
}

/// Live-process stand-in driven by a [`Script`].
#[derive(Debug)]
pub struct ScriptedProcess
{
    script: Script,
    info: TargetMemoryInfo,
}

impl ScriptedProcess
{
    /// Process over `image` with the threads in `threads`, each stopped at
    /// `pc` with a stack at `sp`.
    pub fn new(image: &Image, threads: &[(ThreadId, u64, u64)]) -> (Self, Script)
    {
        let registers = threads
            .iter()
            .map(|(thread, pc, sp)| {
                let mut regs = Registers::for_arch(Architecture::X86_64);
                regs.pc = *pc;
                regs.sp = *sp;
                (*thread, regs)
            })
            .collect();
        let script = Script(Arc::new(Mutex::new(ScriptState {
            memory: image.bytes().to_vec(),
            registers,
            stops: VecDeque::new(),
            events: VecDeque::new(),
            breakpoints: BTreeMap::new(),
            next_breakpoint: 1,
            calls: Vec::new(),
            call_result: 0,
            exited: false,
        })));
        (
            Self {
                script: script.clone(),
                info: image.info(),
            },
            script,
        )
    }
}

impl MemoryAccessor for ScriptedProcess
{
    fn memory_info(&self) -> TargetMemoryInfo
    {
        self.info.clone()
    }

    fn read_buffer(&self, address: &TargetAddress, size: usize) -> MantleResult<Vec<u8>>
    {
        let state = self.script.state();
        let start = address.value();
        if start < BASE || start - BASE + size as u64 > IMAGE_SIZE as u64 {
            return Err(MantleError::memory(start, size, "outside test image"));
        }
        let at = (start - BASE) as usize;
        Ok(state.memory[at..at + size].to_vec())
    }

    fn write_buffer(&mut self, address: &TargetAddress, data: &[u8]) -> MantleResult<()>
    {
        let start = address.value();
        if start < BASE || start - BASE + data.len() as u64 > IMAGE_SIZE as u64 {
            return Err(MantleError::memory(start, data.len(), "outside test image"));
        }
        self.script.write(start, data);
        Ok(())
    }

    fn can_write(&self) -> bool
    {
        true
    }

    fn read_registers(&self, thread: ThreadId) -> MantleResult<Registers>
    {
        self.script
            .state()
            .registers
            .get(&thread)
            .cloned()
            .ok_or_else(|| MantleError::InvalidArgument(format!("no thread {thread}")))
    }

    fn write_registers(&mut self, thread: ThreadId, registers: &Registers) -> MantleResult<()>
    {
        self.script.state().registers.insert(thread, registers.clone());
        Ok(())
    }

    fn memory_maps(&self) -> MantleResult<Vec<MemoryRegion>>
    {
        Ok(vec![MemoryRegion::new(BASE, BASE + IMAGE_SIZE as u64, "rwxp", None)])
    }
}

impl ProcessControl for ScriptedProcess
{
    fn process_id(&self) -> Option<ProcessId>
    {
        Some(ProcessId::from(4242))
    }

    fn architecture(&self) -> Architecture
    {
        Architecture::X86_64
    }

    fn threads(&self) -> MantleResult<Vec<ThreadId>>
    {
        Ok(self.script.state().registers.keys().copied().collect())
    }

    fn resume(&mut self, thread: ThreadId, mode: ResumeMode) -> MantleResult<()>
    {
        let mut state = self.script.state();
        state.calls.push(Call::Resume(thread, mode));
        let stop = state
            .stops
            .pop_front()
            .ok_or_else(|| MantleError::InvalidArgument(format!("script exhausted resuming {thread}")))?;
        for (address, data) in &stop.memory {
            let at = (address - BASE) as usize;
            state.memory[at..at + data.len()].copy_from_slice(data);
        }
        if let Some(regs) = state.registers.get_mut(&stop.thread) {
            if let Some(pc) = stop.pc {
                regs.pc = pc;
            }
            if let Some(sp) = stop.sp {
                regs.sp = sp;
            }
            for (n, value) in stop.arguments.iter().enumerate() {
                regs.set_argument(n, *value);
            }
        }
        let event = if stop.process_exit {
            state.exited = true;
            TargetEvent::process_exit(stop.thread, stop.reason)
        } else {
            TargetEvent::new(stop.thread, stop.reason)
        };
        state.events.push_back(event);
        Ok(())
    }

    fn poll_event(&mut self, _timeout: Duration) -> MantleResult<Option<TargetEvent>>
    {
        Ok(self.script.state().events.pop_front())
    }

    fn interrupt(&mut self) -> MantleResult<()>
    {
        self.script.state().calls.push(Call::Interrupt);
        Ok(())
    }

    fn insert_breakpoint(&mut self, address: &TargetAddress) -> MantleResult<BackendBreakpointId>
    {
        self.check_address(address, 1)?;
        let mut state = self.script.state();
        let id = state.next_breakpoint;
        state.next_breakpoint += 1;
        state.breakpoints.insert(id, address.value());
        state.calls.push(Call::Insert(address.value()));
        Ok(BackendBreakpointId::from_raw(id))
    }

    fn remove_breakpoint(&mut self, id: BackendBreakpointId) -> MantleResult<()>
    {
        let mut state = self.script.state();
        let address = state
            .breakpoints
            .remove(&id.raw())
            .ok_or(MantleError::BreakpointIdNotFound(id.raw()))?;
        state.calls.push(Call::Remove(address));
        Ok(())
    }

    fn call_function(&mut self, _thread: ThreadId, function: &TargetAddress, args: &[u64]) -> MantleResult<u64>
    {
        let mut state = self.script.state();
        state.calls.push(Call::CallFunction(function.value(), args.to_vec()));
        Ok(state.call_result)
    }

    fn detach(&mut self) -> MantleResult<()>
    {
        self.script.state().calls.push(Call::Detach);
        Ok(())
    }

    fn kill(&mut self) -> MantleResult<()>
    {
        let mut state = self.script.state();
        state.calls.push(Call::Kill);
        state.exited = true;
        Ok(())
    }
}

/// Global-domain address.
pub fn addr(value: u64) -> TargetAddress
{
    TargetAddress::global(value)
}

pub const MAIN_TOKEN: u32 = 0x0600_0001;
pub const HELPER_TOKEN: u32 = 0x0600_0002;

/// Image of a runtime that has published module 1 ("/opt/app/App.exe",
/// declaring `Main` and `Helper`), one data table for domain 1 and its
/// notification function.
///
/// Code lives at `code`: `Main` at `[code, code + 0x40)` with lines 10, 11
/// and 12 at offsets 0, 0x10 and 0x20 and its body at `code + 8`; `Helper`
/// at `[code + 0x100, code + 0x140)` with lines 30 and 31 at 0 and 0x10.
/// `stack` points into the middle of a zeroed stack area.
#[derive(Debug, Clone)]
pub struct Runtime
{
    pub image: Image,
    pub hook: u64,
    pub app: u64,
    pub app_image: u64,
    pub table: DataTable,
    pub header: u64,
    pub code: u64,
    pub stack: u64,
}

impl Runtime
{
    pub fn new() -> Self
    {
        let mut image = Image::new();
        let hook = image.alloc(16);
        let code = image.alloc(0x200);
        let stack = image.alloc(0x400) + 0x200;
        let app_image = image.alloc(16);
        let app = image.module(
            1,
            "/opt/app/App.exe",
            app_image,
            &[(MAIN_TOKEN, "Main"), (HELPER_TOKEN, "Helper")],
        );
        let table = image.data_table(1, 1024);
        let header = image.symbol_table(0, &[table.descriptor], &[app]);
        Self {
            image,
            hook,
            app,
            app_image,
            table,
            header,
            code,
            stack,
        }
    }

    pub fn main_method(&self) -> MethodSpec
    {
        MethodSpec {
            module: 1,
            token: MAIN_TOKEN,
            name: Some("Main"),
            start: self.code,
            end: self.code + 0x40,
            body_start: self.code + 8,
            rows: vec![(10, 0), (11, 0x10), (12, 0x20)],
        }
    }

    pub fn helper_method(&self) -> MethodSpec
    {
        MethodSpec {
            module: 1,
            token: HELPER_TOKEN,
            name: Some("Helper"),
            start: self.code + 0x100,
            end: self.code + 0x140,
            body_start: 0,
            rows: vec![(30, 0), (31, 0x10)],
        }
    }

    /// Write the descriptor of `spec` and announce it in the data table.
    pub fn compile(&mut self, spec: &MethodSpec) -> u64
    {
        let descriptor = self.image.method(spec);
        self.image.append_method_record(&mut self.table, spec.module, descriptor);
        descriptor
    }

    /// Write the descriptor of `spec` without announcing it.
    pub fn descriptor(&mut self, spec: &MethodSpec) -> u64
    {
        self.image.method(spec)
    }

    /// Open a session with `threads` and hook it into the runtime.
    pub fn session(&self, threads: &[(ThreadId, u64, u64)]) -> (Session, Script)
    {
        let (process, script) = ScriptedProcess::new(&self.image, threads);
        let session = Session::new(Box::new(process), SessionConfig::default()).unwrap();
        session
            .initialize_runtime(&RuntimeHooks {
                notification_address: self.hook,
                symbol_table: Some(self.header),
            })
            .unwrap();
        (session, script)
    }
}

impl Default for Runtime
{
    fn default() -> Self
    {
        Self::new()
    }
}
