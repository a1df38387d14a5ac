use std::process;
use std::sync::mpsc::TryRecvError;

use clap::{Parser, Subcommand};
use mantle_core::breakpoints::{BreakpointDefinition, BreakpointLocation};
use mantle_core::events::DebuggerEventReceiver;
use mantle_core::symbols::StoreLimits;
use mantle_core::types::ProcessId;
use mantle_core::{MantleError, MantleResult, ProcessSnapshot, RuntimeHooks, Session, SessionConfig, StopEvent};
use mantle_utils::{info, init_logging, warn, EngineConfig};

/// A debugger for managed-runtime processes with live symbol-table introspection.
#[derive(Parser, Debug)]
#[command(name = "mantle")]
#[command(version)]
#[command(about = "A debugger for managed-runtime processes with live symbol-table introspection", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Attach to a running process by PID
    Attach
    {
        /// Process ID (PID) to attach to
        pid: u32,
        /// Address of the runtime's notification function (hex: 0x1000 or decimal)
        #[arg(long)]
        notification: Option<String>,
        /// Address of the runtime's symbol-table header
        #[arg(long)]
        symbol_table: Option<String>,
        /// Breakpoint as `module:method[:line]` or an address (repeatable)
        #[arg(short, long = "break")]
        breakpoints: Vec<String>,
        /// Continue the first thread and report stops until Ctrl-C or exit
        #[arg(long, default_value_t = false)]
        run: bool,
    },
    /// Inspect a saved core image
    Inspect
    {
        /// Path to the ELF core file
        core: String,
        /// Address of the runtime's symbol-table header in the image
        #[arg(long)]
        symbol_table: Option<String>,
    },
}

fn main()
{
    // Initialize logging (reads from RUST_LOG / MANTLE_LOG_FORMAT)
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    let cli = Cli::parse();
    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn session_config() -> Result<SessionConfig, Box<dyn std::error::Error>>
{
    let engine = EngineConfig::from_env()?;
    Ok(SessionConfig {
        poll_interval: engine.poll_interval,
        max_step_iterations: engine.max_step_iterations,
        max_backtrace_depth: engine.max_backtrace_depth,
        store: StoreLimits {
            max_chunks_per_update: engine.max_chunks_per_update as usize,
            max_deferred_records: engine.max_deferred_records,
            max_string_length: engine.max_string_length,
            max_table_entries: engine.max_table_entries,
        },
    })
}

fn run_command(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    let config = session_config()?;
    match cli.command {
        Commands::Attach {
            pid,
            notification,
            symbol_table,
            breakpoints,
            run,
        } => {
            info!("Attaching to process {}", pid);
            let session = Session::attach(ProcessId::from(pid), config)?;
            println!("Successfully attached to process {pid}");
            let events = session.subscribe();

            if let Some(notification) = notification {
                let hooks = RuntimeHooks {
                    notification_address: parse_address(&notification)?,
                    symbol_table: symbol_table.as_deref().map(parse_address).transpose()?,
                };
                session.initialize_runtime(&hooks)?;
            } else if symbol_table.is_some() {
                return Err("--symbol-table needs --notification on a live process".into());
            }
            for spec in &breakpoints {
                let id = session.create_breakpoint(BreakpointDefinition::new(parse_location(spec)?))?;
                println!("Breakpoint {id}: {spec}");
            }

            print_threads(&session)?;
            if run {
                run_until_exit(&session, &events)?;
            }
            drain_events(&events);
            session.detach()?;
            println!("Detached from process {pid}");
            Ok(())
        }
        Commands::Inspect { core, symbol_table } => {
            info!("Opening core image {}", core);
            let snapshot = ProcessSnapshot::from_core_file(&core)?;
            let session = Session::open_snapshot(snapshot, config)?;
            let events = session.subscribe();
            if let Some(header) = symbol_table {
                // The hook never fires on a snapshot; it only carries the table.
                session.initialize_runtime(&RuntimeHooks {
                    notification_address: 0,
                    symbol_table: Some(parse_address(&header)?),
                })?;
            }
            drain_events(&events);
            print_threads(&session)?;
            Ok(())
        }
    }
}

fn run_until_exit(session: &Session, events: &DebuggerEventReceiver) -> Result<(), Box<dyn std::error::Error>>
{
    let target = session.target().clone();
    ctrlc::set_handler(move || {
        if let Err(e) = target.interrupt() {
            eprintln!("Failed to interrupt target: {e}");
        }
    })?;

    let Some(first) = session.threads()?.first().copied() else {
        return Err("target has no threads".into());
    };
    let servant = session.thread(first)?;
    loop {
        let stop = servant.lock().map_err(MantleError::from)?.continue_execution()?;
        drain_events(events);
        print_stop(&stop);
        if stop.reason.is_terminal() || stop.reason == mantle_core::StopReason::Interrupted {
            return Ok(());
        }
    }
}

fn print_threads(session: &Session) -> MantleResult<()>
{
    let depth = session.config().max_backtrace_depth;
    for thread in session.threads()? {
        println!("Thread {thread}:");
        let servant = session.thread(thread)?;
        let mut servant = servant.lock()?;
        match servant.backtrace(depth) {
            Ok(frames) => {
                for frame in frames {
                    let name = frame.method_name.as_deref().unwrap_or("??");
                    match frame.source {
                        Some(source) => println!("  #{:<3} {} in {} at {}", frame.index, frame.pc, name, source),
                        None => println!("  #{:<3} {} in {}", frame.index, frame.pc, name),
                    }
                }
            }
            Err(e) => warn!("no backtrace for thread {}: {}", thread, e),
        }
    }
    Ok(())
}

fn print_stop(stop: &StopEvent)
{
    let mut line = format!(
        "Thread {} stopped: {}",
        stop.thread,
        mantle_core::events::format_stop_reason(stop.reason)
    );
    if let Some(frame) = &stop.frame {
        line.push_str(&format!(" at {}", frame.pc));
        if let Some(name) = &frame.method_name {
            line.push_str(&format!(" in {name}"));
        }
    }
    println!("{line}");
}

fn drain_events(events: &DebuggerEventReceiver)
{
    loop {
        match events.try_recv() {
            Ok(event) => println!("[event] {}", event.describe()),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
        }
    }
}

fn parse_address(text: &str) -> MantleResult<u64>
{
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|e| MantleError::InvalidArgument(format!("invalid address '{text}': {e}")))
}

fn parse_location(spec: &str) -> MantleResult<BreakpointLocation>
{
    if let Ok(address) = parse_address(spec) {
        return Ok(BreakpointLocation::Address { module: None, address });
    }
    let mut parts = spec.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(module), Some(method), line, None) if !module.is_empty() && !method.is_empty() => {
            let line = line
                .map(|l| {
                    l.parse::<u32>()
                        .map_err(|e| MantleError::InvalidArgument(format!("invalid line '{l}': {e}")))
                })
                .transpose()?;
            Ok(BreakpointLocation::Method {
                module: module.to_string(),
                method: method.to_string(),
                line,
            })
        }
        _ => Err(MantleError::InvalidArgument(format!(
            "breakpoint '{spec}' is neither an address nor module:method[:line]"
        ))),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn parses_breakpoint_locations()
    {
        assert_eq!(
            parse_location("0x4000").ok(),
            Some(BreakpointLocation::Address {
                module: None,
                address: 0x4000
            })
        );
        assert_eq!(
            parse_location("app.dll:Main:12").ok(),
            Some(BreakpointLocation::Method {
                module: "app.dll".to_string(),
                method: "Main".to_string(),
                line: Some(12)
            })
        );
        assert!(parse_location("Main").is_err());
        assert!(parse_location("app:Main:x").is_err());
    }
}
