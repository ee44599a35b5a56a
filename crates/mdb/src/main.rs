use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mdb_core::scan::{format_hexdump, search};
use mdb_core::{MdbError, MdbResult, MemoryRange, ProcessId, Task};
use mdb_utils::{info, init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};

/// Inspect and watch Mach tasks.
#[derive(Parser, Debug)]
#[command(name = "mdb")]
#[command(version)]
#[command(about = "Inspect the memory, threads and exceptions of a running macOS process", long_about = None)]
struct Cli
{
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format: pretty or json (overrides MDB_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Show task accounting, thread and region counts
    Info
    {
        /// Process ID (PID) to attach to
        pid: u32,
    },
    /// List memory regions
    Regions
    {
        pid: u32,
    },
    /// Hex dump target memory
    Read
    {
        pid: u32,
        /// Start address (hex with 0x prefix, or decimal)
        #[arg(value_parser = parse_address)]
        address: u64,
        /// Number of bytes to read
        #[arg(short, long, default_value_t = 64)]
        length: u64,
    },
    /// Search readable memory for a byte pattern
    Search
    {
        pid: u32,
        /// Pattern to look for (UTF-8 text, or hex bytes with --hex)
        pattern: String,
        /// Interpret the pattern as hex bytes, e.g. "deadbeef"
        #[arg(long, default_value_t = false)]
        hex: bool,
        /// Bytes of context shown around each hit
        #[arg(short, long, default_value_t = 16)]
        context: usize,
    },
    /// List threads, optionally with their registers
    Threads
    {
        pid: u32,
        /// Print the register state of every thread
        #[arg(short, long, default_value_t = false)]
        registers: bool,
    },
    /// Print exceptions raised by the target as they arrive
    Watch
    {
        pid: u32,
        /// Receive timeout for each poll
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
        /// Stop after this many exceptions
        #[arg(long)]
        count: Option<usize>,
        /// Resume the faulting thread after printing it
        #[arg(long, default_value_t = false)]
        resume: bool,
    },
}

impl Commands
{
    fn pid(&self) -> u32
    {
        match self {
            Commands::Info { pid }
            | Commands::Regions { pid }
            | Commands::Read { pid, .. }
            | Commands::Search { pid, .. }
            | Commands::Threads { pid, .. }
            | Commands::Watch { pid, .. } => *pid,
        }
    }
}

fn main()
{
    let cli = Cli::parse();

    let _guard = match setup_logging(cli.log_level, cli.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn setup_logging(level: Option<LogLevel>, format: Option<LogFormat>) -> Result<LoggingGuard, LoggingError>
{
    match (level, format) {
        (None, None) => init_logging(),
        (level, format) => init_logging_with_level(level.unwrap_or(LogLevel::Warn), format.unwrap_or_default()),
    }
}

fn parse_address(s: &str) -> Result<u64, String>
{
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn parse_hex_bytes(s: &str) -> MdbResult<Vec<u8>>
{
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(MdbError::InvalidArgument(format!("odd number of hex digits in {s:?}")));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| MdbError::InvalidArgument(format!("invalid hex byte {:?}: {e}", &digits[i..i + 2])))
        })
        .collect()
}

fn run_command(command: Commands) -> MdbResult<()>
{
    let pid = ProcessId::from(command.pid());
    info!("Attaching to process {}", pid);
    let mut task = Task::new(pid)?;
    task.attach()?;

    // The command's error wins; detach is attempted either way.
    let result = execute(&task, command);
    let detached = task.detach();
    result.and(detached)
}

fn execute(task: &Task, command: Commands) -> MdbResult<()>
{
    match command {
        Commands::Info { .. } => print_info(task),
        Commands::Regions { .. } => print_regions(task),
        Commands::Read { address, length, .. } => {
            let bytes = task.memory(address, length)?.read_all()?;
            print!("{}", format_hexdump(address, &bytes, 16));
            if (bytes.len() as u64) < length {
                println!("({} of {length} bytes readable)", bytes.len());
            }
            Ok(())
        }
        Commands::Search {
            pattern, hex, context, ..
        } => {
            let needle = if hex { parse_hex_bytes(&pattern)? } else { pattern.into_bytes() };
            let hits = search(task, &needle, context)?;
            for hit in &hits {
                println!("0x{:016x} (region 0x{:x}): {}", hit.address, hit.region, hit.context);
            }
            println!("{} hit(s)", hits.len());
            Ok(())
        }
        Commands::Threads { registers, .. } => print_threads(task, registers),
        Commands::Watch {
            timeout_ms,
            count,
            resume,
            ..
        } => watch(task, Duration::from_millis(timeout_ms), count, resume),
    }
}

fn print_info(task: &Task) -> MdbResult<()>
{
    let basic = task.basic_info()?;
    println!("Process {}", task.pid());
    if let (Some(task_port), Some(exception_port)) = (task.task_port(), task.exception_port()) {
        println!("  Task port: 0x{task_port:x}");
        println!("  Exception port: 0x{exception_port:x}");
    }
    println!("  Suspend count: {}", basic.suspend_count);
    println!("  Virtual size: {} bytes", basic.virtual_size);
    println!("  Resident size: {} bytes", basic.resident_size);
    println!("  User time: {:?}", basic.user_time.as_duration());
    println!("  System time: {:?}", basic.system_time.as_duration());
    println!("  Threads: {}", task.threads()?.len());
    println!("  Memory Regions: {}", task.regions().count());
    Ok(())
}

fn print_regions(task: &Task) -> MdbResult<()>
{
    for region in task.regions() {
        let region = region?;
        let mut flags = String::new();
        if region.is_shared() {
            flags.push_str(" shared");
        }
        if region.is_reserved() {
            flags.push_str(" reserved");
        }
        println!(
            "0x{:016x}-0x{:016x} {}/{} {:>12}{flags}",
            region.address(),
            region.end(),
            region.protection().to_rwx(),
            region.max_protection().to_rwx(),
            region.size(),
        );
    }
    Ok(())
}

fn print_threads(task: &Task, registers: bool) -> MdbResult<()>
{
    for mut thread in task.threads()? {
        if !registers {
            println!("thread 0x{:x}", thread.handle());
            continue;
        }
        let state = thread.get_state()?;
        println!("thread 0x{:x} ({})", thread.handle(), thread.architecture());
        for (name, value) in state.registers() {
            println!("  {name:>6} = 0x{value:016x}");
        }
    }
    Ok(())
}

fn watch(task: &Task, timeout: Duration, count: Option<usize>, resume: bool) -> MdbResult<()>
{
    info!(pid = %task.pid(), "Watching for exceptions");

    let mut seen = 0;
    while count.map_or(true, |limit| seen < limit) {
        let Some(mut event) = task.poll(timeout)? else {
            continue;
        };
        seen += 1;

        let pc = event.thread.get_state().ok().map(|state| state.instruction_pointer());
        match pc {
            Some(pc) => println!(
                "{} on thread 0x{:x} at 0x{pc:x} (code 0x{:x}, subcode 0x{:x})",
                event.kind,
                event.thread.handle(),
                event.codes[0],
                event.codes[1]
            ),
            None => println!(
                "{} on thread 0x{:x} (code 0x{:x}, subcode 0x{:x})",
                event.kind,
                event.thread.handle(),
                event.codes[0],
                event.codes[1]
            ),
        }

        if resume {
            event.thread.resume()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn addresses_parse_as_hex_or_decimal()
    {
        assert_eq!(parse_address("0x1000"), Ok(0x1000));
        assert_eq!(parse_address("0XfF"), Ok(0xff));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn hex_patterns_ignore_whitespace()
    {
        assert_eq!(parse_hex_bytes("de ad be ef").unwrap(), [0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn cli_parses_watch_options()
    {
        let cli = Cli::parse_from(["mdb", "--log-level", "debug", "watch", "42", "--count", "3", "--resume"]);
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        match cli.command {
            Commands::Watch {
                pid,
                timeout_ms,
                count,
                resume,
            } => {
                assert_eq!((pid, timeout_ms, count, resume), (42, 1000, Some(3), true));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
