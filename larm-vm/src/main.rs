use clap::{Parser, ValueEnum};
use larm_vm::Trap;
use larm_vm::bus::Bus;
use larm_vm::chardev::{CharBackend, NullBackend, StdioBackend};
use larm_vm::devices::intc::{self, INTC_BASE};
use larm_vm::devices::raw::{DylibLoader, RawDeviceConfig};
use larm_vm::loader::{BootImage, load_image};
use larm_vm::machine::{EchoHart, Hart, Machine, RunExit, StepOutcome};
use larm_vm::snapshot::SocSnapshot;
use larm_vm::soc::{LarmSoc, SocConfig, SocError, TimerDriver};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Serial {
    /// Host terminal, raw mode; Ctrl-A x quits
    Stdio,
    /// Discard output, no input
    Null,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Boot image to load into RAM (ELF or raw binary)
    #[arg(short, long)]
    kernel: Option<PathBuf>,

    /// Address to load a raw binary at
    #[arg(long, default_value = "0", value_parser = parse_addr)]
    load_addr: u64,

    /// RAM size in MiB
    #[arg(long, default_value_t = 128)]
    mem_mib: usize,

    /// Raw device: raw,addr=<n>,size=<n>,file=<path>[,arg=<text>]
    /// (repeatable)
    #[arg(long = "device", value_name = "SPEC")]
    devices: Vec<RawDeviceConfig>,

    /// UART backend
    #[arg(long, value_enum, default_value_t = Serial::Stdio)]
    serial: Serial,

    /// Run the built-in interrupt-driven echo guest
    #[arg(long)]
    echo: bool,

    /// Timer tick rate for the echo guest
    #[arg(long, requires = "echo")]
    tick_hz: Option<u32>,

    /// Stop after this many dispatch steps
    #[arg(long)]
    max_steps: Option<u64>,

    /// Restore peripheral state from a snapshot before running
    #[arg(long)]
    restore_snapshot: Option<PathBuf>,

    /// Write a peripheral snapshot on exit
    #[arg(long)]
    save_snapshot: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG (e.g. "debug", "larm_vm::devices=trace")
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

/// Stand-in guest when no CPU engine is attached: acknowledges every
/// interrupt and otherwise sleeps.
struct IdleHart;

impl Hart for IdleHart {
    fn step(&mut self, _bus: &dyn Bus) -> Result<StepOutcome, Trap> {
        Ok(StepOutcome::WaitForInterrupt)
    }

    fn take_interrupt(&mut self, bus: &dyn Bus) -> Result<(), Trap> {
        let source = bus.read8(INTC_BASE + intc::SOURCE)?;
        log::debug!("[Idle] interrupt, sources {:#04x}", source);
        bus.write8(INTC_BASE + intc::SOURCE, 0)
    }
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_info(key: &str, value: &str) {
    println!(
        "    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m",
        key, value
    );
}

fn init_logging(filter: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.init();
}

fn build_soc(args: &Args, backend: Arc<dyn CharBackend>) -> Result<LarmSoc, SocError> {
    let config = SocConfig {
        raw_devices: args.devices.clone(),
        ..SocConfig::with_ram_mib(args.mem_mib)?
    };
    LarmSoc::new(&config, backend, TimerDriver::host(), &DylibLoader)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let quit = Arc::new(AtomicBool::new(false));
    let backend: Arc<dyn CharBackend> = match args.serial {
        Serial::Stdio => {
            let stdio = StdioBackend::with_quit_flag(Arc::clone(&quit));
            Arc::new(stdio)
        }
        Serial::Null => Arc::new(NullBackend),
    };

    let soc = match build_soc(&args, backend) {
        Ok(soc) => soc,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    print_section("MEMORY MAP");
    print_info(
        "ram",
        &format!("0x{:08X} - 0x{:08X}", 0, soc.bus().dram_size()),
    );
    for region in soc.bus().regions() {
        print_info(
            &region.name,
            &format!("0x{:08X} - 0x{:08X}", region.base, region.base + region.size),
        );
    }

    if let Some(path) = &args.kernel {
        let buffer = std::fs::read(path)?;
        match load_image(&buffer, args.load_addr, soc.bus())? {
            BootImage::Elf { entry } => {
                print_info("Kernel", &format!("ELF, entry 0x{:08X}", entry));
            }
            BootImage::Raw { entry, len } => {
                print_info("Kernel", &format!("raw, {} bytes at 0x{:08X}", len, entry));
            }
        }
    }

    if let Some(path) = &args.restore_snapshot {
        soc.restore(&SocSnapshot::load(path)?)?;
    }

    if args.serial == Serial::Stdio {
        println!("\n    \x1b[0;90mPress Ctrl-A then 'x' to terminate\x1b[0m\n");
    }

    let exit = if args.echo {
        let mut machine = Machine::new(EchoHart::new(args.tick_hz), &soc).with_stop_flag(quit);
        machine.run(args.max_steps)?
    } else {
        let mut machine = Machine::new(IdleHart, &soc).with_stop_flag(quit);
        machine.run(args.max_steps)?
    };
    match exit {
        RunExit::Halted => log::info!("guest halted"),
        RunExit::Stopped => log::info!("terminated by user"),
        RunExit::StepLimit => log::info!("step limit reached"),
    }

    if let Some(path) = &args.save_snapshot {
        soc.snapshot().save(path)?;
    }

    Ok(())
}
