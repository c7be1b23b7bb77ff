use clap::Parser;
use goblin::elf::program_header::PT_LOAD;
use log::{debug, info};
use riscv_sim_core::board::{Board, Config};
use riscv_sim_core::simulator::SimulationAllocator;
use std::fs::File;
use std::io::Read;
use std::process::ExitCode;
use thiserror::Error;

type Simulator = riscv_sim_core::simulator::Simulator<Board<SimulationAllocator>>;

/// RISC-V instruction-accurate simulator.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// ELF binary to execute.
    #[arg(long)]
    target: String,
    /// ISA string, e.g. "rv32imac". Only used for validation; the decoder/executor
    /// support is fixed at build time.
    #[arg(long, default_value = "rv32ima")]
    isa: String,
    /// Number of harts. Only 1 is currently supported.
    #[arg(long, default_value_t = 1)]
    harts: u32,
    /// Physical address to write `tohost` style completion values to.
    #[arg(long, value_parser = parse_scaled_u32)]
    tohost: Option<u32>,
    /// Maximum number of instructions to execute before aborting.
    #[arg(long, value_parser = parse_scaled_u64)]
    maxinst: Option<u64>,
    /// Physical address execution stops at (inclusive).
    #[arg(long, value_parser = parse_scaled_u32)]
    endpc: Option<u32>,
    /// Print a trace line for every retired instruction instead of driving a TUI.
    #[arg(long)]
    interactive: bool,
    /// Write log output to this file instead of stderr.
    #[arg(long)]
    log: Option<String>,
    /// JSON configuration file; overrides defaults, overridden by explicit flags.
    #[arg(long)]
    configfile: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read target binary: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse ELF file: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error("unsupported configuration: {0}")]
    Config(String),
}

/// Parses a numeric CLI argument honouring an optional `0x` prefix and a K/M/G/T suffix
/// scaled by 1024, e.g. `64M` => `64 * 1024 * 1024`.
fn parse_scaled_u64(s: &str) -> Result<u64, String> {
    let (digits, scale) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some('T') | Some('t') => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())?
    } else {
        digits.parse::<u64>().map_err(|e| e.to_string())?
    };
    Ok(value * scale)
}

fn parse_scaled_u32(s: &str) -> Result<u32, String> {
    u32::try_from(parse_scaled_u64(s)?).map_err(|_| "value out of range for a 32-bit address".into())
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<ExitCode, CliError> {
    if args.harts != 1 {
        return Err(CliError::Config(
            "only single-hart simulation is currently supported".to_string(),
        ));
    }

    let mut buf = Vec::new();
    File::open(&args.target)?.read_to_end(&mut buf)?;

    let elf_header = goblin::elf::Elf::parse(&buf)?;
    let segments: Vec<_> = elf_header
        .program_headers
        .iter()
        .filter(|h| h.p_type == PT_LOAD)
        .collect();

    let mut simulator = Simulator::new(|allocator| {
        let board = Board::new(allocator, Config::default());
        for h in &segments {
            debug!(
                "loading segment: file range {:#010x?} to pmem range [{:#010x?}..{:#010x?})",
                h.file_range(),
                h.p_paddr,
                h.p_paddr + h.p_memsz,
            );
            board.load_physical(allocator, h.p_paddr as u32, &buf[h.file_range()]);
        }
        board
    });

    let mut previous_pc = None;
    let mut retired: u64 = 0;
    loop {
        let (allocator, board) = simulator.inspect();
        let pc = board.core().registers(allocator).pc();

        if let Some(endpc) = args.endpc {
            if pc == endpc {
                info!("reached --endpc {endpc:#010x} after {retired} instructions");
                return Ok(ExitCode::SUCCESS);
            }
        }
        // Self-jump (`1: j 1b`) is the riscv-tests/riscv-arch-test convention for signalling
        // completion when no explicit --tohost address is configured.
        if args.tohost.is_none() && previous_pc == Some(pc) {
            info!("target reached a self-loop after {retired} instructions");
            return Ok(ExitCode::SUCCESS);
        }
        if let Some(tohost) = args.tohost {
            let value = board
                .core()
                .mmu()
                .read_word_debug(allocator, tohost)
                .map_err(|e| CliError::Config(format!("failed to read --tohost address: {e:?}")))?;
            if value != 0 {
                info!("tohost = {value} after {retired} instructions");
                return Ok(if value == 1 {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                });
            }
        }
        if let Some(maxinst) = args.maxinst {
            if retired >= maxinst {
                return Err(CliError::Config(format!(
                    "execution did not terminate within --maxinst {maxinst} instructions"
                )));
            }
        }

        previous_pc = Some(pc);
        if args.interactive {
            info!("pc={pc:#010x} retired={retired}");
        }
        simulator.step();
        retired += 1;
    }
}
