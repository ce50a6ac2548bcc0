//! Emulator entry point: argument parsing, image loading, and the
//! fetch/execute/trap/interrupt loop.

mod bus;
mod clint;
mod cpu;
mod csr;
mod dram;
mod exception;
mod interrupt;
mod param;
mod plic;
mod tty;
mod uart;
mod virtio;
mod virtqueue;

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use crate::cpu::Cpu;
use crate::tty::TtyGuard;

/// A 64-bit RISC-V system emulator able to boot an xv6 kernel.
#[derive(Debug, Parser)]
#[command(name = "rv64emu", version, about)]
struct Cli {
    /// Raw kernel image, loaded at the base of DRAM
    kernel: PathBuf,

    /// Raw disk image exposed through the virtio block device
    disk: Option<PathBuf>,

    /// Dump registers and CSRs when the emulator stops
    #[arg(long)]
    dump_registers: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rv64emu: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let code = fs::read(&cli.kernel)?;
    let disk = match &cli.disk {
        Some(path) => fs::read(path)?,
        None => Vec::new(),
    };
    info!(
        "loaded {} kernel bytes and {} disk bytes",
        code.len(),
        disk.len()
    );

    let mut tty = TtyGuard::new();
    let mut cpu = Cpu::new(code, disk);

    let fatal = loop {
        let inst = match cpu.fetch() {
            Ok(inst) => Some(inst),
            Err(e) => {
                cpu.handle_exception(e);
                if e.is_fatal() {
                    break e;
                }
                None
            }
        };
        if let Some(inst) = inst {
            match cpu.execute(inst) {
                Ok(new_pc) => cpu.pc = new_pc,
                Err(e) => {
                    cpu.handle_exception(e);
                    if e.is_fatal() {
                        break e;
                    }
                }
            }
        }
        if let Some(interrupt) = cpu.check_pending_interrupt() {
            cpu.handle_interrupt(interrupt);
        }
    };

    tty.restore();
    error!("fatal exception: {}", fatal);
    if cli.dump_registers {
        cpu.dump_registers();
        cpu.dump_csrs();
        cpu.dump_pc();
    }
    Ok(ExitCode::FAILURE)
}
