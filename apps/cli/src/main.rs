use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use loconet_core::protocol::{
    InboundMessage, ProgrammingTask, decode, encode_programming_task, encode_send_packet,
};
use loconet_core::protocol::constants::*;
use loconet_core::{
    FrameReader, LnMessage, ManagerConfig, ProgrammingMode, SlotManager, SlotStatus,
    StreamTransport, SystemClock, TracingSlotListener,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "LocoNet slot table and programming tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode one frame given as hex, e.g. "E7 0E 05 ..."
    Decode {
        #[arg(required = true)]
        hex: Vec<String>,
    },
    /// Wrap a DCC packet (check byte included) into an immediate-packet frame
    EncodePacket {
        #[arg(required = true)]
        hex: Vec<String>,
        /// Repeat count, 0-7
        #[arg(short, long, default_value_t = 0)]
        repeats: u8,
    },
    /// Build the slot write that starts a programming task
    EncodeProg {
        #[arg(long, value_enum)]
        op: ProgOpArg,
        /// CV number, 1-1024
        #[arg(long)]
        cv: u16,
        /// Value to write or confirm
        #[arg(long)]
        value: Option<u8>,
        /// Service-mode programming mode
        #[arg(long, value_enum, default_value_t = ModeArg::Paged)]
        mode: ModeArg,
        /// Program a locomotive on the main track instead
        #[arg(long)]
        ops_address: Option<u16>,
    },
    /// Feed a captured bus trace through a slot manager and print the slot table
    Replay {
        /// Trace file: one hex frame per line, or raw bytes with --binary
        file: PathBuf,
        /// Read the trace as a raw byte stream
        #[arg(long)]
        binary: bool,
        /// Manager configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Also list free slots
        #[arg(long)]
        all: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProgOpArg {
    Read,
    Write,
    Confirm,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Paged,
    Direct,
    Register,
    Address,
}

impl From<ModeArg> for ProgrammingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Paged => ProgrammingMode::Paged,
            ModeArg::Direct => ProgrammingMode::DirectByte,
            ModeArg::Register => ProgrammingMode::Register,
            ModeArg::Address => ProgrammingMode::Address,
        }
    }
}

fn parse_hex(parts: &[String]) -> Result<Vec<u8>> {
    let text: String = parts.concat().chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&text).with_context(|| format!("invalid hex: {text}"))
}

fn decode_frame(parts: &[String]) -> Result<()> {
    let bytes = parse_hex(parts)?;
    let msg = LnMessage::from_bytes(&bytes)?;
    if !msg.checksum_ok() {
        warn!(frame = %msg, "Checksum mismatch");
    }
    let decoded = decode(&msg)?;
    println!("{decoded:#?}");
    if let InboundMessage::ImmediatePacket {
        packet: Some(packet),
    } = decoded
        && let Some(group) = packet.function_group()
    {
        println!("function group: {group:?}");
    }
    Ok(())
}

fn encode_packet(parts: &[String], repeats: u8) -> Result<()> {
    let packet = parse_hex(parts)?;
    let msg = encode_send_packet(&packet, repeats)?;
    println!("{msg}");
    Ok(())
}

fn encode_prog(
    op: ProgOpArg,
    cv: u16,
    value: Option<u8>,
    mode: ModeArg,
    ops_address: Option<u16>,
) -> Result<()> {
    let value = match (op, value) {
        (ProgOpArg::Read, _) => None,
        (_, Some(v)) => Some(v),
        (_, None) => bail!("--value is required for write and confirm"),
    };
    let write = matches!(op, ProgOpArg::Write);
    let task = match ops_address {
        Some(address) => {
            let pcmd = if write { PCMD_OPS_WRITE } else { PCMD_OPS_READ };
            ProgrammingTask::ops(pcmd, value, cv, address)
        }
        None => {
            let mode = ProgrammingMode::from(mode);
            let bits = mode
                .service_bits()
                .with_context(|| format!("mode {mode} has no command mapping"))?;
            let base = if write {
                PCMD_SERVICE_WRITE
            } else {
                PCMD_SERVICE_READ
            };
            ProgrammingTask::service(base | bits, value, cv)
        }
    };
    let msg = encode_programming_task(&task)?;
    println!("{msg}");
    Ok(())
}

fn replay(
    file: PathBuf,
    binary: bool,
    config: Option<PathBuf>,
    all: bool,
    verbose: bool,
) -> Result<()> {
    let config = match config {
        Some(path) => ManagerConfig::load_from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    let mut manager = SlotManager::new(
        StreamTransport::new(std::io::sink()),
        SystemClock::new(),
        config,
    );
    if verbose {
        manager.add_slot_listener(Arc::new(TracingSlotListener));
    }

    let input = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
    let mut frames = 0usize;
    if binary {
        for msg in FrameReader::new(BufReader::new(input)) {
            match msg {
                Ok(msg) => {
                    manager.message(&msg);
                    frames += 1;
                }
                Err(e) => warn!(error = %e, "Skipping bad frame"),
            }
        }
    } else {
        for (n, line) in BufReader::new(input).lines().enumerate() {
            let line = line?;
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            match parse_hex(&[line.to_string()]) {
                Ok(bytes) => {
                    manager.on_frame(&bytes);
                    frames += 1;
                }
                Err(e) => warn!(line = n + 1, error = %e, "Skipping line"),
            }
        }
    }
    manager.poll();
    info!(frames = frames, "Replay complete");

    println!("slot  status   address  speed  dir      F0-F8      F9-F28");
    for slot in manager.slots().iter() {
        if !all && slot.status() == SlotStatus::Free {
            continue;
        }
        let functions: String = (0..=8)
            .map(|n| if slot.function(n) { '1' } else { '0' })
            .collect();
        let extended = manager
            .extended_functions(slot.index() as usize)
            .map(|e| e.bits())
            .unwrap_or_default();
        println!(
            "{:>4}  {:<7}  {:>7}  {:>5}  {:<7}  {}  {:05X}",
            slot.index(),
            slot.status().to_string(),
            slot.loco_address(),
            slot.speed(),
            format!("{:?}", slot.direction()),
            functions,
            extended
        );
    }
    println!("in use: {}", manager.in_use_slot_count());
    if let Some(prog) = manager.slot(PRG_SLOT as usize)?.programming() {
        println!(
            "programming slot: cv {} value {} pstat {:02X}",
            prog.cv_number(),
            prog.cv_value(),
            prog.pstat
        );
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Decode { hex } => decode_frame(&hex),
        Command::EncodePacket { hex, repeats } => encode_packet(&hex, repeats),
        Command::EncodeProg {
            op,
            cv,
            value,
            mode,
            ops_address,
        } => encode_prog(op, cv, value, mode, ops_address),
        Command::Replay {
            file,
            binary,
            config,
            all,
        } => replay(file, binary, config, all, args.verbose),
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already set");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
