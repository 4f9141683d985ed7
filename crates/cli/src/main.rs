//! anvil: drive the compute dispatch core from the command line
//!
//! Usage:
//!   anvil [OPTIONS] <COMMAND>
//!
//! Examples:
//!   anvil demo -f gen12lp --size 4096 --pattern 0xdeadbeef
//!   anvil demo -f xehpc -o batch.bin
//!   anvil decode batch.bin -f xehpc
//!   anvil sizes

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use anvil_packets::prelude::*;
use anvil_packets::CommandKind;
use anvil_runtime::prelude::*;
use anvil_runtime::queue::ExecutedBatch;

/// Anvil compute dispatch driver
///
/// Builds command buffers on a simulated device and inspects encoded
/// command streams.
#[derive(Parser, Debug)]
#[command(name = "anvil")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Fill a buffer, copy it and verify the copy on a simulated device
    Demo {
        /// Hardware family to encode for
        #[arg(short, long, default_value = "gen12lp")]
        family: Family,

        /// Buffer size in bytes
        #[arg(short, long, default_value = "1024")]
        size: u64,

        /// 32-bit fill pattern (decimal or 0x-prefixed hex)
        #[arg(short, long, default_value = "0xa5a5a5a5", value_parser = parse_u32)]
        pattern: u32,

        /// Write the copy's command stream to FILE ("-" for stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<String>,
    },

    /// Decode a binary command stream
    Decode {
        /// Input file (use "-" for stdin)
        #[arg(value_name = "INPUT")]
        input: String,

        /// Hardware family the stream was encoded for
        #[arg(short, long, default_value = "gen12lp")]
        family: Family,
    },

    /// Print the dword length of every command on every family
    Sizes,
}

/// Hardware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Family {
    /// Gen9 (Skylake)
    Gen9,
    /// Gen12 low power (Tiger Lake)
    Gen12lp,
    /// Xe high performance compute (Ponte Vecchio)
    Xehpc,
}

impl From<Family> for HardwareFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Gen9 => HardwareFamily::Gen9,
            Family::Gen12lp => HardwareFamily::Gen12Lp,
            Family::Xehpc => HardwareFamily::XeHpc,
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    match args.command {
        Cmd::Demo {
            family,
            size,
            pattern,
            output,
        } => demo(family.into(), size, pattern, output.as_deref()),
        Cmd::Decode { input, family } => decode(&input, family.into()),
        Cmd::Sizes => {
            sizes();
            Ok(())
        }
    }
}

fn demo(
    family: HardwareFamily,
    size: u64,
    pattern: u32,
    output: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = DeviceConfig::from_env()?.with_family(family);
    let (device, transport) = Device::simulated(config)?;
    let context = device.create_context();
    let src = context.create_buffer(size, MemoryAccess::ReadWrite)?;
    let dst = context.create_buffer(size, MemoryAccess::ReadWrite)?;
    let mut queue = context.create_queue()?;

    let filled = queue.enqueue_fill_buffer(&src, &pattern.to_le_bytes(), 0, size, &[], false)?;
    let copied = queue.enqueue_copy_buffer(
        &src,
        &dst,
        0,
        0,
        size,
        &[Dependency::from(&filled)],
        true,
    )?;
    queue.finish()?;
    if !copied.is_complete() {
        return Err("copy did not complete".into());
    }

    let expected: Vec<u8> = pattern
        .to_le_bytes()
        .iter()
        .copied()
        .cycle()
        .take(size as usize)
        .collect();
    let actual = dst.read(0, size)?;
    if actual != expected {
        return Err(format!("copy mismatch on {family}").into());
    }

    let executed = transport.executed();
    for batch in &executed {
        print_batch(batch);
    }
    let stats = device.registry().stats();
    println!(
        "{family}: {} bytes verified, {} submissions, {} live allocations",
        size,
        queue.last_tag(),
        stats.live_allocations
    );

    if let Some(path) = output {
        // the copy is the last batch this queue submitted
        let batch = executed
            .iter()
            .rev()
            .find(|batch| batch.queue == queue.id())
            .ok_or("copy batch was not executed")?;
        // decoded commands re-encode to the submitted image
        let mut stream = CommandStream::new(family);
        for decoded in &batch.commands {
            stream.emit(&decoded.command)?;
        }
        write_output(path, &stream.finish())?;
    }
    Ok(())
}

fn print_batch(batch: &ExecutedBatch) {
    println!(
        "submission {} (queue {}): {} walkers",
        batch.submission.0, batch.queue.0, batch.walkers
    );
    for decoded in &batch.commands {
        println!("  {:#06x}  {}", decoded.offset, decoded.command.kind().name());
    }
    for fault in &batch.faults {
        println!("  fault: {fault}");
    }
}

fn decode(input: &str, family: HardwareFamily) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = if input == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        fs::read(PathBuf::from(input))?
    };

    let commands = decode_all(family, &bytes)?;
    for decoded in &commands {
        println!("{:#06x}  {:?}", decoded.offset, decoded.command);
    }
    log::debug!("decoded {} commands from {} bytes", commands.len(), bytes.len());
    Ok(())
}

fn sizes() {
    print!("{:<34}", "command");
    for family in HardwareFamily::ALL {
        print!("{:>9}", family.name());
    }
    println!();
    for kind in CommandKind::ALL {
        print!("{:<34}", kind.name());
        for family in HardwareFamily::ALL {
            match family.command_dwords(kind) {
                Some(dwords) => print!("{:>9}", dwords),
                None => print!("{:>9}", "-"),
            }
        }
        println!();
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid value '{}': {}", s, e))
}

fn write_output(path: &str, bytes: &[u8]) -> io::Result<()> {
    if path == "-" {
        io::stdout().write_all(bytes)
    } else {
        fs::write(path, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("16").unwrap(), 16);
        assert_eq!(parse_u32("0xff").unwrap(), 255);
        assert_eq!(parse_u32("0XA5A5A5A5").unwrap(), 0xa5a5_a5a5);
        assert!(parse_u32("0xfffffffff").is_err());
        assert!(parse_u32("twelve").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["anvil", "demo", "-f", "xehpc", "--pattern", "0x10"]).unwrap();
        match args.command {
            Cmd::Demo { family, pattern, size, output } => {
                assert_eq!(HardwareFamily::from(family), HardwareFamily::XeHpc);
                assert_eq!(pattern, 0x10);
                assert_eq!(size, 1024);
                assert!(output.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
